mod common;

use common::*;
use core::{cell::Cell, ffi::c_void, ptr::NonNull};
use elf_dlmem::{Error, Linker, MemArgs, MemFlags, Mode};
use rstest::{fixture, rstest};

#[fixture]
fn image() -> Vec<u8> {
    init_log();
    ImageBuilder::new().build()
}

#[rstest]
fn unknown_mode_bits_are_rejected(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    let linker = Linker::new();
    let mode = Mode::from_bits_retain(0x8000_0000);
    let err = linker.dlmem(buffer.as_slice(), mode, None).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(linker.last_error().unwrap().contains("invalid mode parameter"));
    assert!(linker.is_empty());
    // the diagnostic is taken
    assert!(linker.last_error().is_none());
}

#[rstest]
fn unaligned_buffer_needs_permission(image: Vec<u8>) {
    let buffer = MappedBuffer::with_offset(&image, 8);
    let linker = Linker::new().with_mmap::<TrackingMmap>();

    let err = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(linker.last_error().unwrap().contains("buffer not aligned"));
    assert!(linker.is_empty());
    assert_eq!(TrackingMmap::live_pages(), 0);

    let args = MemArgs::new().flags(MemFlags::UNALIGNED_SOURCE);
    let handle = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap();
    let (relocated, l_addr, len) = linker
        .with_object(handle, |object| {
            (object.is_relocated(), object.l_addr(), object.map_end() - object.map_start())
        })
        .unwrap();
    assert!(relocated);
    assert_eq!(read_usize(l_addr + SLOT_RELATIVE), l_addr + RELATIVE_ADDEND);
    // the aligned copy of the buffer is gone, only the object stays mapped
    assert_eq!(TrackingMmap::live_pages(), len / page_size());
    linker.close(handle).unwrap();
    assert_eq!(TrackingMmap::live_pages(), 0);
}

#[rstest]
fn truncated_buffer_is_rejected(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image[..DATA]);
    let linker = Linker::new();
    let err = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap_err();
    assert!(matches!(err, Error::ParsePhdr { .. }), "{err}");
    assert!(linker.last_error().is_some());
}

#[rstest]
fn not_an_elf_image() {
    let buffer = MappedBuffer::new(&[0u8; 256]);
    let linker = Linker::new();
    let err = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap_err();
    assert!(matches!(err, Error::ParseEhdr { .. }));
}

#[rstest]
fn soname_comes_from_dynamic_section_or_override(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    let linker = Linker::new();
    let handle = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap();
    assert_eq!(
        linker.with_object(handle, |object| object.name().to_owned()).unwrap(),
        SONAME
    );

    let args = MemArgs::new().soname("renamed.so");
    let renamed = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap();
    assert_ne!(handle, renamed);
    assert_eq!(
        linker.with_object(renamed, |object| object.name().to_owned()).unwrap(),
        "renamed.so"
    );
    assert_eq!(linker.len(), 2);
    linker.close(handle).unwrap();
    linker.close(renamed).unwrap();
    assert!(linker.is_empty());
}

#[rstest]
fn duplicate_soname_is_shared(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    let linker = Linker::new();
    let first = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap();
    let second = linker
        .dlmem(buffer.as_slice(), Mode::NOW | Mode::NODELETE, None)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(linker.len(), 1);
    let (refcount, mode) = linker
        .with_object(first, |object| (object.refcount(), object.mode()))
        .unwrap();
    assert_eq!(refcount, 2);
    assert!(mode.contains(Mode::NODELETE));

    let args = MemArgs::new().flags(MemFlags::REJECT_DUPLICATE);
    let err = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));

    // pinned: closing every reference keeps it loaded
    linker.close(first).unwrap();
    linker.close(first).unwrap();
    assert_eq!(linker.len(), 1);
}

#[rstest]
fn duplicates_are_per_namespace(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    let linker = Linker::new();
    let first = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap();
    let args = MemArgs::new().nsid(1);
    let other = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap();
    assert_ne!(first, other);
    assert_eq!(linker.with_object(other, |object| object.nsid()).unwrap(), 1);
    linker.close(first).unwrap();
    linker.close(other).unwrap();
}

#[rstest]
fn noload_only_finds_registered_objects(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    let linker = Linker::new();
    let err = linker
        .dlmem(buffer.as_slice(), Mode::NOW | Mode::NOLOAD, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotLoaded));
    assert!(linker.last_error().is_none());
    assert!(linker.is_empty());

    let handle = linker.dlmem(buffer.as_slice(), Mode::NOW, None).unwrap();
    let found = linker
        .dlmem(buffer.as_slice(), Mode::NOW | Mode::NOLOAD, None)
        .unwrap();
    assert_eq!(found, handle);
    linker.close(found).unwrap();
    linker.close(handle).unwrap();
    assert!(linker.is_empty());
}

#[cfg(target_os = "linux")]
#[rstest]
fn premap_hook_provides_the_backing() {
    init_log();
    let page = page_size();
    let image_bytes = ImageBuilder::new().align(page).build();
    let buffer = MappedBuffer::new(&image_bytes);
    let fd = unsafe { libc::memfd_create(c"dlmem-premap".as_ptr(), 0) };
    assert!(fd >= 0);
    let calls = Cell::new(0);
    let hook = |_preferred: usize, len: usize, align: usize| -> Option<NonNull<c_void>> {
        calls.set(calls.get() + 1);
        if align > page || unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            return None;
        }
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        (ptr != libc::MAP_FAILED).then(|| NonNull::new(ptr)).flatten()
    };

    let linker = Linker::new();
    let args = MemArgs::new().premap(&hook);
    let handle = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap();
    assert_eq!(calls.get(), 1);

    // the image went through the shared object
    let mut magic = [0u8; 4];
    let read = unsafe { libc::pread(fd, magic.as_mut_ptr().cast(), 4, 0) };
    assert_eq!(read, 4);
    assert_eq!(&magic, b"\x7fELF");
    let l_addr = linker.with_object(handle, |object| object.l_addr()).unwrap();
    assert_eq!(read_usize(l_addr + SLOT_RELATIVE), l_addr + RELATIVE_ADDEND);
    for off in (DATA + DATA_FILESZ..DATA + DATA_MEMSZ).step_by(8) {
        assert_eq!(read_usize(l_addr + off), 0);
    }

    linker.close(handle).unwrap();
    unsafe { libc::close(fd) };
}

#[rstest]
fn premap_hook_failure_fails_the_load(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    let hook = |_: usize, _: usize, _: usize| -> Option<NonNull<c_void>> { None };
    let linker = Linker::new();
    let args = MemArgs::new().premap(&hook);
    let err = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap_err();
    assert!(matches!(err, Error::Mmap { .. }));
    assert!(linker.last_error().is_some());
    assert!(linker.is_empty());
}

#[rstest]
fn premap_hook_misaligned_backing_is_released(image: Vec<u8>) {
    let buffer = MappedBuffer::new(&image);
    // the image asks for 64 KiB alignment; hand out memory one page past it
    let hook = |_: usize, len: usize, align: usize| -> Option<NonNull<c_void>> {
        let page = page_size();
        let ptr = anonymous_backing(len + align + page)?;
        let addr = (ptr.as_ptr() as usize).next_multiple_of(align) + page;
        NonNull::new(addr as *mut c_void)
    };
    let linker = Linker::new();
    let args = MemArgs::new().premap(&hook);
    let err = linker.dlmem(buffer.as_slice(), Mode::NOW, Some(&args)).unwrap_err();
    assert!(matches!(err, Error::Mmap { .. }));
}
