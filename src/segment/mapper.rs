use super::{ElfSegments, LoadCommand, LoadCommands, ObjectKind, reserve, roundup};
use crate::{
    Result,
    error::mmap_error,
    os::{MapFlags, Mmap, ProtFlags},
};
use alloc::vec::Vec;
use core::{ffi::c_void, ptr::NonNull};

/// Decides where position-independent objects should preferably go.
///
/// Methods take `&self`; an implementation keeps its own interior state, which
/// lets the loader consult it without holding any other borrow.
pub trait Placement {
    /// Preferred base for an object spanning `map_len` bytes whose first
    /// segment nominally starts at `map_start`. `0` means no preference.
    fn preferred_address(&self, map_len: usize, map_start: usize) -> usize;

    /// Records that `[start, end)` now belongs to a loaded object.
    fn commit(&self, start: usize, end: usize);

    /// Forgets a range previously passed to [`Placement::commit`].
    fn release(&self, _start: usize, _end: usize) {}
}

/// Prefers an object's nominal start unless that collides with a committed range.
#[derive(Default)]
pub struct DefaultPlacement {
    committed: spin::Mutex<Vec<(usize, usize)>>,
}

impl DefaultPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[start, end)` intersects any committed range.
    pub fn is_committed(&self, start: usize, end: usize) -> bool {
        self.committed
            .lock()
            .iter()
            .any(|&(s, e)| start < e && s < end)
    }
}

impl Placement for DefaultPlacement {
    fn preferred_address(&self, map_len: usize, map_start: usize) -> usize {
        if map_start == 0 || self.is_committed(map_start, map_start.saturating_add(map_len)) {
            0
        } else {
            map_start
        }
    }

    fn commit(&self, start: usize, end: usize) {
        self.committed.lock().push((start, end));
    }

    fn release(&self, start: usize, end: usize) {
        self.committed
            .lock()
            .retain(|&(s, e)| !(s == start && e == end));
    }
}

/// Supplies the memory an object is loaded into instead of a fresh reservation.
///
/// Any state the hook needs (a file descriptor, an arena) is captured by the
/// implementor and passed through untouched by the loader.
pub trait PremapHook {
    /// Returns `len` bytes of readable and writable memory aligned to `align`,
    /// ideally at `preferred`, or `None` on failure. The loader takes ownership
    /// of the returned range and unmaps it when the object goes away.
    fn provide_backing(&self, preferred: usize, len: usize, align: usize)
    -> Option<NonNull<c_void>>;
}

impl<F> PremapHook for F
where
    F: Fn(usize, usize, usize) -> Option<NonNull<c_void>>,
{
    fn provide_backing(
        &self,
        preferred: usize,
        len: usize,
        align: usize,
    ) -> Option<NonNull<c_void>> {
        (self)(preferred, len, align)
    }
}

/// The outcome of mapping an object's segments.
#[derive(Debug)]
pub struct MappedImage {
    pub(crate) segments: ElfSegments,
    l_addr: usize,
    contiguous: bool,
    phdr: Option<usize>,
    text_end: usize,
}

impl MappedImage {
    /// First mapped address.
    #[inline]
    pub fn map_start(&self) -> usize {
        self.segments.base()
    }

    /// End of the mapped range.
    #[inline]
    pub fn map_end(&self) -> usize {
        self.segments.base() + self.segments.len()
    }

    /// Load bias.
    #[inline]
    pub fn l_addr(&self) -> usize {
        self.l_addr
    }

    /// False when a fixed-position object has holes between its segments.
    #[inline]
    pub fn contiguous(&self) -> bool {
        self.contiguous
    }

    /// Address of the program header table when a command mapped it.
    #[inline]
    pub fn phdr(&self) -> Option<usize> {
        self.phdr
    }

    /// End of the last executable segment's file-backed part.
    #[inline]
    pub fn text_end(&self) -> usize {
        self.text_end
    }

    /// Hands the mapping over to the caller.
    pub fn into_segments(self) -> ElfSegments {
        self.segments
    }
}

#[inline]
fn as_nonnull(addr: usize) -> NonNull<c_void> {
    // SAFETY: callers only pass addresses inside a live mapping, which never starts at 0.
    unsafe { NonNull::new_unchecked(addr as *mut c_void) }
}

/// Places every load command of an object into memory.
///
/// `source` is the whole image; command `i` reads `source[map_off..]`.
/// `phdr_table` is the `(offset, size)` of the program header table in the
/// image, used to locate it in the mapped result. On any failure the whole
/// reservation is released before the error is returned.
pub fn map_segments<M: Mmap>(
    commands: &LoadCommands,
    source: &[u8],
    phdr_table: (usize, usize),
    placement: &dyn Placement,
    premap: Option<&dyn PremapHook>,
) -> Result<MappedImage> {
    let page_size = M::page_size();
    let first = commands.first();
    let total_len = commands.total_len();
    let kind = commands.kind();

    let (segments, provided) = match kind {
        ObjectKind::PositionIndependent => {
            let preferred = placement.preferred_address(total_len, first.map_start);
            if let Some(hook) = premap {
                let align = commands.map_align().max(page_size);
                let ptr = hook
                    .provide_backing(preferred, total_len, commands.map_align())
                    .ok_or_else(|| mmap_error("premap hook could not provide backing"))?;
                let segments = ElfSegments::new(ptr, roundup(total_len, page_size), M::munmap);
                if segments.base() % align != 0 {
                    return Err(mmap_error("premap hook returned misaligned backing"));
                }
                (segments, true)
            } else {
                let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
                (
                    reserve::<M>(preferred, total_len, commands.map_align(), prot)?,
                    false,
                )
            }
        }
        ObjectKind::Fixed => {
            let ptr = unsafe {
                M::mmap_anonymous(
                    first.map_start,
                    total_len,
                    ProtFlags::PROT_NONE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                )
            }?;
            (
                ElfSegments::new(ptr, roundup(total_len, page_size), M::munmap),
                false,
            )
        }
    };

    let l_addr = segments.base().wrapping_sub(first.map_start);
    let mut image = MappedImage {
        segments,
        l_addr,
        contiguous: true,
        phdr: None,
        text_end: 0,
    };
    #[cfg(feature = "log")]
    log::debug!(
        "[Map] base: 0x{:x}, length: 0x{:x}, l_addr: 0x{:x}, provided: {}",
        image.map_start(),
        total_len,
        l_addr,
        provided
    );

    for command in commands.as_slice() {
        place_command::<M>(command, l_addr, source, provided)?;
        postprocess(&mut image, command, phdr_table);

        let (hole_start, hole_size) = if command.alloc_end > command.data_end {
            fill_zero::<M>(command, l_addr, page_size, provided)?;
            let hole_start = roundup(command.alloc_end, page_size);
            let hole_off = hole_start - command.map_end;
            (hole_start, command.map_hole.saturating_sub(hole_off))
        } else {
            (command.map_end, command.map_hole)
        };

        if command.map_hole != 0 {
            match kind {
                ObjectKind::PositionIndependent if hole_size != 0 => unsafe {
                    M::mprotect(
                        as_nonnull(l_addr.wrapping_add(hole_start)),
                        hole_size,
                        ProtFlags::PROT_NONE,
                    )?;
                    #[cfg(feature = "log")]
                    log::trace!(
                        "[Hole] address: 0x{:x}, length: {}",
                        l_addr.wrapping_add(hole_start),
                        hole_size
                    );
                },
                ObjectKind::PositionIndependent => {}
                ObjectKind::Fixed => image.contiguous = false,
            }
        }
    }

    placement.commit(image.map_start(), image.map_end());
    Ok(image)
}

/// Copies one command's file-backed pages into place with its protection.
fn place_command<M: Mmap>(
    command: &LoadCommand,
    l_addr: usize,
    source: &[u8],
    provided: bool,
) -> Result<()> {
    let len = command.map_end - command.map_start;
    if len == 0 {
        return Ok(());
    }
    let addr = l_addr.wrapping_add(command.map_start);
    let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    unsafe {
        if provided {
            // keep the caller's backing object, only open it up for the copy
            M::mprotect(as_nonnull(addr), len, rw)?;
        } else {
            M::mmap_anonymous(addr, len, rw, MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED)?;
        }
        if let Some(bytes) = source.get(command.map_off..) {
            let available = bytes.len().min(len);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, available);
        }
        M::mprotect(as_nonnull(addr), len, command.prot)?;
    }
    #[cfg(feature = "log")]
    log::trace!(
        "[Mmap] address: 0x{:x}, length: {}, prot: {:?}, offset: 0x{:x}",
        addr,
        len,
        command.prot,
        command.map_off
    );
    Ok(())
}

/// Locates the program header table and tracks the end of text.
fn postprocess(image: &mut MappedImage, command: &LoadCommand, phdr_table: (usize, usize)) {
    let (phoff, phsize) = phdr_table;
    if command.prot.contains(ProtFlags::PROT_EXEC) {
        image.text_end = image.l_addr.wrapping_add(command.map_end);
    }
    if image.phdr.is_none()
        && command.map_off <= phoff
        && command.map_end - command.map_start + command.map_off >= phoff + phsize
    {
        image.phdr = Some(
            image
                .l_addr
                .wrapping_add(command.map_start + phoff - command.map_off),
        );
    }
}

/// Clears the bss tail of a command.
fn fill_zero<M: Mmap>(
    command: &LoadCommand,
    l_addr: usize,
    page_size: usize,
    provided: bool,
) -> Result<()> {
    let zero = l_addr.wrapping_add(command.data_end);
    let zero_end = l_addr.wrapping_add(command.alloc_end);
    let zero_page = roundup(zero, page_size).min(zero_end);

    if zero_page > zero {
        let page = as_nonnull(zero & !(page_size - 1));
        let writable = command.prot.contains(ProtFlags::PROT_WRITE);
        unsafe {
            if !writable {
                M::mprotect(page, page_size, command.prot | ProtFlags::PROT_WRITE)?;
            }
            (zero as *mut u8).write_bytes(0, zero_page - zero);
            if !writable {
                M::mprotect(page, page_size, command.prot)?;
            }
        }
    }

    if zero_end > zero_page {
        let len = zero_end - zero_page;
        unsafe {
            if provided {
                // backing memory may hold stale bytes
                M::mprotect(
                    as_nonnull(zero_page),
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )?;
                (zero_page as *mut u8).write_bytes(0, len);
            }
            M::mprotect(as_nonnull(zero_page), len, command.prot)?;
        }
    }
    #[cfg(feature = "log")]
    log::trace!(
        "[Zero] address: 0x{:x}, length: {}",
        zero,
        zero_end - zero
    );
    Ok(())
}
