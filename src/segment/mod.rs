//! The memory mapping of an ELF object.
//!
//! An object's address range is reserved as one unit and owned by an
//! [`ElfSegments`] value. Splitting hands out sub-ranges that unmap themselves
//! when dropped, so every early return releases what was reserved so far.

mod mapper;

pub use mapper::{DefaultPlacement, MappedImage, Placement, PremapHook, map_segments};

use crate::{
    Result,
    elf::{ElfPhdr, segment_prot},
    error::{mmap_error, parse_phdr_error},
    os::{MapFlags, Mmap, ProtFlags},
};
use alloc::vec::Vec;
use core::{ffi::c_void, fmt::Debug, mem::ManuallyDrop, ptr::NonNull};
use elf::abi::PT_LOAD;

/// An owned range of mapped address space.
pub struct ElfSegments {
    memory: NonNull<c_void>,
    len: usize,
    munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
}

impl Debug for ElfSegments {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ElfSegments")
            .field("memory", &self.memory)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for ElfSegments {
    fn drop(&mut self) {
        if self.len != 0 {
            #[cfg(feature = "log")]
            log::trace!(
                "[Munmap] address: 0x{:x}, length: {}",
                self.base(),
                self.len
            );
            let _ = unsafe { (self.munmap)(self.memory, self.len) };
        }
    }
}

impl ElfSegments {
    /// Takes ownership of `len` bytes mapped at `memory`.
    pub fn new(
        memory: NonNull<c_void>,
        len: usize,
        munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
    ) -> Self {
        ElfSegments {
            memory,
            len,
            munmap,
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits the range at `offset` bytes from its start.
    ///
    /// `offset` must be page-aligned and not larger than the range.
    pub fn split_at(self, offset: usize) -> (ElfSegments, ElfSegments) {
        debug_assert!(offset <= self.len);
        let this = ManuallyDrop::new(self);
        let tail = unsafe { NonNull::new_unchecked(this.memory.as_ptr().cast::<u8>().add(offset)) };
        (
            ElfSegments::new(this.memory, offset, this.munmap),
            ElfSegments::new(tail.cast(), this.len - offset, this.munmap),
        )
    }

    /// Unmaps the range now, reporting a failure instead of ignoring it.
    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        if this.len == 0 {
            return Ok(());
        }
        unsafe { (this.munmap)(this.memory, this.len) }
    }

    /// Gives up ownership; the caller becomes responsible for unmapping.
    pub fn into_raw(self) -> (NonNull<c_void>, usize) {
        let this = ManuallyDrop::new(self);
        (this.memory, this.len)
    }
}

#[inline]
pub(crate) fn roundup(x: usize, align: usize) -> usize {
    if align == 0 {
        return x;
    }
    (x + align - 1) & !(align - 1)
}

#[inline]
pub(crate) fn rounddown(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// Reserves `len` bytes of address space whose start is a multiple of `align`.
///
/// With `align` no larger than a page this is a single mapping at the hint
/// `preferred`. Otherwise a larger no-access range is reserved, the aligned
/// part is granted `prot` and the slack on both sides is returned to the
/// system. Every failure is a mapping failure and leaves nothing mapped.
pub fn reserve<M: Mmap>(
    preferred: usize,
    len: usize,
    align: usize,
    prot: ProtFlags,
) -> Result<ElfSegments> {
    let page_size = M::page_size();
    if align <= page_size {
        let ptr = unsafe { M::mmap_anonymous(preferred, len, prot, MapFlags::MAP_PRIVATE) }?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Reserve] address: 0x{:x}, length: {}, prot: {:?}",
            ptr.as_ptr() as usize,
            len,
            prot
        );
        return Ok(ElfSegments::new(ptr, roundup(len, page_size), M::munmap));
    }

    let reserve_len = if len >= align { len + align } else { 2 * align };
    let ptr = unsafe { M::mmap_reserve(preferred, reserve_len) }?;
    let whole = ElfSegments::new(ptr, reserve_len, M::munmap);
    let start = roundup(whole.base(), align);
    let aligned = unsafe { NonNull::new_unchecked(start as *mut c_void) };
    unsafe { M::mprotect(aligned, len, prot) }
        .map_err(|_| mmap_error("cannot grant access to the aligned reservation"))?;

    let (head, rest) = whole.split_at(start - ptr.as_ptr() as usize);
    let (kept, tail) = rest.split_at(roundup(len, page_size));
    head.release()?;
    tail.release()?;
    #[cfg(feature = "log")]
    log::trace!(
        "[Reserve] address: 0x{:x}, length: {}, align: 0x{:x}, prot: {:?}",
        kept.base(),
        len,
        align,
        prot
    );
    Ok(kept)
}

/// How an object may be placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// The loader chooses the base (ET_DYN).
    PositionIndependent,
    /// Segments must land at their nominal addresses.
    Fixed,
}

/// One contiguous mapping instruction derived from a PT_LOAD header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadCommand {
    /// Page-aligned start of the mapping.
    pub map_start: usize,
    /// Page-aligned end of the file-backed part.
    pub map_end: usize,
    /// End of the file-backed bytes.
    pub data_end: usize,
    /// End of the allocation, bss included.
    pub alloc_end: usize,
    /// Page-aligned file offset of `map_start`.
    pub map_off: usize,
    pub map_align: usize,
    pub prot: ProtFlags,
    /// Bytes between this command's `map_end` and the next command's `map_start`.
    pub map_hole: usize,
}

impl LoadCommand {
    /// Builds a command from the fields of a loadable segment header.
    pub fn new(
        vaddr: usize,
        offset: usize,
        filesz: usize,
        memsz: usize,
        align: usize,
        prot: ProtFlags,
        page_size: usize,
    ) -> Result<Self> {
        if align & (page_size - 1) != 0 {
            return Err(parse_phdr_error(
                "ELF load command alignment not page-aligned",
            ));
        }
        if vaddr.wrapping_sub(offset) & align.wrapping_sub(1) != 0 {
            return Err(parse_phdr_error(
                "ELF load command address/offset not properly aligned",
            ));
        }
        if memsz < filesz {
            return Err(parse_phdr_error("ELF load command has memsz below filesz"));
        }
        let data_end = vaddr
            .checked_add(filesz)
            .ok_or_else(|| parse_phdr_error("ELF load command address overflows"))?;
        Ok(LoadCommand {
            map_start: rounddown(vaddr, page_size),
            map_end: roundup(data_end, page_size),
            data_end,
            alloc_end: vaddr + memsz,
            map_off: rounddown(offset, page_size),
            map_align: align,
            prot,
            map_hole: 0,
        })
    }
}

/// The complete list of load commands for one object.
#[derive(Clone, Debug)]
pub struct LoadCommands {
    commands: Vec<LoadCommand>,
    kind: ObjectKind,
    map_align: usize,
    total_len: usize,
}

impl LoadCommands {
    /// Links consecutive commands through their holes and computes the total span.
    pub fn new(mut commands: Vec<LoadCommand>, kind: ObjectKind) -> Result<Self> {
        if commands.is_empty() {
            return Err(parse_phdr_error("object file has no loadable segments"));
        }
        for idx in 1..commands.len() {
            let next_start = commands[idx].map_start;
            let prev = &mut commands[idx - 1];
            if next_start < prev.map_end {
                return Err(parse_phdr_error("ELF load commands overlap or are unordered"));
            }
            prev.map_hole = next_start - prev.map_end;
        }
        let map_align = commands.iter().map(|c| c.map_align).max().unwrap_or(0);
        let total_len = commands[commands.len() - 1].alloc_end - commands[0].map_start;
        Ok(LoadCommands {
            commands,
            kind,
            map_align,
            total_len,
        })
    }

    /// Derives the commands from an image's PT_LOAD headers.
    pub(crate) fn from_phdrs(phdrs: &[ElfPhdr], kind: ObjectKind, page_size: usize) -> Result<Self> {
        let commands = phdrs
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| {
                LoadCommand::new(
                    phdr.p_vaddr as usize,
                    phdr.p_offset as usize,
                    phdr.p_filesz as usize,
                    phdr.p_memsz as usize,
                    phdr.p_align as usize,
                    segment_prot(phdr.p_flags),
                    page_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(commands, kind)
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The largest alignment any command requires.
    #[inline]
    pub fn map_align(&self) -> usize {
        self.map_align
    }

    /// Bytes from the first command's start to the last command's allocation end.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    #[inline]
    pub fn first(&self) -> &LoadCommand {
        &self.commands[0]
    }

    #[inline]
    pub fn as_slice(&self) -> &[LoadCommand] {
        &self.commands
    }
}
