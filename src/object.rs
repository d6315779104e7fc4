//! The record kept for every loaded object.
use crate::{
    Result,
    dlmem::Mode,
    dynamic::DynamicInfo,
    elf::ElfPhdrs,
};
use alloc::string::String;
use core::{ffi::c_void, fmt::Debug, ptr::NonNull};
use delegate::delegate;

/// The address range of an object and the addresses derived from its base.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub(crate) map_start: usize,
    pub(crate) map_end: usize,
    pub(crate) l_addr: usize,
    pub(crate) text_end: usize,
    pub(crate) entry: usize,
}

impl Geometry {
    /// First mapped address.
    #[inline]
    pub fn map_start(&self) -> usize {
        self.map_start
    }

    /// End of the mapped range.
    #[inline]
    pub fn map_end(&self) -> usize {
        self.map_end
    }

    /// Load bias: actual base minus the nominal address of the first segment.
    #[inline]
    pub fn l_addr(&self) -> usize {
        self.l_addr
    }

    /// End of the last executable segment.
    #[inline]
    pub fn text_end(&self) -> usize {
        self.text_end
    }

    /// Absolute entry point.
    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    pub(crate) fn shift(&mut self, delta: usize) {
        self.map_start = self.map_start.wrapping_add(delta);
        self.map_end = self.map_end.wrapping_add(delta);
        self.l_addr = self.l_addr.wrapping_add(delta);
        self.text_end = self.text_end.wrapping_add(delta);
        self.entry = self.entry.wrapping_add(delta);
    }
}

/// Hash table pointers of an object. Absent tables stay `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HashTables {
    pub(crate) versyms: Option<usize>,
    pub(crate) gnu_bitmask: Option<usize>,
    pub(crate) chain: Option<usize>,
    pub(crate) buckets: Option<usize>,
}

impl HashTables {
    #[inline]
    pub fn versyms(&self) -> Option<usize> {
        self.versyms
    }

    #[inline]
    pub fn gnu_bitmask(&self) -> Option<usize> {
        self.gnu_bitmask
    }

    /// For GNU hash tables this is the chain biased by the first hashed symbol.
    #[inline]
    pub fn chain(&self) -> Option<usize> {
        self.chain
    }

    #[inline]
    pub fn buckets(&self) -> Option<usize> {
        self.buckets
    }

    pub(crate) fn shift(&mut self, delta: usize) {
        for ptr in [
            &mut self.versyms,
            &mut self.gnu_bitmask,
            &mut self.chain,
            &mut self.buckets,
        ] {
            if let Some(addr) = ptr {
                *addr = addr.wrapping_add(delta);
            }
        }
    }
}

/// Mapping geometry of an object, for callers that move it themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapInfo {
    pub map_start: usize,
    pub map_length: usize,
    pub map_align: usize,
    pub relocated: bool,
}

/// One mapped image.
///
/// Dropping the record unmaps `[map_start, map_end)`.
pub struct LoadedObject {
    pub(crate) name: String,
    pub(crate) geometry: Geometry,
    pub(crate) phdrs: ElfPhdrs,
    pub(crate) ld: usize,
    pub(crate) info: DynamicInfo,
    pub(crate) hash: HashTables,
    /// PT_GNU_RELRO as `(p_vaddr, p_memsz)`.
    pub(crate) relro: Option<(usize, usize)>,
    pub(crate) map_align: usize,
    pub(crate) contiguous: bool,
    pub(crate) relocated: bool,
    pub(crate) relocating: bool,
    /// A relocation attempt failed part way; the image is no longer consistent.
    pub(crate) relocation_failed: bool,
    pub(crate) init_called: bool,
    pub(crate) mode: Mode,
    pub(crate) nsid: usize,
    pub(crate) refcount: usize,
    pub(crate) munmap: unsafe fn(NonNull<c_void>, usize) -> Result<()>,
}

impl Debug for LoadedObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoadedObject")
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("relocated", &self.relocated)
            .field("refcount", &self.refcount)
            .finish()
    }
}

impl Drop for LoadedObject {
    fn drop(&mut self) {
        let len = self.map_end().wrapping_sub(self.map_start());
        if let Some(start) = NonNull::new(self.map_start() as *mut c_void) {
            if len != 0 {
                #[cfg(feature = "log")]
                log::debug!(
                    "[Unload] {}: 0x{:x}..0x{:x}",
                    self.name,
                    self.map_start(),
                    self.map_end()
                );
                let _ = unsafe { (self.munmap)(start, len) };
            }
        }
    }
}

impl LoadedObject {
    delegate! {
        to self.geometry {
            /// First mapped address.
            pub fn map_start(&self) -> usize;
            /// End of the mapped range.
            pub fn map_end(&self) -> usize;
            /// Load bias.
            pub fn l_addr(&self) -> usize;
            /// End of the last executable segment.
            pub fn text_end(&self) -> usize;
            /// Absolute entry point.
            pub fn entry(&self) -> usize;
        }
    }

    /// The soname, or an empty string for anonymous objects.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Where the program headers live.
    #[inline]
    pub fn phdrs(&self) -> &ElfPhdrs {
        &self.phdrs
    }

    /// Address of the dynamic section.
    #[inline]
    pub fn ld(&self) -> usize {
        self.ld
    }

    #[inline]
    pub fn dynamic_info(&self) -> &DynamicInfo {
        &self.info
    }

    #[inline]
    pub fn hash_tables(&self) -> HashTables {
        self.hash
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    #[inline]
    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    /// Whether an earlier relocation failed and left the object unusable.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.relocation_failed
    }

    /// PT_GNU_RELRO as `(p_vaddr, p_memsz)`.
    #[inline]
    pub fn relro(&self) -> Option<(usize, usize)> {
        self.relro
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn nsid(&self) -> usize {
        self.nsid
    }

    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn map_info(&self) -> MapInfo {
        MapInfo {
            map_start: self.map_start(),
            map_length: self.map_end() - self.map_start(),
            map_align: self.map_align,
            relocated: self.relocated,
        }
    }
}
