//! Loading a shared object straight from a byte buffer.
use crate::{
    Error, Handle, Linker, Result,
    dynamic::soname_from_image,
    error::invalid_argument,
    loader::{ImageHeaders, load_image},
    os::{MapFlags, Mmap, ProtFlags},
    segment::{ElfSegments, PremapHook, roundup},
};
use alloc::{format, string::String};
use bitflags::bitflags;
use core::slice;

bitflags! {
    /// How an object is opened. The values match the usual `RTLD_*` constants.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Mode: u32 {
        /// Resolve function symbols on first use.
        const LAZY = 0x0001;
        /// Resolve every symbol before returning.
        const NOW = 0x0002;
        /// Only look the object up; never map it.
        const NOLOAD = 0x0004;
        /// Prefer the object's own definitions over external ones.
        const DEEPBIND = 0x0008;
        /// Make the object's symbols available to later loads.
        const GLOBAL = 0x0100;
        const LOCAL = 0;
        /// Never unload the object.
        const NODELETE = 0x1000;
        const PROFILE = 0x4000_0000;
    }
}

bitflags! {
    /// Extra behavior for [`Linker::dlmem`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        /// Fail instead of reusing an object with the same soname.
        const REJECT_DUPLICATE = 0x1;
        /// Map the object but leave relocation to [`Linker::relocate`].
        const NO_RELOCATE = 0x2;
        /// Accept a buffer that does not start on a page boundary.
        const UNALIGNED_SOURCE = 0x4;
    }
}

/// Extended arguments of [`Linker::dlmem`].
#[derive(Default)]
pub struct MemArgs<'a> {
    /// Name to register the object under instead of its DT_SONAME.
    pub soname: Option<&'a str>,
    pub flags: MemFlags,
    /// Namespace the object is registered in.
    pub nsid: usize,
    /// Supplies the memory the object is mapped into.
    pub premap: Option<&'a dyn PremapHook>,
}

impl<'a> MemArgs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soname(mut self, soname: &'a str) -> Self {
        self.soname = Some(soname);
        self
    }

    pub fn flags(mut self, flags: MemFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn nsid(mut self, nsid: usize) -> Self {
        self.nsid = nsid;
        self
    }

    pub fn premap(mut self, premap: &'a dyn PremapHook) -> Self {
        self.premap = Some(premap);
        self
    }
}

/// A page-aligned private copy of an unaligned source buffer.
struct AlignedCopy {
    segments: ElfSegments,
    len: usize,
}

impl AlignedCopy {
    fn new<M: Mmap>(buffer: &[u8]) -> Result<Self> {
        let len = roundup(buffer.len().max(1), M::page_size());
        let ptr = unsafe {
            M::mmap_anonymous(
                0,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }?;
        let segments = ElfSegments::new(ptr, len, M::munmap);
        unsafe {
            core::ptr::copy_nonoverlapping(buffer.as_ptr(), ptr.as_ptr().cast::<u8>(), buffer.len())
        };
        Ok(Self {
            segments,
            len: buffer.len(),
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.segments.base() as *const u8, self.len) }
    }
}

impl<M: Mmap> Linker<M> {
    /// Loads a shared object whose file image is `buffer`.
    ///
    /// The buffer is only read during the call. Unless
    /// [`MemFlags::NO_RELOCATE`] is given the object is relocated and its
    /// initializers have run when this returns.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for unknown mode bits, a misaligned buffer
    /// without [`MemFlags::UNALIGNED_SOURCE`] or a rejected duplicate;
    /// [`Error::NotLoaded`] when [`Mode::NOLOAD`] finds nothing; any parse,
    /// mapping or relocation error otherwise.
    pub fn dlmem(&self, buffer: &[u8], mode: Mode, args: Option<&MemArgs>) -> Result<Handle> {
        let guard = self.state.lock();
        let result = self.dlmem_locked(buffer, mode, args);
        guard.record(&result);
        result
    }

    fn dlmem_locked(&self, buffer: &[u8], mode: Mode, args: Option<&MemArgs>) -> Result<Handle> {
        let default_args = MemArgs::default();
        let args = args.unwrap_or(&default_args);
        if !Mode::all().contains(mode) {
            return Err(invalid_argument("invalid mode parameter"));
        }
        let unaligned = buffer.as_ptr() as usize % M::page_size() != 0;
        if unaligned && !args.flags.contains(MemFlags::UNALIGNED_SOURCE) {
            return Err(invalid_argument("buffer not aligned"));
        }

        // released when the call returns
        let copy = if unaligned {
            #[cfg(feature = "log")]
            log::debug!("[Dlmem] copying {} unaligned bytes", buffer.len());
            Some(AlignedCopy::new::<M>(buffer)?)
        } else {
            None
        };
        let data = copy.as_ref().map_or(buffer, AlignedCopy::as_slice);

        let headers = ImageHeaders::parse(data)?;
        let soname: Option<String> = args
            .soname
            .map(String::from)
            .or_else(|| soname_from_image(data, &headers.phdrs));

        if let Some(handle) = soname
            .as_deref()
            .and_then(|name| self.find_by_name(name, args.nsid))
        {
            if args.flags.contains(MemFlags::REJECT_DUPLICATE) {
                return Err(invalid_argument(format!(
                    "object {} is already loaded",
                    soname.as_deref().unwrap_or_default()
                )));
            }
            self.reuse(handle, mode)?;
            return Ok(handle);
        }
        if mode.contains(Mode::NOLOAD) {
            return Err(Error::NotLoaded);
        }

        let mut object = load_image::<M>(data, headers, self.placement.as_ref(), args.premap)?;
        if let Some(name) = soname {
            object.name = name;
        }
        object.mode = mode;
        object.nsid = args.nsid;
        drop(copy);

        let handle = self.insert(object)?;
        if !args.flags.contains(MemFlags::NO_RELOCATE) {
            if let Err(err) = self.relocate_locked(handle) {
                #[cfg(feature = "log")]
                log::warn!("[Dlmem] relocation failed, unloading: {err}");
                self.remove(handle)?;
                return Err(err);
            }
        }
        Ok(handle)
    }
}
