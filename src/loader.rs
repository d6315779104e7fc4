//! Turning an in-memory image into a mapped, unrelocated object.
use crate::{
    Result,
    dynamic::{DynTag, DynamicInfo},
    elf::{ElfHeader, ElfPhdr, ElfPhdrs, read_phdrs},
    error::{parse_dynamic_error, parse_phdr_error},
    object::{Geometry, HashTables, LoadedObject},
    os::Mmap,
    segment::{LoadCommands, ObjectKind, Placement, PremapHook, map_segments},
};
use alloc::{string::String, vec::Vec};
use core::ffi::{CStr, c_char};
use elf::abi::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD, PT_PHDR};

/// The parsed headers of an image that has not been mapped yet.
pub(crate) struct ImageHeaders {
    pub(crate) ehdr: ElfHeader,
    pub(crate) phdrs: Vec<ElfPhdr>,
}

impl ImageHeaders {
    /// Validates the ELF and program headers of `data`.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let ehdr = ElfHeader::parse(data)?;
        let phdrs = read_phdrs(data, &ehdr);
        for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
            let end = (phdr.p_offset as usize).checked_add(phdr.p_filesz as usize);
            if end.is_none_or(|end| end > data.len()) {
                return Err(parse_phdr_error("segment file range exceeds the buffer"));
            }
        }
        Ok(Self { ehdr, phdrs })
    }

    fn find(&self, p_type: u32) -> Option<&ElfPhdr> {
        self.phdrs.iter().find(|phdr| phdr.p_type == p_type)
    }
}

/// Maps `data` and builds the record of the resulting object.
///
/// Nothing is relocated and no initializer runs. On failure every mapping
/// made so far is released.
pub(crate) fn load_image<M: Mmap>(
    data: &[u8],
    headers: ImageHeaders,
    placement: &dyn Placement,
    premap: Option<&dyn PremapHook>,
) -> Result<LoadedObject> {
    let kind = if headers.ehdr.is_dylib() {
        ObjectKind::PositionIndependent
    } else {
        ObjectKind::Fixed
    };
    let commands = LoadCommands::from_phdrs(&headers.phdrs, kind, M::page_size())?;
    let dynamic_vaddr = headers
        .find(PT_DYNAMIC)
        .map(|phdr| phdr.p_vaddr as usize)
        .ok_or_else(|| parse_dynamic_error("object file has no dynamic section"))?;

    let phdr_table = (
        headers.ehdr.e_phoff(),
        headers.ehdr.e_phnum() * headers.ehdr.e_phentsize(),
    );
    let image = map_segments::<M>(&commands, data, phdr_table, placement, premap)?;
    let l_addr = image.l_addr();

    let count = headers.phdrs.len();
    let phdrs = match headers.find(PT_PHDR) {
        Some(phdr) => ElfPhdrs::Mapped {
            addr: l_addr.wrapping_add(phdr.p_vaddr as usize),
            count,
        },
        None => match image.phdr() {
            Some(addr) => ElfPhdrs::Mapped { addr, count },
            None => ElfPhdrs::Owned(headers.phdrs.clone()),
        },
    };
    let relro = headers
        .find(PT_GNU_RELRO)
        .map(|phdr| (phdr.p_vaddr as usize, phdr.p_memsz as usize));

    let ld = l_addr.wrapping_add(dynamic_vaddr);
    // the image stays mapped by `image` until the record takes it over
    let info = unsafe { DynamicInfo::parse(ld, l_addr) }?;
    let hash = unsafe { hash_tables(&info) };
    let name = info
        .value(DynTag::StrTab)
        .zip(info.soname_offset())
        .map(|(strtab, off)| unsafe { CStr::from_ptr((strtab + off) as *const c_char) })
        .and_then(|name| name.to_str().ok())
        .map(String::from)
        .unwrap_or_default();

    let geometry = Geometry {
        map_start: image.map_start(),
        map_end: image.map_end(),
        l_addr,
        text_end: image.text_end(),
        entry: l_addr.wrapping_add(headers.ehdr.e_entry()),
    };
    let contiguous = image.contiguous();
    #[cfg(feature = "log")]
    log::info!(
        "[Load] {}: 0x{:x}..0x{:x}, l_addr: 0x{:x}",
        if name.is_empty() { "<anonymous>" } else { &name },
        geometry.map_start,
        geometry.map_end,
        l_addr
    );
    // the record unmaps [map_start, map_end) from here on
    let _ = image.into_segments().into_raw();

    Ok(LoadedObject {
        name,
        geometry,
        phdrs,
        ld,
        info,
        hash,
        relro,
        map_align: commands.map_align(),
        contiguous,
        relocated: false,
        relocating: false,
        relocation_failed: false,
        init_called: false,
        mode: crate::Mode::empty(),
        nsid: 0,
        refcount: 1,
        munmap: M::munmap,
    })
}

/// Locates the symbol versioning and hash tables of a mapped object.
///
/// # Safety
/// The hash table named by the dynamic section must be mapped.
unsafe fn hash_tables(info: &DynamicInfo) -> HashTables {
    let versyms = info.value(DynTag::VerSym);
    if let Some(gnu) = info.value(DynTag::GnuHash) {
        let header = gnu as *const u32;
        let (nbuckets, symbias, nwords) =
            unsafe { (header.read(), header.add(1).read(), header.add(2).read()) };
        let bitmask = gnu + 16;
        let buckets = bitmask + nwords as usize * size_of::<usize>();
        let chain = (buckets + 4 * nbuckets as usize).wrapping_sub(4 * symbias as usize);
        HashTables {
            versyms,
            gnu_bitmask: Some(bitmask),
            chain: Some(chain),
            buckets: Some(buckets),
        }
    } else if let Some(sysv) = info.value(DynTag::Hash) {
        let nbucket = unsafe { (sysv as *const u32).read() } as usize;
        let buckets = sysv + 8;
        HashTables {
            versyms,
            gnu_bitmask: None,
            chain: Some(buckets + 4 * nbucket),
            buckets: Some(buckets),
        }
    } else {
        HashTables {
            versyms,
            ..HashTables::default()
        }
    }
}
