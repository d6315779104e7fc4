//! Parsing `.dynamic` section
use crate::{
    Result,
    elf::{DT_RELR, DT_RELRSZ, Dyn, ElfPhdr},
    error::parse_dynamic_error,
};
use alloc::string::String;
use core::ffi::CStr;
use elf::abi::*;

/// Dynamic tags whose value is an address inside the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DynTag {
    /// DT_HASH
    Hash,
    /// DT_PLTGOT
    PltGot,
    /// DT_STRTAB
    StrTab,
    /// DT_SYMTAB
    SymTab,
    /// DT_RELR
    Relr,
    /// DT_JMPREL
    JmpRel,
    /// DT_VERSYM
    VerSym,
    /// DT_GNU_HASH
    GnuHash,
    /// DT_RELA
    Rela,
    /// DT_REL
    Rel,
}

impl DynTag {
    pub const COUNT: usize = 10;

    pub const ALL: [DynTag; DynTag::COUNT] = [
        DynTag::Hash,
        DynTag::PltGot,
        DynTag::StrTab,
        DynTag::SymTab,
        DynTag::Relr,
        DynTag::JmpRel,
        DynTag::VerSym,
        DynTag::GnuHash,
        DynTag::Rela,
        DynTag::Rel,
    ];

    fn from_d_tag(d_tag: i64) -> Option<Self> {
        Some(match d_tag {
            DT_HASH => DynTag::Hash,
            DT_PLTGOT => DynTag::PltGot,
            DT_STRTAB => DynTag::StrTab,
            DT_SYMTAB => DynTag::SymTab,
            DT_RELR => DynTag::Relr,
            DT_JMPREL => DynTag::JmpRel,
            DT_VERSYM => DynTag::VerSym,
            DT_GNU_HASH => DynTag::GnuHash,
            DT_RELA => DynTag::Rela,
            DT_REL => DynTag::Rel,
            _ => return None,
        })
    }

    /// Relocation tables may legitimately hold `0`, meaning "no table".
    #[inline]
    pub fn zero_means_absent(self) -> bool {
        matches!(self, DynTag::Rela | DynTag::Rel)
    }
}

/// One address-bearing dynamic entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynEntry {
    /// Address of the entry inside the mapped dynamic section.
    pub slot: usize,
    /// The entry's value with the load bias applied.
    pub value: usize,
}

/// The dynamic section of a mapped object.
///
/// Address-bearing tags are kept per [`DynTag`]; everything else is stored as
/// the raw (unbiased) value.
#[derive(Clone, Debug, Default)]
pub struct DynamicInfo {
    entries: [Option<DynEntry>; DynTag::COUNT],
    pub(crate) relasz: usize,
    pub(crate) relsz: usize,
    pub(crate) relrsz: usize,
    pub(crate) pltrelsz: usize,
    pub(crate) pltrel: Option<i64>,
    pub(crate) init: Option<usize>,
    pub(crate) fini: Option<usize>,
    pub(crate) init_array: Option<(usize, usize)>,
    pub(crate) fini_array: Option<(usize, usize)>,
    pub(crate) soname: Option<usize>,
    pub(crate) flags: usize,
    pub(crate) flags_1: usize,
    pub(crate) textrel: bool,
}

impl DynamicInfo {
    /// Reads the dynamic section at `ld` and applies the load bias `l_addr`.
    ///
    /// # Safety
    /// `ld` must point to a readable, `DT_NULL` terminated dynamic section.
    pub(crate) unsafe fn parse(ld: usize, l_addr: usize) -> Result<Self> {
        if ld == 0 || ld % align_of::<Dyn>() != 0 {
            return Err(parse_dynamic_error("dynamic section is misaligned"));
        }
        let mut info = DynamicInfo::default();
        let mut init_array_off = None;
        let mut init_array_size = 0;
        let mut fini_array_off = None;
        let mut fini_array_size = 0;

        let mut cur_dyn_ptr = ld as *const Dyn;
        loop {
            let dynamic = unsafe { &*cur_dyn_ptr };
            let value = dynamic.d_un as usize;
            if let Some(tag) = DynTag::from_d_tag(dynamic.d_tag) {
                info.entries[tag as usize] = Some(DynEntry {
                    slot: cur_dyn_ptr as usize,
                    value,
                });
            } else {
                match dynamic.d_tag {
                    DT_RELASZ => info.relasz = value,
                    DT_RELSZ => info.relsz = value,
                    DT_RELRSZ => info.relrsz = value,
                    DT_PLTRELSZ => info.pltrelsz = value,
                    DT_PLTREL => info.pltrel = Some(value as i64),
                    DT_INIT => info.init = Some(value),
                    DT_FINI => info.fini = Some(value),
                    DT_INIT_ARRAY => init_array_off = Some(value),
                    DT_INIT_ARRAYSZ => init_array_size = value,
                    DT_FINI_ARRAY => fini_array_off = Some(value),
                    DT_FINI_ARRAYSZ => fini_array_size = value,
                    DT_SONAME => info.soname = Some(value),
                    DT_FLAGS => info.flags = value,
                    DT_FLAGS_1 => info.flags_1 = value,
                    DT_TEXTREL => info.textrel = true,
                    DT_NULL => break,
                    _ => {}
                }
            }
            cur_dyn_ptr = unsafe { cur_dyn_ptr.add(1) };
        }
        info.init_array = init_array_off.map(|off| (off, init_array_size));
        info.fini_array = fini_array_off.map(|off| (off, fini_array_size));
        if info.flags & DF_TEXTREL as usize != 0 {
            info.textrel = true;
        }
        if info.get(DynTag::StrTab).is_none() && info.soname.is_some() {
            return Err(parse_dynamic_error("DT_SONAME without DT_STRTAB"));
        }
        info.adjust_values(l_addr);
        Ok(info)
    }

    /// The entry recorded for `tag`, if the object has one.
    #[inline]
    pub fn get(&self, tag: DynTag) -> Option<&DynEntry> {
        self.entries[tag as usize].as_ref()
    }

    /// The biased value recorded for `tag`.
    #[inline]
    pub fn value(&self, tag: DynTag) -> Option<usize> {
        self.get(tag).map(|entry| entry.value)
    }

    /// Every present entry.
    pub fn iter(&self) -> impl Iterator<Item = (DynTag, &DynEntry)> {
        DynTag::ALL
            .iter()
            .zip(self.entries.iter())
            .filter_map(|(tag, entry)| entry.as_ref().map(|entry| (*tag, entry)))
    }

    /// Adds `delta` to the value of every present entry.
    ///
    /// Relocation tables whose value is `0` are left alone.
    pub(crate) fn adjust_values(&mut self, delta: usize) {
        for (tag, entry) in DynTag::ALL.iter().zip(self.entries.iter_mut()) {
            if let Some(entry) = entry {
                if tag.zero_means_absent() {
                    adjust_nonzero(&mut entry.value, delta);
                } else {
                    entry.value = entry.value.wrapping_add(delta);
                }
            }
        }
    }

    /// Adds `delta` to the slot address of every present entry.
    pub(crate) fn shift_slots(&mut self, delta: usize) {
        self.entries
            .iter_mut()
            .flatten()
            .for_each(|entry| entry.slot = entry.slot.wrapping_add(delta));
    }

    /// Offset of the soname in the string table.
    #[inline]
    pub fn soname_offset(&self) -> Option<usize> {
        self.soname
    }

    /// Whether the object needs its text segment patched.
    #[inline]
    pub fn has_textrel(&self) -> bool {
        self.textrel
    }
}

#[inline]
fn adjust_nonzero(value: &mut usize, delta: usize) {
    if *value != 0 {
        *value = value.wrapping_add(delta);
    }
}

/// Reads `DT_SONAME` straight from an unmapped image.
///
/// Returns `None` when the image has no soname or the entries point outside
/// the buffer.
pub(crate) fn soname_from_image(data: &[u8], phdrs: &[ElfPhdr]) -> Option<String> {
    let dynamic = phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC)?;
    let start = dynamic.p_offset as usize;
    let end = start.checked_add(dynamic.p_filesz as usize)?;
    let bytes = data.get(start..end)?;

    let mut strtab = None;
    let mut soname = None;
    for chunk in bytes.chunks_exact(size_of::<Dyn>()) {
        let entry = unsafe { chunk.as_ptr().cast::<Dyn>().read_unaligned() };
        match entry.d_tag {
            DT_STRTAB => strtab = Some(entry.d_un as usize),
            DT_SONAME => soname = Some(entry.d_un as usize),
            DT_NULL => break,
            _ => {}
        }
    }

    let file_off = vaddr_to_offset(phdrs, strtab?)?.checked_add(soname?)?;
    let name = CStr::from_bytes_until_nul(data.get(file_off..)?).ok()?;
    Some(String::from(name.to_str().ok()?))
}

fn vaddr_to_offset(phdrs: &[ElfPhdr], vaddr: usize) -> Option<usize> {
    phdrs
        .iter()
        .filter(|phdr| phdr.p_type == PT_LOAD)
        .find(|phdr| {
            let start = phdr.p_vaddr as usize;
            vaddr >= start && vaddr < start + phdr.p_filesz as usize
        })
        .map(|phdr| vaddr - phdr.p_vaddr as usize + phdr.p_offset as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_relocation_tables_stay_absent() {
        let mut info = DynamicInfo::default();
        for (tag, value) in [(DynTag::Rela, 0), (DynTag::Rel, 0x200), (DynTag::StrTab, 0)] {
            info.entries[tag as usize] = Some(DynEntry { slot: 0x10, value });
        }
        info.adjust_values(0x1000);
        info.shift_slots(0x1000);
        assert_eq!(info.value(DynTag::Rela), Some(0));
        assert_eq!(info.value(DynTag::Rel), Some(0x1200));
        assert_eq!(info.value(DynTag::StrTab), Some(0x1000));
        assert_eq!(info.get(DynTag::Rela).map(|entry| entry.slot), Some(0x1010));
        assert_eq!(info.iter().count(), 3);
    }
}
