use crate::elf::{ElfHeader, ElfPhdr};
use alloc::vec::Vec;
use core::slice::from_raw_parts;

/// Where an object's program header table lives after mapping.
#[derive(Clone, Debug)]
pub enum ElfPhdrs {
    /// The table is part of the mapped image, at this address.
    Mapped { addr: usize, count: usize },

    /// The table was not mapped and is kept as a separate copy.
    Owned(Vec<ElfPhdr>),
}

impl ElfPhdrs {
    /// Address of the table, whichever way it is stored.
    #[inline]
    pub fn addr(&self) -> usize {
        match self {
            ElfPhdrs::Mapped { addr, .. } => *addr,
            ElfPhdrs::Owned(phdrs) => phdrs.as_ptr() as usize,
        }
    }

    /// Whether the table is a copy rather than part of the mapped image.
    #[inline]
    pub fn is_allocated(&self) -> bool {
        matches!(self, ElfPhdrs::Owned(_))
    }

    pub fn as_slice(&self) -> &[ElfPhdr] {
        match self {
            ElfPhdrs::Mapped { addr, count } => unsafe {
                from_raw_parts(*addr as *const ElfPhdr, *count)
            },
            ElfPhdrs::Owned(phdrs) => phdrs,
        }
    }
}

/// Copies the program header table out of a (possibly unaligned) buffer.
pub(crate) fn read_phdrs(data: &[u8], ehdr: &ElfHeader) -> Vec<ElfPhdr> {
    let (start, _) = ehdr.phdr_range();
    let base = data[start..].as_ptr().cast::<ElfPhdr>();
    (0..ehdr.e_phnum())
        .map(|idx| unsafe { base.add(idx).read_unaligned() })
        .collect()
}
