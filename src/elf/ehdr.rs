//! ELF header parsing and validation

use crate::{
    Result,
    arch::EM_ARCH,
    elf::{E_CLASS, EHDR_SIZE, Ehdr, Phdr},
    error::parse_ehdr_error,
};
use core::ops::Deref;
use elf::abi::{EI_CLASS, EI_DATA, EI_VERSION, ELFMAGIC, ET_DYN, ET_EXEC, EV_CURRENT};

#[cfg(target_endian = "little")]
const E_DATA: u8 = elf::abi::ELFDATA2LSB;
#[cfg(target_endian = "big")]
const E_DATA: u8 = elf::abi::ELFDATA2MSB;

/// A validated copy of an image's ELF header.
#[repr(transparent)]
pub struct ElfHeader {
    ehdr: Ehdr,
}

impl Deref for ElfHeader {
    type Target = Ehdr;

    fn deref(&self) -> &Self::Target {
        &self.ehdr
    }
}

impl ElfHeader {
    /// Reads and validates the header at the start of `data`.
    ///
    /// The buffer does not have to be aligned; the header is copied out.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EHDR_SIZE {
            return Err(parse_ehdr_error("file too short"));
        }
        let ehdr = ElfHeader {
            ehdr: unsafe { data.as_ptr().cast::<Ehdr>().read_unaligned() },
        };
        ehdr.validate()?;
        let (start, end) = ehdr.phdr_range();
        if start > end || end > data.len() {
            return Err(parse_ehdr_error("program header table exceeds the buffer"));
        }
        Ok(ehdr)
    }

    /// Checks if the ELF file is a dynamic library (shared object)
    #[inline]
    pub fn is_dylib(&self) -> bool {
        self.ehdr.e_type == ET_DYN
    }

    fn validate(&self) -> Result<()> {
        if self.e_ident[0..4] != ELFMAGIC {
            return Err(parse_ehdr_error("invalid ELF header"));
        }

        if self.e_ident[EI_CLASS] != E_CLASS {
            return Err(parse_ehdr_error("wrong ELF class"));
        }

        if self.e_ident[EI_DATA] != E_DATA {
            return Err(parse_ehdr_error("ELF file data encoding not native"));
        }

        if self.e_ident[EI_VERSION] != EV_CURRENT || self.e_version != EV_CURRENT as u32 {
            return Err(parse_ehdr_error("ELF file version does not match current one"));
        }

        if self.e_machine != EM_ARCH {
            return Err(parse_ehdr_error("ELF file machine type not compatible"));
        }

        match self.e_type {
            ET_DYN => {}
            ET_EXEC => return Err(parse_ehdr_error("cannot dynamically load executable")),
            _ => return Err(parse_ehdr_error("only ET_DYN and ET_EXEC can be loaded")),
        }

        if self.e_phentsize() != size_of::<Phdr>() {
            return Err(parse_ehdr_error("ELF file's phentsize not the expected size"));
        }

        Ok(())
    }

    /// Gets the number of program headers
    #[inline]
    pub(crate) fn e_phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    /// Gets the size of each program header entry
    #[inline]
    pub(crate) fn e_phentsize(&self) -> usize {
        self.ehdr.e_phentsize as usize
    }

    /// Gets the file offset of the program header table
    #[inline]
    pub(crate) fn e_phoff(&self) -> usize {
        self.ehdr.e_phoff as usize
    }

    /// Gets the nominal entry point
    #[inline]
    pub(crate) fn e_entry(&self) -> usize {
        self.ehdr.e_entry as usize
    }

    /// Byte range `(start, end)` of the program header table in the file.
    #[inline]
    pub(crate) fn phdr_range(&self) -> (usize, usize) {
        let phdrs_size = self.e_phentsize().saturating_mul(self.e_phnum());
        let phdr_start = self.e_phoff();
        let phdr_end = phdr_start.saturating_add(phdrs_size);
        (phdr_start, phdr_end)
    }
}
