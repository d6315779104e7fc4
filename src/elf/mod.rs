//! ELF (Executable and Linkable Format) data structures and utilities.

mod defs;
mod ehdr;
mod phdrs;

pub(crate) use defs::*;
pub(crate) use ehdr::ElfHeader;
pub(crate) use phdrs::read_phdrs;

pub use defs::{DT_RELR, DT_RELRSZ, Dyn, ElfPhdr, ElfRela, ElfRelr, ElfSymbol};
pub use phdrs::ElfPhdrs;
