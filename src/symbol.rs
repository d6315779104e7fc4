//! Looking up an object's own definitions through its hash table.
use crate::{
    dynamic::DynTag,
    elf::ElfSymbol,
    object::{HashTables, LoadedObject},
};
use core::ffi::{CStr, c_char};

/// The SysV ELF hash of `name`.
#[inline]
pub(crate) fn sysv_hash(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for byte in name {
        hash = (hash << 4).wrapping_add(u32::from(*byte));
        let g = hash & 0xf000_0000;
        if g != 0 {
            hash ^= g >> 24;
        }
        hash &= !g;
    }
    hash
}

/// The GNU (djb2) hash of `name`.
#[inline]
pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for byte in name {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(*byte));
    }
    hash
}

/// The dynamic symbol table of a mapped object together with its hash table.
///
/// All addresses are the record's current ones, so a table built after
/// [`Linker::set_object_base`](crate::Linker::set_object_base) reads the moved copy.
pub(crate) struct SymbolTable {
    symtab: usize,
    strtab: usize,
    hash: HashTables,
}

impl SymbolTable {
    /// `None` when the object has no symbol or string table.
    pub(crate) fn new(object: &LoadedObject) -> Option<Self> {
        let info = object.dynamic_info();
        Some(Self {
            symtab: info.value(DynTag::SymTab)?,
            strtab: info.value(DynTag::StrTab)?,
            hash: object.hash_tables(),
        })
    }

    /// Finds the definition of `name`. Undefined entries never match.
    pub(crate) fn lookup(&self, name: &str) -> Option<&ElfSymbol> {
        let buckets = self.hash.buckets()?;
        let chain = self.hash.chain()?;
        let found = match self.hash.gnu_bitmask() {
            Some(bitmask) => unsafe { self.gnu_lookup(name.as_bytes(), bitmask, buckets, chain) },
            None => unsafe { self.sysv_lookup(name.as_bytes(), buckets, chain) },
        };
        found.filter(|sym| !sym.is_undef())
    }

    unsafe fn sysv_lookup(&self, name: &[u8], buckets: usize, chain: usize) -> Option<&ElfSymbol> {
        // nbucket and nchain precede the buckets
        let nbucket = unsafe { read_u32(buckets - 8) } as usize;
        if nbucket == 0 {
            return None;
        }
        let hash = sysv_hash(name) as usize;
        let mut idx = unsafe { read_u32(buckets + 4 * (hash % nbucket)) } as usize;
        while idx != 0 {
            let sym = unsafe { self.symbol(idx) };
            if unsafe { self.name_of(sym) } == name {
                return Some(sym);
            }
            idx = unsafe { read_u32(chain + 4 * idx) } as usize;
        }
        None
    }

    unsafe fn gnu_lookup(
        &self,
        name: &[u8],
        bitmask: usize,
        buckets: usize,
        chain: usize,
    ) -> Option<&ElfSymbol> {
        const BITS: usize = usize::BITS as usize;
        // nbucket, symbias, nbloom, nshift
        let header = bitmask - 16;
        let (nbucket, nbloom, nshift) = unsafe {
            (
                read_u32(header) as usize,
                read_u32(header + 8) as usize,
                read_u32(header + 12),
            )
        };
        if nbucket == 0 || nbloom == 0 {
            return None;
        }
        let hash = gnu_hash(name);
        let word = (hash as usize / BITS) & (nbloom - 1);
        let filter = unsafe { ((bitmask + word * size_of::<usize>()) as *const usize).read() };
        let mask = (1usize << (hash as usize % BITS)) | (1usize << ((hash >> nshift) as usize % BITS));
        if filter & mask != mask {
            return None;
        }

        // `chain` is biased by symbias, so it is indexed by symbol index
        let mut idx = unsafe { read_u32(buckets + 4 * (hash as usize % nbucket)) } as usize;
        if idx == 0 {
            return None;
        }
        loop {
            let chain_hash = unsafe { read_u32(chain.wrapping_add(4 * idx)) };
            if chain_hash | 1 == hash | 1 {
                let sym = unsafe { self.symbol(idx) };
                if unsafe { self.name_of(sym) } == name {
                    return Some(sym);
                }
            }
            if chain_hash & 1 != 0 {
                return None;
            }
            idx += 1;
        }
    }

    #[inline]
    unsafe fn symbol(&self, idx: usize) -> &ElfSymbol {
        unsafe { &*(self.symtab as *const ElfSymbol).add(idx) }
    }

    #[inline]
    unsafe fn name_of(&self, sym: &ElfSymbol) -> &[u8] {
        unsafe { CStr::from_ptr((self.strtab + sym.st_name()) as *const c_char) }.to_bytes()
    }
}

#[inline]
unsafe fn read_u32(addr: usize) -> u32 {
    unsafe { (addr as *const u32).read() }
}
