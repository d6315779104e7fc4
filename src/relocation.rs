//! Applying dynamic relocations to a mapped object.
use crate::{
    Result,
    arch::*,
    dynamic::{DynTag, DynamicInfo},
    elf::{ElfRela, ElfRelr, ElfSymbol},
    error::{mprotect_error, relocate_error},
    object::LoadedObject,
    os::{Mmap, ProtFlags},
    segment::rounddown,
};
use alloc::{format, string::String, vec::Vec};
use core::{
    ffi::{CStr, c_char, c_void},
    ptr::{NonNull, null_mut},
    slice::from_raw_parts,
};
use elf::abi::DT_RELA;

#[cfg(not(feature = "portable-atomic"))]
use alloc::sync::Arc;
#[cfg(feature = "portable-atomic")]
use portable_atomic_util::Arc;

/// Calls an object's `.init`/`.fini` function and array entries.
pub type FnHandler = Arc<dyn Fn(Option<fn()>, Option<&[fn()]>) + Send + Sync>;

/// Resolves a symbol name to an address outside the object being relocated.
pub type SymbolResolver = Arc<dyn Fn(&str) -> Option<*const ()> + Send + Sync>;

/// Calls every function with the C ABI, the single function first.
pub(crate) fn c_abi_handler() -> FnHandler {
    Arc::new(|func: Option<fn()>, func_array: Option<&[fn()]>| {
        func.iter()
            .chain(func_array.unwrap_or(&[]).iter())
            .for_each(|init| unsafe { core::mem::transmute::<_, &extern "C" fn()>(init) }());
    })
}

/// Everything needed to relocate an object, copied out of its record so the
/// registry is not borrowed while resolvers and initializers run.
pub(crate) struct RelocationPlan {
    name: String,
    l_addr: usize,
    info: DynamicInfo,
    relro: Option<(usize, usize)>,
    deepbind: bool,
}

impl RelocationPlan {
    pub(crate) fn new(object: &LoadedObject) -> Self {
        Self {
            name: object.name.clone(),
            l_addr: object.l_addr(),
            info: object.info.clone(),
            relro: object.relro,
            deepbind: object.mode.contains(crate::Mode::DEEPBIND),
        }
    }

    /// Applies RELR, RELA and PLT relocations, then write-protects RELRO.
    pub(crate) fn apply<M: Mmap>(&self, resolver: Option<&SymbolResolver>) -> Result<()> {
        if self.info.has_textrel() {
            return Err(relocate_error(format!(
                "{}: text relocations are not supported",
                self.name
            )));
        }
        if self.info.value(DynTag::Rel).is_some_and(|rel| rel != 0) || self.info.relsz != 0 {
            return Err(relocate_error(format!(
                "{}: DT_REL relocations are not supported",
                self.name
            )));
        }
        #[cfg(feature = "log")]
        log::debug!("[Relocate] {}: l_addr 0x{:x}", self.name, self.l_addr);

        self.relocate_relr();
        if let Some(rela) = self.info.value(DynTag::Rela).filter(|&rela| rela != 0) {
            self.relocate_rela(self.table(rela, self.info.relasz), resolver)?;
        }
        if let Some(jmprel) = self.info.value(DynTag::JmpRel) {
            if self.info.pltrel.is_some_and(|kind| kind != DT_RELA) {
                return Err(relocate_error(format!(
                    "{}: PLT relocations must use RELA",
                    self.name
                )));
            }
            self.relocate_rela(self.table(jmprel, self.info.pltrelsz), resolver)?;
        }
        self.protect_relro::<M>()
    }

    fn table(&self, addr: usize, size: usize) -> &'static [ElfRela] {
        unsafe { from_raw_parts(addr as *const ElfRela, size / size_of::<ElfRela>()) }
    }

    fn relocate_relr(&self) {
        let Some(relr) = self.info.value(DynTag::Relr) else {
            return;
        };
        let base = self.l_addr;
        let relr = unsafe {
            from_raw_parts(relr as *const ElfRelr, self.info.relrsz / size_of::<ElfRelr>())
        };
        let mut reloc_addr: *mut usize = null_mut();
        relr.iter().for_each(|relr| {
            let value = relr.value();
            unsafe {
                if (value & 1) == 0 {
                    reloc_addr = (base + value) as *mut usize;
                    reloc_addr.write(base + reloc_addr.read());
                    reloc_addr = reloc_addr.add(1);
                } else {
                    let mut bitmap = value;
                    let mut idx = 0;
                    while bitmap != 0 {
                        bitmap >>= 1;
                        if (bitmap & 1) != 0 {
                            let ptr = reloc_addr.add(idx);
                            ptr.write(base + ptr.read());
                        }
                        idx += 1;
                    }
                    reloc_addr = reloc_addr.add(usize::BITS as usize - 1);
                }
            }
        });
    }

    fn relocate_rela(&self, table: &[ElfRela], resolver: Option<&SymbolResolver>) -> Result<()> {
        /*
            A = Addend used to compute the value of the relocatable field
            B = Base address at which a shared object is loaded
            S = Value of the symbol whose index resides in the relocation entry
        */
        let base = self.l_addr;
        for rela in table {
            let r_type = rela.r_type() as u32;
            let target = (base + rela.r_offset()) as *mut usize;
            let addend = rela.r_addend();
            let value = match r_type {
                REL_NONE => continue,
                REL_RELATIVE => base.wrapping_add_signed(addend),
                REL_IRELATIVE => {
                    let ifunc: extern "C" fn() -> usize =
                        unsafe { core::mem::transmute(base.wrapping_add_signed(addend)) };
                    ifunc()
                }
                REL_GOT | REL_SYMBOLIC => {
                    self.symbol_address(rela.r_symbol(), resolver)?
                        .wrapping_add_signed(addend)
                }
                REL_JUMP_SLOT => self.symbol_address(rela.r_symbol(), resolver)?,
                _ => {
                    return Err(relocate_error(format!(
                        "{}: unsupported relocation type {} at offset 0x{:x}",
                        self.name,
                        rel_type_to_str(r_type as usize),
                        rela.r_offset()
                    )));
                }
            };
            unsafe { target.write(value) };
        }
        Ok(())
    }

    fn symbol_address(&self, r_sym: usize, resolver: Option<&SymbolResolver>) -> Result<usize> {
        let (Some(symtab), Some(strtab)) = (
            self.info.value(DynTag::SymTab),
            self.info.value(DynTag::StrTab),
        ) else {
            return Err(relocate_error(format!(
                "{}: symbol relocation without a symbol table",
                self.name
            )));
        };
        let sym = unsafe { &*(symtab as *const ElfSymbol).add(r_sym) };
        let name = unsafe { CStr::from_ptr((strtab + sym.st_name()) as *const c_char) }
            .to_str()
            .unwrap_or("");
        let own = (!sym.is_undef()).then(|| self.l_addr + sym.st_value());
        let external = || resolver.and_then(|find| find(name)).map(|addr| addr as usize);
        let found = if self.deepbind {
            own.or_else(external)
        } else {
            external().or(own)
        };
        match found {
            Some(addr) => Ok(addr),
            None if sym.is_weak() => Ok(0),
            None => Err(relocate_error(format!(
                "{}: undefined symbol: {}",
                self.name, name
            ))),
        }
    }

    fn protect_relro<M: Mmap>(&self) -> Result<()> {
        let Some((vaddr, memsz)) = self.relro else {
            return Ok(());
        };
        let page_size = M::page_size();
        let start = rounddown(self.l_addr + vaddr, page_size);
        let end = rounddown(self.l_addr + vaddr + memsz, page_size);
        if end > start {
            let addr = NonNull::new(start as *mut c_void)
                .ok_or_else(|| mprotect_error("RELRO starts at address 0"))?;
            unsafe { M::mprotect(addr, end - start, ProtFlags::PROT_READ) }?;
        }
        Ok(())
    }

    /// Runs DT_INIT and then DT_INIT_ARRAY through `handler`.
    pub(crate) fn run_init(&self, handler: &FnHandler) {
        let init = self.info.init.map(|off| self.function(off));
        let array = self.info.init_array.map(|(off, size)| self.array(off, size));
        #[cfg(feature = "log")]
        log::debug!("[Init] {}", self.name);
        handler(init, array);
    }

    #[inline]
    fn function(&self, off: usize) -> fn() {
        unsafe { core::mem::transmute(self.l_addr + off) }
    }

    #[inline]
    fn array(&self, off: usize, size: usize) -> &'static [fn()] {
        unsafe { from_raw_parts((self.l_addr + off) as *const fn(), size / size_of::<usize>()) }
    }
}

/// Runs DT_FINI_ARRAY in reverse and then DT_FINI.
pub(crate) fn run_fini(object: &LoadedObject, handler: &FnHandler) {
    let l_addr = object.l_addr();
    if let Some((off, size)) = object.info.fini_array {
        let array =
            unsafe { from_raw_parts((l_addr + off) as *const fn(), size / size_of::<usize>()) };
        let reversed: Vec<fn()> = array.iter().rev().copied().collect();
        handler(None, Some(&reversed));
    }
    if let Some(off) = object.info.fini {
        handler(Some(unsafe { core::mem::transmute::<usize, fn()>(l_addr + off) }), None);
    }
    #[cfg(feature = "log")]
    log::debug!("[Fini] {}", object.name);
}
