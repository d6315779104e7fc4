#![allow(dead_code)]

use core::{ffi::c_void, ptr::NonNull};
use elf_dlmem::{
    DefaultMmap, MapFlags, Mmap, ProtFlags, Result,
    arch::{EM_ARCH, REL_JUMP_SLOT, REL_RELATIVE, REL_SYMBOLIC},
    elf::{DT_RELR, DT_RELRSZ},
};
use object::elf::*;
use std::{
    cell::RefCell,
    collections::BTreeSet,
    sync::atomic::{AtomicUsize, Ordering},
};

pub const SONAME: &str = "libdlmem_test.so";

/// Start of the writable segment, both in the file and in memory.
pub const DATA: usize = 0x10000;
pub const DYNAMIC: usize = DATA;
pub const DYNAMIC_SIZE: usize = 0x200;
/// A 4-byte counter the initializer increments.
pub const COUNTER: usize = DATA + 0x200;
/// Relocated slots: RELATIVE, own symbol, weak undefined, host import,
/// PLT entry and RELR entry.
pub const SLOT_RELATIVE: usize = DATA + 0x210;
pub const SLOT_OWN: usize = DATA + 0x218;
pub const SLOT_WEAK: usize = DATA + 0x220;
pub const SLOT_HOST: usize = DATA + 0x228;
pub const SLOT_PLT: usize = DATA + 0x230;
pub const SLOT_RELR: usize = DATA + 0x238;
/// Two finalizer entries, relocated to `INIT` and `INIT + 0x100`.
pub const FINI_ARRAY: usize = DATA + 0x300;
pub const PLTGOT: usize = DATA + 0x400;
/// File-backed bytes of the data segment unless overridden; the rest of its
/// page must read as zero.
pub const DATA_FILESZ: usize = 0xF00;
pub const DATA_MEMSZ: usize = 0x2000;

pub const TEXT_SIZE: usize = 0x1000;
pub const SYMTAB: usize = 0x300;
pub const STRTAB: usize = 0x400;
pub const HASH: usize = 0x500;
pub const GNU_HASH: usize = 0x540;
pub const VERSYM: usize = 0x580;
pub const RELA: usize = 0x600;
pub const JMPREL: usize = 0x6c0;
pub const RELR: usize = 0x6e0;
pub const INIT: usize = 0x800;
pub const RELATIVE_ADDEND: usize = INIT;

/// Dynamic symbol indices.
pub const SYM_WEAK: usize = 1;
pub const SYM_HOST: usize = 2;
pub const SYM_COUNTER: usize = 3;
pub const SYM_BUMP: usize = 4;
pub const SYM_COUNT: usize = 5;

pub const HOST_SYMBOL: &str = "host_symbol";
pub const COUNTER_SYMBOL: &str = "counter";
pub const BUMP_SYMBOL: &str = "bump_counter";

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn gnu_hash(name: &str) -> u32 {
    name.bytes()
        .fold(5381u32, |hash, byte| hash.wrapping_mul(33).wrapping_add(u32::from(byte)))
}

/// `bump_counter`: increments the 4-byte counter and returns.
fn init_code() -> Vec<u8> {
    let off = (COUNTER - INIT) as u32;
    if cfg!(target_arch = "x86_64") {
        // inc dword ptr [rip + disp32]; ret
        let disp = off - 6;
        let mut code = vec![0xff, 0x05];
        code.extend_from_slice(&disp.to_le_bytes());
        code.push(0xc3);
        code
    } else if cfg!(target_arch = "aarch64") {
        // adr x0, counter; ldr w1, [x0]; add w1, w1, #1; str w1, [x0]; ret
        let adr = 0x1000_0000 | ((off & 3) << 29) | (((off >> 2) & 0x7ffff) << 5);
        [adr, 0xb940_0001, 0x1100_0421, 0xb900_0001, 0xd65f_03c0]
            .iter()
            .flat_map(|insn: &u32| insn.to_le_bytes())
            .collect()
    } else {
        // auipc a0, hi; addi a0, a0, lo; lw a1, 0(a0); addi a1, a1, 1; sw a1, 0(a0); ret
        let hi = (off + 0x800) >> 12;
        let lo = off.wrapping_sub(hi << 12) & 0xfff;
        let auipc = (hi << 12) | (10 << 7) | 0x17;
        let addi = (lo << 20) | (10 << 15) | (10 << 7) | 0x13;
        [auipc, addi, 0x0005_2583, 0x0015_8593, 0x00b5_2023, 0x0000_8067]
            .iter()
            .flat_map(|insn: &u32| insn.to_le_bytes())
            .collect()
    }
}

/// Builds a small shared object for the host architecture.
#[derive(Clone)]
pub struct ImageBuilder {
    soname: Option<&'static str>,
    align: usize,
    data_filesz: usize,
    host_import: bool,
    textrel: bool,
    fini_array: bool,
    gnu_hash: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            soname: Some(SONAME),
            align: 0x10000,
            data_filesz: DATA_FILESZ,
            host_import: false,
            textrel: false,
            fini_array: false,
            gnu_hash: false,
        }
    }
}

struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, off: usize, v: u8) {
        self.bytes[off] = v;
    }
    fn u16(&mut self, off: usize, v: u16) {
        self.bytes[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, off: usize, v: u32) {
        self.bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, off: usize, v: u64) {
        self.bytes[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
    fn str(&mut self, off: usize, s: &str) -> usize {
        self.bytes[off..off + s.len()].copy_from_slice(s.as_bytes());
        self.bytes[off + s.len()] = 0;
        off + s.len() + 1
    }
    fn rela(&mut self, off: usize, (offset, sym, r_type, addend): (usize, usize, u32, usize)) {
        self.u64(off, offset as u64);
        self.u64(off + 8, ((sym as u64) << 32) | u64::from(r_type));
        self.u64(off + 16, addend as u64);
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soname(mut self, soname: Option<&'static str>) -> Self {
        self.soname = soname;
        self
    }

    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// File-backed size of the data segment, at most `DATA_MEMSZ`.
    pub fn data_filesz(mut self, filesz: usize) -> Self {
        self.data_filesz = filesz;
        self
    }

    pub fn host_import(mut self) -> Self {
        self.host_import = true;
        self
    }

    pub fn textrel(mut self) -> Self {
        self.textrel = true;
        self
    }

    pub fn fini_array(mut self) -> Self {
        self.fini_array = true;
        self
    }

    /// Adds a DT_GNU_HASH table next to the SysV one.
    pub fn gnu_hash(mut self) -> Self {
        self.gnu_hash = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let filesz = self.data_filesz;
        let mut w = Writer {
            bytes: vec![0; DATA + filesz + 0x100],
        };
        // bytes past the data segment's file size must never show up in memory
        w.bytes[DATA + filesz..].fill(0xAA);

        // ELF header
        w.bytes[..4].copy_from_slice(&ELFMAG);
        w.u8(4, ELFCLASS64);
        w.u8(5, ELFDATA2LSB);
        w.u8(6, EV_CURRENT);
        w.u16(16, ET_DYN);
        w.u16(18, EM_ARCH);
        w.u32(20, EV_CURRENT as u32);
        w.u64(24, INIT as u64);
        w.u64(32, 64);
        w.u16(52, 64);
        w.u16(54, 56);
        w.u16(56, 3);

        let phdr = |w: &mut Writer, idx: usize, p_type: u32, flags: u32, off: usize, filesz: usize, memsz: usize, align: usize| {
            let base = 64 + idx * 56;
            w.u32(base, p_type);
            w.u32(base + 4, flags);
            w.u64(base + 8, off as u64);
            w.u64(base + 16, off as u64);
            w.u64(base + 24, off as u64);
            w.u64(base + 32, filesz as u64);
            w.u64(base + 40, memsz as u64);
            w.u64(base + 48, align as u64);
        };
        phdr(&mut w, 0, PT_LOAD, PF_R | PF_X, 0, TEXT_SIZE, TEXT_SIZE, self.align);
        phdr(&mut w, 1, PT_LOAD, PF_R | PF_W, DATA, filesz, DATA_MEMSZ, self.align);
        phdr(&mut w, 2, PT_DYNAMIC, PF_R | PF_W, DYNAMIC, DYNAMIC_SIZE, DYNAMIC_SIZE, 8);

        // string table
        let mut next = STRTAB + 1;
        let soname_off = self.soname.map(|name| {
            let off = next - STRTAB;
            next = w.str(next, name);
            off
        });
        let mut names = [0usize; SYM_COUNT];
        for (idx, name) in [
            (SYM_WEAK, "weak_symbol"),
            (SYM_HOST, HOST_SYMBOL),
            (SYM_COUNTER, COUNTER_SYMBOL),
            (SYM_BUMP, BUMP_SYMBOL),
        ] {
            names[idx] = next - STRTAB;
            next = w.str(next, name);
        }
        let strsz = next - STRTAB;

        // undefined symbols first, so the GNU hash table covers the defined ones
        let sym = |w: &mut Writer, idx: usize, info: u8, shndx: u16, value: usize| {
            let base = SYMTAB + idx * 24;
            w.u32(base, names[idx] as u32);
            w.u8(base + 4, info);
            w.u16(base + 6, shndx);
            w.u64(base + 8, value as u64);
        };
        sym(&mut w, SYM_WEAK, (STB_WEAK << 4) | STT_NOTYPE, SHN_UNDEF, 0);
        sym(&mut w, SYM_HOST, (STB_GLOBAL << 4) | STT_NOTYPE, SHN_UNDEF, 0);
        sym(&mut w, SYM_COUNTER, (STB_GLOBAL << 4) | STT_OBJECT, 2, COUNTER);
        sym(&mut w, SYM_BUMP, (STB_GLOBAL << 4) | STT_FUNC, 1, INIT);
        for idx in SYM_COUNTER..SYM_COUNT {
            w.u16(VERSYM + 2 * idx, 1);
        }

        // SysV hash: one bucket chaining bump_counter -> counter
        w.u32(HASH, 1);
        w.u32(HASH + 4, SYM_COUNT as u32);
        w.u32(HASH + 8, SYM_BUMP as u32);
        w.u32(HASH + 12 + 4 * SYM_BUMP, SYM_COUNTER as u32);

        if self.gnu_hash {
            // one bucket, one bloom word, shift 6
            let shift = 6;
            w.u32(GNU_HASH, 1);
            w.u32(GNU_HASH + 4, SYM_COUNTER as u32);
            w.u32(GNU_HASH + 8, 1);
            w.u32(GNU_HASH + 12, shift);
            let mut bloom = 0u64;
            for (pos, name) in [COUNTER_SYMBOL, BUMP_SYMBOL].iter().enumerate() {
                let hash = gnu_hash(name);
                bloom |= 1 << (hash % 64);
                bloom |= 1 << ((hash >> shift) % 64);
                let last = if pos == 1 { 1 } else { 0 };
                w.u32(GNU_HASH + 28 + 4 * pos, (hash & !1) | last);
            }
            w.u64(GNU_HASH + 16, bloom);
            w.u32(GNU_HASH + 24, SYM_COUNTER as u32);
        }

        // relocations
        let mut relas = vec![
            (SLOT_RELATIVE, 0, REL_RELATIVE, RELATIVE_ADDEND),
            (SLOT_OWN, SYM_COUNTER, REL_SYMBOLIC, 0),
            (SLOT_WEAK, SYM_WEAK, REL_SYMBOLIC, 0),
        ];
        if self.host_import {
            relas.push((SLOT_HOST, SYM_HOST, REL_SYMBOLIC, 0));
        }
        if self.fini_array {
            relas.push((FINI_ARRAY, 0, REL_RELATIVE, INIT));
            relas.push((FINI_ARRAY + 8, 0, REL_RELATIVE, INIT + 0x100));
        }
        for (idx, rela) in relas.iter().enumerate() {
            w.rela(RELA + idx * 24, *rela);
        }
        w.rela(JMPREL, (SLOT_PLT, SYM_COUNTER, REL_JUMP_SLOT, 0));
        // RELR adds the base to the value already in place
        w.u64(RELR, SLOT_RELR as u64);
        w.u64(SLOT_RELR, INIT as u64);

        let code = init_code();
        w.bytes[INIT..INIT + code.len()].copy_from_slice(&code);

        // dynamic section
        let mut dynamic = vec![
            (DT_HASH as u64, HASH as u64),
            (DT_STRTAB as u64, STRTAB as u64),
            (DT_SYMTAB as u64, SYMTAB as u64),
            (DT_STRSZ as u64, strsz as u64),
            (DT_SYMENT as u64, 24),
            (DT_VERSYM as u64, VERSYM as u64),
            (DT_RELA as u64, RELA as u64),
            (DT_RELASZ as u64, (relas.len() * 24) as u64),
            (DT_RELAENT as u64, 24),
            (DT_PLTGOT as u64, PLTGOT as u64),
            (DT_JMPREL as u64, JMPREL as u64),
            (DT_PLTRELSZ as u64, 24),
            (DT_PLTREL as u64, DT_RELA as u64),
            (DT_RELR as u64, RELR as u64),
            (DT_RELRSZ as u64, 8),
            (DT_INIT as u64, INIT as u64),
        ];
        if self.gnu_hash {
            dynamic.push((DT_GNU_HASH as u64, GNU_HASH as u64));
        }
        if let Some(off) = soname_off {
            dynamic.push((DT_SONAME as u64, off as u64));
        }
        if self.fini_array {
            dynamic.push((DT_FINI_ARRAY as u64, FINI_ARRAY as u64));
            dynamic.push((DT_FINI_ARRAYSZ as u64, 16));
        }
        if self.textrel {
            dynamic.push((DT_TEXTREL as u64, 0));
        }
        dynamic.push((DT_NULL as u64, 0));
        assert!(dynamic.len() * 16 <= DYNAMIC_SIZE);
        for (idx, (tag, value)) in dynamic.iter().enumerate() {
            w.u64(DYNAMIC + idx * 16, *tag);
            w.u64(DYNAMIC + idx * 16 + 8, *value);
        }
        w.bytes
    }
}

/// A copy of an image in its own anonymous mapping, `offset` bytes past a page boundary.
pub struct MappedBuffer {
    base: *mut u8,
    map_len: usize,
    offset: usize,
    len: usize,
}

impl MappedBuffer {
    pub fn new(bytes: &[u8]) -> Self {
        Self::with_offset(bytes, 0)
    }

    pub fn with_offset(bytes: &[u8], offset: usize) -> Self {
        let map_len = bytes.len() + offset + page_size();
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let base = base.cast::<u8>();
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len()) };
        Self {
            base,
            map_len,
            offset,
            len: bytes.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base.add(self.offset), self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.cast(), self.map_len) };
    }
}

/// Reads a word of a loaded object.
pub fn read_usize(addr: usize) -> usize {
    unsafe { (addr as *const usize).read() }
}

pub fn read_u32(addr: usize) -> u32 {
    unsafe { (addr as *const u32).read() }
}

/// An init handler that counts the calls carrying work and runs the single
/// initializer.
pub fn counting_handler(calls: &'static AtomicUsize) -> elf_dlmem::FnHandler {
    std::sync::Arc::new(move |func: Option<fn()>, array: Option<&[fn()]>| {
        if func.is_some() || array.is_some_and(|array| !array.is_empty()) {
            calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(func) = func {
            let func = unsafe { core::mem::transmute::<fn(), extern "C" fn()>(func) };
            func();
        }
    })
}

/// Anonymous memory handed out by a premap hook.
pub fn anonymous_backing(len: usize) -> Option<NonNull<c_void>> {
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    (ptr != libc::MAP_FAILED).then(|| NonNull::new(ptr)).flatten()
}

thread_local! {
    static LIVE_PAGES: RefCell<BTreeSet<usize>> = const { RefCell::new(BTreeSet::new()) };
}

/// Forwards to the system and records, per thread, which pages are mapped
/// through it.
pub struct TrackingMmap;

impl TrackingMmap {
    fn pages(addr: usize, len: usize) -> impl Iterator<Item = usize> {
        let page = page_size();
        (addr..addr + len.next_multiple_of(page)).step_by(page)
    }

    /// Pages currently mapped through this backend on the calling thread.
    pub fn live_pages() -> usize {
        LIVE_PAGES.with(|pages| pages.borrow().len())
    }

    /// Whether any page of `[addr, addr + len)` is mapped through this backend.
    pub fn is_mapped(addr: usize, len: usize) -> bool {
        LIVE_PAGES.with(|pages| Self::pages(addr, len).any(|page| pages.borrow().contains(&page)))
    }
}

impl Mmap for TrackingMmap {
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe { DefaultMmap::mmap_anonymous(addr, len, prot, flags) }?;
        LIVE_PAGES.with(|pages| pages.borrow_mut().extend(Self::pages(ptr.as_ptr() as usize, len)));
        Ok(ptr)
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        LIVE_PAGES.with(|pages| {
            let mut pages = pages.borrow_mut();
            Self::pages(addr.as_ptr() as usize, len).for_each(|page| {
                pages.remove(&page);
            });
        });
        unsafe { DefaultMmap::munmap(addr, len) }
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        unsafe { DefaultMmap::mprotect(addr, len, prot) }
    }

    fn page_size() -> usize {
        DefaultMmap::page_size()
    }
}
