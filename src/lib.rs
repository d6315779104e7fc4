//! # elf_dlmem
//! Loading ELF shared objects straight from memory, with relocation that can
//! be deferred until the caller has moved the object where it wants it.
//!
//! ## Usage
//! [`Linker::dlmem`] maps an object from a byte buffer. With
//! [`MemFlags::NO_RELOCATE`] the object stays unrelocated: the caller can read
//! its geometry with [`Linker::map_info`], copy the mapped bytes to a new
//! address, record the move with [`Linker::set_object_base`] and finally call
//! [`Linker::relocate`], which applies relocations and runs initializers.
//!
//! The memory the object lands in can be supplied by a [`PremapHook`], for
//! example to back it with a shared memory object.
#![no_std]
#![warn(
    clippy::unnecessary_wraps,
    clippy::unnecessary_lazy_evaluations,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::manual_assert,
    clippy::needless_question_mark,
    clippy::needless_return,
    clippy::redundant_clone,
    clippy::redundant_else,
    clippy::redundant_static_lifetimes
)]
#![allow(clippy::unnecessary_cast, clippy::collapsible_if)]
extern crate alloc;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
)))]
compile_error!("unsupport arch");

pub mod arch;
mod dlmem;
pub mod dynamic;
pub mod elf;
mod error;
mod linker;
mod loader;
pub mod object;
pub mod os;
mod rebase;
mod relocation;
pub mod segment;
mod symbol;
mod sync;

pub use dlmem::{MemArgs, MemFlags, Mode};
pub use error::{Error, Result, custom_error};
pub use linker::{Handle, Linker};
pub use object::{Geometry, HashTables, LoadedObject, MapInfo};
pub use os::{DefaultMmap, MapFlags, Mmap, ProtFlags};
pub use relocation::{FnHandler, SymbolResolver};
pub use segment::{DefaultPlacement, Placement, PremapHook};
