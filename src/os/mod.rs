//! Platform layer: memory mapping primitives and thread identity.
//!
//! The loader never calls the system directly. Every mapping, unmapping and
//! protection change goes through the [`Mmap`] trait so that a caller can
//! substitute its own backend (for example one that injects failures).

mod traits;

use bitflags::bitflags;
use core::ffi::c_int;

pub use traits::{Mmap, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for controlling access permissions.
    pub struct ProtFlags: c_int {
        /// No access allowed. Useful for reserving address space.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Memory mapping configuration flags.
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;

        /// Place the mapping at exactly the specified address, replacing whatever was there.
        const MAP_FIXED = 16;

        /// Create an anonymous mapping not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "use-syscall")]{
        pub(crate) mod linux_syscall;
        pub use linux_syscall::DefaultMmap;
        pub(crate) use linux_syscall::current_thread_id;
    }else if #[cfg(unix)]{
        pub(crate) mod unix;
        pub use unix::DefaultMmap;
        pub(crate) use unix::current_thread_id;
    }else {
        compile_error!("elf_dlmem requires a unix target or the `use-syscall` feature");
    }
}
