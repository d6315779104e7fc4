use core::{ffi::c_void, ptr::NonNull};

use super::{MapFlags, ProtFlags};
use crate::Result;

/// Default page granularity assumed when a backend cannot query the system.
pub const PAGE_SIZE: usize = 0x1000;

/// A trait for low-level memory mapping operations.
///
/// All methods are associated functions: a backend carries no state, it only
/// selects which system primitives the loader uses. The loader is generic over
/// the backend (see [`Linker::with_mmap`](crate::Linker::with_mmap)).
///
/// # Errors
/// Implementations must report a failed `mmap_anonymous` or `munmap` as
/// [`Error::Mmap`](crate::Error::Mmap) and a failed `mprotect` as
/// [`Error::Mprotect`](crate::Error::Mprotect). The loader relies on the
/// distinction when it reports failures.
///
/// # Safety
/// All methods manipulate the process's virtual address space. Improper use can
/// cause memory corruption, crashes, or security vulnerabilities.
///
/// # Example
/// ```rust,ignore
/// struct MyMmap;
///
/// impl Mmap for MyMmap {
///     unsafe fn mmap_anonymous(
///         addr: usize,
///         len: usize,
///         prot: ProtFlags,
///         flags: MapFlags,
///     ) -> Result<NonNull<c_void>> {
///         // Platform-specific implementation
///         todo!()
///     }
///
///     // Implement other required methods...
/// }
/// ```
pub trait Mmap {
    /// Creates an anonymous memory mapping.
    ///
    /// # Arguments
    /// * `addr` - Address hint, or the exact address when `flags` contains
    ///   `MAP_FIXED`. `0` lets the system choose.
    /// * `len` - Size of the mapping in bytes.
    /// * `prot` - Initial memory protection flags.
    /// * `flags` - Mapping configuration flags. `MAP_ANONYMOUS` is implied.
    ///
    /// # Safety
    /// With `MAP_FIXED`, any existing mapping in the range is replaced.
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Unmaps a memory region, releasing the associated resources.
    ///
    /// # Safety
    /// The region must not be accessed after unmapping.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Changes the protection of a memory region.
    ///
    /// # Safety
    /// `addr` must be page-aligned. Removing access from a range that is still in
    /// use faults the next access.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Reserves a region of virtual address space without granting any access.
    ///
    /// # Safety
    /// The reserved region must not be accessed until its protection is changed.
    unsafe fn mmap_reserve(addr: usize, len: usize) -> Result<NonNull<c_void>> {
        unsafe { Self::mmap_anonymous(addr, len, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE) }
    }

    /// The system page size.
    #[inline]
    fn page_size() -> usize {
        PAGE_SIZE
    }
}
