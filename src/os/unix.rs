use crate::{
    Result,
    error::{mmap_error, mprotect_error},
    os::{MapFlags, Mmap, ProtFlags},
};
use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};
use libc::{mmap, mprotect, munmap};

/// An implementation of Mmap trait
pub struct DefaultMmap;

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            mmap(
                addr as _,
                len,
                prot.bits(),
                flags.union(MapFlags::MAP_ANONYMOUS).bits(),
                -1,
                0,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(mmap_error("mmap anonymous failed"));
        }
        NonNull::new(ptr).ok_or_else(|| mmap_error("mmap returned a null mapping"))
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        let res = unsafe { munmap(addr.as_ptr(), len) };
        if res != 0 {
            return Err(mmap_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(mprotect_error("mprotect failed"));
        }
        Ok(())
    }

    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            crate::os::PAGE_SIZE
        } else {
            size as usize
        }
    }
}

/// Identity of the calling thread, used by the reentrant load lock.
#[inline]
pub(crate) fn current_thread_id() -> NonZeroUsize {
    let id = unsafe { libc::pthread_self() } as usize;
    NonZeroUsize::new(id).unwrap_or(NonZeroUsize::MIN)
}
