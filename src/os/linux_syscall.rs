use crate::{
    Result,
    error::{mmap_error, mprotect_error},
    os::{MapFlags, Mmap, ProtFlags},
};
use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};
use syscalls::Sysno;

/// An implementation of Mmap trait
pub struct DefaultMmap;

#[inline]
fn mmap_anonymous(
    addr: *mut c_void,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
) -> Option<*mut c_void> {
    let ptr = unsafe {
        #[cfg(target_pointer_width = "32")]
        let syscall = Sysno::mmap2;
        #[cfg(not(target_pointer_width = "32"))]
        let syscall = Sysno::mmap;
        from_ret(syscalls::raw_syscall!(
            syscall,
            addr,
            len,
            prot.bits(),
            flags.union(MapFlags::MAP_ANONYMOUS).bits(),
            usize::MAX,
            0
        ))?
    };
    Some(ptr as *mut c_void)
}

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        mmap_anonymous(addr as _, len, prot, flags)
            .and_then(NonNull::new)
            .ok_or_else(|| mmap_error("mmap anonymous failed"))
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        unsafe { from_ret(syscalls::raw_syscall!(Sysno::munmap, addr.as_ptr(), len)) }
            .ok_or_else(|| mmap_error("munmap failed"))?;
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        unsafe {
            from_ret(syscalls::raw_syscall!(
                Sysno::mprotect,
                addr.as_ptr(),
                len,
                prot.bits()
            ))
        }
        .ok_or_else(|| mprotect_error("mprotect failed"))?;
        Ok(())
    }
}

/// Identity of the calling thread, used by the reentrant load lock.
#[inline]
pub(crate) fn current_thread_id() -> NonZeroUsize {
    let tid = unsafe { syscalls::raw_syscall!(Sysno::gettid) };
    NonZeroUsize::new(tid).unwrap_or(NonZeroUsize::MIN)
}

/// Converts a raw syscall return value, `None` meaning the call failed.
#[inline(always)]
fn from_ret(value: usize) -> Option<usize> {
    // Same range check musl uses for error returns.
    if value > -4096isize as usize {
        return None;
    }
    Some(value)
}
