//! The reentrant lock serializing every operation of a [`Linker`](crate::Linker).
use core::num::NonZeroUsize;
use lock_api::GetThreadId;

/// Identifies the calling thread for the reentrant lock.
pub(crate) struct ThreadId;

unsafe impl GetThreadId for ThreadId {
    const INIT: Self = ThreadId;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        crate::os::current_thread_id()
    }
}

/// A lock the owning thread may take again, for callbacks that reenter the linker.
pub(crate) type LoadLock<T> = lock_api::ReentrantMutex<spin::Mutex<()>, ThreadId, T>;
