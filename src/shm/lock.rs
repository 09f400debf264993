//! Cross-process synchronisation living in the mapped region.
//!
//! The primary lock is a POSIX rwlock initialised with
//! `PTHREAD_PROCESS_SHARED`, stored inside the region so every attached
//! process contends on the same words. A process-shared mutex next to it
//! serialises LRU relinks performed under the shared read side.
//!
//! Alternatively (`use_flock`) the primary lock is an advisory byte-range
//! lock over the whole backing file. That mode is process-safe but not
//! thread-safe within one process: the kernel tracks one lock per
//! (process, file) pair, so two threads sharing a handle would stomp on each
//! other's lock state.

use std::io;
use std::os::unix::io::RawFd;

/// Initialise the process-shared rwlock and LRU mutex at the given region
/// addresses. Called exactly once, by the creating process.
///
/// # Safety
/// `rwlock_ptr` and `mutex_ptr` must point at the reserved, zeroed lock
/// storage inside a freshly created region.
pub unsafe fn init(rwlock_ptr: *mut u8, mutex_ptr: *mut u8) -> io::Result<()> {
    let mut lock_attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
    let ret = libc::pthread_rwlockattr_init(&mut lock_attr);
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    let ret = libc::pthread_rwlockattr_setpshared(&mut lock_attr, libc::PTHREAD_PROCESS_SHARED);
    if ret != 0 {
        libc::pthread_rwlockattr_destroy(&mut lock_attr);
        return Err(io::Error::from_raw_os_error(ret));
    }
    let ret = libc::pthread_rwlock_init(rwlock_ptr as *mut libc::pthread_rwlock_t, &lock_attr);
    libc::pthread_rwlockattr_destroy(&mut lock_attr);
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }

    let mut mutex_attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let ret = libc::pthread_mutexattr_init(&mut mutex_attr);
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    let ret = libc::pthread_mutexattr_setpshared(&mut mutex_attr, libc::PTHREAD_PROCESS_SHARED);
    if ret != 0 {
        libc::pthread_mutexattr_destroy(&mut mutex_attr);
        return Err(io::Error::from_raw_os_error(ret));
    }
    let ret = libc::pthread_mutex_init(mutex_ptr as *mut libc::pthread_mutex_t, &mutex_attr);
    libc::pthread_mutexattr_destroy(&mut mutex_attr);
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }

    Ok(())
}

/// A handle to the region's locks. Cheap to construct; holds no state beyond
/// the in-region addresses and the backing file descriptor.
pub struct RegionLock {
    rwlock: *mut libc::pthread_rwlock_t,
    mutex: *mut libc::pthread_mutex_t,
    fd: RawFd,
    use_flock: bool,
}

unsafe impl Send for RegionLock {}
unsafe impl Sync for RegionLock {}

impl RegionLock {
    /// Attach to the already-initialised locks of a mapped region.
    ///
    /// # Safety
    /// `rwlock_ptr` and `mutex_ptr` must point at lock storage initialised
    /// by [`init`]; `fd` must be the region's open file descriptor.
    pub unsafe fn attach(
        rwlock_ptr: *mut u8,
        mutex_ptr: *mut u8,
        fd: RawFd,
        use_flock: bool,
    ) -> Self {
        RegionLock {
            rwlock: rwlock_ptr as *mut libc::pthread_rwlock_t,
            mutex: mutex_ptr as *mut libc::pthread_mutex_t,
            fd,
            use_flock,
        }
    }

    fn fcntl_lock(&self, kind: libc::c_short) {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = kind;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 0;

        let ret = unsafe { libc::fcntl(self.fd, libc::F_SETLKW, &fl) };
        debug_assert_eq!(ret, 0, "fcntl(F_SETLKW) failed");
    }

    /// Acquire the read side. Blocks until available.
    pub fn rdlock(&self) {
        if self.use_flock {
            self.fcntl_lock(libc::F_RDLCK as libc::c_short);
        } else {
            let ret = unsafe { libc::pthread_rwlock_rdlock(self.rwlock) };
            debug_assert_eq!(ret, 0, "pthread_rwlock_rdlock failed: {ret}");
        }
    }

    /// Acquire the write side. Blocks until available.
    pub fn wrlock(&self) {
        if self.use_flock {
            self.fcntl_lock(libc::F_WRLCK as libc::c_short);
        } else {
            let ret = unsafe { libc::pthread_rwlock_wrlock(self.rwlock) };
            debug_assert_eq!(ret, 0, "pthread_rwlock_wrlock failed: {ret}");
        }
    }

    /// Release whichever side is held.
    pub fn unlock(&self) {
        if self.use_flock {
            self.fcntl_lock(libc::F_UNLCK as libc::c_short);
        } else {
            let ret = unsafe { libc::pthread_rwlock_unlock(self.rwlock) };
            debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
        }
    }

    /// Acquire the LRU relink mutex. Held around every LRU pointer mutation,
    /// by readers and writers alike.
    pub fn lru_lock(&self) {
        let ret = unsafe { libc::pthread_mutex_lock(self.mutex) };
        debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
    }

    pub fn lru_unlock(&self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
    }
}

// The locks are never destroyed: they live in the shared region and must
// remain valid for every other attached process.
