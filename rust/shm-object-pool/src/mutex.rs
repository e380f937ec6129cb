//! A process-shared, robust `pthread_mutex_t` embedded directly in the segment.
//!
//! This is the single lock protecting the slot table and free list. It is
//! "robust": if the holder dies without unlocking, the next locker observes
//! `EOWNERDEAD` instead of blocking forever, runs recovery, and marks the
//! mutex consistent again.

use std::io;
use std::mem::MaybeUninit;

use crate::error::PoolError;

/// Wraps the platform mutex so it can live inside a `repr(C)` header.
#[repr(C)]
pub struct RawRobustMutex {
    inner: libc::pthread_mutex_t,
}

/// What happened when acquiring the lock.
pub enum LockOutcome {
    /// Acquired normally.
    Acquired,
    /// Acquired, but the previous holder died while holding it. The caller
    /// must validate shared-state invariants and call
    /// [`RawRobustMutex::mark_consistent`] before releasing, or mark the
    /// segment poisoned.
    RecoveredFromDeadOwner,
}

impl RawRobustMutex {
    /// Initialize the mutex in place as process-shared and robust.
    ///
    /// # Safety
    ///
    /// `ptr` must point at writable, properly aligned memory for the
    /// lifetime of the segment, and must not already hold an initialized
    /// mutex another thread might be using.
    pub unsafe fn init_in_place(ptr: *mut Self) -> io::Result<()> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            cvt(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let mut attr = attr.assume_init();

            let result = (|| {
                cvt(libc::pthread_mutexattr_setpshared(
                    &mut attr,
                    libc::PTHREAD_PROCESS_SHARED,
                ))?;
                cvt(libc::pthread_mutexattr_setrobust(
                    &mut attr,
                    libc::PTHREAD_MUTEX_ROBUST,
                ))?;
                cvt(libc::pthread_mutex_init(
                    std::ptr::addr_of_mut!((*ptr).inner),
                    &attr,
                ))
            })();

            libc::pthread_mutexattr_destroy(&mut attr);
            result
        }
    }

    /// Block until the lock is acquired.
    ///
    /// # Safety
    ///
    /// `self` must be a mutex previously initialized with [`Self::init_in_place`]
    /// and still mapped at the same address in this process.
    pub unsafe fn lock(&self) -> Result<LockOutcome, PoolError> {
        // SAFETY: self.inner was initialized via init_in_place and remains
        // mapped for the lifetime of the segment.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        match rc {
            0 => Ok(LockOutcome::Acquired),
            libc::EOWNERDEAD => Ok(LockOutcome::RecoveredFromDeadOwner),
            libc::ENOTRECOVERABLE => Err(PoolError::Corrupt(
                "control mutex left inconsistent by a prior unrecovered crash",
            )),
            other => Err(PoolError::Io(io::Error::from_raw_os_error(other))),
        }
    }

    /// Mark the mutex state consistent after recovering from a dead owner.
    ///
    /// # Safety
    ///
    /// Must only be called while holding the lock, after
    /// [`LockOutcome::RecoveredFromDeadOwner`] and after invariants have
    /// been validated.
    pub unsafe fn mark_consistent(&self) -> Result<(), PoolError> {
        // SAFETY: caller holds the lock.
        let rc = unsafe { libc::pthread_mutex_consistent(self.raw()) };
        if rc != 0 {
            return Err(PoolError::Io(io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must currently hold the lock.
    pub unsafe fn unlock(&self) {
        // SAFETY: caller holds the lock; pthread_mutex_unlock on a locked,
        // still-mapped mutex cannot fail in a way we need to act on.
        unsafe {
            libc::pthread_mutex_unlock(self.raw());
        }
    }

    #[inline]
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        &self.inner as *const _ as *mut _
    }
}

#[inline]
fn cvt(rc: i32) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}
