//! Cross-process wake-up primitive.
//!
//! A process-shared pthread mutex and condition variable plus a generation counter. Producers bump
//! the generation and broadcast; consumers wait for a generation newer than the last one they saw,
//! so a notify that lands between two waits is never lost.
#![allow(unsafe_code)]

use crate::foundation::error::{StreamError, StreamResult};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const READY: u32 = 0x5349_474e;

/// Outcome of [`SharedSignal::wait_newer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A newer generation was observed.
    Signaled(u64),
    TimedOut,
}

#[repr(C)]
pub struct SharedSignal {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    generation: AtomicU64,
    state: AtomicU32,
}

// SAFETY: the pthread objects are initialised process-shared and only touched through the pthread
// API, which provides its own synchronization.
unsafe impl Sync for SharedSignal {}
unsafe impl Send for SharedSignal {}
// SAFETY: repr(C), no pointers, all-zero is the "not initialised" state checked by `ensure_ready`.
unsafe impl crate::shm::arena::ArenaValue for SharedSignal {}

/// Holds the signal's mutex; unlocks on drop.
pub struct SignalGuard<'a> {
    signal: &'a SharedSignal,
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard only exists while this thread holds the mutex.
        unsafe { libc::pthread_mutex_unlock(self.signal.mutex.get()) };
    }
}

fn check(rc: libc::c_int, what: &str) -> StreamResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(StreamError::shm(format!(
            "{what} failed: {}",
            std::io::Error::from_raw_os_error(rc)
        )))
    }
}

/// Owner-death recovery, so a peer dying with the mutex held cannot wedge this process.
#[cfg(target_os = "linux")]
fn set_robust(attr: *mut libc::pthread_mutexattr_t) -> libc::c_int {
    // SAFETY: `attr` points to an initialised attribute object.
    unsafe { libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST) }
}

#[cfg(not(target_os = "linux"))]
fn set_robust(_attr: *mut libc::pthread_mutexattr_t) -> libc::c_int {
    0
}

/// Turn `EOWNERDEAD` from a lock or wait into success once the mutex is marked consistent.
#[cfg(target_os = "linux")]
fn recover(rc: libc::c_int, mutex: *mut libc::pthread_mutex_t) -> libc::c_int {
    if rc != libc::EOWNERDEAD {
        return rc;
    }
    tracing::warn!("shared signal mutex owner died, recovering");
    // SAFETY: EOWNERDEAD means this thread now holds the mutex.
    unsafe { libc::pthread_mutex_consistent(mutex) }
}

#[cfg(not(target_os = "linux"))]
fn recover(rc: libc::c_int, _mutex: *mut libc::pthread_mutex_t) -> libc::c_int {
    rc
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let total_nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as i64)
        .saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2))
        .saturating_add(total_nsec / 1_000_000_000);
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: (total_nsec % 1_000_000_000) as _,
    }
}

impl SharedSignal {
    /// Initialise the primitive in place as process-shared. Must run once, by the creator, before
    /// any other process maps the object.
    pub fn init(&self) -> StreamResult<()> {
        // SAFETY: attribute objects are stack-local and destroyed before return; the mutex and
        // condition storage is owned by this signal.
        unsafe {
            let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut mattr), "pthread_mutexattr_init")?;
            let mut rc =
                libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                rc = set_robust(&mut mattr);
            }
            let rc = if rc == 0 {
                libc::pthread_mutex_init(self.mutex.get(), &mattr)
            } else {
                rc
            };
            libc::pthread_mutexattr_destroy(&mut mattr);
            check(rc, "pthread_mutex_init")?;

            let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
            check(libc::pthread_condattr_init(&mut cattr), "pthread_condattr_init")?;
            let rc = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
            let rc = if rc == 0 {
                libc::pthread_cond_init(self.cond.get(), &cattr)
            } else {
                rc
            };
            libc::pthread_condattr_destroy(&mut cattr);
            check(rc, "pthread_cond_init")?;
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Forcibly re-create the primitive after its peer died, possibly while holding the mutex.
    /// The generation is kept so consumers keep their position.
    ///
    /// No thread of this process may be waiting on or holding the signal while this runs.
    pub fn reset(&self) -> StreamResult<()> {
        self.state.store(0, Ordering::Release);
        self.init()?;
        tracing::debug!(
            generation = self.generation(),
            "shared signal forcibly reset"
        );
        Ok(())
    }

    fn ensure_ready(&self) -> StreamResult<()> {
        if self.state.load(Ordering::Acquire) != READY {
            return Err(StreamError::shm("shared signal used before initialisation"));
        }
        Ok(())
    }

    pub fn lock(&self) -> StreamResult<SignalGuard<'_>> {
        self.ensure_ready()?;
        // SAFETY: initialised above.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        check(recover(rc, self.mutex.get()), "pthread_mutex_lock")?;
        Ok(SignalGuard { signal: self })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bump the generation and wake every waiter. Never blocks beyond the mutex hand-off.
    pub fn notify(&self) -> StreamResult<u64> {
        let guard = self.lock()?;
        let next = self.notify_locked(&guard);
        drop(guard);
        Ok(next)
    }

    /// Same as [`notify`](Self::notify) for a caller that already holds the lock.
    pub fn notify_locked(&self, _guard: &SignalGuard<'_>) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        // SAFETY: initialised (a guard exists).
        unsafe { libc::pthread_cond_broadcast(self.cond.get()) };
        next
    }

    /// Block until the generation exceeds `seen` or `timeout` elapses.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> StreamResult<WaitOutcome> {
        let deadline = deadline_after(timeout);
        let guard = self.lock()?;
        loop {
            let current = self.generation();
            if current > seen {
                drop(guard);
                return Ok(WaitOutcome::Signaled(current));
            }
            // SAFETY: the mutex is held via `guard` and both objects are initialised.
            let rc = unsafe {
                libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &deadline)
            };
            let rc = recover(rc, self.mutex.get());
            if rc == libc::ETIMEDOUT {
                let current = self.generation();
                drop(guard);
                return Ok(if current > seen {
                    WaitOutcome::Signaled(current)
                } else {
                    WaitOutcome::TimedOut
                });
            }
            if rc != 0 && rc != libc::EINTR {
                drop(guard);
                return check(rc, "pthread_cond_timedwait").map(|_| WaitOutcome::TimedOut);
            }
        }
    }
}
