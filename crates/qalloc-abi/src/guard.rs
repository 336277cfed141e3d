//! Futex-backed raw mutex guarding the process heap.
//!
//! The lock word uses the usual three states: 0 unlocked, 1 locked with no
//! waiters, 2 locked with possible waiters. Neither path allocates, so the
//! lock can sit underneath `malloc` itself.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::lock_api::{GuardNoSend, RawMutex};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

#[cfg(target_os = "linux")]
fn futex_wait_private(word: &AtomicU32, expected: u32) {
    // SAFETY: Linux futex syscall with a valid userspace address and a null
    // timeout. Spurious wakeups and EINTR are handled by the caller's loop.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_private(word: &AtomicU32, count: i32) {
    // SAFETY: Linux futex syscall with a valid userspace address.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        );
    }
}

/// Non-recursive mutex with no allocation on any path.
pub struct FutexMutex {
    state: AtomicU32,
}

impl FutexMutex {
    #[cold]
    fn lock_contended(&self) {
        loop {
            // Announce a waiter; if the holder released in between we now own it.
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }

            #[cfg(target_os = "linux")]
            futex_wait_private(&self.state, CONTENDED);

            #[cfg(not(target_os = "linux"))]
            std::thread::yield_now();
        }
    }
}

unsafe impl RawMutex for FutexMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicU32::new(UNLOCKED),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
    }

    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            #[cfg(target_os = "linux")]
            futex_wake_private(&self.state, 1);
        }
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::lock_api::Mutex;

    #[test]
    fn try_lock_fails_while_held() {
        let mutex: Mutex<FutexMutex, ()> = Mutex::new(());
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let counter: Mutex<FutexMutex, u64> = Mutex::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*counter.lock(), 80_000);
        assert!(!counter.is_locked());
    }
}
