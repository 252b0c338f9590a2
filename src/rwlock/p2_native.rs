//! # Native read-write lock
//!
//! The "fast path" backend. Instead of an OS-specific lock it wraps `parking_lot`'s raw lock,
//! which gives us the same guarantees the standard one has minus the strict FIFO batching.
//!
//! The raw lock has no idea who holds it, so unbalanced leaves are UB => the trait's `leave_*` are unsafe.

use std::time::Duration;

use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockTimed};

use super::{RwLockBackend, RwLockBackendKind};

pub struct NativeReadWriteLock {
    raw: parking_lot::RawRwLock,
}

impl NativeReadWriteLock {
    pub const fn new() -> Self {
        Self {
            raw: <parking_lot::RawRwLock as RawRwLockApi>::INIT,
        }
    }
}

impl Default for NativeReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLockBackend for NativeReadWriteLock {
    fn kind(&self) -> RwLockBackendKind {
        RwLockBackendKind::Native
    }

    fn enter_read(&self) {
        self.raw.lock_shared();
    }

    unsafe fn leave_read(&self) {
        // SAFETY: the caller holds a shared lock, as by the trait's contract
        unsafe { self.raw.unlock_shared() }
    }

    fn enter_write(&self) {
        self.raw.lock_exclusive();
    }

    unsafe fn leave_write(&self) {
        // SAFETY: the caller holds the exclusive lock, as by the trait's contract
        unsafe { self.raw.unlock_exclusive() }
    }

    fn try_enter_read(&self) -> bool {
        self.raw.try_lock_shared()
    }

    fn try_enter_write(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    fn try_timed_enter_read(&self, ms: u64) -> bool {
        self.raw.try_lock_shared_for(Duration::from_millis(ms))
    }

    fn try_timed_enter_write(&self, ms: u64) -> bool {
        self.raw.try_lock_exclusive_for(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod test {
    use std::thread::scope;

    use super::*;

    #[test]
    fn test_native_backend_excludes_writers() {
        let lock = NativeReadWriteLock::new();
        lock.enter_read();
        assert!(lock.try_enter_read());
        assert!(!lock.try_enter_write());
        scope(|s| {
            assert!(!s.spawn(|| lock.try_timed_enter_write(30)).join().unwrap());
        });
        // SAFETY: both read locks are held by this thread
        unsafe {
            lock.leave_read();
            lock.leave_read();
        }
        assert!(lock.try_timed_enter_write(30));
        // SAFETY: the write lock was just taken
        unsafe { lock.leave_write() };
    }
}
