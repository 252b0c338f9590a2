//! # Thread-bound reentrant lock
//! The same lock, but the context is always the calling thread's own one.

use crate::{error::SyncError, executive::Executive, thread};

use super::{LockCounts, ReentrantReadWriteLock, ReentrantSnapshot};

pub struct ThreadReentrantReadWriteLock {
    lock: ReentrantReadWriteLock,
}

impl ThreadReentrantReadWriteLock {
    pub(crate) fn new(executive: Executive) -> Self {
        Self {
            lock: ReentrantReadWriteLock::new(executive),
        }
    }

    pub fn as_reentrant(&self) -> &ReentrantReadWriteLock {
        &self.lock
    }

    pub fn enter_read(&self) -> Result<(), SyncError> {
        self.lock.enter_read(thread::current().context())
    }

    pub fn leave_read(&self) {
        self.lock.leave_read(thread::current().context());
    }

    pub fn enter_write(&self) -> Result<(), SyncError> {
        self.lock.enter_write(thread::current().context())
    }

    pub fn leave_write(&self) {
        self.lock.leave_write(thread::current().context());
    }

    pub fn try_enter_read(&self) -> Result<bool, SyncError> {
        self.lock.try_enter_read(thread::current().context())
    }

    pub fn try_enter_write(&self) -> Result<bool, SyncError> {
        self.lock.try_enter_write(thread::current().context())
    }

    pub fn try_timed_enter_read(&self, ms: u64) -> Result<bool, SyncError> {
        self.lock
            .try_timed_enter_read(thread::current().context(), ms)
    }

    pub fn try_timed_enter_write(&self, ms: u64) -> Result<bool, SyncError> {
        self.lock
            .try_timed_enter_write(thread::current().context(), ms)
    }

    /// What the calling thread holds on this lock.
    pub fn held_by_current_thread(&self) -> LockCounts {
        thread::current().context().counts_for(&self.lock)
    }

    pub fn snapshot(&self) -> ReentrantSnapshot {
        self.lock.snapshot()
    }
}
