//! # Read-write locks
//! Two ways of locking:
//! - exclusive / write - a single holder
//! - shared / read - any number of holders, but no writer at the same time
//!
//! There are two implementations behind the [RwLockBackend] trait:
//! - [StandardReadWriteLock] - portable, fair, list-based; always available and the default
//! - [NativeReadWriteLock] - a thin layer over `parking_lot`'s raw lock
//!
//! [ReadWriteLock] is what the [Executive] hands out: the backend is picked once from its config.
//! Internally (condition variables, auxiliary locks) only the standard one is used.

mod p1_standard;
mod p2_native;

pub use p1_standard::{StandardReadWriteLock, StandardSnapshot};
pub use p2_native::NativeReadWriteLock;

use strum_macros::{Display, EnumIter, EnumString};

use crate::executive::Executive;

/// Which way a lock is taken.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum LockMode {
    Reader,
    Writer,
}

#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq, Default)]
#[strum(serialize_all = "snake_case")]
pub enum RwLockBackendKind {
    #[default]
    Standard,
    Native,
}

pub trait RwLockBackend: Send + Sync {
    fn kind(&self) -> RwLockBackendKind;

    fn enter_read(&self);

    /// # Safety
    /// The calling thread must hold a read lock taken through this backend.
    unsafe fn leave_read(&self);

    fn enter_write(&self);

    /// # Safety
    /// The calling thread must hold the write lock taken through this backend.
    unsafe fn leave_write(&self);

    fn try_enter_read(&self) -> bool;

    fn try_enter_write(&self) -> bool;

    fn try_timed_enter_read(&self, ms: u64) -> bool;

    fn try_timed_enter_write(&self, ms: u64) -> bool;
}

impl RwLockBackendKind {
    pub fn create(self) -> Box<dyn RwLockBackend> {
        match self {
            RwLockBackendKind::Standard => Box::new(StandardReadWriteLock::new()),
            RwLockBackendKind::Native => Box::new(NativeReadWriteLock::new()),
        }
    }
}

/// A read-write lock with the backend chosen by the [Executive] that created it.
pub struct ReadWriteLock {
    backend: Box<dyn RwLockBackend>,
    executive: Executive,
}

impl ReadWriteLock {
    pub(crate) fn new(executive: Executive) -> Self {
        Self {
            backend: executive.config().rwlock_backend.create(),
            executive,
        }
    }

    pub fn backend_kind(&self) -> RwLockBackendKind {
        self.backend.kind()
    }

    pub fn enter_read(&self) {
        self.backend.enter_read();
    }

    /// # Safety
    /// The calling thread must hold a read lock on `self`.
    pub unsafe fn leave_read(&self) {
        // SAFETY: forwarded contract
        unsafe { self.backend.leave_read() }
    }

    pub fn enter_write(&self) {
        self.backend.enter_write();
    }

    /// # Safety
    /// The calling thread must hold the write lock on `self`.
    pub unsafe fn leave_write(&self) {
        // SAFETY: forwarded contract
        unsafe { self.backend.leave_write() }
    }

    pub fn try_enter_read(&self) -> bool {
        self.backend.try_enter_read()
    }

    pub fn try_enter_write(&self) -> bool {
        self.backend.try_enter_write()
    }

    pub fn try_timed_enter_read(&self, ms: u64) -> bool {
        let entered = self.backend.try_timed_enter_read(ms);
        if !entered {
            self.executive.counters().record_timeout();
        }
        entered
    }

    pub fn try_timed_enter_write(&self, ms: u64) -> bool {
        let entered = self.backend.try_timed_enter_write(ms);
        if !entered {
            self.executive.counters().record_timeout();
        }
        entered
    }
}

pub fn run(executive: &Executive) {
    let lock = executive.create_read_write_lock();
    let value = std::sync::atomic::AtomicU32::new(0);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                lock.enter_write();
                value.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                // SAFETY: taken right above
                unsafe { lock.leave_write() };
            });
        }
    });
    lock.enter_read();
    println!(
        "{} backend: value is {}",
        lock.backend_kind(),
        value.load(std::sync::atomic::Ordering::Relaxed)
    );
    // SAFETY: taken right above
    unsafe { lock.leave_read() };
}
