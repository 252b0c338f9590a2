//! # Standard read-write lock
//!
//! The portable one. It's list-based and fair:
//! - a reader gets in right away only if no writer holds the lock and nobody is queued
//! - a writer gets in right away only if the lock is completely free and nobody is queued
//! - everybody else is appended to the queue and sleeps on its own [WaiterEvent](crate::thread::WaiterEvent)
//!
//! Unlocking hands the lock over to the head of the queue: either all the readers at the front,
//! or a single writer. It stops as soon as the queued kind changes, so reader and writer "batches"
//! take turns in arrival order and a queued writer can't be starved by fresh readers.
//!
//! The hand-over happens under the lock's spin lock: the releaser bumps the counters on behalf of the
//! woken thread. A woken thread doesn't need to re-check anything.
//!
//! The waits here aren't cancellation points. The lock guards bookkeeping of the other primitives
//! and must never be abandoned half way.

use std::sync::Arc;

use crate::{
    spin_lock::SpinCell,
    thread::{self, Registration, ThreadHandle, WaitOutcome},
    wait_list::WaitList,
};

use super::{LockMode, RwLockBackend, RwLockBackendKind};

struct Waiter {
    thread: ThreadHandle,
    mode: LockMode,
    reg: Arc<Registration>,
}

struct StandardState {
    num_readers: u32,
    has_writer: bool,
    waiting: WaitList<Waiter>,
}

impl StandardState {
    fn can_enter_now(&self, mode: LockMode) -> bool {
        // an empty queue is what keeps fresh readers from overtaking a queued writer
        match mode {
            LockMode::Reader => !self.has_writer && self.waiting.is_empty(),
            LockMode::Writer => {
                !self.has_writer && self.num_readers == 0 && self.waiting.is_empty()
            }
        }
    }

    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Reader => self.num_readers += 1,
            LockMode::Writer => self.has_writer = true,
        }
        debug_assert!(!(self.has_writer && self.num_readers > 0));
    }

    fn release_available_waiters(&mut self) {
        while let Some(idx) = self.waiting.front() {
            let Some(waiter) = self.waiting.get(idx) else {
                break;
            };
            let mode = waiter.mode;
            let fits = match mode {
                LockMode::Reader => !self.has_writer,
                LockMode::Writer => !self.has_writer && self.num_readers == 0,
            };
            if !fits {
                break;
            }
            if let Some(waiter) = self.waiting.remove(idx) {
                self.grant(mode);
                waiter.reg.finish(WaitOutcome::Granted);
                waiter.thread.event().set(false);
            }
            // a writer is a batch of its own
            if mode == LockMode::Writer {
                break;
            }
        }
    }
}

/// Point-in-time view of a [StandardReadWriteLock], for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandardSnapshot {
    pub readers: u32,
    pub has_writer: bool,
    pub waiting_readers: usize,
    pub waiting_writers: usize,
}

pub struct StandardReadWriteLock {
    state: SpinCell<StandardState>,
}

impl StandardReadWriteLock {
    pub const fn new() -> Self {
        Self {
            state: SpinCell::new(StandardState {
                num_readers: 0,
                has_writer: false,
                waiting: WaitList::new(),
            }),
        }
    }

    pub fn enter_read(&self) {
        self.enter(LockMode::Reader, None);
    }

    pub fn leave_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.num_readers > 0, "leaving a read lock that isn't held");
        state.num_readers -= 1;
        if state.num_readers == 0 {
            state.release_available_waiters();
        }
    }

    pub fn enter_write(&self) {
        self.enter(LockMode::Writer, None);
    }

    pub fn leave_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.has_writer, "leaving a write lock that isn't held");
        state.has_writer = false;
        state.release_available_waiters();
    }

    pub fn try_enter_read(&self) -> bool {
        self.try_enter(LockMode::Reader)
    }

    pub fn try_enter_write(&self) -> bool {
        self.try_enter(LockMode::Writer)
    }

    pub fn try_timed_enter_read(&self, ms: u64) -> bool {
        self.enter(LockMode::Reader, Some(ms))
    }

    pub fn try_timed_enter_write(&self, ms: u64) -> bool {
        self.enter(LockMode::Writer, Some(ms))
    }

    pub fn snapshot(&self) -> StandardSnapshot {
        let state = self.state.lock();
        let waiting_writers = state
            .waiting
            .iter()
            .filter(|(_, w)| w.mode == LockMode::Writer)
            .count();
        StandardSnapshot {
            readers: state.num_readers,
            has_writer: state.has_writer,
            waiting_readers: state.waiting.len() - waiting_writers,
            waiting_writers,
        }
    }

    fn try_enter(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        if state.can_enter_now(mode) {
            state.grant(mode);
            true
        } else {
            false
        }
    }

    fn enter(&self, mode: LockMode, timeout_ms: Option<u64>) -> bool {
        let mut state = self.state.lock();
        if state.can_enter_now(mode) {
            state.grant(mode);
            return true;
        }

        let thread = thread::current();
        let reg = Arc::new(Registration::new());
        let slot = state.waiting.push_back(Waiter {
            thread: thread.clone(),
            mode,
            reg: reg.clone(),
        });
        reg.set_slot(slot);
        // still under the spin lock => a release can't slip in before we're marked as waiting
        thread.event().set(true);
        drop(state);

        if !thread.park(&reg, timeout_ms) {
            let mut state = self.state.lock();
            // the registration decides, not the event: a release may have come in right after the timeout
            if reg.is_waiting() {
                state.waiting.remove(reg.slot());
                reg.finish(WaitOutcome::TimedOut);
                thread.event().set(false);
                // a writer leaving the queue may let the readers behind it through
                state.release_available_waiters();
                return false;
            }
            // granted, and holding the spin lock means the releaser is out of it
            return true;
        }

        // the releaser may still be inside its critical section
        self.state.fence();
        true
    }
}

impl Default for StandardReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StandardReadWriteLock {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug_assert!(
            state.num_readers == 0 && !state.has_writer && state.waiting.is_empty(),
            "dropping a read-write lock that is still in use"
        );
    }
}

impl RwLockBackend for StandardReadWriteLock {
    fn kind(&self) -> RwLockBackendKind {
        RwLockBackendKind::Standard
    }

    fn enter_read(&self) {
        StandardReadWriteLock::enter_read(self);
    }

    unsafe fn leave_read(&self) {
        StandardReadWriteLock::leave_read(self);
    }

    fn enter_write(&self) {
        StandardReadWriteLock::enter_write(self);
    }

    unsafe fn leave_write(&self) {
        StandardReadWriteLock::leave_write(self);
    }

    fn try_enter_read(&self) -> bool {
        StandardReadWriteLock::try_enter_read(self)
    }

    fn try_enter_write(&self) -> bool {
        StandardReadWriteLock::try_enter_write(self)
    }

    fn try_timed_enter_read(&self, ms: u64) -> bool {
        StandardReadWriteLock::try_timed_enter_read(self, ms)
    }

    fn try_timed_enter_write(&self, ms: u64) -> bool {
        StandardReadWriteLock::try_timed_enter_write(self, ms)
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering::SeqCst},
            Mutex,
        },
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    fn wait_for(lock: &StandardReadWriteLock, pred: impl Fn(StandardSnapshot) -> bool) {
        while !pred(lock.snapshot()) {
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_readers_share_writers_exclude() {
        let lock = StandardReadWriteLock::new();
        assert!(lock.try_enter_read());
        assert!(lock.try_enter_read());
        assert!(!lock.try_enter_write());
        lock.leave_read();
        lock.leave_read();
        assert!(lock.try_enter_write());
        assert!(!lock.try_enter_read());
        lock.leave_write();
        assert_eq!(lock.snapshot(), StandardSnapshot::default());
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = StandardReadWriteLock::new();
        let writers_inside = AtomicU32::new(0);
        let readers_inside = AtomicU32::new(0);
        scope(|s| {
            for i in 0..6 {
                let (lock, writers_inside, readers_inside) = (&lock, &writers_inside, &readers_inside);
                s.spawn(move || {
                    for _ in 0..300 {
                        if i % 2 == 0 {
                            lock.enter_write();
                            assert_eq!(writers_inside.fetch_add(1, SeqCst), 0);
                            assert_eq!(readers_inside.load(SeqCst), 0);
                            writers_inside.fetch_sub(1, SeqCst);
                            lock.leave_write();
                        } else {
                            lock.enter_read();
                            readers_inside.fetch_add(1, SeqCst);
                            assert_eq!(writers_inside.load(SeqCst), 0);
                            readers_inside.fetch_sub(1, SeqCst);
                            lock.leave_read();
                        }
                    }
                });
            }
        });
        assert_eq!(lock.snapshot(), StandardSnapshot::default());
    }

    #[test]
    fn test_queued_writer_goes_before_later_reader() {
        let lock = StandardReadWriteLock::new();
        let order = Mutex::new(Vec::new());
        lock.enter_write();
        scope(|s| {
            s.spawn(|| {
                lock.enter_write();
                order.lock().unwrap().push("writer");
                lock.leave_write();
            });
            wait_for(&lock, |snap| snap.waiting_writers == 1);
            s.spawn(|| {
                lock.enter_read();
                order.lock().unwrap().push("reader");
                lock.leave_read();
            });
            wait_for(&lock, |snap| snap.waiting_readers == 1);
            lock.leave_write();
        });
        assert_eq!(*order.lock().unwrap(), ["writer", "reader"]);
    }

    #[test]
    fn test_reader_batch_is_released_together() {
        let lock = StandardReadWriteLock::new();
        let inside = AtomicU32::new(0);
        let max_inside = AtomicU32::new(0);
        lock.enter_write();
        scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    lock.enter_read();
                    let now = inside.fetch_add(1, SeqCst) + 1;
                    max_inside.fetch_max(now, SeqCst);
                    sleep(Duration::from_millis(50));
                    inside.fetch_sub(1, SeqCst);
                    lock.leave_read();
                });
            }
            wait_for(&lock, |snap| snap.waiting_readers == 3);
            lock.leave_write();
        });
        assert_eq!(max_inside.load(SeqCst), 3);
    }

    #[test]
    fn test_timed_enter_gives_up_and_unregisters() {
        let lock = StandardReadWriteLock::new();
        scope(|s| {
            lock.enter_read();
            let h = s.spawn(|| lock.try_timed_enter_write(50));
            assert!(!h.join().unwrap());
            // no leftover registration
            assert_eq!(lock.snapshot().waiting_writers, 0);
            lock.leave_read();
        });
        assert!(lock.try_timed_enter_write(50));
        lock.leave_write();
    }

    #[test]
    fn test_timed_out_writer_lets_readers_behind_it_in() {
        let lock = StandardReadWriteLock::new();
        lock.enter_read();
        scope(|s| {
            let writer = s.spawn(|| lock.try_timed_enter_write(100));
            wait_for(&lock, |snap| snap.waiting_writers == 1);
            let reader = s.spawn(|| {
                lock.enter_read();
                lock.leave_read();
            });
            assert!(!writer.join().unwrap());
            reader.join().unwrap();
        });
        lock.leave_read();
        assert_eq!(lock.snapshot(), StandardSnapshot::default());
    }
}
