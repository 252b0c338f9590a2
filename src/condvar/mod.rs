//! # Condition variable
//!
//! The condvar's interface is the wait method that unlocks a lock, waits for a signal then locks it back.
//! Unlike a futex-based one, this condvar keeps an explicit FIFO of waiters, so:
//! - [ConditionVariable::signal] wakes everybody waiting right now ("broadcast") and says how many
//! - [ConditionVariable::signal_count] wakes at most `n`, oldest first
//! - there are no spurious wake-ups: a waiter returns once its registration is finished
//!
//! It works with any lock flavour of this crate through [CondVarLock], plus any `parking_lot` mutex
//! through [ConditionVariable::wait_by_lock].
//!
//! ## Not losing signals
//!
//! The waiter is put on the list *before* the caller's lock is released. A signaller that got the
//! caller's lock after that release can only find the waiter on the list.
//!
//! ## Termination
//!
//! A wait is a cancellation point. If the waiting thread gets terminated, its hazard takes it off the
//! list under the list lock, exactly the way a signal would. The wait then returns
//! [SyncError::Terminated] *without* re-acquiring the caller's lock.

use std::{cell::UnsafeCell, sync::Arc};

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::{
    error::SyncError,
    executive::Executive,
    reentrant::{
        restore_all, Context, HeldLock, ReentrantReadWriteLock, ThreadReentrantReadWriteLock,
    },
    rwlock::StandardReadWriteLock,
    spin_lock::SpinLock,
    thread::{self, Hazard, Registration, ThreadHandle, WaitOutcome},
    wait_list::WaitList,
};

/// A lock that can be given up for the duration of a condition variable wait.
pub trait CondVarLock {
    /// What's needed to take the lock back.
    type Token;

    /// Gives the lock up. The calling thread must hold it.
    fn release(&self) -> Self::Token;

    fn reacquire(&self, token: Self::Token) -> Result<(), SyncError>;
}

impl CondVarLock for SpinLock {
    type Token = ();

    fn release(&self) {
        self.unlock();
    }

    fn reacquire(&self, _: ()) -> Result<(), SyncError> {
        self.lock();
        Ok(())
    }
}

/// Waits holding the write lock.
impl CondVarLock for StandardReadWriteLock {
    type Token = ();

    fn release(&self) {
        self.leave_write();
    }

    fn reacquire(&self, _: ()) -> Result<(), SyncError> {
        self.enter_write();
        Ok(())
    }
}

/// The reentrant locks a context gave up, with their counts.
pub struct ReleasedLocks(Vec<HeldLock>);

impl ReleasedLocks {
    fn restore(self, ctx: &Context) -> Result<(), SyncError> {
        restore_all(&self.0, ctx)
    }
}

/// Gives up every lock the context holds, all counts, and restores them after the wait.
impl CondVarLock for Context {
    type Token = ReleasedLocks;

    fn release(&self) -> ReleasedLocks {
        ReleasedLocks(self.release_all_for_wait())
    }

    fn reacquire(&self, token: ReleasedLocks) -> Result<(), SyncError> {
        token.restore(self)
    }
}

/// Gives up a single lock, all counts the context has on it.
impl CondVarLock for (&ReentrantReadWriteLock, &Context) {
    type Token = ReleasedLocks;

    fn release(&self) -> ReleasedLocks {
        let (lock, ctx) = *self;
        ReleasedLocks(vec![lock.shared().release_for_wait(ctx)])
    }

    fn reacquire(&self, token: ReleasedLocks) -> Result<(), SyncError> {
        token.restore(self.1)
    }
}

impl CondVarLock for ThreadReentrantReadWriteLock {
    type Token = ReleasedLocks;

    fn release(&self) -> ReleasedLocks {
        let thread = thread::current();
        ReleasedLocks(vec![self
            .as_reentrant()
            .shared()
            .release_for_wait(thread.context())])
    }

    fn reacquire(&self, token: ReleasedLocks) -> Result<(), SyncError> {
        token.restore(thread::current().context())
    }
}

struct CondWaiter {
    thread: ThreadHandle,
    reg: Arc<Registration>,
}

struct CondVarShared {
    lock_atomic_calls: StandardReadWriteLock,
    // only touched with lock_atomic_calls held for writing
    waiters: UnsafeCell<WaitList<CondWaiter>>,
}
// UnsafeCell makes it !Sync => the list lock makes up for it
unsafe impl Sync for CondVarShared {}

impl CondVarShared {
    fn with_waiters<R>(&self, f: impl FnOnce(&mut WaitList<CondWaiter>) -> R) -> R {
        self.lock_atomic_calls.enter_write();
        // SAFETY: the write lock is held => nobody else has a reference to the list
        let result = f(unsafe { &mut *self.waiters.get() });
        self.lock_atomic_calls.leave_write();
        result
    }

    fn unregister(&self, reg: &Registration, outcome: WaitOutcome) {
        self.with_waiters(|waiters| {
            // a signal may have come first
            if !reg.is_waiting() {
                return;
            }
            if let Some(waiter) = waiters.remove(reg.slot()) {
                reg.finish(outcome);
                waiter.thread.event().set(false);
            }
        });
    }
}

struct CondVarHazard {
    shared: Arc<CondVarShared>,
    reg: Arc<Registration>,
}

impl Hazard for CondVarHazard {
    fn terminate_hazard(&self) {
        self.shared.unregister(&self.reg, WaitOutcome::Terminated);
    }
}

pub struct ConditionVariable {
    shared: Arc<CondVarShared>,
    executive: Executive,
}

impl ConditionVariable {
    pub(crate) fn new(executive: Executive) -> Self {
        Self {
            shared: Arc::new(CondVarShared {
                lock_atomic_calls: StandardReadWriteLock::new(),
                waiters: UnsafeCell::new(WaitList::new()),
            }),
            executive,
        }
    }

    /// Releases `lock`, waits for a signal, takes `lock` back.
    pub fn wait<L: CondVarLock>(&self, lock: &L) -> Result<(), SyncError> {
        let (_, token) = self.block_on(|| lock.release(), None)?;
        lock.reacquire(token)
    }

    /// [ConditionVariable::wait] that gives up after `ms`. `lock` is taken back in both cases,
    /// `false` means no signal arrived.
    pub fn wait_timed<L: CondVarLock>(&self, lock: &L, ms: u64) -> Result<bool, SyncError> {
        let (signalled, token) = self.block_on(|| lock.release(), Some(ms))?;
        lock.reacquire(token)?;
        Ok(signalled)
    }

    /// Waits with a caller-owned mutex.
    pub fn wait_by_lock<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>, SyncError> {
        let mutex = MutexGuard::mutex(&guard);
        self.block_on(move || drop(guard), None)?;
        Ok(mutex.lock())
    }

    /// Wakes everyone waiting right now, returns how many that was.
    pub fn signal(&self) -> usize {
        self.signal_count(usize::MAX)
    }

    /// Wakes at most `count` waiters in the order they started waiting.
    pub fn signal_count(&self, count: usize) -> usize {
        let woken = self.shared.with_waiters(|waiters| {
            let mut woken = 0;
            while woken < count {
                let Some(waiter) = waiters.pop_front() else {
                    break;
                };
                waiter.reg.finish(WaitOutcome::Granted);
                waiter.thread.event().set(false);
                woken += 1;
            }
            woken
        });
        if woken > 0 && self.executive.config().trace_waits {
            trace!(woken, "signalled condition variable");
        }
        woken
    }

    pub fn waiting_count(&self) -> usize {
        self.shared.with_waiters(|waiters| waiters.len())
    }

    /// Registers the calling thread, calls `release`, sleeps. Returns `true` if signalled, `false` on timeout.
    /// On termination, the token of `release` is dropped.
    fn block_on<T>(
        &self,
        release: impl FnOnce() -> T,
        timeout_ms: Option<u64>,
    ) -> Result<(bool, T), SyncError> {
        let thread = thread::current();
        thread.check_termination()?;

        let reg = Arc::new(Registration::new());
        self.shared.with_waiters(|waiters| {
            let slot = waiters.try_push_back(CondWaiter {
                thread: thread.clone(),
                reg: reg.clone(),
            })?;
            reg.set_slot(slot);
            // before the caller's lock is released => a signal can't get in-between
            thread.event().set(true);
            Ok::<_, SyncError>(())
        })?;
        let token = release();
        self.executive.counters().record_contended_wait();
        if self.executive.config().trace_waits {
            trace!(thread = thread.id(), "waiting on condition variable");
        }

        let hazard: Arc<dyn Hazard> = Arc::new(CondVarHazard {
            shared: self.shared.clone(),
            reg: reg.clone(),
        });
        if !thread.block(&reg, hazard, timeout_ms) {
            self.shared.unregister(&reg, WaitOutcome::TimedOut);
        }

        match reg.outcome() {
            WaitOutcome::Granted => Ok((true, token)),
            WaitOutcome::TimedOut => {
                self.executive.counters().record_timeout();
                debug!(thread = thread.id(), "timed out waiting on condition variable");
                Ok((false, token))
            }
            WaitOutcome::Terminated => {
                self.executive.counters().record_termination();
                debug!(
                    thread = thread.id(),
                    "terminated while waiting on condition variable"
                );
                Err(SyncError::Terminated)
            }
            WaitOutcome::Waiting => unreachable!("woken up while still on the list"),
        }
    }
}

impl Drop for ConditionVariable {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.waiting_count(),
            0,
            "dropping a condition variable somebody waits on"
        );
    }
}

pub fn run(executive: &Executive) -> Result<(), SyncError> {
    let cond = executive.create_condition_variable();
    let queue = parking_lot::Mutex::new(Vec::new());
    std::thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut guard = queue.lock();
            while guard.is_empty() {
                guard = cond.wait_by_lock(guard)?;
            }
            Ok::<_, SyncError>(guard.pop())
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.lock().push("hello");
        let woken = cond.signal();
        println!("woke {woken} consumer(s)");
        match consumer.join() {
            Ok(received) => println!("consumer got {:?}", received?),
            Err(_) => println!("consumer panicked"),
        }
        Ok(())
    })
}
