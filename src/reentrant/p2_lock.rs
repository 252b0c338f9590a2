//! # The lock
//!
//! Lock-wide counters live here, per-owner counters live in the owner's [Context].
//! Both are changed under the lock's spin lock only => a releaser can hand the lock over to a queued
//! context by bumping that context's counters itself, without touching the context's own spin lock.
//!
//! Spin lock order is always: context items -> lock state -> context waiting marker.
//!
//! ## Who may enter
//!
//! With `other_*` being the lock-wide counts minus the ones of the entering context:
//! - a reader needs `other_writers == 0`
//! - a writer needs `other_writers == 0 && other_readers == 0`
//!
//! That's the "local" check, it's what a queued context is re-tested with when the lock is released.
//! A context that isn't queued has to pass the "global" check as well: it mustn't overtake anybody.
//! A fresh reader yields to queued writers, a fresh writer yields to anybody queued.
//! A context that already holds the lock in either mode is exempt: making it queue up behind a
//! writer that waits for this very context would deadlock.
//!
//! ## Waking
//!
//! On every release the queue is walked from the front, each context re-tested with the local check
//! against the updated counters, and admitted until the first one that doesn't fit.
//! Nobody gets skipped once it's next in line, and a reader batch behind a released writer
//! gets in as a whole.

use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};

use tracing::{debug, trace};

use crate::{
    error::SyncError,
    executive::Executive,
    rwlock::LockMode,
    spin_lock::SpinCell,
    thread::{self, Hazard, Registration, ThreadHandle, WaitOutcome},
    wait_list::WaitList,
};

use super::p1_context::{Context, ContextInner, ContextLockItem, ContextWaiting, HeldLock};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WaitPolicy {
    Try,
    Block,
    Timed(u64),
}

#[derive(Clone, Copy)]
enum Scope {
    Local,
    Global,
}

pub(super) struct ContextWaiter {
    pub(super) ctx: Arc<ContextInner>,
    item: Arc<ContextLockItem>,
    mode: LockMode,
    thread: ThreadHandle,
    reg: Arc<Registration>,
}

pub(super) struct LockState {
    count_writers: u32,
    count_readers: u32,
    count_waiting_writers: u32,
    count_waiting_readers: u32,
    pub(super) waiting: WaitList<ContextWaiter>,
}

impl LockState {
    fn can_enter(&self, mode: LockMode, item: &ContextLockItem, scope: Scope) -> bool {
        let other_writers = self.count_writers - item.write();
        let other_readers = self.count_readers - item.read();
        let may_overtake = matches!(scope, Scope::Local) || !item.is_empty();
        match mode {
            LockMode::Reader => {
                other_writers == 0 && (may_overtake || self.count_waiting_writers == 0)
            }
            LockMode::Writer => {
                other_writers == 0
                    && other_readers == 0
                    && (may_overtake || self.waiting.is_empty())
            }
        }
    }

    fn grant(&mut self, mode: LockMode, item: &ContextLockItem) {
        match mode {
            LockMode::Reader => self.count_readers += 1,
            LockMode::Writer => self.count_writers += 1,
        }
        item.add(mode, 1);
    }

    pub(super) fn release(&mut self, item: &ContextLockItem, read: u32, write: u32) {
        debug_assert!(
            item.read() >= read && item.write() >= write,
            "leaving a reentrant lock more often than it was entered"
        );
        self.count_readers -= read;
        self.count_writers -= write;
        item.sub(LockMode::Reader, read);
        item.sub(LockMode::Writer, write);
    }

    fn add_waiting(&mut self, mode: LockMode) {
        match mode {
            LockMode::Reader => self.count_waiting_readers += 1,
            LockMode::Writer => self.count_waiting_writers += 1,
        }
    }

    fn sub_waiting(&mut self, mode: LockMode) {
        match mode {
            LockMode::Reader => self.count_waiting_readers -= 1,
            LockMode::Writer => self.count_waiting_writers -= 1,
        }
    }

    pub(super) fn wake_waiters(&mut self) {
        while let Some(idx) = self.waiting.front() {
            let Some(waiter) = self.waiting.get(idx) else {
                break;
            };
            if !self.can_enter(waiter.mode, &waiter.item, Scope::Local) {
                break;
            }
            let Some(waiter) = self.waiting.remove(idx) else {
                break;
            };
            self.sub_waiting(waiter.mode);
            self.grant(waiter.mode, &waiter.item);
            waiter.ctx.waiting.lock().take();
            waiter.reg.finish(WaitOutcome::Granted);
            waiter.thread.event().set(false);
        }
    }
}

/// Point-in-time view of a [ReentrantReadWriteLock], for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReentrantSnapshot {
    pub writers: u32,
    pub readers: u32,
    pub waiting_writers: u32,
    pub waiting_readers: u32,
}

pub(crate) struct LockShared {
    id: u64,
    executive: Executive,
    pub(super) state: SpinCell<LockState>,
}

impl LockShared {
    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn enter(
        self: &Arc<Self>,
        ctx: &Context,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<bool, SyncError> {
        let thread = match policy {
            WaitPolicy::Try => None,
            WaitPolicy::Block | WaitPolicy::Timed(_) => {
                let thread = thread::current();
                thread.check_termination()?;
                Some(thread)
            }
        };

        let mut items = ctx.inner.items.lock();
        // the only allocations happen before anything shared is touched
        let item = ContextInner::item_for(&mut items, self)?;
        let mut state = self.state.lock();
        if state.can_enter(mode, &item, Scope::Global) {
            state.grant(mode, &item);
            return Ok(true);
        }

        let Some(thread) = thread else {
            drop(state);
            ctx.inner.collect_item(&mut items, &item);
            return Ok(false);
        };

        let reg = Arc::new(Registration::new());
        let pushed = state.waiting.try_push_back(ContextWaiter {
            ctx: ctx.inner.clone(),
            item: item.clone(),
            mode,
            thread: thread.clone(),
            reg: reg.clone(),
        });
        let slot = match pushed {
            Ok(slot) => slot,
            Err(err) => {
                drop(state);
                ctx.inner.collect_item(&mut items, &item);
                return Err(err.into());
            }
        };
        reg.set_slot(slot);
        state.add_waiting(mode);
        *ctx.inner.waiting.lock() = Some(ContextWaiting {
            lock: self.clone(),
            mode,
        });
        thread.event().set(true);
        drop(state);
        drop(items);

        self.executive.counters().record_contended_wait();
        if self.executive.config().trace_waits {
            trace!(lock = self.id, context = ctx.id(), %mode, "waiting for reentrant lock");
        }

        let hazard: Arc<dyn Hazard> = Arc::new(LockWaitHazard {
            lock: self.clone(),
            reg: reg.clone(),
        });
        let timeout_ms = match policy {
            WaitPolicy::Timed(ms) => Some(ms),
            WaitPolicy::Try | WaitPolicy::Block => None,
        };
        if !thread.block(&reg, hazard, timeout_ms) {
            // the event timed out, but a release may have beaten us to the spin lock
            if let Some(waiter) = self.unregister(&reg, WaitOutcome::TimedOut) {
                waiter.ctx.collect(&waiter.item);
            }
        }

        match reg.outcome() {
            WaitOutcome::Granted => {
                self.state.fence();
                Ok(true)
            }
            WaitOutcome::TimedOut => {
                self.executive.counters().record_timeout();
                debug!(lock = self.id, context = ctx.id(), %mode, "timed out waiting for reentrant lock");
                Ok(false)
            }
            WaitOutcome::Terminated => {
                self.executive.counters().record_termination();
                debug!(lock = self.id, context = ctx.id(), %mode, "terminated while waiting for reentrant lock");
                Err(SyncError::Terminated)
            }
            WaitOutcome::Waiting => unreachable!("woken up while still queued"),
        }
    }

    pub(super) fn leave(&self, ctx: &Context, mode: LockMode) {
        let mut items = ctx.inner.items.lock();
        let Some(item) = items.get(&self.id).cloned() else {
            debug_assert!(false, "leaving a reentrant lock the context doesn't hold");
            return;
        };
        let mut state = self.state.lock();
        match mode {
            LockMode::Reader => state.release(&item, 1, 0),
            LockMode::Writer => state.release(&item, 0, 1),
        }
        state.wake_waiters();
        drop(state);
        ctx.inner.collect_item(&mut items, &item);
    }

    /// Adds counts for a context that already holds this lock. Never blocks: a holder may always nest.
    pub(super) fn enter_nested(&self, ctx: &Context, read: u32, write: u32) {
        if read + write == 0 {
            return;
        }
        let items = ctx.inner.items.lock();
        let Some(item) = items.get(&self.id) else {
            debug_assert!(false, "nesting into a reentrant lock the context doesn't hold");
            return;
        };
        let mut state = self.state.lock();
        debug_assert!(
            write == 0 || item.write() > 0,
            "nested write counts need a write count underneath"
        );
        state.count_readers += read;
        state.count_writers += write;
        item.add(LockMode::Reader, read);
        item.add(LockMode::Writer, write);
    }

    /// Drops every count `item` has on this lock at once, returns (read, write) as they were.
    pub(super) fn leave_counts(&self, item: &ContextLockItem) -> (u32, u32) {
        let mut state = self.state.lock();
        let (read, write) = (item.read(), item.write());
        state.release(item, read, write);
        state.wake_waiters();
        (read, write)
    }

    /// Takes `ctx` out of this lock completely, for a condition variable wait.
    pub(crate) fn release_for_wait(self: &Arc<Self>, ctx: &Context) -> HeldLock {
        let item = ctx.inner.items.lock().remove(&self.id);
        let (read, write) = item.map_or((0, 0), |item| self.leave_counts(&item));
        HeldLock {
            lock: self.clone(),
            read,
            write,
        }
    }

    fn unregister(&self, reg: &Registration, outcome: WaitOutcome) -> Option<ContextWaiter> {
        let mut state = self.state.lock();
        if !reg.is_waiting() {
            return None;
        }
        let waiter = state.waiting.remove(reg.slot())?;
        state.sub_waiting(waiter.mode);
        waiter.ctx.waiting.lock().take();
        reg.finish(outcome);
        waiter.thread.event().set(false);
        // a writer leaving the queue may let the ones behind it through
        state.wake_waiters();
        Some(waiter)
    }

    fn snapshot(&self) -> ReentrantSnapshot {
        let state = self.state.lock();
        ReentrantSnapshot {
            writers: state.count_writers,
            readers: state.count_readers,
            waiting_writers: state.count_waiting_writers,
            waiting_readers: state.count_waiting_readers,
        }
    }
}

/// Pulls a terminated thread's context out of the lock's queue.
struct LockWaitHazard {
    lock: Arc<LockShared>,
    reg: Arc<Registration>,
}

impl Hazard for LockWaitHazard {
    fn terminate_hazard(&self) {
        if let Some(waiter) = self.lock.unregister(&self.reg, WaitOutcome::Terminated) {
            waiter.ctx.collect(&waiter.item);
        }
    }
}

/// Recursive read-write lock. Ownership is tracked per [Context], not per thread:
/// the same context may enter again in any mode without deadlocking itself,
/// and has to leave exactly as often as it entered.
pub struct ReentrantReadWriteLock {
    shared: Arc<LockShared>,
}

impl ReentrantReadWriteLock {
    pub(crate) fn new(executive: Executive) -> Self {
        Self {
            shared: Arc::new(LockShared {
                id: NEXT_LOCK_ID.fetch_add(1, Relaxed),
                executive,
                state: SpinCell::new(LockState {
                    count_writers: 0,
                    count_readers: 0,
                    count_waiting_writers: 0,
                    count_waiting_readers: 0,
                    waiting: WaitList::new(),
                }),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<LockShared> {
        &self.shared
    }

    pub fn executive(&self) -> &Executive {
        &self.shared.executive
    }

    pub fn enter_read(&self, ctx: &Context) -> Result<(), SyncError> {
        self.shared
            .enter(ctx, LockMode::Reader, WaitPolicy::Block)
            .map(|_| ())
    }

    pub fn leave_read(&self, ctx: &Context) {
        self.shared.leave(ctx, LockMode::Reader);
    }

    pub fn enter_write(&self, ctx: &Context) -> Result<(), SyncError> {
        self.shared
            .enter(ctx, LockMode::Writer, WaitPolicy::Block)
            .map(|_| ())
    }

    pub fn leave_write(&self, ctx: &Context) {
        self.shared.leave(ctx, LockMode::Writer);
    }

    pub fn try_enter_read(&self, ctx: &Context) -> Result<bool, SyncError> {
        self.shared.enter(ctx, LockMode::Reader, WaitPolicy::Try)
    }

    pub fn try_enter_write(&self, ctx: &Context) -> Result<bool, SyncError> {
        self.shared.enter(ctx, LockMode::Writer, WaitPolicy::Try)
    }

    pub fn try_timed_enter_read(&self, ctx: &Context, ms: u64) -> Result<bool, SyncError> {
        self.shared
            .enter(ctx, LockMode::Reader, WaitPolicy::Timed(ms))
    }

    pub fn try_timed_enter_write(&self, ctx: &Context, ms: u64) -> Result<bool, SyncError> {
        self.shared
            .enter(ctx, LockMode::Writer, WaitPolicy::Timed(ms))
    }

    pub fn snapshot(&self) -> ReentrantSnapshot {
        self.shared.snapshot()
    }
}

impl Drop for ReentrantReadWriteLock {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.snapshot(),
            ReentrantSnapshot::default(),
            "dropping a reentrant lock that is still in use"
        );
    }
}
