//! # Context
//!
//! A context is an owner of reentrant locks: a thread (implicitly, see [ThreadHandle::context](crate::thread::ThreadHandle::context))
//! or any object the caller decides to make one.
//!
//! It maps each lock it currently holds to its own read and write counts. Entries appear on the first
//! enter and are garbage-collected as soon as both counts drop to zero.
//!
//! The map itself is guarded by the context's spin lock. The counts inside an entry are guarded by the
//! *lock's* spin lock, so a releaser can hand a lock over to a queued context without taking that
//! context's spin lock (which would invert the lock order).
//!
//! ## Moving
//!
//! [Context::take_over] moves everything from one context into a fresh one, including a pending wait.
//! The lock's queue must end up pointing at the new context or a later release would grant the lock
//! to the old one. The lock's spin lock is only *tried* while both context spin locks are held,
//! never waited for: a waker may be holding it and wanting a context spin lock of its own.

use std::{
    collections::HashMap,
    hint,
    sync::{
        atomic::{
            AtomicU32, AtomicU64,
            Ordering::Relaxed,
        },
        Arc,
    },
};

use tracing::{debug, warn};

use crate::{error::SyncError, rwlock::LockMode, spin_lock::SpinCell};

use super::p2_lock::{LockShared, ReentrantReadWriteLock, WaitPolicy};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// How often a context holds a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockCounts {
    pub read: u32,
    pub write: u32,
}

pub(super) struct ContextLockItem {
    pub(super) lock: Arc<LockShared>,
    read: AtomicU32,
    write: AtomicU32,
}

impl ContextLockItem {
    fn new(lock: Arc<LockShared>) -> Self {
        Self {
            lock,
            read: AtomicU32::new(0),
            write: AtomicU32::new(0),
        }
    }

    pub(super) fn read(&self) -> u32 {
        self.read.load(Relaxed)
    }

    pub(super) fn write(&self) -> u32 {
        self.write.load(Relaxed)
    }

    pub(super) fn is_empty(&self) -> bool {
        self.read() == 0 && self.write() == 0
    }

    pub(super) fn add(&self, mode: LockMode, n: u32) {
        match mode {
            LockMode::Reader => self.read.fetch_add(n, Relaxed),
            LockMode::Writer => self.write.fetch_add(n, Relaxed),
        };
    }

    pub(super) fn sub(&self, mode: LockMode, n: u32) {
        match mode {
            LockMode::Reader => self.read.fetch_sub(n, Relaxed),
            LockMode::Writer => self.write.fetch_sub(n, Relaxed),
        };
    }
}

pub(super) struct ContextWaiting {
    pub(super) lock: Arc<LockShared>,
    pub(super) mode: LockMode,
}

type ItemMap = HashMap<u64, Arc<ContextLockItem>>;

pub(crate) struct ContextInner {
    id: u64,
    pub(super) items: SpinCell<ItemMap>,
    // a leaf lock, taken last
    pub(super) waiting: SpinCell<Option<ContextWaiting>>,
}

impl ContextInner {
    pub(super) fn item_for(
        items: &mut ItemMap,
        lock: &Arc<LockShared>,
    ) -> Result<Arc<ContextLockItem>, SyncError> {
        if let Some(item) = items.get(&lock.id()) {
            return Ok(item.clone());
        }
        items.try_reserve(1)?;
        let item = Arc::new(ContextLockItem::new(lock.clone()));
        items.insert(lock.id(), item.clone());
        Ok(item)
    }

    /// Drops the map entry of `item` if it's empty, unless the context is queued on that lock.
    pub(super) fn collect_item(&self, items: &mut ItemMap, item: &Arc<ContextLockItem>) {
        let lock_id = item.lock.id();
        let queued = self
            .waiting
            .lock()
            .as_ref()
            .is_some_and(|w| w.lock.id() == lock_id);
        let same_entry = items.get(&lock_id).is_some_and(|i| Arc::ptr_eq(i, item));
        if same_entry && !queued && item.is_empty() {
            items.remove(&lock_id);
        }
    }

    pub(super) fn collect(&self, item: &Arc<ContextLockItem>) {
        let mut items = self.items.lock();
        self.collect_item(&mut items, item);
    }

    /// Drops every empty entry except the one of the lock the context is queued on.
    fn collect_empty(&self, items: &mut ItemMap) {
        let queued = self.waiting.lock().as_ref().map(|w| w.lock.id());
        items.retain(|&lock_id, item| !item.is_empty() || queued == Some(lock_id));
    }

    fn drain_items(&self) -> Vec<Arc<ContextLockItem>> {
        self.items.lock().drain().map(|(_, item)| item).collect()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        debug_assert!(
            self.waiting.get_mut().is_none(),
            "dropping a context that is queued on a lock"
        );
        // not a replacement for leaving properly, but the locks must not stay held by a ghost
        for (_, item) in self.items.get_mut().drain() {
            let (read, write) = item.lock.leave_counts(&item);
            if read + write > 0 {
                warn!(context = self.id, read, write, "context dropped while holding a lock");
            }
        }
    }
}

/// A lock given up for the duration of a condition variable wait, with the counts to restore.
pub(crate) struct HeldLock {
    pub(crate) lock: Arc<LockShared>,
    pub(crate) read: u32,
    pub(crate) write: u32,
}

impl HeldLock {
    /// Takes all counts back in one go: a single entry that may block or fail, the rest is nested
    /// under it and added straight away. Either everything is restored or nothing is.
    pub(crate) fn restore(&self, ctx: &Context) -> Result<(), SyncError> {
        let (first, read, write) = match (self.read, self.write) {
            (0, 0) => return Ok(()),
            (read, 0) => (LockMode::Reader, read - 1, 0),
            (read, write) => (LockMode::Writer, read, write - 1),
        };
        self.lock.enter(ctx, first, WaitPolicy::Block)?;
        self.lock.enter_nested(ctx, read, write);
        Ok(())
    }

    /// Undoes a successful [HeldLock::restore].
    pub(crate) fn give_back(&self, ctx: &Context) {
        self.lock.release_for_wait(ctx);
    }
}

/// Restores every lock in `held`. If one of them fails, the ones already restored are given back
/// before the error is returned.
pub(crate) fn restore_all(held: &[HeldLock], ctx: &Context) -> Result<(), SyncError> {
    for (restored, lock) in held.iter().enumerate() {
        if let Err(err) = lock.restore(ctx) {
            for lock in &held[..restored] {
                lock.give_back(ctx);
            }
            debug!(
                context = ctx.id(),
                given_back = restored,
                "gave locks back after a failed restore"
            );
            return Err(err);
        }
    }
    Ok(())
}

pub struct Context {
    pub(super) inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Relaxed),
                items: SpinCell::new(HashMap::new()),
                waiting: SpinCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn counts_for(&self, lock: &ReentrantReadWriteLock) -> LockCounts {
        self.inner
            .items
            .lock()
            .get(&lock.shared().id())
            .map(|item| LockCounts {
                read: item.read(),
                write: item.write(),
            })
            .unwrap_or_default()
    }

    /// Number of locks this context holds in any mode.
    pub fn held_lock_count(&self) -> usize {
        self.inner
            .items
            .lock()
            .values()
            .filter(|item| !item.is_empty())
            .count()
    }

    pub fn is_waiting(&self) -> bool {
        self.inner.waiting.lock().is_some()
    }

    /// Moves all of `src` into `self`, which must be a fresh context.
    ///
    /// If `src` is queued on a lock, the queue entry is re-pointed to `self`: whoever is blocked in
    /// that enter call returns once the lock is granted, but the counts end up in `self`.
    /// Nothing is moved if the map allocation fails.
    pub fn take_over(&self, src: &Context) -> Result<(), SyncError> {
        if Arc::ptr_eq(&self.inner, &src.inner) {
            return Ok(());
        }
        loop {
            let mut dst_items = self.inner.items.lock();
            let mut src_items = src.inner.items.lock();
            debug_assert!(
                dst_items.is_empty() && self.inner.waiting.lock().is_none(),
                "a context can only be moved into a fresh one"
            );
            dst_items.try_reserve(src_items.len())?;

            let waiting_lock = src.inner.waiting.lock().as_ref().map(|w| w.lock.clone());
            let Some(lock) = waiting_lock else {
                dst_items.extend(src_items.drain());
                // a wait unregistered right before the move left its entry behind, src can't collect it any more
                self.inner.collect_empty(&mut dst_items);
                debug!(from = src.id(), to = self.id(), "moved context");
                return Ok(());
            };

            let Some(mut state) = lock.state.try_lock() else {
                // never wait for the lock with both contexts held, start over
                drop(src_items);
                drop(dst_items);
                hint::spin_loop();
                continue;
            };
            // a waker may have granted the lock to src in the meantime => nothing left to re-point
            let waiting = src.inner.waiting.lock().take();
            if let Some(waiting) = waiting {
                if let Some(idx) = state
                    .waiting
                    .position(|w| Arc::ptr_eq(&w.ctx, &src.inner))
                {
                    if let Some(waiter) = state.waiting.get_mut(idx) {
                        waiter.ctx = self.inner.clone();
                    }
                }
                *self.inner.waiting.lock() = Some(waiting);
            }
            dst_items.extend(src_items.drain());
            self.inner.collect_empty(&mut dst_items);
            drop(state);
            debug!(from = src.id(), to = self.id(), lock = lock.id(), "moved waiting context");
            return Ok(());
        }
    }

    /// Gives every lock up for a condition variable wait.
    pub(crate) fn release_all_for_wait(&self) -> Vec<HeldLock> {
        self.inner
            .drain_items()
            .into_iter()
            .map(|item| {
                let (read, write) = item.lock.leave_counts(&item);
                HeldLock {
                    lock: item.lock.clone(),
                    read,
                    write,
                }
            })
            .filter(|held| held.read + held.write > 0)
            .collect()
    }

    /// Called when the owning thread exits.
    pub(crate) fn release_residual(&self) {
        for item in self.inner.drain_items() {
            let (read, write) = item.lock.leave_counts(&item);
            if read + write > 0 {
                warn!(
                    context = self.id(),
                    read, write, "thread exited while holding a lock, released it"
                );
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
