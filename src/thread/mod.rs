//! # Threads
//!
//! The primitives don't talk to the OS directly. All they need from a thread is:
//! - a [WaiterEvent] to sleep on
//! - an identity to put into wait lists
//! - a place to register hazards, so a forced termination can pull the thread out of any wait list
//! - the implicit reentrant [Context] used by the thread-bound reentrant lock
//!
//! That's a [ThreadRecord]. Each OS thread gets one lazily through a `thread_local!` slot.
//! When the thread exits, the slot is dropped and the thread's context gives back whatever it still held.
//!
//! ## Termination
//!
//! Rust can't kill a thread, so termination is cooperative: [ThreadHandle::terminate] raises a flag and
//! runs the hazards the target thread registered for its current wait. A hazard removes the thread
//! from the wait list it sits in and wakes it up. The interrupted call then returns
//! [SyncError::Terminated] instead of entering the critical section.
//!
//! Hazards are snapshotted under the hazard spin lock and run without it, as they need to take
//! the locks of the primitive the thread waits on.

mod p1_waiter_event;
mod p2_registration;

pub use p1_waiter_event::WaiterEvent;
pub use p2_registration::{Registration, WaitOutcome};

use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{
            AtomicBool, AtomicU64,
            Ordering::{Relaxed, SeqCst},
        },
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{error::SyncError, reentrant::Context, spin_lock::SpinCell};

/// Something that must be undone if the thread registering it gets terminated.
pub trait Hazard: Send + Sync {
    /// Called from the terminating thread. Must be idempotent: the wait may be over already.
    fn terminate_hazard(&self);
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub struct ThreadRecord {
    id: u64,
    name: Option<String>,
    event: WaiterEvent,
    termination_requested: AtomicBool,
    exited: AtomicBool,
    hazards: SpinCell<Vec<Arc<dyn Hazard>>>,
    context: Context,
}

/// A shared reference to a thread's record. Cheap to clone, can be sent to other threads.
#[derive(Clone)]
pub struct ThreadHandle {
    record: Arc<ThreadRecord>,
}

impl ThreadHandle {
    pub(crate) fn new(name: Option<String>) -> Self {
        Self {
            record: Arc::new(ThreadRecord {
                id: NEXT_THREAD_ID.fetch_add(1, Relaxed),
                name,
                event: WaiterEvent::new(),
                termination_requested: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                hazards: SpinCell::new(Vec::new()),
                context: Context::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    /// The implicit context of this thread, used by the thread-bound reentrant lock.
    pub fn context(&self) -> &Context {
        &self.record.context
    }

    pub(crate) fn event(&self) -> &WaiterEvent {
        &self.record.event
    }

    pub fn is_termination_requested(&self) -> bool {
        self.record.termination_requested.load(SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.record.exited.load(Relaxed)
    }

    pub fn ptr_eq(&self, other: &ThreadHandle) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }

    /// Asks the thread to terminate and pulls it out of whatever it waits on right now.
    ///
    /// The thread isn't stopped, but every cancellable wait it's in or enters later
    /// fails with [SyncError::Terminated].
    pub fn terminate(&self) {
        self.record.termination_requested.store(true, SeqCst);
        let hazards = self.record.hazards.lock().clone();
        debug!(
            thread = self.id(),
            hazards = hazards.len(),
            "terminating thread"
        );
        // newest first, the same order an unwinding stack would go
        for hazard in hazards.iter().rev() {
            hazard.terminate_hazard();
        }
    }

    pub(crate) fn check_termination(&self) -> Result<(), SyncError> {
        if self.is_termination_requested() {
            Err(SyncError::Terminated)
        } else {
            Ok(())
        }
    }

    /// Sleeps until `reg` is finished, with `hazard` registered for the whole duration.
    /// The event must have been `set(true)` under the primitive's spin lock before.
    /// Returns `false` if the timeout elapsed, the caller must consult its registration in any case.
    pub(crate) fn block(
        &self,
        reg: &Registration,
        hazard: Arc<dyn Hazard>,
        timeout_ms: Option<u64>,
    ) -> bool {
        let _scope = HazardScope::enter(self, hazard);
        self.park(reg, timeout_ms)
    }

    /// Same as [ThreadHandle::block], but not a cancellation point.
    pub(crate) fn park(&self, reg: &Registration, timeout_ms: Option<u64>) -> bool {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.event().wait_while(|| reg.is_waiting(), deadline)
    }

    fn on_exit(&self) {
        self.record.exited.store(true, Relaxed);
        self.record.context.release_residual();
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Keeps a hazard registered while alive.
struct HazardScope<'a> {
    thread: &'a ThreadHandle,
}

impl<'a> HazardScope<'a> {
    fn enter(thread: &'a ThreadHandle, hazard: Arc<dyn Hazard>) -> Self {
        thread.record.hazards.lock().push(hazard.clone());
        // a terminate() that snapshotted the hazards before our push must still be honoured
        if thread.is_termination_requested() {
            hazard.terminate_hazard();
        }
        Self { thread }
    }
}

impl Drop for HazardScope<'_> {
    fn drop(&mut self) {
        self.thread.record.hazards.lock().pop();
    }
}

// the thread-exit hook lives in Drop
struct CurrentThread(ThreadHandle);

impl Drop for CurrentThread {
    fn drop(&mut self) {
        self.0.on_exit();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentThread>> = const { RefCell::new(None) };
}

/// The calling thread's handle, created on first use.
pub fn current() -> ThreadHandle {
    CURRENT
        .try_with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| CurrentThread(ThreadHandle::new(None)))
                .0
                .clone()
        })
        // the slot is gone while the thread is exiting, a detached record still works for a last wait
        .unwrap_or_else(|_| ThreadHandle::new(None))
}

/// Makes `handle` the record of the calling thread. Used right at the start of spawned threads.
pub(crate) fn install(handle: ThreadHandle) {
    CURRENT.with(|slot| {
        let previous = slot.borrow_mut().replace(CurrentThread(handle));
        debug_assert!(
            previous.is_none(),
            "a thread record is installed only once per thread"
        );
    });
}
