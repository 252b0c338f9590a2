//! # Waiter event
//!
//! One manual-reset event per OS thread. It's the only thing any primitive here actually sleeps on.
//!
//! The protocol is always the same:
//! - the waiter calls `set(true)` while it still holds the primitive's spin lock
//! - the waiter drops the spin lock and blocks in [WaiterEvent::wait_while]
//! - a releaser finishes the waiter's registration, then calls `set(false)` under the same spin lock
//!
//! As the flag is set before the spin lock is dropped, a release can't get lost in-between.
//!
//! The event never decides if the wait succeeded, the [super::Registration] does. It's also shared by
//! every wait of the thread: the condition variable's list lock may park the thread while it's
//! registered with the condition variable, and a signal would clear the event under that park.
//! So a waiter sleeps until *its* condition is over, not until the event is cleared.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

pub struct WaiterEvent {
    should_wait: Mutex<bool>,
    cond: Condvar,
}

impl WaiterEvent {
    pub fn new() -> Self {
        Self {
            should_wait: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self, wait: bool) {
        let mut should_wait = self.should_wait.lock();
        *should_wait = wait;
        if !wait {
            // there's only the owner thread to wake, but notify_all keeps it simple
            self.cond.notify_all();
        }
    }

    /// Blocks while `still_waiting` holds, at most until `deadline`.
    ///
    /// `still_waiting` is evaluated under the event's mutex. A waker that makes it false and then
    /// calls `set(false)` can't be missed: either the change is seen before sleeping, or the
    /// `set(false)` comes after and notifies.
    ///
    /// `false` if the deadline passed while `still_waiting` was true.
    pub fn wait_while(&self, still_waiting: impl Fn() -> bool, deadline: Option<Instant>) -> bool {
        let mut should_wait = self.should_wait.lock();
        while still_waiting() {
            // cleared for another wait of this thread => arm it again
            *should_wait = true;
            match deadline {
                None => self.cond.wait(&mut should_wait),
                Some(deadline) => {
                    if self.cond.wait_until(&mut should_wait, deadline).timed_out() {
                        return !still_waiting();
                    }
                }
            }
        }
        *should_wait = false;
        true
    }

    pub fn is_waiting(&self) -> bool {
        *self.should_wait.lock()
    }
}

impl Default for WaiterEvent {
    fn default() -> Self {
        Self::new()
    }
}
