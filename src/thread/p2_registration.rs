use std::sync::atomic::{
    AtomicU8, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

use strum_macros::Display;

/// How a single wait ended up.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum WaitOutcome {
    Waiting = 0,
    Granted = 1,
    TimedOut = 2,
    Terminated = 3,
}

impl WaitOutcome {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WaitOutcome::Waiting,
            1 => WaitOutcome::Granted,
            2 => WaitOutcome::TimedOut,
            _ => WaitOutcome::Terminated,
        }
    }
}

/// The ticket a waiter leaves in a primitive's wait list.
///
/// Both fields are only written under the spin lock of the primitive the ticket is registered with,
/// the atomics are there for interior mutability and for the waiter's own reads after it woke up.
/// The outcome stored here is the only truth about the wait: a timed out event may race a release,
/// whoever gets the spin lock first decides.
pub struct Registration {
    outcome: AtomicU8,
    slot: AtomicUsize,
}

impl Registration {
    pub fn new() -> Self {
        Self {
            outcome: AtomicU8::new(WaitOutcome::Waiting as u8),
            slot: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn outcome(&self) -> WaitOutcome {
        WaitOutcome::from_u8(self.outcome.load(Acquire))
    }

    pub fn is_waiting(&self) -> bool {
        self.outcome() == WaitOutcome::Waiting
    }

    pub fn finish(&self, outcome: WaitOutcome) {
        debug_assert!(self.is_waiting(), "a registration can only be finished once");
        self.outcome.store(outcome as u8, Release);
    }

    pub fn slot(&self) -> usize {
        self.slot.load(Relaxed)
    }

    pub fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Relaxed);
    }
}

impl Default for Registration {
    fn default() -> Self {
        Self::new()
    }
}
