//! # Errors
//!
//! Only a handful of things can go wrong at runtime in here:
//! - an allocation for a wait-list slot or a context map entry fails
//! - the waiting thread is terminated by someone else
//! - the caller hands in nonsense at construction time
//!
//! Timeouts aren't errors, they come back as a plain `false`.
//! Broken invariants (unlocking what isn't locked, dropping a held lock) are `debug_assert!`s only.

use std::collections::TryReserveError;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SyncError {
    /// Nothing of the shared state was touched when this one is returned.
    #[error("out of memory while registering with a lock: {0}")]
    OutOfMemory(#[from] TryReserveError),
    /// The waiting thread got a termination request, the critical section was not (re-)entered.
    #[error("the thread was terminated while waiting")]
    Terminated,
    #[error("a barrier needs at least one participant, got {0}")]
    InvalidReleaseCount(usize),
    #[error("invalid executive configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn a thread: {0}")]
    Spawn(#[from] std::io::Error),
}
