//! Thread synchronization built from first principles: spin locks, fair read-write locks,
//! context-based reentrant locks, condition variables and barriers, all made by an [executive::Executive]
//! and all safe against a waiting thread being terminated.

pub mod barrier;
pub mod condvar;
pub mod error;
pub mod executive;
pub mod reentrant;
pub mod rwlock;
pub mod spin_lock;
pub mod thread;
pub mod wait_list;

pub use error::SyncError;
pub use executive::{Executive, ExecutiveConfig};
