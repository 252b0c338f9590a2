//! # Executive
//!
//! The one object everything else is made from. There's no global instance: the caller creates an
//! [Executive] and passes it (or the primitives made from it) down. It's a cheap `Arc` handle.
//!
//! Each reentrant lock, condition variable, barrier and dispatched read-write lock keeps a clone of
//! the executive it was created from, for the config and the counters.
//!
//! It also knows sizes and alignments of all primitives, so callers can embed them inline
//! instead of boxing each one.

mod p1_config;

pub use p1_config::{ExecutiveConfig, RWLOCK_BACKEND_VAR, TRACE_WAITS_VAR};

use std::{
    alloc::Layout,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    thread::{Builder, JoinHandle, Scope, ScopedJoinHandle},
};

use strum_macros::{Display, EnumIter};
use tracing::debug;

use crate::{
    barrier::Barrier,
    condvar::ConditionVariable,
    error::SyncError,
    reentrant::{Context, ReentrantReadWriteLock, ThreadReentrantReadWriteLock},
    rwlock::{NativeReadWriteLock, ReadWriteLock, StandardReadWriteLock},
    spin_lock::SpinLock,
    thread::{self, ThreadHandle},
};

#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum PrimitiveKind {
    SpinLock,
    StandardReadWriteLock,
    NativeReadWriteLock,
    ReadWriteLock,
    ReentrantReadWriteLock,
    ThreadReentrantReadWriteLock,
    Context,
    ConditionVariable,
    Barrier,
}

/// Relaxed counters, updated by the primitives as they go.
#[derive(Default)]
pub(crate) struct ExecutiveCounters {
    primitives_created: AtomicU64,
    contended_waits: AtomicU64,
    timeouts: AtomicU64,
    terminations: AtomicU64,
}

impl ExecutiveCounters {
    pub(crate) fn record_created(&self) {
        self.primitives_created.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_contended_wait(&self) {
        self.contended_waits.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_termination(&self) {
        self.terminations.fetch_add(1, Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutiveStats {
    pub primitives_created: u64,
    pub contended_waits: u64,
    pub timeouts: u64,
    pub terminations: u64,
}

struct ExecutiveShared {
    config: ExecutiveConfig,
    counters: ExecutiveCounters,
}

#[derive(Clone)]
pub struct Executive {
    shared: Arc<ExecutiveShared>,
}

impl Executive {
    pub fn new(config: ExecutiveConfig) -> Self {
        debug!(?config, "creating executive");
        Self {
            shared: Arc::new(ExecutiveShared {
                config,
                counters: ExecutiveCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ExecutiveConfig {
        &self.shared.config
    }

    pub(crate) fn counters(&self) -> &ExecutiveCounters {
        &self.shared.counters
    }

    pub fn stats(&self) -> ExecutiveStats {
        let counters = self.counters();
        ExecutiveStats {
            primitives_created: counters.primitives_created.load(Relaxed),
            contended_waits: counters.contended_waits.load(Relaxed),
            timeouts: counters.timeouts.load(Relaxed),
            terminations: counters.terminations.load(Relaxed),
        }
    }

    pub fn create_spin_lock(&self) -> SpinLock {
        self.counters().record_created();
        SpinLock::new()
    }

    /// A read-write lock backed by whatever the config says.
    pub fn create_read_write_lock(&self) -> ReadWriteLock {
        self.counters().record_created();
        ReadWriteLock::new(self.clone())
    }

    pub fn create_standard_read_write_lock(&self) -> StandardReadWriteLock {
        self.counters().record_created();
        StandardReadWriteLock::new()
    }

    pub fn create_reentrant_read_write_lock(&self) -> ReentrantReadWriteLock {
        self.counters().record_created();
        ReentrantReadWriteLock::new(self.clone())
    }

    pub fn create_thread_reentrant_read_write_lock(&self) -> ThreadReentrantReadWriteLock {
        self.counters().record_created();
        ThreadReentrantReadWriteLock::new(self.clone())
    }

    pub fn create_context(&self) -> Context {
        self.counters().record_created();
        Context::new()
    }

    pub fn create_condition_variable(&self) -> ConditionVariable {
        self.counters().record_created();
        ConditionVariable::new(self.clone())
    }

    pub fn create_barrier(&self, release_count: usize) -> Result<Barrier, SyncError> {
        let barrier = Barrier::new(self.clone(), release_count)?;
        self.counters().record_created();
        Ok(barrier)
    }

    /// Size and alignment of a primitive, for embedding it inline.
    pub fn layout_of(&self, kind: PrimitiveKind) -> Layout {
        match kind {
            PrimitiveKind::SpinLock => Layout::new::<SpinLock>(),
            PrimitiveKind::StandardReadWriteLock => Layout::new::<StandardReadWriteLock>(),
            PrimitiveKind::NativeReadWriteLock => Layout::new::<NativeReadWriteLock>(),
            PrimitiveKind::ReadWriteLock => Layout::new::<ReadWriteLock>(),
            PrimitiveKind::ReentrantReadWriteLock => Layout::new::<ReentrantReadWriteLock>(),
            PrimitiveKind::ThreadReentrantReadWriteLock => {
                Layout::new::<ThreadReentrantReadWriteLock>()
            }
            PrimitiveKind::Context => Layout::new::<Context>(),
            PrimitiveKind::ConditionVariable => Layout::new::<ConditionVariable>(),
            PrimitiveKind::Barrier => Layout::new::<Barrier>(),
        }
    }

    pub fn current_thread(&self) -> ThreadHandle {
        thread::current()
    }

    /// Spawns a thread whose [ThreadHandle] is known up front, so it can be terminated from outside.
    pub fn spawn<F, T>(&self, name: &str, f: F) -> Result<ExecutiveThread<T>, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = ThreadHandle::new(Some(name.to_string()));
        let installed = handle.clone();
        let join = Builder::new().name(name.to_string()).spawn(move || {
            thread::install(installed);
            f()
        })?;
        Ok(ExecutiveThread { handle, join })
    }

    /// [Executive::spawn] for `std::thread::scope`.
    pub fn spawn_scoped<'scope, 'env, F, T>(
        &self,
        scope: &'scope Scope<'scope, 'env>,
        name: &str,
        f: F,
    ) -> Result<(ThreadHandle, ScopedJoinHandle<'scope, T>), SyncError>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        let handle = ThreadHandle::new(Some(name.to_string()));
        let installed = handle.clone();
        let join = Builder::new()
            .name(name.to_string())
            .spawn_scoped(scope, move || {
                thread::install(installed);
                f()
            })?;
        Ok((handle, join))
    }
}

impl Default for Executive {
    fn default() -> Self {
        Self::new(ExecutiveConfig::default())
    }
}

impl fmt::Debug for Executive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executive")
            .field("config", self.config())
            .field("stats", &self.stats())
            .finish()
    }
}

pub struct ExecutiveThread<T> {
    handle: ThreadHandle,
    join: JoinHandle<T>,
}

impl<T> ExecutiveThread<T> {
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    pub fn join(self) -> std::thread::Result<T> {
        self.join.join()
    }
}

pub fn run(executive: &Executive) {
    use strum::IntoEnumIterator;

    for kind in PrimitiveKind::iter() {
        let layout = executive.layout_of(kind);
        println!(
            "{:<32} size {:>4} align {:>2}",
            kind.to_string(),
            layout.size(),
            layout.align()
        );
    }
}
