//! # Barrier
//!
//! A rendezvous for a fixed number of threads: everyone who calls [Barrier::wait] blocks until
//! `release_count` threads are in, then all of them go at once and the barrier is ready for the next round.
//!
//! The thread that completes a round doesn't block at all, it wakes the others and returns.
//! A woken thread fences on the barrier's spin lock before it returns, so the completing thread
//! is done with the shared state by then.
//!
//! A wait is a cancellation point: a terminated thread leaves the round it was counted in.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    error::SyncError,
    executive::Executive,
    spin_lock::SpinCell,
    thread::{self, Hazard, Registration, ThreadHandle, WaitOutcome},
    wait_list::WaitList,
};

struct BarrierWaiter {
    thread: ThreadHandle,
    reg: Arc<Registration>,
}

struct BarrierState {
    waiting_count: usize,
    list: WaitList<BarrierWaiter>,
}

struct BarrierShared {
    req_release_count: usize,
    state: SpinCell<BarrierState>,
}

impl BarrierShared {
    fn unregister(&self, reg: &Registration, outcome: WaitOutcome) {
        let mut state = self.state.lock();
        // the round may have been completed first
        if !reg.is_waiting() {
            return;
        }
        if let Some(waiter) = state.list.remove(reg.slot()) {
            state.waiting_count -= 1;
            reg.finish(outcome);
            waiter.thread.event().set(false);
        }
    }
}

struct BarrierHazard {
    shared: Arc<BarrierShared>,
    reg: Arc<Registration>,
}

impl Hazard for BarrierHazard {
    fn terminate_hazard(&self) {
        self.shared.unregister(&self.reg, WaitOutcome::Terminated);
    }
}

pub struct Barrier {
    shared: Arc<BarrierShared>,
    executive: Executive,
}

impl Barrier {
    pub(crate) fn new(executive: Executive, release_count: usize) -> Result<Self, SyncError> {
        if release_count == 0 {
            return Err(SyncError::InvalidReleaseCount(release_count));
        }
        Ok(Self {
            shared: Arc::new(BarrierShared {
                req_release_count: release_count,
                state: SpinCell::new(BarrierState {
                    waiting_count: 0,
                    list: WaitList::new(),
                }),
            }),
            executive,
        })
    }

    pub fn release_count(&self) -> usize {
        self.shared.req_release_count
    }

    /// Threads blocked in the current round.
    pub fn waiting_count(&self) -> usize {
        self.shared.state.lock().waiting_count
    }

    pub fn wait(&self) -> Result<(), SyncError> {
        self.wait_inner(None).map(|_| ())
    }

    /// `false` if the round wasn't completed within `ms`, the thread isn't counted in it any more then.
    pub fn wait_timed(&self, ms: u64) -> Result<bool, SyncError> {
        self.wait_inner(Some(ms))
    }

    fn wait_inner(&self, timeout_ms: Option<u64>) -> Result<bool, SyncError> {
        let thread = thread::current();
        thread.check_termination()?;

        let mut state = self.shared.state.lock();
        if state.waiting_count + 1 == self.shared.req_release_count {
            let released = state.waiting_count;
            while let Some(waiter) = state.list.pop_front() {
                waiter.reg.finish(WaitOutcome::Granted);
                waiter.thread.event().set(false);
            }
            state.waiting_count = 0;
            drop(state);
            if self.executive.config().trace_waits {
                trace!(released, "barrier round completed");
            }
            return Ok(true);
        }

        let reg = Arc::new(Registration::new());
        let slot = state.list.try_push_back(BarrierWaiter {
            thread: thread.clone(),
            reg: reg.clone(),
        })?;
        reg.set_slot(slot);
        state.waiting_count += 1;
        thread.event().set(true);
        drop(state);
        self.executive.counters().record_contended_wait();
        if self.executive.config().trace_waits {
            trace!(thread = thread.id(), "waiting on barrier");
        }

        let hazard: Arc<dyn Hazard> = Arc::new(BarrierHazard {
            shared: self.shared.clone(),
            reg: reg.clone(),
        });
        if !thread.block(&reg, hazard, timeout_ms) {
            self.shared.unregister(&reg, WaitOutcome::TimedOut);
        }

        match reg.outcome() {
            WaitOutcome::Granted => {
                self.shared.state.fence();
                Ok(true)
            }
            WaitOutcome::TimedOut => {
                self.executive.counters().record_timeout();
                debug!(thread = thread.id(), "timed out waiting on barrier");
                Ok(false)
            }
            WaitOutcome::Terminated => {
                self.executive.counters().record_termination();
                debug!(thread = thread.id(), "terminated while waiting on barrier");
                Err(SyncError::Terminated)
            }
            WaitOutcome::Waiting => unreachable!("woken up while still counted in the round"),
        }
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.waiting_count(),
            0,
            "dropping a barrier somebody waits on"
        );
    }
}

pub fn run(executive: &Executive) -> Result<(), SyncError> {
    let barrier = executive.create_barrier(3)?;
    std::thread::scope(|s| {
        for i in 0..3 {
            let barrier = &barrier;
            s.spawn(move || {
                for round in 0..2 {
                    std::thread::sleep(std::time::Duration::from_millis(10 * i));
                    if barrier.wait().is_ok() {
                        println!("thread {i} passed round {round}");
                    }
                }
            });
        }
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    fn wait_for(pred: impl Fn() -> bool) {
        while !pred() {
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_zero_participants_is_rejected() {
        let executive = Executive::default();
        assert!(matches!(
            executive.create_barrier(0),
            Err(SyncError::InvalidReleaseCount(0))
        ));
    }

    #[test]
    fn test_single_participant_never_blocks() {
        let executive = Executive::default();
        let barrier = executive.create_barrier(1).unwrap();
        for _ in 0..3 {
            barrier.wait().unwrap();
            assert!(barrier.wait_timed(1).unwrap());
        }
        assert_eq!(barrier.waiting_count(), 0);
    }

    #[test]
    fn test_releases_exactly_the_round_and_is_reusable() {
        let executive = Executive::default();
        let barrier = executive.create_barrier(3).unwrap();
        let passed = AtomicUsize::new(0);

        for _ in 0..2 {
            scope(|s| {
                for _ in 0..2 {
                    s.spawn(|| {
                        barrier.wait().unwrap();
                        passed.fetch_add(1, SeqCst);
                    });
                }
                wait_for(|| barrier.waiting_count() == 2);
                sleep(Duration::from_millis(20));
                // two in => nobody got through yet
                assert_eq!(passed.load(SeqCst) % 3, 0);

                barrier.wait().unwrap();
                passed.fetch_add(1, SeqCst);
            });
            assert_eq!(barrier.waiting_count(), 0);
        }
        assert_eq!(passed.load(SeqCst), 6);
    }

    #[test]
    fn test_timed_out_waiter_leaves_the_round() {
        let executive = Executive::default();
        let barrier = executive.create_barrier(2).unwrap();

        assert!(!barrier.wait_timed(20).unwrap());
        assert_eq!(barrier.waiting_count(), 0);
        assert_eq!(executive.stats().timeouts, 1);

        // the timed out thread isn't counted => the next round still needs two
        scope(|s| {
            let other = s.spawn(|| barrier.wait_timed(5_000).unwrap());
            wait_for(|| barrier.waiting_count() == 1);
            assert!(barrier.wait_timed(5_000).unwrap());
            assert!(other.join().unwrap());
        });
    }

    #[test]
    fn test_terminated_waiter_leaves_the_round() {
        let executive = Executive::default();
        let barrier = executive.create_barrier(2).unwrap();

        scope(|s| {
            let (handle, join) = executive
                .spawn_scoped(s, "victim", || barrier.wait())
                .unwrap();
            wait_for(|| barrier.waiting_count() == 1);
            handle.terminate();
            assert!(matches!(join.join().unwrap(), Err(SyncError::Terminated)));
        });
        assert_eq!(barrier.waiting_count(), 0);
        assert_eq!(executive.stats().terminations, 1);

        scope(|s| {
            s.spawn(|| barrier.wait().unwrap());
            barrier.wait().unwrap();
        });
    }
}
