//! # Reentrant read-write locks
//!
//! A plain read-write lock deadlocks as soon as its holder tries to take it again. Here every owner has a
//! [Context] that counts how often it holds each lock, so:
//! - write after write, read after write and read after read by the same owner never block
//! - read then write ("upgrade") works as long as nobody else holds the lock
//! - the owner leaves exactly as often as it entered before anyone else can get in
//!
//! [ReentrantReadWriteLock] takes the context explicitly, [ThreadReentrantReadWriteLock] uses the calling
//! thread's implicit one.
//!
//! Blocking entries are cancellation points: a terminated thread is taken off the queue and gets
//! [SyncError::Terminated](crate::error::SyncError::Terminated) back.

mod p1_context;
mod p2_lock;
mod p3_thread_bound;

pub use p1_context::{Context, LockCounts};
pub use p2_lock::{ReentrantReadWriteLock, ReentrantSnapshot};
pub use p3_thread_bound::ThreadReentrantReadWriteLock;

pub(crate) use p1_context::{restore_all, HeldLock};

use std::thread::scope;

use crate::{error::SyncError, executive::Executive};

pub fn run(executive: &Executive) -> Result<(), SyncError> {
    let lock = executive.create_thread_reentrant_read_write_lock();
    lock.enter_write()?;
    // it's ours already, so these don't block
    lock.enter_write()?;
    lock.enter_read()?;
    println!("holding {:?}", lock.held_by_current_thread());
    scope(|s| {
        s.spawn(|| {
            let entered = lock.try_timed_enter_read(50);
            println!("another thread tried to read: {entered:?}");
        });
    });
    lock.leave_read();
    lock.leave_write();
    lock.leave_write();
    println!("released, lock is {:?}", lock.snapshot());
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering::SeqCst},
            Mutex,
        },
        thread::{scope, sleep},
        time::Duration,
    };

    use super::{p1_context::ContextInner, *};

    fn wait_for(lock: &ReentrantReadWriteLock, pred: impl Fn(ReentrantSnapshot) -> bool) {
        while !pred(lock.snapshot()) {
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_recursion_never_blocks_the_owner() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let owner = executive.create_context();
        let other = executive.create_context();

        for _ in 0..3 {
            lock.enter_write(&owner).unwrap();
        }
        lock.enter_read(&owner).unwrap();
        assert_eq!(owner.counts_for(&lock), LockCounts { read: 1, write: 3 });

        // nobody else gets in until every count is given back
        for _ in 0..3 {
            assert!(!lock.try_enter_read(&other).unwrap());
            lock.leave_write(&owner);
        }
        assert!(!lock.try_enter_write(&other).unwrap());
        lock.leave_read(&owner);

        // the map entry is gone once both counts are zero
        assert_eq!(owner.held_lock_count(), 0);
        assert!(lock.try_enter_write(&other).unwrap());
        lock.leave_write(&other);
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_upgrade_of_a_sole_reader() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let a = executive.create_context();
        let b = executive.create_context();

        lock.enter_read(&a).unwrap();
        assert!(lock.try_enter_write(&a).unwrap());
        lock.leave_write(&a);

        // with a second reader around the upgrade has to wait
        lock.enter_read(&b).unwrap();
        assert!(!lock.try_enter_write(&a).unwrap());
        lock.leave_read(&b);
        lock.leave_read(&a);
    }

    #[test]
    fn test_mutual_exclusion_across_contexts() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let writers_inside = AtomicU32::new(0);
        let readers_inside = AtomicU32::new(0);
        scope(|s| {
            for i in 0..6 {
                let (lock, writers_inside, readers_inside) = (&lock, &writers_inside, &readers_inside);
                let ctx = executive.create_context();
                s.spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            lock.enter_write(&ctx).unwrap();
                            // nested, still exclusive
                            lock.enter_write(&ctx).unwrap();
                            assert_eq!(writers_inside.fetch_add(1, SeqCst), 0);
                            assert_eq!(readers_inside.load(SeqCst), 0);
                            writers_inside.fetch_sub(1, SeqCst);
                            lock.leave_write(&ctx);
                            lock.leave_write(&ctx);
                        } else {
                            lock.enter_read(&ctx).unwrap();
                            readers_inside.fetch_add(1, SeqCst);
                            assert_eq!(writers_inside.load(SeqCst), 0);
                            readers_inside.fetch_sub(1, SeqCst);
                            lock.leave_read(&ctx);
                        }
                    }
                });
            }
        });
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_queued_writer_goes_before_later_reader() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let order = Mutex::new(Vec::new());
        let holder = executive.create_context();

        lock.enter_write(&holder).unwrap();
        scope(|s| {
            s.spawn(|| {
                let ctx = Context::new();
                lock.enter_write(&ctx).unwrap();
                order.lock().unwrap().push("writer");
                lock.leave_write(&ctx);
            });
            wait_for(&lock, |snap| snap.waiting_writers == 1);
            s.spawn(|| {
                let ctx = Context::new();
                lock.enter_read(&ctx).unwrap();
                order.lock().unwrap().push("reader");
                lock.leave_read(&ctx);
            });
            wait_for(&lock, |snap| snap.waiting_readers == 1);
            lock.leave_write(&holder);
        });
        assert_eq!(*order.lock().unwrap(), ["writer", "reader"]);
    }

    #[test]
    fn test_holder_reenters_read_past_a_queued_writer() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let reader = executive.create_context();
        let latecomer = executive.create_context();

        lock.enter_read(&reader).unwrap();
        scope(|s| {
            s.spawn(|| {
                let ctx = Context::new();
                lock.enter_write(&ctx).unwrap();
                lock.leave_write(&ctx);
            });
            wait_for(&lock, |snap| snap.waiting_writers == 1);

            // the reader already holds the lock: queueing behind the writer would deadlock
            assert!(lock.try_enter_read(&reader).unwrap());
            // a fresh reader must not overtake the queued writer
            assert!(!lock.try_enter_read(&latecomer).unwrap());

            lock.leave_read(&reader);
            lock.leave_read(&reader);
        });
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
        assert_eq!(latecomer.held_lock_count(), 0);
    }

    #[test]
    fn test_timed_enter_leaves_no_registration() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let holder = executive.create_context();
        let waiter = executive.create_context();

        scope(|s| {
            lock.enter_write(&holder).unwrap();
            s.spawn(|| {
                sleep(Duration::from_millis(200));
                lock.leave_write(&holder);
            });
            assert!(!lock.try_timed_enter_write(&waiter, 50).unwrap());
            let snap = lock.snapshot();
            assert_eq!((snap.waiting_writers, snap.waiting_readers), (0, 0));
            assert!(!waiter.is_waiting());
            assert_eq!(waiter.held_lock_count(), 0);
        });
        // and the lock is usable afterwards
        assert!(lock.try_timed_enter_write(&waiter, 50).unwrap());
        lock.leave_write(&waiter);
        assert_eq!(executive.stats().timeouts, 1);
    }

    #[test]
    fn test_terminated_waiter_is_taken_off_the_queue() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let holder = executive.create_context();

        lock.enter_write(&holder).unwrap();
        scope(|s| {
            let (handle, join) = executive
                .spawn_scoped(s, "victim", || {
                    let ctx = Context::new();
                    let result = lock.enter_write(&ctx);
                    (result, ctx.held_lock_count())
                })
                .unwrap();
            wait_for(&lock, |snap| snap.waiting_writers == 1);
            handle.terminate();
            let (result, held) = join.join().unwrap();
            assert!(matches!(result, Err(SyncError::Terminated)));
            assert_eq!(held, 0);
        });
        assert_eq!(lock.snapshot().waiting_writers, 0);

        // a normal operation goes through afterwards
        lock.leave_write(&holder);
        let other = executive.create_context();
        assert!(lock.try_enter_write(&other).unwrap());
        lock.leave_write(&other);
        assert_eq!(executive.stats().terminations, 1);
    }

    #[test]
    fn test_moved_waiting_context_is_woken_in_its_new_place() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let holder = executive.create_context();
        let src = executive.create_context();
        let dst = executive.create_context();

        lock.enter_write(&holder).unwrap();
        scope(|s| {
            let waiter = s.spawn(|| lock.enter_write(&src));
            wait_for(&lock, |snap| snap.waiting_writers == 1);

            dst.take_over(&src).unwrap();
            assert!(dst.is_waiting());
            assert!(!src.is_waiting());

            lock.leave_write(&holder);
            waiter.join().unwrap().unwrap();
        });
        assert_eq!(dst.counts_for(&lock), LockCounts { read: 0, write: 1 });
        assert_eq!(src.counts_for(&lock), LockCounts::default());
        assert!(!dst.is_waiting());

        lock.leave_write(&dst);
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_take_over_moves_held_counts() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let src = executive.create_context();
        let dst = executive.create_context();

        lock.enter_write(&src).unwrap();
        lock.enter_read(&src).unwrap();
        dst.take_over(&src).unwrap();
        assert_eq!(src.held_lock_count(), 0);
        assert_eq!(dst.counts_for(&lock), LockCounts { read: 1, write: 1 });

        lock.leave_read(&dst);
        lock.leave_write(&dst);
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_dropped_context_gives_its_locks_back() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        {
            let ctx = executive.create_context();
            lock.enter_write(&ctx).unwrap();
            lock.enter_write(&ctx).unwrap();
        }
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_thread_bound_lock() {
        let executive = Executive::default();
        let lock = executive.create_thread_reentrant_read_write_lock();

        lock.enter_write().unwrap();
        lock.enter_read().unwrap();
        assert_eq!(lock.held_by_current_thread(), LockCounts { read: 1, write: 1 });
        scope(|s| {
            assert!(!s.spawn(|| lock.try_enter_read().unwrap()).join().unwrap());
            assert!(!s
                .spawn(|| lock.try_timed_enter_write(20).unwrap())
                .join()
                .unwrap());
        });
        lock.leave_read();
        lock.leave_write();
        assert_eq!(lock.held_by_current_thread(), LockCounts::default());
    }

    #[test]
    fn test_thread_exit_releases_residual_counts() {
        let executive = Executive::default();
        let lock = executive.create_thread_reentrant_read_write_lock();
        scope(|s| {
            // joined explicitly: only a real join waits for the thread-local teardown
            s.spawn(|| {
                lock.enter_write().unwrap();
                lock.enter_write().unwrap();
                // and never leaves
            })
            .join()
            .unwrap();
        });
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
        assert!(lock.try_enter_write().unwrap());
        lock.leave_write();
    }

    #[test]
    fn test_writer_nests_past_a_queued_writer() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let holder = executive.create_context();
        let order = Mutex::new(Vec::new());

        lock.enter_write(&holder).unwrap();
        scope(|s| {
            s.spawn(|| {
                let ctx = Context::new();
                lock.enter_write(&ctx).unwrap();
                order.lock().unwrap().push("queued");
                lock.leave_write(&ctx);
            });
            wait_for(&lock, |snap| snap.waiting_writers == 1);

            // write after write and read after write, the queued writer stays where it is
            assert!(lock.try_enter_write(&holder).unwrap());
            lock.enter_read(&holder).unwrap();
            lock.enter_write(&holder).unwrap();
            assert_eq!(holder.counts_for(&lock), LockCounts { read: 1, write: 3 });
            assert_eq!(lock.snapshot().waiting_writers, 1);

            lock.leave_write(&holder);
            lock.leave_read(&holder);
            lock.leave_write(&holder);
            sleep(Duration::from_millis(20));
            // one write count is still held
            assert!(order.lock().unwrap().is_empty());
            order.lock().unwrap().push("holder");
            lock.leave_write(&holder);
        });
        assert_eq!(*order.lock().unwrap(), ["holder", "queued"]);
    }

    #[test]
    fn test_sole_reader_upgrades_past_a_queued_writer() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let reader = executive.create_context();

        lock.enter_read(&reader).unwrap();
        scope(|s| {
            s.spawn(|| {
                let ctx = Context::new();
                lock.enter_write(&ctx).unwrap();
                lock.leave_write(&ctx);
            });
            wait_for(&lock, |snap| snap.waiting_writers == 1);

            assert!(lock.try_enter_write(&reader).unwrap());
            assert_eq!(
                lock.snapshot(),
                ReentrantSnapshot {
                    writers: 1,
                    readers: 1,
                    waiting_writers: 1,
                    waiting_readers: 0,
                }
            );
            lock.leave_write(&reader);

            // still reading => the writer keeps waiting
            sleep(Duration::from_millis(20));
            assert_eq!(lock.snapshot().waiting_writers, 1);
            lock.leave_read(&reader);
        });
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_timed_out_writer_lets_readers_behind_it_in() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let holder = executive.create_context();

        lock.enter_read(&holder).unwrap();
        scope(|s| {
            let writer = s.spawn(|| {
                let ctx = Context::new();
                lock.try_timed_enter_write(&ctx, 500).unwrap()
            });
            wait_for(&lock, |snap| snap.waiting_writers == 1);
            let reader = s.spawn(|| {
                let ctx = Context::new();
                lock.enter_read(&ctx).unwrap();
                lock.leave_read(&ctx);
            });
            // queued behind the writer, not let in next to the holder
            wait_for(&lock, |snap| snap.waiting_readers == 1);

            assert!(!writer.join().unwrap());
            reader.join().unwrap();
        });
        lock.leave_read(&holder);
        assert_eq!(lock.snapshot(), ReentrantSnapshot::default());
    }

    #[test]
    fn test_take_over_drops_leftover_empty_entries() {
        let executive = Executive::default();
        let lock = executive.create_reentrant_read_write_lock();
        let src = executive.create_context();
        let dst = executive.create_context();

        // what a wait unregistered right before the move leaves behind
        ContextInner::item_for(&mut src.inner.items.lock(), lock.shared()).unwrap();
        assert_eq!(src.inner.items.lock().len(), 1);

        dst.take_over(&src).unwrap();
        assert!(src.inner.items.lock().is_empty());
        assert!(dst.inner.items.lock().is_empty());
    }
}
