/*
 * It's not practical to send a thread to sleep if a lock is only ever held for a handful of instructions.
 * Every primitive in this crate keeps its bookkeeping behind one of these spin locks
 * and never blocks while holding it => critical sections stay O(1).
 *
 * There's no fairness whatsoever, callers must keep the locked regions short.
 */

use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
    thread,
};

use crate::executive::Executive;

// a bare lock without any data attached, see SpinCell for the guarded flavour
pub struct SpinLock {
    is_lock_taken: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            is_lock_taken: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        // try the cheap path first, then spin on a plain load so we don't hammer the cache line with CAS
        while self
            .is_lock_taken
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            while self.is_lock_taken.load(Relaxed) {
                hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.is_lock_taken
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        let was_taken = self.is_lock_taken.swap(false, Release);
        debug_assert!(was_taken, "unlocking a spin lock that is not locked");
    }

    /// Spins until whoever holds the lock right now lets go of it, without taking it.
    ///
    /// A thread that has been released from a wait uses this to be sure the releaser
    /// is done touching the shared state before it looks at it.
    pub fn fence(&self) {
        // Acquire pairs with the Release of the releaser's unlock
        while self.is_lock_taken.load(Acquire) {
            hint::spin_loop();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.is_lock_taken.load(Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpinLock {
    fn drop(&mut self) {
        debug_assert!(
            !*self.is_lock_taken.get_mut(),
            "dropping a spin lock that is still locked"
        );
    }
}

// the lock with the data it protects, it's what the other primitives keep their state in
pub struct SpinCell<Y> {
    lock: SpinLock,
    value: UnsafeCell<Y>,
}
// UnsafeCell makes the above definition !Sync => promise the compiler it's fine as long as Y is Send
unsafe impl<Y> Sync for SpinCell<Y> where Y: Send {}

impl<Y> SpinCell<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            lock: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, Y> {
        self.lock.lock();
        SpinGuard { cell: self } // it can't be made by any other means
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, Y>> {
        self.lock.try_lock().then_some(SpinGuard { cell: self })
    }

    pub fn fence(&self) {
        self.lock.fence();
    }

    pub fn get_mut(&mut self) -> &mut Y {
        self.value.get_mut()
    }
}

// Deref like &mut and Drop like unlock()
pub struct SpinGuard<'a, Y> {
    cell: &'a SpinCell<Y>,
}

impl<Y> Deref for SpinGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: existence of the guard is caused by locking its lock
        unsafe { &*self.cell.value.get() }
    }
}

impl<Y> DerefMut for SpinGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: existence of the guard is caused by locking its lock
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<Y> Drop for SpinGuard<'_, Y> {
    fn drop(&mut self) {
        self.cell.lock.unlock();
    }
}

pub fn run(executive: &Executive) {
    let x = SpinCell::new(Vec::new());
    thread::scope(|s| {
        s.spawn(|| x.lock().push(1));
        s.spawn(|| {
            let mut vec_guard = x.lock();
            vec_guard.push(2);
            vec_guard.push(2);
        });
    });
    let vec_guard = x.lock();
    assert!(vec_guard.as_slice() == [1, 2, 2] || vec_guard.as_slice() == [2, 2, 1]);
    println!("x is {:?}", *vec_guard);

    let lock = executive.create_spin_lock();
    lock.lock();
    println!("bare lock taken, try_lock gives {}", lock.try_lock());
    lock.unlock();
}
