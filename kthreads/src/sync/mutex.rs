//! # Mutex.
//!
//! A blocking lock. A thread that finds the lock held is put on the lock's
//! wait queue and sleeps. Unlocking hands the lock directly to the next
//! waiter, so a woken thread owns the lock when it runs and never retries.
use crate::{
    Kernel,
    thread::{Thread, scheduler::ThreadQueue},
};
use abyss::{
    interrupt::InterruptGuard,
    spinlock::{SpinLock, WouldBlock},
};
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The data can only be accessed through the guards returned from
/// [`lock`] and [`try_lock`]. Like the kernel's spin lock, the guard must be
/// released explicitly with [`MutexGuard::unlock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct Mutex<T> {
    kernel: Kernel,
    id: u64,
    holder: SpinLock<Option<Thread>>,
    waiters: SpinLock<Box<dyn ThreadQueue>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(kernel: &Kernel, t: T) -> Self {
        static ID: AtomicU64 = AtomicU64::new(0);
        Self {
            kernel: kernel.clone(),
            id: ID.fetch_add(1, Ordering::SeqCst),
            holder: SpinLock::new(None),
            waiters: SpinLock::new(kernel.scheduler().new_thread_queue(true)),
            data: UnsafeCell::new(t),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Acquires the mutex, sleeping until it is able to do so.
    ///
    /// Locking a mutex the current thread already holds is a fault.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let current = self.kernel.current_thread();
        let guard = InterruptGuard::new(self.kernel.interrupt());
        let mut holder = self.holder.lock();
        match holder.as_ref() {
            Some(owner) if *owner == current => {
                holder.unlock();
                panic!("lock: {current} already holds the mutex");
            }
            Some(_) => {
                holder.unlock();
                debug!(SYNC, "{} waits for mutex #{}", current, self.id);
                let mut waiters = self.waiters.lock();
                waiters.wait_for_access(current.clone());
                waiters.unlock();
                self.kernel.sleep();
                assert!(self.is_held_by_current_thread());
            }
            None => {
                *holder = Some(current.clone());
                holder.unlock();
                let mut waiters = self.waiters.lock();
                waiters.acquire(&current);
                waiters.unlock();
            }
        }
        drop(guard);
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock without sleeping.
    ///
    /// # Errors
    ///
    /// [`WouldBlock`] if another thread holds the lock.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        let current = self.kernel.current_thread();
        let _guard = InterruptGuard::new(self.kernel.interrupt());
        let mut holder = self.holder.lock();
        if holder.is_some() {
            holder.unlock();
            return Err(WouldBlock);
        }
        *holder = Some(current.clone());
        holder.unlock();
        let mut waiters = self.waiters.lock();
        waiters.acquire(&current);
        waiters.unlock();
        Ok(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Returns true if the current thread holds this lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        let current = self.kernel.current_thread();
        let holder = self.holder.lock();
        let held = holder.as_ref() == Some(&current);
        holder.unlock();
        held
    }

    /// Releases the lock, handing it to the next waiter if there is one.
    pub(crate) fn release(&self) {
        assert!(
            self.is_held_by_current_thread(),
            "unlock: mutex #{} is not held by the current thread",
            self.id
        );
        let _guard = InterruptGuard::new(self.kernel.interrupt());
        let mut waiters = self.waiters.lock();
        let next = waiters.next_thread();
        waiters.unlock();
        let mut holder = self.holder.lock();
        *holder = next.clone();
        holder.unlock();
        if let Some(next) = next {
            debug!(SYNC, "Mutex #{} handed over to {}", self.id, next);
            self.kernel.ready(&next);
        }
    }
}

/// An implementation of a "scoped lock" of a mutex.
///
/// The lock must be explicitly unlocked by [`unlock`]. Dropping a guard
/// without unlocking is a fault, except while the thread is unwinding from
/// another fault, in which case the lock is released.
///
/// [`unlock`]: Self::unlock
pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T> MutexGuard<'a, T> {
    /// Releases the underlying [`Mutex`].
    pub fn unlock(self) {
        self.lock.release();
        std::mem::forget(self);
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("`.unlock()` must be explicitly called before dropping MutexGuard.");
        }
        if abyss::tcb::holds_cpu() && self.lock.is_held_by_current_thread() {
            self.lock.release();
        }
    }
}
