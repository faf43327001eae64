//! # Condition Variable.
//!
//! A **Condition Variable** allows a thread to block until a certain
//! condition is met, without consuming cpu time. It is always used together
//! with the [`Mutex`] that guards the shared state; the pair is fixed when
//! the condition variable is created, and every operation checks that the
//! caller passes a guard of that mutex.
//!
//! A waiter releases the lock and blocks as one atomic step: interrupts are
//! disabled before the lock is released, and stay disabled until the waiter
//! is queued and switched out. A [`wake`] issued by the next lock holder can
//! therefore never slip in between and get lost.
//!
//! Waiters are woken in the order they went to sleep. A woken waiter is only
//! made ready; it competes for the lock again before [`sleep`] returns, so
//! the condition it waited for must be re-checked ([`wait_while`] does so).
//!
//! ```ignore
//! let mut guard = mutex.lock();
//! while guard.is_empty() {
//!     guard = condvar.sleep(guard);
//! }
//! let item = guard.pop();
//! guard.unlock();
//! ```
//!
//! [`wake`]: ConditionVariable::wake
//! [`sleep`]: ConditionVariable::sleep
//! [`wait_while`]: ConditionVariable::wait_while
use super::mutex::{Mutex, MutexGuard};
use crate::{Kernel, thread::Thread};
use abyss::{interrupt::InterruptGuard, spinlock::SpinLock};
use std::collections::VecDeque;

/// A Condition Variable
pub struct ConditionVariable {
    kernel: Kernel,
    lock_id: u64,
    waiters: SpinLock<VecDeque<Thread>>,
}

impl ConditionVariable {
    /// Creates a new condition variable paired with `lock`.
    pub fn new<T>(lock: &Mutex<T>) -> Self {
        Self {
            kernel: lock.kernel().clone(),
            lock_id: lock.id(),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    #[track_caller]
    fn check<T>(&self, guard: &MutexGuard<'_, T>, op: &str) {
        let mutex = guard.mutex();
        assert_eq!(
            mutex.id(),
            self.lock_id,
            "{op}: the guard does not belong to the paired lock"
        );
        assert!(
            mutex.is_held_by_current_thread(),
            "{op}: the paired lock is not held by the current thread"
        );
    }

    /// Atomically releases the lock and blocks until woken, then re-acquires
    /// the lock.
    pub fn sleep<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.check(&guard, "sleep");
        let mutex = guard.mutex();
        let current = self.kernel.current_thread();
        debug!(CONDITION, "{} sleeps on condition of mutex #{}", current, self.lock_id);

        let interrupt = InterruptGuard::new(self.kernel.interrupt());
        let mut waiters = self.waiters.lock();
        waiters.push_back(current);
        waiters.unlock();
        guard.unlock();
        self.kernel.sleep();
        drop(interrupt);

        mutex.lock()
    }

    /// Wakes up the thread that has waited the longest, if any.
    pub fn wake<T>(&self, guard: &MutexGuard<'_, T>) {
        self.check(guard, "wake");
        let _interrupt = InterruptGuard::new(self.kernel.interrupt());
        let mut waiters = self.waiters.lock();
        let next = waiters.pop_front();
        waiters.unlock();
        if let Some(next) = next {
            debug!(CONDITION, "Waking {} on condition of mutex #{}", next, self.lock_id);
            self.kernel.ready(&next);
        }
    }

    /// Wakes up all threads sleeping on this condition variable.
    pub fn wake_all<T>(&self, guard: &MutexGuard<'_, T>) {
        self.check(guard, "wake_all");
        let _interrupt = InterruptGuard::new(self.kernel.interrupt());
        loop {
            let mut waiters = self.waiters.lock();
            let next = waiters.pop_front();
            waiters.unlock();
            match next {
                Some(next) => {
                    debug!(CONDITION, "Waking {} on condition of mutex #{}", next, self.lock_id);
                    self.kernel.ready(&next);
                }
                None => break,
            }
        }
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// The predicate is checked with the lock held, before the first sleep
    /// and after every wakeup.
    pub fn wait_while<'a, T>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        while predicate(&mut *guard) {
            guard = self.sleep(guard);
        }
        guard
    }

    /// Number of sleeping threads.
    pub fn waiters(&self) -> usize {
        let waiters = self.waiters.lock();
        let len = waiters.len();
        waiters.unlock();
        len
    }
}
