//! Alarm: sleep until the clock passes a deadline.
//!
//! A thread calling [`Kernel::wait_until`] is parked in the alarm's wait set
//! instead of spinning. The alarm is the handler of the periodic timer
//! interrupt: on every timer interrupt it readies the threads whose deadline
//! has passed, then preempts the interrupted thread.
//!
//! The wait set is a binary heap ordered by wake time, so a wait costs
//! O(log n) and every expiration costs O(log n). Threads with the same wake
//! time are woken in thread-id order.
use crate::{Kernel, thread::Thread};
use abyss::{interrupt::InterruptGuard, spinlock::SpinLock};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

/// A thread waiting for the clock to reach `wake_time`.
#[derive(Clone, Debug)]
pub struct WaitEntry {
    wake_time: u64,
    thread: Thread,
}

impl WaitEntry {
    /// Absolute tick at which the thread may run again.
    pub fn wake_time(&self) -> u64 {
        self.wake_time
    }

    /// The waiting thread.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }
}

impl PartialEq for WaitEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WaitEntry {}

impl PartialOrd for WaitEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wake_time
            .cmp(&other.wake_time)
            .then_with(|| self.thread.cmp(&other.thread))
    }
}

/// The set of threads waiting for a deadline.
pub struct Alarm {
    waiters: SpinLock<BinaryHeap<Reverse<WaitEntry>>>,
}

impl Alarm {
    pub(crate) fn new() -> Self {
        Self {
            waiters: SpinLock::new(BinaryHeap::new()),
        }
    }

    fn push(&self, entry: WaitEntry) {
        let mut waiters = self.waiters.lock();
        waiters.push(Reverse(entry));
        waiters.unlock();
    }

    /// Removes the earliest entry if its wake time is not after `now`.
    fn pop_expired(&self, now: u64) -> Option<WaitEntry> {
        let mut waiters = self.waiters.lock();
        let expired = match waiters.peek() {
            Some(Reverse(entry)) if entry.wake_time <= now => waiters.pop().map(|Reverse(e)| e),
            _ => None,
        };
        waiters.unlock();
        expired
    }

    /// Number of waiting threads.
    pub fn len(&self) -> usize {
        let waiters = self.waiters.lock();
        let len = waiters.len();
        waiters.unlock();
        len
    }

    /// Returns true if no thread is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The earliest wake time, if any thread is waiting.
    pub fn next_wake_time(&self) -> Option<u64> {
        let waiters = self.waiters.lock();
        let next = waiters.peek().map(|Reverse(entry)| entry.wake_time);
        waiters.unlock();
        next
    }
}

impl Kernel {
    /// Puts the current thread to sleep for at least `ticks` ticks.
    ///
    /// The thread is woken by the first timer interrupt at or after
    /// `now() + ticks`, and returns only once the clock has actually passed
    /// that point. Zero or negative waits return immediately.
    pub fn wait_until(&self, ticks: i64) {
        if ticks <= 0 {
            return;
        }
        let current = self.current_thread();
        let wake_time = self.now() + ticks as u64;
        debug!(ALARM, "{} waits until {}", current, wake_time);

        let guard = InterruptGuard::new(self.interrupt());
        self.alarm().push(WaitEntry {
            wake_time,
            thread: current,
        });
        self.sleep();
        drop(guard);

        while wake_time > self.now() {
            self.yield_now();
        }
    }

    /// The timer interrupt handler.
    ///
    /// Readies every thread whose deadline has passed and preempts the
    /// running thread. Called with interrupts disabled.
    pub(crate) fn timer_interrupt(&self) {
        let guard = InterruptGuard::new(self.interrupt());
        let now = self.now();
        while let Some(entry) = self.alarm().pop_expired(now) {
            debug!(
                ALARM,
                "Waking {} at {} (deadline {})", entry.thread, now, entry.wake_time
            );
            self.ready(&entry.thread);
        }
        drop(guard);
        self.yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemConfigurationBuilder;

    #[test]
    fn wait_entry_order() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let alarm = Alarm::new();
        let threads = ["a", "b", "c", "d"].map(|name| kernel.create_thread(name));
        for (wake_time, th) in [(30, 0), (10, 2), (10, 1), (20, 3)] {
            alarm.push(WaitEntry {
                wake_time,
                thread: threads[th].clone(),
            });
        }
        assert_eq!(alarm.len(), 4);
        assert_eq!(alarm.next_wake_time(), Some(10));
        assert!(alarm.pop_expired(9).is_none());

        let expired = std::iter::from_fn(|| alarm.pop_expired(20))
            .map(|entry| entry.thread.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(expired, vec!["b", "c", "d"]);
        assert_eq!(alarm.next_wake_time(), Some(30));
        kernel.shutdown();
    }

    #[test]
    fn zero_wait_returns_immediately() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let start = kernel.now();
        kernel.wait_until(0);
        kernel.wait_until(-5);
        assert!(kernel.now() - start < SystemConfigurationBuilder::TIMER_INTERVAL);
        assert!(kernel.alarm().is_empty());
        kernel.shutdown();
    }
}
