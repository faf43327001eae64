//! Thread scheduler
//!
//! The kernel never decides on its own which thread runs next. It asks a
//! [`Scheduler`] for [`ThreadQueue`]s, one for the ready queue and one for
//! every resource threads wait on (a mutex, a join), and only relies on the
//! promise that every thread put into a queue comes out of it exactly once.
use super::Thread;
use std::collections::VecDeque;

/// A queue of threads waiting for a resource.
///
/// All methods are called with interrupts disabled.
pub trait ThreadQueue: Send {
    /// Put `th` into the queue.
    ///
    /// The thread is waiting for access to the resource the queue guards:
    /// the CPU for the ready queue, a lock, or another thread's completion.
    fn wait_for_access(&mut self, th: Thread);

    /// Pick the next thread to be given access, removing it from the queue.
    ///
    /// # Returns
    ///
    /// `None` if no thread is waiting.
    fn next_thread(&mut self) -> Option<Thread>;

    /// Notify the queue that `th` received access without waiting.
    ///
    /// Schedulers that transfer priority use this to learn the owner.
    fn acquire(&mut self, th: &Thread);

    /// Number of queued threads.
    fn len(&self) -> usize;

    /// Returns true if no thread is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait is the factory of [`ThreadQueue`]s. Different
/// implementations (round robin, priority, lottery) differ in the order the
/// queues they create hand threads out.
pub trait Scheduler: Send + Sync {
    /// Create a new thread queue.
    ///
    /// `transfer_priority` is true when the queue guards a resource with an
    /// owner whose priority may be boosted by the waiters (a lock).
    fn new_thread_queue(&self, transfer_priority: bool) -> Box<dyn ThreadQueue>;

    /// Name of the policy, for the boot log.
    fn name(&self) -> &'static str;
}

/// A First-in-first-out scheduler.
///
/// Threads leave every queue in the order they entered it; the ready queue
/// therefore runs threads round-robin.
#[derive(Default)]
pub struct Fifo;

impl Scheduler for Fifo {
    fn new_thread_queue(&self, _transfer_priority: bool) -> Box<dyn ThreadQueue> {
        Box::new(FifoQueue::default())
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// The queue created by [`Fifo`].
#[derive(Default)]
pub struct FifoQueue {
    queue: VecDeque<Thread>,
}

impl ThreadQueue for FifoQueue {
    fn wait_for_access(&mut self, th: Thread) {
        debug_assert!(
            !self.queue.contains(&th),
            "{th} is already waiting in this queue"
        );
        self.queue.push_back(th);
    }

    fn next_thread(&mut self) -> Option<Thread> {
        self.queue.pop_front()
    }

    fn acquire(&mut self, _th: &Thread) {
        debug_assert!(self.queue.is_empty());
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemConfigurationBuilder;

    #[test]
    fn fifo_order() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let threads = ["a", "b", "c"].map(|name| kernel.create_thread(name));
        let mut queue = Fifo.new_thread_queue(false);
        for th in threads.iter() {
            queue.wait_for_access(th.clone());
        }
        assert_eq!(queue.len(), 3);
        for th in threads.iter() {
            assert_eq!(queue.next_thread().as_ref(), Some(th));
        }
        assert!(queue.next_thread().is_none());
        kernel.shutdown();
    }
}
