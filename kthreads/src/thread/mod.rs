//! Thread abstraction, an abstraction of the cpu.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with its
//! own execution context. Exactly one thread is `Running` at any moment.
//! The others are `Ready` (waiting in the ready queue for the cpu),
//! `Blocked` (waiting for something else: a lock, a condition, an alarm, a
//! join), `New` (created but not yet forked) or `Finished`.
//!
//! ```text
//!            fork                 run
//!   New ──────────────► Ready ─────────► Running ───► Finished
//!                         ▲   ◄─────────    │
//!                         │      yield      │ sleep
//!                         │                 ▼
//!                         └──── ready ── Blocked
//! ```
//!
//! Every state transition happens with interrupts disabled. A thread never
//! tears down its own execution context: a finishing thread records itself
//! and the next thread to run destroys it.
pub mod scheduler;

use crate::{Kernel, KernelError};
use abyss::{
    interrupt::InterruptGuard,
    spinlock::SpinLock,
    tcb::{Destroyed, Tcb},
};
use arrayvec::ArrayVec;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use scheduler::ThreadQueue;
use std::{
    any::Any,
    cmp::Ordering as CmpOrdering,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

/// Maximum number of threads that may transitively wait on a single thread.
pub const MAX_JOIN_DEPTH: usize = 32;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread is created but not forked yet.
    New,
    /// Thread waits in the ready queue.
    Ready,
    /// Thread is running.
    Running,
    /// Thread is blocked on a resource.
    Blocked,
    /// Thread is finished.
    Finished,
}

/// A recorded fault of a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Thread id of the faulting thread.
    pub tid: u64,
    /// Name of the faulting thread.
    pub name: String,
    /// Panic message.
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{}) faulted: {}", self.name, self.tid, self.message)
    }
}

pub(crate) struct ThreadInner {
    tid: u64,
    name: String,
    state: AtomicU8,
    control: SpinLock<Control>,
}

struct Control {
    target: Option<Box<dyn FnOnce() + Send>>,
    tcb: Option<Tcb>,
    join_queue: Option<Box<dyn ThreadQueue>>,
    joined: bool,
    /// Threads that wait, directly or through other joins, on this thread.
    joiners: ArrayVec<u64, MAX_JOIN_DEPTH>,
    /// Targets this thread already joined. Only the thread itself touches it.
    joined_targets: ArrayVec<u64, MAX_JOIN_DEPTH>,
    /// The thread this thread is blocked joining.
    waiting_on: Option<Thread>,
    fault: Option<String>,
}

/// A thread handle.
///
/// Handles are cheap to clone; all clones refer to the same thread.
/// Handles compare and order by thread id, i.e. by creation order.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl Thread {
    fn new(tid: u64, name: String) -> Self {
        Self {
            inner: Arc::new(ThreadInner {
                tid,
                name,
                state: AtomicU8::new(ThreadState::New.into()),
                control: SpinLock::new(Control {
                    target: None,
                    tcb: None,
                    join_queue: None,
                    joined: false,
                    joiners: ArrayVec::new(),
                    joined_targets: ArrayVec::new(),
                    waiting_on: None,
                    fault: None,
                }),
            }),
        }
    }

    /// Thread id.
    pub fn tid(&self) -> u64 {
        self.inner.tid
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state of the thread.
    pub fn state(&self) -> ThreadState {
        ThreadState::try_from(self.inner.state.load(Ordering::SeqCst))
            .unwrap_or_else(|e| panic!("{self} has a corrupted state: {e}"))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner.state.store(state.into(), Ordering::SeqCst);
    }

    /// The panic message of the thread, if its work faulted.
    pub fn fault(&self) -> Option<String> {
        let control = self.inner.control.lock();
        let fault = control.fault.clone();
        control.unlock();
        fault
    }

    /// Sets the work this thread runs once forked.
    ///
    /// Only a `New` thread accepts a target.
    pub fn set_target(&self, target: impl FnOnce() + Send + 'static) {
        assert_eq!(
            self.state(),
            ThreadState::New,
            "set_target: {self} was already forked"
        );
        let mut control = self.inner.control.lock();
        control.target = Some(Box::new(target));
        control.unlock();
    }

    fn tcb(&self) -> Option<Tcb> {
        let control = self.inner.control.lock();
        let tcb = control.tcb.clone();
        control.unlock();
        tcb
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ThreadInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &std::sync::Weak<ThreadInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.tid() == other.tid()
    }
}

impl Eq for Thread {}

impl PartialOrd for Thread {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Thread {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.tid().cmp(&other.tid())
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name(), self.tid())
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder<'a> {
    kernel: &'a Kernel,
    th: Thread,
}

impl<'a> ThreadBuilder<'a> {
    /// Create a new thread builder for thread `name`.
    pub fn new(kernel: &'a Kernel, name: impl Into<String>) -> Self {
        Self {
            th: kernel.create_thread(name),
            kernel,
        }
    }

    /// Get the thread id of this thread.
    pub fn get_tid(&self) -> u64 {
        self.th.tid()
    }

    /// Build the thread without forking it.
    pub fn build<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> Thread {
        self.th.set_target(thread_fn);
        self.th
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let kernel = self.kernel.clone();
        let th = self.build(thread_fn);
        kernel.fork(&th);
        JoinHandle { th, kernel }
    }
}

/// A handle to join a spawned thread.
pub struct JoinHandle {
    th: Thread,
    kernel: Kernel,
}

impl JoinHandle {
    /// The spawned thread.
    pub fn thread(&self) -> &Thread {
        &self.th
    }

    /// Wait for the thread to finish.
    ///
    /// # Errors
    ///
    /// Returns the panic message if the thread faulted.
    pub fn join(self) -> Result<(), String> {
        self.kernel.join(&self.th);
        match self.th.fault() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

impl Kernel {
    /// Creates a `New` thread named `name`.
    pub fn create_thread(&self, name: impl Into<String>) -> Thread {
        let th = Thread::new(self.inner.next_tid.fetch_add(1, Ordering::SeqCst), name.into());
        let mut threads = self.inner.threads.lock();
        threads.insert(th.tid(), th.downgrade());
        threads.unlock();
        th
    }

    /// The thread that is running.
    pub fn current_thread(&self) -> Thread {
        let current = self.inner.current.lock();
        let th = current.clone();
        current.unlock();
        th.expect("no thread is running")
    }

    /// Get the state of the thread by tid.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] if no live thread has this tid. A
    /// finished thread leaves the table once its context is destroyed.
    pub fn get_state_by_tid(&self, tid: u64) -> Result<ThreadState, KernelError> {
        let mut threads = self.inner.threads.lock();
        let th = threads.get(&tid).and_then(Thread::upgrade);
        if th.is_none() {
            threads.remove(&tid);
        }
        threads.unlock();
        th.map(|th| th.state()).ok_or(KernelError::InvalidArgument)
    }

    /// Starts executing `th`.
    ///
    /// The thread's execution context is created and started, and the
    /// thread is put on the ready queue. `th` must be `New` and must have a
    /// target; forking a thread twice is a fault.
    pub fn fork(&self, th: &Thread) {
        assert_eq!(th.state(), ThreadState::New, "fork: {th} was already forked");
        let mut control = th.inner.control.lock();
        let Some(target) = control.target.take() else {
            control.unlock();
            panic!("fork: {th} has no target");
        };
        let tcb = Tcb::new();
        control.tcb = Some(tcb.clone());
        control.unlock();

        debug!(THREAD, "Forking thread: {} Runnable: {}", th, th.tid());

        let _guard = InterruptGuard::new(self.interrupt());
        let (kernel, me) = (self.clone(), th.clone());
        tcb.start(th.name(), move || kernel.run_thread(me, target));
        self.ready(th);
    }

    fn run_thread(&self, me: Thread, target: Box<dyn FnOnce() + Send>) {
        self.begin(&me);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(target)) {
            if Destroyed::is(payload.as_ref()) {
                panic::resume_unwind(payload);
            }
            let message = panic_message(payload.as_ref());
            warning!("{} faulted: {}", me, message);
            let mut control = me.inner.control.lock();
            control.fault = Some(message.clone());
            control.unlock();
            self.inner.faults.push(Fault {
                tid: me.tid(),
                name: me.name().to_string(),
                message,
            });
        }
        self.finish()
    }

    fn begin(&self, me: &Thread) {
        debug!(THREAD, "Beginning thread: {}", me);
        assert_eq!(self.current_thread(), *me);
        self.restore_state();
        self.interrupt().enable();
    }

    /// Finishes the execution of the current thread.
    ///
    /// This is called when the thread's work returns, but may also be called
    /// directly. Wakes the thread waiting in [`join`], marks the current
    /// thread `Finished` and switches away. The execution context is
    /// destroyed by the next thread that runs. No guard may be held across
    /// this call.
    ///
    /// [`join`]: Self::join
    pub fn finish(&self) -> ! {
        let current = self.current_thread();
        debug!(THREAD, "Finishing thread: {}", current);

        // Interrupts stay disabled until the next thread restores its state.
        let _ = self.interrupt().disable();

        let mut control = current.inner.control.lock();
        let waiter = control.join_queue.take().and_then(|mut q| q.next_thread());
        control.unlock();
        if let Some(waiter) = waiter {
            self.ready(&waiter);
        }

        let mut to_be_destroyed = self.inner.to_be_destroyed.lock();
        assert!(to_be_destroyed.is_none());
        *to_be_destroyed = Some(current.clone());
        to_be_destroyed.unlock();

        current.set_state(ThreadState::Finished);
        drop(current);
        self.sleep();
        unreachable!("a finished thread was scheduled again");
    }

    /// Relinquishes the cpu if any other thread is ready to run.
    ///
    /// The current thread goes back to the ready queue and is scheduled
    /// again later. Returns immediately if no other thread is ready.
    pub fn yield_now(&self) {
        let current = self.current_thread();
        debug!(THREAD, "Yielding thread: {}", current);
        assert_eq!(
            current.state(),
            ThreadState::Running,
            "yield: {current} is not running"
        );

        let _guard = InterruptGuard::new(self.interrupt());
        self.ready(&current);
        drop(current);
        self.run_next_thread();
    }

    /// Relinquishes the cpu because the current thread has finished or is
    /// blocked.
    ///
    /// Interrupts must be disabled. The current thread is not put back on
    /// the ready queue; someone must call [`ready`] on it to wake it.
    ///
    /// [`ready`]: Self::ready
    pub fn sleep(&self) {
        let current = self.current_thread();
        debug!(THREAD, "Sleeping thread: {}", current);
        assert!(
            self.interrupt().disabled(),
            "sleep: interrupts must be disabled"
        );
        if current.state() != ThreadState::Finished {
            current.set_state(ThreadState::Blocked);
        }
        drop(current);
        self.run_next_thread();
    }

    /// Moves `th` to the ready state and adds it to the ready queue.
    ///
    /// Interrupts must be disabled. The idle thread is never queued; it
    /// runs only when the ready queue is empty.
    pub fn ready(&self, th: &Thread) {
        debug!(THREAD, "Ready thread: {}", th);
        assert!(
            self.interrupt().disabled(),
            "ready: interrupts must be disabled"
        );
        let state = th.state();
        assert!(
            state != ThreadState::Ready && state != ThreadState::Finished,
            "ready: {th} is in an inconsistent state ({state:?})"
        );

        th.set_state(ThreadState::Ready);
        if !self.is_idle(th) {
            let mut ready_queue = self.inner.ready_queue.lock();
            ready_queue.wait_for_access(th.clone());
            ready_queue.unlock();
        }
    }

    /// Waits for `th` to finish.
    ///
    /// Returns immediately if `th` already finished. Only the first thread
    /// to join `th` waits; later joiners, and joins that would close a cycle
    /// of threads waiting on each other, return immediately, and so does
    /// joining the same target again. A thread joining itself faults.
    pub fn join(&self, th: &Thread) {
        let current = self.current_thread();
        debug!(THREAD, "Joining to thread: {}", th);
        assert!(current != *th, "join: {current} cannot join itself");

        let guard = InterruptGuard::new(self.interrupt());
        if th.state() == ThreadState::Finished {
            return;
        }

        let mut mine = current.inner.control.lock();
        if mine.joined_targets.contains(&th.tid()) {
            mine.unlock();
            warning!("join: {} was already joined by {}", th, current);
            return;
        }
        if mine.joined_targets.is_full() {
            mine.joined_targets.remove(0);
        }
        mine.joined_targets.push(th.tid());
        let inherited = mine.joiners.clone();
        mine.unlock();
        if inherited.contains(&th.tid()) || self.waits_on(th, &current) {
            warning!("join: {} is waiting on {}, skip to avoid deadlock", th, current);
            return;
        }

        let mut control = th.inner.control.lock();
        if control.joined {
            control.unlock();
            warning!("join: {} is already joined", th);
            return;
        }
        control.joined = true;
        for tid in std::iter::once(current.tid()).chain(inherited) {
            if !control.joiners.contains(&tid) && control.joiners.try_push(tid).is_err() {
                control.unlock();
                panic!("join: more than {MAX_JOIN_DEPTH} threads wait on {th}");
            }
        }
        let mut join_queue = self.scheduler().new_thread_queue(false);
        join_queue.acquire(th);
        join_queue.wait_for_access(current.clone());
        control.join_queue = Some(join_queue);
        control.unlock();

        let mut mine = current.inner.control.lock();
        mine.waiting_on = Some(th.clone());
        mine.unlock();
        self.sleep();
        let mut mine = current.inner.control.lock();
        mine.waiting_on = None;
        mine.unlock();
        drop(current);
        drop(guard);
    }

    /// Returns true if `th` is blocked, directly or through a chain of joins,
    /// joining `target`.
    fn waits_on(&self, th: &Thread, target: &Thread) -> bool {
        let mut next = Some(th.clone());
        while let Some(th) = next {
            if th == *target {
                return true;
            }
            let control = th.inner.control.lock();
            next = control.waiting_on.clone();
            control.unlock();
        }
        false
    }

    pub(crate) fn create_idle_thread(&self) {
        let idle = self.create_thread("idle");
        let kernel = self.clone();
        idle.set_target(move || {
            loop {
                kernel.yield_now();
            }
        });
        let mut slot = self.inner.idle.lock();
        assert!(slot.is_none());
        *slot = Some(idle.clone());
        slot.unlock();
        self.fork(&idle);
    }

    fn is_idle(&self, th: &Thread) -> bool {
        let idle = self.inner.idle.lock();
        let result = idle.as_ref() == Some(th);
        idle.unlock();
        result
    }

    fn run_next_thread(&self) {
        let mut ready_queue = self.inner.ready_queue.lock();
        let next = ready_queue.next_thread();
        ready_queue.unlock();
        let next = match next {
            Some(next) => next,
            None => {
                let idle = self.inner.idle.lock();
                let th = idle.clone();
                idle.unlock();
                th.expect("no thread is ready and there is no idle thread")
            }
        };
        self.run(next);
    }

    /// Dispatches the cpu to `next`.
    ///
    /// Saves the state of the current thread, switches to the execution
    /// context of `next`, and, once this thread is scheduled again, restores
    /// its state.
    fn run(&self, next: Thread) {
        assert!(self.interrupt().disabled());
        let tcb = next
            .tcb()
            .unwrap_or_else(|| panic!("run: {next} has no execution context"));

        let mut current = self.inner.current.lock();
        let prev = current.replace(next.clone());
        current.unlock();
        if let Some(prev) = prev {
            debug!(THREAD, "Switching from: {} to: {}", prev, next);
        }
        drop(next);

        tcb.context_switch();
        self.restore_state();
    }

    pub(crate) fn restore_state(&self) {
        let current = self.current_thread();
        debug!(THREAD, "Running thread: {}", current);
        assert!(self.interrupt().disabled());
        assert!(
            current.tcb().is_some_and(|tcb| tcb.is_current()),
            "{current} resumed on a foreign execution context"
        );
        current.set_state(ThreadState::Running);

        let mut to_be_destroyed = self.inner.to_be_destroyed.lock();
        let dead = to_be_destroyed.take();
        to_be_destroyed.unlock();
        if let Some(dead) = dead {
            self.destroy(&dead);
        }
    }

    pub(crate) fn destroy(&self, dead: &Thread) {
        debug!(THREAD, "Destroying thread: {}", dead);
        let mut threads = self.inner.threads.lock();
        threads.remove(&dead.tid());
        threads.unlock();
        let mut control = dead.inner.control.lock();
        let tcb = control.tcb.take();
        control.unlock();
        if let Some(tcb) = tcb {
            tcb.destroy();
        }
    }

    pub(crate) fn attach_current_context(&self, th: &Thread) {
        let mut control = th.inner.control.lock();
        control.tcb = Some(Tcb::adopt_current());
        control.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemConfigurationBuilder;

    #[test]
    fn thread_identity() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let main = kernel.current_thread();
        assert_eq!(main.name(), "main");
        assert_eq!(main.state(), ThreadState::Running);

        let a = kernel.create_thread("a");
        let b = kernel.create_thread("b");
        assert!(a < b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), format!("a (#{})", a.tid()));
        assert_eq!(kernel.get_state_by_tid(a.tid()), Ok(ThreadState::New));
        assert_eq!(
            kernel.get_state_by_tid(u64::MAX),
            Err(KernelError::InvalidArgument)
        );
        kernel.shutdown();
    }

    #[test]
    fn fork_and_join() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let log = Arc::new(SpinLock::new(Vec::new()));
        let handles = (0..3)
            .map(|i| {
                let (log, k) = (log.clone(), kernel.clone());
                ThreadBuilder::new(&kernel, format!("worker{i}")).spawn(move || {
                    for _ in 0..3 {
                        let mut log = log.lock();
                        log.push(i);
                        log.unlock();
                        k.yield_now();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let th = handle.thread().clone();
            assert_eq!(handle.join(), Ok(()));
            assert_eq!(th.state(), ThreadState::Finished);
        }
        let log = log.lock();
        assert_eq!(log.len(), 9);
        for i in 0..3 {
            assert_eq!(log.iter().filter(|&&n| n == i).count(), 3);
        }
        log.unlock();
        kernel.shutdown();
    }

    #[test]
    fn reaped_threads_leave_the_table() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let table_len = || {
            let threads = kernel.inner.threads.lock();
            let len = threads.len();
            threads.unlock();
            len
        };
        let before = table_len();
        let handles = (0..4)
            .map(|i| ThreadBuilder::new(&kernel, format!("short{i}")).spawn(|| ()))
            .collect::<Vec<_>>();
        assert_eq!(table_len(), before + 4);
        let tids = handles
            .into_iter()
            .map(|handle| {
                let tid = handle.thread().tid();
                handle.join().unwrap();
                tid
            })
            .collect::<Vec<_>>();
        assert_eq!(table_len(), before);
        for tid in tids {
            assert_eq!(
                kernel.get_state_by_tid(tid),
                Err(KernelError::InvalidArgument)
            );
        }

        // A handle dropped without forking is pruned on lookup.
        let tid = kernel.create_thread("unused").tid();
        assert_eq!(
            kernel.get_state_by_tid(tid),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(table_len(), before);
        kernel.shutdown();
    }

    #[test]
    fn joined_targets_evict_oldest() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let targets = (0..=MAX_JOIN_DEPTH)
            .map(|i| kernel.create_thread(format!("target{i}")))
            .collect::<Vec<_>>();
        for th in targets.iter() {
            // Somebody else already waits on it, so joining returns at once.
            let mut control = th.inner.control.lock();
            control.joined = true;
            control.unlock();
            kernel.join(th);
        }

        let main = kernel.current_thread();
        let control = main.inner.control.lock();
        let joined = control.joined_targets.clone();
        control.unlock();
        assert_eq!(joined.len(), MAX_JOIN_DEPTH);
        assert!(!joined.contains(&targets[0].tid()));
        assert_eq!(
            joined.as_slice(),
            targets[1..].iter().map(Thread::tid).collect::<Vec<_>>()
        );
        kernel.shutdown();
    }

    #[test]
    fn fault_is_recorded() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        let handle = ThreadBuilder::new(&kernel, "faulty").spawn(|| panic!("boom"));
        let th = handle.thread().clone();
        assert_eq!(handle.join(), Err("boom".to_string()));
        let faults = kernel.take_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].tid, th.tid());
        assert_eq!(faults[0].message, "boom");
        kernel.shutdown();
    }
}
