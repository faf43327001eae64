//! # kthreads: a cooperative kernel-thread core
//!
//! This crate implements the thread subsystem of a small single-cpu kernel
//! on top of the simulated machine in [`abyss`]:
//!
//! - **[`thread`]**: thread lifecycle (fork, yield, sleep, ready, join,
//!   finish) and the scheduler loop that hands the cpu from thread to
//!   thread. The order in which threads run is decided by a pluggable
//!   [`Scheduler`].
//! - **[`alarm`]**: puts threads to sleep until the clock passes a deadline,
//!   driven by the periodic timer interrupt.
//! - **[`sync`]**: synchronization primitives built from nothing but
//!   "disable interrupts" and explicit wait queues: a blocking [`Mutex`],
//!   condition variables, a rendezvous channel and a two-reagent reaction.
//!
//! [`Mutex`]: sync::Mutex
//!
//! ## Booting
//!
//! A kernel is an explicit object. [`SystemConfigurationBuilder::boot`]
//! turns the calling thread into the `main` kernel thread, creates the idle
//! thread, wires the alarm to the timer and enables interrupts:
//!
//! ```
//! use kthreads::{SystemConfigurationBuilder, thread::ThreadBuilder};
//!
//! let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
//! let k = kernel.clone();
//! let handle = ThreadBuilder::new(&kernel, "sleeper").spawn(move || k.wait_until(100));
//! handle.join().unwrap();
//! assert!(kernel.now() >= 100);
//! kernel.shutdown();
//! ```
//!
//! ## Faults
//!
//! Breaking a contract of this crate (joining yourself, forking twice,
//! sleeping with interrupts enabled, waking a condition variable without its
//! lock...) panics. The panic unwinds only the offending kernel thread: the
//! fault is recorded on the thread ([`Thread::fault`]) and in the kernel's
//! fault log ([`Kernel::take_faults`]), and the thread finishes.
//!
//! [`Thread::fault`]: thread::Thread::fault
//!
//! ## Debugging
//!
//! Debug messages are grouped by [`DebugFlags`]. Enable them with
//! [`SystemConfigurationBuilder::debug`] or with `-d <flags>` on the grader
//! command line (e.g. `-d tc` for threads and condition variables).

#[macro_use]
extern crate abyss;

pub mod alarm;
pub mod sync;
pub mod thread;

pub use abyss::{
    debug, info, interrupt::InterruptGuard, kprint, kprint::DebugFlags, kprintln, warning,
};

use abyss::{Machine, interrupt::Interrupt, spinlock::SpinLock};
use alarm::Alarm;
use crossbeam_queue::SegQueue;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak, atomic::AtomicU64},
};
use thread::{
    Fault, Thread, ThreadBuilder, ThreadInner,
    scheduler::{Fifo, Scheduler, ThreadQueue},
};

/// Enum representing errors that can occur during a kernel operation.
///
/// Only configuration and lookups fail recoverably. Contract violations
/// fault the offending thread instead.
#[derive(Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring the kernel before it boots: the scheduling policy, the
/// timing of the simulated machine and the console.
pub struct SystemConfigurationBuilder {
    scheduler: Box<dyn Scheduler>,
    timer_interval: u64,
    kernel_tick: u64,
    debug: DebugFlags,
    quiet: bool,
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemConfigurationBuilder {
    /// Default number of ticks between two timer interrupts.
    pub const TIMER_INTERVAL: u64 = 500;
    /// Default number of ticks the clock advances whenever interrupts are
    /// re-enabled.
    pub const KERNEL_TICK: u64 = 1;

    /// Creates the default configuration: a [`Fifo`] scheduler, a timer
    /// interrupt every 500 ticks and 1 tick per interrupt re-enable.
    pub fn new() -> Self {
        Self {
            scheduler: Box::new(Fifo),
            timer_interval: Self::TIMER_INTERVAL,
            kernel_tick: Self::KERNEL_TICK,
            debug: DebugFlags::empty(),
            quiet: false,
        }
    }

    /// Sets the system-wide scheduler.
    pub fn set_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Sets the number of ticks between two timer interrupts.
    pub fn timer_interval(mut self, ticks: u64) -> Self {
        assert!(ticks > 0, "timer interval must be positive");
        self.timer_interval = ticks;
        self
    }

    /// Sets the number of ticks the clock advances whenever interrupts are
    /// re-enabled.
    pub fn kernel_tick(mut self, ticks: u64) -> Self {
        assert!(ticks > 0, "kernel tick must be positive");
        self.kernel_tick = ticks;
        self
    }

    /// Enables the debug messages of the given categories.
    pub fn debug(mut self, flags: DebugFlags) -> Self {
        self.debug = flags;
        self
    }

    /// Silences `info!` and `warning!` messages.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Parses a command line.
    ///
    /// Recognized options are `-d <flags>`, `-s <scheduler>`, `--timer
    /// <ticks>`, `--tick <ticks>` and `-q`. Every other word is returned as
    /// a test filter.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a missing or malformed value, and
    /// [`KernelError::NotSupportedOperation`] on an unknown scheduler.
    pub fn from_cmdline<'a>(
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<(Self, Vec<String>), KernelError> {
        fn ticks(value: Option<&str>) -> Result<u64, KernelError> {
            match value.map(str::parse::<u64>) {
                Some(Ok(ticks)) if ticks > 0 => Ok(ticks),
                _ => Err(KernelError::InvalidArgument),
            }
        }

        let (mut builder, mut filters) = (Self::new(), Vec::new());
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg {
                "-d" => {
                    builder.debug = args
                        .next()
                        .and_then(DebugFlags::from_chars)
                        .ok_or(KernelError::InvalidArgument)?;
                }
                "-s" => match args.next() {
                    Some("fifo") | Some("rr") => builder.scheduler = Box::new(Fifo),
                    Some(_) => return Err(KernelError::NotSupportedOperation),
                    None => return Err(KernelError::InvalidArgument),
                },
                "--timer" => builder.timer_interval = ticks(args.next())?,
                "--tick" => builder.kernel_tick = ticks(args.next())?,
                "-q" => builder.quiet = true,
                filter => filters.push(filter.to_string()),
            }
        }
        Ok((builder, filters))
    }

    /// Boots the kernel on the calling thread.
    ///
    /// The calling thread becomes the `main` kernel thread and must stay the
    /// only host thread that calls into the kernel until [`Kernel::shutdown`].
    pub fn boot(self) -> Kernel {
        abyss::set_quiet(self.quiet);
        abyss::kprint::set_debug_flags(self.debug);

        let machine = Machine::new(self.kernel_tick, self.timer_interval);
        let ready_queue = self.scheduler.new_thread_queue(false);
        info!("Scheduler: {}", self.scheduler.name());
        let kernel = Kernel {
            inner: Arc::new(KernelInner {
                machine,
                scheduler: self.scheduler,
                ready_queue: SpinLock::new(ready_queue),
                current: SpinLock::new(None),
                idle: SpinLock::new(None),
                to_be_destroyed: SpinLock::new(None),
                next_tid: AtomicU64::new(0),
                threads: SpinLock::new(BTreeMap::new()),
                faults: SegQueue::new(),
                alarm: Alarm::new(),
            }),
        };

        let main = kernel.create_thread("main");
        kernel.attach_current_context(&main);
        let mut ready_queue = kernel.inner.ready_queue.lock();
        ready_queue.acquire(&main);
        ready_queue.unlock();
        let mut current = kernel.inner.current.lock();
        *current = Some(main);
        current.unlock();
        kernel.restore_state();

        kernel.create_idle_thread();

        let inner = Arc::downgrade(&kernel.inner);
        kernel
            .inner
            .machine
            .timer()
            .set_interrupt_handler(move || {
                if let Some(inner) = inner.upgrade() {
                    Kernel { inner }.timer_interrupt();
                }
            });

        info!("Kernel: booted.");
        kernel.interrupt().enable();
        kernel
    }
}

pub(crate) struct KernelInner {
    machine: Machine,
    scheduler: Box<dyn Scheduler>,
    ready_queue: SpinLock<Box<dyn ThreadQueue>>,
    current: SpinLock<Option<Thread>>,
    idle: SpinLock<Option<Thread>>,
    to_be_destroyed: SpinLock<Option<Thread>>,
    next_tid: AtomicU64,
    threads: SpinLock<BTreeMap<u64, Weak<ThreadInner>>>,
    faults: SegQueue<Fault>,
    alarm: Alarm,
}

/// A booted kernel.
///
/// `Kernel` is a handle; clones refer to the same kernel. Every kernel
/// operation must be called from a kernel thread of this kernel.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

impl Kernel {
    /// The interrupt controller of the machine.
    ///
    /// Use [`abyss::interrupt::InterruptGuard`] to disable interrupts for a
    /// scope.
    pub fn interrupt(&self) -> &Interrupt {
        self.inner.machine.interrupt()
    }

    /// The scheduler the kernel was booted with.
    pub fn scheduler(&self) -> &dyn Scheduler {
        self.inner.scheduler.as_ref()
    }

    /// The alarm of the kernel.
    pub fn alarm(&self) -> &Alarm {
        &self.inner.alarm
    }

    /// The current time in ticks.
    pub fn now(&self) -> u64 {
        self.inner.machine.timer().get_time()
    }

    /// Drains the fault log.
    pub fn take_faults(&self) -> Vec<Fault> {
        std::iter::from_fn(|| self.inner.faults.pop()).collect()
    }

    /// Halts the machine.
    ///
    /// Threads that are still blocked or ready are never run again.
    pub fn shutdown(self) {
        let _ = self.interrupt().disable();

        let mut to_be_destroyed = self.inner.to_be_destroyed.lock();
        let dead = to_be_destroyed.take();
        to_be_destroyed.unlock();
        if let Some(dead) = dead {
            self.destroy(&dead);
        }

        let mut ready_queue = self.inner.ready_queue.lock();
        let mut abandoned = 0;
        while ready_queue.next_thread().is_some() {
            abandoned += 1;
        }
        ready_queue.unlock();
        if abandoned > 0 {
            warning!("Kernel: {} ready threads abandoned at shutdown.", abandoned);
        }

        self.inner.machine.halt();
    }
}

// Test utilities
#[doc(hidden)]
pub trait TestCase
where
    Self: Sync + Send,
{
    fn name(&'static self) -> &'static str;
    fn run(&'static self, kernel: &Kernel) -> bool;
}

impl<T> TestCase for T
where
    T: Fn(&Kernel) + Send + Sync + 'static,
{
    fn name(&'static self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn run(&'static self, kernel: &Kernel) -> bool {
        kprint!("test {} ... ", self.name());
        let k = kernel.clone();
        match ThreadBuilder::new(kernel, self.name())
            .spawn(move || self(&k))
            .join()
        {
            Ok(()) => {
                kprintln!("ok");
                true
            }
            Err(fault) => {
                kprintln!("FAILED");
                kprintln!("    {}", fault);
                false
            }
        }
    }
}

/// A driver for running tests.
pub struct TestDriver;

impl TestDriver {
    /// Run the given tests whose names match `filters`, or all tests when
    /// `filters` is empty. Returns true if every test passed.
    ///
    /// A filter matches a test name with its leading crate name stripped,
    /// e.g. `thread::join_finished`.
    pub fn start<const TC: usize>(
        kernel: &Kernel,
        tests: [&'static dyn TestCase; TC],
        filters: &[String],
    ) -> bool {
        let tests = tests
            .into_iter()
            .filter(|test| {
                let name = test.name();
                let r = name.split("::").next().map(|n| n.len() + 2).unwrap_or(0);
                filters.is_empty() || filters.iter().any(|f| f == &name[r.min(name.len())..])
            })
            .collect::<Vec<_>>();
        let (total, mut succ) = (tests.len(), 0);
        kprintln!(
            "Running {} test{}",
            total,
            if total == 1 { "" } else { "s" }
        );

        for test in tests {
            if test.run(kernel) {
                succ += 1;
            }
        }
        kprintln!(
            "test result: {}. {} passed; {} failed",
            if total == succ { "ok" } else { "FAILED" },
            succ,
            total - succ
        );
        total == succ
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cmdline() {
        let (builder, filters) = SystemConfigurationBuilder::from_cmdline(
            "-d tc --timer 100 --tick 2 -q thread::join sync::rendezvous::one"
                .split_whitespace(),
        )
        .unwrap();
        assert_eq!(builder.debug, DebugFlags::THREAD | DebugFlags::CONDITION);
        assert_eq!(builder.timer_interval, 100);
        assert_eq!(builder.kernel_tick, 2);
        assert!(builder.quiet);
        assert_eq!(filters, vec!["thread::join", "sync::rendezvous::one"]);
    }

    #[test]
    fn reject_bad_cmdline() {
        for cmdline in ["--timer 0", "--timer", "--tick x", "-d z", "-d"] {
            assert_eq!(
                SystemConfigurationBuilder::from_cmdline(cmdline.split_whitespace()).err(),
                Some(KernelError::InvalidArgument),
                "{cmdline}"
            );
        }
        assert_eq!(
            SystemConfigurationBuilder::from_cmdline(["-s", "lottery"]).err(),
            Some(KernelError::NotSupportedOperation)
        );
    }

    #[test]
    fn boot_and_shutdown() {
        let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
        assert!(!kernel.interrupt().disabled());
        assert_eq!(kernel.scheduler().name(), "fifo");
        let start = kernel.now();
        kernel.yield_now();
        assert!(kernel.now() > start);
        assert!(kernel.take_faults().is_empty());
        kernel.shutdown();
    }
}
