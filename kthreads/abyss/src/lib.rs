//! The abyss of the kernel that simulates the machine.
//!
//! This crate contains the pieces of "hardware" the thread core runs on: a
//! single interrupt line with a tick clock, a periodic timer, execution
//! contexts (TCBs) and the spin lock used for short machine-level critical
//! sections.
//!
//! The machine is simulated on the host. Every TCB is backed by a host
//! thread, but only one of them holds the CPU at any moment; the others are
//! parked until a context switch hands the CPU to them. Time is not wall
//! clock time. The clock advances by a fixed number of ticks whenever
//! interrupts are re-enabled, which keeps every run deterministic.
//!
//! You are **not** supposed to use the modules of this crate directly to
//! build threads on top of. See the [`kthreads`] crate for what is available.
//!
//! [`kthreads`]: ../kthreads/index.html

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod interrupt;
pub mod spinlock;
pub mod tcb;
pub mod timer;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Suppresses `info!` and `warning!` messages when set.
pub static QUIET: AtomicBool = AtomicBool::new(false);

/// Sets the quiet switch of the console.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::SeqCst);
}

/// A simulated single-CPU machine.
///
/// The machine owns the interrupt controller and the periodic timer that is
/// wired to it.
pub struct Machine {
    interrupt: Arc<interrupt::Interrupt>,
    timer: Arc<timer::Timer>,
}

impl Machine {
    /// Creates a machine whose clock advances `kernel_tick` ticks each time
    /// interrupts are re-enabled, and whose timer fires every
    /// `timer_interval` ticks.
    ///
    /// The machine starts with interrupts disabled.
    pub fn new(kernel_tick: u64, timer_interval: u64) -> Self {
        let interrupt = Arc::new(interrupt::Interrupt::new(kernel_tick));
        let timer = timer::Timer::new(interrupt.clone(), timer_interval);
        debug!(
            MACHINE,
            "Machine: tick {} / timer interval {}", kernel_tick, timer_interval
        );
        Self { interrupt, timer }
    }

    /// The interrupt controller.
    pub fn interrupt(&self) -> &Arc<interrupt::Interrupt> {
        &self.interrupt
    }

    /// The periodic timer.
    pub fn timer(&self) -> &Arc<timer::Timer> {
        &self.timer
    }

    /// Stops the machine.
    ///
    /// The clock stops and no interrupt is delivered afterwards.
    pub fn halt(&self) {
        self.interrupt.halt();
        self.timer.clear_interrupt_handler();
        info!("Machine halting! Ticks: total {}", self.interrupt.now());
    }
}
