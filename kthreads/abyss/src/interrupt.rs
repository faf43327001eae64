//! Interrupt controller and the machine clock.
//!
//! The machine has a single interrupt line. Devices schedule interrupts at
//! an absolute tick. Pending interrupts are delivered only when interrupts
//! go from disabled to enabled: at that point the clock advances by the
//! kernel tick and every interrupt that became due is handled, in order,
//! with interrupts disabled.
use crate::spinlock::SpinLock;
use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Enumeration representing the interrupt state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

/// An interrupt service routine.
pub type Handler = Arc<dyn Fn() + Send + Sync>;

struct PendingInterrupt {
    time: u64,
    seq: u64,
    kind: &'static str,
    handler: Handler,
}

impl PartialEq for PendingInterrupt {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.seq) == (other.time, other.seq)
    }
}

impl Eq for PendingInterrupt {}

impl PartialOrd for PendingInterrupt {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingInterrupt {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

/// The interrupt controller.
pub struct Interrupt {
    enabled: AtomicBool,
    halted: AtomicBool,
    ticks: AtomicU64,
    kernel_tick: u64,
    seq: AtomicU64,
    pending: SpinLock<BinaryHeap<Reverse<PendingInterrupt>>>,
}

impl Interrupt {
    /// Creates an interrupt controller with interrupts disabled.
    pub fn new(kernel_tick: u64) -> Self {
        assert!(kernel_tick > 0, "kernel tick must be positive");
        Self {
            enabled: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            kernel_tick,
            seq: AtomicU64::new(0),
            pending: SpinLock::new(BinaryHeap::new()),
        }
    }

    /// Reads the current interrupt state.
    pub fn current(&self) -> InterruptState {
        if self.enabled.load(Ordering::SeqCst) {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// Returns true if interrupts are disabled.
    pub fn disabled(&self) -> bool {
        self.current() == InterruptState::Off
    }

    /// Disables interrupts and returns the previous state.
    pub fn disable(&self) -> InterruptState {
        self.set_status(InterruptState::Off)
    }

    /// Restores the state returned by a previous [`disable`].
    ///
    /// Restoring to [`InterruptState::On`] from the disabled state advances
    /// the clock and delivers due interrupts.
    ///
    /// [`disable`]: Self::disable
    pub fn restore(&self, state: InterruptState) {
        self.set_status(state);
    }

    /// Enables interrupts.
    pub fn enable(&self) {
        self.set_status(InterruptState::On);
    }

    fn set_status(&self, state: InterruptState) -> InterruptState {
        let old = self.current();
        self.enabled
            .store(state == InterruptState::On, Ordering::SeqCst);
        if old == InterruptState::Off && state == InterruptState::On {
            self.tick();
        }
        old
    }

    /// The current time in ticks.
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Schedules `handler` to run `delay` ticks from now.
    pub fn schedule(&self, delay: u64, kind: &'static str, handler: Handler) {
        let time = self.now() + delay;
        debug!(INTERRUPT, "Scheduling {} interrupt at {}", kind, time);
        let mut pending = self.pending.lock();
        pending.push(Reverse(PendingInterrupt {
            time,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            kind,
            handler,
        }));
        pending.unlock();
    }

    /// Number of interrupts not yet delivered.
    pub fn pending(&self) -> usize {
        let pending = self.pending.lock();
        let len = pending.len();
        pending.unlock();
        len
    }

    /// Halts the machine: the clock stops and nothing is delivered anymore.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        pending.clear();
        pending.unlock();
    }

    /// Returns true once the machine is halted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        if self.is_halted() {
            return;
        }
        let now = self.ticks.fetch_add(self.kernel_tick, Ordering::SeqCst) + self.kernel_tick;
        debug!(INTERRUPT, "== Tick {} ==", now);
        self.enabled.store(false, Ordering::SeqCst);
        while let Some(pending) = self.next_due(now) {
            debug!(INTERRUPT, "Invoking {} interrupt at {}", pending.kind, now);
            (pending.handler)();
            if self.is_halted() {
                return;
            }
        }
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn next_due(&self, now: u64) -> Option<PendingInterrupt> {
        let mut pending = self.pending.lock();
        let due = match pending.peek() {
            Some(Reverse(next)) if next.time <= now => pending.pop().map(|Reverse(p)| p),
            _ => None,
        };
        pending.unlock();
        due
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard
/// was created.
///
/// Guards must be dropped in reverse order of their creation. The saved
/// state travels with the guard, so a guard that is held across a context
/// switch restores exactly what its own thread had.
pub struct InterruptGuard<'a> {
    interrupt: &'a Interrupt,
    prev: InterruptState,
    _not_send: PhantomData<*const ()>,
}

impl<'a> InterruptGuard<'a> {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    pub fn new(interrupt: &'a Interrupt) -> Self {
        Self {
            prev: interrupt.disable(),
            interrupt,
            _not_send: PhantomData,
        }
    }

    /// The state that will be restored on drop.
    pub fn previous(&self) -> InterruptState {
        self.prev
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if crate::tcb::holds_cpu() {
            self.interrupt.restore(self.prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn nested_guards() {
        let interrupt = Interrupt::new(1);
        interrupt.enable();
        assert_eq!(interrupt.now(), 1);
        {
            let outer = InterruptGuard::new(&interrupt);
            assert_eq!(outer.previous(), InterruptState::On);
            {
                let inner = InterruptGuard::new(&interrupt);
                assert_eq!(inner.previous(), InterruptState::Off);
            }
            assert!(interrupt.disabled());
            assert_eq!(interrupt.now(), 1);
        }
        assert!(!interrupt.disabled());
        assert_eq!(interrupt.now(), 2);
    }

    #[test]
    fn delivers_due_interrupts_in_order() {
        let interrupt = Arc::new(Interrupt::new(5));
        let log = Arc::new(SpinLock::new(Vec::new()));
        for (delay, id) in [(10, 2), (5, 1), (10, 3), (50, 4)] {
            let (log, inner) = (log.clone(), interrupt.clone());
            interrupt.schedule(
                delay,
                "test",
                Arc::new(move || {
                    assert!(inner.disabled());
                    let mut log = log.lock();
                    log.push(id);
                    log.unlock();
                }),
            );
        }
        interrupt.enable();
        let _ = interrupt.disable();
        interrupt.enable();
        let _ = interrupt.disable();
        assert_eq!(interrupt.now(), 10);
        assert_eq!(interrupt.pending(), 1);
        let log = log.lock();
        assert_eq!(*log, vec![1, 2, 3]);
        log.unlock();
    }

    #[test]
    fn halted_machine_stops() {
        let interrupt = Arc::new(Interrupt::new(1));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        interrupt.schedule(
            1,
            "test",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        interrupt.halt();
        interrupt.enable();
        assert_eq!(interrupt.now(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
