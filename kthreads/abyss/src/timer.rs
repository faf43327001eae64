//! Periodic timer device.
use crate::{
    interrupt::{Handler, Interrupt},
    spinlock::SpinLock,
};
use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

/// A timer that raises an interrupt every `interval` ticks.
pub struct Timer {
    interrupt: Arc<Interrupt>,
    interval: u64,
    handler: SpinLock<Option<Handler>>,
    last_interrupt: AtomicU64,
    me: Weak<Timer>,
}

impl Timer {
    /// Creates a timer and arms its first interrupt.
    pub fn new(interrupt: Arc<Interrupt>, interval: u64) -> Arc<Self> {
        assert!(interval > 0, "timer interval must be positive");
        let timer = Arc::new_cyclic(|me| Self {
            interrupt,
            interval,
            handler: SpinLock::new(None),
            last_interrupt: AtomicU64::new(0),
            me: me.clone(),
        });
        timer.schedule_interrupt();
        timer
    }

    /// Installs the routine called on every timer interrupt.
    ///
    /// The routine runs with interrupts disabled.
    pub fn set_interrupt_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.handler.lock();
        *slot = Some(Arc::new(handler));
        slot.unlock();
    }

    /// Removes the installed routine.
    pub fn clear_interrupt_handler(&self) {
        let mut slot = self.handler.lock();
        *slot = None;
        slot.unlock();
    }

    /// The current time in ticks.
    pub fn get_time(&self) -> u64 {
        self.interrupt.now()
    }

    /// The tick at which the last timer interrupt was delivered.
    pub fn last_interrupt(&self) -> u64 {
        self.last_interrupt.load(Ordering::SeqCst)
    }

    /// The number of ticks between timer interrupts.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    fn schedule_interrupt(&self) {
        let me = self.me.clone();
        self.interrupt.schedule(
            self.interval,
            "timer",
            Arc::new(move || {
                if let Some(timer) = me.upgrade() {
                    timer.timer_interrupt();
                }
            }),
        );
    }

    fn timer_interrupt(&self) {
        self.schedule_interrupt();
        self.last_interrupt
            .store(self.interrupt.now(), Ordering::SeqCst);
        let slot = self.handler.lock();
        let handler = slot.clone();
        slot.unlock();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_periodically() {
        let interrupt = Arc::new(Interrupt::new(10));
        let timer = Timer::new(interrupt.clone(), 30);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.set_interrupt_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..10 {
            interrupt.enable();
            let _ = interrupt.disable();
        }
        assert_eq!(timer.get_time(), 100);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(timer.last_interrupt(), 90);
    }
}
