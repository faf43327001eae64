//! Thread control blocks: the execution contexts of the machine.
//!
//! Each TCB is backed by a host thread. The CPU is a baton: exactly one TCB
//! is running, and [`Tcb::context_switch`] passes the baton to another TCB
//! and parks the caller until the baton comes back.
use crate::spinlock::SpinLock;
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    any::Any,
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<(Tcb, Parker)>> = const { RefCell::new(None) };
}

/// Unwind payload used to tear down a destroyed context.
///
/// Code that catches unwinds on a TCB must let this payload through.
pub struct Destroyed;

impl Destroyed {
    /// Returns true if `payload` is the teardown payload.
    pub fn is(payload: &(dyn Any + Send)) -> bool {
        payload.is::<Destroyed>()
    }
}

/// Returns true if the caller may touch machine state.
///
/// This is false only on the host thread of a context that gave up the CPU,
/// e.g. while a destroyed context is unwinding. Host threads that are not
/// TCBs at all always hold the CPU.
pub fn holds_cpu() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_none_or(|(tcb, _)| tcb.inner.running.load(Ordering::SeqCst))
    })
}

struct TcbInner {
    id: u64,
    running: AtomicBool,
    destroyed: AtomicBool,
    unparker: Unparker,
    parker: SpinLock<Option<Parker>>,
    host: SpinLock<Option<JoinHandle<()>>>,
}

/// An execution context.
#[derive(Clone)]
pub struct Tcb {
    inner: Arc<TcbInner>,
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tcb {
    /// Creates a context that has not started yet.
    pub fn new() -> Self {
        let parker = Parker::new();
        Self {
            inner: Arc::new(TcbInner {
                id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                unparker: parker.unparker().clone(),
                parker: SpinLock::new(Some(parker)),
                host: SpinLock::new(None),
            }),
        }
    }

    /// Turns the calling host thread into the running context.
    ///
    /// This is how the machine boots: the first TCB is the thread that was
    /// already executing.
    pub fn adopt_current() -> Self {
        let tcb = Self::new();
        let parker = tcb.take_parker();
        tcb.inner.running.store(true, Ordering::SeqCst);
        CURRENT.with(|current| *current.borrow_mut() = Some((tcb.clone(), parker)));
        tcb
    }

    /// The identifier of this context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns true if this context is the one executing the caller.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|(tcb, _)| Arc::ptr_eq(&tcb.inner, &self.inner))
        })
    }

    fn take_parker(&self) -> Parker {
        let mut slot = self.inner.parker.lock();
        let parker = slot.take();
        slot.unlock();
        parker.expect("TCB already started")
    }

    /// Starts the host thread of this context.
    ///
    /// The new context does not run until some other context switches to
    /// it. `entry` must never return normally: a context gives up the CPU
    /// for the last time by switching away and waiting to be destroyed.
    pub fn start(&self, name: &str, entry: impl FnOnce() + Send + 'static) {
        let parker = self.take_parker();
        let tcb = self.clone();
        let host = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CURRENT.with(|current| *current.borrow_mut() = Some((tcb.clone(), parker)));
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    tcb.wait_for_cpu();
                    entry();
                }));
                CURRENT.with(|current| current.borrow_mut().take());
                match result {
                    Err(payload) if !Destroyed::is(payload.as_ref()) => {
                        panic::resume_unwind(payload)
                    }
                    _ => (),
                }
            })
            .expect("failed to spawn the host thread of a TCB");
        let mut slot = self.inner.host.lock();
        *slot = Some(host);
        slot.unlock();
    }

    /// Hands the CPU to this context and parks the caller until some context
    /// switches back to it.
    ///
    /// Switching to the running context is a no-op.
    pub fn context_switch(&self) {
        let me = CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|(tcb, _)| tcb.clone())
                .expect("context switch from outside of a TCB")
        });
        if Arc::ptr_eq(&me.inner, &self.inner) {
            return;
        }
        assert!(
            !self.inner.destroyed.load(Ordering::SeqCst),
            "context switch to a destroyed TCB"
        );
        me.inner.running.store(false, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.unparker.unpark();
        me.wait_for_cpu();
    }

    fn wait_for_cpu(&self) {
        while !self.inner.running.load(Ordering::SeqCst) {
            if self.inner.destroyed.load(Ordering::SeqCst) {
                panic::resume_unwind(Box::new(Destroyed));
            }
            CURRENT.with(|current| {
                if let Some((_, parker)) = current.borrow().as_ref() {
                    parker.park();
                }
            });
        }
    }

    /// Destroys a context that gave up the CPU.
    ///
    /// The host thread is unwound and joined. Destroying the running
    /// context is fatal.
    pub fn destroy(&self) {
        assert!(
            !self.inner.running.load(Ordering::SeqCst),
            "destroying the running TCB"
        );
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.unparker.unpark();
        let mut slot = self.inner.host.lock();
        let host = slot.take();
        slot.unlock();
        if let Some(host) = host {
            let _ = host.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_between_contexts() {
        let main = Tcb::adopt_current();
        let worker = Tcb::new();
        let log = Arc::new(SpinLock::new(Vec::new()));
        let (wlog, back) = (log.clone(), main.clone());
        worker.start("worker", move || {
            for i in 0..3 {
                let mut log = wlog.lock();
                log.push(("worker", i));
                log.unlock();
                back.context_switch();
            }
            back.context_switch();
        });
        for i in 0..3 {
            worker.context_switch();
            let mut log = log.lock();
            log.push(("main", i));
            log.unlock();
        }
        assert!(main.is_current());
        assert!(!worker.is_current());
        worker.context_switch();
        worker.destroy();
        let log = log.lock();
        assert_eq!(
            *log,
            vec![
                ("worker", 0),
                ("main", 0),
                ("worker", 1),
                ("main", 1),
                ("worker", 2),
                ("main", 2)
            ]
        );
        log.unlock();
    }
}
