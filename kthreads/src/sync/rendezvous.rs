//! # Rendezvous.
//!
//! A synchronous, unbuffered channel. [`Rendezvous::speak`] and
//! [`Rendezvous::listen`] meet: each message a speaker sends is received by
//! exactly one listener, and neither call returns before the exchange took
//! place. Any number of speakers and listeners may use the same channel.
//!
//! The exchange is a handshake over one lock and three condition variables:
//!
//! 1. A speaker waits until no other handshake is in progress, claims the
//!    handshake and puts its message in the single slot.
//! 2. If no listener is waiting, the speaker waits for one to arrive.
//! 3. The speaker wakes one listener and waits for it to acknowledge.
//! 4. The listener acknowledges, takes the message and leaves. The speaker
//!    releases the handshake and lets the next speaker in.
//!
//! Because the slot is claimed for the whole handshake, at most one message
//! is pending, and it is only visible to the listener woken for it.
use super::{condition_variable::ConditionVariable, mutex::Mutex};
use crate::Kernel;

struct Exchange<T> {
    handshake: bool,
    listeners: usize,
    message: Option<T>,
}

/// A synchronous channel where speakers and listeners meet one-to-one.
pub struct Rendezvous<T> {
    lock: Mutex<Exchange<T>>,
    speaker: ConditionVariable,
    handshake: ConditionVariable,
    listener: ConditionVariable,
}

impl<T: Send> Rendezvous<T> {
    /// Creates an empty channel.
    pub fn new(kernel: &Kernel) -> Self {
        let lock = Mutex::new(
            kernel,
            Exchange {
                handshake: false,
                listeners: 0,
                message: None,
            },
        );
        Self {
            speaker: ConditionVariable::new(&lock),
            handshake: ConditionVariable::new(&lock),
            listener: ConditionVariable::new(&lock),
            lock,
        }
    }

    /// Sends `message` and waits until a listener received it.
    pub fn speak(&self, message: T) {
        let mut guard = self.speaker.wait_while(self.lock.lock(), |ex| ex.handshake);
        guard.handshake = true;
        guard.message = Some(message);

        guard = self.handshake.wait_while(guard, |ex| ex.listeners == 0);
        self.listener.wake(&guard);
        guard = self.handshake.sleep(guard);

        guard.handshake = false;
        self.speaker.wake(&guard);
        guard.unlock();
    }

    /// Waits for a speaker and returns its message.
    pub fn listen(&self) -> T {
        let mut guard = self.lock.lock();
        guard.listeners += 1;
        if guard.listeners == 1 && guard.handshake {
            self.handshake.wake(&guard);
        }
        guard = self.listener.sleep(guard);

        self.handshake.wake(&guard);
        guard.listeners -= 1;
        let message = guard
            .message
            .take()
            .expect("listener woken without a pending message");
        guard.unlock();
        message
    }

    /// Number of listeners waiting for a speaker.
    pub fn waiting_listeners(&self) -> usize {
        let guard = self.lock.lock();
        let listeners = guard.listeners;
        guard.unlock();
        listeners
    }
}
