//! # Synchronization Primitives.
//!
//! Every primitive in this module is built from two things only: disabling
//! interrupts, which makes a short sequence of steps atomic on the single
//! cpu, and explicit queues of blocked threads, which are woken with
//! [`Kernel::ready`].
//!
//! - [`Mutex`]: a blocking lock. A thread that finds the lock held sleeps
//!   until the holder hands the lock over.
//! - [`ConditionVariable`]: lets a thread holding a [`Mutex`] sleep until
//!   another thread signals that the protected state changed. Waiters are
//!   woken in FIFO order.
//! - [`Rendezvous`]: a synchronous channel. Every message is handed from one
//!   speaker to exactly one listener, and both return only after the
//!   exchange.
//! - [`Reaction`]: threads of two kinds arrive one at a time and leave in
//!   groups that match a recipe, e.g. two hydrogen and one oxygen.
//!
//! | Primitive             | Blocks Thread? | Fair?    | Typical Use Case                        |
//! |-----------------------|----------------|----------|-----------------------------------------|
//! | [`SpinLock`]          | No (busy wait) | No       | Kernel bookkeeping                      |
//! | [`Mutex`]             | Yes            | Depends  | Exclusive access to shared data         |
//! | [`ConditionVariable`] | Yes            | Yes      | Waiting for a condition to become true  |
//! | [`Rendezvous`]        | Yes            | Yes      | Handing values between threads          |
//! | [`Reaction`]          | Yes            | Yes      | Grouping threads by kind                |
//!
//! The fairness of [`Mutex`] is the fairness of the queues the
//! [`Scheduler`] creates.
//!
//! [`Kernel::ready`]: crate::Kernel::ready
//! [`SpinLock`]: abyss::spinlock::SpinLock
//! [`Scheduler`]: crate::thread::scheduler::Scheduler

pub mod condition_variable;
pub mod mutex;
pub mod reaction;
pub mod rendezvous;

pub use condition_variable::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use reaction::{Reaction, Reagent, Recipe};
pub use rendezvous::Rendezvous;
