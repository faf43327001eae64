//! Grading utilities.
//!
//! Test cases are plain functions taking the [`Kernel`]. Annotate them with
//! [`ktest`] to run each of them as an isolated `cargo test` test, and list
//! them in the grader's `main` to run them all on one kernel through the
//! [`TestDriver`].
//!
//! [`TestDriver`]: kthreads::TestDriver
extern crate grading_derive;

pub use grading_derive::*;

use kthreads::{Kernel, KernelError, SystemConfigurationBuilder, TestCase, thread::ThreadState};

/// Upper bound of yields spent in [`yield_until`].
pub const YIELD_LIMIT: usize = 100_000;

/// Boots a fresh kernel on the calling thread, runs `case` in a kernel
/// thread and shuts the kernel down. Panics if the case faulted.
pub fn run_isolated(case: &'static dyn TestCase) {
    let kernel = SystemConfigurationBuilder::new().quiet(true).boot();
    let passed = case.run(&kernel);
    kernel.shutdown();
    assert!(passed, "{} failed", case.name());
}

/// Yields until `condition` holds.
///
/// Panics after [`YIELD_LIMIT`] yields, so that a lost wakeup fails the case
/// instead of hanging it.
pub fn yield_until(kernel: &Kernel, mut condition: impl FnMut() -> bool) {
    for _ in 0..YIELD_LIMIT {
        if condition() {
            return;
        }
        kernel.yield_now();
    }
    panic!("condition still false after {YIELD_LIMIT} yields");
}

/// Returns true if no thread of `tids` can make progress on its own: each
/// one is blocked, finished, or already reaped from the thread table.
pub fn quiescent(kernel: &Kernel, tids: &[u64]) -> bool {
    tids.iter().all(|&tid| {
        matches!(
            kernel.get_state_by_tid(tid),
            Ok(ThreadState::Blocked | ThreadState::Finished) | Err(KernelError::InvalidArgument)
        )
    })
}
