use grading::ktest;
use kthreads::{Kernel, sync::Mutex, thread::ThreadBuilder};
use std::sync::Arc;

/// Forks one sleeper per delay and returns the delays in the order the
/// sleepers woke up.
fn sleepers(kernel: &Kernel, delays: &[i64]) -> Vec<i64> {
    let woken = Arc::new(Mutex::new(kernel, Vec::new()));
    let handles = delays
        .iter()
        .enumerate()
        .map(|(i, &delay)| {
            let (k, woken) = (kernel.clone(), woken.clone());
            ThreadBuilder::new(kernel, format!("sleeper{i}")).spawn(move || {
                let start = k.now();
                k.wait_until(delay);
                let end = k.now();
                assert!(
                    end >= start + delay as u64,
                    "woke at {end}, before {start} + {delay}"
                );
                let mut woken = woken.lock();
                woken.push(delay);
                woken.unlock();
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    let guard = woken.lock();
    let order = guard.clone();
    guard.unlock();
    order
}

#[ktest]
pub fn wake_order(kernel: &Kernel) {
    // Start right after a timer interrupt.
    kernel.wait_until(1);
    assert_eq!(sleepers(kernel, &[100, 10, 1000, 1]), vec![1, 10, 100, 1000]);
    assert!(kernel.alarm().is_empty());
}

#[ktest]
pub fn lower_bound(kernel: &Kernel) {
    for delay in [1, 7, 250, 501, 1200] {
        let start = kernel.now();
        kernel.wait_until(delay);
        assert!(kernel.now() >= start + delay as u64);
    }
    assert!(kernel.alarm().is_empty());
}

#[ktest]
pub fn wake_time_order(kernel: &Kernel) {
    kernel.wait_until(1);
    // Equal delays: every later sleeper has a later wake time.
    let woken = Arc::new(Mutex::new(kernel, Vec::new()));
    let handles = (0..5)
        .map(|i| {
            let (k, woken) = (kernel.clone(), woken.clone());
            ThreadBuilder::new(kernel, format!("sleeper{i}")).spawn(move || {
                k.wait_until(300);
                let mut woken = woken.lock();
                woken.push(i);
                woken.unlock();
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    let guard = woken.lock();
    assert_eq!(*guard, vec![0, 1, 2, 3, 4]);
    guard.unlock();
}

#[ktest]
pub fn non_positive(kernel: &Kernel) {
    let start = kernel.now();
    kernel.wait_until(0);
    kernel.wait_until(-1);
    kernel.wait_until(i64::MIN);
    assert_eq!(kernel.now(), start);
    assert!(kernel.alarm().is_empty());
}
