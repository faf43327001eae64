use grading::{assert_fault, ktest, yield_until};
use kthreads::{
    InterruptGuard, Kernel,
    sync::Mutex,
    thread::{MAX_JOIN_DEPTH, ThreadBuilder, ThreadState},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

fn pinger(kernel: &Kernel, log: &Mutex<Vec<usize>>, which: usize) {
    for _ in 0..5 {
        let mut guard = log.lock();
        guard.push(which);
        guard.unlock();
        kernel.yield_now();
    }
}

#[ktest]
pub fn ping_pong(kernel: &Kernel) {
    let log = Arc::new(Mutex::new(kernel, Vec::new()));
    let forked = {
        let (k, log) = (kernel.clone(), log.clone());
        ThreadBuilder::new(kernel, "forked").spawn(move || pinger(&k, &log, 1))
    };
    pinger(kernel, &log, 0);
    forked.join().unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 10);
    for which in 0..2 {
        assert_eq!(log.iter().filter(|&&w| w == which).count(), 5);
    }
    log.unlock();
}

#[ktest]
pub fn join_waits(kernel: &Kernel) {
    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let (k, done) = (kernel.clone(), done.clone());
        ThreadBuilder::new(kernel, "worker").spawn(move || {
            for _ in 0..10 {
                k.yield_now();
            }
            done.store(true, Ordering::SeqCst);
        })
    };
    let worker = handle.thread().clone();
    handle.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(worker.state(), ThreadState::Finished);
}

#[ktest]
pub fn join_finished(kernel: &Kernel) {
    let finished = ThreadBuilder::new(kernel, "finished")
        .spawn(|| ())
        .thread()
        .clone();
    yield_until(kernel, || finished.state() == ThreadState::Finished);

    let joiner = {
        let (k, finished) = (kernel.clone(), finished.clone());
        ThreadBuilder::new(kernel, "joiner").spawn(move || {
            k.join(&finished);
            k.join(&finished);
        })
    };
    joiner.join().unwrap();
    kernel.join(&finished);
}

#[ktest]
#[assert_fault("cannot join itself")]
pub fn self_join(kernel: &Kernel) {
    let me = kernel.current_thread();
    kernel.join(&me);
}

#[ktest]
pub fn nested_join(kernel: &Kernel) {
    let outer = kernel.create_thread("outer");
    let (k, me) = (kernel.clone(), outer.clone());
    outer.set_target(move || {
        let (k2, outer) = (k.clone(), me);
        ThreadBuilder::new(&k, "inner")
            .spawn(move || k2.join(&outer))
            .join()
            .unwrap();
    });
    kernel.fork(&outer);
    kernel.join(&outer);
    assert_eq!(outer.state(), ThreadState::Finished);
    assert_eq!(outer.fault(), None);
}

#[ktest]
pub fn join_cycle(kernel: &Kernel) {
    let closing = Arc::new(AtomicBool::new(false));
    let [a, b, c] = ["a", "b", "c"].map(|name| kernel.create_thread(name));
    {
        let (k, a, closing) = (kernel.clone(), a.clone(), closing.clone());
        c.set_target(move || {
            yield_until(&k, || closing.load(Ordering::SeqCst));
            // a waits on b, b waits on c: this join would close the cycle.
            k.join(&a);
            assert_ne!(a.state(), ThreadState::Finished);
        });
    }
    {
        let (k, c) = (kernel.clone(), c.clone());
        b.set_target(move || k.join(&c));
    }
    {
        let (k, b) = (kernel.clone(), b.clone());
        a.set_target(move || k.join(&b));
    }

    kernel.fork(&c);
    kernel.fork(&b);
    yield_until(kernel, || b.state() == ThreadState::Blocked);
    kernel.fork(&a);
    yield_until(kernel, || a.state() == ThreadState::Blocked);
    closing.store(true, Ordering::SeqCst);

    for th in [&a, &b, &c] {
        kernel.join(th);
        assert_eq!(th.state(), ThreadState::Finished);
        assert_eq!(th.fault(), None);
    }
}

#[ktest]
#[assert_fault("more than")]
pub fn join_depth_overflow(kernel: &Kernel) {
    // links[k] joins links[k - 1], outermost link first, so every join
    // hands the whole chain down. links[0] would get one waiter too many.
    let links = (0..=MAX_JOIN_DEPTH + 1)
        .map(|k| kernel.create_thread(format!("link{k}")))
        .collect::<Vec<_>>();
    let turn = Arc::new(AtomicUsize::new(MAX_JOIN_DEPTH + 1));
    let done = Arc::new(AtomicBool::new(false));
    for (k, link) in links.iter().enumerate() {
        let (kern, turn, done) = (kernel.clone(), turn.clone(), done.clone());
        match k.checked_sub(1).map(|prev| links[prev].clone()) {
            None => link.set_target(move || yield_until(&kern, || done.load(Ordering::SeqCst))),
            Some(prev) => link.set_target(move || {
                yield_until(&kern, || turn.load(Ordering::SeqCst) == k);
                turn.store(k - 1, Ordering::SeqCst);
                kern.join(&prev);
            }),
        }
    }
    for link in links.iter() {
        kernel.fork(link);
    }

    yield_until(kernel, || links[1].state() == ThreadState::Finished);
    done.store(true, Ordering::SeqCst);
    for link in links.iter() {
        kernel.join(link);
    }
    if let Some(fault) = links[1].fault() {
        panic!("{fault}");
    }
}

#[ktest]
pub fn multiple_joins(kernel: &Kernel) {
    let joined = Arc::new(AtomicUsize::new(0));
    let joiners = (0..5)
        .map(|i| {
            let k = kernel.clone();
            let joinee = ThreadBuilder::new(kernel, format!("joinee{i}"))
                .spawn(move || {
                    for _ in 0..i {
                        k.yield_now();
                    }
                })
                .thread()
                .clone();
            let (k, joined) = (kernel.clone(), joined.clone());
            ThreadBuilder::new(kernel, format!("joiner{i}")).spawn(move || {
                k.join(&joinee);
                assert_eq!(joinee.state(), ThreadState::Finished);
                joined.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect::<Vec<_>>();
    for joiner in joiners {
        joiner.join().unwrap();
    }
    assert_eq!(joined.load(Ordering::SeqCst), 5);
}

#[ktest]
pub fn second_joiner(kernel: &Kernel) {
    let release = Arc::new(AtomicBool::new(false));
    let target = {
        let (k, release) = (kernel.clone(), release.clone());
        ThreadBuilder::new(kernel, "target")
            .spawn(move || yield_until(&k, || release.load(Ordering::SeqCst)))
            .thread()
            .clone()
    };
    let first = {
        let (k, target) = (kernel.clone(), target.clone());
        ThreadBuilder::new(kernel, "first").spawn(move || {
            k.join(&target);
            assert_eq!(target.state(), ThreadState::Finished);
        })
    };
    let first_tid = first.thread().tid();
    yield_until(kernel, || {
        kernel.get_state_by_tid(first_tid) == Ok(ThreadState::Blocked)
    });

    // Only the first joiner waits.
    kernel.join(&target);
    kernel.join(&target);
    assert_ne!(target.state(), ThreadState::Finished);

    release.store(true, Ordering::SeqCst);
    first.join().unwrap();
}

#[ktest]
#[assert_fault("already forked")]
pub fn double_fork(kernel: &Kernel) {
    let th = ThreadBuilder::new(kernel, "twice").build(|| ());
    kernel.fork(&th);
    kernel.fork(&th);
}

#[ktest]
#[assert_fault("has no target")]
pub fn fork_without_target(kernel: &Kernel) {
    let th = kernel.create_thread("empty");
    kernel.fork(&th);
}

#[ktest]
#[assert_fault("interrupts must be disabled")]
pub fn sleep_with_interrupts(kernel: &Kernel) {
    kernel.sleep();
}

#[ktest]
pub fn state_transitions(kernel: &Kernel) {
    let gate = Arc::new(Mutex::new(kernel, ()));
    let th = {
        let gate = gate.clone();
        ThreadBuilder::new(kernel, "gated").build(move || {
            let guard = gate.lock();
            guard.unlock();
        })
    };
    assert_eq!(th.state(), ThreadState::New);
    assert_eq!(kernel.get_state_by_tid(th.tid()), Ok(ThreadState::New));

    let gate_guard = gate.lock();
    {
        let _guard = InterruptGuard::new(kernel.interrupt());
        kernel.fork(&th);
        assert_eq!(kernel.get_state_by_tid(th.tid()), Ok(ThreadState::Ready));
    }
    yield_until(kernel, || th.state() == ThreadState::Blocked);
    {
        let _guard = InterruptGuard::new(kernel.interrupt());
        gate_guard.unlock();
        assert_eq!(th.state(), ThreadState::Ready);
    }
    kernel.join(&th);
    assert_eq!(th.state(), ThreadState::Finished);
    assert_eq!(kernel.current_thread().state(), ThreadState::Running);
}

#[ktest]
pub fn fault_isolation(kernel: &Kernel) {
    let survivor = Arc::new(AtomicUsize::new(0));
    let faulty = ThreadBuilder::new(kernel, "faulty").spawn(|| panic!("deliberate fault"));
    let steady = {
        let (k, survivor) = (kernel.clone(), survivor.clone());
        ThreadBuilder::new(kernel, "steady").spawn(move || {
            for _ in 0..5 {
                survivor.fetch_add(1, Ordering::SeqCst);
                k.yield_now();
            }
        })
    };
    let faulty_tid = faulty.thread().tid();
    assert_eq!(faulty.join(), Err("deliberate fault".to_string()));
    steady.join().unwrap();
    assert_eq!(survivor.load(Ordering::SeqCst), 5);
    assert!(
        kernel
            .take_faults()
            .iter()
            .any(|fault| fault.tid == faulty_tid && fault.message == "deliberate fault")
    );
}
