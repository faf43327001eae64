pub mod mutex {
    use grading::{assert_fault, ktest, quiescent, yield_until};
    use kthreads::{
        Kernel,
        sync::Mutex,
        thread::{ThreadBuilder, ThreadState},
    };
    use std::sync::Arc;

    #[ktest]
    pub fn smoke(kernel: &Kernel) {
        let counter = Arc::new(Mutex::new(kernel, 0usize));
        let handles = (0..4)
            .map(|i| {
                let (k, counter) = (kernel.clone(), counter.clone());
                ThreadBuilder::new(kernel, format!("adder{i}")).spawn(move || {
                    for _ in 0..25 {
                        let mut guard = counter.lock();
                        let seen = *guard;
                        // Give up the cpu inside the critical section.
                        k.yield_now();
                        *guard = seen + 1;
                        guard.unlock();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = counter.lock();
        assert_eq!(*guard, 100);
        guard.unlock();
    }

    #[ktest]
    pub fn parking(kernel: &Kernel) {
        let order = Arc::new(Mutex::new(kernel, Vec::new()));
        let guard = order.lock();

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            let handle = ThreadBuilder::new(kernel, format!("parker{i}")).spawn(move || {
                let mut guard = order.lock();
                guard.push(i);
                guard.unlock();
            });
            let tid = handle.thread().tid();
            yield_until(kernel, || quiescent(kernel, &[tid]));
            assert_eq!(handle.thread().state(), ThreadState::Blocked);
            handles.push(handle);
        }

        assert!(guard.is_empty());
        guard.unlock();
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = order.lock();
        assert_eq!(*guard, vec![0, 1, 2, 3, 4]);
        guard.unlock();
    }

    #[ktest]
    pub fn try_lock(kernel: &Kernel) {
        let lock = Arc::new(Mutex::new(kernel, 0));
        let guard = lock.lock();
        assert!(lock.is_held_by_current_thread());
        match lock.try_lock() {
            Ok(_) => panic!("try_lock succeeded on a held mutex"),
            Err(_) => (),
        }

        let contender = {
            let lock = lock.clone();
            ThreadBuilder::new(kernel, "contender").spawn(move || {
                assert!(!lock.is_held_by_current_thread());
                assert!(lock.try_lock().is_err());
            })
        };
        contender.join().unwrap();
        guard.unlock();

        let taker = {
            let lock = lock.clone();
            ThreadBuilder::new(kernel, "taker").spawn(move || match lock.try_lock() {
                Ok(mut guard) => {
                    *guard += 1;
                    guard.unlock();
                }
                Err(_) => panic!("try_lock failed on a free mutex"),
            })
        };
        taker.join().unwrap();
        let guard = lock.lock();
        assert_eq!(*guard, 1);
        guard.unlock();
    }

    #[ktest]
    #[assert_fault("already holds")]
    pub fn relock(kernel: &Kernel) {
        let lock = Mutex::new(kernel, ());
        let first = lock.lock();
        let second = lock.lock();
        second.unlock();
        first.unlock();
    }
}

pub mod condition_variable {
    use grading::{assert_fault, ktest, yield_until};
    use kthreads::{
        Kernel,
        sync::{ConditionVariable, Mutex},
        thread::ThreadBuilder,
    };
    use std::{collections::VecDeque, sync::Arc};

    struct Shared<T> {
        lock: Mutex<T>,
        cond: ConditionVariable,
    }

    fn shared<T>(kernel: &Kernel, t: T) -> Arc<Shared<T>> {
        let lock = Mutex::new(kernel, t);
        let cond = ConditionVariable::new(&lock);
        Arc::new(Shared { lock, cond })
    }

    #[ktest]
    pub fn fifo_wake(kernel: &Kernel) {
        let state = shared(kernel, Vec::new());
        let handles = (0..5)
            .map(|i| {
                let state_ = state.clone();
                let handle = ThreadBuilder::new(kernel, format!("waiter{i}")).spawn(move || {
                    let mut guard = state_.cond.sleep(state_.lock.lock());
                    guard.push(i);
                    guard.unlock();
                });
                yield_until(kernel, || state.cond.waiters() == i + 1);
                handle
            })
            .collect::<Vec<_>>();

        for i in 0..5 {
            let guard = state.lock.lock();
            state.cond.wake(&guard);
            guard.unlock();
            yield_until(kernel, || {
                let guard = state.lock.lock();
                let len = guard.len();
                guard.unlock();
                len == i + 1
            });
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = state.lock.lock();
        assert_eq!(*guard, vec![0, 1, 2, 3, 4]);
        guard.unlock();
    }

    #[ktest]
    pub fn wake_empty(kernel: &Kernel) {
        let state = shared(kernel, ());
        let guard = state.lock.lock();
        state.cond.wake(&guard);
        state.cond.wake_all(&guard);
        guard.unlock();
        assert_eq!(state.cond.waiters(), 0);

        // A wakeup is not remembered.
        let sleeper = {
            let state = state.clone();
            ThreadBuilder::new(kernel, "sleeper").spawn(move || {
                let guard = state.cond.sleep(state.lock.lock());
                guard.unlock();
            })
        };
        let tid = sleeper.thread().tid();
        yield_until(kernel, || state.cond.waiters() == 1);
        assert_eq!(
            kernel.get_state_by_tid(tid),
            Ok(kthreads::thread::ThreadState::Blocked)
        );
        let guard = state.lock.lock();
        state.cond.wake(&guard);
        guard.unlock();
        sleeper.join().unwrap();
    }

    #[ktest]
    pub fn wake_all(kernel: &Kernel) {
        let state = shared(kernel, (false, 0));
        let handles = (0..6)
            .map(|i| {
                let state = state.clone();
                ThreadBuilder::new(kernel, format!("waiter{i}")).spawn(move || {
                    let mut guard = state.cond.wait_while(state.lock.lock(), |(go, _)| !*go);
                    guard.1 += 1;
                    guard.unlock();
                })
            })
            .collect::<Vec<_>>();
        yield_until(kernel, || state.cond.waiters() == 6);

        let mut guard = state.lock.lock();
        guard.0 = true;
        state.cond.wake_all(&guard);
        guard.unlock();
        assert_eq!(state.cond.waiters(), 0);

        for handle in handles {
            handle.join().unwrap();
        }
        let guard = state.lock.lock();
        assert_eq!(guard.1, 6);
        guard.unlock();
    }

    #[ktest]
    pub fn producer_consumer(kernel: &Kernel) {
        let state = shared(kernel, VecDeque::new());
        let consumer = {
            let state = state.clone();
            ThreadBuilder::new(kernel, "consumer").spawn(move || {
                for expected in 0..100 {
                    let mut guard = state.cond.wait_while(state.lock.lock(), |q| q.is_empty());
                    assert_eq!(guard.pop_front(), Some(expected));
                    guard.unlock();
                }
            })
        };
        let producer = {
            let (k, state) = (kernel.clone(), state.clone());
            ThreadBuilder::new(kernel, "producer").spawn(move || {
                for item in 0..100 {
                    let mut guard = state.lock.lock();
                    guard.push_back(item);
                    state.cond.wake(&guard);
                    guard.unlock();
                    if item % 7 == 0 {
                        k.yield_now();
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
        let guard = state.lock.lock();
        assert!(guard.is_empty());
        guard.unlock();
    }

    #[ktest]
    pub fn ping_pong(kernel: &Kernel) {
        struct Court {
            turn: usize,
            log: Vec<usize>,
        }
        let lock = Arc::new(Mutex::new(
            kernel,
            Court {
                turn: 0,
                log: Vec::new(),
            },
        ));
        let hits = Arc::new([ConditionVariable::new(&*lock), ConditionVariable::new(&*lock)]);

        let handles = (0..2)
            .map(|me| {
                let (lock, hits) = (lock.clone(), hits.clone());
                ThreadBuilder::new(kernel, format!("player{me}")).spawn(move || {
                    for _ in 0..10 {
                        let mut guard = hits[me].wait_while(lock.lock(), |c| c.turn != me);
                        guard.log.push(me);
                        guard.turn = 1 - me;
                        hits[1 - me].wake(&guard);
                        guard.unlock();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let guard = lock.lock();
        assert_eq!(guard.log.len(), 20);
        assert!(guard.log.iter().enumerate().all(|(i, &p)| p == i % 2));
        guard.unlock();
    }

    #[ktest]
    pub fn bounded_buffer(kernel: &Kernel) {
        const CAPACITY: usize = 3;
        let lock = Arc::new(Mutex::new(kernel, (VecDeque::new(), 0usize)));
        let not_full = Arc::new(ConditionVariable::new(&*lock));
        let not_empty = Arc::new(ConditionVariable::new(&*lock));

        let producers = (0..2).map(|p| {
            let (k, lock, not_full, not_empty) =
                (kernel.clone(), lock.clone(), not_full.clone(), not_empty.clone());
            ThreadBuilder::new(kernel, format!("producer{p}")).spawn(move || {
                for i in 0..20 {
                    let mut guard = not_full.wait_while(lock.lock(), |(q, _)| q.len() == CAPACITY);
                    guard.0.push_back(p * 100 + i);
                    assert!(guard.0.len() <= CAPACITY);
                    not_empty.wake(&guard);
                    guard.unlock();
                    k.yield_now();
                }
            })
        });
        let consumers = (0..2).map(|c| {
            let (lock, not_full, not_empty) = (lock.clone(), not_full.clone(), not_empty.clone());
            ThreadBuilder::new(kernel, format!("consumer{c}")).spawn(move || {
                for _ in 0..20 {
                    let mut guard = not_empty.wait_while(lock.lock(), |(q, _)| q.is_empty());
                    let item = guard.0.pop_front().unwrap();
                    guard.1 += item;
                    not_full.wake(&guard);
                    guard.unlock();
                }
            })
        });
        let handles = producers.chain(consumers).collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let guard = lock.lock();
        assert!(guard.0.is_empty());
        // 0..20 and 100..120.
        assert_eq!(guard.1, 190 + 2190);
        guard.unlock();
    }

    #[ktest]
    #[assert_fault("paired lock")]
    pub fn wrong_lock(kernel: &Kernel) {
        let paired = Mutex::new(kernel, ());
        let other = Mutex::new(kernel, ());
        let cond = ConditionVariable::new(&paired);
        let guard = other.lock();
        cond.wake(&guard);
        guard.unlock();
    }
}

pub mod rendezvous {
    use grading::{ktest, yield_until};
    use kthreads::{
        Kernel,
        sync::{Mutex, Rendezvous},
        thread::{ThreadBuilder, ThreadState},
    };
    use std::sync::Arc;

    /// Lets `n` speakers and `n` listeners meet, and checks that every message
    /// was received exactly once.
    fn exchange(kernel: &Kernel, n: usize, listeners_first: bool) {
        let channel = Arc::new(Rendezvous::new(kernel));
        let received = Arc::new(Mutex::new(kernel, Vec::new()));

        let listener = |i: usize| {
            let (channel, received) = (channel.clone(), received.clone());
            ThreadBuilder::new(kernel, format!("listener{i}")).spawn(move || {
                let message = channel.listen();
                let mut guard = received.lock();
                guard.push(message);
                guard.unlock();
            })
        };
        let speaker = |i: usize| {
            let channel = channel.clone();
            ThreadBuilder::new(kernel, format!("speaker{i}")).spawn(move || channel.speak(i))
        };

        let mut handles = Vec::new();
        if listeners_first {
            handles.extend((0..n).map(listener));
            yield_until(kernel, || channel.waiting_listeners() == n);
            handles.extend((0..n).map(speaker));
        } else {
            for i in 0..n {
                if i % 2 == 0 {
                    handles.push(speaker(i));
                    handles.push(listener(i));
                } else {
                    handles.push(listener(i));
                    handles.push(speaker(i));
                }
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut guard = received.lock();
        guard.sort_unstable();
        assert_eq!(*guard, (0..n).collect::<Vec<_>>());
        guard.unlock();
        assert_eq!(channel.waiting_listeners(), 0);
    }

    #[ktest]
    pub fn exchange_1(kernel: &Kernel) {
        exchange(kernel, 1, false);
    }

    #[ktest]
    pub fn exchange_4(kernel: &Kernel) {
        exchange(kernel, 4, false);
    }

    #[ktest]
    pub fn exchange_8(kernel: &Kernel) {
        exchange(kernel, 8, false);
    }

    #[ktest]
    pub fn listeners_first(kernel: &Kernel) {
        exchange(kernel, 4, true);
    }

    #[ktest]
    pub fn speaker_waits(kernel: &Kernel) {
        let channel = Arc::new(Rendezvous::new(kernel));
        let speaker = {
            let channel = channel.clone();
            ThreadBuilder::new(kernel, "speaker").spawn(move || channel.speak("hello"))
        };
        let tid = speaker.thread().tid();
        yield_until(kernel, || {
            kernel.get_state_by_tid(tid) == Ok(ThreadState::Blocked)
        });
        for _ in 0..10 {
            kernel.yield_now();
        }
        assert_eq!(speaker.thread().state(), ThreadState::Blocked);

        let listener = {
            let channel = channel.clone();
            ThreadBuilder::new(kernel, "listener").spawn(move || {
                assert_eq!(channel.listen(), "hello");
            })
        };
        listener.join().unwrap();
        speaker.join().unwrap();
    }
}

pub mod reaction {
    use grading::{ktest, quiescent, yield_until};
    use kthreads::{
        Kernel,
        sync::{Reaction, Reagent, Recipe},
        thread::{Thread, ThreadBuilder, ThreadState},
    };
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct Outcome {
        reaction: Arc<Reaction>,
        effects: usize,
        /// Threads that returned from `supply`, per kind.
        consumed: (usize, usize),
    }

    /// Supplies one unit per entry of `supply`, each from a thread of its
    /// own, and waits until no supplier can make progress.
    fn react(kernel: &Kernel, recipe: Recipe, supply: &[Reagent]) -> Outcome {
        let effects = Arc::new(AtomicUsize::new(0));
        let reaction = {
            let effects = effects.clone();
            Arc::new(Reaction::new(kernel, recipe, move || {
                effects.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let suppliers = supply
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let reaction = reaction.clone();
                let th: Thread = ThreadBuilder::new(kernel, format!("{kind:?}{i}"))
                    .spawn(move || reaction.supply(kind))
                    .thread()
                    .clone();
                (kind, th)
            })
            .collect::<Vec<_>>();
        let tids = suppliers.iter().map(|(_, th)| th.tid()).collect::<Vec<_>>();
        yield_until(kernel, || quiescent(kernel, &tids));

        let consumed = |which: Reagent| {
            suppliers
                .iter()
                .filter(|(kind, th)| *kind == which && th.state() == ThreadState::Finished)
                .count()
        };
        Outcome {
            effects: effects.load(Ordering::SeqCst),
            consumed: (consumed(Reagent::A), consumed(Reagent::B)),
            reaction,
        }
    }

    #[ktest]
    pub fn water(kernel: &Kernel) {
        use Reagent::*;
        let outcome = react(kernel, Recipe::WATER, &[A, A, B]);
        assert_eq!(outcome.reaction.reactions(), 1);
        assert_eq!(outcome.effects, 1);
        assert_eq!(outcome.consumed, (2, 1));
        assert_eq!(outcome.reaction.counts(), (0, 0));
    }

    #[ktest]
    pub fn surplus_b(kernel: &Kernel) {
        use Reagent::*;
        let outcome = react(kernel, Recipe::WATER, &[A, A, B, B, B, B]);
        assert_eq!(outcome.reaction.reactions(), 1);
        assert_eq!(outcome.effects, 1);
        assert_eq!(outcome.consumed, (2, 1));
        assert_eq!(outcome.reaction.counts(), (0, 3));
    }

    #[ktest]
    pub fn surplus_a(kernel: &Kernel) {
        use Reagent::*;
        let outcome = react(kernel, Recipe::WATER, &[A, A, B, A, A]);
        assert_eq!(outcome.reaction.reactions(), 1);
        assert_eq!(outcome.consumed, (2, 1));
        assert_eq!(outcome.reaction.counts(), (2, 0));
    }

    #[ktest]
    pub fn seven_and_four(kernel: &Kernel) {
        use Reagent::*;
        let outcome = react(kernel, Recipe::WATER, &[A, B, A, A, B, A, B, A, A, B, A]);
        assert_eq!(outcome.reaction.reactions(), 3);
        assert_eq!(outcome.effects, 3);
        assert_eq!(outcome.consumed, (6, 3));
        assert_eq!(outcome.reaction.counts(), (1, 1));
    }

    #[ktest]
    pub fn custom_recipe(kernel: &Kernel) {
        use Reagent::*;
        let recipe = Recipe { a: 1, b: 3 };
        let outcome = react(kernel, recipe, &[B, A, B, B, B]);
        assert_eq!(outcome.reaction.recipe(), recipe);
        assert_eq!(outcome.reaction.reactions(), 1);
        assert_eq!(outcome.consumed, (1, 3));
        assert_eq!(outcome.reaction.counts(), (0, 1));
    }
}
