// Grader of the kernel-thread core.
//
// `cargo run -p grader -- [-d <flags>] [--timer <ticks>] [test ...]` runs the
// listed cases, or all of them, on one kernel. `cargo test -p grader` runs
// every case on a kernel of its own.
mod alarm;
mod sync;
mod thread;

use kthreads::{SystemConfigurationBuilder, TestDriver};

fn main() {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let (config_builder, filters) =
        match SystemConfigurationBuilder::from_cmdline(args.iter().map(String::as_str)) {
            Ok(parsed) => parsed,
            Err(e) => {
                kthreads::kprintln!("invalid command line: {:?}", e);
                std::process::exit(2);
            }
        };
    let kernel = config_builder.boot();
    let passed = TestDriver::start(
        &kernel,
        [
            // Thread lifecycle.
            &thread::ping_pong,
            &thread::join_waits,
            &thread::join_finished,
            &thread::self_join,
            &thread::nested_join,
            &thread::join_cycle,
            &thread::join_depth_overflow,
            &thread::multiple_joins,
            &thread::second_joiner,
            &thread::double_fork,
            &thread::fork_without_target,
            &thread::sleep_with_interrupts,
            &thread::state_transitions,
            &thread::fault_isolation,
            // Alarm.
            &alarm::wake_order,
            &alarm::lower_bound,
            &alarm::wake_time_order,
            &alarm::non_positive,
            // Sync
            &sync::mutex::smoke,
            &sync::mutex::parking,
            &sync::mutex::try_lock,
            &sync::mutex::relock,
            &sync::condition_variable::fifo_wake,
            &sync::condition_variable::wake_empty,
            &sync::condition_variable::wake_all,
            &sync::condition_variable::producer_consumer,
            &sync::condition_variable::ping_pong,
            &sync::condition_variable::bounded_buffer,
            &sync::condition_variable::wrong_lock,
            &sync::rendezvous::exchange_1,
            &sync::rendezvous::exchange_4,
            &sync::rendezvous::exchange_8,
            &sync::rendezvous::listeners_first,
            &sync::rendezvous::speaker_waits,
            &sync::reaction::water,
            &sync::reaction::surplus_b,
            &sync::reaction::surplus_a,
            &sync::reaction::seven_and_four,
            &sync::reaction::custom_recipe,
        ],
        &filters,
    );
    kernel.shutdown();
    std::process::exit(if passed { 0 } else { 1 });
}
