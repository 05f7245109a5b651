//! Timer surface: blocking sleeps plus the `after`/`tick` channel
//! producers used for timeouts inside selective waits.

use std::time::{Duration, Instant};

use crate::microthread::{self, spawn_producer, MtPtr, SwitchReason};
use crate::runtime::current_processor;
use crate::Reader;

/// Blocks the current microthread until `deadline`, parking the worker
/// if nothing else is runnable. On a plain OS thread this is an
/// ordinary sleep.
pub fn sleep_until(deadline: Instant) {
    match microthread::current() {
        Some(g) => {
            let p = current_processor().expect("microthread running without a bound processor");
            p.push_timer(deadline, MtPtr(g));
            // SAFETY: `g` is the current microthread. The suspend
            // window is drained by the worker exactly as for a channel
            // wait, so a racing wake cannot double-schedule us.
            unsafe {
                (*g).suspending
                    .store(true, std::sync::atomic::Ordering::Release);
                microthread::suspend(g, SwitchReason::Detached);
            }
        }
        None => {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }
    }
}

/// Blocks for `duration`.
pub fn sleep(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Returns a reader that fires once after `duration`.
pub fn after(duration: Duration) -> Reader<()> {
    spawn_producer(move |w| {
        sleep(duration);
        let _ = w.send(());
    })
}

/// Returns a reader delivering the current time every `interval`.
/// Deadlines are absolute, so a slow consumer does not accumulate
/// drift.
pub fn tick(interval: Duration) -> Reader<Instant> {
    spawn_producer(move |w| {
        let mut next = Instant::now() + interval;
        loop {
            sleep_until(next);
            if w.send(Instant::now()).is_err() {
                break;
            }
            next += interval;
        }
    })
}
