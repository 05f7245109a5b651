//! # microcsp — CSP-style microthreads with rendezvous channels
//!
//! A concurrency runtime in the Communicating Sequential Processes
//! style: lightweight cooperatively-scheduled microthreads multiplexed
//! onto a pool of worker threads, synchronized exclusively through
//! typed, synchronous, unbuffered rendezvous channels with a multi-way
//! selective wait ([`alt`]/[`prialt`]).
//!
//! ## Architecture
//!
//! - **Microthreads**: stackful fibers (via `corosensei`) that suspend
//!   only at explicit points — a yield, a sleep, or a channel wait.
//! - **Processors**: logical scheduling slots, each with a circular
//!   local run queue and a timer heap, bound 1:1 to OS threads.
//! - **Runtime**: the global run queue, work stealing, and the parking
//!   machinery tying the processors together. One processor means a
//!   purely cooperative single-threaded schedule; more means M:N.
//! - **Channels**: two-ended rendezvous points. A send completes only
//!   once a receiver has taken the value; buffering, when wanted, is a
//!   pipeline stage ([`chan::buffer`]), not a channel feature.
//!
//! ## Example
//!
//! ```
//! use microcsp as csp;
//!
//! csp::init_runtime(1);
//!
//! let (w, r) = csp::channel::<i32>();
//! csp::spawn(move || {
//!     let _ = w.send(42);
//! });
//! assert_eq!(r.recv(), Ok(42));
//!
//! csp::shutdown_runtime();
//! ```
//!
//! Pipelines compose from small stages exchanging values through
//! channels:
//!
//! ```
//! use microcsp as csp;
//!
//! csp::init_runtime(1);
//!
//! let numbers = csp::chan::spawn_count(0i64, 10, 1);
//! let squares = csp::chan::spawn_map(numbers, |n| n * n);
//! let total: i64 = squares.iter().sum();
//! assert_eq!(total, 285);
//!
//! csp::shutdown_runtime();
//! ```

mod alt;
mod channel;
mod error;
mod microthread;
mod processor;
mod ring;
mod runtime;
mod timer;

pub mod chan;

pub use alt::{alt, alt_nowait, prialt, prialt_nowait, Op, Signal};
pub use channel::{channel, live_channels, Iter, Reader, Writer};
pub use error::{Error, Panic, RecvError, SendError};
pub use microthread::{
    current_descr, descr, join, panic_channel, spawn, spawn_consumer, spawn_filter,
    spawn_producer, try_spawn, yield_now,
};
pub use ring::{RingBuffer, UNBOUNDED};
pub use runtime::{
    init_runtime, run, set_scheduler, shutdown_runtime, Config, DEFAULT_STACK_SIZE,
};
pub use timer::{after, sleep, sleep_until, tick};

#[cfg(test)]
mod tests;
