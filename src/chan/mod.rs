//! Pre-built pipeline stages.
//!
//! Every stage here is a plain blocking function meant to run inside a
//! spawned microthread, usually wired up with [`spawn_producer`],
//! [`spawn_consumer`](crate::spawn_consumer), or
//! [`spawn_filter`](crate::spawn_filter). Stages notice downstream
//! death through a close-watcher arm in their selective wait and
//! terminate quietly, so pipelines unwind from either end.

mod buffer;
mod rpc;

pub use buffer::{buffer, spawn_buffer};
pub use rpc::{rpc_channel, rpc_server, RpcClient};

use crate::microthread::spawn_producer;
use crate::{alt, descr, prialt, Reader, Signal, Writer};

/// Forwards `f(value)` for every value until either side dies.
pub fn map<A, B, F>(input: Reader<A>, output: Writer<B>, mut f: F)
where
    A: Send,
    B: Send,
    F: FnMut(A) -> B,
{
    descr("chan::map");
    loop {
        let mut slot = None;
        let sig = alt(&[input.recv_op(&mut slot), output.closed_op()]);
        match sig {
            Signal::Ready(0) => {
                let value = slot.take().unwrap();
                if output.send(f(value)).is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Forwards only values satisfying `pred`.
pub fn filter<T, F>(input: Reader<T>, output: Writer<T>, mut pred: F)
where
    T: Send,
    F: FnMut(&T) -> bool,
{
    descr("chan::filter");
    loop {
        let mut slot = None;
        let sig = alt(&[input.recv_op(&mut slot), output.closed_op()]);
        match sig {
            Signal::Ready(0) => {
                let value = slot.take().unwrap();
                if pred(&value) && output.send(value).is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Copies successfully delivered values to a side channel, and keeps
/// forwarding after the side channel dies.
pub fn tee<T>(input: Reader<T>, output: Writer<T>, side: Writer<T>)
where
    T: Send + Clone,
{
    descr("chan::tee");
    loop {
        let mut slot = None;
        let sig = prialt(&[output.closed_op(), input.recv_op(&mut slot)]);
        match sig {
            Signal::Ready(1) => {
                let value = slot.take().unwrap();
                if output.send(value.clone()).is_err() {
                    return;
                }
                if side.send(value).is_err() {
                    break;
                }
            }
            _ => return,
        }
    }
    drop(side);
    loop {
        let mut slot = None;
        let sig = prialt(&[output.closed_op(), input.recv_op(&mut slot)]);
        match sig {
            Signal::Ready(1) => {
                if output.send(slot.take().unwrap()).is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Concatenates several readers into one output, in order.
pub fn chain<T: Send>(inputs: Vec<Reader<T>>, output: Writer<T>) {
    descr("chan::chain");
    for input in inputs {
        loop {
            let mut slot = None;
            let sig = alt(&[input.recv_op(&mut slot), output.closed_op()]);
            match sig {
                Signal::Ready(0) => {
                    if output.send(slot.take().unwrap()).is_err() {
                        return;
                    }
                }
                Signal::Dead(0) => break,
                _ => return,
            }
        }
    }
}

/// Applies `f` to every value until the input dies.
pub fn sink<T, F>(input: Reader<T>, mut f: F)
where
    T: Send,
    F: FnMut(T),
{
    descr("chan::sink");
    for value in input.iter() {
        f(value);
    }
}

/// Reads and discards everything until the input dies.
pub fn blackhole<T: Send>(input: Reader<T>) {
    descr("chan::blackhole");
    for _ in input.iter() {}
}

/// Holds the writer without ever sending; returns when the readers are
/// gone.
pub fn mute<T: Send>(output: Writer<T>) {
    descr("chan::mute");
    let _ = alt(&[output.closed_op()]);
}

/// Holds the reader without ever reading; returns when the writers are
/// gone.
pub fn deaf<T: Send>(input: Reader<T>) {
    descr("chan::deaf");
    let _ = alt(&[input.closed_op()]);
}

/// Emits `start`, `start + step`, ... below `stop`. With `cyclic`, the
/// sequence wraps around the `[start, stop)` ribbon, keeping the
/// residue when `step` does not divide the span.
pub fn count<T>(output: Writer<T>, start: T, stop: T, step: T, cyclic: bool)
where
    T: Send
        + Copy
        + PartialOrd
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>,
{
    descr("chan::count");
    let mut i = start;
    loop {
        while i < stop {
            if output.send(i).is_err() {
                return;
            }
            i = i + step;
        }
        if !cyclic {
            return;
        }
        i = i - (stop - start);
    }
}

/// Emits `start`, `start + step`, ... until the readers are gone.
pub fn count_forever<T>(output: Writer<T>, start: T, step: T)
where
    T: Send + Copy + std::ops::Add<Output = T>,
{
    descr("chan::count_forever");
    let mut i = start;
    while output.send(i).is_ok() {
        i = i + step;
    }
}

/// Emits every element of `items`; with `cyclic`, forever.
pub fn enumerate<T, C>(items: C, output: Writer<T>, cyclic: bool)
where
    T: Send,
    C: IntoIterator<Item = T> + Clone,
{
    descr("chan::enumerate");
    loop {
        for value in items.clone() {
            if output.send(value).is_err() {
                return;
            }
        }
        if !cyclic {
            return;
        }
    }
}

/// [`enumerate`] looping forever.
pub fn cycle<T, C>(items: C, output: Writer<T>)
where
    T: Send,
    C: IntoIterator<Item = T> + Clone,
{
    enumerate(items, output, true);
}

/// Repeats the most recent input value to every taker. Once primed it
/// never blocks the output on a slow input, and keeps serving the last
/// value after the input dies.
pub fn latch<T>(input: Reader<T>, output: Writer<T>)
where
    T: Send + Clone,
{
    descr("chan::latch");
    let mut current = {
        let mut slot = None;
        let sig = prialt(&[output.closed_op(), input.recv_op(&mut slot)]);
        match sig {
            Signal::Ready(1) => slot.take().unwrap(),
            _ => return,
        }
    };
    loop {
        let mut next = None;
        let mut pending = Some(current.clone());
        let sig = prialt(&[input.recv_op(&mut next), output.send_op(&mut pending)]);
        match sig {
            Signal::Ready(0) => current = next.take().unwrap(),
            Signal::Ready(1) => {}
            Signal::Dead(0) => break,
            _ => return,
        }
    }
    while output.send(current.clone()).is_ok() {}
}

/// Forwards values until the keepalive channel's writer dies. The
/// keepalive never carries data; its closure is the kill signal.
pub fn killswitch<T: Send>(input: Reader<T>, output: Writer<T>, keepalive: Reader<()>) {
    descr("chan::killswitch");
    loop {
        let mut slot = None;
        let sig = prialt(&[
            keepalive.closed_op(),
            output.closed_op(),
            input.recv_op(&mut slot),
        ]);
        match sig {
            Signal::Ready(2) => {
                let mut pending = Some(slot.take().unwrap());
                let sig = prialt(&[keepalive.closed_op(), output.send_op(&mut pending)]);
                match sig {
                    Signal::Ready(1) => {}
                    _ => return,
                }
            }
            _ => return,
        }
    }
}

/// Spawns a [`map`] stage over `input`, returning the mapped reader.
pub fn spawn_map<A, B, F>(input: Reader<A>, f: F) -> Reader<B>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnMut(A) -> B + Send + 'static,
{
    spawn_producer(move |w| map(input, w, f))
}

/// Spawns a [`count`] stage, returning its reader.
pub fn spawn_count<T>(start: T, stop: T, step: T) -> Reader<T>
where
    T: Send
        + Copy
        + PartialOrd
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + 'static,
{
    spawn_producer(move |w| count(w, start, stop, step, false))
}
