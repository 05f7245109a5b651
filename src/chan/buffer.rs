//! Elastic FIFO stage: the only place buffering exists in a pipeline
//! built from rendezvous channels.

use crate::microthread::spawn_producer;
use crate::ring::{RingBuffer, UNBOUNDED};
use crate::{alt, descr, Reader, Signal, Writer};

/// Shuttles values from `input` to `output` through a FIFO holding at
/// most `capacity` values (`usize::MAX` for unbounded). While full it
/// stops reading, giving upstream back-pressure; when the input dies it
/// drains and exits.
pub fn buffer<T: Send>(input: Reader<T>, output: Writer<T>, capacity: usize) {
    descr("chan::buffer");
    let ring_cap = if capacity == UNBOUNDED {
        UNBOUNDED
    } else {
        capacity.max(1)
    };
    let mut buf: RingBuffer<T> = RingBuffer::with_capacity(ring_cap);
    // The head of the queue sits outside the ring while offered to the
    // output, so it can be reinstated untouched if the input arm fires
    // first.
    let mut head: Option<T> = None;

    loop {
        if head.is_none() {
            head = buf.pop();
        }
        let full = buf.len() + head.is_some() as usize >= ring_cap;

        let mut incoming = None;
        let mut outgoing = head.take();
        let in_arm = if full {
            input.closed_op()
        } else {
            input.recv_op(&mut incoming)
        };
        let out_arm = if outgoing.is_some() {
            output.send_op(&mut outgoing)
        } else {
            output.closed_op()
        };

        let sig = alt(&[in_arm, out_arm]);
        match sig {
            Signal::Ready(0) => {
                buf.push(incoming.take().unwrap());
                head = outgoing.take();
            }
            Signal::Ready(1) => {
                // Delivered; the next head is popped on the way around.
            }
            Signal::Dead(0) => {
                // Input gone: drain whatever is left.
                if let Some(value) = outgoing.take() {
                    if output.send(value).is_err() {
                        return;
                    }
                }
                while let Some(value) = buf.pop() {
                    if output.send(value).is_err() {
                        return;
                    }
                }
                return;
            }
            _ => return,
        }
    }
}

/// Spawns a [`buffer`] stage over `input`, returning the buffered
/// reader.
pub fn spawn_buffer<T: Send + 'static>(input: Reader<T>, capacity: usize) -> Reader<T> {
    spawn_producer(move |w| buffer(input, w, capacity))
}
