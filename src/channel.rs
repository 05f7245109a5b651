//! Synchronous rendezvous channels.
//!
//! A channel is a two-ended meeting point with no buffer slot: a value
//! moves directly from the sender's slot to the receiver's slot while a
//! channel lock is held. Each endpoint carries its own reference count,
//! a FIFO of live waiters, and a set of close-watchers ("vultures")
//! that fire when the opposite endpoint's last reference drops.
//!
//! The typed [`Writer`]/[`Reader`] handles are thin clones over a
//! type-erased core so that a single selective wait can span channels
//! of different element types.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::alt::{prialt, Op, OpKind, TaskRef};
use crate::error::{RecvError, SendError};
use crate::ring::RingBuffer;
use crate::Signal;

/// Writer endpoint index.
pub(crate) const WR: usize = 0;
/// Reader endpoint index.
pub(crate) const RD: usize = 1;

static NEXT_CHAN_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_CHANNELS: AtomicUsize = AtomicUsize::new(0);

/// Number of channels whose storage has not been reclaimed yet. A
/// channel is reclaimed once both endpoints' reference counts reach
/// zero, so after a pipeline fully drains this returns to its prior
/// value.
pub fn live_channels() -> usize {
    LIVE_CHANNELS.load(Ordering::SeqCst)
}

/// A registered selective-wait entry: who is waiting, which index of
/// their operation array this is, and where the payload goes (null for
/// close-watchers).
#[derive(Clone, Copy)]
pub(crate) struct WaitEntry {
    pub(crate) task: TaskRef,
    pub(crate) index: usize,
    pub(crate) slot: *mut (),
}

// SAFETY: the slot pointer targets a suspended waiter's stack slot and
// is only dereferenced under the channel lock by the claiming side.
unsafe impl Send for WaitEntry {}

impl PartialEq for WaitEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.key() == other.task.key() && self.index == other.index
    }
}

impl Eq for WaitEntry {}

impl Hash for WaitEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.task.key().hash(state);
        self.index.hash(state);
    }
}

#[derive(Default)]
pub(crate) struct Endpoint {
    /// Data waiters, matched first-registered first.
    pub(crate) waiters: RingBuffer<WaitEntry>,
    /// Close-watchers; no ordering, deregistered by identity.
    pub(crate) vultures: HashSet<WaitEntry>,
}

pub(crate) struct ChanState {
    pub(crate) eps: [Endpoint; 2],
}

/// Type-erased channel core. Reclaimed once both endpoint reference
/// counts have reached zero.
pub(crate) struct RawChan {
    /// Monotonic id establishing the global lock order.
    pub(crate) id: u64,
    /// Moves the payload from the source slot to the destination slot.
    pub(crate) tx: unsafe fn(*mut (), *mut ()),
    pub(crate) refs: [AtomicUsize; 2],
    /// How many sides have fully closed; the second closer reclaims.
    closed_sides: AtomicUsize,
    pub(crate) state: Mutex<ChanState>,
}

impl RawChan {
    fn new(tx: unsafe fn(*mut (), *mut ())) -> Self {
        RawChan {
            id: NEXT_CHAN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            refs: [AtomicUsize::new(1), AtomicUsize::new(1)],
            closed_sides: AtomicUsize::new(0),
            state: Mutex::new(ChanState {
                eps: [Endpoint::default(), Endpoint::default()],
            }),
        }
    }

    /// A channel is alive while both sides hold references.
    pub(crate) fn alive(&self) -> bool {
        self.refs[WR].load(Ordering::Acquire) > 0 && self.refs[RD].load(Ordering::Acquire) > 0
    }

    fn addref(&self, side: usize) {
        self.refs[side].fetch_add(1, Ordering::Relaxed);
    }
}

/// Claims a registered waiter for a dead-channel wake.
fn wake_dead(entry: &WaitEntry) {
    if entry.task.claim() {
        entry
            .task
            .signal()
            .store(-((entry.index + 1) as i32), Ordering::Release);
        entry.task.wake();
    }
}

/// Drops one reference of `side`. The last reference of a side wakes
/// every live waiter and vulture on the opposite endpoint with a dead
/// signal; entries stay registered — woken waiters clean up their own
/// registrations under their own lock pass.
fn release(raw: *const RawChan, side: usize) {
    // SAFETY: the caller held a reference, so the core is alive.
    let ch = unsafe { &*raw };
    if ch.refs[side].fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    trace!(chan = ch.id, side, "endpoint closed");
    {
        let state = ch.state.lock().unwrap();
        if ch.refs[1 - side].load(Ordering::Acquire) > 0 {
            let ep = &state.eps[1 - side];
            for entry in ep.waiters.iter() {
                wake_dead(entry);
            }
            for entry in ep.vultures.iter() {
                wake_dead(entry);
            }
        }
    }
    if ch.closed_sides.fetch_add(1, Ordering::AcqRel) == 1 {
        // SAFETY: both sides are at zero references and the other
        // closer has left its locked region before it incremented.
        unsafe { drop(Box::from_raw(raw as *mut RawChan)) };
        LIVE_CHANNELS.fetch_sub(1, Ordering::SeqCst);
    }
}

unsafe fn transfer<T>(src: *mut (), dst: *mut ()) {
    let src = &mut *(src as *mut Option<T>);
    let dst = &mut *(dst as *mut Option<T>);
    *dst = src.take();
}

/// Creates a rendezvous channel, returning its two endpoints.
pub fn channel<T: Send>() -> (Writer<T>, Reader<T>) {
    LIVE_CHANNELS.fetch_add(1, Ordering::SeqCst);
    let raw = Box::into_raw(Box::new(RawChan::new(transfer::<T>)));
    (
        Writer {
            raw,
            _marker: PhantomData,
        },
        Reader {
            raw,
            _marker: PhantomData,
        },
    )
}

/// The sending end of a channel. Cloning adds a reference; dropping the
/// last writer wakes blocked readers with a dead signal.
pub struct Writer<T> {
    raw: *const RawChan,
    _marker: PhantomData<fn(T)>,
}

/// The receiving end of a channel. Cloning adds a reference; dropping
/// the last reader wakes blocked writers with a dead signal.
pub struct Reader<T> {
    raw: *const RawChan,
    _marker: PhantomData<fn() -> T>,
}

// SAFETY: the core is internally synchronized; values of T cross
// threads through the transfer function.
unsafe impl<T: Send> Send for Writer<T> {}
unsafe impl<T: Send> Sync for Writer<T> {}
unsafe impl<T: Send> Send for Reader<T> {}
unsafe impl<T: Send> Sync for Reader<T> {}

impl<T> Clone for Writer<T> {
    fn clone(&self) -> Self {
        // SAFETY: self holds a reference.
        unsafe { (*self.raw).addref(WR) };
        Writer {
            raw: self.raw,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Writer<T> {
    fn drop(&mut self) {
        release(self.raw, WR);
    }
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        // SAFETY: self holds a reference.
        unsafe { (*self.raw).addref(RD) };
        Reader {
            raw: self.raw,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        release(self.raw, RD);
    }
}

impl<T: Send> Writer<T> {
    /// A writer whose channel is already dead; every send fails.
    pub fn dead() -> Writer<T> {
        let (w, _r) = channel();
        w
    }

    /// Selective-wait operation sending the value in `slot`. The value
    /// is taken out of the slot when a receiver consumes it; a
    /// completed send means the receiver already has it.
    pub fn send_op<'a>(&'a self, slot: &'a mut Option<T>) -> Op<'a> {
        Op {
            chan: self.raw,
            side: WR,
            kind: OpKind::Data,
            slot: slot as *mut Option<T> as *mut (),
            _marker: PhantomData,
        }
    }

    /// Selective-wait operation firing when every reader is gone.
    pub fn closed_op(&self) -> Op<'_> {
        Op {
            chan: self.raw,
            side: WR,
            kind: OpKind::Closed,
            slot: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Sends `value`, blocking until a receiver takes it. Fails with the
    /// value when every reader is gone.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut slot = Some(value);
        let sig = prialt(&[self.send_op(&mut slot)]);
        match sig {
            Signal::Ready(_) => Ok(()),
            Signal::Dead(_) => Err(SendError(
                slot.take().expect("undelivered value missing from slot"),
            )),
            Signal::None => unreachable!("blocking wait on a live operation returned none"),
        }
    }
}

impl<T: Send> Reader<T> {
    /// A reader whose channel is already dead; every receive fails.
    pub fn dead() -> Reader<T> {
        let (_w, r) = channel();
        r
    }

    /// Selective-wait operation receiving into `slot`.
    pub fn recv_op<'a>(&'a self, slot: &'a mut Option<T>) -> Op<'a> {
        // Clear here, outside any channel lock: the transfer overwrites
        // the slot while locks are held, and must not run drop code.
        *slot = None;
        Op {
            chan: self.raw,
            side: RD,
            kind: OpKind::Data,
            slot: slot as *mut Option<T> as *mut (),
            _marker: PhantomData,
        }
    }

    /// Selective-wait operation firing when every writer is gone.
    pub fn closed_op(&self) -> Op<'_> {
        Op {
            chan: self.raw,
            side: RD,
            kind: OpKind::Closed,
            slot: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Receives one value, blocking until a sender provides it. Fails
    /// when every writer is gone.
    pub fn recv(&self) -> Result<T, RecvError> {
        let mut slot = None;
        let sig = prialt(&[self.recv_op(&mut slot)]);
        match sig {
            Signal::Ready(_) => Ok(slot.take().expect("completed receive left slot empty")),
            Signal::Dead(_) => Err(RecvError),
            Signal::None => unreachable!("blocking wait on a live operation returned none"),
        }
    }

    /// Iterates received values until the channel dies.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { reader: self }
    }
}

pub struct Iter<'a, T> {
    reader: &'a Reader<T>,
}

impl<T: Send> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.reader.recv().ok()
    }
}

impl<'a, T: Send> IntoIterator for &'a Reader<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
pub(crate) fn live_refs<T>(w: &Writer<T>) -> (usize, usize) {
    // SAFETY: the writer holds a reference.
    let ch = unsafe { &*w.raw };
    (
        ch.refs[WR].load(Ordering::SeqCst),
        ch.refs[RD].load(Ordering::SeqCst),
    )
}
