//! Selective wait: the multi-way rendezvous engine behind `alt` and
//! `prialt`.
//!
//! An operation set is resolved in four steps: lock every referenced
//! channel in ascending id order; scan for a peer that can complete a
//! rendezvous right now; otherwise register on every endpoint and
//! suspend; on wake-up, deregister under the same locks and report the
//! signalled index. Claims are a compare-and-swap on the waiter's alt
//! state, so exactly one waker wins no matter how many channels fire at
//! once.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use rand::Rng;
use smallvec::SmallVec;
use tracing::trace;

use crate::channel::{ChanState, RawChan, WaitEntry, WR};
use crate::microthread::{
    self, yield_now, MtPtr, SwitchReason, ALT_CLAIMED, ALT_IDLE, ALT_WAITING,
};
use crate::runtime::{self, current_processor, runtime};

/// Outcome of a selective wait.
///
/// Indices are positions in the operation slice handed to
/// [`alt`]/[`prialt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The operation completed a rendezvous.
    Ready(usize),
    /// The channel behind the operation is dead.
    Dead(usize),
    /// Nothing to do: every operation was inactive, or `nowait` was set
    /// and no peer was ready.
    None,
}

#[derive(Clone, Copy)]
pub(crate) enum OpKind {
    /// A data transfer (send or receive).
    Data,
    /// A close-watcher ("vulture"): fires when the opposite endpoint
    /// fully closes.
    Closed,
}

/// One operation of a selective wait, built by the endpoint methods
/// `send_op`, `recv_op`, and `closed_op`. The borrow keeps both the
/// endpoint and the message slot alive for the duration of the wait.
pub struct Op<'a> {
    pub(crate) chan: *const RawChan,
    pub(crate) side: usize,
    pub(crate) kind: OpKind,
    pub(crate) slot: *mut (),
    pub(crate) _marker: PhantomData<&'a mut ()>,
}

impl Op<'_> {
    /// An inactive operation; never completes. A wait over only
    /// inactive operations returns [`Signal::None`].
    pub fn none() -> Op<'static> {
        Op {
            chan: ptr::null(),
            side: WR,
            kind: OpKind::Closed,
            slot: ptr::null_mut(),
            _marker: PhantomData,
        }
    }
}

/// Park-and-notify state for blocking channel operations on plain OS
/// threads (one per thread). Mirrors the microthread's alt fields; the
/// wake side is a condvar instead of a scheduler push.
pub(crate) struct NativeParker {
    pub(crate) state: AtomicU32,
    pub(crate) signal: AtomicI32,
    mu: Mutex<()>,
    cv: Condvar,
}

impl NativeParker {
    fn new() -> Self {
        NativeParker {
            state: AtomicU32::new(ALT_IDLE),
            signal: AtomicI32::new(0),
            mu: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut guard = self.mu.lock().unwrap();
        while self.state.load(Ordering::Acquire) != ALT_CLAIMED {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    fn wake(&self) {
        // The empty critical section orders this against a waiter
        // between its state check and the wait.
        drop(self.mu.lock().unwrap());
        self.cv.notify_all();
        // A single-P native waiter parks on the runtime condvar while
        // it pumps the scheduler.
        runtime().park_note();
    }
}

thread_local! {
    static NATIVE: NativeParker = NativeParker::new();
}

fn native_parker() -> *const NativeParker {
    NATIVE.with(|p| p as *const NativeParker)
}

/// Identity of a waiting party: a microthread or a plain OS thread.
#[derive(Clone, Copy)]
pub(crate) enum TaskRef {
    Micro(MtPtr),
    Native(*const NativeParker),
}

// SAFETY: both variants point at state that outlives the registration
// (the microthread until reclaimed after its registrations are gone;
// the parker for its thread's lifetime) and is internally synchronized.
unsafe impl Send for TaskRef {}

impl TaskRef {
    fn current() -> TaskRef {
        match microthread::current() {
            Some(g) => TaskRef::Micro(MtPtr(g)),
            None => TaskRef::Native(native_parker()),
        }
    }

    pub(crate) fn key(&self) -> usize {
        match self {
            TaskRef::Micro(p) => p.0 as usize,
            TaskRef::Native(p) => *p as usize,
        }
    }

    fn state(&self) -> &AtomicU32 {
        // SAFETY: see the Send justification above.
        unsafe {
            match self {
                TaskRef::Micro(p) => &(*p.0).alt_state,
                TaskRef::Native(p) => &(**p).state,
            }
        }
    }

    pub(crate) fn signal(&self) -> &AtomicI32 {
        // SAFETY: see the Send justification above.
        unsafe {
            match self {
                TaskRef::Micro(p) => &(*p.0).signal,
                TaskRef::Native(p) => &(**p).signal,
            }
        }
    }

    /// Attempts the `WAITING -> CLAIMED` transition that gives the
    /// caller exclusive right to wake this task.
    pub(crate) fn claim(&self) -> bool {
        self.state()
            .compare_exchange(ALT_WAITING, ALT_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn wake(&self) {
        match self {
            TaskRef::Micro(p) => runtime::schedule(*p),
            // SAFETY: see the Send justification above.
            TaskRef::Native(p) => unsafe { (**p).wake() },
        }
    }
}

/// Waits until one operation completes, breaking ties uniformly at
/// random.
pub fn alt(ops: &[Op<'_>]) -> Signal {
    signal_of(alt_raw(ops, false))
}

/// Like [`alt`], but returns [`Signal::None`] instead of blocking.
pub fn alt_nowait(ops: &[Op<'_>]) -> Signal {
    signal_of(alt_raw(ops, true))
}

/// Waits until one operation completes, breaking ties in list order.
pub fn prialt(ops: &[Op<'_>]) -> Signal {
    signal_of(prialt_at(ops, false, 0))
}

/// Like [`prialt`], but returns [`Signal::None`] instead of blocking.
pub fn prialt_nowait(ops: &[Op<'_>]) -> Signal {
    signal_of(prialt_at(ops, true, 0))
}

fn alt_raw(ops: &[Op<'_>], nowait: bool) -> i32 {
    if ops.len() <= 1 {
        return prialt_at(ops, nowait, 0);
    }
    let offset = rand::thread_rng().gen_range(0..ops.len());
    prialt_at(ops, nowait, offset)
}

fn signal_of(raw: i32) -> Signal {
    match raw {
        0 => Signal::None,
        i if i > 0 => Signal::Ready(i as usize - 1),
        i => Signal::Dead((-i) as usize - 1),
    }
}

fn lock_all<'a>(chans: &[&'a RawChan]) -> SmallVec<[MutexGuard<'a, ChanState>; 8]> {
    chans.iter().map(|c| c.state.lock().unwrap()).collect()
}

fn prialt_at(ops: &[Op<'_>], nowait: bool, offset: usize) -> i32 {
    runtime::ensure_init();
    let count = ops.len();

    // Phase 0: the unique referenced channels, ascending by id — the
    // global lock order.
    let mut chans: SmallVec<[&RawChan; 8]> = SmallVec::new();
    for op in ops {
        if !op.chan.is_null() {
            // SAFETY: the op's borrow keeps its endpoint, and thus the
            // channel core, alive across the whole wait.
            chans.push(unsafe { &*op.chan });
        }
    }
    chans.sort_unstable_by_key(|c| c.id);
    chans.dedup_by_key(|c| c.id);
    let state_of = |chans: &[&RawChan], target: *const RawChan| -> usize {
        chans
            .iter()
            .position(|c| ptr::eq(*c as *const RawChan, target))
            .expect("operation references an unlocked channel")
    };

    let me = TaskRef::current();
    let mut guards = lock_all(&chans);

    // Phase 1: immediate completion, in priority order rotated by
    // `offset`.
    let mut all_null = true;
    for k in 0..count {
        let i = (offset + k) % count;
        let op = &ops[i];
        if op.chan.is_null() {
            continue;
        }
        // SAFETY: as above; channel alive through the op's borrow.
        let ch = unsafe { &*op.chan };
        if !ch.alive() {
            return -((i + 1) as i32);
        }
        all_null = false;
        if !matches!(op.kind, OpKind::Data) {
            continue;
        }

        let claimed = {
            let state = &mut *guards[state_of(&chans, op.chan)];
            let mut found = None;
            for entry in state.eps[1 - op.side].waiters.iter() {
                if entry.task.claim() {
                    found = Some(*entry);
                    break;
                }
            }
            found
        };
        let Some(entry) = claimed else { continue };

        entry
            .task
            .signal()
            .store((entry.index + 1) as i32, Ordering::Release);
        let (src, dst) = if op.side == WR {
            (op.slot, entry.slot)
        } else {
            (entry.slot, op.slot)
        };
        debug_assert!(!src.is_null() && !dst.is_null());
        // SAFETY: both slots belong to parties pinned for the duration:
        // ours by the op borrow, the peer's by its suspension. The
        // channel lock serializes the transfer.
        unsafe { (ch.tx)(src, dst) };
        trace!(chan = ch.id, op = i, "rendezvous complete");

        if op.side == WR && runtime().single_p() {
            if let TaskRef::Micro(mt) = entry.task {
                // Hand off: the reader runs next, we resume after it.
                drop(guards);
                runtime().schedule_local(mt, true);
                yield_now();
                return (i + 1) as i32;
            }
        }
        entry.task.wake();
        return (i + 1) as i32;
    }

    if all_null || nowait {
        return 0;
    }

    // Phase 2: register on every endpoint, then suspend. For a
    // microthread, `suspending` must be raised before the channel locks
    // drop: a waker that claims us in the gap before the context switch
    // completes must defer (wake_pending) rather than schedule us onto
    // a worker while we are still running.
    me.signal().store(0, Ordering::Relaxed);
    me.state().store(ALT_WAITING, Ordering::Release);
    for (i, op) in ops.iter().enumerate() {
        if op.chan.is_null() {
            continue;
        }
        let state = &mut *guards[state_of(&chans, op.chan)];
        let entry = WaitEntry {
            task: me,
            index: i,
            slot: op.slot,
        };
        match op.kind {
            OpKind::Data => state.eps[op.side].waiters.push(entry),
            OpKind::Closed => {
                state.eps[op.side].vultures.insert(entry);
            }
        }
    }

    match me {
        TaskRef::Micro(mt) => {
            // SAFETY: mt is the current microthread.
            unsafe {
                (*mt.0).suspending.store(true, Ordering::Release);
                drop(guards);
                microthread::suspend(mt.0, SwitchReason::Detached);
            }
        }
        TaskRef::Native(p) => {
            drop(guards);
            // SAFETY: the parker is this thread's own thread-local.
            let parker = unsafe { &*p };
            let rt = runtime();
            if rt.single_p() && current_processor().is_some() {
                // Nobody else runs microthreads in single-P mode: drive
                // the scheduler ourselves until a peer claims us.
                rt.pump_until(&|| parker.state.load(Ordering::Acquire) == ALT_CLAIMED);
            } else {
                parker.wait();
            }
        }
    }

    // Phase 3: woken (or handed a dead signal). Deregister everywhere
    // under the same sorted locks; wakers never remove entries.
    let mut guards = lock_all(&chans);
    for (i, op) in ops.iter().enumerate() {
        if op.chan.is_null() {
            continue;
        }
        let state = &mut *guards[state_of(&chans, op.chan)];
        let entry = WaitEntry {
            task: me,
            index: i,
            slot: op.slot,
        };
        match op.kind {
            OpKind::Data => {
                state.eps[op.side].waiters.remove(&entry);
            }
            OpKind::Closed => {
                state.eps[op.side].vultures.remove(&entry);
            }
        }
    }
    drop(guards);

    let result = me.signal().load(Ordering::Acquire);
    me.state().store(ALT_IDLE, Ordering::Release);
    debug_assert!(result != 0, "woken selective wait carries no signal");
    result
}
