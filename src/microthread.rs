//! Microthread management and execution context.
//!
//! A microthread (G) is a cooperatively-scheduled task with its own
//! fixed-size stack, multiplexed onto the runtime's worker threads. The
//! context switch itself is `corosensei`'s resume/suspend pair; this
//! module adds the lifecycle around it: spawning, the panic-publication
//! protocol, and the atomic state that makes cross-thread wakes safe.

use std::cell::{Cell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use lazy_static::lazy_static;
use tracing::{error, trace};

use crate::channel::{channel, Writer};
use crate::error::{Error, Panic, RecvError};
use crate::runtime;
use crate::Reader;

/// Selective-wait state: not parked in `alt`.
pub(crate) const ALT_IDLE: u32 = 0;
/// Registered on one or more channel endpoints and suspended (or about to).
pub(crate) const ALT_WAITING: u32 = 1;
/// A waker won the CAS; `signal` holds the outcome.
pub(crate) const ALT_CLAIMED: u32 = 2;

/// Why a microthread suspended back to its worker.
pub(crate) enum SwitchReason {
    /// Voluntary yield; rotate to the back of the local ring.
    Yielded,
    /// Blocking on a channel or timer; leave the local ring.
    Detached,
}

/// Outcome of resuming a microthread once.
pub(crate) enum RunResult {
    Yielded,
    Detached,
    Done,
}

/// Raw microthread handle. The pointee is a leaked `Box<Microthread>`
/// whose address stays stable for the microthread's whole life; it is
/// reclaimed by the worker that observes its final return.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct MtPtr(pub *mut Microthread);

// SAFETY: all shared state behind the pointer is either atomic or
// guarded by a runtime lock (ring links by `run_mu`, `in_global` by
// `global_mu`); the coroutine itself is only touched by the single
// worker currently executing the microthread.
unsafe impl Send for MtPtr {}
unsafe impl Sync for MtPtr {}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const DESCR_MAX: usize = 31;

pub(crate) struct Microthread {
    pub(crate) id: u64,
    coro: UnsafeCell<Option<Coroutine<(), SwitchReason, ()>>>,
    yielder: Cell<*const Yielder<(), SwitchReason>>,

    /// Intrusive links for the owning processor's circular run queue.
    /// Null when the microthread is in no local ring. Guarded by that
    /// processor's `run_mu`.
    pub(crate) prev: Cell<*mut Microthread>,
    pub(crate) next: Cell<*mut Microthread>,

    /// True iff sitting in the runtime's global run queue. Guarded by
    /// `global_mu`.
    pub(crate) in_global: Cell<bool>,

    pub(crate) alt_state: AtomicU32,
    /// Signed selective-wait outcome: `+i` for a completed operation,
    /// `-i` for a dead channel, 1-based.
    pub(crate) signal: AtomicI32,

    /// True from the moment an `alt` releases its channel locks until
    /// the context switch has completed on the worker side. While set,
    /// wakers must defer to `wake_pending` instead of enqueueing.
    pub(crate) suspending: AtomicBool,
    pub(crate) wake_pending: AtomicBool,

    status: Mutex<String>,
}

impl Microthread {
    fn new(coro: Option<Coroutine<(), SwitchReason, ()>>) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Microthread {
            id,
            coro: UnsafeCell::new(coro),
            yielder: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
            in_global: Cell::new(false),
            alt_state: AtomicU32::new(ALT_IDLE),
            signal: AtomicI32::new(0),
            suspending: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            status: Mutex::new(format!("g{id}")),
        }
    }

    /// A coroutine-less microthread serving as a run-queue sentinel.
    pub(crate) fn sentinel() -> Box<Microthread> {
        let mt = Box::new(Microthread::new(None));
        // The sentinel forms a one-element ring with itself.
        let p = &*mt as *const Microthread as *mut Microthread;
        mt.prev.set(p);
        mt.next.set(p);
        mt
    }

    pub(crate) fn in_ring(&self) -> bool {
        !self.next.get().is_null()
    }
}

thread_local! {
    static CURRENT: Cell<*mut Microthread> = const { Cell::new(ptr::null_mut()) };
}

/// The microthread executing on this thread, if any.
pub(crate) fn current() -> Option<*mut Microthread> {
    let g = CURRENT.with(|c| c.get());
    if g.is_null() {
        None
    } else {
        Some(g)
    }
}

pub(crate) fn set_current(g: *mut Microthread) {
    CURRENT.with(|c| c.set(g));
}

/// Resumes `g` on the calling thread until its next suspension point.
///
/// # Safety
///
/// The caller must be the only thread executing `g` (enforced by the
/// run-queue discipline: a microthread is claimed from exactly one
/// queue before being resumed).
pub(crate) unsafe fn resume(g: *mut Microthread) -> RunResult {
    set_current(g);
    let coro = (*(*g).coro.get())
        .as_mut()
        .expect("attempted to resume a sentinel microthread");
    let result = catch_unwind(AssertUnwindSafe(|| coro.resume(())));
    set_current(ptr::null_mut());
    match result {
        Ok(CoroutineResult::Yield(SwitchReason::Yielded)) => RunResult::Yielded,
        Ok(CoroutineResult::Yield(SwitchReason::Detached)) => RunResult::Detached,
        Ok(CoroutineResult::Return(())) => RunResult::Done,
        Err(_) => {
            // User panics are caught at the entry frame; anything that
            // reaches here unwound the coroutine to completion.
            error!(id = (*g).id, "panic escaped a microthread entry frame");
            RunResult::Done
        }
    }
}

/// Suspends the current microthread back to its worker.
///
/// # Safety
///
/// `g` must be the microthread currently executing on this thread.
pub(crate) unsafe fn suspend(g: *mut Microthread, reason: SwitchReason) {
    let yielder = (*g).yielder.get();
    debug_assert!(!yielder.is_null(), "suspend before first resume");
    (*yielder).suspend(reason);
}

/// Reclaims a finished microthread.
///
/// # Safety
///
/// `g` must have returned from its coroutine and be on no queue; no
/// other thread may still hold the handle.
pub(crate) unsafe fn reclaim(g: *mut Microthread) {
    trace!(id = (*g).id, "reclaim");
    drop(Box::from_raw(g));
}

/// Yields so other microthreads can run. On a plain OS thread this
/// degrades to `std::thread::yield_now`.
pub fn yield_now() {
    if let Some(g) = current() {
        // SAFETY: `g` is the microthread running on this thread.
        unsafe { suspend(g, SwitchReason::Yielded) };
    } else {
        std::thread::yield_now();
    }
}

/// Sets the current microthread's diagnostic description, truncated to
/// 31 bytes. No-op outside a microthread.
pub fn descr(text: &str) {
    if let Some(g) = current() {
        let mut end = text.len().min(DESCR_MAX);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        // SAFETY: `g` is alive while it executes.
        let status = unsafe { &(*g).status };
        *status.lock().unwrap() = text[..end].to_string();
    }
}

/// The current microthread's diagnostic description.
pub fn current_descr() -> Option<String> {
    // SAFETY: `g` is alive while it executes.
    current().map(|g| unsafe { (*g).status.lock().unwrap().clone() })
}

lazy_static! {
    static ref GLOBAL_PANIC: Mutex<Option<Writer<Panic>>> = Mutex::new(None);
}

/// Attaches the process-global panic channel and returns its reader.
/// Panics from microthreads whose own panic reader was dropped are
/// delivered here. Fails if already attached.
pub fn panic_channel() -> Result<Reader<Panic>, Error> {
    let mut slot = GLOBAL_PANIC.lock().unwrap();
    if slot.is_some() {
        return Err(Error::HandlerAttached);
    }
    let (w, r) = channel();
    *slot = Some(w);
    Ok(r)
}

fn publish_panic(w: Writer<Panic>, payload: Panic) {
    let payload = match w.send(payload) {
        Ok(()) => return,
        Err(err) => err.0,
    };
    let handler = GLOBAL_PANIC.lock().unwrap().clone();
    if let Some(gw) = handler {
        if gw.send(payload).is_ok() {
            return;
        }
    }
    error!("uncaught microthread panic with no live panic reader; aborting");
    std::process::abort();
}

/// Starts a new microthread running `f`.
///
/// Returns a reader that yields the panic payload if `f` panics, and
/// closes when the microthread exits. Ignoring the reader routes any
/// panic to the global panic channel (see [`panic_channel`]); with that
/// unattached too, the process aborts.
///
/// # Panics
///
/// Panics if the stack allocation fails; use [`try_spawn`] to handle
/// that case.
pub fn spawn<F>(f: F) -> Reader<Panic>
where
    F: FnOnce() + Send + 'static,
{
    try_spawn(f).expect("spawn: microthread stack allocation failed")
}

/// Fallible variant of [`spawn`].
pub fn try_spawn<F>(f: F) -> Result<Reader<Panic>, Error>
where
    F: FnOnce() + Send + 'static,
{
    runtime::ensure_init();
    let (panic_w, panic_r) = channel::<Panic>();

    let stack = DefaultStack::new(runtime::stack_size()).map_err(Error::Spawn)?;
    let g = Box::into_raw(Box::new(Microthread::new(None)));
    let gp = MtPtr(g);

    let coro = Coroutine::with_stack(stack, move |yielder, ()| {
        // SAFETY: the handle stays valid until the worker reclaims it
        // after this closure returns.
        unsafe { (*gp.0).yielder.set(yielder as *const _) };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            publish_panic(panic_w, payload);
        }
        // Dropping `panic_w` on the way out signals a clean exit.
    });
    // SAFETY: `g` is not yet published; no other thread can touch it.
    let id = unsafe {
        *(*g).coro.get() = Some(coro);
        (*g).id
    };

    trace!(id, "spawn");
    runtime::publish(gp);
    Ok(panic_r)
}

/// Blocks until the microthread behind `r` exits; re-raises its panic,
/// if any, on the calling context.
pub fn join(r: Reader<Panic>) {
    match r.recv() {
        Ok(payload) => std::panic::resume_unwind(payload),
        Err(RecvError) => {}
    }
}

/// Spawns a microthread that feeds the returned reader through a fresh
/// channel.
pub fn spawn_producer<T, F>(f: F) -> Reader<T>
where
    T: Send + 'static,
    F: FnOnce(Writer<T>) + Send + 'static,
{
    let (w, r) = channel();
    spawn(move || f(w));
    r
}

/// Spawns a microthread that drains the returned writer through a fresh
/// channel.
pub fn spawn_consumer<T, F>(f: F) -> Writer<T>
where
    T: Send + 'static,
    F: FnOnce(Reader<T>) + Send + 'static,
{
    let (w, r) = channel();
    spawn(move || f(r));
    w
}

/// Spawns a microthread between a fresh input and output channel,
/// returning the outside ends.
pub fn spawn_filter<T, F>(f: F) -> (Writer<T>, Reader<T>)
where
    T: Send + 'static,
    F: FnOnce(Reader<T>, Writer<T>) + Send + 'static,
{
    let (in_w, in_r) = channel();
    let (out_w, out_r) = channel();
    spawn(move || f(in_r, out_w));
    (in_w, out_r)
}
