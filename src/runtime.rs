//! The runtime: processors, workers, the global run queue, and the
//! parking machinery.
//!
//! Two modes share one code path. With a single processor everything is
//! cooperative on the bound thread and scheduling is a local-ring
//! affair. With two or more processors, worker threads (P1..Pn) pull
//! microthreads from their local rings, refill from the global queue,
//! steal from each other, and park on a condvar when idle; the main
//! thread (P0) only waits for the live-microthread count to drain.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::utils::Backoff;
use lazy_static::lazy_static;
use tracing::{debug, trace};

use crate::microthread::{self, MtPtr, RunResult};
use crate::processor::Processor;

/// Default microthread stack size. Double the original's 32 KiB to
/// leave headroom for Rust's formatting and unwinding frames.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

static STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);
static PIN_WORKERS: AtomicBool = AtomicBool::new(false);

/// Runtime construction options.
///
/// ```no_run
/// microcsp::Config::new().num_procs(4).pin_workers(true).init();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    num_procs: usize,
    stack_size: usize,
    pin_workers: bool,
}

impl Config {
    pub fn new() -> Self {
        Config {
            num_procs: 0,
            stack_size: DEFAULT_STACK_SIZE,
            pin_workers: false,
        }
    }

    /// Number of processors; `0` auto-detects, `1` selects the
    /// single-processor cooperative mode.
    pub fn num_procs(mut self, n: usize) -> Self {
        self.num_procs = n;
        self
    }

    /// Stack size for every subsequently spawned microthread.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Pin worker threads to cores, round-robin.
    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn init(self) {
        STACK_SIZE.store(self.stack_size, Ordering::Relaxed);
        PIN_WORKERS.store(self.pin_workers, Ordering::Relaxed);
        runtime().init(self.num_procs);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn stack_size() -> usize {
    STACK_SIZE.load(Ordering::Relaxed)
}

pub(crate) struct Runtime {
    /// P0 first; bound to the initializing thread.
    procs: RwLock<Vec<Arc<Processor>>>,
    nprocs: AtomicUsize,
    global: Mutex<VecDeque<MtPtr>>,
    park_mu: Mutex<()>,
    park_cv: Condvar,
    stopping: AtomicBool,
    live_gs: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    init_mu: Mutex<()>,
    scheduler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

lazy_static! {
    static ref RUNTIME: Runtime = Runtime {
        procs: RwLock::new(Vec::new()),
        nprocs: AtomicUsize::new(0),
        global: Mutex::new(VecDeque::new()),
        park_mu: Mutex::new(()),
        park_cv: Condvar::new(),
        stopping: AtomicBool::new(false),
        live_gs: AtomicUsize::new(0),
        workers: Mutex::new(Vec::new()),
        init_mu: Mutex::new(()),
        scheduler: Mutex::new(None),
    };
}

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

thread_local! {
    static CURRENT_P: RefCell<Option<Arc<Processor>>> = const { RefCell::new(None) };
}

pub(crate) fn current_processor() -> Option<Arc<Processor>> {
    CURRENT_P.with(|c| c.borrow().clone())
}

fn bind_processor(p: Arc<Processor>) {
    CURRENT_P.with(|c| *c.borrow_mut() = Some(p));
}

/// Initializes the runtime. `num_procs == 0` auto-detects; `1` selects
/// single-processor mode. A live runtime is shut down first, so the
/// call is idempotent relative to [`shutdown_runtime`].
pub fn init_runtime(num_procs: usize) {
    runtime().init(num_procs);
}

/// Stops the workers and clears all scheduling state, leaving the
/// library ready for a fresh [`init_runtime`]. Shutting down with live
/// microthreads is not supported.
pub fn shutdown_runtime() {
    runtime().shutdown();
}

/// Replaces the top-level scheduler invoked by [`run`]. The next
/// [`init_runtime`] restores the default.
pub fn set_scheduler<F>(f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    *runtime().scheduler.lock().unwrap() = Some(Arc::new(f));
}

/// Runs the top-level scheduler: by default, pump the local scheduler
/// until nothing is runnable (single-P) or block until every
/// microthread has exited (M:N).
pub fn run() {
    let rt = runtime();
    rt.ensure_init();
    let custom = rt.scheduler.lock().unwrap().clone();
    match custom {
        Some(f) => f(),
        None => {
            if rt.single_p() {
                rt.pump_until_idle();
            } else {
                rt.wait_idle();
            }
        }
    }
}

impl Runtime {
    pub(crate) fn single_p(&self) -> bool {
        self.nprocs.load(Ordering::Acquire) == 1
    }

    pub(crate) fn ensure_init(&self) {
        if self.nprocs.load(Ordering::Acquire) == 0 {
            self.init(1);
        }
    }

    fn init(&self, num_procs: usize) {
        let _init = self.init_mu.lock().unwrap();
        if self.nprocs.load(Ordering::Acquire) != 0 {
            self.shutdown_locked();
        }

        let n = if num_procs == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_procs
        };
        debug!(procs = n, "init runtime");

        self.stopping.store(false, Ordering::Release);
        self.live_gs.store(0, Ordering::Release);
        self.global.lock().unwrap().clear();
        *self.scheduler.lock().unwrap() = None;

        let procs: Vec<Arc<Processor>> = (0..n).map(|i| Arc::new(Processor::new(i))).collect();
        *self.procs.write().unwrap() = procs.clone();
        self.nprocs.store(n, Ordering::Release);
        bind_processor(procs[0].clone());

        let core_ids = if PIN_WORKERS.load(Ordering::Relaxed) {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = self.workers.lock().unwrap();
        for p in procs.iter().skip(1).cloned() {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[p.id % core_ids.len()])
            };
            let handle = thread::Builder::new()
                .name(format!("microcsp-worker-{}", p.id))
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        core_affinity::set_for_current(core_id);
                    }
                    bind_processor(p.clone());
                    runtime().worker_loop(&p);
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
    }

    fn shutdown(&self) {
        let _init = self.init_mu.lock().unwrap();
        self.shutdown_locked();
    }

    fn shutdown_locked(&self) {
        self.stopping.store(true, Ordering::Release);
        // Briefly cycle park_mu so a worker that has just passed the
        // predicate check is inside wait() before the broadcast.
        drop(self.park_mu.lock().unwrap());
        self.park_cv.notify_all();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for w in workers {
            let _ = w.join();
        }

        self.procs.write().unwrap().clear();
        self.nprocs.store(0, Ordering::Release);
        self.global.lock().unwrap().clear();
        debug!("runtime shut down");
    }

    /// Registers a freshly spawned microthread and makes it runnable.
    pub(crate) fn publish(&self, g: MtPtr) {
        self.live_gs.fetch_add(1, Ordering::SeqCst);
        if self.single_p() {
            self.schedule_local(g, false);
        } else {
            let mut q = self.global.lock().unwrap();
            self.push_to_global(&mut q, g);
            drop(q);
            self.unpark_one();
        }
    }

    /// Caller must hold the global-queue lock. The microthread must be
    /// off every local ring; the happens-before chain through the lock
    /// lets the popping worker see the cleared links.
    fn push_to_global(&self, q: &mut VecDeque<MtPtr>, g: MtPtr) {
        // SAFETY: `in_global` is guarded by the global-queue lock held
        // by the caller.
        unsafe {
            debug_assert!(!(*g.0).in_global.get());
            debug_assert!(!(*g.0).in_ring());
            (*g.0).in_global.set(true);
        }
        q.push_back(g);
    }

    /// The wake for a claimed microthread: hand it to whichever worker
    /// gets to it first (M:N) or back onto the local ring (single-P).
    /// Safe to call while holding channel locks. If the target is still
    /// inside its suspend window, defer with `wake_pending`;
    /// `drain_suspended` picks it up. The suspend-window check and the
    /// drain both run under the global-queue lock, so the two are
    /// totally ordered even for wakes arriving from plain OS threads.
    pub(crate) fn schedule(&self, g: MtPtr) {
        let mut q = self.global.lock().unwrap();
        // SAFETY: protocol fields are atomic; `in_global` is guarded by
        // the global-queue lock we hold.
        unsafe {
            if (*g.0).suspending.load(Ordering::Acquire) {
                (*g.0).wake_pending.store(true, Ordering::Release);
                trace!(id = (*g.0).id, "wake deferred: target suspending");
                return;
            }
            if self.single_p() {
                drop(q);
                self.schedule_local(g, false);
                return;
            }
            if (*g.0).in_global.get() {
                return;
            }
        }
        self.push_to_global(&mut q, g);
        drop(q);
        self.unpark_one();
    }

    /// Makes `g` runnable on the bound processor (P0 when called from a
    /// thread with no binding).
    pub(crate) fn schedule_local(&self, g: MtPtr, make_current: bool) {
        let p = match current_processor() {
            Some(p) => p,
            None => match self.procs.read().unwrap().first() {
                Some(p) => p.clone(),
                None => return,
            },
        };
        p.schedule_local(g, make_current);
        if self.single_p() {
            // A native caller may be pumping inside `park_cv`.
            self.park_note();
        }
    }

    /// Completes a suspension: clears the suspend window and honors any
    /// wake that arrived during it. Totally ordered with `schedule`
    /// through the global-queue lock.
    pub(crate) fn drain_suspended(&self, g: MtPtr) {
        let mut q = self.global.lock().unwrap();
        // SAFETY: `g` is fully suspended; its atomics are shared, and
        // `in_global` is only touched under the global-queue lock.
        unsafe {
            (*g.0).suspending.store(false, Ordering::Release);
            if !(*g.0).wake_pending.swap(false, Ordering::AcqRel) {
                return;
            }
            trace!(id = (*g.0).id, "draining deferred wake");
            if self.single_p() {
                drop(q);
                self.schedule_local(g, false);
                return;
            }
            if !(*g.0).in_global.get() {
                self.push_to_global(&mut q, g);
            }
        }
        drop(q);
        self.unpark_one();
    }

    fn unpark_one(&self) {
        // The empty critical section orders this wake against a worker
        // between its predicate check and the wait.
        drop(self.park_mu.lock().unwrap());
        self.park_cv.notify_all();
    }

    /// Wakes anything parked on the runtime condvar.
    pub(crate) fn park_note(&self) {
        drop(self.park_mu.lock().unwrap());
        self.park_cv.notify_all();
    }

    fn worker_loop(&self, p: &Arc<Processor>) {
        debug!(worker = p.id, "worker up");
        let backoff = Backoff::new();
        while !self.stopping.load(Ordering::Acquire) {
            p.fire_timers();

            if let Some(g) = p.local_next() {
                self.run_g(p, g);
                backoff.reset();
                continue;
            }
            if self.take_from_global(p) {
                continue;
            }
            if self.steal_work(p) {
                continue;
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            self.park(p);
            backoff.reset();
        }
        debug!(worker = p.id, "worker down");
    }

    /// Resumes `g` once and settles its queue state afterwards.
    pub(crate) fn run_g(&self, p: &Arc<Processor>, g: MtPtr) {
        // SAFETY: `g` was claimed from this processor's ring; no other
        // thread resumes it until it is back on a queue.
        match unsafe { microthread::resume(g.0) } {
            RunResult::Yielded => p.rotate(g),
            RunResult::Detached => {
                p.detach(g);
                self.drain_suspended(g);
            }
            RunResult::Done => {
                p.detach(g);
                // SAFETY: finished and off every queue; channel
                // registrations were removed before it returned.
                unsafe { microthread::reclaim(g.0) };
                if self.live_gs.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.park_note();
                }
            }
        }
    }

    /// Moves a fair share of the global queue onto this processor.
    fn take_from_global(&self, p: &Arc<Processor>) -> bool {
        let mut q = self.global.lock().unwrap();
        if q.is_empty() {
            return false;
        }
        let share = (q.len() / self.nprocs.load(Ordering::Relaxed).max(1)).max(1);
        for _ in 0..share {
            let Some(g) = q.pop_front() else { break };
            // SAFETY: `in_global` guarded by the held global-queue lock.
            unsafe { (*g.0).in_global.set(false) };
            p.schedule_local(g, false);
        }
        true
    }

    fn steal_work(&self, thief: &Arc<Processor>) -> bool {
        let procs = self.procs.read().unwrap().clone();
        for victim in &procs {
            if Arc::ptr_eq(victim, thief) {
                continue;
            }
            // A parked worker's ring is empty by construction.
            if victim.parked.load(Ordering::Acquire) {
                continue;
            }
            if let Some(g) = victim.steal() {
                trace!(thief = thief.id, victim = victim.id, "stole microthread");
                thief.schedule_local(g, false);
                return true;
            }
        }
        false
    }

    fn has_work(&self, p: &Processor) -> bool {
        if p.has_local_work() {
            return true;
        }
        if !self.global.lock().unwrap().is_empty() {
            return true;
        }
        p.timer_expired()
    }

    fn park(&self, p: &Arc<Processor>) {
        let guard = self.park_mu.lock().unwrap();
        p.parked.store(true, Ordering::Release);
        let pred =
            |_: &mut ()| !(self.stopping.load(Ordering::Acquire) || self.has_work(p));
        match p.next_deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let _guard = self.park_cv.wait_timeout_while(guard, timeout, pred).unwrap();
            }
            None => {
                let _guard = self.park_cv.wait_while(guard, pred).unwrap();
            }
        }
        p.parked.store(false, Ordering::Release);
    }

    /// One single-P scheduling step: fire timers, run one microthread.
    /// Returns false when nothing was runnable.
    pub(crate) fn run_once(&self) -> bool {
        let Some(p) = current_processor() else {
            return false;
        };
        p.fire_timers();
        match p.local_next() {
            Some(g) => {
                self.run_g(&p, g);
                true
            }
            None => false,
        }
    }

    /// Pumps the bound processor until no microthread is runnable and
    /// no timer is pending. Blocked microthreads are left suspended.
    pub(crate) fn pump_until_idle(&self) {
        loop {
            if self.run_once() {
                continue;
            }
            let deadline = current_processor().and_then(|p| p.next_deadline());
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                }
                None => break,
            }
        }
    }

    /// Blocks the calling thread until every microthread has exited.
    pub(crate) fn wait_idle(&self) {
        let guard = self.park_mu.lock().unwrap();
        let _guard = self
            .park_cv
            .wait_while(guard, |_| self.live_gs.load(Ordering::SeqCst) != 0)
            .unwrap();
    }

    /// Drives the scheduler from a native (non-microthread) context on
    /// the bound single-P thread until `done` holds, parking when
    /// nothing is runnable.
    pub(crate) fn pump_until(&self, done: &dyn Fn() -> bool) {
        loop {
            if done() {
                return;
            }
            if self.run_once() {
                continue;
            }
            let p = current_processor();
            let guard = self.park_mu.lock().unwrap();
            let pred = |_: &mut ()| {
                !(done()
                    || match p.as_deref() {
                        Some(p) => self.has_work(p),
                        None => true,
                    })
            };
            match p.as_ref().and_then(|p| p.next_deadline()) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    let _guard = self.park_cv.wait_timeout_while(guard, timeout, pred).unwrap();
                }
                None => {
                    let _guard = self.park_cv.wait_while(guard, pred).unwrap();
                }
            }
        }
    }
}

/// Auto-initializes a single-processor runtime if none is live.
pub(crate) fn ensure_init() {
    runtime().ensure_init();
}

/// Registers a freshly spawned microthread.
pub(crate) fn publish(g: MtPtr) {
    runtime().publish(g);
}

/// Cross-processor wake for a claimed microthread.
pub(crate) fn schedule(g: MtPtr) {
    runtime().schedule(g);
}
