//! Per-processor scheduling state.
//!
//! A processor (P) is a logical scheduling slot bound to one OS thread:
//! the main thread for P0, a worker thread for the rest. Each P owns a
//! circular intrusive run queue of microthreads anchored by a sentinel,
//! plus a min-heap of timer deadlines.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Instant;

use crate::microthread::{Microthread, MtPtr};

pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) thread: MtPtr,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Head and claim pointers for the circular run queue. The intrusive
/// `prev`/`next` links live in the microthreads themselves; everything
/// here and there is guarded by the owning mutex.
pub(crate) struct RingState {
    /// Current head. Always valid: the sentinel never leaves the ring.
    busy: *mut Microthread,
    /// The microthread claimed by `local_next` and currently executing,
    /// which work stealing must leave alone.
    running: *mut Microthread,
}

// SAFETY: the raw pointers are only dereferenced under the ring mutex.
unsafe impl Send for RingState {}

pub(crate) struct Processor {
    pub(crate) id: usize,
    /// Sentinel microthread anchoring the ring; has no coroutine.
    sentinel: Box<Microthread>,
    ring: Mutex<RingState>,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    pub(crate) parked: AtomicBool,
}

// SAFETY: the sentinel's ring links are only touched under the ring
// mutex; it has no coroutine and is never executed.
unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Processor {
    pub(crate) fn new(id: usize) -> Self {
        let sentinel = Microthread::sentinel();
        let anchor = &*sentinel as *const Microthread as *mut Microthread;
        Processor {
            id,
            sentinel,
            ring: Mutex::new(RingState {
                busy: anchor,
                running: std::ptr::null_mut(),
            }),
            timers: Mutex::new(BinaryHeap::new()),
            parked: AtomicBool::new(false),
        }
    }

    fn anchor(&self) -> *mut Microthread {
        &*self.sentinel as *const Microthread as *mut Microthread
    }

    /// Splices `g` into the ring at the tail, or at the head with
    /// `make_current` so it runs next. No-op if already in a ring.
    pub(crate) fn schedule_local(&self, g: MtPtr, make_current: bool) {
        let mut st = self.ring.lock().unwrap();
        // SAFETY: links are guarded by the ring mutex we hold.
        unsafe {
            if (*g.0).in_ring() {
                return;
            }
            let busy = st.busy;
            let tail = (*busy).prev.get();
            (*g.0).next.set(busy);
            (*g.0).prev.set(tail);
            (*tail).next.set(g.0);
            (*busy).prev.set(g.0);
            if make_current {
                st.busy = g.0;
            }
        }
    }

    /// Unlinks `g` from the ring and clears the claim on it.
    pub(crate) fn detach(&self, g: MtPtr) {
        let mut st = self.ring.lock().unwrap();
        // SAFETY: links are guarded by the ring mutex we hold.
        unsafe {
            debug_assert!((*g.0).in_ring());
            if st.busy == g.0 {
                st.busy = (*g.0).next.get();
            }
            let prev = (*g.0).prev.get();
            let next = (*g.0).next.get();
            (*prev).next.set(next);
            (*next).prev.set(prev);
            (*g.0).prev.set(std::ptr::null_mut());
            (*g.0).next.set(std::ptr::null_mut());
        }
        if st.running == g.0 {
            st.running = std::ptr::null_mut();
        }
    }

    /// Rotates the head past `g` after a voluntary yield.
    pub(crate) fn rotate(&self, g: MtPtr) {
        let mut st = self.ring.lock().unwrap();
        if st.busy == g.0 {
            // SAFETY: `g` is still linked; guarded by the ring mutex.
            st.busy = unsafe { (*g.0).next.get() };
        }
        if st.running == g.0 {
            st.running = std::ptr::null_mut();
        }
    }

    /// Claims the next runnable microthread, skipping the sentinel.
    pub(crate) fn local_next(&self) -> Option<MtPtr> {
        let mut st = self.ring.lock().unwrap();
        let anchor = self.anchor();
        let mut candidate = st.busy;
        if candidate == anchor {
            // SAFETY: ring links guarded by the held mutex.
            candidate = unsafe { (*candidate).next.get() };
        }
        if candidate == anchor {
            return None;
        }
        st.busy = candidate;
        st.running = candidate;
        Some(MtPtr(candidate))
    }

    /// Victim side of work stealing: unlink and hand over the tail of
    /// the ring, unless it is the sentinel or currently executing.
    pub(crate) fn steal(&self) -> Option<MtPtr> {
        let st = self.ring.lock().unwrap();
        let anchor = self.anchor();
        // SAFETY: ring links guarded by the held mutex.
        unsafe {
            let candidate = (*st.busy).prev.get();
            if candidate == anchor || candidate == st.busy || candidate == st.running {
                return None;
            }
            let prev = (*candidate).prev.get();
            let next = (*candidate).next.get();
            (*prev).next.set(next);
            (*next).prev.set(prev);
            (*candidate).prev.set(std::ptr::null_mut());
            (*candidate).next.set(std::ptr::null_mut());
            Some(MtPtr(candidate))
        }
    }

    /// True iff the ring holds anything besides the sentinel.
    pub(crate) fn has_local_work(&self) -> bool {
        let st = self.ring.lock().unwrap();
        let anchor = self.anchor();
        // SAFETY: ring links guarded by the held mutex.
        st.busy != anchor || unsafe { (*anchor).next.get() } != anchor
    }

    pub(crate) fn push_timer(&self, deadline: Instant, thread: MtPtr) {
        self.timers
            .lock()
            .unwrap()
            .push(Reverse(TimerEntry { deadline, thread }));
    }

    /// Reschedules every microthread whose deadline has passed.
    pub(crate) fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let expired = {
                let mut heap = self.timers.lock().unwrap();
                let due = matches!(heap.peek(), Some(Reverse(entry)) if entry.deadline <= now);
                if due {
                    heap.pop()
                } else {
                    None
                }
            };
            match expired {
                Some(Reverse(entry)) => self.schedule_local(entry.thread, false),
                None => break,
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().unwrap().peek().map(|r| r.0.deadline)
    }

    pub(crate) fn timer_expired(&self) -> bool {
        match self.next_deadline() {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }
}
