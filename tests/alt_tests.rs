//! Selective-wait behavior: priorities, timeouts, and dead arms.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use microcsp as csp;
use microcsp::Signal;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn timeout_arm_fires_after_deadline() {
    let _guard = serial();
    csp::init_runtime(2);

    let (w, r) = csp::channel::<i32>();
    let outcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();

    csp::spawn(move || {
        let timeout = csp::after(Duration::from_millis(50));
        let start = Instant::now();
        let mut value = None;
        let mut fired = None;
        let sig = csp::alt(&[r.recv_op(&mut value), timeout.recv_op(&mut fired)]);
        *outcome2.lock().unwrap() = Some((sig, start.elapsed()));
    });
    csp::run();
    drop(w);

    let (sig, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(sig, Signal::Ready(1));
    assert!(elapsed >= Duration::from_millis(50), "woke after {elapsed:?}");

    csp::shutdown_runtime();
}

#[test]
fn keepalive_closure_stops_the_server() {
    let _guard = serial();
    csp::init_runtime(2);

    let (req_w, req_r) = csp::channel::<i32>();
    let (die_w, die_r) = csp::channel::<()>();
    let served = Arc::new(AtomicI64::new(0));
    let exit_signal = Arc::new(Mutex::new(None));

    let served2 = served.clone();
    let exit2 = exit_signal.clone();
    csp::spawn(move || loop {
        let mut request = None;
        let sig = csp::alt(&[req_r.recv_op(&mut request), die_r.closed_op()]);
        match sig {
            Signal::Ready(0) => {
                served2.fetch_add(request.take().unwrap() as i64, Ordering::SeqCst);
            }
            other => {
                *exit2.lock().unwrap() = Some(other);
                return;
            }
        }
    });

    req_w.send(5).unwrap();
    req_w.send(7).unwrap();
    // Dropping the keepalive writer is the kill signal.
    drop(die_w);
    csp::run();

    assert_eq!(served.load(Ordering::SeqCst), 12);
    assert_eq!(*exit_signal.lock().unwrap(), Some(Signal::Dead(1)));

    csp::shutdown_runtime();
}

#[test]
fn waiters_match_in_registration_order() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    let results = Arc::new(Mutex::new(Vec::new()));

    for id in 0..3 {
        let r = r.clone();
        let results = results.clone();
        csp::spawn(move || {
            let value = r.recv().unwrap();
            results.lock().unwrap().push((id, value));
        });
        // Park this reader before spawning the next, fixing the
        // registration order.
        csp::run();
    }
    drop(r);

    for value in [10, 20, 30] {
        w.send(value).unwrap();
    }
    csp::run();

    // First registered is first matched, whatever order they resumed.
    let mut results = results.lock().unwrap().clone();
    results.sort_unstable();
    assert_eq!(results, vec![(0, 10), (1, 20), (2, 30)]);

    csp::shutdown_runtime();
}

#[test]
fn vulture_on_writer_side_sees_reader_exodus() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    let finished = Arc::new(AtomicUsize::new(0));
    let finished2 = finished.clone();
    csp::spawn(move || {
        // `mute` holds the writer and returns once every reader is
        // gone.
        csp::chan::mute(w);
        finished2.fetch_add(1, Ordering::SeqCst);
    });
    csp::run();
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    drop(r);
    csp::run();
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    csp::shutdown_runtime();
}

#[test]
fn killswitch_forwards_until_keepalive_dies() {
    let _guard = serial();
    csp::init_runtime(1);

    let (in_w, in_r) = csp::channel::<i32>();
    let (out_w, out_r) = csp::channel::<i32>();
    let (keep_w, keep_r) = csp::channel::<()>();

    csp::spawn(move || {
        csp::chan::killswitch(in_r, out_w, keep_r);
    });

    let collected = Arc::new(Mutex::new(Vec::new()));
    let collected2 = collected.clone();
    csp::spawn(move || {
        for v in out_r.iter() {
            collected2.lock().unwrap().push(v);
        }
    });

    in_w.send(1).unwrap();
    in_w.send(2).unwrap();
    drop(keep_w);
    drop(in_w);
    csp::run();

    assert_eq!(*collected.lock().unwrap(), vec![1, 2]);

    csp::shutdown_runtime();
}

#[test]
fn alt_mixing_send_and_recv_arms() {
    let _guard = serial();
    csp::init_runtime(1);

    let (aw, ar) = csp::channel::<i32>();
    let (bw, br) = csp::channel::<i32>();

    // A peer ready to receive on `b`, none on `a`.
    csp::spawn(move || {
        assert_eq!(br.recv(), Ok(9));
    });
    csp::run();

    let mut incoming = None;
    let mut outgoing = Some(9);
    let sig = csp::prialt(&[ar.recv_op(&mut incoming), bw.send_op(&mut outgoing)]);
    assert_eq!(sig, Signal::Ready(1));
    assert_eq!(outgoing, None);

    drop(aw);
    csp::run();
    csp::shutdown_runtime();
}

#[test]
fn nowait_scans_before_giving_up() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    csp::spawn(move || {
        w.send(3).unwrap();
    });
    csp::run();

    // The writer is parked, so even a nowait alt completes it.
    let mut slot = None;
    let sig = csp::alt_nowait(&[r.recv_op(&mut slot)]);
    assert_eq!(sig, Signal::Ready(0));
    assert_eq!(slot, Some(3));

    csp::run();
    csp::shutdown_runtime();
}
