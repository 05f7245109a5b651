//! Unit tests for the single-processor scheduling and rendezvous core.
//! The runtime is a process-wide singleton, so tests serialize on a
//! lock and leave the runtime shut down.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    alt, alt_nowait, channel, descr, init_runtime, prialt, prialt_nowait, run,
    shutdown_runtime, spawn, yield_now, Op, Signal,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn send_recv_roundtrip() {
    let _guard = serial();
    init_runtime(1);

    let (w, r) = channel::<String>();
    spawn(move || {
        w.send("hello".to_string()).unwrap();
    });
    assert_eq!(r.recv().unwrap(), "hello");

    shutdown_runtime();
}

#[test]
fn cooperative_round_robin() {
    let _guard = serial();
    init_runtime(1);

    let log = Arc::new(Mutex::new(Vec::new()));
    for id in 0..2 {
        let log = log.clone();
        spawn(move || {
            for step in 0..3 {
                log.lock().unwrap().push((id, step));
                yield_now();
            }
        });
    }
    run();

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]
    );

    shutdown_runtime();
}

#[test]
fn prialt_prefers_first_ready() {
    let _guard = serial();
    init_runtime(1);

    let (wa, ra) = channel::<i32>();
    let (wb, rb) = channel::<i32>();
    spawn(move || {
        wa.send(1).unwrap();
    });
    spawn(move || {
        wb.send(2).unwrap();
    });
    // Park both writers on their channels.
    run();

    let mut a = None;
    let mut b = None;
    let sig = prialt(&[ra.recv_op(&mut a), rb.recv_op(&mut b)]);
    match sig {
        Signal::Ready(0) => assert_eq!(a.take(), Some(1)),
        other => panic!("expected the first arm, got {other:?}"),
    }
    assert_eq!(rb.recv(), Ok(2));

    shutdown_runtime();
}

#[test]
fn alt_over_inactive_ops_returns_none() {
    let _guard = serial();
    init_runtime(1);

    assert_eq!(alt(&[Op::none(), Op::none()]), Signal::None);
    assert_eq!(prialt(&[]), Signal::None);

    shutdown_runtime();
}

#[test]
fn nowait_returns_none_without_peer() {
    let _guard = serial();
    init_runtime(1);

    let (w, r) = channel::<i32>();
    let mut slot = None;
    assert_eq!(alt_nowait(&[r.recv_op(&mut slot)]), Signal::None);

    let mut out = Some(7);
    assert_eq!(prialt_nowait(&[w.send_op(&mut out)]), Signal::None);
    assert_eq!(out, Some(7));

    shutdown_runtime();
}

#[test]
fn dead_channel_signals_negative_index() {
    let _guard = serial();
    init_runtime(1);

    let (w, r) = channel::<i32>();
    drop(w);
    let mut slot = None;
    assert_eq!(prialt(&[r.recv_op(&mut slot)]), Signal::Dead(0));

    // A send against dropped readers fails and keeps the value.
    let (w, r) = channel::<i32>();
    drop(r);
    assert_eq!(w.send(9).unwrap_err().0, 9);

    shutdown_runtime();
}

#[test]
fn refcounts_drain_to_zero() {
    let _guard = serial();
    init_runtime(1);
    let baseline = crate::live_channels();

    {
        let (w, r) = channel::<i32>();
        assert_eq!(crate::channel::live_refs(&w), (1, 1));
        let w2 = w.clone();
        let r2 = r.clone();
        assert_eq!(crate::channel::live_refs(&w), (2, 2));
        drop(w2);
        drop(r2);
        assert_eq!(crate::channel::live_refs(&w), (1, 1));
    }
    assert_eq!(crate::live_channels(), baseline);

    shutdown_runtime();
}

#[test]
fn descr_truncates_to_31_bytes() {
    let _guard = serial();
    init_runtime(1);

    let seen = Arc::new(Mutex::new(String::new()));
    let seen2 = seen.clone();
    spawn(move || {
        descr("a-rather-long-description-that-overflows-the-field");
        *seen2.lock().unwrap() = crate::current_descr().unwrap();
    });
    run();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 31);
    assert!("a-rather-long-description-that-overflows-the-field".starts_with(&*seen));

    shutdown_runtime();
}

#[test]
fn alt_completes_one_of_two_ready_arms() {
    let _guard = serial();
    init_runtime(1);

    let (wa, ra) = channel::<i32>();
    let (wb, rb) = channel::<i32>();
    spawn(move || {
        // One of the two writers stays parked and fails when the test
        // drops its reader.
        let _ = wa.send(10);
    });
    spawn(move || {
        let _ = wb.send(20);
    });
    run();

    let mut a = None;
    let mut b = None;
    let sig = alt(&[ra.recv_op(&mut a), rb.recv_op(&mut b)]);
    match sig {
        Signal::Ready(0) => assert_eq!(a.take(), Some(10)),
        Signal::Ready(1) => assert_eq!(b.take(), Some(20)),
        other => panic!("unexpected signal {other:?}"),
    }

    // Exactly one arm fired; the other writer is still parked.
    assert_eq!(a.is_some() as usize + b.is_some() as usize, 0);
    drop(ra);
    drop(rb);
    run();

    shutdown_runtime();
}
