//! End-to-end rendezvous behavior on the single-processor schedule.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use microcsp as csp;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn single_rendezvous() {
    let _guard = serial();
    csp::init_runtime(1);
    let channels_before = csp::live_channels();

    {
        let (w, r) = csp::channel::<i32>();
        let result = Arc::new(AtomicUsize::new(0));
        let result2 = result.clone();

        csp::spawn(move || {
            w.send(42).unwrap();
        });
        csp::spawn(move || {
            result2.store(r.recv().unwrap() as usize, Ordering::SeqCst);
        });
        csp::run();

        assert_eq!(result.load(Ordering::SeqCst), 42);
    }
    csp::run();
    assert_eq!(csp::live_channels(), channels_before);

    csp::shutdown_runtime();
}

#[test]
fn writer_completes_only_after_delivery() {
    let _guard = serial();
    csp::init_runtime(1);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (w, r) = csp::channel::<i32>();

    let order_w = order.clone();
    csp::spawn(move || {
        w.send(1).unwrap();
        order_w.lock().unwrap().push("sent");
    });
    let order_r = order.clone();
    csp::spawn(move || {
        let v = r.recv().unwrap();
        order_r.lock().unwrap().push("received");
        assert_eq!(v, 1);
    });
    csp::run();

    // The receive happened before the sender's post-send line ran.
    assert_eq!(*order.lock().unwrap(), vec!["received", "sent"]);

    csp::shutdown_runtime();
}

#[test]
fn spawn_then_join_returns_after_exit() {
    let _guard = serial();
    csp::init_runtime(1);

    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    let handle = csp::spawn(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });
    csp::join(handle);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    csp::shutdown_runtime();
}

#[test]
fn join_rethrows_panic_payload() {
    let _guard = serial();
    csp::init_runtime(1);

    let handle = csp::spawn(|| {
        panic!("boom");
    });
    let result = std::panic::catch_unwind(move || csp::join(handle));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

    csp::run();
    csp::shutdown_runtime();
}

#[test]
fn closing_all_writers_wakes_blocked_reader() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    let outcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();
    csp::spawn(move || {
        *outcome2.lock().unwrap() = Some(r.recv());
    });
    // Let the reader park on the channel first.
    csp::run();
    drop(w);
    csp::run();

    assert_eq!(*outcome.lock().unwrap(), Some(Err(csp::RecvError)));

    csp::shutdown_runtime();
}

#[test]
fn closing_all_readers_fails_pending_writer() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    let outcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();
    csp::spawn(move || {
        *outcome2.lock().unwrap() = Some(w.send(5).is_err());
    });
    csp::run();
    drop(r);
    csp::run();

    assert_eq!(*outcome.lock().unwrap(), Some(true));

    csp::shutdown_runtime();
}

#[test]
fn reader_iteration_stops_at_closure() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    csp::spawn(move || {
        for i in 0..5 {
            w.send(i).unwrap();
        }
    });
    let collected: Vec<i32> = r.iter().collect();
    assert_eq!(collected, vec![0, 1, 2, 3, 4]);

    csp::run();
    csp::shutdown_runtime();
}

#[test]
fn cloned_endpoints_share_the_channel() {
    let _guard = serial();
    csp::init_runtime(1);

    let (w, r) = csp::channel::<i32>();
    let w2 = w.clone();
    drop(w);

    csp::spawn(move || {
        w2.send(7).unwrap();
    });
    assert_eq!(r.recv(), Ok(7));

    csp::run();
    csp::shutdown_runtime();
}

#[test]
fn dead_endpoint_constructors() {
    let _guard = serial();
    csp::init_runtime(1);

    let r = csp::Reader::<i32>::dead();
    assert_eq!(r.recv(), Err(csp::RecvError));

    let w = csp::Writer::<i32>::dead();
    assert!(w.send(1).is_err());

    csp::shutdown_runtime();
}
