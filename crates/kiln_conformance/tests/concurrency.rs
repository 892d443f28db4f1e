//! Integration tests for concurrent builds, lock draining and the module
//! unload wait.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use kiln_build::{BuildError, ErrorKind};
use kiln_config::KilnConfig;
use kiln_conformance::{vp, Fixture, Gate};
use kiln_lock::LockState;

const THREADS: usize = 8;

/// Polls `cond` until it holds, failing the test after ten seconds.
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn concurrent_requests_compile_once() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(dir.path(), [("~/default.aspx", "hello")]);
    let gate = Gate::new();
    fx.compiler.hold_at(Arc::clone(&gate));
    let barrier = Barrier::new(THREADS);

    let results: Vec<_> = thread::scope(|s| {
        let fx = &fx;
        let barrier = &barrier;
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    fx.build("~/default.aspx")
                })
            })
            .collect();

        wait_until("first compilation", || fx.compiler.entered() == 1);
        // let the other requests pile up behind the lock
        thread::sleep(Duration::from_millis(50));
        gate.open();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(fx.compiler.invocations(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
}

#[test]
fn concurrent_requests_for_different_pages_share_a_batch() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(
        dir.path(),
        [("~/a.aspx", "a"), ("~/b.aspx", "b"), ("~/c.aspx", "c")],
    );
    let barrier = Barrier::new(3);

    thread::scope(|s| {
        for page in ["~/a.aspx", "~/b.aspx", "~/c.aspx"] {
            let fx = &fx;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                fx.build(page).unwrap();
            });
        }
    });

    // whichever request wins compiles the directory; the rest hit the cache
    assert_eq!(fx.compiler.invocations(), 1);
    assert_eq!(fx.compiler.batches()[0].len(), 3);
}

#[test]
fn sibling_built_while_waiting_is_not_compiled_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KilnConfig::default_for("conformance");
    config.batch.max_units = 2;
    let fx = Fixture::with_config(
        dir.path(),
        [
            ("~/ctl/t.ascx", "control"),
            ("~/a.aspx", "template ctl/t.ascx"),
            ("~/b.aspx", "b"),
            ("~/c.aspx", "c"),
        ],
        config,
    );
    fx.build("~/ctl/t.ascx").unwrap();
    let gate = Gate::new();
    fx.compiler.hold_at(Arc::clone(&gate));

    let a = thread::scope(|s| {
        let fx = &fx;
        let first = s.spawn(move || fx.build("~/a.aspx"));
        wait_until("batch of a and b", || fx.compiler.entered() == 2);
        // c sees b as uncached and queues on the lock with it as a sibling
        let second = s.spawn(move || fx.build("~/c.aspx"));
        thread::sleep(Duration::from_millis(50));
        gate.open();
        second.join().unwrap().unwrap();
        first.join().unwrap().unwrap()
    });

    let batches = fx.compiler.batches();
    let b_count = batches
        .iter()
        .filter(|units| units.iter().any(|u| *u == vp("~/b.aspx")))
        .count();
    assert_eq!(b_count, 1, "batches: {batches:?}");
    assert_eq!(batches.last().unwrap(), &vec![vp("~/c.aspx")]);
    let b = fx.build("~/b.aspx").unwrap();
    assert!(Arc::ptr_eq(a.assembly().unwrap(), b.assembly().unwrap()));
    assert_eq!(fx.compiler.invocations(), 3);
}

#[test]
fn drain_lets_in_flight_build_finish_and_refuses_new_ones() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(
        dir.path(),
        [("~/one/a.aspx", "a"), ("~/two/b.aspx", "b")],
    );
    let gate = Gate::new();
    fx.compiler.hold_at(Arc::clone(&gate));

    thread::scope(|s| {
        let fx = &fx;
        let in_flight = s.spawn(move || fx.build("~/one/a.aspx"));
        wait_until("first compilation", || fx.compiler.entered() == 1);

        assert!(fx.orchestrator.lock().begin_drain());
        assert!(matches!(
            fx.orchestrator.lock().state(),
            LockState::Draining { .. }
        ));

        let refused = fx.build("~/two/b.aspx").unwrap_err();
        assert!(matches!(refused, BuildError::LockDrained { .. }));
        assert_eq!(refused.kind(), ErrorKind::Lifecycle);

        gate.open();
        in_flight.join().unwrap().unwrap();
    });

    assert!(fx.orchestrator.shutdown(Duration::from_secs(5)));
    assert_eq!(fx.orchestrator.lock().state(), LockState::Closed);
    // cached results are still served without the lock
    fx.build("~/one/a.aspx").unwrap();
    assert_eq!(fx.compiler.invocations(), 1);
}

#[test]
fn shutdown_with_nothing_in_flight_closes_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(dir.path(), [("~/default.aspx", "hello")]);

    assert!(fx.orchestrator.shutdown(Duration::from_millis(1)));
    assert!(matches!(
        fx.build("~/default.aspx"),
        Err(BuildError::LockDrained { .. })
    ));
}

#[test]
fn loaded_module_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KilnConfig::default_for("conformance");
    config.cache.unload_timeout_ms = 50;
    config.cache.unload_poll_ms = 5;
    let fx = Fixture::with_config(
        dir.path(),
        [("~/App_Code/util.cs", "util"), ("~/default.aspx", "hello")],
        config,
    );
    fx.modules.load("App_Code");

    let err = fx.build("~/default.aspx").unwrap_err();
    match &err {
        BuildError::ConcurrencyTimeout { assembly, waited } => {
            assert_eq!(assembly, "App_Code");
            assert!(*waited >= Duration::from_millis(50));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(fx.compiler.invocations(), 0);

    fx.modules.unload("App_Code");
    fx.build("~/default.aspx").unwrap();
}

#[test]
fn build_waits_for_module_release() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KilnConfig::default_for("conformance");
    config.cache.unload_timeout_ms = 10_000;
    config.cache.unload_poll_ms = 5;
    let fx = Fixture::with_config(dir.path(), [("~/App_Code/util.cs", "util")], config);
    fx.modules.load("App_Code");

    thread::scope(|s| {
        let fx = &fx;
        let build = s.spawn(move || fx.build("~/App_Code/"));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fx.compiler.entered(), 0);
        fx.modules.unload("App_Code");
        build.join().unwrap().unwrap();
    });
    assert_eq!(fx.compiler.invocations(), 1);
}
