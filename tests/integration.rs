//! End-to-end tests for dispatching work to forked workers.
//!
//! Every test forks real processes and creates real SysV segments, so they
//! run serially to keep the test process quiet while forking.

use serial_test::serial;
use shmfork::segment::Segment;
use shmfork::{
    BincodeCodec, Executor, ExecutorConfig, FailureKind, FutureHandle, JsonCodec, KeySource,
    ShmforkError,
};
use std::cell::Cell;
use std::collections::HashSet;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

fn executor<T: serde::Serialize + serde::de::DeserializeOwned>() -> Executor<T> {
    Executor::new(ExecutorConfig::default()).unwrap()
}

/// Poll until the worker is done, failing after a generous deadline.
fn wait_until_done<T, C>(exec: &mut Executor<T, C>, handle: &FutureHandle) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !exec.is_done(handle) {
        assert!(Instant::now() < deadline, "worker {} never finished", handle);
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Whether a SysV segment with this id still exists.
fn segment_exists(shm_id: i32) -> bool {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut ds) == 0 }
}

/// Key source that always returns the same key and counts requests.
struct CollidingKeys {
    key: libc::key_t,
    calls: Rc<Cell<usize>>,
}

impl KeySource for CollidingKeys {
    fn next_key(&mut self) -> Result<libc::key_t, nix::errno::Errno> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.key)
    }
}

#[test]
#[serial]
fn scenario_a_returns_value() {
    let mut exec = executor::<i64>();
    let handle = exec.dispatch(|| Ok::<_, Infallible>(42)).unwrap();
    assert_eq!(exec.wait_for(handle).unwrap(), 42);
}

#[test]
#[serial]
fn scenario_b_propagates_failure() {
    #[derive(Debug)]
    struct Boom;
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    let mut exec = executor::<i64>();
    let handle = exec.dispatch(|| Err::<i64, _>(Boom)).unwrap();

    match exec.wait_for(handle) {
        Err(ShmforkError::Worker(failure)) => {
            assert_eq!(failure.message, "boom");
            assert_eq!(failure.kind, FailureKind::Error);
            assert!(failure.category.ends_with("Boom"));
        }
        other => panic!("Expected worker failure, got {:?}", other),
    }
}

#[test]
#[serial]
fn panics_are_captured() {
    let mut exec = executor::<i64>();
    let handle = exec
        .dispatch(|| -> Result<i64, Infallible> { panic!("boom") })
        .unwrap();
    let err = exec.wait_for(handle).unwrap_err();
    let failure = err.worker_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Panic);
    assert_eq!(failure.message, "boom");
}

#[test]
#[serial]
fn scenario_c_wait_drains_registry() {
    let mut exec = executor::<u32>();
    let mut ids = HashSet::new();
    for i in 0..5u32 {
        let handle = exec.dispatch(move || Ok::<_, Infallible>(i * i)).unwrap();
        ids.insert(handle.id());
    }
    assert_eq!(exec.total(), 5);

    let results = exec.wait().unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(results.keys().copied().collect::<HashSet<_>>(), ids);
    let mut values: Vec<u32> = results.into_values().collect();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 4, 9, 16]);
    assert_eq!(exec.total(), 0);
}

#[test]
#[serial]
fn scenario_d_exhausts_after_ten_collisions() {
    let key_file = NamedTempFile::new().unwrap();
    let path = CString::new(key_file.path().as_os_str().as_bytes()).unwrap();
    let key = unsafe { libc::ftok(path.as_ptr(), 1) };
    assert_ne!(key, -1);

    let _occupied = Segment::create(key, 64, 0o600).unwrap();

    let calls = Rc::new(Cell::new(0));
    let keys = CollidingKeys {
        key,
        calls: calls.clone(),
    };
    let mut exec: Executor<i64> =
        Executor::with_key_source(ExecutorConfig::default(), Box::new(keys)).unwrap();

    let err = exec.dispatch(|| Ok::<_, Infallible>(1)).unwrap_err();
    assert!(
        matches!(err, ShmforkError::ResourceExhausted { attempts: 10, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(calls.get(), 10);
    assert_eq!(exec.total(), 0);
}

#[test]
#[serial]
fn scenario_e_is_done_is_non_blocking() {
    let mut exec = executor::<i64>();
    let handle = exec
        .dispatch(|| {
            std::thread::sleep(Duration::from_millis(500));
            Ok::<_, Infallible>(7)
        })
        .unwrap();

    let start = Instant::now();
    assert!(!exec.is_done(&handle));
    assert!(start.elapsed() < Duration::from_millis(250));

    wait_until_done(&mut exec, &handle);
    assert!(exec.is_done(&handle));
    assert_eq!(exec.wait_for(handle).unwrap(), 7);
}

#[test]
#[serial]
fn registry_counts_stay_consistent() {
    let mut exec = executor::<i64>();
    let quick: Vec<FutureHandle> = (0..3)
        .map(|i| exec.dispatch(move || Ok::<_, Infallible>(i)).unwrap())
        .collect();
    let slow = exec
        .dispatch(|| {
            std::thread::sleep(Duration::from_secs(2));
            Ok::<_, Infallible>(-1)
        })
        .unwrap();

    for handle in &quick {
        wait_until_done(&mut exec, handle);
    }
    let done_uncollected = quick.iter().filter(|h| exec.is_done(h)).count();
    assert_eq!(done_uncollected, 3);
    assert_eq!(exec.total(), exec.running() + done_uncollected);
    assert_eq!(exec.running(), 1);

    assert!(!exec.is_done(&slow));
    let results = exec.wait().unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(exec.total(), 0);
    assert_eq!(exec.running(), 0);
}

#[test]
#[serial]
fn wait_stops_at_first_failure() {
    let mut exec = executor::<i64>();
    exec.dispatch(|| Err::<i64, _>("first")).unwrap();
    exec.dispatch(|| Err::<i64, _>("second")).unwrap();

    assert!(exec.wait().is_err());
    assert_eq!(exec.total(), 1);
    assert!(exec.wait().is_err());
    assert_eq!(exec.total(), 0);
    assert!(exec.wait().unwrap().is_empty());
}

#[test]
#[serial]
fn wait_settled_keeps_every_result() {
    let mut exec = executor::<i64>();
    let ok = exec.dispatch(|| Ok::<_, String>(1)).unwrap().id();
    let bad = exec.dispatch(|| Err::<i64, _>("nope".to_string())).unwrap().id();

    let results = exec.wait_settled();
    assert_eq!(results.len(), 2);
    assert_eq!(*results[&ok].as_ref().unwrap(), 1);
    assert_eq!(
        results[&bad].as_ref().unwrap_err().worker_failure().unwrap().message,
        "nope"
    );
    assert_eq!(exec.total(), 0);
}

#[test]
#[serial]
fn collection_destroys_segment() {
    let mut exec = executor::<String>();
    let handle = exec
        .dispatch(|| Ok::<_, Infallible>("done".to_string()))
        .unwrap();
    let shm_id = handle.segment().shm_id;
    assert!(segment_exists(shm_id));

    assert_eq!(exec.wait_for(handle).unwrap(), "done");
    assert!(!segment_exists(shm_id));
}

#[test]
#[serial]
fn dropping_executor_releases_everything() {
    let mut exec = executor::<i64>();
    let handle = exec
        .dispatch(|| {
            std::thread::sleep(Duration::from_secs(30));
            Ok::<_, Infallible>(0)
        })
        .unwrap();
    let shm_id = handle.segment().shm_id;
    let pid = handle.pid();

    drop(exec);

    assert!(!segment_exists(shm_id));
    // The worker has been reaped, so the pid is no longer our child.
    assert_eq!(
        nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)),
        Err(nix::errno::Errno::ECHILD)
    );
}

#[test]
#[serial]
fn oversized_result_reports_overflow() {
    let mut exec: Executor<String> = Executor::new(ExecutorConfig::compact()).unwrap();
    let handle = exec
        .dispatch(|| Ok::<_, Infallible>("x".repeat(4096)))
        .unwrap();
    let err = exec.wait_for(handle).unwrap_err();
    assert_eq!(err.worker_failure().unwrap().kind, FailureKind::Overflow);
}

#[test]
#[serial]
fn bincode_codec_roundtrip() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Stats {
        count: u32,
        mean: f64,
        label: String,
    }

    let mut exec: Executor<Stats, BincodeCodec> = Executor::new(ExecutorConfig::default()).unwrap();
    let handle = exec
        .dispatch_with(
            |values: Vec<u32>| {
                let count = values.len() as u32;
                let mean = values.iter().sum::<u32>() as f64 / count as f64;
                Ok::<_, Infallible>(Stats {
                    count,
                    mean,
                    label: "sample".into(),
                })
            },
            vec![2, 4, 6],
        )
        .unwrap();

    assert_eq!(
        exec.wait_for(handle).unwrap(),
        Stats {
            count: 3,
            mean: 4.0,
            label: "sample".into()
        }
    );
}

#[test]
#[serial]
fn non_finite_floats_come_back_exactly() {
    let mut exec = executor::<f64>();
    let inf = exec.dispatch(|| Ok::<_, Infallible>(f64::INFINITY)).unwrap();
    let neg = exec.dispatch(|| Ok::<_, Infallible>(f64::NEG_INFINITY)).unwrap();
    let nan = exec.dispatch(|| Ok::<_, Infallible>(f64::NAN)).unwrap();

    assert_eq!(exec.wait_for(inf).unwrap(), f64::INFINITY);
    assert_eq!(exec.wait_for(neg).unwrap(), f64::NEG_INFINITY);
    assert!(exec.wait_for(nan).unwrap().is_nan());
}

#[test]
#[serial]
fn nested_options_keep_their_shape() {
    let mut exec = executor::<Option<Option<u8>>>();
    let some_none = exec.dispatch(|| Ok::<_, Infallible>(Some(None))).unwrap();
    let none = exec.dispatch(|| Ok::<_, Infallible>(None)).unwrap();

    assert_eq!(exec.wait_for(some_none).unwrap(), Some(None));
    assert_eq!(exec.wait_for(none).unwrap(), None);
}

#[test]
#[serial]
fn heterogeneous_results_via_json_values() {
    let mut exec: Executor<serde_json::Value, JsonCodec> =
        Executor::new(ExecutorConfig::default()).unwrap();
    let a = exec
        .dispatch(|| Ok::<_, Infallible>(serde_json::json!({"answer": 42})))
        .unwrap();
    let b = exec
        .dispatch(|| Ok::<_, Infallible>(serde_json::json!(["a", "b"])))
        .unwrap();

    assert_eq!(exec.wait_for(a).unwrap()["answer"], 42);
    assert_eq!(exec.wait_for(b).unwrap()[1], "b");
}

#[test]
#[serial]
fn workers_run_in_parallel() {
    let mut exec = executor::<u32>();
    let start = Instant::now();
    for i in 0..4u32 {
        exec.dispatch(move || {
            std::thread::sleep(Duration::from_millis(400));
            Ok::<_, Infallible>(i)
        })
        .unwrap();
    }
    assert_eq!(exec.wait().unwrap().len(), 4);
    assert!(start.elapsed() < Duration::from_millis(1500));
}
