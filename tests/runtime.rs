use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::json;
use tsumiki::{
    Builder, BuilderRef, ExecutorOptions, ExecutorStatus, Registry, ReportKind, Runtime, Store,
    TsumikiError,
};

fn counting(registry: &mut Registry, calls: &Arc<AtomicUsize>) -> BuilderRef {
    let calls = calls.clone();
    registry
        .register(Builder::new("square", move |config| {
            calls.fetch_add(1, Ordering::SeqCst);
            let n = config["n"].as_i64().unwrap_or(0);
            Ok(n * n)
        }))
        .unwrap()
}

#[test]
fn test_scope_stops_the_runtime() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let square = counting(&mut registry, &calls);
    let mut rt = Runtime::setup()
        .registry(registry)
        .executor(ExecutorOptions::default().workers(2))
        .finish();

    let task = square.task(json!({"n": 4})).unwrap();
    {
        let mut scope = rt.scope().unwrap();
        assert_eq!(scope.compute(&task).unwrap().value, json!(16));
        assert!(!scope.is_stopped());
    }

    assert!(rt.is_stopped());
    assert!(matches!(rt.scope(), Err(TsumikiError::Stopped)));
    assert!(matches!(rt.compute(&task), Err(TsumikiError::Stopped)));
    assert!(matches!(
        rt.configure_executor(ExecutorOptions::inline()),
        Err(TsumikiError::Stopped)
    ));

    // stored entries outlive the executor
    assert_eq!(rt.read_entry(&task).unwrap().value, json!(16));

    rt.stop();
    assert_eq!(rt.executor_summaries()[0].status, ExecutorStatus::Stopped);
}

#[test]
fn test_underscore_members_share_the_entry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let square = counting(&mut registry, &calls);
    let mut rt = Runtime::setup()
        .registry(registry)
        .executor(ExecutorOptions::inline())
        .finish();

    let first = rt
        .compute(&square.task(json!({"n": 3, "_label": "first"})).unwrap())
        .unwrap();
    let second = rt
        .compute(&square.task(json!({"_label": "second", "n": 3})).unwrap())
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.config["_label"], json!("first"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reports() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let square = counting(&mut registry, &calls);
    let mut rt = Runtime::setup()
        .registry(registry)
        .executor(ExecutorOptions::inline())
        .finish();
    let failing = rt
        .register_builder(Builder::new("failing", |_| -> anyhow::Result<i64> {
            anyhow::bail!("nope")
        }))
        .unwrap();

    let tasks: Vec<_> = (0..3).map(|n| square.task(json!({"n": n})).unwrap()).collect();
    rt.compute_many(&tasks).unwrap();
    rt.compute_many(&tasks).unwrap();
    assert!(rt.compute(&failing.task(1).unwrap()).is_err());

    let reports = rt.get_reports();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].tasks.len(), 3);
    assert_eq!(reports[0].cached, 0);
    assert!(reports[1].tasks.is_empty());
    assert_eq!(reports[1].cached, 3);
    assert!(reports[0].is_ok());
    assert!(!reports[2].is_ok());
    assert!(reports.iter().all(|r| r.kind == ReportKind::Compute));
    assert_eq!(reports[2].id, 2);
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("tsumiki.db")).unwrap();

    {
        let mut rt = Runtime::open(&path).unwrap();
        rt.configure_executor(ExecutorOptions::inline()).unwrap();
        let square = rt
            .register_builder(Builder::new("square", |_| Ok(0)))
            .unwrap();

        let task = square.task(json!({"n": 5})).unwrap();
        assert_eq!(rt.compute(&task).unwrap().value, json!(0));

        // the batch is on disk before the runtime goes away
        let snapshot = tsumiki::FileStore::open(&path).unwrap();
        assert!(snapshot.contains(task.id()).unwrap());
    }

    let mut rt = Runtime::open(&path).unwrap();
    let collections = rt.collection_summaries().unwrap();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].entries, 1);
    assert!(!collections[0].registered);

    let square = rt
        .register_builder(Builder::new("square", |_| Ok(1)))
        .unwrap();
    let entry = rt.compute(&square.task(json!({"n": 5})).unwrap()).unwrap();
    assert_eq!(entry.value, json!(0));
    assert_eq!(rt.get_reports()[0].cached, 1);
}

#[test]
fn test_corrupted_store_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("broken.db")).unwrap();
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    assert!(matches!(Runtime::open(&path), Err(TsumikiError::Store(_))));
}

#[test]
fn test_dead_worker_fails_the_batch() {
    let mut rt = Runtime::setup()
        .executor(
            ExecutorOptions::default()
                .workers(2)
                .heartbeat_interval(Duration::from_millis(50)),
        )
        .finish();

    let crashing = rt
        .register_builder(Builder::new("crashing", |config| -> anyhow::Result<i64> {
            match config.as_i64() {
                Some(0) => panic!("worker lost"),
                other => Ok(other.unwrap_or(0)),
            }
        }))
        .unwrap();

    let tasks = vec![crashing.task(1).unwrap(), crashing.task(0).unwrap()];
    let err = rt.compute_many(&tasks).unwrap_err();
    match err {
        TsumikiError::WorkerFailure { task, .. } => assert_eq!(task.to_string(), "crashing(0)"),
        other => panic!("expected a worker failure, got {other}"),
    }

    // the healthy task of the same batch was stored
    assert!(rt.try_read_entry(&tasks[0]).unwrap().is_some());

    let summary = rt.executor_summaries().pop().unwrap();
    assert_eq!(summary.status, ExecutorStatus::Lost);
    assert_eq!(summary.stats.failed, 1);
    assert_eq!(summary.stats.completed, 1);
}

#[test]
fn test_configure_executor() {
    let mut rt = Runtime::in_memory();
    let options: ExecutorOptions =
        serde_json::from_value(json!({"workers": 0, "heartbeat_ms": 200})).unwrap();
    rt.configure_executor(options.clone()).unwrap();

    assert_eq!(rt.executor_options(), &options);
    let summaries = rt.executor_summaries();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].status, ExecutorStatus::Stopped);
    assert_eq!(summaries[1].heartbeat_ms, 200);
    assert_eq!(summaries[1].workers, 0);
}
