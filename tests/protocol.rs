use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, anyhow};
use tsumiki::{Builder, BuilderRef, ExecutorOptions, ProtocolError, Runtime, TsumikiError};

fn runtime() -> (Runtime, BuilderRef) {
    let mut rt = Runtime::setup()
        .executor(ExecutorOptions::default().workers(2))
        .finish();
    let leaf = rt
        .register_builder(Builder::new("leaf", |config| Ok(config.clone())))
        .unwrap();
    (rt, leaf)
}

fn protocol_error(err: TsumikiError) -> ProtocolError {
    match err {
        TsumikiError::Protocol { source, .. } => source,
        other => panic!("expected a protocol error, got {other}"),
    }
}

#[test]
fn test_dependency_in_compute_phase() {
    let (mut rt, leaf) = runtime();
    let late = rt
        .register_builder(Builder::staged("late", move |ctx, _| {
            ctx.suspend()?;
            ctx.depend(&leaf.task(1)?)?;
            Ok(1)
        }))
        .unwrap();

    let err = rt.compute(&late.task(0).unwrap()).unwrap_err();
    assert!(err.to_string().contains("computation phase"));
    assert!(matches!(
        protocol_error(err),
        ProtocolError::ComputePhaseDependency(_)
    ));
}

#[test]
fn test_double_suspend() {
    let (mut rt, _) = runtime();
    let twice = rt
        .register_builder(Builder::staged("twice", |ctx, _| {
            ctx.suspend()?;
            ctx.suspend()?;
            Ok(1)
        }))
        .unwrap();

    let err = rt.compute(&twice.task(0).unwrap()).unwrap_err();
    assert!(err.to_string().contains("suspended (yielded) more than once"));
    assert_eq!(protocol_error(err), ProtocolError::DoubleSuspend);
}

#[test]
fn test_inconsistent_dependencies() {
    let (mut rt, leaf) = runtime();
    let calls = Arc::new(AtomicUsize::new(0));

    let fickle = rt
        .register_builder(Builder::staged("fickle", {
            let calls = calls.clone();
            move |ctx, _| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                ctx.depend(&leaf.task(n)?)?;
                ctx.suspend()?;
                Ok(n)
            }
        }))
        .unwrap();

    let err = rt.compute(&fickle.task(0).unwrap()).unwrap_err();
    assert!(err.to_string().contains("inconsistent dependencies"));
    assert!(matches!(
        protocol_error(err),
        ProtocolError::InconsistentDependencies { .. }
    ));
    assert_eq!(rt.try_read_entry(&fickle.task(0).unwrap()).unwrap(), None);
}

#[test]
fn test_missing_suspend() {
    let (mut rt, _) = runtime();
    let eager = rt
        .register_builder(Builder::staged("eager", |_, _| Ok(1)))
        .unwrap();

    let err = rt.compute(&eager.task(0).unwrap()).unwrap_err();
    assert_eq!(protocol_error(err), ProtocolError::MissingSuspend);
}

#[test]
fn test_wrapped_protocol_error_is_still_reported() {
    let (mut rt, leaf) = runtime();
    let wrapper = rt
        .register_builder(Builder::staged("wrapper", move |ctx, _| {
            ctx.suspend()?;
            ctx.depend(&leaf.task(1)?)
                .context("while looking up the leaf")?;
            Ok(1)
        }))
        .unwrap();

    let err = rt.compute(&wrapper.task(0).unwrap()).unwrap_err();
    assert!(matches!(
        protocol_error(err),
        ProtocolError::ComputePhaseDependency(_)
    ));
}

#[test]
fn test_user_error_is_verbatim() {
    let (mut rt, leaf) = runtime();
    let picky = rt
        .register_builder(Builder::staged("picky", move |ctx, config| {
            let n = config.as_i64().unwrap_or(0);
            let dep = ctx.depend(&leaf.task(n)?)?;
            ctx.suspend()?;
            let value: i64 = ctx.value(&dep)?;
            if value % 2 == 1 {
                return Err(anyhow!("odd input: {value}"));
            }
            Ok(value)
        }))
        .unwrap();

    assert_eq!(rt.compute(&picky.task(2).unwrap()).unwrap().value_as::<i64>().unwrap(), 2);

    let err = rt.compute(&picky.task(3).unwrap()).unwrap_err();
    match &err {
        TsumikiError::Task { task, source } => {
            assert_eq!(task.to_string(), "picky(3)");
            assert_eq!(source.to_string(), "odd input: 3");
        }
        other => panic!("expected a task error, got {other}"),
    }

    // the dependency finished before the failure and stays stored
    assert!(rt.try_read_entry(&leaf_task(&rt, 3)).unwrap().is_some());
    let report = rt.get_reports().last().unwrap();
    assert!(report.error.as_deref().unwrap().contains("odd input: 3"));
}

#[test]
fn test_declare_phase_user_error() {
    let (mut rt, _) = runtime();
    let broken = rt
        .register_builder(Builder::staged("broken", |ctx, config| {
            let n = config.as_i64().context("config must be an integer")?;
            ctx.suspend()?;
            Ok(n)
        }))
        .unwrap();

    let err = rt.compute(&broken.task("x").unwrap()).unwrap_err();
    assert!(matches!(err, TsumikiError::Task { .. }));
    assert!(err.to_string().contains("config must be an integer"));
}

#[test]
fn test_cycle_is_detected() {
    let mut rt = Runtime::setup().executor(ExecutorOptions::inline()).finish();
    let calls = Arc::new(AtomicUsize::new(0));
    let handle = Arc::new(OnceLock::<BuilderRef>::new());

    let selfish = rt
        .register_builder(Builder::staged("selfish", {
            let calls = calls.clone();
            let handle = handle.clone();
            move |ctx, config| {
                let me = handle.get().context("not registered yet")?;
                let n = config.as_i64().unwrap_or(0);
                ctx.depend(&me.task((n + 1) % 2)?)?;
                ctx.suspend()?;
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            }
        }))
        .unwrap();
    handle.set(selfish.clone()).unwrap();

    let err = rt.compute(&selfish.task(0).unwrap()).unwrap_err();
    assert!(matches!(err, TsumikiError::Cycle(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

fn leaf_task(rt: &Runtime, n: i64) -> tsumiki::TaskRef {
    rt.builder("leaf").unwrap().task(n).unwrap()
}
