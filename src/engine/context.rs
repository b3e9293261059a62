use serde::de::DeserializeOwned;

use crate::builder::{Compute, TaskRef, Value};
use crate::error::{ProtocolError, TsumikiError, UserError};
use crate::key::{Config, TaskId};
use crate::store::Entry;

/// Handle to a dependency declared through [`TaskContext::depend`].
///
/// It is only an index into the dependency list of the running task, the
/// entry behind it can be read once the task is past its suspend point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dep {
    index: usize,
}

enum Mode {
    /// Engine side pass, ends at the suspend point.
    Declare { refs: Vec<TaskRef> },
    /// Worker side pass, runs to completion.
    Compute {
        declared: Vec<TaskId>,
        resolved: Vec<Entry>,
    },
}

/// The context handed to staged builders.
///
/// It enforces the declare/compute protocol: dependencies may only be declared
/// before the single call to [`suspend`](Self::suspend), and their entries may
/// only be read after it.
pub struct TaskContext {
    task: TaskId,
    mode: Mode,
    observed: Vec<TaskId>,
    suspends: usize,
    violation: Option<ProtocolError>,
}

impl TaskContext {
    fn declare(task: TaskId) -> Self {
        Self {
            task,
            mode: Mode::Declare { refs: Vec::new() },
            observed: Vec::new(),
            suspends: 0,
            violation: None,
        }
    }

    fn compute(task: TaskId, declared: Vec<TaskId>, resolved: Vec<Entry>) -> Self {
        Self {
            task,
            mode: Mode::Compute { declared, resolved },
            observed: Vec::new(),
            suspends: 0,
            violation: None,
        }
    }

    /// The task this context belongs to.
    pub fn task(&self) -> &TaskId {
        &self.task
    }

    /// Declare a dependency on `task`.
    pub fn depend(&mut self, task: &TaskRef) -> Result<Dep, ProtocolError> {
        if self.suspends > 0 {
            return Err(self.violate(ProtocolError::ComputePhaseDependency(task.id().clone())));
        }

        if let Mode::Declare { refs } = &mut self.mode {
            refs.push(task.clone());
        }

        self.observed.push(task.id().clone());
        Ok(Dep {
            index: self.observed.len() - 1,
        })
    }

    /// The single suspend point between the declare and the compute phase.
    ///
    /// During the declare pass this returns [`ProtocolError::Suspended`], which
    /// should be propagated with `?` so the pass ends here.
    pub fn suspend(&mut self) -> Result<(), ProtocolError> {
        self.suspends += 1;

        if self.suspends > 1 {
            return Err(self.violate(ProtocolError::DoubleSuspend));
        }

        match &self.mode {
            Mode::Declare { .. } => Err(ProtocolError::Suspended),
            Mode::Compute { declared, .. } => {
                if *declared != self.observed {
                    let error = ProtocolError::InconsistentDependencies {
                        declared: declared.clone(),
                        observed: self.observed.clone(),
                    };
                    return Err(self.violate(error));
                }
                Ok(())
            }
        }
    }

    /// Finished entry of a dependency.
    pub fn entry(&self, dep: &Dep) -> Result<&Entry, ProtocolError> {
        match &self.mode {
            Mode::Compute { resolved, .. } if self.suspends > 0 => resolved
                .get(dep.index)
                .ok_or(ProtocolError::DeclarePhaseRead),
            _ => Err(ProtocolError::DeclarePhaseRead),
        }
    }

    /// Value of a dependency deserialized into `T`.
    pub fn value<T>(&self, dep: &Dep) -> anyhow::Result<T>
    where
        T: DeserializeOwned,
    {
        let entry = self.entry(dep)?;
        Ok(serde_json::from_value(entry.value.clone())?)
    }

    fn violate(&mut self, error: ProtocolError) -> ProtocolError {
        self.violation.get_or_insert_with(|| error.clone());
        error
    }

    fn protocol(&self, source: ProtocolError) -> TsumikiError {
        TsumikiError::Protocol {
            task: self.task.clone(),
            source,
        }
    }
}

/// Run the declare pass of a staged builder and collect its dependencies.
pub(crate) fn run_declare(
    compute: &Compute,
    task: &TaskRef,
) -> Result<Vec<TaskRef>, TsumikiError> {
    let Compute::Staged(func) = compute else {
        return Ok(Vec::new());
    };

    let mut ctx = TaskContext::declare(task.id().clone());
    let result = func(&mut ctx, task.config());

    if let Some(violation) = ctx.violation.take() {
        return Err(ctx.protocol(violation));
    }

    match (ctx.suspends, result) {
        (0, Err(source)) => Err(task_error(task.id(), source)),
        (0, Ok(_)) => Err(ctx.protocol(ProtocolError::MissingSuspend)),
        _ => match ctx.mode {
            Mode::Declare { refs } => Ok(refs),
            Mode::Compute { .. } => Ok(Vec::new()),
        },
    }
}

/// Run the compute phase of a builder against finished dependency entries.
pub(crate) fn run_compute(
    compute: &Compute,
    task: &TaskId,
    config: &Config,
    declared: Vec<TaskId>,
    resolved: Vec<Entry>,
) -> Result<Value, TsumikiError> {
    let func = match compute {
        Compute::Plain(func) => {
            return func(config).map_err(|source| task_error(task, source));
        }
        Compute::Staged(func) => func,
    };

    let mut ctx = TaskContext::compute(task.clone(), declared, resolved);
    let result = func(&mut ctx, config);

    if let Some(violation) = ctx.violation.take() {
        return Err(ctx.protocol(violation));
    }

    match result {
        Err(source) => Err(task_error(task, source)),
        Ok(_) if ctx.suspends == 0 => Err(ctx.protocol(ProtocolError::MissingSuspend)),
        Ok(value) => Ok(value),
    }
}

/// Builder code may wrap a protocol error in its own context, unwrap it.
fn task_error(task: &TaskId, source: UserError) -> TsumikiError {
    match source.downcast_ref::<ProtocolError>() {
        Some(protocol) => TsumikiError::Protocol {
            task: task.clone(),
            source: protocol.clone(),
        },
        None => TsumikiError::Task {
            task: task.clone(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::builder::{Builder, BuilderKind};
    use crate::store::EntryState;

    fn compute_of(builder: Builder) -> Compute {
        match builder.kind {
            BuilderKind::Computed(compute) => compute,
            BuilderKind::Fixed => unreachable!(),
        }
    }

    fn task(builder: &str, config: Config) -> TaskRef {
        TaskRef::new(Arc::from(builder), config).unwrap()
    }

    fn finished(task: &TaskRef, value: Value) -> Entry {
        Entry {
            builder: task.builder().into(),
            key: task.key().clone(),
            config: task.config().clone(),
            value,
            comp_time: Duration::ZERO,
            state: EntryState::Finished,
        }
    }

    fn summing() -> Compute {
        compute_of(Builder::staged("sum", |ctx, config| {
            let n = config.as_i64().unwrap_or(0);
            let mut deps = Vec::new();
            for i in 0..n {
                deps.push(ctx.depend(&task("col", json!(i)))?);
            }
            ctx.suspend()?;
            let mut sum = 0;
            for dep in &deps {
                sum += ctx.value::<i64>(dep)?;
            }
            Ok(sum)
        }))
    }

    #[test]
    fn test_declare_collects_dependencies() {
        let refs = run_declare(&summing(), &task("sum", json!(3))).unwrap();
        let keys: Vec<_> = refs.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_compute_reads_resolved_entries() {
        let deps: Vec<_> = (0..3).map(|i| task("col", json!(i))).collect();
        let declared = deps.iter().map(|t| t.id().clone()).collect();
        let resolved = deps.iter().map(|t| finished(t, json!(5))).collect();

        let top = task("sum", json!(3));
        let value = run_compute(&summing(), top.id(), top.config(), declared, resolved).unwrap();
        assert_eq!(value, json!(15));
    }

    #[test]
    fn test_plain_builder_has_no_declare_pass() {
        let compute = compute_of(Builder::new("plain", |c| Ok(c.clone())));
        assert!(run_declare(&compute, &task("plain", json!(1))).unwrap().is_empty());
    }

    #[test]
    fn test_missing_suspend() {
        let compute = compute_of(Builder::staged("lazy", |_, _| Ok(1)));
        let err = run_declare(&compute, &task("lazy", json!(1))).unwrap_err();
        assert!(matches!(
            err,
            TsumikiError::Protocol {
                source: ProtocolError::MissingSuspend,
                ..
            }
        ));
    }

    #[test]
    fn test_read_in_declare_phase() {
        let compute = compute_of(Builder::staged("eager", |ctx, _| {
            let dep = ctx.depend(&task("col", json!(1)))?;
            let early = ctx.entry(&dep).map(|_| ()).unwrap_err();
            assert_eq!(early, ProtocolError::DeclarePhaseRead);
            ctx.suspend()?;
            Ok(1)
        }));

        assert_eq!(run_declare(&compute, &task("eager", json!(1))).unwrap().len(), 1);
    }

    #[test]
    fn test_violation_survives_swallowed_error() {
        let compute = compute_of(Builder::staged("sneaky", |ctx, _| {
            let _ = ctx.suspend();
            let _ = ctx.suspend();
            Ok(1)
        }));

        let top = task("sneaky", json!(1));
        let err = run_compute(&compute, top.id(), top.config(), vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_wrapped_protocol_error() {
        let compute = compute_of(Builder::staged("wrapped", |ctx, _| {
            ctx.suspend()?;
            let dep = Dep { index: 7 };
            let value = ctx
                .value::<i64>(&dep)
                .map_err(|e| e.context("reading dependency"))?;
            Ok(value)
        }));

        let top = task("wrapped", json!(1));
        let err = run_compute(&compute, top.id(), top.config(), vec![], vec![]).unwrap_err();
        assert!(matches!(
            err,
            TsumikiError::Protocol {
                source: ProtocolError::DeclarePhaseRead,
                ..
            }
        ));
    }
}
