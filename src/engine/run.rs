use std::collections::HashMap;
use std::sync::LazyLock;

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::{Level, debug, info};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::context;
use super::plan::Plan;
use super::report::Batch;
use crate::error::TsumikiError;
use crate::executor::Executor;
use crate::store::{Entry, EntryState, Store};

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
});

/// Run every planned task, each one as soon as its dependencies are stored.
///
/// 1. Tasks without pending dependencies are submitted to the executor.
/// 2. The runtime thread waits for completions.
/// 3. A finished task is stored together with its dependency edges, then the
///    dependency counts of its consumers are decremented.
/// 4. A consumer whose count drops to zero is submitted right away.
///
/// After the first error nothing new is submitted. Jobs already in flight are
/// still collected, and their successful results are kept. The store is held
/// for the whole run and flushed once at the end.
pub(crate) fn execute(
    store: &mut dyn Store,
    executor: &mut Executor,
    plan: Plan,
    batch: &mut Batch,
) -> Result<(), TsumikiError> {
    let total = plan.len() as u64;
    if total == 0 {
        return Ok(());
    }

    store.hold();

    let mut dependency_counts: HashMap<NodeIndex, usize> = plan
        .graph
        .node_indices()
        .map(|i| {
            let count = plan.graph.neighbors_directed(i, Direction::Incoming).count();
            (i, count)
        })
        .collect();

    let span = tracing::span!(Level::INFO, "computing");
    span.pb_set_length(total);
    span.pb_set_style(&PROGRESS_STYLE);
    span.pb_set_message("Computing tasks...");
    let _enter = span.enter();

    info!(tasks = total, "computing batch");

    let mut error = None;

    let mut ready: Vec<NodeIndex> = dependency_counts
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(&i, _)| i)
        .collect();
    ready.sort();

    for index in ready {
        if let Err(e) = dispatch(store, executor, &plan, index) {
            error.get_or_insert(e);
            break;
        }
    }

    loop {
        let done = match executor.next() {
            Ok(Some(done)) => done,
            Ok(None) => break,
            Err(e) => {
                error.get_or_insert(e);
                continue;
            }
        };

        batch.record(done.task.clone(), done.start, done.duration);

        let value = match done.result {
            Ok(value) => value,
            Err(e) => {
                error.get_or_insert(e);
                continue;
            }
        };

        let Some(&index) = plan.nodes.get(&done.task) else {
            continue;
        };
        let pending = &plan.pending[&index];

        let entry = Entry {
            builder: pending.task.id().builder.clone(),
            key: pending.task.key().clone(),
            config: pending.task.config().clone(),
            value,
            comp_time: done.duration,
            state: EntryState::Finished,
        };

        if let Err(e) = store.insert(entry, &pending.deps) {
            error.get_or_insert(e.into());
            continue;
        }

        debug!(task = %done.task, elapsed = ?done.duration, "finished");
        span.pb_inc(1);

        if error.is_some() {
            continue;
        }

        for consumer in plan.graph.neighbors_directed(index, Direction::Outgoing) {
            let Some(count) = dependency_counts.get_mut(&consumer) else {
                continue;
            };

            *count -= 1;
            if *count == 0
                && let Err(e) = dispatch(store, executor, &plan, consumer)
            {
                error.get_or_insert(e);
                break;
            }
        }
    }

    let flushed = store.flush();
    match error.or_else(|| flushed.err().map(TsumikiError::from)) {
        Some(e) => Err(e),
        None => {
            info!(tasks = total, "batch complete");
            Ok(())
        }
    }
}

/// Resolve the dependencies of a ready task and hand its compute phase over.
fn dispatch(
    store: &dyn Store,
    executor: &mut Executor,
    plan: &Plan,
    index: NodeIndex,
) -> Result<(), TsumikiError> {
    let pending = &plan.pending[&index];
    let id = pending.task.id().clone();

    let resolved = pending
        .deps
        .iter()
        .map(|dep| store.entry(dep)?.ok_or_else(|| TsumikiError::NotFound(dep.clone())))
        .collect::<Result<Vec<_>, TsumikiError>>()?;

    let compute = pending.compute.clone();
    let config = pending.task.config().clone();
    let declared = pending.deps.clone();
    let task = id.clone();

    executor.submit(
        id,
        Box::new(move || context::run_compute(&compute, &task, &config, declared, resolved)),
    )
}
