use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::builder::{BuilderKind, Compute, Registry, TaskRef};
use crate::engine::context;
use crate::error::{RegistrationError, TsumikiError};
use crate::key::TaskId;
use crate::store::Store;

/// A task that still has to be computed.
pub(crate) struct Pending {
    pub task: TaskRef,
    pub compute: Compute,
    /// Dependencies in declaration order, as seen by the declare pass.
    pub deps: Vec<TaskId>,
}

/// Every task a batch has to compute, linked producer to consumer.
///
/// Dependencies that are already stored are not part of the graph.
pub(crate) struct Plan {
    pub graph: DiGraph<TaskId, ()>,
    pub nodes: HashMap<TaskId, NodeIndex>,
    pub pending: HashMap<NodeIndex, Pending>,
}

impl Plan {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Discover the dependency graph below `roots` by running declare passes.
///
/// The walk is iterative, each task is declared at most once and stored
/// entries end the walk.
pub(crate) fn plan(
    registry: &Registry,
    store: &dyn Store,
    roots: Vec<TaskRef>,
) -> Result<Plan, TsumikiError> {
    let mut seen = HashSet::new();
    let mut found = BTreeMap::new();
    let mut stack = roots;
    stack.reverse();

    while let Some(task) = stack.pop() {
        if !seen.insert(task.id().clone()) {
            continue;
        }

        if store.contains(task.id())? {
            debug!(task = %task.id(), "cached");
            continue;
        }

        let builder = registry
            .get(task.builder())
            .ok_or_else(|| RegistrationError::Unknown(task.builder().to_string()))?;

        let compute = match &builder.kind {
            BuilderKind::Fixed => return Err(TsumikiError::FixedBuilder(task.id().clone())),
            BuilderKind::Computed(compute) => compute.clone(),
        };

        let refs = context::run_declare(&compute, &task)?;
        let deps = refs.iter().map(|r| r.id().clone()).collect();

        // reversed so dependencies are declared in the order they were listed
        stack.extend(refs.into_iter().rev().filter(|r| !seen.contains(r.id())));

        found.insert(
            task.id().clone(),
            Pending {
                task,
                compute,
                deps,
            },
        );
    }

    let mut graph = DiGraph::new();
    let nodes: HashMap<TaskId, NodeIndex> = found
        .keys()
        .map(|id| (id.clone(), graph.add_node(id.clone())))
        .collect();

    for (id, pending) in &found {
        let consumer = nodes[id];
        for dep in &pending.deps {
            if let Some(&producer) = nodes.get(dep) {
                graph.update_edge(producer, consumer, ());
            }
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        return Err(TsumikiError::Cycle(graph[cycle.node_id()].clone()));
    }

    let pending = found
        .into_iter()
        .map(|(id, pending)| (nodes[&id], pending))
        .collect();

    Ok(Plan {
        graph,
        nodes,
        pending,
    })
}
