use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{Dfs, EdgeRef, IntoEdgeReferences};
use serde::{Deserialize, Serialize};

use super::{Collection, Entry, Store};
use crate::error::StoreError;
use crate::key::TaskId;

/// Flat form of a [`MemoryStore`], what gets written to disk.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    entries: Vec<Entry>,
    /// Producer, consumer.
    edges: Vec<(TaskId, TaskId)>,
}

/// Store living entirely in memory.
///
/// Edges point from producer to consumer, so the recursive consumers of an
/// entry are exactly the nodes reachable from it.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<TaskId, Entry>,
    graph: StableDiGraph<TaskId, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn node(&mut self, id: &TaskId) -> NodeIndex {
        *self
            .nodes
            .entry(id.clone())
            .or_insert_with(|| self.graph.add_node(id.clone()))
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<TaskId> {
        let Some(&node) = self.nodes.get(id) else {
            return Vec::new();
        };

        let mut ids: Vec<_> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let edges = self
            .graph
            .edge_references()
            .map(|e| (self.graph[e.source()].clone(), self.graph[e.target()].clone()))
            .collect();

        Snapshot {
            entries: self.entries.values().cloned().collect(),
            edges,
        }
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let mut store = Self::new();

        for entry in snapshot.entries {
            let id = entry.id();
            store.node(&id);
            store.entries.insert(id, entry);
        }

        for (producer, consumer) in snapshot.edges {
            let (Some(&p), Some(&c)) = (store.nodes.get(&producer), store.nodes.get(&consumer))
            else {
                return Err(StoreError::MissingProducer(consumer, producer));
            };
            store.graph.update_edge(p, c, ());
        }

        Ok(store)
    }
}

impl Store for MemoryStore {
    fn entry(&self, id: &TaskId) -> Result<Option<Entry>, StoreError> {
        Ok(self.entries.get(id).cloned())
    }

    fn contains(&self, id: &TaskId) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(id))
    }

    fn insert(&mut self, entry: Entry, deps: &[TaskId]) -> Result<(), StoreError> {
        let id = entry.id();

        if let Some(missing) = deps.iter().find(|dep| !self.entries.contains_key(*dep)) {
            return Err(StoreError::MissingProducer(id, missing.clone()));
        }

        let node = self.node(&id);

        let stale: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in stale {
            self.graph.remove_edge(edge);
        }

        for dep in deps {
            let producer = self.node(dep);
            self.graph.update_edge(producer, node, ());
        }

        self.entries.insert(id, entry);
        Ok(())
    }

    fn remove(&mut self, ids: &BTreeSet<TaskId>) -> Result<(), StoreError> {
        for id in ids {
            if let Some(node) = self.nodes.remove(id) {
                self.graph.remove_node(node);
            }
            self.entries.remove(id);
        }
        Ok(())
    }

    fn dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.neighbors(id, Direction::Incoming))
    }

    fn consumers(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.neighbors(id, Direction::Outgoing))
    }

    fn recursive_consumers(&self, id: &TaskId) -> Result<BTreeSet<TaskId>, StoreError> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.nodes.get(id) else {
            return Ok(found);
        };

        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            found.insert(self.graph[node].clone());
        }

        Ok(found)
    }

    fn entries(&self, builder: &str) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .entries
            .values()
            .filter(|entry| &*entry.builder == builder)
            .cloned()
            .collect())
    }

    fn collections(&self) -> Result<Vec<Collection>, StoreError> {
        let mut counts = BTreeMap::<Arc<str>, usize>::new();
        for id in self.entries.keys() {
            *counts.entry(id.builder.clone()).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|(builder, entries)| Collection { builder, entries })
            .collect())
    }

    fn rekey(&mut self, builder: &str, moves: Vec<(TaskId, Entry)>) -> Result<(), StoreError> {
        let old: BTreeSet<_> = moves.iter().map(|(id, _)| id.clone()).collect();

        for id in &old {
            if &*id.builder != builder || !self.entries.contains_key(id) {
                return Err(StoreError::Missing(id.clone()));
            }
        }

        let mut targets = BTreeSet::new();
        for (_, entry) in &moves {
            let id = entry.id();
            let taken = self.entries.contains_key(&id) && !old.contains(&id);
            if &*id.builder != builder || taken || !targets.insert(id.clone()) {
                return Err(StoreError::Conflict(id));
            }
        }

        // detach everything first, new keys may reuse old ones
        let detached: Vec<_> = moves
            .into_iter()
            .map(|(id, entry)| {
                self.entries.remove(&id);
                (self.nodes.remove(&id), entry)
            })
            .collect();

        for (node, entry) in detached {
            let id = entry.id();
            if let Some(node) = node {
                self.graph[node] = id.clone();
                self.nodes.insert(id.clone(), node);
            }
            self.entries.insert(id, entry);
        }

        Ok(())
    }
}
