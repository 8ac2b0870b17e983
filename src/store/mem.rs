//! Concurrent in-memory store backed by DashMap version maps.
//!
//! Each record keeps its full valid-time history as a `BTreeMap` of
//! versions (a `None` entry is a tombstone), so point-in-time reads are a
//! range scan. A petgraph mirror with a DashMap side-index serves incoming
//! neighbour candidates; candidates are filtered against the live version at
//! read time, so the mirror only ever grows and never needs temporal edges.
//! All data is lost on process exit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::node::Node;
use crate::origin::Origin;
use crate::profile::{ScanLevel, ScanProfile};
use crate::reference::Reference;

use super::{GraphStore, Mutation, Query, RelationPath, StoreResult, Timestamp};

fn version_at<V: Clone>(history: &BTreeMap<Timestamp, Option<V>>, at: Timestamp) -> Option<V> {
    history.range(..=at).next_back().and_then(|(_, v)| v.clone())
}

/// In-memory bitemporal store.
pub struct MemStore {
    nodes: DashMap<Reference, BTreeMap<Timestamp, Option<Node>>>,
    profiles: DashMap<Reference, BTreeMap<Timestamp, Option<ScanProfile>>>,
    origins: DashMap<String, BTreeMap<Timestamp, Option<Origin>>>,
    /// Kind → every reference ever seen with that kind (candidates only).
    kind_index: DashMap<String, HashSet<Reference>>,
    /// Candidate edge mirror: edges carry the relation attribute name.
    graph: RwLock<DiGraph<Reference, String>>,
    /// Reference → NodeIndex for O(1) mirror lookups.
    node_index: DashMap<Reference, NodeIndex>,
    /// Committed batches (transaction-time bookkeeping).
    commits: AtomicUsize,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            profiles: DashMap::new(),
            origins: DashMap::new(),
            kind_index: DashMap::new(),
            graph: RwLock::new(DiGraph::new()),
            node_index: DashMap::new(),
            commits: AtomicUsize::new(0),
        }
    }

    /// Number of committed batches.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    fn ensure_mirror_node(&self, reference: &Reference) -> NodeIndex {
        if let Some(idx) = self.node_index.get(reference) {
            return *idx.value();
        }
        let mut graph = self.graph.write().expect("graph lock poisoned");
        // Double-check after acquiring write lock
        if let Some(idx) = self.node_index.get(reference) {
            return *idx.value();
        }
        let idx = graph.add_node(reference.clone());
        self.node_index.insert(reference.clone(), idx);
        idx
    }

    fn mirror_edges(&self, reference: &Reference, node: &Node) {
        let from = self.ensure_mirror_node(reference);
        for (attr, target) in node.relations() {
            let to = self.ensure_mirror_node(target);
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let exists = graph
                .edges_connecting(from, to)
                .any(|edge| edge.weight() == attr);
            if !exists {
                graph.add_edge(from, to, attr.to_string());
            }
        }
    }

    fn apply(&self, mutation: Mutation, at: Timestamp) {
        match mutation {
            Mutation::PutNode { reference, node } => {
                self.kind_index
                    .entry(node.kind().to_string())
                    .or_default()
                    .insert(reference.clone());
                self.mirror_edges(&reference, &node);
                self.nodes
                    .entry(reference)
                    .or_default()
                    .insert(at, Some(node));
            }
            Mutation::DeleteNode(reference) => {
                self.nodes.entry(reference).or_default().insert(at, None);
            }
            Mutation::PutProfile { reference, profile } => {
                self.profiles
                    .entry(reference)
                    .or_default()
                    .insert(at, Some(profile));
            }
            Mutation::DeleteProfile(reference) => {
                self.profiles.entry(reference).or_default().insert(at, None);
            }
            Mutation::PutOrigin(origin) => {
                self.origins
                    .entry(origin.id())
                    .or_default()
                    .insert(at, Some(origin));
            }
            Mutation::DeleteOrigin(id) => {
                self.origins.entry(id).or_default().insert(at, None);
            }
        }
    }

    fn live_origins(&self, at: Timestamp) -> Vec<Origin> {
        self.origins
            .iter()
            .filter_map(|entry| version_at(entry.value(), at))
            .collect()
    }
}

impl GraphStore for MemStore {
    fn get(&self, reference: &Reference, at: Timestamp) -> StoreResult<Option<Node>> {
        Ok(self
            .nodes
            .get(reference)
            .and_then(|history| version_at(history.value(), at)))
    }

    fn neighbours(
        &self,
        reference: &Reference,
        paths: &[RelationPath],
        at: Timestamp,
    ) -> StoreResult<HashMap<RelationPath, Vec<(Reference, Node)>>> {
        let mut out: HashMap<RelationPath, Vec<(Reference, Node)>> = HashMap::new();
        for path in paths {
            let mut hits = Vec::new();
            match path {
                RelationPath::Outgoing { attr } => {
                    if let Some(node) = self.get(reference, at)? {
                        if let Some(target) =
                            node.attr(attr).and_then(|value| value.as_reference())
                        {
                            if let Some(target_node) = self.get(target, at)? {
                                hits.push((target.clone(), target_node));
                            }
                        }
                    }
                }
                RelationPath::Incoming { kind, attr } => {
                    let candidates: Vec<Reference> = {
                        let graph = self.graph.read().expect("graph lock poisoned");
                        match self.node_index.get(reference) {
                            Some(idx) => graph
                                .edges_directed(*idx.value(), Direction::Incoming)
                                .filter(|edge| edge.weight() == attr)
                                .filter_map(|edge| graph.node_weight(edge.source()).cloned())
                                .collect(),
                            None => Vec::new(),
                        }
                    };
                    for candidate in candidates {
                        if candidate.kind() != kind {
                            continue;
                        }
                        // Candidate edges are never removed from the mirror;
                        // confirm against the version live at `at`.
                        if let Some(node) = self.get(&candidate, at)? {
                            let still_points = node
                                .attr(attr)
                                .and_then(|value| value.as_reference())
                                .is_some_and(|target| target == reference);
                            if still_points {
                                hits.push((candidate, node));
                            }
                        }
                    }
                    hits.sort_by(|a, b| a.0.cmp(&b.0));
                }
            }
            out.insert(path.clone(), hits);
        }
        Ok(out)
    }

    fn query(&self, query: &Query, at: Timestamp) -> StoreResult<Vec<(Reference, Node)>> {
        let candidates: Vec<Reference> = self
            .kind_index
            .get(&query.kind)
            .map(|set| set.value().iter().cloned().collect())
            .unwrap_or_default();

        let mut rows = Vec::new();
        for reference in candidates {
            let Some(node) = self.get(&reference, at)? else {
                continue;
            };
            let matches = query.anchors.iter().all(|(attr, anchor)| {
                node.attr(attr)
                    .and_then(|value| value.as_reference())
                    .is_some_and(|target| target == anchor)
            });
            if matches {
                rows.push((reference, node));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    fn profile(&self, reference: &Reference, at: Timestamp) -> StoreResult<Option<ScanProfile>> {
        Ok(self
            .profiles
            .get(reference)
            .and_then(|history| version_at(history.value(), at)))
    }

    fn declared_profiles(&self, at: Timestamp) -> StoreResult<Vec<(Reference, ScanLevel)>> {
        let mut declared: Vec<(Reference, ScanLevel)> = self
            .profiles
            .iter()
            .filter_map(|entry| {
                version_at(entry.value(), at).and_then(|profile| match profile {
                    ScanProfile::Declared { level } => Some((entry.key().clone(), level)),
                    _ => None,
                })
            })
            .collect();
        declared.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(declared)
    }

    fn all_profiles(&self, at: Timestamp) -> StoreResult<Vec<(Reference, ScanProfile)>> {
        let mut profiles: Vec<(Reference, ScanProfile)> = self
            .profiles
            .iter()
            .filter_map(|entry| {
                version_at(entry.value(), at).map(|profile| (entry.key().clone(), profile))
            })
            .collect();
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(profiles)
    }

    fn origin(&self, id: &str, at: Timestamp) -> StoreResult<Option<Origin>> {
        Ok(self
            .origins
            .get(id)
            .and_then(|history| version_at(history.value(), at)))
    }

    fn origins_with_parameter(
        &self,
        reference: &Reference,
        at: Timestamp,
    ) -> StoreResult<Vec<Origin>> {
        let mut hits: Vec<Origin> = self
            .live_origins(at)
            .into_iter()
            .filter(|origin| origin.is_parameterized_by(reference))
            .collect();
        hits.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(hits)
    }

    fn origins_producing(
        &self,
        reference: &Reference,
        at: Timestamp,
    ) -> StoreResult<Vec<Origin>> {
        let mut hits: Vec<Origin> = self
            .live_origins(at)
            .into_iter()
            .filter(|origin| origin.result.contains(reference))
            .collect();
        hits.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(hits)
    }

    fn commit(&self, mutations: Vec<Mutation>, valid_time: Timestamp) -> StoreResult<()> {
        for mutation in mutations {
            self.apply(mutation, valid_time);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("nodes", &self.nodes.len())
            .field("profiles", &self.profiles.len())
            .field("origins", &self.origins.len())
            .finish()
    }
}
