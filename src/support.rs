//! Support tracking and retraction cascades.
//!
//! Every derived fact is supported by the origins that produce it; a fact
//! with several producers survives losing one of them. When a node is
//! deleted, everything provenance-chained to it must go too: origins
//! parameterized by the node are removed, and any of their results left
//! without a producer cascade into deletion themselves. This makes the graph
//! self-healing: removing a false premise automatically cleans up all
//! downstream derivations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::reference::Reference;
use crate::store::{GraphStore, Mutation, StoreResult, Timestamp};

/// Result of one retraction cascade.
#[derive(Debug, Clone)]
pub struct RetractionResult {
    /// Nodes that lost their last producer, root first.
    pub retracted: Vec<Reference>,
    /// Origin ids removed by the cascade.
    pub removed_origins: Vec<String>,
    /// Maximum cascade depth reached.
    pub cascade_depth: usize,
}

/// Accumulates retractions against a store view.
///
/// A single retractor can absorb several deletions from one batch; the
/// "already dead" sets are shared, so overlapping cascades do not double
/// count and a fact is only spared if a producer outside the whole dead set
/// remains. Producer origins that still list a deleted node are left
/// untouched: a fact explicitly deleted while still observed legitimately
/// reappears on the next observation.
pub struct Retractor<'a> {
    store: &'a dyn GraphStore,
    at: Timestamp,
    dead_nodes: BTreeSet<Reference>,
    dead_origins: BTreeSet<String>,
}

impl<'a> Retractor<'a> {
    pub fn new(store: &'a dyn GraphStore, at: Timestamp) -> Self {
        Self {
            store,
            at,
            dead_nodes: BTreeSet::new(),
            dead_origins: BTreeSet::new(),
        }
    }

    /// Whether a node has already been marked dead by an earlier cascade.
    pub fn is_dead(&self, reference: &Reference) -> bool {
        self.dead_nodes.contains(reference)
    }

    /// Whether an origin has already been removed by an earlier cascade.
    pub fn origin_is_dead(&self, id: &str) -> bool {
        self.dead_origins.contains(id)
    }

    /// Mark an origin dead without retracting a node (used by the rule
    /// engine when a binding's anchor disappears).
    pub fn remove_origin(&mut self, id: String) {
        self.dead_origins.insert(id);
    }

    /// Count the producers of `reference` that are still alive.
    pub fn surviving_producers(&self, reference: &Reference) -> StoreResult<usize> {
        Ok(self
            .store
            .origins_producing(reference, self.at)?
            .into_iter()
            .filter(|origin| !self.dead_origins.contains(&origin.id()))
            .count())
    }

    /// Retract a node and cascade through everything provenance-chained
    /// to it.
    pub fn retract(&mut self, root: &Reference) -> StoreResult<RetractionResult> {
        let mut retracted = vec![root.clone()];
        let mut removed_origins = Vec::new();
        let mut max_depth = 0;

        let mut queue: VecDeque<(Reference, usize)> = VecDeque::new();
        queue.push_back((root.clone(), 0));
        self.dead_nodes.insert(root.clone());

        while let Some((current, depth)) = queue.pop_front() {
            max_depth = max_depth.max(depth);

            let dependents = self.store.origins_with_parameter(&current, self.at)?;
            for origin in dependents {
                let id = origin.id();
                if !self.dead_origins.insert(id.clone()) {
                    continue;
                }
                tracing::debug!(origin = %id, cause = %current, "retracting origin");
                removed_origins.push(id);

                for result in &origin.result {
                    if self.dead_nodes.contains(result) {
                        continue;
                    }
                    if self.surviving_producers(result)? == 0 {
                        // No alternative producer — the fact goes too.
                        self.dead_nodes.insert(result.clone());
                        retracted.push(result.clone());
                        queue.push_back((result.clone(), depth + 1));
                    }
                }
            }
        }

        Ok(RetractionResult {
            retracted,
            removed_origins,
            cascade_depth: max_depth,
        })
    }

    /// Render the accumulated dead sets as store mutations. Profiles of
    /// dead nodes are dropped alongside them.
    pub fn into_mutations(self) -> StoreResult<Vec<Mutation>> {
        let mut mutations = Vec::new();
        for id in self.dead_origins {
            mutations.push(Mutation::DeleteOrigin(id));
        }
        for reference in self.dead_nodes {
            if self.store.profile(&reference, self.at)?.is_some() {
                mutations.push(Mutation::DeleteProfile(reference.clone()));
            }
            mutations.push(Mutation::DeleteNode(reference));
        }
        Ok(mutations)
    }
}

/// Pass-local support index: `(rule, source) → last parameters hash`, the
/// content-hash memoization table the rule engine consults before invoking a
/// payload.
#[derive(Debug, Default)]
pub struct MemoTable {
    seen: BTreeMap<(String, Reference), String>,
}

impl MemoTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding's hash; returns true if it differs from the last
    /// recorded one.
    pub fn record(&mut self, rule: &str, source: &Reference, hash: &str) -> bool {
        let key = (rule.to_string(), source.clone());
        match self.seen.get(&key) {
            Some(existing) if existing == hash => false,
            _ => {
                self.seen.insert(key, hash.to_string());
                true
            }
        }
    }

    pub fn lookup(&self, rule: &str, source: &Reference) -> Option<&str> {
        self.seen
            .get(&(rule.to_string(), source.clone()))
            .map(|s| s.as_str())
    }
}
