//! Pass-local write overlay.
//!
//! A derivation pass must see its own uncommitted writes (rule outputs feed
//! the worklist) while keeping the underlying store untouched until the pass
//! completes. [`Overlay`] buffers mutations on top of a base store and
//! implements the full [`GraphStore`] contract; `take_mutations` hands the
//! buffered batch to the base store's atomic commit. If the pass aborts, the
//! overlay is simply dropped and nothing was committed.

use std::collections::HashMap;

use crate::node::Node;
use crate::origin::Origin;
use crate::profile::{ScanLevel, ScanProfile};
use crate::reference::Reference;

use super::{GraphStore, Mutation, Query, RelationPath, StoreResult, Timestamp};

/// Buffered view over a base store.
pub struct Overlay<'a> {
    base: &'a dyn GraphStore,
    /// Reads inside a pass are pinned to the pass's valid time.
    at: Timestamp,
    nodes: HashMap<Reference, Option<Node>>,
    profiles: HashMap<Reference, Option<ScanProfile>>,
    origins: HashMap<String, Option<Origin>>,
    log: Vec<Mutation>,
}

impl<'a> Overlay<'a> {
    pub fn new(base: &'a dyn GraphStore, at: Timestamp) -> Self {
        Self {
            base,
            at,
            nodes: HashMap::new(),
            profiles: HashMap::new(),
            origins: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// The pass valid time all reads are pinned to.
    pub fn valid_time(&self) -> Timestamp {
        self.at
    }

    /// Number of buffered mutations.
    pub fn pending(&self) -> usize {
        self.log.len()
    }

    /// Drain the buffered batch for the base store's atomic commit.
    pub fn take_mutations(self) -> Vec<Mutation> {
        self.log
    }

    /// Buffer a single mutation and make it visible to subsequent reads.
    pub fn push(&mut self, mutation: Mutation) {
        match &mutation {
            Mutation::PutNode { reference, node } => {
                self.nodes.insert(reference.clone(), Some(node.clone()));
            }
            Mutation::DeleteNode(reference) => {
                self.nodes.insert(reference.clone(), None);
            }
            Mutation::PutProfile { reference, profile } => {
                self.profiles.insert(reference.clone(), Some(profile.clone()));
            }
            Mutation::DeleteProfile(reference) => {
                self.profiles.insert(reference.clone(), None);
            }
            Mutation::PutOrigin(origin) => {
                self.origins.insert(origin.id(), Some(origin.clone()));
            }
            Mutation::DeleteOrigin(id) => {
                self.origins.insert(id.clone(), None);
            }
        }
        self.log.push(mutation);
    }

    fn node_is_overlaid(&self, reference: &Reference) -> bool {
        self.nodes.contains_key(reference)
    }
}

impl GraphStore for Overlay<'_> {
    fn get(&self, reference: &Reference, _at: Timestamp) -> StoreResult<Option<Node>> {
        match self.nodes.get(reference) {
            Some(overlaid) => Ok(overlaid.clone()),
            None => self.base.get(reference, self.at),
        }
    }

    fn neighbours(
        &self,
        reference: &Reference,
        paths: &[RelationPath],
        _at: Timestamp,
    ) -> StoreResult<HashMap<RelationPath, Vec<(Reference, Node)>>> {
        let mut out: HashMap<RelationPath, Vec<(Reference, Node)>> = HashMap::new();
        for path in paths {
            let mut hits = Vec::new();
            match path {
                RelationPath::Outgoing { attr } => {
                    if let Some(node) = self.get(reference, self.at)? {
                        if let Some(target) =
                            node.attr(attr).and_then(|value| value.as_reference())
                        {
                            if let Some(target_node) = self.get(target, self.at)? {
                                hits.push((target.clone(), target_node));
                            }
                        }
                    }
                }
                RelationPath::Incoming { kind, attr } => {
                    let base_hits = self
                        .base
                        .neighbours(reference, std::slice::from_ref(path), self.at)?
                        .remove(path)
                        .unwrap_or_default();
                    for (candidate, node) in base_hits {
                        if !self.node_is_overlaid(&candidate) {
                            hits.push((candidate, node));
                        }
                    }
                    // Overlaid nodes may add or restore back-references.
                    for (candidate, overlaid) in &self.nodes {
                        let Some(node) = overlaid else { continue };
                        if candidate.kind() != kind {
                            continue;
                        }
                        let points_here = node
                            .attr(attr)
                            .and_then(|value| value.as_reference())
                            .is_some_and(|target| target == reference);
                        if points_here {
                            hits.push((candidate.clone(), node.clone()));
                        }
                    }
                    hits.sort_by(|a, b| a.0.cmp(&b.0));
                }
            }
            out.insert(path.clone(), hits);
        }
        Ok(out)
    }

    fn query(&self, query: &Query, _at: Timestamp) -> StoreResult<Vec<(Reference, Node)>> {
        let mut rows: Vec<(Reference, Node)> = self
            .base
            .query(query, self.at)?
            .into_iter()
            .filter(|(reference, _)| !self.node_is_overlaid(reference))
            .collect();

        for (reference, overlaid) in &self.nodes {
            let Some(node) = overlaid else { continue };
            if node.kind() != query.kind {
                continue;
            }
            let matches = query.anchors.iter().all(|(attr, anchor)| {
                node.attr(attr)
                    .and_then(|value| value.as_reference())
                    .is_some_and(|target| target == anchor)
            });
            if matches {
                rows.push((reference.clone(), node.clone()));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    fn profile(&self, reference: &Reference, _at: Timestamp) -> StoreResult<Option<ScanProfile>> {
        match self.profiles.get(reference) {
            Some(overlaid) => Ok(overlaid.clone()),
            None => self.base.profile(reference, self.at),
        }
    }

    fn declared_profiles(&self, _at: Timestamp) -> StoreResult<Vec<(Reference, ScanLevel)>> {
        let mut declared: Vec<(Reference, ScanLevel)> = self
            .base
            .declared_profiles(self.at)?
            .into_iter()
            .filter(|(reference, _)| !self.profiles.contains_key(reference))
            .collect();
        for (reference, overlaid) in &self.profiles {
            if let Some(ScanProfile::Declared { level }) = overlaid {
                declared.push((reference.clone(), *level));
            }
        }
        declared.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(declared)
    }

    fn all_profiles(&self, _at: Timestamp) -> StoreResult<Vec<(Reference, ScanProfile)>> {
        let mut profiles: Vec<(Reference, ScanProfile)> = self
            .base
            .all_profiles(self.at)?
            .into_iter()
            .filter(|(reference, _)| !self.profiles.contains_key(reference))
            .collect();
        for (reference, overlaid) in &self.profiles {
            if let Some(profile) = overlaid {
                profiles.push((reference.clone(), profile.clone()));
            }
        }
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(profiles)
    }

    fn origin(&self, id: &str, _at: Timestamp) -> StoreResult<Option<Origin>> {
        match self.origins.get(id) {
            Some(overlaid) => Ok(overlaid.clone()),
            None => self.base.origin(id, self.at),
        }
    }

    fn origins_with_parameter(
        &self,
        reference: &Reference,
        _at: Timestamp,
    ) -> StoreResult<Vec<Origin>> {
        let mut hits: Vec<Origin> = self
            .base
            .origins_with_parameter(reference, self.at)?
            .into_iter()
            .filter(|origin| !self.origins.contains_key(&origin.id()))
            .collect();
        for overlaid in self.origins.values().flatten() {
            if overlaid.is_parameterized_by(reference) {
                hits.push(overlaid.clone());
            }
        }
        hits.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(hits)
    }

    fn origins_producing(
        &self,
        reference: &Reference,
        _at: Timestamp,
    ) -> StoreResult<Vec<Origin>> {
        let mut hits: Vec<Origin> = self
            .base
            .origins_producing(reference, self.at)?
            .into_iter()
            .filter(|origin| !self.origins.contains_key(&origin.id()))
            .collect();
        for overlaid in self.origins.values().flatten() {
            if overlaid.result.contains(reference) {
                hits.push(overlaid.clone());
            }
        }
        hits.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(hits)
    }

    fn commit(&self, _mutations: Vec<Mutation>, _valid_time: Timestamp) -> StoreResult<()> {
        // Batch writes go through `push` so they stay visible and ordered;
        // the buffered batch reaches the base store via `take_mutations`.
        Err(crate::error::StoreError::Backend {
            message: "overlay does not commit; drain it with take_mutations".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    fn network_ref() -> Reference {
        Reference::from_tokens("Network", &["internet".to_string()])
    }

    fn hostname_ref(name: &str) -> Reference {
        Reference::from_tokens("Hostname", &["internet".to_string(), name.to_string()])
    }

    fn hostname_node(name: &str) -> Node {
        Node::new("Hostname")
            .with_attr("network", network_ref())
            .with_attr("name", name)
    }

    fn seeded_store() -> MemStore {
        let store = MemStore::new();
        store
            .commit(
                vec![
                    Mutation::PutNode {
                        reference: network_ref(),
                        node: Node::new("Network").with_attr("name", "internet"),
                    },
                    Mutation::PutNode {
                        reference: hostname_ref("a.com"),
                        node: hostname_node("a.com"),
                    },
                ],
                Timestamp::new(10),
            )
            .unwrap();
        store
    }

    #[test]
    fn overlay_reads_through_to_base() {
        let store = seeded_store();
        let overlay = Overlay::new(&store, Timestamp::new(10));
        assert!(overlay.get(&hostname_ref("a.com"), Timestamp::ZERO).unwrap().is_some());
    }

    #[test]
    fn overlay_writes_shadow_base_without_committing() {
        let store = seeded_store();
        let mut overlay = Overlay::new(&store, Timestamp::new(10));

        overlay.push(Mutation::DeleteNode(hostname_ref("a.com")));
        overlay.push(Mutation::PutNode {
            reference: hostname_ref("b.com"),
            node: hostname_node("b.com"),
        });

        // Overlay sees the delete and the insert.
        assert!(overlay.get(&hostname_ref("a.com"), Timestamp::ZERO).unwrap().is_none());
        assert!(overlay.get(&hostname_ref("b.com"), Timestamp::ZERO).unwrap().is_some());

        // Base is untouched until the batch is committed.
        assert!(store.get(&hostname_ref("a.com"), Timestamp::new(10)).unwrap().is_some());
        assert!(store.get(&hostname_ref("b.com"), Timestamp::new(10)).unwrap().is_none());

        let mutations = overlay.take_mutations();
        assert_eq!(mutations.len(), 2);
        store.commit(mutations, Timestamp::new(10)).unwrap();
        assert!(store.get(&hostname_ref("b.com"), Timestamp::new(10)).unwrap().is_some());
    }

    #[test]
    fn overlay_query_merges_overlaid_nodes() {
        let store = seeded_store();
        let mut overlay = Overlay::new(&store, Timestamp::new(10));
        overlay.push(Mutation::PutNode {
            reference: hostname_ref("b.com"),
            node: hostname_node("b.com"),
        });
        overlay.push(Mutation::DeleteNode(hostname_ref("a.com")));

        let rows = overlay
            .query(&Query::all_of("Hostname"), Timestamp::ZERO)
            .unwrap();
        let names: Vec<String> = rows.iter().map(|(r, _)| r.to_string()).collect();
        assert_eq!(names, vec!["Hostname|internet|b.com".to_string()]);
    }

    #[test]
    fn overlay_incoming_neighbours_see_new_nodes() {
        let store = seeded_store();
        let mut overlay = Overlay::new(&store, Timestamp::new(10));
        overlay.push(Mutation::PutNode {
            reference: hostname_ref("b.com"),
            node: hostname_node("b.com"),
        });

        let incoming = RelationPath::Incoming {
            kind: "Hostname".into(),
            attr: "network".into(),
        };
        let pulled = overlay
            .neighbours(&network_ref(), &[incoming.clone()], Timestamp::ZERO)
            .unwrap();
        assert_eq!(pulled[&incoming].len(), 2);
    }

    #[test]
    fn overlay_origin_merge() {
        let store = seeded_store();
        let origin = Origin::observation(
            "dns",
            hostname_ref("a.com"),
            vec![hostname_ref("a.com")],
            None,
        );
        store
            .commit(
                vec![Mutation::PutOrigin(origin.clone())],
                Timestamp::new(10),
            )
            .unwrap();

        let mut overlay = Overlay::new(&store, Timestamp::new(10));
        assert_eq!(
            overlay
                .origins_producing(&hostname_ref("a.com"), Timestamp::ZERO)
                .unwrap()
                .len(),
            1
        );

        overlay.push(Mutation::DeleteOrigin(origin.id()));
        assert!(
            overlay
                .origins_producing(&hostname_ref("a.com"), Timestamp::ZERO)
                .unwrap()
                .is_empty()
        );
    }
}
