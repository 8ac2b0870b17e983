//! Scan-profile inheritance propagator.
//!
//! Effective trust levels are computed by a shortest-path-style relaxation
//! run independently per declared source and merged per target: the level of
//! each hop is clamped by the relation it crosses, a target keeps the
//! highest level per source, ties prefer the shorter path, and remaining
//! ties keep the previously stored winner so reruns are stable. Declared
//! profiles are authoritative — they seed propagation and are never
//! overwritten by it. Relaxation only re-enqueues on actual improvement,
//! which is what terminates cyclic graphs.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{ArgusResult, EngineError};
use crate::profile::{Inheritance, ScanLevel, ScanProfile};
use crate::reference::Reference;
use crate::schema::SchemaRegistry;
use crate::store::{GraphStore, Mutation, RelationPath, Timestamp};

/// Tunables for one propagation pass.
#[derive(Debug, Clone)]
pub struct PropagateConfig {
    /// Relaxation steps before the pass aborts instead of looping forever.
    pub max_iterations: usize,
}

impl Default for PropagateConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100_000,
        }
    }
}

/// One relaxation entry: the best hop found so far for a target, within a
/// single source's run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    level: ScanLevel,
    depth: usize,
    parent: Reference,
}

impl Candidate {
    /// Relaxation order: higher level wins, then smaller depth, then the
    /// lexicographically smaller parent (a deterministic last resort that
    /// never depends on store iteration order).
    fn beats(&self, other: &Candidate) -> bool {
        (self.level, std::cmp::Reverse(self.depth), std::cmp::Reverse(&self.parent))
            > (other.level, std::cmp::Reverse(other.depth), std::cmp::Reverse(&other.parent))
    }
}

/// The inheritance propagator.
pub struct ScanPropagator<'a> {
    schema: &'a SchemaRegistry,
    config: PropagateConfig,
}

impl<'a> ScanPropagator<'a> {
    pub fn new(schema: &'a SchemaRegistry, config: PropagateConfig) -> Self {
        Self { schema, config }
    }

    /// Recompute inherited profiles and buffer the changed ones into the
    /// view. Returns the delta: every profile that was written.
    ///
    /// The pass derives from scratch out of the declared set, which covers
    /// all the recomputation triggers uniformly — declared profiles changing,
    /// relations appearing or disappearing, and nodes with inherited
    /// profiles being deleted.
    pub fn recompute(
        &self,
        changed: &[Reference],
        view: &mut crate::store::overlay::Overlay<'_>,
    ) -> ArgusResult<BTreeMap<Reference, ScanProfile>> {
        tracing::debug!(changed = changed.len(), "recomputing scan profiles");

        let sources = view.declared_profiles(Timestamp::ZERO)?;
        let mut steps = 0usize;

        // Winning hop per (target, source).
        let mut winners: BTreeMap<Reference, BTreeMap<Reference, Inheritance>> = BTreeMap::new();
        for (source, level) in &sources {
            let best = self.relax_from(source, *level, view, &mut steps)?;
            for (target, candidate) in best {
                winners.entry(target).or_default().insert(
                    source.clone(),
                    Inheritance {
                        parent: candidate.parent,
                        source: source.clone(),
                        level: candidate.level,
                        depth: candidate.depth,
                    },
                );
            }
        }

        // Desired profile per target, with the stability tie-break against
        // what is currently stored.
        let mut delta: BTreeMap<Reference, ScanProfile> = BTreeMap::new();
        let mut targets: BTreeMap<Reference, Option<ScanProfile>> = BTreeMap::new();
        for (target, _) in winners.iter() {
            targets.insert(target.clone(), view.profile(target, Timestamp::ZERO)?);
        }
        // Previously profiled nodes that are no longer reachable must revert.
        for (reference, profile) in view.all_profiles(Timestamp::ZERO)? {
            targets.entry(reference).or_insert(Some(profile));
        }
        for reference in changed {
            if !targets.contains_key(reference) {
                targets.insert(reference.clone(), view.profile(reference, Timestamp::ZERO)?);
            }
        }

        for (target, current) in targets {
            if matches!(current, Some(ScanProfile::Declared { .. })) {
                continue;
            }
            // Deleted nodes keep no profile; the retraction path already
            // dropped the record.
            if view.get(&target, Timestamp::ZERO)?.is_none() {
                continue;
            }

            let desired = match winners.remove(&target) {
                Some(mut hops) => {
                    self.apply_stability(&target, &mut hops, current.as_ref());
                    let level = hops
                        .values()
                        .map(|hop| hop.level)
                        .max()
                        .unwrap_or(ScanLevel::L0);
                    ScanProfile::Inherited {
                        level,
                        inheritances: hops.into_values().collect(),
                    }
                }
                None => ScanProfile::Empty,
            };

            let write = match &current {
                Some(existing) => *existing != desired,
                // An unreachable node with no profile record stays bare.
                None => desired != ScanProfile::Empty,
            };
            if write {
                tracing::debug!(%target, level = %desired.level(), "scan profile updated");
                view.push(Mutation::PutProfile {
                    reference: target.clone(),
                    profile: desired.clone(),
                });
                delta.insert(target, desired);
            }
        }

        Ok(delta)
    }

    /// Single-source relaxation with clamped hops.
    fn relax_from(
        &self,
        source: &Reference,
        declared: ScanLevel,
        view: &crate::store::overlay::Overlay<'_>,
        steps: &mut usize,
    ) -> ArgusResult<HashMap<Reference, Candidate>> {
        let mut best: HashMap<Reference, Candidate> = HashMap::new();
        let mut queue: VecDeque<(Reference, ScanLevel, usize)> = VecDeque::new();
        queue.push_back((source.clone(), declared, 0));

        while let Some((current, level, depth)) = queue.pop_front() {
            *steps += 1;
            if *steps > self.config.max_iterations {
                return Err(EngineError::FixpointBudgetExceeded { iterations: *steps }.into());
            }

            // Stale queue entries lose to a better relaxation that landed
            // in the meantime.
            if current != *source {
                match best.get(&current) {
                    Some(winner) if winner.level != level || winner.depth != depth => continue,
                    None => continue,
                    Some(_) => {}
                }
            }

            for (neighbour, issue, inherit) in self.neighbour_hops(&current, view)? {
                if neighbour == *source {
                    continue;
                }
                let clamped = level.min(issue).min(inherit);
                if clamped == ScanLevel::L0 {
                    continue;
                }
                // Declared targets are never overwritten by inheritance.
                if matches!(
                    view.profile(&neighbour, Timestamp::ZERO)?,
                    Some(ScanProfile::Declared { .. })
                ) {
                    continue;
                }
                let candidate = Candidate {
                    level: clamped,
                    depth: depth + 1,
                    parent: current.clone(),
                };
                let improved = match best.get(&neighbour) {
                    Some(winner) => candidate.beats(winner),
                    None => true,
                };
                if improved {
                    queue.push_back((neighbour.clone(), candidate.level, candidate.depth));
                    best.insert(neighbour, candidate);
                }
            }
        }

        Ok(best)
    }

    /// All 1-hop neighbours of a node with the clamps of the relation
    /// crossed, in both directions. The relation's own declaration carries
    /// both clamps regardless of traversal direction.
    fn neighbour_hops(
        &self,
        reference: &Reference,
        view: &crate::store::overlay::Overlay<'_>,
    ) -> ArgusResult<Vec<(Reference, ScanLevel, ScanLevel)>> {
        let mut paths: Vec<(RelationPath, ScanLevel, ScanLevel)> = Vec::new();

        if let Ok(schema) = self.schema.get(reference.kind()) {
            for relation in schema.relations() {
                paths.push((
                    RelationPath::Outgoing {
                        attr: relation.attr.clone(),
                    },
                    relation.max_issue_level,
                    relation.max_inherit_level,
                ));
            }
        }
        for kind in self.schema.kinds() {
            let Ok(schema) = self.schema.get(&kind) else {
                continue;
            };
            for relation in schema.relations() {
                if relation.target == reference.kind() || relation.target == "*" {
                    paths.push((
                        RelationPath::Incoming {
                            kind: kind.clone(),
                            attr: relation.attr.clone(),
                        },
                        relation.max_issue_level,
                        relation.max_inherit_level,
                    ));
                }
            }
        }

        let pull_paths: Vec<RelationPath> = paths.iter().map(|(p, _, _)| p.clone()).collect();
        let mut pulled = view.neighbours(reference, &pull_paths, Timestamp::ZERO)?;

        let mut hops = Vec::new();
        for (path, issue, inherit) in paths {
            for (neighbour, _) in pulled.remove(&path).unwrap_or_default() {
                hops.push((neighbour, issue, inherit));
            }
        }
        hops.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hops)
    }

    /// Keep the stored winner on full ties (same source, level and depth but
    /// a different parent), so reruns never flap between equivalent paths.
    fn apply_stability(
        &self,
        _target: &Reference,
        hops: &mut BTreeMap<Reference, Inheritance>,
        current: Option<&ScanProfile>,
    ) {
        let Some(ScanProfile::Inherited { inheritances, .. }) = current else {
            return;
        };
        for stored in inheritances {
            if let Some(computed) = hops.get_mut(&stored.source) {
                if computed.level == stored.level
                    && computed.depth == stored.depth
                    && computed.parent != stored.parent
                {
                    computed.parent = stored.parent.clone();
                }
            }
        }
    }
}
