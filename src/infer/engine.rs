//! The nibble runner: fixpoint evaluation of derivation rules.
//!
//! All reads and writes go through a pass-local [`Overlay`], so the pass
//! sees its own uncommitted output and the underlying store stays untouched
//! until the caller commits the drained batch atomically.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::{ArgusResult, EngineError};
use crate::node::Node;
use crate::origin::{Origin, OriginType, parameters_hash};
use crate::reference::Reference;
use crate::rule::{Bound, Parameter, RuleDefinition, RuleRegistry, Selector};
use crate::schema::SchemaRegistry;
use crate::store::overlay::Overlay;
use crate::store::{GraphStore, Mutation, Query, RelationPath, Timestamp};
use crate::support::MemoTable;

use super::{DerivationResult, InferConfig};

/// Worklist-driven fixpoint evaluator of derivation rules.
pub struct NibbleEngine<'a> {
    schema: &'a SchemaRegistry,
    rules: &'a RuleRegistry,
    config: InferConfig,
}

/// What happened to one `(rule, anchor)` binding.
enum BindingOutcome {
    Skipped,
    Failed,
    Evaluated {
        derived: Vec<Reference>,
        retracted: Vec<Reference>,
        origin_written: bool,
    },
}

impl<'a> NibbleEngine<'a> {
    pub fn new(schema: &'a SchemaRegistry, rules: &'a RuleRegistry, config: InferConfig) -> Self {
        Self {
            schema,
            rules,
            config,
        }
    }

    /// Run derivation to fixpoint over the changed set.
    ///
    /// Termination: the worklist only admits nodes that are new, whose
    /// content actually changed, or that were just retracted; the node
    /// universe is finite, so referentially transparent payloads converge.
    /// The iteration budget catches payloads that are not.
    pub fn infer(
        &self,
        changed: &[Reference],
        view: &mut Overlay<'_>,
    ) -> ArgusResult<DerivationResult> {
        let mut result = DerivationResult::default();
        let mut memo = MemoTable::new();

        let mut worklist: VecDeque<Reference> = VecDeque::new();
        let mut queued: HashSet<Reference> = HashSet::new();
        for reference in changed {
            if queued.insert(reference.clone()) {
                worklist.push_back(reference.clone());
            }
        }

        while let Some(current) = worklist.pop_front() {
            queued.remove(&current);
            result.iterations += 1;
            if result.iterations > self.config.max_iterations {
                return Err(EngineError::FixpointBudgetExceeded {
                    iterations: result.iterations,
                }
                .into());
            }

            for (rule_id, anchor) in self.affected_bindings(&current, view)? {
                let rule = match self.rules.get(&rule_id) {
                    Ok(rule) => rule,
                    Err(_) => {
                        tracing::warn!(rule = %rule_id, "origin references unregistered rule, skipping");
                        continue;
                    }
                };
                let outcome = self.run_binding(&rule, &anchor, view, &mut memo)?;
                match outcome {
                    BindingOutcome::Skipped => result.skipped_bindings += 1,
                    BindingOutcome::Failed => result.failed_bindings += 1,
                    BindingOutcome::Evaluated {
                        derived,
                        retracted,
                        origin_written,
                    } => {
                        if origin_written {
                            result.origins_written += 1;
                        }
                        for reference in derived {
                            if queued.insert(reference.clone()) {
                                worklist.push_back(reference.clone());
                            }
                            result.derived.push(reference);
                        }
                        for reference in retracted {
                            if queued.insert(reference.clone()) {
                                worklist.push_back(reference.clone());
                            }
                            result.retracted.push(reference);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            derived = result.derived.len(),
            retracted = result.retracted.len(),
            origins = result.origins_written,
            iterations = result.iterations,
            "derivation pass reached fixpoint"
        );
        Ok(result)
    }

    /// All `(rule, anchor)` pairs that must be re-evaluated because
    /// `current` changed: previously bound origins plus fresh candidate
    /// bindings of rules mentioning the kind.
    fn affected_bindings(
        &self,
        current: &Reference,
        view: &Overlay<'_>,
    ) -> ArgusResult<BTreeSet<(String, Reference)>> {
        let mut jobs: BTreeSet<(String, Reference)> = BTreeSet::new();

        for origin in view.origins_with_parameter(current, Timestamp::ZERO)? {
            if origin.origin_type == OriginType::Nibblet {
                jobs.insert((origin.method.clone(), origin.source.clone()));
            }
        }

        let kind = current.kind();
        for rule in self.rules.rules_mentioning(kind) {
            for position in rule.positions_of(kind) {
                if position == 0 {
                    jobs.insert((rule.id.clone(), current.clone()));
                } else {
                    for anchor in self.anchors_affected_by(&rule, position, current, view)? {
                        jobs.insert((rule.id.clone(), anchor));
                    }
                }
            }
        }

        Ok(jobs)
    }

    /// Invert a secondary parameter's selector: which anchors does a change
    /// to `changed` (bound at `position`) affect?
    fn anchors_affected_by(
        &self,
        rule: &RuleDefinition,
        position: usize,
        changed: &Reference,
        view: &Overlay<'_>,
    ) -> ArgusResult<Vec<Reference>> {
        let anchor_kind = &rule.signature[0].kind;
        let param = &rule.signature[position];
        let anchors = match &param.selector {
            // Every anchor of the rule is a candidate consumer.
            Selector::AllOfKind => view
                .query(&Query::all_of(anchor_kind.clone()), Timestamp::ZERO)?
                .into_iter()
                .map(|(reference, _)| reference)
                .collect(),
            // The anchor points at the changed node through `attr`.
            Selector::Related {
                via: RelationPath::Outgoing { attr },
                ..
            } => view
                .query(
                    &Query::all_of(anchor_kind.clone()).anchored(attr.clone(), changed.clone()),
                    Timestamp::ZERO,
                )?
                .into_iter()
                .map(|(reference, _)| reference)
                .collect(),
            // The changed node points at the anchor through `attr`.
            Selector::Related {
                via: RelationPath::Incoming { attr, .. },
                ..
            } => match view.get(changed, Timestamp::ZERO)? {
                Some(node) => node
                    .attr(attr)
                    .and_then(|value| value.as_reference())
                    .filter(|target| target.kind() == *anchor_kind)
                    .map(|target| vec![target.clone()])
                    .unwrap_or_default(),
                None => Vec::new(),
            },
        };
        Ok(anchors)
    }

    /// Candidate bindings for one secondary parameter, relative to a bound
    /// anchor. Kind filtering happens here, once, for every rule.
    fn candidates_for(
        &self,
        param: &Parameter,
        anchor: &Bound,
        view: &Overlay<'_>,
    ) -> ArgusResult<Vec<Bound>> {
        let matches_filter = |node: &Node| -> bool {
            match &param.selector {
                Selector::Related {
                    matching: Some((attr, expected)),
                    ..
                } => node.attr(attr) == Some(expected),
                _ => true,
            }
        };

        let mut candidates = Vec::new();
        match &param.selector {
            Selector::AllOfKind => {
                for (reference, node) in
                    view.query(&Query::all_of(param.kind.clone()), Timestamp::ZERO)?
                {
                    if matches_filter(&node) {
                        candidates.push(Bound { reference, node });
                    }
                }
            }
            Selector::Related {
                via: RelationPath::Outgoing { attr },
                ..
            } => {
                if let Some(target) = anchor.node.attr(attr).and_then(|value| value.as_reference())
                {
                    if target.kind() == param.kind {
                        if let Some(node) = view.get(target, Timestamp::ZERO)? {
                            if matches_filter(&node) {
                                candidates.push(Bound {
                                    reference: target.clone(),
                                    node,
                                });
                            }
                        }
                    }
                }
            }
            Selector::Related {
                via: RelationPath::Incoming { attr, .. },
                ..
            } => {
                let query = Query::all_of(param.kind.clone())
                    .anchored(attr.clone(), anchor.reference.clone());
                for (reference, node) in view.query(&query, Timestamp::ZERO)? {
                    if matches_filter(&node) {
                        candidates.push(Bound { reference, node });
                    }
                }
            }
        }
        Ok(candidates)
    }

    /// Evaluate one `(rule, anchor)` binding: memo check, payload
    /// invocation per argument tuple, result diff, origin rewrite.
    fn run_binding(
        &self,
        rule: &RuleDefinition,
        anchor: &Reference,
        view: &mut Overlay<'_>,
        memo: &mut MemoTable,
    ) -> ArgusResult<BindingOutcome> {
        let origin_id = format!("{}:{}:{}", OriginType::Nibblet, rule.id, anchor);
        let prior = view.origin(&origin_id, Timestamp::ZERO)?;

        // Anchor gone: the binding can no longer run; its outputs lose this
        // producer.
        let Some(anchor_node) = view.get(anchor, Timestamp::ZERO)? else {
            return Ok(self.drop_binding(prior, &origin_id, view)?);
        };
        let anchor_bound = Bound {
            reference: anchor.clone(),
            node: anchor_node,
        };

        // Resolve candidates per secondary position; a required position
        // with no candidates makes the binding unrunnable.
        let mut candidate_lists: Vec<Vec<Option<Bound>>> =
            vec![vec![Some(anchor_bound.clone())]];
        for param in &rule.signature[1..] {
            let candidates = self.candidates_for(param, &anchor_bound, view)?;
            if candidates.is_empty() {
                if param.optional {
                    candidate_lists.push(vec![None]);
                } else {
                    return Ok(self.drop_binding(prior, &origin_id, view)?);
                }
            } else {
                candidate_lists.push(candidates.into_iter().map(Some).collect());
            }
        }

        let tuples = cartesian(&candidate_lists);

        // Content-hash memoization over the full tuple set.
        let hashable: Vec<Vec<Option<Node>>> = tuples
            .iter()
            .map(|tuple| {
                tuple
                    .iter()
                    .map(|slot| slot.as_ref().map(|b| b.node.clone()))
                    .collect()
            })
            .collect();
        let hash = parameters_hash(&hashable, &rule.checksum)?;

        let prior_hash = memo
            .lookup(&rule.id, anchor)
            .map(|h| h.to_string())
            .or_else(|| prior.as_ref().and_then(|o| o.parameters_hash.clone()));
        if prior_hash.as_deref() == Some(hash.as_str()) {
            tracing::debug!(rule = %rule.id, %anchor, "binding unchanged, skipping");
            return Ok(BindingOutcome::Skipped);
        }

        // Invoke the payload per tuple. A failure leaves the prior origin
        // untouched so stale facts are not silently dropped; the binding is
        // retried on the next change to any of its inputs.
        let mut produced: Vec<Node> = Vec::new();
        for tuple in &tuples {
            match rule.invoke(tuple) {
                Ok(nodes) => produced.extend(nodes),
                Err(err) => {
                    tracing::warn!(rule = %rule.id, %anchor, error = %err, "rule payload failed, binding skipped");
                    return Ok(BindingOutcome::Failed);
                }
            }
        }

        // Validate outputs and compute their identities. Invalid nodes are
        // skipped individually; conflicting duplicates keep the first seen.
        let mut outputs: BTreeMap<Reference, Node> = BTreeMap::new();
        for node in produced {
            match self.schema.reference_of(&node) {
                Ok(reference) => match outputs.get(&reference) {
                    None => {
                        outputs.insert(reference, node);
                    }
                    Some(existing) if *existing == node => {}
                    Some(_) => {
                        tracing::warn!(
                            rule = %rule.id, %reference,
                            "conflicting duplicate output, keeping first"
                        );
                    }
                },
                Err(err) => {
                    tracing::warn!(rule = %rule.id, error = %err, "invalid rule output skipped");
                }
            }
        }

        // Diff against the prior result set.
        let prior_results: BTreeSet<Reference> = prior
            .as_ref()
            .map(|o| o.result.iter().cloned().collect())
            .unwrap_or_default();
        let new_results: BTreeSet<Reference> = outputs.keys().cloned().collect();

        let mut retracted = Vec::new();
        for removed in prior_results.difference(&new_results) {
            if self.retract_if_unsupported(removed, &origin_id, view)? {
                retracted.push(removed.clone());
            }
        }

        let mut derived = Vec::new();
        for (reference, node) in &outputs {
            let changed = match view.get(reference, Timestamp::ZERO)? {
                None => true,
                Some(existing) => existing != *node,
            };
            if changed {
                view.push(Mutation::PutNode {
                    reference: reference.clone(),
                    node: node.clone(),
                });
                derived.push(reference.clone());
            }
        }

        let parameters: Vec<Reference> = tuples
            .iter()
            .flat_map(|tuple| tuple.iter().skip(1))
            .filter_map(|slot| slot.as_ref().map(|b| b.reference.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let origin = Origin {
            origin_type: OriginType::Nibblet,
            method: rule.id.clone(),
            source: anchor.clone(),
            result: new_results.into_iter().collect(),
            parameters_hash: Some(hash.clone()),
            parameters,
            task_id: None,
        };
        let origin_written = prior.as_ref() != Some(&origin);
        if origin_written {
            view.push(Mutation::PutOrigin(origin));
        }
        memo.record(&rule.id, anchor, &hash);

        Ok(BindingOutcome::Evaluated {
            derived,
            retracted,
            origin_written,
        })
    }

    /// Remove a binding whose anchor or required inputs disappeared,
    /// retracting results left without any producer.
    fn drop_binding(
        &self,
        prior: Option<Origin>,
        origin_id: &str,
        view: &mut Overlay<'_>,
    ) -> ArgusResult<BindingOutcome> {
        let Some(prior) = prior else {
            return Ok(BindingOutcome::Skipped);
        };
        view.push(Mutation::DeleteOrigin(origin_id.to_string()));
        let mut retracted = Vec::new();
        for reference in &prior.result {
            if self.retract_if_unsupported(reference, origin_id, view)? {
                retracted.push(reference.clone());
            }
        }
        tracing::debug!(origin = %origin_id, retracted = retracted.len(), "binding dropped");
        Ok(BindingOutcome::Evaluated {
            derived: Vec::new(),
            retracted,
            origin_written: true,
        })
    }

    /// Delete a node if no origin other than `excluding` still produces it.
    /// Returns whether the node was deleted.
    fn retract_if_unsupported(
        &self,
        reference: &Reference,
        excluding: &str,
        view: &mut Overlay<'_>,
    ) -> ArgusResult<bool> {
        let supported = view
            .origins_producing(reference, Timestamp::ZERO)?
            .into_iter()
            .any(|origin| origin.id() != excluding);
        if supported {
            return Ok(false);
        }
        if view.get(reference, Timestamp::ZERO)?.is_none() {
            return Ok(false);
        }
        tracing::debug!(%reference, "retracting node with no remaining producer");
        if view.profile(reference, Timestamp::ZERO)?.is_some() {
            view.push(Mutation::DeleteProfile(reference.clone()));
        }
        view.push(Mutation::DeleteNode(reference.clone()));
        Ok(true)
    }
}

/// Cartesian product of per-position candidate lists.
fn cartesian(lists: &[Vec<Option<Bound>>]) -> Vec<Vec<Option<Bound>>> {
    let mut tuples: Vec<Vec<Option<Bound>>> = vec![Vec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(tuples.len() * list.len());
        for tuple in &tuples {
            for candidate in list {
                let mut extended = tuple.clone();
                extended.push(candidate.clone());
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples
}
