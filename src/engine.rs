//! Engine facade: one tenant's derivation pipeline.
//!
//! The `Engine` owns the schema, the rule manifest and the graph store for a
//! single tenant keyspace, and turns a batch of upstream events into one
//! atomic commit: raw facts are applied to a pass-local overlay, the rule
//! engine runs to fixpoint, the scan-profile propagator recomputes trust
//! levels, and the buffered batch is committed with retry/backoff. A store
//! failure aborts the whole pass with nothing written.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ArgusResult, EngineError};
use crate::infer::{DerivationResult, InferConfig, NibbleEngine};
use crate::kinds::builtin_schema;
use crate::node::Node;
use crate::origin::{Origin, OriginType};
use crate::profile::{Inheritance, ScanLevel, ScanProfile};
use crate::propagate::{PropagateConfig, ScanPropagator};
use crate::reference::Reference;
use crate::rule::RuleRegistry;
use crate::schema::SchemaRegistry;
use crate::store::durable::DurableStore;
use crate::store::mem::MemStore;
use crate::store::overlay::Overlay;
use crate::store::{
    GraphStore, Mutation, Query, RetryPolicy, Timestamp, with_backoff,
};
use crate::support::Retractor;

/// Configuration for a tenant engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Data directory for the durable store. `None` for memory-only mode.
    pub data_dir: Option<PathBuf>,
    /// Rule-engine fixpoint budget.
    pub infer: InferConfig,
    /// Propagator budget.
    pub propagate: PropagateConfig,
    /// Retry/backoff discipline for store commits.
    pub retry: RetryPolicy,
}

/// An upstream mutation event, as delivered by scanners, parsers and the
/// API. The dispatcher turns batches of these into derivation passes.
#[derive(Debug, Clone)]
pub enum Event {
    /// A scanner observed a set of facts anchored on `source`. Facts no
    /// longer observed by the same `(method, source)` are retracted.
    Observation {
        method: String,
        source: Reference,
        nodes: Vec<Node>,
        task_id: Option<String>,
    },
    /// A human or the API asserted a single node.
    Declaration { node: Node },
    /// Re-assertion of an existing node: refreshes its valid time without
    /// seeding derivation (the content did not change).
    Affirmation { reference: Reference },
    /// Attach an authoritative scan level to a node.
    DeclareProfile {
        reference: Reference,
        level: ScanLevel,
    },
    /// Remove a declared scan level.
    RetractProfile { reference: Reference },
    /// Explicit deletion; everything provenance-chained to the node is
    /// retracted with it.
    DeleteNode { reference: Reference },
}

/// Everything one processed batch changed.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// References whose content changed during event application.
    pub changed: Vec<Reference>,
    /// Rule-engine results.
    pub derivation: DerivationResult,
    /// Scan profiles rewritten by the propagator.
    pub profiles: BTreeMap<Reference, ScanProfile>,
}

/// Summary information about an engine.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub kinds: usize,
    pub rules: usize,
    pub persistent: bool,
}

impl std::fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "argus engine info")?;
        writeln!(f, "  kinds:      {}", self.kinds)?;
        writeln!(f, "  rules:      {}", self.rules)?;
        writeln!(f, "  persistent: {}", self.persistent)?;
        Ok(())
    }
}

/// One tenant's derivation engine.
pub struct Engine {
    config: EngineConfig,
    schema: Arc<SchemaRegistry>,
    rules: Arc<RuleRegistry>,
    store: Arc<dyn GraphStore>,
}

impl Engine {
    /// Create an engine with the built-in schema and rule manifest.
    pub fn new(config: EngineConfig) -> ArgusResult<Self> {
        let schema = Arc::new(builtin_schema()?);
        let rules = Arc::new(RuleRegistry::with_builtins()?);
        let store: Arc<dyn GraphStore> = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|_| EngineError::DataDir {
                    path: dir.display().to_string(),
                })?;
                Arc::new(DurableStore::open(dir)?)
            }
            None => Arc::new(MemStore::new()),
        };
        Ok(Self {
            config,
            schema,
            rules,
            store,
        })
    }

    /// Create an engine from explicit parts (custom schema, rules or store).
    pub fn with_parts(
        config: EngineConfig,
        schema: Arc<SchemaRegistry>,
        rules: Arc<RuleRegistry>,
        store: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            config,
            schema,
            rules,
            store,
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            kinds: self.schema.kinds().len(),
            rules: self.rules.len(),
            persistent: self.config.data_dir.is_some(),
        }
    }

    // -----------------------------------------------------------------------
    // Batch processing
    // -----------------------------------------------------------------------

    /// Process one batch of upstream events as a single atomic pass.
    pub fn process(&self, events: Vec<Event>, valid_time: Timestamp) -> ArgusResult<BatchOutcome> {
        let mut view = Overlay::new(&*self.store, valid_time);
        let mut changed: BTreeSet<Reference> = BTreeSet::new();

        for event in events {
            self.apply_event(event, &mut view, &mut changed)?;
        }

        let changed: Vec<Reference> = changed.into_iter().collect();
        let nibbles = NibbleEngine::new(&self.schema, &self.rules, self.config.infer.clone());
        let derivation = nibbles.infer(&changed, &mut view)?;

        let mut touched = changed.clone();
        touched.extend(derivation.derived.iter().cloned());
        touched.extend(derivation.retracted.iter().cloned());
        let propagator = ScanPropagator::new(&self.schema, self.config.propagate.clone());
        let profiles = propagator.recompute(&touched, &mut view)?;

        let mutations = view.take_mutations();
        if !mutations.is_empty() {
            with_backoff(&self.config.retry, || {
                self.store.commit(mutations.clone(), valid_time)
            })?;
        }

        tracing::info!(
            changed = changed.len(),
            derived = derivation.derived.len(),
            retracted = derivation.retracted.len(),
            profiles = profiles.len(),
            "batch processed"
        );
        Ok(BatchOutcome {
            changed,
            derivation,
            profiles,
        })
    }

    fn apply_event(
        &self,
        event: Event,
        view: &mut Overlay<'_>,
        changed: &mut BTreeSet<Reference>,
    ) -> ArgusResult<()> {
        match event {
            Event::Declaration { node } => {
                let Some(reference) = self.admit(&node) else {
                    return Ok(());
                };
                if self.put_if_changed(&reference, node, view)? {
                    changed.insert(reference.clone());
                }
                let origin = Origin::declaration(reference);
                if view.origin(&origin.id(), Timestamp::ZERO)?.as_ref() != Some(&origin) {
                    view.push(Mutation::PutOrigin(origin));
                }
            }
            Event::Observation {
                method,
                source,
                nodes,
                task_id,
            } => {
                self.apply_observation(method, source, nodes, task_id, view, changed)?;
            }
            Event::Affirmation { reference } => {
                // Content-preserving touch: refresh the valid time, no
                // derivation seed.
                if let Some(node) = view.get(&reference, Timestamp::ZERO)? {
                    view.push(Mutation::PutNode { reference, node });
                } else {
                    tracing::warn!(%reference, "affirmation of unknown node ignored");
                }
            }
            Event::DeclareProfile { reference, level } => {
                view.push(Mutation::PutProfile {
                    reference: reference.clone(),
                    profile: ScanProfile::Declared { level },
                });
                changed.insert(reference);
            }
            Event::RetractProfile { reference } => {
                match view.profile(&reference, Timestamp::ZERO)? {
                    Some(ScanProfile::Declared { .. }) => {
                        view.push(Mutation::DeleteProfile(reference.clone()));
                        changed.insert(reference);
                    }
                    _ => {
                        tracing::warn!(%reference, "no declared profile to retract");
                    }
                }
            }
            Event::DeleteNode { reference } => {
                let mutations = {
                    let mut retractor = Retractor::new(&*view, Timestamp::ZERO);
                    let result = retractor.retract(&reference)?;
                    tracing::info!(
                        %reference,
                        retracted = result.retracted.len(),
                        origins = result.removed_origins.len(),
                        depth = result.cascade_depth,
                        "node deleted with cascade"
                    );
                    changed.extend(result.retracted.iter().cloned());
                    retractor.into_mutations()?
                };
                for mutation in mutations {
                    view.push(mutation);
                }
            }
        }
        Ok(())
    }

    fn apply_observation(
        &self,
        method: String,
        source: Reference,
        nodes: Vec<Node>,
        task_id: Option<String>,
        view: &mut Overlay<'_>,
        changed: &mut BTreeSet<Reference>,
    ) -> ArgusResult<()> {
        let origin_id = format!("{}:{}:{}", OriginType::Observation, method, source);
        let prior = view.origin(&origin_id, Timestamp::ZERO)?;

        let mut result: Vec<Reference> = Vec::new();
        for node in nodes {
            let Some(reference) = self.admit(&node) else {
                continue;
            };
            if self.put_if_changed(&reference, node, view)? {
                changed.insert(reference.clone());
            }
            if !result.contains(&reference) {
                result.push(reference);
            }
        }

        // Facts this scanner no longer sees are retracted unless another
        // producer still claims them.
        if let Some(prior) = &prior {
            for gone in prior.result.iter().filter(|r| !result.contains(r)) {
                let supported = view
                    .origins_producing(gone, Timestamp::ZERO)?
                    .into_iter()
                    .any(|origin| origin.id() != origin_id);
                if supported || view.get(gone, Timestamp::ZERO)?.is_none() {
                    continue;
                }
                tracing::debug!(reference = %gone, method = %origin_id, "observed fact disappeared, retracting");
                if view.profile(gone, Timestamp::ZERO)?.is_some() {
                    view.push(Mutation::DeleteProfile(gone.clone()));
                }
                view.push(Mutation::DeleteNode(gone.clone()));
                changed.insert(gone.clone());
            }
        }

        let origin = Origin::observation(method, source, result, task_id);
        if prior.as_ref() != Some(&origin) {
            view.push(Mutation::PutOrigin(origin));
        }
        Ok(())
    }

    /// Validate an incoming node, logging and skipping failures so one bad
    /// node never aborts its batch.
    fn admit(&self, node: &Node) -> Option<Reference> {
        match self.schema.reference_of(node) {
            Ok(reference) => Some(reference),
            Err(err) => {
                tracing::warn!(kind = node.kind(), error = %err, "invalid node skipped");
                None
            }
        }
    }

    /// Write a node only when its content actually differs; returns whether
    /// it was written.
    fn put_if_changed(
        &self,
        reference: &Reference,
        node: Node,
        view: &mut Overlay<'_>,
    ) -> ArgusResult<bool> {
        let differs = match view.get(reference, Timestamp::ZERO)? {
            None => true,
            Some(existing) => existing != node,
        };
        if differs {
            view.push(Mutation::PutNode {
                reference: reference.clone(),
                node,
            });
        }
        Ok(differs)
    }

    // -----------------------------------------------------------------------
    // Query / audit surface
    // -----------------------------------------------------------------------

    pub fn get(&self, reference: &Reference, at: Timestamp) -> ArgusResult<Option<Node>> {
        Ok(self.store.get(reference, at)?)
    }

    pub fn query(&self, query: &Query, at: Timestamp) -> ArgusResult<Vec<(Reference, Node)>> {
        Ok(self.store.query(query, at)?)
    }

    pub fn profile(&self, reference: &Reference, at: Timestamp) -> ArgusResult<ScanProfile> {
        Ok(self
            .store
            .profile(reference, at)?
            .unwrap_or(ScanProfile::Empty))
    }

    /// Why is this node trusted at its level: the winning inheritance hops.
    pub fn explain(&self, reference: &Reference, at: Timestamp) -> ArgusResult<Vec<Inheritance>> {
        Ok(match self.store.profile(reference, at)? {
            Some(ScanProfile::Inherited { inheritances, .. }) => inheritances,
            _ => Vec::new(),
        })
    }

    /// Which producers claim this node: the provenance records behind it.
    pub fn origins(&self, reference: &Reference, at: Timestamp) -> ArgusResult<Vec<Origin>> {
        Ok(self.store.origins_producing(reference, at)?)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("kinds", &self.schema.kinds().len())
            .field("rules", &self.rules.len())
            .field("persistent", &self.config.data_dir.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    fn network_node() -> Node {
        Node::new("Network").with_attr("name", "internet")
    }

    fn network_ref() -> Reference {
        Reference::from_tokens("Network", &["internet".to_string()])
    }

    #[test]
    fn declaration_creates_node_and_origin() {
        let engine = engine();
        let outcome = engine
            .process(
                vec![Event::Declaration {
                    node: network_node(),
                }],
                Timestamp::new(10),
            )
            .unwrap();

        assert_eq!(outcome.changed, vec![network_ref()]);
        assert!(engine.get(&network_ref(), Timestamp::new(10)).unwrap().is_some());
        let origins = engine.origins(&network_ref(), Timestamp::new(10)).unwrap();
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0].origin_type, OriginType::Declaration);
    }

    #[test]
    fn invalid_node_skipped_batch_continues() {
        let engine = engine();
        let outcome = engine
            .process(
                vec![
                    Event::Declaration {
                        node: Node::new("Network"), // missing name
                    },
                    Event::Declaration {
                        node: network_node(),
                    },
                ],
                Timestamp::new(10),
            )
            .unwrap();
        assert_eq!(outcome.changed.len(), 1);
    }

    #[test]
    fn observation_diffing_retracts_unseen_facts() {
        let engine = engine();
        let source = network_ref();

        let hostname = |name: &str| {
            Node::new("Hostname")
                .with_attr("network", network_ref())
                .with_attr("name", name)
        };

        engine
            .process(
                vec![Event::Observation {
                    method: "dns".into(),
                    source: source.clone(),
                    nodes: vec![hostname("a.com"), hostname("b.com")],
                    task_id: Some("task-1".into()),
                }],
                Timestamp::new(10),
            )
            .unwrap();
        assert_eq!(
            engine
                .query(&Query::all_of("Hostname"), Timestamp::new(10))
                .unwrap()
                .len(),
            2
        );

        // The second scan only sees a.com: b.com must be retracted.
        engine
            .process(
                vec![Event::Observation {
                    method: "dns".into(),
                    source,
                    nodes: vec![hostname("a.com")],
                    task_id: Some("task-2".into()),
                }],
                Timestamp::new(20),
            )
            .unwrap();
        let live = engine
            .query(&Query::all_of("Hostname"), Timestamp::new(20))
            .unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].0.to_string().contains("a.com"));
    }

    #[test]
    fn profile_declaration_propagates_and_retraction_reverts() {
        let engine = engine();
        let hostname_ref = Reference::from_tokens(
            "Hostname",
            &["internet".to_string(), "example.com".to_string()],
        );

        engine
            .process(
                vec![
                    Event::Declaration {
                        node: network_node(),
                    },
                    Event::Declaration {
                        node: Node::new("Hostname")
                            .with_attr("network", network_ref())
                            .with_attr("name", "example.com"),
                    },
                    Event::DeclareProfile {
                        reference: network_ref(),
                        level: ScanLevel::L3,
                    },
                ],
                Timestamp::new(10),
            )
            .unwrap();

        let profile = engine.profile(&hostname_ref, Timestamp::new(10)).unwrap();
        assert_eq!(profile.level(), ScanLevel::L2);
        let explanation = engine.explain(&hostname_ref, Timestamp::new(10)).unwrap();
        assert_eq!(explanation.len(), 1);
        assert_eq!(explanation[0].source, network_ref());

        engine
            .process(
                vec![Event::RetractProfile {
                    reference: network_ref(),
                }],
                Timestamp::new(20),
            )
            .unwrap();
        assert_eq!(
            engine.profile(&hostname_ref, Timestamp::new(20)).unwrap(),
            ScanProfile::Empty
        );
        assert!(engine.explain(&hostname_ref, Timestamp::new(20)).unwrap().is_empty());
    }

    #[test]
    fn delete_node_cascades_through_derived_facts() {
        let engine = engine();

        // Build up to a database-port finding.
        let address_ref = Reference::from_tokens(
            "IPAddress",
            &["internet".to_string(), "192.0.2.7".to_string()],
        );
        let port_ref = Reference::from_tokens(
            "IPPort",
            &[
                "internet".to_string(),
                "192.0.2.7".to_string(),
                "tcp".to_string(),
                "3306".to_string(),
            ],
        );
        engine
            .process(
                vec![
                    Event::Declaration {
                        node: network_node(),
                    },
                    Event::Declaration {
                        node: Node::new("IPAddress")
                            .with_attr("network", network_ref())
                            .with_attr("address", "192.0.2.7"),
                    },
                    Event::Declaration {
                        node: Node::new("IPPort")
                            .with_attr("address", address_ref)
                            .with_attr("protocol", "tcp")
                            .with_attr("port", 3306i64),
                    },
                ],
                Timestamp::new(10),
            )
            .unwrap();
        assert_eq!(
            engine
                .query(&Query::all_of("Finding"), Timestamp::new(10))
                .unwrap()
                .len(),
            1
        );

        // Deleting the port takes the finding with it.
        engine
            .process(
                vec![Event::DeleteNode {
                    reference: port_ref.clone(),
                }],
                Timestamp::new(20),
            )
            .unwrap();
        assert!(engine.get(&port_ref, Timestamp::new(20)).unwrap().is_none());
        assert!(
            engine
                .query(&Query::all_of("Finding"), Timestamp::new(20))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn affirmation_does_not_seed_derivation() {
        let engine = engine();
        engine
            .process(
                vec![Event::Declaration {
                    node: network_node(),
                }],
                Timestamp::new(10),
            )
            .unwrap();

        let outcome = engine
            .process(
                vec![Event::Affirmation {
                    reference: network_ref(),
                }],
                Timestamp::new(20),
            )
            .unwrap();
        assert!(outcome.changed.is_empty());
        assert!(outcome.derivation.is_empty_delta());
    }

    #[test]
    fn engine_info_reports_manifest_sizes() {
        let engine = engine();
        let info = engine.info();
        assert_eq!(info.kinds, 12);
        assert_eq!(info.rules, 3);
        assert!(!info.persistent);
        assert!(info.to_string().contains("argus engine info"));
    }
}
