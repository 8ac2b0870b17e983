//! # argus
//!
//! A security-scanning knowledge-graph engine: scanners and parsers feed
//! typed facts about hosts, services and certificates into a shared
//! bitemporal object graph, and a derivation layer continuously infers new
//! facts and propagates trust levels across the graph.
//!
//! ## Architecture
//!
//! - **Identity model** (`reference`, `schema`, `node`): content-derived,
//!   recursively parseable node identities driven by static kind schemas
//! - **Graph store** (`store`): bitemporal store contract with in-memory
//!   (DashMap + petgraph) and durable (redb) backends
//! - **Provenance** (`origin`, `support`): which rule, given which inputs,
//!   produced which outputs — plus the retraction cascade over it
//! - **Rule engine** (`rule`, `infer`): worklist-driven fixpoint evaluation
//!   of declarative derivation rules with content-hash memoization
//! - **Trust propagation** (`profile`, `propagate`): clamped, explainable
//!   scan-level inheritance with deterministic tie-breaking
//! - **Dispatch** (`dispatch`, `engine`): per-tenant serialized batch
//!   processing, tenants in parallel
//!
//! ## Library usage
//!
//! ```no_run
//! use argus::engine::{Engine, EngineConfig, Event};
//! use argus::node::Node;
//! use argus::profile::ScanLevel;
//! use argus::reference::Reference;
//! use argus::store::Timestamp;
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! let network = Reference::from_tokens("Network", &["internet".to_string()]);
//! engine
//!     .process(
//!         vec![
//!             Event::Declaration {
//!                 node: Node::new("Network").with_attr("name", "internet"),
//!             },
//!             Event::DeclareProfile {
//!                 reference: network.clone(),
//!                 level: ScanLevel::L2,
//!             },
//!         ],
//!         Timestamp::now(),
//!     )
//!     .unwrap();
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod infer;
pub mod kinds;
pub mod node;
pub mod origin;
pub mod profile;
pub mod propagate;
pub mod reference;
pub mod rule;
pub mod schema;
pub mod store;
pub mod support;
