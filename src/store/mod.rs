//! Graph store adapter: the contract the derivation engines consume.
//!
//! The physical storage engine is out of scope; both engines only require the
//! operations below — point lookups, 1-hop neighbour pulls, declarative join
//! queries anchored at known references, and transactional batched writes.
//! Two backends ship with the crate:
//!
//! - [`mem::MemStore`] — concurrent in-memory backend (DashMap + petgraph),
//!   the default for tests and embedded use
//! - [`durable::DurableStore`] — redb-backed ACID store with one write
//!   transaction per commit, so a derivation pass is atomic
//!
//! All records are bitemporal: callers supply valid time, the store records
//! transaction time at commit.

pub mod durable;
pub mod mem;
pub mod overlay;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::node::Node;
use crate::origin::Origin;
use crate::profile::{ScanLevel, ScanProfile};
use crate::reference::Reference;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Valid-time instant, seconds since the UNIX epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn new(secs: u64) -> Self {
        Timestamp(secs)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Timestamp(secs)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A 1-hop traversal direction for neighbour pulls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationPath {
    /// Follow this node's own relation attribute outward.
    Outgoing { attr: String },
    /// Back-reference: nodes of `kind` whose `attr` points at this node.
    Incoming { kind: String, attr: String },
}

impl std::fmt::Display for RelationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationPath::Outgoing { attr } => write!(f, "{attr}"),
            RelationPath::Incoming { kind, attr } => write!(f, "<-{kind}.{attr}"),
        }
    }
}

/// A declarative join query: all live nodes of `kind` whose anchor
/// attributes equal the given references. Zero anchors selects the whole
/// kind; rules use one or two anchors for partially-bound signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub kind: String,
    pub anchors: Vec<(String, Reference)>,
}

impl Query {
    pub fn all_of(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            anchors: Vec::new(),
        }
    }

    pub fn anchored(mut self, attr: impl Into<String>, reference: Reference) -> Self {
        self.anchors.push((attr.into(), reference));
        self
    }
}

/// One write in a commit batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    PutNode {
        reference: Reference,
        node: Node,
    },
    DeleteNode(Reference),
    PutProfile {
        reference: Reference,
        profile: ScanProfile,
    },
    DeleteProfile(Reference),
    PutOrigin(Origin),
    DeleteOrigin(String),
}

/// The store contract consumed by both engines.
///
/// Reads take a valid-time instant; writes are batched and atomic — either
/// the whole pass commits or nothing does.
pub trait GraphStore: Send + Sync {
    /// Point lookup of a node live at `at`.
    fn get(&self, reference: &Reference, at: Timestamp) -> StoreResult<Option<Node>>;

    /// 1-hop neighbour pull grouped by relation path.
    fn neighbours(
        &self,
        reference: &Reference,
        paths: &[RelationPath],
        at: Timestamp,
    ) -> StoreResult<HashMap<RelationPath, Vec<(Reference, Node)>>>;

    /// Declarative join query.
    fn query(&self, query: &Query, at: Timestamp) -> StoreResult<Vec<(Reference, Node)>>;

    /// The scan profile attached to a reference, if any.
    fn profile(&self, reference: &Reference, at: Timestamp) -> StoreResult<Option<ScanProfile>>;

    /// All references with a declared profile, with their levels.
    fn declared_profiles(&self, at: Timestamp) -> StoreResult<Vec<(Reference, ScanLevel)>>;

    /// Every live profile record (declared, inherited and empty).
    fn all_profiles(&self, at: Timestamp) -> StoreResult<Vec<(Reference, ScanProfile)>>;

    /// Ledger lookup by origin id.
    fn origin(&self, id: &str, at: Timestamp) -> StoreResult<Option<Origin>>;

    /// Origins whose source or parameters include the reference.
    fn origins_with_parameter(
        &self,
        reference: &Reference,
        at: Timestamp,
    ) -> StoreResult<Vec<Origin>>;

    /// Origins whose result set includes the reference.
    fn origins_producing(&self, reference: &Reference, at: Timestamp)
    -> StoreResult<Vec<Origin>>;

    /// Apply a batch of writes atomically at the given valid time.
    fn commit(&self, mutations: Vec<Mutation>, valid_time: Timestamp) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Backoff/retry discipline for store calls that may fail transiently.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a transient failure becomes permanent.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Deadline across all attempts of one logical call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Run a store operation under the retry policy.
///
/// Only [`StoreError::Transient`] is retried; every other error is
/// permanent and aborts the surrounding pass. Exceeding the deadline maps
/// to [`StoreError::Timeout`] so a hung store cannot stall tenant
/// processing indefinitely.
pub fn with_backoff<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let started = Instant::now();
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(StoreError::Transient { message, .. }) => {
                if started.elapsed() > policy.call_timeout {
                    return Err(StoreError::Timeout {
                        timeout_ms: policy.call_timeout.as_millis() as u64,
                    });
                }
                if attempt >= policy.max_attempts {
                    return Err(StoreError::Transient {
                        attempts: attempt,
                        message,
                    });
                }
                tracing::warn!(attempt, %message, "transient store error, backing off");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        };
        let mut calls = 0;
        let result = with_backoff(&policy, || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Transient {
                    attempts: 1,
                    message: "connection reset".into(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn backoff_caps_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        };
        let mut calls = 0;
        let result: StoreResult<()> = with_backoff(&policy, || {
            calls += 1;
            Err(StoreError::Transient {
                attempts: 1,
                message: "still down".into(),
            })
        });
        assert!(matches!(
            result,
            Err(StoreError::Transient { attempts: 2, .. })
        ));
        assert_eq!(calls, 2);
    }

    #[test]
    fn backoff_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: StoreResult<()> = with_backoff(&policy, || {
            calls += 1;
            Err(StoreError::NotFound {
                reference: "Network|internet".into(),
            })
        });
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn query_builder() {
        let network = Reference::from_tokens("Network", &["internet".to_string()]);
        let query = Query::all_of("Hostname").anchored("network", network.clone());
        assert_eq!(query.kind, "Hostname");
        assert_eq!(query.anchors, vec![("network".to_string(), network)]);
    }

    #[test]
    fn relation_path_display() {
        let outgoing = RelationPath::Outgoing {
            attr: "network".into(),
        };
        let incoming = RelationPath::Incoming {
            kind: "Hostname".into(),
            attr: "network".into(),
        };
        assert_eq!(outgoing.to_string(), "network");
        assert_eq!(incoming.to_string(), "<-Hostname.network");
    }
}
