//! Provenance ledger records.
//!
//! Every producer of graph facts leaves an [`Origin`]: which rule or scan,
//! given which inputs, produced which outputs. Origins are keyed by
//! `(origin_type, method, source)` and overwritten on each run; the engine
//! compares `parameters_hash` to skip unchanged bindings and diffs `result`
//! to retract outputs no longer produced.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::reference::Reference;

/// Which class of producer wrote a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OriginType {
    /// A human/API declaration.
    Declaration,
    /// A scanner observation.
    Observation,
    /// A derived fact from a non-rule inference step.
    Inference,
    /// A derivation-rule (nibble) output.
    Nibblet,
}

impl std::fmt::Display for OriginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginType::Declaration => write!(f, "declaration"),
            OriginType::Observation => write!(f, "observation"),
            OriginType::Inference => write!(f, "inference"),
            OriginType::Nibblet => write!(f, "nibblet"),
        }
    }
}

/// One provenance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub origin_type: OriginType,
    /// Rule id for nibblets; scanner method name for observations.
    pub method: String,
    /// The input the producer was anchored on.
    pub source: Reference,
    /// Everything this producer currently yields for this source.
    pub result: Vec<Reference>,
    /// Content hash of the bound argument tuple plus the rule checksum.
    /// `None` for non-rule origins.
    pub parameters_hash: Option<String>,
    /// All references bound into the argument tuple (including optional
    /// positions that resolved to a node).
    pub parameters: Vec<Reference>,
    /// Scheduler task that produced an observation, if any.
    pub task_id: Option<String>,
}

impl Origin {
    /// Ledger key: one active origin per `(origin_type, method, source)`.
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.origin_type, self.method, self.source)
    }

    /// Build a declaration origin for a single node.
    pub fn declaration(reference: Reference) -> Self {
        Self {
            origin_type: OriginType::Declaration,
            method: "declaration".into(),
            source: reference.clone(),
            result: vec![reference],
            parameters_hash: None,
            parameters: Vec::new(),
            task_id: None,
        }
    }

    /// Build an observation origin for a scan result.
    pub fn observation(
        method: impl Into<String>,
        source: Reference,
        result: Vec<Reference>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            origin_type: OriginType::Observation,
            method: method.into(),
            source,
            result,
            parameters_hash: None,
            parameters: Vec::new(),
            task_id,
        }
    }

    /// Whether this origin lists the given reference among its inputs.
    pub fn is_parameterized_by(&self, reference: &Reference) -> bool {
        self.source == *reference || self.parameters.contains(reference)
    }
}

/// Content hash of a rule binding: the serialized argument tuple(s) plus the
/// rule's checksum, so bumping a rule's logic invalidates its memoized
/// bindings. Hex SHA-256 — the value is persisted, so it must be stable
/// across processes.
pub fn parameters_hash<T: Serialize>(
    args: &T,
    rule_checksum: &str,
) -> Result<String, StoreError> {
    let encoded = bincode::serialize(args).map_err(|e| StoreError::Serialization {
        message: format!("failed to serialize rule binding: {e}"),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hasher.update(rule_checksum.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
