//! Rich diagnostic error types for the argus engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the argus engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum ArgusError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("transient store error after {attempts} attempt(s): {message}")]
    #[diagnostic(
        code(argus::store::transient),
        help(
            "The graph store did not respond within the retry budget. \
             The derivation pass was aborted without committing partial state; \
             it is safe to re-dispatch the batch once the store recovers."
        )
    )]
    Transient { attempts: u32, message: String },

    #[error("store call exceeded timeout of {timeout_ms}ms")]
    #[diagnostic(
        code(argus::store::timeout),
        help(
            "A single store call ran past the configured deadline. \
             Increase `store_timeout` in EngineConfig if the store is \
             merely slow, or investigate the store if this persists."
        )
    )]
    Timeout { timeout_ms: u64 },

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(argus::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(argus::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption — try running with a fresh data directory. \
             If the problem persists, file a bug report."
        )
    )]
    Backend { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(argus::store::serde),
        help(
            "Failed to serialize or deserialize a stored record. \
             This usually means the stored data format has changed between versions. \
             Try re-ingesting your data."
        )
    )]
    Serialization { message: String },

    #[error("not found: {reference}")]
    #[diagnostic(
        code(argus::store::not_found),
        help("The requested reference does not exist at the given valid time.")
    )]
    NotFound { reference: String },
}

// ---------------------------------------------------------------------------
// Model errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ModelError {
    #[error("unknown kind: {kind}")]
    #[diagnostic(
        code(argus::model::unknown_kind),
        help(
            "No schema is registered for this kind. Register a KindSchema \
             with the SchemaRegistry before creating nodes of this kind."
        )
    )]
    UnknownKind { kind: String },

    #[error("kind already registered: {kind}")]
    #[diagnostic(
        code(argus::model::duplicate_kind),
        help("Kind schemas are registered once, from the static manifest.")
    )]
    DuplicateKind { kind: String },

    #[error("validation failed for {kind}.{field}: {message}")]
    #[diagnostic(
        code(argus::model::validation),
        help(
            "The node does not satisfy its kind's attribute constraints. \
             The offending node is skipped; the rest of the batch continues."
        )
    )]
    Validation {
        kind: String,
        field: String,
        message: String,
    },

    #[error("identity conflict on {reference}: expected kind {expected}, got {actual}")]
    #[diagnostic(
        code(argus::model::identity_conflict),
        help(
            "Two producers disagree on the shape of the node behind this \
             reference. This is surfaced rather than auto-resolved; inspect \
             both producers and fix the one emitting the wrong kind."
        )
    )]
    IdentityConflict {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("unparseable reference \"{reference}\": {message}")]
    #[diagnostic(
        code(argus::model::parse),
        help(
            "The identity string could not be tokenized against its kind's \
             schema. References produced by this engine always parse; a \
             failure here means the string was hand-built or the schema \
             changed incompatibly."
        )
    )]
    Parse { reference: String, message: String },

    #[error("invalid scan level {level} (must be 0..=4)")]
    #[diagnostic(
        code(argus::model::scan_level),
        help("Scan levels range from L0 (do not scan) to L4 (intrusive).")
    )]
    InvalidScanLevel { level: u8 },
}

// ---------------------------------------------------------------------------
// Rule errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RuleError {
    #[error("rule \"{rule}\" failed for source {binding}: {message}")]
    #[diagnostic(
        code(argus::rule::execution),
        help(
            "The rule payload failed for this binding only. Its previous \
             origin is left untouched so stale derived facts are not \
             silently dropped; the binding is retried on the next change \
             to any of its inputs."
        )
    )]
    Execution {
        rule: String,
        binding: String,
        message: String,
    },

    #[error("unknown rule: {rule}")]
    #[diagnostic(
        code(argus::rule::unknown),
        help("No rule with this id is registered. Check the rule manifest.")
    )]
    UnknownRule { rule: String },

    #[error("duplicate rule id: {rule}")]
    #[diagnostic(
        code(argus::rule::duplicate),
        help("Rule ids must be unique across the manifest.")
    )]
    DuplicateRule { rule: String },

    #[error("rule \"{rule}\" has no required parameter")]
    #[diagnostic(
        code(argus::rule::no_required),
        help(
            "A rule signature needs at least one required (non-optional) \
             parameter to anchor candidate bindings."
        )
    )]
    NoRequiredParameter { rule: String },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("fixpoint budget exceeded after {iterations} iterations")]
    #[diagnostic(
        code(argus::engine::fixpoint_budget),
        help(
            "The derivation pass did not reach a fixpoint within the \
             configured iteration budget. This usually means a rule payload \
             is not referentially transparent (same inputs, different \
             outputs). The batch was aborted; nothing was committed."
        )
    )]
    FixpointBudgetExceeded { iterations: usize },

    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(argus::engine::invalid_config),
        help("Check the EngineConfig fields. {message}")
    )]
    InvalidConfig { message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(argus::engine::data_dir),
        help(
            "The data directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },
}

/// Convenience alias for functions returning argus results.
pub type ArgusResult<T> = std::result::Result<T, ArgusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_to_argus_error() {
        let err = StoreError::NotFound {
            reference: "Hostname|internet|example.com".into(),
        };
        let argus: ArgusError = err.into();
        assert!(matches!(argus, ArgusError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn rule_error_converts_to_argus_error() {
        let err = RuleError::UnknownRule {
            rule: "missing-hsts".into(),
        };
        let argus: ArgusError = err.into();
        assert!(matches!(argus, ArgusError::Rule(RuleError::UnknownRule { .. })));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = ModelError::IdentityConflict {
            reference: "Hostname|internet|example.com".into(),
            expected: "Hostname".into(),
            actual: "IPAddress".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Hostname|internet|example.com"));
        assert!(msg.contains("IPAddress"));
    }

    #[test]
    fn fixpoint_budget_mentions_iterations() {
        let err = EngineError::FixpointBudgetExceeded { iterations: 10_000 };
        assert!(format!("{err}").contains("10000"));
    }
}
