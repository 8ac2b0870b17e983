//! Derivation rules ("nibbles"): typed signature + pure payload + binding
//! selectors.
//!
//! A rule declares exactly which kinds it binds and how candidates are
//! selected — the engine performs all kind filtering centrally, so payloads
//! never re-implement type checks. Payloads are pure functions over
//! already-fetched nodes; they receive `None` for optional positions with no
//! match and must tolerate it. The registry is populated at startup from the
//! static [`builtin_rules`] manifest, never via runtime discovery.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::RuleError;
use crate::node::{AttrValue, Node};
use crate::reference::Reference;
use crate::store::RelationPath;

/// A node bound into a rule invocation, with its identity.
#[derive(Debug, Clone)]
pub struct Bound {
    pub reference: Reference,
    pub node: Node,
}

/// How candidates for a parameter position are selected.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Every live node of the parameter's kind. Position 0 (the anchor) is
    /// always selected this way.
    AllOfKind,
    /// Nodes related to the anchor binding through `via`, optionally
    /// filtered by attribute equality.
    Related {
        via: RelationPath,
        matching: Option<(String, AttrValue)>,
    },
}

/// One position of a rule signature.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub kind: String,
    pub optional: bool,
    pub selector: Selector,
}

impl Parameter {
    pub fn required(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            optional: false,
            selector: Selector::AllOfKind,
        }
    }

    pub fn related(
        kind: impl Into<String>,
        via: RelationPath,
        matching: Option<(String, AttrValue)>,
    ) -> Self {
        Self {
            kind: kind.into(),
            optional: false,
            selector: Selector::Related { via, matching },
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Payload contract: pure function from the bound tuple to produced nodes.
/// `None` entries in the output are tolerated and flattened away.
pub type PayloadFn =
    dyn Fn(&[Option<Bound>]) -> Result<Vec<Option<Node>>, String> + Send + Sync;

/// A declarative derivation rule.
pub struct RuleDefinition {
    pub id: String,
    /// Author-maintained version tag mixed into the parameters hash;
    /// bumping it invalidates every memoized binding of this rule.
    pub checksum: String,
    pub signature: Vec<Parameter>,
    payload: Box<PayloadFn>,
}

impl RuleDefinition {
    pub fn new(
        id: impl Into<String>,
        checksum: impl Into<String>,
        signature: Vec<Parameter>,
        payload: impl Fn(&[Option<Bound>]) -> Result<Vec<Option<Node>>, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            checksum: checksum.into(),
            signature,
            payload: Box::new(payload),
        }
    }

    /// Positions in the signature that bind the given kind.
    pub fn positions_of(&self, kind: &str) -> Vec<usize> {
        self.signature
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == kind)
            .map(|(i, _)| i)
            .collect()
    }

    /// Invoke the payload for one binding, containing failures to this
    /// binding only. Panics are caught and surfaced as
    /// [`RuleError::Execution`]; output is flattened with `None`s removed.
    pub fn invoke(&self, args: &[Option<Bound>]) -> Result<Vec<Node>, RuleError> {
        let source = args
            .first()
            .and_then(|b| b.as_ref())
            .map(|b| b.reference.to_string())
            .unwrap_or_else(|| "<unbound>".into());

        let outcome = catch_unwind(AssertUnwindSafe(|| (self.payload)(args)));
        match outcome {
            Ok(Ok(produced)) => Ok(produced.into_iter().flatten().collect()),
            Ok(Err(message)) => Err(RuleError::Execution {
                rule: self.id.clone(),
                binding: source,
                message,
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "payload panicked".into());
                Err(RuleError::Execution {
                    rule: self.id.clone(),
                    binding: source,
                    message,
                })
            }
        }
    }
}

impl std::fmt::Debug for RuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleDefinition")
            .field("id", &self.id)
            .field("checksum", &self.checksum)
            .field("arity", &self.signature.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of derivation rules, keyed by id.
pub struct RuleRegistry {
    rules: Vec<Arc<RuleDefinition>>,
    by_id: HashMap<String, usize>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Create a registry pre-populated with the built-in manifest.
    pub fn with_builtins() -> Result<Self, RuleError> {
        let mut registry = Self::new();
        for rule in builtin_rules() {
            registry.register(rule)?;
        }
        Ok(registry)
    }

    /// Register a rule. The anchor position must be required and selected
    /// by kind; ids must be unique.
    pub fn register(&mut self, rule: RuleDefinition) -> Result<(), RuleError> {
        let anchored = rule
            .signature
            .first()
            .is_some_and(|p| !p.optional && matches!(p.selector, Selector::AllOfKind));
        if !anchored {
            return Err(RuleError::NoRequiredParameter {
                rule: rule.id.clone(),
            });
        }
        if self.by_id.contains_key(&rule.id) {
            return Err(RuleError::DuplicateRule {
                rule: rule.id.clone(),
            });
        }
        self.by_id.insert(rule.id.clone(), self.rules.len());
        self.rules.push(Arc::new(rule));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<RuleDefinition>, RuleError> {
        self.by_id
            .get(id)
            .map(|&i| Arc::clone(&self.rules[i]))
            .ok_or_else(|| RuleError::UnknownRule {
                rule: id.to_string(),
            })
    }

    /// All rules in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<RuleDefinition>> {
        self.rules.iter()
    }

    /// Rules whose signature mentions the given kind at any position.
    pub fn rules_mentioning(&self, kind: &str) -> Vec<Arc<RuleDefinition>> {
        self.rules
            .iter()
            .filter(|rule| rule.signature.iter().any(|p| p.kind == kind))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.rules.iter().map(|r| r.id.as_str()).collect();
        f.debug_struct("RuleRegistry").field("rules", &ids).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in manifest
// ---------------------------------------------------------------------------

fn finding(finding_type: &str, subject: &Reference) -> Vec<Option<Node>> {
    let type_ref = Reference::from_tokens("FindingType", &[finding_type.to_string()]);
    vec![
        Some(Node::new("FindingType").with_attr("id", finding_type)),
        Some(
            Node::new("Finding")
                .with_attr("finding_type", type_ref)
                .with_attr("ooi", AttrValue::any_ref(subject.clone())),
        ),
    ]
}

/// TCP ports that expose a database directly to the network.
const DATABASE_PORTS: [i64; 5] = [1433, 3306, 5432, 6379, 27017];

/// The rules shipped with the engine.
pub fn builtin_rules() -> Vec<RuleDefinition> {
    vec![
        // A website without a strict-transport-security header gets a
        // finding. The optional header position binds None when no such
        // header exists, which is exactly the signal.
        RuleDefinition::new(
            "missing-hsts",
            "v1",
            vec![
                Parameter::required("Website"),
                Parameter::related(
                    "HTTPHeader",
                    RelationPath::Incoming {
                        kind: "HTTPHeader".into(),
                        attr: "website".into(),
                    },
                    Some((
                        "key".into(),
                        AttrValue::from("strict-transport-security"),
                    )),
                )
                .optional(),
            ],
            |args| {
                let website = args[0].as_ref().ok_or("anchor missing")?;
                if args[1].is_none() {
                    Ok(finding("KAT-NO-HSTS", &website.reference))
                } else {
                    Ok(Vec::new())
                }
            },
        ),
        // Database ports reachable from the network are a finding on the
        // port itself.
        RuleDefinition::new(
            "open-database-port",
            "v1",
            vec![Parameter::required("IPPort")],
            |args| {
                let port = args[0].as_ref().ok_or("anchor missing")?;
                let protocol = port.node.attr("protocol").and_then(|v| v.as_text());
                let number = port.node.attr("port").and_then(|v| v.as_integer());
                match (protocol, number) {
                    (Some("tcp"), Some(n)) if DATABASE_PORTS.contains(&n) => {
                        Ok(finding("KAT-OPEN-DATABASE-PORT", &port.reference))
                    }
                    _ => Ok(Vec::new()),
                }
            },
        ),
        // Certificates past their validity window get a finding on the
        // certificate.
        RuleDefinition::new(
            "expired-certificate",
            "v1",
            vec![Parameter::required("Certificate")],
            |args| {
                let certificate = args[0].as_ref().ok_or("anchor missing")?;
                let days = certificate
                    .node
                    .attr("expires_in_days")
                    .and_then(|v| v.as_integer())
                    .ok_or("certificate has no expires_in_days")?;
                if days < 0 {
                    Ok(finding("KAT-CERTIFICATE-EXPIRED", &certificate.reference))
                } else {
                    Ok(Vec::new())
                }
            },
        ),
    ]
}
