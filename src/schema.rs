//! Static per-kind schemas and the schema registry.
//!
//! A [`KindSchema`] declares a kind's attributes, its ordered natural-key
//! fields, and the trust clamps on each relation. The registry uses these
//! descriptors for three things: validating incoming nodes, serializing a
//! node's identity, and parsing an identity string back into a typed token
//! tree by recursive descent — no runtime type inspection anywhere.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::node::{AttrValue, Node};
use crate::profile::ScanLevel;
use crate::reference::{Reference, ReferenceTree, Token};

/// Guard against accidental cycles in natural-key relation chains.
const MAX_KEY_DEPTH: usize = 32;

/// Declared type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Text,
    Integer,
    Boolean,
    /// Typed relation: the target kind is fixed by the schema.
    Ref { target: String },
    /// Untyped relation: the target kind travels with the value.
    AnyRef,
}

/// Descriptor for a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDescriptor {
    pub ty: AttrType,
    pub required: bool,
}

/// Trust clamps on a relation attribute.
///
/// `max_issue_level` caps the level this relation may grant outward;
/// `max_inherit_level` caps the level it may receive. The asymmetry is what
/// prevents, say, a low-trust IP address from escalating a hostname's trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    /// Attribute name the relation lives on.
    pub attr: String,
    /// Target kind, or `"*"` for untyped relations.
    pub target: String,
    pub max_issue_level: ScanLevel,
    pub max_inherit_level: ScanLevel,
}

/// Schema of one node kind: attributes, natural-key order, relation clamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSchema {
    kind: String,
    natural_key: Vec<String>,
    attrs: BTreeMap<String, AttrDescriptor>,
    relations: BTreeMap<String, RelationSchema>,
}

impl KindSchema {
    /// Start a schema for the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            natural_key: Vec::new(),
            attrs: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Declare a required scalar attribute.
    pub fn attr(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.attrs
            .insert(name.into(), AttrDescriptor { ty, required: true });
        self
    }

    /// Declare an optional scalar attribute.
    pub fn optional_attr(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.attrs
            .insert(name.into(), AttrDescriptor { ty, required: false });
        self
    }

    /// Declare a required typed relation with its trust clamps.
    pub fn relation(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        max_issue_level: ScanLevel,
        max_inherit_level: ScanLevel,
    ) -> Self {
        let name = name.into();
        let target = target.into();
        self.attrs.insert(
            name.clone(),
            AttrDescriptor {
                ty: AttrType::Ref {
                    target: target.clone(),
                },
                required: true,
            },
        );
        self.relations.insert(
            name.clone(),
            RelationSchema {
                attr: name,
                target,
                max_issue_level,
                max_inherit_level,
            },
        );
        self
    }

    /// Declare a required untyped relation with its trust clamps.
    pub fn any_relation(
        mut self,
        name: impl Into<String>,
        max_issue_level: ScanLevel,
        max_inherit_level: ScanLevel,
    ) -> Self {
        let name = name.into();
        self.attrs.insert(
            name.clone(),
            AttrDescriptor {
                ty: AttrType::AnyRef,
                required: true,
            },
        );
        self.relations.insert(
            name.clone(),
            RelationSchema {
                attr: name,
                target: "*".into(),
                max_issue_level,
                max_inherit_level,
            },
        );
        self
    }

    /// Declare the ordered natural-key fields.
    pub fn natural_key(mut self, fields: &[&str]) -> Self {
        self.natural_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key_fields(&self) -> &[String] {
        &self.natural_key
    }

    pub fn attr_descriptor(&self, name: &str) -> Option<&AttrDescriptor> {
        self.attrs.get(name)
    }

    /// All declared relations in attribute-name order.
    pub fn relations(&self) -> impl Iterator<Item = &RelationSchema> {
        self.relations.values()
    }

    pub fn relation_schema(&self, attr: &str) -> Option<&RelationSchema> {
        self.relations.get(attr)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent registry of kind schemas, populated once at startup from a
/// static manifest.
pub struct SchemaRegistry {
    kinds: DashMap<String, Arc<KindSchema>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            kinds: DashMap::new(),
        }
    }

    /// Register a kind schema. Errors on duplicates and on natural-key fields
    /// that are missing or optional — identity components must always exist.
    pub fn register(&self, schema: KindSchema) -> Result<(), ModelError> {
        if schema.natural_key.is_empty() {
            return Err(ModelError::Validation {
                kind: schema.kind.clone(),
                field: "<natural_key>".into(),
                message: "a kind must declare at least one natural-key field".into(),
            });
        }
        for field in &schema.natural_key {
            match schema.attrs.get(field) {
                None => {
                    return Err(ModelError::Validation {
                        kind: schema.kind.clone(),
                        field: field.clone(),
                        message: "natural-key field is not a declared attribute".into(),
                    });
                }
                Some(desc) if !desc.required => {
                    return Err(ModelError::Validation {
                        kind: schema.kind.clone(),
                        field: field.clone(),
                        message: "natural-key fields must be required".into(),
                    });
                }
                Some(_) => {}
            }
        }
        if self.kinds.contains_key(&schema.kind) {
            return Err(ModelError::DuplicateKind {
                kind: schema.kind.clone(),
            });
        }
        self.kinds.insert(schema.kind.clone(), Arc::new(schema));
        Ok(())
    }

    /// Look up the schema for a kind.
    pub fn get(&self, kind: &str) -> Result<Arc<KindSchema>, ModelError> {
        self.kinds
            .get(kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ModelError::UnknownKind {
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// All registered kind names.
    pub fn kinds(&self) -> Vec<String> {
        self.kinds.iter().map(|entry| entry.key().clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate a node against its kind's schema.
    pub fn validate(&self, node: &Node) -> Result<(), ModelError> {
        let schema = self.get(node.kind())?;

        for (name, desc) in &schema.attrs {
            match node.attr(name) {
                None if desc.required => {
                    return Err(ModelError::Validation {
                        kind: schema.kind.clone(),
                        field: name.clone(),
                        message: "required attribute missing".into(),
                    });
                }
                None => {}
                Some(value) => self.check_type(&schema.kind, name, &desc.ty, value)?,
            }
        }

        for (name, _) in node.attrs() {
            if !schema.attrs.contains_key(name) {
                return Err(ModelError::Validation {
                    kind: schema.kind.clone(),
                    field: name.to_string(),
                    message: "undeclared attribute".into(),
                });
            }
        }

        Ok(())
    }

    fn check_type(
        &self,
        kind: &str,
        field: &str,
        ty: &AttrType,
        value: &AttrValue,
    ) -> Result<(), ModelError> {
        let mismatch = |expected: &str| ModelError::Validation {
            kind: kind.to_string(),
            field: field.to_string(),
            message: format!("expected {expected}, got {}", value.type_name()),
        };
        match ty {
            AttrType::Text => value.as_text().map(|_| ()).ok_or_else(|| mismatch("text")),
            AttrType::Integer => value
                .as_integer()
                .map(|_| ())
                .ok_or_else(|| mismatch("integer")),
            AttrType::Boolean => value
                .as_boolean()
                .map(|_| ())
                .ok_or_else(|| mismatch("boolean")),
            AttrType::Ref { target } => match value {
                AttrValue::Ref(reference) if reference.kind() == target => Ok(()),
                AttrValue::Ref(reference) => Err(ModelError::IdentityConflict {
                    reference: reference.to_string(),
                    expected: target.clone(),
                    actual: reference.kind().to_string(),
                }),
                _ => Err(mismatch("ref")),
            },
            AttrType::AnyRef => match value {
                AttrValue::AnyRef(_) => Ok(()),
                _ => Err(mismatch("any-ref")),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Identity serialization
    // -----------------------------------------------------------------------

    /// Compute a node's content-derived identity.
    ///
    /// Relation key fields contribute the referenced identity's own tokens
    /// (already embedded in the [`Reference`]), so no store round-trip is
    /// needed.
    pub fn reference_of(&self, node: &Node) -> Result<Reference, ModelError> {
        self.validate(node)?;
        let schema = self.get(node.kind())?;

        let mut tokens = Vec::new();
        for field in &schema.natural_key {
            let value = node.attr(field).ok_or_else(|| ModelError::Validation {
                kind: schema.kind.clone(),
                field: field.clone(),
                message: "natural-key attribute missing".into(),
            })?;
            match value {
                AttrValue::Text(text) => tokens.push(text.clone()),
                AttrValue::Integer(n) => tokens.push(n.to_string()),
                AttrValue::Boolean(b) => tokens.push(b.to_string()),
                AttrValue::Ref(reference) => tokens.extend(reference.tokens()),
                AttrValue::AnyRef(reference) => tokens.push(reference.to_string()),
            }
        }
        Ok(Reference::from_tokens(node.kind(), &tokens))
    }

    // -----------------------------------------------------------------------
    // Identity parsing (recursive descent)
    // -----------------------------------------------------------------------

    /// Parse an identity string into a typed token tree.
    ///
    /// Total over every identity this registry can produce: re-serializing
    /// the returned tree reproduces the input exactly.
    pub fn parse(&self, identity: &str) -> Result<ReferenceTree, ModelError> {
        let reference = Reference::parse(identity)?;
        let tokens = reference.tokens();
        let mut pos = 0;
        let parsed = self.descend(reference.kind(), &tokens, &mut pos, 0, identity)?;
        if pos != tokens.len() {
            return Err(ModelError::Parse {
                reference: identity.to_string(),
                message: format!("trailing tokens after position {pos}"),
            });
        }
        Ok(ReferenceTree {
            kind: reference.kind().to_string(),
            tokens: parsed,
        })
    }

    fn descend(
        &self,
        kind: &str,
        tokens: &[String],
        pos: &mut usize,
        depth: usize,
        identity: &str,
    ) -> Result<Vec<Token>, ModelError> {
        if depth > MAX_KEY_DEPTH {
            return Err(ModelError::Parse {
                reference: identity.to_string(),
                message: "natural-key recursion exceeds depth limit".into(),
            });
        }
        let schema = self.get(kind)?;
        let mut out = Vec::with_capacity(schema.natural_key.len());

        for field in &schema.natural_key {
            let desc = schema
                .attrs
                .get(field)
                .expect("registration checked key fields");
            match &desc.ty {
                AttrType::Text | AttrType::Integer | AttrType::Boolean => {
                    let token = take_token(tokens, pos, identity, field)?;
                    out.push(Token::Text(token));
                }
                AttrType::Ref { target } => {
                    let inner = self.descend(target, tokens, pos, depth + 1, identity)?;
                    out.push(Token::Nested {
                        kind: target.clone(),
                        tokens: inner,
                    });
                }
                AttrType::AnyRef => {
                    let token = take_token(tokens, pos, identity, field)?;
                    let tree = self.parse(&token)?;
                    out.push(Token::Foreign {
                        kind: tree.kind,
                        tokens: tree.tokens,
                    });
                }
            }
        }
        Ok(out)
    }
}

fn take_token(
    tokens: &[String],
    pos: &mut usize,
    identity: &str,
    field: &str,
) -> Result<String, ModelError> {
    let token = tokens.get(*pos).cloned().ok_or_else(|| ModelError::Parse {
        reference: identity.to_string(),
        message: format!("ran out of tokens at field \"{field}\""),
    })?;
    *pos += 1;
    Ok(token)
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("kinds", &self.kinds.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .register(
                KindSchema::new("Network")
                    .attr("name", AttrType::Text)
                    .natural_key(&["name"]),
            )
            .unwrap();
        registry
            .register(
                KindSchema::new("Hostname")
                    .relation("network", "Network", ScanLevel::L4, ScanLevel::L2)
                    .attr("name", AttrType::Text)
                    .natural_key(&["network", "name"]),
            )
            .unwrap();
        registry
            .register(
                KindSchema::new("Finding")
                    .any_relation("ooi", ScanLevel::L0, ScanLevel::L4)
                    .attr("finding_type", AttrType::Text)
                    .natural_key(&["finding_type", "ooi"]),
            )
            .unwrap();
        registry
    }

    fn network_ref() -> Reference {
        Reference::from_tokens("Network", &["internet".to_string()])
    }

    fn hostname_node() -> Node {
        Node::new("Hostname")
            .with_attr("network", network_ref())
            .with_attr("name", "example.com")
    }

    #[test]
    fn register_rejects_bad_natural_keys() {
        let registry = SchemaRegistry::new();
        let missing = KindSchema::new("Broken")
            .attr("name", AttrType::Text)
            .natural_key(&["nope"]);
        assert!(registry.register(missing).is_err());

        let optional = KindSchema::new("Broken")
            .optional_attr("name", AttrType::Text)
            .natural_key(&["name"]);
        assert!(registry.register(optional).is_err());

        let empty = KindSchema::new("Broken").attr("name", AttrType::Text);
        assert!(registry.register(empty).is_err());
    }

    #[test]
    fn duplicate_kind_rejected() {
        let registry = test_registry();
        let again = KindSchema::new("Network")
            .attr("name", AttrType::Text)
            .natural_key(&["name"]);
        assert!(matches!(
            registry.register(again),
            Err(ModelError::DuplicateKind { .. })
        ));
    }

    #[test]
    fn validate_accepts_well_formed_node() {
        let registry = test_registry();
        registry.validate(&hostname_node()).unwrap();
    }

    #[test]
    fn validate_rejects_missing_required() {
        let registry = test_registry();
        let node = Node::new("Hostname").with_attr("name", "example.com");
        let err = registry.validate(&node).unwrap_err();
        assert!(matches!(err, ModelError::Validation { .. }));
    }

    #[test]
    fn validate_rejects_undeclared_attribute() {
        let registry = test_registry();
        let node = hostname_node().with_attr("bogus", "x");
        assert!(registry.validate(&node).is_err());
    }

    #[test]
    fn validate_surfaces_identity_conflict() {
        let registry = test_registry();
        let wrong = Reference::from_tokens("Hostname", &["internet".into(), "a.com".into()]);
        let node = Node::new("Hostname")
            .with_attr("network", wrong)
            .with_attr("name", "example.com");
        let err = registry.validate(&node).unwrap_err();
        assert!(matches!(err, ModelError::IdentityConflict { .. }));
    }

    #[test]
    fn reference_of_expands_nested_keys() {
        let registry = test_registry();
        let reference = registry.reference_of(&hostname_node()).unwrap();
        assert_eq!(reference.to_string(), "Hostname|internet|example.com");
    }

    #[test]
    fn parse_round_trips_nested_identity() {
        let registry = test_registry();
        let reference = registry.reference_of(&hostname_node()).unwrap();

        let tree = registry.parse(&reference.to_string()).unwrap();
        assert_eq!(tree.kind, "Hostname");
        assert_eq!(tree.tokens.len(), 2);
        assert!(matches!(&tree.tokens[0], Token::Nested { kind, .. } if kind == "Network"));

        // Identity determinism: re-serializing reproduces the input exactly.
        assert_eq!(tree.reference().to_string(), reference.to_string());
    }

    #[test]
    fn parse_round_trips_foreign_reference() {
        let registry = test_registry();
        let hostname = registry.reference_of(&hostname_node()).unwrap();
        let finding = Node::new("Finding")
            .with_attr("finding_type", "KAT-NO-HSTS")
            .with_attr("ooi", AttrValue::any_ref(hostname.clone()));

        let reference = registry.reference_of(&finding).unwrap();
        let tree = registry.parse(&reference.to_string()).unwrap();
        assert!(matches!(&tree.tokens[1], Token::Foreign { kind, .. } if kind == "Hostname"));
        assert_eq!(tree.reference().to_string(), reference.to_string());
    }

    #[test]
    fn parse_rejects_wrong_arity() {
        let registry = test_registry();
        assert!(registry.parse("Hostname|internet").is_err());
        assert!(registry.parse("Hostname|internet|a.com|extra").is_err());
        assert!(registry.parse("Unknown|x").is_err());
    }
}
