//! Typed graph vertices.
//!
//! A [`Node`] is a kind discriminant plus an ordered attribute map. Relation
//! attributes hold [`Reference`]s to other nodes; everything else is a scalar.
//! Nodes compare by content, which is what lets the derivation worklist admit
//! only entries that actually changed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::reference::Reference;

/// An attribute value on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    /// A typed relation: the schema declares which kind the target must be.
    Ref(Reference),
    /// An untyped relation to a node of any kind (used by findings).
    AnyRef(Reference),
}

impl AttrValue {
    /// Build an untyped relation value.
    pub fn any_ref(reference: Reference) -> Self {
        AttrValue::AnyRef(reference)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttrValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// The referenced identity, for both typed and untyped relations.
    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            AttrValue::Ref(reference) | AttrValue::AnyRef(reference) => Some(reference),
            _ => None,
        }
    }

    /// Short type tag for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Text(_) => "text",
            AttrValue::Integer(_) => "integer",
            AttrValue::Boolean(_) => "boolean",
            AttrValue::Ref(_) => "ref",
            AttrValue::AnyRef(_) => "any-ref",
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Integer(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Boolean(value)
    }
}

impl From<Reference> for AttrValue {
    fn from(value: Reference) -> Self {
        AttrValue::Ref(value)
    }
}

/// A typed vertex in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    kind: String,
    attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    /// Create an empty node of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Set or replace an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// The kind discriminant.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Look up an attribute by name.
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// All attributes in name order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All relation attributes (typed and untyped) in name order.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.attrs
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|r| (name.as_str(), r)))
    }

    /// JSON rendering for the audit/export surface.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("kind".into(), serde_json::Value::String(self.kind.clone()));
        for (name, value) in &self.attrs {
            let rendered = match value {
                AttrValue::Text(text) => serde_json::Value::String(text.clone()),
                AttrValue::Integer(n) => serde_json::Value::from(*n),
                AttrValue::Boolean(b) => serde_json::Value::from(*b),
                AttrValue::Ref(r) | AttrValue::AnyRef(r) => {
                    serde_json::Value::String(r.to_string())
                }
            };
            map.insert(name.clone(), rendered);
        }
        serde_json::Value::Object(map)
    }
}
