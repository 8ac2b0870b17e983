//! Content-derived node identities.
//!
//! Every node's identity is `kind + "|" + natural_key`, where the natural key
//! is the ordered concatenation of the kind's declared key fields. Relation
//! fields contribute the referenced node's own key tokens recursively, so two
//! scans observing the same real-world fact produce the same identity and
//! merge instead of duplicating.
//!
//! Tokens are escaped (`\|` and `\\`) so tokenization is lossless and total:
//! any identity ever produced parses back into a typed token tree without a
//! store round-trip. The schema-driven parse itself lives in [`crate::schema`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Escape a raw token so it can be embedded in an identity string.
pub(crate) fn escape_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            other => out.push(other),
        }
    }
    out
}

/// Split an identity string on unescaped `|` separators, unescaping each token.
pub(crate) fn split_tokens(joined: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = joined.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                // An escape at end-of-input keeps the backslash literally.
                match chars.next() {
                    Some(next) => current.push(next),
                    None => current.push('\\'),
                }
            }
            '|' => {
                tokens.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    tokens.push(current);
    tokens
}

/// Content-derived, recursively parseable identity of a graph node.
///
/// Stored as the kind plus the escaped natural-key remainder, so equality,
/// hashing and ordering are all plain string operations. Serialized as the
/// full identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    kind: String,
    key: String,
}

impl Reference {
    /// Build a reference from a kind and already-unescaped key tokens.
    pub fn from_tokens(kind: impl Into<String>, tokens: &[String]) -> Self {
        let key = tokens
            .iter()
            .map(|t| escape_token(t))
            .collect::<Vec<_>>()
            .join("|");
        Self {
            kind: kind.into(),
            key,
        }
    }

    /// Parse an identity string of the form `kind|token|token|…`.
    ///
    /// Only the leading kind segment is validated here; typed tokenization of
    /// the key against the kind's schema is [`crate::schema::SchemaRegistry::parse`].
    pub fn parse(identity: &str) -> Result<Self, ModelError> {
        let mut parts = split_tokens(identity);
        if parts.len() < 2 || parts[0].is_empty() {
            return Err(ModelError::Parse {
                reference: identity.to_string(),
                message: "expected `kind|natural_key`".into(),
            });
        }
        let kind = parts.remove(0);
        Ok(Self::from_tokens(kind, &parts))
    }

    /// The node kind this reference points at.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The escaped natural-key remainder (everything after the kind segment).
    pub fn natural_key(&self) -> &str {
        &self.key
    }

    /// The unescaped key tokens in declaration order.
    pub fn tokens(&self) -> Vec<String> {
        if self.key.is_empty() {
            return Vec::new();
        }
        split_tokens(&self.key)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", escape_token(&self.kind), self.key)
    }
}

impl Serialize for Reference {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Reference::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Token tree
// ---------------------------------------------------------------------------

/// One node of a parsed identity: either a scalar key field or a nested
/// reference expanded into its own tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Token {
    /// A scalar natural-key field value.
    Text(String),
    /// A typed relation field, expanded inline into the referenced kind's
    /// key tokens.
    Nested { kind: String, tokens: Vec<Token> },
    /// An untyped relation field: the referenced node's full identity is
    /// carried as a single escaped token, so the target kind travels with
    /// the value instead of the schema.
    Foreign { kind: String, tokens: Vec<Token> },
}

/// Fully typed parse of an identity string: the kind plus one [`Token`] per
/// declared natural-key field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTree {
    pub kind: String,
    pub tokens: Vec<Token>,
}

impl ReferenceTree {
    /// Flatten the tree back into flat key tokens, in declaration order.
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        for token in &self.tokens {
            flatten_into(token, &mut out);
        }
        out
    }

    /// Re-serialize the tree into the exact identity string it was parsed from.
    pub fn reference(&self) -> Reference {
        Reference::from_tokens(self.kind.clone(), &self.flatten())
    }
}

fn flatten_into(token: &Token, out: &mut Vec<String>) {
    match token {
        Token::Text(text) => out.push(text.clone()),
        Token::Nested { tokens, .. } => {
            for inner in tokens {
                flatten_into(inner, out);
            }
        }
        Token::Foreign { kind, tokens } => {
            let mut inner = Vec::new();
            for token in tokens {
                flatten_into(token, &mut inner);
            }
            out.push(Reference::from_tokens(kind.clone(), &inner).to_string());
        }
    }
}
