//! Scan profiles: trust/clearance levels attached to graph nodes.
//!
//! A profile is either absent, declared by a human or the API, or inherited
//! through the graph. Declared levels are authoritative input; inherited
//! profiles are always fully recomputed output and carry the winning
//! [`Inheritance`] hops that explain where each level came from.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::reference::Reference;

/// A clearance level from L0 (do not scan) to L4 (intrusive scanning allowed).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ScanLevel(u8);

impl ScanLevel {
    pub const L0: ScanLevel = ScanLevel(0);
    pub const L1: ScanLevel = ScanLevel(1);
    pub const L2: ScanLevel = ScanLevel(2);
    pub const L3: ScanLevel = ScanLevel(3);
    pub const L4: ScanLevel = ScanLevel(4);

    /// Construct a level, rejecting values outside 0..=4.
    pub fn new(raw: u8) -> Result<Self, ModelError> {
        if raw > 4 {
            return Err(ModelError::InvalidScanLevel { level: raw });
        }
        Ok(ScanLevel(raw))
    }

    /// The raw numeric level.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ScanLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One explanatory hop of an inherited level.
///
/// `source` is the node whose declared profile ultimately supplies the level,
/// `parent` the immediate neighbour it arrived through, `depth` the path
/// length from the source. An inherited profile carries one winning hop per
/// distinct source, which is what makes "why is this trusted at L2"
/// answerable without replaying the propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inheritance {
    pub parent: Reference,
    pub source: Reference,
    pub level: ScanLevel,
    pub depth: usize,
}

/// The trust/clearance state of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanProfile {
    /// No profile: the node is neither declared nor reachable from a
    /// declared node.
    Empty,
    /// Authoritative human/API input. Never overwritten by inheritance.
    Declared { level: ScanLevel },
    /// Fully recomputed output of the propagator: the effective level plus
    /// the winning hop per contributing source.
    Inherited {
        level: ScanLevel,
        inheritances: Vec<Inheritance>,
    },
}

impl ScanProfile {
    /// The effective level of this profile, `L0` when empty.
    pub fn level(&self) -> ScanLevel {
        match self {
            ScanProfile::Empty => ScanLevel::L0,
            ScanProfile::Declared { level } => *level,
            ScanProfile::Inherited { level, .. } => *level,
        }
    }

    /// Whether this profile is a declared (authoritative) one.
    pub fn is_declared(&self) -> bool {
        matches!(self, ScanProfile::Declared { .. })
    }

    /// The explanatory hops, empty unless inherited.
    pub fn inheritances(&self) -> &[Inheritance] {
        match self {
            ScanProfile::Inherited { inheritances, .. } => inheritances,
            _ => &[],
        }
    }
}
