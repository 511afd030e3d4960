//! Module containing the small value types shared across the crate.

use serde::{Deserialize, Serialize};

/// Hierarchy level. `0` is the leaf (internal) map; higher levels index stacked external maps.
pub type Level = u8;

/// Position of a node (at level 0) or gnode (at level > 0) within its owning map.
///
/// This is an index into a fixed-size array, never a pointer: maps own their entities and hand
/// out positions as weak references.
pub type Pos = u16;

/// Identifier of a QSPN round at a given level. Monotone within live memory of that level.
pub type QspnId = u32;

/// Identifier of an OPEN wave's originator, used to tell concurrent OPENs from different openers
/// apart.
pub type SubId = u8;

/// One-way accumulated round-trip-time, expressed in microseconds.
pub type RttMicros = u32;

/// Totally ordered tuple identifying a node's nested containers.
///
/// `gid[0]` is the node's own position at level 0; `gid[i]` for `i > 0` is the position of the
/// gnode that contains it at level `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuadroGroup {
    gid: Vec<Pos>,
}

impl QuadroGroup {
    /// Build a quadro group from the gid of each level, level 0 first.
    pub fn new(gid: Vec<Pos>) -> Self {
        Self { gid }
    }

    /// Number of levels this quadro group spans.
    pub fn levels(&self) -> usize {
        self.gid.len()
    }

    /// The gid at the given level.
    pub fn gid(&self, level: Level) -> Option<Pos> {
        self.gid.get(level as usize).copied()
    }

    /// Whether `self` and `other` agree on every index strictly above `level`.
    pub fn agrees_above(&self, other: &Self, level: Level) -> bool {
        let from = level as usize + 1;
        self.gid.get(from..) == other.gid.get(from..)
    }

    /// Whether `self` and `other` disagree exactly at `level` (and agree above it) — the
    /// definition of being border nodes of each other at that level.
    pub fn diverges_at(&self, other: &Self, level: Level) -> bool {
        self.gid(level) != other.gid(level) && self.agrees_above(other, level)
    }
}
