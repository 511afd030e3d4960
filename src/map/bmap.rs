//! Cross-level index of border nodes (spec §3's bmap invariant).
//!
//! A node can be a border node at several levels simultaneously (it diverges from a neighbor at
//! level 1, say, while also diverging at level 3). [`BorderMap`] is the one place that tracks,
//! per level, which positions are border nodes and what it costs through each of them to reach
//! every foreign group they touch — the input the route installer needs to pick next hops
//! without walking every node's [`super::Link`] list at request time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};
use crate::types::{Level, Pos, RttMicros};

/// One path through a border node to a foreign group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderRoute {
    /// Gid, at the border's level, of the foreign group reachable through this border node.
    pub dest_gid: Pos,
    /// Accumulated round-trip-time to that foreign group via this border node.
    pub rtt: RttMicros,
}

/// Per-level index of border nodes and the routes they expose.
///
/// Invariant: a position is present at a level if and only if that level's map has it flagged
/// `BNODE`. [`BorderMap`] does not enforce this itself — callers update both together, exactly as
/// `qspn_close`/`qspn_open` set the flag and register the route in the same step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BorderMap {
    levels: BTreeMap<Level, BTreeMap<Pos, Vec<BorderRoute>>>,
}

impl BorderMap {
    /// An empty border map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the set of routes a border node exposes at a level.
    pub fn set_routes(&mut self, level: Level, pos: Pos, routes: Vec<BorderRoute>) {
        self.levels.entry(level).or_default().insert(pos, routes);
    }

    /// Append a single route to a border node's existing set, without disturbing the others
    /// (used when a new foreign group is first seen through an already-known border node).
    pub fn add_route(&mut self, level: Level, pos: Pos, route: BorderRoute) {
        self.levels
            .entry(level)
            .or_default()
            .entry(pos)
            .or_default()
            .push(route);
    }

    /// Remove a border node's entry entirely (`bnode_del`'s bmap half).
    pub fn remove(&mut self, level: Level, pos: Pos) -> Result<()> {
        match self.levels.get_mut(&level).and_then(|m| m.remove(&pos)) {
            Some(_) => Ok(()),
            None => Err(MapError::NotABorderNode { level, pos }.into()),
        }
    }

    /// Routes exposed by a border node at a level, if it is registered.
    pub fn routes(&self, level: Level, pos: Pos) -> &[BorderRoute] {
        self.levels
            .get(&level)
            .and_then(|m| m.get(&pos))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every border position registered at a level.
    pub fn bnodes_at_level(&self, level: Level) -> impl Iterator<Item = Pos> + '_ {
        self.levels
            .get(&level)
            .into_iter()
            .flat_map(|m| m.keys().copied())
    }

    /// The border nodes (and their cost) that can reach `dest_gid` at `level`, cheapest first,
    /// truncated to `limit` entries. This is the multipath candidate set the route installer
    /// hands to [`crate::route::RouteSink`].
    pub fn routes_to(&self, level: Level, dest_gid: Pos, limit: usize) -> Vec<(Pos, RttMicros)> {
        let Some(by_pos) = self.levels.get(&level) else {
            return Vec::new();
        };
        let mut candidates: Vec<(Pos, RttMicros)> = by_pos
            .iter()
            .filter_map(|(&pos, routes)| {
                routes
                    .iter()
                    .find(|r| r.dest_gid == dest_gid)
                    .map(|r| (pos, r.rtt))
            })
            .collect();
        candidates.sort_by_key(|&(_, rtt)| rtt);
        candidates.truncate(limit);
        candidates
    }
}
