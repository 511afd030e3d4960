//! Per-level next-hop table the tracer pipeline accumulates into (spec §4.3's "Route rule").
//!
//! Kept as a plain `BTreeMap` rather than inside `Node`/`GNode` directly: a destination's best
//! next-hop set is learned from *any* hop in *any* tracer, not just the ones for this entity's own
//! map slot, so it reads more naturally as the map's own per-level table (mirrors how
//! `bgpsim::ospf::local::database::OspfRib` is a table owned by the process, not smeared across
//! neighbor structs).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Pos, RttMicros};

/// One candidate next hop toward a destination, with its accumulated cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Position of the next hop (always an immediate neighbor).
    pub next_hop: Pos,
    /// Accumulated one-way RTT to the destination via this next hop.
    pub rtt: RttMicros,
}

/// Per-level table of `destination -> [RouteEntry]`, kept cheapest-first and bounded at
/// `MAX_MULTIPATH_ROUTES` entries per destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTable {
    by_dest: BTreeMap<Pos, Vec<RouteEntry>>,
}

impl RouteTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes known for `dest`, cheapest first.
    pub fn routes(&self, dest: Pos) -> &[RouteEntry] {
        self.by_dest.get(&dest).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The cheapest known next hop for `dest`, if any.
    pub fn best(&self, dest: Pos) -> Option<RouteEntry> {
        self.routes(dest).first().copied()
    }

    /// Every destination this table currently has an entry for.
    pub fn destinations(&self) -> impl Iterator<Item = Pos> + '_ {
        self.by_dest.keys().copied()
    }

    /// Withdraw all routes to `dest` (used on `node_del`).
    pub fn withdraw(&mut self, dest: Pos) -> bool {
        self.by_dest.remove(&dest).is_some()
    }

    /// Consider a freshly observed `(next_hop, rtt)` candidate for `dest`. Keeps the cheapest
    /// candidate(s); ties up to `max_multipath` are kept as equal-cost alternates. Returns whether
    /// the table changed (callers use this to decide whether to flag `MAP_UPDATE`).
    pub fn consider(&mut self, dest: Pos, next_hop: Pos, rtt: RttMicros, max_multipath: usize) -> bool {
        let entries = self.by_dest.entry(dest).or_default();

        let Some(&best) = entries.first() else {
            entries.push(RouteEntry { next_hop, rtt });
            return true;
        };

        if rtt < best.rtt {
            entries.clear();
            entries.push(RouteEntry { next_hop, rtt });
            true
        } else if rtt == best.rtt {
            if entries.iter().any(|e| e.next_hop == next_hop) {
                false
            } else if entries.len() < max_multipath.max(1) {
                entries.push(RouteEntry { next_hop, rtt });
                true
            } else {
                false
            }
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_candidate_is_always_kept() {
        let mut t = RouteTable::new();
        assert!(t.consider(9, 1, 100, 4));
        assert_eq!(t.best(9), Some(RouteEntry { next_hop: 1, rtt: 100 }));
    }

    #[test]
    fn strictly_cheaper_candidate_replaces_the_set() {
        let mut t = RouteTable::new();
        t.consider(9, 1, 100, 4);
        t.consider(9, 2, 300, 4);
        assert!(t.consider(9, 3, 50, 4));
        assert_eq!(t.routes(9), &[RouteEntry { next_hop: 3, rtt: 50 }]);
    }

    #[test]
    fn equal_cost_candidates_accumulate_up_to_the_multipath_bound() {
        let mut t = RouteTable::new();
        t.consider(9, 1, 100, 2);
        assert!(t.consider(9, 2, 100, 2));
        assert!(!t.consider(9, 3, 100, 2));
        assert_eq!(t.routes(9).len(), 2);
    }

    #[test]
    fn pricier_candidate_is_ignored() {
        let mut t = RouteTable::new();
        t.consider(9, 1, 100, 4);
        assert!(!t.consider(9, 2, 500, 4));
        assert_eq!(t.routes(9).len(), 1);
    }

    #[test]
    fn withdraw_removes_the_destination() {
        let mut t = RouteTable::new();
        t.consider(9, 1, 100, 4);
        assert!(t.withdraw(9));
        assert!(t.routes(9).is_empty());
        assert!(!t.withdraw(9));
    }
}
