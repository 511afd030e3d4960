//! The hierarchical map model (spec §3–§4.1).
//!
//! A node's position in the mesh is described by a [`crate::types::QuadroGroup`]: its own
//! position at level 0, plus the position of the gnode that contains it at every level above.
//! Each level is backed by its own fixed-capacity map — [`InternalMap`] at level 0,
//! [`ExternalMap`] everywhere else — so a single entity never has to represent "I might be a
//! physical node or I might be a group" the way the original's `map_node`/`map_gnode` union did.
//! [`BorderMap`] tracks, per level, which positions border some other group and what it costs to
//! reach the groups on the far side.

pub mod bmap;
pub mod external;
pub mod gnode;
pub mod internal;
pub mod node;
pub mod route_table;

pub use bmap::BorderMap;
pub use external::ExternalMap;
pub use gnode::{GNode, GNodeFlags};
pub use internal::InternalMap;
pub use node::{Link, Node, NodeFlags, RoundState};
pub use route_table::{RouteEntry, RouteTable};

use crate::error::{MapError, Result};
use crate::types::{Level, Pos};

/// Tiny bitflags implementation, local to this crate, with the handful of operations the map
/// model needs. A full `bitflags!`-crate dependency was not worth pulling in for five call sites.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: $repr:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
        $vis struct $name($repr);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: $name = $name($value);
            )*

            /// The empty flag set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Whether `self` contains every bit set in `other`.
            pub fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Set every bit present in `other`.
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            /// Clear every bit present in `other`.
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            /// The raw bit representation, for wire encoding.
            pub fn bits(self) -> $repr {
                self.0
            }

            /// Reconstruct a flag set from its raw bit representation (wire decoding). Unknown
            /// bits are kept rather than rejected, matching the C source's tolerance of
            /// forward-reserved flag bits.
            pub fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

pub(crate) use bitflags_lite;

/// A single level of the hierarchy: the leaf map at level 0, or a group map above it.
///
/// Most call sites operate uniformly across levels (the QSPN round state machine in particular
/// does not care whether it is closing a `Node` or a `GNode`), so [`LevelMap`] exposes the subset
/// of operations both backings share. Level-specific details — node links, gnode seed counts —
/// live on [`InternalMap`]/[`ExternalMap`] directly.
pub enum LevelMap {
    /// Level 0: physical nodes.
    Internal(InternalMap),
    /// Level > 0: groups of the level below.
    External(ExternalMap),
}

impl LevelMap {
    /// The level this map instance serves.
    pub fn level(&self) -> Level {
        match self {
            LevelMap::Internal(m) => m.level(),
            LevelMap::External(m) => m.level(),
        }
    }

    /// Capacity of this level (`MAXGROUPNODE`).
    pub fn capacity(&self) -> usize {
        match self {
            LevelMap::Internal(m) => m.capacity(),
            LevelMap::External(m) => m.capacity(),
        }
    }

    /// Position of the local node/gnode at this level, if known.
    pub fn me(&self) -> Option<Pos> {
        match self {
            LevelMap::Internal(m) => m.me(),
            LevelMap::External(m) => m.me(),
        }
    }

    /// Whether the position holds a live entity.
    pub fn is_void(&self, pos: Pos) -> Result<bool> {
        match self {
            LevelMap::Internal(m) => m.node(pos).map(Node::is_void),
            LevelMap::External(m) => m.gnode(pos).map(GNode::is_void),
        }
    }

    /// Whether the position is a border node at this level.
    pub fn is_bnode(&self, pos: Pos) -> Result<bool> {
        match self {
            LevelMap::Internal(m) => m.node(pos).map(Node::is_bnode),
            LevelMap::External(m) => m.gnode(pos).map(GNode::is_bnode),
        }
    }

    /// Decode the round-progress state of the entity at `pos`.
    pub fn round_state(&self, pos: Pos) -> Result<RoundState> {
        match self {
            LevelMap::Internal(m) => m.node(pos).map(Node::round_state),
            LevelMap::External(m) => m.gnode(pos).map(GNode::round_state),
        }
    }

    /// Neighbor links of the entity at `pos`.
    pub fn links(&self, pos: Pos) -> Result<&[Link]> {
        match self {
            LevelMap::Internal(m) => m.node(pos).map(Node::links),
            LevelMap::External(m) => m.gnode(pos).map(GNode::links),
        }
    }

    /// Clear the QSPN_* bits of every live entity, in preparation for a new round.
    pub fn clear_round_flags(&mut self) {
        match self {
            LevelMap::Internal(m) => m.clear_round_flags(),
            LevelMap::External(m) => m.clear_round_flags(),
        }
    }

    /// Mark every entity still carrying last round's flags `QSPN_OLD`, per spec §4.4's sweep:
    /// anyone who does not reappear in a tracer this round is presumed gone.
    pub fn mark_unseen_old(&mut self, seen: &[Pos]) {
        match self {
            LevelMap::Internal(m) => m.mark_unseen_old(seen),
            LevelMap::External(m) => m.mark_unseen_old(seen),
        }
    }

    /// This entity's quadro group, if known.
    pub fn quadro_group(&self, pos: Pos) -> Result<Option<&crate::types::QuadroGroup>> {
        match self {
            LevelMap::Internal(m) => m.node(pos).map(Node::quadro_group),
            LevelMap::External(m) => m.gnode(pos).map(GNode::quadro_group),
        }
    }

    /// Clear `QSPN_OLD` on a single entity: it has reappeared in a tracer this round.
    pub fn clear_old(&mut self, pos: Pos) -> Result<()> {
        match self {
            LevelMap::Internal(m) => m.node_mut(pos).map(|n| {
                n.flags_mut().remove(NodeFlags::QSPN_OLD);
            }),
            LevelMap::External(m) => m.gnode_mut(pos).map(|g| {
                g.flags_mut().remove(GNodeFlags::QSPN_OLD);
            }),
        }
    }

    /// Set `QSPN_OLD` on a single entity (`mark_old` applied to one position at round start).
    pub fn set_old(&mut self, pos: Pos) -> Result<()> {
        match self {
            LevelMap::Internal(m) => m.node_mut(pos).map(|n| {
                n.flags_mut().insert(NodeFlags::QSPN_OLD);
            }),
            LevelMap::External(m) => m.gnode_mut(pos).map(|g| {
                g.flags_mut().insert(GNodeFlags::QSPN_OLD);
            }),
        }
    }

    /// Whether a single entity currently carries `QSPN_OLD`.
    pub fn is_old(&self, pos: Pos) -> Result<bool> {
        match self {
            LevelMap::Internal(m) => m.node(pos).map(|n| n.flags().contains(NodeFlags::QSPN_OLD)),
            LevelMap::External(m) => m.gnode(pos).map(|g| g.flags().contains(GNodeFlags::QSPN_OLD)),
        }
    }

    /// Set `UPDATE` on a single entity: its route table entry changed and
    /// [`crate::route::RouteInstaller::tick`] needs to push the new set to the sink (`MAP_UPDATE`).
    pub fn set_update(&mut self, pos: Pos) -> Result<()> {
        match self {
            LevelMap::Internal(m) => m.node_mut(pos).map(|n| {
                n.flags_mut().insert(NodeFlags::UPDATE);
            }),
            LevelMap::External(m) => m.gnode_mut(pos).map(|g| {
                g.flags_mut().insert(GNodeFlags::UPDATE);
            }),
        }
    }

    /// Positions of every live (non-void) entity at this level.
    pub fn live_positions(&self) -> Vec<Pos> {
        match self {
            LevelMap::Internal(m) => m.iter_live().map(Node::pos).collect(),
            LevelMap::External(m) => m.iter_live().map(GNode::pos).collect(),
        }
    }

    /// Set one of the four round-progress flags on a single entity (`qspn_close`/`qspn_open`
    /// marking a neighbor `QSPN_CLOSED`, ourselves `QSPN_STARTER`, and so on).
    pub fn set_round_flag(&mut self, pos: Pos, flag: RoundFlag) -> Result<()> {
        match self {
            LevelMap::Internal(m) => m.node_mut(pos).map(|n| {
                n.flags_mut().insert(flag.node_bits());
            }),
            LevelMap::External(m) => m.gnode_mut(pos).map(|g| {
                g.flags_mut().insert(flag.gnode_bits());
            }),
        }
    }

    /// Clear the four round-progress bits (`QSPN_STARTER|CLOSED|OPENER|OPENED`) on a single
    /// entity, leaving `QSPN_OLD` and every structural flag untouched (`qspn_new_round`'s
    /// per-neighbor reset).
    pub fn clear_progress_flags(&mut self, pos: Pos) -> Result<()> {
        match self {
            LevelMap::Internal(m) => m.node_mut(pos).map(|n| n.flags_mut().clear_round_flags()),
            LevelMap::External(m) => m.gnode_mut(pos).map(|g| g.flags_mut().clear_round_flags()),
        }
    }
}

/// One of the four round-progress bits a [`LevelMap::set_round_flag`] call can set. Kept as an
/// explicit enum rather than passing `NodeFlags`/`GNodeFlags` directly, since the two flag types
/// are distinct and a caller working across levels (the QSPN state machine) should not have to
/// know which one a given position's backing map uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundFlag {
    /// This entity initiated the current round's CLOSE wave.
    Starter,
    /// This entity's link (toward us) is closed for the current round.
    Closed,
    /// This entity has sent its OPEN.
    Opener,
    /// This entity has opened for every sub_id we have observed.
    Opened,
}

impl RoundFlag {
    fn node_bits(self) -> NodeFlags {
        match self {
            RoundFlag::Starter => NodeFlags::QSPN_STARTER,
            RoundFlag::Closed => NodeFlags::QSPN_CLOSED,
            RoundFlag::Opener => NodeFlags::QSPN_OPENER,
            RoundFlag::Opened => NodeFlags::QSPN_OPENED,
        }
    }

    fn gnode_bits(self) -> GNodeFlags {
        match self {
            RoundFlag::Starter => GNodeFlags::QSPN_STARTER,
            RoundFlag::Closed => GNodeFlags::QSPN_CLOSED,
            RoundFlag::Opener => GNodeFlags::QSPN_OPENER,
            RoundFlag::Opened => GNodeFlags::QSPN_OPENED,
        }
    }
}

/// The whole hierarchy: one [`LevelMap`] per level plus the cross-level [`BorderMap`].
///
/// `Map` owns every entity in the mesh and hands out `Pos`-based weak references to them; nothing
/// outside this module keeps a `Node`/`GNode` alive past a `delete` call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Map {
    levels: Vec<LevelMap>,
    bmap: BorderMap,
    routes: Vec<RouteTable>,
    /// Destinations withdrawn from a level's route table by [`Map::node_del`] since the last
    /// [`Map::take_pending_deletes`]. `node_del` voids the entity outright, so by the time
    /// [`crate::route::RouteInstaller::tick`] would otherwise look for it, it is no longer `live`
    /// and its `UPDATE` flag (already wiped by the void reset) can never be found; this is the
    /// only path by which `tick` still learns a destination needs a `route_del`.
    pending_deletes: Vec<Vec<Pos>>,
}

impl Map {
    /// Build a hierarchy of `max_levels` levels (level 0 plus `max_levels - 1` group levels),
    /// each with `capacity` slots (`MAXGROUPNODE`).
    pub fn new(max_levels: Level, capacity: u16) -> Self {
        let mut levels = Vec::with_capacity(max_levels as usize);
        levels.push(LevelMap::Internal(InternalMap::new(capacity)));
        for level in 1..max_levels {
            levels.push(LevelMap::External(ExternalMap::new(level, capacity)));
        }
        let routes = (0..max_levels).map(|_| RouteTable::new()).collect();
        let pending_deletes = (0..max_levels).map(|_| Vec::new()).collect();
        Self {
            levels,
            bmap: BorderMap::new(),
            routes,
            pending_deletes,
        }
    }

    /// The next-hop table for a level (`rt_find_table`'s destination-keyed result set).
    pub fn routes(&self, level: Level) -> Result<&RouteTable> {
        self.routes
            .get(level as usize)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 }.into())
    }

    /// Consider a freshly observed route candidate at a level, bounded by `max_multipath`.
    /// Returns whether the table changed.
    pub fn consider_route(
        &mut self,
        level: Level,
        dest: Pos,
        next_hop: Pos,
        rtt: crate::types::RttMicros,
        max_multipath: usize,
    ) -> Result<bool> {
        let table = self
            .routes
            .get_mut(level as usize)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 })?;
        Ok(table.consider(dest, next_hop, rtt, max_multipath))
    }

    /// Number of levels this hierarchy spans.
    pub fn max_levels(&self) -> Level {
        self.levels.len() as Level
    }

    /// The level-0 map.
    pub fn internal(&self) -> &InternalMap {
        match &self.levels[0] {
            LevelMap::Internal(m) => m,
            LevelMap::External(_) => unreachable!("level 0 is always internal"),
        }
    }

    /// The level-0 map, mutably.
    pub fn internal_mut(&mut self) -> &mut InternalMap {
        match &mut self.levels[0] {
            LevelMap::Internal(m) => m,
            LevelMap::External(_) => unreachable!("level 0 is always internal"),
        }
    }

    /// The map for a level above 0.
    pub fn external(&self, level: Level) -> Result<&ExternalMap> {
        match self.levels.get(level as usize) {
            Some(LevelMap::External(m)) => Ok(m),
            _ => Err(MapError::NotFound { level, pos: 0 }.into()),
        }
    }

    /// The map for a level above 0, mutably.
    pub fn external_mut(&mut self, level: Level) -> Result<&mut ExternalMap> {
        match self.levels.get_mut(level as usize) {
            Some(LevelMap::External(m)) => Ok(m),
            _ => Err(MapError::NotFound { level, pos: 0 }.into()),
        }
    }

    /// Borrow a view over a level, regardless of whether it is internal or external.
    pub fn level(&self, level: Level) -> Result<&LevelMap> {
        self.levels
            .get(level as usize)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 }.into())
    }

    /// Borrow a view over a level mutably, regardless of whether it is internal or external.
    pub fn level_mut(&mut self, level: Level) -> Result<&mut LevelMap> {
        self.levels
            .get_mut(level as usize)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 }.into())
    }

    /// Clear `QSPN_OLD` on a single entity at `level` (it reappeared in this round's tracer).
    pub fn clear_old(&mut self, level: Level, pos: Pos) -> Result<()> {
        self.level_mut(level)?.clear_old(pos)
    }

    /// Set `QSPN_OLD` on a single entity at `level`.
    pub fn set_old(&mut self, level: Level, pos: Pos) -> Result<()> {
        self.level_mut(level)?.set_old(pos)
    }

    /// Whether a single entity at `level` currently carries `QSPN_OLD`.
    pub fn is_old(&self, level: Level, pos: Pos) -> Result<bool> {
        self.level(level)?.is_old(pos)
    }

    /// Set `UPDATE` on a single entity at `level` (`MAP_UPDATE`): its route table changed and the
    /// route installer still owes the sink a `replace`/`delete` for it.
    pub fn set_update(&mut self, level: Level, pos: Pos) -> Result<()> {
        self.level_mut(level)?.set_update(pos)
    }

    /// Positions of every live entity at `level`.
    pub fn live_positions(&self, level: Level) -> Result<Vec<Pos>> {
        Ok(self.level(level)?.live_positions())
    }

    /// Set one of the four round-progress flags on a single entity at `level`.
    pub fn set_round_flag(&mut self, level: Level, pos: Pos, flag: RoundFlag) -> Result<()> {
        self.level_mut(level)?.set_round_flag(pos, flag)
    }

    /// Clear the four round-progress bits on a single entity at `level`, leaving `QSPN_OLD` and
    /// structural flags untouched.
    pub fn clear_progress_flags(&mut self, level: Level, pos: Pos) -> Result<()> {
        self.level_mut(level)?.clear_progress_flags(pos)
    }

    /// The cross-level border node index.
    pub fn bmap(&self) -> &BorderMap {
        &self.bmap
    }

    /// The cross-level border node index, mutably.
    pub fn bmap_mut(&mut self) -> &mut BorderMap {
        &mut self.bmap
    }

    /// Positions flagged as border nodes at a level (`find_bnode`).
    pub fn find_bnode(&self, level: Level) -> Result<Vec<Pos>> {
        match self.levels.get(level as usize) {
            Some(LevelMap::Internal(m)) => Ok(m.find_bnode()),
            Some(LevelMap::External(m)) => Ok(m.find_bnode()),
            None => Err(MapError::NotFound { level, pos: 0 }.into()),
        }
    }

    /// Delete a border node's flag and its bmap routes together (`bnode_del`).
    pub fn bnode_del(&mut self, level: Level, pos: Pos) -> Result<()> {
        match self.levels.get_mut(level as usize) {
            Some(LevelMap::Internal(m)) => m.bnode_del(pos)?,
            Some(LevelMap::External(m)) => m.bnode_del(pos)?,
            None => return Err(MapError::NotFound { level, pos }.into()),
        }
        // The entity may not have had any bmap routes registered yet; that is not an error here.
        let _ = self.bmap.remove(level, pos);
        Ok(())
    }

    /// Delete an entity outright: clears its flags, links and bmap routes (`node_del`).
    pub fn node_del(&mut self, level: Level, pos: Pos) -> Result<()> {
        let parent_gid = self
            .levels
            .get(level as usize)
            .and_then(|l| l.quadro_group(pos).ok().flatten())
            .and_then(|qg| qg.gid(level + 1));

        match self.levels.get_mut(level as usize) {
            Some(LevelMap::Internal(m)) => m.delete(pos)?,
            Some(LevelMap::External(m)) => m.delete(pos)?,
            None => return Err(MapError::NotFound { level, pos }.into()),
        }
        let _ = self.bmap.remove(level, pos);
        if let Some(table) = self.routes.get_mut(level as usize) {
            if table.withdraw(pos) {
                if let Some(pending) = self.pending_deletes.get_mut(level as usize) {
                    pending.push(pos);
                }
            }
        }
        if let Some(parent_pos) = parent_gid {
            if let Some(LevelMap::External(parent)) = self.levels.get_mut(level as usize + 1) {
                if let Ok(gnode) = parent.gnode_mut(parent_pos) {
                    gnode.remove_seed();
                }
            }
        }
        Ok(())
    }

    /// Remove every gnode at `level` whose seed count has reached zero (spec §3: "seeds=0 ⇒ the
    /// gnode is garbage-collected at round boundary"). Returns the positions removed.
    pub fn gc_empty_gnodes(&mut self, level: Level) -> Result<Vec<Pos>> {
        let empty: Vec<Pos> = match self.levels.get(level as usize) {
            Some(LevelMap::External(m)) => m
                .iter_live()
                .filter(|g| g.seeds() == 0)
                .map(GNode::pos)
                .collect(),
            Some(LevelMap::Internal(_)) => Vec::new(),
            None => return Err(MapError::NotFound { level, pos: 0 }.into()),
        };
        for &pos in &empty {
            self.node_del(level, pos)?;
        }
        Ok(empty)
    }

    /// Clear the QSPN_* bits of every live entity at every level (`flags_clear`, round start).
    pub fn clear_round_flags(&mut self) {
        for level in self.levels.iter_mut() {
            level.clear_round_flags();
        }
    }

    /// Flag every entity at a level not present in `seen` as `QSPN_OLD` (`mark_old`).
    pub fn mark_unseen_old(&mut self, level: Level, seen: &[Pos]) -> Result<()> {
        self.levels
            .get_mut(level as usize)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 }.into())
            .map(|m| m.mark_unseen_old(seen))
    }

    /// Drain the destinations [`Map::node_del`] withdrew from `level`'s route table since the
    /// last call, for [`crate::route::RouteInstaller::tick`] to push as `route_del`s.
    pub fn take_pending_deletes(&mut self, level: Level) -> Result<Vec<Pos>> {
        self.pending_deletes
            .get_mut(level as usize)
            .map(std::mem::take)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuadroGroup;

    #[test]
    fn node_del_decrements_parent_gnode_seeds() {
        let mut map = Map::new(2, 8);
        map.internal_mut().add(0).unwrap();
        map.internal_mut()
            .node_mut(0)
            .unwrap()
            .set_quadro_group(QuadroGroup::new(vec![0, 3]));
        map.external_mut(1).unwrap().add(3).unwrap().set_seeds(2);

        map.node_del(0, 0).unwrap();

        assert_eq!(map.external(1).unwrap().gnode(3).unwrap().seeds(), 1);
    }

    #[test]
    fn gc_empty_gnodes_removes_seedless_groups() {
        let mut map = Map::new(2, 8);
        map.external_mut(1).unwrap().add(3).unwrap().set_seeds(0);
        map.external_mut(1).unwrap().add(4).unwrap().set_seeds(1);

        let removed = map.gc_empty_gnodes(1).unwrap();

        assert_eq!(removed, vec![3]);
        assert!(map.external(1).unwrap().gnode(3).unwrap().is_void());
        assert!(!map.external(1).unwrap().gnode(4).unwrap().is_void());
    }

    #[test]
    fn find_bnode_and_bnode_del_roundtrip_across_levels() {
        let mut map = Map::new(1, 4);
        map.internal_mut()
            .add(1)
            .unwrap()
            .flags_mut()
            .insert(NodeFlags::BNODE);
        map.bmap_mut().set_routes(0, 1, vec![]);

        assert_eq!(map.find_bnode(0).unwrap(), vec![1]);
        map.bnode_del(0, 1).unwrap();
        assert!(map.find_bnode(0).unwrap().is_empty());
        assert!(map.bmap().routes(0, 1).is_empty());
    }

    #[test]
    fn set_update_flags_an_entity_regardless_of_round_state() {
        let mut map = Map::new(1, 4);
        map.internal_mut().add(1).unwrap();
        map.set_update(0, 1).unwrap();
        assert!(map.internal().node(1).unwrap().flags().contains(NodeFlags::UPDATE));
    }

    #[test]
    fn node_del_queues_a_pending_delete_only_when_a_route_existed() {
        let mut map = Map::new(1, 4);
        map.internal_mut().add(1).unwrap();
        map.internal_mut().add(2).unwrap();
        map.consider_route(0, 1, 2, 100, 4).unwrap();

        map.node_del(0, 2).unwrap();
        assert!(map.take_pending_deletes(0).unwrap().is_empty());

        map.node_del(0, 1).unwrap();
        assert_eq!(map.take_pending_deletes(0).unwrap(), vec![1]);
        // Draining empties the queue; a second call sees nothing left.
        assert!(map.take_pending_deletes(0).unwrap().is_empty());
    }
}
