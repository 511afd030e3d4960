//! Levels > 0: each level's map of neighboring groups.

use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};
use crate::types::{Level, Pos};

use super::gnode::{GNode, GNodeFlags};

/// Fixed-capacity map of [`GNode`]s for a single level above 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMap {
    level: Level,
    gnodes: Vec<GNode>,
    me: Option<Pos>,
}

impl ExternalMap {
    /// Build a map for `level` with `capacity` void slots. `level` must be nonzero; levels 0 is
    /// always an [`super::InternalMap`].
    pub fn new(level: Level, capacity: u16) -> Self {
        debug_assert!(level > 0, "level 0 uses InternalMap");
        Self {
            level,
            gnodes: (0..capacity).map(GNode::new_void).collect(),
            me: None,
        }
    }

    /// The level this map serves.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Total number of slots (`MAXGROUPNODE`).
    pub fn capacity(&self) -> usize {
        self.gnodes.len()
    }

    /// Position of the gnode containing the local node at this level, if known.
    pub fn me(&self) -> Option<Pos> {
        self.me
    }

    /// Record which gnode at this level contains the local node.
    pub fn set_me(&mut self, pos: Pos) -> Result<()> {
        self.gnode_mut(pos)?.flags_mut().remove(GNodeFlags::VOID);
        self.me = Some(pos);
        Ok(())
    }

    /// Look up a gnode by position.
    pub fn gnode(&self, pos: Pos) -> Result<&GNode> {
        self.gnodes.get(pos as usize).ok_or_else(|| {
            MapError::NotFound {
                level: self.level,
                pos,
            }
            .into()
        })
    }

    /// Look up a gnode by position, mutably.
    pub fn gnode_mut(&mut self, pos: Pos) -> Result<&mut GNode> {
        let level = self.level;
        self.gnodes
            .get_mut(pos as usize)
            .ok_or_else(|| MapError::NotFound { level, pos }.into())
    }

    /// Bring a void slot to life.
    pub fn add(&mut self, pos: Pos) -> Result<&mut GNode> {
        let gnode = self.gnode_mut(pos)?;
        gnode.flags_mut().remove(GNodeFlags::VOID);
        Ok(gnode)
    }

    /// Reset a slot back to void, dropping its links, seeds and flags (`node_del` at level > 0).
    pub fn delete(&mut self, pos: Pos) -> Result<()> {
        let was_me = self.me == Some(pos);
        self.gnode_mut(pos)?.reset_to_void();
        if was_me {
            self.me = None;
        }
        Ok(())
    }

    /// Iterate over live (non-void) gnodes.
    pub fn iter_live(&self) -> impl Iterator<Item = &GNode> {
        self.gnodes.iter().filter(|g| !g.is_void())
    }

    /// Iterate over live (non-void) gnodes, mutably (used by the route installer to clear
    /// `UPDATE` once a gnode's routes have been pushed to a sink).
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut GNode> {
        self.gnodes.iter_mut().filter(|g| !g.is_void())
    }

    /// Positions of every gnode flagged as a border node at this level (`find_bnode`).
    pub fn find_bnode(&self) -> Vec<Pos> {
        self.iter_live()
            .filter(|g| g.is_bnode())
            .map(GNode::pos)
            .collect()
    }

    /// Clear the border-node status of `pos` without deleting the gnode (`bnode_del`).
    pub fn bnode_del(&mut self, pos: Pos) -> Result<()> {
        let level = self.level;
        let gnode = self.gnode_mut(pos)?;
        if !gnode.is_bnode() {
            return Err(MapError::NotABorderNode { level, pos }.into());
        }
        gnode.flags_mut().remove(GNodeFlags::BNODE);
        Ok(())
    }

    /// Clear the QSPN_* bits of every live gnode.
    pub fn clear_round_flags(&mut self) {
        for gnode in self.gnodes.iter_mut().filter(|g| !g.is_void()) {
            gnode.flags_mut().clear_round_flags();
        }
    }

    /// Flag every live gnode not present in `seen` as `QSPN_OLD`.
    pub fn mark_unseen_old(&mut self, seen: &[Pos]) {
        for gnode in self.gnodes.iter_mut().filter(|g| !g.is_void()) {
            if !seen.contains(&gnode.pos()) {
                gnode.flags_mut().insert(GNodeFlags::QSPN_OLD);
            }
        }
    }
}
