//! Level 0: the map of physical nodes directly reachable through hierarchy.

use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};
use crate::types::{Level, Pos};

use super::node::{Node, NodeFlags};

/// Fixed-capacity map of [`Node`]s. Positions are stable array indices (spec's Design Notes:
/// index-based arenas rather than pointer-linked lists), so a `Pos` handed out by one call stays
/// valid until the slot is explicitly reset with [`InternalMap::delete`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalMap {
    nodes: Vec<Node>,
    me: Option<Pos>,
}

impl InternalMap {
    /// Build a map with `capacity` void slots.
    pub fn new(capacity: u16) -> Self {
        Self {
            nodes: (0..capacity).map(Node::new_void).collect(),
            me: None,
        }
    }

    /// Level 0, always.
    pub fn level(&self) -> Level {
        0
    }

    /// Total number of slots (`MAXGROUPNODE`).
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Position of the local node, if it has been placed.
    pub fn me(&self) -> Option<Pos> {
        self.me
    }

    /// Place the local node at `pos`, creating it if void.
    pub fn set_me(&mut self, pos: Pos) -> Result<()> {
        let node = self.node_mut(pos)?;
        node.flags_mut().remove(NodeFlags::VOID);
        node.flags_mut().insert(NodeFlags::ME);
        self.me = Some(pos);
        Ok(())
    }

    /// Look up a node by position.
    pub fn node(&self, pos: Pos) -> Result<&Node> {
        self.nodes
            .get(pos as usize)
            .ok_or_else(|| MapError::NotFound { level: 0, pos }.into())
    }

    /// Look up a node by position, mutably.
    pub fn node_mut(&mut self, pos: Pos) -> Result<&mut Node> {
        self.nodes
            .get_mut(pos as usize)
            .ok_or_else(|| MapError::NotFound { level: 0, pos }.into())
    }

    /// Bring a void slot to life (clears `VOID`, leaves other flags/links untouched).
    pub fn add(&mut self, pos: Pos) -> Result<&mut Node> {
        let node = self.node_mut(pos)?;
        node.flags_mut().remove(NodeFlags::VOID);
        Ok(node)
    }

    /// Reset a slot back to void, dropping its links and flags (`node_del`).
    pub fn delete(&mut self, pos: Pos) -> Result<()> {
        let was_me = self.me == Some(pos);
        self.node_mut(pos)?.reset_to_void();
        if was_me {
            self.me = None;
        }
        Ok(())
    }

    /// Iterate over live (non-void) nodes.
    pub fn iter_live(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_void())
    }

    /// Iterate over live (non-void) nodes, mutably (used by the route installer to clear `UPDATE`
    /// once a node's routes have been pushed to a sink).
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut().filter(|n| !n.is_void())
    }

    /// Positions of every node flagged as a border node (`find_bnode`).
    pub fn find_bnode(&self) -> Vec<Pos> {
        self.iter_live()
            .filter(|n| n.is_bnode())
            .map(Node::pos)
            .collect()
    }

    /// Delete the border-node status of `pos` without deleting the node itself: clears `BNODE`.
    /// Returns an error if `pos` was not flagged as a border node (`bnode_del`).
    pub fn bnode_del(&mut self, pos: Pos) -> Result<()> {
        let node = self.node_mut(pos)?;
        if !node.is_bnode() {
            return Err(MapError::NotABorderNode { level: 0, pos }.into());
        }
        node.flags_mut().remove(NodeFlags::BNODE);
        Ok(())
    }

    /// Clear the QSPN_* bits of every live node (`flags_clear`, round-start bookkeeping).
    pub fn clear_round_flags(&mut self) {
        for node in self.nodes.iter_mut().filter(|n| !n.is_void()) {
            node.flags_mut().clear_round_flags();
        }
    }

    /// Flag every live node not present in `seen` as `QSPN_OLD` (`mark_old`): the round's tracer
    /// traffic never reached them, so they are presumed to have left the mesh.
    pub fn mark_unseen_old(&mut self, seen: &[Pos]) {
        for node in self.nodes.iter_mut().filter(|n| !n.is_void()) {
            if !seen.contains(&node.pos()) {
                node.flags_mut().insert(NodeFlags::QSPN_OLD);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_me_clears_void_and_records_position() {
        let mut map = InternalMap::new(8);
        map.set_me(2).unwrap();
        assert_eq!(map.me(), Some(2));
        assert!(map.node(2).unwrap().is_me());
        assert!(!map.node(2).unwrap().is_void());
    }

    #[test]
    fn delete_resets_me() {
        let mut map = InternalMap::new(4);
        map.set_me(0).unwrap();
        map.delete(0).unwrap();
        assert_eq!(map.me(), None);
        assert!(map.node(0).unwrap().is_void());
    }

    #[test]
    fn bnode_del_rejects_non_border_node() {
        let mut map = InternalMap::new(4);
        map.add(1).unwrap();
        assert!(map.bnode_del(1).is_err());
    }

    #[test]
    fn find_bnode_lists_only_flagged_live_nodes() {
        let mut map = InternalMap::new(4);
        map.add(0).unwrap();
        map.add(1).unwrap().flags_mut().insert(NodeFlags::BNODE);
        assert_eq!(map.find_bnode(), vec![1]);
    }

    #[test]
    fn mark_unseen_old_skips_seen_and_void() {
        let mut map = InternalMap::new(4);
        map.add(0).unwrap();
        map.add(1).unwrap();
        map.mark_unseen_old(&[0]);
        assert!(!map.node(0).unwrap().flags().contains(NodeFlags::QSPN_OLD));
        assert!(map.node(1).unwrap().flags().contains(NodeFlags::QSPN_OLD));
        assert!(!map.node(2).unwrap().flags().contains(NodeFlags::QSPN_OLD));
    }
}
