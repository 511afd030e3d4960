//! Leaf map entities (level 0).

use serde::{Deserialize, Serialize};

use crate::types::{Level, Pos, QuadroGroup, RttMicros};

use super::bitflags_lite;

bitflags_lite! {
    /// Flag set attached to a [`Node`]. Mirrors the C bitfield 1:1 so persistence and debug
    /// output stay legible, but every place that actually branches on round progress goes through
    /// [`Node::round_state`] instead of testing bits directly (see the crate's design notes on
    /// lifting flag-encoded state machines into explicit variants).
    pub struct NodeFlags: u16 {
        /// This is the local node.
        const ME            = 1 << 0;
        /// The slot is unused.
        const VOID          = 1 << 1;
        /// The node borders a different group at some level.
        const BNODE         = 1 << 2;
        /// The node's route table entry needs to be (re)installed.
        const UPDATE        = 1 << 3;
        /// The node is a direct radio/physical neighbor.
        const RNODE         = 1 << 4;
        /// All of this node's links are QSPN_CLOSED for the current round.
        const QSPN_CLOSED   = 1 << 5;
        /// This node has opened for the current round's sub_id.
        const QSPN_OPENED   = 1 << 6;
        /// This node started the current round's CLOSE wave.
        const QSPN_STARTER  = 1 << 7;
        /// This node started the current round's OPEN wave.
        const QSPN_OPENER   = 1 << 8;
        /// Set at round end; cleared when the node reappears in a tracer during the next round.
        const QSPN_OLD      = 1 << 9;
    }
}

/// Round-progress state machine, decoded from the QSPN_* bits of [`NodeFlags`].
///
/// See spec §4.4's state table: `Idle -> {Starter, Participant} -> Closed -> Opener -> Opened ->
/// Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// No round activity observed yet (or the previous round's flags were cleared).
    Idle,
    /// We initiated the current round's CLOSE wave.
    Starter,
    /// We received a CLOSE from someone else and are participating.
    Participant,
    /// All our links are closed.
    Closed,
    /// We have sent our OPEN.
    Opener,
    /// All neighbors have replied OPENED for every sub_id we saw.
    Opened,
}

impl NodeFlags {
    /// Decode the round-progress bits into an explicit state.
    pub fn round_state(&self) -> RoundState {
        if self.contains(NodeFlags::QSPN_OPENED) {
            RoundState::Opened
        } else if self.contains(NodeFlags::QSPN_OPENER) {
            RoundState::Opener
        } else if self.contains(NodeFlags::QSPN_CLOSED) {
            RoundState::Closed
        } else if self.contains(NodeFlags::QSPN_STARTER) {
            RoundState::Starter
        } else {
            RoundState::Idle
        }
    }

    /// Clear every QSPN_* bit (used at round boundaries).
    pub fn clear_round_flags(&mut self) {
        self.remove(
            NodeFlags::QSPN_CLOSED
                | NodeFlags::QSPN_OPENED
                | NodeFlags::QSPN_STARTER
                | NodeFlags::QSPN_OPENER,
        );
    }
}

/// A weak reference to a neighboring map entity: a position plus the level it lives at, never an
/// owned pointer. Maps are the sole owner of their nodes/gnodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Position of the peer in its owning map.
    pub peer: Pos,
    /// The level the peer lives at (equal to our own level for ordinary neighbors).
    pub level: Level,
    /// Smoothed round-trip-time to the peer, in microseconds.
    pub rtt: RttMicros,
    /// Our position within the peer's own neighbor list, cached to avoid a linear scan on every
    /// tracer chunk (see SPEC_FULL §3).
    pub peer_rpos: Pos,
}

/// A leaf participant of the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pos: Pos,
    flags: NodeFlags,
    links: Vec<Link>,
    /// This node's position within every containing gnode, level 0 first. `None` until the
    /// hierarchy above level 0 has been resolved for it (e.g. a freshly discovered neighbor whose
    /// group membership the radar has not yet learned).
    quadro_group: Option<QuadroGroup>,
}

impl Node {
    /// Create a fresh, `VOID` node at the given position.
    pub fn new_void(pos: Pos) -> Self {
        Self {
            pos,
            flags: NodeFlags::VOID,
            links: Vec::new(),
            quadro_group: None,
        }
    }

    /// This node's quadro group, if known.
    pub fn quadro_group(&self) -> Option<&QuadroGroup> {
        self.quadro_group.as_ref()
    }

    /// Record this node's quadro group (e.g. once the radar/tracer pipeline has resolved it).
    pub fn set_quadro_group(&mut self, qg: QuadroGroup) {
        self.quadro_group = Some(qg);
    }

    /// This node's position in its owning map.
    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// The node's current flags.
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Mutable access to the node's flags.
    pub fn flags_mut(&mut self) -> &mut NodeFlags {
        &mut self.flags
    }

    /// Decode this node's round-progress state.
    pub fn round_state(&self) -> RoundState {
        self.flags.round_state()
    }

    /// Whether the slot is unused.
    pub fn is_void(&self) -> bool {
        self.flags.contains(NodeFlags::VOID)
    }

    /// Whether this is the local node.
    pub fn is_me(&self) -> bool {
        self.flags.contains(NodeFlags::ME)
    }

    /// Whether this node is a border node (has a neighbor diverging at some level).
    pub fn is_bnode(&self) -> bool {
        self.flags.contains(NodeFlags::BNODE)
    }

    /// The node's neighbor links.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Mutable access to the node's neighbor links.
    pub fn links_mut(&mut self) -> &mut Vec<Link> {
        &mut self.links
    }

    /// Find the link to the given peer position, if any.
    pub fn link_to(&self, peer: Pos) -> Option<&Link> {
        self.links.iter().find(|l| l.peer == peer)
    }

    /// Find the link to the given peer position, mutably.
    pub fn link_to_mut(&mut self, peer: Pos) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.peer == peer)
    }

    /// Reset this node to a void, linkless slot: clears flags, RTTs and all QSPN state.
    pub(crate) fn reset_to_void(&mut self) {
        self.flags = NodeFlags::VOID;
        self.links.clear();
        self.quadro_group = None;
    }
}
