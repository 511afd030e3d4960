//! Group map entities (level > 0).

use serde::{Deserialize, Serialize};

use crate::types::{Pos, QuadroGroup, RttMicros};

use super::bitflags_lite;
use super::node::{Link, RoundState};

bitflags_lite! {
    /// Flag set attached to a [`GNode`]. A strict subset of [`super::NodeFlags`]: gnodes have no
    /// `ME` (the local entity's identity lives in its level-0 [`super::Node`]) and no `RNODE`
    /// (adjacency is always mediated by a border node, never direct).
    pub struct GNodeFlags: u16 {
        /// The slot is unused.
        const VOID          = 1 << 0;
        /// The gnode borders a different group at some level above this one.
        const BNODE         = 1 << 1;
        /// The gnode's route table entry needs to be (re)installed.
        const UPDATE        = 1 << 2;
        const QSPN_CLOSED   = 1 << 3;
        const QSPN_OPENED   = 1 << 4;
        const QSPN_STARTER  = 1 << 5;
        const QSPN_OPENER   = 1 << 6;
        const QSPN_OLD      = 1 << 7;
    }
}

impl GNodeFlags {
    /// Decode the round-progress bits into an explicit state, identical in meaning to
    /// [`super::node::NodeFlags::round_state`].
    pub fn round_state(&self) -> RoundState {
        if self.contains(GNodeFlags::QSPN_OPENED) {
            RoundState::Opened
        } else if self.contains(GNodeFlags::QSPN_OPENER) {
            RoundState::Opener
        } else if self.contains(GNodeFlags::QSPN_CLOSED) {
            RoundState::Closed
        } else if self.contains(GNodeFlags::QSPN_STARTER) {
            RoundState::Starter
        } else {
            RoundState::Idle
        }
    }

    /// Clear every QSPN_* bit.
    pub fn clear_round_flags(&mut self) {
        self.remove(
            GNodeFlags::QSPN_CLOSED
                | GNodeFlags::QSPN_OPENED
                | GNodeFlags::QSPN_STARTER
                | GNodeFlags::QSPN_OPENER,
        );
    }
}

/// A group of the level below, seen as a single entity at this level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GNode {
    pos: Pos,
    flags: GNodeFlags,
    /// Count of member entities at the level below currently believed alive. Used by
    /// `qspn_close`/`qspn_open` to tell an empty, evacuated group apart from one that is merely
    /// slow to respond (spec §4.4, Edge cases).
    seeds: u16,
    links: Vec<Link>,
    /// This gnode's position within every containing gnode above it, level 0 first.
    quadro_group: Option<QuadroGroup>,
}

impl GNode {
    /// Create a fresh, `VOID` gnode at the given position.
    pub fn new_void(pos: Pos) -> Self {
        Self {
            pos,
            flags: GNodeFlags::VOID,
            seeds: 0,
            links: Vec::new(),
            quadro_group: None,
        }
    }

    /// This gnode's quadro group, if known.
    pub fn quadro_group(&self) -> Option<&QuadroGroup> {
        self.quadro_group.as_ref()
    }

    /// Record this gnode's quadro group.
    pub fn set_quadro_group(&mut self, qg: QuadroGroup) {
        self.quadro_group = Some(qg);
    }

    /// This gnode's position in its owning map.
    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// The gnode's current flags.
    pub fn flags(&self) -> GNodeFlags {
        self.flags
    }

    /// Mutable access to the gnode's flags.
    pub fn flags_mut(&mut self) -> &mut GNodeFlags {
        &mut self.flags
    }

    /// Decode this gnode's round-progress state.
    pub fn round_state(&self) -> RoundState {
        self.flags.round_state()
    }

    /// Whether the slot is unused.
    pub fn is_void(&self) -> bool {
        self.flags.contains(GNodeFlags::VOID)
    }

    /// Whether this gnode borders a different group at some level above.
    pub fn is_bnode(&self) -> bool {
        self.flags.contains(GNodeFlags::BNODE)
    }

    /// Number of member entities believed alive.
    pub fn seeds(&self) -> u16 {
        self.seeds
    }

    /// Set the seed count.
    pub fn set_seeds(&mut self, seeds: u16) {
        self.seeds = seeds;
    }

    /// Increment the seed count by one (a new descendant appeared).
    pub fn add_seed(&mut self) {
        self.seeds += 1;
    }

    /// Decrement the seed count by one, saturating at zero (a descendant left). Returns the seed
    /// count after the decrement, so callers can garbage-collect on reaching zero.
    pub fn remove_seed(&mut self) -> u16 {
        self.seeds = self.seeds.saturating_sub(1);
        self.seeds
    }

    /// The gnode's neighbor links (to other gnodes at the same level).
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Mutable access to the gnode's neighbor links.
    pub fn links_mut(&mut self) -> &mut Vec<Link> {
        &mut self.links
    }

    /// Find the link to the given peer position, if any.
    pub fn link_to(&self, peer: Pos) -> Option<&Link> {
        self.links.iter().find(|l| l.peer == peer)
    }

    /// RTT to the given peer gnode, if we have a link to it.
    pub fn rtt_to(&self, peer: Pos) -> Option<RttMicros> {
        self.link_to(peer).map(|l| l.rtt)
    }

    /// Reset this gnode to a void, linkless, seedless slot.
    pub(crate) fn reset_to_void(&mut self) {
        self.flags = GNodeFlags::VOID;
        self.seeds = 0;
        self.links.clear();
        self.quadro_group = None;
    }
}
