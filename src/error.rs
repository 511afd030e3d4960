//! Error types for the engine, aggregated the way [`crate::map`], [`crate::tracer`] and
//! [`crate::qspn`] each define a focused error enum that rolls up into one top-level error.

use thiserror::Error;

use crate::types::{Level, Pos, QspnId};

/// Error produced by the [`crate::map`] module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// No entity exists at that position.
    #[error("no entity at level {level} position {pos}")]
    NotFound {
        /// The level that was queried.
        level: Level,
        /// The position that was queried.
        pos: Pos,
    },
    /// Attempted to delete or look up a border node that is not registered in the bmap.
    #[error("position {pos} is not a border node at level {level}")]
    NotABorderNode {
        /// The level that was queried.
        level: Level,
        /// The position that was queried.
        pos: Pos,
    },
    /// `rt_find_table` (or its equivalent) could not find a free slot. The spec treats this as
    /// non-fatal: log it and keep the existing table assignment.
    #[error("no free slot in the routing table at level {level}; keeping existing assignment")]
    TableFull {
        /// The level at which the table ran out of slots.
        level: Level,
    },
}

/// Error produced while packing or parsing tracer packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TracerError {
    /// The wire framing is inconsistent with the declared lengths.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    /// Building a tracer packet would exceed `MAX_TRACER_HOPS`.
    #[error("tracer packet would exceed the maximum of {max} hops")]
    TooManyHops {
        /// The configured maximum.
        max: usize,
    },
}

/// Error produced by the QSPN round state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QspnRoundError {
    /// The packet's round id is older than the level's current round; it must be dropped.
    #[error("stale round: packet id {packet_id} < current id {current_id} at level {level}")]
    StaleRound {
        /// The level the packet was addressed to.
        level: Level,
        /// The round id carried by the packet.
        packet_id: QspnId,
        /// The round id currently held by the engine.
        current_id: QspnId,
    },
    /// The tracer's originator is ourselves, within the same round: a loop.
    #[error("loop detected: we are the originator of this tracer at level {level}")]
    LoopDetected {
        /// The level the packet was addressed to.
        level: Level,
    },
}

/// Top-level error returned by engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QspnError {
    /// An error from the map model.
    #[error("map error: {0}")]
    Map(#[from] MapError),
    /// An error from the tracer pipeline.
    #[error("tracer error: {0}")]
    Tracer(#[from] TracerError),
    /// An error from the QSPN round state machine.
    #[error("qspn round error: {0}")]
    Round(#[from] QspnRoundError),
    /// An invariant the spec marks as unreachable-by-design was nonetheless observed. This is
    /// logged at ERROR and the engine preserves its existing state rather than corrupt it.
    #[error("map inconsistency: {0}")]
    MapInconsistency(String),
}

/// Convenience alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, QspnError>;
