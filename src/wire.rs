//! Wire format (spec §6): big-endian packet envelope shared by every op code.
//!
//! Kept dependency-free beyond [`crate::error::TracerError`] — none of the teacher's or pack's
//! crates in scope here pull in a byte-order crate for a format this small, so encoding goes
//! through plain `to_be_bytes`/`from_be_bytes` (SPEC_FULL §6).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::TracerError;
use crate::map::bitflags_lite;
use crate::types::{Level, Pos, RttMicros, SubId};

/// Operation codes carried in the packet header's `op` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    /// Radar probe.
    EchoMe,
    /// Radar probe reply.
    EchoReply,
    /// Plain tracer propagation (STARTER-only forwarding, or co-starter wavefronts).
    TracerPkt,
    /// Tracer packet used to bootstrap a brand-new connection (unused by the core engine, carried
    /// for wire compatibility with the op code table in SPEC_FULL §6).
    TracerPktConnect,
    /// CLOSE phase of a QSPN round.
    QspnClose,
    /// OPEN phase of a QSPN round.
    QspnOpen,
}

impl OpCode {
    fn to_u16(self) -> u16 {
        match self {
            OpCode::EchoMe => 1,
            OpCode::EchoReply => 2,
            OpCode::TracerPkt => 3,
            OpCode::TracerPktConnect => 4,
            OpCode::QspnClose => 5,
            OpCode::QspnOpen => 6,
        }
    }

    fn from_u16(v: u16) -> Result<Self, TracerError> {
        Ok(match v {
            1 => OpCode::EchoMe,
            2 => OpCode::EchoReply,
            3 => OpCode::TracerPkt,
            4 => OpCode::TracerPktConnect,
            5 => OpCode::QspnClose,
            6 => OpCode::QspnOpen,
            other => return Err(TracerError::MalformedPacket(format!("unknown op code {other}"))),
        })
    }
}

bitflags_lite! {
    /// Broadcast header flags (spec §6): `[u16 g_node][u8 level][u8 sub_id][u8 flags]`.
    pub struct BroadcastFlags: u8 {
        /// All of the starter's links are QSPN_CLOSED; set on the outgoing CLOSE once true.
        const QSPN_BNODE_CLOSED   = 1 << 0;
        /// All bnodes at this level have opened; set on the outgoing OPEN once true.
        const QSPN_BNODE_OPENED   = 1 << 1;
        /// This wavefront is restricted to fellow STARTERs (`exclude_from_and_glevel_and_notstarter`).
        const BCAST_TRACER_STARTERS = 1 << 2;
    }
}

bitflags_lite! {
    /// Tracer header flags (spec §6): `[u16 hops][u8 flags]`. The wire format leaves this byte's
    /// meaning to the implementation beyond carrying the chunk count; this engine uses bit 0 to
    /// say whether a bnode block appendix follows the chunk array, since the framing has to be
    /// self-describing to satisfy `tracer_unpack`'s "declared size is inconsistent" failure mode.
    pub struct TracerFlags: u8 {
        /// A bnode block appendix follows the tracer chunk array.
        const HAS_BNODE_BLOCK = 1 << 0;
    }
}

/// `[u16 g_node][u8 level][u8 sub_id][u8 flags]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastHeader {
    /// Gid of the group this broadcast concerns.
    pub gnode: Pos,
    /// Level the broadcast is addressed to.
    pub level: Level,
    /// Opener identifier distinguishing concurrent OPEN waves (only meaningful for `QspnOpen`).
    pub sub_id: SubId,
    /// Broadcast-level flags.
    pub flags: BroadcastFlags,
}

/// `[u16 hops][u8 flags]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerHeader {
    /// Number of chunks that follow.
    pub hops: u16,
    /// Tracer-level flags.
    pub flags: TracerFlags,
}

/// `[u16 node_pos][u32 rtt_micros]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerChunk {
    /// Position of this hop in its map.
    pub node_pos: Pos,
    /// RTT delta attributed to this hop (see `tracer_store`'s accumulation rule).
    pub rtt_micros: RttMicros,
}

/// One border node's link-RTT vector within an optional bnode block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BnodeChunk {
    /// Position of the border node, in the level the enclosing tracer concerns.
    pub bnode_pos: Pos,
    /// `(peer gnode position, accumulated RTT)` pairs this border node offers.
    pub links: Vec<(Pos, RttMicros)>,
}

/// `[u16 bchunks_count]` followed by that many [`BnodeChunk`] records.
pub type BnodeBlock = Vec<BnodeChunk>;

/// A fully-decoded packet, regardless of op code. Echo packets carry an empty chunk array and a
/// degenerate broadcast header (spec §3's envelope is shared by every op code; echo packets reuse
/// the `id` field as the scan's `echo_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// The op code.
    pub op: OpCode,
    /// Monotone broadcast id per source (or the radar's `echo_id` for echo packets).
    pub id: u32,
    /// Source address, filled in by the transport on receive.
    pub src_ip: Ipv4Addr,
    /// Broadcast header.
    pub bcast: BroadcastHeader,
    /// Tracer header.
    pub tracer: TracerHeader,
    /// Tracer chunk array, `tracer.hops` entries long.
    pub chunks: Vec<TracerChunk>,
    /// Optional bnode block appendix.
    pub bnode_block: Option<BnodeBlock>,
}

impl Packet {
    /// Serialize into a contiguous, big-endian byte buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.bcast.gnode.to_be_bytes());
        body.push(self.bcast.level);
        body.push(self.bcast.sub_id);
        body.push(self.bcast.flags.bits());

        let has_bnode = self.bnode_block.is_some();
        let mut tracer_flags = self.tracer.flags;
        if has_bnode {
            tracer_flags.insert(TracerFlags::HAS_BNODE_BLOCK);
        }
        body.extend_from_slice(&self.tracer.hops.to_be_bytes());
        body.push(tracer_flags.bits());

        for chunk in &self.chunks {
            body.extend_from_slice(&chunk.node_pos.to_be_bytes());
            body.extend_from_slice(&chunk.rtt_micros.to_be_bytes());
        }

        if let Some(block) = &self.bnode_block {
            body.extend_from_slice(&(block.len() as u16).to_be_bytes());
            for bchunk in block {
                body.extend_from_slice(&bchunk.bnode_pos.to_be_bytes());
                body.extend_from_slice(&(bchunk.links.len() as u16).to_be_bytes());
                for (peer_gnode, rtt) in &bchunk.links {
                    body.extend_from_slice(&peer_gnode.to_be_bytes());
                    body.extend_from_slice(&rtt.to_be_bytes());
                }
            }
        }

        let total_len = (12 + body.len()) as u16;
        let mut out = Vec::with_capacity(total_len as usize);
        out.extend_from_slice(&self.op.to_u16().to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&u32::from(self.src_ip).to_be_bytes());
        out.extend_from_slice(&total_len.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parse a packet out of raw bytes. The `src` address, as seen by the transport, is used for
    /// the `src_ip` field only when the wire itself does not need to be self-describing about it;
    /// here the wire carries its own `src_ip` so `src` is only sanity-checked against it by
    /// callers that care (kept out of this function to stay a pure decoder).
    pub fn decode(bytes: &[u8]) -> Result<Self, TracerError> {
        if bytes.len() < 12 {
            return Err(TracerError::MalformedPacket(
                "packet shorter than the fixed header".into(),
            ));
        }
        let op = OpCode::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))?;
        let id = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        let src_ip = Ipv4Addr::from(u32::from_be_bytes(bytes[6..10].try_into().unwrap()));
        let total_len = u16::from_be_bytes([bytes[10], bytes[11]]) as usize;
        if total_len != bytes.len() {
            return Err(TracerError::MalformedPacket(format!(
                "declared length {total_len} does not match received length {}",
                bytes.len()
            )));
        }

        let mut cursor = 12usize;
        let need = |cursor: usize, n: usize| -> Result<(), TracerError> {
            if cursor + n > bytes.len() {
                Err(TracerError::MalformedPacket("truncated packet".into()))
            } else {
                Ok(())
            }
        };

        need(cursor, 5)?;
        let gnode = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
        let level = bytes[cursor + 2];
        let sub_id = bytes[cursor + 3];
        let flags = BroadcastFlags::from_bits(bytes[cursor + 4]);
        cursor += 5;
        let bcast = BroadcastHeader {
            gnode,
            level,
            sub_id,
            flags,
        };

        need(cursor, 3)?;
        let hops = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
        let tracer_flags = TracerFlags::from_bits(bytes[cursor + 2]);
        cursor += 3;

        let mut chunks = Vec::with_capacity(hops as usize);
        for _ in 0..hops {
            need(cursor, 6)?;
            let node_pos = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
            let rtt_micros = u32::from_be_bytes(bytes[cursor + 2..cursor + 6].try_into().unwrap());
            chunks.push(TracerChunk {
                node_pos,
                rtt_micros,
            });
            cursor += 6;
        }

        let bnode_block = if tracer_flags.contains(TracerFlags::HAS_BNODE_BLOCK) {
            need(cursor, 2)?;
            let bchunks_count = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
            cursor += 2;
            let mut block = Vec::with_capacity(bchunks_count as usize);
            for _ in 0..bchunks_count {
                need(cursor, 4)?;
                let bnode_pos = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
                let link_count = u16::from_be_bytes([bytes[cursor + 2], bytes[cursor + 3]]);
                cursor += 4;
                let mut links = Vec::with_capacity(link_count as usize);
                for _ in 0..link_count {
                    need(cursor, 6)?;
                    let peer_gnode = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
                    let rtt = u32::from_be_bytes(bytes[cursor + 2..cursor + 6].try_into().unwrap());
                    links.push((peer_gnode, rtt));
                    cursor += 6;
                }
                block.push(BnodeChunk { bnode_pos, links });
            }
            Some(block)
        } else {
            None
        };

        if cursor != bytes.len() {
            return Err(TracerError::MalformedPacket(
                "trailing bytes after a well-formed packet".into(),
            ));
        }

        Ok(Packet {
            op,
            id,
            src_ip,
            bcast,
            tracer: TracerHeader {
                hops,
                flags: tracer_flags,
            },
            chunks,
            bnode_block,
        })
    }
}
