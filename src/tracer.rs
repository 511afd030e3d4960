//! Tracer packet pipeline: unpacking an incoming tracer, folding it into the map, and building the
//! packet this node forwards onward (spec §4.3, grounded against `tracer_pkt_build`/`tracer_store`/
//! `tracer_add_rtt` in `examples/original_source/src/qspn.c`).
//!
//! Chunks are appended to the end of the chunk array, not prepended. The specification's prose for
//! `tracer_pkt_build` reads as though new hops are pushed to the front, but that is inconsistent
//! with its own `tracer_store` rule ("chunk `i`, `i == 0` is the originator") and with the original
//! source, whose `tracer_add_rtt(rtt, tracer, hops - 1)` call sites always touch the *last* index —
//! the chunk most recently appended. Appending is the only reading consistent with both, and is
//! what this module does; see DESIGN.md for the full note.

use crate::error::{QspnRoundError, Result};
use crate::map::Map;
use crate::radar::AddressBook;
use crate::types::{Level, Pos, RttMicros};
use crate::wire::{BnodeBlock, Packet, TracerChunk};

/// An incoming tracer resolved against the address book: who physically handed it to us.
#[derive(Debug, Clone, Copy)]
pub struct Unpacked {
    /// Position of the immediate sender (not necessarily the originator).
    pub from_pos: Pos,
}

/// Resolve the sender of a tracer-bearing packet and sanity-check its framing
/// (`tracer_unpack`). Does not mutate anything; [`store`] is the side-effecting half.
pub fn unpack(packet: &Packet, address_book: &AddressBook) -> Result<Unpacked> {
    if packet.chunks.len() != packet.tracer.hops as usize {
        return Err(crate::error::QspnError::Tracer(
            crate::error::TracerError::MalformedPacket(format!(
                "tracer header declares {} hops but carries {} chunks",
                packet.tracer.hops,
                packet.chunks.len()
            )),
        ));
    }
    let from_pos = address_book.pos_for(packet.src_ip).ok_or_else(|| {
        crate::error::QspnError::Tracer(crate::error::TracerError::MalformedPacket(format!(
            "tracer arrived from unregistered address {}",
            packet.src_ip
        )))
    })?;
    Ok(Unpacked { from_pos })
}

/// Append our own hop to a tracer's chunk list (`tracer_pkt_build`). `link_rtt` is the RTT of the
/// link we are about to send this tracer out on; the new chunk's accumulated cost is the previous
/// last chunk's cost plus that link RTT, or zero if this is the very first chunk (we are the
/// originator).
pub fn build(
    chunks: &[TracerChunk],
    hop: Pos,
    link_rtt: RttMicros,
    max_hops: usize,
) -> Result<Vec<TracerChunk>> {
    if chunks.len() >= max_hops {
        return Err(crate::error::QspnError::Tracer(
            crate::error::TracerError::TooManyHops { max: max_hops },
        ));
    }
    let cumulative = chunks.last().map(|c| c.rtt_micros).unwrap_or(0) + link_rtt;
    let mut out = Vec::with_capacity(chunks.len() + 1);
    out.extend_from_slice(chunks);
    out.push(TracerChunk {
        node_pos: hop,
        rtt_micros: cumulative,
    });
    Ok(out)
}

/// Pure propagation, no new hop of our own: bump the most recently appended chunk's accumulated
/// RTT by the link we just forwarded across (`tracer_add_rtt`). Used when re-broadcasting a
/// tracer unchanged except for the cost of the hop we add it over.
pub fn add_rtt(chunks: &mut [TracerChunk], link_rtt: RttMicros) -> Result<()> {
    match chunks.last_mut() {
        Some(chunk) => {
            chunk.rtt_micros = chunk.rtt_micros.saturating_add(link_rtt);
            Ok(())
        }
        None => Err(crate::error::QspnError::Tracer(
            crate::error::TracerError::MalformedPacket("add_rtt on an empty tracer".into()),
        )),
    }
}

/// Fold a tracer's chunk list into a level's route table, and clear `QSPN_OLD` on every hop named
/// (`tracer_store`): each destination the tracer names is reachable by forwarding to whoever just
/// handed us this packet, at the cost recorded in that destination's chunk. Flags every changed
/// destination `UPDATE` (`MAP_UPDATE`) so the route installer actually pushes it to the sink, and
/// returns the same set of destinations.
pub fn store(
    map: &mut Map,
    level: Level,
    from_pos: Pos,
    chunks: &[TracerChunk],
    max_multipath: usize,
) -> Result<Vec<Pos>> {
    let mut updated = Vec::new();
    for chunk in chunks {
        let _ = map.clear_old(level, chunk.node_pos);
        if map.consider_route(level, chunk.node_pos, from_pos, chunk.rtt_micros, max_multipath)? {
            let _ = map.set_update(level, chunk.node_pos);
            updated.push(chunk.node_pos);
        }
    }
    Ok(updated)
}

/// Merge a tracer's optional bnode block appendix into the border map: each entry names a border
/// node and the foreign groups it can reach, at the level the enclosing tracer concerns.
pub fn store_bnode_block(map: &mut Map, level: Level, block: &BnodeBlock) {
    for bchunk in block {
        let routes = bchunk
            .links
            .iter()
            .map(|&(dest_gid, rtt)| crate::map::bmap::BorderRoute { dest_gid, rtt })
            .collect();
        map.bmap_mut().set_routes(level, bchunk.bnode_pos, routes);
    }
}

/// Reject a tracer whose originator is ourselves within the same round (`QSPN_STARTER` loop
/// check): a tracer that has come all the way back to its starter without anyone dropping it is a
/// protocol violation, not a route to install.
pub fn reject_loop(chunks: &[TracerChunk], me: Pos, level: Level) -> Result<()> {
    if chunks.iter().any(|c| c.node_pos == me) {
        return Err(QspnRoundError::LoopDetected { level }.into());
    }
    Ok(())
}
