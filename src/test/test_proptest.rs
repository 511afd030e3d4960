//! Property-based checks (SPEC_FULL §6 and §4): the wire codec round-trips arbitrary packets, and
//! a round's id never moves backwards no matter what sequence of CLOSE ids a node happens to see.

use proptest::prelude::*;

use crate::map::{Link, Map};
use crate::qspn::{self, QspnLevels};
use crate::radar::AddressBook;
use crate::types::{Pos, QspnId, RttMicros};
use crate::wire::{
    BnodeChunk, BroadcastFlags, BroadcastHeader, OpCode, Packet, TracerChunk, TracerFlags, TracerHeader,
};

fn arb_chunk() -> impl Strategy<Value = TracerChunk> {
    (any::<Pos>(), any::<RttMicros>()).prop_map(|(node_pos, rtt_micros)| TracerChunk { node_pos, rtt_micros })
}

fn arb_bnode_chunk() -> impl Strategy<Value = BnodeChunk> {
    (
        any::<Pos>(),
        prop::collection::vec((any::<Pos>(), any::<RttMicros>()), 0..4),
    )
        .prop_map(|(bnode_pos, links)| BnodeChunk { bnode_pos, links })
}

fn arb_packet() -> impl Strategy<Value = Packet> {
    (
        prop_oneof![Just(OpCode::QspnClose), Just(OpCode::QspnOpen), Just(OpCode::TracerPkt)],
        any::<u32>(),
        any::<u32>(),
        (any::<Pos>(), any::<u8>(), any::<u8>(), 0u8..8),
        prop::collection::vec(arb_chunk(), 0..8),
        prop::option::of(prop::collection::vec(arb_bnode_chunk(), 0..4)),
    )
        .prop_map(|(op, id, src_ip_bits, (gnode, level, sub_id, bflags), chunks, bnode_block)| {
            // `Packet::decode` always reports `HAS_BNODE_BLOCK` for a packet that carries one,
            // since `encode` derives that bit from `bnode_block.is_some()` rather than trusting
            // whatever the caller put in `tracer.flags`. Setting it here too keeps the input
            // already in the normal form `decode` would hand back, so round-trip equality holds.
            let mut tracer_flags = TracerFlags::from_bits(0);
            if bnode_block.is_some() {
                tracer_flags.insert(TracerFlags::HAS_BNODE_BLOCK);
            }
            Packet {
                op,
                id,
                src_ip: std::net::Ipv4Addr::from(src_ip_bits),
                bcast: BroadcastHeader {
                    gnode,
                    level,
                    sub_id,
                    flags: BroadcastFlags::from_bits(bflags),
                },
                tracer: TracerHeader {
                    hops: chunks.len() as u16,
                    flags: tracer_flags,
                },
                chunks,
                bnode_block,
            }
        })
}

proptest! {
    #[test]
    fn wire_round_trips_any_packet(packet in arb_packet()) {
        let bytes = packet.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        prop_assert_eq!(packet, decoded);
    }
}

fn single_link_map() -> Map {
    let mut map = Map::new(1, 8);
    map.internal_mut().add(0).unwrap();
    map.internal_mut().add(1).unwrap();
    map.internal_mut().set_me(0).unwrap();
    map.internal_mut().node_mut(0).unwrap().links_mut().push(Link {
        peer: 1,
        level: 0,
        rtt: 10,
        peer_rpos: 0,
    });
    map.internal_mut().node_mut(1).unwrap().links_mut().push(Link {
        peer: 0,
        level: 0,
        rtt: 10,
        peer_rpos: 0,
    });
    map
}

fn close_packet_from_peer(id: QspnId, peer_ip: std::net::Ipv4Addr) -> Packet {
    Packet {
        op: OpCode::QspnClose,
        id,
        src_ip: peer_ip,
        bcast: BroadcastHeader {
            gnode: 0,
            level: 0,
            sub_id: 0,
            flags: BroadcastFlags::empty(),
        },
        tracer: TracerHeader {
            hops: 1,
            flags: TracerFlags::empty(),
        },
        chunks: vec![TracerChunk { node_pos: 1, rtt_micros: 0 }],
        bnode_block: None,
    }
}

proptest! {
    #[test]
    fn current_round_id_never_moves_backwards(ids in prop::collection::vec(0u32..50, 1..8)) {
        let mut map = single_link_map();
        let levels = QspnLevels::new(1);
        let mut book = AddressBook::new();
        book.register(std::net::Ipv4Addr::new(10, 0, 0, 1), 0);
        book.register(std::net::Ipv4Addr::new(10, 0, 0, 2), 1);
        let cfg = crate::config::EngineConfig::default();
        let peer_ip = std::net::Ipv4Addr::new(10, 0, 0, 2);

        let mut last = levels.get(0).unwrap().current_id();
        for id in ids {
            let packet = close_packet_from_peer(id, peer_ip);
            let _ = qspn::close(&mut map, &levels, &book, 0, &packet, &cfg);
            let now = levels.get(0).unwrap().current_id();
            prop_assert!(now >= last, "round id went from {} to {}", last, now);
            last = now;
        }
    }
}
