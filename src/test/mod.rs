//! Scenario-level simulation tests (SPEC_FULL §8): each file below drives a small fixed topology
//! through the real [`crate::qspn`] handlers with no transport, socket, or tokio runtime involved.
//! [`Network`] is the harness every scenario shares: packet delivery is a synchronous work queue,
//! and [`crate::flood::FloodDispatcher::targets`] decides where each outgoing packet goes next —
//! the same split the unit tests in `qspn.rs` use, just wired across more than one node's map.

mod test_proptest;

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use crate::config::EngineConfig;
use crate::flood::{exclude_from_and_glevel_and_closed, FloodCandidate, FloodDispatcher};
use crate::map::{Link, Map, RoundFlag};
use crate::qspn::{self, Action, QspnLevels};
use crate::radar::AddressBook;
use crate::tracer;
use crate::types::{Level, Pos, QspnId};
use crate::wire::{BroadcastFlags, BroadcastHeader, OpCode, Packet, TracerFlags, TracerHeader};

/// One simulated node: its own belief about the mesh, plus its own round bookkeeping. Nodes never
/// share a [`Map`] — each holds its own, exactly as the engine does.
struct SimNode {
    map: Map,
    levels: QspnLevels,
}

/// A handful of [`SimNode`]s wired together behind one shared [`AddressBook`] (the address book is
/// link-layer-ish bookkeeping every participant agrees on, not per-node private state).
struct Network {
    cfg: EngineConfig,
    book: AddressBook,
    nodes: HashMap<Pos, SimNode>,
    inbox: VecDeque<(Pos, Packet)>,
}

impl Network {
    /// `max_levels`/`capacity` default to small values that comfortably fit the handful of nodes
    /// every scenario below uses.
    fn new(positions: &[Pos]) -> Self {
        Self::with_levels(positions, 2, 16)
    }

    fn with_levels(positions: &[Pos], max_levels: Level, capacity: u16) -> Self {
        let mut nodes = HashMap::new();
        let mut book = AddressBook::new();
        for &pos in positions {
            let mut map = Map::new(max_levels, capacity);
            map.internal_mut().set_me(pos).unwrap();
            nodes.insert(pos, SimNode {
                map,
                levels: QspnLevels::new(max_levels),
            });
            book.register(Ipv4Addr::new(10, 0, (pos / 256) as u8, (pos % 256) as u8), pos);
        }
        Self {
            cfg: EngineConfig::default(),
            book,
            nodes,
            inbox: VecDeque::new(),
        }
    }

    /// Wire a symmetric level-0 link between `a` and `b` at `rtt`, seeding a direct route on each
    /// side the way [`crate::Engine::apply_radar_events`] does for a `LinkUp` event: a fresh
    /// neighbor is its own next hop, at the link's own RTT.
    fn link(&mut self, a: Pos, b: Pos, rtt: u32) {
        let max_multipath = self.cfg.max_multipath_routes;
        self.nodes.get_mut(&a).unwrap().map.internal_mut().add(b).unwrap();
        self.nodes.get_mut(&b).unwrap().map.internal_mut().add(a).unwrap();
        self.nodes
            .get_mut(&a)
            .unwrap()
            .map
            .internal_mut()
            .node_mut(a)
            .unwrap()
            .links_mut()
            .push(Link {
                peer: b,
                level: 0,
                rtt,
                peer_rpos: 0,
            });
        self.nodes
            .get_mut(&b)
            .unwrap()
            .map
            .internal_mut()
            .node_mut(b)
            .unwrap()
            .links_mut()
            .push(Link {
                peer: a,
                level: 0,
                rtt,
                peer_rpos: 0,
            });
        self.nodes.get_mut(&a).unwrap().map.consider_route(0, b, b, rtt, max_multipath).unwrap();
        self.nodes.get_mut(&b).unwrap().map.consider_route(0, a, a, rtt, max_multipath).unwrap();
    }

    /// Tear down the level-0 link between `a` and `b` the way a `LinkDown` radar event does:
    /// delete each side's peer entity outright (`Map::node_del`), which also withdraws whatever
    /// route the deleted entity was the destination of. This is what distinguishes a "link
    /// removed" scenario from a "node left" one at the harness level — the peer can still be
    /// rediscovered and re-added later, same as the real engine would on a fresh `LinkUp`.
    fn unlink(&mut self, a: Pos, b: Pos) {
        self.nodes.get_mut(&a).unwrap().map.node_del(0, b).unwrap();
        self.nodes.get_mut(&b).unwrap().map.node_del(0, a).unwrap();
    }

    /// Remove a node from the simulation outright, without touching anyone's link list: every
    /// subsequent packet addressed to it is lost in transit, the same as a crashed process that
    /// never replies again. Distinct from [`Network::unlink`], which updates both sides' maps
    /// immediately; here only the natural `QSPN_OLD` sweep in [`qspn::new_round`] ever notices.
    fn kill(&mut self, pos: Pos) {
        self.nodes.remove(&pos);
    }

    fn candidates(&self, at: Pos, level: Level) -> Vec<FloodCandidate> {
        let node = &self.nodes[&at];
        let level_map = node.map.level(level).unwrap();
        level_map
            .links(at)
            .unwrap()
            .iter()
            .map(|l| FloodCandidate {
                peer: l.peer,
                level,
                round_state: level_map.round_state(l.peer).unwrap(),
            })
            .collect()
    }

    /// Have `starter` begin a round at `level` (the pure half of `qspn_send`): resets its own round
    /// bookkeeping, marks itself `STARTER`, and queues an empty-history CLOSE to every neighbor.
    fn start_round(&mut self, starter: Pos, level: Level, new_id: QspnId) {
        let node = self.nodes.get_mut(&starter).unwrap();
        qspn::new_round(&mut node.map, &node.levels, level, Some(new_id), None).unwrap();
        node.map.set_round_flag(level, starter, RoundFlag::Starter).unwrap();
        let chunks = tracer::build(&[], starter, 0, self.cfg.max_tracer_hops).unwrap();
        let packet = Packet {
            op: OpCode::QspnClose,
            id: new_id,
            src_ip: self.book.ip_for(starter).unwrap(),
            bcast: BroadcastHeader {
                gnode: 0,
                level,
                sub_id: 0,
                flags: BroadcastFlags::empty(),
            },
            tracer: TracerHeader {
                hops: chunks.len() as u16,
                flags: TracerFlags::empty(),
            },
            chunks,
            bnode_block: None,
        };
        let candidates = self.candidates(starter, level);
        for peer in FloodDispatcher::targets(
            &candidates,
            Some(starter),
            level,
            exclude_from_and_glevel_and_closed,
        ) {
            self.enqueue(peer, starter, packet.clone());
        }
    }

    /// Queue `packet` as arriving at `to`, stamping `src_ip` the way [`crate::Engine::handle_packet`]
    /// does on receipt: to the sender's own registered address, never trusting whatever the packet
    /// already carried.
    fn enqueue(&mut self, to: Pos, from: Pos, mut packet: Packet) {
        packet.src_ip = self.book.ip_for(from).unwrap();
        self.inbox.push_back((to, packet));
    }

    /// Drain the inbox, feeding every queued packet through its destination's `close`/`open`
    /// handler and re-queuing whatever [`Action`] results, until the network goes quiet. Panics if
    /// more than `max_steps` deliveries happen first — a converging round on these small
    /// topologies never needs anywhere near that many, so hitting the cap means something is
    /// flooding forever.
    fn run_to_quiescence(&mut self, max_steps: usize) -> usize {
        let mut delivered = 0;
        while let Some((to, packet)) = self.inbox.pop_front() {
            delivered += 1;
            assert!(
                delivered <= max_steps,
                "round did not converge within {max_steps} deliveries"
            );
            self.deliver(to, packet);
        }
        delivered
    }

    fn deliver(&mut self, to: Pos, packet: Packet) {
        let level = packet.bcast.level;
        let from = self.book.pos_for(packet.src_ip).unwrap();
        let book = self.book.clone();
        let cfg = self.cfg.clone();
        let Some(node) = self.nodes.get_mut(&to) else {
            // `to` has left the simulation (see `kill`): a packet to a node that is simply gone
            // is indistinguishable from one lost in transit, so it is dropped the same way.
            return;
        };
        let action = {
            match packet.op {
                OpCode::QspnClose => qspn::close(&mut node.map, &node.levels, &book, level, &packet, &cfg),
                OpCode::QspnOpen => qspn::open(&mut node.map, &node.levels, &book, level, &packet, &cfg),
                other => panic!("unexpected op {other:?} in a qspn-only simulation"),
            }
        };
        let action = match action {
            Ok(action) => action,
            Err(_) => return,
        };
        match action {
            Action::Drop => {}
            Action::Flood { packet, exclude } => {
                let candidates = self.candidates(to, level);
                for peer in FloodDispatcher::targets(&candidates, Some(from), level, exclude) {
                    self.enqueue(peer, to, packet.clone());
                }
            }
            Action::OpenStart {
                to_from,
                to_from_peer,
                to_all,
            } => {
                self.enqueue(to_from_peer, to, to_from);
                let candidates = self.candidates(to, level);
                for peer in FloodDispatcher::targets(
                    &candidates,
                    Some(to_from_peer),
                    level,
                    crate::flood::exclude_from_and_glevel,
                ) {
                    self.enqueue(peer, to, to_all.clone());
                }
            }
        }
    }

    /// The best next hop (and its RTT) `from` currently has toward `dest` at level 0.
    fn best_route(&self, from: Pos, dest: Pos) -> Option<crate::map::RouteEntry> {
        self.nodes[&from].map.routes(0).unwrap().best(dest)
    }
}
