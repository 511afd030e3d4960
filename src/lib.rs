//! Quantum Shortest Path Netsukuku (QSPN) routing engine.
//!
//! [`Engine`] is the crate's headline type: it owns the [`map::Map`], the per-level
//! [`qspn::QspnLevels`], the [`radar::Radar`], and a [`route::RouteInstaller`], and wires events
//! between them over a pluggable [`transport::Transport`]. Everything else — the wire format, the
//! tracer pipeline, the flood predicates — is a free-standing module [`Engine`] composes rather
//! than a method on it, the same way `bgpsim::network::Network` is a thin owner around
//! `PhysicalNetwork`/`ospf::local` rather than a god object.
//!
//! This crate does not parse configuration files, daemonize, or open a socket on its own — see
//! [`config::EngineConfig`] and [`transport::Transport`] for the seams the embedding host fills in.

pub mod config;
pub mod error;
pub mod flood;
pub mod map;
pub mod qspn;
pub mod radar;
pub mod route;
pub mod tracer;
pub mod transport;
pub mod types;
pub mod wire;

#[cfg(test)]
mod test;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use config::EngineConfig;
use error::Result;
use map::Map;
use qspn::QspnLevels;
use radar::{Radar, RadarConfig, RadarEvent};
use route::{RouteInstaller, RouteSink};
use transport::Transport;
use types::{Level, Pos, RttMicros};
use wire::{BroadcastFlags, BroadcastHeader, OpCode, Packet, TracerFlags, TracerHeader};

/// An in-flight radar scan: the echo id it is waiting on, when it was sent, and the RTT samples
/// gathered from [`OpCode::EchoReply`] packets seen by the main receive loop so far.
///
/// Kept separate from [`Radar`] itself because only one task may ever call
/// [`transport::Transport::recv`] on a given endpoint (SPEC_FULL §5's receive loop is the single
/// consumer); the radar ticker only sends probes and later reads this structure's accumulated
/// samples back out.
struct PendingScan {
    echo_id: u32,
    started_at: Instant,
    replies: HashMap<Pos, Vec<RttMicros>>,
}

/// The engine: one [`Map`], one set of per-level [`QspnLevels`], one [`Radar`], one
/// [`RouteInstaller`]. Generic over the concrete [`RouteSink`] the embedding host provides.
pub struct Engine<S: RouteSink> {
    config: EngineConfig,
    map: RwLock<Map>,
    levels: QspnLevels,
    radar: Mutex<Radar>,
    pending_scan: Mutex<Option<PendingScan>>,
    route_installer: RouteInstaller<S>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl<S: RouteSink + 'static> Engine<S> {
    /// Build a fresh engine. `me` is this node's own position at level 0; every configured level
    /// above it starts with no group membership resolved (the hierarchy builder, out of scope per
    /// spec §1, is expected to call [`Map::internal_mut`]/`external_mut`/`set_me` to populate it).
    pub fn new(config: EngineConfig, me: Pos, sink: S) -> Result<Self> {
        let mut map = Map::new(config.max_levels, config.maxgroupnode);
        map.internal_mut().set_me(me)?;

        Ok(Self {
            levels: QspnLevels::new(config.max_levels),
            radar: Mutex::new(Radar::new(RadarConfig::from(&config))),
            pending_scan: Mutex::new(None),
            route_installer: RouteInstaller::new(sink),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            map: RwLock::new(map),
            config,
        })
    }

    /// The map, for direct inspection or for the (out-of-scope) hierarchy/radar bootstrapping code
    /// to populate before [`Engine::spawn`] is called.
    pub fn map(&self) -> &RwLock<Map> {
        &self.map
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The per-level QSPN round state.
    pub fn levels(&self) -> &QspnLevels {
        &self.levels
    }

    /// The radar, for registering a newly discovered peer's address before it can be probed.
    pub fn radar(&self) -> &Mutex<Radar> {
        &self.radar
    }

    /// Ask the engine to shut down: every spawned task checks this between suspension points and
    /// exits at the next opportunity (spec §7: "checked between suspension points, no rollback").
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Neighbor positions at level 0 this node currently has a link to — what the radar probes and
    /// what a QSPN round floods toward.
    fn known_peers_at(&self, level: Level) -> Vec<Pos> {
        let map = self.map.read();
        match map.level(level).and_then(|m| {
            let me = m.me().ok_or_else(|| {
                error::QspnError::MapInconsistency(format!("no local position at level {level}"))
            })?;
            m.links(me)
        }) {
            Ok(links) => links.iter().map(|l| l.peer).collect(),
            Err(err) => {
                log::debug!("engine: no neighbor list at level {level}: {err}");
                Vec::new()
            }
        }
    }

    /// Fold a batch of [`RadarEvent`]s into the map: new/changed links get a route considered
    /// through themselves at cost 0 (a direct neighbor is its own next hop), departed ones are
    /// deleted; either way the owning level is marked for an unscheduled QSPN round.
    fn apply_radar_events(&self, events: Vec<RadarEvent>) {
        if events.is_empty() {
            return;
        }
        let mut map = self.map.write();
        let Some(me) = map.level(0).ok().and_then(|m| m.me()) else {
            return;
        };
        for event in events {
            match event {
                RadarEvent::LinkUp { peer, rtt } | RadarEvent::LinkRttChange { peer, new_rtt: rtt, .. } => {
                    let _ = map.internal_mut().add(peer);
                    if let Ok(my_node) = map.internal_mut().node_mut(me) {
                        match my_node.link_to_mut(peer) {
                            Some(link) => link.rtt = rtt,
                            None => my_node.links_mut().push(map::Link {
                                peer,
                                level: 0,
                                rtt,
                                peer_rpos: 0,
                            }),
                        }
                    }
                    if map.consider_route(0, peer, peer, rtt, self.config.max_multipath_routes).unwrap_or(false) {
                        let _ = map.set_update(0, peer);
                    }
                }
                RadarEvent::LinkDown { peer } => {
                    let _ = map.node_del(0, peer);
                }
            }
        }
        drop(map);
        self.levels.request_send(0);
    }

    /// One radar scan: send ECHO_ME to every known peer, wait `max_radar_wait` for replies
    /// accumulated by [`Engine::handle_packet`] into [`PendingScan`], then finalize and apply.
    async fn run_radar_scan(&self, transport: &dyn Transport) {
        let peers = self.known_peers_at(0);
        let address_book = self.radar.lock().address_book().clone();

        let echo_id = self.radar.lock().next_echo_id();
        *self.pending_scan.lock() = Some(PendingScan {
            echo_id,
            started_at: Instant::now(),
            replies: HashMap::new(),
        });

        let probe = Packet {
            op: OpCode::EchoMe,
            id: echo_id,
            src_ip: Ipv4Addr::UNSPECIFIED,
            bcast: BroadcastHeader {
                gnode: 0,
                level: 0,
                sub_id: 0,
                flags: BroadcastFlags::empty(),
            },
            tracer: TracerHeader {
                hops: 0,
                flags: TracerFlags::empty(),
            },
            chunks: Vec::new(),
            bnode_block: None,
        };
        let payload = probe.encode();
        for &peer in &peers {
            if let Some(ip) = address_book.ip_for(peer) {
                if let Err(err) = transport.send_to(ip, payload.clone()).await {
                    log::warn!("engine: echo to {peer} ({ip}) failed: {err}");
                }
            }
        }

        tokio::time::sleep(self.config.max_radar_wait).await;

        let scan = self.pending_scan.lock().take();
        if let Some(scan) = scan {
            let events = self.radar.lock().finalize(&scan.replies, &peers);
            self.apply_radar_events(events);
        }
    }

    /// Decode and handle one inbound datagram. Dispatches by [`OpCode`]: answers `EchoMe`, folds
    /// `EchoReply` into whichever scan is currently pending, and runs `TracerPkt`/`QspnClose`/
    /// `QspnOpen` through the pure [`qspn`] handlers before carrying out the resulting
    /// [`qspn::Action`].
    pub async fn handle_packet(&self, from: Ipv4Addr, bytes: Vec<u8>, transport: &dyn Transport) {
        let mut packet = match Packet::decode(&bytes) {
            Ok(pkt) => pkt,
            Err(err) => {
                log::debug!("engine: dropping malformed packet from {from}: {err}");
                return;
            }
        };
        // `src_ip` is part of the wire encoding but is not to be trusted as-sent (spec §6: "filled
        // in by the transport on receive"); stamp it with what the transport actually observed
        // before anything downstream (tracer::unpack in particular) resolves a position from it.
        packet.src_ip = from;

        match packet.op {
            OpCode::EchoMe => {
                let reply = Packet {
                    op: OpCode::EchoReply,
                    src_ip: Ipv4Addr::UNSPECIFIED,
                    ..packet
                };
                if let Err(err) = transport.send_to(from, reply.encode()).await {
                    log::warn!("engine: echo reply to {from} failed: {err}");
                }
            }
            OpCode::EchoReply => {
                let peer = self.radar.lock().address_book().pos_for(from);
                if let (Some(peer), Some(mut scan)) = (peer, self.pending_scan.lock().take()) {
                    if scan.echo_id == packet.id {
                        let rtt = scan.started_at.elapsed().as_micros().min(RttMicros::MAX as u128) as RttMicros;
                        scan.replies.entry(peer).or_default().push(rtt);
                    }
                    *self.pending_scan.lock() = Some(scan);
                }
            }
            OpCode::TracerPktConnect => {
                log::debug!("engine: TRACER_PKT_CONNECT is carried for wire compatibility only, ignoring");
            }
            OpCode::TracerPkt => {
                // A plain tracer re-propagates unchanged save for the traversed hop, with no QSPN
                // round bookkeeping: fold it into the map and flood it onward.
                let address_book = self.radar.lock().address_book().clone();
                let outcome = {
                    let mut map = self.map.write();
                    tracer::unpack(&packet, &address_book).and_then(|unpacked| {
                        tracer::store(&mut map, packet.bcast.level, unpacked.from_pos, &packet.chunks, self.config.max_multipath_routes)?;
                        if let Some(block) = &packet.bnode_block {
                            tracer::store_bnode_block(&mut map, packet.bcast.level, block);
                        }
                        let me = map.level(packet.bcast.level)?.me().ok_or_else(|| {
                            error::QspnError::MapInconsistency(format!(
                                "no local position at level {}",
                                packet.bcast.level
                            ))
                        })?;
                        let candidates = map
                            .level(packet.bcast.level)?
                            .links(me)?
                            .iter()
                            .map(|l| Ok(flood::FloodCandidate {
                                peer: l.peer,
                                level: packet.bcast.level,
                                round_state: map.level(packet.bcast.level)?.round_state(l.peer)?,
                            }))
                            .collect::<Result<Vec<_>>>()?;
                        Ok((unpacked.from_pos, candidates))
                    })
                };
                match outcome {
                    Ok((from_pos, candidates)) => {
                        let payload = packet.encode();
                        flood::FloodDispatcher::send(
                            transport,
                            &address_book,
                            &candidates,
                            Some(from_pos),
                            packet.bcast.level,
                            flood::exclude_all_but_notfrom,
                            &payload,
                        )
                        .await;
                    }
                    Err(err) => log::debug!("engine: dropping tracer packet from {from}: {err}"),
                }
            }
            OpCode::QspnClose | OpCode::QspnOpen => {
                let level = packet.bcast.level;
                let address_book = self.radar.lock().address_book().clone();
                let from_pos = tracer::unpack(&packet, &address_book).ok().map(|u| u.from_pos);
                let action = {
                    let mut map = self.map.write();
                    if packet.op == OpCode::QspnClose {
                        qspn::close(&mut map, &self.levels, &address_book, level, &packet, &self.config)
                    } else {
                        qspn::open(&mut map, &self.levels, &address_book, level, &packet, &self.config)
                    }
                };
                match action {
                    Ok(action) => {
                        let map = self.map.read();
                        if let Err(err) = qspn::dispatch(&map, level, from_pos, transport, &address_book, action).await {
                            log::warn!("engine: failed to dispatch qspn action at level {level}: {err}");
                        }
                    }
                    Err(err) => log::debug!("engine: dropping qspn packet at level {level} from {from}: {err}"),
                }
            }
        }
    }

    /// Spawn every long-lived task: the receive loop, the radar ticker, one QSPN worker per
    /// level, and the route-installer ticker (spec §5). Returns their join handles so the caller
    /// can await a clean shutdown after calling [`Engine::shutdown`].
    pub fn spawn(self: Arc<Self>, transport: Arc<dyn Transport>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let engine = Arc::clone(&self);
            let transport = Arc::clone(&transport);
            handles.push(tokio::spawn(async move {
                while !engine.is_shutting_down() {
                    tokio::select! {
                        _ = engine.shutdown_notify.notified() => break,
                        received = transport.recv() => match received {
                            Ok((from, bytes)) => engine.handle_packet(from, bytes, transport.as_ref()).await,
                            Err(err) => {
                                log::warn!("engine: transport recv failed: {err}");
                                break;
                            }
                        },
                    }
                }
            }));
        }

        {
            let engine = Arc::clone(&self);
            let transport = Arc::clone(&transport);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.radar_scan_interval);
                while !engine.is_shutting_down() {
                    tokio::select! {
                        _ = engine.shutdown_notify.notified() => break,
                        _ = ticker.tick() => engine.run_radar_scan(transport.as_ref()).await,
                    }
                }
            }));
        }

        for level in self.levels.levels() {
            let engine = Arc::clone(&self);
            let transport = Arc::clone(&transport);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.qspn_wait_round(level).min(std::time::Duration::from_secs(1)));
                while !engine.is_shutting_down() {
                    tokio::select! {
                        _ = engine.shutdown_notify.notified() => break,
                        _ = ticker.tick() => {
                            if engine.levels.get(level).map(|s| s.take_send_request()).unwrap_or(false) {
                                let address_book = engine.radar.lock().address_book().clone();
                                if let Err(err) = qspn::send(&engine.map, &engine.levels, level, &engine.config, transport.as_ref(), &address_book).await {
                                    log::warn!("engine: qspn send at level {level} failed: {err}");
                                }
                            }
                        }
                    }
                }
            }));
        }

        {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
                while !engine.is_shutting_down() {
                    tokio::select! {
                        _ = engine.shutdown_notify.notified() => break,
                        _ = ticker.tick() => {
                            for level in engine.levels.levels() {
                                let mut map = engine.map.write();
                                if let Err(err) = engine.route_installer.tick(&mut map, level) {
                                    log::warn!("engine: route install at level {level} failed: {err}");
                                }
                            }
                        }
                    }
                }
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::TestRouteSink;

    #[test]
    fn new_engine_places_itself_at_level_zero() {
        let engine = Engine::new(EngineConfig::default(), 3, TestRouteSink::new()).unwrap();
        assert_eq!(engine.map().read().internal().me(), Some(3));
    }

    #[test]
    fn known_peers_at_reflects_map_links() {
        let engine = Engine::new(EngineConfig::default(), 0, TestRouteSink::new()).unwrap();
        {
            let mut map = engine.map().write();
            map.internal_mut().add(1).unwrap();
            map.internal_mut().node_mut(0).unwrap().links_mut().push(map::Link {
                peer: 1,
                level: 0,
                rtt: 500,
                peer_rpos: 0,
            });
        }
        assert_eq!(engine.known_peers_at(0), vec![1]);
    }

    #[test]
    fn apply_radar_events_installs_a_direct_route_for_a_new_link() {
        let engine = Engine::new(EngineConfig::default(), 0, TestRouteSink::new()).unwrap();
        engine.map().write().internal_mut().add(1).unwrap();

        engine.apply_radar_events(vec![RadarEvent::LinkUp { peer: 1, rtt: 200 }]);

        let map = engine.map().read();
        assert_eq!(
            map.routes(0).unwrap().best(1),
            Some(map::RouteEntry { next_hop: 1, rtt: 200 })
        );
        assert!(map.internal().node(1).unwrap().flags().contains(map::NodeFlags::UPDATE));
        drop(map);

        engine.route_installer.tick(&mut engine.map().write(), 0).unwrap();
        assert_eq!(
            engine.route_installer.sink().snapshot().get(&(0, 1)),
            Some(&vec![map::RouteEntry { next_hop: 1, rtt: 200 }])
        );
    }

    #[test]
    fn apply_radar_events_withdraws_on_link_down() {
        let engine = Engine::new(EngineConfig::default(), 0, TestRouteSink::new()).unwrap();
        engine.map().write().internal_mut().add(1).unwrap();
        engine.apply_radar_events(vec![RadarEvent::LinkUp { peer: 1, rtt: 200 }]);
        engine.route_installer.tick(&mut engine.map().write(), 0).unwrap();
        assert!(engine.route_installer.sink().snapshot().contains_key(&(0, 1)));

        engine.apply_radar_events(vec![RadarEvent::LinkDown { peer: 1 }]);

        let map = engine.map().read();
        assert!(map.routes(0).unwrap().best(1).is_none());
        drop(map);

        engine.route_installer.tick(&mut engine.map().write(), 0).unwrap();
        assert!(!engine.route_installer.sink().snapshot().contains_key(&(0, 1)));
    }
}
