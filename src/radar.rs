//! Neighbor discovery: periodic ECHO_ME probing, RTT smoothing and the address book that ties a
//! neighbor's IP to the `Pos` the rest of the engine reasons about (spec §4.2, SPEC_FULL §4.2).
//!
//! The module is split into a pure, synchronous core ([`Radar::finalize`]) and a thin async driver
//! ([`Radar::run`]) on purpose: `finalize` takes the RTT samples a scan collected and turns them
//! into [`RadarEvent`]s with no I/O of its own, so tests can drive it directly without a socket, a
//! clock, or `tokio::time::sleep`. This mirrors how the teacher keeps `bgpsim::ospf::local`'s
//! decision logic free of its own event-queue plumbing.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::types::{Pos, RttMicros};

/// Bidirectional `Ipv4Addr <-> Pos` mapping. Owned by the radar because the radar is the component
/// that actually learns a neighbor's address (via ECHO_REPLY) and is the one that must turn a
/// tracer chunk's bare `Pos` back into something a [`crate::transport::Transport`] can address
/// (`from_rpos` in the tracer-unpack path, SPEC_FULL §4.3).
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    by_ip: HashMap<Ipv4Addr, Pos>,
    by_pos: HashMap<Pos, Ipv4Addr>,
}

impl AddressBook {
    /// An empty address book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or update) the address of `pos`. Replaces any stale mapping in either direction,
    /// so a position that is reassigned after a `node_del`/re-`add` cycle does not leave behind a
    /// dangling reverse entry.
    pub fn register(&mut self, ip: Ipv4Addr, pos: Pos) {
        if let Some(old_ip) = self.by_pos.insert(pos, ip) {
            if old_ip != ip {
                self.by_ip.remove(&old_ip);
            }
        }
        self.by_ip.insert(ip, pos);
    }

    /// The position registered for `ip`, if any.
    pub fn pos_for(&self, ip: Ipv4Addr) -> Option<Pos> {
        self.by_ip.get(&ip).copied()
    }

    /// The address registered for `pos`, if any.
    pub fn ip_for(&self, pos: Pos) -> Option<Ipv4Addr> {
        self.by_pos.get(&pos).copied()
    }

    /// Drop whatever mapping exists for `pos` (its slot was garbage-collected).
    pub fn forget(&mut self, pos: Pos) {
        if let Some(ip) = self.by_pos.remove(&pos) {
            self.by_ip.remove(&ip);
        }
    }
}

/// Tunables [`Radar`] needs, lifted out of [`crate::config::EngineConfig`] so the radar does not
/// need the whole engine configuration in scope.
#[derive(Debug, Clone, Copy)]
pub struct RadarConfig {
    /// `MAX_RADAR_SCANS`: upper bound on ECHO_ME bursts sent (and RTT samples kept) per scan.
    pub max_radar_scans: usize,
    /// Minimum RTT delta, in microseconds, that counts as a `link_rtt_change` rather than noise.
    pub rtt_delta_micros: u32,
}

impl From<&crate::config::EngineConfig> for RadarConfig {
    fn from(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            max_radar_scans: cfg.max_radar_scans,
            rtt_delta_micros: cfg.rtt_delta_micros,
        }
    }
}

/// A link state change the radar observed, for the engine to fold into the map and into
/// `send_qspn_now` (spec §4.2: "any non-empty event set marks the owning level for an unscheduled
/// round").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadarEvent {
    /// A peer answered that was not previously known to be up.
    LinkUp {
        /// The peer's position.
        peer: Pos,
        /// The scan's smoothed RTT to the peer.
        rtt: RttMicros,
    },
    /// A known peer's smoothed RTT moved by at least `rtt_delta_micros`.
    LinkRttChange {
        /// The peer's position.
        peer: Pos,
        /// The RTT before this scan.
        old_rtt: RttMicros,
        /// The RTT this scan.
        new_rtt: RttMicros,
    },
    /// A known peer missed two consecutive scans and is presumed gone.
    LinkDown {
        /// The peer's position.
        peer: Pos,
    },
}

/// Neighbor discovery state: the last-known smoothed RTT per peer, and how many consecutive scans
/// each peer has gone unanswered.
///
/// `Radar` does not carry its own scan-exclusivity lock: the spec's `radar_scan_mutex` is the
/// ordinary guarantee that comes from the engine keeping exactly one `Radar` behind one lock
/// (`parking_lot::RwLock` or `tokio::sync::Mutex`, per SPEC_FULL §5) rather than handing out
/// `&mut Radar` to more than one task. A second internal mutex here would only add a place to
/// deadlock against that outer one.
#[derive(Debug, Clone)]
pub struct Radar {
    cfg: RadarConfig,
    address_book: AddressBook,
    echo_id: u32,
    last_rtt: HashMap<Pos, RttMicros>,
    miss_streak: HashMap<Pos, u8>,
}

/// Consecutive scan misses before a peer is declared down. Debounces a single dropped ECHO_REPLY
/// from flapping a link.
const MISS_THRESHOLD: u8 = 2;

impl Radar {
    /// A radar with no peers yet discovered.
    pub fn new(cfg: RadarConfig) -> Self {
        Self {
            cfg,
            address_book: AddressBook::new(),
            echo_id: 0,
            last_rtt: HashMap::new(),
            miss_streak: HashMap::new(),
        }
    }

    /// The address book, for resolving tracer chunk positions back to IPs.
    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    /// The address book, mutably (e.g. to register a newly discovered neighbor).
    pub fn address_book_mut(&mut self) -> &mut AddressBook {
        &mut self.address_book
    }

    /// The echo id the next scan will use (`ECHO_ME`'s `id` field doubles as the scan counter).
    pub fn next_echo_id(&mut self) -> u32 {
        self.echo_id = self.echo_id.wrapping_add(1);
        self.echo_id
    }

    /// The smoothed RTT this radar currently believes for `peer`, if it is up.
    pub fn current_rtt(&self, peer: Pos) -> Option<RttMicros> {
        self.last_rtt.get(&peer).copied()
    }

    /// Fold a scan's collected samples into link state, producing the events the caller should
    /// apply to the map (`link_up`/`link_rtt_change` -> `Map::consider_route`/link install;
    /// `link_down` -> `Map::node_del`).
    ///
    /// `replies` holds, for every peer that answered at least once this scan, the RTT samples
    /// gathered from each ECHO_REPLY burst (bounded at `max_radar_scans` samples by the caller);
    /// `known_peers` is every peer this radar currently tracks or is probing for the first time.
    /// Arithmetic mean of the burst samples is the smoothing function (`radar.h`'s
    /// `rtt_avg`, since the spec names no alternative).
    pub fn finalize(
        &mut self,
        replies: &HashMap<Pos, Vec<RttMicros>>,
        known_peers: &[Pos],
    ) -> Vec<RadarEvent> {
        let mut events = Vec::new();

        for &peer in known_peers {
            match replies.get(&peer).filter(|s| !s.is_empty()) {
                Some(samples) => {
                    self.miss_streak.remove(&peer);
                    let sum: u64 = samples.iter().map(|&r| r as u64).sum();
                    let avg = (sum / samples.len() as u64) as RttMicros;
                    match self.last_rtt.insert(peer, avg) {
                        None => events.push(RadarEvent::LinkUp { peer, rtt: avg }),
                        Some(old) if old.abs_diff(avg) >= self.cfg.rtt_delta_micros => {
                            events.push(RadarEvent::LinkRttChange {
                                peer,
                                old_rtt: old,
                                new_rtt: avg,
                            });
                        }
                        Some(_) => {}
                    }
                }
                None => {
                    let streak = self.miss_streak.entry(peer).or_insert(0);
                    *streak = streak.saturating_add(1);
                    if *streak >= MISS_THRESHOLD && self.last_rtt.remove(&peer).is_some() {
                        self.address_book.forget(peer);
                        events.push(RadarEvent::LinkDown { peer });
                    }
                }
            }
        }

        events
    }

    /// Drive scans forever against a real transport, one every `scan_interval`. Each iteration
    /// sends an ECHO_ME burst to every `known_peers()` entry and waits up to `max_wait` collecting
    /// ECHO_REPLY, then calls [`Radar::finalize`] and hands the resulting events to `on_events`.
    ///
    /// Split out from `finalize` so the always-deterministic decision logic above never has to be
    /// exercised through real sleeps in tests.
    pub async fn run<T, F>(
        mut self,
        transport: std::sync::Arc<T>,
        scan_interval: std::time::Duration,
        max_wait: std::time::Duration,
        mut known_peers: impl FnMut() -> Vec<Pos> + Send,
        mut on_events: F,
    ) where
        T: crate::transport::Transport + 'static,
        F: FnMut(&mut Radar, Vec<RadarEvent>) + Send,
    {
        let mut ticker = tokio::time::interval(scan_interval);
        loop {
            ticker.tick().await;
            let peers = known_peers();
            let echo_id = self.next_echo_id();
            let mut replies: HashMap<Pos, Vec<RttMicros>> = HashMap::new();
            let sent_at = tokio::time::Instant::now();

            for &peer in &peers {
                if let Some(ip) = self.address_book.ip_for(peer) {
                    let probe = crate::wire::Packet {
                        op: crate::wire::OpCode::EchoMe,
                        id: echo_id,
                        src_ip: Ipv4Addr::UNSPECIFIED,
                        bcast: crate::wire::BroadcastHeader {
                            gnode: 0,
                            level: 0,
                            sub_id: 0,
                            flags: crate::wire::BroadcastFlags::empty(),
                        },
                        tracer: crate::wire::TracerHeader {
                            hops: 0,
                            flags: crate::wire::TracerFlags::empty(),
                        },
                        chunks: Vec::new(),
                        bnode_block: None,
                    };
                    if let Err(err) = transport.send_to(ip, probe.encode()).await {
                        log::warn!("radar: echo to {peer} ({ip}) failed: {err}");
                    }
                }
            }

            let deadline = tokio::time::Instant::now() + max_wait;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, transport.recv()).await {
                    Ok(Ok((from, bytes))) => match crate::wire::Packet::decode(&bytes) {
                        Ok(pkt) if pkt.op == crate::wire::OpCode::EchoReply && pkt.id == echo_id => {
                            if let Some(peer) = self.address_book.pos_for(from) {
                                let rtt = sent_at.elapsed().as_micros().min(RttMicros::MAX as u128) as RttMicros;
                                replies.entry(peer).or_default().push(rtt);
                            }
                        }
                        Ok(_) => {}
                        Err(err) => log::debug!("radar: dropping malformed reply from {from}: {err}"),
                    },
                    Ok(Err(err)) => {
                        log::warn!("radar: transport error while waiting for replies: {err}");
                        break;
                    }
                    Err(_) => break,
                }
            }

            for samples in replies.values_mut() {
                samples.truncate(self.cfg.max_radar_scans);
            }

            let events = self.finalize(&replies, &peers);
            on_events(&mut self, events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn radar() -> Radar {
        Radar::new(RadarConfig {
            max_radar_scans: 10,
            rtt_delta_micros: 1_000,
        })
    }

    #[test]
    fn first_reply_is_a_link_up() {
        let mut r = radar();
        let replies = HashMap::from([(1, vec![500, 600])]);
        let events = r.finalize(&replies, &[1]);
        assert_eq!(events, vec![RadarEvent::LinkUp { peer: 1, rtt: 550 }]);
        assert_eq!(r.current_rtt(1), Some(550));
    }

    #[test]
    fn small_rtt_drift_is_not_reported() {
        let mut r = radar();
        r.finalize(&HashMap::from([(1, vec![1_000])]), &[1]);
        let events = r.finalize(&HashMap::from([(1, vec![1_500])]), &[1]);
        assert!(events.is_empty());
    }

    #[test]
    fn large_rtt_drift_is_a_change_event() {
        let mut r = radar();
        r.finalize(&HashMap::from([(1, vec![1_000])]), &[1]);
        let events = r.finalize(&HashMap::from([(1, vec![5_000])]), &[1]);
        assert_eq!(
            events,
            vec![RadarEvent::LinkRttChange {
                peer: 1,
                old_rtt: 1_000,
                new_rtt: 5_000
            }]
        );
    }

    #[test]
    fn link_down_requires_two_consecutive_misses() {
        let mut r = radar();
        r.finalize(&HashMap::from([(1, vec![1_000])]), &[1]);
        let empty = HashMap::new();
        assert!(r.finalize(&empty, &[1]).is_empty());
        assert_eq!(r.finalize(&empty, &[1]), vec![RadarEvent::LinkDown { peer: 1 }]);
    }

    #[test]
    fn a_reply_after_one_miss_resets_the_streak() {
        let mut r = radar();
        r.finalize(&HashMap::from([(1, vec![1_000])]), &[1]);
        r.finalize(&HashMap::new(), &[1]);
        let events = r.finalize(&HashMap::from([(1, vec![1_000])]), &[1]);
        assert!(events.is_empty());
        assert!(r.finalize(&HashMap::new(), &[1]).is_empty());
    }

    #[test]
    fn address_book_round_trips_and_forgets() {
        let mut book = AddressBook::new();
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        book.register(ip, 3);
        assert_eq!(book.pos_for(ip), Some(3));
        assert_eq!(book.ip_for(3), Some(ip));
        book.forget(3);
        assert_eq!(book.pos_for(ip), None);
    }
}
