//! The QSPN round state machine (spec §4.4), grounded step-for-step against
//! `examples/original_source/src/qspn.c`'s `qspn_send`/`qspn_close`/`qspn_open`/`qspn_open_start`.
//!
//! Each per-level round keeps its bookkeeping in a [`QspnLevelState`]: the round identity clock,
//! the OPEN-phase reply buffer (spec's "QSPN buffer per (level, neighbor)"), and the two bnode
//! close/open counters the hierarchy-aware termination check needs. [`close`] and [`open`] are the
//! pure receive handlers: they mutate the [`Map`] and return an [`Action`] describing what to
//! transmit next, without touching a socket themselves — the same split [`crate::radar`] uses
//! between `finalize` (decision logic) and `run` (I/O), so the hard-to-get-right state transitions
//! stay testable without a transport or a clock.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::error::{MapError, QspnError, QspnRoundError, Result};
use crate::flood::{self, ExcludeFn, FloodCandidate, FloodDispatcher};
use crate::map::{Link, Map, RoundFlag, RoundState};
use crate::radar::AddressBook;
use crate::transport::Transport;
use crate::tracer;
use crate::types::{Level, Pos, QspnId, SubId};
use crate::wire::{BroadcastFlags, BroadcastHeader, OpCode, Packet, TracerFlags, TracerHeader};

/// What a received CLOSE/OPEN (or a self-initiated round) wants sent next. The caller (the
/// engine's receive loop, or a test) is responsible for actually handing the payload to a
/// [`crate::transport::Transport`]; `qspn` itself never calls one.
pub enum Action {
    /// The packet was dropped; there is nothing to transmit.
    Drop,
    /// Flood `packet` at the round's level using `exclude`.
    Flood {
        /// The packet to send.
        packet: Packet,
        /// Which neighbors to skip.
        exclude: ExcludeFn,
    },
    /// The CLOSE phase just finished on this node: unwind to `to_from_peer` with an empty-history
    /// OPEN, and flood `to_all` (which still carries the CLOSE's chunk history) to everyone else.
    OpenStart {
        /// Sent only to the neighbor that closed our last link.
        to_from: Packet,
        /// The neighbor `to_from` goes to.
        to_from_peer: Pos,
        /// Flooded to every other neighbor.
        to_all: Packet,
    },
}

/// Per-`(level, sub_id)` record of which neighbors have already replied OPENED. Spec §3: "Used to
/// stop forwarding OPEN pkts to neighbors that are already opened on the same sub_id."
#[derive(Debug, Default)]
struct QspnBuffer {
    replies: HashMap<SubId, HashSet<Pos>>,
}

impl QspnBuffer {
    fn mark_opened(&mut self, sub_id: SubId, peer: Pos) {
        self.replies.entry(sub_id).or_default().insert(peer);
    }

    fn is_opened(&self, sub_id: SubId, peer: Pos) -> bool {
        self.replies.get(&sub_id).is_some_and(|s| s.contains(&peer))
    }

    fn clear(&mut self) {
        self.replies.clear();
    }
}

#[derive(Debug)]
struct RoundClock {
    id: QspnId,
    started_at: Instant,
}

/// One level's QSPN round bookkeeping: the round identity, the OPEN reply buffer, the bnode
/// close/open counters, and the two concurrency primitives spec §5 names (`send_qspn_now`, the
/// per-level `qspn_send_mutex`).
pub struct QspnLevelState {
    clock: Mutex<RoundClock>,
    buffer: Mutex<QspnBuffer>,
    bmap_closed: AtomicU32,
    bmap_opened: AtomicU32,
    send_now: AtomicBool,
    send_mutex: tokio::sync::Mutex<()>,
}

impl Default for QspnLevelState {
    fn default() -> Self {
        // Mirrors `qspn_time_reset`: fake the round's start so far in the past that
        // `round_left` is immediately zero and a first `send` is never blocked waiting out a
        // round that never happened.
        let started_at = Instant::now()
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or_else(Instant::now);
        Self {
            clock: Mutex::new(RoundClock { id: 0, started_at }),
            buffer: Mutex::new(QspnBuffer::default()),
            bmap_closed: AtomicU32::new(0),
            bmap_opened: AtomicU32::new(0),
            send_now: AtomicBool::new(false),
            send_mutex: tokio::sync::Mutex::new(()),
        }
    }
}

impl QspnLevelState {
    /// The round id this level currently believes is live.
    pub fn current_id(&self) -> QspnId {
        self.clock.lock().id
    }

    /// Time left before `QSPN_WAIT_ROUND(level)` has elapsed since this round started.
    pub fn round_left(&self, min_round: Duration) -> Duration {
        let started_at = self.clock.lock().started_at;
        min_round.saturating_sub(started_at.elapsed())
    }

    /// Mark this level as wanting an unscheduled round (spec §4.2: "any non-empty event set sets
    /// `send_qspn_now`").
    pub fn request_send(&self) {
        self.send_now.store(true, Ordering::SeqCst);
    }

    /// Consume the pending-send request, if any.
    pub fn take_send_request(&self) -> bool {
        self.send_now.swap(false, Ordering::SeqCst)
    }

    fn bmap_closed(&self) -> u32 {
        self.bmap_closed.load(Ordering::SeqCst)
    }

    fn bmap_opened(&self) -> u32 {
        self.bmap_opened.load(Ordering::SeqCst)
    }
}

/// One [`QspnLevelState`] per hierarchy level.
pub struct QspnLevels(Vec<QspnLevelState>);

impl QspnLevels {
    /// Build fresh, idle state for `max_levels` levels.
    pub fn new(max_levels: Level) -> Self {
        Self((0..max_levels).map(|_| QspnLevelState::default()).collect())
    }

    /// The state for `level`.
    pub fn get(&self, level: Level) -> Result<&QspnLevelState> {
        self.0
            .get(level as usize)
            .ok_or_else(|| MapError::NotFound { level, pos: 0 }.into())
    }

    /// Mark `level` as wanting an unscheduled round, if it exists.
    pub fn request_send(&self, level: Level) {
        if let Some(state) = self.0.get(level as usize) {
            state.request_send();
        }
    }

    /// Every configured level.
    pub fn levels(&self) -> impl Iterator<Item = Level> {
        0..self.0.len() as Level
    }
}

fn me_pos(map: &Map, level: Level) -> Result<Pos> {
    map.level(level)?
        .me()
        .ok_or_else(|| QspnError::MapInconsistency(format!("no local position recorded at level {level}")))
}

fn link_rtt_to(map: &Map, level: Level, from: Pos, peer: Pos) -> Result<crate::types::RttMicros> {
    Ok(map
        .level(level)?
        .links(from)?
        .iter()
        .find(|l| l.peer == peer)
        .map(|l| l.rtt)
        .unwrap_or(0))
}

fn flood_candidates(map: &Map, level: Level, at: Pos) -> Result<Vec<FloodCandidate>> {
    let links: Vec<Link> = map.level(level)?.links(at)?.to_vec();
    links
        .into_iter()
        .map(|link| {
            Ok(FloodCandidate {
                peer: link.peer,
                level,
                round_state: map.level(level)?.round_state(link.peer)?,
            })
        })
        .collect()
}

/// Reset a level's round bookkeeping and sweep `QSPN_OLD` entities (`qspn_new_round`).
///
/// `new_id` mirrors `me.cur_qspn_id[level]=new_qspn_id` (increments when `None`); `new_started_at`
/// mirrors `update_qspn_time`. The original additionally recomputes `me.cur_qspn_time[level]` from
/// the first tracer chunk's accumulated RTT to compensate for clock skew between nodes; this
/// engine has no shared wall clock to skew (round timing is purely local and monotonic), so that
/// compensation is dropped — see DESIGN.md.
pub fn new_round(
    map: &mut Map,
    levels: &QspnLevels,
    level: Level,
    new_id: Option<QspnId>,
    new_started_at: Option<Instant>,
) -> Result<()> {
    let state = levels.get(level)?;
    {
        let mut clock = state.clock.lock();
        clock.id = new_id.unwrap_or_else(|| clock.id.wrapping_add(1));
        clock.started_at = new_started_at.unwrap_or_else(Instant::now);
    }
    state.buffer.lock().clear();
    state.bmap_closed.store(0, Ordering::SeqCst);
    state.bmap_opened.store(0, Ordering::SeqCst);

    if let Some(me) = map.level(level)?.me() {
        map.clear_progress_flags(level, me)?;
        let links: Vec<Link> = map.level(level)?.links(me)?.to_vec();
        for link in &links {
            map.clear_progress_flags(level, link.peer)?;
        }
    }

    for pos in map.live_positions(level)? {
        if Some(pos) == map.level(level)?.me() {
            continue;
        }
        if map.is_old(level, pos)? {
            map.node_del(level, pos)?;
        } else {
            map.set_old(level, pos)?;
        }
    }

    Ok(())
}

/// Build the two OPEN packets a just-CLOSED node must emit (`qspn_open_start`). `to_all` still
/// carries `close_pkt`'s full chunk history (the spec: "already carrying our CLOSE's chunk
/// history"); only its op code and `sub_id` are rewritten here.
fn open_start(map: &Map, level: Level, close_pkt: Packet) -> Result<(Packet, Packet)> {
    let me = me_pos(map, level)?;

    let empty_chunks = tracer::build(&[], me, 0, usize::MAX)?;
    let to_from = Packet {
        op: OpCode::QspnOpen,
        id: close_pkt.id,
        src_ip: Ipv4Addr::UNSPECIFIED,
        bcast: BroadcastHeader {
            sub_id: me as SubId,
            flags: BroadcastFlags::empty(),
            ..close_pkt.bcast
        },
        tracer: TracerHeader {
            hops: empty_chunks.len() as u16,
            flags: TracerFlags::empty(),
        },
        chunks: empty_chunks,
        bnode_block: None,
    };

    let mut to_all = close_pkt;
    to_all.op = OpCode::QspnOpen;
    to_all.bcast.sub_id = me as SubId;

    Ok((to_from, to_all))
}

/// The CLOSE-receive handler (spec §4.4, `qspn_close`).
pub fn close(
    map: &mut Map,
    levels: &QspnLevels,
    address_book: &AddressBook,
    level: Level,
    packet: &Packet,
    cfg: &EngineConfig,
) -> Result<Action> {
    let state = levels.get(level)?;
    let unpacked = tracer::unpack(packet, address_book)?;
    let from_pos = unpacked.from_pos;
    let hops = packet.chunks.len();
    let originator = packet.chunks.first().map(|c| c.node_pos);

    let me = me_pos(map, level)?;
    let is_bnode_here = map.level(level)?.is_bnode(me)?;
    let mut just_forward_it = level > 0 && from_pos == me;
    let do_real_action = level == 0 || (is_bnode_here && !just_forward_it);

    // 1. Loop prevention: we are the originator, within the current (not-yet-superseded) round.
    let i_was_starter = map.level(level)?.round_state(me)? == RoundState::Starter;
    if (level == 0 || (do_real_action && i_was_starter)) && originator == Some(me) {
        return Ok(Action::Drop);
    }

    let cur_id = state.current_id();
    if packet.id < cur_id {
        return Err(QspnRoundError::StaleRound {
            level,
            packet_id: packet.id,
            current_id: cur_id,
        }
        .into());
    }
    if packet.id > cur_id {
        let measured_rtt = packet.chunks.first().map(|c| c.rtt_micros).unwrap_or(0);
        let _ = measured_rtt; // see new_round's doc comment: no shared wall clock to skew here
        new_round(map, levels, level, Some(packet.id), None)?;
    }

    // 2. A co-starter in our own gnode.
    let mut int_qspn_starter = false;
    if level > 0 && originator == Some(me) && hops == 1 && do_real_action {
        map.set_round_flag(level, me, RoundFlag::Starter)?;
        int_qspn_starter = true;
    }

    // 3. Looped back through the upper level via our own root.
    if level > 0 && from_pos == me {
        just_forward_it = true;
    }

    // 4. Fold the tracer into the maps.
    tracer::store(map, level, from_pos, &packet.chunks, cfg.max_multipath_routes)?;
    if let Some(block) = &packet.bnode_block {
        tracer::store_bnode_block(map, level, block);
    }

    // 5. Don't let our own wave re-enter through a non-starter relay.
    let i_am_starter = map.level(level)?.round_state(me)? == RoundState::Starter;
    if i_am_starter && hops > 1 && !int_qspn_starter {
        let sender_is_starter = map.level(level)?.round_state(from_pos)? == RoundState::Starter;
        if !sender_is_starter {
            return Ok(Action::Drop);
        }
    }

    // 6. Count-close the sending link.
    let mut bcast_flags = packet.bcast.flags;
    let mut not_closed = 0usize;
    if do_real_action && !just_forward_it {
        let links: Vec<Link> = map.level(level)?.links(me)?.to_vec();
        if links.iter().any(|l| l.peer == from_pos) {
            map.set_round_flag(level, from_pos, RoundFlag::Closed)?;
        }
        for link in &links {
            if map.level(level)?.round_state(link.peer)? != RoundState::Closed {
                not_closed += 1;
            }
        }
        if i_am_starter {
            map.set_round_flag(level, from_pos, RoundFlag::Starter)?;
            bcast_flags.insert(BroadcastFlags::BCAST_TRACER_STARTERS);
        }
    }

    // 7. Bnode-closed bookkeeping for the level below.
    let blevel = level.saturating_sub(1);
    if bcast_flags.contains(BroadcastFlags::QSPN_BNODE_CLOSED) {
        if just_forward_it {
            state.bmap_closed.fetch_add(1, Ordering::SeqCst);
        } else {
            bcast_flags.remove(BroadcastFlags::QSPN_BNODE_CLOSED);
        }
    }
    let bnodes_below = if level == 0 { 0 } else { map.find_bnode(blevel)?.len() };
    let all_bnodes_closed = level == 0 || bnodes_below == 0 || state.bmap_closed() as usize >= bnodes_below - 1;

    // 8. All our own links closed: announce it upward.
    if do_real_action
        && !just_forward_it
        && not_closed == 0
        && level > 0
        && map.level(level)?.round_state(me)? != RoundState::Closed
    {
        map.set_round_flag(level, me, RoundFlag::Closed)?;
        bcast_flags.insert(BroadcastFlags::QSPN_BNODE_CLOSED);
    }

    // 9. Build the outgoing CLOSE, or just propagate the one we received.
    let out_chunks = if do_real_action && !just_forward_it {
        let rtt = link_rtt_to(map, level, me, from_pos)?;
        tracer::build(&packet.chunks, me, rtt, cfg.max_tracer_hops)?
    } else {
        let rtt = link_rtt_to(map, level, me, from_pos)?;
        let mut chunks = packet.chunks.clone();
        tracer::add_rtt(&mut chunks, rtt)?;
        chunks
    };
    let out_packet = Packet {
        op: OpCode::QspnClose,
        id: packet.id,
        src_ip: Ipv4Addr::UNSPECIFIED,
        bcast: BroadcastHeader {
            flags: bcast_flags,
            ..packet.bcast
        },
        tracer: TracerHeader {
            hops: out_chunks.len() as u16,
            flags: packet.tracer.flags,
        },
        chunks: out_chunks,
        bnode_block: packet.bnode_block.clone(),
    };

    // 10. Dispatch.
    let my_state = map.level(level)?.round_state(me)?;
    if !just_forward_it
        && not_closed == 0
        && my_state != RoundState::Opener
        && my_state != RoundState::Starter
        && all_bnodes_closed
    {
        map.set_round_flag(level, me, RoundFlag::Opener)?;
        let (to_from, to_all) = open_start(map, level, out_packet)?;
        Ok(Action::OpenStart {
            to_from,
            to_from_peer: from_pos,
            to_all,
        })
    } else if i_am_starter && !int_qspn_starter {
        let mut tracer_pkt = out_packet;
        tracer_pkt.op = OpCode::TracerPkt;
        Ok(Action::Flood {
            packet: tracer_pkt,
            exclude: flood::exclude_from_and_glevel_and_notstarter,
        })
    } else {
        Ok(Action::Flood {
            packet: out_packet,
            exclude: flood::exclude_from_and_glevel_and_closed,
        })
    }
}

/// The OPEN-receive handler (spec §4.4, `qspn_open`).
pub fn open(
    map: &mut Map,
    levels: &QspnLevels,
    address_book: &AddressBook,
    level: Level,
    packet: &Packet,
    cfg: &EngineConfig,
) -> Result<Action> {
    let state = levels.get(level)?;
    let unpacked = tracer::unpack(packet, address_book)?;
    let from_pos = unpacked.from_pos;
    let hops = packet.chunks.len();
    let sub_id = packet.bcast.sub_id;

    let me = me_pos(map, level)?;
    let is_bnode_here = map.level(level)?.is_bnode(me)?;
    let mut just_forward_it = level > 0 && from_pos == me;
    let do_real_action = level == 0 || (is_bnode_here && !just_forward_it);

    // 1. Our own OPEN looped back to us.
    let i_am_opener = map.level(level)?.round_state(me)? == RoundState::Opener;
    if (level == 0 || (do_real_action && i_am_opener)) && sub_id as Pos == me {
        return Ok(Action::Drop);
    }

    let cur_id = state.current_id();
    if packet.id < cur_id {
        return Err(QspnRoundError::StaleRound {
            level,
            packet_id: packet.id,
            current_id: cur_id,
        }
        .into());
    }

    // 2. A co-opener in our own gnode.
    let mut int_qspn_opener = false;
    if level > 0 && sub_id as Pos == me && hops == 1 && do_real_action {
        map.set_round_flag(level, me, RoundFlag::Opener)?;
        int_qspn_opener = true;
    }

    // 3. Looped back through the upper level via our own root.
    if level > 0 && from_pos == me {
        just_forward_it = true;
    }

    // 4. Fold the tracer into the maps.
    tracer::store(map, level, from_pos, &packet.chunks, cfg.max_multipath_routes)?;
    if let Some(block) = &packet.bnode_block {
        tracer::store_bnode_block(map, level, block);
    }

    let mut bcast_flags = packet.bcast.flags;
    let blevel = level.saturating_sub(1);
    if bcast_flags.contains(BroadcastFlags::QSPN_BNODE_OPENED) {
        if just_forward_it {
            state.bmap_opened.fetch_add(1, Ordering::SeqCst);
        } else {
            bcast_flags.remove(BroadcastFlags::QSPN_BNODE_OPENED);
        }
    }
    let bnodes_below = if level == 0 { 0 } else { map.find_bnode(blevel)?.len() };
    let all_bnodes_opened = level == 0 || bnodes_below == 0 || state.bmap_opened() as usize >= bnodes_below - 1;

    // 5. Track replies in the qspn_buffer; count what's left.
    let mut not_opened = 0usize;
    let mut terminate = false;
    if do_real_action && !just_forward_it {
        let links: Vec<Link> = map.level(level)?.links(me)?.to_vec();
        {
            let mut buffer = state.buffer.lock();
            buffer.mark_opened(sub_id, from_pos);
            not_opened = links.iter().filter(|l| !buffer.is_opened(sub_id, l.peer)).count();
        }
        // `from_pos` has now opened for this sub_id; flag it so a later flood of our own OPEN
        // skips a neighbor that already replied, instead of forwarding to it again.
        if links.iter().any(|l| l.peer == from_pos) {
            map.set_round_flag(level, from_pos, RoundFlag::Opened)?;
        }

        if not_opened == 0 && level > 0 && map.level(level)?.round_state(me)? != RoundState::Opened {
            bcast_flags.insert(BroadcastFlags::QSPN_BNODE_OPENED);
            map.set_round_flag(level, me, RoundFlag::Opened)?;
        }

        if not_opened == 0 && all_bnodes_opened {
            // Exception: if we are the only bnode at this level, propagate once more so
            // in-group nodes still install the final entries before the round is put to rest.
            terminate = !(level > 0 && bnodes_below <= 1);
        }
    }

    if terminate {
        return Ok(Action::Drop);
    }

    // 6. Build the outgoing OPEN, or just propagate the one we received.
    let out_chunks = if do_real_action && !just_forward_it {
        let rtt = link_rtt_to(map, level, me, from_pos)?;
        tracer::build(&packet.chunks, me, rtt, cfg.max_tracer_hops)?
    } else {
        let rtt = link_rtt_to(map, level, me, from_pos)?;
        let mut chunks = packet.chunks.clone();
        tracer::add_rtt(&mut chunks, rtt)?;
        chunks
    };
    let out_packet = Packet {
        op: OpCode::QspnOpen,
        id: packet.id,
        src_ip: Ipv4Addr::UNSPECIFIED,
        bcast: BroadcastHeader {
            flags: bcast_flags,
            ..packet.bcast
        },
        tracer: TracerHeader {
            hops: out_chunks.len() as u16,
            flags: packet.tracer.flags,
        },
        chunks: out_chunks,
        bnode_block: packet.bnode_block.clone(),
    };

    let exclude = if do_real_action && !int_qspn_opener {
        flood::exclude_from_and_opened_and_glevel
    } else {
        flood::exclude_from_and_glevel
    };
    Ok(Action::Flood {
        packet: out_packet,
        exclude,
    })
}

/// Initiate a new round at `level` when something around the root changed (`qspn_send`).
///
/// Waits out any in-progress round under `level`'s send mutex, held for the entire wait-and-build
/// sequence per spec §5; abandons if another node's round id overtakes ours while we wait.
pub async fn send(
    map_lock: &RwLock<Map>,
    levels: &QspnLevels,
    level: Level,
    cfg: &EngineConfig,
    transport: &dyn Transport,
    address_book: &AddressBook,
) -> Result<()> {
    let state = levels.get(level)?;

    if level > 0 {
        let guard = map_lock.read();
        let is_bnode = match guard.level(level)?.me() {
            Some(me) => guard.level(level)?.is_bnode(me)?,
            None => false,
        };
        drop(guard);
        if !is_bnode {
            return Ok(());
        }
    }

    let Ok(_send_guard) = state.send_mutex.try_lock() else {
        return Ok(());
    };

    let qid_before = state.current_id();
    loop {
        let left = state.round_left(cfg.qspn_wait_round(level));
        if left.is_zero() {
            break;
        }
        tokio::time::sleep(left.min(Duration::from_millis(200))).await;
        if state.current_id() != qid_before {
            return Ok(());
        }
    }
    if state.current_id() != qid_before {
        return Ok(());
    }

    let (packet, me, candidates) = {
        let mut guard = map_lock.write();
        new_round(&mut guard, levels, level, None, None)?;
        let me = me_pos(&guard, level)?;
        guard.set_round_flag(level, me, RoundFlag::Starter)?;
        let chunks = tracer::build(&[], me, 0, cfg.max_tracer_hops)?;
        let packet = Packet {
            op: OpCode::QspnClose,
            id: state.current_id(),
            src_ip: Ipv4Addr::UNSPECIFIED,
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
        let candidates = flood_candidates(&guard, level, me)?;
        (packet, me, candidates)
    };

    let payload = packet.encode();
    FloodDispatcher::send(
        transport,
        address_book,
        &candidates,
        Some(me),
        level,
        flood::exclude_from_and_glevel_and_closed,
        &payload,
    )
    .await;

    Ok(())
}

/// Carry out an [`Action`] produced by [`close`]/[`open`]/[`send`]: actually transmit it.
pub async fn dispatch(
    map: &Map,
    level: Level,
    from: Option<Pos>,
    transport: &dyn Transport,
    address_book: &AddressBook,
    action: Action,
) -> Result<()> {
    match action {
        Action::Drop => Ok(()),
        Action::Flood { packet, exclude } => {
            let me = me_pos(map, level)?;
            let candidates = flood_candidates(map, level, me)?;
            let payload = packet.encode();
            FloodDispatcher::send(transport, address_book, &candidates, from, level, exclude, &payload).await;
            Ok(())
        }
        Action::OpenStart {
            to_from,
            to_from_peer,
            to_all,
        } => {
            if let Some(ip) = address_book.ip_for(to_from_peer) {
                if let Err(err) = transport.send_to(ip, to_from.encode()).await {
                    log::warn!("qspn: open_start unwind to {to_from_peer} ({ip}) failed: {err}");
                }
            } else {
                log::warn!("qspn: open_start has no address for {to_from_peer}, skipping");
            }
            let me = me_pos(map, level)?;
            let candidates = flood_candidates(map, level, me)?;
            let payload = to_all.encode();
            FloodDispatcher::send(
                transport,
                address_book,
                &candidates,
                Some(to_from_peer),
                level,
                flood::exclude_from_and_glevel,
                &payload,
            )
            .await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Map, NodeFlags};
    use std::net::Ipv4Addr;

    fn linked_map(n: u16) -> Map {
        let mut map = Map::new(1, 8);
        for pos in 0..n {
            map.internal_mut().add(pos).unwrap();
        }
        map
    }

    fn link(map: &mut Map, a: Pos, b: Pos, rtt: u32) {
        map.internal_mut().node_mut(a).unwrap().links_mut().push(Link {
            peer: b,
            level: 0,
            rtt,
            peer_rpos: 0,
        });
        map.internal_mut().node_mut(b).unwrap().links_mut().push(Link {
            peer: a,
            level: 0,
            rtt,
            peer_rpos: 0,
        });
    }

    fn address_book(n: u16) -> AddressBook {
        let mut book = AddressBook::new();
        for pos in 0..n {
            book.register(Ipv4Addr::new(10, 0, 0, pos as u8 + 1), pos);
        }
        book
    }

    fn close_packet(from_ip: Ipv4Addr, id: QspnId, chunks: Vec<crate::wire::TracerChunk>) -> Packet {
        Packet {
            op: OpCode::QspnClose,
            id,
            src_ip: from_ip,
            bcast: BroadcastHeader {
                gnode: 0,
                level: 0,
                sub_id: 0,
                flags: BroadcastFlags::empty(),
            },
            tracer: TracerHeader {
                hops: chunks.len() as u16,
                flags: TracerFlags::empty(),
            },
            chunks,
            bnode_block: None,
        }
    }

    #[test]
    fn new_round_sweeps_entities_not_marked_old_into_old_and_deletes_already_old_ones() {
        let levels = QspnLevels::new(1);
        let mut map = linked_map(3);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        link(&mut map, 0, 2, 20);
        map.internal_mut()
            .node_mut(2)
            .unwrap()
            .flags_mut()
            .insert(NodeFlags::QSPN_OLD);

        new_round(&mut map, &levels, 0, Some(5), None).unwrap();

        assert!(map.internal().node(1).unwrap().flags().contains(NodeFlags::QSPN_OLD));
        assert!(map.internal().node(2).unwrap().is_void());
        assert_eq!(levels.get(0).unwrap().current_id(), 5);
    }

    #[test]
    fn stale_round_is_rejected_without_touching_the_map() {
        let levels = QspnLevels::new(1);
        new_round(&mut linked_map(2), &levels, 0, Some(10), None).unwrap();

        let mut map = linked_map(2);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        let book = address_book(2);
        let cfg = EngineConfig::default();

        let pkt = close_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            9,
            vec![crate::wire::TracerChunk {
                node_pos: 1,
                rtt_micros: 0,
            }],
        );

        let err = close(&mut map, &levels, &book, 0, &pkt, &cfg).unwrap_err();
        assert!(matches!(
            err,
            QspnError::Round(QspnRoundError::StaleRound { .. })
        ));
    }

    #[test]
    fn close_closes_the_sending_link_and_floods_onward() {
        // Triangle: me=0, neighbors 1 and 2. A CLOSE arrives from 1, originated by 1.
        let levels = QspnLevels::new(1);
        let mut map = linked_map(3);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        link(&mut map, 0, 2, 20);
        let book = address_book(3);
        let cfg = EngineConfig::default();

        let pkt = close_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            vec![crate::wire::TracerChunk {
                node_pos: 1,
                rtt_micros: 0,
            }],
        );

        let action = close(&mut map, &levels, &book, 0, &pkt, &cfg).unwrap();
        assert!(map
            .internal()
            .node(1)
            .unwrap()
            .flags()
            .contains(NodeFlags::QSPN_CLOSED));
        assert_eq!(
            map.routes(0).unwrap().best(1),
            Some(crate::map::RouteEntry { next_hop: 1, rtt: 0 })
        );
        match action {
            Action::Flood { packet, .. } => {
                assert_eq!(packet.chunks.last().unwrap().node_pos, 0);
            }
            _ => panic!("expected a flood action, link 2 is still open"),
        }
    }

    #[test]
    fn close_starts_open_once_every_link_is_closed() {
        // Line: me=1 between 0 and 2. Both links arrive closed in turn.
        let levels = QspnLevels::new(1);
        let mut map = linked_map(3);
        map.internal_mut().set_me(1).unwrap();
        link(&mut map, 1, 0, 10);
        link(&mut map, 1, 2, 10);
        let book = address_book(3);
        let cfg = EngineConfig::default();

        let pkt_from_0 = close_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            1,
            vec![crate::wire::TracerChunk {
                node_pos: 0,
                rtt_micros: 0,
            }],
        );
        let _ = close(&mut map, &levels, &book, 0, &pkt_from_0, &cfg).unwrap();

        let pkt_from_2 = close_packet(
            Ipv4Addr::new(10, 0, 0, 3),
            1,
            vec![
                crate::wire::TracerChunk {
                    node_pos: 0,
                    rtt_micros: 0,
                },
                crate::wire::TracerChunk {
                    node_pos: 2,
                    rtt_micros: 0,
                },
            ],
        );
        let action = close(&mut map, &levels, &book, 0, &pkt_from_2, &cfg).unwrap();

        assert!(matches!(action, Action::OpenStart { .. }));
        assert!(map.internal().node(1).unwrap().flags().contains(NodeFlags::ME));
    }

    #[test]
    fn open_terminates_once_every_neighbor_has_opened() {
        let levels = QspnLevels::new(1);
        let mut map = linked_map(2);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        let book = address_book(2);
        let cfg = EngineConfig::default();

        let pkt = Packet {
            op: OpCode::QspnOpen,
            id: 1,
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            bcast: BroadcastHeader {
                gnode: 0,
                level: 0,
                sub_id: 1,
                flags: BroadcastFlags::empty(),
            },
            tracer: TracerHeader {
                hops: 0,
                flags: TracerFlags::empty(),
            },
            chunks: vec![],
            bnode_block: None,
        };

        let action = open(&mut map, &levels, &book, 0, &pkt, &cfg).unwrap();
        assert!(matches!(action, Action::Drop));
    }

    #[test]
    fn open_forwards_while_neighbors_remain_unopened() {
        let levels = QspnLevels::new(1);
        let mut map = linked_map(3);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        link(&mut map, 0, 2, 10);
        let book = address_book(3);
        let cfg = EngineConfig::default();

        let pkt = Packet {
            op: OpCode::QspnOpen,
            id: 1,
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            bcast: BroadcastHeader {
                gnode: 0,
                level: 0,
                sub_id: 1,
                flags: BroadcastFlags::empty(),
            },
            tracer: TracerHeader {
                hops: 0,
                flags: TracerFlags::empty(),
            },
            chunks: vec![],
            bnode_block: None,
        };

        let action = open(&mut map, &levels, &book, 0, &pkt, &cfg).unwrap();
        assert!(matches!(action, Action::Flood { .. }));
    }

    #[test]
    fn open_marks_a_replying_neighbor_opened_so_later_floods_skip_it() {
        let levels = QspnLevels::new(1);
        let mut map = linked_map(3);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        link(&mut map, 0, 2, 10);
        let book = address_book(3);
        let cfg = EngineConfig::default();

        let pkt_from_1 = Packet {
            op: OpCode::QspnOpen,
            id: 1,
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            bcast: BroadcastHeader {
                gnode: 0,
                level: 0,
                sub_id: 1,
                flags: BroadcastFlags::empty(),
            },
            tracer: TracerHeader {
                hops: 0,
                flags: TracerFlags::empty(),
            },
            chunks: vec![],
            bnode_block: None,
        };
        let _ = open(&mut map, &levels, &book, 0, &pkt_from_1, &cfg).unwrap();

        assert_eq!(map.level(0).unwrap().round_state(1).unwrap(), RoundState::Opened);
        assert_eq!(map.level(0).unwrap().round_state(2).unwrap(), RoundState::Idle);

        let candidates = flood_candidates(&map, 0, 0).unwrap();
        let candidate_1 = candidates.iter().find(|c| c.peer == 1).unwrap();
        // Even from a different sender, 1 has already opened and must be skipped.
        assert!(flood::exclude_from_and_opened_and_glevel(Some(2), 0, candidate_1));
    }

    #[test]
    fn idempotent_redelivery_of_the_same_close_does_not_change_routes_again() {
        let levels = QspnLevels::new(1);
        let mut map = linked_map(2);
        map.internal_mut().set_me(0).unwrap();
        link(&mut map, 0, 1, 10);
        let book = address_book(2);
        let cfg = EngineConfig::default();

        let pkt = close_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            vec![crate::wire::TracerChunk {
                node_pos: 1,
                rtt_micros: 0,
            }],
        );
        let _ = close(&mut map, &levels, &book, 0, &pkt, &cfg).unwrap();
        let after_first = map.routes(0).unwrap().best(1);

        // Redeliver: same id is no longer > current, so it is processed as an ordinary (not new
        // round) packet; the route table is already at its fixed point.
        let _ = close(&mut map, &levels, &book, 0, &pkt, &cfg);
        assert_eq!(map.routes(0).unwrap().best(1), after_first);
    }
}
