//! Flood dispatcher: decides which neighbor links a broadcast packet should go out on (spec
//! §4.5). Each exclusion rule is a plain `fn` predicate rather than a trait object — there are
//! five of them, all total functions of the same small context, so a trait would buy nothing a
//! function pointer doesn't already give.

use crate::map::RoundState;
use crate::radar::AddressBook;
use crate::transport::Transport;
use crate::types::{Level, Pos};

/// What the dispatcher knows about one candidate neighbor when deciding whether to flood to it.
#[derive(Debug, Clone, Copy)]
pub struct FloodCandidate {
    /// The candidate's position.
    pub peer: Pos,
    /// The level the link to this candidate lives at.
    pub level: Level,
    /// The candidate's current round-progress state.
    pub round_state: RoundState,
}

/// An exclusion rule: returns `true` if `candidate` should be skipped.
pub type ExcludeFn = fn(Option<Pos>, Level, &FloodCandidate) -> bool;

/// Skip the link we received this packet from, and any link not at the level we are flooding on.
/// The common base every other predicate builds on.
pub fn exclude_from_and_glevel(from: Option<Pos>, target_level: Level, c: &FloodCandidate) -> bool {
    Some(c.peer) == from || c.level != target_level
}

/// As [`exclude_from_and_glevel`], plus skip neighbors whose links are already `QSPN_CLOSED`
/// (no point re-closing someone who has already closed toward us).
pub fn exclude_from_and_glevel_and_closed(
    from: Option<Pos>,
    target_level: Level,
    c: &FloodCandidate,
) -> bool {
    exclude_from_and_glevel(from, target_level, c) || c.round_state == RoundState::Closed
}

/// As [`exclude_from_and_glevel`], plus skip neighbors that have already opened for this round.
pub fn exclude_from_and_opened_and_glevel(
    from: Option<Pos>,
    target_level: Level,
    c: &FloodCandidate,
) -> bool {
    exclude_from_and_glevel(from, target_level, c) || c.round_state == RoundState::Opened
}

/// As [`exclude_from_and_glevel`], plus skip anyone who is not themselves a round `STARTER`
/// (`BCAST_TRACER_STARTERS`: a wavefront restricted to fellow co-starters).
pub fn exclude_from_and_glevel_and_notstarter(
    from: Option<Pos>,
    target_level: Level,
    c: &FloodCandidate,
) -> bool {
    exclude_from_and_glevel(from, target_level, c) || c.round_state != RoundState::Starter
}

/// Skip only the link we received this packet from; every other neighbor, at any level, is a
/// target. Used for plain tracer re-propagation, where a single received tracer goes out on every
/// remaining link regardless of level (spec's "a received tracer propagates outward unchanged save
/// for the hop just traversed").
pub fn exclude_all_but_notfrom(from: Option<Pos>, _target_level: Level, c: &FloodCandidate) -> bool {
    Some(c.peer) == from
}

/// Computes flood target sets and, given a transport, sends to them.
pub struct FloodDispatcher;

impl FloodDispatcher {
    /// The positions a broadcast should go out to, given the full neighbor link list and an
    /// exclusion rule.
    pub fn targets(
        candidates: &[FloodCandidate],
        from: Option<Pos>,
        target_level: Level,
        exclude: ExcludeFn,
    ) -> Vec<Pos> {
        candidates
            .iter()
            .filter(|c| !exclude(from, target_level, c))
            .map(|c| c.peer)
            .collect()
    }

    /// Send `payload` to every target computed by [`FloodDispatcher::targets`]. A single
    /// destination's address missing from the address book, or a single transport failure, is
    /// logged and does not abort the rest of the flood (spec §4.5, §7: flooding degrades
    /// gracefully per-peer).
    pub async fn send(
        transport: &dyn Transport,
        address_book: &AddressBook,
        candidates: &[FloodCandidate],
        from: Option<Pos>,
        target_level: Level,
        exclude: ExcludeFn,
        payload: &[u8],
    ) {
        for peer in Self::targets(candidates, from, target_level, exclude) {
            match address_book.ip_for(peer) {
                Some(ip) => {
                    if let Err(err) = transport.send_to(ip, payload.to_vec()).await {
                        log::warn!("flood: send to {peer} ({ip}) failed: {err}");
                    }
                }
                None => log::warn!("flood: no known address for peer {peer}, skipping"),
            }
        }
    }
}
