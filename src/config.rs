//! Tunables the engine needs but does not define a way to load: the CLI parser, option file and
//! daemonization wrapper all live in the embedding daemon (see the crate's out-of-scope list).
//! [`EngineConfig`] is the shape that daemon is expected to populate and hand to [`crate::Engine`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default UDP port QSPN and tracer packets are exchanged on.
pub const DEFAULT_NTK_UDP_PORT: u16 = 269;

/// Maximum number of nodes (or gnodes) a single map level can hold.
pub const DEFAULT_MAXGROUPNODE: u16 = 256;

/// Maximum number of hierarchy levels.
pub const DEFAULT_MAX_LEVELS: u8 = 8;

/// Maximum number of hop chunks a tracer packet may carry.
pub const DEFAULT_MAX_TRACER_HOPS: usize = 128;

/// Maximum number of equal-cost alternate next-hops kept per destination.
pub const DEFAULT_MAX_MULTIPATH_ROUTES: usize = 8;

/// Number of RTT samples kept per radar-probed peer, per scan.
pub const DEFAULT_MAX_RADAR_SCANS: usize = 10;

/// Minimum RTT delta (in microseconds) that triggers a `link_rtt_change` event.
pub const DEFAULT_RTT_DELTA: u32 = 1_000;

/// Engine-wide configuration. Every field has a default matching the values either named by the
/// specification or, where the specification is silent (radar smoothing constants), taken
/// verbatim from the original implementation's `radar.h`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// UDP port used for ECHO_ME/ECHO_REPLY/TRACER_PKT/QSPN_CLOSE/QSPN_OPEN.
    pub ntk_udp_port: u16,
    /// Capacity of each map level (`MAXGROUPNODE`).
    pub maxgroupnode: u16,
    /// Number of hierarchy levels the engine maintains (including level 0).
    pub max_levels: u8,
    /// `MAX_TRACER_HOPS`.
    pub max_tracer_hops: usize,
    /// `MAX_MULTIPATH_ROUTES`.
    pub max_multipath_routes: usize,
    /// `MAX_RADAR_SCANS`.
    pub max_radar_scans: usize,
    /// Minimum RTT delta (microseconds) that counts as a `link_rtt_change`.
    pub rtt_delta_micros: u32,
    /// Interval between radar scans.
    #[serde(with = "duration_secs")]
    pub radar_scan_interval: Duration,
    /// How long the radar accumulates ECHO_REPLY packets before finalizing a scan.
    #[serde(with = "duration_secs")]
    pub max_radar_wait: Duration,
    /// Enforced minimum duration of a QSPN round at level 0. Higher levels scale by
    /// `qspn_wait_round_multiplier ^ level`, mirroring how coarser levels converge less often.
    #[serde(with = "duration_secs")]
    pub qspn_wait_round_base: Duration,
    /// Multiplier applied to `qspn_wait_round_base` per extra level.
    pub qspn_wait_round_multiplier: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ntk_udp_port: DEFAULT_NTK_UDP_PORT,
            maxgroupnode: DEFAULT_MAXGROUPNODE,
            max_levels: DEFAULT_MAX_LEVELS,
            max_tracer_hops: DEFAULT_MAX_TRACER_HOPS,
            max_multipath_routes: DEFAULT_MAX_MULTIPATH_ROUTES,
            max_radar_scans: DEFAULT_MAX_RADAR_SCANS,
            rtt_delta_micros: DEFAULT_RTT_DELTA,
            radar_scan_interval: Duration::from_secs(30),
            max_radar_wait: Duration::from_secs(10),
            qspn_wait_round_base: Duration::from_secs(20),
            qspn_wait_round_multiplier: 2,
        }
    }
}

impl EngineConfig {
    /// Enforced minimum round duration at the given level (`QSPN_WAIT_ROUND(L)`).
    pub fn qspn_wait_round(&self, level: crate::types::Level) -> Duration {
        self.qspn_wait_round_base * self.qspn_wait_round_multiplier.pow(level as u32)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
