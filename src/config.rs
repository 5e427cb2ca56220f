//! # Protocol Configuration
//!
//! All tunables for a routing instance, collected in one place. Defaults
//! match the deployed protocol profile; tests override individual fields
//! with struct-update syntax.
//!
//! Timeouts are wall-clock milliseconds. Speeds are km/h at the config
//! surface because that is how the plausibility rule is stated; the
//! movement validator converts internally.

/// Freshness window for signed messages (ms). A message whose envelope
/// timestamp differs from local time by more than this is rejected.
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on retained replay records.
pub const DEFAULT_MAX_MESSAGE_HISTORY: usize = 1_000;

/// A neighbor not heard from for this long is evicted.
pub const DEFAULT_NEIGHBOR_TIMEOUT_MS: u64 = 10_000;

/// A route older than this is evicted regardless of use.
pub const DEFAULT_ROUTE_TIMEOUT_MS: u64 = 60_000;

/// Maximum path length for discovery messages. Route entries always
/// record a hop count strictly below this.
pub const DEFAULT_MAX_HOP_COUNT: u8 = 10;

/// Maximum certificate chain depth walked during validation.
pub const DEFAULT_MAX_CERT_CHAIN: usize = 5;

/// Minimum trust score a peer needs to stay selected as a next hop.
pub const DEFAULT_TRUST_THRESHOLD: f64 = 0.5;

/// Smoothing factor for the trust exponential moving average.
pub const DEFAULT_TRUST_ALPHA: f64 = 0.3;

/// Maximum plausible vehicle speed (km/h).
pub const DEFAULT_MAX_SPEED_KMH: f64 = 200.0;

/// Maximum plausible acceleration magnitude (m/s²).
pub const DEFAULT_MAX_ACCELERATION_MS2: f64 = 10.0;

/// Distinct destinations a peer may advertise within the black-hole
/// window before the detector considers firing.
pub const DEFAULT_BLACKHOLE_ADVERT_THRESHOLD: usize = 20;

/// Sliding window for counting route advertisements (ms).
pub const DEFAULT_BLACKHOLE_WINDOW_MS: u64 = 5_000;

/// Forwarding-success ratio below which a heavy advertiser is treated
/// as a black hole.
pub const DEFAULT_BLACKHOLE_FORWARD_RATIO: f64 = 0.3;

/// Two identities reporting positions closer than this (meters) are
/// Sybil candidates.
pub const DEFAULT_SYBIL_DISTANCE_M: f64 = 2.0;

/// Two position reports count as overlapping when observed within this
/// many milliseconds of each other.
pub const DEFAULT_SYBIL_WINDOW_MS: u64 = 5_000;

/// Nominal beacon period; one HELLO is emitted per tick.
pub const DEFAULT_HELLO_INTERVAL_MS: u64 = 1_000;

/// Tunables for one routing instance.
///
/// Construct with [`Config::default`] and override fields as needed:
///
/// ```
/// use convoy::Config;
///
/// let config = Config {
///     route_timeout_ms: 30_000,
///     ..Default::default()
/// };
/// assert!(config.trust_threshold > 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Envelope freshness window (ms).
    pub message_timeout_ms: u64,
    /// Replay cache capacity.
    pub max_message_history: usize,
    /// Neighbor liveness timeout (ms).
    pub neighbor_timeout_ms: u64,
    /// Route entry lifetime (ms).
    pub route_timeout_ms: u64,
    /// Discovery path length limit.
    pub max_hop_count: u8,
    /// Certificate chain depth limit.
    pub max_cert_chain: usize,
    /// Minimum next-hop trust score.
    pub trust_threshold: f64,
    /// Trust EMA smoothing factor in (0, 1].
    pub trust_alpha: f64,
    /// Movement plausibility speed cap (km/h).
    pub max_speed_kmh: f64,
    /// Movement plausibility acceleration cap (m/s²).
    pub max_acceleration_ms2: f64,
    /// Black-hole detector: distinct-destination threshold.
    pub blackhole_advert_threshold: usize,
    /// Black-hole detector: advertisement window (ms).
    pub blackhole_window_ms: u64,
    /// Black-hole detector: minimum acceptable forwarding ratio.
    pub blackhole_forward_ratio: f64,
    /// Sybil detector: position collision radius (meters).
    pub sybil_distance_m: f64,
    /// Sybil detector: beacon overlap window (ms).
    pub sybil_window_ms: u64,
    /// Beacon period (ms); informational, the tick drives beaconing.
    pub hello_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            message_timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            max_message_history: DEFAULT_MAX_MESSAGE_HISTORY,
            neighbor_timeout_ms: DEFAULT_NEIGHBOR_TIMEOUT_MS,
            route_timeout_ms: DEFAULT_ROUTE_TIMEOUT_MS,
            max_hop_count: DEFAULT_MAX_HOP_COUNT,
            max_cert_chain: DEFAULT_MAX_CERT_CHAIN,
            trust_threshold: DEFAULT_TRUST_THRESHOLD,
            trust_alpha: DEFAULT_TRUST_ALPHA,
            max_speed_kmh: DEFAULT_MAX_SPEED_KMH,
            max_acceleration_ms2: DEFAULT_MAX_ACCELERATION_MS2,
            blackhole_advert_threshold: DEFAULT_BLACKHOLE_ADVERT_THRESHOLD,
            blackhole_window_ms: DEFAULT_BLACKHOLE_WINDOW_MS,
            blackhole_forward_ratio: DEFAULT_BLACKHOLE_FORWARD_RATIO,
            sybil_distance_m: DEFAULT_SYBIL_DISTANCE_M,
            sybil_window_ms: DEFAULT_SYBIL_WINDOW_MS,
            hello_interval_ms: DEFAULT_HELLO_INTERVAL_MS,
        }
    }
}
