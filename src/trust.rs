//! # Trust Scores and Attack Detection
//!
//! Per-peer trust lives in `[0.0, 1.0]`: unknown peers start at 0.0,
//! the local vehicle is pinned at 1.0, and every attributable
//! observation feeds an exponential moving average. Detected
//! misbehavior halves the score directly.
//!
//! Three detectors live here:
//!
//! - **Movement plausibility**: successive positions must be reachable
//!   under the speed and acceleration caps; violations mean a falsified
//!   position.
//! - **Black-hole**: a peer advertising routes to many distinct
//!   destinations in a short window while observably forwarding almost
//!   nothing is attracting traffic to drop it.
//! - **Sybil**: two identities beaconing from the same spot in
//!   overlapping windows under certificates from the same issuer are
//!   one radio with two names.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::neighbors::{NeighborTable, Position};

/// Hard penalty factor applied on detected misbehavior.
const MISBEHAVIOR_PENALTY: f64 = 0.5;

/// Why a movement was judged implausible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementError {
    /// The two fixes are not strictly ordered in time.
    NonPositiveInterval,
    /// Implied speed exceeds the cap.
    SpeedExceeded,
    /// Implied acceleration exceeds the cap.
    AccelerationExceeded,
}

impl std::fmt::Display for MovementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementError::NonPositiveInterval => write!(f, "non-positive time interval"),
            MovementError::SpeedExceeded => write!(f, "implied speed exceeds cap"),
            MovementError::AccelerationExceeded => write!(f, "implied acceleration exceeds cap"),
        }
    }
}

impl std::error::Error for MovementError {}

/// Check that moving from `prev` to `next` is physically plausible.
///
/// Returns the implied speed in m/s for the caller to store against
/// the next check. `prev_speed_ms` is the speed derived from the
/// previous pair of fixes, when one exists.
///
/// The speed comparison happens in m/s against `max_speed_kmh / 3.6`
/// so the stated km/h boundary is exact.
pub fn validate_movement(
    prev: &Position,
    prev_speed_ms: Option<f64>,
    next: &Position,
    max_speed_kmh: f64,
    max_acceleration_ms2: f64,
) -> Result<f64, MovementError> {
    if next.observed_at_ms <= prev.observed_at_ms {
        return Err(MovementError::NonPositiveInterval);
    }
    let dt = (next.observed_at_ms - prev.observed_at_ms) as f64 / 1_000.0;
    let speed_ms = prev.distance_to(next) / dt;
    if speed_ms > max_speed_kmh / 3.6 {
        return Err(MovementError::SpeedExceeded);
    }
    if let Some(prev_speed) = prev_speed_ms {
        if (speed_ms - prev_speed).abs() / dt > max_acceleration_ms2 {
            return Err(MovementError::AccelerationExceeded);
        }
    }
    Ok(speed_ms)
}

/// Per-peer trust scores with EMA smoothing.
pub struct TrustTable {
    scores: HashMap<String, f64>,
    self_id: String,
    alpha: f64,
}

impl TrustTable {
    /// Create a table. The local id is pinned at full trust.
    pub fn new(self_id: String, alpha: f64) -> Self {
        Self {
            scores: HashMap::new(),
            self_id,
            alpha,
        }
    }

    /// Current score: 1.0 for the local vehicle, 0.0 for strangers.
    pub fn score(&self, id: &str) -> f64 {
        if id == self.self_id {
            return 1.0;
        }
        self.scores.get(id).copied().unwrap_or(0.0)
    }

    /// Feed one observation in `[0.0, 1.0]` into the EMA.
    pub fn observe(&mut self, id: &str, observation: f64) {
        if id == self.self_id {
            return;
        }
        let obs = observation.clamp(0.0, 1.0);
        let old = self.score(id);
        let new = (self.alpha * obs + (1.0 - self.alpha) * old).clamp(0.0, 1.0);
        self.scores.insert(id.to_string(), new);
    }

    /// Halve a peer's score for detected misbehavior. Returns the new
    /// score.
    pub fn penalize(&mut self, id: &str) -> f64 {
        if id == self.self_id {
            return 1.0;
        }
        let new = self.score(id) * MISBEHAVIOR_PENALTY;
        warn!(peer = %id, score = new, "trust penalized");
        self.scores.insert(id.to_string(), new);
        new
    }

    /// Is the peer at or above the threshold?
    pub fn is_trusted(&self, id: &str, threshold: f64) -> bool {
        self.score(id) >= threshold
    }

    /// Forget every score.
    pub fn clear(&mut self) {
        self.scores.clear();
    }
}

/// Sliding-window route-advertisement counter plus forwarding ledger.
pub struct BlackholeDetector {
    adverts: HashMap<String, VecDeque<(String, u64)>>,
    forwards: HashMap<String, (u64, u64)>,
    window_ms: u64,
    advert_threshold: usize,
    min_forward_ratio: f64,
}

impl BlackholeDetector {
    /// Create a detector with the given window and thresholds.
    pub fn new(window_ms: u64, advert_threshold: usize, min_forward_ratio: f64) -> Self {
        Self {
            adverts: HashMap::new(),
            forwards: HashMap::new(),
            window_ms,
            advert_threshold,
            min_forward_ratio,
        }
    }

    /// Record an externally observed forwarding outcome for `peer`.
    pub fn record_forwarding(&mut self, peer: &str, success: bool) {
        let (ok, total) = self.forwards.entry(peer.to_string()).or_insert((0, 0));
        if success {
            *ok += 1;
        }
        *total += 1;
    }

    /// Observed forwarding-success ratio; 0.0 with no observations, so
    /// a peer that only ever advertises looks maximally suspicious.
    pub fn forward_ratio(&self, peer: &str) -> f64 {
        match self.forwards.get(peer) {
            Some((ok, total)) if *total > 0 => *ok as f64 / *total as f64,
            _ => 0.0,
        }
    }

    /// Record that `peer` advertised a route to `dest`. Returns `true`
    /// when the advertisement pattern crosses the black-hole condition:
    /// at least the threshold number of distinct destinations within
    /// the window while the forwarding ratio sits below the minimum.
    pub fn record_advertisement(&mut self, peer: &str, dest: &str, now_ms: u64) -> bool {
        let window = self.window_ms;
        let distinct = {
            let queue = self.adverts.entry(peer.to_string()).or_default();
            while queue
                .front()
                .is_some_and(|(_, at)| now_ms.saturating_sub(*at) > window)
            {
                queue.pop_front();
            }
            queue.push_back((dest.to_string(), now_ms));
            queue
                .iter()
                .map(|(d, _)| d.as_str())
                .collect::<HashSet<_>>()
                .len()
        };

        let ratio = self.forward_ratio(peer);
        let fired = distinct >= self.advert_threshold && ratio < self.min_forward_ratio;
        if fired {
            debug!(peer = %peer, distinct, ratio, "black-hole advertisement pattern");
        }
        fired
    }

    /// Drop advertisement records older than the window.
    pub fn prune(&mut self, now_ms: u64) {
        let window = self.window_ms;
        for queue in self.adverts.values_mut() {
            while queue
                .front()
                .is_some_and(|(_, at)| now_ms.saturating_sub(*at) > window)
            {
                queue.pop_front();
            }
        }
        self.adverts.retain(|_, q| !q.is_empty());
    }

    /// Forget all state.
    pub fn clear(&mut self) {
        self.adverts.clear();
        self.forwards.clear();
    }
}

/// Find neighbors that collide with a beacon from `candidate_id`:
/// a different identity whose last position lies within `distance_m`,
/// observed within `window_ms` of the candidate fix, under a
/// certificate with the same issuer fingerprint.
pub fn detect_sybil_collisions(
    neighbors: &NeighborTable,
    candidate_id: &str,
    candidate_pos: &Position,
    candidate_issuer: Option<&[u8; 32]>,
    distance_m: f64,
    window_ms: u64,
) -> Vec<String> {
    let Some(issuer) = candidate_issuer else {
        return Vec::new();
    };
    neighbors
        .iter()
        .filter(|(id, _)| id.as_str() != candidate_id)
        .filter(|(_, entry)| entry.issuer_fingerprint.as_ref() == Some(issuer))
        .filter(|(_, entry)| {
            let pos = &entry.info.position;
            pos.observed_at_ms.abs_diff(candidate_pos.observed_at_ms) <= window_ms
                && pos.distance_to(candidate_pos) <= distance_m
        })
        .map(|(id, _)| id.clone())
        .collect()
}
