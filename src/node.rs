//! # Routing Instance
//!
//! [`RoutingNode`] is the per-vehicle facade combining the crypto
//! envelope, the wire codec, and the three state machines (neighbors,
//! routes, trust) into the public protocol surface:
//!
//! - `initialize` / `initialize_with_key`: install identity and key
//!   material
//! - `update_position`: feed the local mobility fix
//! - `send_data`: originate application payloads
//! - `receive_bytes`: process one inbound frame
//! - `tick`: periodic maintenance and beaconing
//! - `shutdown`: drop all state and key material
//!
//! ## Processing Discipline
//!
//! The instance is a single-threaded cooperative actor: public
//! operations are mutually exclusive and never suspend; outbound
//! packets leave synchronously through the injected [`SendChannel`].
//! An inbound frame runs the full envelope check before any table is
//! touched, and a rejected message mutates neither the neighbor table
//! nor the route cache. Trust penalties arising from a rejection are
//! applied after the error value is computed.
//!
//! ## Transmitter vs Originator
//!
//! Every frame is signed by its transmitter, whose identity is the
//! certificate subject (or, for cert-less single-hop traffic, the
//! payload source). The payload header `source` names the originator
//! and is never rewritten in flight. Handlers attribute trust and
//! learn hops from the transmitter.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{CryptoEnvelope, CryptoError, SignatureAlgorithm, VerifiedCert};
use crate::messages::{self, MessageBody, RoutingMessage};
use crate::neighbors::{NeighborTable, Position, VehicleInfo};
use crate::routes::{RouteCache, RouteEntry};
use crate::transport::{CertStore, Clock, SendChannel};
use crate::trust::{detect_sybil_collisions, validate_movement, BlackholeDetector, TrustTable};

/// Failure kinds surfaced by the public operations. Exhaustive; the
/// instance never panics and never throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation invoked before a successful `initialize`.
    NotInitialized,
    /// Keypair generation or key loading failed.
    KeyGenFailed,
    /// Signing was required but no private key is loaded.
    NoPrivateKey,
    /// Unknown hash algorithm tag.
    UnsupportedAlgorithm,
    /// Frame or payload failed to decode.
    MalformedMessage,
    /// Envelope timestamp outside the freshness window.
    StaleOrFuture,
    /// Envelope (timestamp, sequence) already accepted.
    Replayed,
    /// Sender certificate invalid, expired, or untrusted.
    BadCertificate,
    /// Envelope signature did not verify.
    BadSignature,
    /// Reported movement is physically implausible.
    InvalidMovement,
    /// No live route; discovery has been started where applicable.
    NoRoute,
    /// Path length limit reached.
    HopLimitExceeded,
    /// The peer's trust score is below the threshold.
    UntrustedPeer,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotInitialized => "not initialized",
            ErrorKind::KeyGenFailed => "key generation failed",
            ErrorKind::NoPrivateKey => "no private key",
            ErrorKind::UnsupportedAlgorithm => "unsupported algorithm",
            ErrorKind::MalformedMessage => "malformed message",
            ErrorKind::StaleOrFuture => "stale or future timestamp",
            ErrorKind::Replayed => "replayed message",
            ErrorKind::BadCertificate => "bad certificate",
            ErrorKind::BadSignature => "bad signature",
            ErrorKind::InvalidMovement => "implausible movement",
            ErrorKind::NoRoute => "no route to destination",
            ErrorKind::HopLimitExceeded => "hop limit exceeded",
            ErrorKind::UntrustedPeer => "peer below trust threshold",
        };
        f.write_str(s)
    }
}

impl From<CryptoError> for ErrorKind {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyGenFailed => ErrorKind::KeyGenFailed,
            CryptoError::NoPrivateKey => ErrorKind::NoPrivateKey,
            CryptoError::UnsupportedAlgorithm => ErrorKind::UnsupportedAlgorithm,
            CryptoError::StaleOrFuture => ErrorKind::StaleOrFuture,
            CryptoError::Replayed => ErrorKind::Replayed,
            CryptoError::BadCertificate => ErrorKind::BadCertificate,
            CryptoError::BadSignature => ErrorKind::BadSignature,
        }
    }
}

/// A failure: kind code plus the peer it is attributed to, when one
/// can be named.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// The peer involved, when attributable.
    pub peer: Option<String>,
}

impl RoutingError {
    fn new(kind: ErrorKind) -> Self {
        Self { kind, peer: None }
    }

    fn with_peer(kind: ErrorKind, peer: &str) -> Self {
        Self {
            kind,
            peer: Some(peer.to_string()),
        }
    }
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer {
            Some(peer) => write!(f, "{} (peer {})", self.kind, peer),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for RoutingError {}

/// An application payload that arrived for the local vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Originating vehicle.
    pub source: String,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

/// One vehicle's routing instance.
pub struct RoutingNode<S: SendChannel, C: Clock> {
    id: String,
    config: Config,
    channel: S,
    clock: C,
    envelope: CryptoEnvelope,
    local: Option<VehicleInfo>,
    local_speed_ms: Option<f64>,
    neighbors: NeighborTable,
    routes: RouteCache,
    trust: TrustTable,
    blackhole: BlackholeDetector,
    peer_keys: HashMap<String, Vec<u8>>,
    rreq_counter: u32,
    delivered: Vec<Delivery>,
}

impl<S: SendChannel, C: Clock> RoutingNode<S, C> {
    /// Create a pre-init instance. Every protocol operation fails with
    /// `NotInitialized` until [`RoutingNode::initialize`] succeeds.
    pub fn new(id: impl Into<String>, config: Config, channel: S, clock: C) -> Self {
        let id = id.into();
        Self {
            envelope: CryptoEnvelope::new(
                config.message_timeout_ms,
                config.max_message_history,
                config.max_cert_chain,
            ),
            neighbors: NeighborTable::new(config.neighbor_timeout_ms),
            routes: RouteCache::new(
                config.route_timeout_ms,
                config.message_timeout_ms,
                config.max_hop_count,
            ),
            trust: TrustTable::new(id.clone(), config.trust_alpha),
            blackhole: BlackholeDetector::new(
                config.blackhole_window_ms,
                config.blackhole_advert_threshold,
                config.blackhole_forward_ratio,
            ),
            id,
            config,
            channel,
            clock,
            local: None,
            local_speed_ms: None,
            peer_keys: HashMap::new(),
            rreq_counter: 0,
            delivered: Vec::new(),
        }
    }

    /// Install identity with a freshly generated ECDSA keypair. The
    /// certificate in `info`, if any, must have been issued over that
    /// key out of band to be verifiable by peers; deployments with a
    /// CA normally use [`RoutingNode::initialize_with_key`] instead.
    pub fn initialize(
        &mut self,
        info: VehicleInfo,
        store: &dyn CertStore,
    ) -> Result<(), RoutingError> {
        self.init_with(info, None, store)
    }

    /// Install identity with an externally issued private key (PKCS#8
    /// DER), typically the key the CA certified.
    pub fn initialize_with_key(
        &mut self,
        info: VehicleInfo,
        pkcs8_der: &[u8],
        store: &dyn CertStore,
    ) -> Result<(), RoutingError> {
        self.init_with(info, Some(pkcs8_der), store)
    }

    fn init_with(
        &mut self,
        info: VehicleInfo,
        pkcs8_der: Option<&[u8]>,
        store: &dyn CertStore,
    ) -> Result<(), RoutingError> {
        if info.id != self.id {
            warn!(expected = %self.id, got = %info.id, "initialize id mismatch");
            return Err(RoutingError::new(ErrorKind::NotInitialized));
        }
        match pkcs8_der {
            Some(der) => self
                .envelope
                .load_private_key(der)
                .map_err(|e| RoutingError::new(e.into()))?,
            None => self
                .envelope
                .generate_keypair(SignatureAlgorithm::default())
                .map_err(|e| RoutingError::new(e.into()))?,
        }
        if !info.certificate.is_empty() {
            self.envelope.load_certificate(info.certificate.clone());
        }
        self.envelope.set_trust_anchors(store.trust_anchors());
        self.local_speed_ms = None;
        self.local = Some(info);
        info!(id = %self.id, "vehicle initialized");
        Ok(())
    }

    /// Feed a new local mobility fix. Rejects physically implausible
    /// jumps the same way a peer would.
    pub fn update_position(&mut self, position: Position) -> Result<(), RoutingError> {
        self.require_ready()?;
        let prev = self
            .local
            .as_ref()
            .map(|l| l.position)
            .ok_or_else(|| RoutingError::new(ErrorKind::NotInitialized))?;
        let mut new_speed = self.local_speed_ms;
        if prev.observed_at_ms > 0 {
            match validate_movement(
                &prev,
                self.local_speed_ms,
                &position,
                self.config.max_speed_kmh,
                self.config.max_acceleration_ms2,
            ) {
                Ok(speed) => new_speed = Some(speed),
                Err(reason) => {
                    debug!(%reason, "own position update rejected");
                    return Err(RoutingError::new(ErrorKind::InvalidMovement));
                }
            }
        }
        if let Some(local) = self.local.as_mut() {
            local.position = position;
            if let Some(speed) = new_speed {
                local.speed = speed;
            }
        }
        self.local_speed_ms = new_speed;
        let (wall, mono) = (self.clock.now_ms(), self.clock.mono_ms());
        self.prune_tables(wall, mono);
        Ok(())
    }

    /// Send application bytes toward `dest`. With a live, trusted
    /// route the DATA message leaves immediately; otherwise discovery
    /// is started and `NoRoute` is returned for the caller to retry.
    pub fn send_data(&mut self, dest: &str, data: &[u8]) -> Result<(), RoutingError> {
        self.require_ready()?;
        let (wall, mono) = (self.clock.now_ms(), self.clock.mono_ms());
        self.prune_tables(wall, mono);

        if dest == self.id {
            self.delivered.push(Delivery {
                source: self.id.clone(),
                payload: data.to_vec(),
            });
            return Ok(());
        }

        if let Some(entry) = self.routes.lookup_live(dest, mono).cloned() {
            if self
                .trust
                .is_trusted(&entry.next_hop, self.config.trust_threshold)
            {
                let msg = RoutingMessage {
                    source: self.id.clone(),
                    destination: dest.to_string(),
                    timestamp: wall,
                    body: MessageBody::Data {
                        payload: data.to_vec(),
                    },
                };
                return self.wrap_and_unicast(&msg, &entry.next_hop, wall);
            }
            debug!(dest = %dest, next_hop = %entry.next_hop, "route dropped, next hop untrusted");
            self.routes.remove(dest);
            self.broadcast_route_error(dest, wall)?;
        }

        self.start_discovery(dest, wall, mono)?;
        Err(RoutingError::with_peer(ErrorKind::NoRoute, dest))
    }

    /// Process one inbound frame. The envelope check runs to
    /// completion before any state is mutated; the first failure
    /// rejects the frame.
    pub fn receive_bytes(&mut self, raw: &[u8]) -> Result<(), RoutingError> {
        self.require_ready()?;
        let (wall, mono) = (self.clock.now_ms(), self.clock.mono_ms());
        self.prune_tables(wall, mono);

        let secure = messages::decode_secure(raw)
            .map_err(|_| RoutingError::new(ErrorKind::MalformedMessage))?;
        let origin = match messages::peek_source(&secure.payload) {
            Some(source) => source.to_string(),
            None => return Err(RoutingError::new(ErrorKind::MalformedMessage)),
        };
        // Our own broadcast echoed back; nothing to do.
        if origin == self.id {
            return Ok(());
        }

        let cached_key = self.cached_key_for(&origin);
        let verified =
            match self
                .envelope
                .verify_secure_message(&secure, wall, cached_key.as_deref())
            {
                Ok(verified) => verified,
                Err(CryptoError::Replayed) => {
                    warn!(peer = %origin, "replayed message rejected");
                    let err = RoutingError::with_peer(ErrorKind::Replayed, &origin);
                    self.trust.penalize(&origin);
                    self.drop_next_hop_if_untrusted(&origin);
                    return Err(err);
                }
                Err(err) => {
                    let kind = ErrorKind::from(err);
                    // A stale timestamp cannot be attributed to anyone.
                    let peer = (kind != ErrorKind::StaleOrFuture).then(|| origin.clone());
                    return Err(RoutingError { kind, peer });
                }
            };

        let transmitter = verified
            .as_ref()
            .map(|v| v.subject.clone())
            .unwrap_or_else(|| origin.clone());
        if transmitter == self.id {
            return Ok(());
        }

        let msg = RoutingMessage::decode(&secure.payload)
            .map_err(|_| RoutingError::with_peer(ErrorKind::MalformedMessage, &transmitter))?;

        match msg.body.clone() {
            MessageBody::Hello {
                x,
                y,
                z,
                speed,
                direction,
            } => {
                let position = Position::new(x, y, z, msg.timestamp);
                self.handle_hello(
                    &msg.source,
                    position,
                    speed,
                    direction,
                    &transmitter,
                    verified.as_ref(),
                    &secure.sender_cert,
                    mono,
                )
            }
            MessageBody::RouteRequest {
                request_id,
                hop_count,
                origin_timestamp,
            } => self.handle_route_request(
                &msg,
                request_id,
                hop_count,
                origin_timestamp,
                &transmitter,
                wall,
                mono,
            ),
            MessageBody::RouteReply {
                hop_count,
                lifetime_ms,
                path,
            } => self.handle_route_reply(
                &msg,
                hop_count,
                lifetime_ms,
                path,
                &transmitter,
                wall,
                mono,
            ),
            MessageBody::RouteError { unreachable } => {
                self.handle_route_error(&msg, &unreachable, &transmitter, wall, mono)
            }
            MessageBody::Data { payload } => self.handle_data(&msg, payload, wall, mono),
        }
    }

    /// Periodic maintenance: prune the replay cache, the neighbor
    /// table, the route cache, and the detector windows, then emit a
    /// HELLO beacon. Idempotent and safe to invoke at any time.
    pub fn tick(&mut self) -> Result<(), RoutingError> {
        self.require_ready()?;
        let (wall, mono) = (self.clock.now_ms(), self.clock.mono_ms());
        self.envelope.prune_replay(wall);
        self.neighbors.prune(mono);
        self.routes.prune(mono);
        self.blackhole.prune(mono);

        let Some(local) = self.local.as_ref() else {
            return Err(RoutingError::new(ErrorKind::NotInitialized));
        };
        let beacon = RoutingMessage {
            source: self.id.clone(),
            destination: String::new(),
            timestamp: wall,
            body: MessageBody::Hello {
                x: local.position.x,
                y: local.position.y,
                z: local.position.z,
                speed: local.speed,
                direction: local.direction,
            },
        };
        self.wrap_and_broadcast(&beacon, wall)
    }

    /// Drop every table and release key material. The instance returns
    /// to the pre-init state.
    pub fn shutdown(&mut self) {
        self.envelope.clear();
        self.neighbors.clear();
        self.routes.clear();
        self.trust.clear();
        self.blackhole.clear();
        self.peer_keys.clear();
        self.delivered.clear();
        self.local = None;
        self.local_speed_ms = None;
        info!(id = %self.id, "vehicle shut down");
    }

    /// Remove the route to `dest` and announce the breakage.
    pub fn invalidate_route(&mut self, dest: &str) -> Result<(), RoutingError> {
        self.require_ready()?;
        let wall = self.clock.now_ms();
        if self.routes.remove(dest).is_none() {
            return Err(RoutingError::with_peer(ErrorKind::NoRoute, dest));
        }
        self.broadcast_route_error(dest, wall)
    }

    /// Feed an externally observed forwarding outcome into the
    /// black-hole detector.
    pub fn record_forwarding(&mut self, peer: &str, success: bool) {
        self.blackhole.record_forwarding(peer, success);
    }

    /// Register an out-of-band verification key (DER
    /// SubjectPublicKeyInfo) for a peer that beacons without a
    /// certificate.
    pub fn register_peer_key(&mut self, peer: &str, spki_der: Vec<u8>) {
        self.peer_keys.insert(peer.to_string(), spki_der);
    }

    /// Take every payload delivered to this vehicle since the last
    /// call.
    pub fn take_delivered(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.delivered)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// This vehicle's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Has `initialize` succeeded?
    pub fn is_initialized(&self) -> bool {
        self.local.is_some()
    }

    /// Current trust score for a peer.
    pub fn trust_of(&self, peer: &str) -> f64 {
        self.trust.score(peer)
    }

    /// Is the peer at or above the trust threshold?
    pub fn is_trusted(&self, peer: &str) -> bool {
        self.trust.is_trusted(peer, self.config.trust_threshold)
    }

    /// Number of live neighbors.
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Is this id currently in the neighbor table?
    pub fn has_neighbor(&self, peer: &str) -> bool {
        self.neighbors.contains(peer)
    }

    /// Live route to `dest`, if one is installed.
    pub fn route_to(&self, dest: &str) -> Option<RouteEntry> {
        self.routes.lookup_live(dest, self.clock.mono_ms()).cloned()
    }

    /// Local verification key, for out-of-band distribution.
    pub fn public_key_der(&self) -> Option<Vec<u8>> {
        self.envelope.public_key_der().map(|k| k.to_vec())
    }

    /// Last known local position.
    pub fn position(&self) -> Option<Position> {
        self.local.as_ref().map(|l| l.position)
    }

    /// Live replay record count.
    pub fn replay_cache_len(&self) -> usize {
        self.envelope.replay_len()
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_hello(
        &mut self,
        source: &str,
        position: Position,
        speed: f64,
        direction: f64,
        transmitter: &str,
        verified: Option<&VerifiedCert>,
        cert_bytes: &[u8],
        mono: u64,
    ) -> Result<(), RoutingError> {
        // Beacons are single-hop; the signer must be the beaconing id.
        if source != transmitter {
            return Err(RoutingError::with_peer(
                ErrorKind::MalformedMessage,
                transmitter,
            ));
        }

        let mut derived_speed = None;
        if let Some(existing) = self.neighbors.get(source) {
            match validate_movement(
                &existing.info.position,
                existing.derived_speed_ms,
                &position,
                self.config.max_speed_kmh,
                self.config.max_acceleration_ms2,
            ) {
                Ok(speed_ms) => derived_speed = Some(speed_ms),
                Err(reason) => {
                    warn!(peer = %source, %reason, "position falsification suspected");
                    let err = RoutingError::with_peer(ErrorKind::InvalidMovement, source);
                    self.trust.penalize(source);
                    self.drop_next_hop_if_untrusted(source);
                    return Err(err);
                }
            }
        }

        let issuer = verified.map(|v| v.issuer_fingerprint);
        if let Some(fingerprint) = issuer.as_ref() {
            let colliders = detect_sybil_collisions(
                &self.neighbors,
                source,
                &position,
                Some(fingerprint),
                self.config.sybil_distance_m,
                self.config.sybil_window_ms,
            );
            if !colliders.is_empty() {
                warn!(peer = %source, ?colliders, "sybil identity collision");
                self.trust.penalize(source);
                self.drop_next_hop_if_untrusted(source);
                for other in &colliders {
                    self.trust.penalize(other);
                    self.drop_next_hop_if_untrusted(other);
                }
            }
        }

        self.neighbors.observe(
            VehicleInfo {
                id: source.to_string(),
                position,
                speed,
                direction,
                certificate: cert_bytes.to_vec(),
            },
            mono,
            verified.map(|v| v.spki_der.clone()),
            issuer,
            derived_speed,
        );
        self.trust.observe(source, 1.0);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_route_request(
        &mut self,
        msg: &RoutingMessage,
        request_id: u32,
        hop_count: u8,
        origin_timestamp: u64,
        transmitter: &str,
        wall: u64,
        mono: u64,
    ) -> Result<(), RoutingError> {
        let origin = &msg.source;
        if !self.routes.note_request(origin, request_id, mono) {
            return Ok(());
        }

        if msg.destination == self.id {
            self.learn_reverse_path(origin, transmitter, hop_count, mono);
            debug!(origin = %origin, request_id, "answering route request");
            let reply = RoutingMessage {
                source: self.id.clone(),
                destination: origin.clone(),
                timestamp: wall,
                body: MessageBody::RouteReply {
                    hop_count: 1,
                    lifetime_ms: self.route_lifetime_ms(),
                    path: vec![self.id.clone()],
                },
            };
            return self.wrap_and_unicast(&reply, transmitter, wall);
        }

        let forwarded_hops = hop_count.saturating_add(1);
        if forwarded_hops >= self.config.max_hop_count {
            debug!(origin = %origin, request_id, "route request dropped at hop limit");
            return Err(RoutingError::with_peer(ErrorKind::HopLimitExceeded, origin));
        }
        self.learn_reverse_path(origin, transmitter, hop_count, mono);

        let forward = RoutingMessage {
            source: origin.clone(),
            destination: msg.destination.clone(),
            timestamp: msg.timestamp,
            body: MessageBody::RouteRequest {
                request_id,
                hop_count: forwarded_hops,
                origin_timestamp,
            },
        };
        self.wrap_and_broadcast(&forward, wall)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_route_reply(
        &mut self,
        msg: &RoutingMessage,
        hop_count: u8,
        lifetime_ms: u32,
        path: Vec<String>,
        transmitter: &str,
        wall: u64,
        mono: u64,
    ) -> Result<(), RoutingError> {
        let advertised = &msg.source;
        let requester = &msg.destination;

        if self
            .blackhole
            .record_advertisement(transmitter, advertised, mono)
        {
            warn!(peer = %transmitter, "black-hole advertiser");
            let err = RoutingError::with_peer(ErrorKind::UntrustedPeer, transmitter);
            self.trust.penalize(transmitter);
            self.routes.remove_via(transmitter);
            return Err(err);
        }

        if !self.neighbors.contains(transmitter) {
            return Err(RoutingError::with_peer(
                ErrorKind::UntrustedPeer,
                transmitter,
            ));
        }

        // Everything that can reject this reply is checked before any
        // route is installed.
        let forward_plan = if requester == &self.id {
            None
        } else {
            let forwarded_hops = hop_count.saturating_add(1);
            if forwarded_hops >= self.config.max_hop_count {
                return Err(RoutingError::with_peer(
                    ErrorKind::HopLimitExceeded,
                    advertised,
                ));
            }
            let Some(reverse) = self.routes.lookup_live(requester, mono) else {
                return Err(RoutingError::with_peer(ErrorKind::NoRoute, requester));
            };
            Some((reverse.next_hop.clone(), forwarded_hops))
        };

        self.routes.consider(
            advertised,
            RouteEntry {
                next_hop: transmitter.to_string(),
                hop_count,
                created_at_ms: mono,
                trust: self.trust.score(transmitter),
            },
            mono,
        );

        if let Some((next_hop, forwarded_hops)) = forward_plan {
            let mut forwarded_path = path;
            forwarded_path.push(self.id.clone());
            let forward = RoutingMessage {
                source: advertised.clone(),
                destination: requester.clone(),
                timestamp: msg.timestamp,
                body: MessageBody::RouteReply {
                    hop_count: forwarded_hops,
                    lifetime_ms,
                    path: forwarded_path,
                },
            };
            self.wrap_and_unicast(&forward, &next_hop, wall)?;
        }
        Ok(())
    }

    fn handle_route_error(
        &mut self,
        msg: &RoutingMessage,
        unreachable: &str,
        transmitter: &str,
        wall: u64,
        mono: u64,
    ) -> Result<(), RoutingError> {
        if !self
            .routes
            .note_error(&msg.source, unreachable, msg.timestamp, mono)
        {
            return Ok(());
        }
        if self.routes.remove_for_error(unreachable, transmitter) {
            debug!(dest = %unreachable, via = %transmitter, "route invalidated by error report");
        }
        let forward = RoutingMessage {
            source: msg.source.clone(),
            destination: String::new(),
            timestamp: msg.timestamp,
            body: MessageBody::RouteError {
                unreachable: unreachable.to_string(),
            },
        };
        self.wrap_and_broadcast(&forward, wall)
    }

    fn handle_data(
        &mut self,
        msg: &RoutingMessage,
        payload: Vec<u8>,
        wall: u64,
        mono: u64,
    ) -> Result<(), RoutingError> {
        if msg.destination == self.id {
            debug!(source = %msg.source, len = payload.len(), "payload delivered");
            self.delivered.push(Delivery {
                source: msg.source.clone(),
                payload,
            });
            return Ok(());
        }

        let Some(entry) = self.routes.lookup_live(&msg.destination, mono).cloned() else {
            let err = RoutingError::with_peer(ErrorKind::NoRoute, &msg.destination);
            self.broadcast_route_error(&msg.destination, wall)?;
            return Err(err);
        };
        if !self
            .trust
            .is_trusted(&entry.next_hop, self.config.trust_threshold)
        {
            let err = RoutingError::with_peer(ErrorKind::UntrustedPeer, &entry.next_hop);
            self.routes.remove(&msg.destination);
            self.broadcast_route_error(&msg.destination, wall)?;
            return Err(err);
        }

        let forward = RoutingMessage {
            source: msg.source.clone(),
            destination: msg.destination.clone(),
            timestamp: msg.timestamp,
            body: MessageBody::Data { payload },
        };
        self.wrap_and_unicast(&forward, &entry.next_hop, wall)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require_ready(&self) -> Result<(), RoutingError> {
        if self.local.is_none() {
            return Err(RoutingError::new(ErrorKind::NotInitialized));
        }
        Ok(())
    }

    fn prune_tables(&mut self, wall: u64, mono: u64) {
        self.envelope.prune_replay(wall);
        self.neighbors.prune(mono);
        self.routes.prune(mono);
    }

    fn cached_key_for(&self, peer: &str) -> Option<Vec<u8>> {
        if let Some(key) = self.peer_keys.get(peer) {
            return Some(key.clone());
        }
        self.neighbors.get(peer).and_then(|n| n.spki_der.clone())
    }

    /// Install a route back to a request originator via the
    /// transmitting neighbor, when that neighbor is currently known.
    fn learn_reverse_path(&mut self, origin: &str, transmitter: &str, hop_count: u8, mono: u64) {
        if !self.neighbors.contains(transmitter) {
            return;
        }
        self.routes.consider(
            origin,
            RouteEntry {
                next_hop: transmitter.to_string(),
                hop_count: hop_count.saturating_add(1),
                created_at_ms: mono,
                trust: self.trust.score(transmitter),
            },
            mono,
        );
    }

    fn start_discovery(&mut self, dest: &str, wall: u64, mono: u64) -> Result<(), RoutingError> {
        let request_id = self.rreq_counter;
        self.rreq_counter = self.rreq_counter.wrapping_add(1);
        // Suppress our own flood when it comes back around.
        let origin = self.id.clone();
        self.routes.note_request(&origin, request_id, mono);
        debug!(dest = %dest, request_id, "route discovery started");
        let request = RoutingMessage {
            source: self.id.clone(),
            destination: dest.to_string(),
            timestamp: wall,
            body: MessageBody::RouteRequest {
                request_id,
                hop_count: 0,
                origin_timestamp: wall,
            },
        };
        self.wrap_and_broadcast(&request, wall)
    }

    fn broadcast_route_error(&mut self, unreachable: &str, wall: u64) -> Result<(), RoutingError> {
        let report = RoutingMessage {
            source: self.id.clone(),
            destination: String::new(),
            timestamp: wall,
            body: MessageBody::RouteError {
                unreachable: unreachable.to_string(),
            },
        };
        self.wrap_and_broadcast(&report, wall)
    }

    fn drop_next_hop_if_untrusted(&mut self, peer: &str) {
        if !self.trust.is_trusted(peer, self.config.trust_threshold) {
            let lost = self.routes.remove_via(peer);
            if !lost.is_empty() {
                debug!(peer = %peer, ?lost, "untrusted next hop removed from routes");
            }
        }
    }

    fn route_lifetime_ms(&self) -> u32 {
        self.config.route_timeout_ms.min(u64::from(u32::MAX)) as u32
    }

    fn wrap_and_broadcast(&mut self, msg: &RoutingMessage, wall: u64) -> Result<(), RoutingError> {
        let secure = self
            .envelope
            .create_secure_message(msg.encode(), wall)
            .map_err(|e| RoutingError::new(e.into()))?;
        self.channel.broadcast(&messages::encode_secure(&secure));
        Ok(())
    }

    fn wrap_and_unicast(
        &mut self,
        msg: &RoutingMessage,
        peer: &str,
        wall: u64,
    ) -> Result<(), RoutingError> {
        let secure = self
            .envelope
            .create_secure_message(msg.encode(), wall)
            .map_err(|e| RoutingError::new(e.into()))?;
        self.channel
            .unicast(peer, &messages::encode_secure(&secure));
        Ok(())
    }
}
