//! Shared harness for the protocol scenario tests: a test CA issuing
//! vehicle certificates, an in-memory radio with range-based
//! adjacency, and a forger that frames messages for adversarial
//! identities the way a hostile radio would.

// Each test binary compiles its own view of this module and exercises
// a different slice of it.
#![allow(dead_code)]

use convoy::{
    encode_secure, hash_message, Config, HashAlgorithm, Keypair, ManualClock, MessageBody,
    Outbound, Position, QueueChannel, RoutingMessage, RoutingNode, SecureMessage,
    StaticCertStore, VehicleInfo,
};

/// Scenario epoch, well inside the default certificate validity
/// window (November 2023).
pub const T0: u64 = 1_700_000_000_000;

/// Radio range for adjacency, meters.
pub const RADIO_RANGE_M: f64 = 250.0;

/// Per-delivery-round clock skew, so messages forwarded on different
/// hops never share a wall-clock millisecond.
const DELIVERY_LATENCY_MS: u64 = 13;

/// Per-node tick stagger inside one beacon round.
const TICK_STAGGER_MS: u64 = 7;

// ----------------------------------------------------------------------------
// Certificate authority
// ----------------------------------------------------------------------------

/// A self-signed root that issues vehicle certificates.
pub struct TestCa {
    pub cert_der: Vec<u8>,
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

impl TestCa {
    pub fn new() -> Self {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "convoy-test-root");
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_der: cert.der().to_vec(),
            cert,
            key,
        }
    }

    /// Issue a certificate for `id`. Returns (cert DER, PKCS#8 key DER).
    pub fn issue(&self, id: &str) -> (Vec<u8>, Vec<u8>) {
        self.issue_with(id, false)
    }

    /// Issue a certificate whose validity window ended in 2001.
    pub fn issue_expired(&self, id: &str) -> (Vec<u8>, Vec<u8>) {
        self.issue_with(id, true)
    }

    fn issue_with(&self, id: &str, expired: bool) -> (Vec<u8>, Vec<u8>) {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, id);
        if expired {
            params.not_before = rcgen::date_time_ymd(2000, 1, 1);
            params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        }
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.der().to_vec(), key.serialize_der())
    }

    pub fn store(&self) -> StaticCertStore {
        StaticCertStore::new(vec![self.cert_der.clone()])
    }
}

// ----------------------------------------------------------------------------
// Adversarial framing
// ----------------------------------------------------------------------------

/// Frames routing messages under an arbitrary identity's key and
/// certificate, bypassing a well-behaved node's own checks.
pub struct Forger {
    keypair: Keypair,
    cert_der: Vec<u8>,
    sequence: u32,
}

impl Forger {
    pub fn new(pkcs8_der: &[u8], cert_der: Vec<u8>) -> Self {
        Self {
            keypair: Keypair::from_pkcs8_der(pkcs8_der).unwrap(),
            cert_der,
            sequence: 0,
        }
    }

    /// Sign and frame one message at the given wall time.
    pub fn frame(&mut self, msg: &RoutingMessage, wall_ms: u64) -> Vec<u8> {
        let payload = msg.encode();
        let sequence = self.sequence;
        self.sequence += 1;

        let mut binding = payload.clone();
        binding.extend_from_slice(&wall_ms.to_le_bytes());
        binding.extend_from_slice(&sequence.to_le_bytes());
        let digest = hash_message(&binding, HashAlgorithm::Sha256);
        let signature = self.keypair.sign(&digest);

        encode_secure(&SecureMessage {
            payload,
            signature,
            timestamp: wall_ms,
            sequence,
            sender_cert: self.cert_der.clone(),
        })
    }
}

/// A HELLO beacon at a straight-line position.
pub fn hello_at(id: &str, x: f64, timestamp: u64) -> RoutingMessage {
    RoutingMessage {
        source: id.to_string(),
        destination: String::new(),
        timestamp,
        body: MessageBody::Hello {
            x,
            y: 0.0,
            z: 0.0,
            speed: 0.0,
            direction: 0.0,
        },
    }
}

// ----------------------------------------------------------------------------
// In-memory radio
// ----------------------------------------------------------------------------

pub type TestNode = RoutingNode<QueueChannel, ManualClock>;

/// A handful of vehicles on a shared clock, connected whenever their
/// reported positions are within radio range.
pub struct TestNet {
    pub clock: ManualClock,
    ids: Vec<String>,
    nodes: Vec<TestNode>,
    channels: Vec<QueueChannel>,
}

impl TestNet {
    /// Stand up certified vehicles at the given x coordinates.
    pub fn with_certs(layout: &[(&str, f64)], ca: &TestCa) -> Self {
        let clock = ManualClock::new(T0);
        let store = ca.store();
        let mut ids = Vec::new();
        let mut nodes = Vec::new();
        let mut channels = Vec::new();
        for (id, x) in layout {
            let channel = QueueChannel::new();
            let mut node = RoutingNode::new(*id, Config::default(), channel.clone(), clock.clone());
            let (cert_der, key_der) = ca.issue(id);
            let info = VehicleInfo {
                id: id.to_string(),
                position: Position::new(*x, 0.0, 0.0, T0),
                speed: 0.0,
                direction: 0.0,
                certificate: cert_der,
            };
            node.initialize_with_key(info, &key_der, &store).unwrap();
            ids.push(id.to_string());
            nodes.push(node);
            channels.push(channel);
        }
        Self {
            clock,
            ids,
            nodes,
            channels,
        }
    }

    fn index(&self, id: &str) -> usize {
        self.ids
            .iter()
            .position(|candidate| candidate == id)
            .unwrap_or_else(|| panic!("unknown vehicle {id}"))
    }

    pub fn node(&mut self, id: &str) -> &mut TestNode {
        let i = self.index(id);
        &mut self.nodes[i]
    }

    pub fn node_ref(&self, id: &str) -> &TestNode {
        &self.nodes[self.index(id)]
    }

    /// Take the packets a vehicle has emitted but not yet delivered.
    pub fn drain_from(&mut self, id: &str) -> Vec<Outbound> {
        let i = self.index(id);
        self.channels[i].drain()
    }

    /// Inject raw bytes at one vehicle, as a hostile radio would.
    pub fn inject(&mut self, id: &str, bytes: &[u8]) -> Result<(), convoy::RoutingError> {
        let i = self.index(id);
        self.nodes[i].receive_bytes(bytes)
    }

    fn in_range(&self, a: usize, b: usize) -> bool {
        match (self.nodes[a].position(), self.nodes[b].position()) {
            (Some(pa), Some(pb)) => pa.distance_to(&pb) <= RADIO_RANGE_M,
            _ => false,
        }
    }

    /// Deliver every pending packet to the vehicles in range. Returns
    /// the number of receptions. Receive errors are the receiver's
    /// business (an attack scenario expects them), not the radio's.
    pub fn deliver_round(&mut self) -> usize {
        self.clock.advance(DELIVERY_LATENCY_MS);
        let mut receptions = 0;
        // Snapshot first: packets emitted while handling this round's
        // deliveries belong to the next round, after the clock moves.
        let in_flight: Vec<(usize, Vec<Outbound>)> = (0..self.nodes.len())
            .map(|i| (i, self.channels[i].drain()))
            .collect();
        for (sender, packets) in in_flight {
            for packet in packets {
                match &packet.peer {
                    Some(peer) => {
                        let Some(target) = self.ids.iter().position(|c| c == peer) else {
                            continue;
                        };
                        if target != sender && self.in_range(sender, target) {
                            let _ = self.nodes[target].receive_bytes(&packet.bytes);
                            receptions += 1;
                        }
                    }
                    None => {
                        for target in 0..self.nodes.len() {
                            if target != sender && self.in_range(sender, target) {
                                let _ = self.nodes[target].receive_bytes(&packet.bytes);
                                receptions += 1;
                            }
                        }
                    }
                }
            }
        }
        receptions
    }

    /// Deliver until the air goes quiet or the round budget runs out.
    pub fn settle(&mut self, max_rounds: usize) {
        for _ in 0..max_rounds {
            if self.deliver_round() == 0 {
                return;
            }
        }
    }

    /// One beacon interval: every vehicle ticks (slightly staggered,
    /// as real radios are) and the beacons are delivered.
    pub fn beacon_round(&mut self) {
        for i in 0..self.nodes.len() {
            self.clock.advance(TICK_STAGGER_MS);
            self.nodes[i].tick().unwrap();
        }
        self.settle(4);
        let consumed = TICK_STAGGER_MS * self.nodes.len() as u64;
        self.clock.advance(1_000u64.saturating_sub(consumed));
    }
}
