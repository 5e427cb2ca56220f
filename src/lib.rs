//! # Convoy - Secure VANET Routing Library
//!
//! Convoy implements a secure, position-aware routing protocol for
//! vehicular ad-hoc networks. Each vehicle runs one [`RoutingNode`]
//! that:
//!
//! - **Discovers neighbors** from authenticated HELLO beacons carrying
//!   position, speed, and heading
//! - **Finds multi-hop routes** on demand with AODV-style
//!   request/reply flooding and maintains them until timeout or error
//! - **Authenticates every message** with a digital signature binding
//!   payload, timestamp, and sequence number, optionally under an
//!   X.509 certificate chain
//! - **Scores peer trust** with an exponential moving average fed by
//!   beacon validity and detector verdicts
//! - **Detects VANET attacks**: replay, position falsification,
//!   black-hole advertisement, Sybil identities, stale timestamps
//!
//! ## Architecture
//!
//! The instance is a sans-io, single-threaded cooperative actor. It
//! owns all of its state; the environment injects a packet sink, a
//! clock, and a certificate store (see `transport`), and drives the
//! instance through its public operations. Inbound bytes flow through
//! envelope verification, then the codec, then one per-type handler;
//! outbound packets leave synchronously through the injected channel.
//!
//! ## Security Model
//!
//! - A message mutates state only after freshness, replay, certificate,
//!   and signature checks all pass
//! - Messages from one sender carry a monotonically increasing sequence
//!   number; accepted (timestamp, sequence) pairs are never accepted
//!   twice within the freshness window
//! - Unknown peers start at zero trust and earn it beacon by beacon;
//!   detected misbehavior halves it, and next hops below the threshold
//!   lose their routes immediately
//! - Shutdown drops all tables and releases key material
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | `RoutingNode` facade: public operations and handlers |
//! | `config` | Protocol tunables with deployment defaults |
//! | `crypto` | Keypairs, hashing, SecureMessage, replay cache, X.509 |
//! | `messages` | Wire codec for the five routing payloads + framing |
//! | `neighbors` | One-hop neighbor table with liveness eviction |
//! | `routes` | Route cache, discovery dedup, error bookkeeping |
//! | `trust` | Trust scores, movement plausibility, attack detectors |
//! | `transport` | Injected environment traits and harness impls |

mod config;
mod crypto;
mod messages;
mod neighbors;
mod node;
mod routes;
mod transport;
mod trust;

pub use config::Config;
pub use crypto::{
    hash_message, CryptoError, HashAlgorithm, Keypair, SecureMessage, SignatureAlgorithm,
};
pub use messages::{
    decode_secure, encode_secure, DecodeError, MessageBody, MessageType, RoutingMessage,
};
pub use neighbors::{Position, VehicleInfo};
pub use node::{Delivery, ErrorKind, RoutingError, RoutingNode};
pub use routes::RouteEntry;
pub use transport::{
    CertStore, Clock, ManualClock, Outbound, QueueChannel, SendChannel, StaticCertStore,
    SystemClock,
};
