//! # Cryptographic Envelope
//!
//! Everything a routing instance needs to authenticate traffic:
//!
//! - **Keypairs**: ECDSA P-256 (default, RFC 6979 deterministic) or
//!   RSA-PSS with a 2048-bit modulus
//! - **Hashing**: the negotiable digest set (SHA-256 default)
//! - **SecureMessage**: payload + timestamp + sequence number bound
//!   under one signature, with the sender certificate attached
//! - **Replay cache**: bounded record of accepted (timestamp, sequence)
//!   pairs
//! - **Certificate validation**: X.509 chain walk against injected
//!   trust anchors
//!
//! ## Verification Order
//!
//! [`CryptoEnvelope::verify_secure_message`] checks freshness, then
//! replay, then certificate, then signature. The first failure rejects
//! and nothing is recorded; only a fully verified message enters the
//! replay cache. Callers mutate no routing state before this returns.
//!
//! ## Key Handling
//!
//! Private keys are owned by the envelope and never exposed; the public
//! half travels as DER SubjectPublicKeyInfo. Dropping the envelope (or
//! calling [`CryptoEnvelope::clear`]) releases key material, which the
//! underlying types zeroize on drop.

use std::num::NonZeroUsize;

use blake2::Blake2b512;
use lru::LruCache;
use md5::Md5;
use p256::ecdsa::{
    Signature as EcdsaSignature, SigningKey as EcdsaSigningKey, VerifyingKey as EcdsaVerifyingKey,
};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rand::rngs::OsRng;
use rsa::pss::{
    BlindedSigningKey, Signature as PssSignature, VerifyingKey as PssVerifyingKey,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

/// Error type for envelope operations.
///
/// Every failure in this module is one of these; nothing panics and
/// nothing is thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The underlying primitive failed to produce a keypair.
    KeyGenFailed,
    /// A signing operation was requested with no private key loaded.
    NoPrivateKey,
    /// Unknown hash algorithm tag.
    UnsupportedAlgorithm,
    /// Envelope timestamp outside the freshness window.
    StaleOrFuture,
    /// (timestamp, sequence) already accepted.
    Replayed,
    /// Certificate failed to parse, expired, or has no trusted chain.
    BadCertificate,
    /// Signature did not verify, or no verification key was available.
    BadSignature,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::KeyGenFailed => write!(f, "key generation failed"),
            CryptoError::NoPrivateKey => write!(f, "no private key loaded"),
            CryptoError::UnsupportedAlgorithm => write!(f, "unsupported hash algorithm"),
            CryptoError::StaleOrFuture => write!(f, "timestamp outside freshness window"),
            CryptoError::Replayed => write!(f, "message replayed"),
            CryptoError::BadCertificate => write!(f, "certificate validation failed"),
            CryptoError::BadSignature => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Hashing
// ============================================================================

/// Digest algorithms negotiable with external peers.
///
/// The envelope itself always binds with SHA-256; the rest exist for
/// interop surfaces that carry an algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256 (default, used by the envelope binding).
    Sha256,
    /// SHA-1, legacy interop only.
    Sha1,
    /// MD5, legacy interop only.
    Md5,
    /// BLAKE2b-512.
    Blake2b512,
    /// SHA3-256.
    Sha3_256,
}

impl HashAlgorithm {
    /// Wire tag for this algorithm.
    pub fn tag(self) -> u8 {
        match self {
            HashAlgorithm::Sha256 => 0,
            HashAlgorithm::Sha1 => 1,
            HashAlgorithm::Md5 => 2,
            HashAlgorithm::Blake2b512 => 3,
            HashAlgorithm::Sha3_256 => 4,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, CryptoError> {
        match tag {
            0 => Ok(HashAlgorithm::Sha256),
            1 => Ok(HashAlgorithm::Sha1),
            2 => Ok(HashAlgorithm::Md5),
            3 => Ok(HashAlgorithm::Blake2b512),
            4 => Ok(HashAlgorithm::Sha3_256),
            _ => Err(CryptoError::UnsupportedAlgorithm),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

/// Digest `data` with the selected algorithm.
pub fn hash_message(data: &[u8], algo: HashAlgorithm) -> Vec<u8> {
    match algo {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Md5 => Md5::digest(data).to_vec(),
        HashAlgorithm::Blake2b512 => Blake2b512::digest(data).to_vec(),
        HashAlgorithm::Sha3_256 => Sha3_256::digest(data).to_vec(),
    }
}

// ============================================================================
// Keypairs and Signatures
// ============================================================================

/// Signature suites the envelope can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// ECDSA over P-256 (default).
    EcdsaP256,
    /// RSA-PSS, 2048-bit modulus.
    RsaPss,
}

impl Default for SignatureAlgorithm {
    fn default() -> Self {
        SignatureAlgorithm::EcdsaP256
    }
}

enum PrivateKey {
    Ecdsa(EcdsaSigningKey),
    RsaPss(BlindedSigningKey<Sha256>),
}

/// An asymmetric keypair owned by one envelope.
///
/// The private half is reachable only through [`Keypair::sign`]; the
/// public half is exported as DER SubjectPublicKeyInfo.
pub struct Keypair {
    key: PrivateKey,
    public_der: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh keypair.
    ///
    /// No partial state survives a failure.
    pub fn generate(algo: SignatureAlgorithm) -> Result<Self, CryptoError> {
        match algo {
            SignatureAlgorithm::EcdsaP256 => {
                let signing = EcdsaSigningKey::random(&mut OsRng);
                let public_der = signing
                    .verifying_key()
                    .to_public_key_der()
                    .map_err(|_| CryptoError::KeyGenFailed)?
                    .as_bytes()
                    .to_vec();
                Ok(Self {
                    key: PrivateKey::Ecdsa(signing),
                    public_der,
                })
            }
            SignatureAlgorithm::RsaPss => {
                let private =
                    RsaPrivateKey::new(&mut OsRng, 2048).map_err(|_| CryptoError::KeyGenFailed)?;
                let public_der = RsaPublicKey::from(&private)
                    .to_public_key_der()
                    .map_err(|_| CryptoError::KeyGenFailed)?
                    .as_bytes()
                    .to_vec();
                Ok(Self {
                    key: PrivateKey::RsaPss(BlindedSigningKey::<Sha256>::new(private)),
                    public_der,
                })
            }
        }
    }

    /// Load an externally issued private key (PKCS#8 DER). Tries the
    /// ECDSA suite first, then RSA-PSS.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let der = Zeroizing::new(der.to_vec());
        if let Ok(signing) = EcdsaSigningKey::from_pkcs8_der(&der) {
            let public_der = signing
                .verifying_key()
                .to_public_key_der()
                .map_err(|_| CryptoError::KeyGenFailed)?
                .as_bytes()
                .to_vec();
            return Ok(Self {
                key: PrivateKey::Ecdsa(signing),
                public_der,
            });
        }
        if let Ok(private) = RsaPrivateKey::from_pkcs8_der(&der) {
            let public_der = RsaPublicKey::from(&private)
                .to_public_key_der()
                .map_err(|_| CryptoError::KeyGenFailed)?
                .as_bytes()
                .to_vec();
            return Ok(Self {
                key: PrivateKey::RsaPss(BlindedSigningKey::<Sha256>::new(private)),
                public_der,
            });
        }
        Err(CryptoError::KeyGenFailed)
    }

    /// Public key as DER SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Sign a message. ECDSA signatures are DER-encoded; RSA-PSS
    /// signatures are raw modulus-width octets.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match &self.key {
            PrivateKey::Ecdsa(key) => {
                let signature: EcdsaSignature = key.sign(message);
                signature.to_der().as_bytes().to_vec()
            }
            PrivateKey::RsaPss(key) => {
                let signature: PssSignature = key.sign_with_rng(&mut OsRng, message);
                signature.to_vec()
            }
        }
    }
}

/// Verify `signature` over `message` against a DER SubjectPublicKeyInfo
/// public key. Returns `false` on any parse, init, or verify failure.
pub fn verify_signature(message: &[u8], signature: &[u8], spki_der: &[u8]) -> bool {
    if let Ok(key) = EcdsaVerifyingKey::from_public_key_der(spki_der) {
        return EcdsaSignature::from_der(signature)
            .map(|sig| key.verify(message, &sig).is_ok())
            .unwrap_or(false);
    }
    if let Ok(key) = RsaPublicKey::from_public_key_der(spki_der) {
        let verifying = PssVerifyingKey::<Sha256>::new(key);
        return PssSignature::try_from(signature)
            .map(|sig| verifying.verify(message, &sig).is_ok())
            .unwrap_or(false);
    }
    false
}

// ============================================================================
// Certificate Validation
// ============================================================================

/// Facts extracted from a validated certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCert {
    /// Subject common name; by convention the transmitting vehicle id.
    pub subject: String,
    /// Subject public key, DER SubjectPublicKeyInfo.
    pub spki_der: Vec<u8>,
    /// SHA-256 over the issuer distinguished name DER. Equal
    /// fingerprints mean the same issuer, which the Sybil detector
    /// correlates across identities.
    pub issuer_fingerprint: [u8; 32],
}

/// Validate a DER certificate against the trust anchors.
///
/// Checks, in order: parse, validity window at `now_ms`, then an issuer
/// chain of at most `max_chain` links through the anchor set. An anchor
/// reached by a verified signature is terminal if it is self-signed or
/// if the store holds no parent for it (explicitly provisioned
/// intermediate).
pub fn validate_certificate(
    cert_der: &[u8],
    anchors: &[Vec<u8>],
    now_ms: u64,
    max_chain: usize,
) -> Result<VerifiedCert, CryptoError> {
    use x509_parser::prelude::*;

    let (_, leaf) = X509Certificate::from_der(cert_der).map_err(|_| CryptoError::BadCertificate)?;
    let now = ASN1Time::from_timestamp((now_ms / 1000) as i64)
        .map_err(|_| CryptoError::BadCertificate)?;
    if !leaf.validity().is_valid_at(now) {
        debug!("certificate outside validity window");
        return Err(CryptoError::BadCertificate);
    }

    let subject = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or(CryptoError::BadCertificate)?
        .to_string();
    let spki_der = leaf.tbs_certificate.subject_pki.raw.to_vec();
    let issuer_fingerprint: [u8; 32] = Sha256::digest(leaf.issuer().as_raw()).into();

    // The leaf itself being an anchor short-circuits the walk.
    if anchors.iter().any(|a| a.as_slice() == cert_der) {
        return Ok(VerifiedCert {
            subject,
            spki_der,
            issuer_fingerprint,
        });
    }

    let parsed: Vec<X509Certificate<'_>> = anchors
        .iter()
        .filter_map(|der| X509Certificate::from_der(der).ok().map(|(_, c)| c))
        .collect();

    let mut current: &X509Certificate<'_> = &leaf;
    for _ in 0..max_chain {
        let parent = parsed
            .iter()
            .find(|c| c.subject().as_raw() == current.issuer().as_raw());
        let Some(parent) = parent else {
            warn!(subject = %subject, "certificate issuer not in trust anchors");
            return Err(CryptoError::BadCertificate);
        };
        if !parent.validity().is_valid_at(now) {
            return Err(CryptoError::BadCertificate);
        }
        if current.verify_signature(Some(parent.public_key())).is_err() {
            warn!(subject = %subject, "certificate signature does not verify against issuer");
            return Err(CryptoError::BadCertificate);
        }
        let self_signed = parent.subject().as_raw() == parent.issuer().as_raw();
        let has_grandparent = !self_signed
            && parsed
                .iter()
                .any(|c| c.subject().as_raw() == parent.issuer().as_raw());
        if self_signed || !has_grandparent {
            trace!(
                subject = %subject,
                issuer_fp = %hex::encode(issuer_fingerprint),
                "certificate chain anchored"
            );
            return Ok(VerifiedCert {
                subject,
                spki_der,
                issuer_fingerprint,
            });
        }
        current = parent;
    }

    Err(CryptoError::BadCertificate)
}

// ============================================================================
// Secure Messages and Replay Cache
// ============================================================================

/// Signed wrapper around one routing payload.
///
/// The signature covers `SHA-256(payload ‖ timestamp ‖ sequence)`, so
/// neither the payload nor its freshness fields can be altered without
/// detection, and a capture cannot be re-stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureMessage {
    /// Codec output being transported.
    pub payload: Vec<u8>,
    /// Signature over the binding digest.
    pub signature: Vec<u8>,
    /// Sender wall-clock milliseconds at creation.
    pub timestamp: u64,
    /// Per-sender monotonic counter, wrapping.
    pub sequence: u32,
    /// Sender certificate, DER X.509; empty when the sender relies on
    /// out-of-band key distribution.
    pub sender_cert: Vec<u8>,
}

/// Binding digest signed by the sender.
pub(crate) fn signing_digest(payload: &[u8], timestamp: u64, sequence: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(timestamp.to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.finalize().into()
}

/// Bounded record of accepted messages, keyed (timestamp, sequence).
///
/// The LRU bound enforces the capacity invariant; age pruning runs on
/// every insertion overflow check and on the scheduler tick.
pub struct ReplayCache {
    records: LruCache<(u64, u32), [u8; 32]>,
}

impl ReplayCache {
    /// Create a cache holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Is this (timestamp, sequence) pair already recorded?
    pub fn contains(&self, timestamp: u64, sequence: u32) -> bool {
        self.records.contains(&(timestamp, sequence))
    }

    /// Record an accepted message.
    pub fn insert(&mut self, timestamp: u64, sequence: u32, payload_hash: [u8; 32]) {
        self.records.put((timestamp, sequence), payload_hash);
    }

    /// Drop records older than the freshness window.
    pub fn prune(&mut self, now_ms: u64, timeout_ms: u64) {
        let expired: Vec<(u64, u32)> = self
            .records
            .iter()
            .filter(|((ts, _), _)| now_ms.saturating_sub(*ts) > timeout_ms)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.records.pop(&key);
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-instance cryptographic state: the keypair, the instance
/// certificate, the trust anchors, the outbound sequence counter, and
/// the replay cache.
pub struct CryptoEnvelope {
    keypair: Option<Keypair>,
    certificate: Vec<u8>,
    trust_anchors: Vec<Vec<u8>>,
    replay: ReplayCache,
    sequence: u32,
    message_timeout_ms: u64,
    max_cert_chain: usize,
}

impl CryptoEnvelope {
    /// Create an envelope with no key material loaded.
    pub fn new(message_timeout_ms: u64, max_message_history: usize, max_cert_chain: usize) -> Self {
        Self {
            keypair: None,
            certificate: Vec::new(),
            trust_anchors: Vec::new(),
            replay: ReplayCache::new(max_message_history),
            sequence: 0,
            message_timeout_ms,
            max_cert_chain,
        }
    }

    /// Generate and install a fresh keypair.
    pub fn generate_keypair(&mut self, algo: SignatureAlgorithm) -> Result<(), CryptoError> {
        self.keypair = Some(Keypair::generate(algo)?);
        Ok(())
    }

    /// Install an externally issued private key (PKCS#8 DER).
    pub fn load_private_key(&mut self, pkcs8_der: &[u8]) -> Result<(), CryptoError> {
        self.keypair = Some(Keypair::from_pkcs8_der(pkcs8_der)?);
        Ok(())
    }

    /// Install the instance certificate attached to outgoing messages.
    pub fn load_certificate(&mut self, cert_der: Vec<u8>) {
        self.certificate = cert_der;
    }

    /// Replace the trust anchor set.
    pub fn set_trust_anchors(&mut self, anchors: Vec<Vec<u8>>) {
        self.trust_anchors = anchors;
    }

    /// Public key of the loaded keypair, if any.
    pub fn public_key_der(&self) -> Option<&[u8]> {
        self.keypair.as_ref().map(|k| k.public_key_der())
    }

    /// True once a private key is loaded.
    pub fn has_private_key(&self) -> bool {
        self.keypair.is_some()
    }

    /// Wrap a payload: stamp it with the current time and the next
    /// sequence number, sign the binding, attach the certificate.
    pub fn create_secure_message(
        &mut self,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> Result<SecureMessage, CryptoError> {
        let keypair = self.keypair.as_ref().ok_or(CryptoError::NoPrivateKey)?;
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let digest = signing_digest(&payload, now_ms, sequence);
        let signature = keypair.sign(&digest);
        Ok(SecureMessage {
            payload,
            signature,
            timestamp: now_ms,
            sequence,
            sender_cert: self.certificate.clone(),
        })
    }

    /// Validate an inbound message: freshness, replay, certificate,
    /// signature, in that order; the first failure rejects. On success
    /// the message is recorded in the replay cache and the validated
    /// certificate facts (if a certificate was attached) are returned.
    ///
    /// `cached_key` is the stored verification key for the presumed
    /// transmitter, used when no certificate rides on the message.
    pub fn verify_secure_message(
        &mut self,
        message: &SecureMessage,
        now_ms: u64,
        cached_key: Option<&[u8]>,
    ) -> Result<Option<VerifiedCert>, CryptoError> {
        if now_ms.abs_diff(message.timestamp) > self.message_timeout_ms {
            return Err(CryptoError::StaleOrFuture);
        }
        if self.replay.contains(message.timestamp, message.sequence) {
            return Err(CryptoError::Replayed);
        }

        let verified = if message.sender_cert.is_empty() {
            None
        } else {
            Some(validate_certificate(
                &message.sender_cert,
                &self.trust_anchors,
                now_ms,
                self.max_cert_chain,
            )?)
        };

        let key = verified
            .as_ref()
            .map(|v| v.spki_der.as_slice())
            .or(cached_key)
            .ok_or(CryptoError::BadSignature)?;
        let digest = signing_digest(&message.payload, message.timestamp, message.sequence);
        if !verify_signature(&digest, &message.signature, key) {
            return Err(CryptoError::BadSignature);
        }

        self.replay.insert(
            message.timestamp,
            message.sequence,
            Sha256::digest(&message.payload).into(),
        );
        self.replay.prune(now_ms, self.message_timeout_ms);
        Ok(verified)
    }

    /// Drop expired replay records. Invoked from the scheduler tick.
    pub fn prune_replay(&mut self, now_ms: u64) {
        self.replay.prune(now_ms, self.message_timeout_ms);
    }

    /// Live replay record count.
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Release key material and forget all envelope state. The dropped
    /// private key zeroizes its scalars on drop.
    pub fn clear(&mut self) {
        self.keypair = None;
        self.certificate.clear();
        self.trust_anchors.clear();
        let cap = self.replay.records.cap();
        self.replay = ReplayCache::new(cap.get());
        self.sequence = 0;
    }
}
