//! # Identity and Addressing
//!
//! This module defines the identity types shared by every layer of the DHT:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the node's identifier (NodeId)
//! - [`Contact`]: a known node plus the listen addresses it announced
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key**. Possession of the secret key is proven by
//! signing every envelope, so no separate certificate layer exists. The same
//! 32 bytes are the node's position in the XOR metric space used for routing.
//!
//! ## Distance
//!
//! `distance(a, b) = a XOR b`, compared as a big-endian unsigned integer via
//! [`distance_cmp`]. It is symmetric and `distance(a, a) == 0`.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns current time as milliseconds since Unix epoch.
/// Used for envelope timestamps and signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Restore a keypair from its 32-byte secret key in hex.
    pub fn from_secret_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self::from_secret_key_bytes(&bytes))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that this identity is a usable Ed25519 public key.
    ///
    /// Rejects the trivial all-zero and all-0xFF patterns before attempting
    /// point decompression.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
///
/// # Example
/// ```ignore
/// let dist_a = target.xor_distance(&a);
/// let dist_b = target.xor_distance(&b);
/// if distance_cmp(&dist_a, &dist_b) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

/// Order two identities by their distance to `target`.
#[inline]
pub(crate) fn closer_to(target: &Identity, a: &Identity, b: &Identity) -> std::cmp::Ordering {
    distance_cmp(&a.xor_distance(target), &b.xor_distance(target))
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Maximum listen addresses carried per contact.
pub(crate) const MAX_ADDRS: usize = 8;

/// Maximum length of a single listen address.
pub(crate) const MAX_ADDR_LEN: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    /// Listen addresses announced during introduction. Empty for nodes that
    /// can only be reached through the signaling relay.
    pub addrs: Vec<String>,
    /// Local observation time, never sent on the wire.
    #[serde(skip)]
    pub last_seen_ms: u64,
}

impl Contact {
    pub fn new(identity: Identity, addrs: Vec<String>) -> Self {
        Self {
            identity,
            addrs,
            last_seen_ms: now_ms(),
        }
    }

    /// A contact with no known listen address.
    pub fn unreachable(identity: Identity) -> Self {
        Self::new(identity, Vec::new())
    }

    pub fn has_direct_addrs(&self) -> bool {
        !self.addrs.is_empty()
    }

    pub fn is_local(&self, local: &Identity) -> bool {
        self.identity == *local
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }

    /// Bounds check for contacts decoded from untrusted peers.
    pub fn validate_structure(&self) -> bool {
        if self.addrs.len() > MAX_ADDRS {
            return false;
        }
        self.addrs
            .iter()
            .all(|addr| !addr.is_empty() && addr.len() <= MAX_ADDR_LEN)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}
