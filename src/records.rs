//! # Signed Records
//!
//! Values stored in the DHT are self-authenticating: each record is signed by
//! its author, so any node can relay it and any reader can verify it without
//! trusting the node that served it.
//!
//! - [`SignedRecord`]: `(author, key, value, timestamp)` under the author's signature
//! - [`UserIdClaim`]: binds a lowercase user name to an identity, first claim wins
//!
//! Storage is newest-wins per `(key, author)`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, RECORD_SIGNATURE_DOMAIN,
    USER_ID_SIGNATURE_DOMAIN,
};
use crate::identity::{now_ms, Identity, Keypair};
use crate::messages::{encode, MAX_VALUE_SIZE};

/// 32-byte record key. Node ids and user hashes share this space.
pub type Key = [u8; 32];

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

/// User names after lowercasing: a letter, then 2 to 31 of `[a-z0-9_.-]`.
const USER_ID_PATTERN: &str = r"^[a-z][a-z0-9_.-]{2,31}$";

static USER_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn user_id_regex() -> Option<&'static Regex> {
    USER_ID_RE
        .get_or_init(|| Regex::new(USER_ID_PATTERN).ok())
        .as_ref()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    ValueTooLarge,
    InvalidUserId,
    HashMismatch,
    Encoding,
    Signature(SignatureError),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::ValueTooLarge => write!(f, "value exceeds {MAX_VALUE_SIZE} bytes"),
            RecordError::InvalidUserId => write!(f, "invalid user id"),
            RecordError::HashMismatch => write!(f, "user hash does not match user id"),
            RecordError::Encoding => write!(f, "record encoding failed"),
            RecordError::Signature(e) => write!(f, "record signature: {e}"),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<SignatureError> for RecordError {
    fn from(e: SignatureError) -> Self {
        RecordError::Signature(e)
    }
}

// ============================================================================
// Signed Records
// ============================================================================

/// The signed portion of a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub author: Identity,
    pub key: Key,
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    pub entry: RecordEntry,
    pub signature: Vec<u8>,
}

impl SignedRecord {
    /// Create a record authored by `keypair`, timestamped now.
    pub fn sign(keypair: &Keypair, key: Key, value: Vec<u8>) -> Result<Self, RecordError> {
        Self::sign_at(keypair, key, value, now_ms())
    }

    pub fn sign_at(
        keypair: &Keypair,
        key: Key,
        value: Vec<u8>,
        timestamp: u64,
    ) -> Result<Self, RecordError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(RecordError::ValueTooLarge);
        }
        let entry = RecordEntry {
            author: keypair.identity(),
            key,
            value,
            timestamp,
            version: RECORD_VERSION,
        };
        let bytes = encode(&entry).map_err(|_| RecordError::Encoding)?;
        let signature = sign_with_domain(keypair, RECORD_SIGNATURE_DOMAIN, &bytes);
        Ok(Self { entry, signature })
    }

    /// Check size bounds and the author's signature.
    pub fn verify(&self) -> Result<(), RecordError> {
        if self.entry.value.len() > MAX_VALUE_SIZE {
            return Err(RecordError::ValueTooLarge);
        }
        let bytes = encode(&self.entry).map_err(|_| RecordError::Encoding)?;
        verify_with_domain(
            &self.entry.author,
            RECORD_SIGNATURE_DOMAIN,
            &bytes,
            &self.signature,
        )?;
        Ok(())
    }

    /// Verified, and stored under `key` by `author`.
    pub fn verify_for(&self, key: &Key, author: &Identity) -> Result<(), RecordError> {
        self.verify()?;
        if self.entry.key != *key || self.entry.author != *author {
            return Err(RecordError::Signature(SignatureError::VerificationFailed));
        }
        Ok(())
    }

    pub fn author(&self) -> Identity {
        self.entry.author
    }

    pub fn key(&self) -> &Key {
        &self.entry.key
    }

    pub fn value(&self) -> &[u8] {
        &self.entry.value
    }

    pub fn timestamp(&self) -> u64 {
        self.entry.timestamp
    }

    pub fn is_newer_than(&self, other: &SignedRecord) -> bool {
        self.entry.timestamp > other.entry.timestamp
    }
}

// ============================================================================
// User Name Claims
// ============================================================================

/// Lowercase and validate a user name.
pub fn normalize_user_id(name: &str) -> Result<String, RecordError> {
    let lowered = name.to_lowercase();
    match user_id_regex() {
        Some(re) if re.is_match(&lowered) => Ok(lowered),
        _ => Err(RecordError::InvalidUserId),
    }
}

/// `sha256(lowercase(name))`, the key a claim is stored under.
pub fn user_id_hash(name: &str) -> Key {
    let digest = Sha256::digest(name.to_lowercase().as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ClaimBody<'a> {
    user_id: &'a str,
    user_hash: Key,
    author: Identity,
    timestamp: u64,
    version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdClaim {
    pub user_id: String,
    pub user_hash: Key,
    pub author: Identity,
    pub timestamp: u64,
    pub version: u32,
    pub signature: Vec<u8>,
}

impl UserIdClaim {
    pub fn sign(keypair: &Keypair, name: &str) -> Result<Self, RecordError> {
        let user_id = normalize_user_id(name)?;
        let mut claim = Self {
            user_hash: user_id_hash(&user_id),
            user_id,
            author: keypair.identity(),
            timestamp: now_ms(),
            version: RECORD_VERSION,
            signature: Vec::new(),
        };
        let bytes = claim.signed_bytes()?;
        claim.signature = sign_with_domain(keypair, USER_ID_SIGNATURE_DOMAIN, &bytes);
        Ok(claim)
    }

    /// Name rule, hash binding, and signature.
    pub fn verify(&self) -> Result<(), RecordError> {
        let normalized = normalize_user_id(&self.user_id)?;
        if normalized != self.user_id {
            return Err(RecordError::InvalidUserId);
        }
        if user_id_hash(&self.user_id) != self.user_hash {
            return Err(RecordError::HashMismatch);
        }
        let bytes = self.signed_bytes()?;
        verify_with_domain(&self.author, USER_ID_SIGNATURE_DOMAIN, &bytes, &self.signature)?;
        Ok(())
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, RecordError> {
        encode(&ClaimBody {
            user_id: &self.user_id,
            user_hash: self.user_hash,
            author: self.author,
            timestamp: self.timestamp,
            version: self.version,
        })
        .map_err(|_| RecordError::Encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sign_and_verify() {
        let kp = Keypair::generate();
        let record = SignedRecord::sign(&kp, [1u8; 32], b"hello".to_vec()).unwrap();
        assert!(record.verify().is_ok());
        assert!(record.verify_for(&[1u8; 32], &kp.identity()).is_ok());
        assert!(record.verify_for(&[2u8; 32], &kp.identity()).is_err());
    }

    #[test]
    fn tampered_record_rejected() {
        let kp = Keypair::generate();
        let mut record = SignedRecord::sign(&kp, [1u8; 32], b"hello".to_vec()).unwrap();
        record.entry.value = b"jello".to_vec();
        assert!(matches!(record.verify(), Err(RecordError::Signature(_))));
    }

    #[test]
    fn record_author_substitution_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut record = SignedRecord::sign(&kp, [1u8; 32], b"v".to_vec()).unwrap();
        record.entry.author = other.identity();
        assert!(record.verify().is_err());
    }

    #[test]
    fn oversized_value_rejected() {
        let kp = Keypair::generate();
        let result = SignedRecord::sign(&kp, [0u8; 32], vec![0u8; MAX_VALUE_SIZE + 1]);
        assert_eq!(result, Err(RecordError::ValueTooLarge));
    }

    #[test]
    fn newer_record_comparison() {
        let kp = Keypair::generate();
        let old = SignedRecord::sign_at(&kp, [0u8; 32], b"a".to_vec(), 100).unwrap();
        let new = SignedRecord::sign_at(&kp, [0u8; 32], b"b".to_vec(), 200).unwrap();
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
    }

    #[test]
    fn user_id_rules() {
        assert_eq!(normalize_user_id("Alice").unwrap(), "alice");
        assert!(normalize_user_id("bob.smith-2").is_ok());
        assert!(normalize_user_id("ab").is_err());
        assert!(normalize_user_id("1alice").is_err());
        assert!(normalize_user_id("al ice").is_err());
        assert!(normalize_user_id(&"a".repeat(33)).is_err());
    }

    #[test]
    fn user_id_hash_is_case_insensitive() {
        assert_eq!(user_id_hash("Alice"), user_id_hash("alice"));
        assert_ne!(user_id_hash("alice"), user_id_hash("alicia"));
    }

    #[test]
    fn claim_sign_and_verify() {
        let kp = Keypair::generate();
        let claim = UserIdClaim::sign(&kp, "Carol").unwrap();
        assert_eq!(claim.user_id, "carol");
        assert_eq!(claim.user_hash, user_id_hash("carol"));
        assert!(claim.verify().is_ok());
    }

    #[test]
    fn forged_claims_rejected() {
        let kp = Keypair::generate();
        let claim = UserIdClaim::sign(&kp, "carol").unwrap();

        let mut wrong_hash = claim.clone();
        wrong_hash.user_hash = user_id_hash("dave");
        assert_eq!(wrong_hash.verify(), Err(RecordError::HashMismatch));

        let mut stolen = claim.clone();
        stolen.author = Keypair::generate().identity();
        assert!(matches!(stolen.verify(), Err(RecordError::Signature(_))));

        let mut renamed = claim;
        renamed.user_id = "dave".into();
        renamed.user_hash = user_id_hash("dave");
        assert!(matches!(renamed.verify(), Err(RecordError::Signature(_))));
    }
}
