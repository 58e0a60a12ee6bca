//! # Cryptographic Primitives
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Sealing**: Anonymous public-key encryption to a session's ephemeral
//!   X25519 key (X25519 + BLAKE3 KDF + ChaCha20-Poly1305)
//!
//! ## Sealed Box Layout
//!
//! ```text
//! [ ephemeral_pubkey: 32 bytes ][ ciphertext || tag: n + 16 bytes ]
//! ```
//!
//! The symmetric key is derived from the X25519 shared secret and both public
//! keys, so every sealed message uses a fresh key and a deterministic nonce is
//! safe. Only the holder of the recipient's box secret can open it.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as BoxPublicKey, StaticSecret};

use crate::identity::{Identity, Keypair};

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for envelope signatures.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"meshdht-envelope-v1:";

/// Domain separation prefix for stored record signatures.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"meshdht-record-v1:";

/// Domain separation prefix for user-name claims.
pub const USER_ID_SIGNATURE_DOMAIN: &[u8] = b"meshdht-user-id-v1:";

/// Domain separation prefix for relayed connection offers and answers.
pub const SIGNAL_SIGNATURE_DOMAIN: &[u8] = b"meshdht-signal-v1:";

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
///
/// # Returns
/// 64-byte Ed25519 signature as a Vec<u8>
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// # Arguments
/// * `identity` - The claimed signer's identity (public key)
/// * `domain` - Domain separation prefix (must match what was used during signing)
/// * `data` - The original data that was signed
/// * `signature` - The 64-byte Ed25519 signature
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Sealed Boxes
// ============================================================================

/// Size of an X25519 public key.
pub const BOX_PUBLIC_KEY_SIZE: usize = 32;

/// Poly1305 tag size.
const TAG_SIZE: usize = 16;

const SEAL_KDF_CONTEXT: &str = "meshdht seal v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// Input shorter than an ephemeral key plus tag.
    Truncated,
    /// Key agreement produced a low-order (non-contributory) secret.
    WeakKey,
    /// AEAD encryption failed.
    EncryptFailed,
    /// AEAD authentication failed; wrong recipient or tampered ciphertext.
    DecryptFailed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::Truncated => write!(f, "sealed box is truncated"),
            SealError::WeakKey => write!(f, "non-contributory key agreement"),
            SealError::EncryptFailed => write!(f, "seal encryption failed"),
            SealError::DecryptFailed => write!(f, "sealed box could not be opened"),
        }
    }
}

impl std::error::Error for SealError {}

/// Per-session ephemeral encryption keypair.
///
/// Generated when a session is created and announced in the introduction.
/// Never persisted.
pub struct BoxKeypair {
    secret: StaticSecret,
    public: [u8; BOX_PUBLIC_KEY_SIZE],
}

impl BoxKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = BoxPublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; BOX_PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Open a box sealed to this keypair's public key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < BOX_PUBLIC_KEY_SIZE + TAG_SIZE {
            return Err(SealError::Truncated);
        }
        let mut eph_pk = [0u8; BOX_PUBLIC_KEY_SIZE];
        eph_pk.copy_from_slice(&sealed[..BOX_PUBLIC_KEY_SIZE]);

        let shared = self.secret.diffie_hellman(&BoxPublicKey::from(eph_pk));
        if !shared.was_contributory() {
            return Err(SealError::WeakKey);
        }

        let cipher = seal_cipher(shared.as_bytes(), &eph_pk, &self.public);
        let nonce = seal_nonce(&eph_pk, &self.public);
        cipher
            .decrypt(Nonce::from_slice(&nonce), &sealed[BOX_PUBLIC_KEY_SIZE..])
            .map_err(|_| SealError::DecryptFailed)
    }
}

impl std::fmt::Debug for BoxKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxKeypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Seal `plaintext` so that only the owner of `recipient` can open it.
pub fn seal(recipient: &[u8; BOX_PUBLIC_KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pk = BoxPublicKey::from(&eph_secret).to_bytes();

    let shared = eph_secret.diffie_hellman(&BoxPublicKey::from(*recipient));
    if !shared.was_contributory() {
        return Err(SealError::WeakKey);
    }

    let cipher = seal_cipher(shared.as_bytes(), &eph_pk, recipient);
    let nonce = seal_nonce(&eph_pk, recipient);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::EncryptFailed)?;

    let mut out = Vec::with_capacity(BOX_PUBLIC_KEY_SIZE + ciphertext.len());
    out.extend_from_slice(&eph_pk);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Bytes added by [`seal`] on top of the plaintext.
pub const fn seal_overhead() -> usize {
    BOX_PUBLIC_KEY_SIZE + TAG_SIZE
}

fn seal_cipher(shared: &[u8; 32], eph_pk: &[u8; 32], recipient: &[u8; 32]) -> ChaCha20Poly1305 {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(eph_pk);
    material[64..].copy_from_slice(recipient);
    let key = blake3::derive_key(SEAL_KDF_CONTEXT, &material);
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

fn seal_nonce(eph_pk: &[u8; 32], recipient: &[u8; 32]) -> [u8; 12] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(eph_pk);
    hasher.update(recipient);
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest.as_bytes()[..12]);
    nonce
}
