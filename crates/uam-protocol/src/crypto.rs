//! Crypto primitives for the UAM core.
//!
//! Ed25519 identity keys (RFC 8032) sign envelopes and contact cards;
//! payload encryption converts the same keys to X25519 via the standard
//! Edwards→Montgomery map (same as libsodium) and uses the NaCl
//! constructions: authenticated Box (`nonce || ciphertext`) between two
//! known parties, anonymous SealedBox when the sender may be unknown to
//! the recipient. All binary material transits as URL-safe base64 with
//! padding stripped.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crypto_box::aead::rand_core::RngCore;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};

use crate::error::UamProtocolError;

/// Box nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

// ── Encoding ─────────────────────────────────────────────────────────

/// URL-safe base64 without padding.
pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode URL-safe base64, tolerating padded input.
pub fn b64_decode(data: &str) -> Result<Vec<u8>, UamProtocolError> {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| UamProtocolError::Decryption(format!("invalid base64: {e}")))
}

// ── Identity keypair ─────────────────────────────────────────────────

/// An agent's long-term Ed25519 identity.
///
/// The 32-byte seed is the only persisted form; signing and verify keys
/// are derived deterministically from it.
#[derive(Clone)]
pub struct Keypair {
    seed: [u8; 32],
    signing: SigningKey,
}

impl Keypair {
    /// Derive a keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        Self { seed, signing }
    }

    /// Derive a keypair from a base64-encoded seed.
    pub fn from_seed_b64(seed_b64: &str) -> Result<Self, UamProtocolError> {
        let bytes = b64_decode(seed_b64)
            .map_err(|_| UamProtocolError::Keystore("seed is not valid base64".into()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UamProtocolError::Keystore("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// The 32-byte seed.
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// The seed as unpadded URL-safe base64.
    pub fn seed_b64(&self) -> String {
        b64_encode(&self.seed)
    }

    /// The 32-byte Ed25519 verify key.
    pub fn verify_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The verify key as unpadded URL-safe base64 (the wire `public_key`).
    pub fn public_key_b64(&self) -> String {
        b64_encode(&self.verify_key())
    }

    /// Sign a byte string; returns the 64-byte Ed25519 signature.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(data).to_bytes()
    }

    /// Lowercase SHA-256 hex of the verify key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.verify_key())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the seed.
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Decode a base64 verify key into its 32 raw bytes.
pub fn verify_key_from_b64(key_b64: &str) -> Result<[u8; 32], UamProtocolError> {
    let bytes = b64_decode(key_b64)
        .map_err(|_| UamProtocolError::Decryption("public key is not valid base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| UamProtocolError::Decryption("public key must be 32 bytes".into()))
}

// ── Signatures ───────────────────────────────────────────────────────

/// Verify a 64-byte Ed25519 signature. Strict verification — rejects
/// non-canonical signatures.
pub fn verify(
    data: &[u8],
    signature: &[u8],
    verify_key: &[u8; 32],
) -> Result<(), UamProtocolError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(UamProtocolError::SignatureVerification);
    }
    let key = VerifyingKey::from_bytes(verify_key)
        .map_err(|_| UamProtocolError::SignatureVerification)?;
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| UamProtocolError::SignatureVerification)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    key.verify_strict(data, &signature)
        .map_err(|_| UamProtocolError::SignatureVerification)
}

/// Lowercase SHA-256 hex of a 32-byte verify key — the content-addressed
/// agent identity.
pub fn fingerprint(verify_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(verify_key))
}

// ── Ed25519 → X25519 conversion ──────────────────────────────────────

/// Convert an Ed25519 public key to an X25519 public key.
///
/// Uses the birational map from the Edwards curve to Montgomery form.
/// Equivalent to libsodium's `crypto_sign_ed25519_pk_to_curve25519`.
pub fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], UamProtocolError> {
    let compressed = CompressedEdwardsY(*ed25519_pk);
    let edwards = compressed.decompress().ok_or_else(|| {
        UamProtocolError::Encryption("invalid Ed25519 public key: decompression failed".into())
    })?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 secret key (32-byte seed) to an X25519 secret key.
///
/// Mirrors libsodium's `crypto_sign_ed25519_sk_to_curve25519`:
/// SHA-512(seed), take first 32 bytes, clamp.
pub fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    // Standard X25519 clamping
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

// ── Authenticated Box ────────────────────────────────────────────────

/// Encrypt for a known recipient: XSalsa20-Poly1305 Box between the
/// sender's converted secret key and the recipient's converted public
/// key. Output is `base64(nonce || ciphertext)` — the historic
/// `box_easy` layout.
pub fn encrypt_box(
    plaintext: &[u8],
    sender: &Keypair,
    recipient_verify_key: &[u8; 32],
) -> Result<String, UamProtocolError> {
    let secret = BoxSecretKey::from(ed25519_to_x25519_secret(sender.seed()));
    let public = BoxPublicKey::from(ed25519_to_x25519_public(recipient_verify_key)?);
    let salsa_box = SalsaBox::new(&public, &secret);

    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = salsa_box
        .encrypt(&nonce, plaintext)
        .map_err(|_| UamProtocolError::Encryption("box encryption failed".into()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(nonce.as_slice());
    combined.extend_from_slice(&ciphertext);
    Ok(b64_encode(&combined))
}

/// Decrypt a Box payload from a known sender. Every failure mode
/// (including truncated or unauthentic input) yields `Decryption`.
pub fn decrypt_box(
    ciphertext_b64: &str,
    recipient: &Keypair,
    sender_verify_key: &[u8; 32],
) -> Result<Vec<u8>, UamProtocolError> {
    let combined = b64_decode(ciphertext_b64)?;
    if combined.len() < NONCE_LEN {
        return Err(UamProtocolError::Decryption(
            "ciphertext shorter than nonce".into(),
        ));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

    let secret = BoxSecretKey::from(ed25519_to_x25519_secret(recipient.seed()));
    let public = BoxPublicKey::from(ed25519_to_x25519_public(sender_verify_key)?);
    let salsa_box = SalsaBox::new(&public, &secret);

    let nonce = crypto_box::aead::generic_array::GenericArray::from_slice(nonce_bytes);
    salsa_box
        .decrypt(nonce, ciphertext)
        .map_err(|_| UamProtocolError::Decryption("box authentication failed".into()))
}

// ── Sealed Box ───────────────────────────────────────────────────────

/// Encrypt anonymously for a recipient (ephemeral sender key). Used for
/// handshake requests, where the sender may not yet be known.
pub fn encrypt_sealed(
    plaintext: &[u8],
    recipient_verify_key: &[u8; 32],
) -> Result<String, UamProtocolError> {
    let public = BoxPublicKey::from(ed25519_to_x25519_public(recipient_verify_key)?);
    let sealed = public
        .seal(&mut OsRng, plaintext)
        .map_err(|_| UamProtocolError::Encryption("sealed box encryption failed".into()))?;
    Ok(b64_encode(&sealed))
}

/// Open a sealed box using the recipient's identity key.
pub fn decrypt_sealed(
    ciphertext_b64: &str,
    recipient: &Keypair,
) -> Result<Vec<u8>, UamProtocolError> {
    let sealed = b64_decode(ciphertext_b64)?;
    let secret = BoxSecretKey::from(ed25519_to_x25519_secret(recipient.seed()));
    secret
        .unseal(&sealed)
        .map_err(|_| UamProtocolError::Decryption("sealed box open failed".into()))
}

// ── Nonces ───────────────────────────────────────────────────────────

/// 24 random bytes from the OS CSPRNG, as unpadded URL-safe base64.
/// This is the envelope-level nonce; the Box carries its own.
pub fn random_nonce_b64() -> String {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    b64_encode(&nonce)
}
