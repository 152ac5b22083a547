/// Protocol-level errors for the UAM core.
///
/// Wraps transport errors and adds protocol-specific variants
/// (addressing, crypto, trust, resolution). The inbox path is
/// deliberately fail-quiet — per-message failures are logged and
/// dropped there instead of surfacing.
#[derive(Debug, thiserror::Error)]
pub enum UamProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] uam_transport::UamTransportError),

    #[error("invalid address: {reason}")]
    InvalidAddress { reason: String },

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("envelope too large: {size} bytes (max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid contact card: {reason}")]
    InvalidContactCard { reason: String },

    #[error("key pinning violation for {address}: resolved key differs from pinned key")]
    KeyPinning { address: String },

    #[error("could not resolve {address}: {reason}")]
    Resolution { address: String, reason: String },

    #[error("registration failed: {reason}")]
    Registration { reason: String },

    #[error("key store error: {0}")]
    Keystore(String),

    #[error("contact book error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
