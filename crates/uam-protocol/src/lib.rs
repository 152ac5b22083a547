//! UAM protocol core.
//!
//! End-to-end authenticated encryption and trust establishment for
//! autonomous agents: `agent::domain` addressing, signed-encrypted
//! envelopes, self-signed contact cards, a TOFU contact book, three-tier
//! key resolution, and the handshake state machine — composed by the
//! [`Agent`] over the `uam-transport` seam.
//!
//! Wire format: compact JSON, binary fields as unpadded URL-safe base64.
//! Crypto: Ed25519 signatures + NaCl Box/SealedBox payload encryption.

pub mod address;
pub mod agent;
pub mod book;
pub mod canonical;
pub mod config;
pub mod contact_card;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod keystore;
pub mod resolver;
pub mod types;

pub use address::Address;
pub use agent::{Agent, SendOptions};
pub use book::{Contact, ContactBook, PendingHandshake};
pub use config::AgentConfig;
pub use contact_card::{CardOptions, ContactCard};
pub use crypto::Keypair;
pub use envelope::{EnvelopeOptions, MessageEnvelope};
pub use error::UamProtocolError;
pub use handshake::{EnvelopeSink, HandshakeManager};
pub use keystore::KeyStore;
pub use resolver::{
    DnsResolver, KeyResolver, NameRegistry, RegistryRecord, RegistryResolver, RelayResolver,
    ResolvedKey, SmartResolver,
};
pub use types::{
    MessageType, ReceivedMessage, TrustPolicy, TrustState, MAX_ENVELOPE_SIZE, UAM_VERSION,
};
