//! Address → public-key resolution.
//!
//! Three pluggable tiers, dispatched by domain shape: the relay's own
//! lookup API for agents on the configured relay domain, DNS TXT with an
//! HTTPS well-known fallback for dotted domains, and an on-chain name
//! registry for dotless names. Resolution provenance rides along so the
//! contact book can record where a key came from.

mod dns;
mod registry;
mod relay;

use async_trait::async_trait;

pub use dns::DnsResolver;
pub use registry::{NameRegistry, RegistryRecord, RegistryResolver};
pub use relay::RelayResolver;

use crate::address::Address;
use crate::error::UamProtocolError;

/// A resolved public key plus whatever the tier learned alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKey {
    /// URL-safe base64 Ed25519 verify key.
    pub public_key: String,
    /// Relay URL advertised by the resolution mechanism, if any.
    pub relay: Option<String>,
    /// Which tier produced this: `relay`, `dns`, `well-known`, `registry`.
    pub source: &'static str,
}

/// One resolution mechanism.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve_public_key(&self, address: &Address)
        -> Result<ResolvedKey, UamProtocolError>;
}

/// Which tier handles a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Relay,
    Dns,
    Registry,
}

/// Dispatch rule: the configured relay domain goes to tier 1, dotted
/// domains to tier 2, dotless names to tier 3.
fn classify(domain: &str, relay_domain: &str) -> Tier {
    if domain == relay_domain {
        Tier::Relay
    } else if domain.contains('.') {
        Tier::Dns
    } else {
        Tier::Registry
    }
}

/// Domain-shape dispatcher over the three tiers. Tier 3 is optional;
/// a dotless domain without a wired registry is a configuration error.
pub struct SmartResolver {
    relay_domain: String,
    relay: RelayResolver,
    dns: DnsResolver,
    registry: Option<RegistryResolver>,
}

impl SmartResolver {
    pub fn new(
        relay_domain: impl Into<String>,
        relay: RelayResolver,
        dns: DnsResolver,
        registry: Option<RegistryResolver>,
    ) -> Self {
        Self {
            relay_domain: relay_domain.into(),
            relay,
            dns,
            registry,
        }
    }
}

#[async_trait]
impl KeyResolver for SmartResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
    ) -> Result<ResolvedKey, UamProtocolError> {
        match classify(address.domain(), &self.relay_domain) {
            Tier::Relay => self.relay.resolve_public_key(address).await,
            Tier::Dns => self.dns.resolve_public_key(address).await,
            Tier::Registry => match &self.registry {
                Some(registry) => registry.resolve_public_key(address).await,
                None => Err(UamProtocolError::Resolution {
                    address: address.full(),
                    reason: "dotless domain but no name registry is configured".into(),
                }),
            },
        }
    }
}
