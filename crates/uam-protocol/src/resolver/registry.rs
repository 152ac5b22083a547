use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::address::Address;
use crate::error::UamProtocolError;
use crate::resolver::{KeyResolver, ResolvedKey};

/// TTL for cached registry reads.
const REGISTRY_CACHE_TTL: Duration = Duration::from_secs(3600);

/// One entry in the on-chain name registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub owner: String,
    /// URL-safe base64 Ed25519 verify key.
    pub public_key: String,
    pub relay_url: String,
    /// Unix seconds; 0 means no expiry.
    pub expiry: u64,
}

/// Read access to the on-chain name registry — the `resolve(name)` and
/// `available(name)` view functions. Chain-specific clients implement
/// this; the core never talks to a chain directly.
#[async_trait]
pub trait NameRegistry: Send + Sync {
    /// Look up a name. `Ok(None)` when unregistered.
    async fn resolve(&self, name: &str) -> Result<Option<RegistryRecord>, UamProtocolError>;

    /// Whether a name is free to register.
    async fn available(&self, name: &str) -> Result<bool, UamProtocolError> {
        Ok(self.resolve(name).await?.is_none())
    }
}

/// Tier 3: on-chain reads behind a 1-hour TTL cache keyed by name.
/// Only successful resolutions are cached.
pub struct RegistryResolver {
    registry: Arc<dyn NameRegistry>,
    cache: Mutex<HashMap<String, (Instant, ResolvedKey)>>,
    ttl: Duration,
}

impl RegistryResolver {
    pub fn new(registry: Arc<dyn NameRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
            ttl: REGISTRY_CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(registry: Arc<dyn NameRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl KeyResolver for RegistryResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
    ) -> Result<ResolvedKey, UamProtocolError> {
        let name = address.domain().to_string();

        {
            let cache = self.cache.lock().await;
            if let Some((cached_at, resolved)) = cache.get(&name) {
                if cached_at.elapsed() < self.ttl {
                    return Ok(resolved.clone());
                }
            }
        }

        let record = self
            .registry
            .resolve(&name)
            .await?
            .ok_or_else(|| UamProtocolError::Resolution {
                address: address.full(),
                reason: format!("name {name:?} is not registered"),
            })?;

        if record.expiry != 0 && (record.expiry as i64) < chrono::Utc::now().timestamp() {
            return Err(UamProtocolError::Resolution {
                address: address.full(),
                reason: format!("registration for {name:?} has expired"),
            });
        }

        let resolved = ResolvedKey {
            public_key: record.public_key,
            relay: if record.relay_url.is_empty() {
                None
            } else {
                Some(record.relay_url)
            },
            source: "registry",
        };
        self.cache
            .lock()
            .await
            .insert(name, (Instant::now(), resolved.clone()));
        Ok(resolved)
    }
}
