use async_trait::async_trait;
use uam_transport::{RelayClient, TransportConfig};

use crate::address::Address;
use crate::error::UamProtocolError;
use crate::resolver::{KeyResolver, ResolvedKey};

/// Tier 1: the relay's own key lookup API.
pub struct RelayResolver {
    client: RelayClient,
}

impl RelayResolver {
    pub fn new(config: &TransportConfig) -> Result<Self, UamProtocolError> {
        Ok(Self {
            client: RelayClient::new(config)?,
        })
    }
}

#[async_trait]
impl KeyResolver for RelayResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
    ) -> Result<ResolvedKey, UamProtocolError> {
        let full = address.full();
        match self.client.public_key(&full).await {
            Ok(Some(public_key)) => Ok(ResolvedKey {
                public_key,
                relay: Some(self.client.base_url().to_string()),
                source: "relay",
            }),
            Ok(None) => Err(UamProtocolError::Resolution {
                address: full,
                reason: "agent not registered at relay".into(),
            }),
            Err(e) => Err(UamProtocolError::Resolution {
                address: full,
                reason: e.to_string(),
            }),
        }
    }
}
