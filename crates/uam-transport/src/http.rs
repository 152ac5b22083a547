use async_trait::async_trait;
use serde_json::Value;

use crate::client::RelayClient;
use crate::error::UamTransportError;
use crate::{ListenCallback, Transport, TransportConfig};

/// Request/response transport over the relay REST API.
///
/// `send` posts to `/api/v1/send`; `receive` polls `/api/v1/inbox`.
/// There is no persistent channel, so `listen` is unsupported.
pub struct HttpTransport {
    client: RelayClient,
    address: String,
}

impl HttpTransport {
    /// Build a pull transport for the given local address.
    pub fn new(config: &TransportConfig, address: impl Into<String>) -> Result<Self, UamTransportError> {
        Ok(Self {
            client: RelayClient::new(config)?,
            address: address.into(),
        })
    }

    /// The underlying relay client.
    pub fn client(&self) -> &RelayClient {
        &self.client
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), UamTransportError> {
        // Stateless: nothing to establish.
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), UamTransportError> {
        Ok(())
    }

    async fn send(&self, envelope: &Value) -> Result<(), UamTransportError> {
        self.client.send_envelope(envelope).await
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>, UamTransportError> {
        self.client.inbox(&self.address, limit).await
    }

    fn listen(&self, _callback: ListenCallback) -> Result<(), UamTransportError> {
        Err(UamTransportError::ListenUnsupported)
    }
}
