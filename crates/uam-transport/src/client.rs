use serde::Deserialize;
use serde_json::Value;

use crate::error::UamTransportError;
use crate::TransportConfig;

/// Response to a successful agent registration.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    /// Full `agent::domain` address assigned by the relay.
    pub address: String,
    /// Bearer token for subsequent authenticated calls.
    pub token: String,
}

/// Thin client for the relay REST API.
///
/// Endpoints:
/// - `POST /api/v1/register` — obtain an address and bearer token
/// - `GET  /api/v1/agents/{address}/public-key` — key lookup
/// - `POST /api/v1/send` — deliver one envelope
/// - `GET  /api/v1/inbox/{address}?limit=N` — poll inbound envelopes
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl RelayClient {
    /// Build a client from a transport config.
    pub fn new(config: &TransportConfig) -> Result<Self, UamTransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| UamTransportError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base: config.relay_url.clone(),
            token: config.token.clone(),
        })
    }

    /// The relay base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Replace the bearer token (after registration).
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    /// Register an agent name with its public key.
    ///
    /// A 409 means the name is already taken under a different key.
    pub async fn register(
        &self,
        agent_name: &str,
        public_key: &str,
    ) -> Result<Registration, UamTransportError> {
        let url = format!("{}/api/v1/register", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "agent_name": agent_name,
                "public_key": public_key,
            }))
            .send()
            .await
            .map_err(UamTransportError::Send)?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(UamTransportError::Registration {
                status: status.as_u16(),
                detail,
            });
        }
        resp.json::<Registration>()
            .await
            .map_err(UamTransportError::Receive)
    }

    /// Look up an agent's public key. `Ok(None)` on 404.
    pub async fn public_key(&self, address: &str) -> Result<Option<String>, UamTransportError> {
        let url = format!("{}/api/v1/agents/{}/public-key", self.base, address);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(UamTransportError::Receive)?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(UamTransportError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        #[derive(Deserialize)]
        struct KeyResponse {
            public_key: String,
        }
        let body: KeyResponse = resp.json().await.map_err(UamTransportError::Receive)?;
        Ok(Some(body.public_key))
    }

    /// Send one wire envelope through the relay.
    pub async fn send_envelope(&self, envelope: &Value) -> Result<(), UamTransportError> {
        let url = format!("{}/api/v1/send", self.base);
        let mut req = self.http.post(&url).json(envelope);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(UamTransportError::Send)?;
        if !resp.status().is_success() {
            return Err(UamTransportError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(())
    }

    /// Poll up to `limit` inbound envelopes for `address`.
    pub async fn inbox(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<Value>, UamTransportError> {
        let url = format!("{}/api/v1/inbox/{}?limit={}", self.base, address, limit);
        let mut req = self.http.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(UamTransportError::Receive)?;
        if !resp.status().is_success() {
            return Err(UamTransportError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        #[derive(Deserialize)]
        struct InboxResponse {
            #[serde(default)]
            messages: Vec<Value>,
        }
        let body: InboxResponse = resp.json().await.map_err(UamTransportError::Receive)?;
        Ok(body.messages)
    }
}
