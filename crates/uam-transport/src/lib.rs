//! UAM transport layer.
//!
//! One abstract seam — [`Transport`] — with two concrete implementations:
//! a request/response pull transport over the relay REST API and a
//! persistent push transport over the relay WebSocket channel. Envelopes
//! cross this seam as raw wire dicts (`serde_json::Value`); building,
//! signing, and verifying them is the protocol layer's job.

mod client;
mod config;
mod error;
mod http;
mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use client::{Registration, RelayClient};
pub use config::TransportConfig;
pub use error::UamTransportError;
pub use http::HttpTransport;
pub use ws::WsTransport;

/// A wire envelope as it crosses the transport seam.
pub type WireEnvelope = Value;

/// Push handler invoked once per inbound envelope.
pub type ListenCallback = Arc<dyn Fn(WireEnvelope) + Send + Sync>;

/// Abstract relay connectivity.
///
/// Implementations may be stateless (`connect` a no-op) or hold a
/// persistent channel. `disconnect` is idempotent. `listen` must fail on
/// transports without a push channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish whatever the transport needs; no-op allowed.
    async fn connect(&self) -> Result<(), UamTransportError>;

    /// Release resources. Idempotent.
    async fn disconnect(&self) -> Result<(), UamTransportError>;

    /// Deliver one wire envelope.
    async fn send(&self, envelope: &WireEnvelope) -> Result<(), UamTransportError>;

    /// Return up to `limit` inbound wire envelopes; empty is success.
    async fn receive(&self, limit: usize) -> Result<Vec<WireEnvelope>, UamTransportError>;

    /// Register a push handler. Fails on pull transports.
    fn listen(&self, callback: ListenCallback) -> Result<(), UamTransportError>;
}
