use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_websockets::{ClientBuilder, Message};

use crate::client::RelayClient;
use crate::error::UamTransportError;
use crate::{ListenCallback, Transport, TransportConfig};

/// Base delay for reconnect backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Persistent push transport over the relay WebSocket channel.
///
/// Inbound envelopes arrive as JSON text frames carrying `uam_version`.
/// App-level `{"type":"ping"}` frames are answered with `{"type":"pong"}`.
/// On drop the reader reconnects with capped exponential backoff plus
/// random jitter; the backoff counter resets on a successful connect.
/// Outbound envelopes go through the relay REST API — the socket itself
/// is inbound-only.
pub struct WsTransport {
    ws_url: String,
    config: TransportConfig,
    client: RelayClient,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the reader task.
struct Shared {
    listener: RwLock<Option<ListenCallback>>,
    buffer: Mutex<VecDeque<Value>>,
    buffer_cap: usize,
}

impl Shared {
    /// Hand an inbound envelope to the listener, or buffer it.
    fn dispatch(&self, envelope: Value) {
        let listener = self.listener.read().expect("listener lock poisoned");
        if let Some(callback) = listener.as_ref() {
            callback(envelope);
            return;
        }
        drop(listener);

        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        if buffer.len() >= self.buffer_cap {
            buffer.pop_front();
            tracing::warn!("push: inbound buffer full, dropping oldest envelope");
        }
        buffer.push_back(envelope);
    }
}

/// Exponential backoff with a cap: base * 2^(failures-1).
fn backoff_delay(failures: u32, cap: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
    delay.min(cap)
}

impl WsTransport {
    /// Build a push transport. The WebSocket URL is derived from the relay
    /// URL (`http` → `ws`, `https` → `wss`, path `/ws`) with the bearer
    /// token as a query parameter.
    pub fn new(config: &TransportConfig) -> Result<Self, UamTransportError> {
        let token = config
            .token
            .as_deref()
            .ok_or_else(|| UamTransportError::Config("push transport requires a token".into()))?;
        let base = config
            .relay_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let ws_url = format!("{}/ws?token={}", base.trim_end_matches('/'), token);

        Ok(Self {
            ws_url,
            config: config.clone(),
            client: RelayClient::new(config)?,
            shared: Arc::new(Shared {
                listener: RwLock::new(None),
                buffer: Mutex::new(VecDeque::new()),
                buffer_cap: config.recv_buffer,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Reader loop: connect, pump frames, reconnect with backoff.
    async fn reader_loop(
        ws_url: String,
        config: TransportConfig,
        shared: Arc<Shared>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut failures: u32 = 0;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let uri = match ws_url.parse::<http::Uri>() {
                Ok(uri) => uri,
                Err(e) => {
                    tracing::error!("push: invalid websocket url: {e}");
                    break;
                }
            };

            let builder = ClientBuilder::from_uri(uri);
            let attempt = builder.connect();
            match tokio::time::timeout(config.connect_timeout, attempt).await {
                Ok(Ok((mut stream, _response))) => {
                    failures = 0;
                    tracing::info!("push: connected");
                    while let Some(frame) = stream.next().await {
                        if shutdown.load(Ordering::SeqCst) {
                            let _ = stream.close().await;
                            return;
                        }
                        match frame {
                            Ok(msg) => {
                                if let Some(reply) = handle_frame(&msg, &shared) {
                                    if let Err(e) = stream.send(reply).await {
                                        tracing::warn!("push: pong failed: {e}");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("push: stream error: {e}");
                                break;
                            }
                        }
                    }
                    tracing::info!("push: channel closed");
                }
                Ok(Err(e)) => {
                    tracing::warn!("push: connect failed: {e}");
                }
                Err(_) => {
                    tracing::warn!(
                        "push: connect timed out after {}s",
                        config.connect_timeout.as_secs()
                    );
                }
            }

            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            failures += 1;
            let jitter_ms = {
                use rand::Rng;
                let cap = config.backoff_jitter.as_millis() as u64;
                rand::rng().random_range(0..cap.max(1))
            };
            let delay = backoff_delay(failures, config.backoff_cap) + Duration::from_millis(jitter_ms);
            tracing::debug!("push: reconnect in {:?} (attempt {failures})", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Classify one frame: envelopes are dispatched, pings produce a pong reply.
fn handle_frame(msg: &Message, shared: &Shared) -> Option<Message> {
    let text = msg.as_text()?;
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("push: non-json frame dropped: {e}");
            return None;
        }
    };

    if value.get("type").and_then(Value::as_str) == Some("ping") {
        return Some(Message::text(r#"{"type":"pong"}"#.to_string()));
    }
    if value.get("uam_version").is_some() {
        shared.dispatch(value);
    } else {
        tracing::debug!("push: unrecognized frame dropped");
    }
    None
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), UamTransportError> {
        let mut task = self.task.lock().expect("task lock poisoned");
        if task.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);
        *task = Some(tokio::spawn(Self::reader_loop(
            self.ws_url.clone(),
            self.config.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.shutdown),
        )));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), UamTransportError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().expect("task lock poisoned").take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, envelope: &Value) -> Result<(), UamTransportError> {
        self.client.send_envelope(envelope).await
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>, UamTransportError> {
        let mut buffer = self.shared.buffer.lock().expect("buffer lock poisoned");
        let take = limit.min(buffer.len());
        Ok(buffer.drain(..take).collect())
    }

    fn listen(&self, callback: ListenCallback) -> Result<(), UamTransportError> {
        *self.shared.listener.write().expect("listener lock poisoned") = Some(callback);
        Ok(())
    }
}
