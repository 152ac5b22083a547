use std::time::Duration;

/// Configuration for a relay transport.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use uam_transport::TransportConfig;
///
/// let config = TransportConfig::new("https://relay.example")
///     .recv_buffer(512)
///     .connect_timeout(std::time::Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the relay REST API (no trailing slash).
    pub(crate) relay_url: String,
    /// Bearer token presented to the relay.
    pub(crate) token: Option<String>,
    /// Timeout for the initial WebSocket connect.
    pub(crate) connect_timeout: Duration,
    /// Per-request timeout for REST calls.
    pub(crate) request_timeout: Duration,
    /// Maximum buffered inbound envelopes on the push transport.
    pub(crate) recv_buffer: usize,
    /// Cap for the reconnect backoff.
    pub(crate) backoff_cap: Duration,
    /// Upper bound of the random jitter added to each backoff.
    pub(crate) backoff_jitter: Duration,
}

impl TransportConfig {
    /// Create a config for the given relay.
    ///
    /// If the `UAM_RELAY_URL` environment variable is set, it overrides
    /// the `relay_url` argument.
    pub fn new(relay_url: impl Into<String>) -> Self {
        let relay_url = std::env::var("UAM_RELAY_URL").unwrap_or_else(|_| relay_url.into());
        Self {
            relay_url: relay_url.trim_end_matches('/').to_string(),
            token: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            recv_buffer: 1024,
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: Duration::from_millis(1000),
        }
    }

    /// Set the bearer token used for relay authentication.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the initial-connect timeout (default: 30 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-request REST timeout (default: 10 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the inbound buffer capacity for the push transport (default: 1024).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    /// The configured relay URL.
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }
}
