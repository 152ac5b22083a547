/// Errors returned by the UAM transport layer.
#[derive(Debug, thiserror::Error)]
pub enum UamTransportError {
    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("send failed: {0}")]
    Send(#[source] reqwest::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] reqwest::Error),

    #[error("relay returned {status} for {url}")]
    Http { status: u16, url: String },

    #[error("registration rejected ({status}): {detail}")]
    Registration { status: u16, detail: String },

    #[error("envelope serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("push channel error: {0}")]
    Push(String),

    #[error("timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("listen is not supported by this transport")]
    ListenUnsupported,

    #[error("transport is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}
