use std::path::PathBuf;
use std::sync::Arc;

use crate::resolver::NameRegistry;
use crate::types::TrustPolicy;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "UAM_DATA_DIR";

/// Configuration for an [`Agent`](crate::Agent).
///
/// Builder pattern with sensible defaults:
///
/// ```rust
/// use uam_protocol::{AgentConfig, TrustPolicy};
///
/// let config = AgentConfig::new("alice", "https://relay.example")
///     .policy(TrustPolicy::ApprovalRequired)
///     .push(true);
/// ```
#[derive(Clone)]
pub struct AgentConfig {
    /// Local agent name (the half before `::`).
    pub(crate) name: String,
    /// Human-readable name advertised on the contact card.
    pub(crate) display_name: String,
    /// Directory for keys, tokens, and the contact book.
    pub(crate) data_dir: PathBuf,
    /// Relay REST base URL.
    pub(crate) relay_url: String,
    /// Domain half of addresses homed on this relay.
    pub(crate) relay_domain: String,
    /// Inbound handshake policy.
    pub(crate) policy: TrustPolicy,
    /// Register with the relay automatically when no token is stored.
    pub(crate) auto_register: bool,
    /// Emit automatic read receipts for received user messages.
    pub(crate) read_receipts: bool,
    /// Use the persistent push transport instead of inbox polling.
    pub(crate) push: bool,
    /// Optional tier-3 name registry.
    pub(crate) registry: Option<Arc<dyn NameRegistry>>,
}

impl AgentConfig {
    /// Create a config for `name` homed on `relay_url`.
    ///
    /// The relay domain defaults to the URL's host; `UAM_RELAY_URL` and
    /// `UAM_DATA_DIR` environment variables override their respective
    /// fields.
    pub fn new(name: impl Into<String>, relay_url: impl Into<String>) -> Self {
        let name = name.into();
        let relay_url = std::env::var("UAM_RELAY_URL").unwrap_or_else(|_| relay_url.into());
        let relay_url = relay_url.trim_end_matches('/').to_string();
        let relay_domain = host_of(&relay_url);
        let data_dir = std::env::var(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".uam"));

        Self {
            display_name: name.clone(),
            name,
            data_dir,
            relay_url,
            relay_domain,
            policy: TrustPolicy::AutoAccept,
            auto_register: true,
            read_receipts: true,
            push: false,
            registry: None,
        }
    }

    /// Set the advertised display name (default: the agent name).
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Set the data directory (default: `.uam`, or `UAM_DATA_DIR`).
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Override the relay domain (default: the relay URL's host).
    pub fn relay_domain(mut self, domain: impl Into<String>) -> Self {
        self.relay_domain = domain.into();
        self
    }

    /// Set the inbound handshake policy (default: auto-accept).
    pub fn policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable or disable relay auto-registration (default: enabled).
    pub fn auto_register(mut self, enabled: bool) -> Self {
        self.auto_register = enabled;
        self
    }

    /// Enable or disable automatic read receipts (default: enabled).
    pub fn read_receipts(mut self, enabled: bool) -> Self {
        self.read_receipts = enabled;
        self
    }

    /// Use the push transport (default: pull).
    pub fn push(mut self, enabled: bool) -> Self {
        self.push = enabled;
        self
    }

    /// Wire a tier-3 name registry for dotless domains.
    pub fn registry(mut self, registry: Arc<dyn NameRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The local agent's full address.
    pub fn address(&self) -> String {
        format!("{}::{}", self.name, self.relay_domain)
    }
}

/// Host portion of a URL: scheme, port, and path stripped.
fn host_of(url: &str) -> String {
    let no_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let no_path = no_scheme.split(['/', '?']).next().unwrap_or(no_scheme);
    let no_port = no_path.split(':').next().unwrap_or(no_path);
    no_port.to_ascii_lowercase()
}
