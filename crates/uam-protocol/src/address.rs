use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UamProtocolError;

/// Maximum length of the full rendered `agent::domain` form.
const MAX_FULL_LEN: usize = 128;

/// Maximum length of the agent half.
const MAX_AGENT_LEN: usize = 64;

/// Maximum length of the domain half.
const MAX_DOMAIN_LEN: usize = 255;

/// An `agent::domain` identifier, lowercased and validated.
///
/// Parsing is the only place the address grammar is enforced — every
/// other component takes an `Address` and can rely on its invariants:
/// both halves lowercase, agent ≤ 64 chars, full form ≤ 128 chars,
/// `full() == "{agent}::{domain}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    agent: String,
    domain: String,
}

impl Address {
    /// Parse and normalize a raw address string.
    pub fn parse(raw: &str) -> Result<Self, UamProtocolError> {
        let trimmed = raw.trim();
        if trimmed.len() > MAX_FULL_LEN {
            return Err(invalid(format!(
                "address exceeds {MAX_FULL_LEN} characters"
            )));
        }
        let lowered = trimmed.to_ascii_lowercase();

        let (agent, domain) = lowered
            .split_once("::")
            .ok_or_else(|| invalid("missing '::' separator".into()))?;

        validate_agent(agent)?;
        validate_domain(domain)?;

        Ok(Self {
            agent: agent.to_string(),
            domain: domain.to_string(),
        })
    }

    /// The agent half.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// The domain half.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The full rendered `agent::domain` form.
    pub fn full(&self) -> String {
        format!("{}::{}", self.agent, self.domain)
    }
}

fn invalid(reason: String) -> UamProtocolError {
    UamProtocolError::InvalidAddress { reason }
}

/// Agent grammar: `[a-z0-9]([a-z0-9_-]{0,62}[a-z0-9])?`, ≤ 64 chars.
fn validate_agent(agent: &str) -> Result<(), UamProtocolError> {
    if agent.is_empty() {
        return Err(invalid("empty agent name".into()));
    }
    if agent.len() > MAX_AGENT_LEN {
        return Err(invalid(format!(
            "agent name exceeds {MAX_AGENT_LEN} characters"
        )));
    }
    let bytes = agent.as_bytes();
    if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return Err(invalid(
            "agent name must start and end with a letter or digit".into(),
        ));
    }
    for &b in bytes {
        if !(is_alnum(b) || b == b'_' || b == b'-') {
            return Err(invalid(format!(
                "agent name contains invalid character {:?}",
                b as char
            )));
        }
    }
    Ok(())
}

/// Domain grammar: `[a-z0-9]([a-z0-9.-]{0,253}[a-z0-9])?`, ≤ 255 chars.
fn validate_domain(domain: &str) -> Result<(), UamProtocolError> {
    if domain.is_empty() {
        return Err(invalid("empty domain".into()));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid(format!(
            "domain exceeds {MAX_DOMAIN_LEN} characters"
        )));
    }
    let bytes = domain.as_bytes();
    if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return Err(invalid(
            "domain must start and end with a letter or digit".into(),
        ));
    }
    for &b in bytes {
        if !(is_alnum(b) || b == b'.' || b == b'-') {
            return Err(invalid(format!(
                "domain contains invalid character {:?}",
                b as char
            )));
        }
    }
    Ok(())
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.agent, self.domain)
    }
}

impl FromStr for Address {
    type Err = UamProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = UamProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.full()
    }
}
