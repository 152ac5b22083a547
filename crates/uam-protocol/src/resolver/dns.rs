use std::collections::HashMap;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde_json::Value;

use crate::address::Address;
use crate::error::UamProtocolError;
use crate::resolver::{KeyResolver, ResolvedKey};

/// Prefix marking a UAM discovery TXT record.
const TXT_VERSION_TAG: &str = "v=uam1";

/// Key prefix naming the signature scheme.
const KEY_SCHEME_PREFIX: &str = "ed25519:";

/// Tier 2: DNS TXT at `_uam.{domain}`, falling back to
/// `https://{domain}/.well-known/uam.json`.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    http: reqwest::Client,
}

impl DnsResolver {
    /// Use the system resolver configuration when available, falling
    /// back to the library defaults.
    pub fn new() -> Result<Self, UamProtocolError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| UamProtocolError::Resolution {
                address: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { resolver, http })
    }

    async fn resolve_txt(&self, address: &Address) -> Option<ResolvedKey> {
        let name = format!("_uam.{}.", address.domain());
        let lookup = match self.resolver.txt_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) => {
                tracing::debug!("resolver: txt lookup for {} failed: {e}", address.domain());
                return None;
            }
        };

        for record in lookup.iter() {
            let text: String = record
                .txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk))
                .collect();
            let Some(tags) = parse_uam_txt(&text) else {
                continue;
            };
            if let Some(key) = tags.get("key") {
                return Some(ResolvedKey {
                    public_key: strip_scheme(key),
                    relay: tags.get("relay").cloned(),
                    source: "dns",
                });
            }
        }
        None
    }

    async fn resolve_well_known(&self, address: &Address) -> Option<ResolvedKey> {
        let url = format!("https://{}/.well-known/uam.json", address.domain());
        let resp = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::debug!("resolver: well-known at {url} returned {}", resp.status());
                return None;
            }
            Err(e) => {
                tracing::debug!("resolver: well-known fetch {url} failed: {e}");
                return None;
            }
        };
        let body: Value = resp.json().await.ok()?;
        let key = extract_well_known_key(&body, address.agent())?;
        Some(ResolvedKey {
            public_key: key,
            relay: None,
            source: "well-known",
        })
    }
}

/// Parse a `v=uam1; key=ed25519:...; relay=...` TXT record into tag
/// pairs. Tags are lowercased, values preserved. Records not starting
/// with the version tag are ignored.
fn parse_uam_txt(record: &str) -> Option<HashMap<String, String>> {
    let record = record.trim();
    if !record.starts_with(TXT_VERSION_TAG) {
        return None;
    }
    let mut tags = HashMap::new();
    for part in record.split(';') {
        if let Some((tag, value)) = part.split_once('=') {
            tags.insert(tag.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Some(tags)
}

/// Pull `agents[name].key` out of a well-known document.
fn extract_well_known_key(body: &Value, agent: &str) -> Option<String> {
    let key = body.get("agents")?.get(agent)?.get("key")?.as_str()?;
    Some(strip_scheme(key))
}

fn strip_scheme(key: &str) -> String {
    key.strip_prefix(KEY_SCHEME_PREFIX).unwrap_or(key).to_string()
}

#[async_trait]
impl KeyResolver for DnsResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
    ) -> Result<ResolvedKey, UamProtocolError> {
        if let Some(resolved) = self.resolve_txt(address).await {
            return Ok(resolved);
        }
        if let Some(resolved) = self.resolve_well_known(address).await {
            return Ok(resolved);
        }
        Err(UamProtocolError::Resolution {
            address: address.full(),
            reason: "no TXT record and no well-known document".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_txt_record() {
        let tags =
            parse_uam_txt("v=uam1; key=ed25519:AbCd123; relay=https://relay.example").unwrap();
        assert_eq!(tags.get("v").map(String::as_str), Some("uam1"));
        assert_eq!(tags.get("key").map(String::as_str), Some("ed25519:AbCd123"));
        assert_eq!(
            tags.get("relay").map(String::as_str),
            Some("https://relay.example")
        );
    }

    #[test]
    fn txt_tags_case_insensitive_values_preserved() {
        let tags = parse_uam_txt("v=uam1; KEY=ed25519:MixedCase").unwrap();
        assert_eq!(tags.get("key").map(String::as_str), Some("ed25519:MixedCase"));
    }

    #[test]
    fn non_uam_records_ignored() {
        assert!(parse_uam_txt("google-site-verification=xyz").is_none());
        assert!(parse_uam_txt("v=spf1 include:example.org").is_none());
    }

    #[test]
    fn strip_scheme_prefix() {
        assert_eq!(strip_scheme("ed25519:abc"), "abc");
        assert_eq!(strip_scheme("abc"), "abc");
    }

    #[test]
    fn well_known_extraction() {
        let body = json!({
            "v": "uam1",
            "agents": {
                "alice": { "key": "ed25519:alicekey" },
                "bob": { "key": "bobkey" },
            }
        });
        assert_eq!(
            extract_well_known_key(&body, "alice").as_deref(),
            Some("alicekey")
        );
        assert_eq!(
            extract_well_known_key(&body, "bob").as_deref(),
            Some("bobkey")
        );
        assert!(extract_well_known_key(&body, "carol").is_none());
        assert!(extract_well_known_key(&json!({}), "alice").is_none());
    }
}
