use serde_json::{json, Map, Value};

use crate::address::Address;
use crate::canonical::canonicalize;
use crate::crypto::{self, Keypair};
use crate::error::UamProtocolError;
use crate::types::UAM_VERSION;

/// Default advertised payload formats.
const DEFAULT_PAYLOAD_FORMATS: [&str; 2] = ["text/plain", "text/markdown"];

/// Card fields that must be present as strings.
const REQUIRED_FIELDS: [&str; 6] = [
    "version",
    "address",
    "display_name",
    "relay",
    "public_key",
    "signature",
];

/// Optional contact-card fields.
#[derive(Debug, Clone, Default)]
pub struct CardOptions {
    pub description: Option<String>,
    pub system: Option<String>,
    pub connection_endpoint: Option<String>,
    pub verified_domain: Option<String>,
    pub payload_formats: Option<Vec<String>>,
    pub relays: Option<Vec<String>>,
}

/// A self-signed identity document advertising an agent's address,
/// public key, and relay.
///
/// `payload_formats`, `fingerprint`, and `relays` sit outside the
/// signature scope, so any party can append failover relays without
/// invalidating the card.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactCard {
    pub version: String,
    pub address: Address,
    pub display_name: String,
    pub relay: String,
    pub public_key: String,
    pub signature: String,
    pub description: Option<String>,
    pub system: Option<String>,
    pub connection_endpoint: Option<String>,
    pub verified_domain: Option<String>,
    pub payload_formats: Vec<String>,
    pub fingerprint: Option<String>,
    pub relays: Option<Vec<String>>,
}

impl ContactCard {
    /// Build and sign a card from the agent's identity key.
    pub fn create(
        address: &str,
        display_name: &str,
        relay: &str,
        keypair: &Keypair,
        options: CardOptions,
    ) -> Result<Self, UamProtocolError> {
        let address = Address::parse(address)?;
        let payload_formats = options.payload_formats.unwrap_or_else(|| {
            DEFAULT_PAYLOAD_FORMATS.iter().map(|s| s.to_string()).collect()
        });

        let mut card = Self {
            version: UAM_VERSION.to_string(),
            address,
            display_name: display_name.to_string(),
            relay: relay.to_string(),
            public_key: keypair.public_key_b64(),
            signature: String::new(),
            description: options.description,
            system: options.system,
            connection_endpoint: options.connection_endpoint,
            verified_domain: options.verified_domain,
            payload_formats,
            fingerprint: Some(keypair.fingerprint()),
            relays: options.relays,
        };
        card.signature = crypto::b64_encode(&keypair.sign(&card.signing_bytes()));
        Ok(card)
    }

    /// The canonical byte image the signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonicalize(&self.signable_value())
    }

    /// Signable field set: required fields plus present optionals,
    /// excluding `payload_formats`, `fingerprint`, and `relays`.
    fn signable_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("version".into(), json!(self.version));
        map.insert("address".into(), json!(self.address.full()));
        map.insert("display_name".into(), json!(self.display_name));
        map.insert("relay".into(), json!(self.relay));
        map.insert("public_key".into(), json!(self.public_key));
        if let Some(v) = &self.description {
            map.insert("description".into(), json!(v));
        }
        if let Some(v) = &self.system {
            map.insert("system".into(), json!(v));
        }
        if let Some(v) = &self.connection_endpoint {
            map.insert("connection_endpoint".into(), json!(v));
        }
        if let Some(v) = &self.verified_domain {
            map.insert("verified_domain".into(), json!(v));
        }
        Value::Object(map)
    }

    /// Verify the signature under the embedded public key.
    pub fn verify(&self) -> Result<(), UamProtocolError> {
        let verify_key = crypto::verify_key_from_b64(&self.public_key)
            .map_err(|_| UamProtocolError::InvalidContactCard {
                reason: "public_key is not a valid key".into(),
            })?;
        let signature = crypto::b64_decode(&self.signature)
            .map_err(|_| UamProtocolError::SignatureVerification)?;
        crypto::verify(&self.signing_bytes(), &signature, &verify_key)
    }

    /// The raw 32 verify-key bytes embedded in the card.
    pub fn verify_key(&self) -> Result<[u8; 32], UamProtocolError> {
        crypto::verify_key_from_b64(&self.public_key)
    }

    /// JSON form, mirroring the envelope's snake_case convention.
    pub fn to_value(&self) -> Value {
        let mut value = self.signable_value();
        let map = value.as_object_mut().expect("signable_value is an object");
        map.insert("signature".into(), json!(self.signature));
        map.insert("payload_formats".into(), json!(self.payload_formats));
        if let Some(fingerprint) = &self.fingerprint {
            map.insert("fingerprint".into(), json!(fingerprint));
        }
        if let Some(relays) = &self.relays {
            map.insert("relays".into(), json!(relays));
        }
        value
    }

    /// Decode a card. Missing required fields are reported together,
    /// sorted by name. With `verify` set, the signature is checked.
    pub fn from_value(value: &Value, verify: bool) -> Result<Self, UamProtocolError> {
        let obj = value
            .as_object()
            .ok_or_else(|| UamProtocolError::InvalidContactCard {
                reason: "contact card is not a JSON object".into(),
            })?;

        let mut missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|key| obj.get(*key).and_then(Value::as_str).is_none())
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(UamProtocolError::InvalidContactCard {
                reason: format!("missing required fields: {}", missing.join(", ")),
            });
        }

        let get = |key: &str| obj[key].as_str().expect("presence checked above").to_string();
        let opt = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        let string_list = |key: &str| {
            obj.get(key).and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
        };

        let card = Self {
            version: get("version"),
            address: Address::parse(&get("address"))?,
            display_name: get("display_name"),
            relay: get("relay"),
            public_key: get("public_key"),
            signature: get("signature"),
            description: opt("description"),
            system: opt("system"),
            connection_endpoint: opt("connection_endpoint"),
            verified_domain: opt("verified_domain"),
            payload_formats: string_list("payload_formats").unwrap_or_else(|| {
                DEFAULT_PAYLOAD_FORMATS.iter().map(|s| s.to_string()).collect()
            }),
            fingerprint: opt("fingerprint"),
            relays: string_list("relays"),
        };

        if verify {
            card.verify()?;
        }
        Ok(card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed_byte: u8) -> Keypair {
        Keypair::from_seed([seed_byte; 32])
    }

    fn make_card() -> (ContactCard, Keypair) {
        let kp = keypair(1);
        let card = ContactCard::create(
            "alice::relay.example",
            "Alice",
            "https://relay.example",
            &kp,
            CardOptions::default(),
        )
        .expect("create card");
        (card, kp)
    }

    #[test]
    fn create_and_verify() {
        let (card, kp) = make_card();
        card.verify().expect("self-signed card verifies");
        assert_eq!(card.public_key, kp.public_key_b64());
        assert_eq!(card.fingerprint.as_deref(), Some(kp.fingerprint().as_str()));
        assert_eq!(card.payload_formats, vec!["text/plain", "text/markdown"]);
    }

    #[test]
    fn tampered_display_name_fails() {
        let (mut card, _) = make_card();
        card.display_name = "Mallory".into();
        assert!(card.verify().is_err());
    }

    #[test]
    fn tampered_public_key_fails() {
        let (mut card, _) = make_card();
        card.public_key = keypair(2).public_key_b64();
        assert!(card.verify().is_err());
    }

    #[test]
    fn appended_relays_do_not_invalidate() {
        let (mut card, _) = make_card();
        card.relays = Some(vec![
            "https://relay.example".into(),
            "https://backup.example".into(),
        ]);
        card.verify().expect("relays are outside the signature scope");

        card.payload_formats.push("application/json".into());
        card.verify().expect("payload_formats are outside the signature scope");
    }

    #[test]
    fn optional_fields_inside_signature_scope() {
        let kp = keypair(1);
        let card = ContactCard::create(
            "alice::relay.example",
            "Alice",
            "https://relay.example",
            &kp,
            CardOptions {
                description: Some("an agent".into()),
                ..Default::default()
            },
        )
        .unwrap();
        card.verify().unwrap();

        let mut tampered = card.clone();
        tampered.description = Some("a different agent".into());
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn value_roundtrip() {
        let kp = keypair(1);
        let card = ContactCard::create(
            "alice::relay.example",
            "Alice",
            "https://relay.example",
            &kp,
            CardOptions {
                system: Some("assistant".into()),
                relays: Some(vec!["https://relay.example".into()]),
                ..Default::default()
            },
        )
        .unwrap();

        let value = card.to_value();
        let decoded = ContactCard::from_value(&value, true).expect("decode + verify");
        assert_eq!(card, decoded);
    }

    #[test]
    fn from_value_reports_missing_fields_sorted() {
        let err = ContactCard::from_value(&json!({ "version": "0.1" }), false).unwrap_err();
        let reason = err.to_string();
        assert!(
            reason.contains("address, display_name, public_key, relay, signature"),
            "unexpected: {reason}"
        );
    }

    #[test]
    fn from_value_skips_verification_when_asked() {
        let (mut card, _) = make_card();
        card.display_name = "Tampered".into();
        let value = card.to_value();
        assert!(ContactCard::from_value(&value, true).is_err());
        ContactCard::from_value(&value, false).expect("decode without verify");
    }

    #[test]
    fn from_value_rejects_invalid_address() {
        let (card, _) = make_card();
        let mut value = card.to_value();
        value["address"] = json!("no separator");
        assert!(ContactCard::from_value(&value, false).is_err());
    }
}
