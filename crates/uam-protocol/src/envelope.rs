use serde_json::{json, Map, Value};

use crate::address::Address;
use crate::canonical::canonicalize;
use crate::crypto::{self, Keypair};
use crate::error::UamProtocolError;
use crate::types::{MessageType, now_iso, MAX_ENVELOPE_SIZE, UAM_VERSION};

/// Optional envelope fields. Absent options are omitted from the wire
/// form and from the signature scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeOptions {
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub expires: Option<String>,
    pub media_type: Option<String>,
    /// Opaque JSON subtree — preserved byte-for-byte through
    /// canonicalization, never interpreted.
    pub metadata: Option<Value>,
    /// Wire-only: carried alongside the envelope but outside the
    /// signature scope.
    pub attachments: Option<Vec<Value>>,
}

/// The signed, encrypted wrapper carrying one UAM message.
///
/// Internal field names differ from the wire: `from_address`/`to_address`
/// emit as `from`/`to`, `msg_type` as `type`. The signature covers the
/// canonical image of all fields except `signature`, `attachments`, and
/// absent optionals.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub uam_version: String,
    pub message_id: String,
    pub from_address: Address,
    pub to_address: Address,
    pub timestamp: String,
    pub msg_type: MessageType,
    /// 24 random bytes, URL-safe base64 unpadded.
    pub nonce: String,
    /// Ciphertext, URL-safe base64 unpadded.
    pub payload: String,
    /// 64-byte Ed25519 signature, URL-safe base64 unpadded.
    pub signature: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub expires: Option<String>,
    pub media_type: Option<String>,
    pub metadata: Option<Value>,
    pub attachments: Option<Vec<Value>>,
}

/// Wire keys that must be present as strings.
const REQUIRED_FIELDS: [&str; 9] = [
    "uam_version",
    "message_id",
    "from",
    "to",
    "timestamp",
    "type",
    "nonce",
    "payload",
    "signature",
];

impl MessageEnvelope {
    /// Build, encrypt, and sign an envelope.
    ///
    /// `handshake.request` payloads use a SealedBox — the sender may
    /// still be anonymous to the recipient. Everything else uses the
    /// authenticated Box between both identity keys.
    pub fn create(
        from: &str,
        to: &str,
        msg_type: MessageType,
        plaintext: &[u8],
        sender: &Keypair,
        recipient_verify_key: &[u8; 32],
        options: EnvelopeOptions,
    ) -> Result<Self, UamProtocolError> {
        let from_address = Address::parse(from)?;
        let to_address = Address::parse(to)?;

        let payload = if msg_type == MessageType::HandshakeRequest {
            crypto::encrypt_sealed(plaintext, recipient_verify_key)?
        } else {
            crypto::encrypt_box(plaintext, sender, recipient_verify_key)?
        };

        let mut envelope = Self {
            uam_version: UAM_VERSION.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            from_address,
            to_address,
            timestamp: now_iso(),
            msg_type,
            nonce: crypto::random_nonce_b64(),
            payload,
            signature: String::new(),
            thread_id: options.thread_id,
            reply_to: options.reply_to,
            expires: options.expires,
            media_type: options.media_type,
            // A null metadata subtree is the same as an absent one.
            metadata: options.metadata.filter(|v| !v.is_null()),
            attachments: options.attachments,
        };

        envelope.signature = crypto::b64_encode(&sender.sign(&envelope.signing_bytes()));

        let size = envelope.wire_json()?.len();
        if size > MAX_ENVELOPE_SIZE {
            return Err(UamProtocolError::EnvelopeTooLarge {
                size,
                max: MAX_ENVELOPE_SIZE,
            });
        }
        Ok(envelope)
    }

    /// The canonical byte image the signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonicalize(&self.signable_value())
    }

    /// Signable field set: required fields plus present optionals,
    /// excluding `signature` and `attachments`.
    fn signable_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("uam_version".into(), json!(self.uam_version));
        map.insert("message_id".into(), json!(self.message_id));
        map.insert("from".into(), json!(self.from_address.full()));
        map.insert("to".into(), json!(self.to_address.full()));
        map.insert("timestamp".into(), json!(self.timestamp));
        map.insert("type".into(), json!(self.msg_type.as_str()));
        map.insert("nonce".into(), json!(self.nonce));
        map.insert("payload".into(), json!(self.payload));
        if let Some(v) = &self.thread_id {
            map.insert("thread_id".into(), json!(v));
        }
        if let Some(v) = &self.reply_to {
            map.insert("reply_to".into(), json!(v));
        }
        if let Some(v) = &self.expires {
            map.insert("expires".into(), json!(v));
        }
        if let Some(v) = &self.media_type {
            map.insert("media_type".into(), json!(v));
        }
        if let Some(v) = &self.metadata {
            map.insert("metadata".into(), v.clone());
        }
        Value::Object(map)
    }

    /// Verify the signature under the sender's declared verify key.
    pub fn verify(&self, sender_verify_key: &[u8; 32]) -> Result<(), UamProtocolError> {
        let signature = crypto::b64_decode(&self.signature)
            .map_err(|_| UamProtocolError::SignatureVerification)?;
        crypto::verify(&self.signing_bytes(), &signature, sender_verify_key)
    }

    /// Decrypt the payload. The sender's key is unused for sealed
    /// handshake requests.
    pub fn decrypt(
        &self,
        recipient: &Keypair,
        sender_verify_key: &[u8; 32],
    ) -> Result<Vec<u8>, UamProtocolError> {
        if self.msg_type == MessageType::HandshakeRequest {
            crypto::decrypt_sealed(&self.payload, recipient)
        } else {
            crypto::decrypt_box(&self.payload, recipient, sender_verify_key)
        }
    }

    /// The wire dict: signable fields plus `signature` and any
    /// `attachments`.
    pub fn to_wire(&self) -> Value {
        let mut value = self.signable_value();
        let map = value.as_object_mut().expect("signable_value is an object");
        map.insert("signature".into(), json!(self.signature));
        if let Some(attachments) = &self.attachments {
            map.insert("attachments".into(), json!(attachments));
        }
        value
    }

    /// Compact wire JSON.
    pub fn wire_json(&self) -> Result<String, UamProtocolError> {
        Ok(serde_json::to_string(&self.to_wire())?)
    }

    /// Serialized wire size in bytes.
    pub fn wire_size(&self) -> usize {
        self.wire_json().map(|s| s.len()).unwrap_or(0)
    }

    /// Decode a wire dict. Missing required fields are reported together,
    /// sorted by name.
    pub fn from_wire(value: &Value) -> Result<Self, UamProtocolError> {
        let obj = value.as_object().ok_or_else(|| UamProtocolError::InvalidEnvelope {
            reason: "envelope is not a JSON object".into(),
        })?;

        let mut missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|key| obj.get(*key).and_then(Value::as_str).is_none())
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(UamProtocolError::InvalidEnvelope {
                reason: format!("missing required fields: {}", missing.join(", ")),
            });
        }

        let get = |key: &str| obj[key].as_str().expect("presence checked above").to_string();

        let opt = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(Self {
            uam_version: get("uam_version"),
            message_id: get("message_id"),
            from_address: Address::parse(&get("from"))?,
            to_address: Address::parse(&get("to"))?,
            timestamp: get("timestamp"),
            msg_type: get("type").parse()?,
            nonce: get("nonce"),
            payload: get("payload"),
            signature: get("signature"),
            thread_id: opt("thread_id"),
            reply_to: opt("reply_to"),
            expires: opt("expires"),
            media_type: opt("media_type"),
            metadata: obj.get("metadata").filter(|v| !v.is_null()).cloned(),
            attachments: obj
                .get("attachments")
                .and_then(Value::as_array)
                .map(|a| a.to_vec()),
        })
    }

    /// Whether `expires` is set and in the past.
    pub fn is_expired(&self) -> bool {
        let Some(expires) = &self.expires else {
            return false;
        };
        match chrono::DateTime::parse_from_rfc3339(expires) {
            Ok(when) => when < chrono::Utc::now(),
            // An unparseable expiry never silently extends a message's life.
            Err(_) => true,
        }
    }
}
