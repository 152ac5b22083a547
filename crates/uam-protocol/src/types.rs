use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::UamProtocolError;

/// Protocol version carried in every envelope.
pub const UAM_VERSION: &str = "0.1";

/// Maximum serialized wire size of an envelope in bytes.
pub const MAX_ENVELOPE_SIZE: usize = 65_536;

/// Days before a pending handshake expires and is swept.
pub const PENDING_HANDSHAKE_TTL_DAYS: i64 = 7;

/// Message type — determines encryption mode and inbox routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "handshake.request")]
    HandshakeRequest,
    #[serde(rename = "handshake.accept")]
    HandshakeAccept,
    #[serde(rename = "handshake.deny")]
    HandshakeDeny,
    #[serde(rename = "receipt.delivered")]
    ReceiptDelivered,
    #[serde(rename = "receipt.read")]
    ReceiptRead,
    #[serde(rename = "receipt.failed")]
    ReceiptFailed,
    #[serde(rename = "session.request")]
    SessionRequest,
    #[serde(rename = "session.accept")]
    SessionAccept,
    #[serde(rename = "session.decline")]
    SessionDecline,
    #[serde(rename = "session.end")]
    SessionEnd,
}

impl MessageType {
    /// The wire string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::HandshakeRequest => "handshake.request",
            MessageType::HandshakeAccept => "handshake.accept",
            MessageType::HandshakeDeny => "handshake.deny",
            MessageType::ReceiptDelivered => "receipt.delivered",
            MessageType::ReceiptRead => "receipt.read",
            MessageType::ReceiptFailed => "receipt.failed",
            MessageType::SessionRequest => "session.request",
            MessageType::SessionAccept => "session.accept",
            MessageType::SessionDecline => "session.decline",
            MessageType::SessionEnd => "session.end",
        }
    }

    /// Whether this is the user-visible message type. Only this type
    /// triggers an automatic read receipt — never receipts, handshakes,
    /// or sessions (loop prevention).
    pub fn is_user_message(&self) -> bool {
        matches!(self, MessageType::Message)
    }

    /// Handshake family.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::HandshakeRequest | MessageType::HandshakeAccept | MessageType::HandshakeDeny
        )
    }

    /// Receipt family.
    pub fn is_receipt(&self) -> bool {
        matches!(
            self,
            MessageType::ReceiptDelivered | MessageType::ReceiptRead | MessageType::ReceiptFailed
        )
    }

    /// Session family.
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MessageType::SessionRequest
                | MessageType::SessionAccept
                | MessageType::SessionDecline
                | MessageType::SessionEnd
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = UamProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(MessageType::Message),
            "handshake.request" => Ok(MessageType::HandshakeRequest),
            "handshake.accept" => Ok(MessageType::HandshakeAccept),
            "handshake.deny" => Ok(MessageType::HandshakeDeny),
            "receipt.delivered" => Ok(MessageType::ReceiptDelivered),
            "receipt.read" => Ok(MessageType::ReceiptRead),
            "receipt.failed" => Ok(MessageType::ReceiptFailed),
            "session.request" => Ok(MessageType::SessionRequest),
            "session.accept" => Ok(MessageType::SessionAccept),
            "session.decline" => Ok(MessageType::SessionDecline),
            "session.end" => Ok(MessageType::SessionEnd),
            other => Err(UamProtocolError::InvalidEnvelope {
                reason: format!("unknown message type {other:?}"),
            }),
        }
    }
}

/// Trust state of a contact, from first sight to TOFU lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustState {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "unverified")]
    Unverified,
    #[serde(rename = "handshake-sent")]
    HandshakeSent,
    #[serde(rename = "provisional")]
    Provisional,
    #[serde(rename = "trusted")]
    Trusted,
    #[serde(rename = "pinned")]
    Pinned,
    #[serde(rename = "verified")]
    Verified,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Unknown => "unknown",
            TrustState::Unverified => "unverified",
            TrustState::HandshakeSent => "handshake-sent",
            TrustState::Provisional => "provisional",
            TrustState::Trusted => "trusted",
            TrustState::Pinned => "pinned",
            TrustState::Verified => "verified",
        }
    }

    /// Whether the contact's key is locked — later mismatches are hard
    /// failures, never silent overwrites.
    pub fn is_locked(&self) -> bool {
        matches!(self, TrustState::Pinned | TrustState::Verified)
    }

    /// Whether messages from this contact pass the trust gate under
    /// non-auto-accept policies.
    pub fn allows_messages(&self) -> bool {
        matches!(
            self,
            TrustState::Trusted | TrustState::Pinned | TrustState::Verified
        )
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustState {
    type Err = UamProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(TrustState::Unknown),
            "unverified" => Ok(TrustState::Unverified),
            "handshake-sent" => Ok(TrustState::HandshakeSent),
            "provisional" => Ok(TrustState::Provisional),
            "trusted" => Ok(TrustState::Trusted),
            "pinned" => Ok(TrustState::Pinned),
            "verified" => Ok(TrustState::Verified),
            other => Err(UamProtocolError::InvalidContactCard {
                reason: format!("unknown trust state {other:?}"),
            }),
        }
    }
}

/// Agent-wide rule for inbound handshake requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustPolicy {
    /// Accept immediately; contact becomes `provisional`.
    #[serde(rename = "auto-accept")]
    AutoAccept,
    /// Queue for explicit local approval.
    #[serde(rename = "approval-required")]
    ApprovalRequired,
    /// Deny anyone not already in the contact book.
    #[serde(rename = "allowlist-only")]
    AllowlistOnly,
    /// Queue, and additionally require fingerprint verification before
    /// the contact is treated as trusted.
    #[serde(rename = "require-verify")]
    RequireVerify,
}

/// A verified, decrypted inbound message. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub from: Address,
    pub to: Address,
    pub content: String,
    pub timestamp: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: Option<Value>,
    /// Always true for returned messages — unverifiable envelopes are
    /// dropped before this point.
    pub verified: bool,
}

/// Current UTC time as an ISO-8601 string with millisecond precision.
pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
