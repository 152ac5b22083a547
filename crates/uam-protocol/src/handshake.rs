use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::address::Address;
use crate::book::ContactBook;
use crate::contact_card::{CardOptions, ContactCard};
use crate::crypto::Keypair;
use crate::envelope::{EnvelopeOptions, MessageEnvelope};
use crate::error::UamProtocolError;
use crate::types::{MessageType, TrustPolicy, TrustState, PENDING_HANDSHAKE_TTL_DAYS};

/// Narrow emit seam. The FSM builds envelopes and hands them off; it
/// never reads or writes the network directly, and never holds a
/// back-reference to the agent.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn emit(&self, envelope: &MessageEnvelope) -> Result<(), UamProtocolError>;
}

/// Three-phase trust negotiation: request, accept/deny, pin.
///
/// Per remote address the states are: none, handshake-sent, pending
/// (their request awaits local approval), provisional, trusted/pinned.
/// Decisions are recorded in the contact book; envelopes leave through
/// the sink.
pub struct HandshakeManager {
    identity: Keypair,
    address: Address,
    display_name: String,
    relay_url: String,
    policy: TrustPolicy,
    book: Arc<ContactBook>,
    sink: Arc<dyn EnvelopeSink>,
}

impl HandshakeManager {
    pub fn new(
        identity: Keypair,
        address: Address,
        display_name: String,
        relay_url: String,
        policy: TrustPolicy,
        book: Arc<ContactBook>,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Self {
        Self {
            identity,
            address,
            display_name,
            relay_url,
            policy,
            book,
            sink,
        }
    }

    /// Our signed contact card.
    pub fn our_card(&self) -> Result<ContactCard, UamProtocolError> {
        ContactCard::create(
            &self.address.full(),
            &self.display_name,
            &self.relay_url,
            &self.identity,
            CardOptions::default(),
        )
    }

    /// Phase 1 (outbound): first contact with a peer. Emits a
    /// SealedBox-wrapped HANDSHAKE_REQUEST carrying our card and marks
    /// the contact `handshake-sent`.
    pub async fn initiate(
        &self,
        to: &Address,
        recipient_key: &[u8; 32],
    ) -> Result<(), UamProtocolError> {
        let card = self.our_card()?.to_value().to_string();
        let envelope = MessageEnvelope::create(
            &self.address.full(),
            &to.full(),
            MessageType::HandshakeRequest,
            card.as_bytes(),
            &self.identity,
            recipient_key,
            EnvelopeOptions::default(),
        )?;
        self.sink.emit(&envelope).await?;
        self.book
            .set_trust_state(&to.full(), TrustState::HandshakeSent)?;
        tracing::info!("handshake: request sent to {}", to.full());
        Ok(())
    }

    /// Phase 2 (inbound): a peer's HANDSHAKE_REQUEST, already decrypted
    /// to its contact-card JSON. Policy selects the response.
    pub async fn handle_request(
        &self,
        from: &Address,
        card_value: &Value,
    ) -> Result<(), UamProtocolError> {
        let card = ContactCard::from_value(card_value, true)?;
        if card.address != *from {
            return Err(UamProtocolError::InvalidContactCard {
                reason: format!(
                    "card address {} does not match envelope sender {}",
                    card.address.full(),
                    from.full()
                ),
            });
        }

        // TOFU: a known locked contact presenting a different key is a
        // hard failure, never an overwrite.
        if let Some(existing) = self.book.get_contact(&from.full())? {
            if existing.trust_state.is_locked() && existing.public_key != card.public_key {
                return Err(UamProtocolError::KeyPinning {
                    address: from.full(),
                });
            }
        }

        match self.policy {
            TrustPolicy::AutoAccept => {
                self.book.add_contact(
                    &from.full(),
                    &card.public_key,
                    Some(&card.display_name),
                    TrustState::Provisional,
                    Some("auto-accept"),
                    Some(&card.relay),
                    card.relays.as_deref(),
                )?;
                self.send_accept(from, &card.verify_key()?).await?;
                tracing::info!("handshake: auto-accepted {}", from.full());
            }
            TrustPolicy::AllowlistOnly => {
                self.send_deny(from, &card.verify_key()?).await?;
                tracing::info!("handshake: denied {} (allowlist-only)", from.full());
            }
            TrustPolicy::ApprovalRequired | TrustPolicy::RequireVerify => {
                self.book.add_pending(&from.full(), card_value)?;
                tracing::info!("handshake: queued {} for approval", from.full());
            }
        }
        Ok(())
    }

    /// Local approval of a queued request: contact becomes `trusted`
    /// and an accept goes out.
    pub async fn approve(&self, address: &str) -> Result<(), UamProtocolError> {
        let pending = self.book.get_pending(address)?.ok_or_else(|| {
            UamProtocolError::InvalidContactCard {
                reason: format!("no pending handshake for {address}"),
            }
        })?;
        let card = ContactCard::from_value(&pending.contact_card, true)?;

        self.book.add_contact(
            address,
            &card.public_key,
            Some(&card.display_name),
            TrustState::Trusted,
            Some("explicit-approval"),
            Some(&card.relay),
            card.relays.as_deref(),
        )?;
        self.book.remove_pending(address)?;
        self.send_accept(&card.address, &card.verify_key()?).await?;
        tracing::info!("handshake: approved {address}");
        Ok(())
    }

    /// Local denial of a queued request.
    pub async fn deny(&self, address: &str) -> Result<(), UamProtocolError> {
        let pending = self.book.get_pending(address)?.ok_or_else(|| {
            UamProtocolError::InvalidContactCard {
                reason: format!("no pending handshake for {address}"),
            }
        })?;
        self.book.remove_pending(address)?;

        // Best effort: if the stored card yields a usable key, tell the
        // peer. A garbled card still gets dropped from the queue.
        match ContactCard::from_value(&pending.contact_card, false)
            .and_then(|card| Ok((card.address.clone(), card.verify_key()?)))
        {
            Ok((peer, key)) => self.send_deny(&peer, &key).await?,
            Err(e) => tracing::warn!("handshake: deny without notification: {e}"),
        }
        tracing::info!("handshake: denied {address}");
        Ok(())
    }

    /// Phase 3 (inbound): the peer accepted — TOFU lock.
    pub async fn handle_accept(
        &self,
        from: &Address,
        card_value: Option<&Value>,
    ) -> Result<(), UamProtocolError> {
        // Enrich from their card when one rides along and still matches
        // the stored key (add_contact enforces the pin).
        if let Some(value) = card_value {
            if let Ok(card) = ContactCard::from_value(value, true) {
                if card.address == *from {
                    self.book.add_contact(
                        &from.full(),
                        &card.public_key,
                        Some(&card.display_name),
                        TrustState::HandshakeSent,
                        None,
                        Some(&card.relay),
                        card.relays.as_deref(),
                    )?;
                }
            }
        }
        self.book.record_pin(&from.full())?;
        tracing::info!("handshake: {} accepted, key pinned", from.full());
        Ok(())
    }

    /// Inbound deny: log only, no state change.
    pub fn handle_deny(&self, from: &Address) {
        tracing::info!("handshake: {} denied our request", from.full());
    }

    /// Sweep pending entries older than the 7-day horizon: notify the
    /// peer with `receipt.failed` (reason `handshake_expired`) and drop
    /// the row. Returns the number swept.
    pub async fn sweep_expired(&self) -> Result<usize, UamProtocolError> {
        let expired = self.book.expired_pending(PENDING_HANDSHAKE_TTL_DAYS)?;
        let mut swept = 0;
        for pending in expired {
            match ContactCard::from_value(&pending.contact_card, false)
                .and_then(|card| Ok((card.address.clone(), card.verify_key()?)))
            {
                Ok((peer, key)) => {
                    let payload = json!({ "reason": "handshake_expired" }).to_string();
                    let envelope = MessageEnvelope::create(
                        &self.address.full(),
                        &peer.full(),
                        MessageType::ReceiptFailed,
                        payload.as_bytes(),
                        &self.identity,
                        &key,
                        EnvelopeOptions::default(),
                    )?;
                    if let Err(e) = self.sink.emit(&envelope).await {
                        tracing::warn!("handshake: expiry receipt to {} failed: {e}", peer.full());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "handshake: sweeping {} without notification: {e}",
                        pending.address
                    );
                }
            }
            self.book.remove_pending(&pending.address)?;
            swept += 1;
        }
        if swept > 0 {
            tracing::info!("handshake: swept {swept} expired pending request(s)");
        }
        Ok(swept)
    }

    async fn send_accept(
        &self,
        to: &Address,
        recipient_key: &[u8; 32],
    ) -> Result<(), UamProtocolError> {
        let card = self.our_card()?.to_value().to_string();
        let envelope = MessageEnvelope::create(
            &self.address.full(),
            &to.full(),
            MessageType::HandshakeAccept,
            card.as_bytes(),
            &self.identity,
            recipient_key,
            EnvelopeOptions::default(),
        )?;
        self.sink.emit(&envelope).await
    }

    async fn send_deny(
        &self,
        to: &Address,
        recipient_key: &[u8; 32],
    ) -> Result<(), UamProtocolError> {
        let payload = json!({ "reason": "handshake denied" }).to_string();
        let envelope = MessageEnvelope::create(
            &self.address.full(),
            &to.full(),
            MessageType::HandshakeDeny,
            payload.as_bytes(),
            &self.identity,
            recipient_key,
            EnvelopeOptions::default(),
        )?;
        self.sink.emit(&envelope).await
    }
}
