use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use uam_transport::{
    HttpTransport, RelayClient, Transport, TransportConfig, UamTransportError, WsTransport,
};

use crate::address::Address;
use crate::book::{Contact, ContactBook, PendingHandshake};
use crate::config::AgentConfig;
use crate::contact_card::ContactCard;
use crate::crypto::{self, Keypair};
use crate::envelope::{EnvelopeOptions, MessageEnvelope};
use crate::error::UamProtocolError;
use crate::handshake::{EnvelopeSink, HandshakeManager};
use crate::keystore::KeyStore;
use crate::resolver::{
    DnsResolver, KeyResolver, RegistryResolver, RelayResolver, SmartResolver,
};
use crate::types::{MessageType, now_iso, ReceivedMessage, TrustPolicy, TrustState};

/// Optional send parameters.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub thread_id: Option<String>,
    pub attachments: Option<Vec<Value>>,
}

/// Emits FSM envelopes through the agent's transport — the narrow seam
/// that keeps the handshake manager free of any agent back-reference.
struct TransportSink {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl EnvelopeSink for TransportSink {
    async fn emit(&self, envelope: &MessageEnvelope) -> Result<(), UamProtocolError> {
        self.transport
            .send(&envelope.to_wire())
            .await
            .map_err(Into::into)
    }
}

/// Everything a connected agent holds.
struct AgentState {
    identity: Keypair,
    address: Address,
    token: String,
    book: Arc<ContactBook>,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn KeyResolver>,
    handshake: HandshakeManager,
    /// Client for multi-relay failover posts.
    failover: reqwest::Client,
    /// Addresses with a handshake currently being emitted — concurrent
    /// first sends to the same peer produce exactly one request.
    handshakes_in_flight: tokio::sync::Mutex<HashSet<String>>,
}

/// Top-level orchestrator: composes key store, contact book, resolver,
/// handshake FSM, and transport into user-level send/inbox/approve/
/// deny/block operations.
///
/// `connect` is idempotent — every public operation establishes the
/// connection on first use. Inbound per-message failures are dropped
/// silently (logged at debug); `send` never masks errors.
pub struct Agent {
    config: AgentConfig,
    state: OnceCell<AgentState>,
    closed: AtomicBool,
    transport_override: Option<Arc<dyn Transport>>,
    resolver_override: Option<Arc<dyn KeyResolver>>,
}

impl Agent {
    /// An agent with the standard relay transport and smart resolver.
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            state: OnceCell::new(),
            closed: AtomicBool::new(false),
            transport_override: None,
            resolver_override: None,
        }
    }

    /// An agent over caller-supplied transport and resolver — custom
    /// deployments and tests. Relay registration is skipped; any stored
    /// token is still picked up.
    pub fn with_transport(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn KeyResolver>,
    ) -> Self {
        Self {
            config,
            state: OnceCell::new(),
            closed: AtomicBool::new(false),
            transport_override: Some(transport),
            resolver_override: Some(resolver),
        }
    }

    /// Establish the connection if needed. Idempotent.
    pub async fn connect(&self) -> Result<(), UamProtocolError> {
        self.state().await.map(|_| ())
    }

    /// This agent's full address.
    pub fn address(&self) -> String {
        self.config.address()
    }

    async fn state(&self) -> Result<&AgentState, UamProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UamTransportError::Shutdown.into());
        }
        self.state.get_or_try_init(|| self.establish()).await
    }

    async fn establish(&self) -> Result<AgentState, UamProtocolError> {
        let config = &self.config;
        let address = Address::parse(&config.address())?;

        let keystore = KeyStore::new(&config.data_dir, &config.name);
        let identity = keystore.load_or_generate()?;

        let token = match keystore.token() {
            Some(token) => token,
            None if self.transport_override.is_some() => String::new(),
            None if config.auto_register => {
                let client =
                    RelayClient::new(&TransportConfig::new(&config.relay_url))?;
                let registration = client
                    .register(&config.name, &identity.public_key_b64())
                    .await
                    .map_err(|e| UamProtocolError::Registration {
                        reason: e.to_string(),
                    })?;
                keystore.store_token(&registration.token)?;
                tracing::info!("agent: registered as {}", registration.address);
                registration.token
            }
            None => {
                return Err(UamProtocolError::Registration {
                    reason: "no token stored and auto-registration is disabled".into(),
                });
            }
        };

        let transport_config = TransportConfig::new(&config.relay_url).token(&token);
        let transport: Arc<dyn Transport> = match &self.transport_override {
            Some(transport) => Arc::clone(transport),
            None if config.push => Arc::new(WsTransport::new(&transport_config)?),
            None => Arc::new(HttpTransport::new(&transport_config, address.full())?),
        };
        transport.connect().await?;

        let book = Arc::new(ContactBook::open(
            &config.data_dir.join("contacts").join("book.db"),
        )?);

        let resolver: Arc<dyn KeyResolver> = match &self.resolver_override {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(SmartResolver::new(
                config.relay_domain.clone(),
                RelayResolver::new(&transport_config)?,
                DnsResolver::new()?,
                config.registry.clone().map(RegistryResolver::new),
            )),
        };

        let handshake = HandshakeManager::new(
            identity.clone(),
            address.clone(),
            config.display_name.clone(),
            config.relay_url.clone(),
            config.policy,
            Arc::clone(&book),
            Arc::new(TransportSink {
                transport: Arc::clone(&transport),
            }),
        );

        if let Err(e) = handshake.sweep_expired().await {
            tracing::warn!("agent: pending sweep failed: {e}");
        }

        let failover = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| UamProtocolError::Registration {
                reason: e.to_string(),
            })?;

        tracing::info!("agent: connected as {}", address.full());
        Ok(AgentState {
            identity,
            address,
            token,
            book,
            transport,
            resolver,
            handshake,
            failover,
            handshakes_in_flight: tokio::sync::Mutex::new(HashSet::new()),
        })
    }

    // ── Send ─────────────────────────────────────────────────────────

    /// Encrypt, sign, and dispatch one message. Returns the message id.
    ///
    /// First contact triggers a handshake request ahead of the message.
    /// When the contact book lists multiple relays for the recipient,
    /// each is tried in order until one accepts.
    pub async fn send(
        &self,
        to: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<String, UamProtocolError> {
        let state = self.state().await?;
        let to_address = Address::parse(to)?;

        let (key_b64, candidates) = self.resolve_recipient(state, &to_address).await?;
        let recipient_key = crypto::verify_key_from_b64(&key_b64)?;

        self.ensure_handshake(state, &to_address, &recipient_key).await?;

        let envelope = MessageEnvelope::create(
            &state.address.full(),
            &to_address.full(),
            MessageType::Message,
            text.as_bytes(),
            &state.identity,
            &recipient_key,
            EnvelopeOptions {
                thread_id: options.thread_id,
                attachments: options.attachments,
                ..Default::default()
            },
        )?;

        self.dispatch(state, &envelope, &candidates).await?;
        tracing::debug!("agent: sent {} to {}", envelope.message_id, to_address.full());
        Ok(envelope.message_id)
    }

    /// Recipient key plus the ordered relay candidate list.
    ///
    /// The contact book is authoritative for known keys. The resolver is
    /// consulted for unknown peers, and for known peers missing relay
    /// information — where a resolved key differing from a pinned one is
    /// a hard `KeyPinning` failure.
    async fn resolve_recipient(
        &self,
        state: &AgentState,
        to: &Address,
    ) -> Result<(String, Vec<String>), UamProtocolError> {
        let full = to.full();

        if let Some(contact) = state.book.get_contact(&full)? {
            if contact.relay.is_none() && contact.relays.is_empty() {
                match state.resolver.resolve_public_key(to).await {
                    Ok(resolved) => {
                        if contact.trust_state.is_locked()
                            && resolved.public_key != contact.public_key
                        {
                            return Err(UamProtocolError::KeyPinning { address: full });
                        }
                        state.book.add_contact(
                            &full,
                            &contact.public_key,
                            None,
                            contact.trust_state,
                            None,
                            resolved.relay.as_deref(),
                            None,
                        )?;
                        let refreshed = state
                            .book
                            .get_contact(&full)?
                            .expect("contact written above");
                        return Ok((contact.public_key, self.candidates(&refreshed)));
                    }
                    Err(e) => {
                        tracing::debug!("agent: relay refresh for {full} failed: {e}");
                    }
                }
            }
            return Ok((contact.public_key.clone(), self.candidates(&contact)));
        }

        let resolved = state.resolver.resolve_public_key(to).await?;
        state.book.add_contact(
            &full,
            &resolved.public_key,
            None,
            TrustState::Unverified,
            Some(resolved.source),
            resolved.relay.as_deref(),
            None,
        )?;
        let contact = state.book.get_contact(&full)?.expect("contact written above");
        Ok((resolved.public_key, self.candidates(&contact)))
    }

    /// Ordered, deduplicated relay candidates: the contact's failover
    /// list, its single relay, then our own relay as last resort.
    fn candidates(&self, contact: &Contact) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for url in contact
            .relays
            .iter()
            .map(String::as_str)
            .chain(contact.relay.as_deref())
            .chain([self.config.relay_url.as_str()])
        {
            let normalized = normalize_relay_url(url);
            if seen.insert(normalized.clone()) {
                candidates.push(normalized);
            }
        }
        candidates
    }

    /// Emit exactly one handshake request per unknown peer, however many
    /// sends race on it.
    async fn ensure_handshake(
        &self,
        state: &AgentState,
        to: &Address,
        recipient_key: &[u8; 32],
    ) -> Result<(), UamProtocolError> {
        let full = to.full();
        let needs = |trust: Option<TrustState>| {
            matches!(
                trust,
                None | Some(TrustState::Unknown) | Some(TrustState::Unverified)
            )
        };

        if !needs(state.book.get_contact(&full)?.map(|c| c.trust_state)) {
            return Ok(());
        }

        // Decision happens under the latch; the check above is only a
        // fast path.
        {
            let mut in_flight = state.handshakes_in_flight.lock().await;
            if in_flight.contains(&full)
                || !needs(state.book.get_contact(&full)?.map(|c| c.trust_state))
            {
                return Ok(());
            }
            in_flight.insert(full.clone());
        }

        let result = state.handshake.initiate(to, recipient_key).await;
        state.handshakes_in_flight.lock().await.remove(&full);
        result
    }

    /// Single-relay sends go through the transport; multi-relay
    /// recipients get ordered failover posts with a 10-second cap each.
    /// First success wins; all failures surface the last error.
    async fn dispatch(
        &self,
        state: &AgentState,
        envelope: &MessageEnvelope,
        candidates: &[String],
    ) -> Result<(), UamProtocolError> {
        let wire = envelope.to_wire();
        if candidates.len() <= 1 {
            return state.transport.send(&wire).await.map_err(Into::into);
        }

        let mut last_error: Option<UamTransportError> = None;
        for base in candidates {
            let url = format!("{base}/api/v1/send");
            let mut request = state.failover.post(&url).json(&wire);
            if !state.token.is_empty() {
                request = request.bearer_auth(&state.token);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("agent: delivered via {base}");
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::warn!("agent: relay {base} returned {}", resp.status());
                    last_error = Some(UamTransportError::Http {
                        status: resp.status().as_u16(),
                        url,
                    });
                }
                Err(e) => {
                    tracing::warn!("agent: relay {base} unreachable: {e}");
                    last_error = Some(UamTransportError::Send(e));
                }
            }
        }
        Err(last_error.expect("at least two candidates tried").into())
    }

    // ── Inbox ────────────────────────────────────────────────────────

    /// Poll the transport and return verified, decrypted user messages.
    ///
    /// Handshake, receipt, and session envelopes are routed internally.
    /// Blocked senders, bad signatures, and failed decryptions drop
    /// without raising; under non-auto-accept policies the same applies
    /// to senders that are not yet trusted.
    pub async fn inbox(&self, limit: usize) -> Result<Vec<ReceivedMessage>, UamProtocolError> {
        let state = self.state().await?;

        if let Err(e) = state.handshake.sweep_expired().await {
            tracing::warn!("agent: pending sweep failed: {e}");
        }

        let wires = state.transport.receive(limit).await?;
        let mut messages = Vec::new();
        for wire in &wires {
            match self.process_inbound(state, wire).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => tracing::debug!("inbox: dropped envelope: {e}"),
            }
        }
        Ok(messages)
    }

    async fn process_inbound(
        &self,
        state: &AgentState,
        wire: &Value,
    ) -> Result<Option<ReceivedMessage>, UamProtocolError> {
        let envelope = MessageEnvelope::from_wire(wire)?;
        let from = envelope.from_address.full();

        if state.book.is_blocked(&from) {
            tracing::debug!("inbox: blocked sender {from}");
            return Ok(None);
        }
        if envelope.is_expired() {
            tracing::debug!("inbox: expired envelope {}", envelope.message_id);
            return Ok(None);
        }

        // A handshake request may come from a peer no resolver knows yet;
        // its sealed card declares the key the signature is checked under.
        if envelope.msg_type == MessageType::HandshakeRequest {
            let plaintext = envelope.decrypt(&state.identity, &[0u8; 32])?;
            let card_value: Value = serde_json::from_slice(&plaintext)?;
            let card = ContactCard::from_value(&card_value, true)?;
            envelope.verify(&card.verify_key()?)?;
            state
                .handshake
                .handle_request(&envelope.from_address, &card_value)
                .await?;
            return Ok(None);
        }

        let sender_key_b64 = match state.book.get_contact(&from)? {
            Some(contact) => contact.public_key,
            None => {
                let resolved = state.resolver.resolve_public_key(&envelope.from_address).await?;
                state.book.add_contact(
                    &from,
                    &resolved.public_key,
                    None,
                    TrustState::Unverified,
                    Some(resolved.source),
                    resolved.relay.as_deref(),
                    None,
                )?;
                resolved.public_key
            }
        };
        let sender_key = crypto::verify_key_from_b64(&sender_key_b64)?;
        envelope.verify(&sender_key)?;

        match envelope.msg_type {
            MessageType::HandshakeRequest => unreachable!("handled above"),
            MessageType::HandshakeAccept => {
                let card = envelope
                    .decrypt(&state.identity, &sender_key)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
                state
                    .handshake
                    .handle_accept(&envelope.from_address, card.as_ref())
                    .await?;
                Ok(None)
            }
            MessageType::HandshakeDeny => {
                state.handshake.handle_deny(&envelope.from_address);
                Ok(None)
            }
            t @ (MessageType::ReceiptDelivered
            | MessageType::ReceiptRead
            | MessageType::ReceiptFailed) => {
                tracing::debug!("inbox: {t} from {from} for {}", envelope.message_id);
                Ok(None)
            }
            t @ (MessageType::SessionRequest
            | MessageType::SessionAccept
            | MessageType::SessionDecline
            | MessageType::SessionEnd) => {
                tracing::debug!("inbox: session signalling {t} from {from} ignored");
                Ok(None)
            }
            MessageType::Message => {
                if self.config.policy != TrustPolicy::AutoAccept {
                    let trust = state
                        .book
                        .get_contact(&from)?
                        .map(|c| c.trust_state)
                        .unwrap_or(TrustState::Unknown);
                    if !trust.allows_messages() {
                        tracing::debug!("inbox: {from} not trusted ({trust}), message dropped");
                        return Ok(None);
                    }
                }

                let plaintext = envelope.decrypt(&state.identity, &sender_key)?;
                let content = String::from_utf8_lossy(&plaintext).into_owned();

                if self.config.read_receipts {
                    self.spawn_read_receipt(state, &envelope, &sender_key);
                }

                Ok(Some(ReceivedMessage {
                    message_id: envelope.message_id,
                    from: envelope.from_address,
                    to: envelope.to_address,
                    content,
                    timestamp: envelope.timestamp,
                    thread_id: envelope.thread_id,
                    reply_to: envelope.reply_to,
                    metadata: envelope.metadata,
                    verified: true,
                }))
            }
        }
    }

    /// Fire-and-forget `receipt.read` — emitted only for user messages,
    /// never in response to receipts, handshakes, or sessions.
    fn spawn_read_receipt(
        &self,
        state: &AgentState,
        original: &MessageEnvelope,
        sender_key: &[u8; 32],
    ) {
        let payload = json!({
            "original_message_id": original.message_id,
            "read_at": now_iso(),
        })
        .to_string();

        let receipt = MessageEnvelope::create(
            &state.address.full(),
            &original.from_address.full(),
            MessageType::ReceiptRead,
            payload.as_bytes(),
            &state.identity,
            sender_key,
            EnvelopeOptions {
                reply_to: Some(original.message_id.clone()),
                ..Default::default()
            },
        );

        match receipt {
            Ok(receipt) => {
                let transport = Arc::clone(&state.transport);
                let wire = receipt.to_wire();
                tokio::spawn(async move {
                    if let Err(e) = transport.send(&wire).await {
                        tracing::debug!("agent: read receipt dropped: {e}");
                    }
                });
            }
            Err(e) => tracing::debug!("agent: read receipt not built: {e}"),
        }
    }

    // ── Trust operations ─────────────────────────────────────────────

    /// Queued inbound handshakes awaiting a decision.
    pub async fn pending(&self) -> Result<Vec<PendingHandshake>, UamProtocolError> {
        self.state().await?.book.pending()
    }

    /// Approve a queued handshake: the peer becomes `trusted` and an
    /// accept goes out.
    pub async fn approve(&self, address: &str) -> Result<(), UamProtocolError> {
        let address = Address::parse(address)?;
        self.state().await?.handshake.approve(&address.full()).await
    }

    /// Deny a queued handshake.
    pub async fn deny(&self, address: &str) -> Result<(), UamProtocolError> {
        let address = Address::parse(address)?;
        self.state().await?.handshake.deny(&address.full()).await
    }

    /// Block an exact address or a `*::domain` wildcard.
    pub async fn block(&self, pattern: &str) -> Result<(), UamProtocolError> {
        self.state().await?.book.block(pattern)
    }

    /// Remove a block pattern. Returns whether it existed.
    pub async fn unblock(&self, pattern: &str) -> Result<bool, UamProtocolError> {
        self.state().await?.book.unblock(pattern)
    }

    /// All contacts.
    pub async fn contacts(&self) -> Result<Vec<Contact>, UamProtocolError> {
        self.state().await?.book.contacts()
    }

    /// Manual fingerprint verification: compare against the stored key
    /// and promote the contact to `verified` on match.
    pub async fn verify_contact(
        &self,
        address: &str,
        fingerprint: &str,
    ) -> Result<(), UamProtocolError> {
        let state = self.state().await?;
        let address = Address::parse(address)?;
        let full = address.full();

        let contact = state
            .book
            .get_contact(&full)?
            .ok_or_else(|| UamProtocolError::Resolution {
                address: full.clone(),
                reason: "not in contact book".into(),
            })?;
        let stored_key = crypto::verify_key_from_b64(&contact.public_key)?;
        if crypto::fingerprint(&stored_key) != fingerprint.trim().to_ascii_lowercase() {
            return Err(UamProtocolError::KeyPinning { address: full });
        }
        state.book.set_trust_state(&full, TrustState::Verified)?;
        tracing::info!("agent: {full} fingerprint verified");
        Ok(())
    }

    /// Our signed contact card.
    pub async fn contact_card(&self) -> Result<ContactCard, UamProtocolError> {
        self.state().await?.handshake.our_card()
    }

    /// Disconnect the transport. Idempotent; the contact book closes
    /// with the agent.
    pub async fn close(&self) -> Result<(), UamProtocolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(state) = self.state.get() {
            state.transport.disconnect().await?;
        }
        tracing::info!("agent: closed");
        Ok(())
    }
}

/// Candidate normalization: strip trailing slash and `/ws`, map
/// WebSocket schemes to their HTTP equivalents.
fn normalize_relay_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/ws").unwrap_or(trimmed);
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_relay_urls() {
        assert_eq!(
            normalize_relay_url("https://relay.example/"),
            "https://relay.example"
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example/ws"),
            "https://relay.example"
        );
        assert_eq!(
            normalize_relay_url("ws://relay.example/ws/"),
            "http://relay.example"
        );
        assert_eq!(
            normalize_relay_url("https://relay.example:8443"),
            "https://relay.example:8443"
        );
    }

    #[test]
    fn candidates_ordered_and_deduped() {
        let agent = Agent::new(AgentConfig::new("alice", "https://home.example"));
        let contact = Contact {
            address: "bob::net".into(),
            public_key: "pk".into(),
            display_name: None,
            trust_state: TrustState::Pinned,
            trust_source: None,
            relay: Some("wss://first.example/ws".into()),
            relays: vec![
                "https://first.example".into(),
                "https://second.example/".into(),
            ],
            pinned_at: None,
            first_seen: now_iso(),
            last_seen: now_iso(),
        };
        let candidates = agent.candidates(&contact);
        assert_eq!(
            candidates,
            vec![
                "https://first.example".to_string(),
                "https://second.example".to_string(),
                "https://home.example".to_string(),
            ]
        );
    }
}
