//! End-to-end agent scenarios over in-memory transports: first-contact
//! handshakes, TOFU pinning, policy gates, block precedence, receipt
//! suppression, and multi-relay failover.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uam_protocol::envelope::{EnvelopeOptions, MessageEnvelope};
use uam_protocol::resolver::{KeyResolver, ResolvedKey};
use uam_protocol::{
    Address, Agent, AgentConfig, ContactBook, KeyStore, Keypair, MessageType, SendOptions,
    TrustPolicy, TrustState, UamProtocolError,
};
use uam_transport::{ListenCallback, Transport, UamTransportError};

const RELAY: &str = "https://relay.example";

// ── In-memory pipe transport ─────────────────────────────────────────

/// Sends land in the peer's inbox; everything sent is also logged.
struct PipeTransport {
    peer_inbox: Arc<Mutex<Vec<Value>>>,
    inbox: Arc<Mutex<Vec<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
}

struct PipeEnd {
    transport: Arc<PipeTransport>,
    inbox: Arc<Mutex<Vec<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl PipeEnd {
    fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|v| v["type"].as_str().unwrap_or("?").to_string())
            .collect()
    }

    fn inject(&self, wire: Value) {
        self.inbox.lock().unwrap().push(wire);
    }
}

fn pipe_pair() -> (PipeEnd, PipeEnd) {
    let inbox_a = Arc::new(Mutex::new(Vec::new()));
    let inbox_b = Arc::new(Mutex::new(Vec::new()));
    let sent_a = Arc::new(Mutex::new(Vec::new()));
    let sent_b = Arc::new(Mutex::new(Vec::new()));

    let a = Arc::new(PipeTransport {
        peer_inbox: Arc::clone(&inbox_b),
        inbox: Arc::clone(&inbox_a),
        sent: Arc::clone(&sent_a),
    });
    let b = Arc::new(PipeTransport {
        peer_inbox: Arc::clone(&inbox_a),
        inbox: Arc::clone(&inbox_b),
        sent: Arc::clone(&sent_b),
    });
    (
        PipeEnd {
            transport: a,
            inbox: inbox_a,
            sent: sent_a,
        },
        PipeEnd {
            transport: b,
            inbox: inbox_b,
            sent: sent_b,
        },
    )
}

#[async_trait]
impl Transport for PipeTransport {
    async fn connect(&self) -> Result<(), UamTransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), UamTransportError> {
        Ok(())
    }

    async fn send(&self, envelope: &Value) -> Result<(), UamTransportError> {
        self.sent.lock().unwrap().push(envelope.clone());
        self.peer_inbox.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>, UamTransportError> {
        let mut inbox = self.inbox.lock().unwrap();
        let take = limit.min(inbox.len());
        Ok(inbox.drain(..take).collect())
    }

    fn listen(&self, _callback: ListenCallback) -> Result<(), UamTransportError> {
        Err(UamTransportError::ListenUnsupported)
    }
}

// ── Static resolver ──────────────────────────────────────────────────

#[derive(Default, Clone)]
struct StaticResolver {
    keys: Arc<Mutex<HashMap<String, ResolvedKey>>>,
}

impl StaticResolver {
    fn insert(&self, address: &str, public_key: String) {
        self.keys.lock().unwrap().insert(
            address.to_string(),
            ResolvedKey {
                public_key,
                relay: None,
                source: "relay",
            },
        );
    }
}

#[async_trait]
impl KeyResolver for StaticResolver {
    async fn resolve_public_key(
        &self,
        address: &Address,
    ) -> Result<ResolvedKey, UamProtocolError> {
        self.keys
            .lock()
            .unwrap()
            .get(&address.full())
            .cloned()
            .ok_or_else(|| UamProtocolError::Resolution {
                address: address.full(),
                reason: "unknown to static resolver".into(),
            })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn config(name: &str, dir: &Path, policy: TrustPolicy) -> AgentConfig {
    AgentConfig::new(name, RELAY).data_dir(dir).policy(policy)
}

fn identity(dir: &Path, name: &str) -> Keypair {
    KeyStore::new(dir, name).load_or_generate().unwrap()
}

async fn trust_of(agent: &Agent, address: &str) -> Option<TrustState> {
    agent
        .contacts()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.address == address)
        .map(|c| c.trust_state)
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn first_contact_handshake_message_and_pin() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = identity(bob_dir.path(), "bob");

    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver.clone()),
    );
    let bob = Agent::with_transport(
        config("bob", bob_dir.path(), TrustPolicy::AutoAccept),
        bob_end.transport.clone(),
        Arc::new(resolver.clone()),
    );

    let message_id = alice
        .send("bob::relay.example", "hello", SendOptions::default())
        .await
        .unwrap();
    assert!(!message_id.is_empty());

    // The handshake request left before the message.
    assert_eq!(alice_end.sent_types(), vec!["handshake.request", "message"]);
    assert_eq!(
        trust_of(&alice, "bob::relay.example").await,
        Some(TrustState::HandshakeSent)
    );

    // Bob's poll routes the handshake internally and returns the message.
    let received = bob.inbox(10).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content, "hello");
    assert_eq!(received[0].from.full(), "alice::relay.example");
    assert!(received[0].verified);
    assert_eq!(received[0].message_id, message_id);
    assert_eq!(
        trust_of(&bob, "alice::relay.example").await,
        Some(TrustState::Provisional)
    );
    assert!(bob_end.sent_types().contains(&"handshake.accept".to_string()));

    // Bob's accept pins him in Alice's book.
    let nothing = alice.inbox(10).await.unwrap();
    assert!(nothing.is_empty());
    assert_eq!(
        trust_of(&alice, "bob::relay.example").await,
        Some(TrustState::Pinned)
    );
}

#[tokio::test]
async fn allowlist_only_denies_strangers() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = identity(bob_dir.path(), "bob");

    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver.clone()),
    );
    let bob = Agent::with_transport(
        config("bob", bob_dir.path(), TrustPolicy::AllowlistOnly),
        bob_end.transport.clone(),
        Arc::new(resolver.clone()),
    );

    alice
        .send("bob::relay.example", "let me in", SendOptions::default())
        .await
        .unwrap();

    let received = bob.inbox(10).await.unwrap();
    assert!(received.is_empty());
    assert_eq!(bob_end.sent_types(), vec!["handshake.deny"]);
    assert_eq!(trust_of(&bob, "alice::relay.example").await, None);
}

#[tokio::test]
async fn approval_required_queues_then_delivers_after_approve() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = identity(bob_dir.path(), "bob");

    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver.clone()),
    );
    let bob = Agent::with_transport(
        config("bob", bob_dir.path(), TrustPolicy::ApprovalRequired),
        bob_end.transport.clone(),
        Arc::new(resolver.clone()),
    );

    alice
        .send("bob::relay.example", "knock knock", SendOptions::default())
        .await
        .unwrap();

    // The message is gated, the handshake queued.
    assert!(bob.inbox(10).await.unwrap().is_empty());
    let pending = bob.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].address, "alice::relay.example");

    bob.approve("alice::relay.example").await.unwrap();
    assert_eq!(
        trust_of(&bob, "alice::relay.example").await,
        Some(TrustState::Trusted)
    );

    // A resend now passes the trust gate.
    alice
        .send("bob::relay.example", "second try", SendOptions::default())
        .await
        .unwrap();
    let received = bob.inbox(10).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content, "second try");
}

#[tokio::test]
async fn concurrent_first_sends_emit_one_handshake() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = identity(bob_dir.path(), "bob");

    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, _bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver.clone()),
    );

    let (r1, r2, r3) = tokio::join!(
        alice.send("bob::relay.example", "one", SendOptions::default()),
        alice.send("bob::relay.example", "two", SendOptions::default()),
        alice.send("bob::relay.example", "three", SendOptions::default()),
    );
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();

    let handshakes = alice_end
        .sent_types()
        .iter()
        .filter(|t| *t == "handshake.request")
        .count();
    assert_eq!(handshakes, 1, "exactly one handshake for concurrent first sends");
    let messages = alice_end
        .sent_types()
        .iter()
        .filter(|t| *t == "message")
        .count();
    assert_eq!(messages, 3);
}

#[tokio::test]
async fn blocked_senders_never_surface() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = identity(bob_dir.path(), "bob");

    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver.clone()),
    );
    let bob = Agent::with_transport(
        config("bob", bob_dir.path(), TrustPolicy::AutoAccept),
        bob_end.transport.clone(),
        Arc::new(resolver.clone()),
    );

    bob.block("*::relay.example").await.unwrap();

    alice
        .send("bob::relay.example", "spam", SendOptions::default())
        .await
        .unwrap();

    let received = bob.inbox(10).await.unwrap();
    assert!(received.is_empty());
    assert!(bob_end.sent_types().is_empty(), "no reply to a blocked sender");
    assert_eq!(trust_of(&bob, "alice::relay.example").await, None);

    // Unblocking restores delivery for fresh envelopes.
    assert!(bob.unblock("*::relay.example").await.unwrap());
    alice
        .send("bob::relay.example", "ham", SendOptions::default())
        .await
        .unwrap();
    let received = bob.inbox(10).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content, "ham");
}

#[tokio::test]
async fn pinned_key_mismatch_fails_send_before_emitting() {
    let alice_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let real_bob = Keypair::from_seed([7; 32]);
    let fake_bob = Keypair::from_seed([8; 32]);

    // Pin bob under his real key, with no relay info recorded.
    let book_path = alice_dir.path().join("contacts").join("book.db");
    {
        let book = ContactBook::open(&book_path).unwrap();
        book.add_contact(
            "bob::relay.example",
            &real_bob.public_key_b64(),
            None,
            TrustState::Unverified,
            None,
            None,
            None,
        )
        .unwrap();
        book.record_pin("bob::relay.example").unwrap();
    }

    // The resolver now reports a different key for bob.
    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());
    resolver.insert("bob::relay.example", fake_bob.public_key_b64());

    let (alice_end, _bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver),
    );

    let err = alice
        .send("bob::relay.example", "hello?", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UamProtocolError::KeyPinning { .. }));
    assert!(alice_end.sent_types().is_empty(), "nothing emitted on pin violation");
}

#[tokio::test]
async fn receipts_never_trigger_receipts() {
    let alice_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = Keypair::from_seed([9; 32]);

    let resolver = StaticResolver::default();
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, _bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver),
    );

    let receipt = MessageEnvelope::create(
        "bob::relay.example",
        "alice::relay.example",
        MessageType::ReceiptRead,
        br#"{"original_message_id":"m-1"}"#,
        &bob_kp,
        &alice_kp.verify_key(),
        EnvelopeOptions::default(),
    )
    .unwrap();
    alice_end.inject(receipt.to_wire());

    let received = alice.inbox(10).await.unwrap();
    assert!(received.is_empty());
    // Give any stray fire-and-forget task a chance to run, then check
    // nothing was emitted in response.
    tokio::task::yield_now().await;
    assert!(alice_end.sent_types().is_empty());
}

#[tokio::test]
async fn tampered_envelopes_drop_silently() {
    let alice_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = Keypair::from_seed([9; 32]);

    let resolver = StaticResolver::default();
    resolver.insert("bob::relay.example", bob_kp.public_key_b64());

    let (alice_end, _bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver),
    );

    let envelope = MessageEnvelope::create(
        "bob::relay.example",
        "alice::relay.example",
        MessageType::Message,
        b"genuine",
        &bob_kp,
        &alice_kp.verify_key(),
        EnvelopeOptions::default(),
    )
    .unwrap();
    let mut wire = envelope.to_wire();
    wire["payload"] = serde_json::json!("dGFtcGVyZWQ");
    alice_end.inject(wire);

    // Malformed junk in the same poll must not disturb it either.
    alice_end.inject(serde_json::json!({ "uam_version": "0.1" }));

    let received = alice.inbox(10).await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn registration_required_without_token() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(
        AgentConfig::new("alice", RELAY)
            .data_dir(dir.path())
            .auto_register(false),
    );
    let err = agent.connect().await.unwrap_err();
    assert!(matches!(err, UamProtocolError::Registration { .. }));
}

// ── Multi-relay failover (E7) ────────────────────────────────────────

/// Minimal HTTP server accepting POSTs with 200 OK, recording bodies.
async fn spawn_ok_relay() -> (String, Arc<Mutex<Vec<String>>>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bodies);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&buf[..end]).to_string();
                        let content_length = headers
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.trim()
                                    .eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        let mut body = buf[end + 4..].to_vec();
                        while body.len() < content_length {
                            let Ok(n) = socket.read(&mut chunk).await else {
                                return;
                            };
                            if n == 0 {
                                break;
                            }
                            body.extend_from_slice(&chunk[..n]);
                        }
                        sink.lock()
                            .unwrap()
                            .push(String::from_utf8_lossy(&body).to_string());
                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                            )
                            .await;
                        return;
                    }
                }
            });
        }
    });

    (base, bodies)
}

#[tokio::test]
async fn failover_tries_relays_in_order() {
    let alice_dir = tempfile::tempdir().unwrap();
    let alice_kp = identity(alice_dir.path(), "alice");
    let bob_kp = Keypair::from_seed([7; 32]);

    let (good_relay, bodies) = spawn_ok_relay().await;

    // Bob is pinned with two relays: a dead one first, then the live one.
    let book_path = alice_dir.path().join("contacts").join("book.db");
    {
        let book = ContactBook::open(&book_path).unwrap();
        book.add_contact(
            "bob::relay.example",
            &bob_kp.public_key_b64(),
            None,
            TrustState::Unverified,
            None,
            None,
            Some(&["http://127.0.0.1:1".to_string(), good_relay.clone()]),
        )
        .unwrap();
        book.record_pin("bob::relay.example").unwrap();
    }

    let resolver = StaticResolver::default();
    resolver.insert("alice::relay.example", alice_kp.public_key_b64());

    let (alice_end, _bob_end) = pipe_pair();
    let alice = Agent::with_transport(
        config("alice", alice_dir.path(), TrustPolicy::AutoAccept),
        alice_end.transport.clone(),
        Arc::new(resolver),
    );

    let message_id = alice
        .send("bob::relay.example", "failover hello", SendOptions::default())
        .await
        .unwrap();

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1, "exactly one relay accepted the envelope");
    let wire: Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(wire["message_id"].as_str().unwrap(), message_id);
    assert_eq!(wire["type"], "message");
    assert_eq!(wire["to"], "bob::relay.example");
}
