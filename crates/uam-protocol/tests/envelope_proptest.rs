use proptest::prelude::*;
use serde_json::{json, Value};
use uam_protocol::canonical::canonicalize;
use uam_protocol::envelope::{EnvelopeOptions, MessageEnvelope};
use uam_protocol::{Address, Keypair, MessageType, MAX_ENVELOPE_SIZE};

fn keypair(seed: u8) -> Keypair {
    Keypair::from_seed([seed; 32])
}

// ── Strategies ───────────────────────────────────────────────────────

/// A syntactically valid agent name.
fn arb_agent() -> impl Strategy<Value = String> {
    "[a-z0-9]([a-z0-9_-]{0,10}[a-z0-9])?"
}

/// A syntactically valid domain.
fn arb_domain() -> impl Strategy<Value = String> {
    "[a-z0-9]([a-z0-9.-]{0,10}[a-z0-9])?"
}

/// Scalar-leaf JSON objects with printable ASCII and unicode strings.
fn arb_metadata() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,20}".prop_map(Value::from),
        "\\PC{0,8}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::hash_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    /// parse(render(a)) == a, and parsing lowercases.
    #[test]
    fn address_parse_render_roundtrip(agent in arb_agent(), domain in arb_domain()) {
        let raw = format!("{agent}::{domain}");
        let address = Address::parse(&raw).unwrap();
        prop_assert_eq!(address.full(), raw.clone());

        let reparsed = Address::parse(&address.full()).unwrap();
        prop_assert_eq!(&address, &reparsed);

        let shouted = raw.to_ascii_uppercase();
        let lowered = Address::parse(&shouted).unwrap();
        prop_assert_eq!(lowered, address);
    }

    /// Canonicalization is deterministic, ASCII-only, and a fixpoint:
    /// re-parsing its own output and canonicalizing again changes nothing.
    #[test]
    fn canonicalize_fixpoint(value in arb_metadata()) {
        let first = canonicalize(&value);
        prop_assert_eq!(&first, &canonicalize(&value));
        prop_assert!(first.is_ascii());

        let reparsed: Value = serde_json::from_slice(&first).unwrap();
        prop_assert_eq!(first, canonicalize(&reparsed));
    }

    /// Null-valued entries never affect the canonical bytes.
    #[test]
    fn canonicalize_ignores_null_entries(
        value in arb_metadata(),
        null_key in "[a-z_]{1,8}",
    ) {
        let base = json!({ "payload": value });
        let mut with_null = base.clone();
        with_null
            .as_object_mut()
            .unwrap()
            .insert(null_key, Value::Null);
        prop_assert_eq!(canonicalize(&base), canonicalize(&with_null));
    }

    /// Created envelopes verify, decrypt to the original plaintext, and
    /// respect the wire size cap.
    #[test]
    fn envelope_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..2000),
        thread_id in prop::option::of("[a-z0-9-]{1,16}"),
        metadata in prop::option::of(arb_metadata()),
    ) {
        let alice = keypair(1);
        let bob = keypair(2);

        let envelope = MessageEnvelope::create(
            "alice::relay.example",
            "bob::relay.example",
            MessageType::Message,
            &payload,
            &alice,
            &bob.verify_key(),
            EnvelopeOptions { thread_id, metadata, ..Default::default() },
        )
        .unwrap();

        envelope.verify(&alice.verify_key()).unwrap();
        prop_assert_eq!(envelope.decrypt(&bob, &alice.verify_key()).unwrap(), payload);
        prop_assert!(envelope.wire_size() <= MAX_ENVELOPE_SIZE);

        let decoded = MessageEnvelope::from_wire(&envelope.to_wire()).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    /// Any change to a signed field must break verification.
    #[test]
    fn signature_sensitive_to_signed_fields(
        field in 0..5usize,
        payload in prop::collection::vec(any::<u8>(), 1..256),
    ) {
        let alice = keypair(1);
        let bob = keypair(2);

        let mut envelope = MessageEnvelope::create(
            "alice::relay.example",
            "bob::relay.example",
            MessageType::Message,
            &payload,
            &alice,
            &bob.verify_key(),
            EnvelopeOptions::default(),
        )
        .unwrap();
        envelope.verify(&alice.verify_key()).unwrap();

        match field {
            0 => envelope.message_id.push('0'),
            1 => envelope.timestamp = "2020-01-01T00:00:00.000Z".into(),
            2 => envelope.nonce.push('A'),
            3 => envelope.payload.push('A'),
            _ => envelope.msg_type = MessageType::ReceiptRead,
        }
        prop_assert!(envelope.verify(&alice.verify_key()).is_err());
    }
}
