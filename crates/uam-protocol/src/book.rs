use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::address::Address;
use crate::error::UamProtocolError;
use crate::types::{now_iso, TrustState};

/// A row in the contact book.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub address: String,
    pub public_key: String,
    pub display_name: Option<String>,
    pub trust_state: TrustState,
    pub trust_source: Option<String>,
    pub relay: Option<String>,
    pub relays: Vec<String>,
    pub pinned_at: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

/// A queued inbound handshake awaiting local approval.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHandshake {
    pub address: String,
    pub contact_card: Value,
    pub received_at: String,
}

/// Durable local trust store: contacts, pending handshakes, and block
/// patterns, with in-memory caches for O(1) `is_known` / `is_blocked`.
///
/// TOFU is enforced here: once a contact is `pinned` or `verified`, a
/// write with a different public key is rejected with `KeyPinning` —
/// never silently overwritten. Cache updates happen under the same
/// critical section as the corresponding durable write.
pub struct ContactBook {
    inner: Mutex<Inner>,
}

struct Inner {
    conn: Connection,
    known: HashSet<String>,
    blocked_exact: HashSet<String>,
    blocked_domains: HashSet<String>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contacts (
    address      TEXT PRIMARY KEY,
    public_key   TEXT NOT NULL,
    display_name TEXT,
    trust_state  TEXT NOT NULL,
    trust_source TEXT,
    relay        TEXT,
    relays_json  TEXT,
    pinned_at    TEXT,
    first_seen   TEXT NOT NULL,
    last_seen    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pending_handshakes (
    address      TEXT PRIMARY KEY,
    contact_card TEXT NOT NULL,
    received_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS blocked_patterns (
    pattern    TEXT PRIMARY KEY,
    blocked_at TEXT NOT NULL
);
";

impl ContactBook {
    /// Open (creating if needed) the contact book at `path` and load
    /// the address and block-pattern caches.
    pub fn open(path: &Path) -> Result<Self, UamProtocolError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UamProtocolError::Keystore(e.to_string()))?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// An in-memory book, for tests and ephemeral agents.
    pub fn in_memory() -> Result<Self, UamProtocolError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, UamProtocolError> {
        conn.execute_batch(SCHEMA)?;

        let mut known = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT address FROM contacts")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                known.insert(row?);
            }
        }

        let mut blocked_exact = HashSet::new();
        let mut blocked_domains = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT pattern FROM blocked_patterns")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                cache_pattern(&row?, &mut blocked_exact, &mut blocked_domains);
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                known,
                blocked_exact,
                blocked_domains,
            }),
        })
    }

    // ── Contacts ─────────────────────────────────────────────────────

    /// Insert or update a contact.
    ///
    /// Updates `public_key`, `trust_state`, and `last_seen`;
    /// `display_name`, `trust_source`, `relay`, and `relays` coalesce —
    /// a `None` never erases a previously stored value. `pinned_at` and
    /// `first_seen` are preserved across updates.
    #[allow(clippy::too_many_arguments)]
    pub fn add_contact(
        &self,
        address: &str,
        public_key: &str,
        display_name: Option<&str>,
        trust_state: TrustState,
        trust_source: Option<&str>,
        relay: Option<&str>,
        relays: Option<&[String]>,
    ) -> Result<(), UamProtocolError> {
        let mut inner = self.inner.lock().expect("book lock poisoned");

        let existing: Option<(String, String)> = inner
            .conn
            .query_row(
                "SELECT public_key, trust_state FROM contacts WHERE address = ?1",
                params![address],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((stored_key, stored_state)) = existing {
            let stored_state: TrustState = stored_state.parse()?;
            if stored_state.is_locked() && stored_key != public_key {
                return Err(UamProtocolError::KeyPinning {
                    address: address.to_string(),
                });
            }
        }

        let relays_json = relays
            .map(serde_json::to_string)
            .transpose()?;
        let now = now_iso();
        inner.conn.execute(
            "INSERT INTO contacts
                 (address, public_key, display_name, trust_state, trust_source,
                  relay, relays_json, pinned_at, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?8)
             ON CONFLICT(address) DO UPDATE SET
                 public_key   = excluded.public_key,
                 display_name = COALESCE(excluded.display_name, contacts.display_name),
                 trust_state  = excluded.trust_state,
                 trust_source = COALESCE(excluded.trust_source, contacts.trust_source),
                 relay        = COALESCE(excluded.relay, contacts.relay),
                 relays_json  = COALESCE(excluded.relays_json, contacts.relays_json),
                 last_seen    = excluded.last_seen",
            params![
                address,
                public_key,
                display_name,
                trust_state.as_str(),
                trust_source,
                relay,
                relays_json,
                now,
            ],
        )?;
        inner.known.insert(address.to_string());
        Ok(())
    }

    /// Fetch one contact.
    pub fn get_contact(&self, address: &str) -> Result<Option<Contact>, UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let contact = inner
            .conn
            .query_row(
                "SELECT address, public_key, display_name, trust_state, trust_source,
                        relay, relays_json, pinned_at, first_seen, last_seen
                 FROM contacts WHERE address = ?1",
                params![address],
                row_to_contact,
            )
            .optional()?;
        contact.map(finish_contact).transpose()
    }

    /// All contacts, ordered by address.
    pub fn contacts(&self) -> Result<Vec<Contact>, UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT address, public_key, display_name, trust_state, trust_source,
                    relay, relays_json, pinned_at, first_seen, last_seen
             FROM contacts ORDER BY address",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(finish_contact(row?)?);
        }
        Ok(contacts)
    }

    /// Update a contact's trust state.
    pub fn set_trust_state(
        &self,
        address: &str,
        state: TrustState,
    ) -> Result<(), UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        inner.conn.execute(
            "UPDATE contacts SET trust_state = ?2, last_seen = ?3 WHERE address = ?1",
            params![address, state.as_str(), now_iso()],
        )?;
        Ok(())
    }

    /// TOFU lock: mark `pinned` and stamp `pinned_at` once. A second
    /// pin keeps the original timestamp.
    pub fn record_pin(&self, address: &str) -> Result<(), UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let now = now_iso();
        inner.conn.execute(
            "UPDATE contacts
             SET trust_state = 'pinned',
                 pinned_at   = COALESCE(pinned_at, ?2),
                 last_seen   = ?2
             WHERE address = ?1",
            params![address, now],
        )?;
        Ok(())
    }

    /// O(1) membership check against the in-memory cache.
    pub fn is_known(&self, address: &str) -> bool {
        self.inner
            .lock()
            .expect("book lock poisoned")
            .known
            .contains(address)
    }

    // ── Pending handshakes ───────────────────────────────────────────

    /// Queue an inbound handshake for local approval.
    pub fn add_pending(&self, address: &str, card: &Value) -> Result<(), UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        inner.conn.execute(
            "INSERT OR REPLACE INTO pending_handshakes (address, contact_card, received_at)
             VALUES (?1, ?2, ?3)",
            params![address, serde_json::to_string(card)?, now_iso()],
        )?;
        Ok(())
    }

    /// One pending entry, if present.
    pub fn get_pending(&self, address: &str) -> Result<Option<PendingHandshake>, UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let row: Option<(String, String, String)> = inner
            .conn
            .query_row(
                "SELECT address, contact_card, received_at
                 FROM pending_handshakes WHERE address = ?1",
                params![address],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(row_to_pending).transpose()
    }

    /// All pending entries, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingHandshake>, UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT address, contact_card, received_at
             FROM pending_handshakes ORDER BY received_at",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        let mut pending = Vec::new();
        for row in rows {
            pending.push(row_to_pending(row?)?);
        }
        Ok(pending)
    }

    /// Drop a pending entry. Returns whether it existed.
    pub fn remove_pending(&self, address: &str) -> Result<bool, UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let changed = inner.conn.execute(
            "DELETE FROM pending_handshakes WHERE address = ?1",
            params![address],
        )?;
        Ok(changed > 0)
    }

    /// Pending entries older than `days` — candidates for the sweep.
    pub fn expired_pending(&self, days: i64) -> Result<Vec<PendingHandshake>, UamProtocolError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let inner = self.inner.lock().expect("book lock poisoned");
        let mut stmt = inner.conn.prepare(
            "SELECT address, contact_card, received_at
             FROM pending_handshakes WHERE received_at < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut expired = Vec::new();
        for row in rows {
            expired.push(row_to_pending(row?)?);
        }
        Ok(expired)
    }

    // ── Block patterns ───────────────────────────────────────────────

    /// Block an exact `agent::domain` or a `*::domain` wildcard.
    pub fn block(&self, pattern: &str) -> Result<(), UamProtocolError> {
        let normalized = normalize_pattern(pattern)?;
        let mut inner = self.inner.lock().expect("book lock poisoned");
        let inner = &mut *inner;
        inner.conn.execute(
            "INSERT OR REPLACE INTO blocked_patterns (pattern, blocked_at) VALUES (?1, ?2)",
            params![normalized, now_iso()],
        )?;
        cache_pattern(&normalized, &mut inner.blocked_exact, &mut inner.blocked_domains);
        Ok(())
    }

    /// Remove a block pattern. Returns whether it existed.
    pub fn unblock(&self, pattern: &str) -> Result<bool, UamProtocolError> {
        let normalized = normalize_pattern(pattern)?;
        let mut inner = self.inner.lock().expect("book lock poisoned");
        let changed = inner.conn.execute(
            "DELETE FROM blocked_patterns WHERE pattern = ?1",
            params![normalized],
        )?;
        if let Some(domain) = normalized.strip_prefix("*::") {
            inner.blocked_domains.remove(domain);
        } else {
            inner.blocked_exact.remove(&normalized);
        }
        Ok(changed > 0)
    }

    /// All block patterns.
    pub fn blocked_patterns(&self) -> Result<Vec<String>, UamProtocolError> {
        let inner = self.inner.lock().expect("book lock poisoned");
        let mut stmt = inner
            .conn
            .prepare("SELECT pattern FROM blocked_patterns ORDER BY pattern")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut patterns = Vec::new();
        for row in rows {
            patterns.push(row?);
        }
        Ok(patterns)
    }

    /// Exact-pattern membership first, then domain wildcard.
    pub fn is_blocked(&self, address: &str) -> bool {
        let inner = self.inner.lock().expect("book lock poisoned");
        if inner.blocked_exact.contains(address) {
            return true;
        }
        match address.split_once("::") {
            Some((_, domain)) => inner.blocked_domains.contains(domain),
            None => false,
        }
    }
}

/// Validate and lowercase a block pattern.
fn normalize_pattern(pattern: &str) -> Result<String, UamProtocolError> {
    let pattern = pattern.trim().to_ascii_lowercase();
    if let Some(domain) = pattern.strip_prefix("*::") {
        // Reuse the address grammar for the domain half.
        Address::parse(&format!("a::{domain}"))?;
        return Ok(pattern);
    }
    Ok(Address::parse(&pattern)?.full())
}

fn cache_pattern(pattern: &str, exact: &mut HashSet<String>, domains: &mut HashSet<String>) {
    if let Some(domain) = pattern.strip_prefix("*::") {
        domains.insert(domain.to_string());
    } else {
        exact.insert(pattern.to_string());
    }
}

type ContactRow = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn finish_contact(row: ContactRow) -> Result<Contact, UamProtocolError> {
    let (
        address,
        public_key,
        display_name,
        trust_state,
        trust_source,
        relay,
        relays_json,
        pinned_at,
        first_seen,
        last_seen,
    ) = row;
    let relays = match relays_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(Contact {
        address,
        public_key,
        display_name,
        trust_state: trust_state.parse()?,
        trust_source,
        relay,
        relays,
        pinned_at,
        first_seen,
        last_seen,
    })
}

fn row_to_pending(row: (String, String, String)) -> Result<PendingHandshake, UamProtocolError> {
    let (address, card, received_at) = row;
    Ok(PendingHandshake {
        address,
        contact_card: serde_json::from_str(&card)?,
        received_at,
    })
}

#[cfg(test)]
impl ContactBook {
    /// Rewind a pending entry's timestamp for sweep tests.
    pub(crate) fn backdate_pending(
        &self,
        address: &str,
        days: i64,
    ) -> Result<(), UamProtocolError> {
        let backdated = (chrono::Utc::now() - chrono::Duration::days(days))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let inner = self.inner.lock().expect("book lock poisoned");
        inner.conn.execute(
            "UPDATE pending_handshakes SET received_at = ?2 WHERE address = ?1",
            params![address, backdated],
        )?;
        Ok(())
    }
}
