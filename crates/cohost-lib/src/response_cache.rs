//! Response cache: TTL map from (context, message) to a cleaned reply.
//!
//! In-memory only. Expired entries read as misses even before they are
//! swept.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cohost_core::types::{Role, Turn};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// Hex SHA-256 over the canonical form of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseKey(String);

impl ResponseKey {
    /// Derive the key for `context` followed by `speaker: message`.
    ///
    /// Byte-exact: case and whitespace differences produce different keys.
    /// Timestamps and tags are not part of the prompt, so they are ignored.
    pub fn derive(context: &[Turn], speaker: &str, message: &str) -> Self {
        let mut hasher = Sha256::new();
        for turn in context {
            let role = match turn.role() {
                Role::User => "u",
                Role::Assistant => "a",
            };
            hasher.update(role.as_bytes());
            hasher.update([0x1f]);
            hasher.update(turn.speaker().as_bytes());
            hasher.update([0x1f]);
            hasher.update(turn.text().as_bytes());
            hasher.update([0x1e]);
        }
        hasher.update([0x1d]);
        hasher.update(speaker.as_bytes());
        hasher.update([0x1f]);
        hasher.update(message.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12])
    }
}

struct Entry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// TTL-keyed reply store.
pub struct ResponseCache {
    entries: Mutex<HashMap<ResponseKey, Entry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Live value for `key`, or `None` on miss or expiry.
    pub fn get(&self, key: &ResponseKey) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store `value` for `ttl`. A live entry is never overwritten; returns
    /// whether the value was stored.
    pub fn put(&self, key: ResponseKey, value: String, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| !e.is_expired(now));
        if entries.contains_key(&key) {
            return false;
        }
        debug!(key = %key, ?ttl, "response cached");
        entries.insert(
            key,
            Entry {
                value,
                created_at: now,
                ttl,
            },
        );
        true
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
