//! Reliable-delivery pending map (spec.md §4.2).
//!
//! Every outbound payload is buffered here until ACK'd or retried past
//! `MAX_RETRIES`. The map itself is a plain `RwLock<HashMap<..>>` with short
//! critical sections — the retry sweep snapshots due entries, releases the
//! lock, writes to the socket, then re-acquires only to bump attempt counts.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct PendingSend {
    pub client_id: String,
    pub payload: String,
    pub attempts: u32,
    pub next_retry_at: Instant,
}

pub struct PendingMap {
    entries: RwLock<HashMap<String, PendingSend>>,
    ack_timeout: Duration,
    max_retries: u32,
}

/// A snapshot of one entry due for retransmission.
pub struct DueEntry {
    pub message_id: String,
    pub client_id: String,
    pub payload: String,
}

impl PendingMap {
    pub fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ack_timeout,
            max_retries,
        }
    }

    pub async fn insert(&self, message_id: String, client_id: String, payload: String) {
        let entry = PendingSend {
            client_id,
            payload,
            attempts: 1,
            next_retry_at: Instant::now() + self.ack_timeout,
        };
        self.entries.write().await.insert(message_id, entry);
    }

    /// ACKs are idempotent; an unknown `message_id` is a no-op (P4, §4.2).
    pub async fn acknowledge(&self, message_id: &str) -> bool {
        self.entries.write().await.remove(message_id).is_some()
    }

    /// Snapshot entries whose retry deadline has passed, without holding the
    /// lock across the caller's socket write.
    pub async fn due_for_retry(&self, now: Instant) -> Vec<DueEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, entry)| entry.next_retry_at <= now)
            .map(|(message_id, entry)| DueEntry {
                message_id: message_id.clone(),
                client_id: entry.client_id.clone(),
                payload: entry.payload.clone(),
            })
            .collect()
    }

    /// Record a retransmit attempt. Returns `false` (and drops the entry)
    /// once `MAX_RETRIES` is exceeded, satisfying P4's "dropped after
    /// MAX_RETRIES" clause.
    pub async fn record_attempt(&self, message_id: &str, now: Instant) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(message_id) else {
            return false;
        };

        if entry.attempts >= self.max_retries {
            entries.remove(message_id);
            return false;
        }

        entry.attempts += 1;
        entry.next_retry_at = now + self.ack_timeout;
        true
    }

    /// Purge all entries for a disconnected client — it will resync via the
    /// protocol on reconnect rather than receive stale retransmits.
    pub async fn purge_for_client(&self, client_id: &str) {
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.client_id != client_id);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
