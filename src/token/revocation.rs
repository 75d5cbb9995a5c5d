//! Revocation list for logged-out session tokens.
//!
//! Session tokens are self-contained, so logging out cannot destroy one. The
//! list records revoked token ids until the token would have expired anyway;
//! after that the entry carries no information and is reaped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

/// Denylist of revoked token ids, each kept until its token's expiry.
#[derive(Default)]
pub struct RevocationList {
    /// Token id → expiry of the revoked token
    entries: DashMap<String, DateTime<Utc>>,
}

impl RevocationList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke `token_id` until `expires_at`.
    pub fn revoke(&self, token_id: &str, expires_at: DateTime<Utc>) {
        if expires_at > Utc::now() {
            self.entries.insert(token_id.to_string(), expires_at);
        }
    }

    /// Whether `token_id` has been revoked and has not yet expired.
    #[must_use]
    pub fn is_revoked(&self, token_id: &str) -> bool {
        let Some(expires_at) = self.entries.get(token_id).map(|e| *e.value()) else {
            return false;
        };

        if expires_at <= Utc::now() {
            // Lazy eviction: the token is dead regardless
            self.entries.remove(token_id);
            return false;
        }
        true
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries whose token has expired.
    pub fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

/// Spawn a background task that reaps expired revocations every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    list: Arc<RevocationList>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = list.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired revocations");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Revocation reaper shutting down");
                    break;
                }
            }
        }
    });
}
