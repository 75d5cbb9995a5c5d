//! Per-user, per-cluster cache of short-lived upstream credentials.
//!
//! A live entry is served without any network call. On a miss exactly one
//! caller starts a mint; every concurrent caller for the same
//! `(user, cluster)` key awaits that same in-flight mint and observes the same
//! result. Different keys never wait on each other.
//!
//! Mints run on their own task, so a caller that gives up (client disconnect,
//! request timeout) never cancels a mint other callers are waiting on, and
//! never leaves the in-flight registry behind.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::AuthError;

/// Credential material for a remote cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamCredential {
    /// Bearer token presented to the remote API
    pub token: String,
    /// When the remote API stops accepting the token
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Cached credential with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedUpstreamCredential {
    /// User the credential impersonates
    pub user_id: String,
    /// Target cluster
    pub cluster_id: String,
    /// Credential material
    pub credential: UpstreamCredential,
    /// When the credential was minted
    pub obtained_at: DateTime<Utc>,
    /// When the cache stops serving it: `min(credential expiry, obtained_at + max_ttl)`
    pub expires_at: DateTime<Utc>,
}

impl CachedUpstreamCredential {
    fn is_fresh(&self, now: DateTime<Utc>, refresh_margin: Duration) -> bool {
        add_std(now, refresh_margin) < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    user_id: String,
    cluster_id: String,
}

impl CacheKey {
    fn new(user_id: &str, cluster_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            cluster_id: cluster_id.to_string(),
        }
    }
}

type MintOutcome = Result<UpstreamCredential, AuthError>;
type InflightMint = Shared<BoxFuture<'static, MintOutcome>>;

/// A registered in-flight mint. `id` tells this mint apart from any later
/// mint for the same key.
struct InflightSlot {
    id: u64,
    mint: InflightMint,
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    mints: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Requests served from a live entry
    pub hits: u64,
    /// Requests that found no live entry and started a mint
    pub misses: u64,
    /// Mints that produced a credential
    pub mints: u64,
    /// Entries removed because they expired or their user logged out
    pub evictions: u64,
    /// Entries currently cached
    pub size: usize,
    /// Mints currently in flight
    pub inflight: usize,
}

struct CacheInner {
    entries: DashMap<CacheKey, CachedUpstreamCredential>,
    inflight: DashMap<CacheKey, InflightSlot>,
    next_mint_id: AtomicU64,
    max_ttl: Duration,
    refresh_margin: Duration,
    mint_timeout: Duration,
    stats: CacheStats,
}

/// Single-flight credential cache. Cloning shares the cache.
#[derive(Clone)]
pub struct UpstreamCredentialCache {
    inner: Arc<CacheInner>,
}

impl UpstreamCredentialCache {
    /// Create a cache.
    #[must_use]
    pub fn new(max_ttl: Duration, refresh_margin: Duration, mint_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                next_mint_id: AtomicU64::new(0),
                max_ttl,
                refresh_margin,
                mint_timeout,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.max_ttl, config.refresh_margin, config.mint_timeout)
    }

    /// Credential for `user_id` on `cluster_id`, minting with `mint` on a miss.
    ///
    /// `mint` is only invoked by the caller that starts a mint; callers joining
    /// an in-flight mint drop theirs unused.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MintFailed`] if the mint fails, times out, panics
    /// or yields an already expired credential. Every caller waiting on that
    /// mint receives the same error; nothing is cached.
    pub async fn get<F, Fut, E>(
        &self,
        user_id: &str,
        cluster_id: &str,
        mint: F,
    ) -> Result<UpstreamCredential, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UpstreamCredential, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = CacheKey::new(user_id, cluster_id);

        if let Some(credential) = self.inner.live(&key) {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(credential);
        }

        let slot = match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                debug!(user = %user_id, cluster = %cluster_id, "Joining in-flight mint");
                slot.get().mint.clone()
            }
            Entry::Vacant(vacant) => {
                // A mint may have completed between the first lookup and taking the slot
                if let Some(credential) = self.inner.live(&key) {
                    self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(credential);
                }
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(user = %user_id, cluster = %cluster_id, "Minting upstream credential");
                let id = self.inner.next_mint_id.fetch_add(1, Ordering::Relaxed);
                let slot = self.start_mint(key.clone(), id, mint());
                vacant.insert(InflightSlot {
                    id,
                    mint: slot.clone(),
                });
                slot
            }
        };

        slot.await
    }

    fn start_mint<Fut, E>(&self, key: CacheKey, id: u64, mint: Fut) -> InflightMint
    where
        Fut: Future<Output = Result<UpstreamCredential, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(inner.mint_timeout, mint).await {
                Ok(Ok(credential)) => inner.store(&task_key, credential),
                Ok(Err(e)) => Err(AuthError::MintFailed(e.to_string())),
                Err(_) => Err(AuthError::MintFailed(format!(
                    "mint timed out after {:?}",
                    inner.mint_timeout
                ))),
            };
            if let Err(e) = &outcome {
                warn!(
                    user = %task_key.user_id,
                    cluster = %task_key.cluster_id,
                    error = %e,
                    "Upstream credential mint failed"
                );
            }
            inner.retire(&task_key, id);
            outcome
        });

        let inner = Arc::clone(&self.inner);
        async move {
            task.await.unwrap_or_else(|e| {
                inner.retire(&key, id);
                Err(AuthError::MintFailed(format!("mint task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Drop every cached credential for `user_id`. In-flight mints are left
    /// alone. Returns how many entries were removed.
    pub fn evict_user(&self, user_id: &str) -> usize {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|key, _| key.user_id != user_id);
        let removed = before.saturating_sub(self.inner.entries.len());
        self.inner.record_evictions(removed);
        removed
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let margin = self.inner.refresh_margin;
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.is_fresh(now, margin));
        let removed = before.saturating_sub(self.inner.entries.len());
        self.inner.record_evictions(removed);
        removed
    }

    /// Cached entry for `(user_id, cluster_id)`, live or not.
    #[must_use]
    pub fn peek(&self, user_id: &str, cluster_id: &str) -> Option<CachedUpstreamCredential> {
        self.inner
            .entries
            .get(&CacheKey::new(user_id, cluster_id))
            .map(|e| e.value().clone())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let stats = &self.inner.stats;
        CacheStatsSnapshot {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            mints: stats.mints.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            size: self.inner.entries.len(),
            inflight: self.inner.inflight.len(),
        }
    }
}

impl CacheInner {
    /// Unregister mint `id` for `key`. A newer mint registered under the same
    /// key is left in place.
    fn retire(&self, key: &CacheKey, id: u64) -> bool {
        self.inflight
            .remove_if(key, |_, slot| slot.id == id)
            .is_some()
    }

    /// Live credential for `key`; an expired entry is evicted on the way.
    fn live(&self, key: &CacheKey) -> Option<UpstreamCredential> {
        let now = Utc::now();
        let entry = self.entries.get(key)?;
        if entry.is_fresh(now, self.refresh_margin) {
            return Some(entry.credential.clone());
        }
        drop(entry);

        if self
            .entries
            .remove_if(key, |_, e| !e.is_fresh(now, self.refresh_margin))
            .is_some()
        {
            self.record_evictions(1);
        }
        None
    }

    fn store(&self, key: &CacheKey, credential: UpstreamCredential) -> MintOutcome {
        let obtained_at = Utc::now();
        if credential.expires_at <= obtained_at {
            return Err(AuthError::MintFailed(
                "minted credential is already expired".to_string(),
            ));
        }

        let expires_at = credential.expires_at.min(add_std(obtained_at, self.max_ttl));
        self.entries.insert(
            key.clone(),
            CachedUpstreamCredential {
                user_id: key.user_id.clone(),
                cluster_id: key.cluster_id.clone(),
                credential: credential.clone(),
                obtained_at,
                expires_at,
            },
        );
        self.stats.mints.fetch_add(1, Ordering::Relaxed);
        Ok(credential)
    }

    fn record_evictions(&self, count: usize) {
        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }
}

fn add_std(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Periodically sweep expired entries until shutdown.
pub fn spawn_sweeper(
    cache: UpstreamCredentialCache,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = cache.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "Swept expired upstream credentials");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Upstream credential sweeper shutting down");
                    break;
                }
            }
        }
    });
}
