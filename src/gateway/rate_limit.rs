//! Fixed-window login rate limiting.
//!
//! Each client key gets `max_attempts` attempts per `window`, counted from the
//! key's first attempt. Rejected attempts do not extend or refill the window.
//! Windows live in a `DashMap`, so admitting one key only locks its shard.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::AuthError;
use crate::gateway::audit::{self, AuditEvent};

/// Attempt counter for one client key.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    attempts: u32,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The attempt is admitted and counted.
    Allowed,
    /// The attempt is rejected; the window resets after `retry_after`.
    Limited {
        /// Time left in the current window
        retry_after: Duration,
    },
}

/// Per-client fixed-window rate limiter.
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    max_attempts: u32,
    window: Duration,
    enabled: bool,
    trust_forwarded_headers: bool,
}

impl RateLimiter {
    /// Create a limiter admitting `max_attempts` per `window`.
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_attempts,
            window,
            enabled: true,
            trust_forwarded_headers: false,
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig, trust_forwarded_headers: bool) -> Self {
        Self {
            enabled: config.enabled,
            trust_forwarded_headers,
            ..Self::new(config.max_attempts, config.window)
        }
    }

    /// Check and count an attempt for `key`.
    pub fn check(&self, key: &str) -> Admission {
        self.check_at(key, Instant::now())
    }

    /// Whether an attempt for `key` is admitted.
    pub fn admit(&self, key: &str) -> bool {
        self.check(key) == Admission::Allowed
    }

    fn check_at(&self, key: &str, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allowed;
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(RateWindow {
            started: now,
            attempts: 0,
        });
        let window = entry.value_mut();

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.window {
            window.started = now;
            window.attempts = 0;
        }

        if window.attempts >= self.max_attempts {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(window.started));
            return Admission::Limited { retry_after };
        }

        window.attempts += 1;
        Admission::Allowed
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked client keys.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Client key for `request`: the forwarded client address when trusted,
    /// else the peer address.
    fn client_key(&self, request: &Request<Body>) -> String {
        if self.trust_forwarded_headers {
            let headers = request.headers();
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return addr.to_string();
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
    }
}

/// Periodically purge idle windows until shutdown.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = limiter.purge_idle();
                    if purged > 0 {
                        debug!(purged, "Purged idle rate windows");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Rate window sweeper shutting down");
                    break;
                }
            }
        }
    });
}

/// Rate limiting middleware for public authentication routes.
pub async fn limit_access(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = limiter.client_key(&request);

    match limiter.check(&client) {
        Admission::Allowed => next.run(request).await,
        Admission::Limited { retry_after } => {
            warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
            audit::emit(&AuditEvent::rate_limited(&client, request.uri().path()));
            AuthError::RateLimited { retry_after }.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_exactly_n_per_window() {
        // GIVEN: 5 attempts per minute
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let t0 = Instant::now();

        // WHEN: six attempts arrive inside the window
        let outcomes: Vec<Admission> = (0..6)
            .map(|i| limiter.check_at("10.0.0.1", t0 + Duration::from_secs(i)))
            .collect();

        // THEN: five pass, the sixth is limited with the remaining window
        assert!(outcomes[..5].iter().all(|a| *a == Admission::Allowed));
        assert_eq!(
            outcomes[5],
            Admission::Limited {
                retry_after: Duration::from_secs(55)
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_attempts_are_counted_exactly_once() {
        // GIVEN: 5 attempts per minute and 64 clients racing on one key
        const RACERS: usize = 64;
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));
        let start = Arc::new(tokio::sync::Barrier::new(RACERS));

        // WHEN: they all attempt at once
        let tasks: Vec<_> = (0..RACERS)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    limiter.admit("k")
                })
            })
            .collect();
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        // THEN: exactly five get through
        assert_eq!(admitted, 5);
        assert!(!limiter.admit("k"));
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(limiter.check_at("k", t0), Admission::Allowed);
        assert_eq!(limiter.check_at("k", t0), Admission::Allowed);
        assert!(matches!(
            limiter.check_at("k", t0 + Duration::from_secs(9)),
            Admission::Limited { .. }
        ));

        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(limiter.check_at("k", t1), Admission::Allowed);
        assert_eq!(limiter.check_at("k", t1), Admission::Allowed);
        assert!(matches!(limiter.check_at("k", t1), Admission::Limited { .. }));
    }

    #[test]
    fn rejected_attempts_are_not_counted() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();

        assert_eq!(limiter.check_at("k", t0), Admission::Allowed);
        for s in 1..10 {
            assert!(matches!(
                limiter.check_at("k", t0 + Duration::from_secs(s)),
                Admission::Limited { .. }
            ));
        }
        // The window still started at t0, so it resets at t0 + 10s
        assert_eq!(
            limiter.check_at("k", t0 + Duration::from_secs(10)),
            Admission::Allowed
        );
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.admit("a"));
        assert!(!limiter.admit("a"));
        assert!(limiter.admit("b"));
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let config = RateLimitConfig {
            enabled: false,
            max_attempts: 1,
            window: Duration::from_secs(60),
        };
        let limiter = RateLimiter::from_config(&config, false);
        assert!((0..10).all(|_| limiter.admit("k")));
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn purge_drops_only_elapsed_windows() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        limiter.check_at("old", t0);
        limiter.check_at("fresh", t0 + Duration::from_secs(50));

        assert_eq!(limiter.purge_idle_at(t0 + Duration::from_secs(70)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn client_key_prefers_forwarded_headers_only_when_trusted() {
        let request = || {
            Request::builder()
                .uri("/auth")
                .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
                .body(Body::empty())
                .unwrap()
        };

        let trusting = RateLimiter::from_config(&RateLimitConfig::default(), true);
        assert_eq!(trusting.client_key(&request()), "203.0.113.7");

        let strict = RateLimiter::from_config(&RateLimitConfig::default(), false);
        assert_eq!(strict.client_key(&request()), "unknown");

        let mut with_peer = request();
        with_peer
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(strict.client_key(&with_peer), "192.0.2.1");
    }
}
