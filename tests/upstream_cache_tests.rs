//! Upstream credential cache concurrency tests
//!
//! - Single-flight minting under concurrent misses
//! - Shared failures and retry after failure
//! - Expiry forcing a fresh mint
//! - Independent keys never blocking each other

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use authgate::error::AuthError;
use authgate::upstream::{UpstreamCredential, UpstreamCredentialCache};
use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use pretty_assertions::assert_eq;

const CONCURRENCY: usize = 16;

fn cache() -> UpstreamCredentialCache {
    UpstreamCredentialCache::new(
        Duration::from_secs(900),
        Duration::ZERO,
        Duration::from_secs(5),
    )
}

fn credential(token: String, lifetime: TimeDelta) -> UpstreamCredential {
    UpstreamCredential {
        token,
        expires_at: Utc::now() + lifetime,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_mint() {
    // GIVEN: an empty cache and a slow minter
    let cache = cache();
    let mints = Arc::new(AtomicUsize::new(0));

    // WHEN: many callers ask for the same key at once
    let tasks = (0..CONCURRENCY).map(|_| {
        let cache = cache.clone();
        let mints = Arc::clone(&mints);
        tokio::spawn(async move {
            cache
                .get("alice", "prod", move || async move {
                    let n = mints.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, String>(credential(format!("token-{n}"), TimeDelta::hours(1)))
                })
                .await
        })
    });
    let results = join_all(tasks).await;

    // THEN: exactly one mint ran and everyone got its credential
    assert_eq!(mints.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap().unwrap().token, "token-0");
    }
    let stats = cache.stats();
    assert_eq!(stats.mints, 1);
    assert_eq!(stats.inflight, 0);
    assert_eq!(stats.size, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_is_shared_and_not_cached() {
    // GIVEN: a minter that fails slowly
    let cache = cache();
    let mints = Arc::new(AtomicUsize::new(0));

    // WHEN: many callers miss at once
    let tasks = (0..CONCURRENCY).map(|_| {
        let cache = cache.clone();
        let mints = Arc::clone(&mints);
        tokio::spawn(async move {
            cache
                .get("alice", "prod", move || async move {
                    mints.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Err::<UpstreamCredential, _>("cluster API returned HTTP 500")
                })
                .await
        })
    });
    let results = join_all(tasks).await;

    // THEN: one mint, one identical failure for all, nothing cached
    assert_eq!(mints.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(
            result.unwrap(),
            Err(AuthError::MintFailed(
                "cluster API returned HTTP 500".to_string()
            ))
        );
    }
    assert_eq!(cache.stats().size, 0);
    assert_eq!(cache.stats().inflight, 0);

    // AND: the next call retries
    let retried = cache
        .get("alice", "prod", || async {
            Ok::<_, String>(credential("recovered".to_string(), TimeDelta::hours(1)))
        })
        .await
        .unwrap();
    assert_eq!(retried.token, "recovered");
}

#[tokio::test]
async fn expired_entry_is_never_returned() {
    // GIVEN: a credential living 300ms
    let cache = cache();
    let mints = Arc::new(AtomicUsize::new(0));
    let get = || {
        let mints = Arc::clone(&mints);
        cache.get("alice", "prod", move || async move {
            let n = mints.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(credential(format!("token-{n}"), TimeDelta::milliseconds(300)))
        })
    };

    let first = get().await.unwrap();
    let cached = get().await.unwrap();
    assert_eq!(first, cached);

    // WHEN: it expires
    tokio::time::sleep(Duration::from_millis(400)).await;

    // THEN: the next get mints again instead of serving the stale entry
    let fresh = get().await.unwrap();
    assert_eq!(fresh.token, "token-1");
    assert!(fresh.expires_at > Utc::now());
    assert_eq!(mints.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_do_not_wait_on_each_other() {
    let cache = cache();

    // GIVEN: a slow mint in flight for alice
    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get("alice", "prod", || async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<_, String>(credential("alice".to_string(), TimeDelta::hours(1)))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // WHEN: bob asks for his own credential
    let bob = tokio::time::timeout(
        Duration::from_millis(500),
        cache.get("bob", "prod", || async {
            Ok::<_, String>(credential("bob".to_string(), TimeDelta::hours(1)))
        }),
    )
    .await;

    // THEN: bob is served immediately
    assert_eq!(bob.unwrap().unwrap().token, "bob");
    assert_eq!(slow.await.unwrap().unwrap().token, "alice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_caller_does_not_cancel_the_mint() {
    let cache = cache();

    // GIVEN: a caller that gives up before the mint finishes
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        cache.get("alice", "prod", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, String>(credential("minted".to_string(), TimeDelta::hours(1)))
        }),
    )
    .await;
    assert!(abandoned.is_err());

    // WHEN: the mint completes in the background
    tokio::time::sleep(Duration::from_millis(300)).await;

    // THEN: its result was cached and the registry is clean
    let stats = cache.stats();
    assert_eq!(stats.inflight, 0);
    assert_eq!(stats.size, 1);
    let served = cache
        .get("alice", "prod", || async {
            Err::<UpstreamCredential, _>("must not mint again")
        })
        .await
        .unwrap();
    assert_eq!(served.token, "minted");
}

#[tokio::test]
async fn logout_eviction_forces_a_new_mint() {
    let cache = cache();
    cache
        .get("alice", "prod", || async {
            Ok::<_, String>(credential("before".to_string(), TimeDelta::hours(1)))
        })
        .await
        .unwrap();

    assert_eq!(cache.evict_user("alice"), 1);

    let after = cache
        .get("alice", "prod", || async {
            Ok::<_, String>(credential("after".to_string(), TimeDelta::hours(1)))
        })
        .await
        .unwrap();
    assert_eq!(after.token, "after");
}
