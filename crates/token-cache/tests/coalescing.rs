//! Request coalescing tests for `TokenCache` under a multi-threaded runtime.
//!
//! Every test here asserts on exact resolver call counts, which is only
//! meaningful if all callers for a key join the same round.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use token_cache::{
    ResolveError, TokenCache,
    testutil::{CountingResolver, sample_token},
};
use tokio::task::JoinSet;

/// Number of concurrent callers per key.
const CALLERS: usize = 32;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

fn setup(ttl: Duration) -> (Arc<TokenCache>, Arc<CountingResolver>) {
    let resolver = Arc::new(CountingResolver::new());
    resolver.insert("validtoken", sample_token("t1"));
    let cache = TokenCache::new(Arc::clone(&resolver) as _, ttl).expect("valid ttl");
    (Arc::new(cache), resolver)
}

/// Waits until `followers` callers have joined the in-flight round.
async fn wait_for_followers(cache: &TokenCache, followers: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.metrics().coalesced < followers {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("callers should join the in-flight round");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_gets_share_one_resolver_call() {
    let (cache, resolver) = setup(Duration::from_secs(60));
    resolver.set_delay(Duration::from_millis(50));

    let mut set = JoinSet::new();
    for _ in 0..CALLERS {
        let cache = Arc::clone(&cache);
        set.spawn(async move { cache.get("validtoken").await });
    }

    let mut results = Vec::new();
    while let Some(result) = set.join_next().await {
        results.push(result.expect("task should not panic").expect("token resolves"));
    }

    assert_eq!(results.len(), CALLERS);
    assert_eq!(resolver.calls(), 1, "exactly one upstream call for {CALLERS} callers");
    let first = &results[0];
    assert_eq!(first.id, "t1");
    assert_eq!(first.permissions, vec!["read".to_owned()]);
    assert!(results.iter().all(|t| Arc::ptr_eq(t, first)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_gets_for_missing_token_share_one_call() {
    let (cache, resolver) = setup(Duration::from_secs(60));
    resolver.set_delay(Duration::from_millis(50));

    let mut set = JoinSet::new();
    for _ in 0..CALLERS {
        let cache = Arc::clone(&cache);
        set.spawn(async move { cache.get("ghost").await });
    }
    while let Some(result) = set.join_next().await {
        assert!(result.expect("task should not panic").is_none());
    }

    assert_eq!(resolver.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_round_is_shared_then_retried() {
    let (cache, resolver) = setup(Duration::from_secs(60));
    resolver.set_failure(Some(ResolveError::timeout()));
    resolver.enable_gate();

    let mut set = JoinSet::new();
    for _ in 0..CALLERS {
        let cache = Arc::clone(&cache);
        set.spawn(async move { cache.get("validtoken").await });
    }

    resolver.wait_started().await;
    wait_for_followers(&cache, (CALLERS - 1) as u64).await;
    resolver.open_gate();

    while let Some(result) = set.join_next().await {
        assert!(result.expect("task should not panic").is_none(), "errors fail closed");
    }
    assert_eq!(resolver.calls(), 1, "one failed round for every caller");
    assert_eq!(cache.in_flight_count(), 0);

    // The failure was not cached, so the next miss starts a new round.
    resolver.set_failure(None);
    resolver.open_gate();
    assert!(cache.get("validtoken").await.is_some());
    assert_eq!(resolver.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_key_resolved_once() {
    let resolver = Arc::new(CountingResolver::new());
    for i in 0..8 {
        resolver.insert(format!("token-{i}"), sample_token(&format!("t{i}")));
    }
    resolver.set_delay(Duration::from_millis(20));
    let cache = Arc::new(
        TokenCache::new(Arc::clone(&resolver) as _, Duration::from_secs(60)).expect("valid ttl"),
    );

    let mut set = JoinSet::new();
    for caller in 0..CALLERS {
        for i in 0..8 {
            let cache = Arc::clone(&cache);
            set.spawn(async move {
                let token = cache.get(&format!("token-{i}")).await.expect("token resolves");
                assert_eq!(token.id, format!("t{i}"), "caller {caller} got another key's token");
            });
        }
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    assert_eq!(resolver.calls(), 8, "one call per distinct key");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidating_other_keys_keeps_fetched_entries() {
    let resolver = Arc::new(CountingResolver::new());
    for i in 0..8 {
        resolver.insert(format!("token-{i}"), sample_token(&format!("t{i}")));
    }
    resolver.set_delay(Duration::from_millis(50));
    let cache = Arc::new(
        TokenCache::new(Arc::clone(&resolver) as _, Duration::from_secs(60)).expect("valid ttl"),
    );

    let revoker_cache = Arc::clone(&cache);
    let revoker = tokio::spawn(async move {
        for i in 0..200 {
            revoker_cache.invalidate(&format!("revoked-{i}")).await;
            tokio::task::yield_now().await;
        }
    });

    let mut set = JoinSet::new();
    for _ in 0..4 {
        for i in 0..8 {
            let cache = Arc::clone(&cache);
            set.spawn(async move { cache.get(&format!("token-{i}")).await });
        }
    }
    while let Some(result) = set.join_next().await {
        assert!(result.expect("task should not panic").is_some());
    }
    revoker.await.expect("revoker should not panic");

    for i in 0..8 {
        assert!(cache.get(&format!("token-{i}")).await.is_some());
    }
    assert_eq!(resolver.calls(), 8, "revoking unrelated tokens must not force refetches");
    assert_eq!(cache.metrics().discarded_writes, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_callers_do_not_cancel_shared_fetch() {
    let (cache, resolver) = setup(Duration::from_secs(60));
    resolver.set_delay(Duration::from_millis(100));

    let mut set = JoinSet::new();
    for _ in 0..CALLERS {
        let cache = Arc::clone(&cache);
        set.spawn(async move { cache.get_within("validtoken", Duration::from_millis(5)).await });
    }
    while let Some(result) = set.join_next().await {
        assert!(result.expect("task should not panic").is_none(), "every caller gave up");
    }

    // The round the callers abandoned still completes and populates the cache.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cache.get("validtoken").await.is_some());
    assert_eq!(resolver.calls(), 1);
    assert_eq!(cache.metrics().abandoned_waits, CALLERS as u64);
}
