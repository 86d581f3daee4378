//! Rate limiter integration tests
//!
//! Drives the limiter with explicit instants so refill is deterministic, then
//! checks admission through the SessionManager.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use streamchat_core::backend::ScriptedAdapter;
use streamchat_core::history::InMemoryHistory;
use streamchat_core::transport::ChannelSink;
use streamchat_core::{
    CallerKey, ChatError, ChatRequest, ModelRouter, RateLimitConfig, RateLimitResult,
    RateLimiter, SessionManager, SessionManagerConfig,
};

fn limiter(capacity: f64, refill: f64) -> RateLimiter {
    RateLimiter::new(
        RateLimitConfig::new()
            .with_capacity(capacity)
            .with_refill_per_second(refill),
    )
}

#[test]
fn test_burst_then_reject_then_refill() {
    let limiter = limiter(10.0, 1.0);
    let t0 = Instant::now();

    for i in 0..10 {
        assert!(limiter.try_acquire_at("caller", 1.0, t0), "request {i} should pass");
    }

    let rejected = limiter.check("caller", 1.0, t0);
    assert!(rejected.is_rejected());
    assert_eq!(rejected.retry_after(), Some(Duration::from_secs(1)));

    // One second later exactly one token is back
    let t1 = t0 + Duration::from_secs(1);
    assert!(limiter.try_acquire_at("caller", 1.0, t1));
    assert!(!limiter.try_acquire_at("caller", 1.0, t1));
}

#[test]
fn test_refill_is_capped_at_capacity() {
    let limiter = limiter(5.0, 2.0);
    let t0 = Instant::now();

    assert!(limiter.try_acquire_at("k", 5.0, t0));
    let later = t0 + Duration::from_secs(3600);
    assert_eq!(limiter.available("k", later), 5.0);
    assert!(!limiter.try_acquire_at("k", 6.0, later));
}

#[test]
fn test_fractional_costs_accumulate() {
    let limiter = limiter(1.0, 0.0);
    let t0 = Instant::now();

    for _ in 0..4 {
        assert!(limiter.try_acquire_at("k", 0.25, t0));
    }
    let result = limiter.check("k", 0.25, t0);
    assert_eq!(
        result,
        RateLimitResult::Rejected {
            retry_after: Duration::MAX
        }
    );
}

#[test]
fn test_keys_are_independent() {
    let limiter = limiter(2.0, 0.0);
    let t0 = Instant::now();

    assert!(limiter.try_acquire_at("alice", 2.0, t0));
    assert!(!limiter.try_acquire_at("alice", 1.0, t0));

    assert!(limiter.try_acquire_at("bob", 1.0, t0));
    assert_eq!(limiter.available("bob", t0), 1.0);
    assert_eq!(limiter.bucket_count(), 2);
}

#[test]
fn test_charge_saturates_at_zero() {
    let limiter = limiter(1.0, 0.0);
    let t0 = Instant::now();

    assert_eq!(limiter.charge_at("k", 0.75, t0), 0.75);
    assert_eq!(limiter.charge_at("k", 0.75, t0), 0.25);
    assert_eq!(limiter.available("k", t0), 0.0);
    assert!(!limiter.try_acquire_at("k", 0.1, t0));
}

#[test]
fn test_evicted_bucket_comes_back_full() {
    let limiter = RateLimiter::new(
        RateLimitConfig::new()
            .with_capacity(3.0)
            .with_refill_per_second(0.0)
            .with_idle_eviction(Duration::from_secs(60)),
    );
    let t0 = Instant::now();

    assert!(limiter.try_acquire_at("idle", 3.0, t0));
    assert!(limiter.try_acquire_at("busy", 1.0, t0 + Duration::from_secs(50)));

    assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(30)), 0);
    assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(61)), 1);
    assert_eq!(limiter.bucket_count(), 1);

    assert_eq!(limiter.available("idle", t0 + Duration::from_secs(61)), 3.0);
}

#[test]
fn test_concurrent_acquires_never_overdraw() {
    let limiter = Arc::new(limiter(10.0, 0.0));
    let now = Instant::now();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.try_acquire_at("shared", 1.0, now))
        })
        .collect();

    let allowed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|allowed| *allowed)
        .count();
    assert_eq!(allowed, 10);
}

#[test]
fn test_disabled_limiter_admits_everything() {
    let limiter = RateLimiter::new(RateLimitConfig::disabled());
    let now = Instant::now();

    for _ in 0..1000 {
        assert!(limiter.try_acquire_at("k", 1.0, now));
    }
    assert_eq!(limiter.bucket_count(), 0);
}

#[tokio::test]
async fn test_manager_rejects_before_any_provider_call() {
    let adapter = Arc::new(ScriptedAdapter::replying("echo", &["ok"]));
    let router = ModelRouter::builder()
        .adapter(adapter.clone())
        .route("echo", "echo")
        .default_model("echo")
        .build()
        .unwrap();
    let mgr = SessionManager::new(
        router,
        Arc::new(limiter(1.0, 0.0)),
        Arc::new(InMemoryHistory::new()),
        SessionManagerConfig::default(),
    );
    let caller = CallerKey::new("limited");

    let (sink, _rx) = ChannelSink::channel(16);
    mgr.send(&caller, ChatRequest::new("first").with_session("r"), &sink)
        .await
        .unwrap();
    assert_eq!(adapter.open_count(), 1);

    let (sink, mut rx) = ChannelSink::channel(16);
    let result = mgr
        .send(&caller, ChatRequest::new("second").with_session("r"), &sink)
        .await;
    assert!(matches!(result, Err(ChatError::RateLimited { .. })));
    assert_eq!(adapter.open_count(), 1);
    assert!(rx.try_recv().is_err());

    // Another caller has its own budget
    let (sink, _rx) = ChannelSink::channel(16);
    assert!(mgr
        .send(&CallerKey::new("other"), ChatRequest::new("hi"), &sink)
        .await
        .is_ok());
}
