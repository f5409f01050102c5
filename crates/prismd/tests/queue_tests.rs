//! Request queue tests
//!
//! FakeTransport stands in for the reasoning service; tokio time is paused
//! so request spacing is checked without sleeping.

use prism_shared::{ChatMessage, ChatRequest, ManualClock, PrismError};
use prismd::cache::ResponseCache;
use prismd::queue::{QueueOptions, RequestQueue};
use prismd::transport::{FakeTransport, CHAT_ENDPOINT};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn request(prompt: &str) -> ChatRequest {
    ChatRequest {
        model: "test".to_string(),
        messages: vec![ChatMessage::user(prompt)],
        temperature: 0.7,
        max_tokens: 100,
    }
}

fn live_options() -> QueueOptions {
    QueueOptions {
        request_delay: Duration::from_millis(500),
        simulate: false,
        ..Default::default()
    }
}

// ============================================================================
// Ordering and isolation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_requests_dispatched_in_submission_order() {
    let transport = Arc::new(
        FakeTransport::always(r#"{"ok":true}"#).with_latency(Duration::from_millis(100)),
    );
    let queue = RequestQueue::new(transport.clone(), None, live_options());

    let (a, b, c) = tokio::join!(
        queue.enqueue(CHAT_ENDPOINT, request("first"), "a"),
        queue.enqueue(CHAT_ENDPOINT, request("second"), "b"),
        queue.enqueue(CHAT_ENDPOINT, request("third"), "c"),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(transport.dispatched_prompts(), vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn test_failure_does_not_affect_neighbours() {
    let transport = Arc::new(FakeTransport::always(r#"{"ok":true}"#).fail_on(1));
    let queue = RequestQueue::new(transport.clone(), None, live_options());

    let (a, b, c) = tokio::join!(
        queue.enqueue(CHAT_ENDPOINT, request("first"), "a"),
        queue.enqueue(CHAT_ENDPOINT, request("second"), "b"),
        queue.enqueue(CHAT_ENDPOINT, request("third"), "c"),
    );
    assert!(a.is_ok());
    assert!(matches!(b, Err(PrismError::Transport(_))));
    assert!(c.is_ok());
    assert_eq!(transport.call_count(), 3);
    assert_eq!(queue.usage().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispatches_spaced_by_request_delay() {
    let transport = Arc::new(FakeTransport::always(r#"{"ok":true}"#));
    let queue = RequestQueue::new(transport, None, live_options());

    let started = Instant::now();
    let _ = tokio::join!(
        queue.enqueue(CHAT_ENDPOINT, request("one"), "1"),
        queue.enqueue(CHAT_ENDPOINT, request("two"), "2"),
        queue.enqueue(CHAT_ENDPOINT, request("three"), "3"),
    );
    assert!(started.elapsed() >= Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reported_as_error() {
    let transport =
        Arc::new(FakeTransport::always(r#"{"ok":true}"#).with_latency(Duration::from_secs(60)));
    let options = QueueOptions {
        timeout: Duration::from_secs(5),
        ..live_options()
    };
    let queue = RequestQueue::new(transport, None, options);
    let result = queue.enqueue(CHAT_ENDPOINT, request("slow"), "slow").await;
    assert!(matches!(result, Err(PrismError::Timeout(5))));
}

// ============================================================================
// Cache and simulation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_hit_skips_transport() {
    let transport = Arc::new(FakeTransport::always(r#"{"ok":true}"#));
    let cache = Arc::new(ResponseCache::new(
        10,
        Duration::from_secs(60),
        Arc::new(ManualClock::new(0)),
    ));
    let queue = RequestQueue::new(transport.clone(), Some(cache.clone()), live_options());

    let first = queue.enqueue(CHAT_ENDPOINT, request("same"), "key").await.unwrap();
    let second = queue.enqueue(CHAT_ENDPOINT, request("same"), "key").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(transport.call_count(), 1);
    assert_eq!(queue.usage().cache_hits, 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_mode_never_calls_transport() {
    let transport = Arc::new(FakeTransport::always("unused"));
    let options = QueueOptions {
        simulate: true,
        ..live_options()
    };
    let queue = RequestQueue::new(transport.clone(), None, options);
    let response = queue
        .enqueue(CHAT_ENDPOINT, request("Attention: passive"), "sim")
        .await
        .unwrap();
    assert_eq!(response.content_json().unwrap()["attention_state"], "bored");
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cold_request_counts_one_miss() {
    let transport = Arc::new(FakeTransport::always(r#"{"ok":true}"#));
    let cache = Arc::new(ResponseCache::new(
        10,
        Duration::from_secs(60),
        Arc::new(ManualClock::new(0)),
    ));
    let queue = RequestQueue::new(transport, Some(cache.clone()), live_options());

    queue.enqueue(CHAT_ENDPOINT, request("cold"), "cold").await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);

    queue.enqueue(CHAT_ENDPOINT, request("cold"), "cold").await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.hit_rate, 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_mode_fills_cache_and_usage() {
    let transport = Arc::new(FakeTransport::always("unused"));
    let cache = Arc::new(ResponseCache::new(
        10,
        Duration::from_secs(60),
        Arc::new(ManualClock::new(0)),
    ));
    let options = QueueOptions {
        simulate: true,
        ..live_options()
    };
    let queue = RequestQueue::new(transport.clone(), Some(cache.clone()), options);

    let first = queue
        .enqueue(CHAT_ENDPOINT, request("Pattern: scanning"), "sim")
        .await
        .unwrap();
    assert_eq!(cache.len(), 1);
    let usage = queue.usage();
    assert_eq!(usage.requests, 1);
    assert!(usage.total_tokens > 0);
    assert_eq!(
        usage.total_tokens,
        usage.prompt_tokens + usage.completion_tokens
    );

    let second = queue
        .enqueue(CHAT_ENDPOINT, request("Pattern: scanning"), "sim")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.usage().cache_hits, 1);
    assert_eq!(queue.usage().requests, 1);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_sent_to_given_endpoint() {
    let transport = Arc::new(FakeTransport::always(r#"{"ok":true}"#));
    let queue = RequestQueue::new(transport.clone(), None, live_options());
    queue.enqueue(CHAT_ENDPOINT, request("one"), "1").await.unwrap();
    queue.enqueue("/v1/other", request("two"), "2").await.unwrap();
    assert_eq!(
        transport.dispatched_endpoints(),
        vec![CHAT_ENDPOINT.to_string(), "/v1/other".to_string()]
    );
}
