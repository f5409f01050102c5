//! Rate-limited request queue for the reasoning service.
//!
//! A single worker drains requests FIFO and waits a fixed delay after every
//! dispatch, which caps the request rate and keeps ordering strict. Cached
//! responses resolve without entering the queue. A failed request rejects
//! only its own caller; the worker moves on after the same delay.

use prism_shared::{ChatRequest, ChatResponse, PrismError, Usage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{lock, ResponseCache};
use crate::config::{CacheConfig, ReasoningConfig};
use crate::transport::{estimate_tokens, ReasoningTransport};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Minimum delay between dispatches
    pub request_delay: Duration,
    /// Answer with synthetic responses instead of calling the transport
    pub simulate: bool,
    pub simulate_latency: Duration,
    /// Per-request timeout on the live path
    pub timeout: Duration,
    /// Write successful responses to the cache
    pub cache_enabled: bool,
    /// TTL override for cached responses
    pub cache_ttl: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(500),
            simulate: false,
            simulate_latency: Duration::from_millis(300),
            timeout: Duration::from_secs(30),
            cache_enabled: true,
            cache_ttl: None,
        }
    }
}

impl QueueOptions {
    pub fn from_config(reasoning: &ReasoningConfig, cache: &CacheConfig) -> Self {
        Self {
            request_delay: reasoning.request_delay(),
            simulate: reasoning.simulate,
            simulate_latency: Duration::from_millis(reasoning.simulate_latency_ms),
            timeout: reasoning.timeout(),
            cache_enabled: cache.enabled,
            cache_ttl: None,
        }
    }
}

/// Token and request accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageStats {
    fn record(&mut self, usage: &Usage) {
        self.requests += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
    }
}

/// A request owned by the queue until its responder fires
struct QueuedRequest {
    endpoint: String,
    request: ChatRequest,
    cache_key: String,
    responder: oneshot::Sender<Result<ChatResponse, PrismError>>,
}

pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    cache: Option<Arc<ResponseCache>>,
    usage: Arc<Mutex<UsageStats>>,
    worker: JoinHandle<()>,
}

impl RequestQueue {
    /// Start the queue worker. Must be called inside a tokio runtime.
    pub fn new(
        transport: Arc<dyn ReasoningTransport>,
        cache: Option<Arc<ResponseCache>>,
        options: QueueOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let usage = Arc::new(Mutex::new(UsageStats::default()));

        info!(
            "Request queue started (delay={}ms, simulate={})",
            options.request_delay.as_millis(),
            options.simulate
        );

        let worker = tokio::spawn(run_worker(
            rx,
            transport,
            cache.clone(),
            Arc::clone(&usage),
            options,
        ));

        Self {
            tx,
            cache,
            usage,
            worker,
        }
    }

    /// Submit a request and wait for its response.
    /// A cache hit resolves immediately without taking a queue slot.
    pub async fn enqueue(
        &self,
        endpoint: &str,
        request: ChatRequest,
        cache_key: &str,
    ) -> Result<ChatResponse, PrismError> {
        let cached = self.cache.as_ref().and_then(|cache| cache.get(cache_key));
        if let Some(hit) = cached.and_then(|value| decode_cached(cache_key, value)) {
            lock(&self.usage).cache_hits += 1;
            debug!("Cache hit for {}", cache_key);
            return Ok(hit);
        }

        let (responder, rx) = oneshot::channel();
        self.tx
            .send(QueuedRequest {
                endpoint: endpoint.to_string(),
                request,
                cache_key: cache_key.to_string(),
                responder,
            })
            .map_err(|_| PrismError::QueueClosed)?;

        rx.await.map_err(|_| PrismError::QueueClosed)?
    }

    pub fn usage(&self) -> UsageStats {
        lock(&self.usage).clone()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    transport: Arc<dyn ReasoningTransport>,
    cache: Option<Arc<ResponseCache>>,
    usage: Arc<Mutex<UsageStats>>,
    options: QueueOptions,
) {
    while let Some(item) = rx.recv().await {
        if item.responder.is_closed() {
            debug!("Caller gone, dropping request for {}", item.cache_key);
            continue;
        }

        // An earlier request in the queue may have filled the cache. The
        // miss was already counted at enqueue time.
        let cached = cache.as_ref().and_then(|cache| cache.peek(&item.cache_key));
        if let Some(hit) = cached.and_then(|value| decode_cached(&item.cache_key, value)) {
            lock(&usage).cache_hits += 1;
            let _ = item.responder.send(Ok(hit));
            continue;
        }

        let result = if options.simulate {
            tokio::time::sleep(options.simulate_latency).await;
            Ok(simulate_response(&item.request))
        } else {
            match tokio::time::timeout(options.timeout, transport.send(&item.endpoint, &item.request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PrismError::Timeout(options.timeout.as_secs())),
            }
        };

        match result {
            Ok(response) => {
                lock(&usage).record(&response.usage);
                if options.cache_enabled {
                    if let Some(cache) = &cache {
                        store_response(cache, &item.cache_key, &response, options.cache_ttl)
                            .await;
                    }
                }
                let _ = item.responder.send(Ok(response));
            }
            Err(e) => {
                lock(&usage).failures += 1;
                warn!("Reasoning request to {} failed: {}", item.endpoint, e);
                let _ = item.responder.send(Err(e));
            }
        }

        tokio::time::sleep(options.request_delay).await;
    }
    debug!("Request queue worker stopped");
}

/// Cache writes may hit the disk, so they run on the blocking pool
async fn store_response(
    cache: &Arc<ResponseCache>,
    key: &str,
    response: &ChatResponse,
    ttl: Option<Duration>,
) {
    let value = match serde_json::to_value(response) {
        Ok(value) => value,
        Err(e) => {
            warn!("Response not cacheable: {}", e);
            return;
        }
    };
    let cache = Arc::clone(cache);
    let key = key.to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || cache.set(&key, value, ttl)).await {
        warn!("Cache write task failed: {}", e);
    }
}

fn decode_cached(key: &str, value: serde_json::Value) -> Option<ChatResponse> {
    match serde_json::from_value(value) {
        Ok(response) => Some(response),
        Err(e) => {
            warn!("Discarding malformed cached response {}: {}", key, e);
            None
        }
    }
}

// ============================================================================
// Simulated responses
// ============================================================================

/// Keyword → canned reply. First matching row wins.
const SIMULATED_REPLIES: &[(&[&str], &str)] = &[
    (&["passive", "inactiv"], "bored"),
    (&["chaotic", "distracted"], "overwhelmed"),
    (&["focused", "deliberate"], "immersed"),
    (&["explorative", "scanning"], "curious"),
];

/// Deterministic synthetic reply chosen by keywords in the prompt
pub fn simulate_response(request: &ChatRequest) -> ChatResponse {
    let prompt = request.prompt_text().to_lowercase();
    let mood = SIMULATED_REPLIES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| prompt.contains(k)))
        .map(|(_, mood)| *mood)
        .unwrap_or("calm");

    let body = match mood {
        "bored" => json!({
            "attention_state": "bored",
            "fractal": {"type": "burning_ship", "zoom": 0.8, "color_shift": 0.9},
            "audio": {"tempo": 120.0, "rhythm_enabled": true},
            "prompt": "Try dragging across the fractal to steer it",
            "rationale": "User has gone quiet; raise energy and invite interaction"
        }),
        "overwhelmed" => json!({
            "attention_state": "overwhelmed",
            "fractal": {"zoom": 1.0, "color_shift": 0.5},
            "audio": {"tempo": 60.0, "volume": 0.4, "reverb": 0.7},
            "rationale": "Input is scattered; slow everything down"
        }),
        "immersed" => json!({
            "attention_state": "immersed",
            "fractal": {"iterations": 250},
            "audio": {"binaural_beat": 6.0},
            "rationale": "User is absorbed; deepen detail without interrupting"
        }),
        "curious" => json!({
            "attention_state": "curious",
            "fractal": {"type": "julia"},
            "prompt": "Each preset hides a different world",
            "highlight": "preset-selector",
            "rationale": "User is sampling around; offer new territory"
        }),
        _ => json!({
            "attention_state": "calm",
            "audio": {"harmonic_ratio": 1.5},
            "rationale": "Steady state; keep a gentle drift"
        }),
    };

    let content = body.to_string();
    let prompt_tokens = estimate_tokens(&request.prompt_text());
    let completion_tokens = estimate_tokens(&content);
    ChatResponse::from_content(
        content,
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_shared::ChatMessage;

    fn request(prompt: &str) -> ChatRequest {
        ChatRequest {
            model: "sim".to_string(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: 0.7,
            max_tokens: 100,
        }
    }

    #[test]
    fn test_simulated_reply_keywords() {
        let mood = |p: &str| {
            simulate_response(&request(p)).content_json().unwrap()["attention_state"]
                .as_str()
                .unwrap()
                .to_string()
        };
        assert_eq!(mood("Attention: passive"), "bored");
        assert_eq!(mood("Pattern: chaotic"), "overwhelmed");
        assert_eq!(mood("Attention: focused"), "immersed");
        assert_eq!(mood("Pattern: scanning"), "curious");
        assert_eq!(mood("nothing notable"), "calm");
    }

    #[test]
    fn test_simulated_reply_is_deterministic() {
        let a = simulate_response(&request("Pattern: explorative"));
        let b = simulate_response(&request("Pattern: explorative"));
        assert_eq!(a, b);
        assert!(a.usage.total_tokens > 0);
    }
}
