//! Reasoning service transports.
//!
//! `HttpTransport` talks to an OpenAI-compatible chat-completions endpoint.
//! `FakeTransport` answers from a script and records what was dispatched.

use async_trait::async_trait;
use prism_shared::{ChatRequest, ChatResponse, PrismError, Usage};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::cache::lock;
use crate::config::ReasoningConfig;

/// Default endpoint identifier for chat completions
pub const CHAT_ENDPOINT: &str = "chat/completions";

// ============================================================================
// Transport Trait
// ============================================================================

/// One request/response exchange with the reasoning service
#[async_trait]
pub trait ReasoningTransport: Send + Sync {
    async fn send(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, PrismError>;
}

// ============================================================================
// HTTP Transport (Production)
// ============================================================================

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpTransport {
    pub fn new(config: &ReasoningConfig) -> Result<Self, PrismError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| PrismError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl ReasoningTransport for HttpTransport {
    async fn send(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, PrismError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        debug!("POST {} (model={})", url, request.model);

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PrismError::Timeout(self.timeout_secs)
            } else {
                PrismError::Transport(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(PrismError::Transport(format!(
                "HTTP {} from reasoning service",
                response.status()
            )));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| PrismError::Parse(format!("Failed to parse response: {}", e)))
    }
}

// ============================================================================
// Fake Transport (Testing)
// ============================================================================

/// Scripted transport for tests
pub struct FakeTransport {
    /// Content strings returned in order; the last one repeats
    responses: Mutex<VecDeque<String>>,
    /// Zero-based call indices that fail
    failures: HashSet<usize>,
    /// (endpoint, prompt text) per call, in dispatch order
    dispatched: Arc<Mutex<Vec<(String, String)>>>,
    latency: Duration,
}

impl FakeTransport {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            failures: HashSet::new(),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            latency: Duration::ZERO,
        }
    }

    /// Always answer with the same content
    pub fn always(content: impl Into<String>) -> Self {
        Self::new(vec![content.into()])
    }

    /// Fail the call with this zero-based index
    pub fn fail_on(mut self, call: usize) -> Self {
        self.failures.insert(call);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.dispatched).len()
    }

    /// Prompt texts in the order they were dispatched
    pub fn dispatched_prompts(&self) -> Vec<String> {
        lock(&self.dispatched).iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn dispatched_endpoints(&self) -> Vec<String> {
        lock(&self.dispatched).iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl ReasoningTransport for FakeTransport {
    async fn send(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, PrismError> {
        let call = {
            let mut dispatched = lock(&self.dispatched);
            dispatched.push((endpoint.to_string(), request.prompt_text()));
            dispatched.len() - 1
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failures.contains(&call) {
            return Err(PrismError::Transport(format!("scripted failure on call {}", call)));
        }

        let content = {
            let mut responses = lock(&self.responses);
            if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            }
        }
        .ok_or_else(|| PrismError::Transport("no scripted response".to_string()))?;

        let prompt_tokens = estimate_tokens(&request.prompt_text());
        let completion_tokens = estimate_tokens(&content);
        Ok(ChatResponse::from_content(
            content,
            Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        ))
    }
}

/// Rough token estimate, four characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_shared::ChatMessage;

    fn request(prompt: &str) -> ChatRequest {
        ChatRequest {
            model: "test".to_string(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: 0.7,
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_fake_transport_script_order() {
        let fake = FakeTransport::new(vec!["one".to_string(), "two".to_string()]);
        let r1 = fake.send(CHAT_ENDPOINT, &request("a")).await.unwrap();
        let r2 = fake.send(CHAT_ENDPOINT, &request("b")).await.unwrap();
        let r3 = fake.send(CHAT_ENDPOINT, &request("c")).await.unwrap();
        assert_eq!(r1.content().unwrap(), "one");
        assert_eq!(r2.content().unwrap(), "two");
        // Last response repeats
        assert_eq!(r3.content().unwrap(), "two");
        assert_eq!(fake.dispatched_prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fake_transport_scripted_failure() {
        let fake = FakeTransport::always("ok").fail_on(1);
        assert!(fake.send(CHAT_ENDPOINT, &request("a")).await.is_ok());
        assert!(fake.send(CHAT_ENDPOINT, &request("b")).await.is_err());
        assert!(fake.send(CHAT_ENDPOINT, &request("c")).await.is_ok());
        assert_eq!(fake.call_count(), 3);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_http_transport_builds() {
        let config = ReasoningConfig::default();
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.base_url, "http://localhost:11434/v1");
    }
}
