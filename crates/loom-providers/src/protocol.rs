//! Chat-completion wire protocol.
//!
//! One transport serves all provider shapes: OpenAI-style endpoints get
//! `/v1/chat/completions`, Ollama endpoints get `/api/chat`, mock providers
//! answer locally. Credentials are resolved from the environment via the
//! provider's `key_ref`; the secret itself is never stored.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loom_core::types::{ChatMessage, Provider, ProviderType};
use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("credential {0} not resolvable")]
    MissingCredential(String),
}

impl From<reqwest::Error> for ProtocolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProtocolError::Timeout
        } else {
            ProtocolError::Http(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    /// The minimal request used by health probes.
    pub fn ping() -> Self {
        Self {
            messages: vec![ChatMessage::user("ping")],
            temperature: 0.0,
            max_tokens: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub total_tokens: u64,
    pub latency: Duration,
}

// ---------------------------------------------------------------------------
// ChatProtocol trait
// ---------------------------------------------------------------------------

/// Transport seam between the registry and the network. Mocked in tests.
#[async_trait]
pub trait ChatProtocol: Send + Sync {
    async fn chat(
        &self,
        provider: &Provider,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse>;
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// Real transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn resolve_key(provider: &Provider) -> Result<Option<String>> {
        match &provider.key_ref {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| ProtocolError::MissingCredential(var.clone())),
        }
    }

    fn build_body(provider: &Provider, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": serde_json::to_value(m.role).expect("role serializes"),
                    "content": m.content,
                })
            })
            .collect();
        match provider.provider_type {
            ProviderType::Ollama => serde_json::json!({
                "model": provider.model(),
                "messages": messages,
                "stream": false,
                "options": {
                    "temperature": request.temperature,
                    "num_predict": request.max_tokens,
                },
            }),
            _ => serde_json::json!({
                "model": provider.model(),
                "messages": messages,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: String,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    model: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl ChatProtocol for HttpTransport {
    async fn chat(
        &self,
        provider: &Provider,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse> {
        if provider.provider_type == ProviderType::Mock {
            return Ok(ChatResponse {
                content: "pong".into(),
                model: provider.model().to_string(),
                total_tokens: 1,
                latency: Duration::ZERO,
            });
        }

        let base = provider.normalized_endpoint();
        let url = match provider.provider_type {
            ProviderType::Ollama => format!("{base}/api/chat"),
            _ => format!("{base}/chat/completions"),
        };
        let body = Self::build_body(provider, request);

        let started = Instant::now();
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&body);
        if let Some(key) = Self::resolve_key(provider)? {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProtocolError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::Api { status, message });
        }

        let latency = started.elapsed();
        match provider.provider_type {
            ProviderType::Ollama => {
                let api: OllamaResponse = resp
                    .json()
                    .await
                    .map_err(|e| ProtocolError::Parse(e.to_string()))?;
                Ok(ChatResponse {
                    content: api.message.content,
                    model: if api.model.is_empty() {
                        provider.model().to_string()
                    } else {
                        api.model
                    },
                    total_tokens: api.prompt_eval_count + api.eval_count,
                    latency,
                })
            }
            _ => {
                let api: OpenAiResponse = resp
                    .json()
                    .await
                    .map_err(|e| ProtocolError::Parse(e.to_string()))?;
                let content = api
                    .choices
                    .first()
                    .and_then(|c| c.message.content.clone())
                    .ok_or_else(|| ProtocolError::Parse("empty choices".into()))?;
                Ok(ChatResponse {
                    content,
                    model: if api.model.is_empty() {
                        provider.model().to_string()
                    } else {
                        api.model
                    },
                    total_tokens: api.usage.map(|u| u.total_tokens).unwrap_or(0),
                    latency,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Scripted transport for tests: pops queued results in order, then repeats
/// a default reply.
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, content: impl Into<String>) {
        self.responses
            .lock()
            .expect("mock lock")
            .push_back(Ok(content.into()));
    }

    pub fn push_error(&self, err: ProtocolError) {
        self.responses.lock().expect("mock lock").push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().expect("mock lock").clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProtocol for MockTransport {
    async fn chat(
        &self,
        provider: &Provider,
        request: &ChatRequest,
        _timeout: Duration,
    ) -> Result<ChatResponse> {
        self.calls.lock().expect("mock lock").push(request.clone());
        let next = self.responses.lock().expect("mock lock").pop_front();
        match next {
            Some(Ok(content)) => Ok(ChatResponse {
                content,
                model: provider.model().to_string(),
                total_tokens: 1,
                latency: Duration::from_millis(1),
            }),
            Some(Err(e)) => Err(e),
            None => Ok(ChatResponse {
                content: "ok".into(),
                model: provider.model().to_string(),
                total_tokens: 1,
                latency: Duration::from_millis(1),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::types::ProviderStatus;

    fn provider(provider_type: ProviderType, endpoint: &str) -> Provider {
        Provider {
            id: "prov-1".into(),
            provider_type,
            endpoint: endpoint.into(),
            key_ref: None,
            configured_model: "m".into(),
            selected_model: None,
            status: ProviderStatus::Pending,
            last_heartbeat: None,
        }
    }

    #[test]
    fn openai_body_shape() {
        let p = provider(ProviderType::OpenaiLike, "http://localhost:8000");
        let req = ChatRequest::new(vec![ChatMessage::system("sys"), ChatMessage::user("hi")]);
        let body = HttpTransport::build_body(&p, &req);
        assert_eq!(body["model"], "m");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn ollama_body_uses_options() {
        let p = provider(ProviderType::Ollama, "http://localhost:11434");
        let req = ChatRequest::ping();
        let body = HttpTransport::build_body(&p, &req);
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 1);
    }

    #[test]
    fn ping_is_one_token() {
        let req = ChatRequest::ping();
        assert_eq!(req.max_tokens, 1);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].content, "ping");
    }

    #[tokio::test]
    async fn mock_provider_answers_without_network() {
        let p = provider(ProviderType::Mock, "mock");
        let transport = HttpTransport::new();
        let resp = transport
            .chat(&p, &ChatRequest::ping(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.content, "pong");
    }

    #[tokio::test]
    async fn mock_transport_scripts_responses() {
        let p = provider(ProviderType::OpenaiLike, "http://unused");
        let transport = MockTransport::new();
        transport.push_response("first");
        transport.push_error(ProtocolError::Timeout);

        let r1 = transport
            .chat(&p, &ChatRequest::ping(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(r1.content, "first");

        let r2 = transport
            .chat(&p, &ChatRequest::ping(), Duration::from_secs(1))
            .await;
        assert!(matches!(r2, Err(ProtocolError::Timeout)));
        assert_eq!(transport.calls().len(), 2);
    }
}
