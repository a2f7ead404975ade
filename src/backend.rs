//! # LLM Backend Abstraction
//!
//! The narrow interface between the `llm` handler and whatever serves the
//! model call. A backend receives fully-built messages plus model-profile
//! parameters and returns a single response value: a plain string, a
//! pre-parsed object, or a string the handler will JSON-parse when a schema
//! is in play.
//!
//! [`MockBackend`] is the test double: queue responses or errors, inspect
//! recorded requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }
}

/// A single backend invocation.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model_id: String,

    pub messages: Vec<LlmMessage>,

    /// `{ type: "json_schema", json_schema: { strict, schema } }` when the
    /// action carries an output schema.
    pub response_format: Option<Value>,

    /// Model-profile parameters, passed through verbatim.
    pub parameters: Map<String, Value>,
}

/// Backend reply.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub response: Value,

    pub tokens: Option<u64>,
}

/// Backend failures, split by retryability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Transient failures are worth retrying; everything else is not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited(_)
                | BackendError::Timeout(_)
                | BackendError::Unavailable(_)
                | BackendError::Network(_)
        )
    }

    /// Stable code for the action error surface.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::RateLimited(_) => "rate_limited",
            BackendError::Timeout(_) => "timeout",
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Network(_) => "network",
            BackendError::Other(_) => "backend_error",
        }
    }
}

/// What all model backends implement.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: LlmRequest) -> Result<LlmReply, BackendError>;
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Scriptable backend for tests: FIFO queue of replies and errors, with
/// every request recorded for assertions.
pub struct MockBackend {
    queue: Mutex<VecDeque<Result<Value, BackendError>>>,
    default_response: Value,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default_response: Value::String("mock response".to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replace the response returned once the queue drains.
    pub fn with_default(mut self, response: Value) -> Self {
        self.default_response = response;
        self
    }

    /// Enqueue a successful reply.
    pub fn queue_response(&self, response: Value) {
        self.queue.lock().unwrap().push_back(Ok(response));
    }

    /// Enqueue a failure.
    pub fn queue_error(&self, error: BackendError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, request: LlmRequest) -> Result<LlmReply, BackendError> {
        self.requests.lock().unwrap().push(request);
        let next = self.queue.lock().unwrap().pop_front();
        let response = match next {
            Some(Ok(v)) => v,
            Some(Err(e)) => return Err(e),
            None => self.default_response.clone(),
        };
        Ok(LlmReply { response, tokens: Some(1) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(prompt: &str) -> LlmRequest {
        LlmRequest {
            model_id: "test-model".into(),
            messages: vec![LlmMessage::user(prompt)],
            response_format: None,
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn queued_replies_fifo_then_default() {
        let backend = MockBackend::new();
        backend.queue_response(json!("first"));
        backend.queue_response(json!({ "second": true }));

        assert_eq!(backend.run(request("a")).await.unwrap().response, json!("first"));
        assert_eq!(
            backend.run(request("b")).await.unwrap().response,
            json!({ "second": true })
        );
        assert_eq!(
            backend.run(request("c")).await.unwrap().response,
            json!("mock response")
        );
    }

    #[tokio::test]
    async fn queued_errors_surface() {
        let backend = MockBackend::new();
        backend.queue_error(BackendError::RateLimited("try later".into()));
        let err = backend.run(request("x")).await.unwrap_err();
        assert!(err.retryable());
        assert_eq!(err.code(), "rate_limited");
    }

    #[tokio::test]
    async fn records_requests() {
        let backend = MockBackend::new();
        backend.run(request("first")).await.unwrap();
        backend.run(request("second")).await.unwrap();
        let seen = backend.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].messages[0].content, "second");
    }

    #[test]
    fn retryability_classification() {
        assert!(BackendError::Timeout("t".into()).retryable());
        assert!(BackendError::Network("n".into()).retryable());
        assert!(BackendError::Unavailable("u".into()).retryable());
        assert!(!BackendError::Other("bad schema".into()).retryable());
    }
}
