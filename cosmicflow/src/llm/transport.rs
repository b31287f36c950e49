//! The completion transport seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::context::ChatMessage;
use crate::errors::TransportError;

/// A fully assembled request: system prompt plus conversation history, the
/// last message being the new prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// System instructions.
    pub system: String,
    /// History followed by the new prompt.
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    /// The newest message (the prompt being sent).
    #[must_use]
    pub fn prompt(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// A completion returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub content: String,
    /// Model that produced it.
    pub model: String,
    /// Provider name.
    pub provider: String,
    /// Prompt tokens, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    /// Completion tokens, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    /// Wall-clock latency of the successful attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Why generation stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Completion {
    /// Creates a completion with only content and provenance.
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            provider: provider.into(),
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
            finish_reason: None,
        }
    }

    /// Returns total tokens.
    #[must_use]
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }

    /// Converts to span attributes.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("llm.model".to_string(), serde_json::json!(self.model));
        map.insert("llm.provider".to_string(), serde_json::json!(self.provider));
        if let Some(t) = self.input_tokens { map.insert("llm.input_tokens".to_string(), serde_json::json!(t)); }
        if let Some(t) = self.output_tokens { map.insert("llm.output_tokens".to_string(), serde_json::json!(t)); }
        map.insert("llm.total_tokens".to_string(), serde_json::json!(self.total_tokens()));
        if let Some(l) = self.latency_ms { map.insert("llm.latency_ms".to_string(), serde_json::json!(l)); }
        map
    }
}

/// Receives streamed tokens as they arrive.
pub trait TokenSink: Send + Sync {
    /// Called once per streamed fragment.
    fn on_token(&self, token: &str);
}

impl<F> TokenSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_token(&self, token: &str) {
        self(token);
    }
}

/// Sends a request to a completion service.
///
/// Implementations must classify their failures with a
/// [`crate::errors::TransportErrorKind`]; the orchestrator relies on that
/// classification to decide whether to retry.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Provider name, for logs and reports.
    fn provider(&self) -> &str;

    /// Sends a request and waits for the whole completion.
    async fn send(&self, request: &CompletionRequest) -> Result<Completion, TransportError>;

    /// Sends a request and delivers fragments to `sink` as they arrive.
    ///
    /// The default implementation has no incremental delivery: it forwards
    /// the finished content as a single fragment. On failure mid-stream,
    /// implementations attach the partial content to the error.
    async fn send_streaming(
        &self,
        request: &CompletionRequest,
        sink: &dyn TokenSink,
    ) -> Result<Completion, TransportError> {
        let completion = self.send(request).await?;
        sink.on_token(&completion.content);
        Ok(completion)
    }
}
