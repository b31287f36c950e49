//! Transport for OpenAI-compatible chat completion endpoints.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::transport::{Completion, CompletionRequest, CompletionTransport, TokenSink};
use crate::config::ProviderConfig;
use crate::errors::{ConfigError, TransportError, TransportErrorKind};

/// Sends requests to `{base_url}/chat/completions`.
///
/// The provider configuration is resolved (environment overrides applied)
/// when the transport is built, so swapping providers never touches the
/// orchestration code.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleTransport {
    client: reqwest::Client,
    name: String,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatibleTransport {
    /// Builds a transport from a named provider configuration.
    pub fn from_provider(name: &str, provider: &ProviderConfig) -> Result<Self, ConfigError> {
        let resolved = provider.resolved();
        resolved.validate(name)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(resolved.timeout_seconds))
            .build()
            .map_err(|e| ConfigError::invalid("providers", format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            name: name.to_string(),
            endpoint: resolved.endpoint(),
            model: resolved.model_name.clone(),
            api_key: resolved.api_key.clone(),
            temperature: resolved.temperature,
            max_tokens: resolved.max_tokens,
        })
    }

    /// The resolved endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(WireMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));
        ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        }
    }

    async fn post(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, TransportError> {
        let mut builder = self.client.post(&self.endpoint).json(body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(TransportError::new(
            classify_status(status.as_u16()),
            format!("HTTP {}: {}", status.as_u16(), truncate(&text, 300)),
        ))
    }
}

#[async_trait]
impl CompletionTransport for OpenAiCompatibleTransport {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        debug!(provider = %self.name, model = %self.model, messages = request.messages.len(), "POST chat completion");
        let response = self.post(&self.body(request, false)).await?;
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            TransportError::new(
                TransportErrorKind::MalformedResponse,
                format!("cannot decode response: {e}"),
            )
        })?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            TransportError::new(TransportErrorKind::MalformedResponse, "response has no choices")
        })?;
        let content = choice.message.and_then(|m| m.content).ok_or_else(|| {
            TransportError::new(TransportErrorKind::MalformedResponse, "response has no content")
        })?;

        let mut completion = Completion::new(content, parsed.model.unwrap_or_else(|| self.model.clone()), &self.name);
        completion.finish_reason = choice.finish_reason;
        if let Some(usage) = parsed.usage {
            completion.input_tokens = Some(usage.prompt_tokens);
            completion.output_tokens = Some(usage.completion_tokens);
        }
        Ok(completion)
    }

    async fn send_streaming(
        &self,
        request: &CompletionRequest,
        sink: &dyn TokenSink,
    ) -> Result<Completion, TransportError> {
        debug!(provider = %self.name, model = %self.model, "POST chat completion (stream)");
        let response = self.post(&self.body(request, true)).await?;
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut finish_reason = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_reqwest(e).with_partial(content.clone()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    let mut completion = Completion::new(content, self.model.clone(), &self.name);
                    completion.finish_reason = finish_reason;
                    return Ok(completion);
                }
                let event: StreamChunk = serde_json::from_str(data).map_err(|e| {
                    TransportError::new(
                        TransportErrorKind::MalformedResponse,
                        format!("cannot decode stream chunk: {e}"),
                    )
                    .with_partial(content.clone())
                })?;
                for choice in event.choices {
                    if let Some(fragment) = choice.delta.and_then(|d| d.content) {
                        if !fragment.is_empty() {
                            sink.on_token(&fragment);
                            content.push_str(&fragment);
                        }
                    }
                    if choice.finish_reason.is_some() {
                        finish_reason = choice.finish_reason;
                    }
                }
            }
        }

        if finish_reason.is_some() {
            let mut completion = Completion::new(content, self.model.clone(), &self.name);
            completion.finish_reason = finish_reason;
            Ok(completion)
        } else {
            Err(TransportError::new(
                TransportErrorKind::MalformedResponse,
                "stream ended before completion",
            )
            .with_partial(content))
        }
    }
}

/// Maps an HTTP status to a failure class.
#[must_use]
pub fn classify_status(status: u16) -> TransportErrorKind {
    match status {
        401 | 403 => TransportErrorKind::Authentication,
        408 => TransportErrorKind::Timeout,
        429 => TransportErrorKind::RateLimited,
        500..=599 => TransportErrorKind::Unavailable,
        _ => TransportErrorKind::InvalidRequest,
    }
}

fn classify_reqwest(error: reqwest::Error) -> TransportError {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_decode() || error.is_body() {
        TransportErrorKind::MalformedResponse
    } else if error.is_builder() {
        TransportErrorKind::InvalidRequest
    } else {
        TransportErrorKind::Unavailable
    };
    TransportError::new(kind, error.to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ResponseMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}
