//! Scripted transports and recording sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{TransportError, TransportErrorKind};
use crate::llm::{Completion, CompletionRequest, CompletionTransport, TokenSink};

/// Computes a step from the request when the queue is empty.
pub type Responder = Arc<dyn Fn(&CompletionRequest) -> ScriptStep + Send + Sync>;

#[derive(Debug, Clone)]
enum ScriptAction {
    Reply(String),
    Fail(TransportErrorKind),
    Stream {
        fragments: Vec<String>,
        fail: Option<TransportErrorKind>,
    },
}

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    action: ScriptAction,
    delay: Option<Duration>,
}

impl ScriptStep {
    /// Replies with `content`.
    #[must_use]
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            action: ScriptAction::Reply(content.into()),
            delay: None,
        }
    }

    /// Fails with `kind`.
    #[must_use]
    pub fn fail(kind: TransportErrorKind) -> Self {
        Self {
            action: ScriptAction::Fail(kind),
            delay: None,
        }
    }

    /// Streams `fragments`; the completion is their concatenation.
    #[must_use]
    pub fn stream<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: ScriptAction::Stream {
                fragments: fragments.into_iter().map(Into::into).collect(),
                fail: None,
            },
            delay: None,
        }
    }

    /// Streams `fragments`, then fails with `kind` carrying them as partial content.
    #[must_use]
    pub fn stream_then_fail<I, S>(fragments: I, kind: TransportErrorKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: ScriptAction::Stream {
                fragments: fragments.into_iter().map(Into::into).collect(),
                fail: Some(kind),
            },
            delay: None,
        }
    }

    /// Waits `delay` before acting.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A transport that plays back a script.
///
/// Steps are consumed in order. Once the queue is empty the transport falls
/// back to the repeating step, then to the responder; with neither it fails
/// with a non-retryable error so that a test reading past its script stops.
pub struct ScriptedTransport {
    name: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    repeat: Option<ScriptStep>,
    responder: Option<Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("name", &self.name)
            .field("queued", &self.steps.lock().len())
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    fn with_parts(steps: Vec<ScriptStep>, repeat: Option<ScriptStep>, responder: Option<Responder>) -> Self {
        Self {
            name: "scripted".to_string(),
            steps: Mutex::new(steps.into()),
            repeat,
            responder,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Plays `steps` once, in order.
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_parts(steps, None, None)
    }

    /// Repeats `step` for every call.
    #[must_use]
    pub fn always(step: ScriptStep) -> Self {
        Self::with_parts(Vec::new(), Some(step), None)
    }

    /// Computes every reply from the request.
    #[must_use]
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> ScriptStep + Send + Sync + 'static,
    {
        Self::with_parts(Vec::new(), None, Some(Arc::new(responder)))
    }

    /// Plays `steps` first, then uses `responder`.
    #[must_use]
    pub fn then_responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> ScriptStep + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Queues another step.
    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().push_back(step);
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    /// Number of calls received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self, request: &CompletionRequest) -> ScriptStep {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let queued = self.steps.lock().pop_front();
        queued
            .or_else(|| self.repeat.clone())
            .or_else(|| self.responder.as_ref().map(|r| r(request)))
            .unwrap_or_else(|| ScriptStep::fail(TransportErrorKind::InvalidRequest))
    }

    fn completion(&self, content: String) -> Completion {
        let mut completion = Completion::new(content, "scripted-model", &self.name);
        completion.finish_reason = Some("stop".to_string());
        completion
    }

    async fn play(
        &self,
        request: &CompletionRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<Completion, TransportError> {
        let step = self.next_step(request);
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        match step.action {
            ScriptAction::Reply(content) => {
                if let Some(sink) = sink {
                    sink.on_token(&content);
                }
                Ok(self.completion(content))
            }
            ScriptAction::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
            ScriptAction::Stream { fragments, fail } => {
                let mut content = String::new();
                for fragment in &fragments {
                    if let Some(sink) = sink {
                        sink.on_token(fragment);
                    }
                    content.push_str(fragment);
                }
                match fail {
                    Some(kind) => {
                        Err(TransportError::new(kind, "scripted stream failure").with_partial(content))
                    }
                    None => Ok(self.completion(content)),
                }
            }
        }
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        self.play(request, None).await
    }

    async fn send_streaming(
        &self,
        request: &CompletionRequest,
        sink: &dyn TokenSink,
    ) -> Result<Completion, TransportError> {
        self.play(request, Some(sink)).await
    }
}

/// A token sink that keeps every fragment.
#[derive(Debug, Default)]
pub struct RecordingTokenSink {
    tokens: Mutex<Vec<String>>,
}

impl RecordingTokenSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragments in arrival order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Fragments joined.
    #[must_use]
    pub fn text(&self) -> String {
        self.tokens.lock().concat()
    }
}

impl TokenSink for RecordingTokenSink {
    fn on_token(&self, token: &str) {
        self.tokens.lock().push(token.to_string());
    }
}
