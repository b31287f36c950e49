//! One logical model call: history assembly, per-attempt timeout,
//! classified retry with backoff, and window bookkeeping.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::template::{PromptTemplate, RenderedPrompt, Variables};
use super::transport::{Completion, CompletionRequest, CompletionTransport, TokenSink};
use crate::cancellation::CancellationToken;
use crate::context::{ChatMessage, ConversationWindow, EntryId, Role};
use crate::errors::{CallError, TransportError};
use crate::events::{names, payload, EventSink, NoOpEventSink};
use crate::pipeline::retry::{should_retry, BackoffRecord, RetryConfig, RetryDecision, RetryState};

/// Per-call options.
#[derive(Clone, Copy, Default)]
pub struct CallOptions<'a> {
    /// Receives streamed fragments; `None` disables streaming.
    pub token_sink: Option<&'a dyn TokenSink>,
    /// Stops retries (and the in-flight attempt) when cancelled.
    pub cancel: Option<&'a CancellationToken>,
    /// Label attached to logs and events (e.g. "batch-3").
    pub label: Option<&'a str>,
}

impl<'a> CallOptions<'a> {
    /// Options with nothing set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables streaming into `sink`.
    #[must_use]
    pub fn streaming(mut self, sink: &'a dyn TokenSink) -> Self {
        self.token_sink = Some(sink);
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn cancellable(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Attaches a label.
    #[must_use]
    pub fn labelled(mut self, label: &'a str) -> Self {
        self.label = Some(label);
        self
    }
}

impl std::fmt::Debug for CallOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("streaming", &self.token_sink.is_some())
            .field("cancel", &self.cancel)
            .field("label", &self.label)
            .finish()
    }
}

/// What happened on the way to a completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    /// One record per attempt: the wait that preceded it.
    pub backoffs: Vec<BackoffRecord>,
    /// Transient failures that were retried, in order.
    pub failures: Vec<TransportError>,
}

impl CallTrace {
    /// Attempts made.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.backoffs.len()
    }
}

/// A successful call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// The completion.
    pub completion: Completion,
    /// Attempts and waits.
    pub trace: CallTrace,
    /// Window entry holding the prompt.
    pub prompt_entry: EntryId,
    /// Window entry holding the completion.
    pub completion_entry: EntryId,
}

/// Issues model calls with retry, timeout and history bounding.
pub struct ModelCallOrchestrator {
    transport: Arc<dyn CompletionTransport>,
    retry: RetryConfig,
    call_timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ModelCallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCallOrchestrator")
            .field("provider", &self.transport.provider())
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ModelCallOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        retry: RetryConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            retry,
            call_timeout,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The retry policy in use.
    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Provider name of the underlying transport.
    #[must_use]
    pub fn provider(&self) -> &str {
        self.transport.provider()
    }

    /// Renders `template` and performs the call.
    ///
    /// A template that cannot be rendered is a malformed request and is
    /// never retried.
    pub async fn call(
        &self,
        template: &PromptTemplate,
        variables: &Variables,
        window: &mut ConversationWindow,
        options: CallOptions<'_>,
    ) -> Result<CallOutcome, CallError> {
        let prompt = template.render(variables)?;
        self.call_rendered(&prompt, window, options).await
    }

    /// Sends an already rendered prompt with the window's history.
    ///
    /// Transient failures are retried with backoff up to the attempt ceiling,
    /// then reported as [`CallError::Exhausted`]. Other failures return
    /// [`CallError::Fatal`] at once. On success the prompt and the completion
    /// are recorded in `window`.
    pub async fn call_rendered(
        &self,
        prompt: &RenderedPrompt,
        window: &mut ConversationWindow,
        options: CallOptions<'_>,
    ) -> Result<CallOutcome, CallError> {
        let mut messages = window.snapshot();
        messages.push(ChatMessage::new(Role::User, prompt.user.clone()));
        let request = CompletionRequest {
            system: prompt.system.clone(),
            messages,
        };
        let label = options.label.unwrap_or("call");

        let mut state = RetryState::new();
        let mut trace = CallTrace::default();
        let mut pending = BackoffRecord::immediate();

        loop {
            trace.backoffs.push(pending);
            if !pending.applied.is_zero() {
                wait(pending.applied, options.cancel).await?;
            }
            ensure_not_cancelled(options.cancel)?;

            state.begin_attempt();
            let started = Instant::now();
            debug!(label, attempt = state.attempt, provider = self.provider(), "Sending completion request");

            match self.attempt(&request, options).await {
                Ok(mut completion) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    completion.latency_ms.get_or_insert(elapsed_ms);
                    let prompt_entry = window.record(Role::User, prompt.user.clone());
                    let completion_entry =
                        window.record(Role::Assistant, completion.content.clone());
                    debug!(
                        label,
                        attempts = state.attempt,
                        latency_ms = elapsed_ms,
                        tokens = completion.total_tokens(),
                        "Completion received"
                    );
                    return Ok(CallOutcome {
                        completion,
                        trace,
                        prompt_entry,
                        completion_entry,
                    });
                }
                Err(AttemptError::Cancelled(reason)) => return Err(CallError::Cancelled(reason)),
                Err(AttemptError::Transport(error)) => {
                    match should_retry(&mut state, &self.retry, error.is_transient()) {
                        RetryDecision::Retry(record) => {
                            let delay_ms = u64::try_from(record.applied.as_millis()).unwrap_or(u64::MAX);
                            warn!(
                                label,
                                attempt = state.attempt,
                                delay_ms,
                                error = %error,
                                "Transient call failure, retrying"
                            );
                            self.events.try_emit(
                                names::CALL_RETRY,
                                payload(serde_json::json!({
                                    "label": label,
                                    "attempt": state.attempt,
                                    "delay_ms": delay_ms,
                                    "error": error.to_dict(),
                                })),
                            );
                            trace.failures.push(error);
                            pending = record;
                        }
                        RetryDecision::GiveUp => {
                            warn!(label, attempts = state.attempt, error = %error, "Call exhausted");
                            return Err(CallError::Exhausted {
                                attempts: state.attempt,
                                last: error,
                            });
                        }
                        RetryDecision::NotRetryable => {
                            warn!(label, error = %error, "Fatal call failure");
                            return Err(CallError::Fatal(error));
                        }
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &CompletionRequest,
        options: CallOptions<'_>,
    ) -> Result<Completion, AttemptError> {
        let send = async {
            let result = match options.token_sink {
                Some(sink) => {
                    tokio::time::timeout(self.call_timeout, self.transport.send_streaming(request, sink))
                        .await
                }
                None => tokio::time::timeout(self.call_timeout, self.transport.send(request)).await,
            };
            result
                .unwrap_or_else(|_| Err(TransportError::timeout(self.call_timeout)))
                .map_err(AttemptError::Transport)
        };

        match options.cancel {
            Some(cancel) => tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AttemptError::Cancelled(cancel_reason(cancel))),
                result = send => result,
            },
            None => send.await,
        }
    }
}

enum AttemptError {
    Transport(TransportError),
    Cancelled(String),
}

fn cancel_reason(cancel: &CancellationToken) -> String {
    cancel.reason().unwrap_or_else(|| "cancelled".to_string())
}

fn ensure_not_cancelled(cancel: Option<&CancellationToken>) -> Result<(), CallError> {
    match cancel {
        Some(c) if c.is_cancelled() => Err(CallError::Cancelled(cancel_reason(c))),
        _ => Ok(()),
    }
}

async fn wait(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), CallError> {
    match cancel {
        Some(cancel) => tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CallError::Cancelled(cancel_reason(cancel))),
            () = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
