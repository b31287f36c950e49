//! Model-based plausibility review.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::finding::{Finding, FindingSource, Location};
use super::{ValidationContext, Validator};
use crate::codec::extract_json_array;
use crate::context::{ConversationWindow, WindowConfig};
use crate::core::Candidate;
use crate::llm::{variables, CallOptions, ModelCallOrchestrator, PromptTemplate};
use crate::pipeline::prompts::REVIEW_MARKER;

/// Asks the completion service to judge business plausibility.
///
/// The review is best-effort: a failed call or an unreadable answer yields
/// no findings. Every finding it returns needs the model to fix it, so all
/// of them are reported as logic findings.
pub struct SemanticValidator {
    orchestrator: Arc<ModelCallOrchestrator>,
    template: PromptTemplate,
    window: WindowConfig,
}

impl std::fmt::Debug for SemanticValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticValidator")
            .field("template", &self.template.name)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl SemanticValidator {
    /// Creates a reviewer using `template`.
    ///
    /// The template may use `{review_marker}`, `{stage}`,
    /// `{requirement_name}`, `{target_rows}`, `{scope}` and `{candidate}`.
    #[must_use]
    pub fn new(orchestrator: Arc<ModelCallOrchestrator>, template: PromptTemplate) -> Self {
        Self {
            orchestrator,
            template,
            window: WindowConfig::default(),
        }
    }

    /// Bounds of the reviewer's conversation window.
    #[must_use]
    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    /// Bounds used for each review conversation.
    #[must_use]
    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    fn scope(ctx: &ValidationContext) -> String {
        ctx.batch.as_ref().map_or_else(
            || "the whole requirement".to_string(),
            |batch| {
                let names: Vec<&str> = batch.events.iter().map(|e| e.name.as_str()).collect();
                format!("batch {} covering: {}", batch.index + 1, names.join(", "))
            },
        )
    }
}

/// Reads one reviewer entry. Entries without a message are skipped.
fn parse_entry(entry: &Value) -> Option<Finding> {
    let message = entry.get("message")?.as_str()?.trim();
    if message.is_empty() {
        return None;
    }
    let location = match entry.get("location") {
        Some(Value::String(text)) => Location::Described { text: text.clone() },
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|row| usize::try_from(row).ok())
            .filter(|row| *row > 0)
            .map_or(Location::Artifact, |row| Location::Row { row: row - 1 }),
        Some(other @ Value::Object(_)) => {
            serde_json::from_value(other.clone()).unwrap_or_else(|_| Location::Described {
                text: other.to_string(),
            })
        }
        _ => Location::Artifact,
    };
    let mut finding = Finding::logic("semantic.review", location, message).from_source(FindingSource::Semantic);
    if let Some(fix) = entry.get("suggested_fix").and_then(Value::as_str) {
        if !fix.trim().is_empty() {
            finding = finding.with_suggestion(fix.trim());
        }
    }
    Some(finding)
}

/// Parses a reviewer answer into findings.
#[must_use]
pub fn parse_review(text: &str) -> Option<Vec<Finding>> {
    extract_json_array(text).map(|entries| entries.iter().filter_map(parse_entry).collect())
}

#[async_trait]
impl Validator for SemanticValidator {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn deterministic(&self) -> bool {
        false
    }

    async fn validate(&self, candidate: &Candidate, ctx: &ValidationContext) -> Vec<Finding> {
        if ctx.is_cancelled() {
            debug!(stage = %ctx.stage, "Semantic review skipped after cancellation");
            return Vec::new();
        }
        let vars = variables([
            ("review_marker", REVIEW_MARKER.to_string()),
            ("stage", ctx.stage.as_str().to_string()),
            ("requirement_name", ctx.requirement_name.clone()),
            ("target_rows", ctx.target_rows.to_string()),
            ("scope", Self::scope(ctx)),
            ("candidate", candidate.render()),
        ]);
        let mut window = ConversationWindow::new(self.window.clone());
        let label = format!("review-{}", ctx.stage);
        let mut options = CallOptions::new().labelled(&label);
        if let Some(cancel) = ctx.cancel.as_deref() {
            options = options.cancellable(cancel);
        }

        let outcome = match self
            .orchestrator
            .call(&self.template, &vars, &mut window, options)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(stage = %ctx.stage, error = %error, "Semantic review unavailable");
                return Vec::new();
            }
        };

        match parse_review(&outcome.completion.content) {
            Some(findings) => {
                debug!(stage = %ctx.stage, findings = findings.len(), "Semantic review complete");
                findings
            }
            None => {
                warn!(stage = %ctx.stage, "Semantic review answer had no JSON array");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CosmicTable, PipelineStage};
    use crate::errors::TransportErrorKind;
    use crate::cancellation::CancellationToken;
    use crate::pipeline::{JitterStrategy, RetryConfig};
    use crate::testing::{ScriptStep, ScriptedTransport};
    use crate::validation::Severity;
    use std::time::Duration;

    fn slow_retry() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(4)
            .with_base_delay_ms(300)
            .with_max_delay_ms(2_000)
            .with_jitter(JitterStrategy::None)
    }

    fn validator(transport: ScriptedTransport) -> SemanticValidator {
        let orchestrator = ModelCallOrchestrator::new(
            Arc::new(transport),
            RetryConfig::new().with_max_attempts(1),
            Duration::from_secs(1),
        );
        SemanticValidator::new(
            Arc::new(orchestrator),
            PromptTemplate::new("review", "judge", "{stage} {requirement_name} {scope}\n{candidate}"),
        )
    }

    fn ctx() -> ValidationContext {
        ValidationContext::new(PipelineStage::CosmicTable, "订单系统", 40)
    }

    #[test]
    fn test_parse_review_promotes_to_logic() {
        let findings = parse_review(
            r#"Review:
            [{"severity": "syntax", "location": 3, "message": "wrong group", "suggested_fix": "use 订单"},
             {"severity": "system", "location": "overall", "message": "too thin"},
             {"severity": "logic", "message": ""}]"#,
        )
        .unwrap();
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.severity == Severity::Logic));
        assert_eq!(findings[0].location, Location::Row { row: 2 });
        assert_eq!(findings[0].suggested_fix.as_deref(), Some("use 订单"));
        assert_eq!(
            findings[1].location,
            Location::Described {
                text: "overall".to_string()
            }
        );
    }

    #[test]
    fn test_parse_review_accepts_structured_location() {
        let findings =
            parse_review(r#"[{"location": {"kind": "row", "row": 1}, "message": "m"}]"#).unwrap();
        assert_eq!(findings[0].location, Location::Row { row: 1 });
    }

    #[tokio::test]
    async fn test_review_returns_findings() {
        let v = validator(ScriptedTransport::new(vec![ScriptStep::reply(
            r#"[{"severity": "logic", "location": 1, "message": "implausible"}]"#,
        )]));
        let findings = v.validate(&Candidate::Table(CosmicTable::default()), &ctx()).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].source, FindingSource::Semantic);
    }

    #[tokio::test]
    async fn test_review_failure_is_silent() {
        let v = validator(ScriptedTransport::always(ScriptStep::fail(TransportErrorKind::Unavailable)));
        let findings = v.validate(&Candidate::Table(CosmicTable::default()), &ctx()).await;
        assert!(findings.is_empty());

        let v = validator(ScriptedTransport::new(vec![ScriptStep::reply("looks fine")]));
        let findings = v.validate(&Candidate::Table(CosmicTable::default()), &ctx()).await;
        assert!(findings.is_empty());
    }

    #[test]
    fn test_window_bounds_are_configurable() {
        let bounds = WindowConfig::default().with_max_entries(4).with_max_tokens(512);
        let v = validator(ScriptedTransport::new(vec![])).with_window(bounds.clone());
        assert_eq!(v.window(), &bounds);
    }

    #[tokio::test]
    async fn test_review_skipped_once_cancelled() {
        let transport = Arc::new(ScriptedTransport::always(ScriptStep::reply("[]")));
        let v = SemanticValidator::new(
            Arc::new(ModelCallOrchestrator::new(transport.clone(), slow_retry(), Duration::from_secs(1))),
            PromptTemplate::new("review", "judge", "{candidate}"),
        );
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("operator stop");
        let findings = v
            .validate(&Candidate::Table(CosmicTable::default()), &ctx().with_cancel(cancel))
            .await;
        assert!(findings.is_empty());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_review_retries() {
        let transport = Arc::new(ScriptedTransport::always(ScriptStep::fail(TransportErrorKind::Unavailable)));
        let v = SemanticValidator::new(
            Arc::new(ModelCallOrchestrator::new(transport.clone(), slow_retry(), Duration::from_secs(1))),
            PromptTemplate::new("review", "judge", "{candidate}"),
        );
        let cancel = Arc::new(CancellationToken::new());
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel("operator stop");
            })
        };

        let started = std::time::Instant::now();
        let findings = v
            .validate(&Candidate::Table(CosmicTable::default()), &ctx().with_cancel(cancel))
            .await;
        canceller.await.unwrap();

        assert!(findings.is_empty());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(transport.call_count(), 1);
    }
}
