//! Generate, validate, fix or re-prompt, until a terminal state.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::{CorrectionConfig, CorrectionState, Decision, RoundRecord};
use crate::codec;
use crate::context::{ConversationWindow, EntryId};
use crate::core::{Candidate, PipelineStage};
use crate::errors::{CallError, StageFailure, StageFailureKind};
use crate::events::{names, payload, EventSink, NoOpEventSink};
use crate::llm::{variables, CallOptions, ModelCallOrchestrator, PromptTemplate, RenderedPrompt};
use crate::validation::{Finding, FindingSource, ValidationContext, ValidationEngine, ValidationReport};

/// A candidate that passed validation.
#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    /// The validated candidate, auto-fixes applied.
    pub candidate: Candidate,
    /// The final report; only advisory findings remain.
    pub report: ValidationReport,
    /// Every validation pass.
    pub history: Vec<RoundRecord>,
    /// Logic rounds consumed.
    pub rounds: usize,
    /// Fixes applied in place.
    pub autofixes: usize,
    /// Model calls made.
    pub calls: usize,
}

/// Drives one stage (or one batch) through the correction state machine.
pub struct CorrectionLoop {
    orchestrator: Arc<ModelCallOrchestrator>,
    engine: ValidationEngine,
    correction_prompt: PromptTemplate,
    config: CorrectionConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CorrectionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectionLoop")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CorrectionLoop {
    /// Creates a loop.
    ///
    /// `correction_prompt` receives `{findings}` and `{candidate}`.
    #[must_use]
    pub fn new(
        orchestrator: Arc<ModelCallOrchestrator>,
        engine: ValidationEngine,
        correction_prompt: PromptTemplate,
        config: CorrectionConfig,
    ) -> Self {
        Self {
            orchestrator,
            engine,
            correction_prompt,
            config,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The limits in use.
    #[must_use]
    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    /// Runs the loop from `prompt` until the candidate passes or escalates.
    ///
    /// Transient call failures are retried by the orchestrator; an exhausted
    /// call becomes a system finding and escalates. Fatal call errors and
    /// cancellation end the loop without consuming rounds.
    pub async fn run(
        &self,
        prompt: &RenderedPrompt,
        ctx: &ValidationContext,
        window: &mut ConversationWindow,
        options: CallOptions<'_>,
    ) -> Result<CorrectionOutcome, Box<StageFailure>> {
        let stage = ctx.stage;
        let label = options.label.unwrap_or(stage.as_str()).to_string();
        let mut state = CorrectionState::new(self.config.clone());
        let mut request = prompt.clone();
        let mut original: Option<EntryId> = None;
        let mut last: Option<Candidate> = None;
        let mut calls = 0;

        loop {
            state.mark_generating();
            if let Some(id) = original {
                window.touch(id);
            }
            calls += 1;
            let outcome = match self.orchestrator.call_rendered(&request, window, options).await {
                Ok(outcome) => outcome,
                Err(CallError::Exhausted { attempts, last: error }) => {
                    let finding = Finding::system(
                        "call.exhausted",
                        format!("completion service failed {attempts} times: {error}"),
                    )
                    .from_source(FindingSource::Call);
                    let report = ValidationReport::new(stage, vec![finding]);
                    let reason = match state.decide(&report) {
                        Decision::Escalate(reason) => reason,
                        _ => report.summary(),
                    };
                    return Err(self.escalate(stage, &label, reason, state.into_history(), last));
                }
                Err(CallError::Cancelled(reason)) => {
                    return Err(Box::new(
                        StageFailure::new(stage, StageFailureKind::Cancelled, reason)
                            .with_history(state.into_history())
                            .with_last_candidate(last),
                    ));
                }
                Err(error) => {
                    return Err(Box::new(
                        StageFailure::new(stage, StageFailureKind::Fatal, error.to_string())
                            .with_history(state.into_history())
                            .with_last_candidate(last),
                    ));
                }
            };
            original.get_or_insert(outcome.prompt_entry);

            let raw = outcome.completion.content;
            let (mut candidate, extraction) = match codec::decode(stage, &raw) {
                Ok(candidate) => (Some(candidate), None),
                Err(error) => {
                    debug!(label = %label, error = %error, "Completion has no extractable candidate");
                    (None, Some(codec::extraction_finding(&error)))
                }
            };

            loop {
                state.mark_validating();
                let report = match candidate {
                    Some(ref c) => self.engine.validate(c, ctx).await,
                    None => ValidationReport::new(stage, extraction.iter().cloned().collect()),
                };
                // A review cut short by cancellation must not let the candidate pass.
                if let Some(cancel) = options.cancel.filter(|c| c.is_cancelled()) {
                    let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                    return Err(Box::new(
                        StageFailure::new(stage, StageFailureKind::Cancelled, reason)
                            .with_history(state.into_history())
                            .with_last_candidate(candidate.or(last)),
                    ));
                }

                match state.decide(&report) {
                    Decision::Pass => {
                        let Some(candidate) = candidate else {
                            return Err(self.escalate(
                                stage,
                                &label,
                                "passed without a candidate".to_string(),
                                state.into_history(),
                                last,
                            ));
                        };
                        debug!(label = %label, rounds = state.round(), autofixes = state.autofixes(), "Candidate passed");
                        return Ok(CorrectionOutcome {
                            candidate,
                            report,
                            rounds: state.round(),
                            autofixes: state.autofixes(),
                            history: state.into_history(),
                            calls,
                        });
                    }
                    Decision::AutoFix(fixes) => {
                        let applied = candidate
                            .as_mut()
                            .map_or(0, |c| fixes.iter().filter(|fix| fix.apply(c)).count());
                        debug!(label = %label, proposed = fixes.len(), applied, "Applied auto-fixes");
                        self.events.try_emit(
                            names::CORRECTION_AUTOFIX,
                            payload(serde_json::json!({
                                "label": label,
                                "stage": stage.as_str(),
                                "fixes": fixes,
                                "applied": applied,
                            })),
                        );
                    }
                    Decision::Reprompt(findings) => {
                        if candidate.is_some() {
                            last.clone_from(&candidate);
                        }
                        let shown = candidate.as_ref().map_or_else(|| raw.clone(), Candidate::render);
                        request = self.correction_request(prompt, &findings, &shown).map_err(|error| {
                            Box::new(
                                StageFailure::new(stage, StageFailureKind::Fatal, error.to_string())
                                    .with_history(state.history().to_vec())
                                    .with_last_candidate(candidate.clone().or_else(|| last.clone())),
                            )
                        })?;
                        info!(
                            label = %label,
                            round = state.round(),
                            max_rounds = state.max_rounds(),
                            findings = findings.len(),
                            "Re-prompting for corrections"
                        );
                        self.events.try_emit(
                            names::CORRECTION_ROUND,
                            payload(serde_json::json!({
                                "label": label,
                                "stage": stage.as_str(),
                                "round": state.round(),
                                "findings": findings.len(),
                            })),
                        );
                        break;
                    }
                    Decision::Escalate(reason) => {
                        if candidate.is_some() {
                            last = candidate;
                        }
                        return Err(self.escalate(stage, &label, reason, state.into_history(), last));
                    }
                }
            }
        }
    }

    /// The re-prompt keeps the original system instructions and adds the
    /// correction instructions after them.
    fn correction_request(
        &self,
        original: &RenderedPrompt,
        findings: &[Finding],
        candidate: &str,
    ) -> Result<RenderedPrompt, CallError> {
        let listed = findings
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{}. {}", i + 1, f.render()))
            .collect::<Vec<_>>()
            .join("\n");
        let vars = variables([("findings", listed), ("candidate", candidate.to_string())]);
        let correction = self.correction_prompt.render(&vars)?;
        let system = match (original.system.trim().is_empty(), correction.system.trim().is_empty()) {
            (true, _) => correction.system,
            (false, true) => original.system.clone(),
            (false, false) => format!("{}\n\n{}", original.system, correction.system),
        };
        Ok(RenderedPrompt {
            system,
            user: correction.user,
        })
    }

    fn escalate(
        &self,
        stage: PipelineStage,
        label: &str,
        reason: String,
        history: Vec<RoundRecord>,
        last: Option<Candidate>,
    ) -> Box<StageFailure> {
        warn!(label, stage = %stage, reason = %reason, "Escalating to operator");
        self.events.try_emit(
            names::STAGE_ESCALATED,
            payload(serde_json::json!({
                "label": label,
                "stage": stage.as_str(),
                "reason": reason,
                "passes": history.len(),
            })),
        );
        Box::new(
            StageFailure::new(stage, StageFailureKind::Escalated, reason)
                .with_history(history)
                .with_last_candidate(last),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WindowConfig;
    use crate::core::{Column, CosmicTable};
    use crate::errors::TransportErrorKind;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{PromptSet, RetryConfig};
    use crate::testing::fixtures::{table_completion, SAMPLE_REQUIREMENT};
    use crate::testing::{sample_outline, table_for_events, ScriptStep, ScriptedTransport};
    use crate::validation::{RuleSetConfig, Severity};
    use std::time::Duration;

    fn correction_loop(transport: &Arc<ScriptedTransport>, config: CorrectionConfig) -> CorrectionLoop {
        let orchestrator = ModelCallOrchestrator::new(
            transport.clone(),
            RetryConfig::new().with_max_attempts(2).with_base_delay_ms(1).with_max_delay_ms(2),
            Duration::from_secs(1),
        );
        CorrectionLoop::new(
            Arc::new(orchestrator),
            ValidationEngine::with_rules(RuleSetConfig::default()),
            PromptSet::default().correction,
            config,
        )
    }

    fn prompt() -> RenderedPrompt {
        RenderedPrompt {
            system: "sys".into(),
            user: "generate the table".into(),
        }
    }

    fn ctx() -> ValidationContext {
        ValidationContext::new(PipelineStage::CosmicTable, SAMPLE_REQUIREMENT, 40)
    }

    fn good() -> CosmicTable {
        table_for_events(SAMPLE_REQUIREMENT, &sample_outline().events[..1])
    }

    fn broken() -> CosmicTable {
        let mut table = good();
        table.rows[0].set(Column::MovementType, "R");
        table
    }

    #[tokio::test]
    async fn test_passes_first_time() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptStep::reply(table_completion(&good()))]));
        let mut window = ConversationWindow::new(WindowConfig::default());
        let outcome = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut window, CallOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.calls, 1);
        assert_eq!(outcome.candidate.as_table(), Some(&good()));
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_syntax_fixed_in_place_without_model() {
        let mut table = good();
        table.rows[0].set(Column::MovementType, "Entry");
        table.rows[1].set(Column::DataGroup, "**创建订单存量记录**");
        table.rows[2].set(Column::DataAttributes, "创建订单结果编码, 创建订单结果说明");
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptStep::reply(table_completion(&table))]));
        let events = Arc::new(CollectingEventSink::new());
        let outcome = correction_loop(&transport, CorrectionConfig::default())
            .with_events(events.clone())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(transport.call_count(), 1);
        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.autofixes, 3);
        assert_eq!(outcome.candidate.as_table(), Some(&good()));
        assert_eq!(events.count(names::CORRECTION_AUTOFIX), 1);
    }

    #[tokio::test]
    async fn test_logic_finding_reprompts_with_findings() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptStep::reply(table_completion(&broken())),
            ScriptStep::reply(table_completion(&good())),
        ]));
        let outcome = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.calls, 2);
        assert!(outcome.history[0].reprompted);

        let requests = transport.requests();
        let correction = requests[1].prompt().unwrap();
        assert!(correction.content.contains("expected E"));
        assert!(requests[1].messages.iter().any(|m| m.content == "generate the table"));
    }

    #[tokio::test]
    async fn test_reprompt_keeps_original_system_instructions() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptStep::reply(table_completion(&broken())),
            ScriptStep::reply(table_completion(&good())),
        ]));
        correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].system, "sys");
        assert!(requests[1].system.starts_with("sys"));
        assert!(requests[1].system.contains(&PromptSet::default().correction.system));
    }

    #[tokio::test]
    async fn test_unreadable_replies_keep_last_candidate() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptStep::reply(table_completion(&broken())),
            ScriptStep::reply("Sorry, I cannot."),
            ScriptStep::reply("Sorry, I cannot."),
        ]));
        let failure = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::Escalated);
        assert_eq!(transport.call_count(), 3);
        assert_eq!(failure.last_candidate.as_ref().and_then(Candidate::as_table), Some(&broken()));
    }

    #[tokio::test]
    async fn test_three_logic_failures_escalate() {
        let transport = Arc::new(ScriptedTransport::always(ScriptStep::reply(table_completion(&broken()))));
        let failure = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::Escalated);
        assert_eq!(transport.call_count(), 3);
        assert_eq!(failure.history.len(), 3);
        assert_eq!(failure.last_candidate.as_ref().and_then(Candidate::as_table), Some(&broken()));
    }

    #[tokio::test]
    async fn test_missing_table_is_logic() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptStep::reply("I cannot produce that table."),
            ScriptStep::reply(table_completion(&good())),
        ]));
        let outcome = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.history[0].findings[0].severity, Severity::Logic);
    }

    #[tokio::test]
    async fn test_exhausted_call_escalates_without_rounds() {
        let transport = Arc::new(ScriptedTransport::always(ScriptStep::fail(TransportErrorKind::RateLimited)));
        let failure = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::Escalated);
        assert_eq!(transport.call_count(), 2);
        assert_eq!(failure.history[0].findings[0].severity, Severity::System);
        assert_eq!(failure.history[0].round, 0);
    }

    #[tokio::test]
    async fn test_fatal_call_error_is_not_escalation() {
        let transport = Arc::new(ScriptedTransport::always(ScriptStep::fail(TransportErrorKind::Authentication)));
        let failure = correction_loop(&transport, CorrectionConfig::default())
            .run(&prompt(), &ctx(), &mut ConversationWindow::new(WindowConfig::default()), CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::Fatal);
        assert_eq!(transport.call_count(), 1);
    }
}
