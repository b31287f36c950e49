//! Runs the two generation stages for one requirement.
//!
//! Stage 1 turns the requirement into a trigger-event outline, frozen as an
//! [`OutlineArtifact`]. Stage 2 plans batches over the outline and expands
//! each batch into table rows through its own correction loop. Batches run
//! with bounded parallelism; each one owns its conversation window and
//! correction state, and validated batches are merged in plan order.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::batch::{Batch, BatchPlanner, RowRateEstimator};
use super::prompts::BATCH_EVENTS_HEADING;
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::context::ConversationWindow;
use crate::core::{
    Candidate, CosmicTable, OutlineArtifact, PipelineStage, RequirementOutline, StageSelection,
    TriggerEvent,
};
use crate::correction::CorrectionLoop;
use crate::errors::{CallError, ConfigError, CosmicflowError, StageFailure, StageFailureKind};
use crate::events::{names, payload, EventSink, NoOpEventSink};
use crate::llm::{variables, CallOptions, CompletionTransport, ModelCallOrchestrator, TokenSink};
use crate::utils::generate_run_id;
use crate::validation::{
    BatchScope, Finding, SemanticValidator, ValidationContext, ValidationEngine, Validator,
};

/// Outcome of one merged batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Zero-based batch index.
    pub index: usize,
    /// Trigger events of the batch.
    pub event_ids: Vec<String>,
    /// Rows predicted when the batch started.
    pub predicted_rows: usize,
    /// Rows merged.
    pub actual_rows: usize,
    /// Correction rounds consumed.
    pub rounds: usize,
    /// Fixes applied in place.
    pub autofixes: usize,
    /// Findings of the final validation pass (advisory only).
    pub findings: Vec<Finding>,
}

/// Generated rows against the requirement's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completeness {
    /// Target row count of the requirement.
    pub target_rows: usize,
    /// Rows generated.
    pub total_rows: usize,
    /// `total_rows - target_rows`.
    pub deviation: i64,
    /// Allowed absolute deviation.
    pub tolerance: usize,
    /// Whether the deviation is within tolerance.
    pub within_tolerance: bool,
}

impl Completeness {
    /// Compares `total_rows` with `target_rows`.
    #[must_use]
    pub fn measure(target_rows: usize, total_rows: usize, tolerance: usize) -> Self {
        let signed = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        let deviation = signed(total_rows).saturating_sub(signed(target_rows));
        Self {
            target_rows,
            total_rows,
            deviation,
            tolerance,
            within_tolerance: deviation.unsigned_abs() <= tolerance as u64,
        }
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Identifier of the run, also attached to its log lines.
    pub run_id: Uuid,
    /// The requirement that was processed.
    pub requirement: RequirementOutline,
    /// The stage 1 artifact, generated or supplied.
    pub outline: OutlineArtifact,
    /// Merged table; empty if stage 2 did not run.
    pub table: CosmicTable,
    /// One report per batch, in plan order.
    pub batches: Vec<BatchReport>,
    /// Rows in `table`.
    pub total_rows: usize,
    /// Row count against the target; `None` if stage 2 did not run.
    pub completeness: Option<Completeness>,
}

impl PipelineReport {
    /// Human-readable check result.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Requirement: {}", self.requirement.name),
            format!(
                "Outline: {} trigger events, {} functional processes ({})",
                self.outline.outline.events.len(),
                self.outline.outline.process_count(),
                self.outline.short_hash()
            ),
        ];
        for batch in &self.batches {
            lines.push(format!(
                "Batch {}: {} rows (predicted {}), {} rounds, {} auto-fixes, {} notes",
                batch.index + 1,
                batch.actual_rows,
                batch.predicted_rows,
                batch.rounds,
                batch.autofixes,
                batch.findings.len()
            ));
        }
        if let Some(c) = self.completeness {
            let verdict = if c.within_tolerance { "within" } else { "outside" };
            lines.push(format!(
                "Rows: {} of target {} ({:+}, {verdict} tolerance {})",
                c.total_rows, c.target_rows, c.deviation, c.tolerance
            ));
        }
        lines.join("\n")
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), json!(self.run_id.to_string()));
        map.insert("requirement".to_string(), json!(self.requirement.name));
        map.insert("outline_hash".to_string(), json!(self.outline.content_hash));
        map.insert("total_rows".to_string(), json!(self.total_rows));
        map.insert(
            "batches".to_string(),
            serde_json::to_value(&self.batches).unwrap_or(Value::Null),
        );
        map.insert(
            "completeness".to_string(),
            serde_json::to_value(self.completeness).unwrap_or(Value::Null),
        );
        map
    }
}

/// State shared by the batches of one stage 2 run.
struct BatchRun<'a> {
    requirement: &'a RequirementOutline,
    events: &'a [TriggerEvent],
    planner: &'a BatchPlanner,
    correction: &'a CorrectionLoop,
    batch_count: usize,
    estimator: Mutex<RowRateEstimator>,
    merged: Mutex<BTreeMap<usize, CosmicTable>>,
    reports: DashMap<usize, BatchReport>,
    cancel: Arc<CancellationToken>,
    next_start: Mutex<Option<Instant>>,
}

/// Sequences stage 1 and stage 2 for a requirement.
pub struct PipelineCoordinator {
    config: EngineConfig,
    transport: Arc<dyn CompletionTransport>,
    orchestrator: Arc<ModelCallOrchestrator>,
    events: Arc<dyn EventSink>,
    validators: Vec<Arc<dyn Validator>>,
    token_sink: Option<Arc<dyn TokenSink>>,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("provider", &self.transport.provider())
            .field("pipeline", &self.config.pipeline)
            .field("validators", &self.validators.len())
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    /// Creates a coordinator after validating `config`.
    pub fn new(config: EngineConfig, transport: Arc<dyn CompletionTransport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let events: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        let orchestrator = Self::orchestrator(&config, &transport, &events);
        Ok(Self {
            config,
            transport,
            orchestrator,
            events,
            validators: Vec::new(),
            token_sink: None,
        })
    }

    fn orchestrator(
        config: &EngineConfig,
        transport: &Arc<dyn CompletionTransport>,
        events: &Arc<dyn EventSink>,
    ) -> Arc<ModelCallOrchestrator> {
        Arc::new(
            ModelCallOrchestrator::new(
                transport.clone(),
                config.retry.clone(),
                Duration::from_secs(config.pipeline.call_timeout_seconds),
            )
            .with_events(events.clone()),
        )
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.orchestrator = Self::orchestrator(&self.config, &self.transport, &events);
        self.events = events;
        self
    }

    /// Adds a validator after the rule validator (and the reviewer, if enabled).
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Sets the sink receiving streamed tokens when streaming is enabled.
    #[must_use]
    pub fn with_token_sink(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.token_sink = Some(sink);
        self
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs the selected stages.
    ///
    /// `outline` is read only when stage 1 does not run.
    pub async fn run(
        &self,
        requirement: &RequirementOutline,
        selection: StageSelection,
        outline: Option<OutlineArtifact>,
    ) -> Result<PipelineReport, CosmicflowError> {
        let cancel = Arc::new(CancellationToken::new());
        self.run_with_cancel(requirement, selection, outline, &cancel).await
    }

    /// Runs the selected stages until done or until `cancel` fires.
    ///
    /// Cancellation stops further calls and correction rounds. Batches
    /// merged before it are returned in the failure's `merged` table.
    pub async fn run_with_cancel(
        &self,
        requirement: &RequirementOutline,
        selection: StageSelection,
        outline: Option<OutlineArtifact>,
        cancel: &Arc<CancellationToken>,
    ) -> Result<PipelineReport, CosmicflowError> {
        requirement.ensure_valid()?;
        let run_id = generate_run_id();
        let span = info_span!("pipeline", run_id = %run_id, requirement = %requirement.name);
        self.run_stages(run_id, requirement, selection, outline, cancel)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        requirement: &RequirementOutline,
        selection: StageSelection,
        outline: Option<OutlineArtifact>,
        cancel: &Arc<CancellationToken>,
    ) -> Result<PipelineReport, CosmicflowError> {
        info!(selection = %selection, target_rows = requirement.target_rows, "Starting pipeline");

        let outline = if selection.runs_trigger_events() {
            self.extract_trigger_events(requirement, cancel).await?
        } else {
            let artifact = outline.ok_or(CosmicflowError::MissingOutline)?;
            artifact.verify()?;
            artifact
        };

        let mut report = PipelineReport {
            run_id,
            requirement: requirement.clone(),
            outline,
            table: CosmicTable::default(),
            batches: Vec::new(),
            total_rows: 0,
            completeness: None,
        };
        if !selection.runs_cosmic_table() {
            return Ok(report);
        }

        let (table, batches) = self.generate_table(requirement, &report.outline, cancel).await?;
        let completeness = Completeness::measure(
            requirement.target_rows,
            table.len(),
            self.config.batch.tolerance_rows(requirement.target_rows),
        );
        if !completeness.within_tolerance {
            warn!(
                total_rows = completeness.total_rows,
                target_rows = completeness.target_rows,
                deviation = completeness.deviation,
                "Generated row count strays from the target"
            );
            self.events.try_emit(
                names::COMPLETENESS_DEVIATION,
                payload(serde_json::to_value(completeness).unwrap_or(Value::Null)),
            );
        }
        report.total_rows = table.len();
        report.table = table;
        report.batches = batches;
        report.completeness = Some(completeness);
        Ok(report)
    }

    fn validation_engine(&self) -> ValidationEngine {
        let mut engine = ValidationEngine::with_rules(self.config.rules.clone());
        if self.config.pipeline.semantic_validation {
            engine = engine.with_validator(Arc::new(
                SemanticValidator::new(self.orchestrator.clone(), self.config.prompts.semantic_review.clone())
                    .with_window(self.config.window.clone()),
            ));
        }
        self.validators
            .iter()
            .fold(engine, |engine, v| engine.with_validator(v.clone()))
    }

    fn correction_loop(&self) -> CorrectionLoop {
        CorrectionLoop::new(
            self.orchestrator.clone(),
            self.validation_engine(),
            self.config.prompts.correction.clone(),
            self.config.correction.clone(),
        )
        .with_events(self.events.clone())
    }

    fn call_options<'a>(&'a self, cancel: &'a CancellationToken, label: &'a str) -> CallOptions<'a> {
        let options = CallOptions::new().cancellable(cancel).labelled(label);
        match self.token_sink.as_deref() {
            Some(sink) if self.config.pipeline.streaming => options.streaming(sink),
            _ => options,
        }
    }

    async fn extract_trigger_events(
        &self,
        requirement: &RequirementOutline,
        cancel: &Arc<CancellationToken>,
    ) -> Result<OutlineArtifact, CosmicflowError> {
        let stage = PipelineStage::TriggerEvents;
        self.events.try_emit(
            names::STAGE_STARTED,
            payload(json!({"stage": stage.as_str(), "requirement": requirement.name})),
        );

        let rules = &self.config.rules;
        let (process_min, process_max) = rules.process_range(requirement.target_rows);
        let vars = variables([
            ("requirement_name", requirement.name.clone()),
            ("background", requirement.background.clone()),
            ("functional_users", requirement.functional_users.label()),
            ("detailed_plan", requirement.detailed_plan.clone()),
            ("target_rows", requirement.target_rows.to_string()),
            ("process_min", process_min.to_string()),
            ("process_max", process_max.to_string()),
            ("max_processes_per_event", rules.max_processes_per_event.to_string()),
        ]);
        let prompt = self
            .config
            .prompts
            .trigger_events
            .render(&vars)
            .map_err(CallError::from)?;

        let ctx = ValidationContext::new(stage, requirement.name.clone(), requirement.target_rows)
            .with_cancel(cancel.clone());
        let mut window = ConversationWindow::new(self.config.window.clone());
        let outcome = self
            .correction_loop()
            .run(&prompt, &ctx, &mut window, self.call_options(cancel, stage.as_str()))
            .await?;

        let Candidate::Outline(mut outline) = outcome.candidate else {
            return Err(StageFailure::new(stage, StageFailureKind::Fatal, "stage produced a table instead of an outline").into());
        };
        outline.assign_missing_ids();
        let artifact = OutlineArtifact::new(outline)?;

        info!(
            events = artifact.outline.events.len(),
            processes = artifact.outline.process_count(),
            hash = artifact.short_hash(),
            rounds = outcome.rounds,
            "Trigger events extracted"
        );
        self.events.try_emit(
            names::STAGE_COMPLETED,
            payload(json!({
                "stage": stage.as_str(),
                "events": artifact.outline.events.len(),
                "processes": artifact.outline.process_count(),
                "hash": artifact.content_hash,
                "rounds": outcome.rounds,
                "autofixes": outcome.autofixes,
            })),
        );
        Ok(artifact)
    }

    async fn generate_table(
        &self,
        requirement: &RequirementOutline,
        artifact: &OutlineArtifact,
        cancel: &Arc<CancellationToken>,
    ) -> Result<(CosmicTable, Vec<BatchReport>), CosmicflowError> {
        let stage = PipelineStage::CosmicTable;
        self.events.try_emit(
            names::STAGE_STARTED,
            payload(json!({"stage": stage.as_str(), "outline": artifact.content_hash})),
        );

        let planner = BatchPlanner::new(self.config.batch.clone());
        let events = artifact.outline.events.as_slice();
        let batches = planner.plan(events);
        info!(batches = batches.len(), processes = artifact.outline.process_count(), "Planned batches");
        self.events.try_emit(
            names::BATCH_PLANNED,
            payload(json!({
                "batches": batches
                    .iter()
                    .map(|b| json!({
                        "index": b.index,
                        "events": b.event_ids,
                        "processes": b.process_count,
                        "predicted_rows": b.predicted_rows,
                    }))
                    .collect::<Vec<_>>(),
            })),
        );

        let correction = self.correction_loop();
        let run = BatchRun {
            requirement,
            events,
            planner: &planner,
            correction: &correction,
            batch_count: batches.len(),
            estimator: Mutex::new(RowRateEstimator::new(self.config.batch.default_rows_per_process)),
            merged: Mutex::new(BTreeMap::new()),
            reports: DashMap::new(),
            cancel: CancellationToken::child_of(cancel),
            next_start: Mutex::new(None),
        };

        let parallelism = self.config.pipeline.parallelism.max(1);
        let mut queue = batches.iter();
        let mut running = FuturesUnordered::new();
        let mut started = 0;
        let mut failure: Option<Box<StageFailure>> = None;

        loop {
            while failure.is_none() && running.len() < parallelism && !run.cancel.is_cancelled() {
                let Some(batch) = queue.next() else { break };
                started += 1;
                running.push(self.run_batch(&run, batch));
            }
            let Some(result) = running.next().await else { break };
            if let Err(error) = result {
                if error.kind != StageFailureKind::Cancelled {
                    run.cancel.cancel(format!("batch {} failed", error.batch.map_or(0, |b| b + 1)));
                }
                failure = match failure {
                    Some(existing) if existing.kind != StageFailureKind::Cancelled || error.kind == StageFailureKind::Cancelled => {
                        Some(existing)
                    }
                    _ => Some(error),
                };
            }
        }
        drop(running);

        let BatchRun { merged, reports, cancel: stage_cancel, .. } = run;
        let merged = merged.into_inner();
        let finished = merged.len();
        // Only the unbroken run of batches from the first one is kept, so a
        // failed batch never leaves a gap in the merged table.
        let table = merged
            .into_iter()
            .enumerate()
            .take_while(|(position, (index, _))| position == index)
            .fold(CosmicTable::default(), |mut table, (_, (_, part))| {
                table.append(part);
                table
            });

        if failure.is_none() && started < batches.len() {
            let reason = stage_cancel.reason().unwrap_or_else(|| "cancelled".to_string());
            failure = Some(Box::new(
                StageFailure::new(stage, StageFailureKind::Cancelled, reason).with_batch(started),
            ));
        }
        if let Some(mut failure) = failure {
            warn!(
                batch = failure.batch.map(|b| b + 1),
                kind = %failure.kind,
                merged_rows = table.len(),
                finished_batches = finished,
                "Table generation stopped"
            );
            failure.merged = table;
            return Err(CosmicflowError::Stage(failure));
        }

        let mut batch_reports: Vec<BatchReport> = reports.into_iter().map(|(_, report)| report).collect();
        batch_reports.sort_by_key(|report| report.index);

        info!(rows = table.len(), batches = batch_reports.len(), "Table generated");
        self.events.try_emit(
            names::STAGE_COMPLETED,
            payload(json!({
                "stage": stage.as_str(),
                "rows": table.len(),
                "batches": batch_reports.len(),
            })),
        );
        Ok((table, batch_reports))
    }

    /// Waits for the batch's start slot when starts are paced.
    async fn pace(&self, run: &BatchRun<'_>) {
        let interval = Duration::from_millis(self.config.pipeline.request_interval_ms);
        if interval.is_zero() {
            return;
        }
        let slot = {
            let mut next = run.next_start.lock();
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    async fn run_batch(&self, run: &BatchRun<'_>, batch: &Batch) -> Result<(), Box<StageFailure>> {
        let stage = PipelineStage::CosmicTable;
        let fatal = |message: String| {
            Box::new(StageFailure::new(stage, StageFailureKind::Fatal, message).with_batch(batch.index))
        };

        self.pace(run).await;
        if run.cancel.is_cancelled() {
            let reason = run.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
            return Err(Box::new(
                StageFailure::new(stage, StageFailureKind::Cancelled, reason).with_batch(batch.index),
            ));
        }

        let requirement = run.requirement;
        let target = requirement.target_rows;
        let batch_events = batch.events(run.events);
        let predicted = run.estimator.lock().predict(batch.process_count);
        let (row_min, row_max) = run.planner.expected_range(predicted, target);
        let events_json = serde_json::to_string_pretty(batch_events).map_err(|e| fatal(e.to_string()))?;

        let vars = variables([
            ("requirement_name", requirement.name.clone()),
            ("background", requirement.background.clone()),
            ("functional_users", requirement.functional_users.label()),
            ("batch_number", (batch.index + 1).to_string()),
            ("batch_count", run.batch_count.to_string()),
            ("process_count", batch.process_count.to_string()),
            ("row_min", row_min.to_string()),
            ("row_max", row_max.to_string()),
            ("batch_events_heading", BATCH_EVENTS_HEADING.to_string()),
            ("events_json", events_json),
        ]);
        let prompt = self
            .config
            .prompts
            .cosmic_table
            .render(&vars)
            .map_err(|e| fatal(e.to_string()))?;

        let ctx = ValidationContext::new(stage, requirement.name.clone(), target).with_batch(BatchScope {
            index: batch.index,
            events: batch_events.to_vec(),
            predicted_rows: predicted,
            tolerance_rows: self.config.batch.tolerance_rows(target),
        })
        .with_cancel(run.cancel.clone());
        let label = format!("batch-{}", batch.index + 1);
        let mut window = ConversationWindow::new(self.config.window.clone());
        debug!(batch = batch.index + 1, events = batch.len(), predicted, row_min, row_max, "Generating batch");

        let outcome = run
            .correction
            .run(&prompt, &ctx, &mut window, self.call_options(&run.cancel, &label))
            .await
            .map_err(|mut failure| {
                failure.batch = Some(batch.index);
                failure
            })?;

        let Candidate::Table(table) = outcome.candidate else {
            return Err(fatal("batch produced an outline instead of a table".to_string()));
        };
        let rows = table.len();
        run.estimator.lock().record(batch.process_count, rows);
        run.reports.insert(
            batch.index,
            BatchReport {
                index: batch.index,
                event_ids: batch.event_ids.clone(),
                predicted_rows: predicted,
                actual_rows: rows,
                rounds: outcome.rounds,
                autofixes: outcome.autofixes,
                findings: outcome.report.findings,
            },
        );
        run.merged.lock().insert(batch.index, table);

        info!(batch = batch.index + 1, rows, predicted, rounds = outcome.rounds, "Batch merged");
        self.events.try_emit(
            names::BATCH_MERGED,
            payload(json!({
                "batch": batch.index,
                "rows": rows,
                "predicted_rows": predicted,
                "rounds": outcome.rounds,
                "autofixes": outcome.autofixes,
            })),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Column;
    use crate::events::CollectingEventSink;
    use crate::testing::fixtures::{batch_events, outline_completion, SAMPLE_REQUIREMENT};
    use crate::testing::{
        pipeline_responder, sample_outline, sample_requirement, table_for_events, RecordingTokenSink,
        ScriptStep, ScriptedTransport,
    };
    use crate::config::PipelineConfig;
    use crate::llm::CompletionRequest;
    use pretty_assertions::assert_eq;

    fn coordinator(transport: &Arc<ScriptedTransport>, config: EngineConfig) -> PipelineCoordinator {
        PipelineCoordinator::new(config, transport.clone()).unwrap()
    }

    fn responding() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::responding(pipeline_responder(SAMPLE_REQUIREMENT)))
    }

    #[tokio::test]
    async fn test_full_run() {
        let transport = responding();
        let events = Arc::new(CollectingEventSink::new());
        let report = coordinator(&transport, EngineConfig::default())
            .with_events(events.clone())
            .run(&sample_requirement(), StageSelection::Full, None)
            .await
            .unwrap();

        assert_eq!(report.outline.outline.process_count(), 13);
        assert_eq!(report.total_rows, 39);
        assert_eq!(report.table, table_for_events(SAMPLE_REQUIREMENT, &sample_outline().events));
        let sizes: Vec<usize> = report.batches.iter().map(|b| b.event_ids.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(report.batches.iter().all(|b| b.rounds == 0));
        let completeness = report.completeness.unwrap();
        assert_eq!(completeness.deviation, -1);
        assert!(completeness.within_tolerance);

        assert_eq!(transport.call_count(), 4);
        assert_eq!(events.count(names::BATCH_MERGED), 3);
        assert_eq!(events.count(names::STAGE_COMPLETED), 2);
        assert_eq!(events.count(names::COMPLETENESS_DEVIATION), 0);
        assert!(report.summary().contains("Rows: 39 of target 40"));
        let dict = report.to_dict();
        assert_eq!(dict["run_id"], json!(report.run_id.to_string()));
        assert_eq!(dict["total_rows"], 39);
    }

    #[tokio::test]
    async fn test_trigger_events_only() {
        let transport = responding();
        let report = coordinator(&transport, EngineConfig::default())
            .run(&sample_requirement(), StageSelection::TriggerEventsOnly, None)
            .await
            .unwrap();
        assert_eq!(report.outline.outline.events.len(), 5);
        assert!(report.table.is_empty());
        assert!(report.completeness.is_none());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_table_only_reuses_artifact() {
        let transport = responding();
        let coordinator = coordinator(&transport, EngineConfig::default());
        let err = coordinator
            .run(&sample_requirement(), StageSelection::CosmicTableOnly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CosmicflowError::MissingOutline));

        let artifact = OutlineArtifact::new(sample_outline()).unwrap();
        let report = coordinator
            .run(&sample_requirement(), StageSelection::CosmicTableOnly, Some(artifact.clone()))
            .await
            .unwrap();
        assert_eq!(report.outline, artifact);
        assert_eq!(report.total_rows, 39);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_parallel_batches_merge_in_plan_order() {
        let transport = responding();
        let config = EngineConfig::default().with_pipeline(PipelineConfig::default().with_parallelism(3));
        let report = coordinator(&transport, config)
            .run(&sample_requirement(), StageSelection::Full, None)
            .await
            .unwrap();
        assert_eq!(report.table, table_for_events(SAMPLE_REQUIREMENT, &sample_outline().events));
        let indices: Vec<usize> = report.batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_escalated_batch_keeps_merged_rows() {
        let transport = Arc::new(ScriptedTransport::responding(|request: &CompletionRequest| {
            let batch = request.messages.iter().rev().find_map(|m| batch_events(&m.content));
            match batch {
                Some(events) if events.iter().any(|e| e.id == "TE-3") => {
                    let mut table = table_for_events(SAMPLE_REQUIREMENT, &events);
                    table.rows[0].set(Column::MovementType, "R");
                    ScriptStep::reply(table.to_markdown())
                }
                Some(events) => ScriptStep::reply(table_for_events(SAMPLE_REQUIREMENT, &events).to_markdown()),
                None => ScriptStep::reply(outline_completion(&sample_outline())),
            }
        }));
        let err = coordinator(&transport, EngineConfig::default())
            .run(&sample_requirement(), StageSelection::Full, None)
            .await
            .unwrap_err();
        let CosmicflowError::Stage(failure) = err else {
            panic!("expected a stage failure, got {err:?}");
        };
        assert_eq!(failure.kind, StageFailureKind::Escalated);
        assert_eq!(failure.batch, Some(1));
        assert_eq!(failure.history.len(), 3);
        assert_eq!(failure.merged.len(), 15);
        assert!(failure.last_candidate.is_some());
    }

    #[tokio::test]
    async fn test_parallel_escalation_keeps_only_leading_batches() {
        let transport = Arc::new(ScriptedTransport::responding(|request: &CompletionRequest| {
            match request.messages.iter().rev().find_map(|m| batch_events(&m.content)) {
                Some(events) if events.iter().any(|e| e.id == "TE-3") => {
                    let mut table = table_for_events(SAMPLE_REQUIREMENT, &events);
                    table.rows[0].set(Column::MovementType, "R");
                    ScriptStep::reply(table.to_markdown()).delayed(Duration::from_millis(20))
                }
                Some(events) => ScriptStep::reply(table_for_events(SAMPLE_REQUIREMENT, &events).to_markdown()),
                None => ScriptStep::reply(outline_completion(&sample_outline())),
            }
        }));
        let config = EngineConfig::default().with_pipeline(PipelineConfig::default().with_parallelism(3));
        let artifact = OutlineArtifact::new(sample_outline()).unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let err = coordinator(&transport, config)
            .with_events(events.clone())
            .run(&sample_requirement(), StageSelection::CosmicTableOnly, Some(artifact))
            .await
            .unwrap_err();
        let CosmicflowError::Stage(failure) = err else {
            panic!("expected a stage failure, got {err:?}");
        };

        assert_eq!(failure.kind, StageFailureKind::Escalated);
        assert_eq!(failure.batch, Some(1));
        // The third batch finished first but follows the failed one.
        assert_eq!(events.count(names::BATCH_MERGED), 2);
        assert_eq!(failure.merged, table_for_events(SAMPLE_REQUIREMENT, &sample_outline().events[..2]));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let transport = responding();
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("operator stop");
        let artifact = OutlineArtifact::new(sample_outline()).unwrap();
        let err = coordinator(&transport, EngineConfig::default())
            .run_with_cancel(&sample_requirement(), StageSelection::CosmicTableOnly, Some(artifact), &cancel)
            .await
            .unwrap_err();
        let CosmicflowError::Stage(failure) = err else {
            panic!("expected a stage failure");
        };
        assert_eq!(failure.kind, StageFailureKind::Cancelled);
        assert!(failure.merged.is_empty());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_semantic_review_runs_per_candidate() {
        let transport = responding();
        let config = EngineConfig::default()
            .with_pipeline(PipelineConfig::default().with_semantic_validation(true));
        let report = coordinator(&transport, config)
            .run(&sample_requirement(), StageSelection::Full, None)
            .await
            .unwrap();
        assert_eq!(report.total_rows, 39);
        assert_eq!(transport.call_count(), 8);
    }

    #[tokio::test]
    async fn test_cancellation_stops_semantic_review_retries() {
        let transport = Arc::new(ScriptedTransport::responding(|request: &CompletionRequest| {
            let prompt = request.prompt().map(|m| m.content.as_str()).unwrap_or_default();
            if prompt.contains(crate::pipeline::prompts::REVIEW_MARKER) {
                return ScriptStep::fail(crate::errors::TransportErrorKind::Unavailable);
            }
            match request.messages.iter().rev().find_map(|m| batch_events(&m.content)) {
                Some(events) => ScriptStep::reply(table_for_events(SAMPLE_REQUIREMENT, &events).to_markdown()),
                None => ScriptStep::reply(outline_completion(&sample_outline())),
            }
        }));
        let config = EngineConfig::default()
            .with_pipeline(PipelineConfig::default().with_semantic_validation(true))
            .with_retry(
                crate::pipeline::RetryConfig::new()
                    .with_max_attempts(4)
                    .with_base_delay_ms(300)
                    .with_max_delay_ms(2_000)
                    .with_jitter(crate::pipeline::JitterStrategy::None),
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
        let artifact = OutlineArtifact::new(sample_outline()).unwrap();
        let err = coordinator(&transport, config)
            .run_with_cancel(&sample_requirement(), StageSelection::CosmicTableOnly, Some(artifact), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        let CosmicflowError::Stage(failure) = err else {
            panic!("expected a stage failure, got {err:?}");
        };
        assert_eq!(failure.kind, StageFailureKind::Cancelled);
        assert!(failure.merged.is_empty());
        assert!(started.elapsed() < Duration::from_millis(300));
        // One generation and one review attempt for the first batch.
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_streaming_reaches_token_sink() {
        let transport = responding();
        let sink = Arc::new(RecordingTokenSink::new());
        let config = EngineConfig::default().with_pipeline(PipelineConfig::default().with_streaming(true));
        coordinator(&transport, config)
            .with_token_sink(sink.clone())
            .run(&sample_requirement(), StageSelection::TriggerEventsOnly, None)
            .await
            .unwrap();
        assert!(sink.text().contains("functional_user_requirements"));
    }

    #[tokio::test]
    async fn test_invalid_requirement_rejected() {
        let transport = responding();
        let err = coordinator(&transport, EngineConfig::default())
            .run(&RequirementOutline::new("", 40), StageSelection::Full, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CosmicflowError::InvalidRequirement(_)));
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn test_completeness_measure() {
        let c = Completeness::measure(40, 42, 1);
        assert_eq!(c.deviation, 2);
        assert!(!c.within_tolerance);
        assert!(Completeness::measure(40, 39, 1).within_tolerance);
    }
}
