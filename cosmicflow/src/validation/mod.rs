//! Candidate validation.
//!
//! A [`ValidationEngine`] runs a set of [`Validator`]s over a candidate and
//! merges their findings into one [`ValidationReport`]. Deterministic
//! validators always run first and their findings take precedence: a
//! best-effort finding at a location that already has a deterministic
//! finding is dropped.

mod autofix;
mod finding;
mod rules;
mod semantic;

pub use autofix::{has_markup, normalize_attributes, strip_markup, AutoFix, CANONICAL_SEPARATOR};
pub use finding::{Finding, FindingSource, Location, Severity, ValidationReport};
pub use rules::{RuleSetConfig, RuleValidator};
pub use semantic::SemanticValidator;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::cancellation::CancellationToken;
use crate::core::{Candidate, PipelineStage, TriggerEvent};

/// The batch a stage 2 candidate was generated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchScope {
    /// Zero-based batch index.
    pub index: usize,
    /// Trigger events of the batch.
    pub events: Vec<TriggerEvent>,
    /// Predicted row count.
    pub predicted_rows: usize,
    /// Allowed deviation before the completeness note is raised.
    pub tolerance_rows: usize,
}

/// What a validator needs to know besides the candidate.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Stage being validated.
    pub stage: PipelineStage,
    /// Requirement name; every row's customer requirement must equal it.
    pub requirement_name: String,
    /// Target rows for the whole requirement.
    pub target_rows: usize,
    /// Batch scope for stage 2 candidates.
    pub batch: Option<BatchScope>,
    /// Stop signal of the stage; validators that call the model honour it.
    pub cancel: Option<Arc<CancellationToken>>,
}

impl ValidationContext {
    /// Creates a context without batch scope.
    #[must_use]
    pub fn new(stage: PipelineStage, requirement_name: impl Into<String>, target_rows: usize) -> Self {
        Self {
            stage,
            requirement_name: requirement_name.into(),
            target_rows,
            batch: None,
            cancel: None,
        }
    }

    /// Attaches the stage's cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Whether the stage has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Scopes the context to a batch.
    #[must_use]
    pub fn with_batch(mut self, batch: BatchScope) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// A source of findings over a candidate.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validator name, for logs.
    fn name(&self) -> &'static str;

    /// Returns true if the same input always yields the same findings.
    fn deterministic(&self) -> bool;

    /// Checks a candidate.
    async fn validate(&self, candidate: &Candidate, ctx: &ValidationContext) -> Vec<Finding>;
}

/// Runs validators and merges their findings.
#[derive(Clone, Default)]
pub struct ValidationEngine {
    validators: Vec<Arc<dyn Validator>>,
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationEngine")
            .field(
                "validators",
                &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ValidationEngine {
    /// Creates an engine with no validators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine with the rule validator only.
    #[must_use]
    pub fn with_rules(config: RuleSetConfig) -> Self {
        Self::new().with_validator(Arc::new(RuleValidator::new(config)))
    }

    /// Adds a validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Number of validators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns true if no validator is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validates a candidate.
    ///
    /// Best-effort validators are skipped while deterministic findings
    /// block the candidate; they see it again once those are resolved.
    pub async fn validate(&self, candidate: &Candidate, ctx: &ValidationContext) -> ValidationReport {
        let mut findings = Vec::new();
        for validator in self.validators.iter().filter(|v| v.deterministic()) {
            let found = validator.validate(candidate, ctx).await;
            debug!(validator = validator.name(), findings = found.len(), "Deterministic validation");
            findings.extend(found);
        }

        if findings.iter().all(|f| !f.is_blocking()) {
            let taken: HashSet<Location> = findings.iter().map(|f| f.location.anchor()).collect();
            for validator in self.validators.iter().filter(|v| !v.deterministic()) {
                let found = validator.validate(candidate, ctx).await;
                let before = found.len();
                let kept: Vec<Finding> = found
                    .into_iter()
                    .filter(|f| !taken.contains(&f.location.anchor()))
                    .collect();
                debug!(
                    validator = validator.name(),
                    findings = kept.len(),
                    dropped = before - kept.len(),
                    "Best-effort validation"
                );
                findings.extend(kept);
            }
        }

        ValidationReport::new(candidate.stage(), findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, CosmicRow, CosmicTable};
    use mockall::mock;

    mock! {
        pub Reviewer {}

        #[async_trait]
        impl Validator for Reviewer {
            fn name(&self) -> &'static str;
            fn deterministic(&self) -> bool;
            async fn validate(&self, candidate: &Candidate, ctx: &ValidationContext) -> Vec<Finding>;
        }
    }

    fn reviewer(findings: Vec<Finding>, times: usize) -> MockReviewer {
        let mut mock = MockReviewer::new();
        mock.expect_name().return_const("reviewer");
        mock.expect_deterministic().return_const(false);
        mock.expect_validate().times(times).return_const(findings);
        mock
    }

    fn ctx() -> ValidationContext {
        ValidationContext::new(PipelineStage::CosmicTable, "订单系统", 40)
    }

    fn table() -> Candidate {
        let row = |process: &str, kind: &str, group: &str, attrs: &str| {
            CosmicRow::new()
                .with(Column::CustomerRequirement, "订单系统")
                .with(Column::FunctionalUser, "发起者：客户\n接收者：订单系统")
                .with(Column::UserRequirement, "订单管理")
                .with(Column::TriggerEvent, "客户下单")
                .with(Column::FunctionalProcess, process)
                .with(Column::SubProcess, format!("{process}:{group}"))
                .with(Column::MovementType, kind)
                .with(Column::DataGroup, group)
                .with(Column::DataAttributes, attrs)
                .with(Column::Reuse, "新增")
                .with(Column::Cfp, "1")
                .with(Column::TotalCfp, "1")
        };
        Candidate::Table(CosmicTable::new(vec![
            row("创建订单", "E", "下单请求", "订单号、金额"),
            row("创建订单", "X", "下单结果", "结果码、说明"),
        ]))
    }

    fn semantic(location: Location) -> Finding {
        Finding::logic("semantic", location, "implausible").from_source(FindingSource::Semantic)
    }

    #[tokio::test]
    async fn test_semantic_findings_merge_after_rules() {
        let engine = ValidationEngine::with_rules(RuleSetConfig::default())
            .with_validator(Arc::new(reviewer(vec![semantic(Location::Row { row: 1 })], 1)));
        let report = engine.validate(&table(), &ctx()).await;
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].source, FindingSource::Semantic);
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_semantic_skipped_while_rules_block() {
        let mut candidate = table();
        if let Candidate::Table(ref mut t) = candidate {
            t.rows[0].set(Column::DataGroup, "");
        }
        let engine = ValidationEngine::with_rules(RuleSetConfig::default())
            .with_validator(Arc::new(reviewer(vec![], 0)));
        let report = engine.validate(&candidate, &ctx()).await;
        assert!(report.findings.iter().all(|f| f.source == FindingSource::Rule));
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_deterministic_finding_wins_same_location() {
        let scope = BatchScope {
            index: 0,
            events: vec![crate::core::TriggerEvent::new("TE-1", "客户下单")
                .with_process(crate::core::FunctionalProcess::new("FP-1.1", "创建订单"))],
            predicted_rows: 9,
            tolerance_rows: 1,
        };
        let engine = ValidationEngine::with_rules(RuleSetConfig::default()).with_validator(Arc::new(
            reviewer(
                vec![semantic(Location::Artifact), semantic(Location::Row { row: 0 })],
                1,
            ),
        ));
        let report = engine.validate(&table(), &ctx().with_batch(scope)).await;
        let codes: Vec<&str> = report.findings.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["batch.completeness", "semantic"]);
        assert_eq!(report.findings[1].location, Location::Row { row: 0 });
    }

    #[tokio::test]
    async fn test_rules_are_idempotent_on_passed_candidate() {
        let engine = ValidationEngine::with_rules(RuleSetConfig::default());
        let first = engine.validate(&table(), &ctx()).await;
        let second = engine.validate(&table(), &ctx()).await;
        assert!(first.passed());
        assert_eq!(first.findings, second.findings);
    }
}
