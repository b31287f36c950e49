//! Assertions over validation reports, failures and batch plans.

use crate::core::TriggerEvent;
use crate::errors::{StageFailure, StageFailureKind};
use crate::pipeline::batch::Batch;
use crate::validation::ValidationReport;

/// Asserts that the report has no blocking findings.
pub fn assert_passed(report: &ValidationReport) {
    assert!(report.passed(), "Expected a passing report, got:\n{}", report.summary());
}

/// Asserts that the report contains a finding with `code`.
pub fn assert_has_finding(report: &ValidationReport, code: &str) {
    assert!(
        report.findings.iter().any(|f| f.code == code),
        "Expected finding '{}', got:\n{}",
        code,
        report.summary()
    );
}

/// Asserts that the failure is an escalation.
pub fn assert_escalated(failure: &StageFailure) {
    assert_eq!(
        failure.kind,
        StageFailureKind::Escalated,
        "Expected escalation, got {}: {}",
        failure.kind,
        failure.message
    );
}

/// Asserts that `batches` cover `events` in order, each exactly once.
pub fn assert_partition(batches: &[Batch], events: &[TriggerEvent]) {
    let mut next = 0;
    for batch in batches {
        assert_eq!(batch.span.start, next, "Batch {} does not continue the previous one", batch.index);
        assert!(!batch.is_empty(), "Batch {} is empty", batch.index);
        next = batch.span.end;
    }
    assert_eq!(next, events.len(), "Batches cover {next} of {} events", events.len());
    let ids: Vec<&str> = batches.iter().flat_map(|b| b.event_ids.iter().map(String::as_str)).collect();
    let expected: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, expected, "Batch event ids differ from the input order");
}
