//! Findings and validation reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use super::autofix::AutoFix;
use crate::core::{Column, PipelineStage};

/// How a finding can be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Fixable in place without asking the model again.
    Syntax,
    /// The model must revise the candidate.
    Logic,
    /// Neither fixable nor correctable; escalates.
    System,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Logic => write!(f, "logic"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Where a finding points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    /// The candidate as a whole.
    Artifact,
    /// A trigger event by position.
    Event {
        /// Zero-based event index.
        index: usize,
    },
    /// A functional process by position.
    Process {
        /// Zero-based event index.
        event: usize,
        /// Zero-based process index within the event.
        process: usize,
    },
    /// A table row.
    Row {
        /// Zero-based row index.
        row: usize,
    },
    /// A table cell.
    Cell {
        /// Zero-based row index.
        row: usize,
        /// Column.
        column: Column,
    },
    /// All rows of one functional process.
    ProcessRows {
        /// Trigger event name.
        trigger_event: String,
        /// Functional process name.
        process: String,
    },
    /// A free-form reference given by the semantic reviewer.
    Described {
        /// The reference text.
        text: String,
    },
}

impl Location {
    /// Coarse key used to decide whether two findings point at the same
    /// place: cells collapse onto their row.
    #[must_use]
    pub fn anchor(&self) -> Location {
        match self {
            Self::Cell { row, .. } => Self::Row { row: *row },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact => write!(f, "artifact"),
            Self::Event { index } => write!(f, "event #{}", index + 1),
            Self::Process { event, process } => {
                write!(f, "event #{} process #{}", event + 1, process + 1)
            }
            Self::Row { row } => write!(f, "row {}", row + 1),
            Self::Cell { row, column } => write!(f, "row {} column {}", row + 1, column),
            Self::ProcessRows {
                trigger_event,
                process,
            } => write!(f, "process '{process}' of '{trigger_event}'"),
            Self::Described { text } => f.write_str(text),
        }
    }
}

/// Which kind of check produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSource {
    /// The deterministic rule set.
    Rule,
    /// Candidate extraction from the raw completion.
    Codec,
    /// The orchestrator (a call that could not complete).
    Call,
    /// The model-based reviewer.
    Semantic,
}

impl FindingSource {
    /// Deterministic sources give the same findings for the same input.
    #[must_use]
    pub const fn is_deterministic(self) -> bool {
        !matches!(self, Self::Semantic)
    }
}

/// One problem found in a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity class.
    pub severity: Severity,
    /// Stable rule code, e.g. `table.movement_type`.
    pub code: String,
    /// Where the problem is.
    pub location: Location,
    /// Description shown to the model and the operator.
    pub message: String,
    /// Human-readable remedy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    /// Machine-applicable remedy (syntax findings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_fix: Option<AutoFix>,
    /// Advisory findings are reported but never block `Passed`.
    #[serde(default)]
    pub advisory: bool,
    /// Producer.
    pub source: FindingSource,
}

impl Finding {
    fn new(severity: Severity, code: &str, location: Location, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            location,
            message: message.into(),
            suggested_fix: None,
            auto_fix: None,
            advisory: false,
            source: FindingSource::Rule,
        }
    }

    /// A syntax finding with its machine fix.
    #[must_use]
    pub fn syntax(code: &str, location: Location, message: impl Into<String>, fix: AutoFix) -> Self {
        let mut finding = Self::new(Severity::Syntax, code, location, message);
        finding.suggested_fix = Some(fix.describe());
        finding.auto_fix = Some(fix);
        finding
    }

    /// A logic finding.
    #[must_use]
    pub fn logic(code: &str, location: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Logic, code, location, message)
    }

    /// A system finding.
    #[must_use]
    pub fn system(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::System, code, Location::Artifact, message)
    }

    /// Sets the suggested fix.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_fix = Some(suggestion.into());
        self
    }

    /// Sets the producer.
    #[must_use]
    pub fn from_source(mut self, source: FindingSource) -> Self {
        self.source = source;
        self
    }

    /// Marks the finding advisory.
    #[must_use]
    pub fn as_advisory(mut self) -> Self {
        self.advisory = true;
        self
    }

    /// Returns true if the finding blocks `Passed`.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !self.advisory
    }

    /// Returns true if the finding can be fixed without the model.
    #[must_use]
    pub fn is_auto_fixable(&self) -> bool {
        self.severity == Severity::Syntax && self.auto_fix.is_some()
    }

    /// Renders the finding as one line for prompts and summaries.
    #[must_use]
    pub fn render(&self) -> String {
        let mut line = format!("[{}] {}: {}", self.severity, self.location, self.message);
        if let Some(ref fix) = self.suggested_fix {
            let _ = write!(line, " (fix: {fix})");
        }
        line
    }
}

/// The merged findings of one validation pass. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Stage of the candidate.
    pub stage: PipelineStage,
    /// Findings, deterministic ones first.
    pub findings: Vec<Finding>,
    /// When the pass ran.
    pub created_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Creates a report.
    #[must_use]
    pub fn new(stage: PipelineStage, findings: Vec<Finding>) -> Self {
        Self {
            stage,
            findings,
            created_at: Utc::now(),
        }
    }

    /// Returns true if no finding blocks the candidate.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.blocking().next().is_none()
    }

    /// Findings that block `Passed`.
    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_blocking())
    }

    /// Findings that are only reported.
    pub fn advisory(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.advisory)
    }

    /// Returns true if a blocking system finding is present.
    #[must_use]
    pub fn has_system(&self) -> bool {
        self.blocking().any(|f| f.severity == Severity::System)
    }

    /// Blocking findings that need the model: logic findings and syntax
    /// findings without a machine fix.
    pub fn needs_model(&self) -> impl Iterator<Item = &Finding> {
        self.blocking()
            .filter(|f| f.severity == Severity::Logic || (f.severity == Severity::Syntax && f.auto_fix.is_none()))
    }

    /// Machine fixes of blocking syntax findings, in report order.
    #[must_use]
    pub fn auto_fixes(&self) -> Vec<AutoFix> {
        self.blocking()
            .filter_map(|f| if f.is_auto_fixable() { f.auto_fix.clone() } else { None })
            .collect()
    }

    /// Findings from deterministic sources.
    pub fn deterministic(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.source.is_deterministic())
    }

    /// Number of findings with a severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    /// Human-readable result check.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Validation of {}: {} ({} syntax, {} logic, {} system, {} advisory)\n",
            self.stage,
            if self.passed() { "PASSED" } else { "FAILED" },
            self.count(Severity::Syntax),
            self.count(Severity::Logic),
            self.count(Severity::System),
            self.advisory().count(),
        );
        for finding in &self.findings {
            let marker = if finding.advisory { "note" } else { "error" };
            let _ = writeln!(out, "- {marker} {}", finding.render());
        }
        out
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage.as_str()));
        map.insert("passed".to_string(), serde_json::json!(self.passed()));
        map.insert(
            "findings".to_string(),
            serde_json::to_value(&self.findings).unwrap_or(serde_json::Value::Null),
        );
        map.insert(
            "created_at".to_string(),
            serde_json::json!(self.created_at.to_rfc3339()),
        );
        map
    }
}
