//! The correction state machine, free of any I/O.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::validation::{AutoFix, Finding, Severity, ValidationReport};

/// Correction loop limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Logic-consuming rounds before escalation.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Auto-fix passes per candidate; syntax findings that survive them are
    /// handed to the model.
    #[serde(default = "default_max_autofix_passes")]
    pub max_autofix_passes: usize,
}

fn default_max_rounds() -> usize {
    3
}

fn default_max_autofix_passes() -> usize {
    3
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_autofix_passes: default_max_autofix_passes(),
        }
    }
}

impl CorrectionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the round ceiling.
    #[must_use]
    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Sets the auto-fix pass ceiling.
    #[must_use]
    pub fn with_max_autofix_passes(mut self, passes: usize) -> Self {
        self.max_autofix_passes = passes;
        self
    }

    /// Checks that the values are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_rounds == 0 {
            return Err("max_rounds must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for a candidate from the model.
    Generating,
    /// A candidate is being validated (or revalidated after auto-fixes).
    Validating,
    /// The model is asked to revise its candidate.
    Correcting,
    /// The candidate passed.
    Passed,
    /// The stage needs an operator.
    Escalated,
}

impl LoopState {
    /// Returns true for `Passed` and `Escalated`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Escalated)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Correcting => "correcting",
            Self::Passed => "passed",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// One validation pass and what the loop did about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Logic rounds consumed when the pass ran.
    pub round: usize,
    /// Findings of the pass.
    pub findings: Vec<Finding>,
    /// Fixes applied in place after the pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes_applied: Vec<AutoFix>,
    /// Whether the model was re-prompted after the pass.
    pub reprompted: bool,
}

/// What to do with a validation report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Hand the candidate over.
    Pass,
    /// Apply the fixes and validate again; no round is consumed.
    AutoFix(Vec<AutoFix>),
    /// Ask the model to revise, citing these findings.
    Reprompt(Vec<Finding>),
    /// Stop and surface the stage.
    Escalate(String),
}

/// Round counter and finding history of one stage or batch.
///
/// Decisions follow severity: system findings escalate at once, syntax
/// findings with a fix are repaired in place, and anything the model must
/// revise consumes one round. Reaching the round ceiling escalates.
#[derive(Debug, Clone)]
pub struct CorrectionState {
    config: CorrectionConfig,
    state: LoopState,
    round: usize,
    autofix_passes: usize,
    autofixes: usize,
    history: Vec<RoundRecord>,
}

impl CorrectionState {
    /// Creates a state in `Generating`.
    #[must_use]
    pub fn new(config: CorrectionConfig) -> Self {
        Self {
            config,
            state: LoopState::Generating,
            round: 0,
            autofix_passes: 0,
            autofixes: 0,
            history: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Logic rounds consumed so far.
    #[must_use]
    pub fn round(&self) -> usize {
        self.round
    }

    /// The round ceiling.
    #[must_use]
    pub fn max_rounds(&self) -> usize {
        self.config.max_rounds
    }

    /// Fixes applied in place so far.
    #[must_use]
    pub fn autofixes(&self) -> usize {
        self.autofixes
    }

    /// Every validation pass so far.
    #[must_use]
    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    /// Consumes the state, returning its history.
    #[must_use]
    pub fn into_history(self) -> Vec<RoundRecord> {
        self.history
    }

    /// A new candidate is being requested.
    pub fn mark_generating(&mut self) {
        if !self.state.is_terminal() {
            self.state = LoopState::Generating;
            self.autofix_passes = 0;
        }
    }

    /// A candidate is being validated.
    pub fn mark_validating(&mut self) {
        if !self.state.is_terminal() {
            self.state = LoopState::Validating;
        }
    }

    /// Decides what to do with `report` and records the pass.
    pub fn decide(&mut self, report: &ValidationReport) -> Decision {
        match self.state {
            LoopState::Passed => return Decision::Pass,
            LoopState::Escalated => return Decision::Escalate("correction already escalated".to_string()),
            _ => {}
        }

        if let Some(system) = report.blocking().find(|f| f.severity == Severity::System) {
            let reason = system.message.clone();
            self.finish(report, Vec::new(), false, LoopState::Escalated);
            return Decision::Escalate(reason);
        }

        if report.passed() {
            self.finish(report, Vec::new(), false, LoopState::Passed);
            return Decision::Pass;
        }

        let fixes = report.auto_fixes();
        if !fixes.is_empty() && self.autofix_passes < self.config.max_autofix_passes {
            self.autofix_passes += 1;
            self.autofixes += fixes.len();
            self.finish(report, fixes.clone(), false, LoopState::Validating);
            return Decision::AutoFix(fixes);
        }

        self.round += 1;
        if self.round >= self.config.max_rounds {
            let reason = format!(
                "{} blocking findings remain after {} correction rounds",
                report.blocking().count(),
                self.round
            );
            self.finish(report, Vec::new(), false, LoopState::Escalated);
            return Decision::Escalate(reason);
        }

        let findings = report.blocking().map(promote).collect();
        self.finish(report, Vec::new(), true, LoopState::Correcting);
        Decision::Reprompt(findings)
    }

    fn finish(&mut self, report: &ValidationReport, fixes: Vec<AutoFix>, reprompted: bool, next: LoopState) {
        self.history.push(RoundRecord {
            round: self.round,
            findings: report.findings.clone(),
            fixes_applied: fixes,
            reprompted,
        });
        self.state = next;
    }
}

/// Blocking findings handed to the model are all logic findings from its
/// point of view.
fn promote(finding: &Finding) -> Finding {
    let mut finding = finding.clone();
    if finding.severity == Severity::Syntax {
        finding.severity = Severity::Logic;
        if finding.suggested_fix.is_none() {
            finding.suggested_fix = finding.auto_fix.as_ref().map(AutoFix::describe);
        }
        finding.auto_fix = None;
    }
    finding
}
