//! Error types for the cosmicflow engine.
//!
//! Errors below the stage boundary (transport failures that a retry recovers,
//! syntax findings fixed in place) never reach the caller. What does reach the
//! caller is either a [`CallError`] from a single logical call or a
//! [`StageFailure`] carrying the validation history of a stage that could not
//! be completed.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::core::{Candidate, CosmicTable, PipelineStage};
use crate::correction::RoundRecord;

/// The main error type for cosmicflow operations.
#[derive(Debug, Error)]
pub enum CosmicflowError {
    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A stage failed and needs an operator.
    #[error("{0}")]
    Stage(#[from] Box<StageFailure>),

    /// A standalone call failed.
    #[error("{0}")]
    Call(#[from] CallError),

    /// An outline artifact is corrupt.
    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    /// The requirement handed to the engine violates a precondition.
    #[error("Invalid requirement: {0}")]
    InvalidRequirement(String),

    /// Stage 2 was requested without a stage 1 artifact.
    #[error("Stage 2 requires an outline artifact but none was supplied")]
    MissingOutline,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StageFailure> for CosmicflowError {
    fn from(failure: StageFailure) -> Self {
        Self::Stage(Box::new(failure))
    }
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The attempt exceeded the per-call timeout.
    Timeout,
    /// The service asked us to slow down.
    RateLimited,
    /// The response could not be decoded.
    MalformedResponse,
    /// The service is temporarily unreachable or failing.
    Unavailable,
    /// Credentials were rejected.
    Authentication,
    /// The service rejected the request itself.
    InvalidRequest,
}

impl TransportErrorKind {
    /// Returns true if a retry may succeed.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::MalformedResponse | Self::Unavailable
        )
    }

    /// Stable identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::MalformedResponse => "malformed_response",
            Self::Unavailable => "unavailable",
            Self::Authentication => "authentication",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a completion transport.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Classification.
    pub kind: TransportErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Content streamed before the failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<String>,
}

impl TransportError {
    /// Creates a transport error.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial: None,
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("no completion within {}ms", after.as_millis()),
        )
    }

    /// Attaches partially streamed content.
    #[must_use]
    pub fn with_partial(mut self, partial: impl Into<String>) -> Self {
        let partial = partial.into();
        self.partial = (!partial.is_empty()).then_some(partial);
        self
    }

    /// Returns true if a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), json!(self.kind.as_str()));
        map.insert("message".to_string(), json!(self.message));
        map.insert("transient".to_string(), json!(self.is_transient()));
        if let Some(ref partial) = self.partial {
            map.insert("partial_chars".to_string(), json!(partial.chars().count()));
        }
        map
    }
}

/// A prompt template referenced a variable that was not supplied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Template '{template}' references undefined variable '{variable}'")]
pub struct TemplateError {
    /// Template name.
    pub template: String,
    /// Missing variable.
    pub variable: String,
}

/// Failure of one logical model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Every attempt failed transiently.
    #[error("Call exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
        /// Error of the final attempt.
        last: TransportError,
    },

    /// A non-retryable failure.
    #[error("Fatal call error: {0}")]
    Fatal(TransportError),

    /// The call was cancelled before completing.
    #[error("Call cancelled: {0}")]
    Cancelled(String),

    /// The prompt could not be rendered; treated as a malformed request.
    #[error("{0}")]
    Template(#[from] TemplateError),
}

impl CallError {
    /// Returns true for the `Exhausted` variant.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Returns the tag used in reports.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::Fatal(_) => "fatal",
            Self::Cancelled(_) => "cancelled",
            Self::Template(_) => "template",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("tag".to_string(), json!(self.tag()));
        map.insert("message".to_string(), json!(self.to_string()));
        match self {
            Self::Exhausted { attempts, last } => {
                map.insert("attempts".to_string(), json!(attempts));
                map.insert("last".to_string(), json!(last.to_dict()));
            }
            Self::Fatal(error) => {
                map.insert("error".to_string(), json!(error.to_dict()));
            }
            Self::Cancelled(_) | Self::Template(_) => {}
        }
        map
    }
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The requested provider is not configured.
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    /// A value is out of range or missing.
    #[error("Invalid config value for '{field}': {message}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// An outline artifact failed to load or verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    /// The stored hash does not match the content.
    #[error("Outline hash mismatch: expected {expected}, found {actual}")]
    HashMismatch {
        /// Hash recorded in the artifact.
        expected: String,
        /// Hash of the current content.
        actual: String,
    },

    /// The artifact could not be (de)serialized.
    #[error("Outline serialization error: {0}")]
    Serialization(String),
}

/// A completion did not contain a parsable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// No JSON object was found.
    #[error("No JSON object found in the completion")]
    NoJson,

    /// The JSON object did not match the outline shape.
    #[error("JSON does not describe trigger events: {0}")]
    InvalidJson(String),

    /// No markdown table was found.
    #[error("No markdown table found in the completion")]
    NoTable,

    /// Header cells that could not be mapped to table columns.
    #[error("Table header is missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// How a stage ended without producing its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailureKind {
    /// Correction rounds ran out or a system finding occurred.
    Escalated,
    /// A non-retryable call error aborted the stage.
    Fatal,
    /// The stage was cancelled.
    Cancelled,
}

impl fmt::Display for StageFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Escalated => write!(f, "escalated"),
            Self::Fatal => write!(f, "fatal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A stage that could not complete, surfaced for operator review.
///
/// Carries the full correction history, the last candidate that was
/// generated, and every batch merged before the failure.
#[derive(Debug, Clone, Error)]
#[error("Stage {stage} {kind}: {message}")]
pub struct StageFailure {
    /// The failing stage.
    pub stage: PipelineStage,
    /// How it failed.
    pub kind: StageFailureKind,
    /// Summary of the cause.
    pub message: String,
    /// Index of the failing batch (stage 2 only).
    pub batch: Option<usize>,
    /// Round-by-round findings and fixes.
    pub history: Vec<RoundRecord>,
    /// The last generated candidate, if any.
    pub last_candidate: Option<Candidate>,
    /// Rows of the batches validated before the failure, in plan order.
    ///
    /// Only the unbroken run from the first batch is kept: with parallel
    /// batches, a later batch that finished while an earlier one failed is
    /// left out.
    pub merged: CosmicTable,
}

impl StageFailure {
    /// Creates a failure without history.
    #[must_use]
    pub fn new(stage: PipelineStage, kind: StageFailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            batch: None,
            history: Vec::new(),
            last_candidate: None,
            merged: CosmicTable::default(),
        }
    }

    /// Sets the failing batch.
    #[must_use]
    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Sets the correction history.
    #[must_use]
    pub fn with_history(mut self, history: Vec<RoundRecord>) -> Self {
        self.history = history;
        self
    }

    /// Sets the last candidate.
    #[must_use]
    pub fn with_last_candidate(mut self, candidate: Option<Candidate>) -> Self {
        self.last_candidate = candidate;
        self
    }

    /// Sets the merged rows.
    #[must_use]
    pub fn with_merged(mut self, merged: CosmicTable) -> Self {
        self.merged = merged;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), json!(self.stage.as_str()));
        map.insert("kind".to_string(), json!(self.kind));
        map.insert("message".to_string(), json!(self.message));
        if let Some(batch) = self.batch {
            map.insert("batch".to_string(), json!(batch));
        }
        map.insert(
            "history".to_string(),
            serde_json::to_value(&self.history).unwrap_or(Value::Null),
        );
        map.insert("merged_rows".to_string(), json!(self.merged.len()));
        if let Some(ref candidate) = self.last_candidate {
            map.insert("last_candidate".to_string(), json!(candidate.render()));
        }
        map
    }
}
