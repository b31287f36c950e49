//! Lifecycle events for observability.
//!
//! The coordinator, the correction loop and the call orchestrator report what
//! they do through an [`EventSink`]. Event names are collected in [`names`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde_json::Value;

/// Event type names.
pub mod names {
    /// A stage began.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage produced its artifact.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage needs an operator.
    pub const STAGE_ESCALATED: &str = "stage.escalated";
    /// The batch plan for stage 2 is known.
    pub const BATCH_PLANNED: &str = "batch.planned";
    /// A validated batch was appended to the merged table.
    pub const BATCH_MERGED: &str = "batch.merged";
    /// A transient call failure will be retried.
    pub const CALL_RETRY: &str = "call.retry";
    /// A correction round re-prompts the model.
    pub const CORRECTION_ROUND: &str = "correction.round";
    /// Syntax findings were fixed in place.
    pub const CORRECTION_AUTOFIX: &str = "correction.autofix";
    /// The generated row count strays from the target.
    pub const COMPLETENESS_DEVIATION: &str = "completeness.deviation";
}

/// Builds an event payload from a JSON object literal, tagging it with the
/// emission timestamp.
#[must_use]
pub fn payload(mut data: Value) -> Option<Value> {
    if let Value::Object(ref mut map) = data {
        map.insert(
            "timestamp".to_string(),
            Value::String(crate::utils::iso_timestamp()),
        );
    }
    Some(data)
}
