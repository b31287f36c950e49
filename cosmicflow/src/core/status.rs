//! Pipeline stage identifiers and stage selection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two generation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Stage 1: requirement outline to trigger events and functional processes.
    TriggerEvents,
    /// Stage 2: trigger events to COSMIC data-movement rows.
    CosmicTable,
}

impl PipelineStage {
    /// Returns the stable identifier used in events and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TriggerEvents => "trigger_events",
            Self::CosmicTable => "cosmic_table",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages a pipeline run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSelection {
    /// Produce the trigger-event outline only.
    TriggerEventsOnly,
    /// Consume an existing outline artifact and produce the table.
    CosmicTableOnly,
    /// Run both stages.
    #[default]
    Full,
}

impl StageSelection {
    /// Returns true if stage 1 runs.
    #[must_use]
    pub const fn runs_trigger_events(self) -> bool {
        matches!(self, Self::TriggerEventsOnly | Self::Full)
    }

    /// Returns true if stage 2 runs.
    #[must_use]
    pub const fn runs_cosmic_table(self) -> bool {
        matches!(self, Self::CosmicTableOnly | Self::Full)
    }
}

impl fmt::Display for StageSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TriggerEventsOnly => write!(f, "trigger_events_only"),
            Self::CosmicTableOnly => write!(f, "cosmic_table_only"),
            Self::Full => write!(f, "full"),
        }
    }
}
