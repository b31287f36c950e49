//! A generated artifact awaiting validation.

use serde::{Deserialize, Serialize};

use super::outline::TriggerOutline;
use super::status::PipelineStage;
use super::table::CosmicTable;

/// The artifact produced by one generation call, in parsed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Candidate {
    /// A stage 1 trigger-event outline.
    Outline(TriggerOutline),
    /// A stage 2 table fragment.
    Table(CosmicTable),
}

impl Candidate {
    /// The stage that produces this kind of candidate.
    #[must_use]
    pub const fn stage(&self) -> PipelineStage {
        match self {
            Self::Outline(_) => PipelineStage::TriggerEvents,
            Self::Table(_) => PipelineStage::CosmicTable,
        }
    }

    /// Returns the outline, if this is one.
    #[must_use]
    pub fn as_outline(&self) -> Option<&TriggerOutline> {
        match self {
            Self::Outline(outline) => Some(outline),
            Self::Table(_) => None,
        }
    }

    /// Returns the table, if this is one.
    #[must_use]
    pub fn as_table(&self) -> Option<&CosmicTable> {
        match self {
            Self::Table(table) => Some(table),
            Self::Outline(_) => None,
        }
    }

    /// Renders the candidate the way it is shown back to the model.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Outline(outline) => {
                serde_json::to_string_pretty(outline).unwrap_or_else(|_| format!("{outline:?}"))
            }
            Self::Table(table) => table.to_markdown(),
        }
    }
}
