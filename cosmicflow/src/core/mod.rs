//! Core domain model types for cosmicflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Requirement, trigger-event, process and data-movement types
//! - The stage 1 outline and its content-addressed hand-off artifact
//! - COSMIC table rows and columns
//! - Stage identifiers and stage selection

mod candidate;
mod model;
mod outline;
mod status;
mod table;

pub use candidate::Candidate;
pub use model::{
    DataMovement, FunctionalProcess, FunctionalUsers, MovementType, RequirementOutline,
    TriggerEvent,
};
pub use outline::{OutlineArtifact, TriggerOutline};
pub use status::{PipelineStage, StageSelection};
pub use table::{Column, CosmicRow, CosmicTable, ProcessRows, ATTRIBUTE_SEPARATORS};
