//! # Cosmicflow
//!
//! Generation, validation and correction engine for COSMIC function-point
//! tables.
//!
//! Cosmicflow drives a completion service through two dependent stages:
//!
//! - **Trigger-event extraction**: a requirement outline becomes a structured
//!   list of trigger events and functional processes, validated and frozen as
//!   a content-addressed artifact
//! - **Table generation**: the outline is partitioned into elastic batches and
//!   each batch is expanded into COSMIC data-movement rows
//!
//! Every candidate passes through a validation engine (deterministic rules plus
//! an optional model-based reviewer) and a correction state machine that
//! auto-fixes, re-prompts or escalates.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cosmicflow::prelude::*;
//!
//! let config = EngineConfig::from_file("model_providers.yaml")?;
//! let (name, provider) = config.provider()?;
//! let transport = OpenAiCompatibleTransport::from_provider(name, provider)?;
//! let coordinator = PipelineCoordinator::new(config, Arc::new(transport))?;
//!
//! let requirement = RequirementOutline::new("Order management", 40)
//!     .with_background("Customers place and track orders")
//!     .with_functional_users("Customer", "Order system");
//!
//! let report = coordinator.run(&requirement, StageSelection::Full, None).await?;
//! println!("{}", report.table.to_markdown());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod codec;
pub mod config;
pub mod context;
pub mod core;
pub mod correction;
pub mod errors;
pub mod events;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod testing;
pub mod utils;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, PipelineConfig, ProviderConfig};
    pub use crate::context::{ChatMessage, ConversationWindow, Role, WindowConfig};
    pub use crate::core::{
        Candidate, Column, CosmicRow, CosmicTable, DataMovement, FunctionalProcess,
        FunctionalUsers, MovementType, OutlineArtifact, PipelineStage, RequirementOutline,
        StageSelection, TriggerEvent, TriggerOutline,
    };
    pub use crate::correction::{CorrectionConfig, CorrectionLoop, CorrectionState, LoopState};
    pub use crate::errors::{
        CallError, ConfigError, CosmicflowError, StageFailure, StageFailureKind, TransportError,
        TransportErrorKind,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    #[cfg(feature = "http")]
    pub use crate::llm::OpenAiCompatibleTransport;
    pub use crate::llm::{
        Completion, CompletionTransport, ModelCallOrchestrator, PromptTemplate, TokenSink,
    };
    pub use crate::pipeline::{
        BatchConfig, BatchPlanner, Completeness, PipelineCoordinator, PipelineReport, RetryConfig,
    };
    pub use crate::validation::{
        Finding, RuleSetConfig, Severity, ValidationEngine, ValidationReport, Validator,
    };
    pub use std::sync::Arc;
}
