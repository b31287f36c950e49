//! Testing utilities for cosmicflow pipelines.
//!
//! This module provides:
//! - A scripted completion transport with fault injection
//! - Sample requirement, outline and table fixtures
//! - Assertions over reports and batch plans

mod assertions;
pub mod fixtures;
mod mocks;

pub use assertions::{assert_escalated, assert_has_finding, assert_partition, assert_passed};
pub use fixtures::{pipeline_responder, sample_outline, sample_requirement, table_for_events};
pub use mocks::{RecordingTokenSink, Responder, ScriptStep, ScriptedTransport};
