//! Pipeline execution: batch planning, call retry policy, built-in prompts
//! and the coordinator that sequences the two stages.

pub mod batch;
pub mod coordinator;
pub mod prompts;
pub mod retry;

pub use batch::{Batch, BatchConfig, BatchPlanner, RowRateEstimator};
pub use coordinator::{BatchReport, Completeness, PipelineCoordinator, PipelineReport};
pub use prompts::PromptSet;
pub use retry::{BackoffRecord, BackoffStrategy, JitterStrategy, RetryConfig};
