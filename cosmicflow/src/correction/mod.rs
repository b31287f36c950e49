//! The correction loop.
//!
//! [`CorrectionState`] is the state machine (`Generating → Validating →
//! Passed | Correcting | Escalated`) and owns the round counter and the
//! finding history. [`CorrectionLoop`] drives it with real model calls.

mod cycle;
mod state;

pub use cycle::{CorrectionLoop, CorrectionOutcome};
pub use state::{CorrectionConfig, CorrectionState, Decision, LoopState, RoundRecord};
