//! Model calls: transports, prompt templates and the call orchestrator.

mod orchestrator;
mod template;
mod transport;

#[cfg(feature = "http")]
mod openai;

pub use orchestrator::{CallOptions, CallOutcome, CallTrace, ModelCallOrchestrator};
pub use template::{variables, PromptTemplate, RenderedPrompt, Variables};
pub use transport::{Completion, CompletionRequest, CompletionTransport, TokenSink};

#[cfg(feature = "http")]
pub use openai::{classify_status, OpenAiCompatibleTransport};
