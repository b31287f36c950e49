//! Conversation context for model calls.
//!
//! The [`ConversationWindow`] is scoped to one logical multi-turn exchange
//! (one stage 1 run or one stage 2 batch) and is never shared across
//! concurrently running batches.

mod window;

pub use window::{ChatMessage, ConversationWindow, EntryId, Role, WindowConfig, WindowEntry};
