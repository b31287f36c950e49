//! Bounded conversation history with least-recently-used eviction.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::utils::estimate_tokens;

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// Prompt sent to the model.
    User,
    /// Completion returned by the model.
    Assistant,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (role, content) pair sent to the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Identifier of a recorded entry. Ids increase with recording order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Window capacity limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum number of entries kept.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Maximum estimated tokens kept.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_entries() -> usize {
    8
}

fn default_max_tokens() -> usize {
    24_000
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl WindowConfig {
    /// Sets the entry limit.
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the token limit.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// One recorded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    /// Entry id.
    pub id: EntryId,
    /// The message.
    pub message: ChatMessage,
    /// Estimated token count.
    pub tokens: usize,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Bounded, ordered conversation history.
///
/// Entries live in an [`IndexMap`] ordered by recency of use: recording or
/// touching an entry moves it to the back, eviction drops from the front.
/// Eviction removes whole entries only, and the entry just recorded is never
/// evicted by its own insertion, so a single oversized message is kept alone.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    config: WindowConfig,
    entries: IndexMap<EntryId, WindowEntry>,
    next_id: u64,
    total_tokens: usize,
    evicted: usize,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

impl ConversationWindow {
    /// Creates an empty window. A zero entry limit is treated as one.
    #[must_use]
    pub fn new(mut config: WindowConfig) -> Self {
        config.max_entries = config.max_entries.max(1);
        Self {
            config,
            entries: IndexMap::new(),
            next_id: 0,
            total_tokens: 0,
            evicted: 0,
        }
    }

    /// Records a message and evicts least-recently-used entries until the
    /// window fits its limits again.
    pub fn record(&mut self, role: Role, content: impl Into<String>) -> EntryId {
        let content = content.into();
        let id = EntryId(self.next_id);
        self.next_id += 1;

        let tokens = estimate_tokens(&content);
        self.total_tokens += tokens;
        self.entries.insert(
            id,
            WindowEntry {
                id,
                message: ChatMessage::new(role, content),
                tokens,
                recorded_at: Utc::now(),
            },
        );
        self.evict();
        id
    }

    /// Marks an entry as recently used. Returns false if it was evicted.
    pub fn touch(&mut self, id: EntryId) -> bool {
        match self.entries.get_index_of(&id) {
            Some(index) => {
                let last = self.entries.len() - 1;
                self.entries.move_index(index, last);
                true
            }
            None => false,
        }
    }

    fn over_capacity(&self) -> bool {
        self.entries.len() > self.config.max_entries
            || (self.total_tokens > self.config.max_tokens && self.entries.len() > 1)
    }

    fn evict(&mut self) {
        while self.over_capacity() {
            let Some((id, entry)) = self.entries.shift_remove_index(0) else {
                break;
            };
            self.total_tokens -= entry.tokens;
            self.evicted += 1;
            debug!(
                entry = id.value(),
                role = %entry.message.role,
                tokens = entry.tokens,
                "Evicted conversation entry"
            );
        }
    }

    /// Messages currently in the window, in recording order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        let mut entries: Vec<&WindowEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.id);
        entries.into_iter().map(|e| e.message.clone()).collect()
    }

    /// Entry ids from least to most recently used.
    #[must_use]
    pub fn recency_order(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&WindowEntry> {
        self.entries.get(&id)
    }

    /// Returns true if the entry is still in the window.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated tokens currently held.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.total_tokens
    }

    /// Entries evicted so far.
    #[must_use]
    pub fn evicted_count(&self) -> usize {
        self.evicted
    }

    /// The configured limits.
    #[must_use]
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_tokens = 0;
    }

    /// Converts to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("entries".to_string(), serde_json::json!(self.len()));
        map.insert("tokens".to_string(), serde_json::json!(self.total_tokens));
        map.insert("evicted".to_string(), serde_json::json!(self.evicted));
        map.insert(
            "max_entries".to_string(),
            serde_json::json!(self.config.max_entries),
        );
        map
    }
}
