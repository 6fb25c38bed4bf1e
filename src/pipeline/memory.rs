use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{Message, Role};

/// One committed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only record of the session's successful exchanges.
///
/// Entries alternate user/assistant: the only way in is `record_exchange`,
/// which appends both halves of a pair. Nothing is ever edited or removed.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    entries: Vec<MemoryEntry>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit one successful exchange.
    pub fn record_exchange(&mut self, user: &str, assistant: &str) {
        let now = Utc::now();
        self.entries.push(MemoryEntry {
            role: Role::User,
            content: user.to_string(),
            recorded_at: now,
        });
        self.entries.push(MemoryEntry {
            role: Role::Assistant,
            content: assistant.to_string(),
            recorded_at: now,
        });
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of committed exchanges.
    pub fn turns(&self) -> usize {
        self.entries.len() / 2
    }

    /// Most recent exchange as (user, assistant).
    pub fn last_exchange(&self) -> Option<(&str, &str)> {
        match self.entries.as_slice() {
            [.., user, assistant] => Some((&user.content, &assistant.content)),
            _ => None,
        }
    }

    /// History as backend messages, for hosts that replay context.
    pub fn to_messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .map(|e| Message::new(e.role, e.content.clone()))
            .collect()
    }
}
