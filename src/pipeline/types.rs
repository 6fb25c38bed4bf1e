use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════

/// Speaker of a chat message sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of the ordered message list sent to the backend.
///
/// Fields are private so a message cannot change after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

// ═══════════════════════════════════════════════════════════
// Mode
// ═══════════════════════════════════════════════════════════

/// Which instruction/validation profile governs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Score the share of AI-generated text as an integer 0-100.
    Detect,
    /// Rewrite the text to lower that share.
    Reduce,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Reduce => "reduce",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Run identity and outcome
// ═══════════════════════════════════════════════════════════

/// Identifier of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a run ended without a usable result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunFailure {
    /// Every attempt produced content that broke the mode's format rules.
    #[error("could not produce a valid response after {attempts} attempt(s)")]
    ValidationExhausted { attempts: u32 },

    /// Transport or backend failure. Not retried inside the run.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(String),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Completed(text) => Some(text),
            Self::Failed(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Delivery channel items
// ═══════════════════════════════════════════════════════════

/// An item on the delivery channel.
///
/// `End` is the terminal sentinel: exactly one per run, always last, carrying
/// the run's outcome. `Retrying` tells the consumer that the text shown since
/// the previous `Retrying` (or since the start of the run) was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text { text: String },
    Retrying { attempt: u32, reason: String },
    End { outcome: RunOutcome },
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}

/// A chunk tagged with the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub run_id: RunId,
    pub mode: Mode,
    pub chunk: StreamChunk,
}

// ═══════════════════════════════════════════════════════════
// Exchange
// ═══════════════════════════════════════════════════════════

/// Final classification of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    /// Still running.
    Pending,
    Success,
    ValidationFailed,
    BackendError,
}

/// One logical request/response pair, owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub run_id: RunId,
    pub mode: Mode,
    pub input_text: String,
    pub output_text: String,
    pub outcome: ExchangeOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Exchange {
    pub fn start(run_id: RunId, mode: Mode, input_text: impl Into<String>) -> Self {
        Self {
            run_id,
            mode,
            input_text: input_text.into(),
            output_text: String::new(),
            outcome: ExchangeOutcome::Pending,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the run's terminal outcome.
    pub fn finalize(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed(text) => {
                self.output_text = text.clone();
                self.outcome = ExchangeOutcome::Success;
            }
            RunOutcome::Failed(RunFailure::ValidationExhausted { .. }) => {
                self.outcome = ExchangeOutcome::ValidationFailed;
            }
            RunOutcome::Failed(RunFailure::Backend(detail)) => {
                self.output_text = detail.clone();
                self.outcome = ExchangeOutcome::BackendError;
            }
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExchangeOutcome::Success
    }
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

/// Truncate to at most `max_chars` characters, appending "..." when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
