//! Input Guard: prompt-injection screening for text bound for the backend.
//!
//! The pattern table is data (`GuardRule`), so a deployment can replace it
//! from configuration without touching the matching logic.

pub mod rules;
pub mod sanitize;

pub use rules::*;
pub use sanitize::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Guard rule '{name}' has an invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("Guard rule '{0}' can match the empty string")]
    EmptyMatch(String),

    #[error("Redaction marker of guard rule '{name}' is matched by rule '{matched_by}'")]
    MarkerMatched { name: String, matched_by: String },
}
