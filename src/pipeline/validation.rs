//! Response Validator: mode-specific format rules for a complete response.

use std::sync::LazyLock;

use regex::Regex;

use super::types::Mode;

/// A bare integer of one to three ASCII digits, optionally padded.
static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[0-9]{1,3}\s*$").expect("valid score regex"));

/// Any Unicode decimal digit, fullwidth and non-Latin scripts included.
static DIGIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d").expect("valid digit regex"));

/// Refusal and apology markers, lowercase, apostrophes normalized to ASCII.
const REFUSAL_MARKERS: &[&str] = &[
    "cannot",
    "can't",
    "unable",
    "as an ai",
    "as a language model",
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "apologies",
    "抱歉",
    "对不起",
    "无法",
    "作为ai",
    "我不能",
];

/// Why a response was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotAScore,
    ContainsDigits,
    Refusal(&'static str),
    Blank,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAScore => f.write_str("response is not a bare integer score"),
            Self::ContainsDigits => f.write_str("rewrite contains digits"),
            Self::Refusal(marker) => write!(f, "rewrite contains refusal marker '{marker}'"),
            Self::Blank => f.write_str("response is empty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(Rejection),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Judge a complete response against the rules of `mode`.
pub fn validate(mode: Mode, text: &str) -> Verdict {
    match mode {
        Mode::Detect => validate_score(text),
        Mode::Reduce => validate_rewrite(text),
    }
}

fn validate_score(text: &str) -> Verdict {
    if SCORE_RE.is_match(text) {
        Verdict::Valid
    } else {
        Verdict::Invalid(Rejection::NotAScore)
    }
}

fn validate_rewrite(text: &str) -> Verdict {
    if text.trim().is_empty() {
        return Verdict::Invalid(Rejection::Blank);
    }
    if DIGIT_RE.is_match(text) {
        return Verdict::Invalid(Rejection::ContainsDigits);
    }

    let normalized = text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'");
    let normalized = normalized.replace("作为 ai", "作为ai");
    match REFUSAL_MARKERS.iter().copied().find(|m| normalized.contains(m)) {
        Some(marker) => Verdict::Invalid(Rejection::Refusal(marker)),
        None => Verdict::Valid,
    }
}

/// Parse a validated Detect response into its score.
pub fn parse_score(text: &str) -> Option<u32> {
    text.trim().parse().ok()
}
