use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::prompt_templates::PromptLanguage;
use crate::pipeline::safety::GuardRule;

/// Application-level constants
pub const APP_NAME: &str = "aigc-inspector";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5:7b";
pub const DEFAULT_OPENAI_MODEL: &str = "deepseek-chat";

/// Most backend calls a single run may make.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Default `tracing` filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,reqwest=warn,hyper=warn"
}

/// Default config file: `<config dir>/aigc-inspector/config.json`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.json"))
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ═══════════════════════════════════════════════════════════
// Backend
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Ollama,
    #[serde(alias = "openai", alias = "deepseek")]
    OpenAiCompatible,
}

impl BackendKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai" | "openai_compatible" | "deepseek" => Some(Self::OpenAiCompatible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
    pub model: String,
    /// Required by `openai_compatible`. Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    /// Bounds connection setup only; streaming reads are unbounded.
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Ollama,
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_OLLAMA_MODEL.to_string(),
            api_key: None,
            temperature: 0.0,
            connect_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ═══════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backend: BackendConfig,
    /// Backend calls per run, first attempt included.
    pub max_attempts: u32,
    /// Lowest Detect score that unlocks a Reduce run.
    pub reduction_threshold: u32,
    /// Characters of response text kept in audit previews.
    pub preview_chars: usize,
    pub language: PromptLanguage,
    /// Replaces the built-in Input Guard table when set.
    pub guard_rules: Option<Vec<GuardRule>>,
    pub detect_max_tokens: usize,
    pub reduce_max_tokens: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            max_attempts: 2,
            reduction_threshold: 25,
            preview_chars: 100,
            language: PromptLanguage::English,
            guard_rules: None,
            detect_max_tokens: 32,
            reduce_max_tokens: 8192,
        }
    }
}

impl SupervisorConfig {
    /// Defaults, then the JSON file at `path` (if it exists), then `AIGC_*`
    /// environment variables. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?.unwrap_or_default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// `load` from the default `config_path()`, or defaults plus environment
    /// when no config directory exists on this platform.
    pub fn load_default() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load(&path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides(|key| std::env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse a config file. `Ok(None)` when the file does not exist.
    pub fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(None);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Overlay environment values read through `lookup`.
    ///
    /// Unparseable numbers and unknown backend kinds are ignored with a warning.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(kind) = get("AIGC_BACKEND") {
            match BackendKind::from_tag(&kind) {
                Some(parsed) => self.switch_backend(parsed),
                None => tracing::warn!(value = %kind, "Ignoring unknown AIGC_BACKEND"),
            }
        }
        if let Some(url) = get("AIGC_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(model) = get("AIGC_MODEL") {
            self.backend.model = model;
        }
        if let Some(key) = get("AIGC_API_KEY").or_else(|| get("DEEPSEEK_API_KEY")) {
            self.backend.api_key = Some(key);
        }
        if let Some(lang) = get("AIGC_LANG") {
            self.language = PromptLanguage::from_tag(&lang);
        }
        if let Some(raw) = get("AIGC_MAX_ATTEMPTS") {
            match raw.trim().parse() {
                Ok(n) => self.max_attempts = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring non-numeric AIGC_MAX_ATTEMPTS"),
            }
        }
        if let Some(raw) = get("AIGC_REDUCTION_THRESHOLD") {
            match raw.trim().parse() {
                Ok(n) => self.reduction_threshold = n,
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring non-numeric AIGC_REDUCTION_THRESHOLD")
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: format!("{} is outside 1-{MAX_ATTEMPTS_LIMIT}", self.max_attempts),
            });
        }
        if self.reduction_threshold > 100 {
            return Err(ConfigError::Invalid {
                field: "reduction_threshold",
                reason: format!("{} is outside 0-100", self.reduction_threshold),
            });
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "backend.base_url",
                reason: "must not be empty".into(),
            });
        }
        if self.backend.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "backend.model",
                reason: "must not be empty".into(),
            });
        }
        if self.detect_max_tokens == 0 || self.reduce_max_tokens == 0 {
            return Err(ConfigError::Invalid {
                field: "detect_max_tokens/reduce_max_tokens",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Change backend kind, moving the URL and model to that kind's defaults
    /// when they are still the other kind's defaults.
    fn switch_backend(&mut self, kind: BackendKind) {
        if self.backend.kind == kind {
            return;
        }
        let (url, model) = match kind {
            BackendKind::Ollama => (DEFAULT_OLLAMA_URL, DEFAULT_OLLAMA_MODEL),
            BackendKind::OpenAiCompatible => (
                crate::pipeline::backend::openai::DEEPSEEK_BASE_URL,
                DEFAULT_OPENAI_MODEL,
            ),
        };
        let defaults = BackendConfig::default();
        if self.backend.base_url == defaults.base_url
            || self.backend.base_url == crate::pipeline::backend::openai::DEEPSEEK_BASE_URL
        {
            self.backend.base_url = url.to_string();
        }
        if self.backend.model == DEFAULT_OLLAMA_MODEL || self.backend.model == DEFAULT_OPENAI_MODEL {
            self.backend.model = model.to_string();
        }
        self.backend.kind = kind;
    }
}
