//! Generation backends: anything that turns an ordered message list into
//! a stream of text fragments.

pub mod ollama;
pub mod openai;

pub use ollama::OllamaChatBackend;
pub use openai::OpenAiCompatibleBackend;

use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::types::Message;
use crate::config::{BackendConfig, BackendKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend is not reachable at {0}")]
    Connection(String),

    #[error("Backend request timed out: {0}")]
    Timeout(String),

    #[error("Backend returned error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("Backend reported an error mid-stream: {0}")]
    Api(String),

    #[error("Malformed stream data: {0}")]
    Stream(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Backend misconfigured: {0}")]
    Configuration(String),
}

/// Lazy sequence of fragments. Reading it drives the underlying request;
/// dropping it early closes the connection.
pub type TokenStream = Box<dyn Iterator<Item = Result<String, BackendError>> + Send>;

/// A streaming chat-completion source.
///
/// Implementations are shared across worker threads, one call per attempt.
pub trait GenerationBackend: Send + Sync {
    /// Short label for logs ("ollama", "openai_compatible", "mock").
    fn name(&self) -> &str;

    /// Open one streaming completion for `messages`.
    fn open_stream(&self, messages: &[Message]) -> Result<TokenStream, BackendError>;
}

/// Build the backend described by `config`.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn GenerationBackend>, BackendError> {
    let backend: Arc<dyn GenerationBackend> = match config.kind {
        BackendKind::Ollama => Arc::new(OllamaChatBackend::new(
            &config.base_url,
            &config.model,
            config.temperature,
            config.connect_timeout(),
        )?),
        BackendKind::OpenAiCompatible => {
            let api_key = config
                .api_key
                .as_deref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    BackendError::Configuration(
                        "openai_compatible backend requires an API key (AIGC_API_KEY)".into(),
                    )
                })?;
            Arc::new(OpenAiCompatibleBackend::new(
                &config.base_url,
                &config.model,
                api_key,
                config.temperature,
                config.connect_timeout(),
            )?)
        }
    };

    tracing::info!(
        backend = backend.name(),
        model = %config.model,
        base_url = %config.base_url,
        "Generation backend ready"
    );
    Ok(backend)
}

// ═══════════════════════════════════════════════════════════
// Mock backend
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum MockReply {
    Fragments(Vec<String>),
    OpenError(BackendError),
    BreakAfter(Vec<String>, BackendError),
}

/// Scripted backend for testing.
///
/// Call N plays script entry N; once the script is exhausted the last entry
/// repeats. Every call's message list is recorded.
pub struct MockBackend {
    script: Vec<MockReply>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockBackend {
    /// One reply per call, each streamed in word-sized fragments.
    pub fn new(replies: &[&str]) -> Self {
        Self::from_script(
            replies
                .iter()
                .map(|r| MockReply::Fragments(split_fragments(r)))
                .collect(),
        )
    }

    /// Every call fails before streaming anything.
    pub fn failing(error: BackendError) -> Self {
        Self::from_script(vec![MockReply::OpenError(error)])
    }

    /// Every call streams `fragments` and then fails.
    pub fn breaking_after(fragments: &[&str], error: BackendError) -> Self {
        Self::from_script(vec![MockReply::BreakAfter(
            fragments.iter().map(|f| f.to_string()).collect(),
            error,
        )])
    }

    /// Append a reply streamed exactly as the given fragments.
    pub fn then_fragments(mut self, fragments: &[&str]) -> Self {
        self.script.push(MockReply::Fragments(
            fragments.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }

    /// Append a reply.
    pub fn then_reply(mut self, reply: &str) -> Self {
        self.script.push(MockReply::Fragments(split_fragments(reply)));
        self
    }

    /// Append a call that fails before streaming.
    pub fn then_fail(mut self, error: BackendError) -> Self {
        self.script.push(MockReply::OpenError(error));
        self
    }

    /// Number of `open_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.lock_calls().len()
    }

    /// Message lists of every call, oldest first.
    pub fn recorded(&self) -> Vec<Vec<Message>> {
        self.lock_calls().clone()
    }

    fn from_script(script: Vec<MockReply>) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Message>>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GenerationBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn open_stream(&self, messages: &[Message]) -> Result<TokenStream, BackendError> {
        let index = {
            let mut calls = self.lock_calls();
            calls.push(messages.to_vec());
            calls.len() - 1
        };

        let reply = match self.script.get(index).or_else(|| self.script.last()) {
            Some(reply) => reply.clone(),
            None => MockReply::Fragments(Vec::new()),
        };

        match reply {
            MockReply::Fragments(fragments) => Ok(Box::new(fragments.into_iter().map(Ok))),
            MockReply::OpenError(error) => Err(error),
            MockReply::BreakAfter(fragments, error) => Ok(Box::new(
                fragments
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(error))),
            )),
        }
    }
}

/// Split into fragments that keep their trailing space ("a b" -> ["a ", "b"]).
fn split_fragments(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}
