use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BackendError, GenerationBackend, TokenStream};
use crate::pipeline::types::Message;

/// Streaming client for a local Ollama instance (`/api/chat`).
pub struct OllamaChatBackend {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::blocking::Client,
}

impl OllamaChatBackend {
    /// Only the connect phase is bounded; a generation may stream for as
    /// long as the model keeps producing.
    pub fn new(
        base_url: &str,
        model: &str,
        temperature: f32,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| BackendError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Request body for Ollama /api/chat
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

/// One NDJSON line of a streaming /api/chat response
#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl GenerationBackend for OllamaChatBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn open_stream(&self, messages: &[Message]) -> Result<TokenStream, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role().as_str(),
                    content: m.content(),
                })
                .collect(),
            stream: true,
            options: ChatOptions {
                temperature: self.temperature,
            },
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "Opening Ollama chat stream");

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                BackendError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                BackendError::Timeout(e.to_string())
            } else {
                BackendError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::new(NdjsonTokens::new(BufReader::new(response))))
    }
}

/// Fragment iterator over an Ollama NDJSON body.
///
/// Ends after the `done: true` line. A body that closes before it is a
/// stream error.
pub struct NdjsonTokens<R> {
    reader: R,
    finished: bool,
}

impl<R: BufRead> NdjsonTokens<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }

    fn fail(&mut self, error: BackendError) -> Option<Result<String, BackendError>> {
        self.finished = true;
        Some(Err(error))
    }
}

impl<R: BufRead> Iterator for NdjsonTokens<R> {
    type Item = Result<String, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        while !self.finished {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    return self.fail(BackendError::Stream(
                        "connection closed before the final chunk".into(),
                    ))
                }
                Ok(_) => {}
                Err(e) => return self.fail(BackendError::Stream(e.to_string())),
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let chunk: ChatChunk = match serde_json::from_str(trimmed) {
                Ok(chunk) => chunk,
                Err(e) => return self.fail(BackendError::Stream(format!("{e}: {trimmed}"))),
            };

            if let Some(error) = chunk.error {
                return self.fail(BackendError::Api(error));
            }
            if chunk.done {
                self.finished = true;
            }

            let content = chunk.message.map(|m| m.content).unwrap_or_default();
            if !content.is_empty() {
                return Some(Ok(content));
            }
        }
        None
    }
}
