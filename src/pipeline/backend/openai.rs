use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::{BackendError, GenerationBackend, TokenStream};
use crate::pipeline::types::Message;

/// Default endpoint for the hosted OpenAI-compatible backend.
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints
/// (DeepSeek and friends).
pub struct OpenAiCompatibleBackend {
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    client: reqwest::blocking::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
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
            api_key: api_key.to_string(),
            temperature,
            client,
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
    stream: bool,
    temperature: f32,
}

#[derive(Serialize)]
struct CompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl GenerationBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn open_stream(&self, messages: &[Message]) -> Result<TokenStream, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| CompletionMessage {
                    role: m.role().as_str(),
                    content: m.content(),
                })
                .collect(),
            stream: true,
            temperature: self.temperature,
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "Opening completion stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
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

        Ok(Box::new(SseTokens::new(BufReader::new(response))))
    }
}

/// Fragment iterator over a server-sent-events completion body.
///
/// Ends at `data: [DONE]`, or at end of body once a choice has reported a
/// `finish_reason`. Anything else ending the body is a stream error.
pub struct SseTokens<R> {
    reader: R,
    finished: bool,
    saw_finish_reason: bool,
}

impl<R: BufRead> SseTokens<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
            saw_finish_reason: false,
        }
    }

    fn fail(&mut self, error: BackendError) -> Option<Result<String, BackendError>> {
        self.finished = true;
        Some(Err(error))
    }
}

impl<R: BufRead> Iterator for SseTokens<R> {
    type Item = Result<String, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        while !self.finished {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) if self.saw_finish_reason => {
                    self.finished = true;
                    return None;
                }
                Ok(0) => {
                    return self.fail(BackendError::Stream(
                        "connection closed before [DONE]".into(),
                    ))
                }
                Ok(_) => {}
                Err(e) => return self.fail(BackendError::Stream(e.to_string())),
            }

            // Only `data:` fields carry payload; comments and other fields are skipped.
            let Some(raw) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let raw = raw.trim_start();
            if raw.is_empty() {
                continue;
            }
            if raw == "[DONE]" {
                self.finished = true;
                return None;
            }

            let event: Value = match serde_json::from_str(raw) {
                Ok(event) => event,
                Err(e) => return self.fail(BackendError::Stream(format!("{e}: {raw}"))),
            };

            if let Some(message) = extract_api_error_message(&event) {
                return self.fail(BackendError::Api(message));
            }

            let choice = event.get("choices").and_then(|c| c.get(0));
            if choice
                .and_then(|c| c.get("finish_reason"))
                .is_some_and(|r| !r.is_null())
            {
                self.saw_finish_reason = true;
            }

            let content = choice
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !content.is_empty() {
                return Some(Ok(content.to_string()));
            }
        }
        None
    }
}

fn extract_api_error_message(event: &Value) -> Option<String> {
    let error = event.get("error")?;
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("backend reported an error during streaming".to_string())
}
