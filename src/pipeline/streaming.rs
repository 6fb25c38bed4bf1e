//! Streaming Pipeline. One run: compose messages, stream the backend's
//! answer to a sink while accumulating it, validate, retry with a corrective
//! instruction when the content is rejected.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::backend::{BackendError, GenerationBackend};
use super::prompt_templates::PromptCatalog;
use super::stream_guard::{StreamGuard, StreamGuardConfig};
use super::types::{preview, Delivery, Message, Mode, RunFailure, RunId, RunOutcome, StreamChunk};
use super::validation::{validate, Verdict};
use crate::audit::{AuditCategory, AuditLog};
use crate::config::SupervisorConfig;

// ═══════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════

/// Receiver of a run's chunks, in production order.
pub trait ChunkSink {
    fn send(&mut self, chunk: StreamChunk);
}

impl ChunkSink for Vec<StreamChunk> {
    fn send(&mut self, chunk: StreamChunk) {
        self.push(chunk);
    }
}

/// Sink that tags chunks with their run and pushes them onto the delivery
/// channel.
///
/// If it is dropped before an `End` went out (the worker panicked), it sends
/// a failure `End` itself so the consumer never waits on a dead run.
pub struct ChannelSink {
    tx: Sender<Delivery>,
    run_id: RunId,
    mode: Mode,
    finished: bool,
}

impl ChannelSink {
    pub fn new(tx: Sender<Delivery>, run_id: RunId, mode: Mode) -> Self {
        Self {
            tx,
            run_id,
            mode,
            finished: false,
        }
    }
}

impl ChunkSink for ChannelSink {
    fn send(&mut self, chunk: StreamChunk) {
        if self.finished {
            return;
        }
        self.finished = chunk.is_end();
        // A closed channel means the consumer is gone; the run still completes.
        let _ = self.tx.send(Delivery {
            run_id: self.run_id,
            mode: self.mode,
            chunk,
        });
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(run_id = %self.run_id, mode = %self.mode, "Run ended without a terminal chunk");
            self.send(StreamChunk::End {
                outcome: RunOutcome::Failed(RunFailure::Backend(
                    "worker terminated unexpectedly".into(),
                )),
            });
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Retry bookkeeping
// ═══════════════════════════════════════════════════════════

/// Attempt counter of one run. `attempts() <= max_attempts()` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Count a new backend call. Returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

/// Per-run knobs, lifted out of `SupervisorConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub preview_chars: usize,
    pub detect_max_tokens: usize,
    pub reduce_max_tokens: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for PipelineSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            preview_chars: config.preview_chars,
            detect_max_tokens: config.detect_max_tokens,
            reduce_max_tokens: config.reduce_max_tokens,
        }
    }
}

enum AttemptResult {
    Valid(String),
    Rejected(String),
    Failed(BackendError),
}

/// Everything a run needs, passed down explicitly. Cheap to clone; each
/// worker gets its own copy.
#[derive(Clone)]
pub struct StreamingPipeline {
    backend: Arc<dyn GenerationBackend>,
    catalog: PromptCatalog,
    audit: Arc<AuditLog>,
    settings: PipelineSettings,
}

impl StreamingPipeline {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        catalog: PromptCatalog,
        audit: Arc<AuditLog>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend,
            catalog,
            audit,
            settings,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Execute one run to completion. Every text fragment goes to `sink` as
    /// it arrives; the final item is always exactly one `End`.
    pub fn run(
        &self,
        run_id: RunId,
        mode: Mode,
        history: &[Message],
        sink: &mut dyn ChunkSink,
    ) -> RunOutcome {
        let mut outbound = Vec::with_capacity(history.len() + 1);
        outbound.push(Message::system(self.catalog.instructions_for(mode)));
        outbound.extend_from_slice(history);

        let mut retry = RetryState::new(self.settings.max_attempts);
        tracing::info!(run_id = %run_id, mode = %mode, backend = self.backend.name(), "Run started");

        let outcome = loop {
            let attempt = retry.begin_attempt();
            match self.attempt(mode, &outbound, sink) {
                AttemptResult::Valid(text) => break RunOutcome::Completed(text),
                AttemptResult::Failed(e) => {
                    tracing::warn!(run_id = %run_id, mode = %mode, attempt, error = %e, "Backend failure, run aborted");
                    break RunOutcome::Failed(RunFailure::Backend(e.to_string()));
                }
                AttemptResult::Rejected(reason) => {
                    self.audit.record(
                        AuditCategory::AttemptRejected,
                        Some(run_id),
                        Some(mode),
                        format!("attempt {attempt}/{}: {reason}", retry.max_attempts()),
                    );
                    if !retry.can_retry() {
                        break RunOutcome::Failed(RunFailure::ValidationExhausted {
                            attempts: retry.attempts(),
                        });
                    }
                    outbound.push(Message::system(self.catalog.corrective_for(mode)));
                    sink.send(StreamChunk::Retrying { attempt, reason });
                }
            }
        };

        match &outcome {
            RunOutcome::Completed(text) => {
                self.audit.record(
                    AuditCategory::RunCompleted,
                    Some(run_id),
                    Some(mode),
                    preview(text.trim(), self.settings.preview_chars),
                );
            }
            RunOutcome::Failed(failure) => {
                self.audit.record(
                    AuditCategory::RunFailed,
                    Some(run_id),
                    Some(mode),
                    failure.to_string(),
                );
            }
        }
        tracing::info!(
            run_id = %run_id,
            mode = %mode,
            attempts = retry.attempts(),
            completed = outcome.is_completed(),
            "Run finished"
        );

        sink.send(StreamChunk::End {
            outcome: outcome.clone(),
        });
        outcome
    }

    /// One backend call. The stream is dropped (closing the request) as soon
    /// as it fails or the watchdog trips.
    fn attempt(&self, mode: Mode, outbound: &[Message], sink: &mut dyn ChunkSink) -> AttemptResult {
        let stream = match self.backend.open_stream(outbound) {
            Ok(stream) => stream,
            Err(e) => return AttemptResult::Failed(e),
        };
        let mut watchdog = StreamGuard::new(StreamGuardConfig::for_mode(
            mode,
            self.settings.detect_max_tokens,
            self.settings.reduce_max_tokens,
        ));
        let mut accumulated = String::new();

        for item in stream {
            let fragment = match item {
                Ok(fragment) => fragment,
                Err(e) => return AttemptResult::Failed(e),
            };
            if fragment.is_empty() {
                continue;
            }
            if let Err(abort) = watchdog.feed(&fragment) {
                tracing::warn!(mode = %mode, pattern = %abort.pattern, "Stream aborted by watchdog");
                return AttemptResult::Rejected(abort.to_string());
            }
            accumulated.push_str(&fragment);
            sink.send(StreamChunk::Text { text: fragment });
        }

        match validate(mode, &accumulated) {
            Verdict::Valid => AttemptResult::Valid(accumulated),
            Verdict::Invalid(rejection) => AttemptResult::Rejected(rejection.to_string()),
        }
    }

    /// Run on a dedicated named thread, delivering to `tx`.
    pub fn spawn(
        &self,
        run_id: RunId,
        mode: Mode,
        history: Vec<Message>,
        tx: Sender<Delivery>,
    ) -> std::io::Result<JoinHandle<()>> {
        let pipeline = self.clone();
        std::thread::Builder::new()
            .name(format!("aigc-{mode}-run"))
            .spawn(move || {
                let mut sink = ChannelSink::new(tx, run_id, mode);
                pipeline.run(run_id, mode, &history, &mut sink);
            })
    }
}
