//! Mode Coordinator: the consumer-side owner of a session.
//!
//! **Model**: the host calls `submit` / `submit_reduction`, then drains the
//! delivery channel on its own schedule (`drain`, `drain_for`, `wait_idle`).
//! Runs execute on worker threads and only ever *send*; everything with
//! session state (Memory, the score gate, the exchange log, chaining) happens
//! here, on the draining side, when a run's `End` arrives. A run is in
//! flight from submission until its `End` has been drained.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audit::{AuditCategory, AuditLog};
use crate::config::{ConfigError, SupervisorConfig};
use crate::flight::{ActiveRun, FlightControl, FlightPermit};
use crate::pipeline::backend::{self, BackendError, GenerationBackend};
use crate::pipeline::memory::ConversationMemory;
use crate::pipeline::prompt_templates::PromptCatalog;
use crate::pipeline::safety::{GuardError, InputGuard};
use crate::pipeline::streaming::{PipelineSettings, StreamingPipeline};
use crate::pipeline::types::{
    preview, Delivery, Exchange, Message, Mode, RunId, RunOutcome, StreamChunk,
};
use crate::pipeline::validation::parse_score;

/// Characters of suspicious input quoted in the audit log.
const SUSPICIOUS_PREVIEW_CHARS: usize = 50;

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Why a Reduce request did not pass the score gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    /// No completed Detect run since the last submission.
    NoScore,
    BelowThreshold { score: u32, threshold: u32 },
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoScore => f.write_str("no detection score yet; run a detection first"),
            Self::BelowThreshold { score, threshold } => write!(
                f,
                "AI-generated share {score} is below {threshold}; no reduction needed"
            ),
        }
    }
}

/// A submission that did not start a run. Nothing reached the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("A run is already in flight; try again when it finishes")]
    Busy,

    #[error("Reduction not permitted: {0}")]
    GateRejected(GateReason),

    #[error("Nothing left to send after input screening")]
    EmptyInput,

    #[error("Could not start worker: {0}")]
    Spawn(String),

    #[error("Supervisor has been shut down")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Input guard error: {0}")]
    Guard(#[from] GuardError),
}

// ═══════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════

struct InFlight {
    exchange: Exchange,
    permit: FlightPermit,
}

pub struct Supervisor {
    pipeline: StreamingPipeline,
    guard: InputGuard,
    flight: Arc<FlightControl>,
    audit: Arc<AuditLog>,
    memory: ConversationMemory,
    exchanges: Vec<Exchange>,
    tx: Sender<Delivery>,
    rx: Receiver<Delivery>,
    active: Option<InFlight>,
    /// Input of the most recent Detect run; the source text for Reduce.
    detect_source: Option<String>,
    /// Score of the most recent Detect run, if it completed.
    detect_score: Option<u32>,
    reduction_threshold: u32,
    shut_down: bool,
}

impl Supervisor {
    /// Build a supervisor talking to the backend described by `config`.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        let backend = backend::from_config(&config.backend)?;
        Self::with_backend(config, backend)
    }

    /// Build a supervisor around an existing backend.
    pub fn with_backend(
        config: SupervisorConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        let guard = match config.guard_rules.clone() {
            Some(rules) => InputGuard::new(rules)?,
            None => InputGuard::builtin()?,
        };
        let audit = Arc::new(AuditLog::new());
        let pipeline = StreamingPipeline::new(
            backend,
            PromptCatalog::new(config.language),
            Arc::clone(&audit),
            PipelineSettings::from(&config),
        );
        let (tx, rx) = mpsc::channel();

        tracing::info!(
            backend = pipeline.backend_name(),
            language = %config.language,
            max_attempts = config.max_attempts,
            guard_rules = guard.rule_count(),
            "Supervisor ready"
        );

        Ok(Self {
            pipeline,
            guard,
            flight: Arc::new(FlightControl::new()),
            audit,
            memory: ConversationMemory::new(),
            exchanges: Vec::new(),
            tx,
            rx,
            active: None,
            detect_source: None,
            detect_score: None,
            reduction_threshold: config.reduction_threshold,
            shut_down: false,
        })
    }

    // ── Submission ──────────────────────────────────────────

    /// Screen `raw_text` and start a Detect run on what remains.
    pub fn submit(&mut self, raw_text: &str) -> Result<RunId, SubmitError> {
        self.ensure_accepting()?;

        let inspection = self.guard.inspect(raw_text);
        if inspection.is_suspicious {
            self.audit.record(
                AuditCategory::SuspiciousInput,
                None,
                None,
                format!(
                    "rules [{}]: {}",
                    inspection.matched_rules.join(", "),
                    preview(raw_text.trim(), SUSPICIOUS_PREVIEW_CHARS)
                ),
            );
        }
        if inspection.cleaned_text != raw_text.trim() {
            self.audit.record(
                AuditCategory::InputSanitized,
                None,
                None,
                format!(
                    "{} -> {} chars",
                    raw_text.trim().chars().count(),
                    inspection.cleaned_text.chars().count()
                ),
            );
        }
        if !inspection.has_content() {
            return Err(SubmitError::EmptyInput);
        }

        let run_id = RunId::new();
        let permit = self
            .flight
            .try_acquire(run_id, Mode::Detect)
            .ok_or(SubmitError::Busy)?;
        self.start_run(permit, run_id, Mode::Detect, inspection.cleaned_text)?;
        Ok(run_id)
    }

    /// Start a Reduce run on the last Detect input, if its score passes the gate.
    pub fn submit_reduction(&mut self) -> Result<RunId, SubmitError> {
        self.ensure_accepting()?;

        let (score, source) = match (self.detect_score, self.detect_source.clone()) {
            (Some(score), Some(source)) if score >= self.reduction_threshold => (score, source),
            (Some(score), Some(_)) => {
                return Err(self.reject_reduction(GateReason::BelowThreshold {
                    score,
                    threshold: self.reduction_threshold,
                }))
            }
            _ => return Err(self.reject_reduction(GateReason::NoScore)),
        };

        let run_id = RunId::new();
        let permit = self
            .flight
            .try_acquire(run_id, Mode::Reduce)
            .ok_or(SubmitError::Busy)?;
        self.audit.record(
            AuditCategory::ReductionRequested,
            Some(run_id),
            Some(Mode::Reduce),
            format!("score {score}"),
        );
        self.start_run(permit, run_id, Mode::Reduce, source)?;
        Ok(run_id)
    }

    /// Stop consuming. The in-flight run (if any) is detached: its worker
    /// finishes in the background and its output is discarded.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(flight) = self.active.take() {
            tracing::info!(run_id = %flight.exchange.run_id, "Shutdown detached in-flight run");
        }
        // Swapping the channel drops the old receiver, so a detached worker's
        // sends fail at once instead of queueing.
        let (tx, rx) = mpsc::channel();
        self.tx = tx;
        self.rx = rx;
    }

    // ── Draining ────────────────────────────────────────────

    /// Everything delivered so far, without blocking.
    pub fn drain(&mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = self.rx.try_recv() {
            self.accept(delivery, &mut out);
        }
        out
    }

    /// Wait up to `timeout` for the first delivery, then drain the rest.
    pub fn drain_for(&mut self, timeout: Duration) -> Vec<Delivery> {
        if self.active.is_none() {
            return self.drain();
        }
        let mut out = Vec::new();
        if let Ok(delivery) = self.rx.recv_timeout(timeout) {
            self.accept(delivery, &mut out);
        }
        out.extend(self.drain());
        out
    }

    /// Drain until no run is in flight (chained runs included) or `timeout`
    /// passes. Check `is_idle()` to tell which.
    pub fn wait_idle(&mut self, timeout: Duration) -> Vec<Delivery> {
        // No representable deadline means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut out = Vec::new();
        while self.active.is_some() {
            let received = match deadline {
                Some(deadline) => self
                    .rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(delivery) => self.accept(delivery, &mut out),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        out
    }

    // ── Observability ───────────────────────────────────────

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn current_run(&self) -> Option<ActiveRun> {
        self.flight.current_run()
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Every finalized exchange, any outcome, oldest first.
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Shared handle for an audit observer.
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    pub fn last_score(&self) -> Option<u32> {
        self.detect_score
    }

    /// Text a `submit_reduction` would rewrite.
    pub fn reduction_source(&self) -> Option<&str> {
        self.detect_source.as_deref()
    }

    // ── Internal ────────────────────────────────────────────

    fn ensure_accepting(&self) -> Result<(), SubmitError> {
        if self.shut_down {
            return Err(SubmitError::ShutDown);
        }
        if self.active.is_some() || self.flight.is_busy() {
            return Err(SubmitError::Busy);
        }
        Ok(())
    }

    fn reject_reduction(&self, reason: GateReason) -> SubmitError {
        self.audit.record(
            AuditCategory::ReductionRejected,
            None,
            Some(Mode::Reduce),
            reason.to_string(),
        );
        SubmitError::GateRejected(reason)
    }

    /// Spawn the worker for a run whose permit is already held.
    fn start_run(
        &mut self,
        permit: FlightPermit,
        run_id: RunId,
        mode: Mode,
        input: String,
    ) -> Result<(), SubmitError> {
        let history = vec![Message::user(input.clone())];
        if let Err(e) = self.pipeline.spawn(run_id, mode, history, self.tx.clone()) {
            tracing::warn!(run_id = %run_id, mode = %mode, error = %e, "Failed to spawn run worker");
            // Dropping the permit releases the flight.
            return Err(SubmitError::Spawn(e.to_string()));
        }

        if mode == Mode::Detect {
            self.detect_score = None;
            self.detect_source = Some(input.clone());
        }
        self.active = Some(InFlight {
            exchange: Exchange::start(run_id, mode, input),
            permit,
        });
        Ok(())
    }

    fn accept(&mut self, delivery: Delivery, out: &mut Vec<Delivery>) {
        let current = self.active.as_ref().map(|f| f.exchange.run_id);
        if current != Some(delivery.run_id) {
            tracing::debug!(run_id = %delivery.run_id, "Discarding delivery from detached run");
            return;
        }

        let outcome = match &delivery.chunk {
            StreamChunk::End { outcome } => Some(outcome.clone()),
            _ => None,
        };
        out.push(delivery);
        if let Some(outcome) = outcome {
            self.finish_run(outcome);
        }
    }

    /// Finalize the in-flight exchange and, for a completed Reduce, chain
    /// straight into a Detect run on the rewrite.
    fn finish_run(&mut self, outcome: RunOutcome) {
        let Some(InFlight {
            mut exchange,
            mut permit,
        }) = self.active.take()
        else {
            return;
        };

        exchange.finalize(&outcome);
        let mode = exchange.mode;
        let completed = outcome.text().map(str::to_string);
        if let Some(text) = &completed {
            self.memory.record_exchange(&exchange.input_text, text);
            if mode == Mode::Detect {
                self.detect_score = parse_score(text);
            }
        }
        self.exchanges.push(exchange);

        let Some(rewrite) = completed.filter(|_| mode == Mode::Reduce) else {
            return;
        };

        let inspection = self.guard.inspect(&rewrite);
        if inspection.is_suspicious {
            self.audit.record(
                AuditCategory::SuspiciousInput,
                None,
                Some(Mode::Detect),
                format!(
                    "chained rewrite matched [{}]",
                    inspection.matched_rules.join(", ")
                ),
            );
        }
        if !inspection.has_content() {
            self.audit.record(
                AuditCategory::ChainSkipped,
                None,
                Some(Mode::Detect),
                "rewrite was empty after input screening",
            );
            return;
        }

        let run_id = RunId::new();
        permit.rebind(run_id, Mode::Detect);
        self.audit.record(
            AuditCategory::ChainStarted,
            Some(run_id),
            Some(Mode::Detect),
            preview(&inspection.cleaned_text, SUSPICIOUS_PREVIEW_CHARS),
        );
        if let Err(e) = self.start_run(permit, run_id, Mode::Detect, inspection.cleaned_text) {
            self.audit.record(
                AuditCategory::ChainSkipped,
                Some(run_id),
                Some(Mode::Detect),
                e.to_string(),
            );
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
