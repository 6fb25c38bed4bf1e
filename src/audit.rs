//! Audit log: the pipeline's security/activity trail.
//!
//! Shared by the coordinator and the run workers. Every entry is also
//! emitted through `tracing`; the buffer exists for an observer (a log
//! panel) that snapshots or drains it on its own schedule.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::types::{Mode, RunId};

/// Buffered entries kept for the observer. Oldest entries are dropped first.
const AUDIT_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Input matched an injection pattern.
    SuspiciousInput,
    /// The guarded input differs from what was submitted.
    InputSanitized,
    /// A Reduce run was requested; detail carries the gating score.
    ReductionRequested,
    /// A Reduce request was refused by the score gate.
    ReductionRejected,
    /// One attempt's response was rejected by the validator or watchdog.
    AttemptRejected,
    RunCompleted,
    RunFailed,
    /// A completed Reduce started a Detect run on its output.
    ChainStarted,
    /// A completed Reduce could not be chained.
    ChainSkipped,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuspiciousInput => "suspicious_input",
            Self::InputSanitized => "input_sanitized",
            Self::ReductionRequested => "reduction_requested",
            Self::ReductionRejected => "reduction_rejected",
            Self::AttemptRejected => "attempt_rejected",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::ChainStarted => "chain_started",
            Self::ChainSkipped => "chain_skipped",
        }
    }

    fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::SuspiciousInput | Self::AttemptRejected | Self::RunFailed
        )
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Monotonic per log, starting at 1. Survives `drain`.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub run_id: Option<RunId>,
    pub mode: Option<Mode>,
    pub detail: String,
}

struct AuditBuffer {
    next_seq: u64,
    entries: VecDeque<AuditEntry>,
}

/// In-memory audit log buffer.
pub struct AuditLog {
    buffer: Mutex<AuditBuffer>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(AUDIT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(AuditBuffer {
                next_seq: 1,
                entries: VecDeque::with_capacity(capacity.min(AUDIT_BUFFER_CAPACITY)),
            }),
            capacity,
        }
    }

    /// Append an entry. Returns its sequence number, or 0 if the buffer
    /// lock is poisoned (the entry still reaches `tracing`).
    pub fn record(
        &self,
        category: AuditCategory,
        run_id: Option<RunId>,
        mode: Option<Mode>,
        detail: impl Into<String>,
    ) -> u64 {
        let detail = detail.into();
        let run = run_id.map(|id| id.to_string()).unwrap_or_default();
        let mode_str = mode.map(|m| m.as_str()).unwrap_or("");

        if category.is_warning() {
            tracing::warn!(category = %category, run_id = %run, mode = mode_str, detail = %detail, "audit");
        } else {
            tracing::info!(category = %category, run_id = %run, mode = mode_str, detail = %detail, "audit");
        }

        let Ok(mut buf) = self.buffer.lock() else {
            return 0;
        };
        let seq = buf.next_seq;
        buf.next_seq += 1;
        if buf.entries.len() >= self.capacity {
            buf.entries.pop_front();
        }
        buf.entries.push_back(AuditEntry {
            seq,
            timestamp: Utc::now(),
            category,
            run_id,
            mode,
            detail,
        });
        seq
    }

    /// Snapshot of the buffered entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|buf| buf.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take all buffered entries.
    pub fn drain(&self) -> Vec<AuditEntry> {
        self.buffer
            .lock()
            .map(|mut buf| buf.entries.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().map(|buf| buf.entries.len()).unwrap_or(0)
    }

    /// Buffered entries of one category.
    pub fn count(&self, category: AuditCategory) -> usize {
        self.buffer
            .lock()
            .map(|buf| buf.entries.iter().filter(|e| e.category == category).count())
            .unwrap_or(0)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_assigns_increasing_seq() {
        let log = AuditLog::new();
        let a = log.record(AuditCategory::SuspiciousInput, None, None, "ignore the rules");
        let b = log.record(AuditCategory::RunCompleted, Some(RunId::new()), Some(Mode::Detect), "42");
        assert_eq!((a, b), (1, 2));
        assert_eq!(log.buffer_len(), 2);
    }

    #[test]
    fn entries_is_a_snapshot() {
        let log = AuditLog::new();
        log.record(AuditCategory::ChainStarted, None, Some(Mode::Detect), "x");
        let snapshot = log.entries();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].category, AuditCategory::ChainStarted);
        assert_eq!(log.buffer_len(), 1);
    }

    #[test]
    fn drain_empties_but_keeps_sequence() {
        let log = AuditLog::new();
        log.record(AuditCategory::RunFailed, None, None, "a");
        log.record(AuditCategory::RunFailed, None, None, "b");
        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(log.buffer_len(), 0);
        assert_eq!(log.record(AuditCategory::RunFailed, None, None, "c"), 3);
    }

    #[test]
    fn capacity_drops_oldest() {
        let log = AuditLog::with_capacity(2);
        for detail in ["a", "b", "c"] {
            log.record(AuditCategory::AttemptRejected, None, None, detail);
        }
        let details: Vec<String> = log.entries().into_iter().map(|e| e.detail).collect();
        assert_eq!(details, vec!["b", "c"]);
    }

    #[test]
    fn count_filters_by_category() {
        let log = AuditLog::new();
        log.record(AuditCategory::AttemptRejected, None, None, "x");
        log.record(AuditCategory::AttemptRejected, None, None, "y");
        log.record(AuditCategory::RunCompleted, None, None, "z");
        assert_eq!(log.count(AuditCategory::AttemptRejected), 2);
        assert_eq!(log.count(AuditCategory::ChainSkipped), 0);
    }

    #[test]
    fn shared_across_threads() {
        let log = Arc::new(AuditLog::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        log.record(AuditCategory::RunCompleted, None, None, "ok");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.buffer_len(), 40);
        let mut seqs: Vec<u64> = log.entries().iter().map(|e| e.seq).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 40);
    }

    #[test]
    fn entry_serializes_category_snake_case() {
        let log = AuditLog::new();
        log.record(AuditCategory::InputSanitized, None, None, "x");
        let json = serde_json::to_string(&log.entries()[0]).unwrap();
        assert!(json.contains("input_sanitized"));
    }
}
