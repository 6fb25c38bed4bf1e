//! Single-flight control: at most one pipeline run in flight, system-wide.
//!
//! - `try_acquire()` never blocks: a second submission while a run is in
//!   flight is refused, not queued
//! - the returned `FlightPermit` is owned (`Arc`-based) so it can outlive the
//!   call that created it and be held for the run's whole lifetime
//! - `rebind()` hands the permit to a chained run without releasing it
//! - `current_run()` provides observability (which run, which mode, since when)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::types::{Mode, RunId};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Snapshot of the run currently holding the flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub mode: Mode,
    /// True when the run was started by auto-chaining, not by the caller.
    pub chained: bool,
    pub started_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════
// FlightControl
// ═══════════════════════════════════════════════════════════

pub struct FlightControl {
    busy: AtomicBool,
    current: Mutex<Option<ActiveRun>>,
}

impl FlightControl {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// Claim the flight for `run_id`. Returns `None` if a run is already in flight.
    pub fn try_acquire(self: &Arc<Self>, run_id: RunId, mode: Mode) -> Option<FlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.set_current(run_id, mode, false);
        Some(FlightPermit {
            control: Arc::clone(self),
        })
    }

    /// What is in flight right now? `None` when idle.
    pub fn current_run(&self) -> Option<ActiveRun> {
        self.current.lock().ok()?.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    // ── Internal ────────────────────────────────────────────

    fn set_current(&self, run_id: RunId, mode: Mode, chained: bool) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(ActiveRun {
                run_id,
                mode,
                chained,
                started_at: Utc::now(),
            });
        }
    }

    fn release(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        self.busy.store(false, Ordering::Release);
    }
}

impl Default for FlightControl {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════
// FlightPermit: RAII proof of holding the flight
// ═══════════════════════════════════════════════════════════

/// Dropping the permit releases the flight and clears the current run.
pub struct FlightPermit {
    control: Arc<FlightControl>,
}

impl FlightPermit {
    /// Transfer the flight to a chained run. The flight stays busy throughout.
    pub fn rebind(&mut self, run_id: RunId, mode: Mode) {
        self.control.set_current(run_id, mode, true);
    }

    pub fn run(&self) -> Option<ActiveRun> {
        self.control.current_run()
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.control.release();
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> Arc<FlightControl> {
        Arc::new(FlightControl::new())
    }

    #[test]
    fn new_control_is_idle() {
        let control = control();
        assert!(!control.is_busy());
        assert!(control.current_run().is_none());
    }

    #[test]
    fn acquire_sets_current_run() {
        let control = control();
        let id = RunId::new();
        let permit = control.try_acquire(id, Mode::Detect).unwrap();
        let run = control.current_run().unwrap();
        assert_eq!(run.run_id, id);
        assert_eq!(run.mode, Mode::Detect);
        assert!(!run.chained);
        assert!(control.is_busy());
        drop(permit);
        assert!(control.current_run().is_none());
    }

    #[test]
    fn second_acquire_refused_while_busy() {
        let control = control();
        let first = RunId::new();
        let _permit = control.try_acquire(first, Mode::Detect).unwrap();
        assert!(control.try_acquire(RunId::new(), Mode::Reduce).is_none());
        // The refused attempt leaves the in-flight run untouched.
        assert_eq!(control.current_run().unwrap().run_id, first);
    }

    #[test]
    fn drop_releases_flight() {
        let control = control();
        {
            let _permit = control.try_acquire(RunId::new(), Mode::Reduce).unwrap();
            assert!(control.is_busy());
        }
        assert!(!control.is_busy());
        assert!(control.try_acquire(RunId::new(), Mode::Detect).is_some());
    }

    #[test]
    fn rebind_keeps_flight_busy() {
        let control = control();
        let mut permit = control.try_acquire(RunId::new(), Mode::Reduce).unwrap();
        let chained = RunId::new();
        permit.rebind(chained, Mode::Detect);
        assert!(control.is_busy());
        let run = permit.run().unwrap();
        assert_eq!(run.run_id, chained);
        assert_eq!(run.mode, Mode::Detect);
        assert!(run.chained);
        assert!(control.try_acquire(RunId::new(), Mode::Detect).is_none());
    }

    #[test]
    fn permit_can_move_across_threads() {
        let control = control();
        let permit = control.try_acquire(RunId::new(), Mode::Detect).unwrap();
        std::thread::spawn(move || drop(permit)).join().unwrap();
        assert!(!control.is_busy());
    }

    #[test]
    fn only_one_thread_wins_the_race() {
        let control = control();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let control = Arc::clone(&control);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    control.try_acquire(RunId::new(), Mode::Detect)
                })
            })
            .collect();
        let permits: Vec<_> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(permits.len(), 1);
    }

    #[test]
    fn active_run_serializes() {
        let run = ActiveRun {
            run_id: RunId::new(),
            mode: Mode::Reduce,
            chained: false,
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"reduce\""));
    }
}
