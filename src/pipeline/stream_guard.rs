//! Degeneration watchdog for backend token streams.
//!
//! Sits between the backend stream and the delivery sink. An attempt whose
//! output settles into a cycle (one fragment, or a short phrase, repeated
//! back to back) or outgrows its mode's fragment cap is cut short, and the
//! attempt counts as invalid.
//!
//! Cycles are found by tracking, for every candidate period `p`, how many
//! fragments in a row have equalled the fragment `p` positions earlier.

use std::collections::VecDeque;
use std::fmt;

use super::types::{preview, Mode};

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGuardConfig {
    /// Hard cap on fragments per attempt.
    pub max_fragments: usize,
    /// Longest cycle, in fragments, that is checked.
    pub max_period: usize,
    /// Fragments a cycle must cover (first pass included) to count as a loop.
    pub loop_span: usize,
}

impl StreamGuardConfig {
    /// Thresholds for one mode.
    ///
    /// Detect answers are one to three characters, so any cycle at all is a
    /// loop. Reduce output is prose that mirrors its input and may repeat a
    /// word or a line break a few times; only long cycles count.
    pub fn for_mode(mode: Mode, detect_max_fragments: usize, reduce_max_fragments: usize) -> Self {
        match mode {
            Mode::Detect => Self {
                max_fragments: detect_max_fragments.max(1),
                max_period: 4,
                loop_span: 6,
            },
            Mode::Reduce => Self {
                max_fragments: reduce_max_fragments.max(1),
                max_period: 16,
                loop_span: 48,
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Abort reasons
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegenerationPattern {
    /// The last `span` fragments repeat a cycle of `period` fragments.
    Loop {
        period: usize,
        span: usize,
        cycle: String,
    },
    /// More fragments than the mode allows.
    FragmentCap { limit: usize },
}

impl fmt::Display for DegenerationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loop { period, span, cycle } => {
                write!(f, "loop({cycle:?}, period {period} over {span} fragments)")
            }
            Self::FragmentCap { limit } => write!(f, "fragment_cap({limit})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream aborted: {pattern} after {fragments_seen} fragments")]
pub struct DegenerationAbort {
    pub pattern: DegenerationPattern,
    pub fragments_seen: usize,
}

// ═══════════════════════════════════════════════════════════
// StreamGuard
// ═══════════════════════════════════════════════════════════

/// Per-attempt watchdog. Create one per backend stream and `feed` every
/// fragment before forwarding it.
pub struct StreamGuard {
    config: StreamGuardConfig,
    /// The last `max_period` fragments, newest at the back.
    recent: VecDeque<String>,
    /// `matches[p - 1]`: fragments in a row equal to the one `p` earlier.
    matches: Vec<usize>,
    fragments_seen: usize,
}

impl StreamGuard {
    pub fn new(config: StreamGuardConfig) -> Self {
        let periods = config.max_period;
        Self {
            config,
            recent: VecDeque::with_capacity(periods),
            matches: vec![0; periods],
            fragments_seen: 0,
        }
    }

    /// Check one fragment. `Err` means the caller must stop reading the stream.
    pub fn feed(&mut self, fragment: &str) -> Result<(), DegenerationAbort> {
        self.fragments_seen += 1;
        if self.fragments_seen > self.config.max_fragments {
            return Err(self.abort(DegenerationPattern::FragmentCap {
                limit: self.config.max_fragments,
            }));
        }

        let mut looping = None;
        for period in 1..=self.config.max_period {
            let echoes = self
                .recent
                .len()
                .checked_sub(period)
                .and_then(|i| self.recent.get(i))
                .is_some_and(|earlier| earlier == fragment);
            let run = &mut self.matches[period - 1];
            *run = if echoes { *run + 1 } else { 0 };

            // Two full cycles at least, and the whole loop long enough.
            let span = *run + period;
            if looping.is_none() && *run >= period && span >= self.config.loop_span {
                looping = Some((period, span));
            }
        }

        if self.recent.len() == self.config.max_period {
            self.recent.pop_front();
        }
        if self.config.max_period > 0 {
            self.recent.push_back(fragment.to_string());
        }

        match looping {
            Some((period, span)) => {
                let start = self.recent.len().saturating_sub(period);
                let cycle: String = self.recent.range(start..).map(String::as_str).collect();
                Err(self.abort(DegenerationPattern::Loop {
                    period,
                    span,
                    cycle: preview(&cycle, 40),
                }))
            }
            None => Ok(()),
        }
    }

    pub fn fragments_seen(&self) -> usize {
        self.fragments_seen
    }

    fn abort(&self, pattern: DegenerationPattern) -> DegenerationAbort {
        DegenerationAbort {
            pattern,
            fragments_seen: self.fragments_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect() -> StreamGuard {
        StreamGuard::new(StreamGuardConfig::for_mode(Mode::Detect, 32, 8192))
    }

    fn reduce() -> StreamGuard {
        StreamGuard::new(StreamGuardConfig::for_mode(Mode::Reduce, 32, 8192))
    }

    /// Feed until the guard trips; `None` if it never does.
    fn first_abort(guard: &mut StreamGuard, fragments: &[&str]) -> Option<DegenerationAbort> {
        fragments.iter().find_map(|f| guard.feed(f).err())
    }

    // ── Healthy output ──────────────────────────────────

    #[test]
    fn scores_pass_detect() {
        for score in [&["4", "2"][..], &["1", "0", "0"], &["7"], &["5", "5"]] {
            assert!(first_abort(&mut detect(), score).is_none(), "{score:?}");
        }
    }

    #[test]
    fn rewritten_paragraph_passes_reduce() {
        let mut guard = reduce();
        let text = [
            "The", " committee", " met", " on", " Tuesday", " and", " went", " over",
            " the", " budget", " line", " by", " line", ".",
        ];
        assert!(first_abort(&mut guard, &text).is_none());
        assert_eq!(guard.fragments_seen(), 14);
    }

    #[test]
    fn paragraph_breaks_and_short_repeats_pass_reduce() {
        let mut guard = reduce();
        let mut fragments = vec!["\n"; 10];
        fragments.extend(["very", " very", " very", " slowly", "."]);
        fragments.extend(["哈"; 12]);
        assert!(first_abort(&mut guard, &fragments).is_none());
    }

    #[test]
    fn chinese_fragments_pass() {
        let mut guard = reduce();
        let text = ["今天", "的", "会议", "讨论", "了", "预算", "。"];
        assert!(first_abort(&mut guard, &text).is_none());
    }

    // ── Loops ───────────────────────────────────────────

    #[test]
    fn repeated_digit_trips_detect_quickly() {
        let abort = first_abort(&mut detect(), &["9"; 10]).unwrap();
        assert_eq!(
            abort.pattern,
            DegenerationPattern::Loop {
                period: 1,
                span: 6,
                cycle: "9".into()
            }
        );
        assert_eq!(abort.fragments_seen, 6);
    }

    #[test]
    fn single_fragment_loop_trips_reduce() {
        let abort = first_abort(&mut reduce(), &["\n"; 60]).unwrap();
        assert!(matches!(abort.pattern, DegenerationPattern::Loop { period: 1, span: 48, .. }));
    }

    #[test]
    fn phrase_loop_trips_reduce() {
        let phrase = ["I", " will", " rewrite", " this", "."];
        let looping: Vec<&str> = phrase.iter().copied().cycle().take(80).collect();
        let abort = first_abort(&mut reduce(), &looping).unwrap();
        match abort.pattern {
            DegenerationPattern::Loop { period, span, cycle } => {
                assert_eq!(period, 5);
                assert_eq!(span, 48);
                assert_eq!(cycle.chars().count(), "I will rewrite this.".chars().count());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn broken_cycle_resets() {
        let interrupted = ["a", "b", "a", "b", "a", "c", "a", "b", "a", "b", "a"];
        assert!(first_abort(&mut detect(), &interrupted).is_none());

        let abort = first_abort(&mut detect(), &["x", "y", "z", "x", "y", "z"]).unwrap();
        assert!(matches!(abort.pattern, DegenerationPattern::Loop { period: 3, span: 6, .. }));
    }

    // ── Fragment cap ────────────────────────────────────

    #[test]
    fn detect_cap_aborts_long_answer() {
        let mut guard = StreamGuard::new(StreamGuardConfig::for_mode(Mode::Detect, 4, 8192));
        for i in 0..4 {
            assert!(guard.feed(&format!("w{i}")).is_ok());
        }
        let abort = guard.feed("w4").unwrap_err();
        assert_eq!(abort.pattern, DegenerationPattern::FragmentCap { limit: 4 });
        assert_eq!(abort.fragments_seen, 5);
    }

    #[test]
    fn caps_follow_mode() {
        assert_eq!(StreamGuardConfig::for_mode(Mode::Reduce, 32, 500).max_fragments, 500);
        assert_eq!(StreamGuardConfig::for_mode(Mode::Detect, 0, 500).max_fragments, 1);
    }

    #[test]
    fn history_is_bounded_by_longest_period() {
        let mut guard = reduce();
        for i in 0..200 {
            assert!(guard.feed(&format!("t{i}")).is_ok());
        }
        assert_eq!(guard.recent.len(), 16);
    }

    // ── Display ─────────────────────────────────────────

    #[test]
    fn abort_display_names_pattern() {
        let abort = DegenerationAbort {
            pattern: DegenerationPattern::FragmentCap { limit: 32 },
            fragments_seen: 33,
        };
        let s = abort.to_string();
        assert!(s.contains("fragment_cap(32)"));
        assert!(s.contains("after 33 fragments"));
    }
}
