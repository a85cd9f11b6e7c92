//! Completion Detector
//!
//! The producer never says "done" reliably, so completion is inferred from
//! silence: every fragment pushes the quiescence deadline out by the debounce
//! window, and a timer firing only completes the generation if the stored
//! `last_update_at` is still at least one window old. Timer firings may be
//! late or stale; the re-check makes their ordering irrelevant.
//!
//! The lifetime fallback catches a producer that never finishes. Under
//! quiescence it only bounds silence, so a producer that keeps writing is
//! never cut off while the next request could be started behind it.
//!
//! The detector holds no timers itself. Callers own a single re-armable timer
//! and set it to [`CompletionDetector::next_deadline`] after every event.

use anyhow::{bail, Error};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    /// Started, no debounce window armed
    Streaming,
    /// A fragment arrived and the debounce window is running
    AwaitingQuiescence,
    /// Terminal
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Quiescent,
    Explicit,
    LifetimeExceeded,
    ProducerDisconnected,
}

impl CompletionReason {
    /// Whether the final text may be missing a tail.
    pub fn is_truncated(self) -> bool {
        matches!(self, CompletionReason::LifetimeExceeded | CompletionReason::ProducerDisconnected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionReason::Quiescent => "quiescent",
            CompletionReason::Explicit => "explicit",
            CompletionReason::LifetimeExceeded => "lifetime_exceeded",
            CompletionReason::ProducerDisconnected => "producer_disconnected",
        }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionStrategy {
    /// Debounce on fragment arrival; explicit signals are honoured too.
    #[default]
    Quiescence,
    /// Only an explicit `generation-complete` ends a generation; the lifetime
    /// cap counts from its start.
    Explicit,
}

impl FromStr for CompletionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quiescence" | "debounce" => Ok(CompletionStrategy::Quiescence),
            "explicit" => Ok(CompletionStrategy::Explicit),
            other => bail!("Unknown completion strategy '{}' (expected 'quiescence' or 'explicit')", other),
        }
    }
}

impl fmt::Display for CompletionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStrategy::Quiescence => f.write_str("quiescence"),
            CompletionStrategy::Explicit => f.write_str("explicit"),
        }
    }
}

/// Result of a timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The generation just completed.
    Completed(CompletionReason),
    /// Not yet; re-arm for this deadline.
    Pending(Instant),
    /// Nothing to wait for (already complete, or no deadline).
    Idle,
}

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    strategy: CompletionStrategy,
    debounce: Duration,
    max_lifetime: Duration,
    started_at: Instant,
    last_update_at: Option<Instant>,
    state: GenerationState,
    reason: Option<CompletionReason>,
}

impl CompletionDetector {
    pub fn new(strategy: CompletionStrategy, debounce: Duration, max_lifetime: Duration, started_at: Instant) -> Self {
        Self {
            strategy,
            debounce,
            max_lifetime,
            started_at,
            last_update_at: None,
            state: GenerationState::Streaming,
            reason: None,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn reason(&self) -> Option<CompletionReason> {
        self.reason
    }

    pub fn is_complete(&self) -> bool {
        self.state == GenerationState::Complete
    }

    /// Record a fragment arrival. Returns `false` if the generation is
    /// already complete and the fragment must be ignored.
    pub fn on_fragment(&mut self, now: Instant) -> bool {
        if self.is_complete() {
            return false;
        }
        self.last_update_at = Some(match self.last_update_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
        if self.strategy == CompletionStrategy::Quiescence {
            self.state = GenerationState::AwaitingQuiescence;
        }
        true
    }

    /// The producer said it is done. `None` if already complete.
    pub fn on_explicit_complete(&mut self) -> Option<CompletionReason> {
        self.complete(CompletionReason::Explicit)
    }

    /// Complete for an out-of-band reason (disconnect). `None` if already complete.
    pub fn force_complete(&mut self, reason: CompletionReason) -> Option<CompletionReason> {
        self.complete(reason)
    }

    /// Evaluate a timer firing at `now`.
    pub fn on_timer(&mut self, now: Instant) -> TimerOutcome {
        if self.is_complete() {
            return TimerOutcome::Idle;
        }

        if self.state == GenerationState::AwaitingQuiescence {
            if let Some(last) = self.last_update_at {
                if now.saturating_duration_since(last) >= self.debounce {
                    return self.complete(CompletionReason::Quiescent)
                        .map_or(TimerOutcome::Idle, TimerOutcome::Completed);
                }
            }
        }

        if self.lifetime_deadline().is_some_and(|deadline| now >= deadline) {
            return self.complete(CompletionReason::LifetimeExceeded)
                .map_or(TimerOutcome::Idle, TimerOutcome::Completed);
        }

        // Stale firing: a newer fragment moved the deadline.
        match self.next_deadline() {
            Some(deadline) => TimerOutcome::Pending(deadline),
            None => TimerOutcome::Idle,
        }
    }

    pub fn quiescence_deadline(&self) -> Option<Instant> {
        if self.state != GenerationState::AwaitingQuiescence {
            return None;
        }
        self.last_update_at.and_then(|last| last.checked_add(self.debounce))
    }

    /// Under quiescence the cap bounds silence, so every fragment restarts
    /// it. Under the explicit strategy it bounds the whole generation.
    /// `None` if the deadline is not representable.
    pub fn lifetime_deadline(&self) -> Option<Instant> {
        let anchor = match self.strategy {
            CompletionStrategy::Quiescence => self.last_update_at.unwrap_or(self.started_at),
            CompletionStrategy::Explicit => self.started_at,
        };
        anchor.checked_add(self.max_lifetime)
    }

    /// Earliest instant at which [`on_timer`](Self::on_timer) could change state.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_complete() {
            return None;
        }
        match (self.quiescence_deadline(), self.lifetime_deadline()) {
            (Some(quiet), Some(lifetime)) => Some(quiet.min(lifetime)),
            (quiet, lifetime) => quiet.or(lifetime),
        }
    }

    fn complete(&mut self, reason: CompletionReason) -> Option<CompletionReason> {
        if self.is_complete() {
            return None;
        }
        self.state = GenerationState::Complete;
        self.reason = Some(reason);
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Duration = Duration::from_millis(1000);
    const LIFETIME: Duration = Duration::from_secs(300);

    fn detector(strategy: CompletionStrategy) -> (CompletionDetector, Instant) {
        let t0 = Instant::now();
        (CompletionDetector::new(strategy, D, LIFETIME, t0), t0)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_completes_one_window_after_last_update() {
        let (mut det, t0) = detector(CompletionStrategy::Quiescence);

        // Updates every 400ms; each one pushes the deadline out.
        for i in 0..5 {
            assert!(det.on_fragment(t0 + ms(400 * i)));
        }
        let last = t0 + ms(1600);
        assert_eq!(det.next_deadline(), Some(last + D));

        // Any firing before last + D is premature.
        for probe in [0, 999] {
            assert_eq!(det.on_timer(last + ms(probe)), TimerOutcome::Pending(last + D));
        }
        assert_eq!(det.state(), GenerationState::AwaitingQuiescence);

        assert_eq!(det.on_timer(last + D), TimerOutcome::Completed(CompletionReason::Quiescent));
        assert!(det.is_complete());
    }

    #[test]
    fn test_stale_timer_after_fresh_update_rearms() {
        let (mut det, t0) = detector(CompletionStrategy::Quiescence);
        det.on_fragment(t0);

        // Fragment lands 1ms before the armed deadline; the old timer then fires.
        let fresh = t0 + D - ms(1);
        det.on_fragment(fresh);
        assert_eq!(det.on_timer(t0 + D), TimerOutcome::Pending(fresh + D));
        assert_eq!(det.state(), GenerationState::AwaitingQuiescence);
    }

    #[test]
    fn test_late_timer_still_completes_once() {
        let (mut det, t0) = detector(CompletionStrategy::Quiescence);
        det.on_fragment(t0);

        assert_eq!(det.on_timer(t0 + ms(5000)), TimerOutcome::Completed(CompletionReason::Quiescent));
        assert_eq!(det.on_timer(t0 + ms(6000)), TimerOutcome::Idle);
        assert_eq!(det.on_explicit_complete(), None);
        assert!(!det.on_fragment(t0 + ms(7000)));
        assert_eq!(det.reason(), Some(CompletionReason::Quiescent));
    }

    #[test]
    fn test_no_fragment_waits_for_lifetime() {
        let (mut det, t0) = detector(CompletionStrategy::Quiescence);
        assert_eq!(det.state(), GenerationState::Streaming);
        assert_eq!(det.next_deadline(), Some(t0 + LIFETIME));
        assert_eq!(det.on_timer(t0 + D), TimerOutcome::Pending(t0 + LIFETIME));

        let outcome = det.on_timer(t0 + LIFETIME);
        assert_eq!(outcome, TimerOutcome::Completed(CompletionReason::LifetimeExceeded));
        assert!(CompletionReason::LifetimeExceeded.is_truncated());
    }

    #[test]
    fn test_quiescence_wins_over_lifetime_when_both_due() {
        let t0 = Instant::now();
        let mut det = CompletionDetector::new(CompletionStrategy::Quiescence, D, ms(1500), t0);
        det.on_fragment(t0 + ms(200));
        assert_eq!(det.on_timer(t0 + ms(2000)), TimerOutcome::Completed(CompletionReason::Quiescent));
    }

    #[test]
    fn test_explicit_strategy_ignores_silence() {
        let (mut det, t0) = detector(CompletionStrategy::Explicit);
        det.on_fragment(t0);
        assert_eq!(det.state(), GenerationState::Streaming);
        assert_eq!(det.quiescence_deadline(), None);
        assert_eq!(det.on_timer(t0 + ms(10_000)), TimerOutcome::Pending(t0 + LIFETIME));

        assert_eq!(det.on_explicit_complete(), Some(CompletionReason::Explicit));
        assert_eq!(det.on_explicit_complete(), None);
        assert_eq!(det.next_deadline(), None);
    }

    #[test]
    fn test_force_complete_is_terminal() {
        let (mut det, t0) = detector(CompletionStrategy::Quiescence);
        det.on_fragment(t0);
        assert_eq!(det.force_complete(CompletionReason::ProducerDisconnected), Some(CompletionReason::ProducerDisconnected));
        assert_eq!(det.on_timer(t0 + D), TimerOutcome::Idle);
        assert!(det.reason().unwrap().is_truncated());
    }

    #[test]
    fn test_steady_writer_outlives_lifetime_under_quiescence() {
        let t0 = Instant::now();
        let lifetime = ms(3000);
        let mut det = CompletionDetector::new(CompletionStrategy::Quiescence, D, lifetime, t0);

        // A fragment every 500ms for 10s, well past the lifetime cap.
        for i in 0..=20 {
            let now = t0 + ms(500 * i);
            assert!(det.on_fragment(now));
            assert_eq!(det.on_timer(now + ms(1)), TimerOutcome::Pending(now + D));
        }
        assert_eq!(det.state(), GenerationState::AwaitingQuiescence);

        let last = t0 + ms(10_000);
        assert_eq!(det.on_timer(last + D), TimerOutcome::Completed(CompletionReason::Quiescent));
    }

    #[test]
    fn test_explicit_lifetime_counts_from_start() {
        let (mut det, t0) = detector(CompletionStrategy::Explicit);
        det.on_fragment(t0 + LIFETIME - ms(10));
        assert_eq!(det.next_deadline(), Some(t0 + LIFETIME));
        assert_eq!(det.on_timer(t0 + LIFETIME), TimerOutcome::Completed(CompletionReason::LifetimeExceeded));
    }

    #[test]
    fn test_unrepresentable_deadlines_stay_unarmed() {
        let t0 = Instant::now();
        let mut det = CompletionDetector::new(CompletionStrategy::Quiescence, Duration::MAX, Duration::MAX, t0);
        assert_eq!(det.next_deadline(), None);
        assert!(det.on_fragment(t0));
        assert_eq!(det.quiescence_deadline(), None);
        assert_eq!(det.on_timer(t0 + ms(5000)), TimerOutcome::Idle);
        assert_eq!(det.on_explicit_complete(), Some(CompletionReason::Explicit));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Quiescence".parse::<CompletionStrategy>().unwrap(), CompletionStrategy::Quiescence);
        assert_eq!("explicit".parse::<CompletionStrategy>().unwrap(), CompletionStrategy::Explicit);
        assert!("sometimes".parse::<CompletionStrategy>().is_err());
    }
}
