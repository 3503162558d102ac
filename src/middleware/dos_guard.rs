use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};

/// Tracked sources before an opportunistic sweep of idle windows.
const MAX_TRACKED_SOURCES: usize = 10_000;

/// Limits for the full-scan fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct DosGuardConfig {
    /// Failed full scans (all sources) before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds after the last failure before an open circuit may close.
    pub cooldown_secs: u64,
    /// A source is denied once more than this many failed scans lie inside
    /// the window.
    pub max_full_scan_attempts: usize,
    pub window_secs: u64,
}

impl Default for DosGuardConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown_secs: 60,
            max_full_scan_attempts: 5,
            window_secs: 60,
        }
    }
}

impl DosGuardConfig {
    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Default)]
struct GuardState {
    windows: HashMap<String, VecDeque<Instant>>,
    failure_count: u32,
    open: bool,
    last_failure: Option<Instant>,
}

/// Snapshot of the guard (for health endpoints and tests).
#[derive(Debug, Clone, Serialize)]
pub struct DosGuardStatus {
    pub circuit_open: bool,
    pub failure_count: u32,
    pub tracked_sources: usize,
    pub cooldown_remaining_secs: Option<u64>,
}

/// Circuit breaker plus per-source sliding window in front of the expensive
/// full-scan path. All state sits behind one mutex so concurrent failures are
/// never lost. Recovery is evaluated lazily when `allow` is called.
pub struct DosGuard {
    config: DosGuardConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GuardState>,
}

impl DosGuard {
    pub fn new(config: DosGuardConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DosGuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(GuardState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        // A panic while holding the lock cannot leave the counters in a state
        // that is unsafe to read, so recover from poisoning.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// May `source` run a full scan right now?
    pub fn allow(&self, source: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();

        if state.open {
            let cooled = state
                .last_failure
                .map(|last| now.saturating_duration_since(last) >= self.config.cooldown())
                .unwrap_or(true);
            if !cooled {
                return false;
            }
            state.open = false;
            state.failure_count = 0;
            tracing::info!("full-scan circuit breaker CLOSED after cooldown");
        }

        let window = self.config.window();
        let saturated = match state.windows.get_mut(source) {
            Some(attempts) => {
                prune(attempts, now, window);
                let len = attempts.len();
                if len == 0 {
                    state.windows.remove(source);
                }
                len > self.config.max_full_scan_attempts
            }
            None => false,
        };

        if saturated {
            tracing::warn!(source = source, "full scan rate limited for source");
        }
        !saturated
    }

    /// Record a full scan that found nothing.
    pub fn record_failure(&self, source: &str) {
        let now = self.clock.now();
        let mut state = self.lock();

        state
            .windows
            .entry(source.to_string())
            .or_default()
            .push_back(now);
        state.failure_count += 1;
        state.last_failure = Some(now);

        if !state.open && state.failure_count >= self.config.failure_threshold {
            state.open = true;
            tracing::warn!(
                failures = state.failure_count,
                cooldown_secs = self.config.cooldown_secs,
                "full-scan circuit breaker OPENED"
            );
        }

        if state.windows.len() > MAX_TRACKED_SOURCES {
            let window = self.config.window();
            evict(&mut state, now, window);
        }
    }

    /// Record a full scan that matched. Resets the consecutive failure count
    /// while the circuit is closed; an open circuit still waits out its cooldown.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if !state.open {
            state.failure_count = 0;
        }
    }

    /// Drop expired timestamps for every source. Returns sources removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.window();
        let mut state = self.lock();
        evict(&mut state, now, window)
    }

    pub fn status(&self) -> DosGuardStatus {
        let now = self.clock.now();
        let state = self.lock();
        let cooldown_remaining_secs = if state.open {
            state.last_failure.map(|last| {
                self.config
                    .cooldown()
                    .saturating_sub(now.saturating_duration_since(last))
                    .as_secs()
            })
        } else {
            None
        };
        DosGuardStatus {
            circuit_open: state.open,
            failure_count: state.failure_count,
            tracked_sources: state.windows.len(),
            cooldown_remaining_secs,
        }
    }
}

fn prune(attempts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = attempts.front() {
        if now.saturating_duration_since(*front) >= window {
            attempts.pop_front();
        } else {
            break;
        }
    }
}

fn evict(state: &mut GuardState, now: Instant, window: Duration) -> usize {
    let before = state.windows.len();
    state.windows.retain(|_, attempts| {
        prune(attempts, now, window);
        !attempts.is_empty()
    });
    before - state.windows.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (DosGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let guard = DosGuard::with_clock(DosGuardConfig::default(), clock.clone());
        (guard, clock)
    }

    #[test]
    fn test_fresh_guard_allows() {
        let (guard, _) = guard();
        assert!(guard.allow("1.2.3.4"));
        assert!(!guard.status().circuit_open);
    }

    #[test]
    fn test_source_window_saturates() {
        let (guard, _) = guard();
        // Five failures in the window still leave room for a sixth scan.
        for _ in 0..6 {
            assert!(guard.allow("attacker"));
            guard.record_failure("attacker");
        }
        assert!(!guard.allow("attacker"));
        // Other sources are unaffected while the circuit is closed.
        assert!(guard.allow("bystander"));
    }

    #[test]
    fn test_source_window_slides() {
        let (guard, clock) = guard();
        for _ in 0..6 {
            guard.record_failure("attacker");
        }
        assert!(!guard.allow("attacker"));
        clock.advance(Duration::from_secs(60));
        assert!(guard.allow("attacker"));
        assert_eq!(guard.status().tracked_sources, 0);
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let (guard, _) = guard();
        for _ in 0..9 {
            guard.record_failure("attacker");
        }
        assert!(!guard.status().circuit_open);
        guard.record_failure("attacker");
        let status = guard.status();
        assert!(status.circuit_open);
        assert_eq!(status.failure_count, 10);
        assert!(!guard.allow("someone-else"));
    }

    #[test]
    fn test_circuit_closes_lazily_after_cooldown() {
        let (guard, clock) = guard();
        for i in 0..10 {
            guard.record_failure(&format!("source-{}", i));
        }
        clock.advance(Duration::from_secs(59));
        assert!(!guard.allow("fresh"));
        assert!(guard.status().circuit_open);

        clock.advance(Duration::from_secs(1));
        // Still reported open until something checks it.
        assert!(guard.status().circuit_open);
        assert!(guard.allow("fresh"));
        let status = guard.status();
        assert!(!status.circuit_open);
        assert_eq!(status.failure_count, 0);
    }

    #[test]
    fn test_failure_during_open_extends_cooldown() {
        let (guard, clock) = guard();
        for _ in 0..10 {
            guard.record_failure("a");
        }
        clock.advance(Duration::from_secs(30));
        guard.record_failure("b");
        clock.advance(Duration::from_secs(30));
        assert!(!guard.allow("c"));
        assert_eq!(guard.status().cooldown_remaining_secs, Some(30));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (guard, _) = guard();
        for i in 0..9 {
            guard.record_failure(&format!("s{}", i));
        }
        guard.record_success();
        guard.record_failure("s9");
        assert!(!guard.status().circuit_open);
    }

    #[test]
    fn test_evict_expired() {
        let (guard, clock) = guard();
        guard.record_failure("a");
        guard.record_failure("b");
        clock.advance(Duration::from_secs(61));
        guard.record_failure("c");
        assert_eq!(guard.evict_expired(), 2);
        assert_eq!(guard.status().tracked_sources, 1);
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let clock = Arc::new(ManualClock::new());
        let config = DosGuardConfig {
            failure_threshold: 1_000_000,
            ..Default::default()
        };
        let guard = Arc::new(DosGuard::with_clock(config, clock));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let guard = guard.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        guard.record_failure(&format!("t{}", t));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(guard.status().failure_count, 2_000);
    }
}
