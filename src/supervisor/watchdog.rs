//! Liveness watchdog.
//!
//! Every stage pulses a named channel while it makes progress. A periodic
//! tick inspects pulse recency; a stale main pulse triggers an escalating
//! three-step recovery: reclaim memory, restart components, stop the
//! process for the service host to relaunch. Recovery attempts reset after
//! five minutes of clean operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Pulse considered stale after this long.
pub const PULSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Clean operation for this long resets the recovery ladder.
const ATTEMPT_RESET: Duration = Duration::from_secs(300);

/// The pulse that gates recovery; stages other than the scheduler core are
/// only reported.
pub const MAIN_PULSE: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Step 1: drop caches and pooled buffers.
    ReclaimMemory,
    /// Step 2: ask components to restart via the bus.
    RestartComponents,
    /// Step 3: stop the application; the service host restarts it.
    StopApplication,
}

struct State {
    pulses: HashMap<String, Instant>,
    attempts: u32,
    healthy_since: Option<Instant>,
}

struct Inner {
    state: Mutex<State>,
    stale_after: Duration,
}

/// Cheap to clone; clones observe the same pulse table.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

/// Cheap handle a stage holds to report liveness.
#[derive(Clone)]
pub struct PulseHandle {
    name: String,
    watchdog: Watchdog,
}

impl PulseHandle {
    pub fn pulse(&self) {
        self.watchdog.record(&self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Watchdog {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pulses: HashMap::new(),
                    attempts: 0,
                    healthy_since: None,
                }),
                stale_after,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PULSE_TIMEOUT)
    }

    /// Registers a named pulse, seeding it as fresh.
    pub fn register(&self, name: &str) -> PulseHandle {
        self.record(name);
        PulseHandle {
            name: name.to_string(),
            watchdog: self.clone(),
        }
    }

    fn record(&self, name: &str) {
        self.inner
            .state
            .lock()
            .pulses
            .insert(name.to_string(), Instant::now());
    }

    #[cfg(test)]
    fn record_at(&self, name: &str, at: Instant) {
        self.inner.state.lock().pulses.insert(name.to_string(), at);
    }

    /// Names of all pulses older than the staleness bound at `now`.
    pub fn stale(&self, now: Instant) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .pulses
            .iter()
            .filter(|(_, &at)| now.duration_since(at) > self.inner.stale_after)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// One watchdog tick. Returns the recovery step to run when the main
    /// pulse is stale; `None` while healthy. The step ladder advances on
    /// each stale tick and resets after five clean minutes.
    pub fn evaluate(&self, now: Instant) -> Option<RecoveryAction> {
        let stale = self.stale(now);
        for name in stale.iter().filter(|n| n.as_str() != MAIN_PULSE) {
            warn!(pulse = %name, "stage pulse stale");
        }

        let mut state = self.inner.state.lock();
        if stale.iter().any(|n| n == MAIN_PULSE) {
            state.healthy_since = None;
            state.attempts += 1;
            let action = match state.attempts {
                1 => RecoveryAction::ReclaimMemory,
                2 => RecoveryAction::RestartComponents,
                _ => RecoveryAction::StopApplication,
            };
            warn!(attempt = state.attempts, ?action, "main pulse stale, recovering");
            Some(action)
        } else {
            match state.healthy_since {
                None => state.healthy_since = Some(now),
                Some(since) if now.duration_since(since) >= ATTEMPT_RESET => {
                    state.attempts = 0;
                }
                Some(_) => {}
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pulses_are_healthy() {
        let wd = Watchdog::with_defaults();
        let _main = wd.register(MAIN_PULSE);
        assert_eq!(wd.evaluate(Instant::now()), None);
    }

    #[test]
    fn stale_main_escalates_through_three_steps() {
        let wd = Watchdog::with_defaults();
        let _main = wd.register(MAIN_PULSE);
        let later = Instant::now() + PULSE_TIMEOUT + Duration::from_secs(1);
        assert_eq!(wd.evaluate(later), Some(RecoveryAction::ReclaimMemory));
        assert_eq!(wd.evaluate(later), Some(RecoveryAction::RestartComponents));
        assert_eq!(wd.evaluate(later), Some(RecoveryAction::StopApplication));
        // Stays at the terminal step.
        assert_eq!(wd.evaluate(later), Some(RecoveryAction::StopApplication));
    }

    #[test]
    fn pulse_keeps_stage_fresh() {
        let wd = Watchdog::with_defaults();
        let main = wd.register(MAIN_PULSE);
        main.pulse();
        assert!(wd.stale(Instant::now()).is_empty());
    }

    #[test]
    fn clean_period_resets_attempts() {
        let wd = Watchdog::with_defaults();
        let _main = wd.register(MAIN_PULSE);
        let t0 = Instant::now();
        let t1 = t0 + PULSE_TIMEOUT + Duration::from_secs(1);
        assert_eq!(wd.evaluate(t1), Some(RecoveryAction::ReclaimMemory));

        // Pulse resumes and stays fresh for five minutes.
        wd.record_at(MAIN_PULSE, t1);
        assert_eq!(wd.evaluate(t1 + Duration::from_secs(1)), None);
        wd.record_at(MAIN_PULSE, t1 + Duration::from_secs(300));
        assert_eq!(wd.evaluate(t1 + Duration::from_secs(302)), None);

        // Going stale again restarts the ladder from step one.
        let t2 = t1 + Duration::from_secs(302) + PULSE_TIMEOUT + Duration::from_secs(1);
        assert_eq!(wd.evaluate(t2), Some(RecoveryAction::ReclaimMemory));
    }

    #[test]
    fn non_main_stale_pulse_does_not_recover() {
        let wd = Watchdog::with_defaults();
        let _main = wd.register(MAIN_PULSE);
        let _cam = wd.register("capture:cam1");
        let now = Instant::now();
        let check = now + PULSE_TIMEOUT + Duration::from_secs(1);
        // Keep main fresh, leave the camera pulse to age out.
        wd.record_at(MAIN_PULSE, check);
        assert_eq!(wd.stale(check), vec!["capture:cam1".to_string()]);
        assert_eq!(wd.evaluate(check), None);
    }
}
