//! Stability supervisor: event bus, watchdog, thermal governor, daily
//! restart, checkpointing, and the shutdown controller that ties their
//! stop requests to the task tree.

mod bus;
mod checkpoint;
mod thermal;
mod watchdog;

pub use bus::{AgentEvent, EventBus, PressureLevel};
pub use checkpoint::{CheckpointStore, CHECKPOINT_INTERVAL, CHECKPOINT_MAX_AGE};
pub use thermal::{SysinfoProbe, TemperatureProbe, ThermalGovernor, ThrottleState};
pub use watchdog::{PulseHandle, RecoveryAction, Watchdog, MAIN_PULSE, PULSE_TIMEOUT};

use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::Checkpoint;

/// Why the process is stopping; drives the exit code the service host sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator-initiated stop (ctrl-c / service stop).
    Graceful,
    /// Scheduled daily restart.
    DailyRestart,
    /// Watchdog recovery step three.
    Watchdog,
    /// Thermal emergency shutdown request.
    Emergency,
    /// Unrecoverable error.
    Fatal,
}

impl StopReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::Graceful => 0,
            StopReason::Fatal => 1,
            // Non-zero so the service host restarts the process.
            StopReason::DailyRestart | StopReason::Watchdog | StopReason::Emergency => 10,
        }
    }
}

/// First stop request wins; everything else observes the cancelled token.
pub struct ShutdownController {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl ShutdownController {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn request_stop(&self, reason: StopReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            info!(?reason, "stop requested");
            *slot = Some(reason);
            self.token.cancel();
        }
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }
}

/// Next occurrence of `hour:minute` strictly after `now`.
pub fn next_restart_after<Tz: TimeZone>(now: DateTime<Tz>, hour: u32, minute: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    loop {
        if let Some(naive) = date.and_hms_opt(hour, minute, 0) {
            if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
                if candidate > now {
                    return candidate;
                }
            }
        }
        date = date.succ_opt().expect("date overflow");
    }
}

/// Sleeps until the configured local restart time, then requests a stop.
pub fn spawn_daily_restart(
    hour: u32,
    minute: u32,
    shutdown: std::sync::Arc<ShutdownController>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let now = Local::now();
        let at = next_restart_after(now, hour, minute);
        let wait = (at.clone() - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        info!(
            at = %at.format("%Y-%m-%d %H:%M:%S"),
            wait_secs = wait.as_secs(),
            "daily restart scheduled"
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {
                info!(hour, minute, "daily restart time reached");
                shutdown.request_stop(StopReason::DailyRestart);
            }
        }
    })
}

/// Watchdog tick loop: evaluates pulse recency and runs the escalating
/// recovery ladder.
pub fn spawn_watchdog_loop(
    watchdog: Watchdog,
    bus: EventBus,
    shutdown: std::sync::Arc<ShutdownController>,
    reclaim: Box<dyn Fn() + Send>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match watchdog.evaluate(Instant::now()) {
                        None => {}
                        Some(RecoveryAction::ReclaimMemory) => {
                            warn!("watchdog recovery: reclaiming memory");
                            reclaim();
                        }
                        Some(RecoveryAction::RestartComponents) => {
                            warn!("watchdog recovery: requesting component restart");
                            bus.publish(AgentEvent::ComponentRestart {
                                reason: "watchdog main pulse stale".to_string(),
                                graceful: false,
                            });
                        }
                        Some(RecoveryAction::StopApplication) => {
                            warn!("watchdog recovery: stopping application");
                            shutdown.request_stop(StopReason::Watchdog);
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Periodic checkpoint writer. `snapshot` assembles the current state.
pub fn spawn_checkpoint_loop(
    store: CheckpointStore,
    snapshot: Box<dyn Fn() -> Checkpoint + Send>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
        interval.tick().await; // immediate first tick carries no new state
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = store.save(&snapshot()) {
                        warn!(error = %e, "checkpoint write failed");
                    }
                }
            }
        }
        // Final checkpoint on the way out.
        if let Err(e) = store.save(&snapshot()) {
            warn!(error = %e, "final checkpoint write failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn next_restart_is_later_today_when_before_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 1, 30, 0).unwrap();
        let at = next_restart_after(now, 3, 0);
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap());
    }

    #[test]
    fn next_restart_rolls_to_tomorrow_when_past_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        let at = next_restart_after(now, 3, 0);
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 11, 3, 0, 0).unwrap());
    }

    #[test]
    fn first_stop_reason_wins() {
        let shutdown = ShutdownController::new();
        shutdown.request_stop(StopReason::DailyRestart);
        shutdown.request_stop(StopReason::Fatal);
        assert_eq!(shutdown.reason(), Some(StopReason::DailyRestart));
        assert!(shutdown.token().is_cancelled());
    }

    #[test]
    fn exit_codes_distinguish_restart_from_fatal() {
        assert_eq!(StopReason::Graceful.exit_code(), 0);
        assert_eq!(StopReason::Fatal.exit_code(), 1);
        assert_eq!(StopReason::DailyRestart.exit_code(), 10);
    }
}
