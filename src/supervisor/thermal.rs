//! Thermal governor.
//!
//! Polls the CPU temperature and converts it into a scheduler throttle
//! delay, and past the emergency threshold into a shutdown request.
//! Throttle lifts only after the temperature stays below threshold for the
//! configured hysteresis period.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ThermalConfig;
use crate::supervisor::{AgentEvent, EventBus};

/// Per-degree-step delay added on consecutive hot polls.
const DELAY_STEP_MS: u64 = 250;
const DELAY_CAP_MS: u64 = 5000;

/// Reads the current CPU temperature. Behind a trait so tests can ramp
/// temperatures deterministically.
pub trait TemperatureProbe: Send {
    fn read_celsius(&mut self) -> Option<f32>;
}

/// Probe over the platform sensor list; picks the hottest CPU-adjacent
/// component.
pub struct SysinfoProbe {
    components: sysinfo::Components,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            components: sysinfo::Components::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureProbe for SysinfoProbe {
    fn read_celsius(&mut self) -> Option<f32> {
        self.components.refresh();
        self.components
            .iter()
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .fold(None, |acc: Option<f32>, t| {
                Some(acc.map_or(t, |a| a.max(t)))
            })
    }
}

/// Shared throttle state the batch scheduler consults every tick.
pub struct ThrottleState {
    delay_ms: AtomicU64,
    inference_stopped: AtomicBool,
}

impl ThrottleState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delay_ms: AtomicU64::new(0),
            inference_stopped: AtomicBool::new(false),
        })
    }

    /// Extra sleep applied to each scheduler tick.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    /// True once an emergency shutdown has been requested; no new
    /// inference calls may start.
    pub fn inference_stopped(&self) -> bool {
        self.inference_stopped.load(Ordering::Relaxed)
    }
}

pub struct ThermalGovernor {
    cfg: ThermalConfig,
    state: Arc<ThrottleState>,
    bus: EventBus,
    throttled: bool,
    below_since: Option<Instant>,
    consecutive_hot: u32,
    emergency_sent: bool,
}

impl ThermalGovernor {
    pub fn new(cfg: ThermalConfig, state: Arc<ThrottleState>, bus: EventBus) -> Self {
        Self {
            cfg,
            state,
            bus,
            throttled: false,
            below_since: None,
            consecutive_hot: 0,
            emergency_sent: false,
        }
    }

    /// Feeds one temperature reading into the governor.
    pub fn observe(&mut self, temperature_c: f32, now: Instant) {
        if temperature_c >= self.cfg.emergency_temp_c && !self.emergency_sent {
            error!(temperature_c, "emergency temperature reached, requesting shutdown");
            self.emergency_sent = true;
            self.state.inference_stopped.store(true, Ordering::Relaxed);
            self.bus
                .publish(AgentEvent::EmergencyShutdown { temperature_c });
        }

        if temperature_c >= self.cfg.throttle_temp_c {
            self.below_since = None;
            self.consecutive_hot += 1;
            let delay_ms = (u64::from(self.consecutive_hot) * DELAY_STEP_MS).min(DELAY_CAP_MS);
            self.state.delay_ms.store(delay_ms, Ordering::Relaxed);
            if !self.throttled {
                warn!(temperature_c, delay_ms, "thermal throttle engaged");
            }
            self.throttled = true;
            self.bus.publish(AgentEvent::ThermalThrottle {
                temperature_c,
                delay_ms,
                reason: "cpu temperature at or above throttle threshold".to_string(),
            });
            return;
        }

        if self.throttled {
            match self.below_since {
                None => self.below_since = Some(now),
                Some(since)
                    if now.duration_since(since)
                        >= Duration::from_secs(self.cfg.hysteresis_secs) =>
                {
                    info!(temperature_c, "thermal throttle lifted");
                    self.throttled = false;
                    self.consecutive_hot = 0;
                    self.below_since = None;
                    self.state.delay_ms.store(0, Ordering::Relaxed);
                    self.bus.publish(AgentEvent::ThermalThrottle {
                        temperature_c,
                        delay_ms: 0,
                        reason: "temperature below threshold for hysteresis period".to_string(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    /// Polling loop; runs until cancelled.
    pub async fn run<P: TemperatureProbe>(mut self, mut probe: P, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.cfg.poll_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match probe.read_celsius() {
                        Some(temp) => self.observe(temp, Instant::now()),
                        None => debug!("temperature unavailable"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn governor() -> (ThermalGovernor, Arc<ThrottleState>, EventBus) {
        let state = ThrottleState::new();
        let bus = EventBus::default();
        let gov = ThermalGovernor::new(ThermalConfig::default(), Arc::clone(&state), bus.clone());
        (gov, state, bus)
    }

    #[test]
    fn throttles_at_threshold_with_nonzero_delay() {
        let (mut gov, state, bus) = governor();
        let mut rx = bus.subscribe();
        gov.observe(70.0, Instant::now());
        assert!(state.delay() > Duration::ZERO);
        match rx.try_recv().unwrap() {
            AgentEvent::ThermalThrottle { delay_ms, .. } => assert!(delay_ms > 0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn below_threshold_never_throttles() {
        let (mut gov, state, bus) = governor();
        let mut rx = bus.subscribe();
        gov.observe(69.0, Instant::now());
        assert_eq!(state.delay(), Duration::ZERO);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn emergency_published_once() {
        let (mut gov, state, bus) = governor();
        let mut rx = bus.subscribe();
        let now = Instant::now();
        gov.observe(76.0, now);
        gov.observe(77.0, now + Duration::from_secs(5));
        assert!(state.inference_stopped());

        let mut emergencies = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AgentEvent::EmergencyShutdown { .. }) {
                emergencies += 1;
            }
        }
        assert_eq!(emergencies, 1);
    }

    #[test]
    fn throttle_lifts_only_after_sustained_cooldown() {
        let (mut gov, state, _bus) = governor();
        let t0 = Instant::now();
        gov.observe(72.0, t0);
        assert!(state.delay() > Duration::ZERO);

        // Drops below but not long enough.
        gov.observe(68.0, t0 + Duration::from_secs(10));
        gov.observe(68.0, t0 + Duration::from_secs(40));
        assert!(state.delay() > Duration::ZERO);

        // Sustained 60 s below threshold.
        gov.observe(68.0, t0 + Duration::from_secs(71));
        assert_eq!(state.delay(), Duration::ZERO);
    }

    #[test]
    fn reheat_during_cooldown_restarts_hysteresis() {
        let (mut gov, state, _bus) = governor();
        let t0 = Instant::now();
        gov.observe(72.0, t0);
        gov.observe(68.0, t0 + Duration::from_secs(30));
        // Back above threshold: cooldown clock restarts.
        gov.observe(71.0, t0 + Duration::from_secs(50));
        gov.observe(68.0, t0 + Duration::from_secs(80));
        gov.observe(68.0, t0 + Duration::from_secs(120));
        assert!(state.delay() > Duration::ZERO, "cooldown must restart");
        gov.observe(68.0, t0 + Duration::from_secs(141));
        assert_eq!(state.delay(), Duration::ZERO);
    }

    #[test]
    fn delay_escalates_on_consecutive_hot_polls() {
        let (mut gov, state, _bus) = governor();
        let t0 = Instant::now();
        gov.observe(71.0, t0);
        let first = state.delay();
        gov.observe(71.0, t0 + Duration::from_secs(5));
        assert!(state.delay() > first);
    }
}
