//! In-process typed event bus.
//!
//! Publish/subscribe over a broadcast channel. Publishing never blocks;
//! slow subscribers lag and miss events rather than stalling producers.
//! Handler errors are logged and contained.

use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Elevated,
    Critical,
}

/// Operational events exchanged between the supervisor and the stages.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ThermalThrottle {
        temperature_c: f32,
        delay_ms: u64,
        reason: String,
    },
    EmergencyShutdown {
        temperature_c: f32,
    },
    ComponentRestart {
        reason: String,
        graceful: bool,
    },
    ServiceStarted {
        restart_count: u32,
        previous_uptime_secs: u64,
    },
    MemoryPressure {
        level: PressureLevel,
        memory_mb: u64,
    },
    CameraFailed {
        camera_id: String,
        reason: String,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::ThermalThrottle { .. } => "thermal_throttle",
            AgentEvent::EmergencyShutdown { .. } => "emergency_shutdown",
            AgentEvent::ComponentRestart { .. } => "component_restart",
            AgentEvent::ServiceStarted { .. } => "service_started",
            AgentEvent::MemoryPressure { .. } => "memory_pressure",
            AgentEvent::CameraFailed { .. } => "camera_failed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers. An event with no
    /// subscribers is dropped silently.
    pub fn publish(&self, event: AgentEvent) {
        debug!(kind = event.kind(), "bus event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Runs `handler` for every event on its own task. Errors are logged,
    /// never propagated; a lagged subscription skips ahead.
    pub fn spawn_handler<F>(&self, name: &'static str, mut handler: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(AgentEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = handler(event) {
                            warn!(handler = name, error = %e, "event handler failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(handler = name, missed = n, "event handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(AgentEvent::MemoryPressure {
            level: PressureLevel::Elevated,
            memory_mb: 5200,
        });
        match rx.recv().await.unwrap() {
            AgentEvent::MemoryPressure { level, memory_mb } => {
                assert_eq!(level, PressureLevel::Elevated);
                assert_eq!(memory_mb, 5200);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_delivery() {
        let bus = EventBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _h = bus.spawn_handler("flaky", move |event| {
            if matches!(event, AgentEvent::EmergencyShutdown { .. }) {
                anyhow::bail!("boom");
            }
            tx.send(event.kind()).ok();
            Ok(())
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        bus.publish(AgentEvent::EmergencyShutdown { temperature_c: 80.0 });
        bus.publish(AgentEvent::ComponentRestart {
            reason: "test".into(),
            graceful: true,
        });

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some("component_restart"));
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.publish(AgentEvent::ServiceStarted {
            restart_count: 0,
            previous_uptime_secs: 0,
        });
    }
}
