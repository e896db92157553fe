//! Durable sync worker.
//!
//! Drains the sync queue in (priority, age) order as kind-pure batches and
//! posts them to the cloud sink. Delivery is at-least-once: a job is only
//! marked completed on a 2xx acknowledgement, retried on transport errors
//! and 5xx with exponential backoff, and parked as failed on other 4xx.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::metrics::WindowAggregator;
use crate::store::Store;
use crate::supervisor::{AgentEvent, EventBus, PressureLevel, PulseHandle};
use crate::types::SyncEntity;

/// Base retry delay; doubles per attempt.
pub const BACKOFF_BASE: Duration = Duration::from_secs(30);
/// Retry delay ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink transport error: {0}")]
    Transport(String),

    #[error("sink returned status {0}")]
    Status(u16),
}

impl SinkError {
    /// 5xx, timeouts and rate limiting retry; other 4xx do not.
    pub fn retryable(&self) -> bool {
        match self {
            SinkError::Transport(_) => true,
            SinkError::Status(status) => *status >= 500 || *status == 429,
        }
    }
}

/// Batched-write endpoint per entity kind. Boxed futures keep the trait
/// object-safe so tests can inject scripted sinks.
pub trait SinkTransport: Send + Sync + 'static {
    fn deliver<'a>(
        &'a self,
        kind: SyncEntity,
        payloads: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

fn endpoint(kind: SyncEntity) -> &'static str {
    match kind {
        SyncEntity::Detection => "detections",
        SyncEntity::KeyFrame => "keyframes",
        SyncEntity::MetricWindow => "metrics",
    }
}

/// HTTP sink over the configured base URL.
pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSink {
    pub fn new(cfg: &SyncConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.sink_url.trim_end_matches('/').to_string(),
            api_key: cfg.sink_key.clone(),
        })
    }
}

impl SinkTransport for HttpSink {
    fn deliver<'a>(
        &'a self,
        kind: SyncEntity,
        payloads: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/{}", self.base_url, endpoint(kind));
            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .json(&payloads)
                .send()
                .await
                .map_err(|e| SinkError::Transport(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(SinkError::Status(status.as_u16()))
            }
        })
    }
}

/// Retry schedule as a pure function of (attempt, now): deterministic to
/// test, `30 s × 2^(attempt-1)`, capped.
pub fn next_attempt_at(attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let exp = attempt.saturating_sub(1).min(20);
    let delay = BACKOFF_BASE
        .checked_mul(1 << exp)
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(3600))
}

pub struct SyncWorker<S: SinkTransport> {
    store: Arc<Store>,
    sink: Arc<S>,
    cfg: SyncConfig,
    aggregator: Arc<WindowAggregator>,
    bus: EventBus,
}

impl<S: SinkTransport> SyncWorker<S> {
    pub fn new(
        store: Arc<Store>,
        sink: Arc<S>,
        cfg: SyncConfig,
        aggregator: Arc<WindowAggregator>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            sink,
            cfg,
            aggregator,
            bus,
        }
    }

    /// Worker loop. The current batch always finishes before cancellation
    /// is honored.
    pub async fn run(self, pulse: PulseHandle, cancel: CancellationToken) {
        info!("sync worker started");
        if let Err(e) = self.store.recover_processing() {
            warn!(error = %e, "sync queue recovery failed");
        }

        // Tick faster than the drain cadence so the watchdog pulse stays
        // comfortably inside its staleness bound.
        let drain_every = Duration::from_secs(self.cfg.interval_secs.max(1));
        let mut ticker = tokio::time::interval(drain_every.min(Duration::from_secs(10)));
        let mut last_drain: Option<std::time::Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    pulse.pulse();
                    let due = last_drain
                        .map(|at| at.elapsed() >= drain_every)
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    last_drain = Some(std::time::Instant::now());
                    match self.drain_once(&cancel).await {
                        Ok(delivered) if delivered > 0 => {
                            debug!(jobs = delivered, "sync pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "sync pass failed"),
                    }
                }
            }
        }
        info!("sync worker stopped");
    }

    /// One drain pass: submits due batches until the queue is empty, the
    /// sink fails, or cancellation is observed between batches.
    pub async fn drain_once(&self, cancel: &CancellationToken) -> anyhow::Result<usize> {
        let queue_len = self.store.pending_sync_count()?;
        let batch_size = self.apply_backpressure(queue_len);

        let mut delivered = 0usize;
        loop {
            let now = Utc::now();
            let batch = self.store.next_sync_batch(now, batch_size)?;
            if batch.is_empty() {
                break;
            }

            let batch_id = Uuid::new_v4();
            self.store.mark_processing(&batch, batch_id)?;

            let kind = batch[0].entity;
            let payloads: Vec<serde_json::Value> = batch
                .iter()
                .map(|job| {
                    serde_json::from_str(&job.payload)
                        .unwrap_or(serde_json::Value::String(job.payload.clone()))
                })
                .collect();

            match self.sink.deliver(kind, payloads).await {
                Ok(()) => {
                    self.store.mark_completed(&batch, Utc::now())?;
                    delivered += batch.len();
                    debug!(kind = kind.as_str(), jobs = batch.len(), %batch_id, "batch delivered");
                }
                Err(e) => {
                    let attempt = batch.iter().map(|j| j.attempts).min().unwrap_or(0) + 1;
                    let next = next_attempt_at(attempt, Utc::now());
                    warn!(
                        kind = kind.as_str(),
                        jobs = batch.len(),
                        error = %e,
                        retryable = e.retryable(),
                        next_attempt = %next,
                        "batch delivery failed"
                    );
                    self.store
                        .mark_failed(&batch, &e.to_string(), Utc::now(), next, e.retryable())?;
                    break;
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }
        Ok(delivered)
    }

    /// Raises the batch size past the soft limit and sheds raw metric
    /// payloads past the hard limit.
    fn apply_backpressure(&self, queue_len: usize) -> usize {
        if queue_len > self.cfg.queue_hard_limit {
            if !self.aggregator.shedding() {
                warn!(queue_len, "sync queue past hard limit, shedding raw payloads");
                self.aggregator.set_shed_raw(true);
                self.bus.publish(AgentEvent::MemoryPressure {
                    level: PressureLevel::Critical,
                    memory_mb: 0,
                });
            }
            self.cfg.max_batch_size
        } else if queue_len > self.cfg.queue_soft_limit {
            self.bus.publish(AgentEvent::MemoryPressure {
                level: PressureLevel::Elevated,
                memory_mb: 0,
            });
            self.cfg.max_batch_size.min(self.cfg.batch_size * 2)
        } else {
            if self.aggregator.shedding() {
                info!(queue_len, "sync queue recovered, raw payloads restored");
                self.aggregator.set_shed_raw(false);
            }
            self.cfg.batch_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncJobTemplate;
    use crate::types::{BoundingBox, Detection, SyncOp};
    use parking_lot::Mutex;

    struct ScriptedSink {
        /// Pop-front responses; empty means succeed.
        responses: Mutex<Vec<Result<(), SinkError>>>,
        delivered: Mutex<Vec<(SyncEntity, usize)>>,
    }

    impl ScriptedSink {
        fn new(responses: Vec<Result<(), SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    impl SinkTransport for ScriptedSink {
        fn deliver<'a>(
            &'a self,
            kind: SyncEntity,
            payloads: Vec<serde_json::Value>,
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
            Box::pin(async move {
                let mut responses = self.responses.lock();
                let result = if responses.is_empty() {
                    Ok(())
                } else {
                    responses.remove(0)
                };
                if result.is_ok() {
                    self.delivered.lock().push((kind, payloads.len()));
                }
                result
            })
        }
    }

    fn seeded_store(n: usize) -> Arc<Store> {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let template = SyncJobTemplate {
            op: SyncOp::Create,
            max_attempts: 5,
            now,
            expires_at: now + chrono::Duration::days(3),
        };
        let detections: Vec<Detection> = (0..n)
            .map(|i| Detection {
                class_id: 0,
                label: "person".into(),
                confidence: 0.8,
                bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 0.1, y2: 0.1 },
                camera_id: "cam".into(),
                frame_no: i as u64,
                timestamp: now,
                key_frame_id: None,
            })
            .collect();
        store.insert_detections(&detections, Some(&template)).unwrap();
        store
    }

    fn worker<S: SinkTransport>(store: Arc<Store>, sink: Arc<S>) -> SyncWorker<S> {
        let cfg = SyncConfig {
            sink_url: "https://sink.example".into(),
            ..SyncConfig::default()
        };
        SyncWorker::new(
            store,
            sink,
            cfg,
            Arc::new(WindowAggregator::default()),
            EventBus::default(),
        )
    }

    #[test]
    fn backoff_schedule_doubles_from_30s() {
        let now = Utc::now();
        let deltas: Vec<i64> = (1..=4)
            .map(|a| (next_attempt_at(a, now) - now).num_seconds())
            .collect();
        assert_eq!(deltas, vec![30, 60, 120, 240]);
    }

    #[test]
    fn backoff_is_capped() {
        let now = Utc::now();
        assert_eq!((next_attempt_at(30, now) - now).num_seconds(), 3600);
    }

    #[test]
    fn status_classification() {
        assert!(SinkError::Status(503).retryable());
        assert!(SinkError::Status(429).retryable());
        assert!(SinkError::Transport("timeout".into()).retryable());
        assert!(!SinkError::Status(400).retryable());
    }

    #[tokio::test]
    async fn drain_delivers_everything_in_batches() {
        let store = seeded_store(250);
        let sink = ScriptedSink::new(Vec::new());
        let w = worker(Arc::clone(&store), Arc::clone(&sink));

        let delivered = w.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(delivered, 250);
        assert_eq!(store.pending_sync_count().unwrap(), 0);

        let batches = sink.delivered.lock();
        assert_eq!(batches.len(), 3); // 100 + 100 + 50
        assert!(batches.iter().all(|(kind, _)| *kind == SyncEntity::Detection));
    }

    #[tokio::test]
    async fn sink_failure_stops_pass_and_schedules_retry() {
        let store = seeded_store(5);
        let sink = ScriptedSink::new(vec![Err(SinkError::Status(503))]);
        let w = worker(Arc::clone(&store), Arc::clone(&sink));

        let delivered = w.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(delivered, 0);
        // Jobs reverted to pending but not yet due.
        assert_eq!(store.pending_sync_count().unwrap(), 5);
        assert!(store.next_sync_batch(Utc::now(), 10).unwrap().is_empty());
        let due_later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(store.next_sync_batch(due_later, 10).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn non_retryable_failure_parks_jobs() {
        let store = seeded_store(2);
        let sink = ScriptedSink::new(vec![Err(SinkError::Status(400))]);
        let w = worker(Arc::clone(&store), Arc::clone(&sink));

        w.drain_once(&CancellationToken::new()).await.unwrap();
        // Failed jobs are no longer pending even after the backoff.
        let due_later = Utc::now() + chrono::Duration::hours(2);
        assert!(store.next_sync_batch(due_later, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn hard_limit_sheds_raw_payloads() {
        let store = seeded_store(10);
        let sink = ScriptedSink::new(Vec::new());
        let aggregator = Arc::new(WindowAggregator::default());
        let cfg = SyncConfig {
            sink_url: "https://sink.example".into(),
            queue_soft_limit: 2,
            queue_hard_limit: 5,
            ..SyncConfig::default()
        };
        let w = SyncWorker::new(
            Arc::clone(&store),
            sink,
            cfg,
            Arc::clone(&aggregator),
            EventBus::default(),
        );

        assert_eq!(w.apply_backpressure(10), w.cfg.max_batch_size);
        assert!(aggregator.shedding());
        // Recovery clears the shed flag.
        assert_eq!(w.apply_backpressure(1), w.cfg.batch_size);
        assert!(!aggregator.shedding());
    }
}
