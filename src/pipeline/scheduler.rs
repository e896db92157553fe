//! Per-camera batch scheduler.
//!
//! One consumer task per camera pulls frames from the ring and assembles
//! batches: up to `batch_max` frames inside a 500 ms collection window,
//! submitting early once `batch_opt` frames are in hand and the ring has
//! drained. Batches go through the shared detector session; per-camera
//! emission order follows frame order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::FrameRing;
use crate::config::DetectionConfig;
use crate::inference::Detector;
use crate::metrics::WindowAggregator;
use crate::pipeline::keyframe::KeyFramePipeline;
use crate::store::{StoreHandle, WriteRequest};
use crate::supervisor::{PulseHandle, ThrottleState};
use crate::types::RawFrame;

/// Drain budget once cancellation is observed.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);
/// Idle wait for the first frame of a batch; bounds pulse cadence.
const FIRST_FRAME_WAIT: Duration = Duration::from_secs(1);
/// Detection batch soft latency target.
const BATCH_SOFT_LIMIT: Duration = Duration::from_millis(200);

/// Shared pipeline counters, checkpointed and restored across restarts.
#[derive(Default)]
pub struct PipelineCounters {
    pub frames_processed: AtomicU64,
    pub detections: AtomicU64,
    pub key_frames: AtomicU64,
    pub batches: AtomicU64,
    pub errors: AtomicU64,
}

impl PipelineCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        let mut map = std::collections::BTreeMap::new();
        map.insert("frames_processed".into(), self.frames_processed.load(Ordering::Relaxed));
        map.insert("detections".into(), self.detections.load(Ordering::Relaxed));
        map.insert("key_frames".into(), self.key_frames.load(Ordering::Relaxed));
        map.insert("batches".into(), self.batches.load(Ordering::Relaxed));
        map.insert("errors".into(), self.errors.load(Ordering::Relaxed));
        map
    }

    pub fn resume(&self, counters: &std::collections::BTreeMap<String, u64>) {
        let load = |key: &str| counters.get(key).copied().unwrap_or(0);
        self.frames_processed.store(load("frames_processed"), Ordering::Relaxed);
        self.detections.store(load("detections"), Ordering::Relaxed);
        self.key_frames.store(load("key_frames"), Ordering::Relaxed);
        self.batches.store(load("batches"), Ordering::Relaxed);
        self.errors.store(load("errors"), Ordering::Relaxed);
    }
}

pub struct BatchScheduler {
    camera_id: String,
    ring: Arc<FrameRing>,
    detector: Arc<Detector>,
    key_frames: Arc<KeyFramePipeline>,
    store: StoreHandle,
    metrics: Arc<WindowAggregator>,
    throttle: Arc<ThrottleState>,
    counters: Arc<PipelineCounters>,
    pulse: PulseHandle,
    main_pulse: PulseHandle,
    cfg: DetectionConfig,
    cancel: CancellationToken,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera_id: String,
        ring: Arc<FrameRing>,
        detector: Arc<Detector>,
        key_frames: Arc<KeyFramePipeline>,
        store: StoreHandle,
        metrics: Arc<WindowAggregator>,
        throttle: Arc<ThrottleState>,
        counters: Arc<PipelineCounters>,
        pulse: PulseHandle,
        main_pulse: PulseHandle,
        cfg: DetectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            camera_id,
            ring,
            detector,
            key_frames,
            store,
            metrics,
            throttle,
            counters,
            pulse,
            main_pulse,
            cfg,
            cancel,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(camera = %self.camera_id, "batch scheduler started");
        loop {
            self.pulse.pulse();
            self.main_pulse.pulse();

            // Governor delay applies to every tick while throttled.
            let delay = self.throttle.delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(first) = self.ring.take(Duration::ZERO, FIRST_FRAME_WAIT).await else {
                continue;
            };
            let batch = self.collect_batch(first).await;
            self.process_batch(batch).await;
        }

        self.drain().await;
        info!(camera = %self.camera_id, "batch scheduler stopped");
    }

    /// Gathers more frames behind `first` until the deadline, the cap, or
    /// an early finish at the preferred size with an empty ring.
    async fn collect_batch(&self, first: RawFrame) -> Vec<RawFrame> {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.batch_deadline_ms);
        let mut batch = vec![first];

        while batch.len() < self.cfg.batch_max {
            if let Some(frame) = self.ring.try_take(Duration::ZERO) {
                batch.push(frame);
                if batch.len() >= self.cfg.batch_opt && self.ring.is_empty() {
                    break;
                }
                continue;
            }
            if batch.len() >= self.cfg.batch_opt {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(10))).await;
        }

        batch
    }

    async fn process_batch(&self, mut batch: Vec<RawFrame>) {
        if batch.is_empty() {
            return;
        }
        // The ring hands out newest-first; detections must still be
        // emitted in frame order.
        batch.sort_by_key(|f| f.frame_no);
        if self.throttle.inference_stopped() {
            debug!(camera = %self.camera_id, frames = batch.len(), "inference stopped, batch shed");
            return;
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let per_frame = match self.detector.detect(&batch).await {
            Ok(per_frame) => per_frame,
            Err(e) => {
                // Per-frame failure reporting: the batch never aborts the
                // camera, each frame just counts an error and drops.
                warn!(camera = %self.camera_id, frames = batch.len(), error = %e, "detection failed");
                for frame in &batch {
                    self.metrics.record_error(&self.camera_id, frame.captured_at);
                }
                self.counters
                    .errors
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                return;
            }
        };

        let batch_elapsed = started.elapsed();
        if batch_elapsed > BATCH_SOFT_LIMIT {
            warn!(
                camera = %self.camera_id,
                frames = batch.len(),
                elapsed_ms = batch_elapsed.as_millis() as u64,
                "detection batch exceeded latency target"
            );
        }
        let per_frame_ms = batch_elapsed.as_secs_f64() * 1000.0 / batch.len() as f64;

        for (frame, mut detections) in batch.into_iter().zip(per_frame) {
            let key_frame = if frame.key_frame_candidate {
                self.key_frames.process(&frame, &detections).await
            } else {
                None
            };

            if let Some(kf) = &key_frame {
                for d in &mut detections {
                    d.key_frame_id = Some(kf.id);
                }
            }

            self.metrics.record_frame(
                &self.camera_id,
                frame.captured_at,
                &detections,
                per_frame_ms,
                key_frame.is_some(),
            );

            self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
            self.counters
                .detections
                .fetch_add(detections.len() as u64, Ordering::Relaxed);

            if !detections.is_empty() {
                self.store.send(WriteRequest::Detections(detections));
            }
            if let Some(kf) = key_frame {
                self.counters.key_frames.fetch_add(1, Ordering::Relaxed);
                self.store.send(WriteRequest::KeyFrame(Box::new(kf)));
            }
            // Frame drops here; its buffer returns to the pool.
        }
    }

    /// Best-effort drain of resident frames within the shutdown budget.
    async fn drain(&self) {
        let deadline = Instant::now() + DRAIN_BUDGET;
        while Instant::now() < deadline && !self.throttle.inference_stopped() {
            let mut batch = Vec::new();
            while batch.len() < self.cfg.batch_max {
                match self.ring.try_take(Duration::ZERO) {
                    Some(frame) => batch.push(frame),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            debug!(camera = %self.camera_id, frames = batch.len(), "draining final batch");
            self.process_batch(batch).await;
        }
        // Whatever remains resolves as cancelled: dropped, buffers pooled.
        self.ring.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_round_trip_through_snapshot() {
        let counters = PipelineCounters::new();
        counters.frames_processed.store(10, Ordering::Relaxed);
        counters.key_frames.store(3, Ordering::Relaxed);

        let snap = counters.snapshot();
        let restored = PipelineCounters::new();
        restored.resume(&snap);
        assert_eq!(restored.frames_processed.load(Ordering::Relaxed), 10);
        assert_eq!(restored.key_frames.load(Ordering::Relaxed), 3);
        assert_eq!(restored.errors.load(Ordering::Relaxed), 0);
    }
}
