//! Agent wiring.
//!
//! Builds every component from configuration, spawns the per-camera
//! capture and scheduling tasks plus the supervisor loops, and owns the
//! graceful-shutdown sequence. The returned exit code tells the service
//! host whether to restart.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::buffer::{BufferPool, FrameRing};
use crate::capture::{CameraRuntime, CaptureWorker};
use crate::cleanup::spawn_cleanup_loop;
use crate::config::{parse_restart_time, AgentConfig};
use crate::health::{self, HealthReadings, HealthState, HealthThresholds, ResourceProbe};
use crate::inference::{
    Describer, Detector, PromptTokenizer, SessionRegistry, TensorPool, DEFAULT_PROMPT,
    DETECTOR_INPUT,
};
use crate::metrics::WindowAggregator;
use crate::models::ensure_models;
use crate::pipeline::{
    BatchScheduler, Compressor, KeyFrameGate, KeyFramePipeline, PipelineCounters,
};
use crate::store::{spawn_store_writer, RetentionPolicy, Store, StoreHandle, WriteRequest};
use crate::supervisor::{
    spawn_checkpoint_loop, spawn_daily_restart, spawn_watchdog_loop, AgentEvent, CheckpointStore,
    EventBus, ShutdownController, StopReason, SysinfoProbe, ThermalGovernor, ThrottleState,
    Watchdog, CHECKPOINT_MAX_AGE, MAIN_PULSE,
};
use crate::types::{Camera, CameraStatus, Checkpoint};

/// Inference soft latency limits per model.
const DETECT_SOFT_LIMIT: Duration = Duration::from_millis(200);
const DESCRIBE_SOFT_LIMIT: Duration = Duration::from_millis(1000);

const STATS_INTERVAL: Duration = Duration::from_secs(60);
const RESOURCE_INTERVAL: Duration = Duration::from_secs(15);
const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_JOIN_BUDGET: Duration = Duration::from_secs(10);

pub struct Agent {
    cfg: AgentConfig,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Self {
        Self { cfg }
    }

    pub async fn run(self) -> Result<i32> {
        let cfg = self.cfg;
        let started = Instant::now();

        let data_dir = cfg.data_dir();
        let state_dir = cfg.state_dir();
        std::fs::create_dir_all(&data_dir).context("creating data directory")?;
        std::fs::create_dir_all(&state_dir).context("creating state directory")?;

        let store = Store::open(&data_dir).context("opening local store")?;

        // Resume from the last checkpoint when it is fresh enough.
        let checkpoints = CheckpointStore::new(&state_dir)?;
        let previous = checkpoints.load(CHECKPOINT_MAX_AGE);
        let restart_count = previous.as_ref().map(|c| c.restart_count + 1).unwrap_or(0);
        let previous_uptime = previous.as_ref().map(|c| c.uptime_secs).unwrap_or(0);

        let shutdown = ShutdownController::new();
        let bus = EventBus::default();
        let watchdog = Watchdog::with_defaults();
        let throttle = ThrottleState::new();
        let pool = BufferPool::new();
        let tensors = TensorPool::new();
        let counters = PipelineCounters::new();
        if let Some(cp) = &previous {
            counters.resume(&cp.counters);
            info!(
                restart_count,
                previous_uptime_secs = previous_uptime,
                "resumed from checkpoint"
            );
        }

        bus.publish(AgentEvent::ServiceStarted {
            restart_count,
            previous_uptime_secs: previous_uptime,
        });

        // Models and sessions. The detector is required; the describer
        // degrades to key frames without text.
        let artifacts = ensure_models(&cfg.models, &data_dir.join("models")).await?;
        let registry = SessionRegistry::with_artifacts(artifacts.clone());

        let detector = if artifacts.contains_key(&cfg.models.detector_name) {
            let warmup = tensors
                .rent(&[1, 3, DETECTOR_INPUT, DETECTOR_INPUT])
                .to_tensor()
                .ok()
                .map(|t| vec![t]);
            let session = registry
                .session(&cfg.models.detector_name, DETECT_SOFT_LIMIT, warmup)
                .context("loading detector model")?;
            Arc::new(Detector::new(session, tensors.clone(), cfg.detection.clone()))
        } else {
            anyhow::bail!("detector model {:?} unavailable", cfg.models.detector_name);
        };

        let describer = if cfg.enable_description && artifacts.contains_key(&cfg.models.describer_name)
        {
            let tokenizer = match &cfg.models.vocab_path {
                Some(path) => PromptTokenizer::from_file(path)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "vocab unavailable, using builtin");
                        PromptTokenizer::builtin()
                    }),
                None => PromptTokenizer::builtin(),
            };
            match registry.session(&cfg.models.describer_name, DESCRIBE_SOFT_LIMIT, None) {
                Ok(session) => Some(Arc::new(Describer::new(
                    session,
                    tensors.clone(),
                    tokenizer,
                    DEFAULT_PROMPT,
                ))),
                Err(e) => {
                    warn!(error = %e, "describer unavailable, key frames will carry no text");
                    None
                }
            }
        } else {
            None
        };

        let aggregator = Arc::new(WindowAggregator::default());
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let store_handle = StoreHandle::new(write_tx);
        let writer_handle = spawn_store_writer(Arc::clone(&store), cfg.sync.clone(), write_rx);

        let mut handles = Vec::new();

        // Per-camera capture + scheduling.
        let active = cfg.active_cameras();
        if active.len() < cfg.cameras.iter().filter(|c| c.enabled).count() {
            warn!(max = cfg.max_cameras, "enabled cameras exceed max_cameras, extra ignored");
        }
        let mut runtimes: Vec<Arc<CameraRuntime>> = Vec::new();
        for cam_cfg in active {
            let camera_id = cam_cfg.id.clone();
            store.upsert_camera(&Camera {
                id: camera_id.clone(),
                name: cam_cfg.name.clone(),
                stream_url: cam_cfg.url.clone(),
                substream_url: cam_cfg.substream_url.clone(),
                enabled: true,
                frame_interval_secs: cfg.frame_interval_secs,
                key_frame_interval_secs: cfg.key_frame_interval_secs,
                status: CameraStatus::Disconnected,
                last_connected: None,
                retry_count: 0,
            })?;

            let runtime = CameraRuntime::new(&camera_id);
            if let Some(cp) = previous.as_ref().and_then(|c| c.cameras.get(&camera_id)) {
                runtime.resume_from(cp);
            }
            runtimes.push(Arc::clone(&runtime));

            let ring = FrameRing::with_defaults();
            let gate = KeyFrameGate::new(Duration::from_secs(cfg.key_frame_interval_secs));
            let compressor = Compressor::new(
                cfg.storage.thumbnail_max_bytes,
                cfg.storage.thumbnail_quality,
            );
            let key_frames = Arc::new(KeyFramePipeline::new(
                Arc::clone(&gate),
                describer.clone(),
                compressor,
                cam_cfg.location_id.clone(),
            ));

            let capture = CaptureWorker::new(
                cam_cfg.clone(),
                cfg.frame_interval_secs,
                Arc::clone(&ring),
                pool.clone(),
                Arc::clone(&gate),
                Arc::clone(&runtime),
                bus.clone(),
                watchdog.register(&format!("capture:{camera_id}")),
                shutdown.child_token(),
            );
            handles.push(capture.spawn());

            let scheduler = BatchScheduler::new(
                camera_id.clone(),
                ring,
                Arc::clone(&detector),
                key_frames,
                store_handle.clone(),
                Arc::clone(&aggregator),
                Arc::clone(&throttle),
                Arc::clone(&counters),
                watchdog.register(&format!("scheduler:{camera_id}")),
                watchdog.register(MAIN_PULSE),
                cfg.detection.clone(),
                shutdown.child_token(),
            );
            handles.push(scheduler.spawn());
        }

        // Supervisor loops.
        let governor = ThermalGovernor::new(cfg.thermal.clone(), Arc::clone(&throttle), bus.clone());
        let thermal_cancel = shutdown.child_token();
        handles.push(tokio::spawn(async move {
            governor.run(SysinfoProbe::new(), thermal_cancel).await;
        }));

        {
            let reclaim_pool = pool.clone();
            handles.push(spawn_watchdog_loop(
                watchdog.clone(),
                bus.clone(),
                Arc::clone(&shutdown),
                Box::new(move || reclaim_pool.clear()),
                shutdown.child_token(),
            ));
        }

        {
            let counters = Arc::clone(&counters);
            let runtimes = runtimes.clone();
            let snapshot = Box::new(move || Checkpoint {
                written_at: Utc::now(),
                uptime_secs: started.elapsed().as_secs(),
                restart_count,
                last_error: None,
                cameras: runtimes
                    .iter()
                    .map(|r| (r.camera_id.clone(), r.snapshot()))
                    .collect::<BTreeMap<_, _>>(),
                counters: counters.snapshot(),
                extensions: BTreeMap::new(),
            });
            handles.push(spawn_checkpoint_loop(
                checkpoints,
                snapshot,
                shutdown.child_token(),
            ));
        }

        if let Some((hour, minute)) = parse_restart_time(&cfg.daily_restart_time) {
            handles.push(spawn_daily_restart(
                hour,
                minute,
                Arc::clone(&shutdown),
                shutdown.child_token(),
            ));
        }

        handles.push(spawn_cleanup_loop(
            Arc::clone(&store),
            RetentionPolicy {
                synced_rows_days: cfg.retention.local_retention_days,
                metrics_days: cfg.retention.metrics_retention_days,
                ..RetentionPolicy::default()
            },
            Duration::from_secs(cfg.retention.cleanup_interval_hours * 3600),
            shutdown.child_token(),
        ));

        if cfg.sync.enabled {
            let sink = Arc::new(crate::sync::HttpSink::new(&cfg.sync).map_err(|e| {
                anyhow::anyhow!("building sink client: {e}")
            })?);
            let worker = crate::sync::SyncWorker::new(
                Arc::clone(&store),
                sink,
                cfg.sync.clone(),
                Arc::clone(&aggregator),
                bus.clone(),
            );
            let pulse = watchdog.register("sync");
            let cancel = shutdown.child_token();
            handles.push(tokio::spawn(async move {
                worker.run(pulse, cancel).await;
            }));
        }

        handles.push(spawn_metrics_flush(
            Arc::clone(&aggregator),
            store_handle.clone(),
            shutdown.child_token(),
        ));

        let thresholds = HealthThresholds {
            unhealthy_memory_mb: cfg.resources.max_memory_mb,
            degraded_memory_mb: cfg.resources.max_memory_mb.saturating_sub(1000),
            unhealthy_temp_c: cfg.thermal.emergency_temp_c,
            ..HealthThresholds::default()
        };
        handles.push(spawn_resource_loop(
            Arc::clone(&aggregator),
            Arc::clone(&store),
            runtimes.clone(),
            bus.clone(),
            thresholds,
            shutdown.child_token(),
        ));

        handles.push(spawn_stats_loop(
            pool.clone(),
            Arc::clone(&counters),
            runtimes.clone(),
            store_handle.clone(),
            shutdown.child_token(),
        ));

        // Bus-driven stops. The handler lives for as long as the bus does,
        // so it is aborted after shutdown instead of joined.
        let stop_handler = {
            let shutdown = Arc::clone(&shutdown);
            bus.spawn_handler("stop-requests", move |event| {
                if let AgentEvent::EmergencyShutdown { temperature_c } = event {
                    error!(temperature_c, "emergency shutdown requested by thermal governor");
                    shutdown.request_stop(StopReason::Emergency);
                }
                Ok(())
            })
        };

        // Operator stop.
        {
            let shutdown = Arc::clone(&shutdown);
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = tokio::signal::ctrl_c() => {
                        if result.is_ok() {
                            shutdown.request_stop(StopReason::Graceful);
                        }
                    }
                }
            });
        }

        info!(
            cameras = runtimes.len(),
            sync = cfg.sync.enabled,
            description = describer.is_some(),
            "agent running"
        );

        shutdown.token().cancelled().await;
        let reason = shutdown.reason().unwrap_or(StopReason::Graceful);
        info!(?reason, "shutting down");

        // Stages observe their child tokens; give them their drain budgets.
        if tokio::time::timeout(
            SHUTDOWN_JOIN_BUDGET,
            futures_util::future::join_all(handles),
        )
        .await
        .is_err()
        {
            warn!("some tasks did not stop within the shutdown budget");
        }

        stop_handler.abort();

        // Final metric windows, then let the writer drain.
        for window in aggregator.flush_all() {
            store_handle.send(WriteRequest::MetricWindow(Box::new(window)));
        }
        drop(store_handle);
        if tokio::time::timeout(Duration::from_secs(5), writer_handle)
            .await
            .is_err()
        {
            warn!("store writer did not drain in time");
        }

        info!(uptime_secs = started.elapsed().as_secs(), "agent stopped");
        Ok(reason.exit_code())
    }
}

/// Flushes closed metric windows to the store on a fixed cadence.
fn spawn_metrics_flush(
    aggregator: Arc<WindowAggregator>,
    store: StoreHandle,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for window in aggregator.flush_ready(Utc::now()) {
                        store.send(WriteRequest::MetricWindow(Box::new(window)));
                    }
                }
            }
        }
    })
}

/// Samples resources for metric windows and the health verdict.
fn spawn_resource_loop(
    aggregator: Arc<WindowAggregator>,
    store: Arc<Store>,
    runtimes: Vec<Arc<CameraRuntime>>,
    bus: EventBus,
    thresholds: HealthThresholds,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = ResourceProbe::new();
        let mut last_state = HealthState::Healthy;
        let mut ticker = tokio::time::interval(RESOURCE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = probe.sample();
                    aggregator.record_resources(
                        sample.cpu_percent,
                        sample.temperature_c.unwrap_or(0.0),
                        sample.memory_mb as f64,
                    );

                    let queue_len = store.pending_sync_count().unwrap_or(0);
                    let online = runtimes
                        .iter()
                        .filter(|r| r.status() == CameraStatus::Connected)
                        .count();
                    let readings = HealthReadings {
                        memory_mb: sample.memory_mb,
                        cpu_percent: sample.cpu_percent,
                        temperature_c: sample.temperature_c,
                        cameras_online: online,
                        cameras_total: runtimes.len(),
                        sync_queue_len: queue_len,
                        free_disk_mb: sample.free_disk_mb,
                    };
                    let report = health::evaluate(&readings, &thresholds);
                    if report.state != last_state {
                        match report.state {
                            HealthState::Healthy => info!(reason = %report.reason, "health: healthy"),
                            HealthState::Degraded => warn!(reason = %report.reason, "health: degraded"),
                            HealthState::Unhealthy => error!(reason = %report.reason, "health: unhealthy"),
                        }
                        last_state = report.state;
                    }
                    if sample.memory_mb > thresholds.degraded_memory_mb {
                        bus.publish(AgentEvent::MemoryPressure {
                            level: if sample.memory_mb > thresholds.unhealthy_memory_mb {
                                crate::supervisor::PressureLevel::Critical
                            } else {
                                crate::supervisor::PressureLevel::Elevated
                            },
                            memory_mb: sample.memory_mb,
                        });
                    }
                }
            }
        }
    })
}

/// Periodic structured status summary plus camera-state persistence.
fn spawn_stats_loop(
    pool: BufferPool,
    counters: Arc<PipelineCounters>,
    runtimes: Vec<Arc<CameraRuntime>>,
    store: StoreHandle,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pool_stats = pool.stats();
                    info!(
                        frames = counters.frames_processed.load(std::sync::atomic::Ordering::Relaxed),
                        detections = counters.detections.load(std::sync::atomic::Ordering::Relaxed),
                        key_frames = counters.key_frames.load(std::sync::atomic::Ordering::Relaxed),
                        errors = counters.errors.load(std::sync::atomic::Ordering::Relaxed),
                        buffers_outstanding = pool_stats.outstanding,
                        "pipeline stats"
                    );
                    for runtime in &runtimes {
                        info!(
                            camera = %runtime.camera_id,
                            status = runtime.status().as_str(),
                            frames = runtime.last_frame_no(),
                            retries = runtime.retry_count(),
                            "camera stats"
                        );
                        store.send(WriteRequest::CameraStatus {
                            camera_id: runtime.camera_id.clone(),
                            status: runtime.status(),
                            last_connected: runtime.last_connected(),
                            retry_count: runtime.retry_count(),
                        });
                    }
                }
            }
        }
    })
}

/// Writes a JSON crash report into the state directory; called from the
/// binary on a fatal error.
pub fn write_crash_report(state_dir: &Path, error: &str) {
    let report = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "error": error,
        "version": env!("CARGO_PKG_VERSION"),
    });
    let _ = std::fs::create_dir_all(state_dir);
    let path = state_dir.join(format!(
        "crash-{}.json",
        Utc::now().format("%Y%m%dT%H%M%S")
    ));
    if let Err(e) = std::fs::write(&path, serde_json::to_vec_pretty(&report).unwrap_or_default()) {
        error!(error = %e, "failed to write crash report");
    } else {
        info!(path = ?path, "crash report written");
    }
}
