//! Per-camera capture path.
//!
//! Each camera is read through an isolated decoder subprocess whose stdout
//! carries length-implicit fixed-size raw frames. The worker owns the
//! subprocess lifecycle: silence detection, exponential-backoff restarts,
//! and the `failed` terminal state after repeated restarts. The parent
//! process never decodes video in-process.

mod command;

pub use command::{authenticated_uri, decoder_args, CommandError};

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, FrameRing};
use crate::config::CameraConfig;
use crate::pipeline::KeyFrameGate;
use crate::supervisor::{AgentEvent, EventBus, PulseHandle};
use crate::types::{CameraCheckpoint, CameraStatus, RawFrame, FRAME_BYTES};

/// Seconds without a frame before the camera is considered degraded.
pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(15);
/// Grace the subprocess gets to exit after a terminate request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const RESTART_WINDOW: Duration = Duration::from_secs(600);
const MAX_RESTARTS_IN_WINDOW: usize = 5;
const CLEAN_RESET: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to spawn decoder: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Why a decoder session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Restart(String),
}

/// Restart bookkeeping: exponential backoff, a failure window, and a
/// clean-running reset. Pure over injected instants so the schedule is
/// testable.
#[derive(Debug)]
pub struct RestartTracker {
    backoff: Duration,
    restarts: VecDeque<Instant>,
    healthy_since: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after this delay.
    Backoff(Duration),
    /// Too many restarts in the window; give up.
    Fail,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self {
            backoff: BACKOFF_START,
            restarts: VecDeque::new(),
            healthy_since: None,
        }
    }

    /// Records a restart at `now` and decides what to do next.
    pub fn note_restart(&mut self, now: Instant) -> RestartDecision {
        self.healthy_since = None;
        while let Some(&front) = self.restarts.front() {
            if now.duration_since(front) > RESTART_WINDOW {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        if self.restarts.len() > MAX_RESTARTS_IN_WINDOW {
            return RestartDecision::Fail;
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        RestartDecision::Backoff(delay)
    }

    /// Marks the session healthy at `now`; after five clean minutes the
    /// backoff and failure window reset.
    pub fn note_healthy(&mut self, now: Instant) {
        match self.healthy_since {
            None => self.healthy_since = Some(now),
            Some(since) if now.duration_since(since) >= CLEAN_RESET => {
                self.backoff = BACKOFF_START;
                self.restarts.clear();
            }
            Some(_) => {}
        }
    }
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable per-camera state shared with health, checkpointing and the agent.
pub struct CameraRuntime {
    pub camera_id: String,
    status: Mutex<CameraStatus>,
    last_connected: Mutex<Option<DateTime<Utc>>>,
    retry_count: AtomicU32,
    frame_no: AtomicU64,
}

impl CameraRuntime {
    pub fn new(camera_id: &str) -> Arc<Self> {
        Arc::new(Self {
            camera_id: camera_id.to_string(),
            status: Mutex::new(CameraStatus::Disconnected),
            last_connected: Mutex::new(None),
            retry_count: AtomicU32::new(0),
            frame_no: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> CameraStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: CameraStatus) {
        *self.status.lock() = status;
        if status == CameraStatus::Connected {
            *self.last_connected.lock() = Some(Utc::now());
        }
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        *self.last_connected.lock()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn next_frame_no(&self) -> u64 {
        self.frame_no.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_frame_no(&self) -> u64 {
        self.frame_no.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CameraCheckpoint {
        CameraCheckpoint {
            status: self.status(),
            last_frame_no: self.last_frame_no(),
            retry_count: self.retry_count(),
        }
    }

    /// Restores frame numbering from the last checkpoint so frame numbers
    /// stay monotonic across process restarts.
    pub fn resume_from(&self, checkpoint: &CameraCheckpoint) {
        self.frame_no.store(checkpoint.last_frame_no, Ordering::Relaxed);
        self.retry_count
            .store(checkpoint.retry_count, Ordering::Relaxed);
    }
}

/// Owns one camera's decoder subprocess and feeds its frame ring.
pub struct CaptureWorker {
    camera: CameraConfig,
    frame_interval_secs: u64,
    ring: Arc<FrameRing>,
    pool: BufferPool,
    gate: Arc<KeyFrameGate>,
    runtime: Arc<CameraRuntime>,
    bus: EventBus,
    pulse: PulseHandle,
    cancel: CancellationToken,
    decoder_bin: String,
}

impl CaptureWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: CameraConfig,
        frame_interval_secs: u64,
        ring: Arc<FrameRing>,
        pool: BufferPool,
        gate: Arc<KeyFrameGate>,
        runtime: Arc<CameraRuntime>,
        bus: EventBus,
        pulse: PulseHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            camera,
            frame_interval_secs,
            ring,
            pool,
            gate,
            runtime,
            bus,
            pulse,
            cancel,
            decoder_bin: std::env::var("EDGE_VISION_DECODER")
                .unwrap_or_else(|_| "ffmpeg".to_string()),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(camera = %self.camera.id, "capture worker started");
        let mut tracker = RestartTracker::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let end = match self.run_session(&mut tracker).await {
                Ok(end) => end,
                Err(e) => {
                    warn!(camera = %self.camera.id, error = %e, "decoder spawn failed");
                    SessionEnd::Restart(e.to_string())
                }
            };

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Restart(reason) => {
                    self.runtime.set_status(CameraStatus::Reconnecting);
                    self.runtime.retry_count.fetch_add(1, Ordering::Relaxed);

                    match tracker.note_restart(Instant::now()) {
                        RestartDecision::Backoff(delay) => {
                            warn!(
                                camera = %self.camera.id,
                                reason = %reason,
                                delay_ms = delay.as_millis() as u64,
                                "decoder restarting"
                            );
                            tokio::select! {
                                _ = self.cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        RestartDecision::Fail => {
                            error!(
                                camera = %self.camera.id,
                                reason = %reason,
                                "too many decoder restarts, camera marked failed"
                            );
                            self.runtime.set_status(CameraStatus::Failed);
                            self.bus.publish(AgentEvent::CameraFailed {
                                camera_id: self.camera.id.clone(),
                                reason,
                            });
                            // Left untouched until the operator re-enables it.
                            break;
                        }
                    }
                }
            }
        }

        self.runtime.set_status(CameraStatus::Disconnected);
        info!(camera = %self.camera.id, "capture worker stopped");
    }

    /// Runs one decoder subprocess until it dies, goes silent or is
    /// cancelled.
    async fn run_session(&self, tracker: &mut RestartTracker) -> Result<SessionEnd, CaptureError> {
        self.runtime.set_status(CameraStatus::Connecting);

        let uri = authenticated_uri(
            &self.camera.url,
            self.camera.username.as_deref(),
            self.camera.password.as_deref(),
        )?;
        let args = decoder_args(&uri, self.frame_interval_secs);

        debug!(camera = %self.camera.id, bin = %self.decoder_bin, "spawning decoder");
        let mut child = Command::new(&self.decoder_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CaptureError::Spawn)?;

        let last_stderr = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let camera_id = self.camera.id.clone();
            let last = Arc::clone(&last_stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(camera = %camera_id, "decoder: {line}");
                    *last.lock() = line;
                }
            });
        }

        let mut stdout = match child.stdout.take() {
            Some(out) => out,
            None => {
                shutdown_child(&mut child).await;
                return Ok(SessionEnd::Restart("decoder stdout unavailable".into()));
            }
        };

        let mut first_frame = true;
        let mut degraded = false;

        loop {
            let mut buf = self.pool.rent(FRAME_BYTES);

            let read = tokio::select! {
                _ = self.cancel.cancelled() => {
                    shutdown_child(&mut child).await;
                    return Ok(SessionEnd::Cancelled);
                }
                read = tokio::time::timeout(SILENCE_TIMEOUT, stdout.read_exact(&mut buf[..])) => read,
            };

            match read {
                Ok(Ok(_)) => {
                    let now = Instant::now();
                    if first_frame {
                        first_frame = false;
                        self.runtime.set_status(CameraStatus::Connected);
                        info!(camera = %self.camera.id, "stream connected");
                    }
                    if degraded {
                        degraded = false;
                        self.runtime.set_status(CameraStatus::Connected);
                        info!(camera = %self.camera.id, "stream recovered");
                    }
                    tracker.note_healthy(now);
                    self.pulse.pulse();

                    let captured_at = Utc::now();
                    let frame_no = self.runtime.next_frame_no();
                    let key_frame_candidate = self.gate.is_open(captured_at);
                    self.ring.push(RawFrame {
                        camera_id: self.camera.id.clone(),
                        frame_no,
                        captured_at,
                        pixels: buf,
                        key_frame_candidate,
                    });
                }
                Ok(Err(e)) => {
                    // EOF or broken pipe: decoder died.
                    shutdown_child(&mut child).await;
                    let stderr = last_stderr.lock().clone();
                    let reason = if stderr.is_empty() {
                        format!("decoder exited: {e}")
                    } else {
                        format!("decoder exited: {e} ({stderr})")
                    };
                    return Ok(SessionEnd::Restart(reason));
                }
                Err(_) => {
                    // Silence. First timeout degrades, second restarts.
                    if degraded {
                        shutdown_child(&mut child).await;
                        return Ok(SessionEnd::Restart(format!(
                            "no frames for {}s",
                            2 * SILENCE_TIMEOUT.as_secs()
                        )));
                    }
                    degraded = true;
                    warn!(camera = %self.camera.id, "stream silent, camera degraded");
                    self.runtime.set_status(CameraStatus::Reconnecting);
                }
            }
        }
    }
}

/// Terminates a decoder: polite kill request, bounded wait, hard kill.
async fn shutdown_child(child: &mut Child) {
    let _ = child.start_kill();
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "decoder exited"),
        Ok(Err(e)) => warn!(error = %e, "decoder wait failed"),
        Err(_) => {
            warn!("decoder ignored terminate, killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut tracker = RestartTracker::new();
        let t0 = Instant::now();
        let mut delays = Vec::new();
        // Space restarts out so the failure window never trips.
        for i in 0..8u64 {
            match tracker.note_restart(t0 + Duration::from_secs(i * 700)) {
                RestartDecision::Backoff(d) => delays.push(d.as_secs()),
                RestartDecision::Fail => panic!("unexpected fail"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn too_many_restarts_in_window_fails() {
        let mut tracker = RestartTracker::new();
        let t0 = Instant::now();
        for i in 0..MAX_RESTARTS_IN_WINDOW as u64 {
            assert!(matches!(
                tracker.note_restart(t0 + Duration::from_secs(i)),
                RestartDecision::Backoff(_)
            ));
        }
        assert_eq!(
            tracker.note_restart(t0 + Duration::from_secs(10)),
            RestartDecision::Fail
        );
    }

    #[test]
    fn restarts_outside_window_are_forgotten() {
        let mut tracker = RestartTracker::new();
        let t0 = Instant::now();
        for i in 0..5u64 {
            tracker.note_restart(t0 + Duration::from_secs(i));
        }
        // Eleven minutes later the window is clear again.
        assert!(matches!(
            tracker.note_restart(t0 + Duration::from_secs(660)),
            RestartDecision::Backoff(_)
        ));
    }

    #[test]
    fn clean_running_resets_backoff() {
        let mut tracker = RestartTracker::new();
        let t0 = Instant::now();
        tracker.note_restart(t0);
        tracker.note_restart(t0 + Duration::from_secs(2));
        // Healthy for five minutes.
        tracker.note_healthy(t0 + Duration::from_secs(10));
        tracker.note_healthy(t0 + Duration::from_secs(10 + CLEAN_RESET.as_secs()));
        match tracker.note_restart(t0 + Duration::from_secs(400)) {
            RestartDecision::Backoff(d) => assert_eq!(d, BACKOFF_START),
            RestartDecision::Fail => panic!("unexpected fail"),
        }
    }

    #[test]
    fn runtime_frame_numbers_resume_from_checkpoint() {
        let runtime = CameraRuntime::new("cam");
        runtime.resume_from(&CameraCheckpoint {
            status: CameraStatus::Connected,
            last_frame_no: 500,
            retry_count: 2,
        });
        assert_eq!(runtime.next_frame_no(), 501);
        assert_eq!(runtime.retry_count(), 2);
    }
}
