//! Entity types shared across the pipeline stages.
//!
//! Stages refer to each other's records by identifier only; pixel buffers
//! travel by move and return to the pool when dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::buffer::PooledBuf;

/// Fixed capture geometry: decoders are told to emit exactly this.
pub const FRAME_WIDTH: u32 = 640;
pub const FRAME_HEIGHT: u32 = 480;
/// 24-bit BGR, one fixed-size record per frame on the decoder pipe.
pub const FRAME_BYTES: usize = (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize;

/// Connection lifecycle of a camera as seen by the capture worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Disconnected => "disconnected",
            CameraStatus::Connecting => "connecting",
            CameraStatus::Connected => "connected",
            CameraStatus::Failed => "failed",
            CameraStatus::Reconnecting => "reconnecting",
        }
    }
}

/// A configured camera and its runtime connection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub stream_url: String,
    pub substream_url: Option<String>,
    pub enabled: bool,
    pub frame_interval_secs: u64,
    pub key_frame_interval_secs: u64,
    pub status: CameraStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

/// One decoded frame. Owns its pixel buffer; dropping the frame returns the
/// buffer to the pool.
pub struct RawFrame {
    pub camera_id: String,
    pub frame_no: u64,
    pub captured_at: DateTime<Utc>,
    pub pixels: PooledBuf,
    /// Set by the capture worker when the camera's key-frame gate is open.
    pub key_frame_candidate: bool,
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("camera_id", &self.camera_id)
            .field("frame_no", &self.frame_no)
            .field("captured_at", &self.captured_at)
            .field("bytes", &self.pixels.len())
            .field("key_frame_candidate", &self.key_frame_candidate)
            .finish()
    }
}

/// Normalized bounding box, all coordinates in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected object. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub camera_id: String,
    pub frame_no: u64,
    pub timestamp: DateTime<Utc>,
    pub key_frame_id: Option<Uuid>,
}

/// A designated frame with a durable thumbnail and scene description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub id: Uuid,
    pub camera_id: String,
    pub frame_no: u64,
    pub timestamp: DateTime<Utc>,
    pub thumbnail: Vec<u8>,
    pub description: String,
    pub description_failed: bool,
    /// L2-normalized scene embedding, empty when the describer is disabled.
    pub embedding: Vec<f32>,
    pub people_count: u32,
    pub object_labels: Vec<String>,
    pub processing_ms: u64,
    pub synced: bool,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub location_id: Option<String>,
}

/// Aggregate statistics for one class over a metric window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ClassStats {
    pub avg: f32,
    pub max: u32,
    pub min: u32,
}

/// One wall-aligned reduction window for a single camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricWindow {
    pub window_start: DateTime<Utc>,
    pub duration_secs: u64,
    pub camera_id: String,
    pub sample_count: u64,
    pub people: ClassStats,
    pub vehicles: ClassStats,
    /// Per-class stats for everything outside the named groups.
    pub other_classes: BTreeMap<String, ClassStats>,
    pub processing_ms_avg: f64,
    pub processing_ms_p95: f64,
    pub processing_ms_max: f64,
    pub frames_processed: u64,
    pub key_frames_processed: u64,
    pub error_count: u64,
    pub cpu_percent_avg: f32,
    pub cpu_temp_avg: f32,
    pub memory_mb_avg: f64,
    /// Entropy-coded per-detection records; elided under queue pressure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<Vec<u8>>,
    pub compression_ratio: f32,
    pub synced: bool,
}

/// What a sync job carries to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEntity {
    Detection,
    KeyFrame,
    MetricWindow,
}

impl SyncEntity {
    /// Dispatch priority, lower sorts earlier.
    pub fn priority(&self) -> i32 {
        match self {
            SyncEntity::KeyFrame => 0,
            SyncEntity::Detection => 1,
            SyncEntity::MetricWindow => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEntity::Detection => "detection",
            SyncEntity::KeyFrame => "key_frame",
            SyncEntity::MetricWindow => "metric_window",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detection" => Some(SyncEntity::Detection),
            "key_frame" => Some(SyncEntity::KeyFrame),
            "metric_window" => Some(SyncEntity::MetricWindow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Create,
    Update,
    Delete,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOp::Create => "create",
            SyncOp::Update => "update",
            SyncOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncOp::Create),
            "update" => Some(SyncOp::Update),
            "delete" => Some(SyncOp::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "processing" => Some(SyncStatus::Processing),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// A durable intent to deliver one entity to the cloud sink at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub op: SyncOp,
    pub payload: String,
    pub payload_bytes: usize,
    pub status: SyncStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: DateTime<Utc>,
    pub priority: i32,
    pub batch_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per-camera slice of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraCheckpoint {
    pub status: CameraStatus,
    pub last_frame_no: u64,
    pub retry_count: u32,
}

/// Periodic durable snapshot; the last one is source of truth on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub written_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub cameras: BTreeMap<String, CameraCheckpoint>,
    pub counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox { x1: 0.1, y1: 0.1, x2: 0.5, y2: 0.5 };
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox { x1: 0.0, y1: 0.0, x2: 0.2, y2: 0.2 };
        let b = BoundingBox { x1: 0.5, y1: 0.5, x2: 0.9, y2: 0.9 };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn sync_priorities_order_key_frames_first() {
        assert!(SyncEntity::KeyFrame.priority() < SyncEntity::Detection.priority());
        assert!(SyncEntity::Detection.priority() < SyncEntity::MetricWindow.priority());
    }

    #[test]
    fn entity_kind_round_trips_through_str() {
        for kind in [SyncEntity::Detection, SyncEntity::KeyFrame, SyncEntity::MetricWindow] {
            assert_eq!(SyncEntity::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SyncEntity::parse("bogus"), None);
    }
}
