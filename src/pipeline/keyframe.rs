//! Key-frame path.
//!
//! Per camera, at most one key frame per gate interval. A gated frame gets
//! a scene description and embedding from the describer (failure degrades
//! to an empty description) and a compressed thumbnail (failure drops the
//! key frame without advancing the gate, so the next candidate retries).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::inference::{is_person, Describer};
use crate::pipeline::compress::{frame_to_rgb, Compressor};
use crate::types::{Detection, KeyFrame, RawFrame};

/// Per-camera predicate admitting one key-frame candidate per interval.
/// The first frame after start is always admitted; the gate advances only
/// when a key frame is actually emitted.
pub struct KeyFrameGate {
    interval: Duration,
    last_advanced: Mutex<Option<DateTime<Utc>>>,
}

impl KeyFrameGate {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            last_advanced: Mutex::new(None),
        })
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        match *self.last_advanced.lock() {
            None => true,
            Some(last) => {
                at.signed_duration_since(last).num_milliseconds()
                    >= self.interval.as_millis() as i64
            }
        }
    }

    pub fn advance(&self, at: DateTime<Utc>) {
        *self.last_advanced.lock() = Some(at);
    }
}

pub struct KeyFramePipeline {
    gate: Arc<KeyFrameGate>,
    describer: Option<Arc<Describer>>,
    compressor: Compressor,
    location_id: Option<String>,
}

impl KeyFramePipeline {
    pub fn new(
        gate: Arc<KeyFrameGate>,
        describer: Option<Arc<Describer>>,
        compressor: Compressor,
        location_id: Option<String>,
    ) -> Self {
        Self {
            gate,
            describer,
            compressor,
            location_id,
        }
    }

    pub fn gate(&self) -> &Arc<KeyFrameGate> {
        &self.gate
    }

    /// Processes a key-frame candidate. Returns `None` when the gate has
    /// closed since tagging or the thumbnail could not be encoded.
    pub async fn process(&self, frame: &RawFrame, detections: &[Detection]) -> Option<KeyFrame> {
        // Candidates can stack up while a slow batch drains; re-check so
        // adjacent key frames stay at least one interval apart.
        if !self.gate.is_open(frame.captured_at) {
            return None;
        }

        let started = std::time::Instant::now();

        let (description, embedding, description_failed) = match &self.describer {
            Some(describer) => match describer.describe(frame).await {
                Ok(out) => (out.text, out.embedding, false),
                Err(e) => {
                    warn!(
                        camera = %frame.camera_id,
                        frame_no = frame.frame_no,
                        error = %e,
                        "description failed, emitting key frame without text"
                    );
                    (String::new(), Vec::new(), true)
                }
            },
            None => (String::new(), Vec::new(), false),
        };

        let Some(rgb) = frame_to_rgb(&frame.pixels) else {
            warn!(camera = %frame.camera_id, "key frame has malformed pixel buffer, dropped");
            return None;
        };
        let encoded = match self.compressor.encode_frame(&rgb) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(camera = %frame.camera_id, error = %e, "thumbnail encode failed, key frame dropped");
                return None;
            }
        };
        if encoded.over_ceiling {
            // Oversize thumbnails are never persisted; the gate stays put
            // so the next candidate gets another try.
            warn!(
                camera = %frame.camera_id,
                bytes = encoded.bytes.len(),
                "thumbnail over size ceiling, key frame dropped"
            );
            return None;
        }

        let people_count = detections.iter().filter(|d| is_person(d.class_id)).count() as u32;
        let mut object_labels: Vec<String> = detections.iter().map(|d| d.label.clone()).collect();
        object_labels.sort();
        object_labels.dedup();

        let key_frame = KeyFrame {
            id: Uuid::new_v4(),
            camera_id: frame.camera_id.clone(),
            frame_no: frame.frame_no,
            timestamp: frame.captured_at,
            thumbnail: encoded.bytes,
            description,
            description_failed,
            embedding,
            people_count,
            object_labels,
            processing_ms: started.elapsed().as_millis() as u64,
            synced: false,
            last_sync_attempt: None,
            location_id: self.location_id.clone(),
        };

        self.gate.advance(frame.captured_at);
        debug!(
            camera = %frame.camera_id,
            frame_no = frame.frame_no,
            thumbnail_bytes = key_frame.thumbnail.len(),
            people = people_count,
            "key frame emitted"
        );
        Some(key_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::types::FRAME_BYTES;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn frame(pool: &BufferPool, n: u64, captured_at: DateTime<Utc>) -> RawFrame {
        RawFrame {
            camera_id: "cam".into(),
            frame_no: n,
            captured_at,
            pixels: pool.rent(FRAME_BYTES),
            key_frame_candidate: true,
        }
    }

    fn pipeline(gate: Arc<KeyFrameGate>) -> KeyFramePipeline {
        KeyFramePipeline::new(gate, None, Compressor::new(5120, 20), Some("site-1".into()))
    }

    #[test]
    fn gate_admits_first_frame() {
        let gate = KeyFrameGate::new(Duration::from_secs(10));
        assert!(gate.is_open(at(0)));
    }

    #[test]
    fn gate_enforces_interval() {
        let gate = KeyFrameGate::new(Duration::from_secs(10));
        gate.advance(at(0));
        assert!(!gate.is_open(at(5)));
        assert!(gate.is_open(at(10)));
    }

    #[tokio::test]
    async fn emits_key_frame_without_describer() {
        let pool = BufferPool::new();
        let gate = KeyFrameGate::new(Duration::from_secs(10));
        let pipeline = pipeline(Arc::clone(&gate));
        let kf = pipeline.process(&frame(&pool, 1, at(0)), &[]).await.unwrap();
        assert!(kf.description.is_empty());
        assert!(!kf.description_failed);
        assert!(kf.thumbnail.len() <= 5120);
        assert_eq!(kf.location_id.as_deref(), Some("site-1"));
        // Gate advanced.
        assert!(!gate.is_open(at(5)));
    }

    #[tokio::test]
    async fn gate_closed_candidate_is_skipped() {
        let pool = BufferPool::new();
        let gate = KeyFrameGate::new(Duration::from_secs(10));
        let pipeline = pipeline(Arc::clone(&gate));
        gate.advance(at(0));
        assert!(pipeline.process(&frame(&pool, 2, at(3)), &[]).await.is_none());
    }

    #[tokio::test]
    async fn oversize_thumbnail_drops_without_advancing() {
        let pool = BufferPool::new();
        let gate = KeyFrameGate::new(Duration::from_secs(10));
        // Ceiling of one byte: everything is oversize.
        let pipeline = KeyFramePipeline::new(
            Arc::clone(&gate),
            None,
            Compressor::new(1, 20),
            None,
        );
        let out = pipeline.process(&frame(&pool, 1, at(0)), &[]).await;
        assert!(out.is_none());
        assert!(gate.is_open(at(0)), "gate must not advance on encode failure");
    }

    #[tokio::test]
    async fn people_count_and_labels_come_from_detections() {
        use crate::types::BoundingBox;
        let pool = BufferPool::new();
        let gate = KeyFrameGate::new(Duration::from_secs(10));
        let pipeline = pipeline(gate);
        let bbox = BoundingBox { x1: 0.1, y1: 0.1, x2: 0.2, y2: 0.2 };
        let mk = |class_id: u32, label: &str| Detection {
            class_id,
            label: label.into(),
            confidence: 0.9,
            bbox,
            camera_id: "cam".into(),
            frame_no: 1,
            timestamp: at(0),
            key_frame_id: None,
        };
        let detections = vec![mk(0, "person"), mk(0, "person"), mk(2, "car")];
        let kf = pipeline
            .process(&frame(&pool, 1, at(0)), &detections)
            .await
            .unwrap();
        assert_eq!(kf.people_count, 2);
        assert_eq!(kf.object_labels, vec!["car".to_string(), "person".to_string()]);
    }
}
