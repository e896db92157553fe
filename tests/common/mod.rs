//! Shared fixtures for integration tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use edge_vision_agent::sync::{SinkError, SinkTransport};
use edge_vision_agent::types::{BoundingBox, Detection, SyncEntity};

/// One delivery the mock sink accepted.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: SyncEntity,
    pub payloads: Vec<serde_json::Value>,
}

/// Scriptable in-process sink. Responses are popped per call; when the
/// script is empty every delivery succeeds.
pub struct MockSink {
    script: Mutex<Vec<Result<(), SinkError>>>,
    pub deliveries: Mutex<Vec<Delivery>>,
}

impl MockSink {
    pub fn accepting() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Result<(), SinkError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            deliveries: Mutex::new(Vec::new()),
        })
    }

    pub fn delivered_kinds(&self) -> Vec<SyncEntity> {
        self.deliveries.lock().iter().map(|d| d.kind).collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.deliveries.lock().iter().map(|d| d.payloads.len()).sum()
    }
}

impl SinkTransport for MockSink {
    fn deliver<'a>(
        &'a self,
        kind: SyncEntity,
        payloads: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let result = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    Ok(())
                } else {
                    script.remove(0)
                }
            };
            if result.is_ok() {
                self.deliveries.lock().push(Delivery { kind, payloads });
            }
            result
        })
    }
}

pub fn detection(camera: &str, frame_no: u64, ts: DateTime<Utc>) -> Detection {
    Detection {
        class_id: 0,
        label: "person".into(),
        confidence: 0.85,
        bbox: BoundingBox {
            x1: 0.1,
            y1: 0.1,
            x2: 0.4,
            y2: 0.6,
        },
        camera_id: camera.into(),
        frame_no,
        timestamp: ts,
        key_frame_id: None,
    }
}
