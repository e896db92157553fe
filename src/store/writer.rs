//! Single-writer ingest path.
//!
//! Every stage sends its rows through one channel to one task, so ingest
//! writes are serialized and readers never observe a partial batch. Sync
//! jobs are enqueued in the same transaction as the rows they cover.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::store::{Store, SyncJobTemplate};
use crate::types::{CameraStatus, Detection, KeyFrame, MetricWindow, SyncOp};

/// One serialized ingest write.
#[derive(Debug)]
pub enum WriteRequest {
    Detections(Vec<Detection>),
    KeyFrame(Box<KeyFrame>),
    MetricWindow(Box<MetricWindow>),
    CameraStatus {
        camera_id: String,
        status: CameraStatus,
        last_connected: Option<chrono::DateTime<Utc>>,
        retry_count: u32,
    },
}

/// Spawns the store writer task. The task drains its channel fully before
/// exiting, so pending writes survive a shutdown that closes the senders.
pub fn spawn_store_writer(
    store: Arc<Store>,
    sync_cfg: SyncConfig,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("store writer started");
        while let Some(request) = rx.recv().await {
            let template = sync_template(&sync_cfg);
            let result = match request {
                WriteRequest::Detections(detections) => {
                    store.insert_detections(&detections, template.as_ref())
                }
                WriteRequest::KeyFrame(kf) => store.insert_key_frame(&kf, template.as_ref()),
                WriteRequest::MetricWindow(window) => {
                    store.insert_metric_window(&window, template.as_ref())
                }
                WriteRequest::CameraStatus {
                    camera_id,
                    status,
                    last_connected,
                    retry_count,
                } => store.update_camera_status(&camera_id, status, last_connected, retry_count),
            };
            if let Err(e) = result {
                // A failed write is data loss for that row only; ingest
                // must keep flowing.
                error!(error = %e, "store write failed");
            }
        }
        info!("store writer drained and stopped");
    })
}

fn sync_template(cfg: &SyncConfig) -> Option<SyncJobTemplate> {
    if !cfg.enabled {
        return None;
    }
    let now = Utc::now();
    Some(SyncJobTemplate {
        op: SyncOp::Create,
        max_attempts: cfg.max_attempts,
        now,
        expires_at: now + Duration::days(i64::from(cfg.job_expiry_days)),
    })
}

/// Convenience sender wrapper so stages do not handle channel errors
/// individually.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl StoreHandle {
    pub fn new(tx: mpsc::UnboundedSender<WriteRequest>) -> Self {
        Self { tx }
    }

    pub fn send(&self, request: WriteRequest) {
        if self.tx.send(request).is_err() {
            warn!("store writer gone, write dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn detection() -> Detection {
        Detection {
            class_id: 0,
            label: "person".into(),
            confidence: 0.9,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 0.5, y2: 0.5 },
            camera_id: "cam".into(),
            frame_no: 1,
            timestamp: Utc::now(),
            key_frame_id: None,
        }
    }

    #[tokio::test]
    async fn writer_persists_and_drains_on_close() {
        let store = Store::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cfg = SyncConfig::default();
        cfg.sink_url = "https://sink.example".into();
        let handle = spawn_store_writer(Arc::clone(&store), cfg, rx);

        tx.send(WriteRequest::Detections(vec![detection(), detection()]))
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.count_rows("detections").unwrap(), 2);
        assert_eq!(store.count_rows("sync_queue").unwrap(), 2);
    }

    #[tokio::test]
    async fn sync_disabled_skips_queue() {
        let store = Store::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        };
        let handle = spawn_store_writer(Arc::clone(&store), cfg, rx);

        tx.send(WriteRequest::Detections(vec![detection()])).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.count_rows("detections").unwrap(), 1);
        assert_eq!(store.count_rows("sync_queue").unwrap(), 0);
    }
}
