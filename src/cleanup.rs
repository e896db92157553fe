//! Periodic retention pass.
//!
//! Deletes aged synced rows and stale sync jobs on a fixed cadence and
//! reclaims file space after large deletions. The store itself guards the
//! one hard rule: unsynced rows are never deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::{RetentionPolicy, Store};

/// Deletion count that triggers a vacuum/analyze pass.
const RECLAIM_THRESHOLD: usize = 1000;

pub fn spawn_cleanup_loop(
    store: Arc<Store>,
    policy: RetentionPolicy,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(60)));
        ticker.tick().await; // skip the immediate tick; nothing to clean yet
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    run_once(&store, &policy).await;
                }
            }
        }
    })
}

pub async fn run_once(store: &Arc<Store>, policy: &RetentionPolicy) {
    let store_for_cleanup = Arc::clone(store);
    let policy = *policy;
    let report = tokio::task::spawn_blocking(move || {
        store_for_cleanup.cleanup(Utc::now(), &policy)
    })
    .await;

    let report = match report {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            warn!(error = %e, "cleanup pass failed");
            return;
        }
        Err(e) => {
            warn!(error = %e, "cleanup task panicked");
            return;
        }
    };

    info!(
        detections = report.detections,
        key_frames = report.key_frames,
        metric_windows = report.metric_windows,
        sync_jobs = report.sync_jobs,
        "cleanup pass complete"
    );

    if report.total() > RECLAIM_THRESHOLD {
        let store_for_vacuum = Arc::clone(store);
        let result =
            tokio::task::spawn_blocking(move || store_for_vacuum.reclaim()).await;
        match result {
            Ok(Ok(())) => info!("space reclaimed after large cleanup"),
            Ok(Err(e)) => warn!(error = %e, "reclaim failed"),
            Err(e) => warn!(error = %e, "reclaim task panicked"),
        }
    }
}
