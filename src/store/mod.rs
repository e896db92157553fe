//! Durable local store.
//!
//! A single SQLite database holds cameras, detections, key frames, metric
//! windows and the sync queue. WAL journaling makes committed writes
//! survive abrupt process exit; writers are serialized behind one
//! connection while WAL keeps readers unblocked.

mod writer;

pub use writer::{spawn_store_writer, StoreHandle, WriteRequest};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    Camera, CameraStatus, Detection, KeyFrame, MetricWindow, SyncEntity, SyncJob, SyncOp,
    SyncStatus,
};

pub const DB_FILE: &str = "edge-vision.db";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Age thresholds used by the retention pass.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub synced_rows_days: u32,
    pub metrics_days: u32,
    pub completed_jobs_days: u32,
    pub failed_jobs_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            synced_rows_days: 7,
            metrics_days: 30,
            completed_jobs_days: 1,
            failed_jobs_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub detections: usize,
    pub key_frames: usize,
    pub metric_windows: usize,
    pub sync_jobs: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.detections + self.key_frames + self.metric_windows + self.sync_jobs
    }
}

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v).single().unwrap_or_else(Utc::now)
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Arc<Self>, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE);
        let conn = Connection::open(&path)?;
        Self::init(&conn)?;
        info!(path = ?path, "store opened");
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        // Tuned for many small write transactions with concurrent readers.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "cache_size", -8000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "wal_autocheckpoint", 1000)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cameras (
                id                      TEXT PRIMARY KEY,
                name                    TEXT NOT NULL,
                stream_url              TEXT NOT NULL,
                substream_url           TEXT,
                enabled                 INTEGER NOT NULL,
                frame_interval_secs     INTEGER NOT NULL,
                key_frame_interval_secs INTEGER NOT NULL,
                status                  TEXT NOT NULL,
                last_connected          INTEGER,
                retry_count             INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS detections (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id    TEXT NOT NULL,
                frame_no     INTEGER NOT NULL,
                class_id     INTEGER NOT NULL,
                label        TEXT NOT NULL,
                confidence   REAL NOT NULL,
                x1           REAL NOT NULL,
                y1           REAL NOT NULL,
                x2           REAL NOT NULL,
                y2           REAL NOT NULL,
                timestamp    INTEGER NOT NULL,
                key_frame_id TEXT,
                synced       INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_detections_camera_ts
                ON detections(camera_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_detections_synced
                ON detections(synced);

            CREATE TABLE IF NOT EXISTS key_frames (
                id                 TEXT PRIMARY KEY,
                camera_id          TEXT NOT NULL,
                frame_no           INTEGER NOT NULL,
                timestamp          INTEGER NOT NULL,
                thumbnail          BLOB NOT NULL,
                description        TEXT NOT NULL,
                description_failed INTEGER NOT NULL,
                embedding          BLOB,
                people_count       INTEGER NOT NULL,
                object_labels      TEXT NOT NULL,
                processing_ms      INTEGER NOT NULL,
                synced             INTEGER NOT NULL DEFAULT 0,
                last_sync_attempt  INTEGER,
                location_id        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_key_frames_camera_ts
                ON key_frames(camera_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_key_frames_synced
                ON key_frames(synced);

            CREATE TABLE IF NOT EXISTS metric_windows (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id         TEXT NOT NULL,
                window_start      INTEGER NOT NULL,
                duration_secs     INTEGER NOT NULL,
                record            TEXT NOT NULL,
                raw_payload       BLOB,
                synced            INTEGER NOT NULL DEFAULT 0,
                UNIQUE(camera_id, window_start)
            );
            CREATE INDEX IF NOT EXISTS idx_metric_windows_synced
                ON metric_windows(synced);

            CREATE TABLE IF NOT EXISTS sync_queue (
                id            TEXT PRIMARY KEY,
                entity        TEXT NOT NULL,
                entity_id     TEXT NOT NULL,
                op            TEXT NOT NULL,
                payload       TEXT NOT NULL,
                payload_bytes INTEGER NOT NULL,
                status        TEXT NOT NULL,
                attempts      INTEGER NOT NULL DEFAULT 0,
                max_attempts  INTEGER NOT NULL,
                last_error    TEXT,
                last_attempt  INTEGER,
                next_attempt  INTEGER NOT NULL,
                priority      INTEGER NOT NULL,
                batch_id      TEXT,
                expires_at    INTEGER NOT NULL,
                created_at    INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_queue_dispatch
                ON sync_queue(status, priority, next_attempt);
            "#,
        )?;
        Ok(())
    }

    // ── cameras ──────────────────────────────────────────────────────

    pub fn upsert_camera(&self, cam: &Camera) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO cameras
                (id, name, stream_url, substream_url, enabled,
                 frame_interval_secs, key_frame_interval_secs, status,
                 last_connected, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                stream_url = excluded.stream_url,
                substream_url = excluded.substream_url,
                enabled = excluded.enabled,
                frame_interval_secs = excluded.frame_interval_secs,
                key_frame_interval_secs = excluded.key_frame_interval_secs,
                status = excluded.status,
                last_connected = excluded.last_connected,
                retry_count = excluded.retry_count
            "#,
            params![
                cam.id,
                cam.name,
                cam.stream_url,
                cam.substream_url,
                cam.enabled,
                cam.frame_interval_secs as i64,
                cam.key_frame_interval_secs as i64,
                cam.status.as_str(),
                cam.last_connected.map(ms),
                cam.retry_count,
            ],
        )?;
        Ok(())
    }

    pub fn update_camera_status(
        &self,
        id: &str,
        status: CameraStatus,
        last_connected: Option<DateTime<Utc>>,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE cameras SET status = ?2, last_connected = COALESCE(?3, last_connected),
             retry_count = ?4 WHERE id = ?1",
            params![id, status.as_str(), last_connected.map(ms), retry_count],
        )?;
        Ok(())
    }

    // ── ingest ───────────────────────────────────────────────────────

    /// Inserts a detection batch and its sync jobs in one transaction.
    pub fn insert_detections(
        &self,
        detections: &[Detection],
        sync: Option<&SyncJobTemplate>,
    ) -> Result<(), StoreError> {
        if detections.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for d in detections {
            tx.execute(
                r#"
                INSERT INTO detections
                    (camera_id, frame_no, class_id, label, confidence,
                     x1, y1, x2, y2, timestamp, key_frame_id, synced)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
                "#,
                params![
                    d.camera_id,
                    d.frame_no as i64,
                    d.class_id,
                    d.label,
                    d.confidence,
                    d.bbox.x1,
                    d.bbox.y1,
                    d.bbox.x2,
                    d.bbox.y2,
                    ms(d.timestamp),
                    d.key_frame_id.map(|id| id.to_string()),
                ],
            )?;
            if let Some(template) = sync {
                let entity_id = tx.last_insert_rowid().to_string();
                let payload = serde_json::to_string(d)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                enqueue_job(&tx, SyncEntity::Detection, &entity_id, &payload, template)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_key_frame(
        &self,
        kf: &KeyFrame,
        sync: Option<&SyncJobTemplate>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let labels = serde_json::to_string(&kf.object_labels)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        tx.execute(
            r#"
            INSERT INTO key_frames
                (id, camera_id, frame_no, timestamp, thumbnail, description,
                 description_failed, embedding, people_count, object_labels,
                 processing_ms, synced, last_sync_attempt, location_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL, ?12)
            "#,
            params![
                kf.id.to_string(),
                kf.camera_id,
                kf.frame_no as i64,
                ms(kf.timestamp),
                kf.thumbnail,
                kf.description,
                kf.description_failed,
                embedding_to_blob(&kf.embedding),
                kf.people_count,
                labels,
                kf.processing_ms as i64,
                kf.location_id,
            ],
        )?;
        if let Some(template) = sync {
            // The payload carries the record without pixels; a JSON byte
            // array would triple the thumbnail size. The sink fetches
            // thumbnails by id when it wants them.
            let mut slim = kf.clone();
            slim.thumbnail = Vec::new();
            let payload =
                serde_json::to_string(&slim).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            enqueue_job(&tx, SyncEntity::KeyFrame, &kf.id.to_string(), &payload, template)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_metric_window(
        &self,
        window: &MetricWindow,
        sync: Option<&SyncJobTemplate>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let record =
            serde_json::to_string(window).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        tx.execute(
            r#"
            INSERT INTO metric_windows
                (camera_id, window_start, duration_secs, record, raw_payload, synced)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(camera_id, window_start) DO UPDATE SET
                record = excluded.record,
                raw_payload = excluded.raw_payload
            "#,
            params![
                window.camera_id,
                ms(window.window_start),
                window.duration_secs as i64,
                record,
                window.raw_payload,
            ],
        )?;
        if let Some(template) = sync {
            let entity_id = tx.last_insert_rowid().to_string();
            enqueue_job(&tx, SyncEntity::MetricWindow, &entity_id, &record, template)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── sync queue ───────────────────────────────────────────────────

    pub fn pending_sync_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'processing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Next batch in (priority, age) order. Batches never mix entity
    /// kinds: the head job's kind filters the rest of the batch.
    pub fn next_sync_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        let conn = self.conn.lock();
        let head_kind: Option<String> = conn
            .query_row(
                "SELECT entity FROM sync_queue
                 WHERE status = 'pending' AND next_attempt <= ?1
                 ORDER BY priority, created_at, rowid LIMIT 1",
                params![ms(now)],
                |row| row.get(0),
            )
            .optional()?;
        let Some(kind) = head_kind else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare_cached(
            "SELECT id, entity, entity_id, op, payload, payload_bytes, status,
                    attempts, max_attempts, last_error, last_attempt,
                    next_attempt, priority, batch_id, expires_at, created_at
             FROM sync_queue
             WHERE status = 'pending' AND next_attempt <= ?1 AND entity = ?2
             ORDER BY priority, created_at, rowid LIMIT ?3",
        )?;
        let jobs = stmt
            .query_map(params![ms(now), kind, limit as i64], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn mark_processing(&self, jobs: &[SyncJob], batch_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for job in jobs {
            tx.execute(
                "UPDATE sync_queue SET status = 'processing', batch_id = ?2 WHERE id = ?1",
                params![job.id.to_string(), batch_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Marks jobs delivered and flips the owning rows' synced flags.
    pub fn mark_completed(&self, jobs: &[SyncJob], now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for job in jobs {
            tx.execute(
                "UPDATE sync_queue SET status = 'completed', last_attempt = ?2,
                 attempts = attempts + 1 WHERE id = ?1",
                params![job.id.to_string(), ms(now)],
            )?;
            let table = match job.entity {
                SyncEntity::Detection => "detections",
                SyncEntity::KeyFrame => "key_frames",
                SyncEntity::MetricWindow => "metric_windows",
            };
            match job.entity {
                SyncEntity::KeyFrame => {
                    tx.execute(
                        "UPDATE key_frames SET synced = 1, last_sync_attempt = ?2 WHERE id = ?1",
                        params![job.entity_id, ms(now)],
                    )?;
                }
                _ => {
                    tx.execute(
                        &format!("UPDATE {table} SET synced = 1 WHERE id = ?1"),
                        params![job.entity_id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Records a failed attempt; reverts to pending when attempts remain.
    pub fn mark_failed(
        &self,
        jobs: &[SyncJob],
        error: &str,
        now: DateTime<Utc>,
        next_attempt: DateTime<Utc>,
        retryable: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for job in jobs {
            let attempts = job.attempts + 1;
            let status = if retryable && attempts < job.max_attempts {
                SyncStatus::Pending
            } else {
                SyncStatus::Failed
            };
            tx.execute(
                "UPDATE sync_queue SET status = ?2, attempts = ?3, last_error = ?4,
                 last_attempt = ?5, next_attempt = ?6 WHERE id = ?1",
                params![
                    job.id.to_string(),
                    status.as_str(),
                    attempts,
                    error,
                    ms(now),
                    ms(next_attempt),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reverts in-flight jobs back to pending; used at startup so a crash
    /// mid-batch cannot strand jobs in `processing`.
    pub fn recover_processing(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE sync_queue SET status = 'pending', batch_id = NULL
             WHERE status = 'processing'",
            [],
        )?;
        if n > 0 {
            debug!(jobs = n, "recovered in-flight sync jobs to pending");
        }
        Ok(n)
    }

    pub fn job_status(&self, id: Uuid) -> Result<Option<SyncStatus>, StoreError> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM sync_queue WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| SyncStatus::parse(&s)))
    }

    // ── retention ────────────────────────────────────────────────────

    /// Age-based deletion. Unsynced detection/key-frame/metric rows are
    /// never deleted.
    pub fn cleanup(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<CleanupReport, StoreError> {
        let day_ms = 24 * 3600 * 1000i64;
        let rows_cutoff = ms(now) - i64::from(policy.synced_rows_days) * day_ms;
        let metrics_cutoff = ms(now) - i64::from(policy.metrics_days) * day_ms;
        let completed_cutoff = ms(now) - i64::from(policy.completed_jobs_days) * day_ms;
        let failed_cutoff = ms(now) - i64::from(policy.failed_jobs_days) * day_ms;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let detections = tx.execute(
            "DELETE FROM detections WHERE synced = 1 AND timestamp < ?1",
            params![rows_cutoff],
        )?;
        let key_frames = tx.execute(
            "DELETE FROM key_frames WHERE synced = 1 AND timestamp < ?1",
            params![rows_cutoff],
        )?;
        let metric_windows = tx.execute(
            "DELETE FROM metric_windows WHERE synced = 1 AND window_start < ?1",
            params![metrics_cutoff],
        )?;
        let sync_jobs = tx.execute(
            "DELETE FROM sync_queue WHERE
                (status = 'completed' AND last_attempt < ?1)
             OR (expires_at < ?2)
             OR (status = 'failed' AND last_attempt < ?3)",
            params![completed_cutoff, ms(now), failed_cutoff],
        )?;
        tx.commit()?;

        Ok(CleanupReport {
            detections,
            key_frames,
            metric_windows,
            sync_jobs,
        })
    }

    /// Space reclamation after a large deletion pass.
    pub fn reclaim(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }

    // ── counts for tests and health ──────────────────────────────────

    pub fn count_rows(&self, table: &str) -> Result<usize, StoreError> {
        let allowed = ["cameras", "detections", "key_frames", "metric_windows", "sync_queue"];
        if !allowed.contains(&table) {
            return Err(StoreError::Corrupt(format!("unknown table {table:?}")));
        }
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Enqueue parameters shared by every job created in one ingest write.
#[derive(Debug, Clone)]
pub struct SyncJobTemplate {
    pub op: SyncOp,
    pub max_attempts: u32,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn enqueue_job(
    tx: &rusqlite::Transaction<'_>,
    entity: SyncEntity,
    entity_id: &str,
    payload: &str,
    template: &SyncJobTemplate,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO sync_queue
            (id, entity, entity_id, op, payload, payload_bytes, status,
             attempts, max_attempts, last_error, last_attempt, next_attempt,
             priority, batch_id, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, NULL, NULL, ?8, ?9, NULL, ?10, ?11)
        "#,
        params![
            Uuid::new_v4().to_string(),
            entity.as_str(),
            entity_id,
            template.op.as_str(),
            payload,
            payload.len(),
            template.max_attempts,
            ms(template.now),
            entity.priority(),
            ms(template.expires_at),
            ms(template.now),
        ],
    )?;
    Ok(())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    let id: String = row.get(0)?;
    let entity: String = row.get(1)?;
    let op: String = row.get(3)?;
    let status: String = row.get(6)?;
    let last_attempt: Option<i64> = row.get(10)?;
    let batch_id: Option<String> = row.get(13)?;
    Ok(SyncJob {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        entity: SyncEntity::parse(&entity).unwrap_or(SyncEntity::Detection),
        entity_id: row.get(2)?,
        op: SyncOp::parse(&op).unwrap_or(SyncOp::Create),
        payload: row.get(4)?,
        payload_bytes: row.get::<_, i64>(5)? as usize,
        status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Pending),
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        last_error: row.get(9)?,
        last_attempt: last_attempt.map(from_ms),
        next_attempt: from_ms(row.get(11)?),
        priority: row.get(12)?,
        batch_id: batch_id.and_then(|b| Uuid::parse_str(&b).ok()),
        expires_at: from_ms(row.get(14)?),
        created_at: from_ms(row.get(15)?),
    })
}
