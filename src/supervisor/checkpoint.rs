//! Durable checkpoints.
//!
//! A JSON snapshot of supervisor counters and per-camera state, written
//! atomically every five minutes and on shutdown. On startup the last
//! checkpoint is loaded if it is no older than 24 hours.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::types::Checkpoint;

pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);
pub const CHECKPOINT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

const FILE_NAME: &str = "checkpoint.json";

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        Ok(Self {
            path: state_dir.join(FILE_NAME),
        })
    }

    /// Writes via a temp file and rename so a crash mid-write never leaves
    /// a truncated checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Loads the last checkpoint when present, parseable and fresh enough.
    pub fn load(&self, max_age: Duration) -> Option<Checkpoint> {
        let bytes = std::fs::read(&self.path).ok()?;
        let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
            Ok(cp) => cp,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "checkpoint unreadable, ignoring");
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(checkpoint.written_at);
        if age.num_seconds() < 0 || age.num_seconds() as u64 > max_age.as_secs() {
            info!(age_secs = age.num_seconds(), "checkpoint too old, starting fresh");
            return None;
        }
        Some(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn checkpoint() -> Checkpoint {
        let mut counters = BTreeMap::new();
        counters.insert("frames_captured".to_string(), 1234);
        Checkpoint {
            written_at: Utc::now(),
            uptime_secs: 3600,
            restart_count: 2,
            last_error: None,
            cameras: BTreeMap::new(),
            counters,
            extensions: BTreeMap::new(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let cp = checkpoint();
        store.save(&cp).unwrap();

        let loaded = store.load(CHECKPOINT_MAX_AGE).unwrap();
        assert_eq!(loaded.restart_count, 2);
        assert_eq!(loaded.counters.get("frames_captured"), Some(&1234));
    }

    #[test]
    fn stale_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = checkpoint();
        cp.written_at = Utc::now() - chrono::Duration::hours(25);
        store.save(&cp).unwrap();
        assert!(store.load(CHECKPOINT_MAX_AGE).is_none());
    }

    #[test]
    fn missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        assert!(store.load(CHECKPOINT_MAX_AGE).is_none());
    }

    #[test]
    fn corrupt_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join(FILE_NAME), b"{ not json").unwrap();
        assert!(store.load(CHECKPOINT_MAX_AGE).is_none());
    }
}
