//! Configuration management for the agent.
//!
//! Loaded once at startup from a TOML file; read-mostly afterwards. Every
//! tunable the pipeline consults lives here with a serde default so a
//! minimal file (camera list + sink URL) is enough to run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Configured cameras; at most `max_cameras` may be enabled.
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,

    #[serde(default = "default_max_cameras")]
    pub max_cameras: usize,

    /// Seconds between captured frames per camera.
    #[serde(default = "default_frame_interval")]
    pub frame_interval_secs: u64,

    /// Minimum seconds between key frames per camera.
    #[serde(default = "default_key_frame_interval")]
    pub key_frame_interval_secs: u64,

    #[serde(default = "default_true")]
    pub enable_description: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Local time of the daily graceful restart, "HH:MM".
    #[serde(default = "default_restart_time")]
    pub daily_restart_time: String,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub thermal: ThermalConfig,

    #[serde(default)]
    pub resources: ResourceConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub models: ModelConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// One RTSP camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Primary stream URI, credentials excluded.
    pub url: String,

    #[serde(default)]
    pub substream_url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub location_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Detections below this confidence are discarded.
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,

    /// Greedy NMS overlap threshold.
    #[serde(default = "default_nms_iou")]
    pub nms_iou_threshold: f32,

    /// Largest batch submitted to the detector in one forward pass.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// Preferred batch size; collection stops early once reached.
    #[serde(default = "default_batch_opt")]
    pub batch_opt: usize,

    /// Batch collection deadline in milliseconds.
    #[serde(default = "default_batch_deadline_ms")]
    pub batch_deadline_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence(),
            nms_iou_threshold: default_nms_iou(),
            batch_max: default_batch_max(),
            batch_opt: default_batch_opt(),
            batch_deadline_ms: default_batch_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalConfig {
    /// Throttling starts at this CPU temperature.
    #[serde(default = "default_throttle_temp")]
    pub throttle_temp_c: f32,

    /// Emergency shutdown is requested at this temperature.
    #[serde(default = "default_emergency_temp")]
    pub emergency_temp_c: f32,

    /// Seconds the temperature must stay below threshold before throttle lifts.
    #[serde(default = "default_hysteresis_secs")]
    pub hysteresis_secs: u64,

    #[serde(default = "default_thermal_poll_secs")]
    pub poll_interval_secs: u64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            throttle_temp_c: default_throttle_temp(),
            emergency_temp_c: default_emergency_temp(),
            hysteresis_secs: default_hysteresis_secs(),
            poll_interval_secs: default_thermal_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days synced detections and key frames are kept locally.
    #[serde(default = "default_retention_days")]
    pub local_retention_days: u32,

    #[serde(default = "default_metrics_retention_days")]
    pub metrics_retention_days: u32,

    #[serde(default = "default_cleanup_hours")]
    pub cleanup_interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            local_retention_days: default_retention_days(),
            metrics_retention_days: default_metrics_retention_days(),
            cleanup_interval_hours: default_cleanup_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_sync_batch")]
    pub batch_size: usize,

    /// Batch size the worker grows toward past the soft limit.
    #[serde(default = "default_sync_batch_max")]
    pub max_batch_size: usize,

    /// Queue depth that raises batch sizes and emits a pressure event.
    #[serde(default = "default_queue_soft_limit")]
    pub queue_soft_limit: usize,

    /// Queue depth past which raw metric payloads are shed before enqueue.
    #[serde(default = "default_queue_hard_limit")]
    pub queue_hard_limit: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Days before an undelivered job expires.
    #[serde(default = "default_job_expiry_days")]
    pub job_expiry_days: u32,

    #[serde(default = "default_sink_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub sink_url: String,

    /// API key for the sink; stored encrypted at rest by the provisioner.
    #[serde(default)]
    pub sink_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sync_interval(),
            batch_size: default_sync_batch(),
            max_batch_size: default_sync_batch_max(),
            queue_soft_limit: default_queue_soft_limit(),
            queue_hard_limit: default_queue_hard_limit(),
            max_attempts: default_max_attempts(),
            job_expiry_days: default_job_expiry_days(),
            request_timeout_secs: default_sink_timeout(),
            sink_url: String::new(),
            sink_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_detector_name")]
    pub detector_name: String,

    #[serde(default)]
    pub detector_path: Option<PathBuf>,

    #[serde(default)]
    pub detector_url: Option<String>,

    /// Expected artifact size in bytes; downloads outside ±10 % are rejected.
    #[serde(default = "default_detector_size")]
    pub detector_size_bytes: u64,

    #[serde(default)]
    pub detector_sha256: Option<String>,

    #[serde(default = "default_describer_name")]
    pub describer_name: String,

    #[serde(default)]
    pub describer_path: Option<PathBuf>,

    #[serde(default)]
    pub describer_url: Option<String>,

    #[serde(default = "default_describer_size")]
    pub describer_size_bytes: u64,

    #[serde(default)]
    pub describer_sha256: Option<String>,

    /// Vocabulary file for the description tokenizer.
    #[serde(default)]
    pub vocab_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_name: default_detector_name(),
            detector_path: None,
            detector_url: None,
            detector_size_bytes: default_detector_size(),
            detector_sha256: None,
            describer_name: default_describer_name(),
            describer_path: None,
            describer_url: None,
            describer_size_bytes: default_describer_size(),
            describer_sha256: None,
            vocab_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory holding the database; platform-conventional when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// State directory for checkpoints and crash reports.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Thumbnail size ceiling in bytes.
    #[serde(default = "default_thumbnail_ceiling")]
    pub thumbnail_max_bytes: usize,

    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            state_dir: None,
            thumbnail_max_bytes: default_thumbnail_ceiling(),
            thumbnail_quality: default_thumbnail_quality(),
        }
    }
}

// Default value functions
fn default_max_cameras() -> usize { 5 }
fn default_frame_interval() -> u64 { 3 }
fn default_key_frame_interval() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_restart_time() -> String { "03:00".to_string() }
fn default_confidence() -> f32 { 0.25 }
fn default_nms_iou() -> f32 { 0.45 }
fn default_batch_max() -> usize { 16 }
fn default_batch_opt() -> usize { 8 }
fn default_batch_deadline_ms() -> u64 { 500 }
fn default_throttle_temp() -> f32 { 70.0 }
fn default_emergency_temp() -> f32 { 75.0 }
fn default_hysteresis_secs() -> u64 { 60 }
fn default_thermal_poll_secs() -> u64 { 5 }
fn default_max_cpu_percent() -> f32 { 60.0 }
fn default_max_memory_mb() -> u64 { 6000 }
fn default_retention_days() -> u32 { 7 }
fn default_metrics_retention_days() -> u32 { 30 }
fn default_cleanup_hours() -> u64 { 6 }
fn default_sync_interval() -> u64 { 30 }
fn default_sync_batch() -> usize { 100 }
fn default_sync_batch_max() -> usize { 500 }
fn default_queue_soft_limit() -> usize { 1000 }
fn default_queue_hard_limit() -> usize { 5000 }
fn default_max_attempts() -> u32 { 5 }
fn default_job_expiry_days() -> u32 { 3 }
fn default_sink_timeout() -> u64 { 30 }
fn default_detector_name() -> String { "detector-int8".to_string() }
fn default_detector_size() -> u64 { 6 * 1024 * 1024 }
fn default_describer_name() -> String { "describer-int8".to_string() }
fn default_describer_size() -> u64 { 120 * 1024 * 1024 }
fn default_thumbnail_ceiling() -> usize { 5120 }
fn default_thumbnail_quality() -> u8 { 20 }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            max_cameras: default_max_cameras(),
            frame_interval_secs: default_frame_interval(),
            key_frame_interval_secs: default_key_frame_interval(),
            enable_description: true,
            log_level: default_log_level(),
            daily_restart_time: default_restart_time(),
            detection: DetectionConfig::default(),
            thermal: ThermalConfig::default(),
            resources: ResourceConfig::default(),
            retention: RetentionConfig::default(),
            sync: SyncConfig::default(),
            models: ModelConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    /// Resolved state directory (checkpoints, crash reports).
    pub fn state_dir(&self) -> PathBuf {
        self.storage
            .state_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("state"))
    }

    /// Cameras that will actually be driven, capped at `max_cameras`.
    pub fn active_cameras(&self) -> Vec<&CameraConfig> {
        self.cameras
            .iter()
            .filter(|c| c.enabled)
            .take(self.max_cameras)
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "frame_interval_secs must be > 0".to_string(),
            ));
        }

        if self.key_frame_interval_secs < self.frame_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "key_frame_interval_secs ({}) must be >= frame_interval_secs ({})",
                self.key_frame_interval_secs, self.frame_interval_secs
            )));
        }

        if self.detection.batch_max == 0 || self.detection.batch_max > 64 {
            return Err(ConfigError::Invalid(format!(
                "batch_max must be between 1 and 64, got {}",
                self.detection.batch_max
            )));
        }

        if self.detection.batch_opt > self.detection.batch_max {
            return Err(ConfigError::Invalid(format!(
                "batch_opt ({}) must be <= batch_max ({})",
                self.detection.batch_opt, self.detection.batch_max
            )));
        }

        if self.thermal.emergency_temp_c <= self.thermal.throttle_temp_c {
            return Err(ConfigError::Invalid(format!(
                "emergency_temp_c ({}) must be > throttle_temp_c ({})",
                self.thermal.emergency_temp_c, self.thermal.throttle_temp_c
            )));
        }

        if self.sync.queue_hard_limit <= self.sync.queue_soft_limit {
            return Err(ConfigError::Invalid(format!(
                "queue_hard_limit ({}) must be > queue_soft_limit ({})",
                self.sync.queue_hard_limit, self.sync.queue_soft_limit
            )));
        }

        if self.sync.enabled && self.sync.sink_url.is_empty() {
            return Err(ConfigError::Invalid(
                "sync.sink_url is required when sync is enabled".to_string(),
            ));
        }

        parse_restart_time(&self.daily_restart_time).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "daily_restart_time must be HH:MM, got {:?}",
                self.daily_restart_time
            ))
        })?;

        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if cam.id.is_empty() {
                return Err(ConfigError::Invalid("camera id must not be empty".into()));
            }
            if !seen.insert(cam.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate camera id {:?}",
                    cam.id
                )));
            }
            if !cam.url.starts_with("rtsp://") {
                return Err(ConfigError::Invalid(format!(
                    "camera {:?}: url must be rtsp://, got {:?}",
                    cam.id, cam.url
                )));
            }
        }

        Ok(())
    }
}

/// Parses "HH:MM" into (hour, minute).
pub fn parse_restart_time(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AgentConfig::default();
        assert_eq!(config.max_cameras, 5);
        assert_eq!(config.frame_interval_secs, 3);
        assert_eq!(config.key_frame_interval_secs, 10);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.storage.thumbnail_max_bytes, 5120);
    }

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let toml = r#"
[sync]
sink_url = "https://sink.example.com/v1"

[[cameras]]
id = "cam-front"
url = "rtsp://10.0.0.10:554/stream1"
        "#;
        let config = AgentConfig::from_toml(toml).unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert!(config.cameras[0].enabled);
        assert_eq!(config.thermal.throttle_temp_c, 70.0);
    }

    #[test]
    fn rejects_non_rtsp_camera() {
        let toml = r#"
sync = { enabled = false }

[[cameras]]
id = "cam"
url = "http://example.com/feed"
        "#;
        assert!(AgentConfig::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_duplicate_camera_ids() {
        let toml = r#"
sync = { enabled = false }

[[cameras]]
id = "cam"
url = "rtsp://a/1"

[[cameras]]
id = "cam"
url = "rtsp://b/1"
        "#;
        assert!(AgentConfig::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_bad_restart_time() {
        let mut config = AgentConfig::default();
        config.sync.enabled = false;
        config.daily_restart_time = "25:00".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn restart_time_parses() {
        assert_eq!(parse_restart_time("03:00"), Some((3, 0)));
        assert_eq!(parse_restart_time("23:59"), Some((23, 59)));
        assert_eq!(parse_restart_time("3"), None);
    }

    #[test]
    fn active_cameras_respects_cap_and_enable_flag() {
        let mut config = AgentConfig::default();
        config.sync.enabled = false;
        config.max_cameras = 2;
        for i in 0..4 {
            config.cameras.push(CameraConfig {
                id: format!("cam{i}"),
                name: String::new(),
                url: "rtsp://h/1".into(),
                substream_url: None,
                username: None,
                password: None,
                enabled: i != 1,
                location_id: None,
            });
        }
        let active: Vec<_> = config.active_cameras().iter().map(|c| c.id.clone()).collect();
        assert_eq!(active, vec!["cam0", "cam2"]);
    }
}
