//! Model artifact management.
//!
//! On first launch the detector and describer artifacts are fetched from
//! their configured URLs, size-validated within ±10 % and optionally
//! hash-checked, then cached next to a JSON catalog listing what is
//! available. Artifact internals are opaque; quantization is a build-time
//! concern and the loader only verifies what the catalog promises.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ModelConfig;

pub const CATALOG_FILE: &str = "models.json";
const SIZE_TOLERANCE: f64 = 0.10;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed for {name}: {reason}")]
    Download { name: String, reason: String },

    #[error("artifact {name} size {actual} outside ±10% of {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("artifact {name} hash mismatch")]
    HashMismatch { name: String },

    #[error("artifact {name} missing and no download url configured")]
    Missing { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub available: bool,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub written_at: DateTime<Utc>,
    pub models: Vec<CatalogEntry>,
}

impl ModelCatalog {
    pub fn load(dir: &Path) -> Option<Self> {
        let bytes = std::fs::read(dir.join(CATALOG_FILE)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let tmp = dir.join(format!("{CATALOG_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(tmp, dir.join(CATALOG_FILE))?;
        Ok(())
    }
}

pub fn size_within_tolerance(expected: u64, actual: u64) -> bool {
    if expected == 0 {
        return true;
    }
    let delta = expected.abs_diff(actual) as f64;
    delta <= expected as f64 * SIZE_TOLERANCE
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

struct ArtifactSpec<'a> {
    name: &'a str,
    path: Option<&'a PathBuf>,
    url: Option<&'a str>,
    expected_size: u64,
    sha256: Option<&'a str>,
}

/// Ensures both model artifacts exist locally, downloading as needed.
/// Returns name → path for the session registry. A model that cannot be
/// made available is recorded as such and omitted; failure is per model.
pub async fn ensure_models(
    cfg: &ModelConfig,
    models_dir: &Path,
) -> Result<HashMap<String, PathBuf>, ModelError> {
    std::fs::create_dir_all(models_dir)?;

    let specs = [
        ArtifactSpec {
            name: &cfg.detector_name,
            path: cfg.detector_path.as_ref(),
            url: cfg.detector_url.as_deref(),
            expected_size: cfg.detector_size_bytes,
            sha256: cfg.detector_sha256.as_deref(),
        },
        ArtifactSpec {
            name: &cfg.describer_name,
            path: cfg.describer_path.as_ref(),
            url: cfg.describer_url.as_deref(),
            expected_size: cfg.describer_size_bytes,
            sha256: cfg.describer_sha256.as_deref(),
        },
    ];

    let mut available = HashMap::new();
    let mut entries = Vec::new();
    for spec in &specs {
        match ensure_artifact(spec, models_dir).await {
            Ok(path) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                entries.push(CatalogEntry {
                    name: spec.name.to_string(),
                    path: path.clone(),
                    size_bytes: size,
                    available: true,
                    sha256: spec.sha256.map(str::to_string),
                });
                available.insert(spec.name.to_string(), path);
            }
            Err(e) => {
                warn!(model = spec.name, error = %e, "model artifact unavailable");
                entries.push(CatalogEntry {
                    name: spec.name.to_string(),
                    path: spec
                        .path
                        .cloned()
                        .unwrap_or_else(|| models_dir.join(format!("{}.onnx", spec.name))),
                    size_bytes: 0,
                    available: false,
                    sha256: spec.sha256.map(str::to_string),
                });
            }
        }
    }

    let catalog = ModelCatalog {
        written_at: Utc::now(),
        models: entries,
    };
    catalog.save(models_dir)?;
    Ok(available)
}

async fn ensure_artifact(spec: &ArtifactSpec<'_>, models_dir: &Path) -> Result<PathBuf, ModelError> {
    let path = spec
        .path
        .cloned()
        .unwrap_or_else(|| models_dir.join(format!("{}.onnx", spec.name)));

    if path.exists() {
        return Ok(path);
    }

    let Some(url) = spec.url else {
        return Err(ModelError::Missing {
            name: spec.name.to_string(),
        });
    };

    info!(model = spec.name, url, "fetching model artifact");
    let response = reqwest::get(url).await.map_err(|e| ModelError::Download {
        name: spec.name.to_string(),
        reason: e.to_string(),
    })?;
    if !response.status().is_success() {
        return Err(ModelError::Download {
            name: spec.name.to_string(),
            reason: format!("status {}", response.status()),
        });
    }
    let bytes = response.bytes().await.map_err(|e| ModelError::Download {
        name: spec.name.to_string(),
        reason: e.to_string(),
    })?;

    if !size_within_tolerance(spec.expected_size, bytes.len() as u64) {
        return Err(ModelError::SizeMismatch {
            name: spec.name.to_string(),
            expected: spec.expected_size,
            actual: bytes.len() as u64,
        });
    }
    if let Some(expected_hash) = spec.sha256 {
        if !sha256_hex(&bytes).eq_ignore_ascii_case(expected_hash) {
            return Err(ModelError::HashMismatch {
                name: spec.name.to_string(),
            });
        }
    }

    let tmp = path.with_extension("onnx.partial");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, &path)?;
    info!(model = spec.name, path = ?path, bytes = bytes.len(), "model artifact cached");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_tolerance_allows_ten_percent() {
        assert!(size_within_tolerance(1000, 1000));
        assert!(size_within_tolerance(1000, 1100));
        assert!(size_within_tolerance(1000, 900));
        assert!(!size_within_tolerance(1000, 1101));
        assert!(!size_within_tolerance(1000, 880));
        assert!(size_within_tolerance(0, 12345));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn catalog_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ModelCatalog {
            written_at: Utc::now(),
            models: vec![CatalogEntry {
                name: "detector-int8".into(),
                path: dir.path().join("detector-int8.onnx"),
                size_bytes: 6 * 1024 * 1024,
                available: true,
                sha256: None,
            }],
        };
        catalog.save(dir.path()).unwrap();
        let loaded = ModelCatalog::load(dir.path()).unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert!(loaded.models[0].available);
    }

    #[tokio::test]
    async fn existing_artifact_is_used_without_url() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig {
            detector_path: Some(dir.path().join("det.onnx")),
            describer_path: Some(dir.path().join("desc.onnx")),
            ..ModelConfig::default()
        };
        std::fs::write(dir.path().join("det.onnx"), b"model").unwrap();
        std::fs::write(dir.path().join("desc.onnx"), b"model").unwrap();

        let available = ensure_models(&cfg, dir.path()).await.unwrap();
        assert_eq!(available.len(), 2);
        assert!(ModelCatalog::load(dir.path()).unwrap().models.iter().all(|m| m.available));
    }

    #[tokio::test]
    async fn missing_artifact_without_url_is_reported_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig::default();
        let available = ensure_models(&cfg, dir.path()).await.unwrap();
        assert!(available.is_empty());
        let catalog = ModelCatalog::load(dir.path()).unwrap();
        assert!(catalog.models.iter().all(|m| !m.available));
    }
}
