//! Shared inference sessions.
//!
//! One session exists per model name for the whole process, and a single
//! run lock serializes every forward pass regardless of which session it
//! goes through. Two sessions at once exceeded physical memory on the
//! target hardware; sequential execution also bounds the working set.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model {name:?} unavailable: {reason}")]
    ModelUnavailable { name: String, reason: String },

    #[error("inference run failed: {0}")]
    Run(String),

    #[error("unexpected model output: {0}")]
    Output(String),
}

/// A loaded vision model. The trait seam keeps the scheduler and tests
/// independent of the concrete runtime.
pub trait VisionModel: Send {
    fn run(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, InferenceError>;
}

/// ONNX model executed through tract.
pub struct OnnxModel {
    plan: TypedRunnableModel<TypedModel>,
}

impl OnnxModel {
    pub fn load(name: &str, path: &Path) -> Result<Self, InferenceError> {
        let unavailable = |e: TractError| InferenceError::ModelUnavailable {
            name: name.to_string(),
            reason: e.to_string(),
        };
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(unavailable)?
            .into_optimized()
            .map_err(unavailable)?
            .into_runnable()
            .map_err(unavailable)?;
        info!(model = name, path = ?path, "model loaded");
        Ok(Self { plan })
    }
}

impl VisionModel for OnnxModel {
    fn run(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, InferenceError> {
        let inputs: TVec<TValue> = inputs.into_iter().map(|t| t.into()).collect();
        let outputs = self
            .plan
            .run(inputs)
            .map_err(|e| InferenceError::Run(e.to_string()))?;
        Ok(outputs.into_iter().map(|v| v.into_tensor()).collect())
    }
}

/// The process-wide handle for one model.
pub struct InferenceSession {
    name: String,
    model: Mutex<Box<dyn VisionModel>>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    soft_limit: Duration,
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("name", &self.name)
            .field("soft_limit", &self.soft_limit)
            .finish()
    }
}

impl InferenceSession {
    /// Runs one forward pass under the global inference lock. Callers must
    /// not hold the lock across disk or network waits; the lock is scoped
    /// entirely inside this call.
    pub async fn run(&self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, InferenceError> {
        let _serial = self.run_lock.lock().await;
        let started = Instant::now();
        let result = self.model.lock().run(inputs);
        let elapsed = started.elapsed();
        if elapsed > self.soft_limit {
            warn!(
                model = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = self.soft_limit.as_millis() as u64,
                "inference exceeded soft limit"
            );
        }
        result
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Produces a model for a name; lets tests substitute stubs for artifacts.
pub type ModelLoader =
    Box<dyn Fn(&str) -> Result<Box<dyn VisionModel>, InferenceError> + Send + Sync>;

/// Owns every session and the single run lock they share.
pub struct SessionRegistry {
    loader: ModelLoader,
    sessions: Mutex<HashMap<String, Arc<InferenceSession>>>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SessionRegistry {
    pub fn new(loader: ModelLoader) -> Arc<Self> {
        Arc::new(Self {
            loader,
            sessions: Mutex::new(HashMap::new()),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Registry backed by ONNX artifacts on disk.
    pub fn with_artifacts(paths: HashMap<String, std::path::PathBuf>) -> Arc<Self> {
        Self::new(Box::new(move |name| {
            let path = paths.get(name).ok_or_else(|| InferenceError::ModelUnavailable {
                name: name.to_string(),
                reason: "no artifact configured".to_string(),
            })?;
            Ok(Box::new(OnnxModel::load(name, path)?) as Box<dyn VisionModel>)
        }))
    }

    /// Returns the shared session for `name`, creating it on first use.
    /// `warmup` supplies inputs for the amortizing dummy forward pass; a
    /// warm-up failure is logged, not fatal.
    pub fn session(
        &self,
        name: &str,
        soft_limit: Duration,
        warmup: Option<Vec<Tensor>>,
    ) -> Result<Arc<InferenceSession>, InferenceError> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(name) {
            return Ok(Arc::clone(existing));
        }

        // Construction guard: the map lock is held through the load so a
        // second caller can never race a duplicate session into existence.
        let mut model = (self.loader)(name)?;

        if let Some(inputs) = warmup {
            let started = Instant::now();
            match model.run(inputs) {
                Ok(_) => debug!(
                    model = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "warm-up pass complete"
                ),
                Err(e) => warn!(model = name, error = %e, "warm-up pass failed"),
            }
        }

        let session = Arc::new(InferenceSession {
            name: name.to_string(),
            model: Mutex::new(model),
            run_lock: Arc::clone(&self.run_lock),
            soft_limit,
        });
        sessions.insert(name.to_string(), Arc::clone(&session));
        Ok(session)
    }
}

/// Pool of `f32` staging buffers for tensor assembly, zeroed on return.
/// Cheap to clone; clones share the free lists.
#[derive(Clone)]
pub struct TensorPool {
    free: Arc<Mutex<HashMap<usize, Vec<Vec<f32>>>>>,
}

/// Buffers retained per distinct length.
const MAX_FREE_TENSORS: usize = 8;

impl TensorPool {
    pub fn new() -> Self {
        Self {
            free: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Rents a zeroed buffer sized for `shape`.
    pub fn rent(&self, shape: &[usize]) -> TensorBuf {
        let len = shape.iter().product();
        let data = self
            .free
            .lock()
            .get_mut(&len)
            .and_then(|list| list.pop())
            .unwrap_or_else(|| vec![0.0; len]);
        TensorBuf {
            data,
            shape: shape.to_vec(),
            pool: self.clone(),
        }
    }
}

impl Default for TensorPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Rented staging buffer; returns to the pool zeroed on drop.
pub struct TensorBuf {
    data: Vec<f32>,
    shape: Vec<usize>,
    pool: TensorPool,
}

impl TensorBuf {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Copies the staged data into a tract tensor.
    pub fn to_tensor(&self) -> Result<Tensor, InferenceError> {
        Tensor::from_shape(&self.shape, &self.data)
            .map_err(|e| InferenceError::Run(e.to_string()))
    }
}

impl std::ops::Deref for TensorBuf {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl std::ops::DerefMut for TensorBuf {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for TensorBuf {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        data.fill(0.0);
        let mut free = self.pool.free.lock();
        let list = free.entry(data.len()).or_default();
        if list.len() < MAX_FREE_TENSORS {
            list.push(data);
        }
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[test]
    fn distinct_shapes_use_distinct_free_lists() {
        let pool = TensorPool::new();
        drop(pool.rent(&[4]));
        drop(pool.rent(&[2, 2]));
        // Same length, either buffer serves.
        let a = pool.rent(&[4]);
        let b = pool.rent(&[4]);
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 4);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Deterministic stand-in model: echoes a fixed output, counts runs.
    pub struct StubModel {
        pub outputs: Vec<Tensor>,
        pub runs: Arc<std::sync::atomic::AtomicU64>,
        pub fail: bool,
    }

    impl VisionModel for StubModel {
        fn run(&mut self, _inputs: Vec<Tensor>) -> Result<Vec<Tensor>, InferenceError> {
            self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                return Err(InferenceError::Run("stub failure".to_string()));
            }
            Ok(self.outputs.clone())
        }
    }
}
