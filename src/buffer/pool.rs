//! Size-classed byte buffer pool.
//!
//! Steady-state throughput is a few frames per second per camera at ~900 KB
//! each; renting from free lists instead of allocating keeps the heap flat
//! over days of uptime. Buffers are zeroed on return so a stage can never
//! observe another stage's pixels.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Power-of-two size classes from 4 KB up to 1 MB. A 640×480 BGR frame
/// (921 600 bytes) lands in the top class.
const CLASS_SIZES: &[usize] = &[
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
];

/// Free buffers retained per class; beyond this, returns are dropped.
const MAX_FREE_PER_CLASS: usize = 40;

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub rents: u64,
    pub returns: u64,
    pub hits: u64,
    pub oversize: u64,
    /// Buffers currently held by callers.
    pub outstanding: u64,
}

struct Inner {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    rents: AtomicU64,
    returns: AtomicU64,
    hits: AtomicU64,
    oversize: AtomicU64,
}

/// Shared pool handle. Cheap to clone; all clones feed the same free lists.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                classes: CLASS_SIZES.iter().map(|_| Mutex::new(Vec::new())).collect(),
                rents: AtomicU64::new(0),
                returns: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                oversize: AtomicU64::new(0),
            }),
        }
    }

    /// Rents a zeroed buffer of at least `len` bytes. Requests larger than
    /// the top class bypass the pool entirely.
    pub fn rent(&self, len: usize) -> PooledBuf {
        self.inner.rents.fetch_add(1, Ordering::Relaxed);

        let Some(class) = class_for(len) else {
            self.inner.oversize.fetch_add(1, Ordering::Relaxed);
            return PooledBuf {
                data: vec![0u8; len],
                len,
                class: None,
                pool: self.clone(),
            };
        };

        let data = {
            let mut free = self.inner.classes[class].lock();
            free.pop()
        };

        let data = match data {
            Some(buf) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => vec![0u8; CLASS_SIZES[class]],
        };

        PooledBuf {
            data,
            len,
            class: Some(class),
            pool: self.clone(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let rents = self.inner.rents.load(Ordering::Relaxed);
        let returns = self.inner.returns.load(Ordering::Relaxed);
        PoolStats {
            rents,
            returns,
            hits: self.inner.hits.load(Ordering::Relaxed),
            oversize: self.inner.oversize.load(Ordering::Relaxed),
            outstanding: rents.saturating_sub(returns),
        }
    }

    /// Drops every free buffer. Used by the watchdog's reclamation step.
    pub fn clear(&self) {
        for class in &self.inner.classes {
            class.lock().clear();
        }
    }

    fn give_back(&self, mut data: Vec<u8>, class: Option<usize>) {
        self.inner.returns.fetch_add(1, Ordering::Relaxed);
        let Some(class) = class else {
            return; // oversize buffers are freed, not pooled
        };

        data.fill(0);
        let mut free = self.inner.classes[class].lock();
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(data);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn class_for(len: usize) -> Option<usize> {
    CLASS_SIZES.iter().position(|&size| len <= size)
}

/// A rented buffer. Derefs to exactly the requested length; the backing
/// allocation returns to the pool on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    len: usize,
    class: Option<usize>,
    pool: BufferPool,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.give_back(data, self.class);
    }
}
