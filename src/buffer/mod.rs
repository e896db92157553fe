//! Pooled byte buffers and per-camera frame rings.

mod pool;
mod ring;

pub use pool::{BufferPool, PoolStats, PooledBuf};
pub use ring::{FrameRing, RingStats, DEFAULT_CAPACITY, DEFAULT_MAX_AGE};
