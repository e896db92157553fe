//! Per-camera bounded frame ring.
//!
//! Single producer (capture worker), single consumer (batch scheduler).
//! Capacity and age are both bounded: the ring never holds more than
//! `capacity` frames, and any frame older than `max_age` is evicted on
//! access. Evicted frames drop, which returns their buffers to the pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::RawFrame;

pub const DEFAULT_CAPACITY: usize = 30;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct RingStats {
    pub pushed: u64,
    pub taken: u64,
    pub evicted_full: u64,
    pub evicted_stale: u64,
}

struct Slot {
    frame: RawFrame,
    arrived: Instant,
}

struct Inner {
    slots: VecDeque<Slot>,
    stats: RingStats,
}

/// Bounded ring of recent frames for one camera.
pub struct FrameRing {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    max_age: Duration,
}

impl FrameRing {
    pub fn new(capacity: usize, max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                stats: RingStats::default(),
            }),
            notify: Notify::new(),
            capacity,
            max_age,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }

    /// Inserts a frame, evicting the oldest when full.
    pub fn push(&self, frame: RawFrame) {
        {
            let mut inner = self.inner.lock();
            Self::evict_stale(&mut inner, self.max_age);
            if inner.slots.len() >= self.capacity {
                inner.slots.pop_front();
                inner.stats.evicted_full += 1;
            }
            inner.slots.push_back(Slot {
                frame,
                arrived: Instant::now(),
            });
            inner.stats.pushed += 1;
        }
        self.notify.notify_one();
    }

    /// Removes and returns the newest frame at least `min_age` old, waiting
    /// up to `deadline`. Returns `None` when the deadline passes without an
    /// eligible frame.
    pub async fn take(&self, min_age: Duration, deadline: Duration) -> Option<RawFrame> {
        let until = Instant::now() + deadline;
        loop {
            if let Some(frame) = self.try_take(min_age) {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            // Woken by push, or re-check periodically so age floors expire.
            let _ = tokio::time::timeout(
                (until - now).min(Duration::from_millis(100)),
                self.notify.notified(),
            )
            .await;
        }
    }

    /// Non-blocking variant of [`take`](Self::take).
    pub fn try_take(&self, min_age: Duration) -> Option<RawFrame> {
        let mut inner = self.inner.lock();
        Self::evict_stale(&mut inner, self.max_age);

        // Newest-first: fresher frames are worth more than strict FIFO here.
        let idx = inner
            .slots
            .iter()
            .rposition(|s| s.arrived.elapsed() >= min_age)?;
        let slot = inner.slots.remove(idx)?;
        inner.stats.taken += 1;
        Some(slot.frame)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RingStats {
        self.inner.lock().stats.clone()
    }

    /// Drops all resident frames, returning their buffers.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
    }

    fn evict_stale(inner: &mut Inner, max_age: Duration) {
        while let Some(front) = inner.slots.front() {
            if front.arrived.elapsed() > max_age {
                inner.slots.pop_front();
                inner.stats.evicted_stale += 1;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use chrono::Utc;

    fn frame(pool: &BufferPool, n: u64) -> RawFrame {
        RawFrame {
            camera_id: "cam".into(),
            frame_no: n,
            captured_at: Utc::now(),
            pixels: pool.rent(64),
            key_frame_candidate: false,
        }
    }

    #[tokio::test]
    async fn push_then_take_returns_newest() {
        let pool = BufferPool::new();
        let ring = FrameRing::with_defaults();
        ring.push(frame(&pool, 1));
        ring.push(frame(&pool, 2));
        let got = ring.take(Duration::ZERO, Duration::from_millis(10)).await;
        assert_eq!(got.unwrap().frame_no, 2);
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let pool = BufferPool::new();
        let ring = FrameRing::new(3, DEFAULT_MAX_AGE);
        for n in 0..5 {
            ring.push(frame(&pool, n));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.stats().evicted_full, 2);
        // Oldest survivors are 2, 3, 4.
        let newest = ring.try_take(Duration::ZERO).unwrap();
        assert_eq!(newest.frame_no, 4);
    }

    #[tokio::test]
    async fn stale_frames_evicted_on_access() {
        let pool = BufferPool::new();
        let ring = FrameRing::new(10, Duration::from_millis(20));
        ring.push(frame(&pool, 1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ring.try_take(Duration::ZERO).is_none());
        assert_eq!(ring.stats().evicted_stale, 1);
    }

    #[tokio::test]
    async fn take_honors_deadline_when_empty() {
        let ring = FrameRing::with_defaults();
        let start = Instant::now();
        let got = ring.take(Duration::ZERO, Duration::from_millis(50)).await;
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn take_wakes_on_push() {
        let pool = BufferPool::new();
        let ring = FrameRing::with_defaults();
        let ring2 = Arc::clone(&ring);
        let waiter = tokio::spawn(async move {
            ring2.take(Duration::ZERO, Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.push(frame(&pool, 7));
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().frame_no, 7);
    }

    #[tokio::test]
    async fn eviction_returns_buffers_to_pool() {
        let pool = BufferPool::new();
        let ring = FrameRing::new(2, DEFAULT_MAX_AGE);
        for n in 0..4 {
            ring.push(frame(&pool, n));
        }
        // 2 evicted, 2 resident.
        assert_eq!(pool.stats().outstanding, 2);
        ring.drain();
        assert_eq!(pool.stats().outstanding, 0);
    }
}
