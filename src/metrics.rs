//! Windowed metrics aggregation.
//!
//! Detections are reduced into wall-aligned windows (default five
//! minutes): per-class count statistics, processing-time percentiles, and
//! an entropy-coded payload of compact per-detection records. Building a
//! window from the same input set twice yields byte-identical output.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::inference::{is_person, is_vehicle, label_for};
use crate::types::{ClassStats, Detection, MetricWindow};

pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Estimated bytes one detection would occupy as a standalone serialized
/// row; the baseline for the compression ratio.
const RAW_DETECTION_ESTIMATE: usize = 300;

/// Packed per-detection record: timestamp-ms i64, class u16, confidence
/// u16 (×10 000), bbox 4×u16 (×10 000), frame u32, zone u8.
pub const PACKED_RECORD_BYTES: usize = 8 + 2 + 2 + 4 * 2 + 4 + 1;

/// Wall-aligned window start: `floor(t / d) * d`.
pub fn window_start(ts: DateTime<Utc>, duration_secs: u64) -> DateTime<Utc> {
    let d = duration_secs as i64;
    let aligned = ts.timestamp().div_euclid(d) * d;
    Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackedDetection {
    pub timestamp_ms: i64,
    pub class_id: u16,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub frame_no: u32,
    pub zone: u8,
}

fn quantize(v: f32) -> u16 {
    (v.clamp(0.0, 1.0) * 10_000.0).round() as u16
}

fn dequantize(v: u16) -> f32 {
    f32::from(v) / 10_000.0
}

/// Packs sorted detection records and entropy-codes them.
pub fn pack_payload(records: &[PackedDetection]) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(records.len() * PACKED_RECORD_BYTES);
    for r in records {
        raw.extend_from_slice(&r.timestamp_ms.to_le_bytes());
        raw.extend_from_slice(&r.class_id.to_le_bytes());
        raw.extend_from_slice(&quantize(r.confidence).to_le_bytes());
        for c in r.bbox {
            raw.extend_from_slice(&quantize(c).to_le_bytes());
        }
        raw.extend_from_slice(&r.frame_no.to_le_bytes());
        raw.push(r.zone);
    }
    zstd::encode_all(raw.as_slice(), 0)
}

/// Decodes a payload produced by [`pack_payload`].
pub fn unpack_payload(bytes: &[u8]) -> std::io::Result<Vec<PackedDetection>> {
    let raw = zstd::decode_all(bytes)?;
    if raw.len() % PACKED_RECORD_BYTES != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "payload length is not a whole number of records",
        ));
    }
    let mut out = Vec::with_capacity(raw.len() / PACKED_RECORD_BYTES);
    for chunk in raw.chunks_exact(PACKED_RECORD_BYTES) {
        let ts = i64::from_le_bytes(chunk[0..8].try_into().expect("8-byte slice"));
        let class_id = u16::from_le_bytes(chunk[8..10].try_into().expect("2-byte slice"));
        let confidence = dequantize(u16::from_le_bytes(chunk[10..12].try_into().expect("2-byte slice")));
        let mut bbox = [0f32; 4];
        for (i, b) in bbox.iter_mut().enumerate() {
            let off = 12 + i * 2;
            *b = dequantize(u16::from_le_bytes(chunk[off..off + 2].try_into().expect("2-byte slice")));
        }
        let frame_no = u32::from_le_bytes(chunk[20..24].try_into().expect("4-byte slice"));
        let zone = chunk[24];
        out.push(PackedDetection {
            timestamp_ms: ts,
            class_id,
            confidence,
            bbox,
            frame_no,
            zone,
        });
    }
    Ok(out)
}

#[derive(Default)]
struct FrameCounts {
    counts: BTreeMap<u32, u32>,
}

#[derive(Default)]
struct Accumulator {
    samples: Vec<PackedDetection>,
    frames: Vec<FrameCounts>,
    processing_ms: Vec<f64>,
    key_frames: u64,
    errors: u64,
    cpu_sum: f64,
    temp_sum: f64,
    mem_sum: f64,
    resource_samples: u64,
}

/// Aggregates per-camera detections into wall-aligned windows.
pub struct WindowAggregator {
    duration_secs: u64,
    shed_raw: AtomicBool,
    open: Mutex<HashMap<(String, i64), Accumulator>>,
}

impl WindowAggregator {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            duration_secs,
            shed_raw: AtomicBool::new(false),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Under queue backpressure raw payloads are shed before enqueue.
    pub fn set_shed_raw(&self, shed: bool) {
        self.shed_raw.store(shed, Ordering::Relaxed);
    }

    pub fn shedding(&self) -> bool {
        self.shed_raw.load(Ordering::Relaxed)
    }

    /// Records one processed frame and its detections.
    pub fn record_frame(
        &self,
        camera_id: &str,
        ts: DateTime<Utc>,
        detections: &[Detection],
        processing_ms: f64,
        is_key_frame: bool,
    ) {
        let start = window_start(ts, self.duration_secs).timestamp();
        let mut open = self.open.lock();
        let acc = open
            .entry((camera_id.to_string(), start))
            .or_default();

        let mut counts = BTreeMap::new();
        for d in detections {
            *counts.entry(d.class_id).or_insert(0u32) += 1;
            acc.samples.push(PackedDetection {
                timestamp_ms: d.timestamp.timestamp_millis(),
                class_id: d.class_id.min(u32::from(u16::MAX)) as u16,
                confidence: d.confidence,
                bbox: [d.bbox.x1, d.bbox.y1, d.bbox.x2, d.bbox.y2],
                frame_no: d.frame_no.min(u64::from(u32::MAX)) as u32,
                zone: 0,
            });
        }
        acc.frames.push(FrameCounts { counts });
        acc.processing_ms.push(processing_ms);
        if is_key_frame {
            acc.key_frames += 1;
        }
    }

    pub fn record_error(&self, camera_id: &str, ts: DateTime<Utc>) {
        let start = window_start(ts, self.duration_secs).timestamp();
        let mut open = self.open.lock();
        open.entry((camera_id.to_string(), start)).or_default().errors += 1;
    }

    /// Applies a resource reading to every open window.
    pub fn record_resources(&self, cpu_percent: f32, cpu_temp_c: f32, memory_mb: f64) {
        let mut open = self.open.lock();
        for acc in open.values_mut() {
            acc.cpu_sum += f64::from(cpu_percent);
            acc.temp_sum += f64::from(cpu_temp_c);
            acc.mem_sum += memory_mb;
            acc.resource_samples += 1;
        }
    }

    /// Finalizes every window that ended at or before `now`, in
    /// window-start order per camera.
    pub fn flush_ready(&self, now: DateTime<Utc>) -> Vec<MetricWindow> {
        self.flush_where(|start, duration| start + duration as i64 <= now.timestamp())
    }

    /// Finalizes everything; used on shutdown.
    pub fn flush_all(&self) -> Vec<MetricWindow> {
        self.flush_where(|_, _| true)
    }

    fn flush_where(&self, ready: impl Fn(i64, u64) -> bool) -> Vec<MetricWindow> {
        let mut taken = Vec::new();
        {
            let mut open = self.open.lock();
            let keys: Vec<(String, i64)> = open
                .keys()
                .filter(|(_, start)| ready(*start, self.duration_secs))
                .cloned()
                .collect();
            for key in keys {
                if let Some(acc) = open.remove(&key) {
                    taken.push((key, acc));
                }
            }
        }

        taken.sort_by(|a, b| a.0.cmp(&b.0));
        taken
            .into_iter()
            .map(|((camera_id, start), acc)| {
                self.finalize(camera_id, start, acc)
            })
            .collect()
    }

    fn finalize(&self, camera_id: String, start: i64, mut acc: Accumulator) -> MetricWindow {
        // Deterministic output for a given input set.
        acc.samples.sort_by(|a, b| {
            (a.timestamp_ms, a.frame_no, a.class_id)
                .cmp(&(b.timestamp_ms, b.frame_no, b.class_id))
        });

        let frames = acc.frames.len() as u64;
        let people = class_stats(&acc.frames, |c| is_person(c));
        let vehicles = class_stats(&acc.frames, |c| is_vehicle(c));

        let mut other_classes: BTreeMap<String, ClassStats> = BTreeMap::new();
        let mut other_ids: Vec<u32> = acc
            .frames
            .iter()
            .flat_map(|f| f.counts.keys().copied())
            .filter(|&c| !is_person(c) && !is_vehicle(c))
            .collect();
        other_ids.sort_unstable();
        other_ids.dedup();
        for class_id in other_ids {
            other_classes.insert(
                label_for(class_id).to_string(),
                class_stats(&acc.frames, |c| c == class_id),
            );
        }

        let mut times = acc.processing_ms.clone();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };
        let p95 = percentile(&times, 0.95);
        let max = times.last().copied().unwrap_or(0.0);

        let (raw_payload, compression_ratio) = if self.shedding() || acc.samples.is_empty() {
            (None, 0.0)
        } else {
            match pack_payload(&acc.samples) {
                Ok(compressed) => {
                    let raw = acc.samples.len() * RAW_DETECTION_ESTIMATE;
                    let ratio = raw as f32 / compressed.len().max(1) as f32;
                    (Some(compressed), ratio)
                }
                Err(e) => {
                    warn!(camera = %camera_id, error = %e, "payload packing failed");
                    (None, 0.0)
                }
            }
        };

        let resource_div = acc.resource_samples.max(1) as f64;
        MetricWindow {
            window_start: Utc
                .timestamp_opt(start, 0)
                .single()
                .unwrap_or_else(Utc::now),
            duration_secs: self.duration_secs,
            camera_id,
            sample_count: acc.samples.len() as u64,
            people,
            vehicles,
            other_classes,
            processing_ms_avg: avg,
            processing_ms_p95: p95,
            processing_ms_max: max,
            frames_processed: frames,
            key_frames_processed: acc.key_frames,
            error_count: acc.errors,
            cpu_percent_avg: (acc.cpu_sum / resource_div) as f32,
            cpu_temp_avg: (acc.temp_sum / resource_div) as f32,
            memory_mb_avg: acc.mem_sum / resource_div,
            raw_payload,
            compression_ratio,
            synced: false,
        }
    }
}

impl Default for WindowAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }
}

/// Per-frame count statistics over the classes selected by `select`.
fn class_stats(frames: &[FrameCounts], select: impl Fn(u32) -> bool) -> ClassStats {
    if frames.is_empty() {
        return ClassStats::default();
    }
    let mut total = 0u64;
    let mut max = 0u32;
    let mut min = u32::MAX;
    for frame in frames {
        let count: u32 = frame
            .counts
            .iter()
            .filter(|(&c, _)| select(c))
            .map(|(_, &n)| n)
            .sum();
        total += u64::from(count);
        max = max.max(count);
        min = min.min(count);
    }
    ClassStats {
        avg: total as f32 / frames.len() as f32,
        max,
        min,
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn det(class_id: u32, frame_no: u64, ts: DateTime<Utc>) -> Detection {
        Detection {
            class_id,
            label: label_for(class_id).to_string(),
            confidence: 0.8,
            bbox: BoundingBox { x1: 0.1, y1: 0.2, x2: 0.3, y2: 0.4 },
            camera_id: "cam".into(),
            frame_no,
            timestamp: ts,
            key_frame_id: None,
        }
    }

    #[test]
    fn window_start_aligns_to_duration() {
        let ts = Utc.timestamp_opt(1_700_000_123, 0).unwrap();
        let start = window_start(ts, 300);
        assert_eq!(start.timestamp() % 300, 0);
        assert!(start <= ts);
        assert!(ts.timestamp() - start.timestamp() < 300);
    }

    #[test]
    fn payload_round_trips() {
        let records = vec![
            PackedDetection {
                timestamp_ms: 1_700_000_000_123,
                class_id: 0,
                confidence: 0.87,
                bbox: [0.1, 0.2, 0.3, 0.4],
                frame_no: 42,
                zone: 0,
            },
            PackedDetection {
                timestamp_ms: 1_700_000_003_456,
                class_id: 2,
                confidence: 0.5,
                bbox: [0.0, 0.0, 1.0, 1.0],
                frame_no: 43,
                zone: 1,
            },
        ];
        let packed = pack_payload(&records).unwrap();
        let unpacked = unpack_payload(&packed).unwrap();
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked[0].frame_no, 42);
        assert!((unpacked[0].confidence - 0.87).abs() < 1e-3);
        assert_eq!(unpacked[1].zone, 1);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let build = || {
            let agg = WindowAggregator::new(300);
            // Window-aligned timestamps so one window holds everything.
            let base = window_start(at(0), 300);
            for f in 0..10u64 {
                let ts = base + chrono::Duration::seconds(f as i64 * 3);
                let dets = vec![det(0, f, ts), det(2, f, ts)];
                agg.record_frame("cam", ts, &dets, 12.0, f % 3 == 0);
            }
            let mut windows = agg.flush_all();
            assert_eq!(windows.len(), 1);
            windows.pop().unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.raw_payload, b.raw_payload);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn windows_do_not_overlap_and_emit_in_order() {
        let agg = WindowAggregator::new(300);
        let base = window_start(at(0), 300);
        let in_first = base + chrono::Duration::seconds(10);
        let in_second = base + chrono::Duration::seconds(310);
        agg.record_frame("cam", in_second, &[det(0, 2, in_second)], 5.0, false);
        agg.record_frame("cam", in_first, &[det(0, 1, in_first)], 5.0, false);

        let windows = agg.flush_all();
        assert_eq!(windows.len(), 2);
        assert!(windows[0].window_start < windows[1].window_start);
        assert_eq!(
            windows[0].window_start + chrono::Duration::seconds(300),
            windows[1].window_start
        );
        for w in &windows {
            assert_eq!(w.window_start.timestamp() % w.duration_secs as i64, 0);
        }
    }

    #[test]
    fn flush_ready_keeps_open_window() {
        let agg = WindowAggregator::new(300);
        let base = window_start(at(0), 300);
        let ts = base + chrono::Duration::seconds(10);
        agg.record_frame("cam", ts, &[det(0, 1, ts)], 5.0, false);

        // Window still open at +200 s.
        assert!(agg.flush_ready(base + chrono::Duration::seconds(200)).is_empty());
        // Closed once the boundary passes.
        let flushed = agg.flush_ready(base + chrono::Duration::seconds(300));
        assert_eq!(flushed.len(), 1);
    }

    #[test]
    fn class_stats_split_named_groups() {
        let agg = WindowAggregator::new(300);
        let base = window_start(at(0), 300);
        let ts = base + chrono::Duration::seconds(5);
        // Frame 1: two people, one car, one dog. Frame 2: one person.
        agg.record_frame(
            "cam",
            ts,
            &[det(0, 1, ts), det(0, 1, ts), det(2, 1, ts), det(16, 1, ts)],
            5.0,
            false,
        );
        let ts2 = base + chrono::Duration::seconds(8);
        agg.record_frame("cam", ts2, &[det(0, 2, ts2)], 5.0, false);

        let w = agg.flush_all().pop().unwrap();
        assert_eq!(w.people.max, 2);
        assert_eq!(w.people.min, 1);
        assert!((w.people.avg - 1.5).abs() < 1e-6);
        assert_eq!(w.vehicles.max, 1);
        assert_eq!(w.vehicles.min, 0);
        assert_eq!(w.other_classes.len(), 1);
        assert!(w.other_classes.contains_key("dog"));
    }

    #[test]
    fn shedding_elides_raw_payload() {
        let agg = WindowAggregator::new(300);
        agg.set_shed_raw(true);
        let ts = at(0);
        agg.record_frame("cam", ts, &[det(0, 1, ts)], 5.0, false);
        let w = agg.flush_all().pop().unwrap();
        assert!(w.raw_payload.is_none());
        assert_eq!(w.sample_count, 1);
    }

    #[test]
    fn percentile_is_nearest_rank() {
        let times: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&times, 0.95), 95.0);
        assert_eq!(percentile(&[7.0], 0.95), 7.0);
    }

    #[test]
    fn compression_ratio_reaches_target_on_typical_load() {
        let agg = WindowAggregator::new(300);
        let base = window_start(at(0), 300);
        // Five minutes at ~2 detections/s.
        for i in 0..300u64 {
            let ts = base + chrono::Duration::seconds(i as i64);
            agg.record_frame("cam", ts, &[det(0, i, ts), det(2, i, ts)], 8.0, false);
        }
        let w = agg.flush_all().pop().unwrap();
        assert!(
            w.compression_ratio >= 100.0,
            "expected >=100:1, got {}",
            w.compression_ratio
        );
    }
}
