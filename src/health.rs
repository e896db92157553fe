//! Health probe.
//!
//! Aggregates resource readings, camera availability and sync-queue depth
//! into a healthy/degraded/unhealthy verdict with a reason string.

use serde::Serialize;
use sysinfo::{Components, Disks, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthReadings {
    pub memory_mb: u64,
    pub cpu_percent: f32,
    pub temperature_c: Option<f32>,
    pub cameras_online: usize,
    pub cameras_total: usize,
    pub sync_queue_len: usize,
    pub free_disk_mb: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub degraded_memory_mb: u64,
    pub unhealthy_memory_mb: u64,
    pub degraded_temp_c: f32,
    pub unhealthy_temp_c: f32,
    pub degraded_queue: usize,
    pub unhealthy_queue: usize,
    pub min_camera_fraction: f64,
    pub min_free_disk_mb: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_memory_mb: 5000,
            unhealthy_memory_mb: 6000,
            degraded_temp_c: 65.0,
            unhealthy_temp_c: 75.0,
            degraded_queue: 500,
            unhealthy_queue: 1000,
            min_camera_fraction: 0.5,
            min_free_disk_mb: 1024,
        }
    }
}

/// Pure verdict over a set of readings.
pub fn evaluate(readings: &HealthReadings, t: &HealthThresholds) -> HealthReport {
    let temp = readings.temperature_c.unwrap_or(0.0);
    let camera_fraction = if readings.cameras_total == 0 {
        1.0
    } else {
        readings.cameras_online as f64 / readings.cameras_total as f64
    };

    if readings.memory_mb > t.unhealthy_memory_mb {
        return unhealthy(format!("memory {} MB over limit", readings.memory_mb));
    }
    if temp >= t.unhealthy_temp_c {
        return unhealthy(format!("cpu temperature {temp:.1} C"));
    }
    if readings.sync_queue_len > t.unhealthy_queue {
        return unhealthy(format!("sync queue depth {}", readings.sync_queue_len));
    }
    if camera_fraction < t.min_camera_fraction {
        return unhealthy(format!(
            "only {}/{} cameras online",
            readings.cameras_online, readings.cameras_total
        ));
    }

    if readings.memory_mb > t.degraded_memory_mb {
        return degraded(format!("memory {} MB elevated", readings.memory_mb));
    }
    if temp >= t.degraded_temp_c {
        return degraded(format!("cpu temperature {temp:.1} C elevated"));
    }
    if readings.sync_queue_len > t.degraded_queue {
        return degraded(format!("sync queue backlog {}", readings.sync_queue_len));
    }
    if readings.free_disk_mb < t.min_free_disk_mb {
        return degraded(format!("free disk {} MB low", readings.free_disk_mb));
    }

    HealthReport {
        state: HealthState::Healthy,
        reason: "ok".to_string(),
    }
}

fn degraded(reason: String) -> HealthReport {
    HealthReport {
        state: HealthState::Degraded,
        reason,
    }
}

fn unhealthy(reason: String) -> HealthReport {
    HealthReport {
        state: HealthState::Unhealthy,
        reason,
    }
}

/// System-backed resource sampler.
pub struct ResourceProbe {
    system: System,
    components: Components,
    disks: Disks,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub temperature_c: Option<f32>,
    pub free_disk_mb: u64,
}

impl ResourceProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            components: Components::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        self.components.refresh();
        self.disks.refresh();

        let temperature_c = self
            .components
            .iter()
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .fold(None, |acc: Option<f32>, t| Some(acc.map_or(t, |a| a.max(t))));

        let free_disk_mb = self
            .disks
            .iter()
            .map(|d| d.available_space() / (1024 * 1024))
            .min()
            .unwrap_or(0);

        ResourceSample {
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
            memory_mb: self.system.used_memory() / (1024 * 1024),
            temperature_c,
            free_disk_mb,
        }
    }
}

impl Default for ResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings() -> HealthReadings {
        HealthReadings {
            memory_mb: 2000,
            cpu_percent: 30.0,
            temperature_c: Some(50.0),
            cameras_online: 4,
            cameras_total: 5,
            sync_queue_len: 10,
            free_disk_mb: 50_000,
        }
    }

    #[test]
    fn nominal_readings_are_healthy() {
        let report = evaluate(&readings(), &HealthThresholds::default());
        assert_eq!(report.state, HealthState::Healthy);
    }

    #[test]
    fn memory_thresholds() {
        let mut r = readings();
        r.memory_mb = 5200;
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Degraded);
        r.memory_mb = 6500;
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Unhealthy);
    }

    #[test]
    fn temperature_thresholds() {
        let mut r = readings();
        r.temperature_c = Some(66.0);
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Degraded);
        r.temperature_c = Some(75.0);
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Unhealthy);
    }

    #[test]
    fn queue_thresholds() {
        let mut r = readings();
        r.sync_queue_len = 600;
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Degraded);
        r.sync_queue_len = 1500;
        let report = evaluate(&r, &HealthThresholds::default());
        assert_eq!(report.state, HealthState::Unhealthy);
        assert!(report.reason.contains("queue"));
    }

    #[test]
    fn camera_fraction_threshold() {
        let mut r = readings();
        r.cameras_online = 2;
        r.cameras_total = 5;
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Unhealthy);
        // No cameras configured is not a failure.
        r.cameras_online = 0;
        r.cameras_total = 0;
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Healthy);
    }

    #[test]
    fn low_disk_degrades() {
        let mut r = readings();
        r.free_disk_mb = 100;
        let report = evaluate(&r, &HealthThresholds::default());
        assert_eq!(report.state, HealthState::Degraded);
        assert!(report.reason.contains("disk"));
    }

    #[test]
    fn exact_camera_half_is_healthy() {
        let mut r = readings();
        r.cameras_online = 1;
        r.cameras_total = 2;
        assert_eq!(evaluate(&r, &HealthThresholds::default()).state, HealthState::Healthy);
    }
}
