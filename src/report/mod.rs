//! Reduction of a finished tracking session into summary statistics and
//! chartable series.

pub mod render;

use crate::sample::{round_to, Sample};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MIN_REPORT_SAMPLES: usize = 10;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("not enough data: {have} samples collected, at least {need} required")]
    InsufficientData { have: usize, need: usize },
    #[error("failed to write report: {0}")]
    Render(#[from] std::io::Error),
    #[error("report generation did not finish within {0:?}")]
    Timeout(Duration),
    #[error("report generation was cancelled before it was saved")]
    Cancelled,
    #[error("report {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Stats {
    pub const ZERO: Stats = Stats {
        min: 0.0,
        max: 0.0,
        avg: 0.0,
    };

    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::ZERO;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Self {
            min: round_to(min, 2),
            max: round_to(max, 2),
            avg: round_to(avg, 2),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Metric {
    pub label: &'static str,
    pub stats: Stats,
    /// One value per sample, indexed by sample ordinal. Unknown readings are
    /// charted as gaps and never enter `stats`.
    pub series: Vec<Option<f64>>,
    pub charted: bool,
}

impl Metric {
    fn charted(label: &'static str, values: Vec<f64>) -> Self {
        Self {
            label,
            stats: Stats::of(&values),
            series: values.into_iter().map(Some).collect(),
            charted: true,
        }
    }

    fn readings(label: &'static str, readings: Vec<Option<f64>>) -> Self {
        let known: Vec<f64> = readings.iter().flatten().copied().collect();
        Self {
            label,
            stats: Stats::of(&known),
            series: readings,
            charted: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Section {
    pub title: &'static str,
    pub y_label: &'static str,
    pub metrics: Vec<Metric>,
}

impl Section {
    #[cfg(test)]
    pub fn metric(&self, label: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.label == label)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    pub started_at: String,
    pub ended_at: String,
    pub duration_secs: usize,
    pub data_points: usize,
    pub cpu: Section,
    pub memory: Section,
    pub network: Section,
    pub disk: Section,
    pub gpu: Section,
    /// The GPU section is rendered only when some sample had nonzero load.
    pub gpu_active: bool,
}

impl Report {
    pub fn sections(&self) -> Vec<&Section> {
        let mut sections = vec![&self.cpu, &self.memory, &self.network, &self.disk];
        if self.gpu_active {
            sections.push(&self.gpu);
        }
        sections
    }
}

/// Reduces a session into a [`Report`]. `min_samples` can raise the
/// threshold above [`MIN_REPORT_SAMPLES`] but never lower it.
pub fn reduce(samples: &[Arc<Sample>], min_samples: usize) -> Result<Report, ReportError> {
    let min_samples = min_samples.max(MIN_REPORT_SAMPLES);
    if samples.len() < min_samples {
        return Err(ReportError::InsufficientData {
            have: samples.len(),
            need: min_samples,
        });
    }

    let cpu = Section {
        title: "CPU",
        y_label: "Usage (%)",
        metrics: vec![
            Metric::charted("CPU usage (%)", column(samples, |s| s.cpu.usage_percent)),
            Metric::readings(
                "CPU temperature (°C)",
                readings(samples, |s| s.cpu.temperature_celsius),
            ),
        ],
    };

    let memory = Section {
        title: "Memory",
        y_label: "Value",
        metrics: vec![
            Metric::charted("Memory usage (%)", column(samples, |s| s.memory.usage_percent)),
            Metric::charted(
                "Memory used (GB)",
                column(samples, |s| s.memory.used_bytes as f64 / BYTES_PER_GB),
            ),
        ],
    };

    let network = Section {
        title: "Network traffic",
        y_label: "Throughput (Kbps)",
        metrics: vec![
            Metric::charted(
                "Upload (Kbps)",
                column(samples, |s| s.network.upload_bits_per_sec / 1024.0),
            ),
            Metric::charted(
                "Download (Kbps)",
                column(samples, |s| s.network.download_bits_per_sec / 1024.0),
            ),
        ],
    };

    let disk = Section {
        title: "Disk I/O",
        y_label: "Throughput (MB/s)",
        metrics: vec![
            Metric::charted(
                "Read (MB/s)",
                column(samples, |s| s.disk.read_bytes_per_sec / BYTES_PER_MB),
            ),
            Metric::charted(
                "Write (MB/s)",
                column(samples, |s| s.disk.write_bytes_per_sec / BYTES_PER_MB),
            ),
        ],
    };

    // The first GPU stands for the host; hosts without one read as zero load.
    let gpu_load = column(samples, |s| s.gpu.first().map_or(0.0, |g| g.load_percent));
    let gpu_active = gpu_load.iter().any(|v| *v > 0.0);
    let gpu = Section {
        title: "GPU",
        y_label: "Usage (%)",
        metrics: vec![
            Metric::charted("GPU load (%)", gpu_load),
            Metric::readings(
                "GPU temperature (°C)",
                readings(samples, |s| s.gpu.first().and_then(|g| g.temperature_celsius)),
            ),
            Metric::charted(
                "GPU memory (%)",
                column(samples, |s| s.gpu.first().map_or(0.0, |g| g.memory_percent)),
            ),
        ],
    };

    // Non-empty past the length check.
    let started_at = samples.first().map(|s| s.timestamp_rfc3339()).unwrap_or_default();
    let ended_at = samples.last().map(|s| s.timestamp_rfc3339()).unwrap_or_default();

    Ok(Report {
        started_at,
        ended_at,
        duration_secs: samples.len(),
        data_points: samples.len(),
        cpu,
        memory,
        network,
        disk,
        gpu,
        gpu_active,
    })
}

fn column(samples: &[Arc<Sample>], f: impl Fn(&Sample) -> f64) -> Vec<f64> {
    samples.iter().map(|s| round_to(f(s.as_ref()), 2)).collect()
}

fn readings(samples: &[Arc<Sample>], f: impl Fn(&Sample) -> Option<f64>) -> Vec<Option<f64>> {
    samples.iter().map(|s| f(s.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::GpuRecord;
    use std::time::SystemTime;

    fn samples_with(n: usize, f: impl Fn(usize, &mut Sample)) -> Vec<Arc<Sample>> {
        (0..n)
            .map(|i| {
                let mut s = Sample::empty(SystemTime::now());
                f(i, &mut s);
                Arc::new(s)
            })
            .collect()
    }

    fn gpu(load: f64, temp: Option<f64>) -> GpuRecord {
        GpuRecord {
            id: "0".to_string(),
            name: "Test GPU".to_string(),
            load_percent: load,
            memory_used_mb: 512.0,
            memory_total_mb: 2048.0,
            memory_percent: 25.0,
            temperature_celsius: temp,
            driver: "1.0".to_string(),
        }
    }

    #[test]
    fn nine_samples_are_insufficient() {
        let samples = samples_with(9, |_, _| {});
        let err = reduce(&samples, MIN_REPORT_SAMPLES).unwrap_err();
        assert!(matches!(
            err,
            ReportError::InsufficientData { have: 9, need: 10 }
        ));
    }

    #[test]
    fn lower_threshold_is_floored_at_ten() {
        let samples = samples_with(1, |_, _| {});
        assert!(matches!(
            reduce(&samples, 1),
            Err(ReportError::InsufficientData { have: 1, need: 10 })
        ));
        let samples = samples_with(10, |_, _| {});
        assert!(matches!(
            reduce(&samples, 20),
            Err(ReportError::InsufficientData { have: 10, need: 20 })
        ));
    }

    #[test]
    fn ten_samples_without_gpu_yield_zero_gpu_section() {
        let samples = samples_with(10, |_, _| {});
        let report = reduce(&samples, MIN_REPORT_SAMPLES).unwrap();
        assert!(!report.gpu_active);
        for metric in &report.gpu.metrics {
            assert_eq!(metric.stats, Stats::ZERO, "{}", metric.label);
        }
        assert_eq!(report.sections().len(), 4);
        assert_eq!(report.data_points, 10);
    }

    #[test]
    fn identical_samples_reduce_to_their_value() {
        let samples = samples_with(25, |_, s| s.cpu.usage_percent = 50.0);
        let report = reduce(&samples, MIN_REPORT_SAMPLES).unwrap();
        let usage = report.cpu.metric("CPU usage (%)").unwrap();
        assert_eq!(
            usage.stats,
            Stats {
                min: 50.0,
                max: 50.0,
                avg: 50.0
            }
        );
        assert_eq!(usage.series.len(), 25);
    }

    #[test]
    fn unknown_temperatures_are_excluded() {
        let samples = samples_with(12, |i, s| {
            s.cpu.temperature_celsius = match i {
                0 => Some(40.0),
                1 => Some(60.0),
                2 => Some(0.0),
                _ => None,
            };
        });
        let report = reduce(&samples, MIN_REPORT_SAMPLES).unwrap();
        let temp = report.cpu.metric("CPU temperature (°C)").unwrap();
        assert_eq!(temp.stats.min, 0.0);
        assert_eq!(temp.stats.max, 60.0);
        assert_eq!(temp.stats.avg, 33.33);
        assert!(!temp.charted);
    }

    #[test]
    fn no_temperature_readings_give_zero_stats() {
        let samples = samples_with(10, |_, _| {});
        let report = reduce(&samples, MIN_REPORT_SAMPLES).unwrap();
        assert_eq!(
            report.cpu.metric("CPU temperature (°C)").unwrap().stats,
            Stats::ZERO
        );
    }

    #[test]
    fn gpu_section_appears_with_any_nonzero_load() {
        let samples = samples_with(10, |i, s| {
            s.gpu = vec![gpu(if i == 4 { 80.0 } else { 0.0 }, (i > 5).then_some(55.0))];
        });
        let report = reduce(&samples, MIN_REPORT_SAMPLES).unwrap();
        assert!(report.gpu_active);
        assert_eq!(report.sections().len(), 5);
        let load = report.gpu.metric("GPU load (%)").unwrap();
        assert_eq!(load.stats.max, 80.0);
        assert_eq!(load.stats.avg, 8.0);
        let temp = report.gpu.metric("GPU temperature (°C)").unwrap();
        assert_eq!(temp.stats.min, 55.0);
        assert_eq!(temp.stats.avg, 55.0);
    }

    #[test]
    fn throughput_is_converted_to_display_units() {
        let samples = samples_with(10, |_, s| {
            s.network = s.network.clone().with_rates(128.0, 1024.0);
            s.disk.read_bytes_per_sec = 3.0 * 1024.0 * 1024.0;
            s.memory.used_bytes = 8 * 1024 * 1024 * 1024;
        });
        let report = reduce(&samples, MIN_REPORT_SAMPLES).unwrap();
        assert_eq!(report.network.metric("Upload (Kbps)").unwrap().stats.avg, 1.0);
        assert_eq!(report.network.metric("Download (Kbps)").unwrap().stats.avg, 8.0);
        assert_eq!(report.disk.metric("Read (MB/s)").unwrap().stats.max, 3.0);
        assert_eq!(report.memory.metric("Memory used (GB)").unwrap().stats.min, 8.0);
    }

    #[test]
    fn empty_stats_are_zero() {
        assert_eq!(Stats::of(&[]), Stats::ZERO);
    }
}
