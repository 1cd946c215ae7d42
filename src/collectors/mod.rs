pub mod gpu;
pub mod rate;
pub mod sensors;
pub mod system;

use crate::sample::{
    CpuMetrics, DiskMetrics, GpuRecord, MemoryMetrics, NetworkMetrics, ProcessRecord, Sample,
    SystemInfo,
};
use std::time::SystemTime;
use thiserror::Error;

/// Failure of a single metric sub-query. Never leaves the collector: the
/// affected field degrades to its empty/unknown value.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("transient source error: {0}")]
    Transient(String),
}

/// Independent per-family queries against the host.
///
/// `refresh` is called once per tick before the queries so that every family
/// reads the same refreshed state.
pub trait MetricSource: Send {
    fn refresh(&mut self) {}
    fn query_cpu(&mut self) -> Result<CpuMetrics, SourceError>;
    fn query_memory(&mut self) -> Result<MemoryMetrics, SourceError>;
    fn query_disk(&mut self) -> Result<DiskMetrics, SourceError>;
    fn query_network(&mut self) -> Result<NetworkMetrics, SourceError>;
    fn query_gpu(&mut self) -> Result<Vec<GpuRecord>, SourceError>;
    fn query_processes(&mut self, top_n: usize) -> Result<Vec<ProcessRecord>, SourceError>;
    fn query_system_info(&mut self) -> Result<SystemInfo, SourceError>;
}

#[derive(Debug)]
pub struct Collection {
    pub sample: Sample,
    pub failures: Vec<(&'static str, SourceError)>,
}

pub struct SampleAggregator<S> {
    source: S,
    top_n: usize,
}

impl<S: MetricSource> SampleAggregator<S> {
    pub fn new(source: S, top_n: usize) -> Self {
        Self { source, top_n }
    }

    pub fn collect(&mut self) -> Collection {
        let timestamp = SystemTime::now();
        self.source.refresh();

        let mut failures = Vec::new();
        let cpu = absorb("cpu", self.source.query_cpu(), &mut failures);
        let memory = absorb("memory", self.source.query_memory(), &mut failures);
        let disk = absorb("disk", self.source.query_disk(), &mut failures);
        let network = absorb("network", self.source.query_network(), &mut failures);
        let gpu = absorb("gpu", self.source.query_gpu(), &mut failures);
        let processes = absorb(
            "processes",
            self.source.query_processes(self.top_n),
            &mut failures,
        );
        let system = absorb("system", self.source.query_system_info(), &mut failures);

        Collection {
            sample: Sample {
                timestamp,
                cpu,
                memory,
                disk,
                network,
                gpu,
                processes,
                system,
            },
            failures,
        }
    }
}

fn absorb<T: Default>(
    family: &'static str,
    result: Result<T, SourceError>,
    failures: &mut Vec<(&'static str, SourceError)>,
) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            failures.push((family, err));
            T::default()
        }
    }
}

pub(crate) fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | 'e' | 'E' | '-' | '+'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
