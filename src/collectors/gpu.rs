use crate::collectors::{parse_f64_loose, SourceError};
use crate::sample::{percent, round_to, GpuRecord};
use std::process::Command;
use tracing::info;

/// Capability interface for GPU statistics.
///
/// Hosts without a usable GPU tool get [`NoGpu`], so callers never branch on
/// availability.
pub trait GpuBackend: Send {
    fn name(&self) -> &'static str;
    fn query(&mut self) -> Result<Vec<GpuRecord>, SourceError>;
}

pub struct NoGpu;

impl GpuBackend for NoGpu {
    fn name(&self) -> &'static str {
        "none"
    }

    fn query(&mut self) -> Result<Vec<GpuRecord>, SourceError> {
        Ok(Vec::new())
    }
}

pub struct NvidiaSmi;

const NVIDIA_QUERY: [&str; 2] = [
    "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu,driver_version",
    "--format=csv,noheader,nounits",
];

impl GpuBackend for NvidiaSmi {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn query(&mut self) -> Result<Vec<GpuRecord>, SourceError> {
        let output = run_nvidia_smi(&NVIDIA_QUERY)
            .ok_or_else(|| SourceError::Unavailable("nvidia-smi not found".to_string()))?;
        if !output.status.success() {
            return Err(SourceError::Transient(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8(output.stdout)
            .map_err(|err| SourceError::Transient(format!("nvidia-smi output: {err}")))?;
        Ok(parse_nvidia_csv(&text))
    }
}

/// Picks the GPU backend once at startup.
pub fn detect() -> Box<dyn GpuBackend> {
    let mut nvidia = NvidiaSmi;
    match nvidia.query() {
        Ok(gpus) if !gpus.is_empty() => {
            info!(backend = nvidia.name(), gpus = gpus.len(), "gpu backend selected");
            Box::new(nvidia)
        }
        _ => {
            info!("no gpu backend available, gpu section stays empty");
            Box::new(NoGpu)
        }
    }
}

fn parse_nvidia_csv(text: &str) -> Vec<GpuRecord> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
            if parts.len() < 7 {
                return None;
            }

            let memory_used_mb = parse_f64_loose(parts[3]).unwrap_or(0.0);
            let memory_total_mb = parse_f64_loose(parts[4]).unwrap_or(0.0);
            Some(GpuRecord {
                id: parts[0].to_string(),
                name: parts[1].to_string(),
                load_percent: parse_f64_loose(parts[2]).unwrap_or(0.0),
                memory_used_mb,
                memory_total_mb,
                memory_percent: round_to(percent(memory_used_mb, memory_total_mb), 1),
                temperature_celsius: parse_f64_loose(parts[5]),
                driver: parts[6].to_string(),
            })
        })
        .collect()
}

fn run_nvidia_smi(args: &[&str]) -> Option<std::process::Output> {
    if let Ok(output) = Command::new("nvidia-smi").args(args).output() {
        return Some(output);
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(output) = Command::new(r"C:\Windows\System32\nvidia-smi.exe")
            .args(args)
            .output()
        {
            return Some(output);
        }
    }

    None
}
