use serde::Serializer;
use std::time::SystemTime;

/// One immutable snapshot of every monitored metric, captured once per tick.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Sample {
    #[serde(serialize_with = "serialize_rfc3339")]
    pub timestamp: SystemTime,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
    pub gpu: Vec<GpuRecord>,
    pub processes: Vec<ProcessRecord>,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub per_core_percent: Vec<f64>,
    pub frequency_current_mhz: f64,
    pub frequency_max_mhz: f64,
    pub core_count_logical: usize,
    pub core_count_physical: Option<usize>,
    /// `None` when no sensor is readable; `Some(0.0)` is a real reading.
    pub temperature_celsius: Option<f64>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub swap_percent: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DiskMetrics {
    pub partitions: Vec<PartitionStat>,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionStat {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NetworkMetrics {
    pub upload_bytes_per_sec: f64,
    pub download_bytes_per_sec: f64,
    pub upload_bits_per_sec: f64,
    pub download_bits_per_sec: f64,
    pub total_sent_bytes: u64,
    pub total_received_bytes: u64,
    pub interfaces: Vec<InterfaceStat>,
}

impl NetworkMetrics {
    pub fn with_rates(mut self, upload_bytes_per_sec: f64, download_bytes_per_sec: f64) -> Self {
        self.upload_bytes_per_sec = upload_bytes_per_sec;
        self.download_bytes_per_sec = download_bytes_per_sec;
        self.upload_bits_per_sec = upload_bytes_per_sec * 8.0;
        self.download_bits_per_sec = download_bytes_per_sec * 8.0;
        self
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InterfaceStat {
    pub name: String,
    pub ipv4: String,
    pub speed_mbps: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GpuRecord {
    pub id: String,
    pub name: String,
    pub load_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub memory_percent: f64,
    pub temperature_celsius: Option<f64>,
    pub driver: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SystemInfo {
    pub boot_time: String,
    pub uptime_hours: f64,
    pub platform: String,
}

impl Sample {
    /// A sample with every family at its empty/unknown value.
    pub fn empty(timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            cpu: CpuMetrics::default(),
            memory: MemoryMetrics::default(),
            disk: DiskMetrics::default(),
            network: NetworkMetrics::default(),
            gpu: Vec::new(),
            processes: Vec::new(),
            system: SystemInfo::default(),
        }
    }

    pub fn timestamp_rfc3339(&self) -> String {
        format_rfc3339(self.timestamp)
    }
}

pub fn format_rfc3339(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at).to_string()
}

fn serialize_rfc3339<S: Serializer>(at: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_rfc3339(*at))
}

pub fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        (part / whole) * 100.0
    } else {
        0.0
    }
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}
