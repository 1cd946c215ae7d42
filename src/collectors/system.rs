use crate::collectors::gpu::GpuBackend;
use crate::collectors::rate::RateComputer;
use crate::collectors::sensors::{pick_cpu_temperature, SensorBackend};
use crate::collectors::{MetricSource, SourceError};
use crate::sample::{
    format_rfc3339, percent, round_to, CpuMetrics, DiskMetrics, GpuRecord, InterfaceStat,
    MemoryMetrics, NetworkMetrics, PartitionStat, ProcessRecord, SystemInfo,
};
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::process::Command;
use std::time::{Duration, Instant, UNIX_EPOCH};
use sysinfo::{
    ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, PidExt, ProcessExt, System, SystemExt,
};
use tracing::debug;

/// `sysinfo`-backed metric source.
///
/// Owns the two rate baselines (disk I/O and network traffic), so rates are
/// always derived from consecutive snapshots taken by this instance.
pub struct SystemSource {
    system: System,
    disk_io: RateComputer<2>,
    net_io: RateComputer<2>,
    gpu: Box<dyn GpuBackend>,
    sensors: Box<dyn SensorBackend>,
    refreshed_at: Instant,
}

impl SystemSource {
    pub fn new(gpu: Box<dyn GpuBackend>, sensors: Box<dyn SensorBackend>) -> Self {
        let mut system = System::new_all();
        // Seed CPU usage so the first tick reads a non-blocking delta.
        system.refresh_cpu();
        Self {
            system,
            disk_io: RateComputer::new(),
            net_io: RateComputer::new(),
            gpu,
            sensors,
            refreshed_at: Instant::now(),
        }
    }
}

impl MetricSource for SystemSource {
    fn refresh(&mut self) {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();
        self.system.refresh_disks_list();
        self.system.refresh_disks();
        self.system.refresh_networks_list();
        self.system.refresh_networks();
        self.system.refresh_components_list();
        self.system.refresh_components();
        self.refreshed_at = Instant::now();
    }

    fn query_cpu(&mut self) -> Result<CpuMetrics, SourceError> {
        let cpus = self.system.cpus();
        let per_core_percent: Vec<f64> = cpus.iter().map(|c| c.cpu_usage() as f64).collect();
        let frequency_current_mhz = cpus.first().map(|c| c.frequency() as f64).unwrap_or(0.0);
        let fastest_core_mhz = cpus.iter().map(|c| c.frequency()).max().unwrap_or(0) as f64;

        let temperature_celsius = match self.sensors.cpu_temperature() {
            Ok(Some(t)) => Some(t),
            Ok(None) => self.generic_cpu_temperature(),
            Err(err) => {
                debug!(backend = self.sensors.name(), error = %err, "platform sensor lookup failed");
                self.generic_cpu_temperature()
            }
        };

        Ok(CpuMetrics {
            usage_percent: self.system.global_cpu_info().cpu_usage() as f64,
            per_core_percent,
            frequency_current_mhz,
            frequency_max_mhz: max_cpu_frequency_mhz().unwrap_or(fastest_core_mhz),
            core_count_logical: cpus.len(),
            core_count_physical: self.system.physical_core_count(),
            temperature_celsius,
        })
    }

    fn query_memory(&mut self) -> Result<MemoryMetrics, SourceError> {
        let total = self.system.total_memory();
        let available = self.system.available_memory();
        let swap_total = self.system.total_swap();
        let swap_used = self.system.used_swap();

        Ok(MemoryMetrics {
            total_bytes: total,
            available_bytes: available,
            used_bytes: self.system.used_memory(),
            usage_percent: round_to(percent(total.saturating_sub(available) as f64, total as f64), 1),
            swap_total_bytes: swap_total,
            swap_used_bytes: swap_used,
            swap_percent: round_to(percent(swap_used as f64, swap_total as f64), 1),
        })
    }

    fn query_disk(&mut self) -> Result<DiskMetrics, SourceError> {
        let partitions: Vec<PartitionStat> = self
            .system
            .disks()
            .iter()
            .filter_map(|d| {
                partition_stat(
                    d.name().to_string_lossy().to_string(),
                    d.mount_point().to_string_lossy().to_string(),
                    String::from_utf8_lossy(d.file_system()).to_string(),
                    d.total_space(),
                    d.available_space(),
                )
            })
            .collect();

        let [read_bytes_per_sec, write_bytes_per_sec] = match self.disk_io_counters() {
            Ok(counters) => self.disk_io.update(counters, self.refreshed_at),
            Err(err) => {
                debug!(error = %err, "disk io counters unavailable");
                [0.0, 0.0]
            }
        };

        Ok(DiskMetrics {
            partitions,
            read_bytes_per_sec,
            write_bytes_per_sec,
        })
    }

    fn query_network(&mut self) -> Result<NetworkMetrics, SourceError> {
        let (sent, received) = self
            .system
            .networks()
            .iter()
            .fold((0_u64, 0_u64), |(tx, rx), (_, data)| {
                (
                    tx.saturating_add(data.total_transmitted()),
                    rx.saturating_add(data.total_received()),
                )
            });
        let [upload, download] = self.net_io.update([sent, received], self.refreshed_at);

        Ok(NetworkMetrics {
            total_sent_bytes: sent,
            total_received_bytes: received,
            interfaces: active_interfaces(),
            ..NetworkMetrics::default()
        }
        .with_rates(upload, download))
    }

    fn query_gpu(&mut self) -> Result<Vec<GpuRecord>, SourceError> {
        self.gpu.query()
    }

    fn query_processes(&mut self, top_n: usize) -> Result<Vec<ProcessRecord>, SourceError> {
        let total_memory = self.system.total_memory() as f64;
        let mut processes: Vec<ProcessRecord> = self
            .system
            .processes()
            .values()
            .map(|p| ProcessRecord {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu_percent: p.cpu_usage() as f64,
                memory_percent: round_to(percent(p.memory() as f64, total_memory), 1),
            })
            .collect();
        // Enumerate in pid order, the way the process table is listed.
        processes.sort_by_key(|p| p.pid);
        Ok(top_by_cpu(processes, top_n))
    }

    fn query_system_info(&mut self) -> Result<SystemInfo, SourceError> {
        let boot_time = UNIX_EPOCH + Duration::from_secs(self.system.boot_time());
        let platform = match self.system.name() {
            Some(name) => format!("{} ({name})", std::env::consts::OS),
            None => std::env::consts::OS.to_string(),
        };

        Ok(SystemInfo {
            boot_time: format_rfc3339(boot_time),
            uptime_hours: round_to(self.system.uptime() as f64 / 3600.0, 1),
            platform,
        })
    }
}

impl SystemSource {
    fn generic_cpu_temperature(&self) -> Option<f64> {
        pick_cpu_temperature(
            self.system
                .components()
                .iter()
                .map(|c| (c.label(), c.temperature() as f64)),
        )
    }

    #[cfg(target_os = "linux")]
    fn disk_io_counters(&self) -> Result<[u64; 2], SourceError> {
        let text = fs::read_to_string("/proc/diskstats")
            .map_err(|err| SourceError::Transient(format!("/proc/diskstats: {err}")))?;
        Ok(parse_diskstats(&text, |device| {
            std::path::Path::new("/sys/block").join(device).exists()
        }))
    }

    #[cfg(not(target_os = "linux"))]
    fn disk_io_counters(&self) -> Result<[u64; 2], SourceError> {
        Ok(self
            .system
            .processes()
            .values()
            .fold([0_u64, 0_u64], |[read, written], p| {
                let usage = p.disk_usage();
                [
                    read.saturating_add(usage.total_read_bytes),
                    written.saturating_add(usage.total_written_bytes),
                ]
            }))
    }
}

/// Keeps the `n` busiest processes. The sort is stable, so equal CPU usage
/// keeps enumeration order.
pub fn top_by_cpu(mut processes: Vec<ProcessRecord>, n: usize) -> Vec<ProcessRecord> {
    processes.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    processes.truncate(n);
    processes
}

/// Sums read/written bytes of whole block devices from `/proc/diskstats`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_diskstats(text: &str, is_whole_disk: impl Fn(&str) -> bool) -> [u64; 2] {
    const SECTOR_BYTES: u64 = 512;

    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let device = fields[2];
            if device.starts_with("loop") || device.starts_with("ram") || !is_whole_disk(device) {
                return None;
            }
            let sectors_read = fields[5].parse::<u64>().ok()?;
            let sectors_written = fields[9].parse::<u64>().ok()?;
            Some((sectors_read, sectors_written))
        })
        .fold([0_u64, 0_u64], |[read, written], (r, w)| {
            [
                read.saturating_add(r.saturating_mul(SECTOR_BYTES)),
                written.saturating_add(w.saturating_mul(SECTOR_BYTES)),
            ]
        })
}

#[cfg(target_os = "linux")]
fn max_cpu_frequency_mhz() -> Option<f64> {
    let raw = fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq").ok()?;
    let khz = raw.trim().parse::<f64>().ok()?;
    Some(khz / 1000.0)
}

#[cfg(not(target_os = "linux"))]
fn max_cpu_frequency_mhz() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn active_interfaces() -> Vec<InterfaceStat> {
    let output = match Command::new("ip").args(["-o", "-4", "addr", "show"]).output() {
        Ok(output) => output,
        Err(err) => {
            debug!(error = %err, "ip command unavailable, reporting no interfaces");
            return Vec::new();
        }
    };
    if !output.status.success() {
        debug!(status = %output.status, "ip addr failed, reporting no interfaces");
        return Vec::new();
    }
    let text = String::from_utf8_lossy(&output.stdout);

    up_interfaces(parse_ipv4_addrs(&text), |iface, attr| {
        fs::read_to_string(format!("/sys/class/net/{iface}/{attr}"))
            .ok()
            .map(|v| v.trim().to_string())
    })
}

#[cfg(not(target_os = "linux"))]
fn active_interfaces() -> Vec<InterfaceStat> {
    Vec::new()
}

/// Keeps interfaces whose `flags` attribute has IFF_UP set. `read_attr`
/// reads `/sys/class/net/<iface>/<attr>`; speed is kept only when positive.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn up_interfaces(
    addrs: Vec<(String, String)>,
    read_attr: impl Fn(&str, &str) -> Option<String>,
) -> Vec<InterfaceStat> {
    const IFF_UP: u32 = 0x1;

    addrs
        .into_iter()
        .filter(|(name, _)| {
            read_attr(name, "flags")
                .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
                .is_some_and(|flags| flags & IFF_UP != 0)
        })
        .map(|(name, ipv4)| {
            let speed_mbps = read_attr(&name, "speed")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v > 0)
                .map(|v| v as u64);
            InterfaceStat {
                name,
                ipv4,
                speed_mbps,
            }
        })
        .collect()
}

/// Pseudo and vanished mounts report no capacity and are skipped.
fn partition_stat(
    device: String,
    mountpoint: String,
    fstype: String,
    total: u64,
    free: u64,
) -> Option<PartitionStat> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(free);
    Some(PartitionStat {
        device,
        mountpoint,
        fstype,
        total_bytes: total,
        used_bytes: used,
        free_bytes: free,
        usage_percent: round_to(percent(used as f64, total as f64), 1),
    })
}

/// First IPv4 address per interface from `ip -o -4 addr show`, in listing order.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ipv4_addrs(text: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = fields.iter().position(|f| *f == "inet") else {
            continue;
        };
        let (Some(name), Some(cidr)) = (fields.get(1), fields.get(pos + 1)) else {
            continue;
        };
        let name = name.trim_end_matches(':');
        if out.iter().any(|(n, _)| n == name) {
            continue;
        }
        let addr = cidr.split('/').next().unwrap_or_default();
        out.push((name.to_string(), addr.to_string()));
    }
    out
}
