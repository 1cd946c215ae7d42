use crate::sample::Sample;
use crate::tracking::TickTracking;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub hostwatch_cpu_usage_percent: Gauge,
    pub hostwatch_cpu_temperature_celsius: Gauge,
    pub hostwatch_memory_used_bytes: Gauge,
    pub hostwatch_memory_total_bytes: Gauge,
    pub hostwatch_memory_usage_percent: Gauge,
    pub hostwatch_swap_usage_percent: Gauge,
    pub hostwatch_disk_usage_percent: GaugeVec,
    pub hostwatch_disk_read_bytes_per_sec: Gauge,
    pub hostwatch_disk_write_bytes_per_sec: Gauge,
    pub hostwatch_net_upload_bytes_per_sec: Gauge,
    pub hostwatch_net_download_bytes_per_sec: Gauge,
    pub hostwatch_gpu_load_percent: GaugeVec,
    pub hostwatch_gpu_temperature_celsius: GaugeVec,
    pub hostwatch_tracking_active: Gauge,
    pub hostwatch_tracking_samples: Gauge,
    pub hostwatch_tracking_progress_percent: Gauge,
    pub hostwatch_last_collect_timestamp_seconds: Gauge,
    pub hostwatch_scrape_count_total: Counter,
    pub hostwatch_collect_errors_total: CounterVec,
    pub hostwatch_ticks_skipped_total: Counter,
    pub hostwatch_sessions_started_total: Counter,
    pub hostwatch_sessions_completed_total: Counter,
    pub hostwatch_reports_generated_total: Counter,
    pub hostwatch_reports_failed_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hostwatch_cpu_usage_percent = Gauge::with_opts(opts!(
            "hostwatch_cpu_usage_percent",
            "Overall CPU usage in percent (0..100)"
        ))?;
        let hostwatch_cpu_temperature_celsius = Gauge::with_opts(opts!(
            "hostwatch_cpu_temperature_celsius",
            "CPU temperature in Celsius, NaN when no sensor is readable"
        ))?;
        let hostwatch_memory_used_bytes =
            Gauge::with_opts(opts!("hostwatch_memory_used_bytes", "Used memory in bytes"))?;
        let hostwatch_memory_total_bytes =
            Gauge::with_opts(opts!("hostwatch_memory_total_bytes", "Total memory in bytes"))?;
        let hostwatch_memory_usage_percent = Gauge::with_opts(opts!(
            "hostwatch_memory_usage_percent",
            "Memory usage in percent"
        ))?;
        let hostwatch_swap_usage_percent =
            Gauge::with_opts(opts!("hostwatch_swap_usage_percent", "Swap usage in percent"))?;
        let hostwatch_disk_usage_percent = GaugeVec::new(
            opts!(
                "hostwatch_disk_usage_percent",
                "Partition usage in percent by mountpoint"
            ),
            &["mount"],
        )?;
        let hostwatch_disk_read_bytes_per_sec = Gauge::with_opts(opts!(
            "hostwatch_disk_read_bytes_per_sec",
            "Aggregate disk read throughput in bytes per second"
        ))?;
        let hostwatch_disk_write_bytes_per_sec = Gauge::with_opts(opts!(
            "hostwatch_disk_write_bytes_per_sec",
            "Aggregate disk write throughput in bytes per second"
        ))?;
        let hostwatch_net_upload_bytes_per_sec = Gauge::with_opts(opts!(
            "hostwatch_net_upload_bytes_per_sec",
            "Aggregate upload throughput in bytes per second"
        ))?;
        let hostwatch_net_download_bytes_per_sec = Gauge::with_opts(opts!(
            "hostwatch_net_download_bytes_per_sec",
            "Aggregate download throughput in bytes per second"
        ))?;
        let hostwatch_gpu_load_percent = GaugeVec::new(
            opts!("hostwatch_gpu_load_percent", "GPU load in percent"),
            &["gpu", "name"],
        )?;
        let hostwatch_gpu_temperature_celsius = GaugeVec::new(
            opts!(
                "hostwatch_gpu_temperature_celsius",
                "GPU temperature in Celsius"
            ),
            &["gpu", "name"],
        )?;
        let hostwatch_tracking_active = Gauge::with_opts(opts!(
            "hostwatch_tracking_active",
            "1 while a tracking session is recording"
        ))?;
        let hostwatch_tracking_samples = Gauge::with_opts(opts!(
            "hostwatch_tracking_samples",
            "Samples held by the tracking session"
        ))?;
        let hostwatch_tracking_progress_percent = Gauge::with_opts(opts!(
            "hostwatch_tracking_progress_percent",
            "Progress of the recording session in percent"
        ))?;
        let hostwatch_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "hostwatch_last_collect_timestamp_seconds",
            "Unix timestamp of the latest sample"
        ))?;
        let hostwatch_scrape_count_total = Counter::with_opts(opts!(
            "hostwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let hostwatch_collect_errors_total = CounterVec::new(
            opts!(
                "hostwatch_collect_errors_total",
                "Absorbed metric sub-query failures by source"
            ),
            &["source"],
        )?;
        let hostwatch_ticks_skipped_total = Counter::with_opts(opts!(
            "hostwatch_ticks_skipped_total",
            "Poller ticks skipped because collection was still running or timed out"
        ))?;
        let hostwatch_sessions_started_total = Counter::with_opts(opts!(
            "hostwatch_sessions_started_total",
            "Tracking sessions started"
        ))?;
        let hostwatch_sessions_completed_total = Counter::with_opts(opts!(
            "hostwatch_sessions_completed_total",
            "Tracking sessions that reached the duration limit"
        ))?;
        let hostwatch_reports_generated_total = Counter::with_opts(opts!(
            "hostwatch_reports_generated_total",
            "Reports written"
        ))?;
        let hostwatch_reports_failed_total = Counter::with_opts(opts!(
            "hostwatch_reports_failed_total",
            "Report requests that failed"
        ))?;

        register(&registry, &hostwatch_cpu_usage_percent)?;
        register(&registry, &hostwatch_cpu_temperature_celsius)?;
        register(&registry, &hostwatch_memory_used_bytes)?;
        register(&registry, &hostwatch_memory_total_bytes)?;
        register(&registry, &hostwatch_memory_usage_percent)?;
        register(&registry, &hostwatch_swap_usage_percent)?;
        register(&registry, &hostwatch_disk_usage_percent)?;
        register(&registry, &hostwatch_disk_read_bytes_per_sec)?;
        register(&registry, &hostwatch_disk_write_bytes_per_sec)?;
        register(&registry, &hostwatch_net_upload_bytes_per_sec)?;
        register(&registry, &hostwatch_net_download_bytes_per_sec)?;
        register(&registry, &hostwatch_gpu_load_percent)?;
        register(&registry, &hostwatch_gpu_temperature_celsius)?;
        register(&registry, &hostwatch_tracking_active)?;
        register(&registry, &hostwatch_tracking_samples)?;
        register(&registry, &hostwatch_tracking_progress_percent)?;
        register(&registry, &hostwatch_last_collect_timestamp_seconds)?;
        register(&registry, &hostwatch_scrape_count_total)?;
        register(&registry, &hostwatch_collect_errors_total)?;
        register(&registry, &hostwatch_ticks_skipped_total)?;
        register(&registry, &hostwatch_sessions_started_total)?;
        register(&registry, &hostwatch_sessions_completed_total)?;
        register(&registry, &hostwatch_reports_generated_total)?;
        register(&registry, &hostwatch_reports_failed_total)?;

        Ok(Arc::new(Self {
            registry,
            hostwatch_cpu_usage_percent,
            hostwatch_cpu_temperature_celsius,
            hostwatch_memory_used_bytes,
            hostwatch_memory_total_bytes,
            hostwatch_memory_usage_percent,
            hostwatch_swap_usage_percent,
            hostwatch_disk_usage_percent,
            hostwatch_disk_read_bytes_per_sec,
            hostwatch_disk_write_bytes_per_sec,
            hostwatch_net_upload_bytes_per_sec,
            hostwatch_net_download_bytes_per_sec,
            hostwatch_gpu_load_percent,
            hostwatch_gpu_temperature_celsius,
            hostwatch_tracking_active,
            hostwatch_tracking_samples,
            hostwatch_tracking_progress_percent,
            hostwatch_last_collect_timestamp_seconds,
            hostwatch_scrape_count_total,
            hostwatch_collect_errors_total,
            hostwatch_ticks_skipped_total,
            hostwatch_sessions_started_total,
            hostwatch_sessions_completed_total,
            hostwatch_reports_generated_total,
            hostwatch_reports_failed_total,
        }))
    }

    pub fn update_from_sample(&self, sample: &Sample) {
        self.hostwatch_cpu_usage_percent.set(sample.cpu.usage_percent);
        self.hostwatch_cpu_temperature_celsius
            .set(sample.cpu.temperature_celsius.unwrap_or(f64::NAN));
        self.hostwatch_memory_used_bytes
            .set(sample.memory.used_bytes as f64);
        self.hostwatch_memory_total_bytes
            .set(sample.memory.total_bytes as f64);
        self.hostwatch_memory_usage_percent
            .set(sample.memory.usage_percent);
        self.hostwatch_swap_usage_percent.set(sample.memory.swap_percent);
        self.hostwatch_disk_read_bytes_per_sec
            .set(sample.disk.read_bytes_per_sec);
        self.hostwatch_disk_write_bytes_per_sec
            .set(sample.disk.write_bytes_per_sec);
        self.hostwatch_net_upload_bytes_per_sec
            .set(sample.network.upload_bytes_per_sec);
        self.hostwatch_net_download_bytes_per_sec
            .set(sample.network.download_bytes_per_sec);
        if let Ok(since_epoch) = sample.timestamp.duration_since(UNIX_EPOCH) {
            self.hostwatch_last_collect_timestamp_seconds
                .set(since_epoch.as_secs() as f64);
        }

        self.hostwatch_disk_usage_percent.reset();
        self.hostwatch_gpu_load_percent.reset();
        self.hostwatch_gpu_temperature_celsius.reset();

        for p in &sample.disk.partitions {
            self.hostwatch_disk_usage_percent
                .with_label_values(&[&p.mountpoint])
                .set(p.usage_percent);
        }
        for g in &sample.gpu {
            self.hostwatch_gpu_load_percent
                .with_label_values(&[&g.id, &g.name])
                .set(g.load_percent);
            if let Some(temp) = g.temperature_celsius {
                self.hostwatch_gpu_temperature_celsius
                    .with_label_values(&[&g.id, &g.name])
                    .set(temp);
            }
        }
    }

    pub fn update_tracking(&self, tracking: &TickTracking) {
        self.hostwatch_tracking_active
            .set(if tracking.is_tracking { 1.0 } else { 0.0 });
        self.hostwatch_tracking_samples
            .set(tracking.data_points as f64);
        self.hostwatch_tracking_progress_percent
            .set(tracking.progress);
    }

    pub fn inc_scrape_count(&self) {
        self.hostwatch_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, source: &str) {
        self.hostwatch_collect_errors_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_tick_skipped(&self) {
        self.hostwatch_ticks_skipped_total.inc();
    }

    pub fn inc_session_started(&self) {
        self.hostwatch_sessions_started_total.inc();
    }

    pub fn inc_session_completed(&self) {
        self.hostwatch_sessions_completed_total.inc();
    }

    pub fn inc_report(&self, ok: bool) {
        if ok {
            self.hostwatch_reports_generated_total.inc();
        } else {
            self.hostwatch_reports_failed_total.inc();
        }
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
