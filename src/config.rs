use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_collect_timeout_ms")]
    pub collect_timeout_ms: u64,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub processes: ProcessesConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_min_report_samples")]
    pub min_report_samples: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessesConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Events kept per subscriber before the oldest are dropped.
    #[serde(default = "default_stream_buffer")]
    pub buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_report_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_secs: default_interval_secs(),
            collect_timeout_ms: default_collect_timeout_ms(),
            tracking: TrackingConfig::default(),
            processes: ProcessesConfig::default(),
            stream: StreamConfig::default(),
            reports: ReportsConfig::default(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            min_report_samples: default_min_report_samples(),
        }
    }
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer: default_stream_buffer(),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_reports_dir(),
            timeout_secs: default_report_timeout_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Config::load_from_file`], but a missing file yields the
    /// built-in defaults. The flag reports whether the file was found.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<(Self, bool), ConfigError> {
        match Self::load_from_file(path) {
            Ok(cfg) => Ok((cfg, true)),
            Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok((Self::default(), false))
            }
            Err(err) => Err(err),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.collect_timeout_ms == 0 || self.collect_timeout() >= self.interval() {
            return Err(ConfigError::Validation(
                "collect_timeout_ms must be > 0 and shorter than interval_secs".to_string(),
            ));
        }

        validate_tracking(&self.tracking)?;
        if self.processes.top_n < 1 {
            return Err(ConfigError::Validation(
                "processes.top_n must be >= 1".to_string(),
            ));
        }
        if self.stream.buffer < 1 {
            return Err(ConfigError::Validation(
                "stream.buffer must be >= 1".to_string(),
            ));
        }
        validate_reports(&self.reports)?;

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.collect_timeout_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_tracking(cfg: &TrackingConfig) -> Result<(), ConfigError> {
    if cfg.duration_secs < 1 {
        return Err(ConfigError::Validation(
            "tracking.duration_secs must be >= 1".to_string(),
        ));
    }
    if cfg.min_report_samples < crate::report::MIN_REPORT_SAMPLES {
        return Err(ConfigError::Validation(format!(
            "tracking.min_report_samples must be >= {}",
            crate::report::MIN_REPORT_SAMPLES
        )));
    }
    Ok(())
}

fn validate_reports(cfg: &ReportsConfig) -> Result<(), ConfigError> {
    if cfg.dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "reports.dir must not be empty".to_string(),
        ));
    }
    if cfg.timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "reports.timeout_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

const fn default_interval_secs() -> u64 {
    1
}

const fn default_collect_timeout_ms() -> u64 {
    900
}

const fn default_duration_secs() -> u64 {
    300
}

const fn default_min_report_samples() -> usize {
    crate::report::MIN_REPORT_SAMPLES
}

const fn default_top_n() -> usize {
    5
}

const fn default_stream_buffer() -> usize {
    32
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("./reports")
}

const fn default_report_timeout_secs() -> u64 {
    60
}
