use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use smcd14::PulseTiming;

use crate::{models::AxisId, speed::SpeedLimits};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration file: {source}")]
    ReadError { source: std::io::Error },

    #[error("Failed to parse configuration: {source}")]
    ParseError { source: toml::de::Error },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError { source: toml::ser::Error },

    #[error("Failed to write configuration file: {source}")]
    WriteError { source: std::io::Error },

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisAddress {
    pub axis: AxisId,
    pub device_address: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: f64,
    pub axes: Vec<AxisAddress>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "169.254.151.255".to_string(),
            port: 502,
            timeout_secs: 10.0,
            axes: AxisId::ALL
                .iter()
                .zip(1..)
                .map(|(&axis, device_address)| AxisAddress {
                    axis,
                    device_address,
                })
                .collect(),
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Deltas at or below this are treated as "no travel" by the manager.
    pub move_epsilon: f64,
    /// Arrival tolerance used by an axis while waiting for in-position.
    pub position_tolerance: f64,
    pub min_axis_speed: f64,
    pub max_axis_speed: f64,
    /// Axis speeds below this magnitude are sent as 0.
    pub speed_zero_threshold: f64,
    pub stop_go_speed_threshold: f64,
    pub stop_go_hop_speed: f64,
    pub stop_go_step_fraction: f64,
    pub min_wait_secs: f64,
    pub wait_safety_factor: f64,
    pub nozzle_diameter: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            move_epsilon: 4e-4,
            position_tolerance: 2e-3,
            min_axis_speed: SpeedLimits::default().min_axis_speed,
            max_axis_speed: SpeedLimits::default().max_axis_speed,
            speed_zero_threshold: SpeedLimits::default().zero_threshold,
            stop_go_speed_threshold: 1e-4,
            stop_go_hop_speed: 1e-3,
            stop_go_step_fraction: 0.1,
            min_wait_secs: 15.0,
            wait_safety_factor: 3.0,
            nozzle_diameter: 0.0,
        }
    }
}

impl MotionConfig {
    pub fn speed_limits(&self) -> SpeedLimits {
        SpeedLimits {
            min_axis_speed: self.min_axis_speed,
            max_axis_speed: self.max_axis_speed,
            zero_threshold: self.speed_zero_threshold,
        }
    }

    /// Wait window for one axis covering `travel` mm at `speed` mm/s.
    pub fn wait_timeout(&self, travel: f64, speed: f64) -> Duration {
        let floor = self.min_wait_secs;
        let secs = if speed > 0.0 && speed.is_finite() {
            floor.max(travel.abs() / speed * self.wait_safety_factor)
        } else {
            floor
        };
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub pause_poll_ms: u64,
    pub running_bit_timeout_ms: u64,
    pub pulse_settle_ms: u64,
    pub pulse_deadline_ms: u64,
    pub pulse_poll_ms: u64,
    pub monitor_interval_ms: u64,
    pub dwell_chunk_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            pause_poll_ms: 50,
            running_bit_timeout_ms: 2000,
            pulse_settle_ms: 50,
            pulse_deadline_ms: 1000,
            pulse_poll_ms: 10,
            monitor_interval_ms: 300,
            dwell_chunk_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn running_bit_timeout(&self) -> Duration {
        Duration::from_millis(self.running_bit_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn dwell_chunk(&self) -> Duration {
        Duration::from_millis(self.dwell_chunk_ms)
    }

    pub fn pulse(&self) -> PulseTiming {
        PulseTiming {
            settle: Duration::from_millis(self.pulse_settle_ms),
            deadline: Duration::from_millis(self.pulse_deadline_ms),
            poll: Duration::from_millis(self.pulse_poll_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub motion_logging: bool,
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/manipulator.sock"),
            motion_logging: false,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::ValidationError { message });

        if self.connection.host.trim().is_empty() {
            return fail("connection.host is empty".to_string());
        }
        if self.connection.axes.is_empty() {
            return fail("connection.axes must list at least one axis".to_string());
        }

        let mut seen = BTreeSet::new();
        for entry in &self.connection.axes {
            if !seen.insert(entry.axis) {
                return fail(format!("axis {} is configured twice", entry.axis));
            }
        }

        if !(self.connection.timeout_secs > 0.0) {
            return fail("connection.timeout_secs must be positive".to_string());
        }

        let speed = self.motion.speed_limits();
        if !(speed.min_axis_speed > 0.0 && speed.min_axis_speed < speed.max_axis_speed) {
            return fail(format!(
                "speed limits must satisfy 0 < min ({}) < max ({})",
                speed.min_axis_speed, speed.max_axis_speed
            ));
        }
        if !(speed.zero_threshold >= 0.0 && speed.zero_threshold <= speed.min_axis_speed) {
            return fail("motion.speed_zero_threshold must be within [0, min_axis_speed]".to_string());
        }
        if !(self.motion.move_epsilon > 0.0 && self.motion.position_tolerance > 0.0) {
            return fail("motion tolerances must be positive".to_string());
        }
        if !(self.motion.stop_go_hop_speed > 0.0 && self.motion.stop_go_step_fraction > 0.0) {
            return fail("stop-and-go hop speed and step fraction must be positive".to_string());
        }

        let timing = &self.timing;
        if [
            timing.poll_interval_ms,
            timing.pause_poll_ms,
            timing.pulse_deadline_ms,
            timing.pulse_poll_ms,
            timing.monitor_interval_ms,
            timing.dwell_chunk_ms,
        ]
        .contains(&0)
        {
            return fail("timing intervals must be non-zero".to_string());
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigOptions {
    pub config_path: PathBuf,
    pub create_if_missing: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            create_if_missing: true,
        }
    }
}

impl ConfigOptions {
    pub fn default_config_path() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("default_config.toml"))
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    options: ConfigOptions,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            options: ConfigOptions::default(),
        }
    }

    pub fn with_options(options: ConfigOptions) -> Self {
        Self { options }
    }

    pub fn path(&self) -> &Path {
        &self.options.config_path
    }

    pub fn load(&self) -> anyhow::Result<Config> {
        let config_path = &self.options.config_path;

        if !config_path.exists() {
            if self.options.create_if_missing {
                let default_config = Config::default();
                self.save(&default_config)
                    .context("Failed to save default config")?;
                return Ok(default_config);
            }
            return Err(ConfigError::FileNotFound {
                path: config_path.clone(),
            }
            .into());
        }

        let content =
            fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError { source: e })?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { source: e })?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> anyhow::Result<()> {
        let config_path = &self.options.config_path;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        fs::write(config_path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

pub fn init_config() -> anyhow::Result<(ConfigManager, Config)> {
    let manager = ConfigManager::new();
    let config = manager.load()?;
    Ok((manager, config))
}

pub fn create_default_config<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<()> {
    let config_path = path
        .map(|p| p.as_ref().to_path_buf())
        .unwrap_or_else(ConfigOptions::default_config_path);

    let manager = ConfigManager::with_options(ConfigOptions {
        config_path,
        create_if_missing: true,
    });
    manager.save(&Config::default())
}

pub fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}
