//! # Relay Configuration
//!
//! Every setting is optional at the parsing stage and can come from:
//!
//! 1. built-in defaults (`RelayConfig::defaults`),
//! 2. the JSON configuration file (`drone_relay.conf`, camelCase keys),
//! 3. environment variables (`DRONE_*`) and CLI flags.
//!
//! Later sources override earlier ones field by field. `resolve` then turns
//! the merged result into validated, fixed `RelaySettings`. Nothing is
//! reloaded while the process runs.

use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::relay::engine::RelaySettings;
use crate::relay::forwarder::{AckPolicy, ForwarderSettings};
use crate::relay::framer::DEFAULT_MAX_FRAME_BYTES;
use crate::relay::power::{PowerSettings, LEVEL_MAX, LEVEL_MIN};
use crate::relay::tap::DEFAULT_TAP_CAPACITY;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "drone_relay.conf";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Drone telemetry relay", version)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[arg(long, env = "DRONE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "DRONE_BIND_HOST", help = "IP address the sensor listener binds to.")]
    pub bind_host: Option<String>,

    #[arg(long, env = "DRONE_LISTEN_PORT", help = "Port sensors connect to.")]
    pub listen_port: Option<u16>,

    #[arg(long, env = "DRONE_CENTRAL_HOST", help = "Host of the central endpoint.")]
    pub central_host: Option<String>,

    #[arg(long, env = "DRONE_CENTRAL_PORT", help = "Port of the central endpoint.")]
    pub central_port: Option<u16>,

    #[arg(long, env = "DRONE_FORWARD_INTERVAL_MS", help = "Milliseconds between forward attempts.")]
    pub forward_interval_ms: Option<u64>,

    #[arg(long, env = "DRONE_FORWARD_TIMEOUT_MS", help = "Upper bound in milliseconds for one forward attempt.")]
    pub forward_timeout_ms: Option<u64>,

    #[arg(long, env = "DRONE_ACK_POLICY", help = "When forwarded readings leave the buffer: batch or per-item.")]
    pub ack_policy: Option<String>,

    #[arg(long, env = "DRONE_POWER_LOW_THRESHOLD", help = "Level below which the relay becomes constrained.")]
    pub power_low_threshold: Option<f64>,

    #[arg(long, env = "DRONE_POWER_HIGH_THRESHOLD", help = "Level at which a constrained relay recovers.")]
    pub power_high_threshold: Option<f64>,

    #[arg(long, env = "DRONE_POWER_DRAIN_STEP", help = "Power drained on every power tick.")]
    pub power_drain_step: Option<f64>,

    #[arg(long, env = "DRONE_POWER_TICK_MS", help = "Milliseconds between power ticks.")]
    pub power_tick_ms: Option<u64>,

    #[arg(long, env = "DRONE_INITIAL_POWER_LEVEL", help = "Power level at start-up.")]
    pub initial_power_level: Option<f64>,

    #[arg(long, env = "DRONE_MAX_FRAME_BYTES", help = "Longest accepted frame in bytes.")]
    pub max_frame_bytes: Option<usize>,

    #[arg(long, env = "DRONE_STATUS_INTERVAL_SECS", help = "Seconds between status log lines.")]
    pub status_interval_secs: Option<u64>,

    #[arg(long, env = "DRONE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "DRONE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl RelayConfig {
    /// Built-in values used when no other source sets a field.
    pub fn defaults() -> Self {
        Self {
            config_path: None,
            bind_host: Some("0.0.0.0".to_string()),
            listen_port: Some(5000),
            central_host: Some("127.0.0.1".to_string()),
            central_port: Some(6000),
            forward_interval_ms: Some(5000),
            forward_timeout_ms: Some(10_000),
            ack_policy: Some(AckPolicy::Batch.to_string()),
            power_low_threshold: Some(20.0),
            power_high_threshold: Some(90.0),
            power_drain_step: Some(1.0),
            power_tick_ms: Some(5000),
            initial_power_level: Some(LEVEL_MAX),
            max_frame_bytes: Some(DEFAULT_MAX_FRAME_BYTES),
            status_interval_secs: Some(30),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
        }
    }

    // 'other' wins wherever it has a value
    fn merge(self, other: RelayConfig) -> RelayConfig {
        RelayConfig {
            config_path: other.config_path.or(self.config_path),
            bind_host: other.bind_host.or(self.bind_host),
            listen_port: other.listen_port.or(self.listen_port),
            central_host: other.central_host.or(self.central_host),
            central_port: other.central_port.or(self.central_port),
            forward_interval_ms: other.forward_interval_ms.or(self.forward_interval_ms),
            forward_timeout_ms: other.forward_timeout_ms.or(self.forward_timeout_ms),
            ack_policy: other.ack_policy.or(self.ack_policy),
            power_low_threshold: other.power_low_threshold.or(self.power_low_threshold),
            power_high_threshold: other.power_high_threshold.or(self.power_high_threshold),
            power_drain_step: other.power_drain_step.or(self.power_drain_step),
            power_tick_ms: other.power_tick_ms.or(self.power_tick_ms),
            initial_power_level: other.initial_power_level.or(self.initial_power_level),
            max_frame_bytes: other.max_frame_bytes.or(self.max_frame_bytes),
            status_interval_secs: other.status_interval_secs.or(self.status_interval_secs),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    /// Validates the merged values and builds the engine settings.
    pub fn resolve(&self) -> Result<RelaySettings, ConfigError> {
        let bind_host = required(&self.bind_host, "bind_host")?;
        let bind_ip: IpAddr = bind_host
            .parse()
            .map_err(|e| ConfigError::invalid("bind_host", format!("{bind_host:?}: {e}")))?;
        let listen_addr = SocketAddr::new(bind_ip, *required(&self.listen_port, "listen_port")?);

        let central_host = required(&self.central_host, "central_host")?;
        if central_host.trim().is_empty() {
            return Err(ConfigError::invalid("central_host", "must not be empty"));
        }
        let central_port = *required(&self.central_port, "central_port")?;
        let central_addr = match central_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{central_port}"),
            _ => format!("{central_host}:{central_port}"),
        };

        let ack_policy: AckPolicy = required(&self.ack_policy, "ack_policy")?
            .parse()
            .map_err(|reason| ConfigError::invalid("ack_policy", reason))?;

        let power = PowerSettings {
            low_threshold: level(self.power_low_threshold, "power_low_threshold")?,
            high_threshold: level(self.power_high_threshold, "power_high_threshold")?,
            drain_step: *required(&self.power_drain_step, "power_drain_step")?,
            initial_level: level(self.initial_power_level, "initial_power_level")?,
        };
        if power.low_threshold >= power.high_threshold {
            return Err(ConfigError::invalid(
                "power_low_threshold",
                format!(
                    "{} must be below power_high_threshold {}",
                    power.low_threshold, power.high_threshold
                ),
            ));
        }
        if !power.drain_step.is_finite() || power.drain_step < 0.0 {
            return Err(ConfigError::invalid(
                "power_drain_step",
                format!("{} is not a non-negative number", power.drain_step),
            ));
        }

        let max_frame_bytes = *required(&self.max_frame_bytes, "max_frame_bytes")?;
        if max_frame_bytes == 0 {
            return Err(ConfigError::invalid("max_frame_bytes", "must be greater than zero"));
        }

        Ok(RelaySettings {
            listen_addr,
            central_addr,
            forwarder: ForwarderSettings {
                interval: millis(self.forward_interval_ms, "forward_interval_ms")?,
                timeout: millis(self.forward_timeout_ms, "forward_timeout_ms")?,
                ack_policy,
            },
            power,
            power_tick: millis(self.power_tick_ms, "power_tick_ms")?,
            max_frame_bytes,
            tap_capacity: DEFAULT_TAP_CAPACITY,
        })
    }

    /// Period of the status log line.
    pub fn status_interval(&self) -> Result<Duration, ConfigError> {
        let secs = *required(&self.status_interval_secs, "status_interval_secs")?;
        if secs == 0 {
            return Err(ConfigError::invalid("status_interval_secs", "must be greater than zero"));
        }
        Ok(Duration::from_secs(secs))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

fn required<'a, T>(value: &'a Option<T>, field: &'static str) -> Result<&'a T, ConfigError> {
    value.as_ref().ok_or(ConfigError::Missing(field))
}

fn millis(value: Option<u64>, field: &'static str) -> Result<Duration, ConfigError> {
    match value {
        None => Err(ConfigError::Missing(field)),
        Some(0) => Err(ConfigError::invalid(field, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn level(value: Option<f64>, field: &'static str) -> Result<f64, ConfigError> {
    let value = value.ok_or(ConfigError::Missing(field))?;
    if !(LEVEL_MIN..=LEVEL_MAX).contains(&value) {
        return Err(ConfigError::invalid(
            field,
            format!("{value} is outside {LEVEL_MIN}..={LEVEL_MAX}"),
        ));
    }
    Ok(value)
}

/// Loads `.env`, parses the command line and merges all sources.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_config_with(RelayConfig::parse())
}

/// Merges defaults, the config file named by `cli` (or the default one) and
/// `cli` itself, in that order.
pub fn load_config_with(cli: RelayConfig) -> Result<RelayConfig, ConfigError> {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = RelayConfig::defaults();
    if path.exists() {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let file_config: RelayConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        config = config.merge(file_config);
        info!(path = %path.display(), "config file loaded");
    } else {
        info!(path = %path.display(), "config file not found, using defaults, environment and CLI");
    }

    Ok(config.merge(cli))
}
