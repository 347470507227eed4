//! Configuration loading and typed config structures for a Cadence run.
//!
//! A run is configured from a YAML document whose sections mirror the
//! structs below. Every section and field has a default, so an empty
//! document is a valid configuration. A handful of environment variables
//! override file values for deployment:
//!
//! - `CADENCE_SEED` overrides `simulation.seed`
//! - `CADENCE_CHECKPOINT_DIR` overrides `checkpoint.directory`
//! - `CADENCE_TELEMETRY_PATH` overrides `telemetry.path`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cadence_events::MIN_MAX_DEPTH;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for environment variable {var}: {source}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Raw value found.
        value: String,
        /// Why it did not parse.
        source: std::num::ParseIntError,
    },

    /// A value is outside its permitted range.
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Run identity, seed and bounds.
    #[serde(default)]
    pub simulation: SimulationSection,

    /// Unit scheduling parameters.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Event bus parameters.
    #[serde(default)]
    pub events: EventsConfig,

    /// Periodic checkpointing.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Telemetry stream destination.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CadenceConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides and validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without overrides or
    /// validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup("CADENCE_SEED") {
            self.simulation.seed = value.trim().parse::<u64>().map_err(move |source| ConfigError::Env {
                var: "CADENCE_SEED",
                value,
                source,
            })?;
        }
        if let Some(value) = lookup("CADENCE_CHECKPOINT_DIR") {
            self.checkpoint.directory = PathBuf::from(value);
        }
        if let Some(value) = lookup("CADENCE_TELEMETRY_PATH") {
            self.telemetry.path = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.failure_threshold",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.scheduler.unit_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.unit_timeout_ms",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.events.max_depth < MIN_MAX_DEPTH {
            return Err(ConfigError::Invalid {
                field: "events.max_depth",
                reason: format!("must be at least {MIN_MAX_DEPTH}"),
            });
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid {
                field: "logging.format",
                reason: format!("must be \"pretty\" or \"json\", got {:?}", self.logging.format),
            });
        }
        Ok(())
    }
}

/// Run identity, seed and bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable run name.
    #[serde(default = "default_name")]
    pub name: String,

    /// Seed of the run's random stream.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Maximum number of ticks (0 = unlimited).
    #[serde(default)]
    pub max_ticks: u64,

    /// Real-time pause between ticks in milliseconds (0 = none).
    #[serde(default)]
    pub tick_interval_ms: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            seed: default_seed(),
            max_ticks: 0,
            tick_interval_ms: 0,
        }
    }
}

/// Unit scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Soft timeout for one awaited external call, in milliseconds.
    #[serde(default = "default_unit_timeout_ms")]
    pub unit_timeout_ms: u64,

    /// Consecutive failing ticks before a unit is disabled.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Budget for draining background calls at shutdown, in milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl SchedulerConfig {
    /// The unit timeout as a [`Duration`].
    pub const fn unit_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_timeout_ms)
    }

    /// The drain budget as a [`Duration`].
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unit_timeout_ms: default_unit_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Event bus parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Maximum nesting of reentrant publishes.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Log every publish and handler invocation at debug level.
    #[serde(default)]
    pub debug_logging: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            debug_logging: false,
        }
    }
}

/// Periodic checkpointing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Write a checkpoint every N ticks (0 = disabled).
    #[serde(default)]
    pub interval: u64,

    /// Directory checkpoint files are written to.
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,

    /// Gzip checkpoint files.
    #[serde(default)]
    pub compress: bool,

    /// Number of checkpoint files to keep (0 = keep all).
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 0,
            directory: default_checkpoint_dir(),
            compress: false,
            keep_last: default_keep_last(),
        }
    }
}

/// Telemetry stream destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// JSON-lines file to append to. No file means telemetry is discarded.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_name() -> String {
    "cadence".to_owned()
}

const fn default_seed() -> u64 {
    42
}

const fn default_unit_timeout_ms() -> u64 {
    5_000
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_drain_timeout_ms() -> u64 {
    10_000
}

const fn default_max_depth() -> usize {
    cadence_events::DEFAULT_MAX_DEPTH
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

const fn default_keep_last() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "pretty".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CadenceConfig::default();
        assert_eq!(config.simulation.seed, 42);
        assert_eq!(config.scheduler.failure_threshold, 3);
        assert_eq!(config.events.max_depth, 128);
        assert_eq!(config.checkpoint.interval, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(CadenceConfig::parse("").unwrap(), CadenceConfig::default());
    }

    #[test]
    fn parse_partial_yaml_keeps_defaults() {
        let yaml = r"
simulation:
  name: village
  seed: 7
  max_ticks: 200
scheduler:
  failure_threshold: 5
checkpoint:
  interval: 25
  compress: true
logging:
  format: json
";
        let config = CadenceConfig::parse(yaml).unwrap();
        assert_eq!(config.simulation.name, "village");
        assert_eq!(config.simulation.seed, 7);
        assert_eq!(config.simulation.max_ticks, 200);
        assert_eq!(config.scheduler.failure_threshold, 5);
        assert_eq!(config.scheduler.unit_timeout_ms, 5_000);
        assert_eq!(config.checkpoint.interval, 25);
        assert!(config.checkpoint.compress);
        assert_eq!(config.checkpoint.keep_last, 5);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let env: BTreeMap<&str, &str> = [
            ("CADENCE_SEED", "991"),
            ("CADENCE_CHECKPOINT_DIR", "/tmp/cp"),
            ("CADENCE_TELEMETRY_PATH", "/tmp/run.jsonl"),
        ]
        .into_iter()
        .collect();
        let mut config = CadenceConfig::default();
        config
            .apply_env_overrides(|name| env.get(name).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(config.simulation.seed, 991);
        assert_eq!(config.checkpoint.directory, PathBuf::from("/tmp/cp"));
        assert_eq!(config.telemetry.path, Some(PathBuf::from("/tmp/run.jsonl")));
    }

    #[test]
    fn malformed_seed_override_is_rejected() {
        let mut config = CadenceConfig::default();
        let err = config
            .apply_env_overrides(|name| (name == "CADENCE_SEED").then(|| "lots".to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "CADENCE_SEED", .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = CadenceConfig::default();
        config.scheduler.failure_threshold = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "scheduler.failure_threshold", .. })
        ));

        let mut config = CadenceConfig::default();
        config.scheduler.unit_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = CadenceConfig::default();
        config.events.max_depth = 16;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "events.max_depth", .. })
        ));

        let mut config = CadenceConfig::default();
        config.logging.format = "xml".to_owned();
        assert!(config.validate().is_err());
    }
}
