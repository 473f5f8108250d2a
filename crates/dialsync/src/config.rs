//! Configuration file parsing and structures.
//!
//! Every section is optional; an empty file yields the defaults.

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use crate::engine::EngineSettings;
use crate::engine::EntitySnapshot;
use crate::engine::MiredRange;
use crate::engine::StepTable;
use crate::engine::state::DEFAULT_MAX_MIRED;
use crate::engine::state::DEFAULT_MIN_MIRED;
use crate::error::ConfigError;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"dialsync::engine::reconcile" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// Engine timing and tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period after the last dial tick before dispatching
    pub debounce_ms: u64,

    /// How long pushes are treated as echoes of a local command
    pub echo_window_ms: u64,

    /// Upper bound for a single hub command
    pub dispatch_timeout_ms: u64,

    pub default_min_mired: u16,
    pub default_max_mired: u16,

    /// Per-channel step sizes and burst caps
    pub steps: StepTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            echo_window_ms: 3000,
            dispatch_timeout_ms: 3000,
            default_min_mired: DEFAULT_MIN_MIRED,
            default_max_mired: DEFAULT_MAX_MIRED,
            steps: StepTable::default(),
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            quiet_period: Duration::from_millis(cfg.debounce_ms),
            echo_window: Duration::from_millis(cfg.echo_window_ms),
            dispatch_timeout: Duration::from_millis(cfg.dispatch_timeout_ms),
            default_range: MiredRange::new(cfg.default_min_mired, cfg.default_max_mired),
            steps: cfg.steps,
        }
    }
}

/// In-process loopback hub used by the `dialsync` binary
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Delay before a command is echoed back as a push
    pub echo_latency_ms: u64,

    /// Whether the simulated connection starts up
    pub connected: bool,

    pub entities: Vec<EntitySnapshot>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            echo_latency_ms: 150,
            connected: true,
            entities: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}
