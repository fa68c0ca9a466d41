//! Configuration loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (e.g. `config/pitaya.toml`)
//! 3. Environment variables prefixed with `PITAYA_`, nested keys separated by
//!    `__` (e.g. `PITAYA_BROKER__COMMAND_TIMEOUT=10s`)
//!
//! # Example
//! ```no_run
//! use pitaya_core::config::PitayaConfig;
//!
//! let config = PitayaConfig::load_from("config/pitaya.toml")?;
//! println!("worker mode: {:?}", config.worker.mode);
//! # Ok::<(), pitaya_core::PitayaError>(())
//! ```

use crate::error::{PitayaError, PitayaResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PITAYA_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PitayaConfig {
    /// Command broker timing and capacity
    pub broker: BrokerSettings,
    /// Worker launch and initialization
    pub worker: WorkerSettings,
    /// Connection registry behavior
    pub registry: RegistrySettings,
    /// Real-hardware connection settings
    pub scpi: ScpiSettings,
    /// Synthetic plant parameters
    pub simulator: SimulatorSettings,
    /// Log output
    pub logging: LoggingSettings,
}

/// Command broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// How long `start` waits for the worker readiness message
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
    /// Default per-command deadline
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// How long `stop` waits for the worker to acknowledge shutdown and exit
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Capacity of the inbound command channel
    pub channel_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(3),
            channel_capacity: 64,
        }
    }
}

/// How the worker is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Dedicated OS thread with its own single-threaded runtime
    #[default]
    Thread,
    /// Child process running the `pitaya-worker` binary
    Process,
}

/// Bounded retry contract for backend initialization.
///
/// Worst-case wait is deterministic: `attempts` tries separated by a fixed
/// `delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts (at least 1)
    pub attempts: u32,
    /// Pause between attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Thread or child process
    pub mode: WorkerMode,
    /// Path of the `pitaya-worker` executable (process mode). Defaults to the
    /// binary next to the current executable.
    pub program: Option<PathBuf>,
    /// Backend initialization retries
    pub init_retry: RetryPolicy,
}

/// How a connection reaches its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Through a command broker and its worker
    #[default]
    Ipc,
    /// Backend owned by the connection, guarded by its lock
    Direct,
}

/// Connection registry settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Transport used by `connect` when none is given
    pub default_transport: TransportMode,
}

/// Real instrument connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpiSettings {
    /// SCPI server TCP port
    pub port: u16,
    /// TCP connect deadline
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-query deadline
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for ScpiSettings {
    fn default() -> Self {
        Self {
            port: 5000,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// First-order-plus-dead-time plant parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// Static gain K
    pub gain: f64,
    /// Time constant tau in seconds
    pub time_constant: f64,
    /// Dead time theta in seconds
    pub dead_time: f64,
    /// Standard deviation of measurement noise in volts
    pub noise_std: f64,
    /// RNG seed for reproducible noise
    pub seed: Option<u64>,
    /// Number of history samples kept for metrics
    pub history_len: usize,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            gain: 1.0,
            time_constant: 1.0e-3,
            dead_time: 1.0e-4,
            noise_std: 1.0e-3,
            seed: None,
            history_len: 4096,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl PitayaConfig {
    /// Defaults overlaid with `PITAYA_` environment variables.
    pub fn load() -> PitayaResult<Self> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `path`, then environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PitayaResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PitayaError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> PitayaResult<()> {
        if self.worker.init_retry.attempts == 0 {
            return Err(PitayaError::Configuration(
                "worker.init_retry.attempts must be at least 1".into(),
            ));
        }
        if self.broker.channel_capacity == 0 {
            return Err(PitayaError::Configuration(
                "broker.channel_capacity must be at least 1".into(),
            ));
        }
        if self.broker.command_timeout.is_zero() || self.broker.start_timeout.is_zero() {
            return Err(PitayaError::Configuration(
                "broker timeouts must be non-zero".into(),
            ));
        }
        if self.scpi.port == 0 {
            return Err(PitayaError::Configuration("scpi.port cannot be 0".into()));
        }
        let sim = &self.simulator;
        if sim.time_constant.is_nan() || sim.time_constant <= 0.0 {
            return Err(PitayaError::Configuration(
                "simulator.time_constant must be positive".into(),
            ));
        }
        if sim.dead_time < 0.0 || sim.noise_std < 0.0 {
            return Err(PitayaError::Configuration(
                "simulator.dead_time and simulator.noise_std cannot be negative".into(),
            ));
        }
        if sim.history_len == 0 {
            return Err(PitayaError::Configuration(
                "simulator.history_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
