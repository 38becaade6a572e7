// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered, later layers overriding earlier ones:
//!
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. Optional TOML file (`$TPP_ENGINE_CONFIG`, else `tpp-engine.toml`)
//! 3. Environment variables, e.g. `TPP_ENGINE__LIMITS__SOFT_TIMEOUT_SECS=30`

use crate::runtime::sandbox::SandboxConfig;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "TPP_ENGINE_CONFIG";

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "tpp-engine.toml";

const ENV_PREFIX: &str = "TPP_ENGINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub limits: LimitsConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Worker pool and dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of jobs allowed to run at once
    pub pool_size: usize,

    /// How long finished job records stay queryable
    pub result_retention_secs: u64,

    /// Upper bound on `run_sync` waits
    pub sync_wait_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            result_retention_secs: 86_400,
            sync_wait_secs: 90,
        }
    }
}

/// Per-job time limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Cooperative limit; elapsing yields a `SoftTimeout` result
    pub soft_timeout_secs: u64,

    /// Forced kill of the tool process
    pub hard_timeout_secs: u64,

    /// Limit for `-h` version invocations
    pub probe_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_timeout_secs: 60,
            hard_timeout_secs: 75,
            probe_timeout_secs: 15,
        }
    }
}

impl LimitsConfig {
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// A tool command: program plus arguments placed before the job template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }
}

/// External tool commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub renumber: ToolSpec,
    pub topology: ToolSpec,

    /// Force field passed to the topology builder
    pub force_field: String,

    /// Log file the topology builder leaves in the volume root
    pub topology_log: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            renumber: ToolSpec::new("tpprenum"),
            topology: ToolSpec::new("runtppmktop.sh"),
            force_field: "OPLS-AA".to_string(),
            topology_log: "tppmktop.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How long a deferred workspace stays on disk after completion
    pub grace_window_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: 300,
        }
    }
}

impl ReaperConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Prometheus scrape endpoint
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `$TPP_ENGINE_CONFIG` (or `tpp-engine.toml`)
    /// and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load configuration from an explicit file. A missing default file is
    /// tolerated; a missing explicit file is an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: EngineConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.runtime.pool_size == 0 {
            return Err(EngineError::ConfigError(
                "runtime.pool_size must be at least 1".to_string(),
            ));
        }

        if self.limits.soft_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "limits.soft_timeout_secs must be positive".to_string(),
            ));
        }

        // The soft limit has to fire first so the handler can still clean up.
        if self.limits.soft_timeout_secs >= self.limits.hard_timeout_secs {
            return Err(EngineError::ConfigError(format!(
                "limits.soft_timeout_secs ({}) must be less than limits.hard_timeout_secs ({})",
                self.limits.soft_timeout_secs, self.limits.hard_timeout_secs
            )));
        }

        if self.reaper.grace_window_secs == 0 {
            return Err(EngineError::ConfigError(
                "reaper.grace_window_secs must be positive".to_string(),
            ));
        }

        self.sandbox.validate()
    }
}
