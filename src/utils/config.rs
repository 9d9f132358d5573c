// src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. An optional TOML file (`$LAB_KERNEL_CONFIG`, else `config/engine.toml`)
//! 3. Environment variables such as `LAB_KERNEL__POOL__MAX_KERNELS=40`

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "LAB_KERNEL_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "LAB_KERNEL";

const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    pub kernel: KernelSettings,
    pub workspace: WorkspaceSettings,
    pub observability: ObservabilitySettings,
}

/// Kernel pool sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Hard ceiling on live kernels
    pub max_kernels: usize,

    /// Inactivity before the sweeper reclaims a kernel
    pub idle_timeout_secs: u64,

    /// How often the sweeper wakes up
    pub sweep_interval_secs: u64,

    /// Maximum wait for a fresh kernel to answer its info request
    pub startup_timeout_secs: u64,

    /// Per-read timeout while draining execution output
    pub read_timeout_secs: u64,

    /// Per-read timeout while draining the startup preamble
    pub preamble_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_kernels: 20,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            startup_timeout_secs: 30,
            read_timeout_secs: 60,
            preamble_timeout_secs: 5,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn preamble_timeout(&self) -> Duration {
        Duration::from_secs(self.preamble_timeout_secs)
    }
}

/// How kernel subprocesses are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Interpreter executable, resolved through `PATH` when relative
    pub interpreter: String,

    /// Extra interpreter arguments placed before the driver
    pub extra_args: Vec<String>,

    /// Extra environment for kernel processes
    pub env: BTreeMap<String, String>,

    /// Resource limits applied to every kernel
    pub limits: ResourceLimits,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            extra_args: vec![],
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Filesystem roots and size caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Parent of all per-user workspaces
    pub workspace_root: PathBuf,

    /// Read-only course materials
    pub materials_root: PathBuf,

    /// Largest file `safe_copy` will accept
    pub max_copy_bytes: u64,

    /// Largest notebook that can be read or saved
    pub max_notebook_bytes: u64,

    /// Largest materials bundle
    pub max_bundle_bytes: u64,

    /// Largest code submission accepted by the service layer
    pub max_code_bytes: usize,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspaces"),
            materials_root: PathBuf::from("."),
            max_copy_bytes: 50 * 1024 * 1024,
            max_notebook_bytes: 10 * 1024 * 1024,
            max_bundle_bytes: 100 * 1024 * 1024,
            max_code_bytes: 100 * 1024,
        }
    }
}

/// Logging and metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Emit JSON log lines instead of the human-readable format
    pub log_json: bool,

    /// Prometheus scrape address; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a specific file (which may be absent)
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_kernels == 0 {
            return Err(EngineError::Config("pool.max_kernels must be at least 1".into()));
        }
        if self.pool.startup_timeout_secs == 0 || self.pool.read_timeout_secs == 0 {
            return Err(EngineError::Config("pool timeouts must be non-zero".into()));
        }
        if self.pool.sweep_interval_secs == 0 {
            return Err(EngineError::Config("pool.sweep_interval_secs must be non-zero".into()));
        }
        if self.kernel.interpreter.trim().is_empty() {
            return Err(EngineError::Config("kernel.interpreter must not be empty".into()));
        }
        self.kernel
            .limits
            .validate()
            .map_err(EngineError::Config)?;
        Ok(())
    }
}
