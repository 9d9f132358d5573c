// src/utils/errors.rs
//! Error types for the lab kernel engine
//!
//! Errors are split by concern:
//!
//! - [`SandboxError`]: path, identifier and file-size violations
//! - [`PoolError`]: kernel pool lifecycle failures
//! - [`EngineError`]: top-level wrapper used by the service layer
//!
//! Code that raises inside a kernel is *not* an error here. It comes back as
//! a successful [`ExecutionResult`](crate::runtime::protocol::ExecutionResult)
//! whose status is `error`.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Filesystem sandbox violations
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Empty path")]
    EmptyPath,

    #[error("Absolute paths not allowed: {0}")]
    AbsolutePath(String),

    #[error("Path traversal detected: {0}")]
    Traversal(String),

    #[error("Path escape detected: {0}")]
    Escape(String),

    #[error("Invalid path component: {0:?}")]
    InvalidComponent(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Identifier too long: {len} characters (max {max})")]
    IdentifierTooLong { len: usize, max: usize },

    #[error("Invalid user id: {0}")]
    InvalidUserId(i64),

    #[error("Source is not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("File too large: {size} bytes (max {limit} bytes)")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Invalid notebook: {0}")]
    InvalidNotebook(String),

    #[error("Bundle too large: exceeds {limit} bytes")]
    BundleTooLarge { limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kernel pool failures
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Server at capacity ({max_kernels} kernels). Please try again later.")]
    CapacityExceeded { max_kernels: usize },

    #[error("No kernel found. Please start a kernel first.")]
    NotFound,

    #[error("Kernel died. Please restart.")]
    StaleKernel,

    #[error("Kernel did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("Failed to start kernel: {0}")]
    SpawnFailed(String),

    #[error("Kernel channel error: {0}")]
    Kernel(String),
}

impl PoolError {
    /// Whether the caller may safely retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::CapacityExceeded { .. } | PoolError::StartupTimeout(_)
        )
    }
}

/// Top-level engine error
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Sandbox violation: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable code for responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Sandbox(_) => "sandbox_violation",
            EngineError::Pool(PoolError::CapacityExceeded { .. }) => "capacity_exceeded",
            EngineError::Pool(PoolError::NotFound) => "not_found",
            EngineError::Pool(PoolError::StaleKernel) => "stale_kernel",
            EngineError::Pool(PoolError::StartupTimeout(_)) => "startup_timeout",
            EngineError::Pool(PoolError::SpawnFailed(_)) => "spawn_failed",
            EngineError::Pool(PoolError::Kernel(_)) => "kernel_error",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Config(_) => "config_error",
            EngineError::Serialization(_) => "serialization_error",
            EngineError::Io(_) => "io_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Pool(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
