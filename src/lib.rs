// src/lib.rs
//! Lab Kernel Engine Library
//!
//! Pooled, sandboxed interactive kernels for course labs. Each user gets one
//! kernel per lab, bounded by a global capacity with LRU eviction, reclaimed
//! when idle, and confined to a per-user workspace on disk.
//!
//! # Architecture
//!
//! - **runtime**: kernel pool, sessions, kernel processes, message protocol
//! - **workspace**: path sandbox, per-user workspaces, material bundles
//! - **service**: request validation and response shaping
//! - **identity**: validated user / lab / course identifiers
//! - **observability**: tracing and metrics
//! - **utils**: configuration and errors

// Public module exports
pub mod identity;
pub mod observability;
pub mod runtime;
pub mod service;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use identity::{CourseId, LabId, UserId};
pub use runtime::kernel_pool::{KernelPool, PoolConfig};
pub use runtime::kernel::SubprocessLauncher;
pub use service::LabService;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, PoolError, Result, SandboxError};
pub use workspace::WorkspaceManager;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
