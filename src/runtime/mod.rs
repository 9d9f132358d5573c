// src/runtime/mod.rs
//! Kernel execution runtime
//!
//! - **Kernel Pool**: bounded registry of sessions with LRU eviction and idle sweeping
//! - **Session**: one kernel bound to a `(user, lab)` pair, with its own lock
//! - **Kernel**: launcher/process seam and the subprocess driver implementation
//! - **Process Manager**: spawning, supervision and signalling
//! - **Protocol**: kernel messages and output classification
//! - **Resource Limiter**: rlimits applied before exec
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── KernelPool ────────────────────────┐
//! │  (user 1, lab-01) ─▶ KernelSession ─▶ python3 driver        │
//! │  (user 2, lab-01) ─▶ KernelSession ─▶ python3 driver        │
//! │  (user 2, lab-02) ─▶ KernelSession ─▶ python3 driver        │
//! │                                                             │
//! │  sweeper: every 60s, reclaim idle (> 30 min) or dead        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod kernel;
pub mod kernel_pool;
pub mod process_manager;
pub mod protocol;
pub mod resource_limiter;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use kernel::{KernelLauncher, KernelProcess, LaunchSpec, RecvOutcome, SubprocessLauncher};
pub use kernel_pool::{
    AcquireOutcome, AcquireStatus, KernelPool, KernelState, PoolConfig, PoolStats, SessionStatus,
};
pub use process_manager::{ProcessHandle, ProcessManager, SpawnConfig};
pub use protocol::{ErrorInfo, ExecutionResult, ExecutionStatus, OutputEvent};
pub use resource_limiter::ResourceLimits;
pub use session::{KernelSession, SessionKey};
