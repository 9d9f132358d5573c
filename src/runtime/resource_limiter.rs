// src/runtime/resource_limiter.rs
//! Resource limiting for kernel processes
//!
//! Limits are installed with `setrlimit` in the child between `fork` and
//! `exec`, so they hold for the interpreter and everything it spawns:
//! - Address space (MB limit)
//! - CPU time (seconds)
//! - Open file descriptors

use serde::{Deserialize, Serialize};

/// Resource limits for a kernel process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address space limit in megabytes
    /// Example: 2048 = 2GB virtual memory
    pub memory_limit_mb: Option<u64>,

    /// Total CPU seconds the kernel may consume over its lifetime
    pub cpu_time_secs: Option<u64>,

    /// Maximum open file descriptors
    pub max_open_files: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: Some(2048), // numpy/torch imports reserve a lot of VM
            cpu_time_secs: None,         // long-lived kernels, idle sweep reclaims them
            max_open_files: Some(256),
        }
    }
}

impl ResourceLimits {
    /// Create resource limits with no restrictions
    pub fn unlimited() -> Self {
        Self {
            memory_limit_mb: None,
            cpu_time_secs: None,
            max_open_files: None,
        }
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if let Some(memory) = self.memory_limit_mb {
            if memory < 64 {
                return Err("Memory limit cannot be less than 64MB".to_string());
            }
            if memory > 65536 {
                return Err("Memory limit cannot exceed 64GB".to_string());
            }
        }

        if self.cpu_time_secs == Some(0) {
            return Err("CPU time limit cannot be 0".to_string());
        }

        if let Some(files) = self.max_open_files {
            if files < 16 {
                return Err("Open file limit cannot be less than 16".to_string());
            }
        }

        Ok(())
    }

    /// Install the limits on the current process.
    ///
    /// Only async-signal-safe calls are made, so this may run inside a
    /// `pre_exec` hook.
    #[cfg(target_os = "linux")]
    pub fn apply_to_current(&self) -> std::io::Result<()> {
        use nix::sys::resource::{setrlimit, Resource};

        if let Some(memory) = self.memory_limit_mb {
            let bytes = memory * 1024 * 1024;
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }

        if let Some(secs) = self.cpu_time_secs {
            setrlimit(Resource::RLIMIT_CPU, secs, secs)?;
        }

        if let Some(files) = self.max_open_files {
            setrlimit(Resource::RLIMIT_NOFILE, files, files)?;
        }

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply_to_current(&self) -> std::io::Result<()> {
        Ok(())
    }

    /// Whether any limit is set
    pub fn is_unlimited(&self) -> bool {
        self.memory_limit_mb.is_none() && self.cpu_time_secs.is_none() && self.max_open_files.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_limit_mb, Some(2048));
        assert_eq!(limits.cpu_time_secs, None);
        assert_eq!(limits.max_open_files, Some(256));
        assert!(!limits.is_unlimited());
    }

    #[test]
    fn test_unlimited() {
        let limits = ResourceLimits::unlimited();
        assert!(limits.is_unlimited());
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(ResourceLimits::default().validate().is_ok());

        let invalid_memory = ResourceLimits {
            memory_limit_mb: Some(32),
            ..Default::default()
        };
        assert!(invalid_memory.validate().is_err());

        let invalid_cpu = ResourceLimits {
            cpu_time_secs: Some(0),
            ..Default::default()
        };
        assert!(invalid_cpu.validate().is_err());

        let invalid_files = ResourceLimits {
            max_open_files: Some(4),
            ..Default::default()
        };
        assert!(invalid_files.validate().is_err());
    }
}
