// src/runtime/process_manager.rs
//! Process manager for spawning and supervising kernel processes
//!
//! Each spawned child gets a supervisor task that owns the [`Child`] and is
//! the only place signals are delivered from. Because the supervisor stops
//! signalling as soon as it has reaped the child, a recycled PID can never
//! be hit by a late interrupt or kill.
//!
//! ```text
//! ProcessHandle ──ControlSignal──▶ supervisor task ──SIGINT/SIGKILL──▶ child
//!       ▲                                 │
//!       └──────── mark_exited ◀───────────┘ (after wait())
//! ```

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::PoolError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signals the supervisor can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Abort the running cell (SIGINT)
    Interrupt,
    /// Terminate immediately (SIGKILL)
    Kill,
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run
    pub program: PathBuf,

    /// Arguments
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    /// Limits installed before exec
    pub limits: ResourceLimits,
}

/// Process manager for spawning kernel processes
#[derive(Debug, Default)]
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: HashMap<String, PathBuf>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self {
            executable_paths: HashMap::new(),
        }
    }

    /// Find an executable by name or path
    pub fn find_executable(&mut self, command: &str) -> Result<PathBuf, PoolError> {
        if let Some(path) = self.executable_paths.get(command) {
            return Ok(path.clone());
        }

        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                self.executable_paths.insert(command.to_string(), path.clone());
                Ok(path)
            }
            Err(e) => Err(PoolError::SpawnFailed(format!(
                "Executable '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    /// Spawn a new process with piped stdio
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child, PoolError> {
        debug!("Spawning process: {:?}", config.program);

        let mut command = Command::new(&config.program);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // own process group: a Ctrl-C aimed at the engine must not reach kernels
            command.process_group(0);

            if !config.limits.is_unlimited() {
                let limits = config.limits.clone();
                // SAFETY: the hook only calls setrlimit, which is async-signal-safe
                unsafe {
                    command.pre_exec(move || limits.apply_to_current());
                }
            }
        }

        let child = command
            .spawn()
            .map_err(|e| PoolError::SpawnFailed(format!("Failed to spawn process: {}", e)))?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// Hand `child` to a supervisor task bound to `handle`
    pub fn supervise(&self, mut child: Child, handle: &ProcessHandle) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pid = child.id();
        let generation = handle.attach(pid, tx);
        let handle = handle.clone();

        tokio::spawn(async move {
            let mut control_open = true;

            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => debug!("Process {:?} exited with status: {}", pid, status),
                            Err(e) => warn!("Error waiting for process {:?}: {}", pid, e),
                        }
                        break;
                    }
                    signal = rx.recv(), if control_open => match signal {
                        Some(ControlSignal::Interrupt) => {
                            if let Some(pid) = pid {
                                if let Err(e) = send_signal(pid, nix::sys::signal::Signal::SIGINT) {
                                    warn!("Failed to interrupt PID {}: {}", pid, e);
                                }
                            }
                        }
                        Some(ControlSignal::Kill) => {
                            debug!("Killing process {:?}", pid);
                            if let Err(e) = child.start_kill() {
                                warn!("Failed to kill process {:?}: {}", pid, e);
                            }
                        }
                        None => {
                            // handle re-attached to a newer process or dropped
                            control_open = false;
                            let _ = child.start_kill();
                        }
                    }
                }
            }

            handle.mark_exited(generation);
        })
    }
}

/// Send a signal to a PID
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), PoolError> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| PoolError::Kernel(format!("Failed to send {}: {}", signal, e)))
}

#[derive(Debug, Default)]
struct HandleState {
    generation: u64,
    pid: Option<u32>,
    alive: bool,
    control: Option<mpsc::UnboundedSender<ControlSignal>>,
}

/// Shared, cloneable view of whichever process currently backs a kernel.
///
/// Cheap to query and usable without holding the kernel's session lock, so
/// interrupts, liveness checks and forced kills never wait behind a running
/// execution.
#[derive(Debug, Clone, Default)]
pub struct ProcessHandle {
    state: Arc<Mutex<HandleState>>,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handle to a new process. Returns the generation to pass to
    /// [`mark_exited`](Self::mark_exited).
    pub fn attach(&self, pid: Option<u32>, control: mpsc::UnboundedSender<ControlSignal>) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.pid = pid;
        state.alive = true;
        state.control = Some(control);
        state.generation
    }

    /// Record that the process of `generation` is gone. Stale generations are ignored.
    pub fn mark_exited(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.alive = false;
            state.control = None;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn pid(&self) -> Option<u32> {
        let state = self.state.lock();
        if state.alive {
            state.pid
        } else {
            None
        }
    }

    /// Ask the process to abort in-flight work. Returns whether a live process was signalled.
    pub fn interrupt(&self) -> bool {
        self.send(ControlSignal::Interrupt)
    }

    /// Terminate the process. Returns whether a live process was signalled.
    pub fn kill(&self) -> bool {
        self.send(ControlSignal::Kill)
    }

    fn send(&self, signal: ControlSignal) -> bool {
        let state = self.state.lock();
        match (&state.control, state.alive) {
            (Some(control), true) => control.send(signal).is_ok(),
            _ => false,
        }
    }
}

/// Resolve `program` to an absolute path, searching `PATH` for bare names
pub fn locate(program: &str) -> Result<PathBuf, PoolError> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(PoolError::SpawnFailed(format!("Executable not found: {}", program)))
        };
    }
    ProcessManager::new().find_executable(program)
}
