// src/runtime/kernel.rs
//! Kernel processes
//!
//! [`KernelLauncher`] and [`KernelProcess`] are the seam between the pool and
//! whatever actually runs code. The production implementation spawns an
//! interpreter running a small driver that speaks line-delimited JSON:
//!
//! ```text
//!           stdin  (KernelRequest per line)
//! engine ─────────────────────────────────────▶ driver
//!        ◀───────────────────────────────────── (private dup of fd 1)
//!           stdout (KernelMessage per line)
//!
//!        ◀───── stderr (user fd 1/2 writes, logged at debug)
//! ```

use crate::identity::UserId;
use crate::runtime::process_manager::{locate, ProcessHandle, ProcessManager, SpawnConfig};
use crate::runtime::protocol::{KernelMessage, KernelRequest, MessageBody};
use crate::utils::config::KernelSettings;
use crate::utils::errors::PoolError;
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Upper bound on one protocol line (inline PNGs are large)
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Buffered kernel messages not yet drained by a caller
const MESSAGE_BUFFER: usize = 1024;

/// How long a kernel gets to exit after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for the supervisor after a kill
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Run once, silently, on every fresh or restarted kernel
pub const STARTUP_PREAMBLE: &str = r#"
import warnings
warnings.filterwarnings("ignore")

try:
    import matplotlib
    matplotlib.use("Agg")
except ImportError:
    pass


def _capture_figure():
    try:
        import matplotlib.pyplot as _plt
    except ImportError:
        return
    import io as _io
    for _num in _plt.get_fignums():
        _buf = _io.BytesIO()
        _plt.figure(_num).savefig(_buf, format="png", bbox_inches="tight")
        _display_png(_buf.getvalue())
    _plt.close("all")
"#;

/// Appended to every user execution: flush open figures as inline images
pub const FIGURE_CAPTURE: &str = r#"
try:
    _capture_figure()
except Exception:
    pass
"#;

/// Driver run by the interpreter (`python -u -c DRIVER`)
pub const DRIVER: &str = r##"
import ast, base64, builtins, io, json, os, signal, sys, traceback

signal.signal(signal.SIGINT, signal.default_int_handler)
_wire = os.fdopen(os.dup(1), "w", encoding="utf-8", buffering=1)
os.dup2(2, 1)
_parent = None
_count = 0


def _send(msg_type, content):
    _wire.write(json.dumps({"msg_type": msg_type, "parent_id": _parent, "content": content}, default=str) + "\n")
    _wire.flush()


class _Stream(io.TextIOBase):
    def __init__(self, name):
        self._name = name

    @property
    def name(self):
        return self._name

    def writable(self):
        return True

    def write(self, text):
        if text:
            _send("stream", {"name": self._name, "text": str(text)})
        return len(text)


def _bundle(obj):
    data = {"text/plain": repr(obj)}
    png = getattr(obj, "_repr_png_", None)
    if callable(png):
        try:
            raw = png()
        except Exception:
            raw = None
        if raw:
            data["image/png"] = base64.b64encode(raw).decode("ascii")
    return data


def display(*objs):
    for obj in objs:
        _send("display_data", {"data": _bundle(obj)})


def _display_png(raw):
    _send("display_data", {"data": {"image/png": base64.b64encode(raw).decode("ascii")}})


_ns = {"__name__": "__main__", "__builtins__": builtins, "display": display, "_display_png": _display_png}


def _run(source):
    tree = ast.parse(source, "<cell>", "exec")
    last = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        last = ast.Expression(tree.body.pop().value)
    exec(compile(tree, "<cell>", "exec"), _ns)
    if last is not None:
        return eval(compile(last, "<cell>", "eval"), _ns)
    return None


def _execute(req):
    global _count
    if not req.get("silent"):
        _count += 1
    _send("status", {"execution_state": "busy"})
    try:
        value = _run(req.get("code", ""))
        if value is not None:
            _ns["_"] = value
            _send("execute_result", {"data": _bundle(value), "execution_count": _count})
        epilogue = req.get("epilogue")
        if epilogue:
            _run(epilogue)
    except BaseException as exc:
        tb = exc.__traceback__.tb_next if exc.__traceback__ else None
        _send("error", {
            "ename": type(exc).__name__,
            "evalue": str(exc),
            "traceback": traceback.format_exception(type(exc), exc, tb),
        })
    finally:
        _send("status", {"execution_state": "idle"})


sys.stdout = _Stream("stdout")
sys.stderr = _Stream("stderr")

while True:
    try:
        line = sys.stdin.readline()
        if not line:
            break
        try:
            req = json.loads(line)
        except ValueError:
            continue
        kind = req.get("msg_type")
        _parent = req.get("msg_id")
        if kind == "kernel_info_request":
            _send("kernel_info_reply", {"language": "python", "language_version": sys.version.split()[0]})
        elif kind == "execute_request":
            _execute(req)
        elif kind == "shutdown_request":
            break
    except KeyboardInterrupt:
        continue
"##;

/// What a launcher needs to start a kernel
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub kernel_id: String,
    pub user_id: UserId,
    /// Handle the kernel must bind every process it spawns to
    pub handle: ProcessHandle,
}

/// Result of one bounded read from a kernel
#[derive(Debug, Clone, PartialEq)]
pub enum RecvOutcome {
    Message(KernelMessage),
    /// Nothing arrived within the read timeout
    Timeout,
    /// The kernel's output channel is gone
    Closed,
}

/// A running kernel, owned by exactly one session
#[async_trait]
pub trait KernelProcess: Send {
    /// Write one request to the kernel
    async fn send(&mut self, request: KernelRequest) -> Result<(), PoolError>;

    /// Read the next message, waiting at most `timeout`
    async fn recv(&mut self, timeout: Duration) -> RecvOutcome;

    /// Kill the current process and start a fresh one bound to the same handle
    async fn restart(&mut self) -> Result<(), PoolError>;

    /// Stop the kernel; always leaves the process dead
    async fn shutdown(&mut self);

    /// Block until the kernel answers an info request
    async fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), PoolError> {
        let msg_id = ulid::Ulid::new().to_string();
        self.send(KernelRequest::KernelInfoRequest {
            msg_id: msg_id.clone(),
        })
        .await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::StartupTimeout(timeout));
            }

            match self.recv(remaining).await {
                RecvOutcome::Message(message) => {
                    if message.is_reply_to(&msg_id)
                        && matches!(message.body, MessageBody::KernelInfoReply { .. })
                    {
                        return Ok(());
                    }
                }
                RecvOutcome::Timeout => return Err(PoolError::StartupTimeout(timeout)),
                RecvOutcome::Closed => {
                    return Err(PoolError::SpawnFailed(
                        "kernel exited during startup".to_string(),
                    ))
                }
            }
        }
    }
}

/// Starts kernels for the pool
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn KernelProcess>, PoolError>;
}

/// Launches the interpreter driver as a child process
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    settings: KernelSettings,
    program: PathBuf,
    workspaces: Option<WorkspaceManager>,
}

impl SubprocessLauncher {
    /// Locate the configured interpreter
    pub fn new(settings: KernelSettings) -> Result<Self, PoolError> {
        let program = locate(&settings.interpreter)?;
        Ok(Self {
            settings,
            program,
            workspaces: None,
        })
    }

    /// Start each kernel inside its user's workspace
    pub fn with_workspaces(mut self, workspaces: WorkspaceManager) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    fn spawn_config(&self, spec: &LaunchSpec) -> Result<SpawnConfig, PoolError> {
        let work_dir = match &self.workspaces {
            Some(workspaces) => Some(
                workspaces
                    .user_workspace(spec.user_id)
                    .map_err(|e| PoolError::SpawnFailed(format!("workspace unavailable: {}", e)))?,
            ),
            None => None,
        };

        let mut args = self.settings.extra_args.clone();
        args.extend(["-u".to_string(), "-c".to_string(), DRIVER.to_string()]);

        let mut env_vars: Vec<(String, String)> = self
            .settings
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env_vars.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
        env_vars.push(("MPLBACKEND".to_string(), "Agg".to_string()));
        env_vars.push(("LAB_KERNEL_ID".to_string(), spec.kernel_id.clone()));

        Ok(SpawnConfig {
            program: self.program.clone(),
            args,
            work_dir,
            env_vars,
            limits: self.settings.limits.clone(),
        })
    }
}

#[async_trait]
impl KernelLauncher for SubprocessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn KernelProcess>, PoolError> {
        let config = self.spawn_config(&spec)?;
        let kernel = SubprocessKernel::start(spec.kernel_id, config, spec.handle)?;
        Ok(Box::new(kernel))
    }
}

/// Kernel backed by a child process
pub struct SubprocessKernel {
    kernel_id: String,
    config: SpawnConfig,
    handle: ProcessHandle,
    writer: Option<FramedWrite<ChildStdin, LinesCodec>>,
    messages: mpsc::Receiver<KernelMessage>,
    readers: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SubprocessKernel {
    /// Spawn the process and its reader tasks
    pub fn start(
        kernel_id: String,
        config: SpawnConfig,
        handle: ProcessHandle,
    ) -> Result<Self, PoolError> {
        let (_, closed) = mpsc::channel(1);
        let mut kernel = Self {
            kernel_id,
            config,
            handle,
            writer: None,
            messages: closed,
            readers: Vec::new(),
            supervisor: None,
        };
        kernel.spawn()?;
        Ok(kernel)
    }

    fn spawn(&mut self) -> Result<(), PoolError> {
        let manager = ProcessManager::new();
        let mut child = manager.spawn(&self.config)?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(PoolError::SpawnFailed("kernel stdio not piped".to_string())),
        };

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        self.readers = vec![
            tokio::spawn(read_messages(self.kernel_id.clone(), stdout, tx)),
            tokio::spawn(log_stderr(self.kernel_id.clone(), stderr)),
        ];
        self.messages = rx;
        self.writer = Some(FramedWrite::new(stdin, LinesCodec::new()));
        self.supervisor = Some(manager.supervise(child, &self.handle));

        debug!(kernel_id = %self.kernel_id, pid = ?self.handle.pid(), "Kernel process started");
        Ok(())
    }

    async fn stop(&mut self, graceful: bool) {
        if graceful {
            let request = KernelRequest::ShutdownRequest {
                msg_id: ulid::Ulid::new().to_string(),
            };
            if let Err(e) = self.send(request).await {
                debug!(kernel_id = %self.kernel_id, "Shutdown request not delivered: {}", e);
            }
        }
        // closing stdin ends the driver's read loop
        self.writer = None;

        if let Some(mut supervisor) = self.supervisor.take() {
            let exited = graceful
                && tokio::time::timeout(SHUTDOWN_GRACE, &mut supervisor)
                    .await
                    .is_ok();

            if !exited {
                self.handle.kill();
                if tokio::time::timeout(KILL_WAIT, &mut supervisor).await.is_err() {
                    warn!(kernel_id = %self.kernel_id, "Kernel did not exit after kill");
                    supervisor.abort();
                }
            }
        }

        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

#[async_trait]
impl KernelProcess for SubprocessKernel {
    async fn send(&mut self, request: KernelRequest) -> Result<(), PoolError> {
        let line = serde_json::to_string(&request)
            .map_err(|e| PoolError::Kernel(format!("Failed to encode request: {}", e)))?;

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PoolError::Kernel("kernel channel closed".to_string()))?;

        writer.send(line).await.map_err(|e| {
            PoolError::Kernel(format!(
                "Failed to write request {} to kernel: {}",
                request.msg_id(),
                e
            ))
        })
    }

    async fn recv(&mut self, timeout: Duration) -> RecvOutcome {
        match tokio::time::timeout(timeout, self.messages.recv()).await {
            Ok(Some(message)) => RecvOutcome::Message(message),
            Ok(None) => RecvOutcome::Closed,
            Err(_) => RecvOutcome::Timeout,
        }
    }

    async fn restart(&mut self) -> Result<(), PoolError> {
        self.stop(false).await;
        self.spawn()
    }

    async fn shutdown(&mut self) {
        self.stop(true).await;
        debug!(kernel_id = %self.kernel_id, "Kernel shut down");
    }
}

impl Drop for SubprocessKernel {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.handle.kill();
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn read_messages(kernel_id: String, stdout: ChildStdout, tx: mpsc::Sender<KernelMessage>) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => match serde_json::from_str::<KernelMessage>(&line) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(kernel_id = %kernel_id, "Ignoring unparseable kernel line: {}", e),
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(kernel_id = %kernel_id, "Dropping kernel message over {} bytes", MAX_LINE_BYTES);
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(kernel_id = %kernel_id, "Kernel stdout closed: {}", e);
                break;
            }
        }
    }
}

async fn log_stderr(kernel_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(kernel_id = %kernel_id, "kernel stderr: {}", line);
    }
}
