// src/runtime/testing.rs
//! Scripted in-memory kernels for pool tests
//!
//! Each line of submitted code is one directive:
//!
//! | line            | effect                                   |
//! |-----------------|------------------------------------------|
//! | `print <text>`  | `stream` on stdout                        |
//! | `eprint <text>` | `stream` on stderr                        |
//! | `result <text>` | `execute_result` with text/plain          |
//! | `image <b64>`   | `display_data` with image/png             |
//! | `raise <N> <m>` | `error` named `N` with message `m`        |
//! | `sleep <ms>`    | pause before the next directive           |
//! | `hang`          | block until interrupted                   |
//! | `stall`         | stop without ever reporting idle          |
//! | `die`           | the process exits                         |
//!
//! Anything else is ignored, which covers the startup preamble.

use crate::runtime::kernel::{KernelLauncher, KernelProcess, LaunchSpec, RecvOutcome};
use crate::runtime::process_manager::{ControlSignal, ProcessHandle};
use crate::runtime::protocol::{
    ExecutionState, KernelMessage, KernelRequest, MessageBody, MimeBundle, IMAGE_PNG, TEXT_PLAIN,
};
use crate::utils::errors::PoolError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// One recorded execute request
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Executed {
    pub kernel_id: String,
    pub code: String,
    pub epilogue: Option<String>,
    pub silent: bool,
}

#[derive(Default)]
struct MockState {
    launches: AtomicUsize,
    restarts: AtomicUsize,
    live: AtomicUsize,
    fail_launch: AtomicBool,
    never_ready: AtomicBool,
    startup_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executed: Mutex<Vec<Executed>>,
}

/// Launcher producing [`MockKernel`]s
#[derive(Clone, Default)]
pub(crate) struct MockLauncher {
    state: Arc<MockState>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.state.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn never_ready(&self, never: bool) {
        self.state.never_ready.store(never, Ordering::SeqCst);
    }

    pub fn startup_delay(&self, delay: Duration) {
        *self.state.startup_delay.lock() = delay;
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.state.restarts.load(Ordering::SeqCst)
    }

    /// Kernels launched and not yet shut down or dropped
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Highest number of executions any kernel had in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.executed.lock().clone()
    }
}

#[async_trait]
impl KernelLauncher for MockLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn KernelProcess>, PoolError> {
        if self.state.fail_launch.load(Ordering::SeqCst) {
            return Err(PoolError::SpawnFailed("mock launch refused".to_string()));
        }
        let pid = self.state.launches.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        self.state.live.fetch_add(1, Ordering::SeqCst);

        let mut kernel = MockKernel {
            kernel_id: spec.kernel_id,
            state: Arc::clone(&self.state),
            handle: spec.handle,
            interrupted: Arc::new(Notify::new()),
            tx: mpsc::unbounded_channel().0,
            queue: mpsc::unbounded_channel().1,
            closed: false,
        };
        kernel.boot(pid);
        Ok(Box::new(kernel))
    }
}

/// In-memory kernel following the directive table above
pub(crate) struct MockKernel {
    kernel_id: String,
    state: Arc<MockState>,
    handle: ProcessHandle,
    interrupted: Arc<Notify>,
    tx: mpsc::UnboundedSender<KernelMessage>,
    queue: mpsc::UnboundedReceiver<KernelMessage>,
    closed: bool,
}

impl MockKernel {
    fn boot(&mut self, pid: u32) {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let generation = self.handle.attach(Some(pid), control_tx);
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = tx;
        self.queue = rx;
        self.interrupted = Arc::new(Notify::new());

        let handle = self.handle.clone();
        let interrupted = Arc::clone(&self.interrupted);
        tokio::spawn(async move {
            while let Some(signal) = control_rx.recv().await {
                match signal {
                    ControlSignal::Interrupt => interrupted.notify_waiters(),
                    ControlSignal::Kill => break,
                }
            }
            handle.mark_exited(generation);
        });
    }

    fn close(&mut self) {
        self.handle.kill();
        if !self.closed {
            self.closed = true;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn execute(&self, msg_id: String, code: String) {
        let tx = self.tx.clone();
        let handle = self.handle.clone();
        let interrupted = Arc::clone(&self.interrupted);
        let state = Arc::clone(&self.state);

        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::spawn(async move {
            let emit = |body: MessageBody| {
                let _ = tx.send(KernelMessage::new(msg_id.clone(), body));
            };
            emit(MessageBody::Status {
                execution_state: ExecutionState::Busy,
            });

            let mut report_idle = true;
            for line in code.lines() {
                let (directive, rest) = line.split_once(' ').unwrap_or((line, ""));
                match directive {
                    "print" | "eprint" => emit(MessageBody::Stream {
                        name: if directive == "print" { "stdout" } else { "stderr" }.to_string(),
                        text: rest.to_string(),
                    }),
                    "result" => emit(MessageBody::ExecuteResult {
                        data: bundle(TEXT_PLAIN, rest),
                        execution_count: None,
                    }),
                    "image" => emit(MessageBody::DisplayData {
                        data: bundle(IMAGE_PNG, rest),
                    }),
                    "raise" => {
                        let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
                        emit(MessageBody::Error {
                            ename: Some(name.to_string()),
                            evalue: message.to_string(),
                            traceback: vec![format!("Traceback: {}", name)],
                        });
                    }
                    "sleep" => {
                        let ms = rest.trim().parse().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    "hang" => {
                        interrupted.notified().await;
                        emit(MessageBody::Error {
                            ename: Some("KeyboardInterrupt".to_string()),
                            evalue: String::new(),
                            traceback: vec![],
                        });
                        break;
                    }
                    "stall" => {
                        report_idle = false;
                        break;
                    }
                    "die" => {
                        handle.kill();
                        report_idle = false;
                        break;
                    }
                    _ => {}
                }
            }

            // done before idle so the next request never overlaps this one
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            if report_idle {
                emit(MessageBody::Status {
                    execution_state: ExecutionState::Idle,
                });
            }
        });
    }
}

fn bundle(mime: &str, value: &str) -> MimeBundle {
    let mut data = MimeBundle::new();
    data.insert(mime.to_string(), serde_json::Value::String(value.to_string()));
    data
}

#[async_trait]
impl KernelProcess for MockKernel {
    async fn send(&mut self, request: KernelRequest) -> Result<(), PoolError> {
        if !self.handle.is_alive() {
            return Err(PoolError::Kernel("broken pipe".to_string()));
        }

        match request {
            KernelRequest::KernelInfoRequest { msg_id } => {
                if self.state.never_ready.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let delay = *self.state.startup_delay.lock();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(KernelMessage::new(
                        msg_id,
                        MessageBody::KernelInfoReply {
                            language: Some("mock".to_string()),
                            language_version: None,
                        },
                    ));
                });
            }
            KernelRequest::ExecuteRequest {
                msg_id,
                code,
                epilogue,
                silent,
            } => {
                self.state.executed.lock().push(Executed {
                    kernel_id: self.kernel_id.clone(),
                    code: code.clone(),
                    epilogue,
                    silent,
                });
                self.execute(msg_id, code);
            }
            KernelRequest::ShutdownRequest { .. } => {
                self.handle.kill();
            }
        }
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> RecvOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(message) = self.queue.try_recv() {
                return RecvOutcome::Message(message);
            }
            if !self.handle.is_alive() {
                return RecvOutcome::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return RecvOutcome::Timeout;
            }

            let tick = (deadline - now).min(Duration::from_millis(5));
            tokio::select! {
                message = self.queue.recv() => {
                    if let Some(message) = message {
                        return RecvOutcome::Message(message);
                    }
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    async fn restart(&mut self) -> Result<(), PoolError> {
        self.handle.kill();
        self.state.restarts.fetch_add(1, Ordering::SeqCst);
        let pid = self.state.launches.load(Ordering::SeqCst) as u32 + 1000;
        self.boot(pid);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.close();
    }
}

impl Drop for MockKernel {
    fn drop(&mut self) {
        self.close();
    }
}
