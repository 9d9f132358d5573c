// src/runtime/kernel_pool.rs
//! Bounded pool of interactive kernels keyed by `(user, lab)`
//!
//! # Architecture
//!
//! ```text
//! KernelPool
//! ├─ sessions: Mutex<HashMap<SessionKey, Arc<KernelSession>>>   (membership only)
//! │    └─ KernelSession
//! │         ├─ ProcessHandle                (interrupt / kill / liveness, lock-free)
//! │         └─ tokio::Mutex<KernelProcess>  (one caller talks to the kernel at a time)
//! └─ sweeper task                           (idle + dead reclamation)
//! ```
//!
//! The registry lock is never held across an `.await`. Starting a kernel,
//! draining output and shutting a kernel down all happen under the session's
//! own lock, so a slow kernel only ever blocks callers of the same key.
//!
//! A session that is still starting counts towards `max_kernels` but is never
//! chosen for eviction or reclaimed by the sweeper. The same holds while a
//! restart is pending: its process is down on purpose, so it is not stale.
//! A start that never completes, because it failed or because the `acquire`
//! future was dropped, withdraws its registry entry.

use crate::identity::{LabId, UserId};
use crate::observability::{
    EVICTED_TOTAL, EXECUTIONS_TOTAL, SESSIONS, STARTED_TOTAL, START_FAILURES_TOTAL,
};
use crate::runtime::kernel::{
    KernelLauncher, KernelProcess, LaunchSpec, RecvOutcome, FIGURE_CAPTURE, STARTUP_PREAMBLE,
};
use crate::runtime::protocol::{
    classify, Classified, ExecutionResult, KernelRequest, OutputCollector, OutputEvent,
};
use crate::runtime::session::{KernelGuard, KernelSession, SessionKey};
use crate::utils::config::PoolSettings;
use crate::utils::errors::PoolError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard ceiling on sessions (starting ones included)
    pub max_kernels: usize,

    /// Inactivity after which the sweeper reclaims a session
    pub idle_timeout: Duration,

    /// Sweeper period
    pub sweep_interval: Duration,

    /// Maximum wait for a kernel to become ready
    pub startup_timeout: Duration,

    /// Per-read timeout while draining execution output
    pub read_timeout: Duration,

    /// Per-read timeout while draining the startup preamble
    pub preamble_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_kernels: settings.max_kernels,
            idle_timeout: settings.idle_timeout(),
            sweep_interval: settings.sweep_interval(),
            startup_timeout: settings.startup_timeout(),
            read_timeout: settings.read_timeout(),
            preamble_timeout: settings.preamble_timeout(),
        }
    }
}

/// Whether `acquire` reused a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireStatus {
    Existing,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquireOutcome {
    pub kernel_id: String,
    pub status: AcquireStatus,
}

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    None,
    Running,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    #[serde(rename = "status")]
    pub state: KernelState,
    pub kernel_id: Option<String>,
    pub execution_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionStatus {
    fn absent() -> Self {
        Self {
            state: KernelState::None,
            kernel_id: None,
            execution_count: 0,
            created_at: None,
            last_activity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live: usize,
    pub max_kernels: usize,
}

/// Why the pool tore a session down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Made room for a new session
    Lru,
    /// Inactive past the idle timeout
    Idle,
    /// Process had exited
    Dead,
}

impl EvictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictReason::Lru => "lru",
            EvictReason::Idle => "idle",
            EvictReason::Dead => "dead",
        }
    }
}

/// Pool of kernel sessions
pub struct KernelPool {
    config: PoolConfig,
    launcher: Arc<dyn KernelLauncher>,
    sessions: Mutex<HashMap<SessionKey, Arc<KernelSession>>>,
    shutdown: CancellationToken,
}

impl KernelPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn KernelLauncher>) -> Arc<Self> {
        info!(
            "Initializing kernel pool: max {} kernels, idle timeout {:?}",
            config.max_kernels, config.idle_timeout
        );

        Arc::new(Self {
            config,
            launcher,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the live session for the key, starting one if needed
    pub async fn acquire(&self, user_id: UserId, lab_id: LabId) -> Result<AcquireOutcome, PoolError> {
        let key = SessionKey::new(user_id, lab_id);

        loop {
            let existing = self.sessions.lock().get(&key).cloned();
            if let Some(session) = existing {
                if session.is_starting() {
                    // whoever is starting it holds the lock until it is ready or gone
                    drop(session.kernel().lock().await);
                    continue;
                }
                if session.is_dead() {
                    self.reap_stale(&session).await;
                    continue;
                }
                session.touch();
                debug!(key = %key, kernel_id = %session.kernel_id(), "Reusing kernel");
                return Ok(AcquireOutcome {
                    kernel_id: session.kernel_id().to_string(),
                    status: AcquireStatus::Existing,
                });
            }

            let (session, guard) = KernelSession::starting(key.clone()).await;
            let admission = {
                let mut sessions = self.sessions.lock();
                if sessions.contains_key(&key) {
                    Admission::Raced
                } else {
                    let mut victims = Vec::new();
                    while sessions.len() >= self.config.max_kernels {
                        let Some(lru) = Self::least_recently_used(&sessions) else {
                            break;
                        };
                        if let Some(victim) = sessions.remove(&lru) {
                            victims.push(victim);
                        }
                    }

                    if sessions.len() >= self.config.max_kernels {
                        Admission::Full(victims)
                    } else {
                        sessions.insert(key.clone(), Arc::clone(&session));
                        metrics::gauge!(SESSIONS).set(sessions.len() as f64);
                        Admission::Admitted(victims)
                    }
                }
            };

            let victims = match admission {
                // lost a race with another acquire for the same key
                Admission::Raced => continue,
                Admission::Full(victims) => {
                    self.teardown_all(victims, Some(EvictReason::Lru)).await;
                    warn!(key = %key, "Kernel pool at capacity ({})", self.config.max_kernels);
                    return Err(PoolError::CapacityExceeded {
                        max_kernels: self.config.max_kernels,
                    });
                }
                Admission::Admitted(victims) => victims,
            };
            let pending = PendingStart::new(self, session);

            for victim in &victims {
                info!(key = %victim.key(), kernel_id = %victim.kernel_id(), "Evicting least recently used kernel");
            }
            self.teardown_all(victims, Some(EvictReason::Lru)).await;

            return self.start(pending, guard).await;
        }
    }

    fn least_recently_used(sessions: &HashMap<SessionKey, Arc<KernelSession>>) -> Option<SessionKey> {
        sessions
            .values()
            .filter(|session| !session.is_transitioning())
            .min_by_key(|session| session.last_activity())
            .map(|session| session.key().clone())
    }

    async fn start(
        &self,
        pending: PendingStart<'_>,
        mut guard: KernelGuard,
    ) -> Result<AcquireOutcome, PoolError> {
        let started = std::time::Instant::now();
        let session = Arc::clone(&pending.session);

        match self.launch(&session).await {
            Ok(kernel) => {
                *guard = Some(kernel);
                pending.complete();
                session.touch();
                drop(guard);

                metrics::counter!(STARTED_TOTAL).increment(1);
                info!(
                    key = %session.key(),
                    kernel_id = %session.kernel_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Kernel started"
                );
                Ok(AcquireOutcome {
                    kernel_id: session.kernel_id().to_string(),
                    status: AcquireStatus::Created,
                })
            }
            Err(e) => {
                drop(pending);
                drop(guard);

                metrics::counter!(START_FAILURES_TOTAL).increment(1);
                warn!(key = %session.key(), "Kernel failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(&self, session: &KernelSession) -> Result<Box<dyn KernelProcess>, PoolError> {
        let spec = LaunchSpec {
            kernel_id: session.kernel_id().to_string(),
            user_id: session.key().user_id,
            handle: session.handle().clone(),
        };
        let mut kernel = self.launcher.launch(spec).await?;

        if let Err(e) = kernel.wait_for_ready(self.config.startup_timeout).await {
            kernel.shutdown().await;
            return Err(e);
        }

        self.run_preamble(kernel.as_mut()).await;
        Ok(kernel)
    }

    /// Run the startup preamble and discard whatever it prints
    async fn run_preamble(&self, kernel: &mut dyn KernelProcess) {
        let msg_id = ulid::Ulid::new().to_string();
        let request = KernelRequest::ExecuteRequest {
            msg_id: msg_id.clone(),
            code: STARTUP_PREAMBLE.to_string(),
            epilogue: None,
            silent: true,
        };

        if let Err(e) = kernel.send(request).await {
            warn!("Failed to send startup preamble: {}", e);
            return;
        }

        let (outputs, _) = drain(kernel, &msg_id, self.config.preamble_timeout).await;
        if !outputs.is_empty() {
            debug!("Discarded {} preamble outputs", outputs.len());
        }
    }

    /// Execute code and collect its outputs in emission order
    pub async fn run(&self, user_id: UserId, lab_id: LabId, code: &str) -> Result<ExecutionResult, PoolError> {
        let key = SessionKey::new(user_id, lab_id);
        let session = self.lookup(&key)?;

        let (outputs, ended, execution_count) = loop {
            let mut guard = Arc::clone(session.kernel()).lock_owned().await;
            if !self.is_registered(&session) {
                return Err(PoolError::NotFound);
            }
            if session.is_restarting() {
                // requeue behind the restart and run on the fresh kernel
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }
            if session.is_dead() {
                warn!(key = %key, "Kernel process died; removing session");
                self.teardown_locked(&session, guard, Some(EvictReason::Dead)).await;
                return Err(PoolError::StaleKernel);
            }
            let kernel = guard.as_mut().ok_or(PoolError::NotFound)?;

            session.touch();
            let msg_id = ulid::Ulid::new().to_string();
            let request = KernelRequest::ExecuteRequest {
                msg_id: msg_id.clone(),
                code: code.to_string(),
                epilogue: Some(FIGURE_CAPTURE.to_string()),
                silent: false,
            };

            if let Err(e) = kernel.send(request).await {
                if session.handle().is_alive() {
                    return Err(e);
                }
                if session.is_restarting() {
                    drop(guard);
                    tokio::task::yield_now().await;
                    continue;
                }
                warn!(key = %key, "Kernel process died; removing session");
                self.teardown_locked(&session, guard, Some(EvictReason::Dead)).await;
                return Err(PoolError::StaleKernel);
            }

            let execution_count = session.next_execution();
            let (outputs, ended) = drain(kernel.as_mut(), &msg_id, self.config.read_timeout).await;
            session.touch();
            break (outputs, ended, execution_count);
        };

        let mut collector = outputs;
        if ended == DrainEnd::Closed {
            collector.push(OutputEvent::Error {
                name: "KernelDied".to_string(),
                message: "kernel process exited during execution".to_string(),
                trace: String::new(),
            });
        }

        metrics::counter!(EXECUTIONS_TOTAL).increment(1);
        let result = collector.finish(execution_count);
        debug!(
            key = %key,
            execution_count,
            outputs = result.outputs.len(),
            status = ?result.status,
            "Execution finished"
        );
        Ok(result)
    }

    /// Ask the kernel to abort the running cell. No-op when idle.
    pub fn interrupt(&self, user_id: UserId, lab_id: LabId) -> Result<(), PoolError> {
        let key = SessionKey::new(user_id, lab_id);
        let session = self.lookup(&key)?;

        if session.handle().interrupt() {
            info!(key = %key, "Interrupt sent");
        } else {
            debug!(key = %key, "Interrupt skipped: no live process");
        }
        Ok(())
    }

    /// Respawn the kernel, reset the execution counter and rerun the preamble
    pub async fn restart(&self, user_id: UserId, lab_id: LabId) -> Result<(), PoolError> {
        let key = SessionKey::new(user_id, lab_id);
        let session = self.lookup(&key)?;
        let _restarting = session.begin_restart();

        // a runaway cell must not hold the session lock against a restart
        if !session.is_starting() {
            session.handle().kill();
        }

        let mut guard = Arc::clone(session.kernel()).lock_owned().await;
        if !self.is_registered(&session) {
            return Err(PoolError::NotFound);
        }
        let kernel = guard.as_mut().ok_or(PoolError::NotFound)?;

        kernel.restart().await?;
        kernel.wait_for_ready(self.config.startup_timeout).await?;
        session.reset_execution_count();
        self.run_preamble(kernel.as_mut()).await;
        session.touch();

        info!(key = %key, kernel_id = %session.kernel_id(), "Kernel restarted");
        Ok(())
    }

    /// Tear the session down. Returns whether one existed.
    pub async fn release(&self, user_id: UserId, lab_id: LabId) -> bool {
        let key = SessionKey::new(user_id, lab_id);
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&key);
            metrics::gauge!(SESSIONS).set(sessions.len() as f64);
            removed
        };

        match removed {
            Some(session) => {
                info!(key = %key, kernel_id = %session.kernel_id(), "Releasing kernel");
                Self::teardown(session, None).await;
                true
            }
            None => {
                debug!(key = %key, "Release: no kernel");
                false
            }
        }
    }

    pub fn status(&self, user_id: UserId, lab_id: LabId) -> SessionStatus {
        let key = SessionKey::new(user_id, lab_id);
        let Some(session) = self.sessions.lock().get(&key).cloned() else {
            return SessionStatus::absent();
        };

        let state = if session.is_dead() {
            KernelState::Dead
        } else {
            KernelState::Running
        };

        SessionStatus {
            state,
            kernel_id: Some(session.kernel_id().to_string()),
            execution_count: session.execution_count(),
            created_at: Some(session.created_at()),
            last_activity: Some(session.last_activity()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.sessions.lock().len(),
            max_kernels: self.config.max_kernels,
        }
    }

    /// Reclaim idle and dead sessions now
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`. Busy sessions are skipped.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<(Arc<KernelSession>, EvictReason)> = self
            .sessions
            .lock()
            .values()
            .filter_map(|session| {
                self.reclaim_reason(session, now)
                    .map(|reason| (Arc::clone(session), reason))
            })
            .collect();

        let mut reclaimed = 0;
        for (session, reason) in candidates {
            let Ok(guard) = Arc::clone(session.kernel()).try_lock_owned() else {
                debug!(key = %session.key(), "Sweep: kernel busy, skipping");
                continue;
            };
            // state may have moved on since the snapshot
            if self.reclaim_reason(&session, now) != Some(reason) || !self.is_registered(&session) {
                continue;
            }

            info!(
                key = %session.key(),
                kernel_id = %session.kernel_id(),
                reason = reason.as_str(),
                "Reclaiming kernel"
            );
            self.teardown_locked(&session, guard, Some(reason)).await;
            reclaimed += 1;
        }

        reclaimed
    }

    fn reclaim_reason(&self, session: &KernelSession, now: DateTime<Utc>) -> Option<EvictReason> {
        if session.is_transitioning() {
            return None;
        }
        if session.is_dead() {
            return Some(EvictReason::Dead);
        }

        let idle = (now - session.last_activity())
            .to_std()
            .map(|idle| idle > self.config.idle_timeout)
            .unwrap_or(false);
        idle.then_some(EvictReason::Idle)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until
    /// [`shutdown_all`](Self::shutdown_all) or the pool is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let reclaimed = pool.sweep().await;
                        if reclaimed > 0 {
                            info!("Sweeper reclaimed {} kernels", reclaimed);
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Stop the sweeper and terminate every session. Returns how many were torn down.
    pub async fn shutdown_all(&self) -> usize {
        self.shutdown.cancel();

        let sessions: Vec<_> = {
            let mut sessions = self.sessions.lock();
            let drained = sessions.drain().map(|(_, session)| session).collect();
            metrics::gauge!(SESSIONS).set(0.0);
            drained
        };

        let count = sessions.len();
        info!("Shutting down {} kernels", count);
        self.teardown_all(sessions, None).await;
        count
    }

    fn lookup(&self, key: &SessionKey) -> Result<Arc<KernelSession>, PoolError> {
        self.sessions
            .lock()
            .get(key)
            .cloned()
            .ok_or(PoolError::NotFound)
    }

    fn is_registered(&self, session: &Arc<KernelSession>) -> bool {
        self.sessions
            .lock()
            .get(session.key())
            .map_or(false, |current| Arc::ptr_eq(current, session))
    }

    /// Remove this exact session (not a newer one under the same key)
    fn remove_entry(&self, session: &Arc<KernelSession>) -> bool {
        let mut sessions = self.sessions.lock();
        let same = sessions
            .get(session.key())
            .map_or(false, |current| Arc::ptr_eq(current, session));
        if same {
            sessions.remove(session.key());
            metrics::gauge!(SESSIONS).set(sessions.len() as f64);
        }
        same
    }

    /// Remove a session whose process died, once nobody is using it
    async fn reap_stale(&self, session: &Arc<KernelSession>) {
        let guard = Arc::clone(session.kernel()).lock_owned().await;
        if session.is_dead() && self.is_registered(session) {
            warn!(key = %session.key(), "Removing stale kernel");
            self.teardown_locked(session, guard, Some(EvictReason::Dead)).await;
        }
    }

    async fn teardown_locked(&self, session: &Arc<KernelSession>, mut guard: KernelGuard, reason: Option<EvictReason>) {
        self.remove_entry(session);
        session.handle().kill();
        if let Some(mut kernel) = guard.take() {
            kernel.shutdown().await;
        }
        if let Some(reason) = reason {
            metrics::counter!(EVICTED_TOTAL, "reason" => reason.as_str()).increment(1);
        }
    }

    /// Terminate a session already removed from the registry
    async fn teardown(session: Arc<KernelSession>, reason: Option<EvictReason>) {
        // kill first so a running cell cannot hold the lock
        session.handle().kill();
        let mut guard = session.kernel().lock().await;
        if let Some(mut kernel) = guard.take() {
            kernel.shutdown().await;
        }
        if let Some(reason) = reason {
            metrics::counter!(EVICTED_TOTAL, "reason" => reason.as_str()).increment(1);
        }
        debug!(key = %session.key(), kernel_id = %session.kernel_id(), "Kernel torn down");
    }

    async fn teardown_all(&self, sessions: Vec<Arc<KernelSession>>, reason: Option<EvictReason>) {
        futures::future::join_all(
            sessions
                .into_iter()
                .map(|session| Self::teardown(session, reason)),
        )
        .await;
    }
}

impl Drop for KernelPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // sessions still registered kill their processes when their kernels drop
        for session in self.sessions.get_mut().values() {
            session.handle().kill();
        }
    }
}

/// A registered session whose kernel is not up yet.
///
/// Dropping it without [`complete`](Self::complete) withdraws the session:
/// the entry leaves the registry, any half-started process is killed and
/// callers waiting on the session lock see it gone.
struct PendingStart<'a> {
    pool: &'a KernelPool,
    session: Arc<KernelSession>,
    armed: bool,
}

impl<'a> PendingStart<'a> {
    fn new(pool: &'a KernelPool, session: Arc<KernelSession>) -> Self {
        Self {
            pool,
            session,
            armed: true,
        }
    }

    fn complete(mut self) {
        self.armed = false;
        self.session.mark_ready();
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.pool.remove_entry(&self.session) {
            debug!(key = %self.session.key(), "Withdrawing kernel that never started");
        }
        self.session.handle().kill();
        self.session.mark_ready();
    }
}

/// Registry decision for a new session
enum Admission {
    Raced,
    Full(Vec<Arc<KernelSession>>),
    Admitted(Vec<Arc<KernelSession>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    Idle,
    Timeout,
    Closed,
}

/// Read messages for `msg_id` until idle, a quiet period of `read_timeout`,
/// or the kernel going away. Messages for other requests are dropped.
async fn drain(
    kernel: &mut dyn KernelProcess,
    msg_id: &str,
    read_timeout: Duration,
) -> (OutputCollector, DrainEnd) {
    let mut collector = OutputCollector::new();

    loop {
        match kernel.recv(read_timeout).await {
            RecvOutcome::Message(message) => {
                if !message.is_reply_to(msg_id) {
                    debug!(parent_id = ?message.parent_id, "Dropping stale kernel output");
                    continue;
                }
                match classify(message.body) {
                    Classified::Idle => return (collector, DrainEnd::Idle),
                    Classified::Output(event) => collector.push(event),
                    Classified::Ignored => {}
                }
            }
            RecvOutcome::Timeout => {
                warn!(
                    "No kernel output for {:?}; returning {} collected outputs",
                    read_timeout,
                    collector.len()
                );
                return (collector, DrainEnd::Timeout);
            }
            RecvOutcome::Closed => {
                warn!("Kernel output closed mid-execution");
                return (collector, DrainEnd::Closed);
            }
        }
    }
}
