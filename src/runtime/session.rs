// src/runtime/session.rs
//! One kernel bound to one `(user, lab)` pair

use crate::identity::{LabId, UserId};
use crate::runtime::kernel::KernelProcess;
use crate::runtime::process_manager::ProcessHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub user_id: UserId,
    pub lab_id: LabId,
}

impl SessionKey {
    pub fn new(user_id: UserId, lab_id: LabId) -> Self {
        Self { user_id, lab_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.lab_id)
    }
}

/// Kernel slot guarded by the per-session lock. `None` once shut down.
pub type KernelSlot = Arc<tokio::sync::Mutex<Option<Box<dyn KernelProcess>>>>;

/// Owned guard over a [`KernelSlot`]
pub type KernelGuard = tokio::sync::OwnedMutexGuard<Option<Box<dyn KernelProcess>>>;

/// Pool entry for one live (or starting) kernel.
///
/// The registry lock only guards which sessions exist. Everything that talks
/// to the kernel goes through [`KernelSession::kernel`], so two callers on the
/// same key serialize while callers on different keys never contend.
pub struct KernelSession {
    kernel_id: String,
    key: SessionKey,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    handle: ProcessHandle,
    starting: AtomicBool,
    restarts: AtomicUsize,
    execution_count: AtomicU64,
    kernel: KernelSlot,
}

impl KernelSession {
    /// New session in the starting state, with its kernel lock already held
    /// by the caller that will start it
    pub async fn starting(key: SessionKey) -> (Arc<Self>, KernelGuard) {
        let kernel: KernelSlot = Arc::new(tokio::sync::Mutex::new(None));
        let guard = Arc::clone(&kernel).lock_owned().await;

        let now = Utc::now();
        let session = Arc::new(Self {
            kernel_id: ulid::Ulid::new().to_string(),
            key,
            created_at: now,
            last_activity: Mutex::new(now),
            handle: ProcessHandle::new(),
            starting: AtomicBool::new(true),
            restarts: AtomicUsize::new(0),
            execution_count: AtomicU64::new(0),
            kernel,
        });
        (session, guard)
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn kernel(&self) -> &KernelSlot {
        &self.kernel
    }

    /// Record activity now
    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub(crate) fn touch_at(&self, at: DateTime<Utc>) {
        let mut last = self.last_activity.lock();
        if at > *last {
            *last = at;
        }
    }

    /// Still waiting for the kernel to come up
    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.starting.store(false, Ordering::Release);
    }

    /// A restart has been requested and has not finished yet
    pub fn is_restarting(&self) -> bool {
        self.restarts.load(Ordering::Acquire) > 0
    }

    /// Starting or restarting: the process may legitimately be down
    pub fn is_transitioning(&self) -> bool {
        self.is_starting() || self.is_restarting()
    }

    /// Mark a restart in progress until the returned guard drops
    pub(crate) fn begin_restart(&self) -> RestartGuard<'_> {
        self.restarts.fetch_add(1, Ordering::AcqRel);
        RestartGuard { session: self }
    }

    /// Process gone outside of a start or restart
    pub fn is_dead(&self) -> bool {
        !self.is_transitioning() && !self.handle.is_alive()
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Acquire)
    }

    /// Bump and return the counter. Callers hold the kernel lock, so
    /// increments on one session never interleave.
    pub(crate) fn next_execution(&self) -> u64 {
        self.execution_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_execution_count(&self) {
        self.execution_count.store(0, Ordering::Release);
    }
}

impl fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSession")
            .field("kernel_id", &self.kernel_id)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity())
            .field("starting", &self.is_starting())
            .field("restarting", &self.is_restarting())
            .field("execution_count", &self.execution_count())
            .finish()
    }
}

/// Clears one pending restart on drop, including when the restart is cancelled
pub(crate) struct RestartGuard<'a> {
    session: &'a KernelSession,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.session.restarts.fetch_sub(1, Ordering::AcqRel);
    }
}
