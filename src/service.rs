// src/service.rs
//! Request/response layer in front of the pool and the workspace manager
//!
//! Every identifier is validated here, before it can reach a kernel or a
//! path. Failures become structured responses carrying a stable `code` and a
//! `retryable` flag; nothing in here returns `Err` to the caller.

use crate::identity::{CourseId, LabId, UserId};
use crate::runtime::kernel_pool::{AcquireStatus, KernelPool, PoolStats, SessionStatus};
use crate::runtime::protocol::{ExecutionResult, OutputEvent};
use crate::utils::errors::{EngineError, PoolError, Result};
use crate::workspace::{bundle_file_name, bundle_materials, Provisioned, SkippedItem, WorkspaceManager};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Failure payload shared by every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
    pub code: &'static str,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        Self {
            status: "error",
            message: err.to_string(),
            code: err.code(),
            retryable: err.is_retryable(),
        }
    }
}

/// Either a success body or an error body, serialized without a wrapper
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response<T, E = ErrorBody> {
    Ok(T),
    Failed(E),
}

impl<T> Response<T> {
    fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(body) => Response::Ok(body),
            Err(err) => Response::Failed(failure(&err)),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

fn failure(err: &EngineError) -> ErrorBody {
    match err {
        EngineError::Pool(PoolError::CapacityExceeded { .. })
        | EngineError::Pool(PoolError::StartupTimeout(_)) => warn!("Transient failure: {}", err),
        EngineError::Sandbox(_) | EngineError::InvalidRequest(_) => debug!("Rejected request: {}", err),
        EngineError::Pool(PoolError::NotFound) | EngineError::Pool(PoolError::StaleKernel) => {
            debug!("Kernel unavailable: {}", err)
        }
        _ => error!("Request failed: {}", err),
    }
    ErrorBody::from(err)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquireBody {
    pub kernel_id: String,
    pub status: AcquireStatus,
    pub message: String,
}

/// `run` failure also carries an empty output list, so clients can render it uniformly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    #[serde(flatten)]
    pub error: ErrorBody,
    pub outputs: Vec<OutputEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionBody {
    pub status: &'static str,
    pub message: String,
}

impl ActionBody {
    fn ok(message: &str) -> Self {
        Self {
            status: "ok",
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionBody {
    /// `copied`, `already_present` or `missing_source`
    pub outcome: &'static str,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveBody {
    pub message: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleBody {
    pub file_name: String,
    /// Base64-encoded zip archive
    pub data: String,
    pub included: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

impl From<SkippedItem> for SkippedEntry {
    fn from(item: SkippedItem) -> Self {
        Self {
            path: item.path,
            reason: item.reason,
        }
    }
}

/// One request as read off the wire
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceRequest {
    Acquire { user_id: i64, lab_id: String },
    Run { user_id: i64, lab_id: String, code: String },
    Interrupt { user_id: i64, lab_id: String },
    Restart { user_id: i64, lab_id: String },
    Release { user_id: i64, lab_id: String },
    Status { user_id: i64, lab_id: String },
    Stats,
    ProvisionNotebook { user_id: i64, path: String },
    OpenNotebook { user_id: i64, path: String },
    SaveNotebook { user_id: i64, path: String, notebook: serde_json::Value },
    BundleMaterials { course_id: String, files: Vec<String> },
}

/// A request plus the caller's correlation id
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub request: ServiceRequest,
}

/// Entry point used by the daemon
pub struct LabService {
    pool: Arc<KernelPool>,
    workspaces: WorkspaceManager,
}

impl LabService {
    pub fn new(pool: Arc<KernelPool>, workspaces: WorkspaceManager) -> Self {
        Self { pool, workspaces }
    }

    pub fn pool(&self) -> &Arc<KernelPool> {
        &self.pool
    }

    pub async fn acquire(&self, user_id: i64, lab_id: &str) -> Response<AcquireBody> {
        Response::from_result(self.try_acquire(user_id, lab_id).await)
    }

    async fn try_acquire(&self, user_id: i64, lab_id: &str) -> Result<AcquireBody> {
        let (user, lab) = parse_key(user_id, lab_id)?;
        let outcome = self.pool.acquire(user, lab).await?;
        let message = match outcome.status {
            AcquireStatus::Existing => "Using existing kernel",
            AcquireStatus::Created => "New kernel started",
        };
        Ok(AcquireBody {
            kernel_id: outcome.kernel_id,
            status: outcome.status,
            message: message.to_string(),
        })
    }

    pub async fn run(&self, user_id: i64, lab_id: &str, code: &str) -> Response<ExecutionResult, RunFailure> {
        match self.try_run(user_id, lab_id, code).await {
            Ok(result) => Response::Ok(result),
            Err(err) => Response::Failed(RunFailure {
                error: failure(&err),
                outputs: Vec::new(),
            }),
        }
    }

    async fn try_run(&self, user_id: i64, lab_id: &str, code: &str) -> Result<ExecutionResult> {
        let (user, lab) = parse_key(user_id, lab_id)?;

        let limit = self.workspaces.settings().max_code_bytes;
        if code.len() > limit {
            return Err(EngineError::InvalidRequest(format!(
                "code is {} bytes (max {} bytes)",
                code.len(),
                limit
            )));
        }

        Ok(self.pool.run(user, lab, code).await?)
    }

    pub async fn interrupt(&self, user_id: i64, lab_id: &str) -> Response<ActionBody> {
        Response::from_result(
            parse_key(user_id, lab_id).and_then(|(user, lab)| match self.pool.interrupt(user, lab) {
                Ok(()) => Ok(ActionBody::ok("Kernel interrupted")),
                Err(PoolError::NotFound) => Ok(ActionBody::ok("No kernel to interrupt")),
                Err(err) => Err(err.into()),
            }),
        )
    }

    pub async fn restart(&self, user_id: i64, lab_id: &str) -> Response<ActionBody> {
        let result = match parse_key(user_id, lab_id) {
            Ok((user, lab)) => match self.pool.restart(user, lab).await {
                Ok(()) => Ok(ActionBody::ok("Kernel restarted")),
                Err(PoolError::NotFound) => Ok(ActionBody::ok("No kernel to restart")),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err),
        };
        Response::from_result(result)
    }

    pub async fn release(&self, user_id: i64, lab_id: &str) -> Response<ActionBody> {
        let result = match parse_key(user_id, lab_id) {
            Ok((user, lab)) => Ok(if self.pool.release(user, lab).await {
                ActionBody::ok("Kernel shut down")
            } else {
                ActionBody::ok("No kernel to shut down")
            }),
            Err(err) => Err(err),
        };
        Response::from_result(result)
    }

    pub fn status(&self, user_id: i64, lab_id: &str) -> Response<SessionStatus> {
        Response::from_result(parse_key(user_id, lab_id).map(|(user, lab)| self.pool.status(user, lab)))
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Copy the lab notebook into the user's workspace if they have none yet
    pub fn provision_notebook(&self, user_id: i64, path: &str) -> Response<ProvisionBody> {
        let result = UserId::new(user_id)
            .and_then(|user| self.workspaces.provision_notebook(user, path))
            .map(|provisioned| {
                let outcome = match &provisioned {
                    Provisioned::Copied(_) => "copied",
                    Provisioned::AlreadyPresent(_) => "already_present",
                    Provisioned::MissingSource(_) => "missing_source",
                };
                ProvisionBody {
                    outcome,
                    path: provisioned.path().display().to_string(),
                }
            })
            .map_err(EngineError::from);
        Response::from_result(result)
    }

    pub fn open_notebook(&self, user_id: i64, path: &str) -> Response<serde_json::Value> {
        let result = UserId::new(user_id)
            .and_then(|user| self.workspaces.open_notebook(user, path))
            .map_err(EngineError::from);
        Response::from_result(result)
    }

    pub fn save_notebook(&self, user_id: i64, path: &str, notebook: &serde_json::Value) -> Response<SaveBody> {
        let result = UserId::new(user_id)
            .and_then(|user| self.workspaces.save_notebook(user, path, notebook))
            .map(|bytes_written| SaveBody {
                message: "Notebook saved successfully".to_string(),
                bytes_written,
            })
            .map_err(EngineError::from);
        Response::from_result(result)
    }

    /// Zip course materials. Bad items are skipped; only the size cap fails the bundle.
    pub async fn bundle_materials(&self, course_id: &str, files: Vec<String>) -> Response<BundleBody> {
        let course = match CourseId::parse(course_id) {
            Ok(course) => course,
            Err(err) => return Response::Failed(failure(&err.into())),
        };

        let root = self.workspaces.materials_root().to_path_buf();
        let limit = self.workspaces.settings().max_bundle_bytes;
        let joined = tokio::task::spawn_blocking(move || bundle_materials(&root, files, limit)).await;

        let result = match joined {
            Ok(Ok(bundle)) => Ok(BundleBody {
                file_name: bundle_file_name(&course),
                data: BASE64.encode(&bundle.data),
                included: bundle.included,
                skipped: bundle.skipped.into_iter().map(SkippedEntry::from).collect(),
                total_bytes: bundle.total_bytes,
            }),
            Ok(Err(err)) => Err(err.into()),
            Err(join) => Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("bundle task failed: {}", join),
            ))),
        };
        Response::from_result(result)
    }

    /// Dispatch one decoded request to a JSON response
    pub async fn handle(&self, request: ServiceRequest) -> serde_json::Value {
        let response = match request {
            ServiceRequest::Acquire { user_id, lab_id } => to_json(&self.acquire(user_id, &lab_id).await),
            ServiceRequest::Run { user_id, lab_id, code } => to_json(&self.run(user_id, &lab_id, &code).await),
            ServiceRequest::Interrupt { user_id, lab_id } => to_json(&self.interrupt(user_id, &lab_id).await),
            ServiceRequest::Restart { user_id, lab_id } => to_json(&self.restart(user_id, &lab_id).await),
            ServiceRequest::Release { user_id, lab_id } => to_json(&self.release(user_id, &lab_id).await),
            ServiceRequest::Status { user_id, lab_id } => to_json(&self.status(user_id, &lab_id)),
            ServiceRequest::Stats => to_json(&self.stats()),
            ServiceRequest::ProvisionNotebook { user_id, path } => {
                to_json(&self.provision_notebook(user_id, &path))
            }
            ServiceRequest::OpenNotebook { user_id, path } => to_json(&self.open_notebook(user_id, &path)),
            ServiceRequest::SaveNotebook {
                user_id,
                path,
                notebook,
            } => to_json(&self.save_notebook(user_id, &path, &notebook)),
            ServiceRequest::BundleMaterials { course_id, files } => {
                to_json(&self.bundle_materials(&course_id, files).await)
            }
        };

        response.unwrap_or_else(|err| {
            serde_json::to_value(failure(&err.into())).unwrap_or(serde_json::Value::Null)
        })
    }

    /// Decode one JSON line, handle it, and encode the reply (echoing `id`)
    pub async fn handle_line(&self, line: &str) -> String {
        let (id, mut reply) = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => (envelope.id, self.handle(envelope.request).await),
            Err(e) => {
                let err = EngineError::InvalidRequest(e.to_string());
                let body = serde_json::to_value(failure(&err)).unwrap_or(serde_json::Value::Null);
                (None, body)
            }
        };

        if let (Some(id), serde_json::Value::Object(map)) = (id, &mut reply) {
            map.insert("id".to_string(), id);
        }
        reply.to_string()
    }
}

fn parse_key(user_id: i64, lab_id: &str) -> Result<(UserId, LabId)> {
    let user = UserId::new(user_id)?;
    let lab = LabId::parse(lab_id)?;
    Ok((user, lab))
}

fn to_json<T: Serialize>(value: &T) -> std::result::Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(value)
}
