// backuptool/src/server/mod.rs
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::errors::TriggerError;
use crate::orchestrator::job::JobRecord;
use crate::orchestrator::{CancelOutcome, Orchestrator};

/// Control surface: maps the HTTP contract onto orchestrator calls. All
/// response bodies are JSON.
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/backup/{target}", post(trigger_backup))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/targets", get(list_targets))
        .route("/targets/{name}/snapshots", get(list_repo_snapshots))
        .route("/status", get(service_status))
        .with_state(orchestrator)
}

enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (
            status,
            Json(json!({ "status": "error", "message": message })),
        )
            .into_response()
    }
}

async fn trigger_backup(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(target): Path<String>,
) -> Result<Response, ApiError> {
    match orchestrator.trigger(&target) {
        Ok(job_id) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "job_id": job_id })),
        )
            .into_response()),
        Err(err @ TriggerError::TargetBusy { .. }) => Err(ApiError::Conflict(err.to_string())),
        Err(err @ TriggerError::UnknownTarget(_)) => Err(ApiError::NotFound(err.to_string())),
    }
}

/// Terminal jobs answer `200` with the full result; a running job answers
/// `202` with the current phase snapshot.
async fn job_status(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let record = orchestrator
        .job(id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown job: {id}")))?;
    let status = if record.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(record)).into_response())
}

async fn list_jobs(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Vec<JobRecord>> {
    Json(orchestrator.jobs())
}

async fn cancel_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match orchestrator.cancel(id) {
        CancelOutcome::Requested => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "cancelling", "job_id": id })),
        )
            .into_response()),
        CancelOutcome::AlreadyFinished => {
            Err(ApiError::Conflict(format!("job {id} already finished")))
        }
        CancelOutcome::Unknown => Err(ApiError::NotFound(format!("unknown job: {id}"))),
    }
}

async fn list_targets(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    // TargetConfig skips the password file on serialization, so this listing
    // never exposes credentials references.
    Json(orchestrator.targets().to_vec()).into_response()
}

async fn list_repo_snapshots(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let target = orchestrator
        .target(&name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown target: {name}")))?
        .clone();
    match orchestrator.repo_snapshots(&target).await {
        Ok(snapshots) => Ok(Json(snapshots).into_response()),
        Err(err) => {
            error!(target = %name, %err, "snapshot listing failed");
            Err(ApiError::Internal(format!(
                "failed to list snapshots: {err}"
            )))
        }
    }
}

async fn service_status(State(orchestrator): State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "started_at": orchestrator.started_at(),
        "running_jobs": orchestrator.running_jobs(),
        "targets": orchestrator.targets().len(),
    }))
}
