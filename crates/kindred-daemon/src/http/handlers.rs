//! API handlers and shared state.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use kindred_core::aggregate::{Aggregator, ComputeError};
use kindred_core::model::{AnalysisStatus, Step, TestReport};
use kindred_core::status::StatusLedger;
use kindred_core::store::{ArtifactStore, ResultStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::metrics::SharedMetrics;

use super::error::ApiError;
use super::rate_limit::RateLimiter;

/// Body of `POST /api/v1/compute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// Drive to analyse.
    #[serde(rename = "driveId")]
    pub drive_id: String,
}

/// 202 body of a freshly accepted computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResponse {
    /// Pipeline step at acceptance time.
    pub step: Step,
    /// Echo of the drive id.
    #[serde(rename = "testId")]
    pub test_id: String,
}

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Artifact reads.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Result and report writes.
    pub results: Arc<dyn ResultStore>,
    /// Pipeline-step ledger.
    pub status: Arc<dyn StatusLedger>,
    /// Drive-level analysis orchestrator.
    pub aggregator: Arc<Aggregator>,
    /// Bounds concurrent drive computations.
    pub compute_sem: Arc<Semaphore>,
    /// Deadline for one drive computation.
    pub computation_timeout: Duration,
    /// Bearer secret required on API routes.
    pub api_secret: Arc<String>,
    /// Per-client request limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Daemon metrics.
    pub metrics: SharedMetrics,
    /// Fires on process shutdown.
    pub shutdown: CancellationToken,
}

/// `GET /health`.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// `GET /metrics`: Prometheus text format.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to encode metrics");
            ApiError::internal("Failed to encode metrics").into_response()
        },
    }
}

/// `POST /api/v1/compute`: accepts a drive computation.
///
/// Validates the drive, rejects re-computation of a completed report,
/// acquires a computation permit, records the pending report, and runs the
/// aggregation asynchronously under the process-wide deadline.
///
/// # Errors
///
/// - 400 for a malformed body, empty drive id, or a drive with no
///   artifacts.
/// - 409 when a completed report already exists.
/// - 500 when the stores are unreachable.
pub async fn compute(
    State(state): State<AppState>,
    payload: Result<Json<ComputeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload
        .map_err(|_| ApiError::bad_request("Invalid request body", "INVALID_REQUEST"))?;
    if request.drive_id.is_empty() {
        return Err(ApiError::bad_request("driveId is required", "INVALID_DRIVE_ID"));
    }
    let drive_id = request.drive_id;

    let count = state
        .artifacts
        .count_by_drive(&drive_id)
        .await
        .map_err(|error| {
            tracing::error!(drive_id, %error, "failed to check artifacts");
            ApiError::internal("Failed to check artifacts")
        })?;
    if count == 0 {
        return Err(ApiError::bad_request(
            "No artifacts found for driveId",
            "DRIVE_ID_NOT_FOUND",
        ));
    }

    let report = state
        .results
        .report_by_drive(&drive_id)
        .await
        .map_err(|error| {
            tracing::error!(drive_id, %error, "failed to check computation status");
            ApiError::internal("Failed to check computation status")
        })?;
    if report.is_some_and(|report| report.status == AnalysisStatus::Completed) {
        update_status(&state, &drive_id, Step::Completed).await;
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "Report already completed for driveId",
            "ALREADY_COMPLETED",
        ));
    }

    let permit = Arc::clone(&state.compute_sem)
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Compute queue closed"))?;

    update_status(&state, &drive_id, Step::Initiated).await;

    if let Err(error) = state.results.upsert_report(&TestReport::pending(&drive_id)).await {
        tracing::error!(drive_id, %error, "failed to record pending report");
    }

    let task_state = state.clone();
    let task_drive = drive_id.clone();
    tokio::spawn(async move {
        run_computation(task_state, task_drive, permit).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ComputeResponse {
            step: Step::Initiated,
            test_id: drive_id,
        }),
    ))
}

/// Runs one accepted computation to its terminal state.
///
/// The computation is cancelled by process shutdown or by the configured
/// deadline. A cancelled computation leaves the pending report in place for
/// a re-trigger; an infrastructure failure marks it failed.
async fn run_computation(state: AppState, drive_id: String, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    state.metrics.computation_started();

    let cancel = state.shutdown.child_token();
    let deadline = state.computation_timeout;
    let timer_cancel = cancel.clone();
    let timer = tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(deadline) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "computation deadline hit");
                timer_cancel.cancel();
            }
            () = timer_cancel.cancelled() => {}
        }
    });

    let outcome = state.aggregator.compute(&drive_id, &cancel).await;
    cancel.cancel();
    let _ = timer.await;

    match outcome {
        Ok(()) => {
            tracing::debug!(drive_id, "computation completed");
            state.metrics.computation_finished("completed");
        },
        Err(ComputeError::Cancelled { .. }) => {
            tracing::warn!(drive_id, "computation cancelled; report left pending");
            state.metrics.computation_finished("cancelled");
        },
        Err(error) => {
            tracing::error!(drive_id, %error, "computation failed");
            state.metrics.computation_finished("failed");

            let mut failed = TestReport::pending(&drive_id);
            failed.status = AnalysisStatus::Failed;
            if let Err(error) = state.results.upsert_report(&failed).await {
                tracing::error!(drive_id, %error, "failed to record failed report");
            }
        },
    }
}

async fn update_status(state: &AppState, drive_id: &str, step: Step) {
    if let Err(error) = state.status.update(drive_id, step).await {
        tracing::warn!(drive_id, %step, %error, "status update failed");
    }
}
