//! Task submission and cancellation endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::cancel::{CancelError, CancelRequest};
use crate::dispatch::DispatchError;
use crate::ingest::{SubmitError, TaskSubmission};
use crate::types::{
    ActionId, ApprovalEventId, CorrelationId, IssueId, TaskId, TaskStatus, UserId, WorkerLocation,
    WorkerType,
};

use super::AppContext;

/// Body of `POST /tasks`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub prompt: String,
    pub repository: String,
    pub base_branch: String,
    #[serde(default = "default_worker_type")]
    pub worker_type: WorkerType,
    pub correlation_id: Option<CorrelationId>,
    pub approval_event_id: Option<ApprovalEventId>,
    pub action_id: Option<ActionId>,
    pub linear_issue_id: Option<IssueId>,
}

fn default_worker_type() -> WorkerType {
    WorkerType::Standard
}

/// Body of a successful `POST /tasks` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_location: Option<WorkerLocation>,
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_nonce: Option<String>,
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            SubmitError::ActiveTaskExists { .. } => StatusCode::CONFLICT,
            SubmitError::Dispatch(
                DispatchError::WorkerUnavailable | DispatchError::WorkerBusy,
            ) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let SubmitError::RateLimited(e) = &self {
            if let Some(retry_after) = e.retry_after() {
                body["retryAfter"] = json!(retry_after.as_secs());
            }
        }
        (status, Json(body)).into_response()
    }
}

/// `POST /tasks`: admits, creates, and dispatches a task.
pub async fn submit_handler(
    State(ctx): State<AppContext>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), SubmitError> {
    debug!(user_id = %request.user_id, repository = %request.repository, "task submission received");

    let outcome = ctx
        .ingestor()
        .submit(TaskSubmission {
            user_id: request.user_id,
            prompt: request.prompt,
            repository: request.repository,
            base_branch: request.base_branch,
            worker_type: request.worker_type,
            correlation_id: request.correlation_id,
            approval_event_id: request.approval_event_id,
            action_id: request.action_id,
            issue_id: request.linear_issue_id,
        })
        .await?;

    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(SubmitResponse {
            task_id: outcome.task.id.clone(),
            status: outcome.task.status,
            worker_location: outcome.task.worker_location,
            deduplicated: outcome.deduplicated,
            cancel_nonce: outcome.cancel_nonce,
        }),
    ))
}

/// Body of `POST /tasks/{id}/cancel`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    pub nonce: String,
    pub user_id: UserId,
}

impl IntoResponse for CancelError {
    fn into_response(self) -> Response {
        let status = match &self {
            CancelError::TaskNotFound => StatusCode::NOT_FOUND,
            CancelError::InvalidNonce => StatusCode::FORBIDDEN,
            CancelError::NonceExpired => StatusCode::GONE,
            CancelError::NotOwner => StatusCode::FORBIDDEN,
            CancelError::TaskNotCancellable(_) => StatusCode::CONFLICT,
            CancelError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// `POST /tasks/{id}/cancel`: the nonce cancellation protocol.
pub async fn cancel_handler(
    State(ctx): State<AppContext>,
    Path(task_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<serde_json::Value>, CancelError> {
    ctx.canceller()
        .cancel(&CancelRequest {
            task_id: TaskId::new(task_id),
            nonce: body.nonce,
            user_id: body.user_id,
        })
        .await?;
    Ok(Json(json!({ "cancelled": true })))
}
