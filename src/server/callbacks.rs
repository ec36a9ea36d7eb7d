//! Inbound endpoints for workers: completion callbacks and heartbeats.
//!
//! The completion callback is the receiver side of the webhook delivery
//! contract: both signature headers are required, the timestamp must fall
//! inside the 15-minute replay window, and the HMAC is recomputed over
//! `"{timestamp}.{rawBody}"` with the per-task secret and compared in
//! constant time. Heartbeats are signed over the raw body with the shared
//! worker secret instead.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::heartbeat::{process_heartbeat, HEADER_HEARTBEAT_SIGNATURE};
use crate::store::{TaskPatch, TaskStoreError};
use crate::types::{TaskId, TaskStatus};
use crate::webhook::{
    verify_body, verify_with_timestamp, SignatureError, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};

use super::AppContext;

/// Completion callback rejections.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("malformed timestamp header")]
    MalformedTimestamp,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("timestamp outside the replay window")]
    TimestampOutOfRange,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unknown task")]
    UnknownTask,

    #[error("completion status must be terminal, got {0}")]
    NonTerminalStatus(TaskStatus),

    /// The task already reached a terminal status; the late callback is
    /// dropped rather than overwriting it.
    #[error("task already finished as {0}")]
    AlreadyFinalized(TaskStatus),

    #[error("store error: {0}")]
    Store(String),
}

impl CallbackError {
    pub fn code(&self) -> &'static str {
        match self {
            CallbackError::MissingHeader(_) => "missing_header",
            CallbackError::MalformedTimestamp => "malformed_timestamp",
            CallbackError::InvalidJson(_) => "invalid_json",
            CallbackError::TimestampOutOfRange => "timestamp_out_of_range",
            CallbackError::InvalidSignature => "invalid_signature",
            CallbackError::UnknownTask => "unknown_task",
            CallbackError::NonTerminalStatus(_) => "non_terminal_status",
            CallbackError::AlreadyFinalized(_) => "already_finalized",
            CallbackError::Store(_) => "store_error",
        }
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let status = match &self {
            CallbackError::MissingHeader(_)
            | CallbackError::MalformedTimestamp
            | CallbackError::InvalidJson(_)
            | CallbackError::NonTerminalStatus(_) => StatusCode::BAD_REQUEST,
            CallbackError::TimestampOutOfRange | CallbackError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            CallbackError::UnknownTask => StatusCode::NOT_FOUND,
            CallbackError::AlreadyFinalized(_) => StatusCode::CONFLICT,
            CallbackError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// The completion webhook body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionPayload {
    task_id: TaskId,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    #[allow(dead_code)]
    duration: Option<f64>,

    /// Actual spend in USD, when the worker measured one. Reconciled
    /// against the optimistic estimate.
    cost: Option<f64>,
}

/// `POST /callbacks/task`: receives a signed completion webhook.
pub async fn callback_handler(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), CallbackError> {
    let timestamp = get_header(&headers, HEADER_TIMESTAMP)?
        .parse::<i64>()
        .map_err(|_| CallbackError::MalformedTimestamp)?;
    let signature = get_header(&headers, HEADER_SIGNATURE)?;

    // The task id comes from the body; the secret to check the signature
    // with is the one bound to that task.
    let payload: CompletionPayload = serde_json::from_slice(&body)?;
    let task = ctx
        .store()
        .find_by_id(&payload.task_id)
        .await
        .map_err(|e| CallbackError::Store(e.to_string()))?
        .ok_or(CallbackError::UnknownTask)?;
    let secret = task
        .webhook_secret
        .as_deref()
        .ok_or(CallbackError::InvalidSignature)?;

    verify_with_timestamp(secret.as_bytes(), timestamp, &body, &signature, Utc::now()).map_err(
        |e| match e {
            SignatureError::TimestampOutOfRange { .. } => CallbackError::TimestampOutOfRange,
            SignatureError::InvalidSignature => CallbackError::InvalidSignature,
        },
    )?;

    if !payload.status.is_terminal() {
        return Err(CallbackError::NonTerminalStatus(payload.status));
    }

    let patch = TaskPatch {
        status: Some(payload.status),
        result: payload.result,
        error: payload.error,
        completed_at: Some(Utc::now()),
        ..TaskPatch::default()
    };
    match ctx.store().update(&payload.task_id, patch).await {
        Ok(_) => {}
        Err(TaskStoreError::InvalidTransition { from, .. }) => {
            warn!(
                task_id = %payload.task_id,
                current = %from,
                reported = %payload.status,
                "late completion callback ignored"
            );
            return Err(CallbackError::AlreadyFinalized(from));
        }
        Err(e) => return Err(CallbackError::Store(e.to_string())),
    }

    ctx.limiter()
        .record_task_complete(&task.user_id, payload.cost)
        .await;
    info!(task_id = %payload.task_id, status = %payload.status, "completion callback applied");
    Ok((StatusCode::OK, "OK"))
}

/// The heartbeat batch body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody {
    task_ids: Vec<TaskId>,
}

/// One entry in the heartbeat response's failure list.
#[derive(Debug, Serialize)]
struct FailureEntry {
    id: TaskId,
    reason: String,
}

/// `POST /heartbeat`: receives a signed liveness batch.
pub async fn heartbeat_handler(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, CallbackError> {
    let signature = get_header(&headers, HEADER_HEARTBEAT_SIGNATURE)?;
    if !verify_body(ctx.shared_secret(), &body, &signature) {
        return Err(CallbackError::InvalidSignature);
    }

    let batch: HeartbeatBody = serde_json::from_slice(&body)?;
    let report = process_heartbeat(ctx.store(), &batch.task_ids).await;

    let failures: Vec<FailureEntry> = report
        .failures
        .into_iter()
        .map(|f| FailureEntry {
            id: f.id,
            reason: f.reason,
        })
        .collect();
    Ok(Json(json!({
        "processed": report.processed,
        "notFound": report.not_found,
        "failures": failures,
    })))
}

fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, CallbackError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(CallbackError::MissingHeader(name))
}
