//! User-initiated cancellation via a single-use nonce.
//!
//! A cancel request carries `{taskId, nonce, userId}` and is validated in a
//! fixed order, each step a hard reject: the task exists, the stored nonce
//! is present and equal, the expiry (if set) is in the future, the caller
//! owns the task, and the task is still `dispatched` or `running`. Only
//! then is the nonce consumed, which atomically transitions the task to
//! `cancelled` and clears both nonce fields in one store write. Afterwards
//! the user's usage slot is released and the worker notified, best-effort.
//!
//! Nonce issuance happens on the ingestion path at task-start time; this
//! module only consumes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::limits::RateLimiter;
use crate::store::{TaskStore, TaskStoreError};
use crate::types::{Task, TaskId, TaskStatus, UserId};

/// How long an issued cancellation nonce stays valid.
pub const CANCEL_NONCE_TTL_MINUTES: i64 = 30;

/// Generates a fresh cancellation nonce: 16 random bytes, hex-encoded.
pub fn generate_cancel_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Expiry for a nonce issued at `now`.
pub fn nonce_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(CANCEL_NONCE_TTL_MINUTES)
}

/// Cancellation rejections, in validation order.
#[derive(Debug, Error)]
pub enum CancelError {
    /// No task with the given id.
    #[error("task not found")]
    TaskNotFound,

    /// The stored nonce is absent (never issued, or already consumed) or
    /// does not match the supplied one.
    #[error("invalid cancellation token")]
    InvalidNonce,

    /// The nonce's expiry has passed.
    #[error("cancellation token expired")]
    NonceExpired,

    /// The requesting user does not own the task.
    #[error("you do not own this task")]
    NotOwner,

    /// The task already finished (or was never in a cancellable state).
    #[error("task is {0} and can no longer be cancelled")]
    TaskNotCancellable(TaskStatus),

    /// Backend failure while validating or consuming.
    #[error("store error: {0}")]
    Store(String),
}

impl CancelError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            CancelError::TaskNotFound => "task_not_found",
            CancelError::InvalidNonce => "invalid_nonce",
            CancelError::NonceExpired => "nonce_expired",
            CancelError::NotOwner => "not_owner",
            CancelError::TaskNotCancellable(_) => "task_not_cancellable",
            CancelError::Store(_) => "store_error",
        }
    }
}

/// A cancellation request from the user channel.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub task_id: TaskId,
    pub nonce: String,
    pub user_id: UserId,
}

/// Runs the cancellation protocol against the task store.
pub struct Canceller {
    store: Arc<dyn TaskStore>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<Dispatcher>,
}

impl Canceller {
    pub fn new(
        store: Arc<dyn TaskStore>,
        limiter: Arc<RateLimiter>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Canceller {
            store,
            limiter,
            dispatcher,
        }
    }

    /// Validates and executes a cancellation.
    ///
    /// Returns the cancelled task record. The worker notification is
    /// fire-and-log; its failure never surfaces here.
    ///
    /// # Errors
    ///
    /// One of the five protocol rejections, or `Store` for a backend
    /// failure.
    pub async fn cancel(&self, request: &CancelRequest) -> Result<Task, CancelError> {
        let task = self
            .store
            .find_by_id(&request.task_id)
            .await
            .map_err(|e| CancelError::Store(e.to_string()))?
            .ok_or(CancelError::TaskNotFound)?;

        validate(&task, request, Utc::now())?;

        // The single-use commit point. A raced second consume (or a raced
        // terminal transition) fails here even though validation passed.
        let cancelled = match self
            .store
            .consume_cancel_nonce(&request.task_id, &request.nonce)
            .await
        {
            Ok(task) => task,
            Err(TaskStoreError::NonceMismatch(_)) => return Err(CancelError::InvalidNonce),
            Err(TaskStoreError::InvalidTransition { from, .. }) => {
                return Err(CancelError::TaskNotCancellable(from));
            }
            Err(TaskStoreError::NotFound(_)) => return Err(CancelError::TaskNotFound),
            Err(e) => return Err(CancelError::Store(e.to_string())),
        };

        info!(task_id = %request.task_id, user_id = %request.user_id, "task cancelled");

        // Cancellation is terminal, so it releases the concurrent slot the
        // same way a completion callback would. No actual cost is known;
        // the optimistic estimate stands.
        self.limiter
            .record_task_complete(&cancelled.user_id, None)
            .await;

        match cancelled.worker_location {
            Some(location) => {
                self.dispatcher
                    .cancel_on_worker(&request.task_id, location)
                    .await;
            }
            None => {
                warn!(task_id = %request.task_id, "cancelled task has no worker location, skipping notify");
            }
        }

        Ok(cancelled)
    }
}

/// The five-step validation chain. Pure; the caller supplies `now`.
fn validate(task: &Task, request: &CancelRequest, now: DateTime<Utc>) -> Result<(), CancelError> {
    let stored = task.cancel_nonce.as_deref().ok_or(CancelError::InvalidNonce)?;
    if stored != request.nonce {
        return Err(CancelError::InvalidNonce);
    }

    if let Some(expires_at) = task.cancel_nonce_expires_at {
        if expires_at <= now {
            return Err(CancelError::NonceExpired);
        }
    }

    if task.user_id != request.user_id {
        return Err(CancelError::NotOwner);
    }

    if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::Running) {
        return Err(CancelError::TaskNotCancellable(task.status));
    }

    Ok(())
}
