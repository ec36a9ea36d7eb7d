//! Persistence contract for task records.
//!
//! The store owns the two invariants the rest of the control plane leans on:
//!
//! 1. **Layered deduplication** on create, checked in a fixed order with the
//!    first match winning:
//!    - `approval_event_id`: replayed user-approval events
//!    - `action_id`: at-least-once delivery retries from upstream
//!    - `dedup_key` (hash of user + prompt): UI double-submission
//!    - active-task-per-issue: a hard reject (`ActiveTaskExists`), because
//!      two concurrent tasks on one issue is a correctness hazard, not a
//!      client retry
//! 2. **Terminal-status guard** on update: a task in a terminal status is
//!    never moved again, so a late completion callback cannot overwrite a
//!    user cancellation.
//!
//! All operations must be race-safe against concurrent callers; the
//! in-memory implementation serializes creates and updates the way a real
//! document store would with conditional/transactional writes. A losing
//! concurrent creator reads back and returns the winner's record.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::{
    ActionId, ApprovalEventId, CorrelationId, IssueId, Task, TaskId, TaskStatus, UserId,
    UserUsage, WorkerLocation, WorkerType,
};

pub use memory::MemoryStore;

/// Errors emitted by the task store.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// No task with the given id.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A non-terminal task already targets the issue.
    #[error("issue {issue} already has active task {task}")]
    ActiveTaskExists { issue: IssueId, task: TaskId },

    /// The requested status transition would leave a terminal status (or
    /// otherwise violates the lifecycle).
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// The webhook secret is immutable once assigned.
    #[error("webhook secret already bound for task {0}")]
    SecretAlreadyBound(TaskId),

    /// The supplied cancel nonce does not match the stored one (absent,
    /// already consumed, or different).
    #[error("cancel nonce mismatch for task {0}")]
    NonceMismatch(TaskId),

    /// Backend failure (network, disk, quota). Maps to `STORE_ERROR` at
    /// component boundaries.
    #[error("store error: {0}")]
    Storage(String),
}

/// Input for creating a task. Identity, timestamps, and lifecycle fields
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub correlation_id: CorrelationId,
    pub user_id: UserId,
    pub approval_event_id: Option<ApprovalEventId>,
    pub action_id: Option<ActionId>,
    pub issue_id: Option<IssueId>,
    pub prompt: String,
    pub repository: String,
    pub base_branch: String,
    pub worker_type: WorkerType,
}

/// Outcome of a create call.
///
/// Dedup layers 1-3 return the already-existing task instead of erroring,
/// so callers can treat a replay exactly like a fresh submission.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new record was written.
    Created(Task),

    /// A dedup layer matched; this is the winner's record.
    Existing(Task),
}

impl CreateOutcome {
    /// The task record, regardless of which way the create went.
    pub fn task(&self) -> &Task {
        match self {
            CreateOutcome::Created(t) | CreateOutcome::Existing(t) => t,
        }
    }

    /// Returns true if a new record was written.
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// A partial update to a task record.
///
/// Only the populated fields are touched. `updated_at` is bumped on every
/// successful update and never moves backwards.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    /// New lifecycle status; checked against the transition guard.
    pub status: Option<TaskStatus>,

    /// Success payload. Normally set together with `status: Completed`.
    pub result: Option<serde_json::Value>,

    /// Failure description. Normally set together with a terminal
    /// non-completed status.
    pub error: Option<String>,

    /// Where the task was dispatched.
    pub worker_location: Option<WorkerLocation>,

    /// Binds the per-task webhook secret. Rejected if already bound.
    pub webhook_secret: Option<String>,

    /// Issues a cancellation nonce with an absolute expiry.
    pub cancel_nonce: Option<(String, DateTime<Utc>)>,

    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl TaskPatch {
    /// A patch that only records a heartbeat.
    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        TaskPatch {
            last_heartbeat: Some(at),
            ..TaskPatch::default()
        }
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<UserId>,
    pub status: Option<TaskStatus>,
}

/// Persistence contract for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a task, applying the four dedup layers in order.
    ///
    /// # Errors
    ///
    /// `ActiveTaskExists` if a non-terminal task already targets the same
    /// issue; `Storage` for backend failures.
    async fn create(&self, input: NewTask) -> Result<CreateOutcome, TaskStoreError>;

    /// Looks up a task by id.
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// Applies a partial update under the transition guard.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `InvalidTransition` if the patch would
    /// move a task out of a terminal status, `SecretAlreadyBound` if it
    /// would rebind the webhook secret.
    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, TaskStoreError>;

    /// Lists tasks matching the filter, newest first.
    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError>;

    /// Selects non-terminal tasks whose `updated_at` is older than the
    /// staleness threshold. Reconciling them is the caller's job.
    async fn find_zombie_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Task>, TaskStoreError>;

    /// Counts tasks the user created in the current UTC day.
    async fn count_created_today(&self, user_id: &UserId) -> Result<u64, TaskStoreError>;

    /// Atomically consumes a cancellation nonce: verifies it matches the
    /// stored one, transitions the task to `Cancelled`, and clears both
    /// nonce fields in a single conditional write.
    ///
    /// Callers validate expiry/ownership/status first (the cancellation
    /// protocol); this operation is the final single-use commit point, so a
    /// raced second consume fails with `NonceMismatch`.
    async fn consume_cancel_nonce(
        &self,
        id: &TaskId,
        nonce: &str,
    ) -> Result<Task, TaskStoreError>;
}

/// Persistence contract for per-user usage counters.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Fetches the usage snapshot for a user (zeroed if never seen).
    async fn get_usage(&self, user_id: &UserId) -> Result<UserUsage, TaskStoreError>;

    /// Records a task start: bumps the concurrent and hourly counters and
    /// adds the estimated cost optimistically.
    async fn apply_task_start(
        &self,
        user_id: &UserId,
        estimated_cost: f64,
    ) -> Result<UserUsage, TaskStoreError>;

    /// Records a task completion: decrements the concurrent counter
    /// (saturating at zero) and, when an actual cost is known, replaces the
    /// estimate with it so cost is never double counted.
    async fn apply_task_complete(
        &self,
        user_id: &UserId,
        estimated_cost: f64,
        actual_cost: Option<f64>,
    ) -> Result<UserUsage, TaskStoreError>;
}
