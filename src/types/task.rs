//! The task record and its lifecycle.
//!
//! A [`Task`] is the unit of work: one natural-language coding request,
//! dispatched to exactly one worker and tracked until it reaches a terminal
//! status. The status machine is:
//!
//! ```text
//! dispatched ──► running ──► { completed | failed | cancelled }
//!     │             │
//!     └─────────────┴──────► interrupted   (worker died mid-flight)
//! ```
//!
//! Terminal statuses are never overwritten; a late completion callback
//! arriving after a user cancellation is rejected by the store's transition
//! guard rather than silently winning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ActionId, ApprovalEventId, CorrelationId, DedupKey, IssueId, TaskId, UserId};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and sent (or being sent) to a worker.
    Dispatched,

    /// The worker has started executing and is heartbeating.
    Running,

    /// Finished successfully; `result` is set.
    Completed,

    /// Finished unsuccessfully; `error` is set.
    Failed,

    /// Cancelled by the owning user through the nonce protocol.
    Cancelled,

    /// The worker died mid-flight (zombie reconciliation or a worker-side
    /// crash report). Reachable only from `Dispatched` or `Running`.
    Interrupted,
}

impl TaskStatus {
    /// Returns true for statuses a task can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Interrupted
        )
    }

    /// Returns whether a transition from `self` to `next` is legal.
    ///
    /// The single rule that matters for correctness: a terminal status is
    /// never overwritten, not even by another terminal status. Everything
    /// else follows the arrow diagram in the module docs.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (TaskStatus::Dispatched, TaskStatus::Running) => true,
            (TaskStatus::Dispatched | TaskStatus::Running, n) if n.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

/// Execution profile requested for a task.
///
/// Workers advertise which profiles they run; the dispatcher forwards the
/// selector verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Default profile for ordinary coding tasks.
    Standard,

    /// Profile with a longer execution budget for large refactors.
    Heavy,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Standard => write!(f, "standard"),
            WorkerType::Heavy => write!(f, "heavy"),
        }
    }
}

/// Which machine in the small worker pool a task landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLocation {
    /// The primary host machine.
    Host,

    /// The fallback VM.
    Vm,
}

impl fmt::Display for WorkerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerLocation::Host => write!(f, "host"),
            WorkerLocation::Vm => write!(f, "vm"),
        }
    }
}

/// A single code task tracked by the control plane.
///
/// Created by the ingestion path after dedup and rate checks pass; mutated
/// by the dispatcher (status, `dispatched_at`, secret binding), the
/// heartbeat receiver (`last_heartbeat`, `updated_at`), the completion
/// callback (terminal status + result/error), and the cancellation protocol
/// (status + nonce clearing). Never physically deleted by this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub correlation_id: CorrelationId,
    pub user_id: UserId,

    /// The approval event that authorized this task, if any (dedup layer 1).
    pub approval_event_id: Option<ApprovalEventId>,

    /// The upstream action that produced this task, if any (dedup layer 2).
    pub action_id: Option<ActionId>,

    /// Stable hash of (user, prompt), dedup layer 3.
    pub dedup_key: DedupKey,

    /// External issue this task is working on, if any (dedup layer 4:
    /// at most one non-terminal task per issue).
    pub issue_id: Option<IssueId>,

    pub prompt: String,
    pub repository: String,
    pub base_branch: String,
    pub worker_type: WorkerType,

    /// Where the task was dispatched; `None` until dispatch succeeds.
    pub worker_location: Option<WorkerLocation>,

    pub status: TaskStatus,

    /// Success payload. Set exactly when `status == Completed`.
    pub result: Option<serde_json::Value>,

    /// Failure description. Set exactly when `status` is a terminal
    /// non-`Completed` value.
    pub error: Option<String>,

    /// Per-task webhook secret, random and never reused. Immutable once
    /// assigned; bound before the dispatch HTTP call goes out.
    pub webhook_secret: Option<String>,

    /// Single-use cancellation nonce. Cleared atomically with the
    /// transition to `Cancelled`.
    pub cancel_nonce: Option<String>,

    /// Absolute expiry of `cancel_nonce`, if a TTL was assigned.
    pub cancel_nonce_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Only ever moves forward; bumped on every mutation and every
    /// heartbeat. Zombie detection compares this against a staleness
    /// threshold.
    pub updated_at: DateTime<Utc>,

    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns true if this task still counts against the one-active-task-
    /// per-issue rule.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATUSES: [TaskStatus; 6] = [
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Interrupted,
    ];

    fn arb_status() -> impl Strategy<Value = TaskStatus> {
        prop::sample::select(ALL_STATUSES.to_vec())
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Dispatched.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Interrupted.is_terminal());
    }

    #[test]
    fn dispatched_can_start_running() {
        assert!(TaskStatus::Dispatched.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn running_cannot_go_back_to_dispatched() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Dispatched));
    }

    #[test]
    fn interrupted_reachable_from_both_live_statuses() {
        assert!(TaskStatus::Dispatched.can_transition_to(TaskStatus::Interrupted));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Interrupted));
    }

    #[test]
    fn late_completion_does_not_overwrite_cancelled() {
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }

    #[test]
    fn vm_location_serializes_as_vm() {
        let json = serde_json::to_string(&WorkerLocation::Vm).unwrap();
        assert_eq!(json, "\"vm\"");
    }

    proptest! {
        /// No transition out of a terminal status is ever legal.
        #[test]
        fn terminal_statuses_are_absorbing(from in arb_status(), to in arb_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        /// A live task can always be moved to any terminal status.
        #[test]
        fn live_tasks_can_terminate(from in arb_status(), to in arb_status()) {
            if !from.is_terminal() && to.is_terminal() {
                prop_assert!(from.can_transition_to(to));
            }
        }

        #[test]
        fn status_serde_roundtrip(status in arb_status()) {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(status, parsed);
        }
    }
}
