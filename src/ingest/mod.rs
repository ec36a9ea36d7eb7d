//! Task submission and zombie reconciliation.
//!
//! Submission threads the whole admission path together: rate limits first,
//! then deduplicating creation, then dispatch, then cancellation-nonce
//! issuance. A deduplicated submission short-circuits after the create and
//! is reported as such; only a freshly created task touches the usage
//! counters or a worker.
//!
//! Zombie reconciliation is the external consumer of the store's
//! `find_zombie_tasks` query: it marks stale non-terminal tasks
//! `interrupted` and releases their usage slots.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::RngCore;
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::{generate_cancel_nonce, nonce_expiry};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::limits::{RateLimitError, RateLimiter};
use crate::store::{NewTask, TaskPatch, TaskStore, TaskStoreError};
use crate::types::{
    ActionId, ApprovalEventId, CorrelationId, IssueId, Task, TaskId, TaskStatus, UserId, WorkerType,
};

/// Submission rejections.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// An admission check failed.
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// The target issue already has an active task.
    #[error("issue {issue} already has active task {task}")]
    ActiveTaskExists { issue: IssueId, task: TaskId },

    /// No worker accepted the task. The task record is marked failed.
    #[error(transparent)]
    Dispatch(DispatchError),

    /// Backend failure before the task could be created.
    #[error("store error: {0}")]
    Store(String),
}

impl SubmitError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::RateLimited(e) => e.code(),
            SubmitError::ActiveTaskExists { .. } => "active_task_exists",
            SubmitError::Dispatch(e) => e.code(),
            SubmitError::Store(_) => "store_error",
        }
    }
}

/// A task submission from the user channel.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub user_id: UserId,
    pub prompt: String,
    pub repository: String,
    pub base_branch: String,
    pub worker_type: WorkerType,
    pub correlation_id: Option<CorrelationId>,
    pub approval_event_id: Option<ApprovalEventId>,
    pub action_id: Option<ActionId>,
    pub issue_id: Option<IssueId>,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task: Task,

    /// True when a dedup layer matched and `task` is the earlier record.
    pub deduplicated: bool,

    /// Nonce authorizing cancellation, issued only for fresh dispatches.
    pub cancel_nonce: Option<String>,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generates a fresh task id: 12 random bytes, hex-encoded.
fn generate_task_id() -> TaskId {
    TaskId::new(random_hex(12))
}

/// The task submission use case.
pub struct Ingestor {
    store: Arc<dyn TaskStore>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<Dispatcher>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        limiter: Arc<RateLimiter>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Ingestor {
            store,
            limiter,
            dispatcher,
        }
    }

    /// Admits, creates, and dispatches a task.
    ///
    /// # Errors
    ///
    /// `RateLimited` before anything is written; `ActiveTaskExists` from
    /// dedup layer 4; `Dispatch` when no worker accepted (the task record
    /// is then marked failed and the usage slot released).
    pub async fn submit(&self, submission: TaskSubmission) -> Result<SubmitOutcome, SubmitError> {
        self.limiter
            .check_limits(&submission.user_id, submission.prompt.chars().count())
            .await?;

        let correlation_id = submission
            .correlation_id
            .unwrap_or_else(|| CorrelationId::new(random_hex(12)));
        let outcome = self
            .store
            .create(NewTask {
                id: generate_task_id(),
                correlation_id,
                user_id: submission.user_id.clone(),
                approval_event_id: submission.approval_event_id,
                action_id: submission.action_id,
                issue_id: submission.issue_id,
                prompt: submission.prompt,
                repository: submission.repository,
                base_branch: submission.base_branch,
                worker_type: submission.worker_type,
            })
            .await
            .map_err(|e| match e {
                TaskStoreError::ActiveTaskExists { issue, task } => {
                    SubmitError::ActiveTaskExists { issue, task }
                }
                other => SubmitError::Store(other.to_string()),
            })?;

        if !outcome.is_created() {
            let task = outcome.task().clone();
            info!(task_id = %task.id, user_id = %task.user_id, "submission deduplicated");
            return Ok(SubmitOutcome {
                task,
                deduplicated: true,
                cancel_nonce: None,
            });
        }
        let task = outcome.task().clone();

        // The slot is charged optimistically once the record exists; a
        // counter failure is not worth orphaning the task over.
        if let Err(e) = self.limiter.record_task_start(&task.user_id).await {
            warn!(task_id = %task.id, error = %e, "failed to record task start");
        }

        if let Err(e) = self.dispatcher.dispatch(&task).await {
            self.mark_dispatch_failed(&task, &e).await;
            self.limiter.record_task_complete(&task.user_id, None).await;
            return Err(SubmitError::Dispatch(e));
        }

        // Nonce issuance happens at task-start time so the user-facing
        // notification can carry a working cancel link.
        let nonce = generate_cancel_nonce();
        let task = match self
            .store
            .update(
                &task.id,
                TaskPatch {
                    cancel_nonce: Some((nonce.clone(), nonce_expiry(Utc::now()))),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            Ok(task) => task,
            Err(e) => {
                // The task is running either way; it just cannot be
                // cancelled through the nonce channel.
                warn!(task_id = %task.id, error = %e, "failed to issue cancel nonce");
                task
            }
        };

        Ok(SubmitOutcome {
            task,
            deduplicated: false,
            cancel_nonce: Some(nonce),
        })
    }

    async fn mark_dispatch_failed(&self, task: &Task, error: &DispatchError) {
        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            error: Some(format!("dispatch failed: {error}")),
            completed_at: Some(Utc::now()),
            ..TaskPatch::default()
        };
        if let Err(e) = self.store.update(&task.id, patch).await {
            warn!(task_id = %task.id, error = %e, "failed to mark task as dispatch-failed");
        }
    }
}

/// Marks tasks whose heartbeat went stale as `interrupted` and releases
/// their usage slots. Returns the number of tasks reconciled; a failure on
/// one task is logged and the sweep continues.
pub async fn reconcile_zombies(
    store: &Arc<dyn TaskStore>,
    limiter: &RateLimiter,
    stale_threshold: Duration,
) -> usize {
    let zombies = match store.find_zombie_tasks(stale_threshold).await {
        Ok(zombies) => zombies,
        Err(e) => {
            warn!(error = %e, "zombie query failed");
            return 0;
        }
    };

    let mut reconciled = 0;
    for task in zombies {
        let patch = TaskPatch {
            status: Some(TaskStatus::Interrupted),
            error: Some("worker heartbeat lost".to_string()),
            completed_at: Some(Utc::now()),
            ..TaskPatch::default()
        };
        match store.update(&task.id, patch).await {
            Ok(_) => {
                info!(task_id = %task.id, "zombie task marked interrupted");
                limiter.record_task_complete(&task.user_id, None).await;
                reconciled += 1;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to reconcile zombie task");
            }
        }
    }
    reconciled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{WorkerEndpoint, WorkerRegistry, WorkerTransport};
    use crate::limits::RateLimitConfig;
    use crate::store::{MemoryStore, UsageStore};
    use crate::types::WorkerLocation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingWorkers {
        healthy: bool,
        dispatches: AtomicU32,
    }

    #[async_trait]
    impl WorkerTransport for CountingWorkers {
        async fn health_check(&self, _base_url: &str) -> bool {
            self.healthy
        }

        async fn dispatch(
            &self,
            _base_url: &str,
            _timestamp: i64,
            _signature: &str,
            _body: &[u8],
        ) -> Result<u16, DispatchError> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            Ok(200)
        }

        async fn cancel(&self, _base_url: &str, _task_id: &TaskId) -> Result<u16, DispatchError> {
            Ok(200)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        workers: Arc<CountingWorkers>,
        limiter: Arc<RateLimiter>,
        ingestor: Ingestor,
    }

    fn fixture_with(healthy: bool, config: RateLimitConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let workers = Arc::new(CountingWorkers {
            healthy,
            dispatches: AtomicU32::new(0),
        });
        let limiter = Arc::new(RateLimiter::new(store.clone(), config));
        let dispatcher = Arc::new(Dispatcher::new(
            workers.clone(),
            WorkerRegistry::new(vec![WorkerEndpoint::new(
                WorkerLocation::Host,
                "http://host.internal:8080",
                1,
            )]),
            store.clone(),
            b"shared".to_vec(),
            "https://control.example",
            "sph",
        ));
        let ingestor = Ingestor::new(store.clone(), limiter.clone(), dispatcher);
        Fixture {
            store,
            workers,
            limiter,
            ingestor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(true, RateLimitConfig::default())
    }

    fn submission(user: &str, prompt: &str) -> TaskSubmission {
        TaskSubmission {
            user_id: UserId::new(user),
            prompt: prompt.to_string(),
            repository: "acme/widgets".to_string(),
            base_branch: "main".to_string(),
            worker_type: WorkerType::Standard,
            correlation_id: None,
            approval_event_id: None,
            action_id: None,
            issue_id: None,
        }
    }

    #[tokio::test]
    async fn fresh_submission_dispatches_and_issues_a_nonce() {
        let f = fixture();

        let outcome = f.ingestor.submit(submission("u1", "add dark mode")).await.unwrap();
        assert!(!outcome.deduplicated);
        let nonce = outcome.cancel_nonce.unwrap();

        let task = f.store.find_by_id(&outcome.task.id).await.unwrap().unwrap();
        assert_eq!(task.cancel_nonce.as_deref(), Some(nonce.as_str()));
        assert!(task.cancel_nonce_expires_at.unwrap() > Utc::now());
        assert!(task.dispatched_at.is_some());
        assert_eq!(f.workers.dispatches.load(Ordering::SeqCst), 1);

        let usage = f.store.get_usage(&UserId::new("u1")).await.unwrap();
        assert_eq!(usage.concurrent_tasks, 1);
    }

    #[tokio::test]
    async fn replayed_approval_event_is_deduplicated() {
        let f = fixture();
        let mut first = submission("u1", "fix the login flow");
        first.approval_event_id = Some(ApprovalEventId::new("approve-1"));
        let mut second = submission("u1", "fix the login flow");
        second.approval_event_id = Some(ApprovalEventId::new("approve-1"));

        let a = f.ingestor.submit(first).await.unwrap();
        let b = f.ingestor.submit(second).await.unwrap();

        assert!(!a.deduplicated);
        assert!(b.deduplicated);
        assert_eq!(a.task.id, b.task.id);
        assert!(b.cancel_nonce.is_none());

        // Only the first submission dispatched or charged a slot.
        assert_eq!(f.workers.dispatches.load(Ordering::SeqCst), 1);
        let usage = f.store.get_usage(&UserId::new("u1")).await.unwrap();
        assert_eq!(usage.concurrent_tasks, 1);
    }

    #[tokio::test]
    async fn double_submission_same_prompt_is_deduplicated() {
        let f = fixture();

        let a = f.ingestor.submit(submission("u1", "add dark mode")).await.unwrap();
        let b = f.ingestor.submit(submission("u1", "add dark mode")).await.unwrap();

        assert_eq!(a.task.id, b.task.id);
        assert!(b.deduplicated);
    }

    #[tokio::test]
    async fn rate_limit_rejects_before_anything_is_written() {
        let f = fixture_with(
            true,
            RateLimitConfig {
                max_concurrent: 1,
                ..RateLimitConfig::default()
            },
        );

        f.ingestor.submit(submission("u1", "first")).await.unwrap();
        let err = f.ingestor.submit(submission("u1", "second")).await.unwrap_err();
        assert_eq!(err.code(), "concurrent_limit");

        let tasks = f.store.list(Default::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn active_issue_is_a_hard_reject() {
        let f = fixture();
        let mut first = submission("u1", "first pass");
        first.issue_id = Some(IssueId::new("LIN-42"));
        let mut second = submission("u2", "second pass");
        second.issue_id = Some(IssueId::new("LIN-42"));

        f.ingestor.submit(first).await.unwrap();
        let err = f.ingestor.submit(second).await.unwrap_err();
        assert_eq!(err.code(), "active_task_exists");
    }

    #[tokio::test]
    async fn dispatch_failure_marks_the_task_failed_and_frees_the_slot() {
        let f = fixture_with(false, RateLimitConfig::default());

        let err = f.ingestor.submit(submission("u1", "doomed")).await.unwrap_err();
        assert_eq!(err.code(), "worker_unavailable");

        let tasks = f.store.list(Default::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.as_deref().unwrap().contains("dispatch failed"));

        let usage = f.store.get_usage(&UserId::new("u1")).await.unwrap();
        assert_eq!(usage.concurrent_tasks, 0);
    }

    #[tokio::test]
    async fn reconcile_marks_stale_tasks_interrupted() {
        let f = fixture();
        let outcome = f.ingestor.submit(submission("u1", "long haul")).await.unwrap();

        // A negative threshold makes every active task count as stale.
        let reconciled =
            reconcile_zombies(&(f.store.clone() as Arc<dyn TaskStore>), &f.limiter, Duration::seconds(-5)).await;
        assert_eq!(reconciled, 1);

        let task = f.store.find_by_id(&outcome.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Interrupted);
        assert_eq!(task.error.as_deref(), Some("worker heartbeat lost"));

        let usage = f.store.get_usage(&UserId::new("u1")).await.unwrap();
        assert_eq!(usage.concurrent_tasks, 0);
    }

    #[tokio::test]
    async fn reconcile_skips_terminal_tasks() {
        let f = fixture();
        let outcome = f.ingestor.submit(submission("u1", "quick win")).await.unwrap();
        f.store
            .update(
                &outcome.task.id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();

        let reconciled =
            reconcile_zombies(&(f.store.clone() as Arc<dyn TaskStore>), &f.limiter, Duration::seconds(-5)).await;
        assert_eq!(reconciled, 0);
    }
}
