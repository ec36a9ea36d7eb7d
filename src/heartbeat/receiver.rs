//! Control-plane side of heartbeat processing.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::store::{TaskPatch, TaskStore, TaskStoreError};
use crate::types::TaskId;

/// One task whose heartbeat update failed.
#[derive(Debug, Clone)]
pub struct HeartbeatFailure {
    pub id: TaskId,
    pub reason: String,
}

/// Result of processing one heartbeat batch.
///
/// Partial failure is data, not an error: callers inspect the report, and
/// the batch never aborts part way through.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    /// Tasks whose `last_heartbeat` was bumped.
    pub processed: usize,

    /// Ids with no matching task record.
    pub not_found: Vec<TaskId>,

    /// Tasks that failed to update.
    pub failures: Vec<HeartbeatFailure>,
}

/// Bumps `last_heartbeat` (and `updated_at`) for every live task in the
/// batch.
///
/// Unknown ids accumulate into `not_found`; tasks already in a terminal
/// status are silently skipped, since a worker's final heartbeat routinely
/// races the completion callback. A store failure on one task is recorded
/// and processing continues to the next id.
pub async fn process_heartbeat(store: &Arc<dyn TaskStore>, task_ids: &[TaskId]) -> HeartbeatReport {
    let mut report = HeartbeatReport::default();
    let now = Utc::now();

    for id in task_ids {
        let task = match store.find_by_id(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                report.not_found.push(id.clone());
                continue;
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "heartbeat lookup failed");
                report.failures.push(HeartbeatFailure {
                    id: id.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "heartbeat for finished task ignored");
            continue;
        }

        match store.update(id, TaskPatch::heartbeat(now)).await {
            Ok(_) => report.processed += 1,
            // The task can reach a terminal status between the lookup and
            // the update; that race is the same silent skip as above.
            Err(TaskStoreError::InvalidTransition { .. }) => {
                debug!(task_id = %id, "task finished mid-batch, heartbeat ignored");
            }
            Err(TaskStoreError::NotFound(_)) => report.not_found.push(id.clone()),
            Err(e) => {
                warn!(task_id = %id, error = %e, "heartbeat update failed");
                report.failures.push(HeartbeatFailure {
                    id: id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    debug!(
        processed = report.processed,
        not_found = report.not_found.len(),
        failures = report.failures.len(),
        "heartbeat batch processed"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewTask};
    use crate::types::{CorrelationId, TaskStatus, UserId, WorkerType};

    fn new_task(n: u32) -> NewTask {
        NewTask {
            id: TaskId::new(format!("task-{n}")),
            correlation_id: CorrelationId::new(format!("corr-{n}")),
            user_id: UserId::new("user-1"),
            approval_event_id: None,
            action_id: None,
            issue_id: None,
            prompt: format!("prompt {n}"),
            repository: "org/repo".to_string(),
            base_branch: "main".to_string(),
            worker_type: WorkerType::Standard,
        }
    }

    async fn store_with_tasks(n: u32) -> (Arc<dyn TaskStore>, Vec<TaskId>) {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let outcome = store.create(new_task(i)).await.unwrap();
            ids.push(outcome.task().id.clone());
        }
        (Arc::new(store), ids)
    }

    #[tokio::test]
    async fn live_tasks_get_heartbeats_bumped() {
        let (store, ids) = store_with_tasks(2).await;

        let report = process_heartbeat(&store, &ids).await;
        assert_eq!(report.processed, 2);
        assert!(report.not_found.is_empty());
        assert!(report.failures.is_empty());

        for id in &ids {
            let task = store.find_by_id(id).await.unwrap().unwrap();
            assert!(task.last_heartbeat.is_some());
        }
    }

    #[tokio::test]
    async fn unknown_ids_accumulate_without_aborting_the_batch() {
        let (store, ids) = store_with_tasks(1).await;
        let batch = vec![
            TaskId::new("no-such-task"),
            ids[0].clone(),
            TaskId::new("also-missing"),
        ];

        let report = process_heartbeat(&store, &batch).await;
        assert_eq!(report.processed, 1);
        assert_eq!(
            report.not_found,
            vec![TaskId::new("no-such-task"), TaskId::new("also-missing")]
        );
    }

    #[tokio::test]
    async fn terminal_tasks_are_silently_skipped() {
        let (store, ids) = store_with_tasks(1).await;
        store
            .update(
                &ids[0],
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        let before = store.find_by_id(&ids[0]).await.unwrap().unwrap();

        let report = process_heartbeat(&store, &ids).await;
        assert_eq!(report.processed, 0);
        assert!(report.not_found.is_empty());
        assert!(report.failures.is_empty());

        let after = store.find_by_id(&ids[0]).await.unwrap().unwrap();
        assert_eq!(after.last_heartbeat, before.last_heartbeat);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn processing_the_same_batch_twice_is_idempotent() {
        let (store, ids) = store_with_tasks(2).await;
        let batch = vec![ids[0].clone(), TaskId::new("ghost"), ids[1].clone()];

        let first = process_heartbeat(&store, &batch).await;
        let second = process_heartbeat(&store, &batch).await;

        assert_eq!(first.processed, second.processed);
        assert_eq!(first.not_found, second.not_found);
    }

    #[tokio::test]
    async fn empty_batch_reports_nothing() {
        let (store, _) = store_with_tasks(0).await;
        let report = process_heartbeat(&store, &[]).await;
        assert_eq!(report.processed, 0);
        assert!(report.not_found.is_empty());
        assert!(report.failures.is_empty());
    }
}
