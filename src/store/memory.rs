//! In-memory task store with conditional-write semantics.
//!
//! This is the reference implementation of the [`TaskStore`] contract. All
//! creates and updates run under a single lock, which gives the same
//! guarantees the production document store provides through conditional/
//! transactional writes: concurrent creates for the same dedup key resolve
//! to one winner, and the loser reads back the winner's record.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::types::{
    ActionId, ApprovalEventId, DedupKey, Task, TaskId, TaskStatus, UserId, UserUsage,
};

use super::{
    CreateOutcome, NewTask, TaskFilter, TaskPatch, TaskStore, TaskStoreError, UsageStore,
};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    by_approval: HashMap<ApprovalEventId, TaskId>,
    by_action: HashMap<ActionId, TaskId>,
    by_dedup: HashMap<DedupKey, TaskId>,
    usage: HashMap<UserId, UserUsage>,
}

/// In-memory [`TaskStore`] and [`UsageStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, TaskStoreError> {
        self.inner
            .lock()
            .map_err(|_| TaskStoreError::Storage("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, input: NewTask) -> Result<CreateOutcome, TaskStoreError> {
        let mut inner = self.lock()?;

        // Layer 1: replayed approval events return the original task.
        if let Some(approval) = &input.approval_event_id {
            if let Some(existing) = inner.by_approval.get(approval) {
                let task = inner.tasks[existing].clone();
                return Ok(CreateOutcome::Existing(task));
            }
        }

        // Layer 2: at-least-once action retries return the original task.
        if let Some(action) = &input.action_id {
            if let Some(existing) = inner.by_action.get(action) {
                let task = inner.tasks[existing].clone();
                return Ok(CreateOutcome::Existing(task));
            }
        }

        // Layer 3: UI double-submission collapses onto the in-flight task.
        // Once that task reaches a terminal status the same prompt may be
        // submitted again, so the match is scoped to active tasks.
        let dedup_key = DedupKey::derive(&input.user_id, &input.prompt);
        if let Some(existing) = inner.by_dedup.get(&dedup_key) {
            let task = inner.tasks[existing].clone();
            if task.is_active() {
                return Ok(CreateOutcome::Existing(task));
            }
        }

        // Layer 4: one active task per issue, and this one is a hard
        // reject. Two workers pushing to the same external issue is a
        // correctness hazard the client must not retry through.
        if let Some(issue) = &input.issue_id {
            let active = inner
                .tasks
                .values()
                .find(|t| t.issue_id.as_ref() == Some(issue) && t.is_active());
            if let Some(active) = active {
                return Err(TaskStoreError::ActiveTaskExists {
                    issue: issue.clone(),
                    task: active.id.clone(),
                });
            }
        }

        let now = Utc::now();
        let task = Task {
            id: input.id.clone(),
            correlation_id: input.correlation_id,
            user_id: input.user_id,
            approval_event_id: input.approval_event_id.clone(),
            action_id: input.action_id.clone(),
            dedup_key: dedup_key.clone(),
            issue_id: input.issue_id,
            prompt: input.prompt,
            repository: input.repository,
            base_branch: input.base_branch,
            worker_type: input.worker_type,
            worker_location: None,
            status: TaskStatus::Dispatched,
            result: None,
            error: None,
            webhook_secret: None,
            cancel_nonce: None,
            cancel_nonce_expires_at: None,
            created_at: now,
            updated_at: now,
            dispatched_at: None,
            completed_at: None,
            last_heartbeat: None,
        };

        if let Some(approval) = &task.approval_event_id {
            inner.by_approval.insert(approval.clone(), task.id.clone());
        }
        if let Some(action) = &task.action_id {
            inner.by_action.insert(action.clone(), task.id.clone());
        }
        inner.by_dedup.insert(dedup_key, task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());

        Ok(CreateOutcome::Created(task))
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, TaskStoreError> {
        let inner = self.lock()?;
        Ok(inner.tasks.get(id).cloned())
    }

    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, TaskStoreError> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))?;

        if let Some(next) = patch.status {
            // A terminal status is absorbing even against a repeat of
            // itself: a redelivered completion webhook must fail here, not
            // run the completion side effects a second time.
            let allowed = !task.status.is_terminal()
                && (next == task.status || task.status.can_transition_to(next));
            if !allowed {
                return Err(TaskStoreError::InvalidTransition {
                    from: task.status,
                    to: next,
                });
            }
        }

        if patch.webhook_secret.is_some() && task.webhook_secret.is_some() {
            return Err(TaskStoreError::SecretAlreadyBound(id.clone()));
        }

        if let Some(next) = patch.status {
            task.status = next;
        }
        if let Some(result) = patch.result {
            task.result = Some(result);
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        if let Some(location) = patch.worker_location {
            task.worker_location = Some(location);
        }
        if let Some(secret) = patch.webhook_secret {
            task.webhook_secret = Some(secret);
        }
        if let Some((nonce, expires_at)) = patch.cancel_nonce {
            task.cancel_nonce = Some(nonce);
            task.cancel_nonce_expires_at = Some(expires_at);
        }
        if let Some(at) = patch.dispatched_at {
            task.dispatched_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            task.completed_at = Some(at);
        }
        if let Some(at) = patch.last_heartbeat {
            task.last_heartbeat = Some(at);
        }

        // updated_at only moves forward
        task.updated_at = Utc::now().max(task.updated_at);

        Ok(task.clone())
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                filter
                    .user_id
                    .as_ref()
                    .is_none_or(|u| &t.user_id == u)
            })
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn find_zombie_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let inner = self.lock()?;
        let cutoff = Utc::now() - stale_threshold;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.is_active() && t.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn count_created_today(&self, user_id: &UserId) -> Result<u64, TaskStoreError> {
        let inner = self.lock()?;
        let today = Utc::now().date_naive();
        Ok(inner
            .tasks
            .values()
            .filter(|t| &t.user_id == user_id && t.created_at.date_naive() == today)
            .count() as u64)
    }

    async fn consume_cancel_nonce(
        &self,
        id: &TaskId,
        nonce: &str,
    ) -> Result<Task, TaskStoreError> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))?;

        // The nonce check and the transition commit in one critical
        // section make the nonce single-use under any interleaving.
        if task.cancel_nonce.as_deref() != Some(nonce) {
            return Err(TaskStoreError::NonceMismatch(id.clone()));
        }
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(TaskStoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }

        let now = Utc::now();
        task.status = TaskStatus::Cancelled;
        task.error = Some("cancelled by user".to_string());
        task.cancel_nonce = None;
        task.cancel_nonce_expires_at = None;
        task.completed_at = Some(now);
        task.updated_at = now.max(task.updated_at);

        Ok(task.clone())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get_usage(&self, user_id: &UserId) -> Result<UserUsage, TaskStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .usage
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserUsage::empty(user_id.clone())))
    }

    async fn apply_task_start(
        &self,
        user_id: &UserId,
        estimated_cost: f64,
    ) -> Result<UserUsage, TaskStoreError> {
        let mut inner = self.lock()?;
        let usage = inner
            .usage
            .entry(user_id.clone())
            .or_insert_with(|| UserUsage::empty(user_id.clone()));
        usage.concurrent_tasks += 1;
        usage.tasks_this_hour += 1;
        usage.cost_today += estimated_cost;
        usage.cost_this_month += estimated_cost;
        Ok(usage.clone())
    }

    async fn apply_task_complete(
        &self,
        user_id: &UserId,
        estimated_cost: f64,
        actual_cost: Option<f64>,
    ) -> Result<UserUsage, TaskStoreError> {
        let mut inner = self.lock()?;
        let usage = inner
            .usage
            .entry(user_id.clone())
            .or_insert_with(|| UserUsage::empty(user_id.clone()));
        usage.concurrent_tasks = usage.concurrent_tasks.saturating_sub(1);
        if let Some(actual) = actual_cost {
            // Replace the optimistic estimate with the real cost. Clamped
            // at zero so a reconciliation can never drive counters negative.
            usage.cost_today = (usage.cost_today - estimated_cost + actual).max(0.0);
            usage.cost_this_month = (usage.cost_this_month - estimated_cost + actual).max(0.0);
        }
        Ok(usage.clone())
    }
}
