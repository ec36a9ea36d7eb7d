//! Dispatching tasks to workers with one-shot fallback.
//!
//! The algorithm: probe the primary worker; if the probe fails, the
//! dispatch call errors at the network level, or the worker answers 503,
//! retry against the fallback exactly once. There are no further tiers.
//!
//! Before any HTTP call goes out, a fresh per-task webhook secret is
//! generated and bound to the task record, so a slow or failed write can
//! never leave a task dispatched without a verifiable secret. The dispatch
//! request itself is signed over the fully serialized body with the shared
//! worker secret.
//!
//! Worker-side cancellation is best-effort by design: the task store is the
//! system of record, and the DELETE to the worker is a courtesy whose
//! failure is logged and swallowed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{TaskPatch, TaskStore, TaskStoreError};
use crate::types::{Task, TaskId, WorkerLocation, WorkerType};
use crate::webhook::sign_with_timestamp;

use super::registry::{WorkerEndpoint, WorkerRegistry};

/// Dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No worker (primary or fallback) could be reached.
    #[error("no worker available")]
    WorkerUnavailable,

    /// Every reachable worker answered 503.
    #[error("all workers busy")]
    WorkerBusy,

    /// A worker rejected the dispatch outright (non-503 error status).
    #[error("worker rejected dispatch: HTTP {0}")]
    DispatchFailed(u16),

    /// Connection-level failure talking to a worker.
    #[error("network error: {0}")]
    Network(String),

    /// The worker answered with something we could not interpret.
    #[error("invalid worker response: {0}")]
    InvalidResponse(String),

    /// Binding the webhook secret failed; the task was never sent.
    #[error("failed to bind webhook secret: {0}")]
    SecretBinding(#[from] TaskStoreError),
}

impl DispatchError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::WorkerUnavailable => "worker_unavailable",
            DispatchError::WorkerBusy => "worker_busy",
            DispatchError::DispatchFailed(_) => "dispatch_failed",
            DispatchError::Network(_) => "network_error",
            DispatchError::InvalidResponse(_) => "invalid_response",
            DispatchError::SecretBinding(_) => "dispatch_failed",
        }
    }
}

/// The dispatch request body sent to a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linear_issue_id: Option<String>,
    pub prompt: String,
    pub system_prompt_hash: String,
    pub repository: String,
    pub base_branch: String,
    pub worker_type: WorkerType,
    pub webhook_url: String,
    pub webhook_secret: String,
}

/// Transport seam to a worker, mockable in tests.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Probes `{base_url}/health`. Any error counts as unhealthy.
    async fn health_check(&self, base_url: &str) -> bool;

    /// POSTs a signed dispatch body to `{base_url}/tasks` and returns the
    /// HTTP status.
    async fn dispatch(
        &self,
        base_url: &str,
        timestamp: i64,
        signature: &str,
        body: &[u8],
    ) -> Result<u16, DispatchError>;

    /// DELETEs `{base_url}/tasks/{task_id}` and returns the HTTP status.
    async fn cancel(&self, base_url: &str, task_id: &TaskId) -> Result<u16, DispatchError>;
}

/// Production transport over reqwest with a 30s I/O timeout.
pub struct HttpWorkerTransport {
    client: reqwest::Client,
}

impl HttpWorkerTransport {
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend fails to
    /// initialize.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(HttpWorkerTransport { client })
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn health_check(&self, base_url: &str) -> bool {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn dispatch(
        &self,
        base_url: &str,
        timestamp: i64,
        signature: &str,
        body: &[u8],
    ) -> Result<u16, DispatchError> {
        let url = format!("{}/tasks", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header(crate::webhook::HEADER_TIMESTAMP, timestamp.to_string())
            .header(crate::webhook::HEADER_SIGNATURE, signature)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(response.status().as_u16())
    }

    async fn cancel(&self, base_url: &str, task_id: &TaskId) -> Result<u16, DispatchError> {
        let url = format!("{}/tasks/{}", base_url.trim_end_matches('/'), task_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub worker_location: WorkerLocation,
}

/// Generates a fresh per-task webhook secret: 32 random bytes, hex-encoded.
/// Never reused across tasks.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Dispatches tasks across the worker pool.
pub struct Dispatcher {
    transport: Arc<dyn WorkerTransport>,
    registry: WorkerRegistry,
    store: Arc<dyn TaskStore>,

    /// Shared secret authenticating control plane <-> worker traffic.
    shared_secret: Vec<u8>,

    /// Public base URL of the control plane, for callback targets.
    callback_base_url: String,

    /// Hash of the system prompt in force, forwarded for provenance.
    system_prompt_hash: String,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        registry: WorkerRegistry,
        store: Arc<dyn TaskStore>,
        shared_secret: impl Into<Vec<u8>>,
        callback_base_url: impl Into<String>,
        system_prompt_hash: impl Into<String>,
    ) -> Self {
        Dispatcher {
            transport,
            registry,
            store,
            shared_secret: shared_secret.into(),
            callback_base_url: callback_base_url.into(),
            system_prompt_hash: system_prompt_hash.into(),
        }
    }

    /// URL workers call back with completion webhooks.
    fn callback_url(&self) -> String {
        format!(
            "{}/callbacks/task",
            self.callback_base_url.trim_end_matches('/')
        )
    }

    /// Dispatches a task: binds a fresh webhook secret, then tries the
    /// primary worker with at most one fallback attempt.
    ///
    /// On success the task record carries the worker location and
    /// `dispatched_at`.
    ///
    /// # Errors
    ///
    /// `SecretBinding` if the secret could not be written (no HTTP call is
    /// made); otherwise the worker error that ended the attempt chain.
    pub async fn dispatch(&self, task: &Task) -> Result<DispatchOutcome, DispatchError> {
        let primary = self
            .registry
            .primary()
            .ok_or(DispatchError::WorkerUnavailable)?;

        // Bind the secret before any network traffic. The secret is
        // immutable once set; a redispatch of the same task reuses it.
        let secret = match &task.webhook_secret {
            Some(secret) => secret.clone(),
            None => {
                let secret = generate_webhook_secret();
                self.store
                    .update(
                        &task.id,
                        TaskPatch {
                            webhook_secret: Some(secret.clone()),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                secret
            }
        };

        let request = DispatchRequest {
            task_id: task.id.clone(),
            linear_issue_id: task.issue_id.as_ref().map(|i| i.as_str().to_string()),
            prompt: task.prompt.clone(),
            system_prompt_hash: self.system_prompt_hash.clone(),
            repository: task.repository.clone(),
            base_branch: task.base_branch.clone(),
            worker_type: task.worker_type,
            webhook_url: self.callback_url(),
            webhook_secret: secret,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| DispatchError::InvalidResponse(format!("body serialization: {e}")))?;

        match self.try_worker(primary, &body).await {
            Ok(()) => self.record_dispatched(task, primary.location).await,
            Err(e) if should_fall_back(&e) => {
                let fallback = match self.registry.fallback() {
                    Some(fallback) => fallback,
                    None => return Err(e),
                };
                info!(
                    task_id = %task.id,
                    primary = %primary.location,
                    fallback = %fallback.location,
                    error = %e,
                    "primary worker unavailable, trying fallback"
                );
                // Exactly one fallback attempt; its failure is final.
                self.try_worker(fallback, &body).await?;
                self.record_dispatched(task, fallback.location).await
            }
            Err(e) => Err(e),
        }
    }

    /// Probes and dispatches against one worker.
    async fn try_worker(&self, worker: &WorkerEndpoint, body: &[u8]) -> Result<(), DispatchError> {
        if !self.transport.health_check(&worker.base_url).await {
            debug!(worker = %worker.location, "health probe failed");
            return Err(DispatchError::WorkerUnavailable);
        }

        // Signing material covers the fully serialized request body.
        let timestamp = Utc::now().timestamp();
        let signature = sign_with_timestamp(&self.shared_secret, timestamp, body);

        let status = self
            .transport
            .dispatch(&worker.base_url, timestamp, &signature, body)
            .await?;
        match status {
            s if (200..300).contains(&s) => Ok(()),
            503 => Err(DispatchError::WorkerBusy),
            s => Err(DispatchError::DispatchFailed(s)),
        }
    }

    async fn record_dispatched(
        &self,
        task: &Task,
        location: WorkerLocation,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.store
            .update(
                &task.id,
                TaskPatch {
                    worker_location: Some(location),
                    dispatched_at: Some(Utc::now()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        info!(task_id = %task.id, worker = %location, "task dispatched");
        Ok(DispatchOutcome {
            worker_location: location,
        })
    }

    /// Notifies the worker that a task was cancelled. Best-effort: any
    /// failure is logged and swallowed, because the task store already
    /// holds the authoritative `cancelled` status.
    pub async fn cancel_on_worker(&self, task_id: &TaskId, location: WorkerLocation) {
        let worker = match self.registry.get(location) {
            Some(worker) => worker,
            None => {
                warn!(task_id = %task_id, %location, "no worker registered at location, skipping cancel");
                return;
            }
        };

        match self.transport.cancel(&worker.base_url, task_id).await {
            Ok(status) if (200..300).contains(&status) => {
                debug!(task_id = %task_id, %location, "worker acknowledged cancel");
            }
            Ok(status) => {
                warn!(task_id = %task_id, %location, status, "worker cancel returned non-2xx");
            }
            Err(e) => {
                warn!(task_id = %task_id, %location, error = %e, "worker cancel failed");
            }
        }
    }
}

/// Unavailability triggers the single fallback attempt; outright
/// rejections do not.
fn should_fall_back(error: &DispatchError) -> bool {
    matches!(
        error,
        DispatchError::WorkerUnavailable | DispatchError::WorkerBusy | DispatchError::Network(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreateOutcome, MemoryStore, NewTask};
    use crate::types::{CorrelationId, UserId};
    use crate::webhook::verify_with_timestamp;
    use std::sync::Mutex;

    /// Scripted worker pool keyed by base URL.
    #[derive(Default)]
    struct FakeWorkers {
        healthy: Mutex<Vec<String>>,
        dispatch_status: Mutex<std::collections::HashMap<String, u16>>,
        dispatches: Mutex<Vec<(String, i64, String, Vec<u8>)>>,
        cancels: Mutex<Vec<(String, TaskId)>>,
        cancel_status: Mutex<Option<Result<u16, ()>>>,
    }

    #[async_trait]
    impl WorkerTransport for FakeWorkers {
        async fn health_check(&self, base_url: &str) -> bool {
            self.healthy.lock().unwrap().iter().any(|u| u == base_url)
        }

        async fn dispatch(
            &self,
            base_url: &str,
            timestamp: i64,
            signature: &str,
            body: &[u8],
        ) -> Result<u16, DispatchError> {
            self.dispatches.lock().unwrap().push((
                base_url.to_string(),
                timestamp,
                signature.to_string(),
                body.to_vec(),
            ));
            Ok(*self
                .dispatch_status
                .lock()
                .unwrap()
                .get(base_url)
                .unwrap_or(&200))
        }

        async fn cancel(&self, base_url: &str, task_id: &TaskId) -> Result<u16, DispatchError> {
            self.cancels
                .lock()
                .unwrap()
                .push((base_url.to_string(), task_id.clone()));
            match *self.cancel_status.lock().unwrap() {
                Some(Ok(status)) => Ok(status),
                Some(Err(())) => Err(DispatchError::Network("refused".to_string())),
                None => Ok(200),
            }
        }
    }

    const HOST_URL: &str = "http://host.internal:8080";
    const VM_URL: &str = "http://vm.internal:8080";

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(vec![
            WorkerEndpoint::new(WorkerLocation::Host, HOST_URL, 1),
            WorkerEndpoint::new(WorkerLocation::Vm, VM_URL, 2),
        ])
    }

    async fn make_task(store: &MemoryStore) -> Task {
        let outcome = store
            .create(NewTask {
                id: TaskId::new("t1"),
                correlation_id: CorrelationId::new("c1"),
                user_id: UserId::new("u1"),
                approval_event_id: None,
                action_id: None,
                issue_id: None,
                prompt: "add dark mode".to_string(),
                repository: "acme/widgets".to_string(),
                base_branch: "main".to_string(),
                worker_type: WorkerType::Standard,
            })
            .await
            .unwrap();
        match outcome {
            CreateOutcome::Created(task) => task,
            CreateOutcome::Existing(task) => task,
        }
    }

    fn dispatcher(transport: Arc<FakeWorkers>, store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(
            transport,
            registry(),
            store,
            b"shared-secret".to_vec(),
            "https://control.example",
            "sph-abc123",
        )
    }

    #[tokio::test]
    async fn healthy_primary_gets_the_task() {
        let workers = Arc::new(FakeWorkers::default());
        workers.healthy.lock().unwrap().push(HOST_URL.to_string());
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        let outcome = dispatcher(workers.clone(), store.clone())
            .dispatch(&task)
            .await
            .unwrap();
        assert_eq!(outcome.worker_location, WorkerLocation::Host);

        let updated = store.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(updated.worker_location, Some(WorkerLocation::Host));
        assert!(updated.dispatched_at.is_some());
    }

    #[tokio::test]
    async fn dead_primary_probe_falls_back_to_vm() {
        let workers = Arc::new(FakeWorkers::default());
        workers.healthy.lock().unwrap().push(VM_URL.to_string());
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        let outcome = dispatcher(workers.clone(), store.clone())
            .dispatch(&task)
            .await
            .unwrap();
        assert_eq!(outcome.worker_location, WorkerLocation::Vm);

        // Only the VM ever received a dispatch.
        let dispatches = workers.dispatches.lock().unwrap();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].0, VM_URL);
    }

    #[tokio::test]
    async fn busy_primary_falls_back_once() {
        let workers = Arc::new(FakeWorkers::default());
        {
            let mut healthy = workers.healthy.lock().unwrap();
            healthy.push(HOST_URL.to_string());
            healthy.push(VM_URL.to_string());
        }
        workers
            .dispatch_status
            .lock()
            .unwrap()
            .insert(HOST_URL.to_string(), 503);
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        let outcome = dispatcher(workers.clone(), store.clone())
            .dispatch(&task)
            .await
            .unwrap();
        assert_eq!(outcome.worker_location, WorkerLocation::Vm);
        assert_eq!(workers.dispatches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn both_workers_busy_is_worker_busy_after_two_attempts() {
        let workers = Arc::new(FakeWorkers::default());
        {
            let mut healthy = workers.healthy.lock().unwrap();
            healthy.push(HOST_URL.to_string());
            healthy.push(VM_URL.to_string());
        }
        {
            let mut status = workers.dispatch_status.lock().unwrap();
            status.insert(HOST_URL.to_string(), 503);
            status.insert(VM_URL.to_string(), 503);
        }
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        let err = dispatcher(workers.clone(), store.clone())
            .dispatch(&task)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "worker_busy");
        // No third attempt anywhere.
        assert_eq!(workers.dispatches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn outright_rejection_does_not_fall_back() {
        let workers = Arc::new(FakeWorkers::default());
        {
            let mut healthy = workers.healthy.lock().unwrap();
            healthy.push(HOST_URL.to_string());
            healthy.push(VM_URL.to_string());
        }
        workers
            .dispatch_status
            .lock()
            .unwrap()
            .insert(HOST_URL.to_string(), 400);
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        let err = dispatcher(workers.clone(), store.clone())
            .dispatch(&task)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "dispatch_failed");
        assert_eq!(workers.dispatches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn secret_is_bound_even_when_dispatch_fails() {
        let workers = Arc::new(FakeWorkers::default()); // nothing healthy
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        let err = dispatcher(workers, store.clone()).dispatch(&task).await.unwrap_err();
        assert_eq!(err.code(), "worker_unavailable");

        let updated = store.find_by_id(&task.id).await.unwrap().unwrap();
        assert!(updated.webhook_secret.is_some());
    }

    #[tokio::test]
    async fn request_body_is_signed_and_verifiable() {
        let workers = Arc::new(FakeWorkers::default());
        workers.healthy.lock().unwrap().push(HOST_URL.to_string());
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;

        dispatcher(workers.clone(), store).dispatch(&task).await.unwrap();

        let dispatches = workers.dispatches.lock().unwrap();
        let (_, ts, sig, body) = &dispatches[0];
        verify_with_timestamp(b"shared-secret", *ts, body, sig, Utc::now()).unwrap();

        // The wire body is camelCase and carries the callback wiring.
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed["taskId"], "t1");
        assert_eq!(parsed["baseBranch"], "main");
        assert_eq!(parsed["workerType"], "standard");
        assert_eq!(
            parsed["webhookUrl"],
            "https://control.example/callbacks/task"
        );
        assert!(parsed["webhookSecret"].as_str().unwrap().len() == 64);
        assert!(parsed.get("linearIssueId").is_none());
    }

    #[tokio::test]
    async fn redispatch_reuses_the_bound_secret() {
        let workers = Arc::new(FakeWorkers::default());
        workers.healthy.lock().unwrap().push(HOST_URL.to_string());
        let store = Arc::new(MemoryStore::new());
        let task = make_task(&store).await;
        let d = dispatcher(workers.clone(), store.clone());

        d.dispatch(&task).await.unwrap();
        let bound = store
            .find_by_id(&task.id)
            .await
            .unwrap()
            .unwrap();

        // Redispatching (e.g. after a zombie reconciliation re-queue) must
        // not attempt to rebind the immutable secret.
        d.dispatch(&bound).await.unwrap();
        let after = store.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(after.webhook_secret, bound.webhook_secret);
    }

    #[tokio::test]
    async fn cancel_on_worker_swallows_failures() {
        let workers = Arc::new(FakeWorkers::default());
        *workers.cancel_status.lock().unwrap() = Some(Err(()));
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(workers.clone(), store);

        // Must not panic or propagate anything.
        d.cancel_on_worker(&TaskId::new("t1"), WorkerLocation::Vm).await;
        assert_eq!(workers.cancels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_on_worker_tolerates_non_2xx() {
        let workers = Arc::new(FakeWorkers::default());
        *workers.cancel_status.lock().unwrap() = Some(Ok(500));
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(workers.clone(), store);

        d.cancel_on_worker(&TaskId::new("t1"), WorkerLocation::Host).await;
        assert_eq!(workers.cancels.lock().unwrap().len(), 1);
    }

    #[test]
    fn secrets_are_unique_and_hex() {
        let a = generate_webhook_secret();
        let b = generate_webhook_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
