//! Worker-side heartbeat sender.
//!
//! Holds the set of task ids currently executing on the worker and, on a
//! fixed interval, POSTs the whole list in one signed batch. A failed post
//! is logged and retried on the next tick only; missing a single interval
//! does not yet make a task a zombie, so there is no immediate retry.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::TaskId;
use crate::webhook::signature::sign_body;

/// Header carrying the hex HMAC-SHA256 signature over the batch body.
pub const HEADER_HEARTBEAT_SIGNATURE: &str = "x-webhook-signature";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBatch<'a> {
    task_ids: &'a [TaskId],
}

/// Transport seam for heartbeat POSTs, mockable in tests.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    /// POSTs `body` with the signature header set. Returns the HTTP status
    /// code; transport-level failures come back as an error string.
    async fn post(&self, url: &str, signature: &str, body: &[u8]) -> Result<u16, String>;
}

/// Production transport over reqwest with a 30s I/O timeout.
pub struct HttpHeartbeatTransport {
    client: reqwest::Client,
}

impl HttpHeartbeatTransport {
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend fails to
    /// initialize.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpHeartbeatTransport { client })
    }
}

#[async_trait]
impl HeartbeatTransport for HttpHeartbeatTransport {
    async fn post(&self, url: &str, signature: &str, body: &[u8]) -> Result<u16, String> {
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header(HEADER_HEARTBEAT_SIGNATURE, signature)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

/// Periodic batched liveness reporter.
pub struct HeartbeatSender<T> {
    transport: T,
    endpoint_url: String,
    shared_secret: String,
    interval: Duration,
    tasks: Mutex<BTreeSet<TaskId>>,
}

impl<T: HeartbeatTransport> HeartbeatSender<T> {
    pub fn new(
        transport: T,
        endpoint_url: impl Into<String>,
        shared_secret: impl Into<String>,
        interval: Duration,
    ) -> Self {
        HeartbeatSender {
            transport,
            endpoint_url: endpoint_url.into(),
            shared_secret: shared_secret.into(),
            interval,
            tasks: Mutex::new(BTreeSet::new()),
        }
    }

    /// Starts reporting liveness for a task.
    pub fn register(&self, id: TaskId) {
        self.tasks.lock().unwrap().insert(id);
    }

    /// Stops reporting liveness for a task. Unregistering an unknown id is
    /// a no-op.
    pub fn unregister(&self, id: &TaskId) {
        self.tasks.lock().unwrap().remove(id);
    }

    /// Number of currently-registered tasks.
    pub fn registered(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Runs the send loop until `shutdown` is cancelled. Stopping is
    /// idempotent; a token cancelled before the first tick exits
    /// immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it
        // so the first batch goes out one interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("heartbeat sender stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.send_batch().await;
                }
            }
        }
    }

    /// Sends one batch. A failure is logged and the batch is dropped; the
    /// next tick sends a fresh snapshot of the registered set.
    async fn send_batch(&self) {
        let ids: Vec<TaskId> = self.tasks.lock().unwrap().iter().cloned().collect();
        if ids.is_empty() {
            return;
        }

        let body = match serde_json::to_vec(&HeartbeatBatch { task_ids: &ids }) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize heartbeat batch");
                return;
            }
        };
        let signature = sign_body(self.shared_secret.as_bytes(), &body);

        match self.transport.post(&self.endpoint_url, &signature, &body).await {
            Ok(status) if (200..300).contains(&status) => {
                debug!(tasks = ids.len(), "heartbeat batch sent");
            }
            Ok(status) => {
                warn!(status, tasks = ids.len(), "heartbeat rejected, will retry next tick");
            }
            Err(e) => {
                warn!(error = %e, tasks = ids.len(), "heartbeat send failed, will retry next tick");
            }
        }
    }
}
