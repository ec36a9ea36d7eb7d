//! Signed webhook delivery with a bounded retry budget.
//!
//! Each delivery gets 3 synchronous tries with fixed backoff between them
//! (5s, then 15s). A 4xx response is a permanent client error and is never retried;
//! any other failure (5xx, network, timeout) burns a try. Once the budget
//! is exhausted the webhook moves to the durable pending queue instead of
//! being dropped, and a later [`WebhookSender::retry_pending`] sweep picks
//! it up with the same budget and classification.
//!
//! The HMAC signature is recomputed at every send attempt over
//! `"{unixTimestamp}.{jsonBody}"`, because the receiver's replay window
//! has to measure the actual attempt time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::TaskId;

use super::pending::{PendingQueue, PendingQueueError, PendingWebhook};
use super::signature::sign_with_timestamp;

/// Synchronous attempt budget per delivery.
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff schedule, indexed by the attempt that failed. The last entry
/// only applies if the attempt budget grows past three.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(45),
];

/// Header carrying the unix-seconds send timestamp.
pub const HEADER_TIMESTAMP: &str = "x-request-timestamp";
/// Header carrying the hex HMAC-SHA256 signature.
pub const HEADER_SIGNATURE: &str = "x-request-signature";

/// Delivery failure classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WebhookError {
    /// Connection-level failure (DNS, refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// 4xx response: the receiver rejected the request. Permanent.
    #[error("client error: HTTP {0}")]
    Client(u16),

    /// 5xx response: the receiver is unhealthy. Retryable.
    #[error("server error: HTTP {0}")]
    Server(u16),

    /// The request exceeded its I/O timeout. Retryable.
    #[error("delivery timed out")]
    Timeout,
}

impl WebhookError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::Network(_) => "network",
            WebhookError::Client(_) => "4xx",
            WebhookError::Server(_) => "5xx",
            WebhookError::Timeout => "timeout",
        }
    }

    /// Permanent errors never burn a retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, WebhookError::Client(_))
    }
}

/// Transport seam for webhook POSTs, mockable in tests.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// POSTs `body` to `url` with the signature headers set. Returns the
    /// HTTP status code; transport-level failures map to `Network` or
    /// `Timeout`.
    async fn post_signed(
        &self,
        url: &str,
        timestamp: i64,
        signature: &str,
        body: &[u8],
    ) -> Result<u16, WebhookError>;
}

/// Production transport over reqwest with a 30s I/O timeout.
pub struct HttpDeliveryTransport {
    client: reqwest::Client,
}

impl HttpDeliveryTransport {
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend fails to
    /// initialize.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpDeliveryTransport { client })
    }
}

#[async_trait]
impl DeliveryTransport for HttpDeliveryTransport {
    async fn post_signed(
        &self,
        url: &str,
        timestamp: i64,
        signature: &str,
        body: &[u8],
    ) -> Result<u16, WebhookError> {
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_SIGNATURE, signature)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WebhookError::Timeout
                } else {
                    WebhookError::Network(e.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

/// One webhook to deliver.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub url: String,
    pub secret: String,
    pub payload: Value,
    pub task_id: TaskId,
}

/// Outcome of a [`WebhookSender::retry_pending`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySweepReport {
    /// Entries delivered successfully and removed.
    pub delivered: usize,

    /// Entries dropped because they outlived the TTL.
    pub expired: usize,

    /// Entries dropped on a 4xx (permanent) response.
    pub rejected: usize,

    /// Entries that failed again and were written back.
    pub requeued: usize,
}

/// Delivers signed webhooks and manages the pending queue.
pub struct WebhookSender {
    transport: Arc<dyn DeliveryTransport>,
    queue: PendingQueue,
    backoff: [Duration; 3],
}

impl WebhookSender {
    pub fn new(transport: Arc<dyn DeliveryTransport>, queue: PendingQueue) -> Self {
        WebhookSender {
            transport,
            queue,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Overrides the backoff schedule (tests use millisecond delays).
    pub fn with_backoff(mut self, backoff: [Duration; 3]) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delivers a webhook, retrying within the synchronous budget.
    ///
    /// # Errors
    ///
    /// `Client` for a 4xx (not queued, not retried); any other variant
    /// after the budget is exhausted, in which case the webhook has been
    /// appended to the pending queue for a later sweep.
    pub async fn send(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        match self.attempt_with_budget(delivery).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_permanent() => {
                warn!(
                    task_id = %delivery.task_id,
                    error = %e,
                    "webhook rejected by receiver, not retrying"
                );
                Err(e)
            }
            Err(e) => {
                warn!(
                    task_id = %delivery.task_id,
                    error = %e,
                    "webhook retries exhausted, queueing for later sweep"
                );
                let entry = PendingWebhook {
                    url: delivery.url.clone(),
                    secret: delivery.secret.clone(),
                    payload: delivery.payload.clone(),
                    task_id: delivery.task_id.clone(),
                    attempts: MAX_ATTEMPTS,
                    created_at: Utc::now(),
                };
                if let Err(queue_err) = self.queue.push(entry) {
                    // Losing the queue write means losing the callback;
                    // nothing further to do but make noise.
                    warn!(
                        task_id = %delivery.task_id,
                        error = %queue_err,
                        "failed to persist pending webhook"
                    );
                }
                Err(e)
            }
        }
    }

    /// Runs the synchronous attempt budget without touching the queue.
    async fn attempt_with_budget(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(&delivery.payload)
            .map_err(|e| WebhookError::Network(format!("payload serialization: {e}")))?;

        let mut last_error = WebhookError::Timeout;
        for attempt in 0..MAX_ATTEMPTS {
            // Fresh timestamp and signature per attempt: the receiver's
            // replay window measures this send, not the first one.
            let timestamp = Utc::now().timestamp();
            let signature = sign_with_timestamp(delivery.secret.as_bytes(), timestamp, &body);

            let outcome = self
                .transport
                .post_signed(&delivery.url, timestamp, &signature, &body)
                .await;

            let error = match outcome {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(task_id = %delivery.task_id, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(status) if (400..500).contains(&status) => {
                    return Err(WebhookError::Client(status));
                }
                Ok(status) => WebhookError::Server(status),
                Err(e) => e,
            };

            debug!(
                task_id = %delivery.task_id,
                attempt,
                error = %error,
                "webhook attempt failed"
            );
            last_error = error;
            // Backoff only between attempts; once the budget is spent the
            // caller gets the error (and the queue write) immediately.
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(self.backoff[attempt as usize]).await;
            }
        }

        Err(last_error)
    }

    /// Sweeps the pending queue: discards entries past the TTL, re-attempts
    /// the rest with the same budget and classification, and writes the
    /// survivors back.
    ///
    /// # Errors
    ///
    /// Only queue load/save failures; individual delivery failures are
    /// part of the report, never an error.
    pub async fn retry_pending(&self) -> Result<RetrySweepReport, PendingQueueError> {
        let now = Utc::now();
        let (live, expired) = self.queue.load_live(now)?;
        let mut report = RetrySweepReport {
            expired,
            ..RetrySweepReport::default()
        };

        let mut survivors = Vec::new();
        for mut entry in live {
            let delivery = WebhookDelivery {
                url: entry.url.clone(),
                secret: entry.secret.clone(),
                payload: entry.payload.clone(),
                task_id: entry.task_id.clone(),
            };
            match self.attempt_with_budget(&delivery).await {
                Ok(()) => report.delivered += 1,
                Err(e) if e.is_permanent() => {
                    info!(task_id = %entry.task_id, error = %e, "pending webhook rejected, dropping");
                    report.rejected += 1;
                }
                Err(_) => {
                    entry.attempts += MAX_ATTEMPTS;
                    survivors.push(entry);
                    report.requeued += 1;
                }
            }
        }

        self.queue.save(&survivors)?;
        info!(
            delivered = report.delivered,
            expired = report.expired,
            rejected = report.rejected,
            requeued = report.requeued,
            "pending webhook sweep complete"
        );
        Ok(report)
    }
}
