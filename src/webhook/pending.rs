//! Durable queue for webhooks that exhausted their synchronous retries.
//!
//! The queue is a single JSON file loaded and saved as a whole, written
//! with the atomic temp-then-rename pattern so a crash mid-save never
//! corrupts it. Entries older than the 24-hour TTL are discarded on load;
//! a callback that cannot be delivered within a day is not worth replaying.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::write_atomic;
use crate::types::TaskId;

/// How long an undelivered webhook stays in the queue.
pub const PENDING_TTL_HOURS: i64 = 24;

/// A queued, not-yet-delivered callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWebhook {
    /// Delivery target.
    pub url: String,

    /// The per-task secret used to re-sign at each send attempt.
    pub secret: String,

    /// The callback payload, stored verbatim.
    pub payload: serde_json::Value,

    pub task_id: TaskId,

    /// Send attempts made so far (synchronous budget included).
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
}

impl PendingWebhook {
    /// Returns true once the entry has outlived the TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::hours(PENDING_TTL_HOURS)
    }
}

/// Errors from queue persistence.
#[derive(Debug, Error)]
pub enum PendingQueueError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// File-backed pending-webhook queue.
///
/// Load/save happen as a whole; there are no partial-record updates.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    path: PathBuf,
}

impl PendingQueue {
    /// Creates a queue backed by the given file. The parent directory is
    /// created if missing; the file itself is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PendingQueueError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(PendingQueue { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all entries. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<PendingWebhook>, PendingQueueError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the queue contents atomically.
    pub fn save(&self, entries: &[PendingWebhook]) -> Result<(), PendingQueueError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Appends one entry (load-modify-save).
    pub fn push(&self, entry: PendingWebhook) -> Result<(), PendingQueueError> {
        let mut entries = self.load()?;
        entries.push(entry);
        self.save(&entries)
    }

    /// Loads the queue and splits off entries past the TTL.
    ///
    /// Returns `(live, expired_count)`. The caller decides when to write
    /// the survivors back.
    pub fn load_live(&self, now: DateTime<Utc>) -> Result<(Vec<PendingWebhook>, usize), PendingQueueError> {
        let entries = self.load()?;
        let before = entries.len();
        let live: Vec<PendingWebhook> =
            entries.into_iter().filter(|e| !e.is_expired(now)).collect();
        let expired = before - live.len();
        Ok((live, expired))
    }
}
