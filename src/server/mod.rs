//! HTTP surface of the control plane.
//!
//! # Endpoints
//!
//! - `POST /tasks` - submits a coding task (admission, dedup, dispatch)
//! - `POST /tasks/{id}/cancel` - nonce-authorized user cancellation
//! - `POST /callbacks/task` - signed completion webhook from a worker
//! - `POST /heartbeat` - signed liveness batch from a worker
//! - `GET /health` - liveness probe
//!
//! All handlers hang off [`AppContext`], an explicitly constructed
//! dependency container passed via axum's `State` extractor. There are no
//! global singletons: everything the handlers touch is built once at
//! startup and fails fast there.

use std::sync::Arc;

pub mod callbacks;
pub mod health;
pub mod tasks;

pub use callbacks::{callback_handler, heartbeat_handler, CallbackError};
pub use health::health_handler;
pub use tasks::{cancel_handler, submit_handler, SubmitRequest, SubmitResponse};

use crate::cancel::Canceller;
use crate::ingest::Ingestor;
use crate::limits::RateLimiter;
use crate::store::TaskStore;

/// Shared application context, cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<AppContextInner>,
}

struct AppContextInner {
    store: Arc<dyn TaskStore>,
    limiter: Arc<RateLimiter>,
    ingestor: Arc<Ingestor>,
    canceller: Arc<Canceller>,

    /// Shared secret authenticating worker heartbeat batches.
    shared_secret: Vec<u8>,
}

impl AppContext {
    pub fn new(
        store: Arc<dyn TaskStore>,
        limiter: Arc<RateLimiter>,
        ingestor: Arc<Ingestor>,
        canceller: Arc<Canceller>,
        shared_secret: impl Into<Vec<u8>>,
    ) -> Self {
        AppContext {
            inner: Arc::new(AppContextInner {
                store,
                limiter,
                ingestor,
                canceller,
                shared_secret: shared_secret.into(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.inner.ingestor
    }

    pub fn canceller(&self) -> &Canceller {
        &self.inner.canceller
    }

    pub fn shared_secret(&self) -> &[u8] {
        &self.inner.shared_secret
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(ctx: AppContext) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/tasks", post(submit_handler))
        .route("/tasks/{id}/cancel", post(cancel_handler))
        .route("/callbacks/task", post(callback_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/health", get(health_handler))
        .with_state(ctx)
}
