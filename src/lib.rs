//! Taskplane - a control plane for dispatching coding tasks to worker machines.
//!
//! The flow: a submission passes per-user rate limits, deduplicates against
//! earlier submissions, gets dispatched to a worker with a signed request
//! and a fresh per-task webhook secret, and is tracked until the worker's
//! signed completion callback (or a heartbeat timeout) finishes it. Users
//! can cancel in-flight tasks through a single-use nonce.

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod ingest;
pub mod limits;
pub mod persistence;
pub mod server;
pub mod store;
pub mod token;
pub mod types;
pub mod webhook;
