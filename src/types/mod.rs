//! Core domain types for the task control plane.

pub mod ids;
pub mod task;
pub mod usage;

pub use ids::{
    ActionId, ApprovalEventId, CorrelationId, DedupKey, IssueId, TaskId, UserId,
};
pub use task::{Task, TaskStatus, WorkerLocation, WorkerType};
pub use usage::UserUsage;
