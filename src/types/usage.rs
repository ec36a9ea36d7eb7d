//! Per-user usage counters backing the rate limiter.

use serde::{Deserialize, Serialize};

use super::ids::UserId;

/// Per-user usage counters.
///
/// Mutated atomically by the rate limiter on task start/completion. The
/// hourly/daily/monthly windows are reset by an external rollover job, not
/// by this core; the counters here only ever see increments, decrements,
/// and reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserUsage {
    pub user_id: UserId,

    /// Tasks currently in a non-terminal status.
    pub concurrent_tasks: u32,

    /// Tasks started in the current hourly window.
    pub tasks_this_hour: u32,

    /// Accumulated cost (USD) in the current daily window. Includes the
    /// optimistic estimate for in-flight tasks.
    pub cost_today: f64,

    /// Accumulated cost (USD) in the current monthly window.
    pub cost_this_month: f64,
}

impl UserUsage {
    /// A zeroed usage record for a user with no history.
    pub fn empty(user_id: UserId) -> Self {
        UserUsage {
            user_id,
            concurrent_tasks: 0,
            tasks_this_hour: 0,
            cost_today: 0.0,
            cost_this_month: 0.0,
        }
    }
}
