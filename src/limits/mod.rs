//! Per-user admission control.
//!
//! Checks run in a fixed order, cheapest first:
//!
//! 1. prompt length (no I/O)
//! 2. fetch the usage snapshot
//! 3. concurrent task cap
//! 4. hourly task cap
//! 5. daily cost cap (projected: current + one estimated task cost)
//! 6. monthly cost cap (same projection)
//!
//! A store failure while fetching usage maps to `ServiceUnavailable`, never
//! to a silent allow. Starting a task adds the estimated cost
//! optimistically; completion reconciles against the actual cost when one
//! is known.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::store::UsageStore;
use crate::types::{UserId, UserUsage};

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tasks a user may have in flight at once.
    pub max_concurrent: u32,

    /// Maximum tasks a user may start per hour.
    pub max_per_hour: u32,

    /// Daily cost cap in USD.
    pub daily_cost_cap: f64,

    /// Monthly cost cap in USD.
    pub monthly_cost_cap: f64,

    /// Maximum prompt length in characters.
    pub max_prompt_chars: usize,

    /// Optimistic per-task cost estimate in USD, charged at start and
    /// reconciled at completion.
    pub estimated_task_cost: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_concurrent: 3,
            max_per_hour: 10,
            daily_cost_cap: 20.0,
            monthly_cost_cap: 200.0,
            max_prompt_chars: 10_000,
            estimated_task_cost: 2.0,
        }
    }
}

/// Typed admission errors, each carrying a user-displayable message.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("prompt is {length} characters, the maximum is {max}")]
    PromptTooLong { length: usize, max: usize },

    #[error("you already have {limit} tasks running; wait for one to finish")]
    ConcurrentLimit { limit: u32 },

    #[error("hourly limit of {limit} tasks reached; try again later")]
    HourlyLimit { limit: u32 },

    #[error("daily cost cap of ${cap:.2} would be exceeded")]
    DailyCostLimit { cap: f64 },

    #[error("monthly cost cap of ${cap:.2} would be exceeded")]
    MonthlyCostLimit { cap: f64 },

    #[error("usage data unavailable: {0}")]
    ServiceUnavailable(String),
}

impl RateLimitError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            RateLimitError::PromptTooLong { .. } => "prompt_too_long",
            RateLimitError::ConcurrentLimit { .. } => "concurrent_limit",
            RateLimitError::HourlyLimit { .. } => "hourly_limit",
            RateLimitError::DailyCostLimit { .. } => "daily_cost_limit",
            RateLimitError::MonthlyCostLimit { .. } => "monthly_cost_limit",
            RateLimitError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    /// Hint for when the caller may retry, where one makes sense.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::HourlyLimit { .. } => Some(Duration::from_secs(3600)),
            RateLimitError::DailyCostLimit { .. } => Some(Duration::from_secs(24 * 3600)),
            RateLimitError::ServiceUnavailable(_) => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

/// Per-user admission control over a shared usage store.
pub struct RateLimiter {
    usage: Arc<dyn UsageStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(usage: Arc<dyn UsageStore>, config: RateLimitConfig) -> Self {
        RateLimiter { usage, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Runs all admission checks for a prospective task.
    ///
    /// # Errors
    ///
    /// The first failing check in the documented order.
    pub async fn check_limits(
        &self,
        user_id: &UserId,
        prompt_length: usize,
    ) -> Result<(), RateLimitError> {
        if prompt_length > self.config.max_prompt_chars {
            return Err(RateLimitError::PromptTooLong {
                length: prompt_length,
                max: self.config.max_prompt_chars,
            });
        }

        let usage = self
            .usage
            .get_usage(user_id)
            .await
            .map_err(|e| RateLimitError::ServiceUnavailable(e.to_string()))?;

        self.check_usage(&usage)
    }

    /// The pure portion of the checks, split out for direct testing.
    fn check_usage(&self, usage: &UserUsage) -> Result<(), RateLimitError> {
        if usage.concurrent_tasks >= self.config.max_concurrent {
            return Err(RateLimitError::ConcurrentLimit {
                limit: self.config.max_concurrent,
            });
        }

        if usage.tasks_this_hour >= self.config.max_per_hour {
            return Err(RateLimitError::HourlyLimit {
                limit: self.config.max_per_hour,
            });
        }

        let projected_today = usage.cost_today + self.config.estimated_task_cost;
        if projected_today > self.config.daily_cost_cap {
            return Err(RateLimitError::DailyCostLimit {
                cap: self.config.daily_cost_cap,
            });
        }

        let projected_month = usage.cost_this_month + self.config.estimated_task_cost;
        if projected_month > self.config.monthly_cost_cap {
            return Err(RateLimitError::MonthlyCostLimit {
                cap: self.config.monthly_cost_cap,
            });
        }

        Ok(())
    }

    /// Records a task start: increments the concurrent count and charges
    /// the estimated cost optimistically.
    pub async fn record_task_start(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.usage
            .apply_task_start(user_id, self.config.estimated_task_cost)
            .await
            .map_err(|e| RateLimitError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Records a task completion: decrements the concurrent count and, if
    /// an actual cost is known, reconciles the estimate against it.
    ///
    /// A store failure here is logged and swallowed: the task already
    /// finished and the counters self-correct at the next window rollover.
    pub async fn record_task_complete(&self, user_id: &UserId, actual_cost: Option<f64>) {
        if let Err(e) = self
            .usage
            .apply_task_complete(user_id, self.config.estimated_task_cost, actual_cost)
            .await
        {
            warn!(user_id = %user_id, error = %e, "failed to record task completion in usage store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TaskStoreError};
    use async_trait::async_trait;
    use proptest::prelude::*;

    fn limiter_with(config: RateLimitConfig) -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), config);
        (store, limiter)
    }

    #[tokio::test]
    async fn fresh_user_is_admitted() {
        let (_, limiter) = limiter_with(RateLimitConfig::default());
        limiter
            .check_limits(&UserId::new("u1"), 100)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prompt_length_checked_before_usage_fetch() {
        // A usage store that always fails: the prompt check must still win.
        struct FailingUsage;
        #[async_trait]
        impl UsageStore for FailingUsage {
            async fn get_usage(&self, _: &UserId) -> Result<UserUsage, TaskStoreError> {
                Err(TaskStoreError::Storage("down".to_string()))
            }
            async fn apply_task_start(
                &self,
                _: &UserId,
                _: f64,
            ) -> Result<UserUsage, TaskStoreError> {
                Err(TaskStoreError::Storage("down".to_string()))
            }
            async fn apply_task_complete(
                &self,
                _: &UserId,
                _: f64,
                _: Option<f64>,
            ) -> Result<UserUsage, TaskStoreError> {
                Err(TaskStoreError::Storage("down".to_string()))
            }
        }

        let limiter = RateLimiter::new(Arc::new(FailingUsage), RateLimitConfig::default());
        let err = limiter
            .check_limits(&UserId::new("u1"), 20_000)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "prompt_too_long");

        // With a valid prompt, the store failure surfaces as unavailable,
        // never as a silent allow.
        let err = limiter
            .check_limits(&UserId::new("u1"), 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "service_unavailable");
    }

    #[tokio::test]
    async fn concurrent_cap_blocks() {
        let (_, limiter) = limiter_with(RateLimitConfig {
            max_concurrent: 2,
            ..RateLimitConfig::default()
        });
        let user = UserId::new("u1");

        limiter.record_task_start(&user).await.unwrap();
        limiter.record_task_start(&user).await.unwrap();

        let err = limiter.check_limits(&user, 10).await.unwrap_err();
        assert_eq!(err.code(), "concurrent_limit");

        // Finishing one task frees a slot.
        limiter.record_task_complete(&user, None).await;
        limiter.check_limits(&user, 10).await.unwrap();
    }

    #[tokio::test]
    async fn hourly_cap_blocks_with_retry_hint() {
        let (_, limiter) = limiter_with(RateLimitConfig {
            max_concurrent: 100,
            max_per_hour: 3,
            ..RateLimitConfig::default()
        });
        let user = UserId::new("u1");

        for _ in 0..3 {
            limiter.record_task_start(&user).await.unwrap();
            limiter.record_task_complete(&user, None).await;
        }

        let err = limiter.check_limits(&user, 10).await.unwrap_err();
        assert_eq!(err.code(), "hourly_limit");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn daily_cost_cap_uses_projection() {
        let (_, limiter) = limiter_with(RateLimitConfig {
            max_concurrent: 100,
            max_per_hour: 100,
            daily_cost_cap: 5.0,
            estimated_task_cost: 2.0,
            ..RateLimitConfig::default()
        });
        let user = UserId::new("u1");

        // Two in-flight tasks put cost_today at 4.0; projecting a third
        // (4.0 + 2.0 = 6.0) breaks the 5.0 cap even though current spend
        // is still under it.
        limiter.record_task_start(&user).await.unwrap();
        limiter.record_task_start(&user).await.unwrap();

        let err = limiter.check_limits(&user, 10).await.unwrap_err();
        assert_eq!(err.code(), "daily_cost_limit");
    }

    #[tokio::test]
    async fn monthly_cost_cap_checked_after_daily() {
        let (_, limiter) = limiter_with(RateLimitConfig {
            max_concurrent: 100,
            max_per_hour: 100,
            daily_cost_cap: 1000.0,
            monthly_cost_cap: 3.0,
            estimated_task_cost: 2.0,
            ..RateLimitConfig::default()
        });
        let user = UserId::new("u1");
        limiter.record_task_start(&user).await.unwrap();

        let err = limiter.check_limits(&user, 10).await.unwrap_err();
        assert_eq!(err.code(), "monthly_cost_limit");
    }

    #[tokio::test]
    async fn actual_cost_reconciliation_frees_budget() {
        let (store, limiter) = limiter_with(RateLimitConfig {
            max_concurrent: 100,
            max_per_hour: 100,
            daily_cost_cap: 5.0,
            estimated_task_cost: 2.0,
            ..RateLimitConfig::default()
        });
        let user = UserId::new("u1");

        limiter.record_task_start(&user).await.unwrap();
        limiter.record_task_complete(&user, Some(0.5)).await;

        let usage = store.get_usage(&user).await.unwrap();
        assert!((usage.cost_today - 0.5).abs() < 1e-9);
        limiter.check_limits(&user, 10).await.unwrap();
    }

    proptest! {
        /// After N starts and M completions (N >= M), the concurrent count
        /// is exactly N - M and never negative.
        #[test]
        fn concurrent_count_is_n_minus_m(n in 0u32..20, m in 0u32..20) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let (store, limiter) = limiter_with(RateLimitConfig {
                    max_concurrent: u32::MAX,
                    max_per_hour: u32::MAX,
                    daily_cost_cap: f64::MAX,
                    monthly_cost_cap: f64::MAX,
                    ..RateLimitConfig::default()
                });
                let user = UserId::new("u1");

                for _ in 0..n {
                    limiter.record_task_start(&user).await.unwrap();
                }
                for _ in 0..m {
                    limiter.record_task_complete(&user, None).await;
                }

                let usage = store.get_usage(&user).await.unwrap();
                prop_assert_eq!(usage.concurrent_tasks, n.saturating_sub(m));
                Ok(())
            })?;
        }
    }
}
