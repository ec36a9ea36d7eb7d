//! Process configuration, read from the environment at startup.
//!
//! Everything is resolved once in `main` and fails fast: a missing secret
//! or an unparseable number aborts startup rather than surfacing later as
//! a rejected dispatch. Lookup goes through a closure so tests can feed
//! values without mutating process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::limits::RateLimitConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_ZOMBIE_STALE_MINS: u64 = 10;
const DEFAULT_ZOMBIE_SWEEP_MINS: u64 = 5;
const DEFAULT_PENDING_SWEEP_MINS: u64 = 10;
const DEFAULT_TOKEN_CHECK_SECS: u64 = 60;

/// Configuration failures, each naming the offending variable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {message}")]
    Invalid {
        name: &'static str,
        message: String,
    },

    #[error("no worker URLs configured; set TASKPLANE_HOST_WORKER_URL or TASKPLANE_VM_WORKER_URL")]
    NoWorkers,

    #[error(
        "incomplete GitHub App config: {missing} is unset but other TASKPLANE_GITHUB_* values are"
    )]
    PartialGithubApp { missing: &'static str },
}

/// GitHub App credentials for the installation token service.
///
/// All three values come as a group: setting some but not all is a
/// configuration error.
#[derive(Debug, Clone)]
pub struct GithubAppConfig {
    pub app_id: String,
    pub installation_id: u64,
    pub private_key_path: PathBuf,
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,

    /// Shared secret authenticating control plane <-> worker traffic.
    pub shared_secret: String,

    /// Public base URL workers call back on.
    pub callback_base_url: String,

    /// Hash of the system prompt in force, forwarded with every dispatch.
    pub system_prompt_hash: String,

    pub host_worker_url: Option<String>,
    pub vm_worker_url: Option<String>,

    /// Directory for the pending-webhook queue and the token file.
    pub data_dir: PathBuf,

    pub github_app: Option<GithubAppConfig>,

    pub rate_limits: RateLimitConfig,

    /// Heartbeat age after which an active task counts as a zombie.
    pub zombie_stale_threshold: Duration,

    /// How often the zombie sweep runs.
    pub zombie_sweep_interval: Duration,

    /// How often the pending-webhook queue is swept.
    pub pending_sweep_interval: Duration,

    /// How often the token service checks for an expiring token.
    pub token_check_interval: Duration,
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// The first missing or malformed variable encountered.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("TASKPLANE_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "TASKPLANE_BIND_ADDR",
                message: e.to_string(),
            })?;

        let shared_secret = require(&lookup, "TASKPLANE_SHARED_SECRET")?;
        let callback_base_url = require(&lookup, "TASKPLANE_CALLBACK_BASE_URL")?;
        let system_prompt_hash = require(&lookup, "TASKPLANE_SYSTEM_PROMPT_HASH")?;

        let host_worker_url = lookup("TASKPLANE_HOST_WORKER_URL");
        let vm_worker_url = lookup("TASKPLANE_VM_WORKER_URL");
        if host_worker_url.is_none() && vm_worker_url.is_none() {
            return Err(ConfigError::NoWorkers);
        }

        let data_dir = PathBuf::from(
            lookup("TASKPLANE_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
        );

        let github_app = github_app(&lookup)?;

        let defaults = RateLimitConfig::default();
        let rate_limits = RateLimitConfig {
            max_concurrent: parse_or(&lookup, "TASKPLANE_MAX_CONCURRENT", defaults.max_concurrent)?,
            max_per_hour: parse_or(&lookup, "TASKPLANE_MAX_PER_HOUR", defaults.max_per_hour)?,
            daily_cost_cap: parse_or(&lookup, "TASKPLANE_DAILY_COST_CAP", defaults.daily_cost_cap)?,
            monthly_cost_cap: parse_or(
                &lookup,
                "TASKPLANE_MONTHLY_COST_CAP",
                defaults.monthly_cost_cap,
            )?,
            max_prompt_chars: parse_or(
                &lookup,
                "TASKPLANE_MAX_PROMPT_CHARS",
                defaults.max_prompt_chars,
            )?,
            estimated_task_cost: parse_or(
                &lookup,
                "TASKPLANE_ESTIMATED_TASK_COST",
                defaults.estimated_task_cost,
            )?,
        };

        Ok(Config {
            bind_addr,
            shared_secret,
            callback_base_url,
            system_prompt_hash,
            host_worker_url,
            vm_worker_url,
            data_dir,
            github_app,
            rate_limits,
            zombie_stale_threshold: Duration::from_secs(
                60 * parse_or(&lookup, "TASKPLANE_ZOMBIE_STALE_MINS", DEFAULT_ZOMBIE_STALE_MINS)?,
            ),
            zombie_sweep_interval: Duration::from_secs(
                60 * parse_or(&lookup, "TASKPLANE_ZOMBIE_SWEEP_MINS", DEFAULT_ZOMBIE_SWEEP_MINS)?,
            ),
            pending_sweep_interval: Duration::from_secs(
                60 * parse_or(
                    &lookup,
                    "TASKPLANE_PENDING_SWEEP_MINS",
                    DEFAULT_PENDING_SWEEP_MINS,
                )?,
            ),
            token_check_interval: Duration::from_secs(parse_or(
                &lookup,
                "TASKPLANE_TOKEN_CHECK_SECS",
                DEFAULT_TOKEN_CHECK_SECS,
            )?),
        })
    }

    /// Path of the pending-webhook queue file.
    pub fn pending_queue_path(&self) -> PathBuf {
        self.data_dir.join("pending-webhooks.json")
    }

    /// Path of the persisted installation token.
    pub fn token_file_path(&self) -> PathBuf {
        self.data_dir.join("github-token.json")
    }
}

fn require(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn github_app(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<GithubAppConfig>, ConfigError> {
    let app_id = lookup("TASKPLANE_GITHUB_APP_ID");
    let installation_id = lookup("TASKPLANE_GITHUB_INSTALLATION_ID");
    let key_path = lookup("TASKPLANE_GITHUB_PRIVATE_KEY_PATH");

    match (app_id, installation_id, key_path) {
        (None, None, None) => Ok(None),
        (Some(app_id), Some(installation_id), Some(key_path)) => {
            let installation_id =
                installation_id
                    .parse::<u64>()
                    .map_err(|e| ConfigError::Invalid {
                        name: "TASKPLANE_GITHUB_INSTALLATION_ID",
                        message: e.to_string(),
                    })?;
            Ok(Some(GithubAppConfig {
                app_id,
                installation_id,
                private_key_path: PathBuf::from(key_path),
            }))
        }
        (None, _, _) => Err(ConfigError::PartialGithubApp {
            missing: "TASKPLANE_GITHUB_APP_ID",
        }),
        (_, None, _) => Err(ConfigError::PartialGithubApp {
            missing: "TASKPLANE_GITHUB_INSTALLATION_ID",
        }),
        (_, _, None) => Err(ConfigError::PartialGithubApp {
            missing: "TASKPLANE_GITHUB_PRIVATE_KEY_PATH",
        }),
    }
}
