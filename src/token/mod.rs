//! Installation token service for the git-hosting API.
//!
//! One bearer token, refreshed by exchanging a short-lived RS256 assertion
//! (10-minute validity, signed with the app's private key read from disk)
//! at the provider's token endpoint. The token is persisted with a
//! write-temp-then-rename so a concurrent reader of the token file never
//! sees a partial write.
//!
//! The service never raises to callers: [`InstallationTokenService::token`]
//! returns `None` on failure and the caller decides how to degrade. A
//! consecutive-failure counter fires a registered degradation callback
//! exactly once per episode when it reaches 3, and resets on the next
//! success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::persistence::write_atomic;

/// Consecutive refresh failures before the degradation callback fires.
pub const DEGRADATION_THRESHOLD: u32 = 3;

/// Tokens expiring within this window are refreshed proactively.
pub const PROACTIVE_REFRESH_MINUTES: i64 = 15;

/// Token refresh failures. Internal to this module; callers of the service
/// only ever see an absent token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The private key could not be read from disk.
    #[error("failed to read private key: {0}")]
    Key(String),

    /// Building or signing the assertion failed.
    #[error("failed to build JWT assertion: {0}")]
    Jwt(String),

    /// The token endpoint rejected the exchange or was unreachable.
    #[error("token exchange failed{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Exchange { status: Option<u16>, message: String },

    /// The token file could not be written.
    #[error("failed to persist token: {0}")]
    Persist(String),
}

/// A live installation access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl InstallationToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at <= now + window
    }
}

/// Mints installation tokens. Mockable in tests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Exchanges a fresh assertion for an installation token.
    async fn fetch(&self) -> Result<InstallationToken, TokenError>;
}

/// Production provider: RS256 app-JWT exchange against the hosting API.
pub struct AppTokenProvider {
    app_id: String,
    installation_id: String,
    private_key_path: PathBuf,
    api_base_url: String,
    client: reqwest::Client,
}

impl AppTokenProvider {
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend fails to
    /// initialize.
    pub fn new(
        app_id: impl Into<String>,
        installation_id: impl Into<String>,
        private_key_path: impl Into<PathBuf>,
        api_base_url: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()?;
        Ok(AppTokenProvider {
            app_id: app_id.into(),
            installation_id: installation_id.into(),
            private_key_path: private_key_path.into(),
            api_base_url: api_base_url.into(),
            client,
        })
    }

    /// Builds the signed assertion: issued 60s in the past to absorb clock
    /// skew, valid for 10 minutes, issuer = app id.
    fn generate_jwt(&self, key_pem: &[u8], now: i64) -> Result<String, TokenError> {
        #[derive(Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        let claims = Claims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(key_pem).map_err(|e| TokenError::Jwt(e.to_string()))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| TokenError::Jwt(e.to_string()))
    }
}

#[async_trait]
impl TokenProvider for AppTokenProvider {
    async fn fetch(&self) -> Result<InstallationToken, TokenError> {
        #[derive(Deserialize)]
        struct ExchangeResponse {
            token: String,
            expires_at: String,
        }

        let key_pem = tokio::fs::read(&self.private_key_path)
            .await
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let jwt = self.generate_jwt(&key_pem, Utc::now().timestamp())?;

        let endpoint = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base_url.trim_end_matches('/'),
            self.installation_id
        );
        let response = self
            .client
            .post(&endpoint)
            .header("accept", "application/vnd.github+json")
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| TokenError::Exchange {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable response body".to_string());
            return Err(TokenError::Exchange {
                status: Some(status.as_u16()),
                message,
            });
        }

        let payload: ExchangeResponse =
            response.json().await.map_err(|e| TokenError::Exchange {
                status: Some(status.as_u16()),
                message: format!("malformed token response: {e}"),
            })?;
        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|e| TokenError::Exchange {
                status: Some(status.as_u16()),
                message: format!("unparseable expiry {:?}: {e}", payload.expires_at),
            })?
            .with_timezone(&Utc);

        Ok(InstallationToken {
            token: payload.token,
            expires_at,
        })
    }
}

struct TokenState {
    token: Option<InstallationToken>,
    consecutive_failures: u32,
    degraded: bool,
}

type DegradationCallback = Box<dyn Fn(u32) + Send + Sync>;

/// Caches and rotates the installation token.
pub struct InstallationTokenService {
    provider: Arc<dyn TokenProvider>,
    token_file: PathBuf,

    // One refresh in flight at a time; concurrent callers wait for it
    // rather than racing their own exchanges.
    state: tokio::sync::Mutex<TokenState>,
    callbacks: std::sync::Mutex<Vec<DegradationCallback>>,
}

impl InstallationTokenService {
    pub fn new(provider: Arc<dyn TokenProvider>, token_file: impl Into<PathBuf>) -> Self {
        InstallationTokenService {
            provider,
            token_file: token_file.into(),
            state: tokio::sync::Mutex::new(TokenState {
                token: None,
                consecutive_failures: 0,
                degraded: false,
            }),
            callbacks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback fired once per degradation episode, when the
    /// consecutive-failure count reaches [`DEGRADATION_THRESHOLD`].
    pub fn on_degraded(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Returns the cached token, refreshing transparently if it expired.
    /// `None` means the refresh failed; the caller decides how to degrade.
    pub async fn token(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = &state.token {
            if !token.is_expired(Utc::now()) {
                return Some(token.token.clone());
            }
        }
        self.refresh_locked(&mut state).await;
        state.token.as_ref().map(|t| t.token.clone())
    }

    /// Forces a refresh. Returns whether a live token is now held.
    pub async fn refresh(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await;
        state.token.is_some()
    }

    /// Whether the cached token is absent or expires within `window`.
    pub async fn is_expiring_soon(&self, window: Duration) -> bool {
        let state = self.state.lock().await;
        match &state.token {
            Some(token) => token.expires_within(Utc::now(), window),
            None => true,
        }
    }

    /// Current consecutive-failure count, for observability.
    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    async fn refresh_locked(&self, state: &mut TokenState) {
        match self.try_refresh().await {
            Ok(token) => {
                debug!(expires_at = %token.expires_at, "installation token refreshed");
                state.token = Some(token);
                state.consecutive_failures = 0;
                state.degraded = false;
            }
            Err(e) => {
                state.consecutive_failures += 1;
                warn!(
                    error = %e,
                    consecutive_failures = state.consecutive_failures,
                    "installation token refresh failed"
                );
                // A stale-but-unexpired token stays usable; only a token
                // past its expiry is dropped.
                if let Some(token) = &state.token {
                    if token.is_expired(Utc::now()) {
                        state.token = None;
                    }
                }
                if state.consecutive_failures >= DEGRADATION_THRESHOLD && !state.degraded {
                    state.degraded = true;
                    error!(
                        consecutive_failures = state.consecutive_failures,
                        "installation token refresh degraded"
                    );
                    for callback in self.callbacks.lock().unwrap().iter() {
                        callback(state.consecutive_failures);
                    }
                }
            }
        }
    }

    async fn try_refresh(&self) -> Result<InstallationToken, TokenError> {
        let token = self.provider.fetch().await?;
        write_atomic(&self.token_file, token.token.as_bytes())
            .map_err(|e| TokenError::Persist(e.to_string()))?;
        Ok(token)
    }

    /// Background rotation loop: on each tick, refresh if the token is
    /// absent or expiring within [`PROACTIVE_REFRESH_MINUTES`]. A failed
    /// tick never blocks the next one. Stops when `shutdown` is cancelled;
    /// stopping twice is a no-op.
    pub async fn run(&self, shutdown: CancellationToken, check_interval: StdDuration) {
        let window = Duration::minutes(PROACTIVE_REFRESH_MINUTES);
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("token refresh loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if self.is_expiring_soon(window).await {
                        info!("installation token expiring soon, refreshing");
                        self.refresh().await;
                    }
                }
            }
        }
    }
}
