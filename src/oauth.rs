// =============================================================================
// OAuth Token Manager — per-service token lifecycle
// =============================================================================
//
// Responsibilities per registered service:
//   - Keep the current token in memory, backed by the token store.
//   - `get_valid` refreshes when `now + refresh_buffer >= expires_at`.
//   - Refreshes are single-flight: concurrent callers wait on the same
//     in-progress refresh and observe its outcome.
//   - On refresh failure an unexpired token is still served (degraded).
//   - Auto-refresh fires `refresh_buffer` before expiry, backing off from
//     60 s to 3600 s (±10% jitter) on failure.
//
// Persistence ordering: the store write happens before the in-memory record
// is replaced, so a crash can never forget a token that was already live.
//
// SECURITY: access and refresh tokens are never logged; Debug output is
// redacted.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::OAuthError;
use crate::resilience::{default_retryable, retry, BreakerRegistry, RetryOptions};
use crate::stores::TokenStore;
use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Token and service types
// ---------------------------------------------------------------------------

/// A stored OAuth token for one service.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Absolute expiry in epoch milliseconds; `None` means non-expiring.
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub client_id: String,
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("scopes", &self.scopes)
            .field("user_id", &self.user_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl OAuthToken {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at_ms.is_some_and(|exp| exp <= now)
    }

    pub fn needs_refresh(&self, now: i64, buffer_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|exp| now + buffer_ms >= exp)
    }
}

/// Static configuration for one OAuth service.
#[derive(Clone)]
pub struct ServiceConfig {
    pub service: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub validate_url: Option<String>,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("service", &self.service)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("validate_url", &self.validate_url)
            .finish()
    }
}

/// Result of a successful validate call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationInfo {
    pub user_id: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub expires_in_s: Option<u64>,
}

// ---------------------------------------------------------------------------
// Provider seam
// ---------------------------------------------------------------------------

/// The HTTP side of the token lifecycle, kept behind a trait so tests can
/// count refresh requests.
pub trait TokenProvider: Send + Sync + 'static {
    fn refresh(
        &self,
        config: ServiceConfig,
        refresh_token: String,
    ) -> impl Future<Output = Result<OAuthToken>> + Send;

    fn validate(
        &self,
        config: ServiceConfig,
        access_token: String,
    ) -> impl Future<Output = Result<ValidationInfo>> + Send;
}

/// Real provider speaking the OAuth2 refresh-token grant over reqwest.
pub struct HttpTokenProvider {
    client: reqwest::Client,
}

impl HttpTokenProvider {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }
}

impl Default for HttpTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenProvider for HttpTokenProvider {
    fn refresh(
        &self,
        config: ServiceConfig,
        refresh_token: String,
    ) -> impl Future<Output = Result<OAuthToken>> + Send {
        let client = self.client.clone();
        async move {
            let params = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
            ];

            let resp = client
                .post(&config.token_url)
                .form(&params)
                .send()
                .await
                .context("token refresh request failed")?;

            let status = resp.status();
            let body: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse token refresh response")?;

            if !status.is_success() {
                anyhow::bail!("token endpoint returned {status}: {body}");
            }

            let access_token = body["access_token"]
                .as_str()
                .context("refresh response missing access_token")?
                .to_string();
            let new_refresh = body["refresh_token"]
                .as_str()
                .map(str::to_string)
                .or(Some(refresh_token));
            let expires_at_ms = body["expires_in"]
                .as_i64()
                .map(|secs| now_ms() + secs * 1000);
            let scopes = body["scope"].as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            });

            debug!(service = %config.service, "token refreshed via provider");
            Ok(OAuthToken {
                access_token,
                refresh_token: new_refresh,
                expires_at_ms,
                scopes,
                user_id: None,
                client_id: config.client_id,
            })
        }
    }

    fn validate(
        &self,
        config: ServiceConfig,
        access_token: String,
    ) -> impl Future<Output = Result<ValidationInfo>> + Send {
        let client = self.client.clone();
        async move {
            let url = config
                .validate_url
                .context("service has no validate endpoint")?;

            let resp = client
                .get(&url)
                .header("Authorization", format!("Bearer {access_token}"))
                .send()
                .await
                .context("token validate request failed")?;

            let status = resp.status();
            let body: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse validate response")?;

            if !status.is_success() {
                anyhow::bail!("validate endpoint returned {status}: {body}");
            }

            Ok(ValidationInfo {
                user_id: body["user_id"].as_str().map(str::to_string),
                scopes: body["scopes"].as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                }),
                expires_in_s: body["expires_in"].as_u64(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ServiceState {
    config: ServiceConfig,
    token: RwLock<Option<OAuthToken>>,
    /// Single-flight gate: at most one refresh in progress per service.
    flight: tokio::sync::Mutex<()>,
    /// Bumped after every completed refresh; waiters use it to detect that
    /// the flight they queued behind already did the work.
    refresh_epoch: AtomicU64,
}

/// Auto-refresh backoff floor and ceiling.
const AUTO_REFRESH_BACKOFF_MIN: Duration = Duration::from_secs(60);
const AUTO_REFRESH_BACKOFF_MAX: Duration = Duration::from_secs(3600);
/// Sleep used when a service has no expiry to schedule against.
const AUTO_REFRESH_IDLE: Duration = Duration::from_secs(600);

/// Per-service token lifecycle manager.
pub struct TokenManager<S: TokenStore, P: TokenProvider> {
    store: Arc<S>,
    provider: Arc<P>,
    breakers: Arc<BreakerRegistry>,
    retry_opts: RetryOptions,
    refresh_buffer_ms: i64,
    services: RwLock<HashMap<String, Arc<ServiceState>>>,
}

impl<S: TokenStore, P: TokenProvider> TokenManager<S, P> {
    pub fn new(
        store: Arc<S>,
        provider: Arc<P>,
        breakers: Arc<BreakerRegistry>,
        retry_opts: RetryOptions,
        refresh_buffer_ms: u64,
    ) -> Self {
        Self {
            store,
            provider,
            breakers,
            retry_opts,
            refresh_buffer_ms: refresh_buffer_ms as i64,
            services: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Registration and storage
    // -------------------------------------------------------------------------

    /// Register a service and hydrate its token from the store.
    pub fn register(&self, config: ServiceConfig) -> Result<()> {
        let service = config.service.clone();
        let stored = self.store.get_token(&service)?;
        if stored.is_some() {
            info!(service = %service, "token loaded from store");
        }

        self.services.write().insert(
            service.clone(),
            Arc::new(ServiceState {
                config,
                token: RwLock::new(stored),
                flight: tokio::sync::Mutex::new(()),
                refresh_epoch: AtomicU64::new(0),
            }),
        );
        info!(service = %service, "oauth service registered");
        Ok(())
    }

    /// Store a token for a service: persist first, then swap into memory.
    pub fn store_token(&self, service: &str, token: OAuthToken) -> Result<(), OAuthError> {
        let state = self.service_state(service)?;
        self.persist_then_swap(&state, token)
            .map_err(|e| OAuthError::RefreshFailed {
                reason: format!("persist failed: {e:#}"),
            })
    }

    fn persist_then_swap(&self, state: &ServiceState, token: OAuthToken) -> Result<()> {
        self.store.save_token(&state.config.service, &token)?;
        *state.token.write() = Some(token);
        Ok(())
    }

    fn service_state(&self, service: &str) -> Result<Arc<ServiceState>, OAuthError> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| OAuthError::ServiceNotRegistered {
                service: service.to_string(),
            })
    }

    /// Current token without freshness checks (diagnostics).
    pub fn peek_token(&self, service: &str) -> Result<Option<OAuthToken>, OAuthError> {
        Ok(self.service_state(service)?.token.read().clone())
    }

    // -------------------------------------------------------------------------
    // get_valid / refresh / validate
    // -------------------------------------------------------------------------

    /// Return a token fit for use, refreshing when inside the buffer window.
    pub async fn get_valid(&self, service: &str) -> Result<OAuthToken, OAuthError> {
        let state = self.service_state(service)?;

        let current = state
            .token
            .read()
            .clone()
            .ok_or(OAuthError::NoTokenAvailable)?;

        if !current.needs_refresh(now_ms(), self.refresh_buffer_ms) {
            return Ok(current);
        }

        self.refresh_single_flight(&state, false).await
    }

    /// Force a refresh (single-flight with any concurrent callers).
    pub async fn refresh(&self, service: &str) -> Result<OAuthToken, OAuthError> {
        let state = self.service_state(service)?;
        self.refresh_single_flight(&state, true).await
    }

    async fn refresh_single_flight(
        &self,
        state: &Arc<ServiceState>,
        force: bool,
    ) -> Result<OAuthToken, OAuthError> {
        let epoch_before = state.refresh_epoch.load(Ordering::Acquire);
        let _guard = state.flight.lock().await;

        // Whoever held the lock before us may already have done the work.
        let current = state.token.read().clone();
        let refreshed_while_waiting =
            state.refresh_epoch.load(Ordering::Acquire) != epoch_before;
        if let Some(token) = &current {
            let fresh = !token.needs_refresh(now_ms(), self.refresh_buffer_ms);
            if fresh && (!force || refreshed_while_waiting) {
                return Ok(token.clone());
            }
        }

        let refresh_token = match &current {
            None => return Err(OAuthError::NoTokenAvailable),
            Some(t) => t
                .refresh_token
                .clone()
                .ok_or(OAuthError::NoRefreshToken)?,
        };

        let service = state.config.service.clone();
        let breaker = self.breakers.get(&service);
        let provider = Arc::clone(&self.provider);
        let config = state.config.clone();
        let retry_opts = self.retry_opts.clone();

        let result = breaker
            .call(retry(
                "oauth_refresh",
                &retry_opts,
                default_retryable,
                move || {
                    let provider = Arc::clone(&provider);
                    let config = config.clone();
                    let refresh_token = refresh_token.clone();
                    async move { provider.refresh(config, refresh_token).await }
                },
            ))
            .await;

        match result {
            Ok(mut token) => {
                // Providers that rotate refresh tokens may omit user_id; keep
                // what validation previously learned.
                if token.user_id.is_none() {
                    token.user_id = current.as_ref().and_then(|t| t.user_id.clone());
                }
                self.persist_then_swap(state, token.clone()).map_err(|e| {
                    OAuthError::RefreshFailed {
                        reason: format!("persist failed: {e:#}"),
                    }
                })?;
                state.refresh_epoch.fetch_add(1, Ordering::Release);
                info!(service = %service, "token refreshed");
                Ok(token)
            }
            Err(e) => {
                state.refresh_epoch.fetch_add(1, Ordering::Release);
                match current {
                    // Degraded path: the old token still works, serve it.
                    Some(token) if !token.is_expired(now_ms()) => {
                        warn!(
                            service = %service,
                            error = %e,
                            "refresh failed — serving unexpired token"
                        );
                        Ok(token)
                    }
                    _ => Err(OAuthError::RefreshFailed {
                        reason: format!("{e:#}"),
                    }),
                }
            }
        }
    }

    /// Validate the current token and merge `user_id`/`scopes` into the
    /// stored record.
    pub async fn validate(&self, service: &str) -> Result<ValidationInfo, OAuthError> {
        let state = self.service_state(service)?;
        let token = state
            .token
            .read()
            .clone()
            .ok_or(OAuthError::NoTokenAvailable)?;

        let info = self
            .provider
            .validate(state.config.clone(), token.access_token.clone())
            .await
            .map_err(|e| OAuthError::ValidationFailed {
                reason: format!("{e:#}"),
            })?;

        let mut merged = token;
        if info.user_id.is_some() {
            merged.user_id = info.user_id.clone();
        }
        if info.scopes.is_some() {
            merged.scopes = info.scopes.clone();
        }
        self.persist_then_swap(&state, merged)
            .map_err(|e| OAuthError::ValidationFailed {
                reason: format!("persist failed: {e:#}"),
            })?;

        info!(service, user_id = ?info.user_id, "token validated");
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Auto-refresh
    // -------------------------------------------------------------------------

    /// Spawn the background auto-refresh loop for a registered service.
    ///
    /// The loop sleeps until `refresh_buffer` before expiry, refreshes, and
    /// on failure backs off 60 s → 3600 s (doubling, ±10% jitter), resetting
    /// after the next success.
    pub fn start_auto_refresh(self: &Arc<Self>, service: &str) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let service = service.to_string();

        tokio::spawn(async move {
            let mut backoff = AUTO_REFRESH_BACKOFF_MIN;
            loop {
                let sleep_for = match manager.peek_token(&service) {
                    Ok(Some(token)) => match token.expires_at_ms {
                        Some(exp) => {
                            let fire_at = exp - manager.refresh_buffer_ms;
                            let delta = fire_at - now_ms();
                            Duration::from_millis(delta.max(0) as u64)
                        }
                        None => AUTO_REFRESH_IDLE,
                    },
                    Ok(None) => AUTO_REFRESH_IDLE,
                    Err(_) => {
                        debug!(service = %service, "auto-refresh stopping — service dropped");
                        return;
                    }
                };

                tokio::time::sleep(sleep_for).await;

                // Only refresh when the token is actually inside the buffer;
                // a token swapped in while we slept may push the window out.
                let due = matches!(
                    manager.peek_token(&service),
                    Ok(Some(t)) if t.needs_refresh(now_ms(), manager.refresh_buffer_ms)
                );
                if !due {
                    continue;
                }

                match manager.refresh(&service).await {
                    Ok(_) => {
                        backoff = AUTO_REFRESH_BACKOFF_MIN;
                    }
                    Err(e) => {
                        let jittered = crate::resilience::retry::apply_jitter(backoff, 0.10);
                        warn!(
                            service = %service,
                            error = %e,
                            retry_in_s = jittered.as_secs(),
                            "auto-refresh failed — backing off"
                        );
                        tokio::time::sleep(jittered).await;
                        backoff = (backoff * 2).min(AUTO_REFRESH_BACKOFF_MAX);
                    }
                }
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::stores::MemoryTokenStore;
    use std::sync::atomic::AtomicU32;

    struct MockProvider {
        refreshes: AtomicU32,
        fail: std::sync::atomic::AtomicBool,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                refreshes: AtomicU32::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn refresh_count(&self) -> u32 {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    impl TokenProvider for MockProvider {
        fn refresh(
            &self,
            config: ServiceConfig,
            _refresh_token: String,
        ) -> impl Future<Output = Result<OAuthToken>> + Send {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = self.fail.load(Ordering::SeqCst);
            async move {
                // Hold the flight long enough for concurrent callers to queue.
                tokio::time::sleep(Duration::from_millis(20)).await;
                if fail {
                    anyhow::bail!("invalid grant");
                }
                Ok(OAuthToken {
                    access_token: format!("access-{n}"),
                    refresh_token: Some("refresh".into()),
                    expires_at_ms: Some(now_ms() + 3_600_000),
                    scopes: None,
                    user_id: None,
                    client_id: config.client_id,
                })
            }
        }

        fn validate(
            &self,
            _config: ServiceConfig,
            _access_token: String,
        ) -> impl Future<Output = Result<ValidationInfo>> + Send {
            async move {
                Ok(ValidationInfo {
                    user_id: Some("u123".into()),
                    scopes: Some(vec!["chat:read".into(), "chat:edit".into()]),
                    expires_in_s: Some(3600),
                })
            }
        }
    }

    fn manager(
        provider: Arc<MockProvider>,
    ) -> Arc<TokenManager<MemoryTokenStore, MockProvider>> {
        Arc::new(TokenManager::new(
            Arc::new(MemoryTokenStore::new()),
            provider,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryOptions {
                max_attempts: 1,
                ..RetryOptions::default()
            },
            300_000,
        ))
    }

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            service: "twitch".into(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            token_url: "http://localhost/token".into(),
            validate_url: Some("http://localhost/validate".into()),
        }
    }

    fn token(expires_in_ms: i64) -> OAuthToken {
        OAuthToken {
            access_token: "old-access".into(),
            refresh_token: Some("refresh".into()),
            expires_at_ms: Some(now_ms() + expires_in_ms),
            scopes: None,
            user_id: None,
            client_id: "cid".into(),
        }
    }

    #[tokio::test]
    async fn unregistered_service_errors() {
        let m = manager(Arc::new(MockProvider::new()));
        let err = m.get_valid("nope").await.unwrap_err();
        assert!(matches!(err, OAuthError::ServiceNotRegistered { .. }));
    }

    #[tokio::test]
    async fn missing_token_errors() {
        let m = manager(Arc::new(MockProvider::new()));
        m.register(service_config()).unwrap();
        let err = m.get_valid("twitch").await.unwrap_err();
        assert_eq!(err, OAuthError::NoTokenAvailable);
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let provider = Arc::new(MockProvider::new());
        let m = manager(Arc::clone(&provider));
        m.register(service_config()).unwrap();
        // Expires well outside the 300 s buffer.
        m.store_token("twitch", token(3_600_000)).unwrap();

        let t = m.get_valid("twitch").await.unwrap();
        assert_eq!(t.access_token, "old-access");
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_get_valid_triggers_single_refresh() {
        let provider = Arc::new(MockProvider::new());
        let m = manager(Arc::clone(&provider));
        m.register(service_config()).unwrap();
        // Expires inside the buffer: every caller wants a refresh.
        m.store_token("twitch", token(60_000)).unwrap();

        let (a, b, c) = tokio::join!(
            m.get_valid("twitch"),
            m.get_valid("twitch"),
            m.get_valid("twitch")
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(provider.refresh_count(), 1);
        assert_eq!(a.access_token, "access-1");
        assert_eq!(a.access_token, b.access_token);
        assert_eq!(b.access_token, c.access_token);
    }

    #[tokio::test]
    async fn failed_refresh_serves_unexpired_token() {
        let provider = Arc::new(MockProvider::new());
        provider.fail.store(true, Ordering::SeqCst);
        let m = manager(Arc::clone(&provider));
        m.register(service_config()).unwrap();
        m.store_token("twitch", token(60_000)).unwrap();

        let t = m.get_valid("twitch").await.unwrap();
        assert_eq!(t.access_token, "old-access");
    }

    #[tokio::test]
    async fn failed_refresh_with_expired_token_errors() {
        let provider = Arc::new(MockProvider::new());
        provider.fail.store(true, Ordering::SeqCst);
        let m = manager(Arc::clone(&provider));
        m.register(service_config()).unwrap();
        m.store_token("twitch", token(-1000)).unwrap();

        let err = m.get_valid("twitch").await.unwrap_err();
        assert!(matches!(err, OAuthError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_errors() {
        let m = manager(Arc::new(MockProvider::new()));
        m.register(service_config()).unwrap();
        let mut t = token(60_000);
        t.refresh_token = None;
        m.store_token("twitch", t).unwrap();

        let err = m.refresh("twitch").await.unwrap_err();
        assert_eq!(err, OAuthError::NoRefreshToken);
    }

    #[tokio::test]
    async fn validate_merges_identity_into_stored_token() {
        let m = manager(Arc::new(MockProvider::new()));
        m.register(service_config()).unwrap();
        m.store_token("twitch", token(3_600_000)).unwrap();

        let info = m.validate("twitch").await.unwrap();
        assert_eq!(info.user_id.as_deref(), Some("u123"));

        let stored = m.peek_token("twitch").unwrap().unwrap();
        assert_eq!(stored.user_id.as_deref(), Some("u123"));
        assert_eq!(
            stored.scopes,
            Some(vec!["chat:read".to_string(), "chat:edit".to_string()])
        );
    }

    #[tokio::test]
    async fn token_survives_in_store_across_managers() {
        let store = Arc::new(MemoryTokenStore::new());
        let provider = Arc::new(MockProvider::new());
        let m = Arc::new(TokenManager::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryOptions::default(),
            300_000,
        ));
        m.register(service_config()).unwrap();
        m.store_token("twitch", token(3_600_000)).unwrap();

        // A second manager over the same store hydrates the token.
        let m2 = Arc::new(TokenManager::new(
            store,
            provider,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryOptions::default(),
            300_000,
        ));
        m2.register(service_config()).unwrap();
        let t = m2.peek_token("twitch").unwrap().unwrap();
        assert_eq!(t.access_token, "old-access");
    }
}
