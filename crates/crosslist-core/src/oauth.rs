//! OAuth token lifecycle for one provider.
//!
//! A [`TokenManager`] owns the access/refresh token pair of a single provider
//! behind its own async mutex. Handing out a token and refreshing it happen
//! under that lock, so concurrent callers on an expiring token share one
//! refresh call, while managers of different providers never contend.
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | `Uninitialized` | no access token (never set, or revoked) |
//! | `Valid` | token usable as is |
//! | `RefreshNeeded` | within the refresh threshold and a refresh token exists |
//! | `Invalid` | expired without a refresh token, or the last refresh failed |

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::OAuthSettings;
use crate::events::redact;
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, ReqwestHttpClient};
use crate::marketplace::ProviderError;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::{ProviderId, UtcDateTime};

const DEFAULT_TOKEN_TYPE: &str = "Bearer";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/callback";

/// OAuth client registration for one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
    /// Defaults to the token endpoint with its `/token` suffix swapped for `/revoke`.
    pub revoke_endpoint: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("token_endpoint", &self.token_endpoint)
            .field("revoke_endpoint", &self.revoke_endpoint)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl OAuthClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: token_endpoint.into(),
            revoke_endpoint: None,
            authorization_endpoint: None,
            redirect_uri: String::from(DEFAULT_REDIRECT_URI),
            scopes: vec![String::from("read"), String::from("write")],
        }
    }

    /// Reads `CROSSLIST_<PROVIDER>_CLIENT_ID`, `_CLIENT_SECRET` and
    /// `_TOKEN_ENDPOINT`.
    pub fn from_env(provider: &ProviderId) -> Result<Self, TokenError> {
        let prefix = format!("CROSSLIST_{}", provider.env_key());
        let read = |suffix: &str| {
            let variable = format!("{prefix}_{suffix}");
            std::env::var(&variable)
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .ok_or(TokenError::MissingCredential { variable })
        };

        Ok(Self::new(
            read("CLIENT_ID")?,
            read("CLIENT_SECRET")?,
            read("TOKEN_ENDPOINT")?,
        ))
    }

    pub fn with_revoke_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.revoke_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_authorization_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.authorization_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn revoke_url(&self) -> String {
        if let Some(endpoint) = &self.revoke_endpoint {
            return endpoint.clone();
        }
        match self.token_endpoint.strip_suffix("/token") {
            Some(base) => format!("{base}/revoke"),
            None => self.token_endpoint.replace("/token", "/revoke"),
        }
    }
}

/// Failures of the token layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("environment variable '{variable}' is not set")]
    MissingCredential { variable: String },
    #[error("no access token available for provider '{provider}'")]
    NotInitialized { provider: ProviderId },
    #[error("access token for provider '{provider}' expired and no refresh token is available")]
    Expired { provider: ProviderId },
    #[error("token refresh for provider '{provider}' failed: {source}")]
    RefreshFailed {
        provider: ProviderId,
        #[source]
        source: ProviderError,
    },
    #[error("authorization code exchange for provider '{provider}' failed: {source}")]
    ExchangeFailed {
        provider: ProviderId,
        #[source]
        source: ProviderError,
    },
    #[error("no authorization endpoint configured for provider '{provider}'")]
    MissingAuthorizationEndpoint { provider: ProviderId },
}

impl From<TokenError> for ProviderError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::RefreshFailed { provider, source }
            | TokenError::ExchangeFailed { provider, source } => {
                let context = format!("credential for '{provider}' unavailable");
                source.map_message(|message| format!("{context}: {message}"))
            }
            other => ProviderError::permanent(other.to_string()),
        }
    }
}

/// Access token handed to a provider call.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub token_type: String,
    pub access_token: String,
}

impl BearerToken {
    pub fn auth(&self) -> HttpAuth {
        HttpAuth::from_token(&self.token_type, self.access_token.clone())
    }

    /// Value for an `Authorization` header, e.g. `Bearer abc`.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl Debug for BearerToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("token_type", &self.token_type)
            .field("access_token", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPhase {
    Uninitialized,
    Valid,
    RefreshNeeded,
    Invalid,
}

/// Point-in-time view of a provider's token state. Carries no secrets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenInfo {
    pub phase: TokenPhase,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub token_type: String,
    pub expires_at: Option<UtcDateTime>,
    pub seconds_until_expiry: Option<i64>,
    pub should_refresh: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_at: Option<Instant>,
    expires_at_utc: Option<UtcDateTime>,
    refresh_failed: bool,
}

impl TokenState {
    fn store(
        &mut self,
        access_token: String,
        refresh_token: Option<String>,
        token_type: Option<String>,
        expires_in: Option<Duration>,
    ) {
        self.access_token = Some(access_token);
        if refresh_token.is_some() {
            self.refresh_token = refresh_token;
        }
        if token_type.is_some() {
            self.token_type = token_type;
        }
        self.expires_at = expires_in.map(|lifetime| Instant::now() + lifetime);
        self.expires_at_utc = expires_in.map(|lifetime| {
            UtcDateTime::now()
                .offset_by_seconds(i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX))
        });
        self.refresh_failed = false;
    }

    fn token_type(&self) -> &str {
        self.token_type.as_deref().unwrap_or(DEFAULT_TOKEN_TYPE)
    }

    fn time_left(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn is_expired(&self) -> bool {
        self.time_left().is_some_and(|left| left.is_zero())
    }

    fn should_refresh(&self, threshold: Duration) -> bool {
        self.refresh_token.is_some() && self.time_left().is_some_and(|left| left <= threshold)
    }

    fn is_valid(&self) -> bool {
        self.access_token.is_some() && !self.is_expired()
    }

    fn phase(&self, threshold: Duration) -> TokenPhase {
        if self.access_token.is_none() {
            TokenPhase::Uninitialized
        } else if self.refresh_failed {
            TokenPhase::Invalid
        } else if self.should_refresh(threshold) {
            TokenPhase::RefreshNeeded
        } else if self.is_expired() {
            TokenPhase::Invalid
        } else {
            TokenPhase::Valid
        }
    }
}

/// Keeps one provider's OAuth credential valid.
pub struct TokenManager {
    provider: ProviderId,
    client: OAuthClientConfig,
    settings: OAuthSettings,
    retry: RetryPolicy,
    http: Arc<dyn HttpClient>,
    state: Mutex<TokenState>,
}

impl Debug for TokenManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("provider", &self.provider)
            .field("client", &self.client)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(provider: ProviderId, client: OAuthClientConfig, http: Arc<dyn HttpClient>) -> Self {
        Self {
            provider,
            client,
            settings: OAuthSettings::default(),
            retry: RetryPolicy::default(),
            http,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Manager for `provider` using credentials from the environment and the
    /// reqwest transport.
    pub fn from_env(provider: ProviderId) -> Result<Self, TokenError> {
        let client = OAuthClientConfig::from_env(&provider)?;
        Ok(Self::new(provider, client, Arc::new(ReqwestHttpClient::new())))
    }

    pub fn with_settings(mut self, settings: OAuthSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Retry policy applied to token endpoint calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub async fn initialize_tokens(
        &self,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<Duration>,
    ) {
        let mut state = self.state.lock().await;
        state.refresh_token = None;
        state.token_type = None;
        state.store(access_token.into(), refresh_token, None, expires_in);
        tracing::info!(provider = %self.provider, "oauth tokens initialized");
    }

    /// Returns a usable access token, refreshing first when it is close to
    /// expiry.
    ///
    /// A failed refresh fails this call only; the previous token is kept and
    /// the next call tries again.
    pub async fn get_valid_access_token(&self) -> Result<BearerToken, TokenError> {
        let mut state = self.state.lock().await;

        if state.access_token.is_none() {
            return Err(TokenError::NotInitialized {
                provider: self.provider.clone(),
            });
        }

        if state.should_refresh(self.settings.refresh_threshold) {
            self.refresh_locked(&mut state).await?;
        } else if state.is_expired() {
            return Err(TokenError::Expired {
                provider: self.provider.clone(),
            });
        }

        let access_token = state
            .access_token
            .clone()
            .ok_or_else(|| TokenError::NotInitialized {
                provider: self.provider.clone(),
            })?;
        Ok(BearerToken {
            token_type: state.token_type().to_owned(),
            access_token,
        })
    }

    /// Authorization to attach to provider calls.
    pub async fn authorization_header(&self) -> Result<HttpAuth, TokenError> {
        self.get_valid_access_token().await.map(|token| token.auth())
    }

    /// Refreshes regardless of remaining lifetime.
    pub async fn force_refresh(&self) -> Result<(), TokenError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// True when an access token is present and not past its expiry.
    /// Tokens without a declared expiry never expire.
    pub async fn is_token_valid(&self) -> bool {
        self.state.lock().await.is_valid()
    }

    pub async fn phase(&self) -> TokenPhase {
        self.state.lock().await.phase(self.settings.refresh_threshold)
    }

    pub async fn token_info(&self) -> TokenInfo {
        let state = self.state.lock().await;
        let threshold = self.settings.refresh_threshold;
        TokenInfo {
            phase: state.phase(threshold),
            has_access_token: state.access_token.is_some(),
            has_refresh_token: state.refresh_token.is_some(),
            token_type: state.token_type().to_owned(),
            expires_at: state.expires_at_utc,
            seconds_until_expiry: state
                .time_left()
                .map(|left| i64::try_from(left.as_secs()).unwrap_or(i64::MAX)),
            should_refresh: state.should_refresh(threshold),
        }
    }

    /// Notifies the revocation endpoint (single attempt, best effort), then
    /// clears local state whatever the outcome. Returns whether the provider
    /// acknowledged the revocation.
    pub async fn revoke_tokens(&self) -> bool {
        let mut state = self.state.lock().await;

        let acknowledged = match state.access_token.as_deref() {
            Some(access_token) => {
                let request = HttpRequest::post(self.client.revoke_url()).with_form(&[
                    ("token", access_token),
                    ("token_type_hint", "access_token"),
                    ("client_id", &self.client.client_id),
                    ("client_secret", &self.client.client_secret),
                ]);
                match self.http.execute(request).await {
                    Ok(response) if response.is_success() => true,
                    Ok(response) => {
                        tracing::warn!(
                            provider = %self.provider,
                            status = response.status,
                            "token revocation rejected"
                        );
                        false
                    }
                    Err(error) => {
                        tracing::warn!(
                            provider = %self.provider,
                            error = %self.scrub(error.message(), &state),
                            "token revocation request failed"
                        );
                        false
                    }
                }
            }
            None => false,
        };

        *state = TokenState::default();
        tracing::info!(provider = %self.provider, acknowledged, "oauth tokens cleared");
        acknowledged
    }

    /// URL the seller visits to grant access.
    pub fn authorization_url(&self, csrf_state: Option<&str>) -> Result<String, TokenError> {
        let endpoint = self.client.authorization_endpoint.as_deref().ok_or_else(|| {
            TokenError::MissingAuthorizationEndpoint {
                provider: self.provider.clone(),
            }
        })?;

        let scope = self.client.scopes.join(" ");
        let mut params = vec![
            ("client_id", self.client.client_id.as_str()),
            ("redirect_uri", self.client.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
        ];
        if let Some(csrf_state) = csrf_state {
            params.push(("state", csrf_state));
        }

        let query = params
            .iter()
            .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{endpoint}?{query}"))
    }

    /// Trades an authorization code for a token pair and stores it.
    pub async fn exchange_code(&self, code: &str) -> Result<(), TokenError> {
        let mut state = self.state.lock().await;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.client.redirect_uri.as_str()),
            ("client_id", self.client.client_id.as_str()),
            ("client_secret", self.client.client_secret.as_str()),
        ];

        match self.request_tokens(&form).await {
            Ok(response) => {
                state.refresh_token = None;
                state.token_type = None;
                Self::apply(&mut state, response);
                tracing::info!(provider = %self.provider, "authorization code exchanged for tokens");
                Ok(())
            }
            Err(error) => {
                let source = error.map_message(|message| redact(message, &[code]));
                let source = source.map_message(|message| self.scrub(message, &state));
                Err(TokenError::ExchangeFailed {
                    provider: self.provider.clone(),
                    source,
                })
            }
        }
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<(), TokenError> {
        let Some(refresh_token) = state.refresh_token.clone() else {
            return Err(TokenError::Expired {
                provider: self.provider.clone(),
            });
        };

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client.client_id.as_str()),
            ("client_secret", self.client.client_secret.as_str()),
        ];

        match self.request_tokens(&form).await {
            Ok(response) => {
                Self::apply(state, response);
                tracing::info!(provider = %self.provider, "access token refreshed");
                Ok(())
            }
            Err(error) => {
                state.refresh_failed = true;
                let source = error.map_message(|message| self.scrub(message, state));
                tracing::warn!(
                    provider = %self.provider,
                    error = %source,
                    "access token refresh failed"
                );
                Err(TokenError::RefreshFailed {
                    provider: self.provider.clone(),
                    source,
                })
            }
        }
    }

    async fn request_tokens(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ProviderError> {
        let request = HttpRequest::post(self.client.token_endpoint.as_str()).with_form(form);
        let http = &self.http;

        RetryExecutor::new(&self.retry)
            .execute(|_| {
                let request = request.clone();
                async move {
                    let response = http.execute(request).await?;
                    if !response.is_success() {
                        return Err(response.into_error("token request"));
                    }
                    response.json::<TokenResponse>()
                }
            })
            .await
    }

    fn apply(state: &mut TokenState, response: TokenResponse) {
        state.store(
            response.access_token,
            response.refresh_token,
            response.token_type,
            response.expires_in.map(Duration::from_secs),
        );
    }

    fn scrub(&self, message: &str, state: &TokenState) -> String {
        let mut secrets = vec![self.client.client_secret.as_str()];
        secrets.extend(state.access_token.as_deref());
        secrets.extend(state.refresh_token.as_deref());
        redact(message, &secrets)
    }
}
