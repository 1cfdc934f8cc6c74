//! Session token exchange.
//!
//! A long-lived application credential is traded for a short-lived,
//! single-use token scoped to one restaurant and one client. Tokens are never
//! cached: every connection attempt, reconnections included, fetches a new
//! one, and [`SessionToken`] is deliberately neither `Clone` nor persisted.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::base::{VoiceError, VoiceResult};
use super::openai::SESSION_TOKEN_TTL;

/// Path of the token endpoint relative to the API base URL.
pub const TOKEN_ENDPOINT_PATH: &str = "/realtime/session";

// =============================================================================
// Session Token
// =============================================================================

/// Short-lived connection credential. Consumed by exactly one SDP exchange.
pub struct SessionToken {
    value: Zeroizing<String>,
    issued_at: SystemTime,
    expires_at: SystemTime,
    scope_restaurant_id: String,
    scope_client_id: String,
    menu_context: Option<String>,
}

impl SessionToken {
    /// Build a token issued now with the given lifetime.
    pub fn new(
        value: impl Into<String>,
        ttl: Duration,
        restaurant_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        let issued_at = SystemTime::now();
        Self {
            value: Zeroizing::new(value.into()),
            issued_at,
            expires_at: issued_at + ttl,
            scope_restaurant_id: restaurant_id.into(),
            scope_client_id: client_id.into(),
            menu_context: None,
        }
    }

    /// Attach the menu context returned alongside the token.
    pub fn with_menu_context(mut self, menu_context: Option<String>) -> Self {
        self.menu_context = menu_context;
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn scope_restaurant_id(&self) -> &str {
        &self.scope_restaurant_id
    }

    pub fn scope_client_id(&self) -> &str {
        &self.scope_client_id
    }

    pub fn menu_context(&self) -> Option<&str> {
        self.menu_context.as_deref()
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("scope_restaurant_id", &self.scope_restaurant_id)
            .field("scope_client_id", &self.scope_client_id)
            .field("has_menu_context", &self.menu_context.is_some())
            .finish()
    }
}

/// What a token is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenScope {
    pub restaurant_id: String,
    pub client_id: String,
}

// =============================================================================
// Token Source
// =============================================================================

/// Fetches a fresh session token for every connection attempt.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self, auth_token: &str, scope: &TokenScope) -> VoiceResult<SessionToken>;
}

/// Read-through provider of the restaurant menu context sent with token requests.
#[async_trait]
pub trait MenuContextSource: Send + Sync {
    async fn menu_context(&self, restaurant_id: &str) -> Option<serde_json::Value>;
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    restaurant_id: &'a str,
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    menu_context: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    restaurant_id: Option<String>,
    #[serde(default)]
    menu_context: Option<serde_json::Value>,
    /// Upstream shape, passed through unchanged by some deployments
    #[serde(default)]
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

/// HTTP token provider: `POST {api_base_url}/realtime/session`.
#[derive(Clone)]
pub struct SessionTokenProvider {
    client: Client,
    endpoint: String,
    menu_context: Option<Arc<dyn MenuContextSource>>,
}

impl fmt::Debug for SessionTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokenProvider")
            .field("endpoint", &self.endpoint)
            .field("menu_context", &self.menu_context.is_some())
            .finish()
    }
}

impl SessionTokenProvider {
    /// Create a provider with a request timeout.
    pub fn new(api_base_url: &str, timeout: Duration) -> VoiceResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(client, api_base_url))
    }

    pub fn with_client(client: Client, api_base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", api_base_url.trim_end_matches('/'), TOKEN_ENDPOINT_PATH),
            menu_context: None,
        }
    }

    /// Enrich token requests with the menu context of the restaurant.
    pub fn with_menu_context_source(mut self, source: Arc<dyn MenuContextSource>) -> Self {
        self.menu_context = Some(source);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_status(status: StatusCode, body: &str) -> VoiceError {
        let code = status.as_u16();
        let detail = body.chars().take(200).collect::<String>();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            VoiceError::Auth {
                status: code,
                message: if detail.is_empty() {
                    "credential rejected by token endpoint".to_string()
                } else {
                    detail
                },
            }
        } else {
            VoiceError::Service {
                status: code,
                message: format!("Token request failed with status {code}: {detail}"),
            }
        }
    }
}

fn from_unix_seconds(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}

#[async_trait]
impl TokenSource for SessionTokenProvider {
    async fn fetch_token(&self, auth_token: &str, scope: &TokenScope) -> VoiceResult<SessionToken> {
        let menu_context = match &self.menu_context {
            Some(source) => source.menu_context(&scope.restaurant_id).await,
            None => None,
        };

        let request = TokenRequest {
            restaurant_id: &scope.restaurant_id,
            client_id: &scope.client_id,
            menu_context,
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            restaurant_id = %scope.restaurant_id,
            "Requesting realtime session token"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(auth_token)
            .header("x-restaurant-id", &scope.restaurant_id)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VoiceError::Network(format!("Token request timed out: {e}"))
                } else {
                    VoiceError::Network(format!("Token request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::Network(format!("Failed to read token response: {e}")))?;

        if !status.is_success() {
            let err = Self::map_status(status, &body);
            tracing::warn!(status = status.as_u16(), "Token request rejected");
            return Err(err);
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| VoiceError::Protocol(format!("Invalid token response: {e}")))?;

        if let Some(ref issued_for) = parsed.restaurant_id
            && issued_for != &scope.restaurant_id
        {
            return Err(VoiceError::Service {
                status: status.as_u16(),
                message: format!(
                    "Token scoped to restaurant {issued_for}, requested {} (status {})",
                    scope.restaurant_id,
                    status.as_u16()
                ),
            });
        }

        let (value, expires_at) = match (parsed.value, parsed.client_secret) {
            (Some(value), _) => (value, parsed.expires_at),
            (None, Some(secret)) => (secret.value, secret.expires_at.or(parsed.expires_at)),
            (None, None) => {
                return Err(VoiceError::Protocol(
                    "Invalid token response: missing value".to_string(),
                ));
            }
        };

        let menu_context = parsed.menu_context.map(|ctx| match ctx {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        });

        let mut token = SessionToken::new(
            value,
            SESSION_TOKEN_TTL,
            scope.restaurant_id.clone(),
            scope.client_id.clone(),
        )
        .with_menu_context(menu_context);
        if let Some(seconds) = expires_at {
            token.expires_at = from_unix_seconds(seconds);
        }

        tracing::info!(
            restaurant_id = %scope.restaurant_id,
            expires_in_ms = token.remaining().as_millis() as u64,
            "Realtime session token issued"
        );

        Ok(token)
    }
}
