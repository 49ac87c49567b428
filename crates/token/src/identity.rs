//! The HTTP call to a tenant's identity provider to exchange a refresh token
//! for a new access token. Behind a trait so the refresh algorithm can be
//! exercised against a fake in tests without a live network.

use async_trait::async_trait;
use serde::Deserialize;

/// A successful token-endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires, relative to the response.
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Failure shape from an identity-provider refresh attempt, already reduced
/// to the categories [`retry::classify`] understands.
#[derive(Debug, Clone)]
pub enum IdentityError {
    Transport(String),
    Http { status: u16, body: String },
    ProviderCode(String),
}

impl IdentityError {
    pub fn as_failure(&self) -> retry::Failure {
        match self {
            IdentityError::Transport(_) => retry::Failure::Transport,
            IdentityError::Http { status, .. } => retry::Failure::Http { status: *status },
            IdentityError::ProviderCode(code) => retry::Failure::ProviderCode(code.clone()),
        }
    }
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Transport(e) => write!(f, "transport error: {e}"),
            IdentityError::Http { status, body } => write!(f, "identity provider returned {status}: {body}"),
            IdentityError::ProviderCode(code) => write!(f, "identity provider error: {code}"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Abstracts the refresh-token POST to an upstream identity provider.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn refresh(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: String,
}

/// A `reqwest`-backed [`IdentityClient`] posting the standard OAuth2
/// `grant_type=refresh_token` form.
pub struct HttpIdentityClient {
    client: reqwest::Client,
}

impl HttpIdentityClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn refresh(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, IdentityError> {
        let response = self
            .client
            .post(token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| IdentityError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<RefreshedToken>()
                .await
                .map_err(|e| IdentityError::Transport(format!("invalid token response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<ProviderErrorBody>(&body) {
            return Err(IdentityError::ProviderCode(parsed.error));
        }
        Err(IdentityError::Http { status: status.as_u16(), body })
    }
}
