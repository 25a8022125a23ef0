//! OAuth credential freshness for the CRM side.
//!
//! `ensure_fresh` never throws on refresh failure: the caller always gets a
//! credential back, flagged as expired when the exchange did not happen, and
//! decides whether to proceed unauthenticated or abort. Concurrent refreshes
//! of the same credential race benignly; the latest grant wins and a stale
//! token simply fails on next use, triggering another refresh.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use waline_core::domain::prefixed_id;
use waline_core::{Credential, CredentialId, TenantId};
use waline_db::repositories::CredentialRepository;

/// Remaining lifetime below which a token is refreshed ahead of use.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token endpoint transport failure: {0}")]
    Transport(String),
    #[error("token endpoint rejected the refresh: {0}")]
    Rejected(String),
    #[error("credential has no refresh token")]
    MissingRefreshToken,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Authorization-code exchange for the OAuth callback path.
    async fn exchange_code(
        &self,
        portal_url: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenError>;

    async fn exchange_refresh(
        &self,
        portal_url: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, TokenError>;
}

pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
}

impl HttpTokenEndpoint {
    pub fn new(client_id: String, client_secret: SecretString, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, client_id, client_secret }
    }
}

impl HttpTokenEndpoint {
    async fn exchange(
        &self,
        portal_url: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, TokenError> {
        let url = format!("{}/oauth/token/", portal_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|error| TokenError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Rejected(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| TokenError::Rejected(format!("undecodable token response: {error}")))?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| TokenError::Rejected("empty access token in response".to_string()))?
            .to_string();

        Ok(TokenGrant {
            access_token,
            refresh_token: body.get("refresh_token").and_then(Value::as_str).map(str::to_string),
            expires_in: body.get("expires_in").and_then(Value::as_i64),
            scope: body.get("scope").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        portal_url: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenError> {
        self.exchange(
            portal_url,
            &[
                ("grant_type", "authorization_code"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    async fn exchange_refresh(
        &self,
        portal_url: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, TokenError> {
        self.exchange(
            portal_url,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}

/// Result of an `ensure_fresh` call. `RefreshFailed` carries the original
/// credential unchanged; it is the `TokenExpired` signal, not an error.
#[derive(Clone, Debug)]
pub enum RefreshOutcome {
    Fresh(Credential),
    Refreshed(Credential),
    RefreshFailed { credential: Credential, error: TokenError },
}

impl RefreshOutcome {
    pub fn credential(&self) -> &Credential {
        match self {
            Self::Fresh(credential)
            | Self::Refreshed(credential)
            | Self::RefreshFailed { credential, .. } => credential,
        }
    }

    pub fn into_credential(self) -> Credential {
        match self {
            Self::Fresh(credential)
            | Self::Refreshed(credential)
            | Self::RefreshFailed { credential, .. } => credential,
        }
    }

    pub fn token_expired(&self) -> bool {
        matches!(self, Self::RefreshFailed { .. })
    }
}

pub struct TokenRefresher {
    endpoint: Arc<dyn TokenEndpoint>,
    credentials: Arc<dyn CredentialRepository>,
    skew: Duration,
}

impl TokenRefresher {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, credentials: Arc<dyn CredentialRepository>) -> Self {
        Self { endpoint, credentials, skew: Duration::seconds(EXPIRY_SKEW_SECS) }
    }

    /// OAuth callback path: exchange the authorization code and persist the
    /// resulting credential, replacing any prior active one for the same
    /// (tenant, portal).
    pub async fn authorize(
        &self,
        tenant_id: TenantId,
        portal_url: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credential, TokenError> {
        let grant = self.endpoint.exchange_code(portal_url, code, redirect_uri).await?;
        let now = Utc::now();
        let credential = Credential {
            id: CredentialId(prefixed_id("CRED")),
            tenant_id,
            portal_url: portal_url.trim_end_matches('/').to_string(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_in.map(|secs| now + Duration::seconds(secs)),
            scope: grant.scope,
            active: true,
            created_at: now,
            updated_at: now,
        };

        if let Err(error) = self.credentials.store_grant(credential.clone()).await {
            warn!(
                event_name = "crm.tokens.store_failed",
                credential_id = %credential.id,
                error = %error,
                "authorized credential could not be persisted"
            );
            return Err(TokenError::Transport(error.to_string()));
        }

        info!(
            event_name = "crm.tokens.authorized",
            credential_id = %credential.id,
            portal = %credential.portal_url,
            "oauth authorization completed"
        );
        Ok(credential)
    }

    /// Return a non-expired credential when possible. A credential with more
    /// than the safety skew remaining is returned untouched without any
    /// endpoint call.
    pub async fn ensure_fresh(&self, credential: Credential) -> RefreshOutcome {
        if !credential.expires_within(Utc::now(), self.skew) {
            return RefreshOutcome::Fresh(credential);
        }
        self.refresh(credential).await
    }

    /// Refresh unconditionally; used after the remote API rejected a token
    /// that looked fresh locally.
    pub async fn force_refresh(&self, credential: Credential) -> RefreshOutcome {
        self.refresh(credential).await
    }

    async fn refresh(&self, credential: Credential) -> RefreshOutcome {
        let Some(refresh_token) = credential.refresh_token.clone() else {
            return RefreshOutcome::RefreshFailed {
                credential,
                error: TokenError::MissingRefreshToken,
            };
        };

        match self.endpoint.exchange_refresh(&credential.portal_url, &refresh_token).await {
            Ok(grant) => {
                let now = Utc::now();
                let expires_at = grant.expires_in.map(|secs| now + Duration::seconds(secs));
                // The provider invalidates the old refresh token on each
                // exchange; keep the prior one only when none was returned.
                let next_refresh_token =
                    grant.refresh_token.clone().or(Some(refresh_token));

                if let Err(error) = self
                    .credentials
                    .update_tokens(
                        &credential.id,
                        &grant.access_token,
                        next_refresh_token.as_deref(),
                        expires_at,
                    )
                    .await
                {
                    // The in-memory grant is still usable for this call;
                    // persistence catches up on the next refresh.
                    warn!(
                        event_name = "crm.tokens.persist_failed",
                        credential_id = %credential.id,
                        error = %error,
                        "refreshed token could not be persisted"
                    );
                }

                info!(
                    event_name = "crm.tokens.refreshed",
                    credential_id = %credential.id,
                    portal = %credential.portal_url,
                    "access token refreshed"
                );

                let mut updated = credential;
                updated.access_token = grant.access_token;
                updated.refresh_token = next_refresh_token;
                updated.expires_at = expires_at;
                updated.updated_at = now;
                RefreshOutcome::Refreshed(updated)
            }
            Err(error) => {
                warn!(
                    event_name = "crm.tokens.refresh_failed",
                    credential_id = %credential.id,
                    portal = %credential.portal_url,
                    error = %error,
                    "token refresh failed; proceeding with the stored token"
                );
                RefreshOutcome::RefreshFailed { credential, error }
            }
        }
    }
}
