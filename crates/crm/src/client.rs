//! Typed wrapper over the CRM REST surface.
//!
//! Every call goes through the token refresher first and is retried exactly
//! once after a forced refresh when the CRM rejects the token as expired.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use waline_core::{Credential, LineId};

use crate::tokens::TokenRefresher;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrmApiError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("access token rejected by the CRM")]
    AuthExpired,
    #[error("crm api error `{code}`: {description}")]
    Api { code: String, description: String },
    #[error("malformed crm response: {0}")]
    MalformedResponse(String),
}

impl CrmApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { code, .. } => {
                matches!(code.as_str(), "INTERNAL_SERVER_ERROR" | "QUERY_LIMIT_EXCEEDED")
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait CrmTransport: Send + Sync {
    async fn call(
        &self,
        portal_url: &str,
        access_token: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, CrmApiError>;
}

pub struct HttpCrmTransport {
    client: reqwest::Client,
}

impl HttpCrmTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl CrmTransport for HttpCrmTransport {
    async fn call(
        &self,
        portal_url: &str,
        access_token: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, CrmApiError> {
        let url = format!("{}/rest/{method}", portal_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[("auth", access_token)])
            .json(&params)
            .send()
            .await
            .map_err(|error| CrmApiError::Transport(error.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|error| CrmApiError::MalformedResponse(error.to_string()))?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if matches!(error, "expired_token" | "invalid_token" | "WRONG_AUTH_TYPE") {
                return Err(CrmApiError::AuthExpired);
            }
            return Err(CrmApiError::Api {
                code: error.to_string(),
                description: body
                    .get("error_description")
                    .and_then(Value::as_str)
                    .unwrap_or("no description")
                    .to_string(),
            });
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// One message headed into an Open Line, shaped for the connector send call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrmSendMessage {
    /// Contact identity on the WA side (E.164 phone).
    pub user_id: String,
    pub user_name: Option<String>,
    /// CRM chat to append to, once known; omitted on the first message of a
    /// conversation, in which case the CRM opens a chat and reports its id.
    pub chat_id: Option<String>,
    pub external_message_id: Option<String>,
    pub text: String,
    pub file_url: Option<String>,
}

/// CRM acceptance of a connector send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrmSendAck {
    pub chat_id: Option<String>,
}

pub struct CrmClient {
    transport: Arc<dyn CrmTransport>,
    refresher: Arc<TokenRefresher>,
    connector_code: String,
}

impl CrmClient {
    pub fn new(
        transport: Arc<dyn CrmTransport>,
        refresher: Arc<TokenRefresher>,
        connector_code: String,
    ) -> Self {
        Self { transport, refresher, connector_code }
    }

    pub fn connector_code(&self) -> &str {
        &self.connector_code
    }

    /// Register this relay as a connector with the CRM platform.
    pub async fn register_connector(
        &self,
        credential: Credential,
        display_name: &str,
    ) -> Result<(), CrmApiError> {
        self.call(
            credential,
            "imconnector.register",
            json!({
                "ID": self.connector_code,
                "NAME": display_name,
                "ICON": {"DATA_IMAGE": Value::Null},
            }),
        )
        .await
        .map(|_| ())
    }

    /// Publish connector metadata (status widget) for one line.
    pub async fn publish_connector_data(
        &self,
        credential: Credential,
        line: &LineId,
        data: Value,
    ) -> Result<(), CrmApiError> {
        self.call(
            credential,
            "imconnector.connector.data.set",
            json!({
                "CONNECTOR": self.connector_code,
                "LINE": line.0,
                "DATA": data,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn activate_connector(
        &self,
        credential: Credential,
        line: &LineId,
    ) -> Result<(), CrmApiError> {
        self.set_connector_active(credential, line, true).await
    }

    pub async fn deactivate_connector(
        &self,
        credential: Credential,
        line: &LineId,
    ) -> Result<(), CrmApiError> {
        self.set_connector_active(credential, line, false).await
    }

    async fn set_connector_active(
        &self,
        credential: Credential,
        line: &LineId,
        active: bool,
    ) -> Result<(), CrmApiError> {
        self.call(
            credential,
            "imconnector.activate",
            json!({
                "CONNECTOR": self.connector_code,
                "LINE": line.0,
                "ACTIVE": if active { 1 } else { 0 },
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn list_lines(&self, credential: Credential) -> Result<Vec<LineId>, CrmApiError> {
        let result = self.call(credential, "imopenlines.config.list.get", json!({})).await?;
        let lines = result
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("ID"))
                    .filter_map(|id| match id {
                        Value::String(value) => Some(value.clone()),
                        Value::Number(value) => Some(value.to_string()),
                        _ => None,
                    })
                    .map(LineId)
                    .collect()
            })
            .unwrap_or_default();
        Ok(lines)
    }

    pub async fn create_line(
        &self,
        credential: Credential,
        name: &str,
    ) -> Result<LineId, CrmApiError> {
        let result = self
            .call(credential, "imopenlines.config.add", json!({"PARAMS": {"LINE_NAME": name}}))
            .await?;
        match result {
            Value::Number(id) => Ok(LineId(id.to_string())),
            Value::String(id) => Ok(LineId(id)),
            other => Err(CrmApiError::MalformedResponse(format!(
                "line create returned unexpected value: {other}"
            ))),
        }
    }

    /// Deliver one relayed message into a line. The response carries the
    /// CRM-side chat id when the CRM opened a new chat for the contact.
    pub async fn send_message_to_line(
        &self,
        credential: Credential,
        line: &LineId,
        message: &CrmSendMessage,
    ) -> Result<CrmSendAck, CrmApiError> {
        let mut entry = json!({
            "user": {
                "id": message.user_id,
                "name": message.user_name.as_deref().unwrap_or(message.user_id.as_str()),
            },
            "message": {
                "id": message.external_message_id,
                "text": message.text,
            },
        });
        if let Some(chat_id) = &message.chat_id {
            entry["chat"] = json!({"id": chat_id});
        }
        if let Some(file_url) = &message.file_url {
            entry["message"]["files"] = json!([{"url": file_url}]);
        }

        let result = self
            .call(
                credential,
                "imconnector.send.messages",
                json!({
                    "CONNECTOR": self.connector_code,
                    "LINE": line.0,
                    "MESSAGES": [entry],
                }),
            )
            .await?;

        Ok(CrmSendAck { chat_id: extract_chat_id(&result) })
    }

    /// Subscribe the relay's webhook endpoint to a CRM event.
    pub async fn bind_event_webhook(
        &self,
        credential: Credential,
        event: &str,
        handler_url: &str,
    ) -> Result<(), CrmApiError> {
        self.call(credential, "event.bind", json!({"event": event, "handler": handler_url}))
            .await
            .map(|_| ())
    }

    pub async fn unbind_event_webhook(
        &self,
        credential: Credential,
        event: &str,
        handler_url: &str,
    ) -> Result<(), CrmApiError> {
        self.call(credential, "event.unbind", json!({"event": event, "handler": handler_url}))
            .await
            .map(|_| ())
    }

    /// Refresh-then-call, retrying exactly once on an auth rejection.
    async fn call(
        &self,
        credential: Credential,
        method: &str,
        params: Value,
    ) -> Result<Value, CrmApiError> {
        // Proceed with the best available token even when the refresh failed;
        // the CRM's own rejection below drives the forced retry.
        let credential = self.refresher.ensure_fresh(credential).await.into_credential();

        match self
            .transport
            .call(&credential.portal_url, &credential.access_token, method, params.clone())
            .await
        {
            Ok(result) => Ok(result),
            Err(CrmApiError::AuthExpired) => {
                warn!(
                    event_name = "crm.client.auth_retry",
                    method,
                    portal = %credential.portal_url,
                    "token rejected; refreshing and retrying once"
                );
                let credential = self.refresher.force_refresh(credential).await.into_credential();
                self.transport
                    .call(&credential.portal_url, &credential.access_token, method, params)
                    .await
            }
            Err(error) => Err(error),
        }
    }
}

fn extract_chat_id(result: &Value) -> Option<String> {
    result
        .pointer("/DATA/RESULT/0/session/CHAT_ID")
        .or_else(|| result.get("chat_id"))
        .and_then(|value| match value {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use waline_core::{Credential, CredentialId, LineId, TenantId};
    use waline_db::repositories::{CredentialRepository, RepositoryError};

    use super::{CrmApiError, CrmClient, CrmSendMessage, CrmTransport};
    use crate::tokens::{TokenEndpoint, TokenError, TokenGrant, TokenRefresher};

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<Value, CrmApiError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Value, CrmApiError>>) -> Self {
            Self { responses: Mutex::new(responses.into()), calls: Mutex::new(Vec::new()) }
        }

        async fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl CrmTransport for ScriptedTransport {
        async fn call(
            &self,
            _portal_url: &str,
            access_token: &str,
            method: &str,
            _params: Value,
        ) -> Result<Value, CrmApiError> {
            self.calls.lock().await.push((method.to_string(), access_token.to_string()));
            self.responses.lock().await.pop_front().unwrap_or(Ok(Value::Null))
        }
    }

    struct StaticEndpoint;

    #[async_trait]
    impl TokenEndpoint for StaticEndpoint {
        async fn exchange_code(
            &self,
            _portal_url: &str,
            _code: &str,
            _redirect_uri: &str,
        ) -> Result<TokenGrant, TokenError> {
            self.exchange_refresh("", "").await
        }

        async fn exchange_refresh(
            &self,
            _portal_url: &str,
            _refresh_token: &str,
        ) -> Result<TokenGrant, TokenError> {
            Ok(TokenGrant {
                access_token: "refreshed-access".to_string(),
                refresh_token: Some("refreshed-refresh".to_string()),
                expires_in: Some(3600),
                scope: None,
            })
        }
    }

    struct NullCredentials;

    #[async_trait]
    impl CredentialRepository for NullCredentials {
        async fn find_active(
            &self,
            _tenant_id: &TenantId,
            _portal_url: &str,
        ) -> Result<Option<Credential>, RepositoryError> {
            Ok(None)
        }

        async fn find_active_for_tenant(
            &self,
            _tenant_id: &TenantId,
        ) -> Result<Option<Credential>, RepositoryError> {
            Ok(None)
        }

        async fn list_active(&self) -> Result<Vec<Credential>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn store_grant(&self, _credential: Credential) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn update_tokens(
            &self,
            _id: &CredentialId,
            _access_token: &str,
            _refresh_token: Option<&str>,
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn deactivate(&self, _id: &CredentialId) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    fn fresh_credential() -> Credential {
        let now = Utc::now();
        Credential {
            id: CredentialId("CRED-1".to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            portal_url: "https://portal.example.test".to_string(),
            access_token: "current-access".to_string(),
            refresh_token: Some("current-refresh".to_string()),
            expires_at: Some(now + Duration::hours(1)),
            scope: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> CrmClient {
        let refresher =
            Arc::new(TokenRefresher::new(Arc::new(StaticEndpoint), Arc::new(NullCredentials)));
        CrmClient::new(transport, refresher, "waline_connector".to_string())
    }

    #[tokio::test]
    async fn send_message_extracts_the_chat_id() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!({
            "DATA": {"RESULT": [{"session": {"CHAT_ID": 42}}]}
        }))]));
        let client = client(transport.clone());

        let ack = client
            .send_message_to_line(
                fresh_credential(),
                &LineId("7".to_string()),
                &CrmSendMessage {
                    user_id: "+5511999999999".to_string(),
                    user_name: Some("Maria".to_string()),
                    chat_id: None,
                    external_message_id: Some("wamsg-1".to_string()),
                    text: "hello".to_string(),
                    file_url: None,
                },
            )
            .await
            .expect("send");

        assert_eq!(ack.chat_id.as_deref(), Some("42"));
        let calls = transport.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "imconnector.send.messages");
    }

    #[tokio::test]
    async fn auth_rejection_triggers_refresh_then_one_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(CrmApiError::AuthExpired),
            Ok(json!({"registered": true})),
        ]));
        let client = client(transport.clone());

        client
            .register_connector(fresh_credential(), "Waline Relay")
            .await
            .expect("register succeeds after retry");

        let calls = transport.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "current-access");
        assert_eq!(calls[1].1, "refreshed-access", "retry must use the refreshed token");
    }

    #[tokio::test]
    async fn auth_rejection_on_the_retry_is_surfaced() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(CrmApiError::AuthExpired),
            Err(CrmApiError::AuthExpired),
        ]));
        let client = client(transport.clone());

        let error = client
            .register_connector(fresh_credential(), "Waline Relay")
            .await
            .expect_err("second rejection surfaces");

        assert_eq!(error, CrmApiError::AuthExpired);
        assert_eq!(transport.calls().await.len(), 2, "exactly one retry");
    }

    #[tokio::test]
    async fn structured_api_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(CrmApiError::Api {
            code: "ERROR_METHOD_NOT_FOUND".to_string(),
            description: "unknown method".to_string(),
        })]));
        let client = client(transport.clone());

        let error = client.list_lines(fresh_credential()).await.expect_err("must fail");
        assert!(matches!(error, CrmApiError::Api { .. }));
        assert!(!error.is_transient());
        assert_eq!(transport.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn line_listing_decodes_numeric_and_string_ids() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!([
            {"ID": 7, "NAME": "Support"},
            {"ID": "12", "NAME": "Sales"},
        ]))]));
        let client = client(transport.clone());

        let lines = client.list_lines(fresh_credential()).await.expect("list");
        assert_eq!(lines, vec![LineId("7".to_string()), LineId("12".to_string())]);
    }
}
