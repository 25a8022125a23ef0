//! Narrow gateway traits the relays depend on, with adapters over the typed
//! platform clients. Tests inject scripted implementations; production wires
//! the adapters in the server bootstrap.

use std::sync::Arc;

use async_trait::async_trait;

use waline_core::{LineId, RelayError, TenantId};
use waline_crm::{CrmApiError, CrmClient, CrmSendAck, CrmSendMessage};
use waline_db::repositories::CredentialRepository;
use waline_wa::events::ConnectionSignal;
use waline_wa::{WaApiError, WaClient, WaSendAck};

#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn send_message_to_line(
        &self,
        tenant_id: &TenantId,
        line: &LineId,
        message: &CrmSendMessage,
    ) -> Result<CrmSendAck, RelayError>;
}

#[async_trait]
pub trait WaGateway: Send + Sync {
    async fn send_text(
        &self,
        instance_label: &str,
        number: &str,
        text: &str,
    ) -> Result<WaSendAck, RelayError>;

    async fn instance_status(&self, instance_label: &str) -> Result<ConnectionSignal, RelayError>;

    async fn fetch_qr(&self, instance_label: &str) -> Result<Option<String>, RelayError>;
}

pub struct CrmClientGateway {
    client: Arc<CrmClient>,
    credentials: Arc<dyn CredentialRepository>,
}

impl CrmClientGateway {
    pub fn new(client: Arc<CrmClient>, credentials: Arc<dyn CredentialRepository>) -> Self {
        Self { client, credentials }
    }
}

#[async_trait]
impl CrmGateway for CrmClientGateway {
    async fn send_message_to_line(
        &self,
        tenant_id: &TenantId,
        line: &LineId,
        message: &CrmSendMessage,
    ) -> Result<CrmSendAck, RelayError> {
        let credential = self
            .credentials
            .find_active_for_tenant(tenant_id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?
            .ok_or_else(|| RelayError::NotFound {
                entity: "credential",
                key: tenant_id.0.clone(),
            })?;
        let portal = credential.portal_url.clone();

        self.client
            .send_message_to_line(credential, line, message)
            .await
            .map_err(|error| crm_error_to_relay(error, &portal))
    }
}

pub struct WaClientGateway {
    client: Arc<WaClient>,
}

impl WaClientGateway {
    pub fn new(client: Arc<WaClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WaGateway for WaClientGateway {
    async fn send_text(
        &self,
        instance_label: &str,
        number: &str,
        text: &str,
    ) -> Result<WaSendAck, RelayError> {
        self.client.send_text(instance_label, number, text).await.map_err(wa_error_to_relay)
    }

    async fn instance_status(&self, instance_label: &str) -> Result<ConnectionSignal, RelayError> {
        self.client.instance_status(instance_label).await.map_err(wa_error_to_relay)
    }

    async fn fetch_qr(&self, instance_label: &str) -> Result<Option<String>, RelayError> {
        self.client.fetch_qr(instance_label).await.map_err(wa_error_to_relay)
    }
}

fn crm_error_to_relay(error: CrmApiError, portal: &str) -> RelayError {
    let transient = error.is_transient();
    match error {
        CrmApiError::Transport(detail) => RelayError::Transport(detail),
        CrmApiError::AuthExpired => RelayError::AuthExpired { portal: portal.to_string() },
        CrmApiError::Api { code, description } => {
            RelayError::RemoteApi { code, message: description, transient }
        }
        CrmApiError::MalformedResponse(detail) => RelayError::RemoteApi {
            code: "malformed_response".to_string(),
            message: detail,
            transient: false,
        },
    }
}

fn wa_error_to_relay(error: WaApiError) -> RelayError {
    let transient = error.is_transient();
    match error {
        WaApiError::Transport(detail) => RelayError::Transport(detail),
        WaApiError::Api { status, detail } => {
            RelayError::RemoteApi { code: status.to_string(), message: detail, transient }
        }
        WaApiError::CandidatesExhausted { operation } => RelayError::RemoteApi {
            code: "candidates_exhausted".to_string(),
            message: format!("no accepted endpoint shape for `{operation}`"),
            transient: false,
        },
        WaApiError::MalformedResponse(detail) => RelayError::RemoteApi {
            code: "malformed_response".to_string(),
            message: detail,
            transient: false,
        },
    }
}
