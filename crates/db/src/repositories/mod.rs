use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use waline_core::{
    Binding, Contact, ContactId, Conversation, ConversationId, Credential, CredentialId,
    Instance, InstanceId, InstanceStatus, LineId, Message, MessageId, MessageStatus, TenantId,
};

pub mod binding;
pub mod contact;
pub mod conversation;
pub mod credential;
pub mod instance;
pub mod message;
pub mod webhook_log;

pub use binding::SqlBindingRepository;
pub use contact::SqlContactRepository;
pub use conversation::SqlConversationRepository;
pub use credential::SqlCredentialRepository;
pub use instance::SqlInstanceRepository;
pub use message::{InsertOutcome, SqlMessageRepository};
pub use webhook_log::{SqlWebhookLogRepository, WebhookLogEntry};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn find_active(
        &self,
        tenant_id: &TenantId,
        portal_url: &str,
    ) -> Result<Option<Credential>, RepositoryError>;

    /// The tenant's current CRM credential, regardless of portal. Relays use
    /// this; the portal-scoped lookup serves the OAuth callback path.
    async fn find_active_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Credential>, RepositoryError>;

    async fn list_active(&self) -> Result<Vec<Credential>, RepositoryError>;

    /// Store a fresh grant, deactivating any prior active credential for the
    /// same (tenant, portal) first.
    async fn store_grant(&self, credential: Credential) -> Result<(), RepositoryError>;

    /// Overwrite the token fields after a refresh (last write wins).
    async fn update_tokens(
        &self,
        id: &CredentialId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;

    async fn deactivate(&self, id: &CredentialId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: Instance) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &InstanceId) -> Result<Option<Instance>, RepositoryError>;
    async fn find_by_label(&self, label: &str) -> Result<Option<Instance>, RepositoryError>;

    /// Instances in one lifecycle state; bootstrap uses this to resume
    /// pairing pollers after a restart.
    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<Instance>, RepositoryError>;

    /// Persist the session fields mutated by the state machine
    /// (status, qr_code, last_seen_at, updated_at).
    async fn update_session(&self, instance: &Instance) -> Result<(), RepositoryError>;

    async fn delete(&self, id: &InstanceId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait BindingRepository: Send + Sync {
    /// Bind a line to an instance, overwriting any prior mapping on either
    /// side (1:1 in both directions).
    async fn bind(
        &self,
        tenant_id: &TenantId,
        line_id: &LineId,
        instance_id: &InstanceId,
    ) -> Result<Binding, RepositoryError>;

    async fn find_by_instance(
        &self,
        tenant_id: &TenantId,
        instance_id: &InstanceId,
    ) -> Result<Option<Binding>, RepositoryError>;

    async fn find_by_line(
        &self,
        tenant_id: &TenantId,
        line_id: &LineId,
    ) -> Result<Option<Binding>, RepositoryError>;

    async fn unbind_line(
        &self,
        tenant_id: &TenantId,
        line_id: &LineId,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// Resolve the contact for (tenant, phone), creating it lazily on first
    /// inbound message. Race-safe: concurrent calls converge on one row.
    async fn find_or_create(
        &self,
        tenant_id: &TenantId,
        phone: &str,
        display_name: Option<&str>,
    ) -> Result<Contact, RepositoryError>;

    async fn find_by_id(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Return the open conversation for the triple, creating one if none is
    /// open. Backed by the partial unique index, so concurrent callers
    /// converge on a single open row.
    async fn open_or_get(
        &self,
        tenant_id: &TenantId,
        instance_id: &InstanceId,
        contact_id: &ContactId,
    ) -> Result<Conversation, RepositoryError>;

    async fn find_open_by_crm_chat(
        &self,
        tenant_id: &TenantId,
        crm_chat_id: &str,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Adopt the CRM chat identifier once the first forward succeeds.
    async fn set_crm_chat_id(
        &self,
        id: &ConversationId,
        crm_chat_id: &str,
    ) -> Result<(), RepositoryError>;

    async fn close(&self, id: &ConversationId) -> Result<(), RepositoryError>;

    async fn assign_agent(
        &self,
        id: &ConversationId,
        agent_id: &str,
    ) -> Result<(), RepositoryError>;

    async fn touch_activity(&self, id: &ConversationId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert-or-detect-conflict on the external-id unique indexes; the
    /// idempotency guard of both relay directions.
    async fn insert(&self, message: Message) -> Result<InsertOutcome, RepositoryError>;

    async fn update_delivery_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), RepositoryError>;

    async fn find_by_wa_id(
        &self,
        wa_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError>;

    async fn find_by_crm_id(
        &self,
        crm_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError>;
}

#[async_trait]
pub trait WebhookLogRepository: Send + Sync {
    async fn append(&self, entry: WebhookLogEntry) -> Result<(), RepositoryError>;
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("bad timestamp `{raw}`: {error}")))
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|value| parse_timestamp(&value)).transpose()
}
