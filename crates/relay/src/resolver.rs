use std::sync::Arc;

use waline_core::domain::contact::normalize_phone;
use waline_core::{Contact, Conversation, Instance, RelayError, TenantId};
use waline_db::repositories::{ContactRepository, ConversationRepository};

/// Resolves webhook identities to contact + conversation rows, creating both
/// lazily on the inbound path.
pub struct ConversationResolver {
    contacts: Arc<dyn ContactRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

impl ConversationResolver {
    pub fn new(
        contacts: Arc<dyn ContactRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self { contacts, conversations }
    }

    /// Inbound path: sender JID → contact → open conversation.
    pub async fn resolve_inbound(
        &self,
        instance: &Instance,
        sender_jid: &str,
        push_name: Option<&str>,
    ) -> Result<(Contact, Conversation), RelayError> {
        let phone = normalize_phone(sender_jid).ok_or_else(|| {
            RelayError::UnparsablePayload(format!("sender `{sender_jid}` is not a phone identity"))
        })?;

        let contact = self
            .contacts
            .find_or_create(&instance.tenant_id, &phone, push_name)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?;

        let conversation = self
            .conversations
            .open_or_get(&instance.tenant_id, &instance.id, &contact.id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?;

        Ok((contact, conversation))
    }

    /// Outbound path: CRM chat id → the open conversation it belongs to.
    pub async fn resolve_outbound(
        &self,
        tenant_id: &TenantId,
        crm_chat_id: &str,
    ) -> Result<Conversation, RelayError> {
        self.conversations
            .find_open_by_crm_chat(tenant_id, crm_chat_id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?
            .ok_or_else(|| RelayError::NotFound {
                entity: "conversation",
                key: crm_chat_id.to_string(),
            })
    }
}
