//! CRM → WA relay direction.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use waline_core::domain::prefixed_id;
use waline_core::payload::decode_body;
use waline_core::{
    Message, MessageDirection, MessageId, MessageStatus, RelayError, RetryPolicy, TenantId,
};
use waline_crm::events::{decode_crm_event, CrmEvent, CrmOutboundMessage};
use waline_db::repositories::{
    BindingRepository, ContactRepository, ConversationRepository, InsertOutcome,
    InstanceRepository, MessageRepository, WebhookLogEntry, WebhookLogRepository,
};

use crate::gateways::WaGateway;
use crate::resolver::ConversationResolver;
use crate::retry::run_with_retry;

/// Outcome of one CRM event webhook; always acknowledged with HTTP success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundOutcome {
    Sent { message_id: MessageId },
    Persisted { message_id: MessageId },
    SessionUpdated,
    Duplicate,
    Dropped { reason: &'static str },
}

pub struct OutboundRelay {
    instances: Arc<dyn InstanceRepository>,
    bindings: Arc<dyn BindingRepository>,
    contacts: Arc<dyn ContactRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    webhook_log: Arc<dyn WebhookLogRepository>,
    resolver: ConversationResolver,
    wa: Arc<dyn WaGateway>,
    retry: RetryPolicy,
}

impl OutboundRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        bindings: Arc<dyn BindingRepository>,
        contacts: Arc<dyn ContactRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        webhook_log: Arc<dyn WebhookLogRepository>,
        resolver: ConversationResolver,
        wa: Arc<dyn WaGateway>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            instances,
            bindings,
            contacts,
            conversations,
            messages,
            webhook_log,
            resolver,
            wa,
            retry,
        }
    }

    /// Ingest one CRM event webhook for a tenant. The tenant comes from the
    /// per-tenant handler URL the event webhook was bound with.
    pub async fn handle(
        &self,
        tenant_id: &TenantId,
        raw_body: &[u8],
        content_type: Option<&str>,
    ) -> Result<OutboundOutcome, RelayError> {
        let payload_text = String::from_utf8_lossy(raw_body).into_owned();

        let value = match decode_body(content_type, raw_body) {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    event_name = "relay.outbound.unparsable_payload",
                    tenant_id = %tenant_id,
                    error = %error,
                    "dropping undecodable crm webhook body"
                );
                self.log(tenant_id, "unparsable", &payload_text, "dropped").await?;
                return Ok(OutboundOutcome::Dropped { reason: "unparsable_payload" });
            }
        };

        let event = match decode_crm_event(&value) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    event_name = "relay.outbound.malformed_event",
                    tenant_id = %tenant_id,
                    error = %error,
                    "dropping malformed crm event"
                );
                self.log(tenant_id, "malformed", &payload_text, "dropped").await?;
                return Ok(OutboundOutcome::Dropped { reason: "malformed_event" });
            }
        };

        match event {
            CrmEvent::SessionFinish { chat_id } => {
                match self.resolver.resolve_outbound(tenant_id, &chat_id).await {
                    Ok(conversation) => {
                        self.conversations
                            .close(&conversation.id)
                            .await
                            .map_err(|error| RelayError::Persistence(error.to_string()))?;
                        info!(
                            event_name = "relay.outbound.session_closed",
                            tenant_id = %tenant_id,
                            conversation_id = %conversation.id,
                            "conversation closed on crm session finish"
                        );
                        self.log(tenant_id, "session.finish", &payload_text, "processed").await?;
                        Ok(OutboundOutcome::SessionUpdated)
                    }
                    Err(RelayError::NotFound { .. }) => {
                        self.drop_unresolved(tenant_id, "session.finish", &payload_text, &chat_id)
                            .await
                    }
                    Err(error) => Err(error),
                }
            }
            CrmEvent::SessionTransfer { chat_id, agent_id } => {
                match self.resolver.resolve_outbound(tenant_id, &chat_id).await {
                    Ok(conversation) => {
                        self.conversations
                            .assign_agent(&conversation.id, &agent_id)
                            .await
                            .map_err(|error| RelayError::Persistence(error.to_string()))?;
                        info!(
                            event_name = "relay.outbound.session_transferred",
                            tenant_id = %tenant_id,
                            conversation_id = %conversation.id,
                            agent_id = %agent_id,
                            "conversation reassigned on crm transfer"
                        );
                        self.log(tenant_id, "session.transfer", &payload_text, "processed")
                            .await?;
                        Ok(OutboundOutcome::SessionUpdated)
                    }
                    Err(RelayError::NotFound { .. }) => {
                        self.drop_unresolved(
                            tenant_id,
                            "session.transfer",
                            &payload_text,
                            &chat_id,
                        )
                        .await
                    }
                    Err(error) => Err(error),
                }
            }
            CrmEvent::MessageAdd(message) => {
                self.relay_message(tenant_id, message, &payload_text).await
            }
            CrmEvent::Unsupported { event } => {
                info!(
                    event_name = "relay.outbound.unsupported_event",
                    tenant_id = %tenant_id,
                    event = %event,
                    "crm event acknowledged and ignored"
                );
                self.log(tenant_id, &event, &payload_text, "dropped").await?;
                Ok(OutboundOutcome::Dropped { reason: "unsupported_event" })
            }
        }
    }

    async fn relay_message(
        &self,
        tenant_id: &TenantId,
        outbound: CrmOutboundMessage,
        payload_text: &str,
    ) -> Result<OutboundOutcome, RelayError> {
        let conversation = match self.resolver.resolve_outbound(tenant_id, &outbound.chat_id).await
        {
            Ok(conversation) => conversation,
            Err(RelayError::NotFound { .. }) => {
                return self
                    .drop_unresolved(tenant_id, "message.add", payload_text, &outbound.chat_id)
                    .await;
            }
            Err(error) => return Err(error),
        };

        let contact = self
            .contacts
            .find_by_id(&conversation.contact_id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?
            .ok_or_else(|| RelayError::NotFound {
                entity: "contact",
                key: conversation.contact_id.0.clone(),
            })?;

        // Echo filter: the CRM re-emits relayed inbound messages as events
        // authored by the contact itself, and emits system notices for
        // session bookkeeping. Only agent-authored messages go out.
        if outbound.system || outbound.author_id.as_deref() == Some(contact.phone.as_str()) {
            self.log(tenant_id, "message.add", payload_text, "dropped").await?;
            return Ok(OutboundOutcome::Dropped { reason: "echo" });
        }

        let instance = self
            .instances
            .find_by_id(&conversation.instance_id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?
            .ok_or_else(|| RelayError::NotFound {
                entity: "instance",
                key: conversation.instance_id.0.clone(),
            })?;

        // Persist before sending; a crash mid-send leaves the row in the
        // resumable "stored, not yet forwarded" state.
        let now = Utc::now();
        let message = Message {
            id: MessageId(prefixed_id("MSG")),
            conversation_id: conversation.id.clone(),
            direction: MessageDirection::Outbound,
            body: outbound.text.clone(),
            media_url: outbound.file_url.clone(),
            wa_message_id: None,
            crm_message_id: outbound.message_id.clone(),
            delivery_status: MessageStatus::Failed,
            created_at: now,
            updated_at: now,
        };
        let message_id = message.id.clone();

        let inserted = self
            .messages
            .insert(message)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?;
        if inserted == InsertOutcome::Duplicate {
            info!(
                event_name = "relay.outbound.duplicate",
                tenant_id = %tenant_id,
                crm_message_id = outbound.message_id.as_deref().unwrap_or("none"),
                "redelivered crm message acknowledged without reprocessing"
            );
            self.log(tenant_id, "message.add", payload_text, "duplicate").await?;
            return Ok(OutboundOutcome::Duplicate);
        }

        let binding = self
            .bindings
            .find_by_instance(tenant_id, &instance.id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?;
        if binding.is_none() {
            warn!(
                event_name = "relay.outbound.no_binding",
                tenant_id = %tenant_id,
                instance = %instance.label,
                message_id = %message_id,
                "instance has no line binding; message stored but not forwarded"
            );
            self.log(tenant_id, "message.add", payload_text, "partial").await?;
            return Ok(OutboundOutcome::Persisted { message_id });
        }

        let number = contact.phone.trim_start_matches('+').to_string();
        let wa = self.wa.as_ref();
        let result = run_with_retry(&self.retry, "wa.send_text", || {
            wa.send_text(&instance.label, &number, &outbound.text)
        })
        .await;

        match result {
            Ok(_ack) => {
                self.messages
                    .update_delivery_status(&message_id, MessageStatus::Sent)
                    .await
                    .map_err(|error| RelayError::Persistence(error.to_string()))?;
                self.conversations
                    .touch_activity(&conversation.id)
                    .await
                    .map_err(|error| RelayError::Persistence(error.to_string()))?;
                info!(
                    event_name = "relay.outbound.forwarded",
                    tenant_id = %tenant_id,
                    instance = %instance.label,
                    message_id = %message_id,
                    "agent message delivered to provider"
                );
                self.log(tenant_id, "message.add", payload_text, "processed").await?;
                Ok(OutboundOutcome::Sent { message_id })
            }
            Err(error) => {
                // The row already carries the failed status; keep it so the
                // stored history matches the CRM thread.
                warn!(
                    event_name = "relay.outbound.forward_failed",
                    tenant_id = %tenant_id,
                    message_id = %message_id,
                    error_class = error.class(),
                    error = %error,
                    "provider send failed after retries"
                );
                self.log(tenant_id, "message.add", payload_text, "failed").await?;
                Ok(OutboundOutcome::Persisted { message_id })
            }
        }
    }

    async fn drop_unresolved(
        &self,
        tenant_id: &TenantId,
        event_kind: &str,
        payload_text: &str,
        chat_id: &str,
    ) -> Result<OutboundOutcome, RelayError> {
        info!(
            event_name = "relay.outbound.unknown_conversation",
            tenant_id = %tenant_id,
            chat_id = %chat_id,
            "crm event for unknown conversation acknowledged and dropped"
        );
        self.log(tenant_id, event_kind, payload_text, "dropped").await?;
        Ok(OutboundOutcome::Dropped { reason: "unknown_conversation" })
    }

    async fn log(
        &self,
        tenant_id: &TenantId,
        event_kind: &str,
        payload: &str,
        outcome: &'static str,
    ) -> Result<(), RelayError> {
        // CRM deliveries authenticate through the per-tenant handler URL,
        // not an HMAC header; the verdict column reflects that.
        self.webhook_log
            .append(WebhookLogEntry {
                tenant_id: Some(tenant_id.clone()),
                source: "crm",
                event_kind: event_kind.to_string(),
                payload: payload.to_string(),
                signature_verdict: "unsigned",
                outcome,
                received_at: Utc::now(),
            })
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))
    }
}
