//! WA → CRM relay direction.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use waline_core::domain::prefixed_id;
use waline_core::payload::decode_body;
use waline_core::{
    Instance, Message, MessageDirection, MessageId, MessageStatus, RelayError, RetryPolicy,
    SessionSignal, TenantId,
};
use waline_crm::CrmSendMessage;
use waline_db::repositories::{
    BindingRepository, ConversationRepository, InsertOutcome, InstanceRepository,
    MessageRepository, WebhookLogEntry, WebhookLogRepository,
};
use waline_wa::events::{decode_wa_event, ConnectionSignal, WaEvent, WaInboundMessage};
use waline_wa::signature::{verify, SignatureVerdict};

use crate::gateways::CrmGateway;
use crate::poller::apply_session_signal;
use crate::registry::InstanceRegistry;
use crate::resolver::ConversationResolver;
use crate::retry::run_with_retry;

/// Outcome of one inbound webhook. Everything except `Rejected` is
/// acknowledged with HTTP success so the provider never redelivers into
/// duplicated state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    Processed { message_id: MessageId, forwarded: bool },
    Duplicate,
    SessionUpdated,
    Dropped { reason: &'static str },
    Rejected,
}

pub struct InboundRelay {
    instances: Arc<dyn InstanceRepository>,
    bindings: Arc<dyn BindingRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    webhook_log: Arc<dyn WebhookLogRepository>,
    resolver: ConversationResolver,
    crm: Arc<dyn CrmGateway>,
    registry: Arc<InstanceRegistry>,
    retry: RetryPolicy,
    default_webhook_secret: Option<String>,
}

impl InboundRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        bindings: Arc<dyn BindingRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        webhook_log: Arc<dyn WebhookLogRepository>,
        resolver: ConversationResolver,
        crm: Arc<dyn CrmGateway>,
        registry: Arc<InstanceRegistry>,
        retry: RetryPolicy,
        default_webhook_secret: Option<String>,
    ) -> Self {
        Self {
            instances,
            bindings,
            conversations,
            messages,
            webhook_log,
            resolver,
            crm,
            registry,
            retry,
            default_webhook_secret,
        }
    }

    /// Ingest one WA webhook delivery. Only persistence failures are errors;
    /// every relay-level outcome is a value so the HTTP layer can always
    /// acknowledge authenticated payloads.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        content_type: Option<&str>,
        signature_header: Option<&str>,
    ) -> Result<InboundOutcome, RelayError> {
        let payload_text = String::from_utf8_lossy(raw_body).into_owned();

        let value = match decode_body(content_type, raw_body) {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    event_name = "relay.inbound.unparsable_payload",
                    error = %error,
                    "dropping undecodable webhook body"
                );
                self.log(None, "unparsable", &payload_text, "unsigned", "dropped").await?;
                return Ok(InboundOutcome::Dropped { reason: "unparsable_payload" });
            }
        };

        let event = match decode_wa_event(&value) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    event_name = "relay.inbound.malformed_event",
                    error = %error,
                    "dropping malformed provider event"
                );
                self.log(None, "malformed", &payload_text, "unsigned", "dropped").await?;
                return Ok(InboundOutcome::Dropped { reason: "malformed_event" });
            }
        };

        let label = match &event {
            WaEvent::MessageReceived(message) => &message.instance,
            WaEvent::ConnectionUpdate { instance, .. } => instance,
            WaEvent::QrUpdated { instance, .. } => instance,
            WaEvent::Unsupported { .. } => {
                self.log(None, event.kind(), &payload_text, "unsigned", "dropped").await?;
                return Ok(InboundOutcome::Dropped { reason: "unsupported_event" });
            }
        };

        let Some(instance) = self
            .instances
            .find_by_label(label)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?
        else {
            // No tenant context, nothing to do: an anomaly, not an error.
            info!(
                event_name = "relay.inbound.unknown_instance",
                instance = %label,
                "webhook for unknown instance acknowledged and dropped"
            );
            self.log(None, event.kind(), &payload_text, "unsigned", "dropped").await?;
            return Ok(InboundOutcome::Dropped { reason: "unknown_instance" });
        };

        let secret = instance
            .webhook_secret
            .as_deref()
            .or(self.default_webhook_secret.as_deref());
        let verdict = verify(raw_body, signature_header, secret);
        if !verdict.accepted() {
            warn!(
                event_name = "relay.inbound.signature_rejected",
                tenant_id = %instance.tenant_id,
                instance = %instance.label,
                "webhook signature mismatch"
            );
            self.log(
                Some(instance.tenant_id.clone()),
                event.kind(),
                &payload_text,
                verdict.as_str(),
                "rejected",
            )
            .await?;
            return Ok(InboundOutcome::Rejected);
        }
        if verdict == SignatureVerdict::Unsigned {
            info!(
                event_name = "relay.inbound.unsecured_webhook",
                tenant_id = %instance.tenant_id,
                instance = %instance.label,
                "no webhook secret configured; accepting unsigned payload"
            );
        }

        match event {
            WaEvent::ConnectionUpdate { state, .. } => {
                let signal = match state {
                    ConnectionSignal::Open => Some(SessionSignal::ProviderOpen),
                    ConnectionSignal::Close => Some(SessionSignal::ProviderClosed),
                    ConnectionSignal::Connecting => None,
                };
                if let Some(signal) = signal {
                    self.dispatch_session_signal(&instance, signal).await?;
                }
                self.log(
                    Some(instance.tenant_id.clone()),
                    "connection.update",
                    &payload_text,
                    verdict.as_str(),
                    "processed",
                )
                .await?;
                Ok(InboundOutcome::SessionUpdated)
            }
            WaEvent::QrUpdated { qr_code, .. } => {
                self.dispatch_session_signal(&instance, SessionSignal::QrIssued { qr_code })
                    .await?;
                self.log(
                    Some(instance.tenant_id.clone()),
                    "qrcode.updated",
                    &payload_text,
                    verdict.as_str(),
                    "processed",
                )
                .await?;
                Ok(InboundOutcome::SessionUpdated)
            }
            WaEvent::MessageReceived(message) => {
                self.relay_message(instance, message, &payload_text, verdict.as_str()).await
            }
            // Already answered before instance resolution.
            WaEvent::Unsupported { .. } => {
                Ok(InboundOutcome::Dropped { reason: "unsupported_event" })
            }
        }
    }

    async fn relay_message(
        &self,
        instance: Instance,
        inbound: WaInboundMessage,
        payload_text: &str,
        verdict: &'static str,
    ) -> Result<InboundOutcome, RelayError> {
        if inbound.from_me {
            self.log(
                Some(instance.tenant_id.clone()),
                "messages.upsert",
                payload_text,
                verdict,
                "dropped",
            )
            .await?;
            return Ok(InboundOutcome::Dropped { reason: "own_echo" });
        }

        let resolved = self
            .resolver
            .resolve_inbound(&instance, &inbound.sender_jid, inbound.push_name.as_deref())
            .await;
        let (contact, conversation) = match resolved {
            Ok(pair) => pair,
            Err(RelayError::UnparsablePayload(detail)) => {
                // Group and broadcast JIDs are not phone identities.
                info!(
                    event_name = "relay.inbound.unresolvable_sender",
                    tenant_id = %instance.tenant_id,
                    detail = %detail,
                    "sender cannot be resolved to a contact; dropping"
                );
                self.log(
                    Some(instance.tenant_id.clone()),
                    "messages.upsert",
                    payload_text,
                    verdict,
                    "dropped",
                )
                .await?;
                return Ok(InboundOutcome::Dropped { reason: "unresolvable_sender" });
            }
            Err(error) => return Err(error),
        };

        let now = Utc::now();
        let message = Message {
            id: MessageId(prefixed_id("MSG")),
            conversation_id: conversation.id.clone(),
            direction: MessageDirection::Inbound,
            body: inbound.text.clone(),
            media_url: inbound.media_url.clone(),
            wa_message_id: inbound.message_id.clone(),
            crm_message_id: None,
            delivery_status: MessageStatus::Received,
            created_at: now,
            updated_at: now,
        };
        let message_id = message.id.clone();

        let outcome = self
            .messages
            .insert(message)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?;
        if outcome == InsertOutcome::Duplicate {
            info!(
                event_name = "relay.inbound.duplicate",
                tenant_id = %instance.tenant_id,
                wa_message_id = inbound.message_id.as_deref().unwrap_or("none"),
                "redelivered message acknowledged without reprocessing"
            );
            self.log(
                Some(instance.tenant_id.clone()),
                "messages.upsert",
                payload_text,
                verdict,
                "duplicate",
            )
            .await?;
            return Ok(InboundOutcome::Duplicate);
        }

        let binding = self
            .bindings
            .find_by_instance(&instance.tenant_id, &instance.id)
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))?;
        let Some(binding) = binding else {
            warn!(
                event_name = "relay.inbound.no_binding",
                tenant_id = %instance.tenant_id,
                instance = %instance.label,
                "no line bound to instance; message stored but not forwarded"
            );
            self.messages
                .update_delivery_status(&message_id, MessageStatus::Failed)
                .await
                .map_err(|error| RelayError::Persistence(error.to_string()))?;
            self.log(
                Some(instance.tenant_id.clone()),
                "messages.upsert",
                payload_text,
                verdict,
                "partial",
            )
            .await?;
            return Ok(InboundOutcome::Processed { message_id, forwarded: false });
        };

        let send = CrmSendMessage {
            user_id: contact.phone.clone(),
            user_name: contact.display_name.clone().or(inbound.push_name.clone()),
            chat_id: conversation.crm_chat_id.clone(),
            external_message_id: inbound.message_id.clone(),
            text: inbound.text.clone(),
            file_url: inbound.media_url.clone(),
        };

        let crm = self.crm.as_ref();
        let tenant = &instance.tenant_id;
        let line = &binding.line_id;
        let forward = run_with_retry(&self.retry, "crm.send_message", || {
            crm.send_message_to_line(tenant, line, &send)
        })
        .await;

        match forward {
            Ok(ack) => {
                if conversation.crm_chat_id.is_none() {
                    if let Some(chat_id) = &ack.chat_id {
                        self.conversations
                            .set_crm_chat_id(&conversation.id, chat_id)
                            .await
                            .map_err(|error| RelayError::Persistence(error.to_string()))?;
                    }
                }
                self.conversations
                    .touch_activity(&conversation.id)
                    .await
                    .map_err(|error| RelayError::Persistence(error.to_string()))?;
                info!(
                    event_name = "relay.inbound.forwarded",
                    tenant_id = %instance.tenant_id,
                    instance = %instance.label,
                    line_id = %binding.line_id,
                    message_id = %message_id,
                    "inbound message relayed into line"
                );
                self.log(
                    Some(instance.tenant_id.clone()),
                    "messages.upsert",
                    payload_text,
                    verdict,
                    "processed",
                )
                .await?;
                Ok(InboundOutcome::Processed { message_id, forwarded: true })
            }
            Err(error) => {
                // The inbound leg already succeeded; the forwarding failure
                // stays on the message row and must not trigger redelivery.
                warn!(
                    event_name = "relay.inbound.forward_failed",
                    tenant_id = %instance.tenant_id,
                    message_id = %message_id,
                    error_class = error.class(),
                    error = %error,
                    "relay into line failed after retries"
                );
                self.messages
                    .update_delivery_status(&message_id, MessageStatus::Failed)
                    .await
                    .map_err(|error| RelayError::Persistence(error.to_string()))?;
                self.log(
                    Some(instance.tenant_id.clone()),
                    "messages.upsert",
                    payload_text,
                    verdict,
                    "failed",
                )
                .await?;
                Ok(InboundOutcome::Processed { message_id, forwarded: false })
            }
        }
    }

    /// Feed a session signal to the live loop when one is registered, or
    /// apply it inline against the store otherwise.
    async fn dispatch_session_signal(
        &self,
        instance: &Instance,
        signal: SessionSignal,
    ) -> Result<(), RelayError> {
        if let Some(sender) = self.registry.signal_sender(&instance.tenant_id, &instance.id) {
            if sender.send(signal.clone()).await.is_ok() {
                return Ok(());
            }
        }
        apply_session_signal(self.instances.as_ref(), &instance.id, signal).await.map(|_effect| ())
    }

    async fn log(
        &self,
        tenant_id: Option<TenantId>,
        event_kind: &str,
        payload: &str,
        signature_verdict: &'static str,
        outcome: &'static str,
    ) -> Result<(), RelayError> {
        self.webhook_log
            .append(WebhookLogEntry {
                tenant_id,
                source: "wa",
                event_kind: event_kind.to_string(),
                payload: payload.to_string(),
                signature_verdict,
                outcome,
                received_at: Utc::now(),
            })
            .await
            .map_err(|error| RelayError::Persistence(error.to_string()))
    }
}
