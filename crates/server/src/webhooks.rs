//! HTTP surface of the relay: the two webhook directions.
//!
//! Response policy: once a payload is authenticated and durably logged the
//! handler answers 200 regardless of downstream forwarding outcome, so the
//! platforms' redelivery-on-non-2xx behavior cannot duplicate persisted
//! state. Only a signature mismatch earns a 403.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use tracing::error;

use waline_core::TenantId;
use waline_relay::{InboundOutcome, InboundRelay, OutboundOutcome, OutboundRelay};

#[derive(Clone)]
pub struct WebhookState {
    pub inbound: Arc<InboundRelay>,
    pub outbound: Arc<OutboundRelay>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/wa", post(wa_webhook))
        .route("/webhook/crm/{tenant_id}", post(crm_webhook))
        .with_state(state)
}

async fn wa_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookAck>) {
    let content_type =
        headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()).map(str::to_owned);
    let signature = headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-webhook-signature"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match state.inbound.handle(&body, content_type.as_deref(), signature.as_deref()).await {
        Ok(InboundOutcome::Rejected) => {
            (StatusCode::FORBIDDEN, Json(WebhookAck { status: "rejected" }))
        }
        Ok(outcome) => (StatusCode::OK, Json(WebhookAck { status: inbound_label(&outcome) })),
        Err(relay_error) => {
            error!(
                event_name = "server.webhook.wa_failed",
                error_class = relay_error.class(),
                error = %relay_error,
                "inbound webhook processing failed"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(WebhookAck { status: "error" }))
        }
    }
}

async fn crm_webhook(
    Path(tenant_id): Path<String>,
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookAck>) {
    let content_type =
        headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()).map(str::to_owned);
    let tenant = TenantId(tenant_id);

    match state.outbound.handle(&tenant, &body, content_type.as_deref()).await {
        Ok(outcome) => (StatusCode::OK, Json(WebhookAck { status: outbound_label(&outcome) })),
        Err(relay_error) => {
            error!(
                event_name = "server.webhook.crm_failed",
                tenant_id = %tenant,
                error_class = relay_error.class(),
                error = %relay_error,
                "crm webhook processing failed"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(WebhookAck { status: "error" }))
        }
    }
}

fn inbound_label(outcome: &InboundOutcome) -> &'static str {
    match outcome {
        InboundOutcome::Processed { forwarded: true, .. } => "processed",
        InboundOutcome::Processed { forwarded: false, .. } => "stored",
        InboundOutcome::Duplicate => "duplicate",
        InboundOutcome::SessionUpdated => "session_updated",
        InboundOutcome::Dropped { .. } => "ignored",
        InboundOutcome::Rejected => "rejected",
    }
}

fn outbound_label(outcome: &OutboundOutcome) -> &'static str {
    match outcome {
        OutboundOutcome::Sent { .. } => "sent",
        OutboundOutcome::Persisted { .. } => "stored",
        OutboundOutcome::SessionUpdated => "session_updated",
        OutboundOutcome::Duplicate => "duplicate",
        OutboundOutcome::Dropped { .. } => "ignored",
    }
}
