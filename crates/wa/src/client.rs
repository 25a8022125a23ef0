//! Typed client for the WA provider's REST surface.
//!
//! The provider's API is not stable across versions, so every operation is
//! an ordered list of endpoint candidates. The first accepted candidate is
//! cached per operation and reused; negotiation happens once per process,
//! not on every call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::ConnectionSignal;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WaApiError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider returned {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("no endpoint candidate for `{operation}` was accepted by the provider")]
    CandidatesExhausted { operation: &'static str },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl WaApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaOperation {
    CreateInstance,
    Connect,
    Status,
    FetchQr,
    SendText,
}

impl WaOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstance => "instance.create",
            Self::Connect => "instance.connect",
            Self::Status => "instance.status",
            Self::FetchQr => "instance.qr",
            Self::SendText => "message.send_text",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaHttpResponse {
    pub status: u16,
    pub body: Value,
}

/// Provider acceptance of a send; the id is the WA-side external message id
/// when the provider reports one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaSendAck {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait WaTransport: Send + Sync {
    /// Execute one HTTP exchange. Non-2xx responses are returned as values;
    /// only network-level failures are errors.
    async fn execute(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<WaHttpResponse, WaApiError>;
}

pub struct HttpWaTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpWaTransport {
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_key }
    }
}

#[async_trait]
impl WaTransport for HttpWaTransport {
    async fn execute(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<WaHttpResponse, WaApiError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
        };
        request = request.header("apikey", self.api_key.expose_secret());
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| WaApiError::Transport(error.to_string()))?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(WaHttpResponse { status, body })
    }
}

type Candidate = (HttpMethod, String, Option<Value>);

pub struct WaClient {
    transport: Arc<dyn WaTransport>,
    negotiated: Mutex<HashMap<WaOperation, usize>>,
}

impl WaClient {
    pub fn new(transport: Arc<dyn WaTransport>) -> Self {
        Self { transport, negotiated: Mutex::new(HashMap::new()) }
    }

    pub async fn create_instance(&self, label: &str) -> Result<(), WaApiError> {
        let candidates = vec![
            (
                HttpMethod::Post,
                "instance/create".to_string(),
                Some(json!({"instanceName": label, "qrcode": true})),
            ),
            (
                HttpMethod::Post,
                "manager/instance/create".to_string(),
                Some(json!({"instanceName": label})),
            ),
        ];
        self.try_candidates(WaOperation::CreateInstance, candidates).await.map(|_| ())
    }

    /// Start pairing. Returns the QR payload when the provider includes one
    /// in the connect response.
    pub async fn connect_instance(&self, label: &str) -> Result<Option<String>, WaApiError> {
        let candidates = vec![
            (HttpMethod::Get, format!("instance/connect/{label}"), None),
            (HttpMethod::Get, format!("instance/qrcode/{label}"), None),
        ];
        let body = self.try_candidates(WaOperation::Connect, candidates).await?;
        Ok(parse_qr_body(&body))
    }

    pub async fn instance_status(&self, label: &str) -> Result<ConnectionSignal, WaApiError> {
        let candidates = vec![
            (HttpMethod::Get, format!("instance/connectionState/{label}"), None),
            (HttpMethod::Get, format!("instance/status/{label}"), None),
        ];
        let body = self.try_candidates(WaOperation::Status, candidates).await?;
        parse_status_body(&body)
    }

    pub async fn fetch_qr(&self, label: &str) -> Result<Option<String>, WaApiError> {
        let candidates = vec![
            (HttpMethod::Get, format!("instance/qrcode/{label}"), None),
            (HttpMethod::Get, format!("instance/connect/{label}"), None),
        ];
        let body = self.try_candidates(WaOperation::FetchQr, candidates).await?;
        Ok(parse_qr_body(&body))
    }

    pub async fn send_text(
        &self,
        label: &str,
        number: &str,
        text: &str,
    ) -> Result<WaSendAck, WaApiError> {
        let candidates = vec![
            (
                HttpMethod::Post,
                format!("message/sendText/{label}"),
                Some(json!({"number": number, "text": text})),
            ),
            (
                HttpMethod::Post,
                format!("message/sendText/{label}"),
                Some(json!({"number": number, "textMessage": {"text": text}})),
            ),
        ];
        let body = self.try_candidates(WaOperation::SendText, candidates).await?;
        Ok(WaSendAck {
            message_id: body
                .pointer("/key/id")
                .or_else(|| body.get("messageId"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Run one operation through its candidate list. A 400/404/405 answer is
    /// an endpoint-shape miss and moves to the next candidate; transport
    /// failures and other statuses are real errors and propagate. The first
    /// accepted candidate index is cached and tried first on later calls.
    async fn try_candidates(
        &self,
        operation: WaOperation,
        candidates: Vec<Candidate>,
    ) -> Result<Value, WaApiError> {
        let preferred = self.cached_candidate(operation);
        let mut order: Vec<usize> = Vec::with_capacity(candidates.len());
        if let Some(index) = preferred {
            if index < candidates.len() {
                order.push(index);
            }
        }
        for index in 0..candidates.len() {
            if !order.contains(&index) {
                order.push(index);
            }
        }

        for index in order {
            let (method, path, body) = &candidates[index];
            let response = self.transport.execute(*method, path, body.clone()).await?;

            match response.status {
                status if (200..300).contains(&status) => {
                    if preferred != Some(index) {
                        debug!(
                            event_name = "wa.client.candidate_negotiated",
                            operation = operation.as_str(),
                            candidate = index,
                            path = path.as_str(),
                            "endpoint candidate accepted"
                        );
                    }
                    self.store_candidate(operation, index);
                    return Ok(response.body);
                }
                400 | 404 | 405 => {
                    warn!(
                        event_name = "wa.client.candidate_rejected",
                        operation = operation.as_str(),
                        candidate = index,
                        path = path.as_str(),
                        status = response.status,
                        "endpoint candidate rejected, trying next shape"
                    );
                    continue;
                }
                status => {
                    return Err(WaApiError::Api {
                        status,
                        detail: response
                            .body
                            .get("message")
                            .or_else(|| response.body.get("error"))
                            .and_then(Value::as_str)
                            .unwrap_or("provider error")
                            .to_string(),
                    });
                }
            }
        }

        Err(WaApiError::CandidatesExhausted { operation: operation.as_str() })
    }

    fn cached_candidate(&self, operation: WaOperation) -> Option<usize> {
        let guard = self.negotiated.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(&operation).copied()
    }

    fn store_candidate(&self, operation: WaOperation, index: usize) {
        let mut guard = self.negotiated.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(operation, index);
    }
}

fn parse_status_body(body: &Value) -> Result<ConnectionSignal, WaApiError> {
    let state = body
        .pointer("/instance/state")
        .or_else(|| body.get("state"))
        .or_else(|| body.pointer("/instance/status"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            WaApiError::MalformedResponse("status response has no state field".to_string())
        })?;

    match state.to_ascii_lowercase().as_str() {
        "open" | "connected" => Ok(ConnectionSignal::Open),
        "close" | "closed" | "logged_out" => Ok(ConnectionSignal::Close),
        "connecting" | "qr" => Ok(ConnectionSignal::Connecting),
        other => Err(WaApiError::MalformedResponse(format!("unknown provider state `{other}`"))),
    }
}

fn parse_qr_body(body: &Value) -> Option<String> {
    body.pointer("/qrcode/base64")
        .or_else(|| body.get("base64"))
        .or_else(|| body.get("code"))
        .or_else(|| body.get("qrcode"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
