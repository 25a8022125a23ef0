use thiserror::Error;

/// Failure taxonomy shared by both relay directions.
///
/// Webhook handlers map these onto HTTP outcomes: only `InvalidSignature`
/// surfaces as a non-2xx response; everything else is acknowledged as success
/// once the payload is durably logged, so the external platforms never
/// redeliver into duplicated state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication expired for portal `{portal}`")]
    AuthExpired { portal: String },
    #[error("webhook signature mismatch")]
    InvalidSignature,
    #[error("{entity} not found: `{key}`")]
    NotFound { entity: &'static str, key: String },
    #[error("remote api error `{code}`: {message}")]
    RemoteApi { code: String, message: String, transient: bool },
    #[error("duplicate message `{0}` already processed")]
    DuplicateMessage(String),
    #[error("unparsable payload: {0}")]
    UnparsablePayload(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl RelayError {
    /// Whether a bounded backoff retry is worth attempting.
    ///
    /// `AuthExpired` is deliberately non-retryable here: it is handled by the
    /// refresh-then-retry-once cycle inside the CRM client, not by backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::RemoteApi { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Stable class label used in the webhook audit log and tracing fields.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::AuthExpired { .. } => "auth_expired",
            Self::InvalidSignature => "invalid_signature",
            Self::NotFound { .. } => "not_found",
            Self::RemoteApi { .. } => "remote_api",
            Self::DuplicateMessage(_) => "duplicate_message",
            Self::UnparsablePayload(_) => "unparsable_payload",
            Self::Persistence(_) => "persistence",
        }
    }
}
