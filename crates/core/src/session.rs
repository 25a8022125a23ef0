//! Connection-session state machine for WA instance pairing.
//!
//! The engine is pure: it takes an owned [`Instance`], a [`SessionSignal`],
//! and returns the updated instance plus any side effect the caller must
//! execute. Transports (status poller, provider webhooks) all feed the same
//! engine through signal values, so transition legality lives in one place.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::instance::{Instance, InstanceStatus};

/// Observation or command that may move a session between states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionSignal {
    /// The provider reported the instance as open/connected.
    ProviderOpen,
    /// The provider reported the instance as closed or logged out.
    ProviderClosed,
    /// The status call itself failed after retries.
    StatusCheckFailed { reason: String },
    /// An operator asked for a fresh pairing attempt.
    ReconnectRequested,
    /// The provider issued a new QR payload for pairing.
    QrIssued { qr_code: String },
}

impl SessionSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderOpen => "provider_open",
            Self::ProviderClosed => "provider_closed",
            Self::StatusCheckFailed { .. } => "status_check_failed",
            Self::ReconnectRequested => "reconnect_requested",
            Self::QrIssued { .. } => "qr_issued",
        }
    }
}

/// Side effect the caller must carry out after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEffect {
    /// Entering CONNECTED invalidates any displayed pairing code.
    ClearQr,
    /// Entering PENDING_QR requires a QR fetch from the provider.
    FetchQr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTransition {
    pub instance: Instance,
    pub changed: bool,
    pub effect: Option<SessionEffect>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: InstanceStatus, to: InstanceStatus },
    #[error("signal `{signal}` is not applicable in state {state:?}")]
    SignalNotApplicable { state: InstanceStatus, signal: &'static str },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SessionEngine;

impl SessionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Apply one signal, enforcing the legality table:
    /// PENDING_QR → CONNECTED, CONNECTED → DISCONNECTED, any → ERROR,
    /// DISCONNECTED|ERROR → PENDING_QR. Same-state signals are idempotent.
    pub fn apply(
        &self,
        mut instance: Instance,
        signal: SessionSignal,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let from = instance.status;

        match signal {
            SessionSignal::ProviderOpen => match from {
                InstanceStatus::PendingQr => {
                    instance.status = InstanceStatus::Connected;
                    instance.qr_code = None;
                    Ok(transitioned(instance, now, Some(SessionEffect::ClearQr)))
                }
                InstanceStatus::Connected => Ok(unchanged_seen(instance, now)),
                InstanceStatus::Disconnected | InstanceStatus::Error => {
                    Err(SessionError::InvalidTransition { from, to: InstanceStatus::Connected })
                }
            },
            SessionSignal::ProviderClosed => match from {
                InstanceStatus::Connected => {
                    instance.status = InstanceStatus::Disconnected;
                    Ok(transitioned(instance, now, None))
                }
                InstanceStatus::Disconnected => Ok(unchanged(instance)),
                InstanceStatus::PendingQr | InstanceStatus::Error => {
                    Err(SessionError::InvalidTransition { from, to: InstanceStatus::Disconnected })
                }
            },
            SessionSignal::StatusCheckFailed { .. } => {
                if from == InstanceStatus::Error {
                    return Ok(unchanged(instance));
                }
                instance.status = InstanceStatus::Error;
                Ok(transitioned(instance, now, None))
            }
            SessionSignal::ReconnectRequested => match from {
                InstanceStatus::Disconnected | InstanceStatus::Error => {
                    instance.status = InstanceStatus::PendingQr;
                    instance.qr_code = None;
                    Ok(transitioned(instance, now, Some(SessionEffect::FetchQr)))
                }
                InstanceStatus::PendingQr => {
                    // Already pairing; re-request the code but change nothing.
                    let mut result = unchanged(instance);
                    result.effect = Some(SessionEffect::FetchQr);
                    Ok(result)
                }
                InstanceStatus::Connected => {
                    Err(SessionError::InvalidTransition { from, to: InstanceStatus::PendingQr })
                }
            },
            SessionSignal::QrIssued { qr_code } => match from {
                InstanceStatus::PendingQr => {
                    instance.qr_code = Some(qr_code);
                    Ok(transitioned(instance, now, None))
                }
                _ => Err(SessionError::SignalNotApplicable { state: from, signal: "qr_issued" }),
            },
        }
    }
}

fn transitioned(
    mut instance: Instance,
    now: DateTime<Utc>,
    effect: Option<SessionEffect>,
) -> SessionTransition {
    instance.last_seen_at = Some(now);
    instance.updated_at = now;
    SessionTransition { instance, changed: true, effect }
}

fn unchanged_seen(mut instance: Instance, now: DateTime<Utc>) -> SessionTransition {
    instance.last_seen_at = Some(now);
    SessionTransition { instance, changed: false, effect: None }
}

fn unchanged(instance: Instance) -> SessionTransition {
    SessionTransition { instance, changed: false, effect: None }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{SessionEffect, SessionEngine, SessionError, SessionSignal};
    use crate::domain::instance::{Instance, InstanceId, InstanceStatus};
    use crate::domain::tenant::TenantId;

    fn instance(status: InstanceStatus) -> Instance {
        let now = Utc::now();
        Instance {
            id: InstanceId("INST-1".to_string()),
            tenant_id: TenantId("tenant-1".to_string()),
            label: "evo_line_7".to_string(),
            status,
            qr_code: matches!(status, InstanceStatus::PendingQr)
                .then(|| "qr-payload".to_string()),
            webhook_secret: None,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fresh_session_connects_on_open_signal_and_clears_qr() {
        let engine = SessionEngine::new();
        let result = engine
            .apply(instance(InstanceStatus::PendingQr), SessionSignal::ProviderOpen, Utc::now())
            .expect("pending_qr -> connected");

        assert!(result.changed);
        assert_eq!(result.instance.status, InstanceStatus::Connected);
        assert_eq!(result.instance.qr_code, None);
        assert_eq!(result.effect, Some(SessionEffect::ClearQr));
        assert!(result.instance.last_seen_at.is_some());
    }

    #[test]
    fn connected_session_disconnects_on_closed_signal() {
        let engine = SessionEngine::new();
        let result = engine
            .apply(instance(InstanceStatus::Connected), SessionSignal::ProviderClosed, Utc::now())
            .expect("connected -> disconnected");

        assert!(result.changed);
        assert_eq!(result.instance.status, InstanceStatus::Disconnected);
    }

    #[test]
    fn any_state_moves_to_error_on_status_failure() {
        let engine = SessionEngine::new();
        for status in [
            InstanceStatus::PendingQr,
            InstanceStatus::Connected,
            InstanceStatus::Disconnected,
        ] {
            let result = engine
                .apply(
                    instance(status),
                    SessionSignal::StatusCheckFailed { reason: "timeout".to_string() },
                    Utc::now(),
                )
                .expect("-> error");
            assert_eq!(result.instance.status, InstanceStatus::Error);
        }
    }

    #[test]
    fn reconnect_reenters_pairing_from_disconnected_and_error() {
        let engine = SessionEngine::new();
        for status in [InstanceStatus::Disconnected, InstanceStatus::Error] {
            let result = engine
                .apply(instance(status), SessionSignal::ReconnectRequested, Utc::now())
                .expect("-> pending_qr");
            assert_eq!(result.instance.status, InstanceStatus::PendingQr);
            assert_eq!(result.effect, Some(SessionEffect::FetchQr));
        }
    }

    #[test]
    fn pending_qr_cannot_skip_to_disconnected() {
        let engine = SessionEngine::new();
        let error = engine
            .apply(instance(InstanceStatus::PendingQr), SessionSignal::ProviderClosed, Utc::now())
            .expect_err("pending_qr -> disconnected must be rejected");

        assert_eq!(
            error,
            SessionError::InvalidTransition {
                from: InstanceStatus::PendingQr,
                to: InstanceStatus::Disconnected,
            }
        );
    }

    #[test]
    fn all_illegal_transitions_are_rejected() {
        let engine = SessionEngine::new();
        let illegal: &[(InstanceStatus, SessionSignal)] = &[
            (InstanceStatus::Disconnected, SessionSignal::ProviderOpen),
            (InstanceStatus::Error, SessionSignal::ProviderOpen),
            (InstanceStatus::PendingQr, SessionSignal::ProviderClosed),
            (InstanceStatus::Error, SessionSignal::ProviderClosed),
            (InstanceStatus::Connected, SessionSignal::ReconnectRequested),
            (
                InstanceStatus::Connected,
                SessionSignal::QrIssued { qr_code: "qr".to_string() },
            ),
            (
                InstanceStatus::Disconnected,
                SessionSignal::QrIssued { qr_code: "qr".to_string() },
            ),
            (InstanceStatus::Error, SessionSignal::QrIssued { qr_code: "qr".to_string() }),
        ];

        for (status, signal) in illegal {
            let result = engine.apply(instance(*status), signal.clone(), Utc::now());
            assert!(result.is_err(), "{status:?} + {} should be rejected", signal.kind());
        }
    }

    #[test]
    fn same_state_signals_are_idempotent() {
        let engine = SessionEngine::new();

        let open_again = engine
            .apply(instance(InstanceStatus::Connected), SessionSignal::ProviderOpen, Utc::now())
            .expect("connected + open is a no-op");
        assert!(!open_again.changed);

        let closed_again = engine
            .apply(
                instance(InstanceStatus::Disconnected),
                SessionSignal::ProviderClosed,
                Utc::now(),
            )
            .expect("disconnected + closed is a no-op");
        assert!(!closed_again.changed);

        let still_error = engine
            .apply(
                instance(InstanceStatus::Error),
                SessionSignal::StatusCheckFailed { reason: "again".to_string() },
                Utc::now(),
            )
            .expect("error + failure is a no-op");
        assert!(!still_error.changed);
    }

    #[test]
    fn qr_payload_is_stored_while_pairing() {
        let engine = SessionEngine::new();
        let mut pending = instance(InstanceStatus::PendingQr);
        pending.qr_code = None;

        let result = engine
            .apply(
                pending,
                SessionSignal::QrIssued { qr_code: "fresh-qr".to_string() },
                Utc::now(),
            )
            .expect("qr stored");
        assert_eq!(result.instance.qr_code.as_deref(), Some("fresh-qr"));
        assert_eq!(result.instance.status, InstanceStatus::PendingQr);
    }
}
