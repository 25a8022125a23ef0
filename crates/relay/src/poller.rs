//! Background session work: the channel-fed state-machine consumer and the
//! bounded status poller.
//!
//! Transports never mutate session state themselves; they emit
//! [`SessionSignal`] values into the consumer, which owns every transition
//! and persists the result. Polling stops on its own when the session
//! reaches CONNECTED, when the budget runs out (still-pending is
//! inconclusive, not an error), or when the registry aborts the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use waline_core::{
    Instance, InstanceId, RelayError, RetryPolicy, SessionEffect, SessionEngine, SessionSignal,
};
use waline_db::repositories::InstanceRepository;
use waline_wa::events::ConnectionSignal;

use crate::gateways::WaGateway;
use crate::registry::{InstanceRegistry, SessionHandle};
use crate::retry::run_with_retry;

#[derive(Clone)]
pub struct SessionDeps {
    pub instances: Arc<dyn InstanceRepository>,
    pub wa: Arc<dyn WaGateway>,
    pub retry: RetryPolicy,
}

/// Spawn the session loop and status poller for one instance and register
/// both under (tenant, instance). Returns the signal channel.
pub async fn start_session(
    registry: &InstanceRegistry,
    deps: SessionDeps,
    instance: &Instance,
    poll_interval: Duration,
    poll_budget: Duration,
) -> mpsc::Sender<SessionSignal> {
    let (signals, inbox) = mpsc::channel(16);

    let consumer = tokio::spawn(run_session_loop(deps.clone(), instance.id.clone(), inbox));
    let poller = tokio::spawn(run_status_poller(
        deps,
        instance.label.clone(),
        signals.clone(),
        poll_interval,
        poll_budget,
    ));

    registry.register(
        instance.tenant_id.clone(),
        instance.id.clone(),
        SessionHandle { signals: signals.clone(), tasks: vec![consumer, poller] },
    );

    info!(
        event_name = "relay.session.started",
        tenant_id = %instance.tenant_id,
        instance = %instance.label,
        "session loop and status poller started"
    );

    signals
}

/// Apply one signal against the stored instance row. Signals that are not
/// applicable in the current state are rejected by the engine and ignored
/// here; the store is the single source of session truth.
pub async fn apply_session_signal(
    instances: &dyn InstanceRepository,
    instance_id: &InstanceId,
    signal: SessionSignal,
) -> Result<Option<SessionEffect>, RelayError> {
    let Some(instance) = instances
        .find_by_id(instance_id)
        .await
        .map_err(|error| RelayError::Persistence(error.to_string()))?
    else {
        debug!(
            event_name = "relay.session.signal_for_missing_instance",
            instance_id = %instance_id,
            signal = signal.kind(),
            "instance row is gone; signal dropped"
        );
        return Ok(None);
    };

    let from = instance.status;
    match SessionEngine::new().apply(instance, signal.clone(), Utc::now()) {
        Ok(transition) => {
            instances
                .update_session(&transition.instance)
                .await
                .map_err(|error| RelayError::Persistence(error.to_string()))?;
            if transition.changed {
                info!(
                    event_name = "relay.session.transition",
                    instance_id = %instance_id,
                    from = from.as_str(),
                    to = transition.instance.status.as_str(),
                    signal = signal.kind(),
                    "session state changed"
                );
            }
            Ok(transition.effect)
        }
        Err(error) => {
            debug!(
                event_name = "relay.session.signal_ignored",
                instance_id = %instance_id,
                signal = signal.kind(),
                error = %error,
                "signal not applicable in current state"
            );
            Ok(None)
        }
    }
}

async fn run_session_loop(
    deps: SessionDeps,
    instance_id: InstanceId,
    mut inbox: mpsc::Receiver<SessionSignal>,
) {
    while let Some(signal) = inbox.recv().await {
        match apply_session_signal(deps.instances.as_ref(), &instance_id, signal).await {
            Ok(Some(SessionEffect::FetchQr)) => {
                fetch_and_store_qr(&deps, &instance_id).await;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    event_name = "relay.session.apply_failed",
                    instance_id = %instance_id,
                    error = %error,
                    "session signal could not be persisted"
                );
            }
        }
    }
}

async fn fetch_and_store_qr(deps: &SessionDeps, instance_id: &InstanceId) {
    let label = match deps.instances.find_by_id(instance_id).await {
        Ok(Some(instance)) => instance.label,
        Ok(None) => return,
        Err(error) => {
            warn!(
                event_name = "relay.session.qr_lookup_failed",
                instance_id = %instance_id,
                error = %error,
                "could not load instance for qr fetch"
            );
            return;
        }
    };

    match deps.wa.fetch_qr(&label).await {
        Ok(Some(qr_code)) => {
            if let Err(error) = apply_session_signal(
                deps.instances.as_ref(),
                instance_id,
                SessionSignal::QrIssued { qr_code },
            )
            .await
            {
                warn!(
                    event_name = "relay.session.qr_store_failed",
                    instance_id = %instance_id,
                    error = %error,
                    "fetched qr could not be stored"
                );
            }
        }
        Ok(None) => {}
        Err(error) => {
            warn!(
                event_name = "relay.session.qr_fetch_failed",
                instance = %label,
                error = %error,
                "provider did not return a qr payload"
            );
        }
    }
}

async fn run_status_poller(
    deps: SessionDeps,
    label: String,
    signals: mpsc::Sender<SessionSignal>,
    poll_interval: Duration,
    poll_budget: Duration,
) {
    let deadline = Instant::now() + poll_budget;
    let mut ticker = interval(poll_interval);

    loop {
        ticker.tick().await;
        if Instant::now() >= deadline {
            info!(
                event_name = "relay.session.poll_budget_exhausted",
                instance = %label,
                "pairing still pending after poll budget; polling stopped"
            );
            return;
        }

        let wa = deps.wa.as_ref();
        let status =
            run_with_retry(&deps.retry, "wa.instance_status", || wa.instance_status(&label)).await;

        match status {
            Ok(ConnectionSignal::Open) => {
                let _ = signals.send(SessionSignal::ProviderOpen).await;
                info!(
                    event_name = "relay.session.poller_connected",
                    instance = %label,
                    "provider reports open; polling stopped"
                );
                return;
            }
            Ok(ConnectionSignal::Close) => {
                // Reported while a live session drops; during pairing the
                // engine rejects it and nothing changes.
                let _ = signals.send(SessionSignal::ProviderClosed).await;
            }
            Ok(ConnectionSignal::Connecting) => {
                debug!(
                    event_name = "relay.session.still_pairing",
                    instance = %label,
                    "provider still waiting for the code scan"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "relay.session.status_failed",
                    instance = %label,
                    error = %error,
                    "status check failed after retries; session marked errored"
                );
                let _ = signals
                    .send(SessionSignal::StatusCheckFailed { reason: error.to_string() })
                    .await;
                return;
            }
        }
    }
}
