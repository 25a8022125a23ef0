//! Injected registry of live connection sessions.
//!
//! Keyed by (tenant, instance) with explicit register/unregister/lookup, so
//! background pollers are owned state rather than ambient globals: deleting
//! or disconnecting an instance aborts its tasks, and tests observe the
//! registry directly.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use waline_core::{InstanceId, SessionSignal, TenantId};

/// Live handle for one pairing/connection session: the signal channel into
/// its state-machine loop plus the background tasks that feed it.
pub struct SessionHandle {
    pub signals: mpsc::Sender<SessionSignal>,
    pub tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub struct InstanceRegistry {
    inner: Mutex<HashMap<(TenantId, InstanceId), SessionHandle>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, aborting any previous one for the same key.
    pub fn register(&self, tenant_id: TenantId, instance_id: InstanceId, handle: SessionHandle) {
        let replaced = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard.insert((tenant_id.clone(), instance_id.clone()), handle)
        };
        if let Some(previous) = replaced {
            abort_all(previous);
            info!(
                event_name = "relay.registry.replaced",
                tenant_id = %tenant_id,
                instance_id = %instance_id,
                "previous session aborted on re-register"
            );
        }
    }

    /// Stop and forget a session; a no-op when none is registered.
    pub fn unregister(&self, tenant_id: &TenantId, instance_id: &InstanceId) {
        let removed = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard.remove(&(tenant_id.clone(), instance_id.clone()))
        };
        if let Some(handle) = removed {
            abort_all(handle);
            info!(
                event_name = "relay.registry.unregistered",
                tenant_id = %tenant_id,
                instance_id = %instance_id,
                "session stopped"
            );
        }
    }

    /// Signal channel of a live session, if one is registered.
    pub fn signal_sender(
        &self,
        tenant_id: &TenantId,
        instance_id: &InstanceId,
    ) -> Option<mpsc::Sender<SessionSignal>> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(&(tenant_id.clone(), instance_id.clone())).map(|handle| handle.signals.clone())
    }

    /// Abort every registered session; used on shutdown.
    pub fn shutdown_all(&self) {
        let drained: Vec<SessionHandle> = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            abort_all(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn abort_all(handle: SessionHandle) {
    for task in handle.tasks {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use waline_core::{InstanceId, SessionSignal, TenantId};

    use super::{InstanceRegistry, SessionHandle};

    fn key() -> (TenantId, InstanceId) {
        (TenantId("tenant-a".to_string()), InstanceId("INST-1".to_string()))
    }

    #[tokio::test]
    async fn register_lookup_unregister_roundtrip() {
        let registry = InstanceRegistry::new();
        let (tenant, instance) = key();
        let (tx, mut rx) = mpsc::channel(4);

        registry.register(tenant.clone(), instance.clone(), SessionHandle {
            signals: tx,
            tasks: Vec::new(),
        });
        assert_eq!(registry.len(), 1);

        let sender = registry.signal_sender(&tenant, &instance).expect("registered");
        sender.send(SessionSignal::ProviderOpen).await.expect("send");
        assert_eq!(rx.recv().await, Some(SessionSignal::ProviderOpen));

        registry.unregister(&tenant, &instance);
        assert!(registry.is_empty());
        assert!(registry.signal_sender(&tenant, &instance).is_none());
    }

    #[tokio::test]
    async fn re_register_aborts_the_previous_session_tasks() {
        let registry = InstanceRegistry::new();
        let (tenant, instance) = key();

        let old_task = tokio::spawn(async {
            // Parked forever unless aborted.
            std::future::pending::<()>().await;
        });
        let (old_tx, _old_rx) = mpsc::channel(1);
        registry.register(tenant.clone(), instance.clone(), SessionHandle {
            signals: old_tx,
            tasks: vec![old_task],
        });

        let (new_tx, _new_rx) = mpsc::channel(1);
        registry.register(tenant.clone(), instance.clone(), SessionHandle {
            signals: new_tx,
            tasks: Vec::new(),
        });
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_every_session() {
        let registry = InstanceRegistry::new();
        for index in 0..3 {
            let (tx, _rx) = mpsc::channel(1);
            registry.register(
                TenantId("tenant-a".to_string()),
                InstanceId(format!("INST-{index}")),
                SessionHandle { signals: tx, tasks: Vec::new() },
            );
        }

        registry.shutdown_all();
        assert!(registry.is_empty());
    }
}
