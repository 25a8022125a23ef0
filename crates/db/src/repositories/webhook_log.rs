use chrono::{DateTime, Utc};

use waline_core::domain::prefixed_id;
use waline_core::TenantId;

use super::{RepositoryError, WebhookLogRepository};
use crate::DbPool;

/// One inbound payload in the append-only audit log. Written before the
/// processing outcome is decided and updated never; replays and signature
/// disputes are diagnosed from this table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookLogEntry {
    pub tenant_id: Option<TenantId>,
    /// `wa` or `crm`.
    pub source: &'static str,
    pub event_kind: String,
    pub payload: String,
    /// `valid`, `invalid`, or `unsigned`.
    pub signature_verdict: &'static str,
    /// `processed`, `duplicate`, `rejected`, `dropped`, `partial`
    /// (persisted but not forwarded), or `failed`.
    pub outcome: &'static str,
    pub received_at: DateTime<Utc>,
}

pub struct SqlWebhookLogRepository {
    pool: DbPool,
}

impl SqlWebhookLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WebhookLogRepository for SqlWebhookLogRepository {
    async fn append(&self, entry: WebhookLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO webhook_log (id, tenant_id, source, event_kind, payload,
                                      signature_verdict, outcome, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(prefixed_id("WHLOG"))
        .bind(entry.tenant_id.as_ref().map(|tenant| tenant.0.as_str()))
        .bind(entry.source)
        .bind(&entry.event_kind)
        .bind(&entry.payload)
        .bind(entry.signature_verdict)
        .bind(entry.outcome)
        .bind(entry.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
