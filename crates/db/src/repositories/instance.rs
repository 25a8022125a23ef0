use sqlx::Row;

use waline_core::{Instance, InstanceId, InstanceStatus, TenantId};

use super::{parse_optional_timestamp, parse_timestamp, InstanceRepository, RepositoryError};
use crate::DbPool;

pub struct SqlInstanceRepository {
    pool: DbPool,
}

impl SqlInstanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, label, status, qr_code, webhook_secret, \
     last_seen_at, created_at, updated_at";

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<Instance, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let label: String =
        row.try_get("label").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_raw: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let qr_code: Option<String> =
        row.try_get("qr_code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let webhook_secret: Option<String> =
        row.try_get("webhook_secret").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_seen_at: Option<String> =
        row.try_get("last_seen_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let status = InstanceStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown instance status `{status_raw}`")))?;

    Ok(Instance {
        id: InstanceId(id),
        tenant_id: TenantId(tenant_id),
        label,
        status,
        qr_code,
        webhook_secret,
        last_seen_at: parse_optional_timestamp(last_seen_at)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl InstanceRepository for SqlInstanceRepository {
    async fn create(&self, instance: Instance) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO instance (id, tenant_id, label, status, qr_code, webhook_secret,
                                   last_seen_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind(&instance.tenant_id.0)
        .bind(&instance.label)
        .bind(instance.status.as_str())
        .bind(instance.qr_code.as_deref())
        .bind(instance.webhook_secret.as_deref())
        .bind(instance.last_seen_at.map(|value| value.to_rfc3339()))
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &InstanceId) -> Result<Option<Instance>, RepositoryError> {
        let statement = format!("SELECT {SELECT_COLUMNS} FROM instance WHERE id = ?");
        let row = sqlx::query(&statement).bind(&id.0).fetch_optional(&self.pool).await?;
        match row {
            Some(ref r) => Ok(Some(row_to_instance(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_label(&self, label: &str) -> Result<Option<Instance>, RepositoryError> {
        let statement = format!("SELECT {SELECT_COLUMNS} FROM instance WHERE label = ?");
        let row = sqlx::query(&statement).bind(label).fetch_optional(&self.pool).await?;
        match row {
            Some(ref r) => Ok(Some(row_to_instance(r)?)),
            None => Ok(None),
        }
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<Instance>, RepositoryError> {
        let statement =
            format!("SELECT {SELECT_COLUMNS} FROM instance WHERE status = ? ORDER BY created_at");
        let rows =
            sqlx::query(&statement).bind(status.as_str()).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn update_session(&self, instance: &Instance) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE instance
             SET status = ?, qr_code = ?, last_seen_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(instance.status.as_str())
        .bind(instance.qr_code.as_deref())
        .bind(instance.last_seen_at.map(|value| value.to_rfc3339()))
        .bind(instance.updated_at.to_rfc3339())
        .bind(&instance.id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM instance WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
