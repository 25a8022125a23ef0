use chrono::Utc;
use sqlx::Row;

use waline_core::domain::prefixed_id;
use waline_core::{Binding, BindingId, InstanceId, LineId, TenantId};

use super::{parse_timestamp, BindingRepository, RepositoryError};
use crate::DbPool;

pub struct SqlBindingRepository {
    pool: DbPool,
}

impl SqlBindingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_binding(row: &sqlx::sqlite::SqliteRow) -> Result<Binding, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let line_id: String =
        row.try_get("line_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let instance_id: String =
        row.try_get("instance_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(Binding {
        id: BindingId(id),
        tenant_id: TenantId(tenant_id),
        line_id: LineId(line_id),
        instance_id: InstanceId(instance_id),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl BindingRepository for SqlBindingRepository {
    async fn bind(
        &self,
        tenant_id: &TenantId,
        line_id: &LineId,
        instance_id: &InstanceId,
    ) -> Result<Binding, RepositoryError> {
        let now = Utc::now();
        let id = prefixed_id("BIND");
        let mut tx = self.pool.begin().await?;

        // Re-binding overwrites both sides of the prior mapping.
        sqlx::query(
            "DELETE FROM binding
             WHERE tenant_id = ? AND (line_id = ? OR instance_id = ?)",
        )
        .bind(&tenant_id.0)
        .bind(&line_id.0)
        .bind(&instance_id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO binding (id, tenant_id, line_id, instance_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&tenant_id.0)
        .bind(&line_id.0)
        .bind(&instance_id.0)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Binding {
            id: BindingId(id),
            tenant_id: tenant_id.clone(),
            line_id: line_id.clone(),
            instance_id: instance_id.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_instance(
        &self,
        tenant_id: &TenantId,
        instance_id: &InstanceId,
    ) -> Result<Option<Binding>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, line_id, instance_id, created_at, updated_at
             FROM binding WHERE tenant_id = ? AND instance_id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&instance_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_binding(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_line(
        &self,
        tenant_id: &TenantId,
        line_id: &LineId,
    ) -> Result<Option<Binding>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, line_id, instance_id, created_at, updated_at
             FROM binding WHERE tenant_id = ? AND line_id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&line_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_binding(r)?)),
            None => Ok(None),
        }
    }

    async fn unbind_line(
        &self,
        tenant_id: &TenantId,
        line_id: &LineId,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM binding WHERE tenant_id = ? AND line_id = ?")
            .bind(&tenant_id.0)
            .bind(&line_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
