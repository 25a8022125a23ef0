use chrono::Utc;
use sqlx::Row;

use waline_core::domain::prefixed_id;
use waline_core::{Contact, ContactId, TenantId};

use super::{parse_timestamp, ContactRepository, RepositoryError};
use crate::DbPool;

pub struct SqlContactRepository {
    pool: DbPool,
}

impl SqlContactRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_contact(row: &sqlx::sqlite::SqliteRow) -> Result<Contact, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let phone: String =
        row.try_get("phone").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let display_name: Option<String> =
        row.try_get("display_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(Contact {
        id: ContactId(id),
        tenant_id: TenantId(tenant_id),
        phone,
        display_name,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl ContactRepository for SqlContactRepository {
    async fn find_or_create(
        &self,
        tenant_id: &TenantId,
        phone: &str,
        display_name: Option<&str>,
    ) -> Result<Contact, RepositoryError> {
        let now = Utc::now();

        // Insert-or-ignore against the (tenant, phone) unique index keeps
        // concurrent first messages from the same number race-free.
        sqlx::query(
            "INSERT OR IGNORE INTO contact (id, tenant_id, phone, display_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(prefixed_id("CONT"))
        .bind(&tenant_id.0)
        .bind(phone)
        .bind(display_name)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        // Adopt a push name learned later for contacts created without one.
        if let Some(name) = display_name {
            sqlx::query(
                "UPDATE contact SET display_name = ?, updated_at = ?
                 WHERE tenant_id = ? AND phone = ? AND display_name IS NULL",
            )
            .bind(name)
            .bind(now.to_rfc3339())
            .bind(&tenant_id.0)
            .bind(phone)
            .execute(&self.pool)
            .await?;
        }

        let row = sqlx::query(
            "SELECT id, tenant_id, phone, display_name, created_at, updated_at
             FROM contact WHERE tenant_id = ? AND phone = ?",
        )
        .bind(&tenant_id.0)
        .bind(phone)
        .fetch_one(&self.pool)
        .await?;

        row_to_contact(&row)
    }

    async fn find_by_id(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, phone, display_name, created_at, updated_at
             FROM contact WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_contact(r)?)),
            None => Ok(None),
        }
    }
}
