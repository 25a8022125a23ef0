use chrono::{DateTime, Utc};
use sqlx::Row;

use waline_core::{Credential, CredentialId, TenantId};

use super::{parse_optional_timestamp, parse_timestamp, CredentialRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCredentialRepository {
    pool: DbPool,
}

impl SqlCredentialRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, portal_url, access_token, refresh_token, \
     expires_at, scope, active, created_at, updated_at";

fn row_to_credential(row: &sqlx::sqlite::SqliteRow) -> Result<Credential, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let portal_url: String =
        row.try_get("portal_url").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let access_token: String =
        row.try_get("access_token").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let refresh_token: Option<String> =
        row.try_get("refresh_token").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let expires_at: Option<String> =
        row.try_get("expires_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let scope: Option<String> =
        row.try_get("scope").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let active: i64 = row.try_get("active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(Credential {
        id: CredentialId(id),
        tenant_id: TenantId(tenant_id),
        portal_url,
        access_token,
        refresh_token,
        expires_at: parse_optional_timestamp(expires_at)?,
        scope,
        active: active != 0,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl CredentialRepository for SqlCredentialRepository {
    async fn find_active(
        &self,
        tenant_id: &TenantId,
        portal_url: &str,
    ) -> Result<Option<Credential>, RepositoryError> {
        let statement = format!(
            "SELECT {SELECT_COLUMNS} FROM credential
             WHERE tenant_id = ? AND portal_url = ? AND active = 1"
        );
        let row = sqlx::query(&statement)
            .bind(&tenant_id.0)
            .bind(portal_url)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_credential(r)?)),
            None => Ok(None),
        }
    }

    async fn find_active_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Credential>, RepositoryError> {
        let statement = format!(
            "SELECT {SELECT_COLUMNS} FROM credential
             WHERE tenant_id = ? AND active = 1
             ORDER BY updated_at DESC
             LIMIT 1"
        );
        let row =
            sqlx::query(&statement).bind(&tenant_id.0).fetch_optional(&self.pool).await?;

        match row {
            Some(ref r) => Ok(Some(row_to_credential(r)?)),
            None => Ok(None),
        }
    }

    async fn list_active(&self) -> Result<Vec<Credential>, RepositoryError> {
        let statement =
            format!("SELECT {SELECT_COLUMNS} FROM credential WHERE active = 1 ORDER BY tenant_id");
        let rows = sqlx::query(&statement).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_credential).collect()
    }

    async fn store_grant(&self, credential: Credential) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE credential SET active = 0, updated_at = ?
             WHERE tenant_id = ? AND portal_url = ? AND active = 1",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&credential.tenant_id.0)
        .bind(&credential.portal_url)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO credential (id, tenant_id, portal_url, access_token, refresh_token,
                                     expires_at, scope, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&credential.id.0)
        .bind(&credential.tenant_id.0)
        .bind(&credential.portal_url)
        .bind(&credential.access_token)
        .bind(credential.refresh_token.as_deref())
        .bind(credential.expires_at.map(|value| value.to_rfc3339()))
        .bind(credential.scope.as_deref())
        .bind(i64::from(credential.active))
        .bind(credential.created_at.to_rfc3339())
        .bind(credential.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_tokens(
        &self,
        id: &CredentialId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE credential
             SET access_token = ?, refresh_token = ?, expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at.map(|value| value.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate(&self, id: &CredentialId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE credential SET active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use waline_core::{Credential, CredentialId, TenantId};

    use super::SqlCredentialRepository;
    use crate::repositories::CredentialRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_credential(id: &str, tenant: &str) -> Credential {
        let now = Utc::now();
        Credential {
            id: CredentialId(id.to_string()),
            tenant_id: TenantId(tenant.to_string()),
            portal_url: "https://portal.example.test".to_string(),
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(now + Duration::hours(1)),
            scope: Some("imopenlines imconnector".to_string()),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn store_and_find_active() {
        let pool = setup().await;
        let repo = SqlCredentialRepository::new(pool);

        repo.store_grant(sample_credential("CRED-001", "tenant-a")).await.expect("store");

        let found = repo
            .find_active(&TenantId("tenant-a".to_string()), "https://portal.example.test")
            .await
            .expect("find")
            .expect("should exist");
        assert_eq!(found.id.0, "CRED-001");
        assert_eq!(found.access_token, "access-1");
        assert!(found.active);
    }

    #[tokio::test]
    async fn storing_a_new_grant_deactivates_the_prior_one() {
        let pool = setup().await;
        let repo = SqlCredentialRepository::new(pool);

        repo.store_grant(sample_credential("CRED-001", "tenant-a")).await.expect("store first");
        repo.store_grant(sample_credential("CRED-002", "tenant-a")).await.expect("store second");

        let found = repo
            .find_active(&TenantId("tenant-a".to_string()), "https://portal.example.test")
            .await
            .expect("find")
            .expect("should exist");
        assert_eq!(found.id.0, "CRED-002");

        let all_active = repo.list_active().await.expect("list");
        assert_eq!(all_active.len(), 1);
    }

    #[tokio::test]
    async fn token_refresh_overwrites_in_place() {
        let pool = setup().await;
        let repo = SqlCredentialRepository::new(pool);

        repo.store_grant(sample_credential("CRED-001", "tenant-a")).await.expect("store");

        let new_expiry = Utc::now() + Duration::hours(2);
        repo.update_tokens(
            &CredentialId("CRED-001".to_string()),
            "access-2",
            Some("refresh-2"),
            Some(new_expiry),
        )
        .await
        .expect("update");

        let found = repo
            .find_active(&TenantId("tenant-a".to_string()), "https://portal.example.test")
            .await
            .expect("find")
            .expect("should exist");
        assert_eq!(found.access_token, "access-2");
        assert_eq!(found.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn deactivate_removes_from_active_set() {
        let pool = setup().await;
        let repo = SqlCredentialRepository::new(pool);

        repo.store_grant(sample_credential("CRED-001", "tenant-a")).await.expect("store");
        repo.deactivate(&CredentialId("CRED-001".to_string())).await.expect("deactivate");

        let found = repo
            .find_active(&TenantId("tenant-a".to_string()), "https://portal.example.test")
            .await
            .expect("find");
        assert!(found.is_none());
    }
}
