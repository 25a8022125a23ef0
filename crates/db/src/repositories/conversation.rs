use chrono::Utc;
use sqlx::Row;

use waline_core::domain::prefixed_id;
use waline_core::{
    ContactId, Conversation, ConversationId, ConversationStatus, InstanceId, TenantId,
};

use super::{parse_timestamp, ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, instance_id, contact_id, crm_chat_id, status, \
     assigned_agent_id, last_activity_at, created_at, updated_at";

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let instance_id: String =
        row.try_get("instance_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let contact_id: String =
        row.try_get("contact_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let crm_chat_id: Option<String> =
        row.try_get("crm_chat_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_raw: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let assigned_agent_id: Option<String> =
        row.try_get("assigned_agent_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_activity_at: String =
        row.try_get("last_activity_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let status = ConversationStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conversation status `{status_raw}`"))
    })?;

    Ok(Conversation {
        id: ConversationId(id),
        tenant_id: TenantId(tenant_id),
        instance_id: InstanceId(instance_id),
        contact_id: ContactId(contact_id),
        crm_chat_id,
        status,
        assigned_agent_id,
        last_activity_at: parse_timestamp(&last_activity_at)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn open_or_get(
        &self,
        tenant_id: &TenantId,
        instance_id: &InstanceId,
        contact_id: &ContactId,
    ) -> Result<Conversation, RepositoryError> {
        let now = Utc::now();

        // The partial unique index on open conversations makes this
        // insert-or-ignore converge under concurrent inbound messages.
        sqlx::query(
            "INSERT OR IGNORE INTO conversation
                 (id, tenant_id, instance_id, contact_id, crm_chat_id, status,
                  assigned_agent_id, last_activity_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, 'open', NULL, ?, ?, ?)",
        )
        .bind(prefixed_id("CONV"))
        .bind(&tenant_id.0)
        .bind(&instance_id.0)
        .bind(&contact_id.0)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let statement = format!(
            "SELECT {SELECT_COLUMNS} FROM conversation
             WHERE tenant_id = ? AND instance_id = ? AND contact_id = ? AND status = 'open'"
        );
        let row = sqlx::query(&statement)
            .bind(&tenant_id.0)
            .bind(&instance_id.0)
            .bind(&contact_id.0)
            .fetch_one(&self.pool)
            .await?;

        row_to_conversation(&row)
    }

    async fn find_open_by_crm_chat(
        &self,
        tenant_id: &TenantId,
        crm_chat_id: &str,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let statement = format!(
            "SELECT {SELECT_COLUMNS} FROM conversation
             WHERE tenant_id = ? AND crm_chat_id = ? AND status = 'open'"
        );
        let row = sqlx::query(&statement)
            .bind(&tenant_id.0)
            .bind(crm_chat_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_conversation(r)?)),
            None => Ok(None),
        }
    }

    async fn set_crm_chat_id(
        &self,
        id: &ConversationId,
        crm_chat_id: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE conversation SET crm_chat_id = ?, updated_at = ?
             WHERE id = ? AND crm_chat_id IS NULL",
        )
        .bind(crm_chat_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE conversation SET status = 'closed', updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_agent(
        &self,
        id: &ConversationId,
        agent_id: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE conversation SET assigned_agent_id = ?, updated_at = ? WHERE id = ?")
            .bind(agent_id)
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_activity(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE conversation SET last_activity_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use waline_core::{
        ContactId, ConversationStatus, Instance, InstanceId, InstanceStatus, TenantId,
    };

    use super::SqlConversationRepository;
    use crate::repositories::{
        ContactRepository, ConversationRepository, InstanceRepository, SqlContactRepository,
        SqlInstanceRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        // A single pooled connection keeps the in-memory database private to
        // the test; concurrent tasks interleave on it statement by statement.
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    async fn seed(pool: &sqlx::SqlitePool) -> (TenantId, InstanceId, ContactId) {
        let tenant = TenantId("tenant-a".to_string());
        let now = Utc::now();

        SqlInstanceRepository::new(pool.clone())
            .create(Instance {
                id: InstanceId("INST-001".to_string()),
                tenant_id: tenant.clone(),
                label: "evo_line_7".to_string(),
                status: InstanceStatus::Connected,
                qr_code: None,
                webhook_secret: None,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("instance");

        let contact = SqlContactRepository::new(pool.clone())
            .find_or_create(&tenant, "+5511999999999", None)
            .await
            .expect("contact");

        (tenant, InstanceId("INST-001".to_string()), contact.id)
    }

    #[tokio::test]
    async fn open_or_get_returns_the_same_open_row() {
        let pool = setup().await;
        let (tenant, instance, contact) = seed(&pool).await;
        let repo = SqlConversationRepository::new(pool);

        let first = repo.open_or_get(&tenant, &instance, &contact).await.expect("open");
        let second = repo.open_or_get(&tenant, &instance, &contact).await.expect("get");

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ConversationStatus::Open);
    }

    #[tokio::test]
    async fn closing_reopens_a_fresh_conversation_next_time() {
        let pool = setup().await;
        let (tenant, instance, contact) = seed(&pool).await;
        let repo = SqlConversationRepository::new(pool);

        let first = repo.open_or_get(&tenant, &instance, &contact).await.expect("open");
        repo.close(&first.id).await.expect("close");

        let second = repo.open_or_get(&tenant, &instance, &contact).await.expect("reopen");
        assert_ne!(first.id, second.id, "a closed conversation is never reused");
    }

    #[tokio::test]
    async fn crm_chat_id_is_adopted_once() {
        let pool = setup().await;
        let (tenant, instance, contact) = seed(&pool).await;
        let repo = SqlConversationRepository::new(pool);

        let conversation = repo.open_or_get(&tenant, &instance, &contact).await.expect("open");
        repo.set_crm_chat_id(&conversation.id, "chat-42").await.expect("set");
        repo.set_crm_chat_id(&conversation.id, "chat-99").await.expect("second set is a no-op");

        let found = repo
            .find_open_by_crm_chat(&tenant, "chat-42")
            .await
            .expect("find")
            .expect("resolvable by chat id");
        assert_eq!(found.id, conversation.id);
        assert!(repo.find_open_by_crm_chat(&tenant, "chat-99").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn concurrent_opens_converge_on_one_conversation() {
        let pool = setup().await;
        let (tenant, instance, contact) = seed(&pool).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = SqlConversationRepository::new(pool.clone());
            let (tenant, instance, contact) =
                (tenant.clone(), instance.clone(), contact.clone());
            handles.push(tokio::spawn(async move {
                repo.open_or_get(&tenant, &instance, &contact).await
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let conversation = handle.await.expect("join").expect("open");
            ids.insert(conversation.id.0);
        }

        assert_eq!(ids.len(), 1, "all concurrent opens must resolve to one open conversation");
    }
}
