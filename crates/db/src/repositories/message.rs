use chrono::Utc;
use sqlx::Row;

use waline_core::{
    ConversationId, Message, MessageDirection, MessageId, MessageStatus,
};

use super::{parse_timestamp, MessageRepository, RepositoryError};
use crate::DbPool;

/// Result of the idempotent insert: either a new row landed or the external
/// id was already recorded and nothing changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id, conversation_id, direction, body, media_url, wa_message_id, \
     crm_message_id, delivery_status, created_at, updated_at";

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let conversation_id: String =
        row.try_get("conversation_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let direction_raw: String =
        row.try_get("direction").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let body: String = row.try_get("body").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let media_url: Option<String> =
        row.try_get("media_url").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let wa_message_id: Option<String> =
        row.try_get("wa_message_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let crm_message_id: Option<String> =
        row.try_get("crm_message_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let delivery_status_raw: String =
        row.try_get("delivery_status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let direction = MessageDirection::parse(&direction_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown message direction `{direction_raw}`"))
    })?;
    let delivery_status = MessageStatus::parse(&delivery_status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown delivery status `{delivery_status_raw}`"))
    })?;

    Ok(Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        direction,
        body,
        media_url,
        wa_message_id,
        crm_message_id,
        delivery_status,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn insert(&self, message: Message) -> Result<InsertOutcome, RepositoryError> {
        // INSERT OR IGNORE against the external-id unique indexes is the
        // insert-or-detect-conflict idempotency check: zero rows affected
        // means the id was already processed. Messages without an external
        // id never conflict and are always stored.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message
                 (id, conversation_id, direction, body, media_url, wa_message_id,
                  crm_message_id, delivery_status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&message.conversation_id.0)
        .bind(message.direction.as_str())
        .bind(&message.body)
        .bind(message.media_url.as_deref())
        .bind(message.wa_message_id.as_deref())
        .bind(message.crm_message_id.as_deref())
        .bind(message.delivery_status.as_str())
        .bind(message.created_at.to_rfc3339())
        .bind(message.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn update_delivery_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE message SET delivery_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_wa_id(
        &self,
        wa_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let statement = format!("SELECT {SELECT_COLUMNS} FROM message WHERE wa_message_id = ?");
        let row = sqlx::query(&statement).bind(wa_message_id).fetch_optional(&self.pool).await?;
        match row {
            Some(ref r) => Ok(Some(row_to_message(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_crm_id(
        &self,
        crm_message_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let statement = format!("SELECT {SELECT_COLUMNS} FROM message WHERE crm_message_id = ?");
        let row = sqlx::query(&statement).bind(crm_message_id).fetch_optional(&self.pool).await?;
        match row {
            Some(ref r) => Ok(Some(row_to_message(r)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use waline_core::domain::prefixed_id;
    use waline_core::{
        ConversationId, Instance, InstanceId, InstanceStatus, Message, MessageDirection,
        MessageId, MessageStatus, TenantId,
    };

    use super::{InsertOutcome, SqlMessageRepository};
    use crate::repositories::{
        ContactRepository, ConversationRepository, InstanceRepository, MessageRepository,
        SqlContactRepository, SqlConversationRepository, SqlInstanceRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> (sqlx::SqlitePool, ConversationId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

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
        let conversation = SqlConversationRepository::new(pool.clone())
            .open_or_get(&tenant, &InstanceId("INST-001".to_string()), &contact.id)
            .await
            .expect("conversation");

        (pool, conversation.id)
    }

    fn inbound(conversation: &ConversationId, wa_id: Option<&str>) -> Message {
        let now = Utc::now();
        Message {
            id: MessageId(prefixed_id("MSG")),
            conversation_id: conversation.clone(),
            direction: MessageDirection::Inbound,
            body: "hello".to_string(),
            media_url: None,
            wa_message_id: wa_id.map(str::to_string),
            crm_message_id: None,
            delivery_status: MessageStatus::Received,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_external_id_is_detected_not_inserted() {
        let (pool, conversation) = setup().await;
        let repo = SqlMessageRepository::new(pool.clone());

        let first = repo.insert(inbound(&conversation, Some("wamsg-1"))).await.expect("insert");
        assert_eq!(first, InsertOutcome::Inserted);

        let replay = repo.insert(inbound(&conversation, Some("wamsg-1"))).await.expect("replay");
        assert_eq!(replay, InsertOutcome::Duplicate);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn messages_without_external_ids_bypass_the_guard() {
        let (pool, conversation) = setup().await;
        let repo = SqlMessageRepository::new(pool.clone());

        assert_eq!(
            repo.insert(inbound(&conversation, None)).await.expect("insert"),
            InsertOutcome::Inserted
        );
        assert_eq!(
            repo.insert(inbound(&conversation, None)).await.expect("insert again"),
            InsertOutcome::Inserted
        );

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn delivery_status_updates_persist() {
        let (pool, conversation) = setup().await;
        let repo = SqlMessageRepository::new(pool);

        let message = inbound(&conversation, Some("wamsg-1"));
        let id = message.id.clone();
        repo.insert(message).await.expect("insert");

        repo.update_delivery_status(&id, MessageStatus::Failed).await.expect("update");

        let reloaded = repo.find_by_wa_id("wamsg-1").await.expect("find").expect("exists");
        assert_eq!(reloaded.delivery_status, MessageStatus::Failed);
    }
}
