use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::domain::automation::RuleId;
use tollgate_core::domain::message::{
    Contact, ContactId, Conversation, ConversationId, OutboundReply, Priority,
};
use tollgate_core::domain::tenant::TenantId;

use super::decode::{format_timestamp, parse_timestamp, parse_u32};
use super::{CrmRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCrmRepository {
    pool: DbPool,
}

impl SqlCrmRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn tags_for(&self, contact_id: &str) -> Result<Vec<String>, RepositoryError> {
        let tags = sqlx::query_scalar(
            "SELECT tag FROM contact_tag WHERE contact_id = ? ORDER BY created_at ASC, tag ASC",
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tags)
    }
}

#[async_trait]
impl CrmRepository for SqlCrmRepository {
    async fn find_contact(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query("SELECT id, tenant_id, display_name, is_vip FROM contact WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tags = self.tags_for(&id.0).await?;
        Ok(Some(Contact {
            id: ContactId(row.try_get("id")?),
            tenant_id: TenantId(row.try_get("tenant_id")?),
            display_name: row.try_get("display_name")?,
            is_vip: row.try_get("is_vip")?,
            tags,
        }))
    }

    async fn save_contact(
        &self,
        contact: Contact,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let created_at = format_timestamp(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO contact (id, tenant_id, display_name, is_vip, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                is_vip = excluded.is_vip",
        )
        .bind(&contact.id.0)
        .bind(contact.tenant_id.as_str())
        .bind(&contact.display_name)
        .bind(contact.is_vip)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        for tag in &contact.tags {
            sqlx::query(
                "INSERT OR IGNORE INTO contact_tag (contact_id, tag, created_at) VALUES (?, ?, ?)",
            )
            .bind(&contact.id.0)
            .bind(tag)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, contact_id, message_count, assigned_agent, priority
             FROM conversation
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn save_conversation(
        &self,
        conversation: Conversation,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation (
                id,
                tenant_id,
                contact_id,
                message_count,
                assigned_agent,
                priority,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                message_count = excluded.message_count,
                assigned_agent = excluded.assigned_agent,
                priority = excluded.priority",
        )
        .bind(&conversation.id.0)
        .bind(conversation.tenant_id.as_str())
        .bind(&conversation.contact_id.0)
        .bind(i64::from(conversation.message_count))
        .bind(&conversation.assigned_agent)
        .bind(conversation.priority.as_str())
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_tag(
        &self,
        contact_id: &ContactId,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO contact_tag (contact_id, tag, created_at) VALUES (?, ?, ?)",
        )
        .bind(&contact_id.0)
        .bind(tag)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn assign_agent(
        &self,
        conversation_id: &ConversationId,
        agent_id: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE conversation SET assigned_agent = ? WHERE id = ?")
            .bind(agent_id)
            .bind(&conversation_id.0)
            .execute(&self.pool)
            .await?;

        expect_one(result.rows_affected(), "conversation", &conversation_id.0)
    }

    async fn set_priority(
        &self,
        conversation_id: &ConversationId,
        priority: Priority,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE conversation SET priority = ? WHERE id = ?")
            .bind(priority.as_str())
            .bind(&conversation_id.0)
            .execute(&self.pool)
            .await?;

        expect_one(result.rows_affected(), "conversation", &conversation_id.0)
    }

    async fn mark_vip(&self, contact_id: &ContactId) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE contact SET is_vip = 1 WHERE id = ?")
            .bind(&contact_id.0)
            .execute(&self.pool)
            .await?;

        expect_one(result.rows_affected(), "contact", &contact_id.0)
    }

    async fn record_reply(&self, reply: OutboundReply) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO outbound_reply (id, tenant_id, conversation_id, rule_id, body, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&reply.id)
        .bind(reply.tenant_id.as_str())
        .bind(&reply.conversation_id.0)
        .bind(reply.rule_id.as_ref().map(|rule_id| rule_id.0.as_str()))
        .bind(&reply.body)
        .bind(format_timestamp(reply.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replies(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<OutboundReply>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, conversation_id, rule_id, body, created_at
             FROM outbound_reply
             WHERE conversation_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OutboundReply {
                    id: row.try_get("id")?,
                    tenant_id: TenantId(row.try_get("tenant_id")?),
                    conversation_id: ConversationId(row.try_get("conversation_id")?),
                    rule_id: row.try_get::<Option<String>, _>("rule_id")?.map(RuleId),
                    body: row.try_get("body")?,
                    created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

fn expect_one(rows_affected: u64, entity: &str, id: &str) -> Result<(), RepositoryError> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(RepositoryError::NotFound(format!("{entity} {id}")))
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    let priority = row.try_get::<String, _>("priority")?;

    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        contact_id: ContactId(row.try_get("contact_id")?),
        message_count: parse_u32("message_count", row.try_get("message_count")?)?,
        assigned_agent: row.try_get("assigned_agent")?,
        priority: Priority::parse(&priority)
            .ok_or_else(|| RepositoryError::Decode(format!("unsupported priority `{priority}`")))?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tollgate_core::domain::automation::RuleId;
    use tollgate_core::domain::message::{
        Contact, ContactId, Conversation, ConversationId, OutboundReply, Priority,
    };
    use tollgate_core::domain::tenant::TenantId;

    use super::SqlCrmRepository;
    use crate::repositories::{CrmRepository, RepositoryError};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn seed(repo: &SqlCrmRepository) -> (ContactId, ConversationId) {
        let tenant = TenantId::new("t-crm");
        let contact = Contact {
            id: ContactId("c-1".to_string()),
            tenant_id: tenant.clone(),
            display_name: "Ana".to_string(),
            is_vip: false,
            tags: vec!["trial".to_string()],
        };
        let conversation = Conversation {
            id: ConversationId("conv-1".to_string()),
            tenant_id: tenant,
            contact_id: contact.id.clone(),
            message_count: 1,
            assigned_agent: None,
            priority: Priority::Normal,
        };
        let ids = (contact.id.clone(), conversation.id.clone());
        repo.save_contact(contact, Utc::now()).await.expect("save contact");
        repo.save_conversation(conversation, Utc::now()).await.expect("save conversation");
        ids
    }

    #[tokio::test]
    async fn tags_are_deduplicated() {
        let pool = setup_pool().await;
        let repo = SqlCrmRepository::new(pool.clone());
        let (contact_id, _) = seed(&repo).await;

        assert!(repo.add_tag(&contact_id, "lead", Utc::now()).await.expect("add tag"));
        assert!(!repo.add_tag(&contact_id, "lead", Utc::now()).await.expect("add tag again"));

        let contact = repo.find_contact(&contact_id).await.expect("find").expect("contact exists");
        assert_eq!(contact.tags.len(), 2);
        assert!(contact.tags.contains(&"lead".to_string()));

        pool.close().await;
    }

    #[tokio::test]
    async fn conversation_mutations_persist() {
        let pool = setup_pool().await;
        let repo = SqlCrmRepository::new(pool.clone());
        let (contact_id, conversation_id) = seed(&repo).await;

        repo.assign_agent(&conversation_id, "agent-7").await.expect("assign");
        repo.set_priority(&conversation_id, Priority::Urgent).await.expect("priority");
        repo.mark_vip(&contact_id).await.expect("vip");

        let conversation =
            repo.find_conversation(&conversation_id).await.expect("find").expect("exists");
        assert_eq!(conversation.assigned_agent.as_deref(), Some("agent-7"));
        assert_eq!(conversation.priority, Priority::Urgent);
        assert!(repo.find_contact(&contact_id).await.expect("find").expect("exists").is_vip);

        let missing = repo.assign_agent(&ConversationId("nope".to_string()), "agent-7").await;
        assert!(matches!(missing, Err(RepositoryError::NotFound(_))));

        pool.close().await;
    }

    #[tokio::test]
    async fn replies_are_listed_in_order() {
        let pool = setup_pool().await;
        let repo = SqlCrmRepository::new(pool.clone());
        let (_, conversation_id) = seed(&repo).await;
        let now = Utc::now();

        for (offset, body) in ["first", "second"].into_iter().enumerate() {
            repo.record_reply(OutboundReply::new(
                TenantId::new("t-crm"),
                conversation_id.clone(),
                Some(RuleId("r-1".to_string())),
                body,
                now + chrono::Duration::seconds(offset as i64),
            ))
            .await
            .expect("record reply");
        }

        let bodies: Vec<String> = repo
            .replies(&conversation_id)
            .await
            .expect("replies")
            .into_iter()
            .map(|reply| reply.body)
            .collect();
        assert_eq!(bodies, vec!["first", "second"]);

        pool.close().await;
    }
}
