use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::domain::automation::{
    Action, ActionOutcome, AutomationRule, ExecutionRecord, ExecutionStatus, RuleCondition,
    RuleId, RuleStats,
};
use tollgate_core::domain::message::{ConversationId, MessageId};
use tollgate_core::domain::tenant::TenantId;

use super::decode::{
    format_timestamp, parse_json, parse_optional_timestamp, parse_timestamp, parse_u64, to_i64,
    to_json,
};
use super::{RepositoryError, RuleRepository};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, tenant_id, name, priority, active, conditions_json, actions_json,
    evaluation_count, execution_count, success_count, error_count, last_executed_at, created_at";

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn active_rules(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<AutomationRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM automation_rule
             WHERE tenant_id = ? AND active = 1
             ORDER BY priority ASC, created_at ASC, id ASC"
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }

    async fn find(&self, id: &RuleId) -> Result<Option<AutomationRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM automation_rule WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(rule_from_row).transpose()
    }

    async fn save(&self, rule: AutomationRule) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO automation_rule (
                id,
                tenant_id,
                name,
                priority,
                active,
                conditions_json,
                actions_json,
                evaluation_count,
                execution_count,
                success_count,
                error_count,
                last_executed_at,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                priority = excluded.priority,
                active = excluded.active,
                conditions_json = excluded.conditions_json,
                actions_json = excluded.actions_json",
        )
        .bind(&rule.id.0)
        .bind(rule.tenant_id.as_str())
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.active)
        .bind(to_json("conditions_json", &rule.conditions)?)
        .bind(to_json("actions_json", &rule.actions)?)
        .bind(to_i64("evaluation_count", rule.stats.evaluation_count)?)
        .bind(to_i64("execution_count", rule.stats.execution_count)?)
        .bind(to_i64("success_count", rule.stats.success_count)?)
        .bind(to_i64("error_count", rule.stats.error_count)?)
        .bind(rule.stats.last_executed_at.map(format_timestamp))
        .bind(format_timestamp(rule.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let executed_at = format_timestamp(record.executed_at);
        let matched = record.status.matched();
        let succeeded = record.status == ExecutionStatus::Executed;
        let errored =
            matches!(record.status, ExecutionStatus::Failed | ExecutionStatus::PartiallyFailed);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO automation_execution (
                id,
                rule_id,
                tenant_id,
                conversation_id,
                message_id,
                status,
                outcomes_json,
                error,
                replied,
                executed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.rule_id.0)
        .bind(record.tenant_id.as_str())
        .bind(&record.conversation_id.0)
        .bind(&record.message_id.0)
        .bind(record.status.as_str())
        .bind(to_json("outcomes_json", &record.outcomes)?)
        .bind(&record.error)
        .bind(record.replied())
        .bind(&executed_at)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE automation_rule SET
                evaluation_count = evaluation_count + 1,
                execution_count = execution_count + ?,
                success_count = success_count + ?,
                error_count = error_count + ?,
                last_executed_at = CASE WHEN ? THEN ? ELSE last_executed_at END
             WHERE id = ?",
        )
        .bind(i64::from(matched))
        .bind(i64::from(succeeded))
        .bind(i64::from(errored))
        .bind(matched)
        .bind(&executed_at)
        .bind(&record.rule_id.0)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(RepositoryError::NotFound(format!("automation rule {}", record.rule_id.0)));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn executions(&self, rule_id: &RuleId) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, tenant_id, conversation_id, message_id, status, outcomes_json,
                    error, executed_at
             FROM automation_execution
             WHERE rule_id = ?
             ORDER BY executed_at ASC, rowid ASC",
        )
        .bind(&rule_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn last_auto_reply_at(
        &self,
        rule_id: &RuleId,
        conversation_id: &ConversationId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(executed_at)
             FROM automation_execution
             WHERE rule_id = ? AND conversation_id = ? AND replied = 1",
        )
        .bind(&rule_id.0)
        .bind(&conversation_id.0)
        .fetch_one(&self.pool)
        .await?;

        parse_optional_timestamp("executed_at", latest)
    }
}

fn rule_from_row(row: SqliteRow) -> Result<AutomationRule, RepositoryError> {
    let conditions_json = row.try_get::<String, _>("conditions_json")?;
    let actions_json = row.try_get::<String, _>("actions_json")?;

    Ok(AutomationRule {
        id: RuleId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        priority: row.try_get("priority")?,
        active: row.try_get("active")?,
        conditions: parse_json::<Vec<RuleCondition>>("conditions_json", &conditions_json)?,
        actions: parse_json::<Vec<Action>>("actions_json", &actions_json)?,
        stats: RuleStats {
            evaluation_count: parse_u64("evaluation_count", row.try_get("evaluation_count")?)?,
            execution_count: parse_u64("execution_count", row.try_get("execution_count")?)?,
            success_count: parse_u64("success_count", row.try_get("success_count")?)?,
            error_count: parse_u64("error_count", row.try_get("error_count")?)?,
            last_executed_at: parse_optional_timestamp(
                "last_executed_at",
                row.try_get("last_executed_at")?,
            )?,
        },
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn execution_from_row(row: SqliteRow) -> Result<ExecutionRecord, RepositoryError> {
    let status = row.try_get::<String, _>("status")?;
    let outcomes_json = row.try_get::<String, _>("outcomes_json")?;

    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        rule_id: RuleId(row.try_get("rule_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        message_id: MessageId(row.try_get("message_id")?),
        status: ExecutionStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Decode(format!("unsupported execution status `{status}`"))
        })?,
        outcomes: parse_json::<Vec<ActionOutcome>>("outcomes_json", &outcomes_json)?,
        error: row.try_get("error")?,
        executed_at: parse_timestamp("executed_at", row.try_get("executed_at")?)?,
    })
}
