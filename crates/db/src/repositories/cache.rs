use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::domain::analysis::AnalysisResult;
use tollgate_core::domain::cache::{AnalysisCacheEntry, CacheEntry, CacheStats};
use tollgate_core::domain::tenant::TenantId;

use super::decode::{
    format_decimal, format_timestamp, parse_decimal, parse_json, parse_timestamp, parse_u32,
    parse_u64, to_i64, to_json,
};
use super::{AnalysisCacheRepository, PromptCacheRepository, RepositoryError};
use crate::DbPool;

const PROMPT_CACHE_COLUMNS: &str = "tenant_id, prompt_hash, response, provider, model,
    original_cost, input_tokens, output_tokens, hit_count, last_used_at, expires_at, active,
    created_at";

const ANALYSIS_CACHE_COLUMNS: &str = "tenant_id, content_hash, result_json, provider, model,
    processing_ms, hit_count, last_used_at, expires_at, created_at";

pub struct SqlPromptCacheRepository {
    pool: DbPool,
}

impl SqlPromptCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromptCacheRepository for SqlPromptCacheRepository {
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        prompt_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PROMPT_CACHE_COLUMNS} FROM prompt_cache
             WHERE tenant_id = ? AND prompt_hash = ? AND active = 1 AND expires_at > ?"
        ))
        .bind(tenant_id.as_str())
        .bind(prompt_hash)
        .bind(format_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(prompt_entry_from_row).transpose()
    }

    async fn record_hit(
        &self,
        tenant_id: &TenantId,
        prompt_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE prompt_cache
             SET hit_count = hit_count + 1, last_used_at = ?
             WHERE tenant_id = ? AND prompt_hash = ?",
        )
        .bind(format_timestamp(now))
        .bind(tenant_id.as_str())
        .bind(prompt_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO prompt_cache (
                tenant_id,
                prompt_hash,
                response,
                provider,
                model,
                original_cost,
                input_tokens,
                output_tokens,
                hit_count,
                last_used_at,
                expires_at,
                active,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, prompt_hash) DO UPDATE SET
                response = excluded.response,
                provider = excluded.provider,
                model = excluded.model,
                original_cost = excluded.original_cost,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                hit_count = excluded.hit_count,
                last_used_at = excluded.last_used_at,
                expires_at = excluded.expires_at,
                active = excluded.active,
                created_at = excluded.created_at",
        )
        .bind(entry.tenant_id.as_str())
        .bind(&entry.prompt_hash)
        .bind(&entry.response)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(format_decimal(entry.original_cost))
        .bind(i64::from(entry.input_tokens))
        .bind(i64::from(entry.output_tokens))
        .bind(to_i64("hit_count", entry.hit_count)?)
        .bind(format_timestamp(entry.last_used_at))
        .bind(format_timestamp(entry.expires_at))
        .bind(entry.active)
        .bind(format_timestamp(entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge(&self, tenant_id: Option<&TenantId>) -> Result<u64, RepositoryError> {
        let tenant = tenant_id.map(TenantId::as_str);
        let result = sqlx::query("DELETE FROM prompt_cache WHERE ? IS NULL OR tenant_id = ?")
            .bind(tenant)
            .bind(tenant)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM prompt_cache WHERE expires_at <= ? OR active = 0")
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn stats(
        &self,
        tenant_id: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<CacheStats, RepositoryError> {
        let tenant = tenant_id.map(TenantId::as_str);
        let rows = sqlx::query(
            "SELECT original_cost, hit_count, expires_at, active
             FROM prompt_cache
             WHERE ? IS NULL OR tenant_id = ?",
        )
        .bind(tenant)
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = CacheStats::default();
        for row in rows {
            let expires_at = parse_timestamp("expires_at", row.try_get("expires_at")?)?;
            let active: bool = row.try_get("active")?;
            let hits = parse_u64("hit_count", row.try_get("hit_count")?)?;
            let original_cost = parse_decimal("original_cost", row.try_get("original_cost")?)?;

            stats.total_entries += 1;
            if active && expires_at > now {
                stats.live_entries += 1;
            } else {
                stats.expired_entries += 1;
            }
            stats.total_hits += hits;
            stats.provider_cost_avoided += original_cost * Decimal::from(hits);
        }

        Ok(stats)
    }
}

pub struct SqlAnalysisCacheRepository {
    pool: DbPool,
}

impl SqlAnalysisCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisCacheRepository for SqlAnalysisCacheRepository {
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisCacheEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYSIS_CACHE_COLUMNS} FROM analysis_cache
             WHERE tenant_id = ? AND content_hash = ? AND expires_at > ?"
        ))
        .bind(tenant_id.as_str())
        .bind(content_hash)
        .bind(format_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(analysis_entry_from_row).transpose()
    }

    async fn record_hit(
        &self,
        tenant_id: &TenantId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE analysis_cache
             SET hit_count = hit_count + 1, last_used_at = ?
             WHERE tenant_id = ? AND content_hash = ?",
        )
        .bind(format_timestamp(now))
        .bind(tenant_id.as_str())
        .bind(content_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, entry: AnalysisCacheEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO analysis_cache (
                tenant_id,
                content_hash,
                result_json,
                provider,
                model,
                processing_ms,
                hit_count,
                last_used_at,
                expires_at,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, content_hash) DO UPDATE SET
                result_json = excluded.result_json,
                provider = excluded.provider,
                model = excluded.model,
                processing_ms = excluded.processing_ms,
                hit_count = excluded.hit_count,
                last_used_at = excluded.last_used_at,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at",
        )
        .bind(entry.tenant_id.as_str())
        .bind(&entry.content_hash)
        .bind(to_json("result_json", &entry.result)?)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(to_i64("processing_ms", entry.processing_ms)?)
        .bind(to_i64("hit_count", entry.hit_count)?)
        .bind(format_timestamp(entry.last_used_at))
        .bind(format_timestamp(entry.expires_at))
        .bind(format_timestamp(entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM analysis_cache WHERE expires_at <= ?")
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn prompt_entry_from_row(row: SqliteRow) -> Result<CacheEntry, RepositoryError> {
    Ok(CacheEntry {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        prompt_hash: row.try_get("prompt_hash")?,
        response: row.try_get("response")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        original_cost: parse_decimal("original_cost", row.try_get("original_cost")?)?,
        input_tokens: parse_u32("input_tokens", row.try_get("input_tokens")?)?,
        output_tokens: parse_u32("output_tokens", row.try_get("output_tokens")?)?,
        hit_count: parse_u64("hit_count", row.try_get("hit_count")?)?,
        last_used_at: parse_timestamp("last_used_at", row.try_get("last_used_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        active: row.try_get("active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn analysis_entry_from_row(row: SqliteRow) -> Result<AnalysisCacheEntry, RepositoryError> {
    let result_json = row.try_get::<String, _>("result_json")?;

    Ok(AnalysisCacheEntry {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        content_hash: row.try_get("content_hash")?,
        result: parse_json::<AnalysisResult>("result_json", &result_json)?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        processing_ms: parse_u64("processing_ms", row.try_get("processing_ms")?)?,
        hit_count: parse_u64("hit_count", row.try_get("hit_count")?)?,
        last_used_at: parse_timestamp("last_used_at", row.try_get("last_used_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use tollgate_core::domain::analysis::{AnalysisResult, Intention, Sentiment};
    use tollgate_core::domain::cache::{AnalysisCacheEntry, CacheEntry};
    use tollgate_core::domain::tenant::TenantId;

    use super::{SqlAnalysisCacheRepository, SqlPromptCacheRepository};
    use crate::repositories::{AnalysisCacheRepository, PromptCacheRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn entry(tenant: &str, hash: &str, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(
            TenantId::new(tenant),
            hash,
            "Our pro plan costs $49.",
            "openai",
            "gpt-4o-mini",
            Decimal::new(50, 2),
            120,
            40,
            Duration::days(30),
            now,
        )
    }

    #[tokio::test]
    async fn prompt_cache_round_trip_and_expiry() {
        let pool = setup_pool().await;
        let repo = SqlPromptCacheRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");
        let tenant = TenantId::new("t-cache-1");

        repo.upsert(entry("t-cache-1", "abc", now)).await.expect("upsert");

        let found = repo.find_live(&tenant, "abc", now).await.expect("find");
        assert_eq!(found, Some(entry("t-cache-1", "abc", now)));

        assert!(repo.record_hit(&tenant, "abc", now + Duration::minutes(1)).await.expect("hit"));
        let hit = repo.find_live(&tenant, "abc", now).await.expect("find").expect("live entry");
        assert_eq!(hit.hit_count, 1);
        assert_eq!(hit.original_cost, Decimal::new(50, 2));

        let later = now + Duration::days(31);
        assert_eq!(repo.find_live(&tenant, "abc", later).await.expect("find"), None);
        assert_eq!(repo.purge_expired(later).await.expect("purge expired"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn prompt_cache_is_tenant_scoped_and_purgeable() {
        let pool = setup_pool().await;
        let repo = SqlPromptCacheRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");

        repo.upsert(entry("t-a", "same", now)).await.expect("upsert a");
        repo.upsert(entry("t-b", "same", now)).await.expect("upsert b");
        repo.record_hit(&TenantId::new("t-a"), "same", now).await.expect("hit");

        let stats = repo.stats(None, now).await.expect("stats");
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.provider_cost_avoided, Decimal::new(50, 2));

        assert_eq!(repo.purge(Some(&TenantId::new("t-a"))).await.expect("purge"), 1);
        assert!(repo.find_live(&TenantId::new("t-b"), "same", now).await.expect("find").is_some());
        assert_eq!(repo.purge(None).await.expect("purge all"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn analysis_cache_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlAnalysisCacheRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");
        let tenant = TenantId::new("t-analysis");
        let cached = AnalysisCacheEntry {
            tenant_id: tenant.clone(),
            content_hash: "h1".to_string(),
            result: AnalysisResult {
                intentions: vec![Intention::Sales, Intention::Information],
                confidence: 0.8,
                sentiment: Sentiment::Positive,
                keywords: vec!["pricing".to_string()],
            },
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            processing_ms: 310,
            hit_count: 0,
            last_used_at: now,
            expires_at: now + Duration::days(7),
            created_at: now,
        };

        repo.upsert(cached.clone()).await.expect("upsert");
        assert_eq!(repo.find_live(&tenant, "h1", now).await.expect("find"), Some(cached));
        assert!(repo.record_hit(&tenant, "h1", now).await.expect("hit"));
        assert_eq!(
            repo.find_live(&tenant, "h1", now + Duration::days(8)).await.expect("find"),
            None
        );

        pool.close().await;
    }
}
