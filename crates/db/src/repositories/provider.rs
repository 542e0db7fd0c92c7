use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::domain::provider::ProviderConfig;

use super::decode::{format_decimal, format_timestamp, parse_optional_decimal};
use super::{ProviderRepository, RepositoryError};
use crate::DbPool;

pub struct SqlProviderRepository {
    pool: DbPool,
}

impl SqlProviderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderRepository for SqlProviderRepository {
    async fn list(&self) -> Result<Vec<ProviderConfig>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT name, display_name, api_url, default_model, input_token_price,
                    output_token_price, is_active, is_default
             FROM ai_provider
             ORDER BY rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(provider_from_row).collect()
    }

    async fn find(&self, name: &str) -> Result<Option<ProviderConfig>, RepositoryError> {
        let row = sqlx::query(
            "SELECT name, display_name, api_url, default_model, input_token_price,
                    output_token_price, is_active, is_default
             FROM ai_provider
             WHERE name = ?",
        )
        .bind(name.trim().to_ascii_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        row.map(provider_from_row).transpose()
    }

    async fn save(&self, provider: ProviderConfig) -> Result<(), RepositoryError> {
        let now = format_timestamp(Utc::now());
        let name = provider.name.trim().to_ascii_lowercase();
        let mut tx = self.pool.begin().await?;

        if provider.is_default {
            sqlx::query("UPDATE ai_provider SET is_default = 0, updated_at = ? WHERE name <> ?")
                .bind(&now)
                .bind(&name)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO ai_provider (
                name,
                display_name,
                api_url,
                default_model,
                input_token_price,
                output_token_price,
                is_active,
                is_default,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                display_name = excluded.display_name,
                api_url = excluded.api_url,
                default_model = excluded.default_model,
                input_token_price = excluded.input_token_price,
                output_token_price = excluded.output_token_price,
                is_active = excluded.is_active,
                is_default = excluded.is_default,
                updated_at = excluded.updated_at",
        )
        .bind(&name)
        .bind(&provider.display_name)
        .bind(&provider.api_url)
        .bind(&provider.default_model)
        .bind(provider.input_token_price.map(format_decimal))
        .bind(provider.output_token_price.map(format_decimal))
        .bind(provider.is_active)
        .bind(provider.is_default)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn provider_from_row(row: SqliteRow) -> Result<ProviderConfig, RepositoryError> {
    Ok(ProviderConfig {
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        api_url: row.try_get("api_url")?,
        default_model: row.try_get("default_model")?,
        input_token_price: parse_optional_decimal(
            "input_token_price",
            row.try_get("input_token_price")?,
        )?,
        output_token_price: parse_optional_decimal(
            "output_token_price",
            row.try_get("output_token_price")?,
        )?,
        is_active: row.try_get("is_active")?,
        is_default: row.try_get("is_default")?,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use tollgate_core::domain::provider::{select_provider, ProviderConfig};

    use super::SqlProviderRepository;
    use crate::repositories::ProviderRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn provider(name: &str, is_default: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            api_url: format!("https://{name}.example.test"),
            default_model: "model-a".to_string(),
            input_token_price: Some(Decimal::new(15, 8)),
            output_token_price: None,
            is_active: true,
            is_default,
        }
    }

    #[tokio::test]
    async fn saving_a_default_clears_previous_default() {
        let pool = setup_pool().await;
        let repo = SqlProviderRepository::new(pool.clone());

        repo.save(provider("openai", true)).await.expect("save openai");
        repo.save(provider("anthropic", false)).await.expect("save anthropic");
        repo.save(provider("ollama", true)).await.expect("save ollama");

        let providers = repo.list().await.expect("list");
        let names: Vec<&str> = providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["openai", "anthropic", "ollama"]);
        assert_eq!(providers.iter().filter(|p| p.is_default).count(), 1);
        assert_eq!(select_provider(&providers).map(|p| p.name.as_str()), Some("ollama"));

        pool.close().await;
    }

    #[tokio::test]
    async fn prices_round_trip_as_optional_decimals() {
        let pool = setup_pool().await;
        let repo = SqlProviderRepository::new(pool.clone());

        repo.save(provider("openai", true)).await.expect("save");
        let found = repo.find("OpenAI").await.expect("find").expect("provider exists");
        assert_eq!(found.input_token_price, Some(Decimal::new(15, 8)));
        assert_eq!(found.output_token_price, None);
        assert!(repo.find("mistral").await.expect("find").is_none());

        pool.close().await;
    }
}
