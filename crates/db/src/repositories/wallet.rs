use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use tracing::{info, warn};

use tollgate_core::domain::cache::BrokerStats;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::domain::wallet::{
    BillingReconciliation, FinancialHistoryEntry, LedgerTransaction, RechargeRequest,
    TokenUsage, TransactionId, TransactionKind, Wallet,
};
use tollgate_core::errors::DomainError;
use tollgate_core::pricing::client_cost;

use super::decode::{
    format_decimal, format_timestamp, parse_decimal, parse_json, parse_timestamp, parse_u32,
    parse_u64, to_i64, to_json,
};
use super::{
    replayed_recharge, DebitRequest, RepositoryError, WalletRepository, WalletWriteError,
};
use crate::DbPool;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const WALLET_COLUMNS: &str = "tenant_id, balance, total_spent, total_recharged, transaction_count,
    low_balance_threshold, alerts_enabled, currency, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, tenant_id, kind, provider, model, provider_cost,
    client_cost, margin, input_tokens, output_tokens, processing_ms, balance_after,
    metadata_json, created_at";

pub struct SqlWalletRepository {
    pool: DbPool,
    max_attempts: u32,
}

impl SqlWalletRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Runs `mutate` against the wallet inside one transaction, retrying the
    /// whole transaction on lock contention or a lost version check.
    async fn apply<F>(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<LedgerTransaction, WalletWriteError>
    where
        F: Fn(&mut Wallet) -> Result<LedgerTransaction, DomainError> + Send + Sync,
    {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.apply_once(tenant_id, now, &mutate).await {
                Err(WalletWriteError::Repository(error))
                    if error.is_retryable() && attempt < self.max_attempts =>
                {
                    warn!(
                        event_name = "wallet.write.retry",
                        tenant_id = %tenant_id,
                        attempt,
                        error = %error,
                        "wallet write contended, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    async fn find_recharge(
        &self,
        request: &RechargeRequest,
    ) -> Result<Option<LedgerTransaction>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ai_transaction
             WHERE tenant_id = ? AND payment_reference = ?"
        ))
        .bind(request.tenant_id.as_str())
        .bind(&request.payment_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    async fn apply_once<F>(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        mutate: &F,
    ) -> Result<LedgerTransaction, WalletWriteError>
    where
        F: Fn(&mut Wallet) -> Result<LedgerTransaction, DomainError> + Send + Sync,
    {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        // Write first: the wallet row is locked before it is read.
        sqlx::query(
            "INSERT INTO ai_wallet (tenant_id, created_at, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET version = ai_wallet.version",
        )
        .bind(tenant_id.as_str())
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM ai_wallet WHERE tenant_id = ?"))
            .bind(tenant_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;
        let mut wallet = wallet_from_row(row)?;
        let expected_version = wallet.version;

        let transaction = mutate(&mut wallet)?;

        let updated = sqlx::query(
            "UPDATE ai_wallet SET
                balance = ?,
                total_spent = ?,
                total_recharged = ?,
                transaction_count = ?,
                version = ?,
                updated_at = ?
             WHERE tenant_id = ? AND version = ?",
        )
        .bind(format_decimal(wallet.balance))
        .bind(format_decimal(wallet.total_spent))
        .bind(format_decimal(wallet.total_recharged))
        .bind(to_i64("transaction_count", wallet.transaction_count)?)
        .bind(to_i64("version", wallet.version)?)
        .bind(format_timestamp(wallet.updated_at))
        .bind(tenant_id.as_str())
        .bind(to_i64("version", expected_version)?)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        if updated.rows_affected() != 1 {
            return Err(RepositoryError::Conflict(format!(
                "wallet {tenant_id} changed underneath version {expected_version}"
            ))
            .into());
        }

        insert_transaction(&mut tx, &transaction, wallet.transaction_count).await?;
        insert_history(&mut tx, &FinancialHistoryEntry::for_transaction(&transaction)).await?;

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(transaction)
    }
}

#[async_trait]
impl WalletRepository for SqlWalletRepository {
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Wallet>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM ai_wallet WHERE tenant_id = ?"))
            .bind(tenant_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(wallet_from_row).transpose()
    }

    async fn get_or_create(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepositoryError> {
        let fresh = Wallet::new(tenant_id.clone(), now);
        sqlx::query(
            "INSERT INTO ai_wallet (
                tenant_id,
                balance,
                total_spent,
                total_recharged,
                transaction_count,
                low_balance_threshold,
                alerts_enabled,
                currency,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id) DO NOTHING",
        )
        .bind(fresh.tenant_id.as_str())
        .bind(format_decimal(fresh.balance))
        .bind(format_decimal(fresh.total_spent))
        .bind(format_decimal(fresh.total_recharged))
        .bind(0_i64)
        .bind(format_decimal(fresh.low_balance_threshold))
        .bind(fresh.alerts_enabled)
        .bind(&fresh.currency)
        .bind(0_i64)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        self.find(tenant_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("wallet {tenant_id}")))
    }

    async fn debit(
        &self,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, WalletWriteError> {
        let charge = client_cost(request.provider_cost, request.margin);
        let transaction = self
            .apply(&request.tenant_id, now, |wallet| {
                let balance_after = wallet.apply_debit(charge, now)?;
                Ok(LedgerTransaction::usage_debit(
                    request.tenant_id.clone(),
                    request.provider_cost,
                    charge,
                    request.margin,
                    &request.usage,
                    balance_after,
                    now,
                ))
            })
            .await?;

        info!(
            event_name = "wallet.debit.applied",
            tenant_id = %request.tenant_id,
            transaction_id = %transaction.id,
            client_cost = %transaction.client_cost,
            balance_after = %transaction.balance_after,
            cache_hit = request.usage.cache_hit,
            "wallet debited"
        );
        Ok(transaction)
    }

    async fn credit(
        &self,
        request: RechargeRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, WalletWriteError> {
        if let Some(existing) = self.find_recharge(&request).await? {
            return replayed_recharge(existing, &request);
        }

        let applied = self
            .apply(&request.tenant_id, now, |wallet| {
                let balance_after = wallet.apply_credit(request.amount, &request.currency, now)?;
                Ok(LedgerTransaction::recharge_credit(&request, balance_after, now))
            })
            .await;
        let transaction = match applied {
            // Another writer committed the same payment reference first.
            Err(WalletWriteError::Repository(error)) if error.is_unique_violation() => {
                return match self.find_recharge(&request).await? {
                    Some(existing) => replayed_recharge(existing, &request),
                    None => Err(error.into()),
                };
            }
            other => other?,
        };

        info!(
            event_name = "wallet.credit.applied",
            tenant_id = %request.tenant_id,
            transaction_id = %transaction.id,
            amount = %request.amount,
            balance_after = %transaction.balance_after,
            "wallet recharged"
        );
        Ok(transaction)
    }

    async fn transactions(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LedgerTransaction>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ai_transaction
             WHERE tenant_id = ?
             ORDER BY sequence ASC"
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transaction_from_row).collect()
    }

    async fn history(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<FinancialHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, transaction_id, description, amount, balance_after, created_at
             FROM financial_history
             WHERE tenant_id = ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?",
        )
        .bind(tenant_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(FinancialHistoryEntry {
                    id: row.try_get("id")?,
                    tenant_id: TenantId(row.try_get("tenant_id")?),
                    transaction_id: TransactionId(row.try_get("transaction_id")?),
                    description: row.try_get("description")?,
                    amount: parse_decimal("amount", row.try_get("amount")?)?,
                    balance_after: parse_decimal("balance_after", row.try_get("balance_after")?)?,
                    created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    async fn record_reconciliation(
        &self,
        reconciliation: BillingReconciliation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO billing_reconciliation (
                id,
                tenant_id,
                provider,
                model,
                provider_cost,
                client_cost,
                reason,
                resolved,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&reconciliation.id)
        .bind(reconciliation.tenant_id.as_str())
        .bind(&reconciliation.provider)
        .bind(&reconciliation.model)
        .bind(format_decimal(reconciliation.provider_cost))
        .bind(format_decimal(reconciliation.client_cost))
        .bind(&reconciliation.reason)
        .bind(format_timestamp(reconciliation.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn open_reconciliations(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<BillingReconciliation>, RepositoryError> {
        let tenant = tenant_id.map(TenantId::as_str);
        let rows = sqlx::query(
            "SELECT id, tenant_id, provider, model, provider_cost, client_cost, reason, created_at
             FROM billing_reconciliation
             WHERE resolved = 0 AND (? IS NULL OR tenant_id = ?)
             ORDER BY created_at ASC",
        )
        .bind(tenant)
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(BillingReconciliation {
                    id: row.try_get("id")?,
                    tenant_id: TenantId(row.try_get("tenant_id")?),
                    provider: row.try_get("provider")?,
                    model: row.try_get("model")?,
                    provider_cost: parse_decimal("provider_cost", row.try_get("provider_cost")?)?,
                    client_cost: parse_decimal("client_cost", row.try_get("client_cost")?)?,
                    reason: row.try_get("reason")?,
                    created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    async fn usage_stats(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<BrokerStats, RepositoryError> {
        let tenant = tenant_id.map(TenantId::as_str);
        let rows = sqlx::query(
            "SELECT provider_cost, client_cost, input_tokens, output_tokens, cache_hit
             FROM ai_transaction
             WHERE kind = 'usage_debit' AND (? IS NULL OR tenant_id = ?)",
        )
        .bind(tenant)
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BrokerStats::default();
        for row in rows {
            stats.total_requests += 1;
            if row.try_get::<bool, _>("cache_hit")? {
                stats.cache_hits += 1;
            } else {
                stats.cache_misses += 1;
            }
            stats.total_provider_cost +=
                parse_decimal("provider_cost", row.try_get("provider_cost")?)?;
            stats.total_client_cost += parse_decimal("client_cost", row.try_get("client_cost")?)?;
            stats.total_input_tokens += parse_u64("input_tokens", row.try_get("input_tokens")?)?;
            stats.total_output_tokens +=
                parse_u64("output_tokens", row.try_get("output_tokens")?)?;
        }

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM billing_reconciliation
             WHERE resolved = 0 AND (? IS NULL OR tenant_id = ?)",
        )
        .bind(tenant)
        .bind(tenant)
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;
        stats.pending_reconciliations = parse_u64("count", pending)?;

        Ok(stats)
    }
}

async fn insert_transaction(
    tx: &mut Transaction<'_, Sqlite>,
    transaction: &LedgerTransaction,
    sequence: u64,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO ai_transaction (
            id,
            tenant_id,
            sequence,
            kind,
            provider,
            model,
            provider_cost,
            client_cost,
            margin,
            input_tokens,
            output_tokens,
            processing_ms,
            cache_hit,
            balance_after,
            metadata_json,
            payment_reference,
            created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transaction.id.0)
    .bind(transaction.tenant_id.as_str())
    .bind(to_i64("sequence", sequence)?)
    .bind(transaction.kind.as_str())
    .bind(transaction.provider.as_deref())
    .bind(transaction.model.as_deref())
    .bind(format_decimal(transaction.provider_cost))
    .bind(format_decimal(transaction.client_cost))
    .bind(format_decimal(transaction.margin))
    .bind(i64::from(transaction.usage.input_tokens))
    .bind(i64::from(transaction.usage.output_tokens))
    .bind(to_i64("processing_ms", transaction.processing_ms)?)
    .bind(transaction.is_cache_hit())
    .bind(format_decimal(transaction.balance_after))
    .bind(to_json("metadata_json", &transaction.metadata)?)
    .bind(transaction.payment_reference())
    .bind(format_timestamp(transaction.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &FinancialHistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO financial_history (
            id,
            tenant_id,
            transaction_id,
            description,
            amount,
            balance_after,
            created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(entry.tenant_id.as_str())
    .bind(&entry.transaction_id.0)
    .bind(&entry.description)
    .bind(format_decimal(entry.amount))
    .bind(format_decimal(entry.balance_after))
    .bind(format_timestamp(entry.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn wallet_from_row(row: SqliteRow) -> Result<Wallet, RepositoryError> {
    Ok(Wallet {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        balance: parse_decimal("balance", row.try_get("balance")?)?,
        total_spent: parse_decimal("total_spent", row.try_get("total_spent")?)?,
        total_recharged: parse_decimal("total_recharged", row.try_get("total_recharged")?)?,
        transaction_count: parse_u64("transaction_count", row.try_get("transaction_count")?)?,
        low_balance_threshold: parse_decimal(
            "low_balance_threshold",
            row.try_get("low_balance_threshold")?,
        )?,
        alerts_enabled: row.try_get("alerts_enabled")?,
        currency: row.try_get("currency")?,
        version: parse_u64("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn transaction_from_row(row: SqliteRow) -> Result<LedgerTransaction, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = TransactionKind::parse(&kind_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown transaction kind `{kind_raw}`"))
    })?;
    let metadata_json = row.try_get::<String, _>("metadata_json")?;

    Ok(LedgerTransaction {
        id: TransactionId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        kind,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        provider_cost: parse_decimal("provider_cost", row.try_get("provider_cost")?)?,
        client_cost: parse_decimal("client_cost", row.try_get("client_cost")?)?,
        margin: parse_decimal("margin", row.try_get("margin")?)?,
        usage: TokenUsage::new(
            parse_u32("input_tokens", row.try_get("input_tokens")?)?,
            parse_u32("output_tokens", row.try_get("output_tokens")?)?,
        ),
        processing_ms: parse_u64("processing_ms", row.try_get("processing_ms")?)?,
        balance_after: parse_decimal("balance_after", row.try_get("balance_after")?)?,
        metadata: parse_json::<BTreeMap<String, String>>("metadata_json", &metadata_json)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use tollgate_core::domain::tenant::TenantId;
    use tollgate_core::domain::wallet::{
        LedgerTransaction, RechargeRequest, TokenUsage, TransactionId, UsageMetadata,
    };
    use tollgate_core::errors::DomainError;
    use tollgate_core::ledger::verify_running_total;

    use super::{insert_transaction, SqlWalletRepository};
    use crate::repositories::{DebitRequest, WalletRepository, WalletWriteError};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn recharge(tenant: &TenantId, amount: Decimal) -> RechargeRequest {
        RechargeRequest {
            tenant_id: tenant.clone(),
            amount,
            currency: "USD".to_string(),
            payment_reference: "pi_123".to_string(),
            provenance: "stripe".to_string(),
        }
    }

    fn debit(tenant: &TenantId, provider_cost: Decimal, cache_hit: bool) -> DebitRequest {
        DebitRequest {
            tenant_id: tenant.clone(),
            provider_cost,
            margin: Decimal::new(30, 2),
            usage: UsageMetadata {
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                usage: TokenUsage::new(100, 50),
                processing_ms: 420,
                cache_hit,
                ..UsageMetadata::default()
            },
        }
    }

    #[tokio::test]
    async fn debit_applies_margin_and_snapshots_balance() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-1");

        repo.credit(recharge(&tenant, Decimal::ONE), Utc::now()).await.expect("credit");
        let first = repo
            .debit(debit(&tenant, Decimal::new(50, 2), false), Utc::now())
            .await
            .expect("first debit");
        let second = repo
            .debit(debit(&tenant, Decimal::new(5, 2), true), Utc::now())
            .await
            .expect("symbolic debit");

        assert_eq!(first.client_cost, Decimal::new(65, 2));
        assert_eq!(first.balance_after, Decimal::new(35, 2));
        assert_eq!(second.client_cost, Decimal::new(65, 3));
        assert_eq!(second.balance_after, Decimal::new(285, 3));

        let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
        assert_eq!(wallet.balance, Decimal::new(285, 3));
        assert_eq!(wallet.transaction_count, 3);

        let transactions = repo.transactions(&tenant).await.expect("transactions");
        assert_eq!(transactions.len(), 3);
        assert_eq!(transactions[1].id, first.id);
        assert_eq!(transactions[2].balance_after, second.balance_after);
        assert!(transactions[2].is_cache_hit());
        assert!(verify_running_total(&wallet, &transactions).valid);

        let history = repo.history(&tenant, 10).await.expect("history");
        assert_eq!(history.len(), 3);

        pool.close().await;
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_no_trace() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-2");

        repo.credit(recharge(&tenant, Decimal::new(10, 2)), Utc::now()).await.expect("credit");
        let error = repo
            .debit(debit(&tenant, Decimal::new(50, 2), false), Utc::now())
            .await
            .expect_err("debit must be refused");

        assert!(matches!(
            error,
            WalletWriteError::Rejected(DomainError::InsufficientBalance { .. })
        ));
        let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
        assert_eq!(wallet.balance, Decimal::new(10, 2));
        assert_eq!(repo.transactions(&tenant).await.expect("transactions").len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn replayed_recharge_returns_the_original_transaction() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-replay");

        let first =
            repo.credit(recharge(&tenant, Decimal::new(100, 0)), Utc::now()).await.expect("credit");
        let replay =
            repo.credit(recharge(&tenant, Decimal::new(100, 0)), Utc::now()).await.expect("replay");
        assert_eq!(first.id, replay.id);

        let reused = repo
            .credit(recharge(&tenant, Decimal::new(5, 0)), Utc::now())
            .await
            .expect_err("reference reused with another amount");
        assert!(matches!(
            reused,
            WalletWriteError::Rejected(DomainError::PaymentReferenceReused { .. })
        ));

        let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
        assert_eq!(wallet.balance, Decimal::new(100, 0));
        assert_eq!(repo.transactions(&tenant).await.expect("transactions").len(), 1);

        let other_tenant = TenantId::new("t-wallet-replay-2");
        repo.credit(recharge(&other_tenant, Decimal::ONE), Utc::now())
            .await
            .expect("references are scoped per tenant");

        pool.close().await;
    }

    #[tokio::test]
    async fn recharge_currency_must_match_wallet() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-eur");

        let error = repo
            .credit(
                RechargeRequest { currency: "EUR".to_string(), ..recharge(&tenant, Decimal::ONE) },
                Utc::now(),
            )
            .await
            .expect_err("EUR into a USD wallet");

        assert!(matches!(error, WalletWriteError::Rejected(DomainError::CurrencyMismatch { .. })));
        assert!(repo.transactions(&tenant).await.expect("transactions").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_payment_reference_is_refused_by_the_schema() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-unique");
        let original =
            repo.credit(recharge(&tenant, Decimal::ONE), Utc::now()).await.expect("credit");

        let forged = LedgerTransaction { id: TransactionId::generate(), ..original };
        let mut tx = pool.begin().await.expect("begin");
        let error = insert_transaction(&mut tx, &forged, 99).await.expect_err("unique index");
        assert!(error.is_unique_violation());
        drop(tx);

        pool.close().await;
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-3");

        let first = repo.get_or_create(&tenant, Utc::now()).await.expect("create");
        let second = repo.get_or_create(&tenant, Utc::now()).await.expect("reuse");
        assert_eq!(first, second);
        assert_eq!(first.balance, Decimal::ZERO);

        pool.close().await;
    }

    #[tokio::test]
    async fn usage_stats_split_hits_and_misses() {
        let pool = setup_pool().await;
        let repo = SqlWalletRepository::new(pool.clone());
        let tenant = TenantId::new("t-wallet-4");

        repo.credit(recharge(&tenant, Decimal::ONE), Utc::now()).await.expect("credit");
        repo.debit(debit(&tenant, Decimal::new(50, 2), false), Utc::now()).await.expect("miss");
        repo.debit(debit(&tenant, Decimal::new(5, 2), true), Utc::now()).await.expect("hit");

        let stats = repo.usage_stats(Some(&tenant)).await.expect("stats");
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.total_provider_cost, Decimal::new(55, 2));
        assert_eq!(stats.total_client_cost, Decimal::new(715, 3));
        assert_eq!(stats.total_input_tokens, 200);

        pool.close().await;
    }
}
