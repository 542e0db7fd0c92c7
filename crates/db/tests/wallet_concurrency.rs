use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tempfile::TempDir;

use tollgate_core::domain::tenant::TenantId;
use tollgate_core::domain::wallet::{RechargeRequest, TokenUsage, UsageMetadata};
use tollgate_core::ledger::verify_running_total;
use tollgate_db::repositories::{
    DebitRequest, SqlWalletRepository, WalletRepository, WalletWriteError,
};
use tollgate_db::{connect_with_settings, migrations, DbPool};

async fn file_pool(dir: &TempDir) -> DbPool {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("tollgate.db").display());
    let pool = connect_with_settings(&url, 8, 30).await.expect("connect file pool");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

fn usage_debit(tenant: &TenantId, provider_cost: Decimal) -> DebitRequest {
    DebitRequest {
        tenant_id: tenant.clone(),
        provider_cost,
        margin: Decimal::new(30, 2),
        usage: UsageMetadata {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            usage: TokenUsage::new(40, 10),
            processing_ms: 12,
            ..UsageMetadata::default()
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_lose_an_update() {
    let dir = TempDir::new().expect("temp dir");
    let pool = file_pool(&dir).await;
    let repo = Arc::new(SqlWalletRepository::new(pool.clone()).with_max_attempts(50));
    let tenant = TenantId::new("t-race");

    repo.credit(
        RechargeRequest {
            tenant_id: tenant.clone(),
            amount: Decimal::new(1000, 2),
            currency: "USD".to_string(),
            payment_reference: "pay_race".to_string(),
            provenance: "test".to_string(),
        },
        Utc::now(),
    )
    .await
    .expect("seed credit");

    // 0.10 provider cost at 30% margin charges 0.13 per call.
    let mut handles = Vec::new();
    for _ in 0..40 {
        let repo = Arc::clone(&repo);
        let tenant = tenant.clone();
        handles.push(tokio::spawn(async move {
            repo.debit(usage_debit(&tenant, Decimal::new(10, 2)), Utc::now()).await
        }));
    }

    let mut applied = 0_u32;
    let mut refused = 0_u32;
    for handle in handles {
        match handle.await.expect("task joined") {
            Ok(_) => applied += 1,
            Err(WalletWriteError::Rejected(_)) => refused += 1,
            Err(other) => panic!("unexpected wallet error: {other}"),
        }
    }

    // floor(10.00 / 0.13) = 76 would fit, so all 40 must land.
    assert_eq!(applied, 40);
    assert_eq!(refused, 0);

    let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
    assert_eq!(wallet.balance, Decimal::new(1000, 2) - Decimal::new(13, 2) * Decimal::from(40));
    assert_eq!(wallet.transaction_count, 41);

    let transactions = repo.transactions(&tenant).await.expect("transactions");
    assert_eq!(transactions.len(), 41);
    let verification = verify_running_total(&wallet, &transactions);
    assert!(verification.valid, "ledger drifted: {verification:?}");

    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_stop_at_zero() {
    let dir = TempDir::new().expect("temp dir");
    let pool = file_pool(&dir).await;
    let repo = Arc::new(SqlWalletRepository::new(pool.clone()).with_max_attempts(50));
    let tenant = TenantId::new("t-drain");

    repo.credit(
        RechargeRequest {
            tenant_id: tenant.clone(),
            amount: Decimal::new(130, 2),
            currency: "USD".to_string(),
            payment_reference: "pay_drain".to_string(),
            provenance: "test".to_string(),
        },
        Utc::now(),
    )
    .await
    .expect("seed credit");

    let mut handles = Vec::new();
    for _ in 0..25 {
        let repo = Arc::clone(&repo);
        let tenant = tenant.clone();
        handles.push(tokio::spawn(async move {
            repo.debit(usage_debit(&tenant, Decimal::new(10, 2)), Utc::now()).await
        }));
    }

    let mut applied = 0_u32;
    for handle in handles {
        if handle.await.expect("task joined").is_ok() {
            applied += 1;
        }
    }

    assert_eq!(applied, 10);
    let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
    assert_eq!(wallet.balance, Decimal::ZERO);

    pool.close().await;
}
