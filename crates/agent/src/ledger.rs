use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use tollgate_core::clock::Clock;
use tollgate_core::domain::cache::BrokerStats;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::domain::wallet::{
    BillingReconciliation, FinancialHistoryEntry, LedgerTransaction, RechargeRequest,
    UsageMetadata, Wallet,
};
use tollgate_core::errors::{ApplicationError, DomainError};
use tollgate_core::ledger::{verify_running_total, LedgerVerification};
use tollgate_db::repositories::{DebitRequest, RepositoryError, WalletRepository, WalletWriteError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("debit task did not complete: {0}")]
    TaskAborted(String),
}

impl LedgerError {
    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, Self::Domain(DomainError::InsufficientBalance { .. }))
    }
}

impl From<WalletWriteError> for LedgerError {
    fn from(value: WalletWriteError) -> Self {
        match value {
            WalletWriteError::Rejected(error) => Self::Domain(error),
            WalletWriteError::Repository(error) => Self::Repository(error),
        }
    }
}

impl From<LedgerError> for ApplicationError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Domain(error) => Self::Domain(error),
            LedgerError::Repository(error) => Self::Persistence(error.to_string()),
            LedgerError::TaskAborted(message) => Self::Persistence(message),
        }
    }
}

/// Money movement for tenant wallets. Every debit and credit is one atomic
/// store transaction; nothing here retries a charge on its own.
#[derive(Clone)]
pub struct LedgerService {
    wallets: Arc<dyn WalletRepository>,
    clock: Arc<dyn Clock>,
}

impl LedgerService {
    pub fn new(wallets: Arc<dyn WalletRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { wallets, clock }
    }

    pub async fn get_or_create_wallet(&self, tenant_id: &TenantId) -> Result<Wallet, LedgerError> {
        Ok(self.wallets.get_or_create(tenant_id, self.clock.now()).await?)
    }

    pub async fn find_wallet(&self, tenant_id: &TenantId) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.wallets.find(tenant_id).await?)
    }

    /// Advisory check only. A missing wallet holds nothing.
    pub async fn has_sufficient_balance(
        &self,
        tenant_id: &TenantId,
        estimated_cost: Decimal,
    ) -> Result<bool, LedgerError> {
        let wallet = self.wallets.find(tenant_id).await?;
        Ok(match wallet {
            Some(wallet) => wallet.has_sufficient_balance(estimated_cost),
            None => estimated_cost <= Decimal::ZERO,
        })
    }

    /// Charges `provider_cost * (1 + margin)`.
    ///
    /// The store write runs on its own task: once started it commits or rolls
    /// back even if the caller's future is dropped mid-flight.
    pub async fn debit(
        &self,
        tenant_id: &TenantId,
        provider_cost: Decimal,
        margin: Decimal,
        usage: UsageMetadata,
    ) -> Result<LedgerTransaction, LedgerError> {
        let request = DebitRequest { tenant_id: tenant_id.clone(), provider_cost, margin, usage };
        let wallets = Arc::clone(&self.wallets);
        let now = self.clock.now();

        let transaction = tokio::spawn(async move { wallets.debit(request, now).await })
            .await
            .map_err(|error| LedgerError::TaskAborted(error.to_string()))??;

        self.check_low_balance(&transaction).await;
        Ok(transaction)
    }

    /// Applies a funding call. Replaying a payment reference returns the
    /// original transaction instead of crediting twice.
    pub async fn credit(&self, request: RechargeRequest) -> Result<LedgerTransaction, LedgerError> {
        if request.payment_reference.trim().is_empty() {
            return Err(DomainError::InvariantViolation(
                "recharge needs a payment reference".to_string(),
            )
            .into());
        }
        let tenant_id = request.tenant_id.clone();
        let payment_reference = request.payment_reference.clone();
        let transaction = self.wallets.credit(request, self.clock.now()).await?;

        info!(
            event_name = "wallet.recharge.applied",
            tenant_id = %tenant_id,
            transaction_id = %transaction.id,
            payment_reference = %payment_reference,
            amount = %transaction.client_cost,
            balance_after = %transaction.balance_after,
            "wallet recharged"
        );
        Ok(transaction)
    }

    pub async fn transactions(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(self.wallets.transactions(tenant_id).await?)
    }

    pub async fn history(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<FinancialHistoryEntry>, LedgerError> {
        Ok(self.wallets.history(tenant_id, limit).await?)
    }

    pub async fn record_reconciliation(
        &self,
        reconciliation: BillingReconciliation,
    ) -> Result<(), LedgerError> {
        Ok(self.wallets.record_reconciliation(reconciliation).await?)
    }

    pub async fn open_reconciliations(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<BillingReconciliation>, LedgerError> {
        Ok(self.wallets.open_reconciliations(tenant_id).await?)
    }

    pub async fn usage_stats(&self, tenant_id: Option<&TenantId>) -> Result<BrokerStats, LedgerError> {
        Ok(self.wallets.usage_stats(tenant_id).await?)
    }

    /// Replays the tenant's transactions against the stored balance.
    pub async fn verify_ledger(
        &self,
        tenant_id: &TenantId,
    ) -> Result<LedgerVerification, LedgerError> {
        let wallet = self
            .wallets
            .find(tenant_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("wallet {tenant_id}")))?;
        let transactions = self.wallets.transactions(tenant_id).await?;
        let verification = verify_running_total(&wallet, &transactions);

        if !verification.valid {
            warn!(
                event_name = "wallet.ledger.divergence",
                tenant_id = %tenant_id,
                verified_transactions = verification.verified_transactions,
                computed_balance = %verification.computed_balance,
                wallet_balance = %verification.wallet_balance,
                reason = verification.failure_reason.as_deref().unwrap_or("unknown"),
                "ledger verification failed"
            );
        }
        Ok(verification)
    }

    async fn check_low_balance(&self, transaction: &LedgerTransaction) {
        let wallet = match self.wallets.find(&transaction.tenant_id).await {
            Ok(Some(wallet)) => wallet,
            Ok(None) => return,
            Err(error) => {
                warn!(
                    event_name = "wallet.balance.check_failed",
                    tenant_id = %transaction.tenant_id,
                    error = %error,
                    "could not load wallet for low-balance check"
                );
                return;
            }
        };

        if wallet.is_below_threshold() {
            warn!(
                event_name = "wallet.balance.low",
                tenant_id = %transaction.tenant_id,
                balance = %wallet.balance,
                threshold = %wallet.low_balance_threshold,
                "wallet balance below alert threshold"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use tollgate_core::clock::FixedClock;
    use tollgate_core::domain::tenant::TenantId;
    use tollgate_core::domain::wallet::{RechargeRequest, TokenUsage, UsageMetadata};
    use tollgate_core::errors::DomainError;
    use tollgate_db::repositories::InMemoryWalletRepository;

    use super::{LedgerError, LedgerService};

    fn service() -> LedgerService {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        LedgerService::new(Arc::new(InMemoryWalletRepository::default()), Arc::new(clock))
    }

    fn recharge(tenant: &TenantId, amount: Decimal) -> RechargeRequest {
        RechargeRequest {
            tenant_id: tenant.clone(),
            amount,
            currency: "USD".to_string(),
            payment_reference: "pay_1".to_string(),
            provenance: "stripe".to_string(),
        }
    }

    #[tokio::test]
    async fn replayed_payment_reference_credits_once() {
        let ledger = service();
        let tenant = TenantId::new("t-replay");

        let first = ledger.credit(recharge(&tenant, Decimal::new(100, 0))).await.expect("first");
        let replay = ledger.credit(recharge(&tenant, Decimal::new(100, 0))).await.expect("replay");

        assert_eq!(first.id, replay.id);
        let wallet = ledger.find_wallet(&tenant).await.expect("find").expect("wallet");
        assert_eq!(wallet.balance, Decimal::new(100, 0));
        assert_eq!(ledger.transactions(&tenant).await.expect("transactions").len(), 1);

        let conflicting = ledger
            .credit(recharge(&tenant, Decimal::new(250, 0)))
            .await
            .expect_err("same reference, different amount");
        assert!(matches!(
            conflicting,
            LedgerError::Domain(DomainError::PaymentReferenceReused { .. })
        ));
    }

    #[tokio::test]
    async fn recharge_in_foreign_currency_leaves_wallet_untouched() {
        let ledger = service();
        let tenant = TenantId::new("t-eur");

        let error = ledger
            .credit(RechargeRequest {
                currency: "EUR".to_string(),
                ..recharge(&tenant, Decimal::new(100, 0))
            })
            .await
            .expect_err("EUR into a USD wallet");

        assert!(matches!(error, LedgerError::Domain(DomainError::CurrencyMismatch { .. })));
        assert!(ledger.transactions(&tenant).await.expect("transactions").is_empty());
        let balance = ledger.find_wallet(&tenant).await.expect("find").map(|wallet| wallet.balance);
        assert!(balance.unwrap_or(Decimal::ZERO).is_zero());
    }

    #[tokio::test]
    async fn blank_payment_reference_is_rejected() {
        let ledger = service();
        let tenant = TenantId::new("t-blank");

        let error = ledger
            .credit(RechargeRequest {
                payment_reference: "  ".to_string(),
                ..recharge(&tenant, Decimal::ONE)
            })
            .await
            .expect_err("blank reference");
        assert!(matches!(error, LedgerError::Domain(DomainError::InvariantViolation(_))));
    }

    fn usage() -> UsageMetadata {
        UsageMetadata {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            usage: TokenUsage::new(100, 20),
            ..UsageMetadata::default()
        }
    }

    #[tokio::test]
    async fn debit_applies_margin_and_verifies() {
        let ledger = service();
        let tenant = TenantId::new("t-ledger");
        ledger.credit(recharge(&tenant, Decimal::new(100, 2))).await.expect("credit");

        let transaction = ledger
            .debit(&tenant, Decimal::new(50, 2), Decimal::new(30, 2), usage())
            .await
            .expect("debit");

        assert_eq!(transaction.client_cost, Decimal::new(65, 2));
        assert_eq!(transaction.balance_after, Decimal::new(35, 2));

        let verification = ledger.verify_ledger(&tenant).await.expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.verified_transactions, 2);
    }

    #[tokio::test]
    async fn sufficiency_check_treats_missing_wallet_as_empty() {
        let ledger = service();
        let tenant = TenantId::new("t-empty");

        assert!(!ledger.has_sufficient_balance(&tenant, Decimal::new(1, 2)).await.expect("check"));
        assert!(ledger.has_sufficient_balance(&tenant, Decimal::ZERO).await.expect("check"));
    }

    #[tokio::test]
    async fn overdraw_is_reported_as_insufficient_balance() {
        let ledger = service();
        let tenant = TenantId::new("t-poor");
        ledger.credit(recharge(&tenant, Decimal::new(10, 2))).await.expect("credit");

        let error = ledger
            .debit(&tenant, Decimal::new(50, 2), Decimal::new(30, 2), usage())
            .await
            .expect_err("overdraw");

        assert!(error.is_insufficient_balance());
        let wallet = ledger.find_wallet(&tenant).await.expect("find").expect("wallet");
        assert_eq!(wallet.balance, Decimal::new(10, 2));
    }
}
