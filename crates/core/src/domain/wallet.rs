use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

pub const DEFAULT_CURRENCY: &str = "USD";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-tenant balance. Only the ledger mutates it, and only through
/// [`Wallet::apply_debit`] / [`Wallet::apply_credit`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub tenant_id: TenantId,
    pub balance: Decimal,
    pub total_spent: Decimal,
    pub total_recharged: Decimal,
    pub transaction_count: u64,
    pub low_balance_threshold: Decimal,
    pub alerts_enabled: bool,
    pub currency: String,
    /// Optimistic concurrency token, bumped on every mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            balance: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            total_recharged: Decimal::ZERO,
            transaction_count: 0,
            low_balance_threshold: Decimal::new(500, 2),
            alerts_enabled: true,
            currency: DEFAULT_CURRENCY.to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_sufficient_balance(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    pub fn is_below_threshold(&self) -> bool {
        self.alerts_enabled && self.balance < self.low_balance_threshold
    }

    /// Subtracts `client_cost`, refusing to go below zero. Returns the new balance.
    pub fn apply_debit(
        &mut self,
        client_cost: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decimal, DomainError> {
        if client_cost < Decimal::ZERO {
            return Err(DomainError::InvariantViolation(format!(
                "debit amount must be non-negative, got {client_cost}"
            )));
        }
        if self.balance < client_cost {
            return Err(DomainError::InsufficientBalance {
                required: client_cost,
                available: self.balance,
            });
        }

        self.balance -= client_cost;
        self.total_spent += client_cost;
        self.bump(now);
        Ok(self.balance)
    }

    /// Adds `amount`, which must be positive and in the wallet's currency.
    pub fn apply_credit(
        &mut self,
        amount: Decimal,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Result<Decimal, DomainError> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::InvariantViolation(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        if !currency.trim().eq_ignore_ascii_case(&self.currency) {
            return Err(DomainError::CurrencyMismatch {
                wallet: self.currency.clone(),
                requested: currency.trim().to_string(),
            });
        }

        self.balance += amount;
        self.total_recharged += amount;
        self.bump(now);
        Ok(self.balance)
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.transaction_count = self.transaction_count.saturating_add(1);
        self.version = self.version.saturating_add(1);
        self.updated_at = now;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    UsageDebit,
    RechargeCredit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsageDebit => "usage_debit",
            Self::RechargeCredit => "recharge_credit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "usage_debit" => Some(Self::UsageDebit),
            "recharge_credit" => Some(Self::RechargeCredit),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self { input_tokens, output_tokens }
    }

    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// What the broker knows about a billable call at debit time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub processing_ms: u64,
    pub cache_hit: bool,
    pub extra: BTreeMap<String, String>,
}

/// Immutable ledger row. `balance_after` equals the wallet balance right after
/// this transaction was applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub kind: TransactionKind,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub provider_cost: Decimal,
    pub client_cost: Decimal,
    pub margin: Decimal,
    pub usage: TokenUsage,
    pub processing_ms: u64,
    pub balance_after: Decimal,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn usage_debit(
        tenant_id: TenantId,
        provider_cost: Decimal,
        client_cost: Decimal,
        margin: Decimal,
        usage: &UsageMetadata,
        balance_after: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let mut metadata = usage.extra.clone();
        metadata.insert("cache_hit".to_string(), usage.cache_hit.to_string());

        Self {
            id: TransactionId::generate(),
            tenant_id,
            kind: TransactionKind::UsageDebit,
            provider: Some(usage.provider.clone()),
            model: Some(usage.model.clone()),
            provider_cost,
            client_cost,
            margin,
            usage: usage.usage,
            processing_ms: usage.processing_ms,
            balance_after,
            metadata,
            created_at: now,
        }
    }

    pub fn recharge_credit(
        request: &RechargeRequest,
        balance_after: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("currency".to_string(), request.currency.clone());
        metadata.insert("payment_reference".to_string(), request.payment_reference.clone());
        metadata.insert("provenance".to_string(), request.provenance.clone());

        Self {
            id: TransactionId::generate(),
            tenant_id: request.tenant_id.clone(),
            kind: TransactionKind::RechargeCredit,
            provider: None,
            model: None,
            provider_cost: Decimal::ZERO,
            client_cost: request.amount,
            margin: Decimal::ZERO,
            usage: TokenUsage::default(),
            processing_ms: 0,
            balance_after,
            metadata,
            created_at: now,
        }
    }

    /// Signed effect on the wallet balance.
    pub fn balance_delta(&self) -> Decimal {
        match self.kind {
            TransactionKind::UsageDebit => -self.client_cost,
            TransactionKind::RechargeCredit => self.client_cost,
        }
    }

    pub fn payment_reference(&self) -> Option<&str> {
        match self.kind {
            TransactionKind::RechargeCredit => {
                self.metadata.get("payment_reference").map(String::as_str)
            }
            TransactionKind::UsageDebit => None,
        }
    }

    /// True when `request` asks for exactly the credit this transaction applied.
    pub fn matches_recharge(&self, request: &RechargeRequest) -> bool {
        self.kind == TransactionKind::RechargeCredit
            && self.client_cost == request.amount
            && self
                .metadata
                .get("currency")
                .is_some_and(|currency| currency.eq_ignore_ascii_case(request.currency.trim()))
    }

    pub fn is_cache_hit(&self) -> bool {
        self.metadata.get("cache_hit").map(|value| value == "true").unwrap_or(false)
    }
}

/// Funding call supplied by the payment integrations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeRequest {
    pub tenant_id: TenantId,
    pub amount: Decimal,
    pub currency: String,
    pub payment_reference: String,
    pub provenance: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialHistoryEntry {
    pub id: String,
    pub tenant_id: TenantId,
    pub transaction_id: TransactionId,
    pub description: String,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

impl FinancialHistoryEntry {
    pub fn for_transaction(transaction: &LedgerTransaction) -> Self {
        let description = match transaction.kind {
            TransactionKind::UsageDebit => {
                let source = if transaction.is_cache_hit() { "cached response" } else { "AI usage" };
                format!(
                    "{source}: {} / {} ({} tokens)",
                    transaction.provider.as_deref().unwrap_or("unknown"),
                    transaction.model.as_deref().unwrap_or("unknown"),
                    transaction.usage.total()
                )
            }
            TransactionKind::RechargeCredit => format!(
                "wallet recharge via {}",
                transaction.metadata.get("provenance").map(String::as_str).unwrap_or("unknown")
            ),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: transaction.tenant_id.clone(),
            transaction_id: transaction.id.clone(),
            description,
            amount: transaction.balance_delta(),
            balance_after: transaction.balance_after,
            created_at: transaction.created_at,
        }
    }
}

/// A paid-for generation that could not be charged to the tenant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingReconciliation {
    pub id: String,
    pub tenant_id: TenantId,
    pub provider: String,
    pub model: String,
    pub provider_cost: Decimal,
    pub client_cost: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{RechargeRequest, TransactionKind, Wallet};
    use crate::domain::tenant::TenantId;
    use crate::errors::DomainError;

    #[test]
    fn debit_refuses_to_overdraw() {
        let mut wallet = Wallet::new(TenantId::new("t-1"), Utc::now());
        wallet.apply_credit(Decimal::new(100, 2), "USD", Utc::now()).expect("credit");

        let error = wallet.apply_debit(Decimal::new(101, 2), Utc::now()).expect_err("overdraw");

        assert!(matches!(error, DomainError::InsufficientBalance { .. }));
        assert_eq!(wallet.balance, Decimal::new(100, 2));
        assert_eq!(wallet.transaction_count, 1);
    }

    #[test]
    fn debit_and_credit_track_totals_and_version() {
        let mut wallet = Wallet::new(TenantId::new("t-1"), Utc::now());
        wallet.apply_credit(Decimal::new(1000, 2), "USD", Utc::now()).expect("credit");
        let balance = wallet.apply_debit(Decimal::new(65, 2), Utc::now()).expect("debit");

        assert_eq!(balance, Decimal::new(935, 2));
        assert_eq!(wallet.total_spent, Decimal::new(65, 2));
        assert_eq!(wallet.total_recharged, Decimal::new(1000, 2));
        assert_eq!(wallet.version, 2);
    }

    #[test]
    fn low_balance_alert_respects_threshold_and_switch() {
        let mut wallet = Wallet::new(TenantId::new("t-1"), Utc::now());
        wallet.apply_credit(Decimal::new(600, 2), "USD", Utc::now()).expect("credit");
        assert!(!wallet.is_below_threshold());
        assert!(wallet.has_sufficient_balance(Decimal::new(600, 2)));
        assert!(!wallet.has_sufficient_balance(Decimal::new(601, 2)));

        wallet.apply_debit(Decimal::new(200, 2), Utc::now()).expect("debit");
        assert!(wallet.is_below_threshold());

        wallet.alerts_enabled = false;
        assert!(!wallet.is_below_threshold());
    }

    #[test]
    fn non_positive_credit_is_rejected() {
        let mut wallet = Wallet::new(TenantId::new("t-1"), Utc::now());
        assert!(wallet.apply_credit(Decimal::ZERO, "USD", Utc::now()).is_err());
        assert_eq!(wallet.version, 0);
    }

    #[test]
    fn credit_in_another_currency_is_rejected() {
        let mut wallet = Wallet::new(TenantId::new("t-1"), Utc::now());

        let error = wallet
            .apply_credit(Decimal::new(10000, 2), "EUR", Utc::now())
            .expect_err("EUR into a USD wallet");

        assert!(matches!(
            error,
            DomainError::CurrencyMismatch { ref wallet, ref requested }
                if wallet == "USD" && requested == "EUR"
        ));
        assert_eq!(wallet.balance, Decimal::ZERO);
        assert_eq!(wallet.version, 0);
        assert!(wallet.apply_credit(Decimal::ONE, "usd", Utc::now()).is_ok());
    }

    #[test]
    fn transaction_kind_round_trips_through_storage_key() {
        for kind in [TransactionKind::UsageDebit, TransactionKind::RechargeCredit] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("refund"), None);
    }

    #[test]
    fn recharge_transaction_carries_payment_reference() {
        let request = RechargeRequest {
            tenant_id: TenantId::new("t-1"),
            amount: Decimal::new(2500, 2),
            currency: "USD".to_string(),
            payment_reference: "pay_123".to_string(),
            provenance: "stripe".to_string(),
        };
        let tx = super::LedgerTransaction::recharge_credit(&request, request.amount, Utc::now());

        assert_eq!(tx.balance_delta(), Decimal::new(2500, 2));
        assert_eq!(tx.payment_reference(), Some("pay_123"));
        assert!(tx.matches_recharge(&request));
        assert!(!tx.matches_recharge(&RechargeRequest { amount: Decimal::ONE, ..request.clone() }));
    }
}
