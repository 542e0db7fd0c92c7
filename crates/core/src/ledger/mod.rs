use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;
use crate::domain::wallet::{LedgerTransaction, TransactionKind, Wallet};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerVerification {
    pub tenant_id: TenantId,
    pub valid: bool,
    pub verified_transactions: usize,
    pub computed_balance: Decimal,
    pub wallet_balance: Decimal,
    pub failure_reason: Option<String>,
}

/// Replays `transactions` (oldest first) from a zero balance and checks that
/// every snapshot matches the running total and that the replay lands on the
/// wallet's balance and totals.
pub fn verify_running_total(
    wallet: &Wallet,
    transactions: &[LedgerTransaction],
) -> LedgerVerification {
    let mut running = Decimal::ZERO;
    let mut spent = Decimal::ZERO;
    let mut recharged = Decimal::ZERO;

    let failure = |index: usize, running: Decimal, reason: String| LedgerVerification {
        tenant_id: wallet.tenant_id.clone(),
        valid: false,
        verified_transactions: index,
        computed_balance: running,
        wallet_balance: wallet.balance,
        failure_reason: Some(reason),
    };

    for (index, transaction) in transactions.iter().enumerate() {
        if transaction.tenant_id != wallet.tenant_id {
            return failure(
                index,
                running,
                format!("transaction {} belongs to tenant {}", transaction.id, transaction.tenant_id),
            );
        }

        running += transaction.balance_delta();
        match transaction.kind {
            TransactionKind::UsageDebit => spent += transaction.client_cost,
            TransactionKind::RechargeCredit => recharged += transaction.client_cost,
        }

        if running < Decimal::ZERO {
            return failure(
                index,
                running,
                format!("balance went negative at transaction {}", transaction.id),
            );
        }

        if transaction.balance_after != running {
            return failure(
                index,
                running,
                format!(
                    "snapshot mismatch at transaction {}: recorded {}, expected {}",
                    transaction.id, transaction.balance_after, running
                ),
            );
        }
    }

    if running != wallet.balance {
        return failure(
            transactions.len(),
            running,
            format!("wallet balance {} differs from ledger total {}", wallet.balance, running),
        );
    }

    if spent != wallet.total_spent || recharged != wallet.total_recharged {
        return failure(
            transactions.len(),
            running,
            format!(
                "wallet totals (spent {}, recharged {}) differ from ledger (spent {}, recharged {})",
                wallet.total_spent, wallet.total_recharged, spent, recharged
            ),
        );
    }

    if wallet.transaction_count != transactions.len() as u64 {
        return failure(
            transactions.len(),
            running,
            format!(
                "wallet transaction_count {} differs from ledger length {}",
                wallet.transaction_count,
                transactions.len()
            ),
        );
    }

    LedgerVerification {
        tenant_id: wallet.tenant_id.clone(),
        valid: true,
        verified_transactions: transactions.len(),
        computed_balance: running,
        wallet_balance: wallet.balance,
        failure_reason: None,
    }
}
