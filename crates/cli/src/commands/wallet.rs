use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::json;

use tollgate_core::config::AppConfig;
use tollgate_core::domain::wallet::RechargeRequest;
use tollgate_core::errors::ApplicationError;

use crate::commands::{tenant, to_data, with_services, CommandFailure, CommandResult};

pub fn balance(config: &AppConfig, tenant_id: &str) -> CommandResult {
    with_services("wallet balance", config, |services| async move {
        let tenant_id = tenant(tenant_id)?;
        let wallet = services
            .ledger
            .get_or_create_wallet(&tenant_id)
            .await
            .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "wallet balance",
            format!("{} {} available", wallet.balance, wallet.currency),
            Some(to_data(&wallet)?),
        ))
    })
}

pub fn recharge(
    config: &AppConfig,
    tenant_id: &str,
    amount: &str,
    reference: &str,
    currency: &str,
) -> CommandResult {
    with_services("wallet recharge", config, |services| async move {
        let tenant_id = tenant(tenant_id)?;
        let amount = parse_amount(amount)?;
        let transaction = services
            .ledger
            .credit(RechargeRequest {
                tenant_id,
                amount,
                currency: currency.to_uppercase(),
                payment_reference: reference.to_string(),
                provenance: "operator-cli".to_string(),
            })
            .await
            .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "wallet recharge",
            format!("credited {amount}; balance is now {}", transaction.balance_after),
            Some(to_data(&transaction)?),
        ))
    })
}

pub fn verify(config: &AppConfig, tenant_id: &str) -> CommandResult {
    with_services("wallet verify", config, |services| async move {
        let tenant_id = tenant(tenant_id)?;
        let verification =
            services.ledger.verify_ledger(&tenant_id).await.map_err(ApplicationError::from)?;
        let data = to_data(&verification)?;

        if verification.valid {
            Ok(CommandResult::success_with(
                "wallet verify",
                format!("{} transactions verified", verification.verified_transactions),
                Some(data),
            ))
        } else {
            Err(CommandFailure::new(
                "ledger_divergence",
                verification.failure_reason.unwrap_or_else(|| "ledger diverged".to_string()),
                8,
            ))
        }
    })
}

pub fn history(config: &AppConfig, tenant_id: &str, limit: u32) -> CommandResult {
    with_services("wallet history", config, |services| async move {
        let tenant_id = tenant(tenant_id)?;
        let entries =
            services.ledger.history(&tenant_id, limit).await.map_err(ApplicationError::from)?;
        let reconciliations = services
            .ledger
            .open_reconciliations(Some(&tenant_id))
            .await
            .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "wallet history",
            format!(
                "{} entries, {} open reconciliations",
                entries.len(),
                reconciliations.len()
            ),
            Some(json!({
                "entries": to_data(&entries)?,
                "open_reconciliations": to_data(&reconciliations)?,
            })),
        ))
    })
}

/// Positive decimal amount; at most 6 decimal places.
pub fn parse_amount(raw: &str) -> Result<Decimal, CommandFailure> {
    let amount = Decimal::from_str(raw.trim())
        .map_err(|error| CommandFailure::invalid_input(format!("invalid amount `{raw}`: {error}")))?;
    if amount <= Decimal::ZERO {
        return Err(CommandFailure::invalid_input("amount must be greater than zero"));
    }
    if amount.scale() > 6 {
        return Err(CommandFailure::invalid_input("amount supports at most 6 decimal places"));
    }
    Ok(amount)
}
