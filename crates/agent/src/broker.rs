//! Usage broker: the single entry point for billed LLM calls.
//!
//! A request is answered from the tenant's prompt cache when possible (charged at
//! the symbolic fraction of the original cost), otherwise routed to the selected
//! provider, charged at real cost plus margin, and cached for later hits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Duration as TtlDuration;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use tollgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use tollgate_core::clock::Clock;
use tollgate_core::config::BrokerConfig;
use tollgate_core::domain::cache::{BrokerStats, CacheEntry, CacheStats};
use tollgate_core::domain::provider::{select_provider, ProviderConfig};
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::domain::wallet::{
    BillingReconciliation, TokenUsage, TransactionId, UsageMetadata,
};
use tollgate_core::errors::{ApplicationError, DomainError};
use tollgate_core::normalize::prompt_cache_key;
use tollgate_core::pricing::{estimate_provider_cost, MarginPolicy, TokenPrices};
use tollgate_db::repositories::{PromptCacheRepository, ProviderRepository, RepositoryError};

use crate::credentials::CredentialSource;
use crate::ledger::{LedgerError, LedgerService};
use crate::llm::{ProviderAdapter, ProviderError, ProviderRequest};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },
    #[error("no active AI provider is configured")]
    NoProviderAvailable,
    #[error("provider `{provider}` failed: {message}")]
    Provider { provider: String, message: String },
    #[error("provider `{0}` is not implemented")]
    ProviderNotImplemented(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<LedgerError> for BrokerError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Domain(DomainError::InsufficientBalance { required, available }) => {
                Self::InsufficientBalance { required, available }
            }
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<RepositoryError> for BrokerError {
    fn from(value: RepositoryError) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<BrokerError> for ApplicationError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::InsufficientBalance { required, available } => {
                Self::Domain(DomainError::InsufficientBalance { required, available })
            }
            BrokerError::NoProviderAvailable => {
                Self::Integration("no active AI provider is configured".to_string())
            }
            BrokerError::Provider { provider, message } => {
                Self::Integration(format!("{provider}: {message}"))
            }
            BrokerError::ProviderNotImplemented(provider) => {
                Self::Configuration(format!("provider `{provider}` is not implemented"))
            }
            BrokerError::Persistence(message) => Self::Persistence(message),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Propagated to logs and audit events; generated when absent.
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerResponse {
    pub response: String,
    /// Absent only when the charge failed and a reconciliation was recorded.
    pub transaction_id: Option<TransactionId>,
    pub provider_cost: Decimal,
    pub client_cost: Decimal,
    pub usage: TokenUsage,
    pub provider: String,
    pub model: String,
    pub cache_hit: bool,
    pub processing_ms: u64,
    pub reconciliation: Option<BillingReconciliation>,
}

/// Billed text completion. The analyzer and the retrieval engine depend on
/// this rather than on the broker itself.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        tenant_id: &TenantId,
        prompt: &str,
        options: RequestOptions,
    ) -> Result<BrokerResponse, BrokerError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub pricing: MarginPolicy,
    pub cache_ttl_days: u32,
    pub estimate_token_price: Decimal,
    pub default_prices: TokenPrices,
    pub provider_timeout: Duration,
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            pricing: MarginPolicy {
                margin: config.margin,
                cache_hit_fraction: config.cache_hit_fraction,
            },
            cache_ttl_days: config.cache_ttl_days,
            estimate_token_price: config.estimate_token_price,
            default_prices: TokenPrices {
                input: config.default_input_token_price,
                output: config.default_output_token_price,
            },
            provider_timeout: Duration::from_secs(config.provider_timeout_secs),
        }
    }
}

pub struct UsageBroker {
    ledger: LedgerService,
    cache: Arc<dyn PromptCacheRepository>,
    providers: Arc<dyn ProviderRepository>,
    adapter: Arc<dyn ProviderAdapter>,
    credentials: Arc<dyn CredentialSource>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    settings: BrokerSettings,
}

impl UsageBroker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: LedgerService,
        cache: Arc<dyn PromptCacheRepository>,
        providers: Arc<dyn ProviderRepository>,
        adapter: Arc<dyn ProviderAdapter>,
        credentials: Arc<dyn CredentialSource>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        settings: BrokerSettings,
    ) -> Self {
        Self { ledger, cache, providers, adapter, credentials, audit, clock, settings }
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub async fn process_request(
        &self,
        tenant_id: &TenantId,
        prompt: &str,
        options: RequestOptions,
    ) -> Result<BrokerResponse, BrokerError> {
        let correlation_id =
            options.correlation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let prompt_hash = prompt_cache_key(prompt);

        if let Some(entry) = self.cache.find_live(tenant_id, &prompt_hash, self.clock.now()).await? {
            return self.serve_cached(tenant_id, entry, &correlation_id).await;
        }

        self.ensure_estimated_balance(tenant_id, prompt).await?;

        let providers = self.providers.list().await?;
        let provider = select_provider(&providers).ok_or(BrokerError::NoProviderAvailable)?;

        let started = Instant::now();
        let request = ProviderRequest {
            prompt: prompt.to_string(),
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };
        let reply = self.invoke_provider(provider, &request).await?;
        let processing_ms = elapsed_ms(started);

        let usage = TokenUsage::new(reply.input_tokens, reply.output_tokens);
        let provider_cost = provider.prices(self.settings.default_prices).cost(usage);
        let client_cost = self.settings.pricing.client_cost(provider_cost);
        let metadata = UsageMetadata {
            provider: provider.name.clone(),
            model: reply.model_used.clone(),
            usage,
            processing_ms,
            cache_hit: false,
            extra: [("correlation_id".to_string(), correlation_id.clone())].into_iter().collect(),
        };

        let (transaction_id, reconciliation) = match self
            .ledger
            .debit(tenant_id, provider_cost, self.settings.pricing.margin, metadata)
            .await
        {
            Ok(transaction) => (Some(transaction.id), None),
            Err(debit_error) => {
                let reconciliation = self
                    .reconcile(
                        tenant_id,
                        provider,
                        &reply.model_used,
                        provider_cost,
                        client_cost,
                        &debit_error,
                        &correlation_id,
                    )
                    .await;
                (None, Some(reconciliation))
            }
        };

        let ttl = TtlDuration::days(i64::from(self.settings.cache_ttl_days));
        let entry = CacheEntry::new(
            tenant_id.clone(),
            prompt_hash,
            reply.text.clone(),
            provider.name.clone(),
            reply.model_used.clone(),
            provider_cost,
            reply.input_tokens,
            reply.output_tokens,
            ttl,
            self.clock.now(),
        );
        if let Err(cache_error) = self.cache.upsert(entry).await {
            warn!(
                event_name = "broker.cache.store_failed",
                tenant_id = %tenant_id,
                correlation_id = %correlation_id,
                error = %cache_error,
                "could not store response in prompt cache"
            );
        }

        info!(
            event_name = "broker.request.completed",
            tenant_id = %tenant_id,
            correlation_id = %correlation_id,
            provider = %provider.name,
            model = %reply.model_used,
            input_tokens = reply.input_tokens,
            output_tokens = reply.output_tokens,
            provider_cost = %provider_cost,
            client_cost = %client_cost,
            processing_ms,
            "provider request completed"
        );

        Ok(BrokerResponse {
            response: reply.text,
            transaction_id,
            provider_cost,
            client_cost,
            usage,
            provider: provider.name.clone(),
            model: reply.model_used,
            cache_hit: false,
            processing_ms,
            reconciliation,
        })
    }

    pub async fn get_cache_stats(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<CacheStats, BrokerError> {
        Ok(self.cache.stats(tenant_id, self.clock.now()).await?)
    }

    pub async fn get_broker_stats(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<BrokerStats, BrokerError> {
        Ok(self.ledger.usage_stats(tenant_id).await?)
    }

    /// Drops cached responses for one tenant, or for everyone when `None`.
    pub async fn purge_cache(&self, tenant_id: Option<&TenantId>) -> Result<u64, BrokerError> {
        let deleted = self.cache.purge(tenant_id).await?;
        info!(
            event_name = "broker.cache.purged",
            tenant_id = tenant_id.map(TenantId::as_str).unwrap_or("*"),
            deleted,
            "prompt cache purged"
        );
        Ok(deleted)
    }

    pub async fn purge_expired(&self) -> Result<u64, BrokerError> {
        Ok(self.cache.purge_expired(self.clock.now()).await?)
    }

    async fn serve_cached(
        &self,
        tenant_id: &TenantId,
        entry: CacheEntry,
        correlation_id: &str,
    ) -> Result<BrokerResponse, BrokerError> {
        let provider_cost = self.settings.pricing.symbolic_cost(entry.original_cost);
        let usage = TokenUsage::new(entry.input_tokens, entry.output_tokens);
        let metadata = UsageMetadata {
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            usage,
            processing_ms: 0,
            cache_hit: true,
            extra: [("correlation_id".to_string(), correlation_id.to_string())]
                .into_iter()
                .collect(),
        };

        let transaction = self
            .ledger
            .debit(tenant_id, provider_cost, self.settings.pricing.margin, metadata)
            .await?;

        if let Err(hit_error) =
            self.cache.record_hit(tenant_id, &entry.prompt_hash, self.clock.now()).await
        {
            warn!(
                event_name = "broker.cache.hit_count_failed",
                tenant_id = %tenant_id,
                correlation_id = %correlation_id,
                error = %hit_error,
                "could not record cache hit"
            );
        }

        info!(
            event_name = "broker.cache.hit",
            tenant_id = %tenant_id,
            correlation_id = %correlation_id,
            provider = %entry.provider,
            client_cost = %transaction.client_cost,
            "served response from prompt cache"
        );

        Ok(BrokerResponse {
            response: entry.response,
            transaction_id: Some(transaction.id),
            provider_cost,
            client_cost: transaction.client_cost,
            usage,
            provider: entry.provider,
            model: entry.model,
            cache_hit: true,
            processing_ms: 0,
            reconciliation: None,
        })
    }

    async fn ensure_estimated_balance(
        &self,
        tenant_id: &TenantId,
        prompt: &str,
    ) -> Result<(), BrokerError> {
        let estimate = estimate_provider_cost(prompt, self.settings.estimate_token_price);
        let required = self.settings.pricing.client_cost(estimate);
        if self.ledger.has_sufficient_balance(tenant_id, required).await? {
            return Ok(());
        }

        let available = self
            .ledger
            .find_wallet(tenant_id)
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or(Decimal::ZERO);
        info!(
            event_name = "broker.balance.insufficient",
            tenant_id = %tenant_id,
            required = %required,
            available = %available,
            "estimated cost exceeds wallet balance"
        );
        Err(BrokerError::InsufficientBalance { required, available })
    }

    async fn invoke_provider(
        &self,
        provider: &ProviderConfig,
        request: &ProviderRequest,
    ) -> Result<crate::llm::ProviderResponse, BrokerError> {
        let credential = self.credentials.credential(&provider.name);
        let call = self.adapter.invoke(provider, credential.as_ref(), request);

        match tokio::time::timeout(self.settings.provider_timeout, call).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(ProviderError::NotImplemented(name))) => {
                Err(BrokerError::ProviderNotImplemented(name))
            }
            Ok(Err(provider_error)) => {
                warn!(
                    event_name = "broker.provider.failed",
                    provider = %provider.name,
                    error = %provider_error,
                    "provider call failed"
                );
                Err(BrokerError::Provider {
                    provider: provider_error.provider().to_string(),
                    message: provider_error.to_string(),
                })
            }
            Err(_elapsed) => {
                warn!(
                    event_name = "broker.provider.timeout",
                    provider = %provider.name,
                    timeout_secs = self.settings.provider_timeout.as_secs(),
                    "provider call timed out"
                );
                Err(BrokerError::Provider {
                    provider: provider.name.clone(),
                    message: format!(
                        "timed out after {}s",
                        self.settings.provider_timeout.as_secs()
                    ),
                })
            }
        }
    }

    /// Records a generation that was paid for upstream but could not be
    /// charged. The response is still handed back to the caller.
    #[allow(clippy::too_many_arguments)]
    async fn reconcile(
        &self,
        tenant_id: &TenantId,
        provider: &ProviderConfig,
        model: &str,
        provider_cost: Decimal,
        client_cost: Decimal,
        debit_error: &LedgerError,
        correlation_id: &str,
    ) -> BillingReconciliation {
        let reconciliation = BillingReconciliation {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            provider: provider.name.clone(),
            model: model.to_string(),
            provider_cost,
            client_cost,
            reason: debit_error.to_string(),
            created_at: self.clock.now(),
        };

        error!(
            event_name = "broker.billing.reconciliation_required",
            tenant_id = %tenant_id,
            correlation_id = %correlation_id,
            provider = %provider.name,
            provider_cost = %provider_cost,
            client_cost = %client_cost,
            error = %debit_error,
            "debit failed after provider call; response returned uncharged"
        );

        if let Err(store_error) = self.ledger.record_reconciliation(reconciliation.clone()).await {
            error!(
                event_name = "broker.billing.reconciliation_store_failed",
                tenant_id = %tenant_id,
                correlation_id = %correlation_id,
                error = %store_error,
                "could not persist billing reconciliation"
            );
        }

        self.audit.emit(
            AuditEvent::new(
                Some(tenant_id.clone()),
                correlation_id,
                "billing.reconciliation_required",
                AuditCategory::Billing,
                "usage-broker",
                AuditOutcome::Failed,
            )
            .with_metadata("reconciliation_id", reconciliation.id.clone())
            .with_metadata("provider", provider.name.clone())
            .with_metadata("client_cost", client_cost.to_string()),
        );

        reconciliation
    }
}

#[async_trait]
impl CompletionService for UsageBroker {
    async fn complete(
        &self,
        tenant_id: &TenantId,
        prompt: &str,
        options: RequestOptions,
    ) -> Result<BrokerResponse, BrokerError> {
        self.process_request(tenant_id, prompt, options).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use tollgate_core::errors::{ApplicationError, DomainError, InterfaceError};

    use super::BrokerError;

    #[test]
    fn broker_errors_map_to_user_safe_interface_errors() {
        let balance: ApplicationError = BrokerError::InsufficientBalance {
            required: Decimal::new(65, 2),
            available: Decimal::new(10, 2),
        }
        .into();
        assert!(matches!(balance, ApplicationError::Domain(DomainError::InsufficientBalance { .. })));

        let provider: InterfaceError = ApplicationError::from(BrokerError::Provider {
            provider: "openai".to_string(),
            message: "503 overloaded".to_string(),
        })
        .into_interface("req-9");
        assert!(matches!(provider, InterfaceError::ServiceUnavailable { .. }));
        assert!(!provider.user_message().contains("openai"));
    }
}
