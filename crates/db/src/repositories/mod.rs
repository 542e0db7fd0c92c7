use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use tollgate_core::domain::automation::{AutomationRule, ExecutionRecord, RuleId};
use tollgate_core::domain::cache::{AnalysisCacheEntry, BrokerStats, CacheEntry, CacheStats};
use tollgate_core::domain::knowledge::{
    EmbeddingModel, KnowledgeChunk, KnowledgeEmbedding, KnowledgeSource, KnowledgeSourceId,
    SearchCandidate,
};
use tollgate_core::domain::message::{
    Contact, ContactId, Conversation, ConversationId, OutboundReply, Priority,
};
use tollgate_core::domain::provider::ProviderConfig;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::domain::wallet::{
    BillingReconciliation, FinancialHistoryEntry, LedgerTransaction, RechargeRequest,
    UsageMetadata, Wallet,
};
use tollgate_core::errors::DomainError;

mod decode;

pub mod automation;
pub mod cache;
pub mod crm;
pub mod knowledge;
pub mod memory;
pub mod provider;
pub mod wallet;

pub use automation::SqlRuleRepository;
pub use cache::{SqlAnalysisCacheRepository, SqlPromptCacheRepository};
pub use crm::SqlCrmRepository;
pub use knowledge::SqlKnowledgeRepository;
pub use memory::{
    InMemoryAnalysisCacheRepository, InMemoryCrmRepository, InMemoryKnowledgeRepository,
    InMemoryPromptCacheRepository, InMemoryProviderRepository, InMemoryRuleRepository,
    InMemoryWalletRepository,
};
pub use provider::SqlProviderRepository;
pub use wallet::SqlWalletRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl RepositoryError {
    /// Lock contention or a lost compare-and-swap; safe to retry the whole
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Database(sqlx::Error::Database(error)) => {
                matches!(error.code().as_deref(), Some("5" | "6" | "517" | "261" | "262"))
            }
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::Database(error)) if error.is_unique_violation())
    }
}

/// Failure of a money movement: either the ledger refused it or the store did.
#[derive(Debug, Error)]
pub enum WalletWriteError {
    #[error(transparent)]
    Rejected(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Outcome of a recharge whose payment reference is already on the ledger.
fn replayed_recharge(
    existing: LedgerTransaction,
    request: &RechargeRequest,
) -> Result<LedgerTransaction, WalletWriteError> {
    if !existing.matches_recharge(request) {
        return Err(DomainError::PaymentReferenceReused {
            payment_reference: request.payment_reference.clone(),
        }
        .into());
    }

    tracing::info!(
        event_name = "wallet.credit.replayed",
        tenant_id = %request.tenant_id,
        transaction_id = %existing.id,
        payment_reference = %request.payment_reference,
        "recharge already applied, returning original transaction"
    );
    Ok(existing)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebitRequest {
    pub tenant_id: TenantId,
    pub provider_cost: Decimal,
    pub margin: Decimal,
    pub usage: UsageMetadata,
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Wallet>, RepositoryError>;

    async fn get_or_create(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepositoryError>;

    /// Charges `provider_cost * (1 + margin)` and appends the transaction and
    /// its history entry atomically with the balance change.
    async fn debit(
        &self,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, WalletWriteError>;

    /// Applies a recharge once per `(tenant, payment_reference)`. A replay with
    /// the same amount and currency returns the original transaction without
    /// moving money; any other reuse of the reference is rejected.
    async fn credit(
        &self,
        request: RechargeRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, WalletWriteError>;

    /// Oldest first.
    async fn transactions(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LedgerTransaction>, RepositoryError>;

    /// Newest first.
    async fn history(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<FinancialHistoryEntry>, RepositoryError>;

    async fn record_reconciliation(
        &self,
        reconciliation: BillingReconciliation,
    ) -> Result<(), RepositoryError>;

    async fn open_reconciliations(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<BillingReconciliation>, RepositoryError>;

    async fn usage_stats(&self, tenant_id: Option<&TenantId>)
        -> Result<BrokerStats, RepositoryError>;
}

#[async_trait]
pub trait PromptCacheRepository: Send + Sync {
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        prompt_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, RepositoryError>;

    /// Bumps hit count and last-used time. Returns false when the entry is gone.
    async fn record_hit(
        &self,
        tenant_id: &TenantId,
        prompt_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn upsert(&self, entry: CacheEntry) -> Result<(), RepositoryError>;

    async fn purge(&self, tenant_id: Option<&TenantId>) -> Result<u64, RepositoryError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn stats(
        &self,
        tenant_id: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<CacheStats, RepositoryError>;
}

#[async_trait]
pub trait AnalysisCacheRepository: Send + Sync {
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisCacheEntry>, RepositoryError>;

    async fn record_hit(
        &self,
        tenant_id: &TenantId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn upsert(&self, entry: AnalysisCacheEntry) -> Result<(), RepositoryError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// Registration order.
    async fn list(&self) -> Result<Vec<ProviderConfig>, RepositoryError>;

    async fn find(&self, name: &str) -> Result<Option<ProviderConfig>, RepositoryError>;

    /// Saving a default provider clears the flag on every other row.
    async fn save(&self, provider: ProviderConfig) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Active rules for the tenant, ascending priority, ties by creation time then id.
    async fn active_rules(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<AutomationRule>, RepositoryError>;

    async fn find(&self, id: &RuleId) -> Result<Option<AutomationRule>, RepositoryError>;

    async fn save(&self, rule: AutomationRule) -> Result<(), RepositoryError>;

    /// Appends the record and updates the rule counters in one transaction.
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError>;

    async fn executions(&self, rule_id: &RuleId) -> Result<Vec<ExecutionRecord>, RepositoryError>;

    async fn last_auto_reply_at(
        &self,
        rule_id: &RuleId,
        conversation_id: &ConversationId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError>;
}

#[async_trait]
pub trait CrmRepository: Send + Sync {
    async fn find_contact(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError>;

    async fn save_contact(&self, contact: Contact, now: DateTime<Utc>)
        -> Result<(), RepositoryError>;

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn save_conversation(
        &self,
        conversation: Conversation,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Returns true when the tag was not already present.
    async fn add_tag(
        &self,
        contact_id: &ContactId,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn assign_agent(
        &self,
        conversation_id: &ConversationId,
        agent_id: &str,
    ) -> Result<(), RepositoryError>;

    async fn set_priority(
        &self,
        conversation_id: &ConversationId,
        priority: Priority,
    ) -> Result<(), RepositoryError>;

    async fn mark_vip(&self, contact_id: &ContactId) -> Result<(), RepositoryError>;

    async fn record_reply(&self, reply: OutboundReply) -> Result<(), RepositoryError>;

    async fn replies(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<OutboundReply>, RepositoryError>;
}

#[async_trait]
pub trait KnowledgeRepository: Send + Sync {
    async fn save_source(&self, source: KnowledgeSource) -> Result<(), RepositoryError>;

    async fn find_source(
        &self,
        id: &KnowledgeSourceId,
    ) -> Result<Option<KnowledgeSource>, RepositoryError>;

    async fn list_sources(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<KnowledgeSource>, RepositoryError>;

    /// Drops existing chunks (and their embeddings) for the source first.
    async fn replace_chunks(
        &self,
        source_id: &KnowledgeSourceId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<(), RepositoryError>;

    async fn save_embedding(&self, embedding: KnowledgeEmbedding) -> Result<(), RepositoryError>;

    /// Active chunks of active sources that carry an embedding from `model`.
    async fn search_candidates(
        &self,
        tenant_id: &TenantId,
        model: &EmbeddingModel,
    ) -> Result<Vec<SearchCandidate>, RepositoryError>;
}
