use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use tollgate_core::domain::automation::{AutomationRule, ExecutionRecord, ExecutionStatus, RuleId};
use tollgate_core::domain::cache::{AnalysisCacheEntry, BrokerStats, CacheEntry, CacheStats};
use tollgate_core::domain::knowledge::{
    ChunkId, EmbeddingModel, KnowledgeChunk, KnowledgeEmbedding, KnowledgeSource,
    KnowledgeSourceId, SearchCandidate, SourceStatus,
};
use tollgate_core::domain::message::{
    Contact, ContactId, Conversation, ConversationId, OutboundReply, Priority,
};
use tollgate_core::domain::provider::ProviderConfig;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::domain::wallet::{
    BillingReconciliation, FinancialHistoryEntry, LedgerTransaction, RechargeRequest,
    TransactionKind, Wallet,
};
use tollgate_core::errors::DomainError;
use tollgate_core::pricing::client_cost;

use super::{
    replayed_recharge, AnalysisCacheRepository, CrmRepository, DebitRequest, KnowledgeRepository,
    PromptCacheRepository, ProviderRepository, RepositoryError, RuleRepository, WalletRepository,
    WalletWriteError,
};

#[derive(Default)]
struct Ledger {
    wallets: HashMap<TenantId, Wallet>,
    transactions: HashMap<TenantId, Vec<LedgerTransaction>>,
    history: HashMap<TenantId, Vec<FinancialHistoryEntry>>,
    reconciliations: Vec<BillingReconciliation>,
}

impl Ledger {
    fn apply<F>(
        &mut self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<LedgerTransaction, WalletWriteError>
    where
        F: FnOnce(&mut Wallet) -> Result<LedgerTransaction, DomainError>,
    {
        let current =
            self.wallets.get(tenant_id).cloned().unwrap_or_else(|| Wallet::new(tenant_id.clone(), now));
        let mut next = current;
        let transaction = mutate(&mut next)?;

        self.wallets.insert(tenant_id.clone(), next);
        self.history
            .entry(tenant_id.clone())
            .or_default()
            .push(FinancialHistoryEntry::for_transaction(&transaction));
        self.transactions.entry(tenant_id.clone()).or_default().push(transaction.clone());
        Ok(transaction)
    }

    fn find_recharge(&self, request: &RechargeRequest) -> Option<LedgerTransaction> {
        self.transactions.get(&request.tenant_id).and_then(|transactions| {
            transactions
                .iter()
                .find(|tx| tx.payment_reference() == Some(request.payment_reference.as_str()))
                .cloned()
        })
    }
}

/// Single-lock twin of the SQL wallet store; the mutex serializes every
/// money movement the way the database write lock does.
#[derive(Default)]
pub struct InMemoryWalletRepository {
    ledger: Mutex<Ledger>,
}

#[async_trait::async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Wallet>, RepositoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.wallets.get(tenant_id).cloned())
    }

    async fn get_or_create(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Wallet, RepositoryError> {
        let mut ledger = self.ledger.lock().await;
        Ok(ledger
            .wallets
            .entry(tenant_id.clone())
            .or_insert_with(|| Wallet::new(tenant_id.clone(), now))
            .clone())
    }

    async fn debit(
        &self,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, WalletWriteError> {
        let charge = client_cost(request.provider_cost, request.margin);
        let mut ledger = self.ledger.lock().await;
        ledger.apply(&request.tenant_id, now, |wallet| {
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
    }

    async fn credit(
        &self,
        request: RechargeRequest,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, WalletWriteError> {
        let mut ledger = self.ledger.lock().await;
        if let Some(existing) = ledger.find_recharge(&request) {
            return replayed_recharge(existing, &request);
        }
        ledger.apply(&request.tenant_id, now, |wallet| {
            let balance_after = wallet.apply_credit(request.amount, &request.currency, now)?;
            Ok(LedgerTransaction::recharge_credit(&request, balance_after, now))
        })
    }

    async fn transactions(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LedgerTransaction>, RepositoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.transactions.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn history(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<FinancialHistoryEntry>, RepositoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .history
            .get(tenant_id)
            .map(|entries| entries.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn record_reconciliation(
        &self,
        reconciliation: BillingReconciliation,
    ) -> Result<(), RepositoryError> {
        let mut ledger = self.ledger.lock().await;
        ledger.reconciliations.push(reconciliation);
        Ok(())
    }

    async fn open_reconciliations(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<BillingReconciliation>, RepositoryError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .reconciliations
            .iter()
            .filter(|entry| tenant_id.map_or(true, |tenant| &entry.tenant_id == tenant))
            .cloned()
            .collect())
    }

    async fn usage_stats(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<BrokerStats, RepositoryError> {
        let ledger = self.ledger.lock().await;
        let mut stats = BrokerStats::default();

        let debits = ledger
            .transactions
            .iter()
            .filter(|(tenant, _)| tenant_id.map_or(true, |wanted| *tenant == wanted))
            .flat_map(|(_, transactions)| transactions.iter())
            .filter(|transaction| transaction.kind == TransactionKind::UsageDebit);

        for transaction in debits {
            stats.total_requests += 1;
            if transaction.is_cache_hit() {
                stats.cache_hits += 1;
            } else {
                stats.cache_misses += 1;
            }
            stats.total_provider_cost += transaction.provider_cost;
            stats.total_client_cost += transaction.client_cost;
            stats.total_input_tokens += u64::from(transaction.usage.input_tokens);
            stats.total_output_tokens += u64::from(transaction.usage.output_tokens);
        }

        stats.pending_reconciliations = ledger
            .reconciliations
            .iter()
            .filter(|entry| tenant_id.map_or(true, |tenant| &entry.tenant_id == tenant))
            .count() as u64;

        Ok(stats)
    }
}

#[derive(Default)]
pub struct InMemoryPromptCacheRepository {
    entries: RwLock<HashMap<(TenantId, String), CacheEntry>>,
}

#[async_trait::async_trait]
impl PromptCacheRepository for InMemoryPromptCacheRepository {
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        prompt_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(tenant_id.clone(), prompt_hash.to_string()))
            .filter(|entry| entry.is_live(now))
            .cloned())
    }

    async fn record_hit(
        &self,
        tenant_id: &TenantId,
        prompt_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&(tenant_id.clone(), prompt_hash.to_string())) {
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_used_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert((entry.tenant_id.clone(), entry.prompt_hash.clone()), entry);
        Ok(())
    }

    async fn purge(&self, tenant_id: Option<&TenantId>) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(tenant, _), _| tenant_id.is_some_and(|wanted| tenant != wanted));
        Ok((before - entries.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    async fn stats(
        &self,
        tenant_id: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<CacheStats, RepositoryError> {
        let entries = self.entries.read().await;
        let mut stats = CacheStats::default();

        for entry in entries
            .values()
            .filter(|entry| tenant_id.map_or(true, |wanted| &entry.tenant_id == wanted))
        {
            stats.total_entries += 1;
            if entry.is_live(now) {
                stats.live_entries += 1;
            } else {
                stats.expired_entries += 1;
            }
            stats.total_hits += entry.hit_count;
            stats.provider_cost_avoided += entry.original_cost * Decimal::from(entry.hit_count);
        }

        Ok(stats)
    }
}

#[derive(Default)]
pub struct InMemoryAnalysisCacheRepository {
    entries: RwLock<HashMap<(TenantId, String), AnalysisCacheEntry>>,
}

#[async_trait::async_trait]
impl AnalysisCacheRepository for InMemoryAnalysisCacheRepository {
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisCacheEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(tenant_id.clone(), content_hash.to_string()))
            .filter(|entry| entry.is_live(now))
            .cloned())
    }

    async fn record_hit(
        &self,
        tenant_id: &TenantId,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&(tenant_id.clone(), content_hash.to_string())) {
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_used_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert(&self, entry: AnalysisCacheEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert((entry.tenant_id.clone(), entry.content_hash.clone()), entry);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryProviderRepository {
    providers: RwLock<Vec<ProviderConfig>>,
}

#[async_trait::async_trait]
impl ProviderRepository for InMemoryProviderRepository {
    async fn list(&self) -> Result<Vec<ProviderConfig>, RepositoryError> {
        Ok(self.providers.read().await.clone())
    }

    async fn find(&self, name: &str) -> Result<Option<ProviderConfig>, RepositoryError> {
        let name = name.trim().to_ascii_lowercase();
        let providers = self.providers.read().await;
        Ok(providers.iter().find(|provider| provider.name == name).cloned())
    }

    async fn save(&self, mut provider: ProviderConfig) -> Result<(), RepositoryError> {
        provider.name = provider.name.trim().to_ascii_lowercase();
        let mut providers = self.providers.write().await;

        if provider.is_default {
            for existing in providers.iter_mut() {
                existing.is_default = false;
            }
        }

        match providers.iter_mut().find(|existing| existing.name == provider.name) {
            Some(existing) => *existing = provider,
            None => providers.push(provider),
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, AutomationRule>>,
    executions: RwLock<Vec<ExecutionRecord>>,
}

#[async_trait::async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn active_rules(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<AutomationRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut active: Vec<AutomationRule> = rules
            .values()
            .filter(|rule| rule.active && &rule.tenant_id == tenant_id)
            .cloned()
            .collect();
        active.sort_by(|left, right| {
            left.priority
                .cmp(&right.priority)
                .then(left.created_at.cmp(&right.created_at))
                .then(left.id.0.cmp(&right.id.0))
        });
        Ok(active)
    }

    async fn find(&self, id: &RuleId) -> Result<Option<AutomationRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id.0).cloned())
    }

    async fn save(&self, rule: AutomationRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(&rule.id.0) {
            Some(existing) => {
                let stats = existing.stats.clone();
                *existing = AutomationRule { stats, ..rule };
            }
            None => {
                rules.insert(rule.id.0.clone(), rule);
            }
        }
        Ok(())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(&record.rule_id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("automation rule {}", record.rule_id.0)))?;

        rule.stats.evaluation_count += 1;
        if record.status.matched() {
            rule.stats.execution_count += 1;
            rule.stats.last_executed_at = Some(record.executed_at);
        }
        match record.status {
            ExecutionStatus::Executed => rule.stats.success_count += 1,
            ExecutionStatus::Failed | ExecutionStatus::PartiallyFailed => {
                rule.stats.error_count += 1
            }
            ExecutionStatus::Skipped => {}
        }

        self.executions.write().await.push(record.clone());
        Ok(())
    }

    async fn executions(&self, rule_id: &RuleId) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let executions = self.executions.read().await;
        Ok(executions.iter().filter(|record| &record.rule_id == rule_id).cloned().collect())
    }

    async fn last_auto_reply_at(
        &self,
        rule_id: &RuleId,
        conversation_id: &ConversationId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let executions = self.executions.read().await;
        Ok(executions
            .iter()
            .filter(|record| {
                &record.rule_id == rule_id
                    && &record.conversation_id == conversation_id
                    && record.replied()
            })
            .map(|record| record.executed_at)
            .max())
    }
}

#[derive(Default)]
pub struct InMemoryCrmRepository {
    contacts: RwLock<HashMap<String, Contact>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    replies: RwLock<Vec<OutboundReply>>,
}

impl InMemoryCrmRepository {
    fn not_found(entity: &str, id: &str) -> RepositoryError {
        RepositoryError::NotFound(format!("{entity} {id}"))
    }
}

#[async_trait::async_trait]
impl CrmRepository for InMemoryCrmRepository {
    async fn find_contact(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError> {
        Ok(self.contacts.read().await.get(&id.0).cloned())
    }

    async fn save_contact(
        &self,
        mut contact: Contact,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut contacts = self.contacts.write().await;
        if let Some(existing) = contacts.get(&contact.id.0) {
            let mut tags = existing.tags.clone();
            let known: HashSet<String> = tags.iter().cloned().collect();
            tags.extend(contact.tags.into_iter().filter(|tag| !known.contains(tag)));
            contact.tags = tags;
        }
        contacts.insert(contact.id.0.clone(), contact);
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversations.read().await.get(&id.0).cloned())
    }

    async fn save_conversation(
        &self,
        conversation: Conversation,
        _now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(conversation.id.0.clone(), conversation);
        Ok(())
    }

    async fn add_tag(
        &self,
        contact_id: &ContactId,
        tag: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut contacts = self.contacts.write().await;
        let contact =
            contacts.get_mut(&contact_id.0).ok_or_else(|| Self::not_found("contact", &contact_id.0))?;
        if contact.tags.iter().any(|existing| existing == tag) {
            return Ok(false);
        }
        contact.tags.push(tag.to_string());
        Ok(true)
    }

    async fn assign_agent(
        &self,
        conversation_id: &ConversationId,
        agent_id: &str,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id.0)
            .ok_or_else(|| Self::not_found("conversation", &conversation_id.0))?;
        conversation.assigned_agent = Some(agent_id.to_string());
        Ok(())
    }

    async fn set_priority(
        &self,
        conversation_id: &ConversationId,
        priority: Priority,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id.0)
            .ok_or_else(|| Self::not_found("conversation", &conversation_id.0))?;
        conversation.priority = priority;
        Ok(())
    }

    async fn mark_vip(&self, contact_id: &ContactId) -> Result<(), RepositoryError> {
        let mut contacts = self.contacts.write().await;
        let contact =
            contacts.get_mut(&contact_id.0).ok_or_else(|| Self::not_found("contact", &contact_id.0))?;
        contact.is_vip = true;
        Ok(())
    }

    async fn record_reply(&self, reply: OutboundReply) -> Result<(), RepositoryError> {
        self.replies.write().await.push(reply);
        Ok(())
    }

    async fn replies(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<OutboundReply>, RepositoryError> {
        let replies = self.replies.read().await;
        Ok(replies.iter().filter(|reply| &reply.conversation_id == conversation_id).cloned().collect())
    }
}

#[derive(Default)]
struct KnowledgeState {
    sources: BTreeMap<String, KnowledgeSource>,
    chunks: BTreeMap<(String, u32), KnowledgeChunk>,
    embeddings: HashMap<ChunkId, KnowledgeEmbedding>,
}

#[derive(Default)]
pub struct InMemoryKnowledgeRepository {
    state: RwLock<KnowledgeState>,
}

#[async_trait::async_trait]
impl KnowledgeRepository for InMemoryKnowledgeRepository {
    async fn save_source(&self, source: KnowledgeSource) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.sources.insert(source.id.0.clone(), source);
        Ok(())
    }

    async fn find_source(
        &self,
        id: &KnowledgeSourceId,
    ) -> Result<Option<KnowledgeSource>, RepositoryError> {
        Ok(self.state.read().await.sources.get(&id.0).cloned())
    }

    async fn list_sources(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<KnowledgeSource>, RepositoryError> {
        let state = self.state.read().await;
        let mut sources: Vec<KnowledgeSource> = state
            .sources
            .values()
            .filter(|source| &source.tenant_id == tenant_id)
            .cloned()
            .collect();
        sources.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then(left.id.0.cmp(&right.id.0))
        });
        Ok(sources)
    }

    async fn replace_chunks(
        &self,
        source_id: &KnowledgeSourceId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<(), RepositoryError> {
        if let Some(foreign) = chunks.iter().find(|chunk| chunk.source_id != *source_id) {
            return Err(RepositoryError::Decode(format!(
                "chunk {} belongs to source {}, not {}",
                foreign.id.0, foreign.source_id.0, source_id.0
            )));
        }

        let mut state = self.state.write().await;
        let stale: Vec<ChunkId> = state
            .chunks
            .values()
            .filter(|chunk| chunk.source_id == *source_id)
            .map(|chunk| chunk.id.clone())
            .collect();
        state.chunks.retain(|(source, _), _| source != &source_id.0);
        for chunk_id in stale {
            state.embeddings.remove(&chunk_id);
        }
        for chunk in chunks {
            state.chunks.insert((source_id.0.clone(), chunk.ordinal), chunk);
        }
        Ok(())
    }

    async fn save_embedding(&self, embedding: KnowledgeEmbedding) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if !state.chunks.values().any(|chunk| chunk.id == embedding.chunk_id) {
            return Err(RepositoryError::NotFound(format!("knowledge chunk {}", embedding.chunk_id.0)));
        }
        state.embeddings.insert(embedding.chunk_id.clone(), embedding);
        Ok(())
    }

    async fn search_candidates(
        &self,
        tenant_id: &TenantId,
        model: &EmbeddingModel,
    ) -> Result<Vec<SearchCandidate>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .values()
            .filter(|chunk| chunk.active && &chunk.tenant_id == tenant_id)
            .filter_map(|chunk| {
                let source = state
                    .sources
                    .get(&chunk.source_id.0)
                    .filter(|source| source.status == SourceStatus::Active)?;
                let embedding =
                    state.embeddings.get(&chunk.id).filter(|embedding| &embedding.model == model)?;
                Some(SearchCandidate {
                    chunk: chunk.clone(),
                    source_title: source.title.clone(),
                    file_ref: source.file_ref.clone(),
                    vector: embedding.vector.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use tollgate_core::domain::provider::ProviderConfig;
    use tollgate_core::domain::tenant::TenantId;
    use tollgate_core::domain::wallet::{RechargeRequest, TokenUsage, UsageMetadata};
    use tollgate_core::errors::DomainError;

    use super::{InMemoryProviderRepository, InMemoryWalletRepository};
    use crate::repositories::{DebitRequest, ProviderRepository, WalletRepository, WalletWriteError};

    fn recharge(tenant: &str, amount: Decimal) -> RechargeRequest {
        RechargeRequest {
            tenant_id: TenantId::new(tenant),
            amount,
            currency: "USD".to_string(),
            payment_reference: "pay_1".to_string(),
            provenance: "manual".to_string(),
        }
    }

    fn debit(tenant: &str, provider_cost: Decimal) -> DebitRequest {
        DebitRequest {
            tenant_id: TenantId::new(tenant),
            provider_cost,
            margin: Decimal::new(30, 2),
            usage: UsageMetadata {
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                usage: TokenUsage::new(100, 50),
                ..UsageMetadata::default()
            },
        }
    }

    #[tokio::test]
    async fn in_memory_wallet_matches_sql_semantics() {
        let repo = InMemoryWalletRepository::default();
        let tenant = TenantId::new("t-mem");

        repo.credit(recharge("t-mem", Decimal::ONE), Utc::now()).await.expect("credit");
        let charged = repo.debit(debit("t-mem", Decimal::new(50, 2)), Utc::now()).await.expect("debit");
        assert_eq!(charged.client_cost, Decimal::new(65, 2));
        assert_eq!(charged.balance_after, Decimal::new(35, 2));

        let refused = repo.debit(debit("t-mem", Decimal::ONE), Utc::now()).await;
        assert!(matches!(
            refused,
            Err(WalletWriteError::Rejected(DomainError::InsufficientBalance { .. }))
        ));

        let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
        assert_eq!(wallet.balance, Decimal::new(35, 2));
        assert_eq!(wallet.transaction_count, 2);
        assert_eq!(repo.transactions(&tenant).await.expect("transactions").len(), 2);
        assert_eq!(repo.history(&tenant, 1).await.expect("history")[0].amount, Decimal::new(-65, 2));

        let stats = repo.usage_stats(None).await.expect("stats");
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_input_tokens, 100);
    }

    #[tokio::test]
    async fn in_memory_wallet_applies_a_payment_reference_once() {
        let repo = InMemoryWalletRepository::default();
        let tenant = TenantId::new("t-mem-replay");

        let first =
            repo.credit(recharge("t-mem-replay", Decimal::TEN), Utc::now()).await.expect("credit");
        let replay =
            repo.credit(recharge("t-mem-replay", Decimal::TEN), Utc::now()).await.expect("replay");
        assert_eq!(first.id, replay.id);

        let foreign = repo
            .credit(
                RechargeRequest {
                    currency: "EUR".to_string(),
                    payment_reference: "pay_2".to_string(),
                    ..recharge("t-mem-replay", Decimal::TEN)
                },
                Utc::now(),
            )
            .await;
        assert!(matches!(
            foreign,
            Err(WalletWriteError::Rejected(DomainError::CurrencyMismatch { .. }))
        ));

        let wallet = repo.find(&tenant).await.expect("find").expect("wallet exists");
        assert_eq!(wallet.balance, Decimal::TEN);
        assert_eq!(repo.transactions(&tenant).await.expect("transactions").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_providers_keep_a_single_default() {
        let repo = InMemoryProviderRepository::default();
        for (name, is_default) in [("openai", true), ("ollama", true)] {
            repo.save(ProviderConfig {
                name: name.to_string(),
                display_name: name.to_string(),
                api_url: "http://localhost".to_string(),
                default_model: "m".to_string(),
                input_token_price: None,
                output_token_price: None,
                is_active: true,
                is_default,
            })
            .await
            .expect("save");
        }

        let providers = repo.list().await.expect("list");
        assert_eq!(providers.len(), 2);
        assert!(!providers[0].is_default);
        assert!(providers[1].is_default);
    }
}
