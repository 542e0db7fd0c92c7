use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as SignedUrlTtl;
use secrecy::SecretString;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_core::audit::AuditSink;
use tollgate_core::clock::{Clock, SystemClock};
use tollgate_core::config::{AppConfig, LlmConfig, LlmProvider};
use tollgate_core::domain::knowledge::EmbeddingModel;
use tollgate_core::domain::provider::ProviderConfig;
use tollgate_db::repositories::{
    CrmRepository, KnowledgeRepository, ProviderRepository, RepositoryError, RuleRepository,
    SqlAnalysisCacheRepository, SqlCrmRepository, SqlKnowledgeRepository,
    SqlPromptCacheRepository, SqlProviderRepository, SqlRuleRepository, SqlWalletRepository,
};
use tollgate_db::DbPool;

use crate::analyzer::{AnalyzerSettings, MessageAnalyzer};
use crate::automation::AutomationEngine;
use crate::broker::{BrokerSettings, CompletionService, UsageBroker};
use crate::credentials::{CredentialSource, CredentialStore};
use crate::knowledge::{
    EmbeddingError, FetchError, HmacUrlSigner, HttpDocumentFetcher, KnowledgeIngestor,
    KnowledgeRetriever, OpenAiEmbedder, RetrievalSettings,
};
use crate::ledger::LedgerService;
use crate::llm::{HttpProviderAdapter, ProviderError};
use crate::resolver::InboundResolver;

const OPENAI_API_URL: &str = "https://api.openai.com";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const OLLAMA_API_URL: &str = "http://localhost:11434";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Every service wired against one SQLite pool.
pub struct TollgateRuntime {
    pub ledger: LedgerService,
    pub broker: Arc<UsageBroker>,
    pub analyzer: Arc<MessageAnalyzer>,
    pub automation: Arc<AutomationEngine>,
    pub resolver: InboundResolver,
    pub providers: Arc<dyn ProviderRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub crm: Arc<dyn CrmRepository>,
    pub knowledge: Arc<dyn KnowledgeRepository>,
    /// Absent when no embedding credential is configured.
    pub ingestor: Option<Arc<KnowledgeIngestor>>,
    pub retriever: Option<Arc<KnowledgeRetriever>>,
}

impl TollgateRuntime {
    pub fn from_pool(
        config: &AppConfig,
        pool: DbPool,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, RuntimeError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let credentials: Arc<dyn CredentialSource> = Arc::new(CredentialStore::from_config(&config.llm));

        let wallets = Arc::new(
            SqlWalletRepository::new(pool.clone()).with_max_attempts(config.broker.debit_max_attempts),
        );
        let providers: Arc<dyn ProviderRepository> = Arc::new(SqlProviderRepository::new(pool.clone()));
        let rules: Arc<dyn RuleRepository> = Arc::new(SqlRuleRepository::new(pool.clone()));
        let crm: Arc<dyn CrmRepository> = Arc::new(SqlCrmRepository::new(pool.clone()));
        let knowledge: Arc<dyn KnowledgeRepository> = Arc::new(SqlKnowledgeRepository::new(pool.clone()));

        let ledger = LedgerService::new(wallets, Arc::clone(&clock));
        let adapter = HttpProviderAdapter::new(
            Duration::from_secs(config.llm.timeout_secs),
            config.llm.max_retries,
        )?;
        let broker = Arc::new(UsageBroker::new(
            ledger.clone(),
            Arc::new(SqlPromptCacheRepository::new(pool.clone())),
            Arc::clone(&providers),
            Arc::new(adapter),
            Arc::clone(&credentials),
            Arc::clone(&audit),
            Arc::clone(&clock),
            BrokerSettings::from(&config.broker),
        ));
        let completions: Arc<dyn CompletionService> = broker.clone();

        let analyzer = Arc::new(MessageAnalyzer::new(
            Arc::clone(&completions),
            Arc::new(SqlAnalysisCacheRepository::new(pool)),
            Arc::clone(&clock),
            AnalyzerSettings::from(&config.analyzer),
        ));
        let automation = Arc::new(AutomationEngine::new(
            Arc::clone(&rules),
            Arc::clone(&crm),
            audit,
            Arc::clone(&clock),
            &config.automation,
        ));

        let (ingestor, retriever) =
            match knowledge_services(config, &credentials, &knowledge, &completions, &clock)? {
                Some((ingestor, retriever)) => (Some(ingestor), Some(retriever)),
                None => (None, None),
            };

        let resolver =
            InboundResolver::new(Arc::clone(&analyzer), Arc::clone(&automation), retriever.clone());

        Ok(Self {
            ledger,
            broker,
            analyzer,
            automation,
            resolver,
            providers,
            rules,
            crm,
            knowledge,
            ingestor,
            retriever,
        })
    }

    /// Registers the configured LLM as the default provider when the registry
    /// is empty. Returns true when a row was written.
    pub async fn ensure_default_provider(&self, llm: &LlmConfig) -> Result<bool, RuntimeError> {
        if !self.providers.list().await?.is_empty() {
            return Ok(false);
        }
        let provider = default_provider(llm);
        info!(
            event_name = "runtime.provider.seeded",
            provider = %provider.name,
            model = %provider.default_model,
            "registered default provider from configuration"
        );
        self.providers.save(provider).await?;
        Ok(true)
    }
}

pub fn default_provider(llm: &LlmConfig) -> ProviderConfig {
    let (display_name, fallback_url) = match llm.provider {
        LlmProvider::OpenAi => ("OpenAI", OPENAI_API_URL),
        LlmProvider::Anthropic => ("Anthropic", ANTHROPIC_API_URL),
        LlmProvider::Ollama => ("Ollama", OLLAMA_API_URL),
    };

    ProviderConfig {
        name: llm.provider.as_str().to_string(),
        display_name: display_name.to_string(),
        api_url: llm.base_url.clone().unwrap_or_else(|| fallback_url.to_string()),
        default_model: llm.model.clone(),
        input_token_price: llm.input_token_price,
        output_token_price: llm.output_token_price,
        is_active: true,
        is_default: true,
    }
}

type KnowledgeServices = (Arc<KnowledgeIngestor>, Arc<KnowledgeRetriever>);

fn knowledge_services(
    config: &AppConfig,
    credentials: &Arc<dyn CredentialSource>,
    knowledge: &Arc<dyn KnowledgeRepository>,
    completions: &Arc<dyn CompletionService>,
    clock: &Arc<dyn Clock>,
) -> Result<Option<KnowledgeServices>, RuntimeError> {
    let Some(api_key) = credentials.credential(LlmProvider::OpenAi.as_str()) else {
        warn!(
            event_name = "runtime.knowledge.disabled",
            "no openai credential configured; knowledge ingestion and retrieval are disabled"
        );
        return Ok(None);
    };

    let embeddings_url = match (config.llm.provider, &config.llm.base_url) {
        (LlmProvider::OpenAi, Some(base_url)) => base_url.clone(),
        _ => OPENAI_API_URL.to_string(),
    };
    let timeout = Duration::from_secs(config.retrieval.timeout_secs);
    let embedder = Arc::new(OpenAiEmbedder::new(
        embeddings_url,
        api_key,
        EmbeddingModel::new(&config.retrieval.embedding_model, &config.retrieval.embedding_version),
        timeout,
    )?);

    let signing_key = config.retrieval.signing_key.clone().unwrap_or_else(|| {
        warn!(
            event_name = "runtime.signing_key.ephemeral",
            "no retrieval signing key configured; attachment links are valid for this process only"
        );
        SecretString::from(Uuid::new_v4().to_string())
    });
    let ttl = i64::try_from(config.retrieval.signed_url_ttl_secs).unwrap_or(i64::MAX);
    let signer = Arc::new(HmacUrlSigner::new(
        config.retrieval.files_base_url.clone(),
        signing_key,
        SignedUrlTtl::seconds(ttl),
    ));

    let ingestor = Arc::new(KnowledgeIngestor::new(
        Arc::clone(knowledge),
        embedder.clone(),
        Arc::new(HttpDocumentFetcher::new(timeout)?),
        Arc::clone(clock),
        config.retrieval.chunk_size_chars,
    ));
    let retriever = Arc::new(KnowledgeRetriever::new(
        Arc::clone(knowledge),
        embedder,
        Arc::clone(completions),
        signer,
        Arc::clone(clock),
        RetrievalSettings::from(&config.retrieval),
    ));

    Ok(Some((ingestor, retriever)))
}
