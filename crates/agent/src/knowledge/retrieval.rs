use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use tollgate_core::clock::Clock;
use tollgate_core::config::RetrievalConfig;
use tollgate_core::domain::knowledge::{EmbeddingModel, SearchCandidate, SearchResult};
use tollgate_core::domain::message::ConversationId;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::errors::ApplicationError;
use tollgate_core::similarity::cosine_similarity;
use tollgate_db::repositories::{KnowledgeRepository, RepositoryError};

use super::embedder::{Embedder, EmbeddingError};
use super::signer::{FileUrlSigner, SignedUrl};
use crate::broker::{CompletionService, RequestOptions};

pub const LOW_CONFIDENCE_FALLBACK: &str = "I couldn't find a reliable answer to that in our \
knowledge base. A member of our team will follow up with you shortly.";

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("query embedding timed out")]
    Timeout,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<RetrievalError> for ApplicationError {
    fn from(value: RetrievalError) -> Self {
        match value {
            RetrievalError::Repository(error) => Self::Persistence(error.to_string()),
            other => Self::Integration(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchOptions {
    pub max_results: usize,
    pub min_similarity: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_results: 5, min_similarity: 0.75 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalSettings {
    pub search: SearchOptions,
    pub attachment_similarity: f32,
    pub max_attachments: usize,
    pub confidence_cap: f32,
    pub timeout: Duration,
}

impl From<&RetrievalConfig> for RetrievalSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            search: SearchOptions {
                max_results: config.max_results,
                min_similarity: config.min_similarity,
            },
            attachment_similarity: config.attachment_similarity,
            max_attachments: config.max_attachments,
            confidence_cap: config.confidence_cap,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub file_ref: String,
    pub source_title: String,
    pub similarity: f32,
    pub download: SignedUrl,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub response_text: String,
    pub files_to_send: Vec<Attachment>,
    pub knowledge_used: Vec<SearchResult>,
    /// Mean similarity of the contributing chunks, capped.
    pub confidence: f32,
    /// False when the fixed fallback text was returned.
    pub grounded: bool,
}

impl Resolution {
    fn fallback() -> Self {
        Self {
            response_text: LOW_CONFIDENCE_FALLBACK.to_string(),
            files_to_send: Vec::new(),
            knowledge_used: Vec::new(),
            confidence: 0.0,
            grounded: false,
        }
    }
}

pub struct KnowledgeRetriever {
    repository: Arc<dyn KnowledgeRepository>,
    embedder: Arc<dyn Embedder>,
    completions: Arc<dyn CompletionService>,
    signer: Arc<dyn FileUrlSigner>,
    clock: Arc<dyn Clock>,
    settings: RetrievalSettings,
}

impl KnowledgeRetriever {
    pub fn new(
        repository: Arc<dyn KnowledgeRepository>,
        embedder: Arc<dyn Embedder>,
        completions: Arc<dyn CompletionService>,
        signer: Arc<dyn FileUrlSigner>,
        clock: Arc<dyn Clock>,
        settings: RetrievalSettings,
    ) -> Self {
        Self { repository, embedder, completions, signer, clock, settings }
    }

    pub fn default_options(&self) -> SearchOptions {
        self.settings.search
    }

    /// Linear cosine scan over the tenant's active chunks in the embedder's
    /// model space.
    pub async fn search(
        &self,
        tenant_id: &TenantId,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        let query_vector = tokio::time::timeout(self.settings.timeout, self.embedder.embed(query))
            .await
            .map_err(|_elapsed| RetrievalError::Timeout)??;
        let model: &EmbeddingModel = self.embedder.model();
        let candidates = self.repository.search_candidates(tenant_id, model).await?;
        let scanned = candidates.len();

        let results = rank_candidates(&query_vector, candidates, options);
        debug!(
            event_name = "retrieval.search.completed",
            tenant_id = %tenant_id,
            scanned,
            returned = results.len(),
            "knowledge search completed"
        );
        Ok(results)
    }

    pub async fn resolve(
        &self,
        tenant_id: &TenantId,
        query: &str,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Resolution, RetrievalError> {
        let results = self.search(tenant_id, query, self.settings.search).await?;
        if results.is_empty() {
            info!(
                event_name = "retrieval.resolve.no_match",
                tenant_id = %tenant_id,
                conversation_id = conversation_id.map(|id| id.0.as_str()).unwrap_or("-"),
                "no knowledge above similarity threshold"
            );
            return Ok(Resolution::fallback());
        }

        let prompt = grounded_prompt(query, &results);
        let call = self.completions.complete(tenant_id, &prompt, RequestOptions::default());
        let answer = match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(Ok(reply)) => reply.response,
            Ok(Err(error)) => {
                warn!(
                    event_name = "retrieval.resolve.completion_failed",
                    tenant_id = %tenant_id,
                    error = %error,
                    "grounded answer generation failed"
                );
                return Ok(Resolution::fallback());
            }
            Err(_elapsed) => {
                warn!(
                    event_name = "retrieval.resolve.completion_timeout",
                    tenant_id = %tenant_id,
                    "grounded answer generation timed out"
                );
                return Ok(Resolution::fallback());
            }
        };

        let confidence = resolution_confidence(&results, self.settings.confidence_cap);
        let files_to_send = self.attachments(&results);

        info!(
            event_name = "retrieval.resolve.completed",
            tenant_id = %tenant_id,
            conversation_id = conversation_id.map(|id| id.0.as_str()).unwrap_or("-"),
            chunks = results.len(),
            attachments = files_to_send.len(),
            confidence,
            "grounded answer generated"
        );

        Ok(Resolution {
            response_text: answer.trim().to_string(),
            files_to_send,
            knowledge_used: results,
            confidence,
            grounded: true,
        })
    }

    fn attachments(&self, results: &[SearchResult]) -> Vec<Attachment> {
        let now = self.clock.now();
        let mut seen = BTreeSet::new();
        results
            .iter()
            .filter(|result| result.similarity >= self.settings.attachment_similarity)
            .filter_map(|result| result.file_ref.as_ref().map(|file_ref| (result, file_ref)))
            .filter(|(_, file_ref)| seen.insert(file_ref.to_string()))
            .take(self.settings.max_attachments)
            .map(|(result, file_ref)| Attachment {
                file_ref: file_ref.clone(),
                source_title: result.source_title.clone(),
                similarity: result.similarity,
                download: self.signer.sign(file_ref, now),
            })
            .collect()
    }
}

/// Filters by `min_similarity`, sorts best first, caps at `max_results`.
pub fn rank_candidates(
    query_vector: &[f32],
    candidates: Vec<SearchCandidate>,
    options: SearchOptions,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let similarity = cosine_similarity(query_vector, &candidate.vector);
            (similarity >= options.min_similarity).then(|| SearchResult {
                chunk_id: candidate.chunk.id,
                source_id: candidate.chunk.source_id,
                source_title: candidate.source_title,
                content: candidate.chunk.content,
                similarity,
                file_ref: candidate.file_ref,
            })
        })
        .collect();

    results.sort_by(|left, right| {
        right
            .similarity
            .partial_cmp(&left.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.chunk_id.0.cmp(&right.chunk_id.0))
    });
    results.truncate(options.max_results);
    results
}

pub fn resolution_confidence(results: &[SearchResult], cap: f32) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let mean = results.iter().map(|result| result.similarity).sum::<f32>() / results.len() as f32;
    mean.min(cap)
}

fn grounded_prompt(query: &str, results: &[SearchResult]) -> String {
    let context = results
        .iter()
        .enumerate()
        .map(|(index, result)| format!("[{}] ({})\n{}", index + 1, result.source_title, result.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Answer the customer's question using ONLY the context below. If the context does not \
         contain the answer, say you don't know. Do not invent facts, prices, or policies.\n\n\
         Context:\n{context}\n\nQuestion: {query}\nAnswer:"
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use secrecy::SecretString;

    use tollgate_core::clock::FixedClock;
    use tollgate_core::config::AppConfig;
    use tollgate_core::domain::knowledge::{
        ChunkId, EmbeddingModel, KnowledgeChunk, KnowledgeSourceId, SearchCandidate, SearchResult,
    };
    use tollgate_core::domain::tenant::TenantId;
    use tollgate_db::repositories::InMemoryKnowledgeRepository;

    use super::{
        rank_candidates, resolution_confidence, KnowledgeRetriever, RetrievalSettings,
        SearchOptions,
    };
    use crate::broker::{BrokerError, BrokerResponse, CompletionService, RequestOptions};
    use crate::knowledge::embedder::{Embedder, EmbeddingError};
    use crate::knowledge::signer::HmacUrlSigner;

    struct UnusedEmbedder(EmbeddingModel);

    #[async_trait]
    impl Embedder for UnusedEmbedder {
        fn model(&self) -> &EmbeddingModel {
            &self.0
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct NoCompletions;

    #[async_trait]
    impl CompletionService for NoCompletions {
        async fn complete(
            &self,
            _tenant_id: &TenantId,
            _prompt: &str,
            _options: RequestOptions,
        ) -> Result<BrokerResponse, BrokerError> {
            Err(BrokerError::NoProviderAvailable)
        }
    }

    fn retriever() -> KnowledgeRetriever {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap());
        KnowledgeRetriever::new(
            Arc::new(InMemoryKnowledgeRepository::default()),
            Arc::new(UnusedEmbedder(EmbeddingModel::new("test-embed", "1"))),
            Arc::new(NoCompletions),
            Arc::new(HmacUrlSigner::new(
                "https://files.example.com",
                SecretString::from("test-secret".to_string()),
                Duration::hours(1),
            )),
            Arc::new(clock),
            RetrievalSettings::from(&AppConfig::default().retrieval),
        )
    }

    fn attached(id: &str, similarity: f32, file_ref: &str) -> SearchResult {
        SearchResult {
            chunk_id: ChunkId(id.to_string()),
            file_ref: Some(file_ref.to_string()),
            ..result(similarity)
        }
    }

    fn candidate(id: &str, vector: Vec<f32>) -> SearchCandidate {
        SearchCandidate {
            chunk: KnowledgeChunk {
                id: ChunkId(id.to_string()),
                source_id: KnowledgeSourceId("s-1".to_string()),
                tenant_id: TenantId::new("t-kb"),
                ordinal: 0,
                content: format!("content {id}"),
                word_count: 2,
                char_count: 10,
                quality_score: 0.9,
                active: true,
            },
            source_title: "FAQ".to_string(),
            file_ref: None,
            vector,
        }
    }

    fn result(similarity: f32) -> SearchResult {
        SearchResult {
            chunk_id: ChunkId("c".to_string()),
            source_id: KnowledgeSourceId("s".to_string()),
            source_title: "FAQ".to_string(),
            content: String::new(),
            similarity,
            file_ref: None,
        }
    }

    #[test]
    fn ranking_respects_limit_and_order() {
        let query = [1.0, 0.0];
        let candidates = vec![
            candidate("far", vec![0.0, 1.0]),
            candidate("near", vec![1.0, 0.05]),
            candidate("exact", vec![2.0, 0.0]),
        ];

        let results = rank_candidates(&query, candidates, SearchOptions { max_results: 1, min_similarity: 0.5 });

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id.0, "exact");
    }

    #[test]
    fn attachments_start_at_the_similarity_threshold() {
        let results = vec![
            attached("c-1", 0.92, "docs/refunds.pdf"),
            attached("c-2", 0.90, "docs/refunds.pdf"),
            attached("c-3", 0.80, "docs/shipping.pdf"),
            attached("c-4", 0.79, "docs/warranty.pdf"),
            result(0.95),
        ];

        let files = retriever().attachments(&results);

        let refs: Vec<&str> = files.iter().map(|file| file.file_ref.as_str()).collect();
        assert_eq!(refs, vec!["docs/refunds.pdf", "docs/shipping.pdf"]);
        assert_eq!(files[1].similarity, 0.80);
        assert!(files[0].download.url.starts_with("https://files.example.com/docs/refunds.pdf?"));
    }

    #[test]
    fn attachments_are_capped_at_three_distinct_files() {
        let results = vec![
            attached("c-1", 0.97, "a.pdf"),
            attached("c-2", 0.96, "a.pdf"),
            attached("c-3", 0.93, "b.pdf"),
            attached("c-4", 0.90, "c.pdf"),
            attached("c-5", 0.85, "d.pdf"),
            attached("c-6", 0.80, "e.pdf"),
        ];

        let files = retriever().attachments(&results);

        let refs: Vec<&str> = files.iter().map(|file| file.file_ref.as_str()).collect();
        assert_eq!(refs, vec!["a.pdf", "b.pdf", "c.pdf"]);
    }

    #[test]
    fn confidence_is_mean_similarity_capped() {
        assert!((resolution_confidence(&[result(0.8), result(0.9)], 0.95) - 0.85).abs() < 1e-6);
        assert!((resolution_confidence(&[result(0.99), result(1.0)], 0.95) - 0.95).abs() < 1e-6);
        assert_eq!(resolution_confidence(&[], 0.95), 0.0);
    }
}
