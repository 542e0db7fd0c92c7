use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_core::chunking::chunk_text;
use tollgate_core::clock::Clock;
use tollgate_core::domain::knowledge::{
    ChunkId, KnowledgeChunk, KnowledgeEmbedding, KnowledgeSource, KnowledgeSourceId, SourceKind,
    SourceStatus,
};
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::errors::ApplicationError;
use tollgate_db::repositories::{KnowledgeRepository, RepositoryError};

use super::embedder::Embedder;
use super::fetcher::DocumentFetcher;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("knowledge source `{0}` not found")]
    NotFound(String),
    #[error("knowledge source cannot move from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("text extraction failed: {0}")]
    Extraction(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<IngestError> for ApplicationError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::Repository(error) => Self::Persistence(error.to_string()),
            IngestError::Extraction(message) => Self::Integration(message),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewSource {
    pub tenant_id: TenantId,
    pub kind: SourceKind,
    pub title: String,
    pub url: Option<String>,
    pub file_ref: Option<String>,
    pub raw_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngestionReport {
    pub source_id: KnowledgeSourceId,
    pub status: SourceStatus,
    pub chunk_count: u32,
    pub embedding_count: u32,
    pub failed_embedding_count: u32,
    pub quality_score: Option<f64>,
}

/// Extraction, chunking and per-chunk embedding for one source at a time.
/// A chunk that fails to embed is counted, never fatal.
pub struct KnowledgeIngestor {
    repository: Arc<dyn KnowledgeRepository>,
    embedder: Arc<dyn Embedder>,
    fetcher: Arc<dyn DocumentFetcher>,
    clock: Arc<dyn Clock>,
    chunk_size_chars: usize,
}

impl KnowledgeIngestor {
    pub fn new(
        repository: Arc<dyn KnowledgeRepository>,
        embedder: Arc<dyn Embedder>,
        fetcher: Arc<dyn DocumentFetcher>,
        clock: Arc<dyn Clock>,
        chunk_size_chars: usize,
    ) -> Self {
        Self { repository, embedder, fetcher, clock, chunk_size_chars }
    }

    pub async fn create_source(&self, new: NewSource) -> Result<KnowledgeSource, IngestError> {
        let now = self.clock.now();
        let source = KnowledgeSource {
            id: KnowledgeSourceId(Uuid::new_v4().to_string()),
            tenant_id: new.tenant_id,
            kind: new.kind,
            title: new.title,
            url: new.url,
            file_ref: new.file_ref,
            raw_text: new.raw_text,
            extracted_text: None,
            status: SourceStatus::Pending,
            chunk_count: 0,
            embedding_count: 0,
            failed_embedding_count: 0,
            retry_count: 0,
            quality_score: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.repository.save_source(source.clone()).await?;
        Ok(source)
    }

    /// Runs the pipeline. Sources left in `error`, `active`, or mid-pipeline
    /// are re-queued first; a retry from `error` bumps `retry_count`.
    pub async fn ingest(&self, source_id: &KnowledgeSourceId) -> Result<IngestionReport, IngestError> {
        let mut source = self
            .repository
            .find_source(source_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(source_id.0.clone()))?;

        match source.status {
            SourceStatus::Pending => {}
            SourceStatus::Active => self.advance(&mut source, SourceStatus::Pending).await?,
            SourceStatus::Error => {
                source.retry_count = source.retry_count.saturating_add(1);
                self.advance(&mut source, SourceStatus::Pending).await?;
            }
            SourceStatus::Processing | SourceStatus::Chunking | SourceStatus::Embedding => {
                self.advance(&mut source, SourceStatus::Error).await?;
                source.retry_count = source.retry_count.saturating_add(1);
                self.advance(&mut source, SourceStatus::Pending).await?;
            }
        }

        match self.run_pipeline(&mut source).await {
            Ok(report) => Ok(report),
            Err(error) => {
                warn!(
                    event_name = "knowledge.ingest.failed",
                    tenant_id = %source.tenant_id,
                    source_id = %source.id.0,
                    status = source.status.as_str(),
                    error = %error,
                    "knowledge source ingestion failed"
                );
                source.last_error = Some(error.to_string());
                if source.status.can_transition_to(SourceStatus::Error) {
                    source.status = SourceStatus::Error;
                }
                source.updated_at = self.clock.now();
                if let Err(save_error) = self.repository.save_source(source.clone()).await {
                    warn!(
                        event_name = "knowledge.ingest.status_save_failed",
                        source_id = %source.id.0,
                        error = %save_error,
                        "could not record ingestion failure"
                    );
                }
                Err(error)
            }
        }
    }

    async fn run_pipeline(
        &self,
        source: &mut KnowledgeSource,
    ) -> Result<IngestionReport, IngestError> {
        self.advance(source, SourceStatus::Processing).await?;
        let text = self.extract(source).await?;
        source.extracted_text = Some(text.clone());

        self.advance(source, SourceStatus::Chunking).await?;
        let chunks: Vec<KnowledgeChunk> = chunk_text(&text, self.chunk_size_chars)
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| KnowledgeChunk {
                id: ChunkId(Uuid::new_v4().to_string()),
                source_id: source.id.clone(),
                tenant_id: source.tenant_id.clone(),
                ordinal: u32::try_from(ordinal).unwrap_or(u32::MAX),
                content: draft.content,
                word_count: draft.word_count,
                char_count: draft.char_count,
                quality_score: draft.quality_score,
                active: true,
            })
            .collect();
        if chunks.is_empty() {
            return Err(IngestError::Extraction("source produced no chunks".to_string()));
        }
        self.repository.replace_chunks(&source.id, chunks.clone()).await?;
        source.chunk_count = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        source.quality_score = Some(
            chunks.iter().map(|chunk| chunk.quality_score).sum::<f64>() / chunks.len() as f64,
        );

        self.advance(source, SourceStatus::Embedding).await?;
        let mut embedded = 0_u32;
        let mut failed = 0_u32;
        for chunk in &chunks {
            match self.embed_chunk(chunk, self.clock.now()).await {
                Ok(()) => embedded += 1,
                Err(reason) => {
                    failed += 1;
                    warn!(
                        event_name = "knowledge.chunk.embedding_failed",
                        tenant_id = %source.tenant_id,
                        source_id = %source.id.0,
                        ordinal = chunk.ordinal,
                        error = %reason,
                        "chunk embedding failed"
                    );
                }
            }
        }
        source.embedding_count = embedded;
        source.failed_embedding_count = failed;
        source.last_error =
            (failed > 0).then(|| format!("{failed} of {} chunks failed to embed", chunks.len()));

        self.advance(source, SourceStatus::Active).await?;
        info!(
            event_name = "knowledge.ingest.completed",
            tenant_id = %source.tenant_id,
            source_id = %source.id.0,
            chunks = source.chunk_count,
            embeddings = embedded,
            failed_embeddings = failed,
            "knowledge source active"
        );

        Ok(IngestionReport {
            source_id: source.id.clone(),
            status: source.status,
            chunk_count: source.chunk_count,
            embedding_count: embedded,
            failed_embedding_count: failed,
            quality_score: source.quality_score,
        })
    }

    async fn extract(&self, source: &KnowledgeSource) -> Result<String, IngestError> {
        let text = match source.kind {
            SourceKind::Document => source
                .raw_text
                .clone()
                .ok_or_else(|| IngestError::Extraction("document has no text".to_string()))?,
            SourceKind::Url => {
                let url = source
                    .url
                    .as_deref()
                    .ok_or_else(|| IngestError::Extraction("url source has no url".to_string()))?;
                self.fetcher
                    .fetch_text(url)
                    .await
                    .map_err(|error| IngestError::Extraction(error.to_string()))?
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(IngestError::Extraction("no extractable text".to_string()));
        }
        Ok(text)
    }

    async fn embed_chunk(&self, chunk: &KnowledgeChunk, now: DateTime<Utc>) -> Result<(), String> {
        let vector = self.embedder.embed(&chunk.content).await.map_err(|error| error.to_string())?;
        self.repository
            .save_embedding(KnowledgeEmbedding {
                chunk_id: chunk.id.clone(),
                tenant_id: chunk.tenant_id.clone(),
                model: self.embedder.model().clone(),
                vector,
                created_at: now,
            })
            .await
            .map_err(|error| error.to_string())
    }

    async fn advance(
        &self,
        source: &mut KnowledgeSource,
        next: SourceStatus,
    ) -> Result<(), IngestError> {
        if !source.status.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: source.status.as_str(),
                to: next.as_str(),
            });
        }
        source.status = next;
        source.updated_at = self.clock.now();
        self.repository.save_source(source.clone()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use tollgate_core::clock::FixedClock;
    use tollgate_core::domain::knowledge::{EmbeddingModel, SourceKind, SourceStatus};
    use tollgate_core::domain::tenant::TenantId;
    use tollgate_db::repositories::{InMemoryKnowledgeRepository, KnowledgeRepository};

    use super::{IngestError, KnowledgeIngestor, NewSource};
    use crate::knowledge::embedder::{Embedder, EmbeddingError};
    use crate::knowledge::fetcher::{DocumentFetcher, FetchError};

    /// Fails on any chunk mentioning "forbidden".
    struct PickyEmbedder {
        model: EmbeddingModel,
    }

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn model(&self) -> &EmbeddingModel {
            &self.model
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains("forbidden") {
                return Err(EmbeddingError::Api { status: 400, message: "rejected".to_string() });
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct OfflineFetcher;

    #[async_trait]
    impl DocumentFetcher for OfflineFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            Err(FetchError::Transport { url: url.to_string(), message: "offline".to_string() })
        }
    }

    fn ingestor(repository: Arc<InMemoryKnowledgeRepository>) -> KnowledgeIngestor {
        KnowledgeIngestor::new(
            repository,
            Arc::new(PickyEmbedder { model: EmbeddingModel::new("test-embed", "1") }),
            Arc::new(OfflineFetcher),
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap())),
            60,
        )
    }

    fn document(text: &str) -> NewSource {
        NewSource {
            tenant_id: TenantId::new("t-kb"),
            kind: SourceKind::Document,
            title: "Handbook".to_string(),
            url: None,
            file_ref: None,
            raw_text: Some(text.to_string()),
        }
    }

    #[tokio::test]
    async fn chunk_failures_are_counted_not_fatal() {
        let repository = Arc::new(InMemoryKnowledgeRepository::default());
        let ingestor = ingestor(repository.clone());
        let source = ingestor
            .create_source(document(
                "Refunds are processed within five business days. \
                 This sentence mentions a forbidden topic entirely. \
                 Shipping is free for orders above fifty dollars.",
            ))
            .await
            .expect("create");

        let report = ingestor.ingest(&source.id).await.expect("ingest");

        assert_eq!(report.status, SourceStatus::Active);
        assert!(report.chunk_count >= 2);
        assert!(report.failed_embedding_count >= 1);
        assert_eq!(report.embedding_count + report.failed_embedding_count, report.chunk_count);
        assert!(report.quality_score.is_some());

        let stored = repository.find_source(&source.id).await.expect("find").expect("source");
        assert_eq!(stored.status, SourceStatus::Active);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn failed_extraction_marks_error_and_retry_counts() {
        let repository = Arc::new(InMemoryKnowledgeRepository::default());
        let ingestor = ingestor(repository.clone());
        let source = ingestor
            .create_source(NewSource {
                kind: SourceKind::Url,
                url: Some("https://docs.example.com/faq".to_string()),
                raw_text: None,
                ..document("")
            })
            .await
            .expect("create");

        let first = ingestor.ingest(&source.id).await.expect_err("offline");
        assert!(matches!(first, IngestError::Extraction(_)));
        let stored = repository.find_source(&source.id).await.expect("find").expect("source");
        assert_eq!(stored.status, SourceStatus::Error);
        assert_eq!(stored.retry_count, 0);

        ingestor.ingest(&source.id).await.expect_err("still offline");
        let stored = repository.find_source(&source.id).await.expect("find").expect("source");
        assert_eq!(stored.retry_count, 1);
    }
}
