//! Knowledge base: source ingestion (extract, chunk, embed) and grounded
//! retrieval over the resulting vectors.

pub mod embedder;
pub mod fetcher;
pub mod ingest;
pub mod retrieval;
pub mod signer;

pub use embedder::{Embedder, EmbeddingError, OpenAiEmbedder};
pub use fetcher::{strip_markup, DocumentFetcher, FetchError, HttpDocumentFetcher};
pub use ingest::{IngestError, IngestionReport, KnowledgeIngestor, NewSource};
pub use retrieval::{
    rank_candidates, Attachment, KnowledgeRetriever, Resolution, RetrievalError,
    RetrievalSettings, SearchOptions, LOW_CONFIDENCE_FALLBACK,
};
pub use signer::{FileUrlSigner, HmacUrlSigner, SignedUrl};
