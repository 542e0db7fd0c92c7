use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnowledgeSourceId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Document,
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Url => "url",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Some(Self::Document),
            "url" => Some(Self::Url),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Processing,
    Chunking,
    Embedding,
    Active,
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Active => "active",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "chunking" => Some(Self::Chunking),
            "embedding" => Some(Self::Embedding),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Forward-only pipeline; `Error` can be reached from any non-terminal
    /// state and re-queued to `Pending` for a retry.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Chunking)
                | (Chunking, Embedding)
                | (Embedding, Active)
                | (Pending | Processing | Chunking | Embedding, Error)
                | (Error | Active, Pending)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub id: KnowledgeSourceId,
    pub tenant_id: TenantId,
    pub kind: SourceKind,
    pub title: String,
    pub url: Option<String>,
    /// Object-storage reference of the original file, if one was uploaded.
    pub file_ref: Option<String>,
    pub raw_text: Option<String>,
    pub extracted_text: Option<String>,
    pub status: SourceStatus,
    pub chunk_count: u32,
    pub embedding_count: u32,
    pub failed_embedding_count: u32,
    pub retry_count: u32,
    pub quality_score: Option<f64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: ChunkId,
    pub source_id: KnowledgeSourceId,
    pub tenant_id: TenantId,
    pub ordinal: u32,
    pub content: String,
    pub word_count: u32,
    pub char_count: u32,
    pub quality_score: f64,
    pub active: bool,
}

/// Identifies the vector space an embedding lives in. Vectors with different
/// models are never compared.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub name: String,
    pub version: String,
}

impl EmbeddingModel {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEmbedding {
    pub chunk_id: ChunkId,
    pub tenant_id: TenantId,
    pub model: EmbeddingModel,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A chunk joined with what search and resolution need from its source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub chunk: KnowledgeChunk,
    pub source_title: String,
    pub file_ref: Option<String>,
    pub vector: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub source_id: KnowledgeSourceId,
    pub source_title: String,
    pub content: String,
    pub similarity: f32,
    pub file_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::SourceStatus;

    #[test]
    fn pipeline_only_moves_forward() {
        assert!(SourceStatus::Pending.can_transition_to(SourceStatus::Processing));
        assert!(SourceStatus::Embedding.can_transition_to(SourceStatus::Active));
        assert!(!SourceStatus::Pending.can_transition_to(SourceStatus::Active));
        assert!(!SourceStatus::Active.can_transition_to(SourceStatus::Error));
        assert!(SourceStatus::Error.can_transition_to(SourceStatus::Pending));
    }
}
