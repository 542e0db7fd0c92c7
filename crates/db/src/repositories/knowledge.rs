use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use tollgate_core::domain::knowledge::{
    ChunkId, EmbeddingModel, KnowledgeChunk, KnowledgeEmbedding, KnowledgeSource,
    KnowledgeSourceId, SearchCandidate, SourceKind, SourceStatus,
};
use tollgate_core::domain::tenant::TenantId;

use super::decode::{blob_to_vector, format_timestamp, parse_timestamp, parse_u32, vector_to_blob};
use super::{KnowledgeRepository, RepositoryError};
use crate::DbPool;

const SOURCE_COLUMNS: &str = "id, tenant_id, kind, title, url, file_ref, raw_text,
    extracted_text, status, chunk_count, embedding_count, failed_embedding_count, retry_count,
    quality_score, last_error, created_at, updated_at";

pub struct SqlKnowledgeRepository {
    pool: DbPool,
}

impl SqlKnowledgeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KnowledgeRepository for SqlKnowledgeRepository {
    async fn save_source(&self, source: KnowledgeSource) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO knowledge_source (
                id,
                tenant_id,
                kind,
                title,
                url,
                file_ref,
                raw_text,
                extracted_text,
                status,
                chunk_count,
                embedding_count,
                failed_embedding_count,
                retry_count,
                quality_score,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                url = excluded.url,
                file_ref = excluded.file_ref,
                raw_text = excluded.raw_text,
                extracted_text = excluded.extracted_text,
                status = excluded.status,
                chunk_count = excluded.chunk_count,
                embedding_count = excluded.embedding_count,
                failed_embedding_count = excluded.failed_embedding_count,
                retry_count = excluded.retry_count,
                quality_score = excluded.quality_score,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(&source.id.0)
        .bind(source.tenant_id.as_str())
        .bind(source.kind.as_str())
        .bind(&source.title)
        .bind(&source.url)
        .bind(&source.file_ref)
        .bind(&source.raw_text)
        .bind(&source.extracted_text)
        .bind(source.status.as_str())
        .bind(i64::from(source.chunk_count))
        .bind(i64::from(source.embedding_count))
        .bind(i64::from(source.failed_embedding_count))
        .bind(i64::from(source.retry_count))
        .bind(source.quality_score)
        .bind(&source.last_error)
        .bind(format_timestamp(source.created_at))
        .bind(format_timestamp(source.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_source(
        &self,
        id: &KnowledgeSourceId,
    ) -> Result<Option<KnowledgeSource>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM knowledge_source WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(source_from_row).transpose()
    }

    async fn list_sources(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<KnowledgeSource>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM knowledge_source
             WHERE tenant_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(source_from_row).collect()
    }

    async fn replace_chunks(
        &self,
        source_id: &KnowledgeSourceId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM knowledge_chunk WHERE source_id = ?")
            .bind(&source_id.0)
            .execute(&mut *tx)
            .await?;

        for chunk in &chunks {
            if chunk.source_id != *source_id {
                return Err(RepositoryError::Decode(format!(
                    "chunk {} belongs to source {}, not {}",
                    chunk.id.0, chunk.source_id.0, source_id.0
                )));
            }

            sqlx::query(
                "INSERT INTO knowledge_chunk (
                    id,
                    source_id,
                    tenant_id,
                    ordinal,
                    content,
                    word_count,
                    char_count,
                    quality_score,
                    active
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id.0)
            .bind(&chunk.source_id.0)
            .bind(chunk.tenant_id.as_str())
            .bind(i64::from(chunk.ordinal))
            .bind(&chunk.content)
            .bind(i64::from(chunk.word_count))
            .bind(i64::from(chunk.char_count))
            .bind(chunk.quality_score)
            .bind(chunk.active)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_embedding(&self, embedding: KnowledgeEmbedding) -> Result<(), RepositoryError> {
        let dimensions = i64::try_from(embedding.vector.len()).map_err(|_| {
            RepositoryError::Decode(format!("embedding for {} is too large", embedding.chunk_id.0))
        })?;

        sqlx::query(
            "INSERT INTO knowledge_embedding (
                chunk_id,
                tenant_id,
                model_name,
                model_version,
                dimensions,
                vector,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(chunk_id) DO UPDATE SET
                model_name = excluded.model_name,
                model_version = excluded.model_version,
                dimensions = excluded.dimensions,
                vector = excluded.vector,
                created_at = excluded.created_at",
        )
        .bind(&embedding.chunk_id.0)
        .bind(embedding.tenant_id.as_str())
        .bind(&embedding.model.name)
        .bind(&embedding.model.version)
        .bind(dimensions)
        .bind(vector_to_blob(&embedding.vector))
        .bind(format_timestamp(embedding.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn search_candidates(
        &self,
        tenant_id: &TenantId,
        model: &EmbeddingModel,
    ) -> Result<Vec<SearchCandidate>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT c.id, c.source_id, c.tenant_id, c.ordinal, c.content, c.word_count,
                    c.char_count, c.quality_score, c.active,
                    s.title AS source_title, s.file_ref, e.vector
             FROM knowledge_chunk c
             JOIN knowledge_source s ON s.id = c.source_id
             JOIN knowledge_embedding e ON e.chunk_id = c.id
             WHERE c.tenant_id = ?
               AND c.active = 1
               AND s.status = 'active'
               AND e.model_name = ?
               AND e.model_version = ?
             ORDER BY c.source_id ASC, c.ordinal ASC",
        )
        .bind(tenant_id.as_str())
        .bind(&model.name)
        .bind(&model.version)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.try_get("vector")?;
                Ok(SearchCandidate {
                    source_title: row.try_get("source_title")?,
                    file_ref: row.try_get("file_ref")?,
                    vector: blob_to_vector("vector", &blob)?,
                    chunk: chunk_from_row(&row)?,
                })
            })
            .collect()
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<KnowledgeChunk, RepositoryError> {
    Ok(KnowledgeChunk {
        id: ChunkId(row.try_get("id")?),
        source_id: KnowledgeSourceId(row.try_get("source_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        ordinal: parse_u32("ordinal", row.try_get("ordinal")?)?,
        content: row.try_get("content")?,
        word_count: parse_u32("word_count", row.try_get("word_count")?)?,
        char_count: parse_u32("char_count", row.try_get("char_count")?)?,
        quality_score: row.try_get("quality_score")?,
        active: row.try_get("active")?,
    })
}

fn source_from_row(row: SqliteRow) -> Result<KnowledgeSource, RepositoryError> {
    let kind = row.try_get::<String, _>("kind")?;
    let status = row.try_get::<String, _>("status")?;

    Ok(KnowledgeSource {
        id: KnowledgeSourceId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        kind: SourceKind::parse(&kind)
            .ok_or_else(|| RepositoryError::Decode(format!("unsupported source kind `{kind}`")))?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        file_ref: row.try_get("file_ref")?,
        raw_text: row.try_get("raw_text")?,
        extracted_text: row.try_get("extracted_text")?,
        status: SourceStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Decode(format!("unsupported source status `{status}`"))
        })?,
        chunk_count: parse_u32("chunk_count", row.try_get("chunk_count")?)?,
        embedding_count: parse_u32("embedding_count", row.try_get("embedding_count")?)?,
        failed_embedding_count: parse_u32(
            "failed_embedding_count",
            row.try_get("failed_embedding_count")?,
        )?,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        quality_score: row.try_get("quality_score")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
