use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use tollgate_agent::knowledge::{
    IngestionReport, KnowledgeIngestor, KnowledgeRetriever, NewSource, SearchOptions,
};
use tollgate_agent::TollgateRuntime;
use tollgate_core::config::AppConfig;
use tollgate_core::domain::knowledge::{KnowledgeSourceId, SourceKind};
use tollgate_core::errors::ApplicationError;

use crate::commands::{tenant, to_data, with_services, CommandFailure, CommandResult};

#[derive(Debug, Clone, Default)]
pub struct AddSource {
    pub tenant_id: String,
    pub title: String,
    pub text: Option<String>,
    pub text_file: Option<PathBuf>,
    pub url: Option<String>,
    pub file_ref: Option<String>,
    pub ingest: bool,
}

pub fn add(config: &AppConfig, request: AddSource) -> CommandResult {
    with_services("knowledge add", config, |services| async move {
        let ingestor = ingestor(&services)?;
        let tenant_id = tenant(&request.tenant_id)?;

        let raw_text = match (request.text, request.text_file) {
            (Some(_), Some(_)) => {
                return Err(CommandFailure::invalid_input("use either --text or --text-file"));
            }
            (Some(text), None) => Some(text),
            (None, Some(path)) => Some(tokio::fs::read_to_string(&path).await.map_err(|error| {
                CommandFailure::invalid_input(format!("cannot read {}: {error}", path.display()))
            })?),
            (None, None) => None,
        };
        let kind = match (&raw_text, &request.url) {
            (Some(_), _) => SourceKind::Document,
            (None, Some(_)) => SourceKind::Url,
            (None, None) => {
                return Err(CommandFailure::invalid_input(
                    "a source needs --text, --text-file or --url",
                ));
            }
        };

        let source = ingestor
            .create_source(NewSource {
                tenant_id,
                kind,
                title: request.title,
                url: request.url,
                file_ref: request.file_ref,
                raw_text,
            })
            .await
            .map_err(ApplicationError::from)?;

        if !request.ingest {
            return Ok(CommandResult::success_with(
                "knowledge add",
                format!("created source {}", source.id.0),
                Some(json!({ "source_id": source.id.0 })),
            ));
        }

        let report = ingestor.ingest(&source.id).await.map_err(ApplicationError::from)?;
        Ok(CommandResult::success_with(
            "knowledge add",
            summarize(&report),
            Some(report_data(&report)),
        ))
    })
}

pub fn ingest(config: &AppConfig, source_id: &str) -> CommandResult {
    with_services("knowledge ingest", config, |services| async move {
        let ingestor = ingestor(&services)?;
        let report = ingestor
            .ingest(&KnowledgeSourceId(source_id.trim().to_string()))
            .await
            .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "knowledge ingest",
            summarize(&report),
            Some(report_data(&report)),
        ))
    })
}

pub fn list(config: &AppConfig, tenant_id: &str) -> CommandResult {
    with_services("knowledge list", config, |services| async move {
        let tenant_id = tenant(tenant_id)?;
        let sources = services
            .knowledge
            .list_sources(&tenant_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        Ok(CommandResult::success_with(
            "knowledge list",
            format!("{} sources", sources.len()),
            Some(to_data(&sources)?),
        ))
    })
}

pub fn search(
    config: &AppConfig,
    tenant_id: &str,
    query: &str,
    max_results: Option<usize>,
    min_similarity: Option<f32>,
) -> CommandResult {
    with_services("knowledge search", config, |services| async move {
        let retriever = retriever(&services)?;
        let tenant_id = tenant(tenant_id)?;
        let defaults = retriever.default_options();
        let options = SearchOptions {
            max_results: max_results.unwrap_or(defaults.max_results),
            min_similarity: min_similarity.unwrap_or(defaults.min_similarity),
        };
        if !(0.0..=1.0).contains(&options.min_similarity) {
            return Err(CommandFailure::invalid_input("--min-similarity must be within [0, 1]"));
        }

        let results =
            retriever.search(&tenant_id, query, options).await.map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "knowledge search",
            format!("{} matching chunks", results.len()),
            Some(to_data(&results)?),
        ))
    })
}

fn ingestor(services: &TollgateRuntime) -> Result<Arc<KnowledgeIngestor>, CommandFailure> {
    services.ingestor.clone().ok_or_else(knowledge_disabled)
}

fn retriever(services: &TollgateRuntime) -> Result<Arc<KnowledgeRetriever>, CommandFailure> {
    services.retriever.clone().ok_or_else(knowledge_disabled)
}

fn knowledge_disabled() -> CommandFailure {
    CommandFailure::new(
        "configuration",
        "knowledge features need an embedding credential (TOLLGATE_PROVIDER_OPENAI_API_KEY)",
        2,
    )
}

fn summarize(report: &IngestionReport) -> String {
    format!(
        "source {} is {}: {} chunks, {} embedded, {} failed",
        report.source_id.0,
        report.status.as_str(),
        report.chunk_count,
        report.embedding_count,
        report.failed_embedding_count
    )
}

fn report_data(report: &IngestionReport) -> serde_json::Value {
    json!({
        "source_id": report.source_id.0,
        "status": report.status.as_str(),
        "chunk_count": report.chunk_count,
        "embedding_count": report.embedding_count,
        "failed_embedding_count": report.failed_embedding_count,
        "quality_score": report.quality_score,
    })
}
