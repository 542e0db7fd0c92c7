use serde_json::json;

use tollgate_agent::broker::RequestOptions;
use tollgate_core::config::AppConfig;
use tollgate_core::errors::ApplicationError;

use crate::commands::{tenant, with_services, CommandFailure, CommandResult};

/// Sends one raw prompt through the broker, billed to `tenant_id`.
pub fn run(config: &AppConfig, tenant_id: &str, prompt: &str, model: Option<String>) -> CommandResult {
    with_services("ask", config, |services| async move {
        let tenant_id = tenant(tenant_id)?;
        if prompt.trim().is_empty() {
            return Err(CommandFailure::invalid_input("prompt must not be empty"));
        }

        let options = RequestOptions { model, ..RequestOptions::default() };
        let reply = services
            .broker
            .process_request(&tenant_id, prompt, options)
            .await
            .map_err(ApplicationError::from)?;

        let message = match &reply.reconciliation {
            Some(reconciliation) => {
                format!("response returned uncharged; reconciliation {} opened", reconciliation.id)
            }
            None if reply.cache_hit => format!("served from cache for {}", reply.client_cost),
            None => format!("charged {}", reply.client_cost),
        };

        Ok(CommandResult::success_with(
            "ask",
            message,
            Some(json!({
                "response": reply.response,
                "provider": reply.provider,
                "model": reply.model,
                "cache_hit": reply.cache_hit,
                "provider_cost": reply.provider_cost.to_string(),
                "client_cost": reply.client_cost.to_string(),
                "input_tokens": reply.usage.input_tokens,
                "output_tokens": reply.usage.output_tokens,
                "processing_ms": reply.processing_ms,
                "transaction_id": reply.transaction_id.map(|id| id.0),
                "reconciliation_id": reply.reconciliation.map(|reconciliation| reconciliation.id),
            })),
        ))
    })
}
