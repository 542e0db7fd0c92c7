use serde_json::json;

use tollgate_core::config::AppConfig;
use tollgate_core::errors::ApplicationError;

use crate::commands::{tenant, to_data, with_services, CommandResult};

pub fn cache_stats(config: &AppConfig, tenant_id: Option<&str>) -> CommandResult {
    with_services("cache stats", config, |services| async move {
        let tenant_id = tenant_id.map(tenant).transpose()?;
        let stats = services
            .broker
            .get_cache_stats(tenant_id.as_ref())
            .await
            .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "cache stats",
            format!("{} live entries, {} hits", stats.live_entries, stats.total_hits),
            Some(to_data(&stats)?),
        ))
    })
}

/// Without a tenant and without `expired_only` every cached response is dropped.
pub fn cache_purge(config: &AppConfig, tenant_id: Option<&str>, expired_only: bool) -> CommandResult {
    with_services("cache purge", config, |services| async move {
        let deleted = if expired_only {
            services.broker.purge_expired().await
        } else {
            let tenant_id = tenant_id.map(tenant).transpose()?;
            services.broker.purge_cache(tenant_id.as_ref()).await
        }
        .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "cache purge",
            format!("deleted {deleted} cache entries"),
            Some(json!({ "deleted": deleted })),
        ))
    })
}

pub fn stats(config: &AppConfig, tenant_id: Option<&str>) -> CommandResult {
    with_services("broker stats", config, |services| async move {
        let tenant_id = tenant_id.map(tenant).transpose()?;
        let stats = services
            .broker
            .get_broker_stats(tenant_id.as_ref())
            .await
            .map_err(ApplicationError::from)?;

        Ok(CommandResult::success_with(
            "broker stats",
            format!(
                "{} requests ({} cache hits), client cost {}",
                stats.total_requests, stats.cache_hits, stats.total_client_cost
            ),
            Some(to_data(&stats)?),
        ))
    })
}
