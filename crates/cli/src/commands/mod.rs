pub mod ask;
pub mod broker;
pub mod config;
pub mod knowledge;
pub mod migrate;
pub mod wallet;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

use tollgate_agent::{TollgateRuntime, TracingAuditSink};
use tollgate_core::config::AppConfig;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::errors::ApplicationError;
use tollgate_db::{connect_with_config, migrations};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

/// Error class, message and exit code of a failed command.
#[derive(Debug)]
pub struct CommandFailure {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl CommandFailure {
    pub fn new(error_class: &'static str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { error_class, message: message.into(), exit_code }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("invalid_input", message, 2)
    }
}

impl From<ApplicationError> for CommandFailure {
    fn from(error: ApplicationError) -> Self {
        let error_class = match &error {
            ApplicationError::Domain(_) => "domain",
            ApplicationError::Persistence(_) => "persistence",
            ApplicationError::Integration(_) => "integration",
            ApplicationError::Configuration(_) => "configuration",
        };
        Self::new(error_class, error.to_string(), 6)
    }
}

/// Connects, migrates, wires the services and runs `action` on a
/// single-threaded runtime.
pub fn with_services<F, Fut>(command: &str, config: &AppConfig, action: F) -> CommandResult
where
    F: FnOnce(TollgateRuntime) -> Fut,
    Fut: Future<Output = Result<CommandResult, CommandFailure>>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let services = open_services(config)
            .await
            .map_err(|error| CommandFailure::new("bootstrap", format!("{error:#}"), 4))?;
        action(services).await
    });

    match result {
        Ok(result) => result,
        Err(failure) => {
            CommandResult::failure(command, failure.error_class, failure.message, failure.exit_code)
        }
    }
}

async fn open_services(config: &AppConfig) -> anyhow::Result<TollgateRuntime> {
    let pool = connect_with_config(&config.database)
        .await
        .with_context(|| format!("connecting to {}", config.database.url))?;
    migrations::run_pending(&pool).await.context("applying migrations")?;

    let services = TollgateRuntime::from_pool(config, pool, Arc::new(TracingAuditSink))
        .context("wiring services")?;
    services
        .ensure_default_provider(&config.llm)
        .await
        .context("registering default provider")?;
    Ok(services)
}

pub fn tenant(raw: &str) -> Result<TenantId, CommandFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CommandFailure::invalid_input("tenant id must not be empty"));
    }
    Ok(TenantId::new(trimmed))
}

pub fn to_data<T: Serialize>(value: &T) -> Result<Value, CommandFailure> {
    serde_json::to_value(value)
        .map_err(|error| CommandFailure::new("serialization", error.to_string(), 7))
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{tenant, CommandResult};

    #[test]
    fn success_payload_carries_optional_data() {
        let plain = CommandResult::success("migrate", "applied pending migrations");
        assert!(!plain.output.contains("\"data\""));

        let with_data =
            CommandResult::success_with("wallet balance", "ok", Some(json!({"balance": "0.35"})));
        let parsed: serde_json::Value = serde_json::from_str(&with_data.output).expect("json");
        assert_eq!(parsed["data"]["balance"], "0.35");
        assert_eq!(with_data.exit_code, 0);
    }

    #[test]
    fn blank_tenant_is_rejected() {
        let failure = tenant("   ").expect_err("blank");
        assert_eq!(failure.error_class, "invalid_input");
        assert_eq!(tenant(" t-1 ").expect("tenant").as_str(), "t-1");
    }
}
