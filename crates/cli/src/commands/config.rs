use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tollgate_core::config::AppConfig;
use toml::Value;

struct Field {
    key: &'static str,
    env_key: Option<&'static str>,
    value: String,
}

impl Field {
    fn new(key: &'static str, env_key: Option<&'static str>, value: impl Into<String>) -> Self {
        Self { key, env_key, value: value.into() }
    }
}

/// Effective configuration with per-field source attribution. Secrets are
/// shown only as set/unset.
pub fn run(config: &AppConfig, config_path: Option<&Path>) -> String {
    let config_file_path = config_path.map(Path::to_path_buf).or_else(detect_config_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(config) {
        let source = field_source(
            field.key,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    vec![
        Field::new("database.url", Some("TOLLGATE_DATABASE_URL"), config.database.url.clone()),
        Field::new(
            "database.max_connections",
            Some("TOLLGATE_DATABASE_MAX_CONNECTIONS"),
            config.database.max_connections.to_string(),
        ),
        Field::new(
            "database.timeout_secs",
            Some("TOLLGATE_DATABASE_TIMEOUT_SECS"),
            config.database.timeout_secs.to_string(),
        ),
        Field::new("llm.provider", Some("TOLLGATE_LLM_PROVIDER"), config.llm.provider.as_str()),
        Field::new("llm.model", Some("TOLLGATE_LLM_MODEL"), config.llm.model.clone()),
        Field::new(
            "llm.base_url",
            Some("TOLLGATE_LLM_BASE_URL"),
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new("llm.api_key", Some("TOLLGATE_LLM_API_KEY"), redact(config.llm.api_key.is_some())),
        Field::new("llm.max_retries", Some("TOLLGATE_LLM_MAX_RETRIES"), config.llm.max_retries.to_string()),
        Field::new("broker.margin", Some("TOLLGATE_BROKER_MARGIN"), config.broker.margin.to_string()),
        Field::new("broker.cache_hit_fraction", None, config.broker.cache_hit_fraction.to_string()),
        Field::new(
            "broker.cache_ttl_days",
            Some("TOLLGATE_BROKER_CACHE_TTL_DAYS"),
            config.broker.cache_ttl_days.to_string(),
        ),
        Field::new(
            "broker.provider_timeout_secs",
            Some("TOLLGATE_BROKER_PROVIDER_TIMEOUT_SECS"),
            config.broker.provider_timeout_secs.to_string(),
        ),
        Field::new(
            "analyzer.timeout_secs",
            Some("TOLLGATE_ANALYZER_TIMEOUT_SECS"),
            config.analyzer.timeout_secs.to_string(),
        ),
        Field::new(
            "retrieval.min_similarity",
            Some("TOLLGATE_RETRIEVAL_MIN_SIMILARITY"),
            config.retrieval.min_similarity.to_string(),
        ),
        Field::new(
            "retrieval.max_results",
            Some("TOLLGATE_RETRIEVAL_MAX_RESULTS"),
            config.retrieval.max_results.to_string(),
        ),
        Field::new(
            "retrieval.embedding_model",
            Some("TOLLGATE_RETRIEVAL_EMBEDDING_MODEL"),
            config.retrieval.embedding_model.clone(),
        ),
        Field::new(
            "retrieval.files_base_url",
            Some("TOLLGATE_RETRIEVAL_FILES_BASE_URL"),
            config.retrieval.files_base_url.clone(),
        ),
        Field::new(
            "retrieval.signing_key",
            Some("TOLLGATE_RETRIEVAL_SIGNING_KEY"),
            redact(config.retrieval.signing_key.is_some()),
        ),
        Field::new(
            "automation.auto_reply_lookback_secs",
            None,
            config.automation.auto_reply_lookback_secs.to_string(),
        ),
        Field::new("logging.level", Some("TOLLGATE_LOGGING_LEVEL"), config.logging.level.clone()),
        Field::new(
            "logging.format",
            Some("TOLLGATE_LOGGING_FORMAT"),
            format!("{:?}", config.logging.format).to_lowercase(),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["tollgate.toml", "config/tollgate.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact(is_set: bool) -> &'static str {
    if is_set {
        "<redacted>"
    } else {
        "<unset>"
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, render_line};

    #[test]
    fn nested_keys_are_found_in_toml_documents() {
        let doc = "[broker]\nmargin = \"0.25\"\n".parse::<toml::Value>().expect("toml");
        assert!(contains_path(&doc, "broker.margin"));
        assert!(!contains_path(&doc, "broker.cache_ttl_days"));
        assert!(!contains_path(&doc, "llm.model"));
    }

    #[test]
    fn lines_name_their_source() {
        assert_eq!(
            render_line("llm.model", "gpt-4o-mini", "default".to_string()),
            "- llm.model = gpt-4o-mini (source: default)"
        );
    }
}
