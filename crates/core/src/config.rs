use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub broker: BrokerConfig,
    pub analyzer: AnalyzerConfig,
    pub retrieval: RetrievalConfig,
    pub automation: AutomationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Seeds the default provider row and the adapter's transport settings.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub input_token_price: Option<Decimal>,
    pub output_token_price: Option<Decimal>,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub margin: Decimal,
    pub cache_hit_fraction: Decimal,
    pub cache_ttl_days: u32,
    pub estimate_token_price: Decimal,
    pub default_input_token_price: Decimal,
    pub default_output_token_price: Decimal,
    pub provider_timeout_secs: u64,
    pub debit_max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    pub cache_ttl_days: u32,
    pub timeout_secs: u64,
    pub max_keywords: usize,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub min_similarity: f32,
    pub max_results: usize,
    pub chunk_size_chars: usize,
    pub attachment_similarity: f32,
    pub max_attachments: usize,
    pub confidence_cap: f32,
    pub embedding_model: String,
    pub embedding_version: String,
    pub timeout_secs: u64,
    pub signed_url_ttl_secs: u64,
    /// Prefix for signed attachment links.
    pub files_base_url: String,
    pub signing_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct AutomationConfig {
    pub auto_reply_lookback_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub broker_margin: Option<Decimal>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tollgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
                input_token_price: None,
                output_token_price: None,
            },
            broker: BrokerConfig {
                margin: Decimal::new(30, 2),
                cache_hit_fraction: Decimal::new(10, 2),
                cache_ttl_days: 30,
                estimate_token_price: Decimal::new(2, 6),
                default_input_token_price: Decimal::new(1, 6),
                default_output_token_price: Decimal::new(2, 6),
                provider_timeout_secs: 60,
                debit_max_attempts: 5,
            },
            analyzer: AnalyzerConfig { cache_ttl_days: 7, timeout_secs: 15, max_keywords: 10 },
            retrieval: RetrievalConfig {
                min_similarity: 0.75,
                max_results: 5,
                chunk_size_chars: 1000,
                attachment_similarity: 0.80,
                max_attachments: 3,
                confidence_cap: 0.95,
                embedding_model: "text-embedding-3-small".to_string(),
                embedding_version: "1".to_string(),
                timeout_secs: 20,
                signed_url_ttl_secs: 3600,
                files_base_url: "http://localhost:8080/files".to_string(),
                signing_key: None,
            },
            automation: AutomationConfig { auto_reply_lookback_secs: 300 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tollgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(llm) = patch.llm {
            set(&mut self.llm.provider, llm.provider);
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            set(&mut self.llm.model, llm.model);
            set(&mut self.llm.timeout_secs, llm.timeout_secs);
            set(&mut self.llm.max_retries, llm.max_retries);
            if let Some(price) = llm.input_token_price {
                self.llm.input_token_price = Some(price);
            }
            if let Some(price) = llm.output_token_price {
                self.llm.output_token_price = Some(price);
            }
        }

        if let Some(broker) = patch.broker {
            set(&mut self.broker.margin, broker.margin);
            set(&mut self.broker.cache_hit_fraction, broker.cache_hit_fraction);
            set(&mut self.broker.cache_ttl_days, broker.cache_ttl_days);
            set(&mut self.broker.estimate_token_price, broker.estimate_token_price);
            set(&mut self.broker.default_input_token_price, broker.default_input_token_price);
            set(&mut self.broker.default_output_token_price, broker.default_output_token_price);
            set(&mut self.broker.provider_timeout_secs, broker.provider_timeout_secs);
            set(&mut self.broker.debit_max_attempts, broker.debit_max_attempts);
        }

        if let Some(analyzer) = patch.analyzer {
            set(&mut self.analyzer.cache_ttl_days, analyzer.cache_ttl_days);
            set(&mut self.analyzer.timeout_secs, analyzer.timeout_secs);
            set(&mut self.analyzer.max_keywords, analyzer.max_keywords);
        }

        if let Some(retrieval) = patch.retrieval {
            set(&mut self.retrieval.min_similarity, retrieval.min_similarity);
            set(&mut self.retrieval.max_results, retrieval.max_results);
            set(&mut self.retrieval.chunk_size_chars, retrieval.chunk_size_chars);
            set(&mut self.retrieval.attachment_similarity, retrieval.attachment_similarity);
            set(&mut self.retrieval.max_attachments, retrieval.max_attachments);
            set(&mut self.retrieval.confidence_cap, retrieval.confidence_cap);
            set(&mut self.retrieval.embedding_model, retrieval.embedding_model);
            set(&mut self.retrieval.embedding_version, retrieval.embedding_version);
            set(&mut self.retrieval.timeout_secs, retrieval.timeout_secs);
            set(&mut self.retrieval.signed_url_ttl_secs, retrieval.signed_url_ttl_secs);
            set(&mut self.retrieval.files_base_url, retrieval.files_base_url);
            if let Some(key) = retrieval.signing_key {
                self.retrieval.signing_key = Some(secret_value(key));
            }
        }

        if let Some(automation) = patch.automation {
            set(&mut self.automation.auto_reply_lookback_secs, automation.auto_reply_lookback_secs);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TOLLGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TOLLGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("TOLLGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("TOLLGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("TOLLGATE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TOLLGATE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("TOLLGATE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TOLLGATE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("TOLLGATE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_env("TOLLGATE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_BROKER_MARGIN") {
            self.broker.margin = parse_env("TOLLGATE_BROKER_MARGIN", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_BROKER_CACHE_TTL_DAYS") {
            self.broker.cache_ttl_days = parse_env("TOLLGATE_BROKER_CACHE_TTL_DAYS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_BROKER_PROVIDER_TIMEOUT_SECS") {
            self.broker.provider_timeout_secs =
                parse_env("TOLLGATE_BROKER_PROVIDER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_ANALYZER_TIMEOUT_SECS") {
            self.analyzer.timeout_secs = parse_env("TOLLGATE_ANALYZER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_RETRIEVAL_MIN_SIMILARITY") {
            self.retrieval.min_similarity =
                parse_env("TOLLGATE_RETRIEVAL_MIN_SIMILARITY", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_RETRIEVAL_MAX_RESULTS") {
            self.retrieval.max_results = parse_env("TOLLGATE_RETRIEVAL_MAX_RESULTS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_RETRIEVAL_EMBEDDING_MODEL") {
            self.retrieval.embedding_model = value;
        }
        if let Some(value) = read_env("TOLLGATE_RETRIEVAL_FILES_BASE_URL") {
            self.retrieval.files_base_url = value;
        }
        if let Some(value) = read_env("TOLLGATE_RETRIEVAL_SIGNING_KEY") {
            self.retrieval.signing_key = Some(secret_value(value));
        }

        let log_level =
            read_env("TOLLGATE_LOGGING_LEVEL").or_else(|| read_env("TOLLGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TOLLGATE_LOGGING_FORMAT").or_else(|| read_env("TOLLGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(margin) = overrides.broker_margin {
            self.broker.margin = margin;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_broker(&self.broker)?;
        validate_analyzer(&self.analyzer, &self.broker)?;
        validate_retrieval(&self.retrieval)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tollgate.toml"), PathBuf::from("config/tollgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    for (key, price) in
        [("llm.input_token_price", llm.input_token_price), ("llm.output_token_price", llm.output_token_price)]
    {
        if price.is_some_and(|price| price.is_sign_negative()) {
            return Err(ConfigError::Validation(format!("{key} must not be negative")));
        }
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers \
                     (set TOLLGATE_LLM_API_KEY or llm.api_key = \"${OPENAI_API_KEY}\")"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_broker(broker: &BrokerConfig) -> Result<(), ConfigError> {
    if broker.margin.is_sign_negative() {
        return Err(ConfigError::Validation("broker.margin must not be negative".to_string()));
    }

    if broker.cache_hit_fraction.is_sign_negative() || broker.cache_hit_fraction > Decimal::ONE {
        return Err(ConfigError::Validation(
            "broker.cache_hit_fraction must be in range 0..=1".to_string(),
        ));
    }

    if broker.cache_ttl_days == 0 {
        return Err(ConfigError::Validation(
            "broker.cache_ttl_days must be greater than zero".to_string(),
        ));
    }

    let prices = [
        ("broker.estimate_token_price", broker.estimate_token_price),
        ("broker.default_input_token_price", broker.default_input_token_price),
        ("broker.default_output_token_price", broker.default_output_token_price),
    ];
    for (key, price) in prices {
        if price.is_sign_negative() {
            return Err(ConfigError::Validation(format!("{key} must not be negative")));
        }
    }

    if broker.provider_timeout_secs == 0 || broker.provider_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "broker.provider_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if broker.debit_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "broker.debit_max_attempts must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_analyzer(analyzer: &AnalyzerConfig, broker: &BrokerConfig) -> Result<(), ConfigError> {
    if analyzer.cache_ttl_days == 0 {
        return Err(ConfigError::Validation(
            "analyzer.cache_ttl_days must be greater than zero".to_string(),
        ));
    }

    if analyzer.timeout_secs == 0 || analyzer.timeout_secs > broker.provider_timeout_secs {
        return Err(ConfigError::Validation(format!(
            "analyzer.timeout_secs must be in range 1..={} (the broker provider timeout)",
            broker.provider_timeout_secs
        )));
    }

    if analyzer.max_keywords == 0 {
        return Err(ConfigError::Validation(
            "analyzer.max_keywords must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    let fractions = [
        ("retrieval.min_similarity", retrieval.min_similarity),
        ("retrieval.attachment_similarity", retrieval.attachment_similarity),
        ("retrieval.confidence_cap", retrieval.confidence_cap),
    ];
    for (key, value) in fractions {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!("{key} must be in range 0..=1")));
        }
    }

    if retrieval.max_results == 0 {
        return Err(ConfigError::Validation(
            "retrieval.max_results must be greater than zero".to_string(),
        ));
    }

    if retrieval.chunk_size_chars < 100 {
        return Err(ConfigError::Validation(
            "retrieval.chunk_size_chars must be at least 100".to_string(),
        ));
    }

    if retrieval.embedding_model.trim().is_empty() || retrieval.embedding_version.trim().is_empty()
    {
        return Err(ConfigError::Validation(
            "retrieval.embedding_model and retrieval.embedding_version are required".to_string(),
        ));
    }

    if retrieval.timeout_secs == 0 || retrieval.signed_url_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "retrieval.timeout_secs and retrieval.signed_url_ttl_secs must be greater than zero"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    broker: Option<BrokerPatch>,
    analyzer: Option<AnalyzerPatch>,
    retrieval: Option<RetrievalPatch>,
    automation: Option<AutomationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    input_token_price: Option<Decimal>,
    output_token_price: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct BrokerPatch {
    margin: Option<Decimal>,
    cache_hit_fraction: Option<Decimal>,
    cache_ttl_days: Option<u32>,
    estimate_token_price: Option<Decimal>,
    default_input_token_price: Option<Decimal>,
    default_output_token_price: Option<Decimal>,
    provider_timeout_secs: Option<u64>,
    debit_max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzerPatch {
    cache_ttl_days: Option<u32>,
    timeout_secs: Option<u64>,
    max_keywords: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    min_similarity: Option<f32>,
    max_results: Option<usize>,
    chunk_size_chars: Option<usize>,
    attachment_similarity: Option<f32>,
    max_attachments: Option<usize>,
    confidence_cap: Option<f32>,
    embedding_model: Option<String>,
    embedding_version: Option<String>,
    timeout_secs: Option<u64>,
    signed_url_ttl_secs: Option<u64>,
    files_base_url: Option<String>,
    signing_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AutomationPatch {
    auto_reply_lookback_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
