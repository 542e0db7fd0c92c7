use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pricing::TokenPrices;

/// Provider families the adapter layer knows how to talk to. Anything else is
/// carried as `Unregistered` so it can fail fast instead of being guessed at.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    Unregistered(String),
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "anthropic" => Self::Anthropic,
            "ollama" => Self::Ollama,
            other => Self::Unregistered(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::Unregistered(name) => name.as_str(),
        }
    }
}

/// Registered provider as exposed by the provider configuration interface.
/// Credentials are resolved separately and never live on this struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub display_name: String,
    pub api_url: String,
    pub default_model: String,
    pub input_token_price: Option<Decimal>,
    pub output_token_price: Option<Decimal>,
    pub is_active: bool,
    pub is_default: bool,
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        ProviderKind::from_name(&self.name)
    }

    /// Configured prices, falling back per field to `defaults`.
    pub fn prices(&self, defaults: TokenPrices) -> TokenPrices {
        TokenPrices {
            input: self.input_token_price.unwrap_or(defaults.input),
            output: self.output_token_price.unwrap_or(defaults.output),
        }
    }
}

/// Picks the active default provider, else the first active one.
pub fn select_provider(providers: &[ProviderConfig]) -> Option<&ProviderConfig> {
    providers
        .iter()
        .find(|provider| provider.is_active && provider.is_default)
        .or_else(|| providers.iter().find(|provider| provider.is_active))
}
