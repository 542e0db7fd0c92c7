use std::collections::HashMap;

use secrecy::SecretString;

use tollgate_core::config::LlmConfig;

pub const PROVIDER_KEY_ENV_PREFIX: &str = "TOLLGATE_PROVIDER_";

/// Resolves provider credentials at call time. Implementations must never log
/// or persist what they return.
pub trait CredentialSource: Send + Sync {
    fn credential(&self, provider_name: &str) -> Option<SecretString>;
}

/// Configured keys first, then `TOLLGATE_PROVIDER_<NAME>_API_KEY`.
#[derive(Default)]
pub struct CredentialStore {
    configured: HashMap<String, SecretString>,
    read_env: bool,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self { configured: HashMap::new(), read_env: true }
    }

    /// Store holding only explicitly supplied keys.
    pub fn isolated() -> Self {
        Self { configured: HashMap::new(), read_env: false }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let mut store = Self::new();
        if let Some(key) = &config.api_key {
            store.configured.insert(config.provider.as_str().to_string(), key.clone());
        }
        store
    }

    pub fn with_key(mut self, provider_name: &str, key: SecretString) -> Self {
        self.configured.insert(provider_name.trim().to_ascii_lowercase(), key);
        self
    }
}

impl CredentialSource for CredentialStore {
    fn credential(&self, provider_name: &str) -> Option<SecretString> {
        let name = provider_name.trim().to_ascii_lowercase();
        if let Some(key) = self.configured.get(&name) {
            return Some(key.clone());
        }
        if !self.read_env {
            return None;
        }

        std::env::var(env_key(&name))
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(SecretString::from)
    }
}

pub fn env_key(provider_name: &str) -> String {
    let suffix: String = provider_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{PROVIDER_KEY_ENV_PREFIX}{suffix}_API_KEY")
}
