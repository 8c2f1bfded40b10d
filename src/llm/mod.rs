//! LLM integration for mail-triage.
//!
//! Supports:
//! - **Ollama**: local model server (`/api/generate`)
//! - **Groq**, **Cerebras**, **OpenRouter**: OpenAI-compatible chat APIs
//! - **Gemini**: Google `generateContent`
//!
//! Providers are built from [`LlmConfig`] at startup and handed to a
//! [`ProviderSelector`], which owns the selection mode and rotation cursor.

pub mod gemini;
pub mod ollama;
pub mod openai_compat;
pub mod provider;
pub mod selector;

pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::*;
pub use selector::{ProviderSelector, SelectedCompletion, SelectionMode};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use secrecy::SecretString;

use crate::config::Env;
use crate::error::ConfigError;

/// Supported inference backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderBackend {
    Ollama,
    Groq,
    Cerebras,
    Gemini,
    OpenRouter,
}

impl ProviderBackend {
    /// Hosted APIs in default priority order.
    pub const HOSTED: [ProviderBackend; 4] = [
        ProviderBackend::Groq,
        ProviderBackend::Cerebras,
        ProviderBackend::Gemini,
        ProviderBackend::OpenRouter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderBackend::Ollama => "ollama",
            ProviderBackend::Groq => "groq",
            ProviderBackend::Cerebras => "cerebras",
            ProviderBackend::Gemini => "gemini",
            ProviderBackend::OpenRouter => "openrouter",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            ProviderBackend::Ollama => "OLLAMA",
            ProviderBackend::Groq => "GROQ",
            ProviderBackend::Cerebras => "CEREBRAS",
            ProviderBackend::Gemini => "GEMINI",
            ProviderBackend::OpenRouter => "OPENROUTER",
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderBackend::Ollama => "http://localhost:11434",
            ProviderBackend::Groq => "https://api.groq.com/openai/v1",
            ProviderBackend::Cerebras => "https://api.cerebras.ai/v1",
            ProviderBackend::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderBackend::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            ProviderBackend::Ollama => "llama3.2",
            ProviderBackend::Groq => "mixtral-8x7b-32768",
            ProviderBackend::Cerebras => "llama3.1-8b",
            ProviderBackend::Gemini => "gemini-1.5-flash",
            ProviderBackend::OpenRouter => "meta-llama/llama-3.2-3b-instruct:free",
        }
    }
}

/// Which providers to build from the configured backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSet {
    /// Only the local Ollama server.
    #[default]
    Ollama,
    /// Every hosted API with a key. At least one is required.
    Api,
    /// Hosted APIs with keys, falling back to Ollama when none have one.
    Auto,
}

impl fmt::Display for ProviderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderSet::Ollama => "ollama",
            ProviderSet::Api => "api",
            ProviderSet::Auto => "auto",
        })
    }
}

impl FromStr for ProviderSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(ProviderSet::Ollama),
            "api" => Ok(ProviderSet::Api),
            "auto" => Ok(ProviderSet::Auto),
            other => Err(format!("unknown provider set '{other}', expected ollama, api or auto")),
        }
    }
}

/// Static configuration for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub backend: ProviderBackend,
    pub endpoint: String,
    /// Absent for Ollama and for hosted APIs without a key.
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Requests per minute. Used to space calls to this provider.
    pub rate_per_minute: Option<u32>,
}

impl ProviderConfig {
    pub fn with_defaults(backend: ProviderBackend) -> Self {
        Self {
            backend,
            endpoint: backend.default_endpoint().to_string(),
            api_key: None,
            model: backend.default_model().to_string(),
            rate_per_minute: None,
        }
    }

    fn from_env(backend: ProviderBackend, env: &Env<'_>) -> Result<Self, ConfigError> {
        let prefix = backend.env_prefix();
        let endpoint_key = match backend {
            ProviderBackend::Ollama => "OLLAMA_HOST".to_string(),
            _ => format!("{prefix}_BASE_URL"),
        };
        Ok(Self {
            backend,
            endpoint: env
                .get(&endpoint_key)
                .unwrap_or_else(|| backend.default_endpoint().to_string()),
            api_key: env.get(&format!("{prefix}_API_KEY")).map(SecretString::from),
            model: env
                .get(&format!("{prefix}_MODEL"))
                .unwrap_or_else(|| backend.default_model().to_string()),
            rate_per_minute: env.parse_opt(&format!("{prefix}_RATE_PER_MIN"))?,
        })
    }
}

/// Inference configuration: which providers to use and how to pick between them.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider_set: ProviderSet,
    pub selection_mode: SelectionMode,
    pub ollama: ProviderConfig,
    /// Hosted APIs in priority order.
    pub hosted: Vec<ProviderConfig>,
}

impl LlmConfig {
    pub fn from_env(env: &Env<'_>) -> Result<Self, ConfigError> {
        let hosted = ProviderBackend::HOSTED
            .iter()
            .map(|b| ProviderConfig::from_env(*b, env))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            provider_set: env.parse_or("AI_PROVIDER", ProviderSet::Ollama)?,
            selection_mode: env.parse_or("AI_SELECTION_MODE", SelectionMode::default())?,
            ollama: ProviderConfig::from_env(ProviderBackend::Ollama, env)?,
            hosted,
        })
    }
}

/// Create a provider from its configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let rate = config.rate_per_minute;
    let key = || {
        config.api_key.clone().ok_or_else(|| ConfigError::MissingRequired {
            key: format!("{}_API_KEY", config.backend.env_prefix()),
            hint: format!("{} needs an API key", config.backend.name()),
        })
    };

    let provider: Arc<dyn LlmProvider> = match config.backend {
        ProviderBackend::Ollama => Arc::new(OllamaProvider::new(&config.endpoint, &config.model, rate)),
        ProviderBackend::Groq | ProviderBackend::Cerebras => Arc::new(OpenAiCompatProvider::new(
            config.backend.name(),
            &config.endpoint,
            key()?,
            &config.model,
            rate,
        )),
        ProviderBackend::OpenRouter => Arc::new(
            OpenAiCompatProvider::new(
                config.backend.name(),
                &config.endpoint,
                key()?,
                &config.model,
                rate,
            )
            .with_header("HTTP-Referer", "https://github.com/email-classifier")
            .with_header("X-Title", "Email Classifier"),
        ),
        ProviderBackend::Gemini => Arc::new(GeminiProvider::new(
            &config.endpoint,
            key()?,
            &config.model,
            rate,
        )),
    };

    tracing::info!(
        provider = provider.name(),
        model = provider.model_name(),
        "Configured inference provider"
    );
    Ok(provider)
}

/// Build the ordered provider list for the configured provider set.
pub fn build_providers(config: &LlmConfig) -> Result<Vec<Arc<dyn LlmProvider>>, ConfigError> {
    let with_keys: Vec<&ProviderConfig> =
        config.hosted.iter().filter(|p| p.api_key.is_some()).collect();

    let chosen: Vec<&ProviderConfig> = match config.provider_set {
        ProviderSet::Ollama => vec![&config.ollama],
        ProviderSet::Api if with_keys.is_empty() => {
            return Err(ConfigError::MissingRequired {
                key: "GROQ_API_KEY / CEREBRAS_API_KEY / GEMINI_API_KEY / OPENROUTER_API_KEY"
                    .to_string(),
                hint: "AI_PROVIDER=api needs at least one hosted API key".to_string(),
            });
        }
        ProviderSet::Api => with_keys,
        ProviderSet::Auto if with_keys.is_empty() => {
            tracing::info!("No hosted API keys configured, using local Ollama");
            vec![&config.ollama]
        }
        ProviderSet::Auto => with_keys,
    };

    chosen.into_iter().map(create_provider).collect()
}

/// Convenience: build providers and wrap them in a selector.
pub fn build_selector(config: &LlmConfig) -> Result<ProviderSelector, ConfigError> {
    Ok(ProviderSelector::new(
        build_providers(config)?,
        config.selection_mode,
    ))
}
