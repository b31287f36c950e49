//! Engine configuration.
//!
//! One YAML document configures everything. Provider entries follow the
//! `model_providers.yaml` layout: a `default_provider` name plus a
//! `providers` map, where each provider may name environment variables that
//! override its URL, model and API key.
//!
//! ```yaml
//! default_provider: aliyun
//! providers:
//!   aliyun:
//!     base_url: https://dashscope.aliyuncs.com/compatible-mode/v1
//!     model_name: qwen-plus
//!     temperature: 0.1
//!     env_mapping:
//!       api_key: DASHSCOPE_API_KEY
//! pipeline:
//!   parallelism: 4
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::context::WindowConfig;
use crate::correction::CorrectionConfig;
use crate::errors::ConfigError;
use crate::observability::LoggingConfig;
use crate::pipeline::{BatchConfig, PromptSet, RetryConfig};
use crate::validation::RuleSetConfig;

/// Names of environment variables overriding provider values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvMapping {
    /// Variable holding the base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Variable holding the model name.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Variable holding the API key.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// One completion service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible API.
    #[serde(default)]
    pub base_url: String,
    /// Model identifier.
    #[serde(default)]
    pub model_name: String,
    /// API key; usually supplied through `env_mapping.api_key` instead.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Sampling temperature, 0 to 2.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token limit.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// HTTP timeout.
    #[serde(default = "default_timeout_seconds", alias = "timeout")]
    pub timeout_seconds: u64,
    /// Environment overrides.
    #[serde(default)]
    pub env_mapping: EnvMapping,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_timeout_seconds() -> u64 {
    60
}

impl ProviderConfig {
    /// Creates a provider with default sampling settings.
    #[must_use]
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model_name: model_name.into(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_timeout_seconds(),
            env_mapping: EnvMapping::default(),
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the environment overrides.
    #[must_use]
    pub fn with_env_mapping(mut self, mapping: EnvMapping) -> Self {
        self.env_mapping = mapping;
        self
    }

    /// Applies environment overrides from the process environment.
    #[must_use]
    pub fn resolved(&self) -> Self {
        self.resolved_with(|name| std::env::var(name).ok())
    }

    /// Applies overrides using `lookup` to read variables. Unset or empty
    /// variables leave the configured value in place.
    #[must_use]
    pub fn resolved_with<F>(&self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &Option<String>| {
            name.as_deref()
                .filter(|n| !n.is_empty())
                .and_then(&lookup)
                .filter(|v| !v.trim().is_empty())
        };
        let mut resolved = self.clone();
        if let Some(url) = read(&self.env_mapping.base_url) {
            resolved.base_url = url;
        }
        if let Some(model) = read(&self.env_mapping.model_name) {
            resolved.model_name = model;
        }
        if let Some(key) = read(&self.env_mapping.api_key) {
            resolved.api_key = Some(key);
        }
        resolved
    }

    /// Checks required values and ranges.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let field = |f: &str| format!("providers.{name}.{f}");
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::invalid(field("base_url"), "must not be empty"));
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::invalid(field("model_name"), "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::invalid(field("temperature"), "must be between 0 and 2"));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid(field("max_tokens"), "must be positive"));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::invalid(field("timeout_seconds"), "must be positive"));
        }
        Ok(())
    }

    /// The chat completions URL.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim().trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }
}

/// Pipeline execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batches generated concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Timeout of one call attempt.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    /// Run the model-based reviewer after the rules.
    #[serde(default)]
    pub semantic_validation: bool,
    /// Stream completions into the token sink.
    #[serde(default)]
    pub streaming: bool,
    /// Delay between batch starts.
    #[serde(default)]
    pub request_interval_ms: u64,
}

fn default_parallelism() -> usize {
    1
}

fn default_call_timeout_seconds() -> u64 {
    120
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            call_timeout_seconds: default_call_timeout_seconds(),
            semantic_validation: false,
            streaming: false,
            request_interval_ms: 0,
        }
    }
}

impl PipelineConfig {
    /// Sets the parallelism.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Enables or disables the semantic reviewer.
    #[must_use]
    pub fn with_semantic_validation(mut self, enabled: bool) -> Self {
        self.semantic_validation = enabled;
        self
    }

    /// Enables or disables streaming.
    #[must_use]
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Sets the call timeout.
    #[must_use]
    pub fn with_call_timeout_seconds(mut self, seconds: u64) -> Self {
        self.call_timeout_seconds = seconds;
        self
    }
}

/// Everything the engine needs besides a transport.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider used when none is named.
    #[serde(default)]
    pub default_provider: String,
    /// Providers by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Call retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Batch planning.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Correction loop limits.
    #[serde(default)]
    pub correction: CorrectionConfig,
    /// Conversation window capacity.
    #[serde(default)]
    pub window: WindowConfig,
    /// Deterministic rule set.
    #[serde(default)]
    pub rules: RuleSetConfig,
    /// Execution settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Prompt templates.
    #[serde(default)]
    pub prompts: PromptSet,
}

impl EngineConfig {
    /// Creates the default configuration, with no providers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads and parses a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Adds a provider and makes it the default if none is set.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: ProviderConfig) -> Self {
        let name = name.into().to_lowercase();
        if self.default_provider.is_empty() {
            self.default_provider.clone_from(&name);
        }
        self.providers.insert(name, provider);
        self
    }

    /// Replaces the pipeline settings.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the batch settings.
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Replaces the correction limits.
    #[must_use]
    pub fn with_correction(mut self, correction: CorrectionConfig) -> Self {
        self.correction = correction;
        self
    }

    /// The default provider. Without a `default_provider`, a single
    /// configured provider is the default.
    pub fn provider(&self) -> Result<(&str, &ProviderConfig), ConfigError> {
        if self.default_provider.is_empty() && self.providers.len() == 1 {
            if let Some((name, provider)) = self.providers.iter().next() {
                return Ok((name.as_str(), provider));
            }
        }
        self.provider_named(&self.default_provider)
    }

    /// A provider by name, case-insensitively.
    pub fn provider_named(&self, name: &str) -> Result<(&str, &ProviderConfig), ConfigError> {
        let key = name.to_lowercase();
        self.providers
            .get_key_value(&key)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| {
                let available: Vec<&str> = self.providers.keys().map(String::as_str).collect();
                ConfigError::UnknownProvider(format!("{name} (available: {})", available.join(", ")))
            })
    }

    /// Checks every section. Providers are checked after environment
    /// overrides, since a URL or model may only come from the environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.providers.is_empty() {
            self.provider()?;
        }
        for (name, provider) in &self.providers {
            provider.resolved().validate(name)?;
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid("retry.base_delay_ms", "exceeds max_delay_ms"));
        }
        self.batch.validate().map_err(|m| ConfigError::invalid("batch", m))?;
        self.correction.validate().map_err(|m| ConfigError::invalid("correction", m))?;
        self.rules.validate().map_err(|m| ConfigError::invalid("rules", m))?;
        if self.window.max_entries == 0 {
            return Err(ConfigError::invalid("window.max_entries", "must be at least 1"));
        }
        if self.pipeline.parallelism == 0 {
            return Err(ConfigError::invalid("pipeline.parallelism", "must be at least 1"));
        }
        if self.pipeline.call_timeout_seconds == 0 {
            return Err(ConfigError::invalid("pipeline.call_timeout_seconds", "must be positive"));
        }
        Ok(())
    }
}
