//! Session configuration.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `INFERENCE_SESSION_`, nested keys
//!    separated by `__` (e.g. `INFERENCE_SESSION_SAMPLING__TOP_K=20`)
//!
//! Command-line flags are applied on top by the binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::generate::{GenerationRequest, DEFAULT_MAX_TOKENS};
use crate::sampling::SamplingConfig;

pub const ENV_PREFIX: &str = "INFERENCE_SESSION";

/// Everything needed to construct a session and issue requests on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model file to load
    pub model_path: PathBuf,
    /// Engine worker threads
    pub threads: usize,
    /// Context window in tokens
    pub context_capacity: usize,
    /// Ask the backend for NUMA-aware initialization
    pub numa: bool,
    pub generation: GenerationDefaults,
    pub sampling: SamplingConfig,
}

/// Per-request defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub max_tokens: usize,
    pub stop_sequences: Vec<String>,
    /// Wall-clock budget per request in milliseconds
    pub deadline_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.q8"),
            threads: 4,
            context_capacity: 512,
            numa: false,
            generation: GenerationDefaults::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            stop_sequences: Vec::new(),
            deadline_ms: None,
        }
    }
}

impl SessionConfig {
    /// Load defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("generation.stop_sequences")
                .try_parsing(true),
        );

        let config: SessionConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be positive".into()));
        }
        if self.context_capacity == 0 {
            return Err(ConfigError::Invalid(
                "context_capacity must be positive".into(),
            ));
        }
        if self.generation.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".into()));
        }
        self.sampling.validate().map_err(ConfigError::Invalid)
    }

    /// A request for `prompt` carrying the configured defaults.
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt, self.generation.max_tokens)
            .with_sampling(self.sampling.clone());
        request.stop_sequences = self.generation.stop_sequences.clone();
        request.deadline = self.generation.deadline_ms.map(Duration::from_millis);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.threads, 4);
        assert_eq!(config.context_capacity, 512);
        assert_eq!(config.generation.max_tokens, 256);
        assert_eq!(config.sampling.top_k, 40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
model_path = "/models/tiny.q8"
context_capacity = 128

[generation]
max_tokens = 16
stop_sequences = ["User:"]

[sampling]
seed = 42
top_k = 8
"#
        )
        .unwrap();

        let config = SessionConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.model_path, PathBuf::from("/models/tiny.q8"));
        assert_eq!(config.context_capacity, 128);
        assert_eq!(config.threads, 4);
        assert_eq!(config.generation.max_tokens, 16);
        assert_eq!(config.generation.stop_sequences, vec!["User:".to_string()]);
        assert_eq!(config.sampling.seed, Some(42));
        assert_eq!(config.sampling.top_k, 8);
        assert_eq!(config.sampling.top_p, 0.95);

        let request = config.request("hi");
        assert_eq!(request.max_tokens, 16);
        assert_eq!(request.sampling.seed, Some(42));
        assert!(request.reset_context);
    }

    #[test]
    fn test_invalid_file_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "threads = 0").unwrap();
        assert!(matches!(
            SessionConfig::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }
}
