use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::DecodeError;
use crate::prompting::{GenerationConfig, PromptFamily};

pub const DEFAULT_CONTEXT_LENGTH: usize = 512;
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// GGUF weights file.
    pub model_path: PathBuf,
    /// Explicit `tokenizer.json`; otherwise searched next to the model.
    pub tokenizer_path: Option<PathBuf>,
    /// HuggingFace repo to fetch `tokenizer.json` from when none is found locally.
    pub tokenizer_repo: Option<String>,
    /// Overrides the family inferred from the model file name.
    pub family: Option<PromptFamily>,
    pub context_length: usize,
    /// Prefill chunk size.
    pub batch_size: usize,
    pub host: String,
    pub port: u16,
    /// Tokens buffered between the decode loop and a slow client.
    pub stream_buffer: usize,
    pub generation: Option<GenerationConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/model.gguf"),
            tokenizer_path: None,
            tokenizer_repo: None,
            family: None,
            context_length: DEFAULT_CONTEXT_LENGTH,
            batch_size: DEFAULT_BATCH_SIZE,
            host: "127.0.0.1".to_string(),
            port: 8000,
            stream_buffer: 32,
            generation: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, DecodeError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DecodeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, DecodeError> {
        let config: ServerConfig =
            toml::from_str(raw).map_err(|e| DecodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.context_length < 2 {
            return Err(DecodeError::Config(format!(
                "context_length must be >= 2, got {}",
                self.context_length
            )));
        }
        if self.batch_size == 0 {
            return Err(DecodeError::Config("batch_size must be > 0".to_string()));
        }
        if self.stream_buffer == 0 {
            return Err(DecodeError::Config("stream_buffer must be > 0".to_string()));
        }
        if let Some(generation) = &self.generation {
            generation.validate().map_err(DecodeError::Config)?;
        }
        Ok(())
    }

    pub fn resolved_family(&self) -> PromptFamily {
        self.family
            .unwrap_or_else(|| PromptFamily::from_model_path(&self.model_path))
    }

    pub fn generation_for(&self, family: PromptFamily) -> GenerationConfig {
        self.generation
            .unwrap_or_else(|| GenerationConfig::defaults_for(family))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
