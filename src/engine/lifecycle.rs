use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Error as E, Result};
use candle_core::Device;
use tracing::{info, warn};

use crate::backend::{CandlePipeline, RuntimeModel};
use crate::config::ServerConfig;
use crate::controller::DecodeController;
use crate::errors::DecodeError;

use super::tokenizer::{resolve_tokenizer_path, HfTokenizer};
use super::Engine;

impl Engine {
    /// Loads GGUF weights and tokenizer described by `config`.
    pub fn load(config: &ServerConfig) -> Result<Self, DecodeError> {
        Self::load_inner(config).map_err(DecodeError::Load)
    }

    fn load_inner(config: &ServerConfig) -> Result<Self> {
        let started = Instant::now();
        let family = config.resolved_family();
        info!(path = %config.model_path.display(), ?family, "loading model");

        let device = Device::Cpu;
        let model = RuntimeModel::load_from_gguf(&config.model_path, family, &device)?;
        info!("weights loaded, loading tokenizer");

        let tokenizer_path = match resolve_tokenizer_path(&config.model_path, config.tokenizer_path.as_deref()) {
            Some(path) => path,
            None => fetch_tokenizer(config)?,
        };
        let tokenizer = HfTokenizer::load(&tokenizer_path, family)?;

        let pipeline = CandlePipeline::new(
            model,
            device,
            config.generation_for(family),
            config.batch_size,
        );
        let engine = Engine::new(Box::new(pipeline), Arc::new(tokenizer), config.context_length);

        info!(
            strategy = ?engine.strategy(),
            context_length = config.context_length,
            batch_size = config.batch_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model and tokenizer ready"
        );
        Ok(engine)
    }
}

fn fetch_tokenizer(config: &ServerConfig) -> Result<PathBuf> {
    let repo = config.tokenizer_repo.as_ref().ok_or_else(|| {
        E::msg(format!(
            "no tokenizer.json found for {}; set tokenizer_path or tokenizer_repo",
            config.model_path.display()
        ))
    })?;
    warn!(%repo, "tokenizer.json not found locally, fetching from HF");
    let api = hf_hub::api::sync::Api::new()?;
    Ok(api.model(repo.clone()).get("tokenizer.json")?)
}

/// Process-wide load and shutdown signalling.
#[derive(Clone)]
pub struct Lifecycle {
    shutdown: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> DecodeController {
        DecodeController::new(self.shutdown.clone())
    }

    /// Loads the engine and hands it to `controller`. Failure is fatal for the caller.
    pub fn load_into(&self, controller: &DecodeController, config: &ServerConfig) -> Result<(), DecodeError> {
        let engine = Engine::load(config)?;
        controller.install(engine);
        Ok(())
    }

    /// Flips the shared flag; running decode loops stop at their next boundary.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("shutdown requested, cancelling in-flight generation");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failure_is_a_load_error() {
        let config = ServerConfig {
            model_path: PathBuf::from("/nonexistent/llama-3.gguf"),
            ..ServerConfig::default()
        };
        let lifecycle = Lifecycle::new();
        let controller = lifecycle.controller();
        let err = lifecycle
            .load_into(&controller, &config)
            .expect_err("missing weights must fail");
        assert!(matches!(err, DecodeError::Load(_)));
        assert!(!controller.is_ready());
    }

    #[test]
    fn shutdown_is_observed_by_controllers() {
        let lifecycle = Lifecycle::new();
        let controller = lifecycle.controller();
        assert!(!controller.is_shutting_down());
        lifecycle.shutdown();
        lifecycle.shutdown();
        assert!(lifecycle.is_shutting_down());
        assert!(controller.is_shutting_down());
    }
}
