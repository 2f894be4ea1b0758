use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};

use decode_stream_server::config::ServerConfig;
use decode_stream_server::engine::Lifecycle;
use decode_stream_server::errors::DecodeError;
use decode_stream_server::server::{build_router, AppState};
use decode_stream_server::telemetry;

/// Streams model completions over Server-Sent Events, one request at a time.
#[derive(Parser, Debug)]
#[command(name = "decode_stream_server", version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// GGUF weights file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// tokenizer.json path
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    context_length: Option<usize>,

    /// Prefill chunk size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, DecodeError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(model) = self.model {
            config.model_path = model;
        }
        if let Some(tokenizer) = self.tokenizer {
            config.tokenizer_path = Some(tokenizer);
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(context_length) = self.context_length {
            config.context_length = context_length;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.verbose);

    let config = args.into_config()?;
    let lifecycle = Lifecycle::new();
    let controller = Arc::new(lifecycle.controller());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, model = %config.model_path.display(), "listening, model loading in background");

    let (fatal_tx, fatal_rx) = oneshot::channel::<DecodeError>();
    {
        let lifecycle = lifecycle.clone();
        let controller = controller.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = lifecycle.load_into(&controller, &config) {
                error!(error = %e, "model load failed");
                let _ = fatal_tx.send(e);
            }
        });
    }

    let app = build_router(AppState::new(controller, config.stream_buffer));
    let (load_error_tx, load_error_rx) = oneshot::channel::<DecodeError>();
    let stopping = lifecycle.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                Ok(err) = fatal_rx => {
                    let _ = load_error_tx.send(err);
                }
            }
            stopping.shutdown();
        })
        .await
        .context("server error")?;

    if let Ok(err) = load_error_rx.await {
        return Err(err.into());
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
