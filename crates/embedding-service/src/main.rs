//! SPECTER2 query embedding service

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use embedding_service::{AppState, router};
use specter_embeddings::{
    DEFAULT_ADAPTER_NAME, DEFAULT_MODEL_NAME, Embedder, LoadOptions, Specter2Embedder,
    default_cache_dir,
};
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "embedding-service")]
#[command(about = "HTTP service for SPECTER2 query embeddings")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8000, env = "PORT")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "BIND")]
    bind: String,

    /// Base model: hub repository id or local directory
    #[arg(long, default_value = DEFAULT_MODEL_NAME, env = "MODEL_NAME")]
    model_name: String,

    /// Query adapter: hub repository id or local directory
    #[arg(long, default_value = DEFAULT_ADAPTER_NAME, env = "ADAPTER_NAME")]
    adapter_name: String,

    /// Directory hub downloads are cached in
    #[arg(long, env = "MODEL_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Run on the CPU even when an accelerator is available
    #[arg(long, env = "FORCE_CPU")]
    cpu: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "embedding_service=info,specter_embeddings=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let options = LoadOptions {
        model_name: cli.model_name,
        adapter_name: cli.adapter_name,
        cache_dir: cli.cache_dir.unwrap_or_else(default_cache_dir),
        force_cpu: cli.cpu,
    };
    tracing::info!(
        "Loading {} with adapter {}",
        options.model_name,
        options.adapter_name
    );
    let embedder = Specter2Embedder::from_pretrained(&options).await?;
    tracing::info!(
        "Model ready ({} dimensions) on {:?}",
        embedder.dimension(),
        embedder.device()
    );

    let state = Arc::new(AppState {
        embedder: Arc::new(embedder),
    });
    let app = router(state);

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;

    tracing::info!("Starting embedding-service on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Embedding service shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
