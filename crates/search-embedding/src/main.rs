use std::path::PathBuf;

use clap::Parser;
use specter_embeddings::{
    DEFAULT_ADAPTER_NAME, DEFAULT_MODEL_NAME, LoadOptions, Specter2Embedder, default_cache_dir,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Reads `{"query": "..."}` on stdin and prints the query embedding as one JSON line.
#[derive(Parser, Debug)]
#[command(name = "search-embedding")]
struct Cli {
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
    // Logs go to stderr; stdout carries only the response line
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "search_embedding=info,specter_embeddings=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let options = LoadOptions {
        model_name: cli.model_name,
        adapter_name: cli.adapter_name,
        cache_dir: cli.cache_dir.unwrap_or_else(default_cache_dir),
        force_cpu: cli.cpu,
    };
    let embedder = Specter2Embedder::from_pretrained(&options).await?;
    tracing::debug!("Model ready on {:?}", embedder.device());

    search_embedding::run(std::io::stdin().lock(), std::io::stdout().lock(), &embedder)
}
