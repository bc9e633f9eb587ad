//! Model downloading from Hugging Face.

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::model::{ADAPTER_WEIGHT_FILES, BASE_WEIGHT_FILES};

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Files a repository must (or may) provide.
#[derive(Debug, Clone, Copy)]
pub struct RepoLayout {
    /// Every one of these must exist
    pub required: &'static [&'static str],
    /// At least one of these must exist; the first one found wins
    pub weights: &'static [&'static str],
    /// Same as `weights`, for the tokenizer; empty when none is needed
    pub tokenizer: &'static [&'static str],
    /// Fetched when the repository has them
    pub optional: &'static [&'static str],
}

/// Base model repository (e.g. `allenai/specter2_base`).
pub const BASE_MODEL_LAYOUT: RepoLayout = RepoLayout {
    required: &["config.json"],
    weights: BASE_WEIGHT_FILES,
    tokenizer: &["tokenizer.json", "vocab.txt"],
    optional: &[
        "tokenizer_config.json",
        "special_tokens_map.json",
    ],
};

/// Adapter repository (e.g. `allenai/specter2_adhoc_query`).
pub const ADAPTER_LAYOUT: RepoLayout = RepoLayout {
    required: &["adapter_config.json"],
    weights: ADAPTER_WEIGHT_FILES,
    tokenizer: &[],
    optional: &[],
};

/// Turn a model identifier into a local directory.
///
/// An existing directory is used as-is. Anything else is treated as a hub
/// repository id and downloaded into `cache_dir/{owner}--{name}`.
pub async fn resolve_model_dir(
    identifier: &str,
    layout: &RepoLayout,
    cache_dir: &Path,
) -> Result<PathBuf> {
    let local = Path::new(identifier);
    if local.is_dir() {
        tracing::info!("Using local model directory {}", local.display());
        return Ok(local.to_path_buf());
    }

    let model_dir = cache_dir.join(identifier.replace('/', "--"));
    download_repo(identifier, layout, &model_dir).await
}

/// Download a repository's files into `model_dir`, skipping files already present.
///
/// Returns the path to the model directory.
pub async fn download_repo(repo: &str, layout: &RepoLayout, model_dir: &Path) -> Result<PathBuf> {
    // Create model directory if needed
    if !model_dir.exists() {
        fs::create_dir_all(model_dir).await?;
        tracing::info!("Created model directory: {}", model_dir.display());
    }

    if check_layout(model_dir, layout).await {
        tracing::info!("{} already downloaded", repo);
        return Ok(model_dir.to_path_buf());
    }

    tracing::info!("Downloading {} from Hugging Face...", repo);

    let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;

    for file in layout.required {
        match fetch(&client, &endpoint, repo, file, model_dir).await? {
            Fetched::Present => {}
            Fetched::NotFound => bail!("{} has no {}", repo, file),
        }
    }

    for group in [layout.weights, layout.tokenizer] {
        if !fetch_first(&client, &endpoint, repo, group, model_dir).await? {
            bail!("{} has none of {}", repo, group.join(", "));
        }
    }

    for file in layout.optional {
        if let Fetched::NotFound = fetch(&client, &endpoint, repo, file, model_dir).await? {
            tracing::debug!("{} has no {}, skipping", repo, file);
        }
    }

    tracing::info!("Download of {} complete!", repo);
    Ok(model_dir.to_path_buf())
}

/// Fetch the first file of `group` the repository has. An empty group is satisfied.
async fn fetch_first(
    client: &reqwest::Client,
    endpoint: &str,
    repo: &str,
    group: &[&str],
    model_dir: &Path,
) -> Result<bool> {
    if group.is_empty() {
        return Ok(true);
    }
    for file in group {
        if let Fetched::Present = fetch(client, endpoint, repo, file, model_dir).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether every required file and one file of each "at least one of" group
/// exist and are valid.
async fn check_layout(model_dir: &Path, layout: &RepoLayout) -> bool {
    for file in layout.required {
        if !is_valid_file(&model_dir.join(file)).await {
            return false;
        }
    }

    for group in [layout.weights, layout.tokenizer] {
        if !any_valid(model_dir, group).await {
            return false;
        }
    }
    true
}

async fn any_valid(model_dir: &Path, group: &[&str]) -> bool {
    if group.is_empty() {
        return true;
    }
    for file in group {
        if is_valid_file(&model_dir.join(file)).await {
            return true;
        }
    }
    false
}

async fn is_valid_file(path: &Path) -> bool {
    matches!(fs::metadata(path).await, Ok(meta) if meta.len() > 100)
}

enum Fetched {
    Present,
    NotFound,
}

/// Fetch one file unless it already exists.
async fn fetch(
    client: &reqwest::Client,
    endpoint: &str,
    repo: &str,
    file: &str,
    model_dir: &Path,
) -> Result<Fetched> {
    let dest_path = model_dir.join(file);

    // Skip if already exists and is valid
    if dest_path.exists() {
        if is_valid_file(&dest_path).await {
            tracing::debug!("{} already exists, skipping", file);
            return Ok(Fetched::Present);
        }
        // Remove invalid file
        fs::remove_file(&dest_path).await?;
    }

    let url = format!("{}/{}/resolve/main/{}", endpoint.trim_end_matches('/'), repo, file);
    tracing::info!("Downloading {}...", file);

    download_file(client, &url, &dest_path)
        .await
        .with_context(|| format!("Failed to download {}", file))
}

/// Download a single file, writing to a `.part` sibling and renaming on completion.
async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<Fetched> {
    let response = client.get(url).send().await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(Fetched::NotFound);
    }

    let response = response
        .error_for_status()
        .with_context(|| format!("HTTP error downloading {}", url))?;

    let total_size = response.content_length();
    let mut stream = response.bytes_stream();

    let partial = dest.with_extension("part");
    let mut file = File::create(&partial).await?;
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        // Log progress for large files
        if let Some(total) = total_size
            && total > 1_000_000
            && downloaded % 50_000_000 < chunk.len() as u64
        {
            let percent = (downloaded as f64 / total as f64) * 100.0;
            tracing::info!("  Progress: {:.1}%", percent);
        }
    }

    file.flush().await?;
    drop(file);
    fs::rename(&partial, dest).await?;

    Ok(Fetched::Present)
}
