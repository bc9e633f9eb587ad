use once_cell::sync::Lazy;
use specter_embeddings::{LoadOptions, Specter2Embedder, default_cache_dir};

pub use specter_embeddings::Embedder;

/// The real SPECTER2 bundle, loaded once per test binary.
///
/// `MODEL_NAME` / `ADAPTER_NAME` may point at local directories to avoid the
/// hub download; otherwise the default repositories are fetched into the cache.
pub static TEST_MODEL: Lazy<Specter2Embedder> = Lazy::new(|| {
    let mut options = LoadOptions {
        cache_dir: std::env::var("MODEL_CACHE_DIR")
            .map(Into::into)
            .unwrap_or_else(|_| default_cache_dir()),
        force_cpu: true,
        ..LoadOptions::default()
    };
    if let Ok(name) = std::env::var("MODEL_NAME") {
        options.model_name = name;
    }
    if let Ok(name) = std::env::var("ADAPTER_NAME") {
        options.adapter_name = name;
    }

    let runtime = tokio::runtime::Runtime::new().expect("Failed to start runtime");
    runtime
        .block_on(Specter2Embedder::from_pretrained(&options))
        .expect("Failed to load SPECTER2 model")
});

pub fn similarity(a: &str, b: &str) -> f32 {
    let emb_a = TEST_MODEL.embed_one(a).expect("Failed to embed");
    let emb_b = TEST_MODEL.embed_one(b).expect("Failed to embed");
    cosine_similarity(&emb_a, &emb_b).expect("Dimension mismatch")
}

/// Cosine similarity of two equal-length vectors (0.0 when either is all zeros).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denominator = norm(a) * norm(b);
    Some(if denominator == 0.0 { 0.0 } else { dot / denominator })
}
