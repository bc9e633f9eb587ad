#![deny(clippy::all)]

mod adapter;
mod bert;
mod config;
mod model;
mod query;
mod tokenizer;
mod weights;

#[cfg(feature = "download-model")]
pub mod download;

// Re-export for external use
pub use adapter::ADAPTER_ROLE;
pub use config::{AdapterConfig, BertConfig};
pub use model::{LoadOptions, ModelPaths, Specter2Embedder, default_cache_dir, select_device};
pub use query::{Query, QueryError};

/// Base encoder checkpoint used when `MODEL_NAME` is not set.
pub const DEFAULT_MODEL_NAME: &str = "allenai/specter2_base";

/// Query adapter used when `ADAPTER_NAME` is not set.
pub const DEFAULT_ADAPTER_NAME: &str = "allenai/specter2_adhoc_query";

/// Embedding dimension of the SPECTER2 base model (its hidden size).
pub const EMBEDDING_DIM: usize = 768;

/// Type alias for an embedding vector.
pub type Embedding = Vec<f32>;

/// Turns texts into fixed-size vectors.
///
/// Implementations are loaded once and shared read-only between requests, so
/// the wrappers hold them as `Arc<dyn Embedder>` and tests can swap in stubs.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per input in the same order.
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Embedding>>;

    /// Length of every vector `embed` returns.
    fn dimension(&self) -> usize;

    /// Embed a single text.
    fn embed_one(&self, text: &str) -> anyhow::Result<Embedding> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedder returned no vector"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Embedding>);

    impl Embedder for Fixed {
        fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Embedding>> {
            Ok(self.0.clone())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_embed_one_takes_first_vector() {
        let embedder = Fixed(vec![vec![1.0, 2.0]]);
        assert_eq!(embedder.embed_one("query").unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_embed_one_errors_on_empty_result() {
        let embedder = Fixed(vec![]);
        assert!(embedder.embed_one("query").is_err());
    }
}
