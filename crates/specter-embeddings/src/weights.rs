//! Reading checkpoint files and normalizing tensor names.
//!
//! Base checkpoints and adapter checkpoints are merged into a single name → tensor
//! map that the encoder is built from. Names are stored without the `bert.` prefix,
//! and adapter tensors are re-keyed under the role they are activated as.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_core::{Device, Tensor};

/// Load every tensor in a `.safetensors` or PyTorch pickle (`.bin`/`.pt`) file onto the CPU.
pub fn load_tensor_file(path: &Path) -> Result<HashMap<String, Tensor>> {
    let is_safetensors = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "safetensors");

    let tensors = if is_safetensors {
        candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        candle_core::pickle::read_all(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .into_iter()
            .collect()
    };

    tracing::debug!("Read {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Return the first candidate file that exists in `dir`.
pub fn find_weights(dir: &Path, candidates: &[&str]) -> Result<PathBuf> {
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .with_context(|| {
            format!(
                "No weights found in {} (looked for {})",
                dir.display(),
                candidates.join(", ")
            )
        })
}

/// Strip the `bert.` prefix and map legacy `gamma`/`beta` LayerNorm names.
pub fn normalize_name(name: &str) -> String {
    let name = name.strip_prefix("bert.").unwrap_or(name);
    if let Some(stem) = name.strip_suffix("LayerNorm.gamma") {
        format!("{stem}LayerNorm.weight")
    } else if let Some(stem) = name.strip_suffix("LayerNorm.beta") {
        format!("{stem}LayerNorm.bias")
    } else {
        name.to_string()
    }
}

/// Split an adapter tensor name into (saved adapter name, re-keyed name).
///
/// `encoder.layer.3.output.adapters.[QRY].adapter_down.0.weight` becomes
/// `encoder.layer.3.output.adapters.query.adapter_down.0.weight` for role `query`.
/// Returns `None` for tensors that do not belong to a bottleneck adapter.
pub fn rekey_adapter_name(name: &str, role: &str) -> Option<(String, String)> {
    let (prefix, rest) = name.split_once(".adapters.")?;
    let module_at = rest
        .find(".adapter_down.")
        .or_else(|| rest.find(".adapter_up."))?;
    let saved = &rest[..module_at];
    let module = &rest[module_at + 1..];
    Some((saved.to_string(), format!("{prefix}.adapters.{role}.{module}")))
}

/// Base model tensors with normalized names.
pub fn base_tensors(raw: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    raw.into_iter()
        .map(|(name, tensor)| (normalize_name(&name), tensor))
        .collect()
}

/// Adapter tensors re-keyed under `role`.
///
/// Fails when the file holds no adapter weights or weights of more than one adapter.
pub fn adapter_tensors(
    raw: HashMap<String, Tensor>,
    role: &str,
) -> Result<HashMap<String, Tensor>> {
    let mut saved_names = BTreeSet::new();
    let mut tensors = HashMap::new();

    for (name, tensor) in raw {
        let normalized = normalize_name(&name);
        match rekey_adapter_name(&normalized, role) {
            Some((saved, rekeyed)) => {
                saved_names.insert(saved);
                tensors.insert(rekeyed, tensor);
            }
            None => tracing::debug!("Ignoring non-adapter tensor {}", name),
        }
    }

    match saved_names.len() {
        0 => bail!("Adapter checkpoint contains no bottleneck adapter weights"),
        1 => {
            tracing::debug!(
                "Binding adapter {:?} as {:?} ({} tensors)",
                saved_names.first(),
                role,
                tensors.len()
            );
            Ok(tensors)
        }
        _ => bail!(
            "Adapter checkpoint contains several adapters: {}",
            saved_names.into_iter().collect::<Vec<_>>().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar() -> Tensor {
        Tensor::new(&[0f32], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(
            normalize_name("bert.embeddings.word_embeddings.weight"),
            "embeddings.word_embeddings.weight"
        );
        assert_eq!(
            normalize_name("encoder.layer.0.output.LayerNorm.gamma"),
            "encoder.layer.0.output.LayerNorm.weight"
        );
        assert_eq!(
            normalize_name("embeddings.LayerNorm.beta"),
            "embeddings.LayerNorm.bias"
        );
        assert_eq!(normalize_name("heads.x.weight"), "heads.x.weight");
    }

    #[test]
    fn test_rekey_adapter_name() {
        let (saved, rekeyed) = rekey_adapter_name(
            "encoder.layer.11.output.adapters.[QRY].adapter_down.0.bias",
            "query",
        )
        .unwrap();
        assert_eq!(saved, "[QRY]");
        assert_eq!(rekeyed, "encoder.layer.11.output.adapters.query.adapter_down.0.bias");

        let (saved, rekeyed) = rekey_adapter_name(
            "encoder.layer.0.attention.output.adapters.adhoc_query.adapter_up.weight",
            "query",
        )
        .unwrap();
        assert_eq!(saved, "adhoc_query");
        assert_eq!(
            rekeyed,
            "encoder.layer.0.attention.output.adapters.query.adapter_up.weight"
        );

        assert!(rekey_adapter_name("encoder.layer.0.output.dense.weight", "query").is_none());
    }

    #[test]
    fn test_adapter_tensors_rekeys_and_drops_heads() {
        let mut raw = HashMap::new();
        raw.insert(
            "bert.encoder.layer.0.output.adapters.[QRY].adapter_down.0.weight".to_string(),
            scalar(),
        );
        raw.insert(
            "bert.encoder.layer.0.output.adapters.[QRY].adapter_up.weight".to_string(),
            scalar(),
        );
        raw.insert("heads.[QRY].0.weight".to_string(), scalar());

        let tensors = adapter_tensors(raw, "query").unwrap();
        assert_eq!(tensors.len(), 2);
        assert!(tensors.contains_key("encoder.layer.0.output.adapters.query.adapter_down.0.weight"));
        assert!(tensors.contains_key("encoder.layer.0.output.adapters.query.adapter_up.weight"));
    }

    #[test]
    fn test_adapter_tensors_rejects_mixed_adapters() {
        let mut raw = HashMap::new();
        raw.insert(
            "encoder.layer.0.output.adapters.a.adapter_up.weight".to_string(),
            scalar(),
        );
        raw.insert(
            "encoder.layer.0.output.adapters.b.adapter_up.weight".to_string(),
            scalar(),
        );
        assert!(adapter_tensors(raw, "query").is_err());
    }

    #[test]
    fn test_adapter_tensors_rejects_empty() {
        let mut raw = HashMap::new();
        raw.insert("embeddings.word_embeddings.weight".to_string(), scalar());
        assert!(adapter_tensors(raw, "query").is_err());
    }

    #[test]
    fn test_safetensors_round_trip_through_loader() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert("bert.pooler.dense.bias".to_string(), scalar());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let found = find_weights(dir.path(), &["model.safetensors", "pytorch_model.bin"]).unwrap();
        assert_eq!(found, path);

        let loaded = base_tensors(load_tensor_file(&found).unwrap());
        assert!(loaded.contains_key("pooler.dense.bias"));
    }

    #[test]
    fn test_find_weights_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(find_weights(dir.path(), &["model.safetensors"]).is_err());
    }
}
