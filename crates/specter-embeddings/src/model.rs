use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;

use crate::adapter::ADAPTER_ROLE;
use crate::bert::{BertEncoder, first_token};
use crate::config::{AdapterFile, BertConfig};
use crate::tokenizer::load_tokenizer;
use crate::weights::{adapter_tensors, base_tensors, find_weights, load_tensor_file};
use crate::{DEFAULT_ADAPTER_NAME, DEFAULT_MODEL_NAME, Embedder, Embedding};

/// Base model weight files, in order of preference.
pub const BASE_WEIGHT_FILES: &[&str] = &["model.safetensors", "pytorch_model.bin"];

/// Adapter weight files, in order of preference.
pub const ADAPTER_WEIGHT_FILES: &[&str] = &["pytorch_adapter.safetensors", "pytorch_adapter.bin"];

/// Directories holding the base model and the adapter.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub model_dir: PathBuf,
    pub adapter_dir: PathBuf,
}

/// Where the model comes from and which device runs it.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Hub repository id or local directory of the base model
    pub model_name: String,
    /// Hub repository id or local directory of the adapter
    pub adapter_name: String,
    /// Directory hub downloads are cached in
    pub cache_dir: PathBuf,
    /// Skip accelerator detection and run on the CPU
    pub force_cpu: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            adapter_name: DEFAULT_ADAPTER_NAME.to_string(),
            cache_dir: default_cache_dir(),
            force_cpu: false,
        }
    }
}

/// `$XDG_CACHE_HOME/specter2` (or the platform equivalent), else `.cache/specter2`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("specter2")
}

/// Pick an accelerator when one is available, otherwise the CPU.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }

    #[cfg(feature = "metal")]
    {
        if candle_core::utils::metal_is_available() {
            return Ok(Device::new_metal(0)?);
        }
    }

    Ok(Device::cuda_if_available(0)?)
}

/// The loaded model bundle: tokenizer, BERT encoder, and the activated query adapter.
///
/// Built once at startup and only read afterwards, so a single instance can be
/// shared across threads without locking.
pub struct Specter2Embedder {
    encoder: BertEncoder,
    tokenizer: Tokenizer,
    device: Device,
}

impl Specter2Embedder {
    /// Load the base model from `paths.model_dir` and bind the adapter from
    /// `paths.adapter_dir` under the `query` role.
    ///
    /// # Expected files
    /// - model dir: `config.json`, `tokenizer.json` or `vocab.txt`,
    ///   `model.safetensors` or `pytorch_model.bin`
    /// - adapter dir: `adapter_config.json`, `pytorch_adapter.safetensors` or `pytorch_adapter.bin`
    pub fn load(paths: &ModelPaths, device: Device) -> Result<Self> {
        let config_path = paths.model_dir.join("config.json");
        let config_json = fs::read_to_string(&config_path)
            .map_err(|e| anyhow!("Failed to read {}: {}", config_path.display(), e))?;
        let config = BertConfig::from_json(&config_json)?;

        let adapter_config_path = paths.adapter_dir.join("adapter_config.json");
        let adapter_json = fs::read_to_string(&adapter_config_path)
            .map_err(|e| anyhow!("Failed to read {}: {}", adapter_config_path.display(), e))?;
        let adapter = AdapterFile::from_json(&adapter_json)?;

        if let Some(hidden_size) = adapter.hidden_size
            && hidden_size != config.hidden_size
        {
            bail!(
                "Adapter was trained for hidden size {}, model has {}",
                hidden_size,
                config.hidden_size
            );
        }

        let tokenizer = load_tokenizer(
            &paths.model_dir,
            config.max_position_embeddings,
            config.pad_token_id as u32,
        )?;

        let mut tensors = base_tensors(load_tensor_file(&find_weights(
            &paths.model_dir,
            BASE_WEIGHT_FILES,
        )?)?);
        tensors.extend(adapter_tensors(
            load_tensor_file(&find_weights(&paths.adapter_dir, ADAPTER_WEIGHT_FILES)?)?,
            ADAPTER_ROLE,
        )?);

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let encoder = BertEncoder::load(vb, &config, Some(&adapter.config))
            .context("Failed to build encoder from checkpoint")?;

        tracing::info!(
            "Loaded {} layers (hidden size {}) with adapter {} as {:?} on {:?}",
            config.num_hidden_layers,
            config.hidden_size,
            adapter.name.as_deref().unwrap_or("<unnamed>"),
            ADAPTER_ROLE,
            device
        );

        Ok(Self {
            encoder,
            tokenizer,
            device,
        })
    }

    /// Resolve both identifiers (downloading hub repositories into the cache when
    /// needed), select the device, and load the bundle.
    #[cfg(feature = "download-model")]
    pub async fn from_pretrained(options: &LoadOptions) -> Result<Self> {
        use crate::download::{ADAPTER_LAYOUT, BASE_MODEL_LAYOUT, resolve_model_dir};

        let model_dir =
            resolve_model_dir(&options.model_name, &BASE_MODEL_LAYOUT, &options.cache_dir).await?;
        let adapter_dir =
            resolve_model_dir(&options.adapter_name, &ADAPTER_LAYOUT, &options.cache_dir).await?;

        let device = select_device(options.force_cpu)?;
        Self::load(
            &ModelPaths {
                model_dir,
                adapter_dir,
            },
            device,
        )
    }

    /// Load from local directories only.
    pub fn from_local(options: &LoadOptions) -> Result<Self> {
        let model_dir = local_dir(&options.model_name)?;
        let adapter_dir = local_dir(&options.adapter_name)?;
        let device = select_device(options.force_cpu)?;
        Self::load(
            &ModelPaths {
                model_dir,
                adapter_dir,
            },
            device,
        )
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn local_dir(identifier: &str) -> Result<PathBuf> {
    let path = Path::new(identifier);
    if path.is_dir() {
        Ok(path.to_path_buf())
    } else {
        bail!("{identifier} is not a local directory and hub downloads are disabled")
    }
}

impl Embedder for Specter2Embedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.iter().map(String::as_str).collect::<Vec<_>>(), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let token_ids: Vec<Vec<u32>> = encodings.iter().map(|e| e.get_ids().to_vec()).collect();
        let masks: Vec<Vec<u32>> = encodings
            .iter()
            .map(|e| e.get_attention_mask().to_vec())
            .collect();

        tracing::debug!(
            "Encoding batch of {} (padded length {})",
            texts.len(),
            token_ids.first().map_or(0, Vec::len)
        );

        let token_ids = Tensor::new(token_ids, &self.device)?;
        let attention_mask = Tensor::new(masks, &self.device)?;

        let hidden_states = self.encoder.forward(&token_ids, &attention_mask)?;

        first_token(&hidden_states)?
            .to_vec2::<f32>()
            .context("Failed to convert tensor to vec")
    }

    fn dimension(&self) -> usize {
        self.encoder.hidden_size()
    }
}
