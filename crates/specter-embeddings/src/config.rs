//! Configuration files shipped with the base model and the adapter.
//!
//! `config.json` describes the BERT encoder; `adapter_config.json` describes the
//! bottleneck adapter saved by the `adapters` library. Missing adapter fields fall
//! back to the Pfeiffer configuration SPECTER2 adapters are trained with.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use candle_nn::Activation;
use serde::Deserialize;

/// Encoder hyper-parameters read from `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default)]
    pub hidden_act: Activation,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: usize,
    #[serde(default)]
    pub model_type: Option<String>,
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BertConfig = serde_json::from_str(json).context("Failed to parse config.json")?;

        if config.num_attention_heads == 0 || config.hidden_size % config.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                config.hidden_size,
                config.num_attention_heads
            );
        }

        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Contents of `adapter_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterFile {
    pub config: AdapterConfig,
    /// Name the adapter was saved under (e.g. `[QRY]`); informational only.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hidden_size: Option<usize>,
}

impl AdapterFile {
    pub fn from_json(json: &str) -> Result<Self> {
        let file: AdapterFile =
            serde_json::from_str(json).context("Failed to parse adapter_config.json")?;
        file.config.validate()?;
        Ok(file)
    }
}

/// Where the adapter's residual is taken from, relative to the original LayerNorm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualSource {
    /// The sub-layer output before the original LayerNorm (Pfeiffer).
    BeforeLayerNorm,
    /// The sub-layer output plus its input, before the original LayerNorm.
    PostAdd,
    /// The output of the original LayerNorm (Houlsby).
    AfterLayerNorm,
}

impl<'de> Deserialize<'de> for ResidualSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Named(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Self::BeforeLayerNorm),
            Raw::Flag(false) => Ok(Self::AfterLayerNorm),
            Raw::Named(name) if name == "post_add" => Ok(Self::PostAdd),
            Raw::Named(name) => Err(serde::de::Error::custom(format!(
                "unknown residual_before_ln value: {name}"
            ))),
        }
    }
}

/// Bottleneck width divisor, either uniform or per layer with a `default` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReductionFactor {
    Uniform(f64),
    PerLayer(HashMap<String, f64>),
}

impl ReductionFactor {
    pub fn for_layer(&self, layer: usize) -> Result<f64> {
        match self {
            Self::Uniform(factor) => Ok(*factor),
            Self::PerLayer(map) => map
                .get(&layer.to_string())
                .or_else(|| map.get("default"))
                .copied()
                .with_context(|| format!("No reduction_factor for layer {layer} and no default")),
        }
    }
}

/// Multiplier applied to the up projection. Only fixed values are supported.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Scaling {
    Fixed(f64),
    Named(String),
}

/// Bottleneck adapter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub mh_adapter: bool,
    #[serde(default = "default_true")]
    pub output_adapter: bool,
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: ReductionFactor,
    #[serde(default = "default_non_linearity")]
    pub non_linearity: String,
    #[serde(default = "default_true")]
    pub original_ln_before: bool,
    #[serde(default = "default_true")]
    pub original_ln_after: bool,
    #[serde(default = "default_residual")]
    pub residual_before_ln: ResidualSource,
    #[serde(default)]
    pub ln_before: bool,
    #[serde(default)]
    pub ln_after: bool,
    #[serde(default = "default_scaling")]
    pub scaling: Scaling,
    #[serde(default)]
    pub use_gating: bool,
    #[serde(default)]
    pub phm_layer: bool,
}

fn default_true() -> bool {
    true
}

fn default_reduction_factor() -> ReductionFactor {
    ReductionFactor::Uniform(16.0)
}

fn default_non_linearity() -> String {
    "relu".to_string()
}

fn default_residual() -> ResidualSource {
    ResidualSource::BeforeLayerNorm
}

fn default_scaling() -> Scaling {
    Scaling::Fixed(1.0)
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            architecture: None,
            mh_adapter: false,
            output_adapter: true,
            reduction_factor: default_reduction_factor(),
            non_linearity: default_non_linearity(),
            original_ln_before: true,
            original_ln_after: true,
            residual_before_ln: default_residual(),
            ln_before: false,
            ln_after: false,
            scaling: default_scaling(),
            use_gating: false,
            phm_layer: false,
        }
    }
}

impl AdapterConfig {
    /// Reject adapter variants the encoder cannot run.
    pub fn validate(&self) -> Result<()> {
        if let Some(arch) = self.architecture.as_deref().filter(|a| *a != "bottleneck") {
            bail!("Unsupported adapter architecture: {arch}");
        }
        if self.ln_before || self.ln_after {
            bail!("Adapters with internal layer norms (ln_before/ln_after) are not supported");
        }
        if self.use_gating {
            bail!("Gated adapters are not supported");
        }
        if self.phm_layer {
            bail!("PHM adapters are not supported");
        }
        if !self.mh_adapter && !self.output_adapter {
            bail!("Adapter config enables neither mh_adapter nor output_adapter");
        }
        self.activation()?;
        self.scaling_factor()?;
        Ok(())
    }

    pub fn activation(&self) -> Result<Activation> {
        let activation = match self.non_linearity.to_ascii_lowercase().as_str() {
            "relu" => Activation::Relu,
            "gelu" | "gelu_orig" => Activation::Gelu,
            "gelu_new" => Activation::NewGelu,
            "swish" => Activation::Swish,
            "silu" => Activation::Silu,
            "sigmoid" => Activation::Sigmoid,
            "leakyrelu" => Activation::LeakyRelu(0.01),
            other => bail!("Unsupported adapter non_linearity: {other}"),
        };
        Ok(activation)
    }

    pub fn scaling_factor(&self) -> Result<f64> {
        match &self.scaling {
            Scaling::Fixed(value) => Ok(*value),
            Scaling::Named(name) => bail!("Unsupported adapter scaling: {name}"),
        }
    }
}
