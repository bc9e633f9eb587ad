//! BERT encoder with bottleneck adapter insertion points.
//!
//! Layout and tensor names follow the HuggingFace BERT checkpoint format, with the
//! `bert.` prefix already stripped (see `weights::normalize_name`). Dropout is never
//! applied: the encoder only runs inference.

use anyhow::{Context, Result};
use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Activation, Embedding, VarBuilder, embedding};
use candle_transformers::models::with_tracing::{LayerNorm, Linear, layer_norm, linear};

use crate::adapter::{ADAPTER_ROLE, BottleneckAdapter};
use crate::config::{AdapterConfig, BertConfig};

/// Additive bias for masked key positions. Large enough that `exp` underflows to zero.
const MASKED_BIAS: f64 = -10_000.0;

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let embeddings = self
            .word_embeddings
            .forward(input_ids)?
            .add(&self.token_type_embeddings.forward(token_type_ids)?)?
            .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;

        Ok(self.layer_norm.forward(&embeddings)?)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            query: linear(hidden, hidden, vb.pp("query"))?,
            key: linear(hidden, hidden, vb.pp("key"))?,
            value: linear(hidden, hidden, vb.pp("value"))?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    /// [batch, seq, hidden] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, hidden_states: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden) = hidden_states.dims3()?;

        let query = self.split_heads(&self.query.forward(hidden_states)?)?;
        let key = self.split_heads(&self.key.forward(hidden_states)?)?;
        let value = self.split_heads(&self.value.forward(hidden_states)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (query.matmul(&key.t()?)? * scale)?.broadcast_add(mask_bias)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        Ok(probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))?)
    }
}

/// Dense projection + residual LayerNorm, optionally wrapped by the adapter.
///
/// Used both as `attention.output` and as `output` in every layer.
struct SubLayerOutput {
    dense: Linear,
    layer_norm: LayerNorm,
    adapter: Option<BottleneckAdapter>,
}

impl SubLayerOutput {
    fn load(
        vb: VarBuilder,
        in_dim: usize,
        config: &BertConfig,
        adapter: Option<(&AdapterConfig, usize)>,
    ) -> Result<Self> {
        let adapter = match adapter {
            Some((adapter_config, layer)) => Some(
                BottleneckAdapter::load(
                    vb.pp("adapters").pp(ADAPTER_ROLE),
                    config.hidden_size,
                    layer,
                    adapter_config,
                )
                .with_context(|| format!("Failed to load adapter weights for layer {layer}"))?,
            ),
            None => None,
        };

        Ok(Self {
            dense: linear(in_dim, config.hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            adapter,
        })
    }

    fn forward(&self, hidden_states: &Tensor, input: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        match &self.adapter {
            Some(adapter) => adapter.forward(&hidden_states, input, &self.layer_norm),
            None => Ok(self.layer_norm.forward(&(hidden_states + input)?)?),
        }
    }
}

struct BertLayer {
    attention: SelfAttention,
    attention_output: SubLayerOutput,
    intermediate: Linear,
    activation: Activation,
    output: SubLayerOutput,
}

impl BertLayer {
    fn load(
        vb: VarBuilder,
        config: &BertConfig,
        layer: usize,
        adapter: Option<&AdapterConfig>,
    ) -> Result<Self> {
        let mh_adapter = adapter.filter(|a| a.mh_adapter).map(|a| (a, layer));
        let output_adapter = adapter.filter(|a| a.output_adapter).map(|a| (a, layer));

        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention").pp("self"), config)?,
            attention_output: SubLayerOutput::load(
                vb.pp("attention").pp("output"),
                config.hidden_size,
                config,
                mh_adapter,
            )?,
            intermediate: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation: config.hidden_act,
            output: SubLayerOutput::load(
                vb.pp("output"),
                config.intermediate_size,
                config,
                output_adapter,
            )?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let attention = self.attention.forward(hidden_states, mask_bias)?;
        let attention = self.attention_output.forward(&attention, hidden_states)?;

        let intermediate = self
            .activation
            .forward(&self.intermediate.forward(&attention)?)?;
        self.output.forward(&intermediate, &attention)
    }
}

/// BERT encoder returning the last hidden state.
pub struct BertEncoder {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    hidden_size: usize,
}

impl BertEncoder {
    /// Build the encoder, wiring the adapter into every layer when one is given.
    ///
    /// `vb` must resolve un-prefixed names (`embeddings.*`, `encoder.layer.*`).
    pub fn load(vb: VarBuilder, config: &BertConfig, adapter: Option<&AdapterConfig>) -> Result<Self> {
        let embeddings =
            BertEmbeddings::load(vb.pp("embeddings"), config).context("Failed to load embeddings")?;

        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                BertLayer::load(vb.pp(format!("encoder.layer.{i}")), config, i, adapter)
                    .with_context(|| format!("Failed to load encoder layer {i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embeddings,
            layers,
            hidden_size: config.hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Run the encoder.
    ///
    /// * `input_ids` - `[batch, seq]` token ids (u32)
    /// * `attention_mask` - `[batch, seq]`, 1 for real tokens and 0 for padding
    ///
    /// Returns `[batch, seq, hidden]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let mask_bias = extended_attention_mask(attention_mask)?;

        let mut hidden_states = self.embeddings.forward(input_ids, &token_type_ids)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask_bias)?;
        }
        Ok(hidden_states)
    }
}

/// [batch, seq] mask -> [batch, 1, 1, seq] additive bias (0 for tokens, large negative for padding).
fn extended_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    Ok(attention_mask
        .to_dtype(DType::F32)?
        .affine(-MASKED_BIAS, MASKED_BIAS)?
        .reshape((batch, 1, 1, seq_len))?)
}

/// Hidden state of the first position (`[CLS]`) of every sequence: [batch, seq, hidden] -> [batch, hidden].
pub fn first_token(hidden_states: &Tensor) -> Result<Tensor> {
    Ok(hidden_states.narrow(D::Minus2, 0, 1)?.squeeze(D::Minus2)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    pub(crate) fn tiny_config(vocab_size: usize) -> BertConfig {
        BertConfig::from_json(&format!(
            r#"{{
                "vocab_size": {vocab_size},
                "hidden_size": 16,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "intermediate_size": 32,
                "hidden_act": "gelu",
                "max_position_embeddings": 32
            }}"#
        ))
        .unwrap()
    }

    /// Randomly initialised encoder; the VarMap keeps the variables alive and editable.
    pub(crate) fn random_encoder(
        config: &BertConfig,
        adapter: Option<&AdapterConfig>,
    ) -> (BertEncoder, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = BertEncoder::load(vb, config, adapter).unwrap();
        (encoder, varmap)
    }

    fn ids(rows: &[&[u32]]) -> (Tensor, Tensor) {
        let max_len = rows.iter().map(|r| r.len()).max().unwrap();
        let mut ids = Vec::new();
        let mut mask = Vec::new();
        for row in rows {
            let mut padded = row.to_vec();
            let mut row_mask = vec![1u32; row.len()];
            padded.resize(max_len, 0);
            row_mask.resize(max_len, 0);
            ids.push(padded);
            mask.push(row_mask);
        }
        (
            Tensor::new(ids, &Device::Cpu).unwrap(),
            Tensor::new(mask, &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn test_output_shape() {
        let config = tiny_config(50);
        let (encoder, _vars) = random_encoder(&config, None);
        let (input_ids, mask) = ids(&[&[2, 7, 9, 3]]);

        let output = encoder.forward(&input_ids, &mask).unwrap();
        assert_eq!(output.dims(), &[1, 4, 16]);

        let cls = first_token(&output).unwrap();
        assert_eq!(cls.dims(), &[1, 16]);
    }

    #[test]
    fn test_padding_does_not_change_first_token() {
        let config = tiny_config(50);
        let (encoder, _vars) = random_encoder(&config, Some(&AdapterConfig::default()));

        let (alone_ids, alone_mask) = ids(&[&[2, 7, 3]]);
        let (batch_ids, batch_mask) = ids(&[&[2, 7, 3], &[2, 11, 12, 13, 14, 3]]);

        let alone = first_token(&encoder.forward(&alone_ids, &alone_mask).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let batched = first_token(&encoder.forward(&batch_ids, &batch_mask).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for (a, b) in alone[0].iter().zip(&batched[0]) {
            assert!((a - b).abs() < 1e-4, "Padding changed the first-token vector: {a} vs {b}");
        }
    }

    #[test]
    fn test_zeroed_adapter_matches_plain_encoder() {
        let config = tiny_config(50);
        let adapter_config = AdapterConfig::default();
        let (with_adapter, varmap) = random_encoder(&config, Some(&adapter_config));

        // Copy the base weights into a fresh encoder without adapters
        let base: std::collections::HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| !name.contains(".adapters."))
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let plain = BertEncoder::load(
            VarBuilder::from_tensors(base, DType::F32, &Device::Cpu),
            &config,
            None,
        )
        .unwrap();

        // Zero every up projection: the Pfeiffer residual path becomes the identity
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.contains(".adapter_up.") {
                var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
            }
        }

        let (input_ids, mask) = ids(&[&[2, 5, 6, 3]]);
        let a = with_adapter.forward(&input_ids, &mask).unwrap();
        let b = plain.forward(&input_ids, &mask).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "Zeroed adapter diverged from plain encoder by {diff}");
    }

    #[test]
    fn test_missing_adapter_weights_fail_to_load() {
        let config = tiny_config(50);
        let (_encoder, varmap) = random_encoder(&config, None);
        let base: std::collections::HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();

        let result = BertEncoder::load(
            VarBuilder::from_tensors(base, DType::F32, &Device::Cpu),
            &config,
            Some(&AdapterConfig::default()),
        );
        assert!(result.is_err());
    }
}
