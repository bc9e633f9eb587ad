use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Activation, VarBuilder};
use candle_transformers::models::with_tracing::{LayerNorm, Linear, linear};

use crate::config::{AdapterConfig, ResidualSource};

/// Role name the loaded adapter is bound and activated under.
pub const ADAPTER_ROLE: &str = "query";

/// Bottleneck adapter applied after a transformer sub-layer.
///
/// Weights live at `{sub_layer}.adapters.{role}.adapter_down.0` (down projection,
/// followed by the non-linearity) and `{sub_layer}.adapters.{role}.adapter_up`.
pub struct BottleneckAdapter {
    down: Linear,
    up: Linear,
    activation: Activation,
    scaling: f64,
    residual: ResidualSource,
    original_ln_before: bool,
    original_ln_after: bool,
}

impl BottleneckAdapter {
    pub fn load(
        vb: VarBuilder,
        hidden_size: usize,
        layer: usize,
        config: &AdapterConfig,
    ) -> Result<Self> {
        let factor = config.reduction_factor.for_layer(layer)?;
        let bottleneck = ((hidden_size as f64) / factor) as usize;

        let down = linear(hidden_size, bottleneck, vb.pp("adapter_down").pp("0"))?;
        let up = linear(bottleneck, hidden_size, vb.pp("adapter_up"))?;

        Ok(Self {
            down,
            up,
            activation: config.activation()?,
            scaling: config.scaling_factor()?,
            residual: config.residual_before_ln,
            original_ln_before: config.original_ln_before,
            original_ln_after: config.original_ln_after,
        })
    }

    /// Run the adapter around a sub-layer's residual LayerNorm.
    ///
    /// * `hidden` - sub-layer output after its dense projection
    /// * `input` - sub-layer input (the residual stream)
    /// * `layer_norm` - the sub-layer's own LayerNorm
    pub fn forward(&self, hidden: &Tensor, input: &Tensor, layer_norm: &LayerNorm) -> Result<Tensor> {
        let (adapter_input, residual) = if self.original_ln_before {
            let added = (hidden + input)?;
            let normed = layer_norm.forward(&added)?;
            let residual = match self.residual {
                ResidualSource::BeforeLayerNorm => hidden.clone(),
                ResidualSource::PostAdd => added,
                ResidualSource::AfterLayerNorm => normed.clone(),
            };
            (normed, residual)
        } else {
            (hidden.clone(), hidden.clone())
        };

        let down = self.activation.forward(&self.down.forward(&adapter_input)?)?;
        let mut up = self.up.forward(&down)?;
        if self.scaling != 1.0 {
            up = (up * self.scaling)?;
        }

        let output = (up + residual)?;
        if self.original_ln_after {
            Ok(layer_norm.forward(&(output + input)?)?)
        } else {
            Ok(output)
        }
    }
}
