//! Reconstruction of low-rank attention adapters from a flat tensor file.
//!
//! Adapter entries are named after the attention processor they replace, e.g.
//! `down_blocks.1.attentions.0.transformer_blocks.0.attn2.processor.to_k_lora.up.weight`.
//! The layer prefix decides the backbone stage and therefore the channel width
//! the adapter has to match. This mapping is tied to one backbone layout, so it
//! lives behind [`AdapterBuilder`].

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Tensor};

use crate::{Error, Result};

pub trait AdapterBuilder: Send + Sync {
    /// Groups `tensors` by attention processor and validates every projection
    /// against the backbone layer it targets.
    fn build(&self, identifier: &str, tensors: HashMap<String, Tensor>) -> Result<Vec<AttentionAdapter>>;
}

/// Position of an attention layer within the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Down(usize),
    Mid,
    Up(usize),
}

impl Stage {
    pub fn parse(layer: &str) -> Option<Self> {
        let block_index = |rest: &str| rest.split('.').next()?.parse::<usize>().ok();
        if let Some(rest) = layer.strip_prefix("down_blocks.") {
            block_index(rest).map(Self::Down)
        } else if layer.starts_with("mid_block.") {
            Some(Self::Mid)
        } else if let Some(rest) = layer.strip_prefix("up_blocks.") {
            block_index(rest).map(Self::Up)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Projection {
    Query,
    Key,
    Value,
    Out,
}

impl Projection {
    fn from_adapter_name(name: &str) -> Option<Self> {
        match name {
            "to_q_lora" => Some(Self::Query),
            "to_k_lora" => Some(Self::Key),
            "to_v_lora" => Some(Self::Value),
            "to_out_lora" => Some(Self::Out),
            _ => None,
        }
    }

    /// Name of the backbone weight this projection adapts.
    pub fn weight_name(self) -> &'static str {
        match self {
            Self::Query => "to_q.weight",
            Self::Key => "to_k.weight",
            Self::Value => "to_v.weight",
            Self::Out => "to_out.0.weight",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoraProjection {
    pub projection: Projection,
    /// `(out_features, rank)`
    pub up: Tensor,
    /// `(rank, in_features)`
    pub down: Tensor,
}

/// One attention processor's worth of adapter weights.
#[derive(Debug, Clone)]
pub struct AttentionAdapter {
    /// Attention module path, e.g. `mid_block.attentions.0.transformer_blocks.0.attn1`.
    pub layer: String,
    pub stage: Stage,
    pub hidden_size: usize,
    /// `None` for self-attention.
    pub cross_attention_dim: Option<usize>,
    pub rank: usize,
    pub projections: Vec<LoraProjection>,
}

impl AttentionAdapter {
    /// Folds the adapter into `weights` as `W + scale * up @ down`.
    pub fn merge_into(
        &self,
        identifier: &str,
        weights: &mut HashMap<String, Tensor>,
        scale: f64,
    ) -> Result<()> {
        for p in &self.projections {
            let key = format!("{}.{}", self.layer, p.projection.weight_name());
            let base = weights
                .get(&key)
                .ok_or_else(|| Error::UnrecognizedLayer(key.clone()))?;
            let device = base.device();
            let up = p.up.to_device(device)?.to_dtype(DType::F32)?;
            let down = p.down.to_device(device)?.to_dtype(DType::F32)?;
            let delta = up.matmul(&down)?;
            if delta.dims() != base.dims() {
                return Err(Error::invalid_bundle(
                    identifier,
                    format!(
                        "{key} has shape {:?} but the adapter produces {:?}",
                        base.dims(),
                        delta.dims()
                    ),
                ));
            }
            let merged = (base.to_dtype(DType::F32)? + delta.affine(scale, 0.)?)?
                .to_dtype(base.dtype())?;
            weights.insert(key, merged);
        }
        Ok(())
    }
}

/// Adapter layout of the UNet attention processors.
#[derive(Debug, Clone)]
pub struct UNetAdapterBuilder {
    block_out_channels: Vec<usize>,
    cross_attention_dim: usize,
}

impl UNetAdapterBuilder {
    pub fn new(block_out_channels: Vec<usize>, cross_attention_dim: usize) -> Self {
        Self {
            block_out_channels,
            cross_attention_dim,
        }
    }

    pub fn sdxl() -> Self {
        Self::new(vec![320, 640, 1280], 2048)
    }

    pub fn hidden_size(&self, stage: Stage) -> Option<usize> {
        match stage {
            Stage::Down(i) => self.block_out_channels.get(i).copied(),
            Stage::Mid => self.block_out_channels.last().copied(),
            Stage::Up(i) => self.block_out_channels.iter().rev().nth(i).copied(),
        }
    }
}

#[derive(Default)]
struct Pair {
    up: Option<Tensor>,
    down: Option<Tensor>,
}

/// Splits `<layer>.processor.<projection>_lora.<up|down>.weight`.
fn split_key(key: &str) -> Option<(&str, Projection, bool)> {
    let (rest, is_up) = if let Some(rest) = key.strip_suffix(".up.weight") {
        (rest, true)
    } else {
        (key.strip_suffix(".down.weight")?, false)
    };
    let (processor, projection) = rest.rsplit_once('.')?;
    let layer = processor.strip_suffix(".processor")?;
    Some((layer, Projection::from_adapter_name(projection)?, is_up))
}

impl AdapterBuilder for UNetAdapterBuilder {
    fn build(&self, identifier: &str, tensors: HashMap<String, Tensor>) -> Result<Vec<AttentionAdapter>> {
        let mut grouped: BTreeMap<String, BTreeMap<Projection, Pair>> = BTreeMap::new();
        for (key, tensor) in tensors {
            let (layer, projection, is_up) =
                split_key(&key).ok_or_else(|| Error::UnrecognizedLayer(key.clone()))?;
            let pair = grouped
                .entry(layer.to_string())
                .or_default()
                .entry(projection)
                .or_default();
            if is_up {
                pair.up = Some(tensor);
            } else {
                pair.down = Some(tensor);
            }
        }

        let mut adapters = Vec::with_capacity(grouped.len());
        for (layer, pairs) in grouped {
            let stage = Stage::parse(&layer).ok_or_else(|| Error::UnrecognizedLayer(layer.clone()))?;
            let hidden_size = self
                .hidden_size(stage)
                .ok_or_else(|| Error::UnrecognizedLayer(layer.clone()))?;
            let cross_attention_dim =
                (!layer.ends_with("attn1")).then_some(self.cross_attention_dim);

            let mut rank = None;
            let mut projections = Vec::with_capacity(pairs.len());
            for (projection, pair) in pairs {
                let (Some(up), Some(down)) = (pair.up, pair.down) else {
                    return Err(Error::invalid_bundle(
                        identifier,
                        format!("{layer} {projection:?} is missing its up or down weight"),
                    ));
                };
                // up is (out_features, rank)
                let r = *rank.get_or_insert(up.dims().get(1).copied().unwrap_or(0));
                let in_features = match projection {
                    Projection::Key | Projection::Value => cross_attention_dim.unwrap_or(hidden_size),
                    Projection::Query | Projection::Out => hidden_size,
                };
                if up.dims() != [hidden_size, r] || down.dims() != [r, in_features] {
                    return Err(Error::invalid_bundle(
                        identifier,
                        format!(
                            "{layer} {projection:?} expects up {:?} and down {:?}, got {:?} and {:?}",
                            [hidden_size, r],
                            [r, in_features],
                            up.dims(),
                            down.dims()
                        ),
                    ));
                }
                projections.push(LoraProjection { projection, up, down });
            }
            adapters.push(AttentionAdapter {
                layer,
                stage,
                hidden_size,
                cross_attention_dim,
                rank: rank.unwrap_or(0),
                projections,
            });
        }
        Ok(adapters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn builder() -> UNetAdapterBuilder {
        UNetAdapterBuilder::new(vec![8, 16, 32], 24)
    }

    fn lora(layer: &str, projection: &str, out: usize, rank: usize, input: usize) -> Vec<(String, Tensor)> {
        let device = Device::Cpu;
        vec![
            (
                format!("{layer}.processor.{projection}.up.weight"),
                Tensor::ones((out, rank), DType::F32, &device).unwrap(),
            ),
            (
                format!("{layer}.processor.{projection}.down.weight"),
                Tensor::ones((rank, input), DType::F32, &device).unwrap(),
            ),
        ]
    }

    #[test]
    fn stage_maps_to_channel_width() {
        let b = builder();
        let width = |layer: &str| b.hidden_size(Stage::parse(layer).unwrap());
        assert_eq!(width("down_blocks.1.attentions.0.transformer_blocks.0.attn1"), Some(16));
        assert_eq!(width("mid_block.attentions.0.transformer_blocks.3.attn2"), Some(32));
        assert_eq!(width("up_blocks.0.attentions.2.transformer_blocks.0.attn1"), Some(32));
        assert_eq!(width("up_blocks.2.attentions.0.transformer_blocks.0.attn1"), Some(8));
        assert_eq!(width("down_blocks.7.attentions.0.attn1"), None);
        assert_eq!(Stage::parse("text_model.encoder.layers.0.self_attn"), None);
        assert_eq!(Stage::parse("up_blocks.x.attentions"), None);
    }

    #[test]
    fn infers_rank_and_cross_attention_width() {
        let layer = "down_blocks.1.attentions.0.transformer_blocks.0.attn2";
        let tensors: HashMap<_, _> = [
            lora(layer, "to_q_lora", 16, 4, 16),
            lora(layer, "to_k_lora", 16, 4, 24),
            lora(layer, "to_v_lora", 16, 4, 24),
            lora(layer, "to_out_lora", 16, 4, 16),
        ]
        .into_iter()
        .flatten()
        .collect();

        let adapters = builder().build("b", tensors).unwrap();
        assert_eq!(adapters.len(), 1);
        let adapter = &adapters[0];
        assert_eq!(adapter.layer, layer);
        assert_eq!(adapter.stage, Stage::Down(1));
        assert_eq!(adapter.rank, 4);
        assert_eq!(adapter.hidden_size, 16);
        assert_eq!(adapter.cross_attention_dim, Some(24));
        assert_eq!(adapter.projections.len(), 4);
    }

    #[test]
    fn self_attention_uses_hidden_width_for_keys() {
        let layer = "up_blocks.1.attentions.0.transformer_blocks.0.attn1";
        let tensors: HashMap<_, _> = lora(layer, "to_k_lora", 16, 2, 24).into_iter().collect();
        assert!(matches!(
            builder().build("b", tensors),
            Err(Error::InvalidBundle { .. })
        ));

        let tensors: HashMap<_, _> = lora(layer, "to_k_lora", 16, 2, 16).into_iter().collect();
        let adapters = builder().build("b", tensors).unwrap();
        assert_eq!(adapters[0].cross_attention_dim, None);
        assert_eq!(adapters[0].rank, 2);
    }

    #[test]
    fn unknown_layer_is_fatal() {
        let tensors: HashMap<_, _> = lora("text_model.layers.0.attn1", "to_q_lora", 16, 2, 16)
            .into_iter()
            .collect();
        assert!(matches!(
            builder().build("b", tensors),
            Err(Error::UnrecognizedLayer(_))
        ));

        let tensors = HashMap::from([(
            "lora_unet_down_blocks_0.alpha".to_string(),
            Tensor::ones(1, DType::F32, &Device::Cpu).unwrap(),
        )]);
        assert!(matches!(
            builder().build("b", tensors),
            Err(Error::UnrecognizedLayer(_))
        ));
    }

    #[test]
    fn merge_adds_scaled_low_rank_product() {
        let layer = "mid_block.attentions.0.transformer_blocks.0.attn1";
        let tensors: HashMap<_, _> = lora(layer, "to_q_lora", 32, 3, 32).into_iter().collect();
        let adapters = builder().build("b", tensors).unwrap();

        let key = format!("{layer}.to_q.weight");
        let mut weights = HashMap::from([(
            key.clone(),
            Tensor::ones((32, 32), DType::F32, &Device::Cpu).unwrap(),
        )]);
        adapters[0].merge_into("b", &mut weights, 0.5).unwrap();
        let merged = weights[&key].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(merged.iter().all(|&v| (v - 2.5).abs() < 1e-6));
    }

    #[test]
    fn merge_requires_the_target_weight() {
        let layer = "mid_block.attentions.0.transformer_blocks.0.attn1";
        let tensors: HashMap<_, _> = lora(layer, "to_out_lora", 32, 1, 32).into_iter().collect();
        let adapters = builder().build("b", tensors).unwrap();
        let mut weights = HashMap::new();
        assert!(matches!(
            adapters[0].merge_into("b", &mut weights, 1.0),
            Err(Error::UnrecognizedLayer(_))
        ));
    }
}
