use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};

use crate::adapter::UNetAdapterBuilder;
use crate::Result;

const LATENT_CHANNELS: usize = 4;

pub fn unet_config(sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
    let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![bc(320, None, 5), bc(640, Some(2), 10), bc(1280, Some(10), 20)],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection: true,
    }
}

/// Adapter layout matching [`unet_config`].
pub fn adapter_builder(config: &UNet2DConditionModelConfig) -> UNetAdapterBuilder {
    UNetAdapterBuilder::new(
        config.blocks.iter().map(|b| b.out_channels).collect(),
        config.cross_attention_dim,
    )
}

/// Builds the denoising backbone from flat parameter maps.
pub struct Backbone {
    config: UNet2DConditionModelConfig,
    use_flash_attn: bool,
    device: Device,
    dtype: DType,
}

impl Backbone {
    pub fn new(config: UNet2DConditionModelConfig, use_flash_attn: bool, device: &Device, dtype: DType) -> Self {
        Self {
            config,
            use_flash_attn,
            device: device.clone(),
            dtype,
        }
    }

    pub fn config(&self) -> &UNet2DConditionModelConfig {
        &self.config
    }

    pub fn load_params(&self, file: &Path) -> anyhow::Result<HashMap<String, Tensor>> {
        let params = candle_core::safetensors::load(file, &self.device)
            .with_context(|| format!("failed to read {}", file.display()))?;
        params
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_dtype(self.dtype)?)))
            .collect()
    }

    pub fn build(&self, params: HashMap<String, Tensor>) -> Result<UNet2DConditionModel> {
        let vb = VarBuilder::from_tensors(params, self.dtype, &self.device);
        Ok(UNet2DConditionModel::new(
            vb,
            LATENT_CHANNELS,
            LATENT_CHANNELS,
            self.use_flash_attn,
            self.config.clone(),
        )?)
    }
}
