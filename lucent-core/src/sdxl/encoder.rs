//! The autoencoder's encoder half, returning the latent posterior itself so
//! that sampling from it can be driven by the request seed.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    unet_2d_blocks::{DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig},
    vae::AutoEncoderKLConfig,
};

use crate::util::NoiseSource;
use crate::Result;

const EPS: f64 = 1e-6;

/// Diagonal Gaussian over latents, held in f32.
pub struct Posterior {
    pub mean: Tensor,
    pub std: Tensor,
}

impl Posterior {
    fn new(parameters: &Tensor) -> Result<Self> {
        let chunks = parameters.to_dtype(DType::F32)?.chunk(2, 1)?;
        let logvar = chunks[1].clamp(-30f32, 20f32)?;
        Ok(Self {
            mean: chunks[0].clone(),
            std: (logvar * 0.5)?.exp()?,
        })
    }

    pub fn sample(&self, noise: &mut NoiseSource) -> Result<Tensor> {
        let eps = noise.randn(self.mean.dims(), self.mean.dtype(), self.mean.device())?;
        Ok((&self.mean + (&self.std * eps)?)?)
    }
}

pub struct LatentEncoder {
    conv_in: Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    quant_conv: Option<Conv2d>,
}

impl LatentEncoder {
    /// `vs` is rooted at the autoencoder, i.e. holds `encoder.*` and `quant_conv.*`.
    pub fn new(vs: VarBuilder, config: &AutoEncoderKLConfig) -> Result<Self> {
        let channels = &config.block_out_channels;
        let groups = config.norm_num_groups;
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let vs_enc = vs.pp("encoder");
        let conv_in = conv2d(3, channels[0], 3, padded, vs_enc.pp("conv_in"))?;

        let vs_down = vs_enc.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(channels.len());
        for (index, &out_channels) in channels.iter().enumerate() {
            let in_channels = if index > 0 { channels[index - 1] } else { channels[0] };
            let cfg = DownEncoderBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: EPS,
                resnet_groups: groups,
                add_downsample: index + 1 < channels.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            down_blocks.push(DownEncoderBlock2D::new(vs_down.pp(index), in_channels, out_channels, cfg)?);
        }

        let last = channels[channels.len() - 1];
        let mid_cfg = UNetMidBlock2DConfig {
            resnet_eps: EPS,
            output_scale_factor: 1.,
            attn_num_head_channels: None,
            resnet_groups: Some(groups),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(vs_enc.pp("mid_block"), last, None, mid_cfg)?;
        let conv_norm_out = group_norm(groups, last, EPS, vs_enc.pp("conv_norm_out"))?;
        let moments = 2 * config.latent_channels;
        let conv_out = conv2d(last, moments, 3, padded, vs_enc.pp("conv_out"))?;
        let quant_conv = if config.use_quant_conv {
            Some(conv2d(moments, moments, 1, Default::default(), vs.pp("quant_conv"))?)
        } else {
            None
        };
        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
        })
    }

    pub fn load(file: &Path, config: &AutoEncoderKLConfig, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let vs = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
        Self::new(vs, config).with_context(|| format!("failed to build the image encoder from {}", file.display()))
    }

    /// `pixels` is `(batch, 3, h, w)` in `[-1, 1]`.
    pub fn posterior(&self, pixels: &Tensor) -> Result<Posterior> {
        let mut xs = self.conv_in.forward(pixels)?;
        for block in &self.down_blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.mid_block.forward(&xs, None)?;
        let xs = self.conv_norm_out.forward(&xs)?.silu()?;
        let mut moments = self.conv_out.forward(&xs)?;
        if let Some(quant_conv) = &self.quant_conv {
            moments = quant_conv.forward(&moments)?;
        }
        Posterior::new(&moments)
    }
}
