//! SDXL ControlNet: a trainable copy of the backbone's encoder half whose
//! per-resolution activations are projected through zero-initialised 1x1
//! convolutions and added to the backbone's skip connections.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};

use crate::Result;

#[derive(Debug, Clone)]
pub struct ControlNetConfig {
    /// Layout of the encoder half; shared with the backbone it steers.
    pub backbone: UNet2DConditionModelConfig,
    pub in_channels: usize,
    pub conditioning_channels: usize,
    /// Widths of the control image embedding. Each step past the first
    /// halves the resolution.
    pub embedding_channels: Vec<usize>,
}

impl ControlNetConfig {
    pub fn sdxl(sliced_attention_size: Option<usize>) -> Self {
        Self {
            backbone: super::backbone::unet_config(sliced_attention_size),
            in_channels: 4,
            conditioning_channels: 3,
            embedding_channels: vec![16, 32, 96, 256],
        }
    }
}

fn conv(vs: VarBuilder, c_in: usize, c_out: usize, kernel: usize, stride: usize) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        stride,
        ..Default::default()
    };
    conv2d(c_in, c_out, kernel, cfg, vs)
}

/// Maps a pixel-space control image down to latent resolution.
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(vs: VarBuilder, conditioning_channels: usize, channels: &[usize], out_channels: usize) -> candle_core::Result<Self> {
        let conv_in = conv(vs.pp("conv_in"), conditioning_channels, channels[0], 3, 1)?;
        let vs_b = vs.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * channels.len());
        for (i, pair) in channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            blocks.push(conv(vs_b.pp(2 * i), c_in, c_in, 3, 1)?);
            blocks.push(conv(vs_b.pp(2 * i + 1), c_in, c_out, 3, 2)?);
        }
        let last = channels[channels.len() - 1];
        let conv_out = conv(vs.pp("conv_out"), last, out_channels, 3, 1)?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

/// Residuals for the backbone: one per skip connection, plus the middle.
#[derive(Debug)]
pub struct ControlResiduals {
    pub down: Vec<Tensor>,
    pub mid: Tensor,
}

pub struct ControlNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    down_projections: Vec<Conv2d>,
    mid_block: UNetMidBlock2DCrossAttn,
    mid_projection: Conv2d,
}

impl ControlNet {
    pub fn new(vs: VarBuilder, use_flash_attn: bool, config: &ControlNetConfig) -> Result<Self> {
        let unet = &config.backbone;
        let n_blocks = unet.blocks.len();
        let b_channels = unet.blocks[0].out_channels;
        let bl_channels = unet.blocks[n_blocks - 1].out_channels;
        let time_embed_dim = b_channels * 4;

        let conv_in = conv(vs.pp("conv_in"), config.in_channels, b_channels, 3, 1)?;
        let time_proj = Timesteps::new(b_channels, unet.flip_sin_to_cos, unet.freq_shift);
        let time_embedding = TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding = ConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            config.conditioning_channels,
            &config.embedding_channels,
            b_channels,
        )?;

        let vs_db = vs.pp("down_blocks");
        let vs_proj = vs.pp("controlnet_down_blocks");
        let mut down_projections = vec![conv(vs_proj.pp(0), b_channels, b_channels, 1, 1)?];
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let BlockConfig {
                out_channels,
                use_cross_attn,
                attention_head_dim,
            } = unet.blocks[i];
            let sliced_attention_size = match unet.sliced_attention_size {
                Some(0) => Some(attention_head_dim / 2),
                other => other,
            };
            let in_channels = if i > 0 { unet.blocks[i - 1].out_channels } else { b_channels };
            let add_downsample = i < n_blocks - 1;
            let db_cfg = DownBlock2DConfig {
                num_layers: unet.layers_per_block,
                resnet_eps: unet.norm_eps,
                resnet_groups: unet.norm_num_groups,
                add_downsample,
                downsample_padding: unet.downsample_padding,
                ..Default::default()
            };
            let block = match use_cross_attn {
                Some(transformer_layers_per_block) => {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: unet.cross_attention_dim,
                        sliced_attention_size,
                        use_linear_projection: unet.use_linear_projection,
                        transformer_layers_per_block,
                    };
                    DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                        vs_db.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        cfg,
                    )?)
                }
                None => DownBlock::Basic(DownBlock2D::new(
                    vs_db.pp(i),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    db_cfg,
                )?),
            };
            down_blocks.push(block);

            let outputs = unet.layers_per_block + usize::from(add_downsample);
            for _ in 0..outputs {
                let index = down_projections.len();
                down_projections.push(conv(vs_proj.pp(index), out_channels, out_channels, 1, 1)?);
            }
        }

        let last = &unet.blocks[n_blocks - 1];
        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: unet.norm_eps,
            output_scale_factor: unet.mid_block_scale_factor,
            cross_attn_dim: unet.cross_attention_dim,
            attn_num_head_channels: last.attention_head_dim,
            resnet_groups: Some(unet.norm_num_groups),
            use_linear_projection: unet.use_linear_projection,
            transformer_layers_per_block: last.use_cross_attn.unwrap_or(1),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;
        let mid_projection = conv(vs.pp("controlnet_mid_block"), bl_channels, bl_channels, 1, 1)?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            down_projections,
            mid_block,
            mid_projection,
        })
    }

    pub fn load(file: &Path, config: &ControlNetConfig, use_flash_attn: bool, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let vs = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
        Self::new(vs, use_flash_attn, config)
            .with_context(|| format!("failed to build the controlnet from {}", file.display()))
    }

    /// `control` is the control image in `[0, 1]` at pixel resolution, with
    /// the same batch size as `xs`. Every residual is multiplied by
    /// `conditioning_scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: &Tensor,
        conditioning_scale: f64,
    ) -> Result<ControlResiduals> {
        let (bsize, _, _, _) = xs.dims4()?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let control = self.cond_embedding.forward(&control.to_dtype(xs.dtype())?)?;
        let mut xs = (self.conv_in.forward(xs)? + control)?;

        let mut samples = vec![xs.clone()];
        for block in &self.down_blocks {
            let (next, res_xs) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?,
            };
            samples.extend(res_xs);
            xs = next;
        }
        let mid = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down = samples
            .iter()
            .zip(&self.down_projections)
            .map(|(sample, projection)| Ok((projection.forward(sample)? * conditioning_scale)?))
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.mid_projection.forward(&mid)? * conditioning_scale)?;
        Ok(ControlResiduals { down, mid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ControlNetConfig {
        let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        let mut backbone = super::super::backbone::unet_config(None);
        backbone.blocks = vec![bc(32, None, 4), bc(64, Some(1), 4)];
        backbone.cross_attention_dim = 16;
        backbone.norm_num_groups = 8;
        ControlNetConfig {
            backbone,
            in_channels: 4,
            conditioning_channels: 3,
            embedding_channels: vec![4, 8, 8, 8],
        }
    }

    #[test]
    fn one_projection_per_skip_connection() {
        let vs = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let config = tiny();
        let net = ControlNet::new(vs, false, &config).unwrap();
        // conv_in, two resnets and a downsampler, then two resnets
        assert_eq!(net.down_projections.len(), 6);
        assert_eq!(net.cond_embedding.blocks.len(), 6);
    }

    #[test]
    fn residuals_match_the_backbone_skip_shapes() {
        let device = Device::Cpu;
        let vs = VarBuilder::zeros(DType::F32, &device);
        let net = ControlNet::new(vs, false, &tiny()).unwrap();

        let latents = Tensor::ones((2, 4, 8, 8), DType::F32, &device).unwrap();
        let text = Tensor::ones((2, 3, 16), DType::F32, &device).unwrap();
        let control = Tensor::ones((2, 3, 64, 64), DType::F32, &device).unwrap();
        let residuals = net.forward(&latents, 500., &text, &control, 0.5).unwrap();

        let shapes: Vec<Vec<usize>> = residuals.down.iter().map(|t| t.dims().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![2, 32, 8, 8],
                vec![2, 32, 8, 8],
                vec![2, 32, 8, 8],
                vec![2, 32, 4, 4],
                vec![2, 64, 4, 4],
                vec![2, 64, 4, 4],
            ]
        );
        assert_eq!(residuals.mid.dims(), &[2, 64, 4, 4]);
        // Untrained projections contribute nothing.
        let total = residuals.mid.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.);
    }
}
