use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::stable_diffusion::{
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
    StableDiffusionConfig,
};
use image::DynamicImage;
use log::{info, warn};

use super::encoder::LatentEncoder;
use crate::util::{image_to_tensor, tensor_to_image, NoiseSource};
use crate::Result;

/// Latent scaling factor of the SDXL autoencoder.
pub const VAE_SCALE: f64 = 0.13025;

/// Layout of the SDXL autoencoder.
fn autoencoder_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 4,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// The shared autoencoder. Decoding that overflows in half precision is
/// retried in f32 and the upcast model is kept until
/// [`Vae::restore_precision`] is called.
pub struct Vae {
    file: PathBuf,
    config: StableDiffusionConfig,
    model: AutoEncoderKL,
    encoder: LatentEncoder,
    device: Device,
    model_dtype: DType,
    dtype: DType,
}

impl Vae {
    pub fn load(
        file: PathBuf,
        sliced_attention_size: Option<usize>,
        device: &Device,
        dtype: DType,
    ) -> anyhow::Result<Self> {
        let config = StableDiffusionConfig::sdxl(sliced_attention_size, None, None);
        let model = config
            .build_vae(&file, device, dtype)
            .with_context(|| format!("failed to build the autoencoder from {}", file.display()))?;
        let encoder = LatentEncoder::load(&file, &autoencoder_config(), device, dtype)?;
        Ok(Self {
            file,
            config,
            model,
            encoder,
            device: device.clone(),
            model_dtype: dtype,
            dtype,
        })
    }

    pub fn is_upcast(&self) -> bool {
        self.dtype != self.model_dtype
    }

    fn rebuild(&mut self, dtype: DType) -> Result<()> {
        self.model = self.config.build_vae(&self.file, &self.device, dtype)?;
        self.dtype = dtype;
        Ok(())
    }

    pub fn restore_precision(&mut self) -> Result<()> {
        if self.is_upcast() {
            info!("restoring autoencoder to {:?}", self.model_dtype);
            self.rebuild(self.model_dtype)?;
        }
        Ok(())
    }

    /// Scaled latents `(1, 4, h/8, w/8)` of `image`, in `dtype`, sampled
    /// from the posterior with `noise`.
    pub fn encode(&self, image: &DynamicImage, dtype: DType, noise: &mut NoiseSource) -> Result<Tensor> {
        let pixels = image_to_tensor(image, &self.device, self.model_dtype)?;
        let latents = self.encoder.posterior(&pixels)?.sample(noise)?;
        Ok((latents * VAE_SCALE)?.to_dtype(dtype)?)
    }

    fn decode_raw(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents.to_dtype(self.dtype)? / VAE_SCALE)?;
        Ok(self.model.decode(&latents)?)
    }

    pub fn decode(&mut self, latents: &Tensor) -> Result<Vec<DynamicImage>> {
        let mut decoded = self.decode_raw(latents)?;
        if has_nan(&decoded)? && self.dtype != DType::F32 {
            warn!("autoencoder overflowed in {:?}, retrying in f32", self.dtype);
            self.rebuild(DType::F32)?;
            decoded = self.decode_raw(latents)?;
        }
        let images = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        (0..images.dim(0)?)
            .map(|i| tensor_to_image(&images.i(i)?))
            .collect()
    }
}

fn has_nan(t: &Tensor) -> Result<bool> {
    let nan = t.ne(t)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(nan > 0.)
}
