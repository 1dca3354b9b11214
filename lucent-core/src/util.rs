use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use log::{info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{DeviceMap, Error, Result};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// A fresh 16-bit seed, for requests that do not pin one.
pub fn random_seed() -> u64 {
    let seed = rand::thread_rng().gen::<u16>() as u64;
    info!("using seed: {seed}");
    seed
}

/// Converts a u8 tensor with shape (3, height, width) into an image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(candle_core::Error::Msg(format!(
            "tensor_to_image expects an image with 3 channels, got {channels}"
        ))
        .into());
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::Msg("error converting tensor to image buffer".into()))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1],
/// resized so both sides are multiples of 8.
pub fn image_to_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = (image.width() - image.width() % 8, image.height() - image.height() % 8);
    if width == 0 || height == 0 {
        return Err(Error::InvalidRequest(format!(
            "image of {}x{} is too small",
            image.width(),
            image.height()
        )));
    }
    let image = image
        .resize_exact(width, height, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(image, (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}

/// Converts an inpainting mask into a (1, 1, height, width) tensor in [0, 1]
/// at latent resolution. Values of 1 mark the area to repaint.
pub fn mask_to_latent_tensor(
    mask: &DynamicImage,
    latent_width: usize,
    latent_height: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mask = mask
        .resize_exact(latent_width as u32, latent_height as u32, FilterType::Triangle)
        .to_luma8()
        .into_raw();
    let tensor = Tensor::from_vec(mask, (1, 1, latent_height, latent_width), &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .ge(0.5)?
        .to_dtype(DType::F32)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}

/// Seeded standard-normal sampler. Host-side so that a seed yields the same
/// noise on every device.
pub struct NoiseSource {
    rng: StdRng,
    spare: Option<f64>,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            spare: None,
        }
    }

    /// Box-Muller transform; each pair of uniforms yields two samples.
    fn sample(&mut self) -> f64 {
        if let Some(spare) = self.spare.take() {
            return spare;
        }
        let u1 = 1.0 - self.rng.gen::<f64>();
        let u2 = self.rng.gen::<f64>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some(radius * theta.sin());
        radius * theta.cos()
    }

    pub fn randn(&mut self, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
        let count = dims.iter().product();
        let values: Vec<f32> = (0..count).map(|_| self.sample() as f32).collect();
        Ok(Tensor::from_vec(values, dims, &Device::Cpu)?
            .to_device(device)?
            .to_dtype(dtype)?)
    }
}
