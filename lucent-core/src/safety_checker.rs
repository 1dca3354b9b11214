//! CLIP concept-embedding safety checker.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use candle_transformers::models::clip::{
    text_model::Activation,
    vision_model::{ClipVisionConfig, ClipVisionTransformer},
};
use image::{imageops::FilterType, DynamicImage};
use log::debug;

use crate::safety::SafetyClassifier;
use crate::Result;

const IMAGE_SIZE: usize = 224;
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];
const SPECIAL_CARE_ADJUSTMENT: f32 = 0.01;

fn vit_large_patch14() -> ClipVisionConfig {
    ClipVisionConfig {
        embed_dim: 1024,
        activation: Activation::QuickGelu,
        intermediate_size: 4096,
        num_hidden_layers: 24,
        num_attention_heads: 16,
        projection_dim: 768,
        num_channels: 3,
        image_size: IMAGE_SIZE,
        patch_size: 14,
    }
}

pub struct ClipSafetyChecker {
    vision_model: ClipVisionTransformer,
    visual_projection: Linear,
    concept_embeds: Tensor,
    concept_thresholds: Vec<f32>,
    special_care_embeds: Tensor,
    special_care_thresholds: Vec<f32>,
    device: Device,
    dtype: DType,
}

impl ClipSafetyChecker {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let config = vit_large_patch14();
        let vision_model = ClipVisionTransformer::new(vb.pp("vision_model").pp("vision_model"), &config)?;
        let visual_projection = linear_no_bias(
            config.embed_dim,
            config.projection_dim,
            vb.pp("visual_projection"),
        )?;
        let thresholds = |name: &str, n: usize| -> candle_core::Result<Vec<f32>> {
            vb.get(n, name)?.to_dtype(DType::F32)?.to_vec1()
        };
        Ok(Self {
            concept_embeds: vb.get((17, config.projection_dim), "concept_embeds")?,
            concept_thresholds: thresholds("concept_embeds_weights", 17)?,
            special_care_embeds: vb.get((3, config.projection_dim), "special_care_embeds")?,
            special_care_thresholds: thresholds("special_care_embeds_weights", 3)?,
            vision_model,
            visual_projection,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn load(file: &Path, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        let vb = match file.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => unsafe {
                VarBuilder::from_mmaped_safetensors(&[file], dtype, device)?
            },
            _ => VarBuilder::from_pth(file, dtype, device)?,
        };
        Self::new(vb).context("failed to build the safety checker")
    }

    fn preprocess(&self, images: &[DynamicImage]) -> Result<Tensor> {
        let mut pixels = Vec::with_capacity(images.len() * 3 * IMAGE_SIZE * IMAGE_SIZE);
        for image in images {
            let rgb = image
                .resize_to_fill(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::CatmullRom)
                .to_rgb8();
            for channel in 0..3 {
                pixels.extend(rgb.pixels().map(|p| {
                    (p.0[channel] as f32 / 255. - MEAN[channel]) / STD[channel]
                }));
            }
        }
        let tensor = Tensor::from_vec(pixels, (images.len(), 3, IMAGE_SIZE, IMAGE_SIZE), &Device::Cpu)?;
        Ok(tensor.to_device(&self.device)?.to_dtype(self.dtype)?)
    }

    /// One flag per image.
    pub fn check(&self, images: &[DynamicImage]) -> Result<Vec<bool>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let pooled = self.vision_model.forward(&self.preprocess(images)?)?;
        let image_embeds = normalize(&self.visual_projection.forward(&pooled)?)?;
        let special_cos = cosine_rows(&image_embeds, &self.special_care_embeds)?;
        let concept_cos = cosine_rows(&image_embeds, &self.concept_embeds)?;

        let flags = special_cos
            .iter()
            .zip(concept_cos.iter())
            .map(|(special, concept)| {
                let special_care = special
                    .iter()
                    .zip(&self.special_care_thresholds)
                    .any(|(score, threshold)| score - threshold > 0.);
                let adjustment = if special_care { SPECIAL_CARE_ADJUSTMENT } else { 0. };
                concept
                    .iter()
                    .zip(&self.concept_thresholds)
                    .any(|(score, threshold)| score - threshold + adjustment > 0.)
            })
            .collect();
        debug!("safety flags: {flags:?}");
        Ok(flags)
    }
}

fn normalize(t: &Tensor) -> candle_core::Result<Tensor> {
    let t = t.to_dtype(DType::F32)?;
    t.broadcast_div(&t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)
}

/// `(images, concepts)` cosine similarities. `image_embeds` is normalized.
fn cosine_rows(image_embeds: &Tensor, concepts: &Tensor) -> candle_core::Result<Vec<Vec<f32>>> {
    let concepts = normalize(concepts)?;
    image_embeds.matmul(&concepts.t()?)?.to_vec2()
}

impl SafetyClassifier for ClipSafetyChecker {
    fn classify(&mut self, images: Vec<DynamicImage>) -> Result<(Vec<DynamicImage>, Vec<bool>)> {
        let flags = self.check(&images)?;
        let images = images
            .into_iter()
            .zip(&flags)
            .map(|(image, &flagged)| {
                if flagged {
                    DynamicImage::new_rgb8(image.width(), image.height())
                } else {
                    image
                }
            })
            .collect();
        Ok((images, flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_rows_is_one() {
        let dev = Device::Cpu;
        let a = normalize(&Tensor::new(&[[3f32, 4.]], &dev).unwrap()).unwrap();
        let b = Tensor::new(&[[6f32, 8.], [0., 1.]], &dev).unwrap();
        let cos = cosine_rows(&a, &b).unwrap();
        assert!((cos[0][0] - 1.).abs() < 1e-6);
        assert!((cos[0][1] - 0.8).abs() < 1e-6);
    }
}
