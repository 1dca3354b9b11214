//! The denoising loop shared by every generation mode.

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use log::debug;

use super::controlnet::ControlNet;
use crate::scheduler::Scheduler;
use crate::Result;

/// Control image steering every backbone evaluation.
pub struct ControlGuidance<'a> {
    pub model: &'a ControlNet,
    /// `(batch, 3, height, width)` in `[0, 1]`, batched like the model input.
    pub image: Tensor,
    pub scale: f64,
}

/// Latents to keep outside the mask while inpainting.
pub struct InpaintTarget {
    /// Clean scaled latents of the base image.
    pub init: Tensor,
    /// `(1, 1, h, w)`, 1 where the image is repainted.
    pub mask: Tensor,
    pub noise: Tensor,
}

/// Index of the first denoising step to run for an image-conditioned
/// generation. A strength of 1 runs the whole schedule, 0 runs none of it.
pub fn start_step(steps: usize, strength: f64) -> usize {
    steps - ((steps as f64 * strength) as usize).min(steps)
}

/// Position in `scheduler.timesteps()` where step `t_start` begins.
fn first_timestep(scheduler: &dyn Scheduler, t_start: usize) -> usize {
    t_start * scheduler.order()
}

/// Starting latents for image-conditioned modes: `init` noised to the first
/// timestep that will run.
pub fn noised_start(
    scheduler: &dyn Scheduler,
    init: &Tensor,
    noise: Tensor,
    t_start: usize,
) -> Result<Tensor> {
    match scheduler.timesteps().get(first_timestep(scheduler, t_start)) {
        Some(&timestep) => scheduler.add_noise(init, noise, timestep),
        None => Ok(init.clone()),
    }
}

/// Runs the schedule from step `t_start`. `text_embeddings` holds the
/// unconditional embedding first when `guidance_scale > 1`.
#[allow(clippy::too_many_arguments)]
pub fn denoise(
    unet: &UNet2DConditionModel,
    scheduler: &mut dyn Scheduler,
    mut latents: Tensor,
    text_embeddings: &Tensor,
    guidance_scale: f64,
    t_start: usize,
    inpaint: Option<&InpaintTarget>,
    control: Option<&ControlGuidance>,
) -> Result<Tensor> {
    let use_guidance = guidance_scale > 1.;
    let timesteps = scheduler.timesteps().to_vec();
    let first = first_timestep(scheduler, t_start);
    for (index, &timestep) in timesteps.iter().enumerate().skip(first) {
        let model_input = if use_guidance {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let model_input = scheduler.scale_model_input(model_input, timestep)?;
        let noise_pred = match control {
            Some(control) => {
                let residuals = control.model.forward(
                    &model_input,
                    timestep as f64,
                    text_embeddings,
                    &control.image,
                    control.scale,
                )?;
                unet.forward_with_additional_residuals(
                    &model_input,
                    timestep as f64,
                    text_embeddings,
                    Some(&residuals.down),
                    Some(&residuals.mid),
                )?
            }
            None => unet.forward(&model_input, timestep as f64, text_embeddings)?,
        };
        let noise_pred = if use_guidance {
            let chunks = noise_pred.chunk(2, 0)?;
            let (uncond, text) = (&chunks[0], &chunks[1]);
            (uncond + ((text - uncond)? * guidance_scale)?)?
        } else {
            noise_pred
        };
        latents = scheduler.step(&noise_pred, timestep, &latents)?;

        if let Some(target) = inpaint {
            let known = match timesteps.get(index + 1) {
                Some(&next) => scheduler.add_noise(&target.init, target.noise.clone(), next)?,
                None => target.init.clone(),
            };
            latents = blend(&latents, &known, &target.mask)?;
        }
        debug!("step {}/{} done", index + 1, timesteps.len());
    }
    Ok(latents)
}

/// `mask * generated + (1 - mask) * known`
pub fn blend(generated: &Tensor, known: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1., 1.)?;
    Ok((generated.broadcast_mul(mask)? + known.broadcast_mul(&keep)?)?)
}
