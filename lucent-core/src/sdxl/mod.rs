//! SDXL pipeline family on candle.
//!
//! Every pipeline handle points at one [`SharedComponents`]: merging a
//! fine-tune or upcasting the autoencoder through one handle is seen by all
//! of them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use hf_hub::api::tokio::Api;
use image::{imageops::FilterType, DynamicImage};
use log::info;

mod backbone;
mod clip;
mod controlnet;
mod encoder;
mod fuse;
mod sampling;
mod text;
mod vae;

use crate::adapter::{AdapterBuilder, AttentionAdapter, UNetAdapterBuilder};
use crate::bundle::TokenMap;
use crate::dispatch::{Mode, ModeArgs};
use crate::files::{get_variant, variants, ModelSource};
use crate::finetune::{merge_adapters, overlay_backbone, BackbonePatch, FineTunePatch, FineTuneTarget};
use crate::pipeline::{GenerationJob, ModelRepository, Pipeline, PipelineKind};
use crate::util::{image_to_tensor, mask_to_latent_tensor, select_best_device, NoiseSource};
use crate::{Error, Loader, Result, SchedulerKind, Settings};

use backbone::Backbone;
use clip::ClipTextConfig;
use controlnet::{ControlNet, ControlNetConfig};
use sampling::{denoise, noised_start, start_step, ControlGuidance, InpaintTarget};
use text::{encode_prompt, TextEncoder};
use vae::Vae;

const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const TOKENIZER_2_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const LCM_LORA_FILE: &str = "pytorch_lora_weights.safetensors";
const VAE_FILE: &str = "diffusion_pytorch_model.safetensors";
const CONTROLNET_SINGLE_FILE: &str = "OpenPoseXL2.safetensors";

struct LoadedBundle {
    identifier: String,
    token_map: TokenMap,
    /// Kept to re-merge at a different scale. Empty for full backbones.
    adapters: Vec<AttentionAdapter>,
    adapter_scale: f64,
}

enum Conditioning {
    Text,
    Image {
        init: Tensor,
        strength: f64,
    },
    Inpaint {
        init: Tensor,
        mask: Tensor,
        strength: f64,
    },
    /// Text-to-image steered by a control map.
    Control {
        control: Tensor,
        scale: f64,
    },
    /// Image-to-image steered by a control map.
    ControlImage {
        init: Tensor,
        strength: f64,
        control: Tensor,
        scale: f64,
    },
}

impl Conditioning {
    fn control(&self) -> Option<(&Tensor, f64)> {
        match self {
            Self::Control { control, scale } | Self::ControlImage { control, scale, .. } => Some((control, *scale)),
            _ => None,
        }
    }
}

pub struct SharedComponents {
    device: Device,
    dtype: DType,
    backbone: Backbone,
    /// Pretrained backbone parameters with the LCM adapter fused in.
    pristine_unet: HashMap<String, Tensor>,
    unet: UNet2DConditionModel,
    encoders: Vec<TextEncoder>,
    vae: Vae,
    controlnet: Option<ControlNet>,
    loaded: Option<LoadedBundle>,
    mismatch_warn_ratio: f64,
}

impl SharedComponents {
    fn commit(&mut self, patch: FineTunePatch, adapter_scale: f64) -> Result<()> {
        let FineTunePatch {
            identifier,
            backbone,
            embeddings,
            token_map,
        } = patch;

        let mut params = self.pristine_unet.clone();
        let adapters = match backbone {
            BackbonePatch::Full(incoming) => {
                let stats = overlay_backbone(&identifier, &mut params, incoming)?;
                stats.report(&identifier, self.mismatch_warn_ratio);
                Vec::new()
            }
            BackbonePatch::Adapters(adapters) => {
                merge_adapters(&identifier, &mut params, &adapters, adapter_scale)?;
                adapters
            }
        };

        let tokens = embeddings.tokens();
        let staged = self
            .encoders
            .iter()
            .enumerate()
            .map(|(index, encoder)| {
                let rows = embeddings.for_encoder(index).ok_or_else(|| {
                    Error::invalid_bundle(&identifier, format!("no embeddings for text encoder {index}"))
                })?;
                encoder.stage(&identifier, &tokens, rows)
            })
            .collect::<Result<Vec<_>>>()?;
        let unet = self.backbone.build(params)?;

        self.unet = unet;
        for (encoder, staged) in self.encoders.iter_mut().zip(staged) {
            encoder.commit(staged);
        }
        info!("loaded {identifier} with {} special tokens", tokens.len());
        self.loaded = Some(LoadedBundle {
            identifier,
            token_map,
            adapters,
            adapter_scale,
        });
        Ok(())
    }

    fn set_adapter_scale(&mut self, adapter_scale: f64) -> Result<()> {
        let Some(loaded) = self.loaded.as_mut() else {
            return Ok(());
        };
        if loaded.adapters.is_empty() || loaded.adapter_scale == adapter_scale {
            return Ok(());
        }
        info!(
            "re-merging {} at scale {adapter_scale} (was {})",
            loaded.identifier, loaded.adapter_scale
        );
        let mut params = self.pristine_unet.clone();
        merge_adapters(&loaded.identifier, &mut params, &loaded.adapters, adapter_scale)?;
        self.unet = self.backbone.build(params)?;
        loaded.adapter_scale = adapter_scale;
        Ok(())
    }

    fn text_embeddings(&self, prompt: &str, negative_prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let cond = encode_prompt(&self.encoders, prompt)?;
        let embeddings = if use_guidance {
            let uncond = encode_prompt(&self.encoders, negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    /// Control map as `(1, 3, 8 * latent_h, 8 * latent_w)` in `[0, 1]`.
    fn control_tensor(&self, image: &DynamicImage, (latent_h, latent_w): (usize, usize)) -> Result<Tensor> {
        let image = image.resize_exact(8 * latent_w as u32, 8 * latent_h as u32, FilterType::CatmullRom);
        let pixels = image_to_tensor(&image, &self.device, DType::F32)?;
        Ok(pixels.affine(0.5, 0.5)?.to_dtype(self.dtype)?)
    }

    fn conditioning(&self, args: &ModeArgs, noise: &mut NoiseSource) -> Result<(Conditioning, (usize, usize))> {
        let latent_size = |init: &Tensor| -> Result<(usize, usize)> {
            let (_, _, h, w) = init.dims4()?;
            Ok((h, w))
        };
        match args {
            ModeArgs::Txt2Img { width, height } => Ok((Conditioning::Text, (height / 8, width / 8))),
            ModeArgs::Img2Img { image, strength } => {
                let init = self.vae.encode(image, self.dtype, noise)?;
                let size = latent_size(&init)?;
                Ok((Conditioning::Image { init, strength: *strength }, size))
            }
            ModeArgs::Inpaint {
                image,
                mask,
                strength,
                ..
            } => {
                let init = self.vae.encode(image, self.dtype, noise)?;
                let (h, w) = latent_size(&init)?;
                let mask = mask_to_latent_tensor(mask, w, h, &self.device, self.dtype)?;
                Ok((
                    Conditioning::Inpaint {
                        init,
                        mask,
                        strength: *strength,
                    },
                    (h, w),
                ))
            }
            ModeArgs::ControlNet {
                control_image,
                conditioning_scale,
                width,
                height,
            } => {
                let size = (height / 8, width / 8);
                let control = self.control_tensor(control_image, size)?;
                Ok((
                    Conditioning::Control {
                        control,
                        scale: *conditioning_scale,
                    },
                    size,
                ))
            }
            ModeArgs::ControlNetInpaint {
                image,
                control_image,
                conditioning_scale,
                strength,
                ..
            } => {
                let init = self.vae.encode(image, self.dtype, noise)?;
                let size = latent_size(&init)?;
                let control = self.control_tensor(control_image, size)?;
                Ok((
                    Conditioning::ControlImage {
                        init,
                        strength: *strength,
                        control,
                        scale: *conditioning_scale,
                    },
                    size,
                ))
            }
        }
    }

    fn generate(&mut self, scheduler: SchedulerKind, job: &GenerationJob) -> Result<Vec<DynamicImage>> {
        let use_guidance = job.guidance_scale > 1.;
        let mut noise = NoiseSource::new(job.seed);
        let (conditioning, (latent_h, latent_w)) = self.conditioning(&job.args, &mut noise)?;
        let control = match (conditioning.control(), &self.controlnet) {
            (Some((image, scale)), Some(model)) => {
                let image = if use_guidance {
                    Tensor::cat(&[image, image], 0)?
                } else {
                    image.clone()
                };
                Some(ControlGuidance { model, image, scale })
            }
            (Some(_), None) => return Err(Error::UnsupportedMode(job.args.mode())),
            (None, _) => None,
        };
        let mut embeddings: HashMap<(&str, &str), Tensor> = HashMap::new();
        let mut images = Vec::with_capacity(job.batch_size());

        for (index, (prompt, negative)) in job.prompts.iter().zip(&job.negative_prompts).enumerate() {
            let key = (prompt.as_str(), negative.as_str());
            let text = match embeddings.get(&key) {
                Some(text) => text.clone(),
                None => {
                    let text = self.text_embeddings(prompt, negative, use_guidance)?;
                    embeddings.insert(key, text.clone());
                    text
                }
            };

            let mut schedule = scheduler.build(job.steps, job.seed.wrapping_add(index as u64 + 1))?;
            let initial = noise.randn(&[1, 4, latent_h, latent_w], self.dtype, &self.device)?;
            let n_steps = schedule.timesteps().len();
            let (latents, t_start, target) = match &conditioning {
                Conditioning::Text | Conditioning::Control { .. } => ((initial * schedule.init_noise_sigma())?, 0, None),
                Conditioning::Image { init, strength } | Conditioning::ControlImage { init, strength, .. } => {
                    let t_start = start_step(n_steps, *strength);
                    (noised_start(schedule.as_ref(), init, initial, t_start)?, t_start, None)
                }
                Conditioning::Inpaint { init, mask, strength } => {
                    let t_start = start_step(n_steps, *strength);
                    let target = InpaintTarget {
                        init: init.clone(),
                        mask: mask.clone(),
                        noise: initial.clone(),
                    };
                    (noised_start(schedule.as_ref(), init, initial, t_start)?, t_start, Some(target))
                }
            };

            let latents = denoise(
                &self.unet,
                schedule.as_mut(),
                latents,
                &text,
                job.guidance_scale,
                t_start,
                target.as_ref(),
                control.as_ref(),
            )?;
            images.extend(self.vae.decode(&latents)?);
            info!("generated image {}/{}", index + 1, job.batch_size());
        }
        Ok(images)
    }
}

type Shared = Arc<RwLock<SharedComponents>>;

fn read(shared: &Shared) -> Result<RwLockReadGuard<'_, SharedComponents>> {
    shared.read().map_err(|_| Error::Poisoned("shared components"))
}

fn write(shared: &Shared) -> Result<RwLockWriteGuard<'_, SharedComponents>> {
    shared.write().map_err(|_| Error::Poisoned("shared components"))
}

/// One pipeline variant. Owns its scheduler choice, shares everything else.
pub struct PipelineHandle {
    kind: PipelineKind,
    scheduler: SchedulerKind,
    shared: Shared,
    adapter_builder: Arc<UNetAdapterBuilder>,
}

impl Pipeline for PipelineHandle {
    fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// The ControlNet variant serves both control modes once a controlnet
    /// is loaded.
    fn supports(&self, mode: Mode) -> bool {
        match (self.kind, mode) {
            (PipelineKind::Txt2Img, Mode::Txt2Img)
            | (PipelineKind::Img2Img, Mode::Img2Img)
            | (PipelineKind::Inpaint, Mode::Inpaint) => true,
            (PipelineKind::ControlNetInpaint, Mode::ControlNet | Mode::ControlNetInpaint) => {
                read(&self.shared).is_ok_and(|shared| shared.controlnet.is_some())
            }
            _ => false,
        }
    }

    fn scheduler(&self) -> SchedulerKind {
        self.scheduler
    }

    fn set_scheduler(&mut self, kind: SchedulerKind) -> Result<()> {
        self.scheduler = kind;
        Ok(())
    }

    fn generate(&mut self, job: &GenerationJob) -> Result<Vec<DynamicImage>> {
        let mode = job.args.mode();
        if !self.supports(mode) {
            return Err(Error::UnsupportedMode(mode));
        }
        write(&self.shared)?.generate(self.scheduler, job)
    }
}

impl FineTuneTarget for PipelineHandle {
    fn loaded_bundle(&self) -> Option<String> {
        let shared = read(&self.shared).ok()?;
        shared.loaded.as_ref().map(|b| b.identifier.clone())
    }

    fn adapter_builder(&self) -> &dyn AdapterBuilder {
        self.adapter_builder.as_ref()
    }

    fn commit(&mut self, patch: FineTunePatch, adapter_scale: f64) -> Result<()> {
        write(&self.shared)?.commit(patch, adapter_scale)
    }

    fn set_adapter_scale(&mut self, adapter_scale: f64) -> Result<()> {
        write(&self.shared)?.set_adapter_scale(adapter_scale)
    }
}

pub struct SdxlRepository {
    shared: Shared,
    device: Device,
    dtype: DType,
    /// Indexed by `PipelineKind as usize`.
    handles: Vec<PipelineHandle>,
}

impl SdxlRepository {
    pub fn new(shared: SharedComponents) -> Self {
        let adapter_builder = Arc::new(backbone::adapter_builder(shared.backbone.config()));
        let (device, dtype) = (shared.device.clone(), shared.dtype);
        let shared = Arc::new(RwLock::new(shared));
        let handles = PipelineKind::ALL
            .iter()
            .map(|&kind| PipelineHandle {
                kind,
                scheduler: SchedulerKind::default(),
                shared: shared.clone(),
                adapter_builder: adapter_builder.clone(),
            })
            .collect();
        Self {
            shared,
            device,
            dtype,
            handles,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl ModelRepository for SdxlRepository {
    fn pipeline(&mut self, kind: PipelineKind) -> &mut dyn Pipeline {
        &mut self.handles[kind as usize]
    }

    fn finetune_target(&mut self, kind: PipelineKind) -> &mut dyn FineTuneTarget {
        &mut self.handles[kind as usize]
    }

    fn token_map(&self, _kind: PipelineKind) -> Option<TokenMap> {
        let shared = read(&self.shared).ok()?;
        shared.loaded.as_ref().map(|b| b.token_map.clone())
    }

    fn restore_precision(&mut self) -> Result<()> {
        write(&self.shared)?.vae.restore_precision()
    }
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Repository = SdxlRepository;

    async fn load(settings: &Settings, api: Api) -> anyhow::Result<Self::Repository> {
        let device = select_best_device(settings.device).context("failed to set up device")?;
        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            settings.precision.dtype()
        };
        let fp16 = dtype != DType::F32;
        info!("loading {} on {device:?} in {dtype:?}", settings.base_model);

        let base = ModelSource::new(&api, &settings.base_model);
        let unet_file = get_variant(&base, "unet/diffusion_pytorch_model", fp16).await?;
        let clip_file = get_variant(&base, "text_encoder/model", fp16).await?;
        let clip2_file = get_variant(&base, "text_encoder_2/model", fp16).await?;
        let tokenizer_file = ModelSource::new(&api, TOKENIZER_REPO)
            .get(&["tokenizer.json"])
            .await?;
        let tokenizer2_file = ModelSource::new(&api, TOKENIZER_2_REPO)
            .get(&["tokenizer.json"])
            .await?;
        let vae_file = match &settings.vae_model {
            Some(vae) => ModelSource::new(&api, vae).get(&[VAE_FILE]).await?,
            None => get_variant(&base, "vae/diffusion_pytorch_model", fp16).await?,
        };

        let backbone = Backbone::new(
            backbone::unet_config(settings.sliced_attention_size),
            settings.use_flash_attn,
            &device,
            dtype,
        );
        let mut pristine_unet = backbone
            .load_params(&unet_file)
            .context("failed to load the backbone")?;
        if settings.fuse_lcm_lora {
            let lora_file = ModelSource::new(&api, &settings.lcm_lora)
                .get(&[LCM_LORA_FILE])
                .await?;
            let lora = candle_core::safetensors::load(&lora_file, &device)
                .with_context(|| format!("failed to read {}", lora_file.display()))?;
            fuse::fuse_lora(&mut pristine_unet, lora, 1.).context("failed to fuse the LCM adapter")?;
        }
        let unet = backbone
            .build(pristine_unet.clone())
            .context("failed to build the backbone")?;

        let encoders = vec![
            TextEncoder::load(&clip_file, &tokenizer_file, ClipTextConfig::sdxl(), &device, dtype)
                .context("failed to load the first text encoder")?,
            TextEncoder::load(&clip2_file, &tokenizer2_file, ClipTextConfig::sdxl2(), &device, dtype)
                .context("failed to load the second text encoder")?,
        ];
        let vae = Vae::load(vae_file, settings.sliced_attention_size, &device, dtype)?;

        let controlnet = match &settings.controlnet_model {
            Some(model) => {
                let source = ModelSource::new(&api, model);
                let mut candidates = variants("diffusion_pytorch_model", "safetensors", fp16);
                candidates.push(CONTROLNET_SINGLE_FILE.to_string());
                let candidates: Vec<&str> = candidates.iter().map(String::as_str).collect();
                let file = source
                    .get(&candidates)
                    .await
                    .with_context(|| format!("failed to locate the controlnet {model}"))?;
                let config = ControlNetConfig::sdxl(settings.sliced_attention_size);
                Some(ControlNet::load(&file, &config, settings.use_flash_attn, &device, dtype)?)
            }
            None => {
                info!("no controlnet configured, control modes are disabled");
                None
            }
        };

        Ok(SdxlRepository::new(SharedComponents {
            device,
            dtype,
            backbone,
            pristine_unet,
            unet,
            encoders,
            vae,
            controlnet,
            loaded: None,
            mismatch_warn_ratio: settings.mismatch_warn_ratio,
        }))
    }
}
