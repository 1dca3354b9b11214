//! Selection of the generation mode from the optional inputs of a request.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use log::info;
use serde::{Deserialize, Serialize};

use crate::bundle::TokenMap;
use crate::control::ControlDetector;
use crate::pipeline::PipelineKind;
use crate::{Error, GenerationRequest, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "inpaint")]
    Inpaint,
    #[serde(rename = "controlnet-inpaint")]
    ControlNetInpaint,
    #[serde(rename = "img2img")]
    Img2Img,
    /// Text-to-image steered by a control map only.
    #[serde(rename = "controlnet")]
    ControlNet,
    #[serde(rename = "txt2img")]
    Txt2Img,
}

serde_plain::derive_display_from_serialize!(Mode);

impl Mode {
    /// Decision table over the presence of base image, mask and control
    /// image. Rows are checked top to bottom, so a mask wins over a control
    /// image.
    pub fn select(image: bool, mask: bool, control: bool) -> Self {
        match (image, mask, control) {
            (true, true, _) => Self::Inpaint,
            (true, false, true) => Self::ControlNetInpaint,
            (true, false, false) => Self::Img2Img,
            (false, _, true) => Self::ControlNet,
            (false, _, false) => Self::Txt2Img,
        }
    }

    pub fn for_request(request: &GenerationRequest) -> Self {
        Self::select(
            request.image.is_some(),
            request.mask.is_some(),
            request.controlnet_image.is_some(),
        )
    }

    pub fn pipeline(self) -> PipelineKind {
        match self {
            Self::Inpaint => PipelineKind::Inpaint,
            Self::ControlNetInpaint | Self::ControlNet => PipelineKind::ControlNetInpaint,
            Self::Img2Img => PipelineKind::Img2Img,
            Self::Txt2Img => PipelineKind::Txt2Img,
        }
    }
}

/// Pipeline that receives the request's fine-tune bundle.
pub fn finetune_target(request: &GenerationRequest) -> PipelineKind {
    if request.controlnet_image.is_some() {
        PipelineKind::ControlNetInpaint
    } else {
        PipelineKind::Txt2Img
    }
}

/// Mode-specific generation arguments. Images are RGB.
#[derive(Debug, Clone)]
pub enum ModeArgs {
    Txt2Img {
        width: usize,
        height: usize,
    },
    Img2Img {
        image: DynamicImage,
        strength: f64,
    },
    Inpaint {
        image: DynamicImage,
        mask: DynamicImage,
        strength: f64,
        width: usize,
        height: usize,
    },
    /// Image-to-image steered by a control map. Both images are at the
    /// requested size.
    ControlNetInpaint {
        image: DynamicImage,
        control_image: DynamicImage,
        conditioning_scale: f64,
        strength: f64,
        width: usize,
        height: usize,
    },
    ControlNet {
        control_image: DynamicImage,
        conditioning_scale: f64,
        width: usize,
        height: usize,
    },
}

impl ModeArgs {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Txt2Img { .. } => Mode::Txt2Img,
            Self::Img2Img { .. } => Mode::Img2Img,
            Self::Inpaint { .. } => Mode::Inpaint,
            Self::ControlNetInpaint { .. } => Mode::ControlNetInpaint,
            Self::ControlNet { .. } => Mode::ControlNet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub prompts: Vec<String>,
    pub negative_prompts: Vec<String>,
}

impl PromptSet {
    /// Without batching the prompt is repeated `num_outputs` times. With
    /// batching every line of the trimmed prompt is a generation unit and the
    /// whole list is repeated `num_outputs` times. A negative prompt with at
    /// most one line applies to every unit.
    pub fn build(prompt: &str, negative: &str, batched: bool, num_outputs: usize) -> Result<Self> {
        if !batched {
            return Ok(Self {
                prompts: vec![prompt.to_string(); num_outputs],
                negative_prompts: vec![negative.to_string(); num_outputs],
            });
        }

        let lines: Vec<String> = prompt.trim().lines().map(str::to_string).collect();
        let negative_lines: Vec<String> = negative.trim().lines().map(str::to_string).collect();
        let negative_lines = match negative_lines.len() {
            0 => vec![String::new(); lines.len()],
            1 => vec![negative_lines[0].clone(); lines.len()],
            n if n == lines.len() => negative_lines,
            n => {
                return Err(Error::InvalidRequest(format!(
                    "batched negative prompt has {n} lines but the prompt has {}",
                    lines.len()
                )))
            }
        };
        Ok(Self {
            prompts: vec![lines; num_outputs].concat(),
            negative_prompts: vec![negative_lines; num_outputs].concat(),
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub mode: Mode,
    pub pipeline: PipelineKind,
    pub prompts: PromptSet,
    pub args: ModeArgs,
}

pub struct Dispatcher<'a> {
    detector: &'a dyn ControlDetector,
}

impl<'a> Dispatcher<'a> {
    pub fn new(detector: &'a dyn ControlDetector) -> Self {
        Self { detector }
    }

    pub fn select(&self, request: &GenerationRequest, token_map: Option<&TokenMap>) -> Result<Dispatch> {
        let prompt = match token_map {
            Some(map) => map.substitute(&request.prompt),
            None => request.prompt.clone(),
        };
        info!("prompt: {prompt}");
        let prompts = PromptSet::build(
            &prompt,
            &request.negative_prompt,
            request.batched_prompt,
            request.num_outputs,
        )?;

        let mode = Mode::for_request(request);
        info!("{mode} mode");
        let (width, height) = (request.width, request.height);
        let args = match (&request.image, &request.mask, &request.controlnet_image) {
            (Some(image), Some(mask), _) => ModeArgs::Inpaint {
                image: resize(load_image(image)?, width, height),
                mask: resize(load_image(mask)?, width, height),
                strength: request.prompt_strength,
                width,
                height,
            },
            (Some(image), None, Some(control)) => ModeArgs::ControlNetInpaint {
                image: resize(load_image(image)?, width, height),
                control_image: resize(self.detector.detect(&load_image(control)?)?, width, height),
                conditioning_scale: request.condition_scale,
                strength: request.prompt_strength,
                width,
                height,
            },
            (Some(image), None, None) => ModeArgs::Img2Img {
                image: load_image(image)?,
                strength: request.prompt_strength,
            },
            (None, _, Some(control)) => ModeArgs::ControlNet {
                control_image: resize(self.detector.detect(&load_image(control)?)?, width, height),
                conditioning_scale: request.condition_scale,
                width,
                height,
            },
            (None, _, None) => ModeArgs::Txt2Img { width, height },
        };
        debug_assert_eq!(args.mode(), mode);

        Ok(Dispatch {
            mode,
            pipeline: mode.pipeline(),
            prompts,
            args,
        })
    }
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    let image = image::open(path)
        .map_err(|e| Error::InvalidRequest(format!("cannot read image {}: {e}", path.display())))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

fn resize(image: DynamicImage, width: usize, height: usize) -> DynamicImage {
    if image.width() as usize == width && image.height() as usize == height {
        return image;
    }
    image.resize_exact(width as u32, height as u32, FilterType::Lanczos3)
}
