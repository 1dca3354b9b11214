use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::bundle::TokenMap;
use crate::dispatch::{Mode, ModeArgs};
use crate::finetune::FineTuneTarget;
use crate::{Result, SchedulerKind};

/// The pipeline variants held by a model repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    #[serde(rename = "txt2img")]
    Txt2Img,
    #[serde(rename = "img2img")]
    Img2Img,
    #[serde(rename = "inpaint")]
    Inpaint,
    #[serde(rename = "controlnet-inpaint")]
    ControlNetInpaint,
}

serde_plain::derive_display_from_serialize!(PipelineKind);

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        Self::Txt2Img,
        Self::Img2Img,
        Self::Inpaint,
        Self::ControlNetInpaint,
    ];
}

/// One call into a pipeline: the batch to produce and how to produce it.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompts: Vec<String>,
    /// Same length as `prompts`.
    pub negative_prompts: Vec<String>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    pub args: ModeArgs,
}

impl GenerationJob {
    pub fn batch_size(&self) -> usize {
        self.prompts.len()
    }
}

pub trait Pipeline: Send {
    fn kind(&self) -> PipelineKind;

    fn supports(&self, mode: Mode) -> bool;

    fn scheduler(&self) -> SchedulerKind;

    fn set_scheduler(&mut self, kind: SchedulerKind) -> Result<()>;

    /// Produces one image per prompt, in prompt order.
    fn generate(&mut self, job: &GenerationJob) -> Result<Vec<DynamicImage>>;
}

/// The set of pipeline variants sharing one backbone, text encoders and VAE.
pub trait ModelRepository: Send {
    fn pipeline(&mut self, kind: PipelineKind) -> &mut dyn Pipeline;

    fn finetune_target(&mut self, kind: PipelineKind) -> &mut dyn FineTuneTarget;

    /// Special-token replacements of the bundle loaded into `kind`.
    fn token_map(&self, kind: PipelineKind) -> Option<TokenMap>;

    /// Undoes a precision change left behind by a previous request.
    fn restore_precision(&mut self) -> Result<()>;
}
