use std::num::NonZeroUsize;

use anyhow::{anyhow, Context, Result};
use hf_hub::api::tokio::Api;
use log::info;

use crate::config::ControlDetectorKind;
use crate::control::{CannyDetector, ControlDetector};
use crate::files::ModelSource;
use crate::finetune::FineTuneLoader;
use crate::pose::PoseDetector;
use crate::safety::PostProcessor;
use crate::safety_checker::ClipSafetyChecker;
use crate::weights::WeightsCache;
use crate::{Loader, Predictor, SdxlLoader, Settings};

const SAFETY_CHECKER_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];
const POSE_FILES: [&str; 2] = ["body_pose_model.safetensors", "body_pose_model.pth"];

/// Enum of supported model families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelFamily {
    Sdxl,
}

impl ModelFamily {
    /// Detect the model family from the base model name. Local directories
    /// carry no family in their name and are assumed to be SDXL.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();
        if name_upper.contains("XL") || std::path::Path::new(model_name).is_dir() {
            Some(ModelFamily::Sdxl)
        } else {
            None
        }
    }
}

async fn load_detector(settings: &Settings, api: &Api, device: &candle_core::Device) -> Result<Box<dyn ControlDetector>> {
    info!("control detector: {:?}", settings.control_detector);
    let detector: Box<dyn ControlDetector> = match settings.control_detector {
        ControlDetectorKind::Openpose => {
            let file = ModelSource::new(api, &settings.pose_model)
                .get(&POSE_FILES)
                .await
                .context("failed to get the body pose network")?;
            Box::new(PoseDetector::load(&file, device)?)
        }
        ControlDetectorKind::Canny => Box::new(CannyDetector::default()),
    };
    Ok(detector)
}

/// Loads every component named by `settings` and wires them into a
/// predictor, applying the default weights if any.
pub async fn load_predictor(settings: &Settings, api: Api) -> Result<Predictor> {
    let family = ModelFamily::from_name(&settings.base_model)
        .ok_or_else(|| anyhow!("Unsupported base model: {}", settings.base_model))?;
    info!(
        "Loading model: {} (detected family: {family:?})",
        settings.base_model
    );

    let repository = match family {
        ModelFamily::Sdxl => SdxlLoader::load(settings, api.clone()).await?,
    };

    let safety_file = ModelSource::new(&api, &settings.safety_model)
        .get(&SAFETY_CHECKER_FILES)
        .await
        .context("failed to get the safety checker")?;
    let safety_checker = ClipSafetyChecker::load(&safety_file, repository.device(), repository.dtype())?;
    let detector = load_detector(settings, &api, repository.device()).await?;

    let capacity = NonZeroUsize::new(settings.max_cached_weights)
        .context("max_cached_weights must be at least 1")?;
    let cache = WeightsCache::new(&settings.cache_dir, capacity, api)
        .context("failed to set up the weights cache")?;

    let mut predictor = Predictor::new(
        Box::new(repository),
        FineTuneLoader::new(cache),
        PostProcessor::new(Box::new(safety_checker)),
        detector,
        settings.output_dir.clone(),
    );
    if let Some(weights) = &settings.default_weights {
        predictor
            .apply_default_weights(weights)
            .await
            .with_context(|| format!("failed to apply default weights {weights}"))?;
    }
    Ok(predictor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sdxl_names() {
        assert_eq!(
            ModelFamily::from_name("stabilityai/stable-diffusion-xl-base-1.0"),
            Some(ModelFamily::Sdxl)
        );
        assert_eq!(ModelFamily::from_name("openai/clip-vit-large-patch14"), None);
    }
}
