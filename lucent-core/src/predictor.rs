//! The single `predict` entry point.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::control::ControlDetector;
use crate::dispatch::{self, Dispatcher, Mode};
use crate::finetune::{ApplyOutcome, FineTuneLoader};
use crate::pipeline::{GenerationJob, ModelRepository, PipelineKind};
use crate::safety::{PostOptions, PostProcessor};
use crate::util::random_seed;
use crate::weights::WeightsCache;
use crate::{Error, GenerationRequest, Prediction, Result};

pub struct Predictor {
    repository: Box<dyn ModelRepository>,
    loader: FineTuneLoader,
    post: PostProcessor,
    detector: Box<dyn ControlDetector>,
    output_dir: PathBuf,
}

impl Predictor {
    pub fn new(
        repository: Box<dyn ModelRepository>,
        loader: FineTuneLoader,
        post: PostProcessor,
        detector: Box<dyn ControlDetector>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            loader,
            post,
            detector,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn weights_cache(&mut self) -> &mut WeightsCache {
        self.loader.cache_mut()
    }

    /// Merges a bundle into the txt2img family before any request arrives.
    pub async fn apply_default_weights(&mut self, identifier: &str) -> Result<ApplyOutcome> {
        info!("applying default weights {identifier}");
        let target = self.repository.finetune_target(PipelineKind::Txt2Img);
        self.loader
            .apply(identifier, target, GenerationRequest::default().lora_scale)
            .await
    }

    pub async fn predict(&mut self, request: &GenerationRequest) -> Result<Prediction> {
        request.validate()?;

        // Refuse before any weights are touched.
        let mode = Mode::for_request(request);
        if !self.repository.pipeline(mode.pipeline()).supports(mode) {
            return Err(Error::UnsupportedMode(mode));
        }

        let seed = match request.seed {
            Some(seed) => seed,
            None => random_seed(),
        };

        let target = self.repository.finetune_target(dispatch::finetune_target(request));
        match request.weights() {
            Some(identifier) => {
                self.loader
                    .apply(identifier, target, request.lora_scale)
                    .await?;
            }
            None => target.set_adapter_scale(request.lora_scale)?,
        }
        self.repository.restore_precision()?;

        let token_map = self.repository.token_map(mode.pipeline());
        let dispatch = Dispatcher::new(self.detector.as_ref()).select(request, token_map.as_ref())?;

        let pipeline = self.repository.pipeline(dispatch.pipeline);
        pipeline.set_scheduler(request.scheduler)?;
        let job = GenerationJob {
            prompts: dispatch.prompts.prompts,
            negative_prompts: dispatch.prompts.negative_prompts,
            steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            seed,
            args: dispatch.args,
        };
        info!(
            "generating {} images with {} in {} steps, seed {seed}",
            job.batch_size(),
            request.scheduler,
            job.steps
        );
        let images = pipeline.generate(&job)?;

        let options = PostOptions {
            watermark: request.apply_watermark,
            safety_check: !request.disable_safety_checker,
        };
        let filtered = self.post.filter(images, options)?;
        self.clear_outputs()?;
        let mut output = Vec::with_capacity(filtered.kept.len());
        for (index, image) in &filtered.kept {
            let path = self.output_dir.join(format!("out-{index}.png"));
            image.save(&path)?;
            output.push(path);
        }
        Ok(Prediction {
            output,
            seed,
            rejected: filtered.rejected(),
            mode: dispatch.mode,
        })
    }

    /// Removes the `out-<i>.png` files of the previous prediction so the
    /// directory holds only the current outputs.
    fn clear_outputs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        for entry in std::fs::read_dir(&self.output_dir)? {
            let path = entry?.path();
            let stale = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("out-"))
                .and_then(|rest| rest.strip_suffix(".png"))
                .is_some_and(|index| index.parse::<usize>().is_ok());
            if stale && path.is_file() {
                debug!("removing stale output {}", path.display());
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
