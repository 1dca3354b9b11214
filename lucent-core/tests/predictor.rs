use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, Rgb, RgbImage};
use lucent_core::adapter::{AdapterBuilder, UNetAdapterBuilder};
use lucent_core::bundle::{TokenMap, ADAPTER_FILE, BACKBONE_FILE, EMBEDDINGS_FILE, SPECIAL_PARAMS_FILE};
use lucent_core::control::CannyDetector;
use lucent_core::dispatch::{Mode, ModeArgs};
use lucent_core::finetune::{ApplyOutcome, BackbonePatch, FineTuneLoader, FineTunePatch, FineTuneTarget};
use lucent_core::pipeline::{GenerationJob, ModelRepository, Pipeline, PipelineKind};
use lucent_core::safety::{PostProcessor, SafetyClassifier};
use lucent_core::watermark::Watermarker;
use lucent_core::weights::WeightsCache;
use lucent_core::{Error, GenerationRequest, Predictor, Result, SchedulerKind};

/// State shared by every mock pipeline, like the real shared components.
#[derive(Default)]
struct Shared {
    loaded: Option<String>,
    token_map: Option<TokenMap>,
    commits: usize,
    /// Layers of the last committed adapter patch.
    adapter_layers: Vec<String>,
    adapter_scales: Vec<f64>,
    jobs: Vec<(PipelineKind, GenerationJob)>,
    without_controlnet: bool,
    watermarked: usize,
}

struct MockPipeline {
    kind: PipelineKind,
    scheduler: SchedulerKind,
    shared: Arc<Mutex<Shared>>,
    adapter_builder: UNetAdapterBuilder,
}

impl Pipeline for MockPipeline {
    fn kind(&self) -> PipelineKind {
        self.kind
    }

    fn supports(&self, mode: Mode) -> bool {
        mode.pipeline() == self.kind
            && (self.kind != PipelineKind::ControlNetInpaint || !self.shared.lock().unwrap().without_controlnet)
    }

    fn scheduler(&self) -> SchedulerKind {
        self.scheduler
    }

    fn set_scheduler(&mut self, kind: SchedulerKind) -> Result<()> {
        self.scheduler = kind;
        Ok(())
    }

    /// Solid images whose colour depends on the seed and the prompt. Image
    /// modes add seeded noise to the base image's first pixel.
    fn generate(&mut self, job: &GenerationJob) -> Result<Vec<DynamicImage>> {
        self.shared
            .lock()
            .unwrap()
            .jobs
            .push((self.kind, job.clone()));
        let base = match &job.args {
            ModeArgs::Img2Img { image, .. } | ModeArgs::ControlNetInpaint { image, .. } => {
                Some(image.to_rgb8().get_pixel(0, 0)[2])
            }
            _ => None,
        };
        let mut noise = lucent_core::NoiseSource::new(job.seed);
        let images = job
            .prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| -> Result<DynamicImage> {
                let red = if prompt.contains("unsafe") { 255 } else { 0 };
                let green = (job.seed.wrapping_add(i as u64) % 200) as u8;
                let blue = match base {
                    Some(base) => {
                        let n = noise.randn(&[1], DType::F32, &Device::Cpu)?.to_vec1::<f32>()?[0];
                        (base as f32 + 20. * n).clamp(0., 254.) as u8
                    }
                    None => (job.steps * 10) as u8,
                };
                Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([red, green, blue]))))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(images)
    }
}

impl FineTuneTarget for MockPipeline {
    fn loaded_bundle(&self) -> Option<String> {
        self.shared.lock().unwrap().loaded.clone()
    }

    fn adapter_builder(&self) -> &dyn AdapterBuilder {
        &self.adapter_builder
    }

    fn commit(&mut self, patch: FineTunePatch, adapter_scale: f64) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        match &patch.backbone {
            BackbonePatch::Full(params) => assert!(!params.is_empty()),
            BackbonePatch::Adapters(adapters) => {
                shared.adapter_layers = adapters.iter().map(|a| a.layer.clone()).collect();
            }
        }
        shared.loaded = Some(patch.identifier);
        shared.token_map = Some(patch.token_map);
        shared.commits += 1;
        shared.adapter_scales.push(adapter_scale);
        Ok(())
    }

    fn set_adapter_scale(&mut self, adapter_scale: f64) -> Result<()> {
        self.shared.lock().unwrap().adapter_scales.push(adapter_scale);
        Ok(())
    }
}

struct MockRepository {
    pipelines: Vec<MockPipeline>,
    shared: Arc<Mutex<Shared>>,
}

impl MockRepository {
    fn new(shared: Arc<Mutex<Shared>>) -> Self {
        let pipelines = PipelineKind::ALL
            .into_iter()
            .map(|kind| MockPipeline {
                kind,
                scheduler: SchedulerKind::Lcm,
                shared: shared.clone(),
                adapter_builder: UNetAdapterBuilder::sdxl(),
            })
            .collect();
        Self { pipelines, shared }
    }

    fn get(&mut self, kind: PipelineKind) -> &mut MockPipeline {
        let index = PipelineKind::ALL.iter().position(|k| *k == kind).unwrap();
        &mut self.pipelines[index]
    }
}

impl ModelRepository for MockRepository {
    fn pipeline(&mut self, kind: PipelineKind) -> &mut dyn Pipeline {
        self.get(kind)
    }

    fn finetune_target(&mut self, kind: PipelineKind) -> &mut dyn FineTuneTarget {
        self.get(kind)
    }

    fn token_map(&self, _kind: PipelineKind) -> Option<TokenMap> {
        self.shared.lock().unwrap().token_map.clone()
    }

    fn restore_precision(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Flags images whose red channel is saturated.
struct RedFlagger;

impl SafetyClassifier for RedFlagger {
    fn classify(&mut self, images: Vec<DynamicImage>) -> Result<(Vec<DynamicImage>, Vec<bool>)> {
        let flags = images
            .iter()
            .map(|image| image.to_rgb8().get_pixel(0, 0)[0] == 255)
            .collect();
        Ok((images, flags))
    }
}

/// Counts the images it is asked to mark.
struct CountingMarker(Arc<Mutex<Shared>>);

impl Watermarker for CountingMarker {
    fn apply(&mut self, images: Vec<DynamicImage>) -> Result<Vec<DynamicImage>> {
        self.0.lock().unwrap().watermarked += images.len();
        Ok(images)
    }
}

struct Fixture {
    predictor: Predictor,
    shared: Arc<Mutex<Shared>>,
    dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let api = hf_hub::api::tokio::ApiBuilder::new()
        .with_cache_dir(dir.path().join("hub"))
        .build()
        .unwrap();
    let cache = WeightsCache::new(dir.path().join("cache"), NonZeroUsize::new(4).unwrap(), api).unwrap();
    let predictor = Predictor::new(
        Box::new(MockRepository::new(shared.clone())),
        FineTuneLoader::new(cache),
        PostProcessor::new(Box::new(RedFlagger)).with_watermarker(Box::new(CountingMarker(shared.clone()))),
        Box::new(CannyDetector::default()),
        dir.path().join("out"),
    );
    Fixture {
        predictor,
        shared,
        dir,
    }
}

fn write_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(16, 16, Rgb([120, 40, 200]))
        .save(&path)
        .unwrap();
    path
}

/// A full-backbone bundle with two special tokens.
fn write_bundle(dir: &Path, name: &str, embedding_rows: usize) -> String {
    let bundle = dir.join(name);
    std::fs::create_dir_all(&bundle).unwrap();
    let unet = HashMap::from([(
        "conv_in.weight".to_string(),
        Tensor::ones((4, 4), DType::F32, &Device::Cpu).unwrap(),
    )]);
    candle_core::safetensors::save(&unet, bundle.join(BACKBONE_FILE)).unwrap();
    let embeddings = HashMap::from([
        (
            "text_encoders_0".to_string(),
            Tensor::zeros((2, 768), DType::F32, &Device::Cpu).unwrap(),
        ),
        (
            "text_encoders_1".to_string(),
            Tensor::zeros((embedding_rows, 1280), DType::F32, &Device::Cpu).unwrap(),
        ),
    ]);
    candle_core::safetensors::save(&embeddings, bundle.join(EMBEDDINGS_FILE)).unwrap();
    std::fs::write(
        bundle.join(SPECIAL_PARAMS_FILE),
        r#"{"TOK": "<s0><s1>"}"#,
    )
    .unwrap();
    bundle.to_string_lossy().into_owned()
}

fn write_embeddings(bundle: &Path) {
    let embeddings = HashMap::from([
        (
            "text_encoders_0".to_string(),
            Tensor::zeros((2, 768), DType::F32, &Device::Cpu).unwrap(),
        ),
        (
            "text_encoders_1".to_string(),
            Tensor::zeros((2, 1280), DType::F32, &Device::Cpu).unwrap(),
        ),
    ]);
    candle_core::safetensors::save(&embeddings, bundle.join(EMBEDDINGS_FILE)).unwrap();
}

/// An adapter bundle with query and key adapters on one cross-attention
/// layer of the second down block. `layer` overrides that layer's name.
fn write_lora_bundle(dir: &Path, name: &str, layer: &str) -> String {
    let bundle = dir.join(name);
    std::fs::create_dir_all(&bundle).unwrap();
    let rank = 4;
    let tensor = |dims: (usize, usize)| Tensor::ones(dims, DType::F32, &Device::Cpu).unwrap();
    let lora = HashMap::from([
        (format!("{layer}.processor.to_q_lora.up.weight"), tensor((640, rank))),
        (format!("{layer}.processor.to_q_lora.down.weight"), tensor((rank, 640))),
        (format!("{layer}.processor.to_k_lora.up.weight"), tensor((640, rank))),
        (format!("{layer}.processor.to_k_lora.down.weight"), tensor((rank, 2048))),
    ]);
    candle_core::safetensors::save(&lora, bundle.join(ADAPTER_FILE)).unwrap();
    write_embeddings(&bundle);
    std::fs::write(bundle.join(SPECIAL_PARAMS_FILE), r#"{"TOK": "<s0><s1>"}"#).unwrap();
    bundle.to_string_lossy().into_owned()
}

const CROSS_ATTENTION: &str = "down_blocks.1.attentions.0.transformer_blocks.0.attn2";

fn request() -> GenerationRequest {
    GenerationRequest {
        prompt: "a photo of TOK".to_string(),
        seed: Some(13),
        ..Default::default()
    }
}

#[tokio::test]
async fn txt2img_writes_one_file_per_output() {
    let mut f = fixture();
    let req = GenerationRequest {
        num_outputs: 3,
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.mode, Mode::Txt2Img);
    assert_eq!(prediction.seed, 13);
    let names: Vec<String> = prediction
        .output
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["out-0.png", "out-1.png", "out-2.png"]);
    assert!(prediction.output.iter().all(|p| p.is_file()));
    assert!(prediction.rejected.is_empty());
}

#[tokio::test]
async fn mask_takes_precedence_over_control_image() {
    let mut f = fixture();
    let req = GenerationRequest {
        image: Some(write_image(f.dir.path(), "image.png")),
        mask: Some(write_image(f.dir.path(), "mask.png")),
        controlnet_image: Some(write_image(f.dir.path(), "control.png")),
        width: 64,
        height: 64,
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.mode, Mode::Inpaint);

    let shared = f.shared.lock().unwrap();
    let (kind, job) = shared.jobs.last().unwrap();
    assert_eq!(*kind, PipelineKind::Inpaint);
    match &job.args {
        ModeArgs::Inpaint { image, mask, .. } => {
            assert_eq!((image.width(), image.height()), (64, 64));
            assert_eq!((mask.width(), mask.height()), (64, 64));
        }
        other => panic!("expected inpaint arguments, got {:?}", other.mode()),
    }
}

#[tokio::test]
async fn img2img_uses_the_image_pipeline() {
    let mut f = fixture();
    let req = GenerationRequest {
        image: Some(write_image(f.dir.path(), "image.png")),
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.mode, Mode::Img2Img);
    assert_eq!(f.shared.lock().unwrap().jobs[0].0, PipelineKind::Img2Img);
}

#[tokio::test]
async fn bundle_is_applied_once_and_its_tokens_substituted() {
    let mut f = fixture();
    let bundle = write_bundle(f.dir.path(), "bundle", 2);
    let req = GenerationRequest {
        lora_weights: Some(bundle.clone()),
        ..request()
    };
    f.predictor.predict(&req).await.unwrap();
    f.predictor.predict(&req).await.unwrap();

    let shared = f.shared.lock().unwrap();
    assert_eq!(shared.commits, 1);
    assert_eq!(shared.loaded.as_deref(), Some(bundle.as_str()));
    assert_eq!(shared.jobs[1].1.prompts, vec!["a photo of <s0><s1>"]);
    assert_eq!(shared.adapter_scales, vec![0.6, 0.6]);
}

#[tokio::test]
async fn applying_the_loaded_bundle_again_is_a_no_op() {
    let mut f = fixture();
    let bundle = write_bundle(f.dir.path(), "bundle", 2);
    assert!(matches!(
        f.predictor.apply_default_weights(&bundle).await.unwrap(),
        ApplyOutcome::Loaded(_)
    ));
    assert_eq!(
        f.predictor.apply_default_weights(&bundle).await.unwrap(),
        ApplyOutcome::AlreadyLoaded
    );
    assert_eq!(f.shared.lock().unwrap().commits, 1);
}

#[tokio::test]
async fn invalid_bundle_leaves_the_loaded_one_in_place() {
    let mut f = fixture();
    let good = write_bundle(f.dir.path(), "good", 2);
    let bad = write_bundle(f.dir.path(), "bad", 3);
    f.predictor.apply_default_weights(&good).await.unwrap();

    let req = GenerationRequest {
        replicate_weights: Some(bad),
        ..request()
    };
    let err = f.predictor.predict(&req).await.unwrap_err();
    assert!(matches!(err, Error::InvalidBundle { .. }), "{err}");

    let shared = f.shared.lock().unwrap();
    assert_eq!(shared.loaded.as_deref(), Some(good.as_str()));
    assert_eq!(shared.commits, 1);
    assert!(shared.jobs.is_empty());
}

#[tokio::test]
async fn bundle_without_token_map_is_rejected() {
    let mut f = fixture();
    let bundle = write_bundle(f.dir.path(), "bundle", 2);
    std::fs::remove_file(Path::new(&bundle).join(SPECIAL_PARAMS_FILE)).unwrap();
    let req = GenerationRequest {
        lora_weights: Some(bundle),
        ..request()
    };
    assert!(matches!(
        f.predictor.predict(&req).await,
        Err(Error::InvalidBundle { .. })
    ));
    assert!(f.shared.lock().unwrap().loaded.is_none());
}

#[tokio::test]
async fn flagged_outputs_are_dropped() {
    let mut f = fixture();
    let req = GenerationRequest {
        prompt: "safe\nunsafe".to_string(),
        batched_prompt: true,
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.rejected, vec![1]);
    assert_eq!(prediction.output.len(), 1);
    assert!(prediction.output[0].ends_with("out-0.png"));
}

#[tokio::test]
async fn all_outputs_flagged_is_an_error_unless_the_checker_is_off() {
    let mut f = fixture();
    let req = GenerationRequest {
        prompt: "unsafe".to_string(),
        num_outputs: 2,
        ..request()
    };
    assert!(matches!(
        f.predictor.predict(&req).await,
        Err(Error::AllOutputsRejected { count: 2 })
    ));

    let req = GenerationRequest {
        disable_safety_checker: true,
        ..req
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.output.len(), 2);
}

#[tokio::test]
async fn same_seed_gives_same_images() {
    let mut f = fixture();
    let req = GenerationRequest {
        scheduler: SchedulerKind::Lcm,
        num_inference_steps: 6,
        ..request()
    };
    let first = f.predictor.predict(&req).await.unwrap();
    let first = image::open(&first.output[0]).unwrap().to_rgb8();
    let second = f.predictor.predict(&req).await.unwrap();
    let second = image::open(&second.output[0]).unwrap().to_rgb8();
    assert_eq!(first, second);

    let shared = f.shared.lock().unwrap();
    assert!(shared.jobs.iter().all(|(_, job)| job.seed == 13 && job.steps == 6));
}

#[tokio::test]
async fn missing_seed_is_drawn_and_reported() {
    let mut f = fixture();
    let req = GenerationRequest {
        seed: None,
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(f.shared.lock().unwrap().jobs[0].1.seed, prediction.seed);
}

#[tokio::test]
async fn unsupported_mode_is_refused_before_loading_weights() {
    let mut f = fixture();
    f.shared.lock().unwrap().without_controlnet = true;
    let bundle = write_bundle(f.dir.path(), "bundle", 2);
    let req = GenerationRequest {
        controlnet_image: Some(write_image(f.dir.path(), "control.png")),
        lora_weights: Some(bundle),
        ..request()
    };
    assert!(matches!(
        f.predictor.predict(&req).await,
        Err(Error::UnsupportedMode(Mode::ControlNet))
    ));
    let shared = f.shared.lock().unwrap();
    assert_eq!(shared.commits, 0);
    assert!(shared.jobs.is_empty());
}

#[tokio::test]
async fn every_scheduler_is_accepted() {
    let mut f = fixture();
    for scheduler in SchedulerKind::ALL {
        let req = GenerationRequest {
            scheduler,
            ..request()
        };
        let prediction = f.predictor.predict(&req).await.unwrap();
        assert_eq!(prediction.output.len(), 1, "{scheduler}");
    }
}

#[tokio::test]
async fn control_image_alone_runs_the_controlnet_pipeline() {
    let mut f = fixture();
    let req = GenerationRequest {
        controlnet_image: Some(write_image(f.dir.path(), "control.png")),
        width: 48,
        height: 32,
        condition_scale: 0.7,
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.mode, Mode::ControlNet);
    assert_eq!(prediction.output.len(), 1);
    assert!(prediction.output[0].is_file());

    let shared = f.shared.lock().unwrap();
    let (kind, job) = shared.jobs.last().unwrap();
    assert_eq!(*kind, PipelineKind::ControlNetInpaint);
    match &job.args {
        ModeArgs::ControlNet {
            control_image,
            conditioning_scale,
            ..
        } => {
            assert_eq!((control_image.width(), control_image.height()), (48, 32));
            assert_eq!(*conditioning_scale, 0.7);
        }
        other => panic!("expected controlnet arguments, got {:?}", other.mode()),
    }
}

#[tokio::test]
async fn image_and_control_image_run_the_controlnet_pipeline() {
    let mut f = fixture();
    let req = GenerationRequest {
        image: Some(write_image(f.dir.path(), "image.png")),
        controlnet_image: Some(write_image(f.dir.path(), "control.png")),
        width: 32,
        height: 32,
        num_outputs: 2,
        ..request()
    };
    let prediction = f.predictor.predict(&req).await.unwrap();
    assert_eq!(prediction.mode, Mode::ControlNetInpaint);
    assert_eq!(prediction.output.len(), 2);
    assert!(prediction.output.iter().all(|p| p.is_file()));

    let shared = f.shared.lock().unwrap();
    let (kind, job) = shared.jobs.last().unwrap();
    assert_eq!(*kind, PipelineKind::ControlNetInpaint);
    match &job.args {
        ModeArgs::ControlNetInpaint { image, strength, .. } => {
            assert_eq!((image.width(), image.height()), (32, 32));
            assert_eq!(*strength, 0.8);
        }
        other => panic!("expected controlnet-inpaint arguments, got {:?}", other.mode()),
    }
}

#[tokio::test]
async fn img2img_same_seed_gives_same_images() {
    let mut f = fixture();
    let image = write_image(f.dir.path(), "image.png");
    let mut outputs = Vec::new();
    for seed in [21, 21, 22] {
        let req = GenerationRequest {
            image: Some(image.clone()),
            seed: Some(seed),
            ..request()
        };
        let prediction = f.predictor.predict(&req).await.unwrap();
        assert_eq!(prediction.mode, Mode::Img2Img);
        outputs.push(image::open(&prediction.output[0]).unwrap().to_rgb8());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_ne!(outputs[0], outputs[2]);
}

#[tokio::test]
async fn lora_bundle_is_built_into_adapters_and_committed() {
    let mut f = fixture();
    let bundle = write_lora_bundle(f.dir.path(), "lora", CROSS_ATTENTION);
    let req = GenerationRequest {
        lora_weights: Some(bundle.clone()),
        lora_scale: 0.3,
        ..request()
    };
    f.predictor.predict(&req).await.unwrap();

    let shared = f.shared.lock().unwrap();
    assert_eq!(shared.commits, 1);
    assert_eq!(shared.loaded.as_deref(), Some(bundle.as_str()));
    assert_eq!(shared.adapter_layers, vec![CROSS_ATTENTION.to_string()]);
    assert_eq!(shared.adapter_scales, vec![0.3]);
    assert_eq!(shared.jobs[0].1.prompts, vec!["a photo of <s0><s1>"]);
}

#[tokio::test]
async fn unrecognized_adapter_layer_leaves_the_loaded_bundle_in_place() {
    let mut f = fixture();
    let good = write_lora_bundle(f.dir.path(), "good", CROSS_ATTENTION);
    f.predictor.apply_default_weights(&good).await.unwrap();

    let bad = write_lora_bundle(
        f.dir.path(),
        "bad",
        "text_model.encoder.layers.0.self_attn",
    );
    let req = GenerationRequest {
        lora_weights: Some(bad),
        ..request()
    };
    let err = f.predictor.predict(&req).await.unwrap_err();
    assert!(matches!(err, Error::UnrecognizedLayer(_)), "{err}");

    let shared = f.shared.lock().unwrap();
    assert_eq!(shared.loaded.as_deref(), Some(good.as_str()));
    assert_eq!(shared.adapter_layers, vec![CROSS_ATTENTION.to_string()]);
    assert_eq!(shared.commits, 1);
    assert!(shared.jobs.is_empty());
}

#[tokio::test]
async fn outputs_of_the_previous_prediction_are_removed() {
    let mut f = fixture();
    let req = GenerationRequest {
        num_outputs: 3,
        ..request()
    };
    f.predictor.predict(&req).await.unwrap();
    let unrelated = f.predictor.output_dir().join("notes.txt");
    std::fs::write(&unrelated, "keep").unwrap();

    let prediction = f.predictor.predict(&request()).await.unwrap();
    assert_eq!(prediction.output.len(), 1);
    let mut names: Vec<String> = std::fs::read_dir(f.predictor.output_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["notes.txt", "out-0.png"]);
}

#[tokio::test]
async fn watermark_follows_the_request_flag() {
    let mut f = fixture();
    let req = GenerationRequest {
        num_outputs: 2,
        ..request()
    };
    f.predictor.predict(&req).await.unwrap();
    assert_eq!(f.shared.lock().unwrap().watermarked, 2);

    let req = GenerationRequest {
        apply_watermark: false,
        ..req
    };
    f.predictor.predict(&req).await.unwrap();
    assert_eq!(f.shared.lock().unwrap().watermarked, 2);
}

#[tokio::test]
async fn oversized_request_is_refused() {
    let mut f = fixture();
    let req = GenerationRequest {
        width: 4096,
        ..request()
    };
    assert!(matches!(
        f.predictor.predict(&req).await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(f.shared.lock().unwrap().jobs.is_empty());
}

#[tokio::test]
async fn invalid_request_is_refused() {
    let mut f = fixture();
    let req = GenerationRequest {
        num_outputs: 5,
        ..request()
    };
    assert!(matches!(
        f.predictor.predict(&req).await,
        Err(Error::InvalidRequest(_))
    ));
}
