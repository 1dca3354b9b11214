//! Merging of fine-tune bundles into a pipeline's shared components.

use std::collections::HashMap;

use candle_core::Tensor;
use log::{info, warn};

use crate::adapter::{AdapterBuilder, AttentionAdapter};
use crate::bundle::{BundleKind, TokenEmbeddings, TokenMap, WeightBundle};
use crate::weights::WeightsCache;
use crate::{Error, Result};

pub enum BackbonePatch {
    /// Parameters overwriting their namesakes in the pretrained backbone.
    Full(HashMap<String, Tensor>),
    Adapters(Vec<AttentionAdapter>),
}

/// Everything read from a bundle, validated and ready to commit.
pub struct FineTunePatch {
    pub identifier: String,
    pub backbone: BackbonePatch,
    pub embeddings: TokenEmbeddings,
    pub token_map: TokenMap,
}

impl FineTunePatch {
    pub fn kind(&self) -> BundleKind {
        match self.backbone {
            BackbonePatch::Full(_) => BundleKind::FullBackbone,
            BackbonePatch::Adapters(_) => BundleKind::Adapter,
        }
    }
}

/// A pipeline that fine-tune bundles can be merged into.
pub trait FineTuneTarget: Send {
    /// Identifier of the bundle currently merged in, if any.
    fn loaded_bundle(&self) -> Option<String>;

    fn adapter_builder(&self) -> &dyn AdapterBuilder;

    /// Rebuilds the fine-tuned state from the pretrained weights plus `patch`
    /// and swaps it in. On error the previous state, including the loaded
    /// bundle identifier, must be left untouched.
    fn commit(&mut self, patch: FineTunePatch, adapter_scale: f64) -> Result<()>;

    /// Re-merges the loaded adapters at a new scale. No-op for full backbones.
    fn set_adapter_scale(&mut self, adapter_scale: f64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    AlreadyLoaded,
    Loaded(BundleKind),
}

pub struct FineTuneLoader {
    cache: WeightsCache,
}

impl FineTuneLoader {
    pub fn new(cache: WeightsCache) -> Self {
        Self { cache }
    }

    pub fn cache_mut(&mut self) -> &mut WeightsCache {
        &mut self.cache
    }

    pub async fn apply(
        &mut self,
        identifier: &str,
        target: &mut dyn FineTuneTarget,
        adapter_scale: f64,
    ) -> Result<ApplyOutcome> {
        if target.loaded_bundle().as_deref() == Some(identifier) {
            info!("skipping loading, {identifier} is already loaded");
            target.set_adapter_scale(adapter_scale)?;
            return Ok(ApplyOutcome::AlreadyLoaded);
        }

        let dir = self.cache.ensure(identifier).await?;
        let bundle = WeightBundle::open(identifier, &dir)?;
        let token_map = bundle.load_token_map()?;
        let embeddings = bundle.load_embeddings()?;
        let tensors = bundle.load_tensors()?;
        let backbone = match bundle.kind() {
            BundleKind::FullBackbone => {
                info!("loading fine-tuned backbone from {identifier}");
                BackbonePatch::Full(tensors)
            }
            BundleKind::Adapter => {
                info!("no backbone in {identifier}, loading attention adapters");
                let adapters = target.adapter_builder().build(identifier, tensors)?;
                BackbonePatch::Adapters(adapters)
            }
        };

        let patch = FineTunePatch {
            identifier: identifier.to_string(),
            backbone,
            embeddings,
            token_map,
        };
        let kind = patch.kind();
        target.commit(patch, adapter_scale)?;
        Ok(ApplyOutcome::Loaded(kind))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub replaced: usize,
    pub ignored: usize,
}

impl OverlayStats {
    pub fn ignored_ratio(&self) -> f64 {
        let total = self.replaced + self.ignored;
        if total == 0 {
            return 0.;
        }
        self.ignored as f64 / total as f64
    }

    /// Unmatched keys are tolerated, but a large share of them usually means
    /// the bundle was trained against a different architecture.
    pub fn report(&self, identifier: &str, warn_ratio: f64) {
        let ratio = self.ignored_ratio();
        if ratio > warn_ratio {
            warn!(
                "{identifier}: {} of {} backbone tensors matched no parameter ({:.0}%)",
                self.ignored,
                self.replaced + self.ignored,
                ratio * 100.
            );
        } else {
            info!(
                "{identifier}: replaced {} backbone tensors, ignored {}",
                self.replaced, self.ignored
            );
        }
    }
}

/// Overwrites every parameter of `params` that `incoming` also names.
pub fn overlay_backbone(
    identifier: &str,
    params: &mut HashMap<String, Tensor>,
    incoming: HashMap<String, Tensor>,
) -> Result<OverlayStats> {
    let mut stats = OverlayStats::default();
    for (name, tensor) in incoming {
        let Some(current) = params.get(&name) else {
            stats.ignored += 1;
            continue;
        };
        if current.dims() != tensor.dims() {
            return Err(Error::invalid_bundle(
                identifier,
                format!(
                    "{name} has shape {:?} but the bundle carries {:?}",
                    current.dims(),
                    tensor.dims()
                ),
            ));
        }
        let tensor = tensor
            .to_device(current.device())?
            .to_dtype(current.dtype())?;
        params.insert(name, tensor);
        stats.replaced += 1;
    }
    Ok(stats)
}

pub fn merge_adapters(
    identifier: &str,
    params: &mut HashMap<String, Tensor>,
    adapters: &[AttentionAdapter],
    scale: f64,
) -> Result<()> {
    for adapter in adapters {
        adapter.merge_into(identifier, params, scale)?;
    }
    Ok(())
}
