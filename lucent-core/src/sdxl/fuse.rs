//! Fusing a generic LoRA checkpoint (the LCM distillation adapter) into the
//! pretrained backbone parameters.
//!
//! Two naming schemes are understood:
//! kohya `lora_unet_<path_with_underscores>.lora_down.weight` / `.lora_up.weight` / `.alpha`,
//! and peft `unet.<dotted.path>.lora_A.weight` / `.lora_B.weight`.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use log::{info, warn};

use crate::Result;

#[derive(Default)]
struct LoraLayer {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

impl LoraLayer {
    /// `scale * up @ down`, with `scale = alpha / rank` when an alpha is given.
    fn delta(&self, dims: &[usize], multiplier: f64) -> Result<Option<Tensor>> {
        let (Some(down), Some(up)) = (&self.down, &self.up) else {
            return Ok(None);
        };
        let rank = down.dim(0)?;
        let scale = self.alpha.map_or(1., |alpha| alpha / rank as f64) * multiplier;
        let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
        let delta = up.matmul(&down)?.affine(scale, 0.)?;
        if delta.elem_count() != dims.iter().product::<usize>() {
            return Ok(None);
        }
        Ok(Some(delta.reshape(dims)?))
    }
}

/// `down_blocks.0.resnets.1.conv1.weight` -> `down_blocks_0_resnets_1_conv1`
fn normalized(param: &str) -> Option<String> {
    param.strip_suffix(".weight").map(|p| p.replace('.', "_"))
}

fn split_lora_key(key: &str) -> Option<(String, &'static str)> {
    const SUFFIXES: [(&str, &str); 5] = [
        (".lora_down.weight", "down"),
        (".lora_up.weight", "up"),
        (".alpha", "alpha"),
        (".lora_A.weight", "down"),
        (".lora_B.weight", "up"),
    ];
    let (stem, part) = SUFFIXES
        .iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|stem| (stem, *part)))?;
    let stem = stem
        .strip_prefix("lora_unet_")
        .or_else(|| stem.strip_prefix("unet."))
        .or_else(|| stem.strip_prefix("base_model.model."))
        .unwrap_or(stem);
    Some((stem.replace('.', "_"), part))
}

/// Adds every LoRA delta to its target in `params`. Entries that match no
/// backbone parameter are skipped and counted in the log.
pub fn fuse_lora(
    params: &mut HashMap<String, Tensor>,
    lora: HashMap<String, Tensor>,
    multiplier: f64,
) -> Result<usize> {
    let mut layers: HashMap<String, LoraLayer> = HashMap::new();
    for (key, tensor) in lora {
        let Some((stem, part)) = split_lora_key(&key) else {
            continue;
        };
        let layer = layers.entry(stem).or_default();
        match part {
            "down" => layer.down = Some(tensor),
            "up" => layer.up = Some(tensor),
            _ => {
                layer.alpha = tensor
                    .to_dtype(DType::F64)?
                    .flatten_all()?
                    .to_vec1::<f64>()?
                    .first()
                    .copied()
            }
        }
    }

    let targets: HashMap<String, String> = params
        .keys()
        .filter_map(|name| normalized(name).map(|n| (n, name.clone())))
        .collect();

    let mut fused = 0;
    let mut unmatched = 0;
    for (stem, layer) in &layers {
        let Some(name) = targets.get(stem) else {
            unmatched += 1;
            continue;
        };
        let Some(base) = params.get(name) else {
            continue;
        };
        match layer.delta(base.dims(), multiplier)? {
            Some(delta) => {
                let merged = (base.to_dtype(DType::F32)? + delta.to_device(base.device())?)?
                    .to_dtype(base.dtype())?;
                params.insert(name.clone(), merged);
                fused += 1;
            }
            None => unmatched += 1,
        }
    }
    if unmatched > 0 {
        warn!("{unmatched} LoRA layers did not match the backbone");
    }
    info!("fused {fused} LoRA layers into the backbone");
    Ok(fused)
}
