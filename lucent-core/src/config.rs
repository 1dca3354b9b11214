//! Process-wide settings, read from a JSON file and overridden from the
//! command line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::DeviceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F16,
    Bf16,
    F32,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

/// Preprocessor turning `controlnet_image` into a control map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlDetectorKind {
    /// Body keypoints, matching an OpenPose controlnet.
    #[default]
    Openpose,
    /// Edge map, matching a Canny controlnet.
    Canny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where downloaded weight bundles are extracted.
    pub cache_dir: PathBuf,
    /// Where `out-<i>.png` files are written.
    pub output_dir: PathBuf,
    /// Hub cache location. Uses the hub's default when unset.
    pub hub_cache_dir: Option<PathBuf>,
    /// Hub repository id or weights identifier of a diffusers SDXL layout.
    pub base_model: String,
    /// fp16-safe VAE replacing the base model's.
    pub vae_model: Option<String>,
    pub lcm_lora: String,
    pub fuse_lcm_lora: bool,
    pub safety_model: String,
    /// SDXL controlnet serving the control modes. Those modes are refused
    /// when unset.
    pub controlnet_model: Option<String>,
    pub control_detector: ControlDetectorKind,
    /// Repository holding the body pose network.
    pub pose_model: String,
    /// Bundle applied to the txt2img family before serving.
    pub default_weights: Option<String>,
    pub device: DeviceMap,
    pub precision: Precision,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
    /// Capacity of the weights cache.
    pub max_cached_weights: usize,
    /// Share of unmatched backbone tensors above which a warning is logged.
    pub mismatch_warn_ratio: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("weights-cache"),
            output_dir: std::env::temp_dir(),
            hub_cache_dir: None,
            base_model: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            vae_model: Some("madebyollin/sdxl-vae-fp16-fix".to_string()),
            lcm_lora: "latent-consistency/lcm-lora-sdxl".to_string(),
            fuse_lcm_lora: true,
            safety_model: "CompVis/stable-diffusion-safety-checker".to_string(),
            controlnet_model: Some("thibaud/controlnet-openpose-sdxl-1.0".to_string()),
            control_detector: ControlDetectorKind::default(),
            pose_model: "lllyasviel/Annotators".to_string(),
            default_weights: None,
            device: DeviceMap::default(),
            precision: Precision::default(),
            use_flash_attn: false,
            sliced_attention_size: None,
            max_cached_weights: 8,
            mismatch_warn_ratio: 0.5,
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"device": "cpu", "precision": "f32", "default_weights": "owner/bundle"}"#,
        )
        .unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.device, DeviceMap::ForceCpu);
        assert_eq!(settings.precision.dtype(), DType::F32);
        assert_eq!(settings.default_weights.as_deref(), Some("owner/bundle"));
        assert_eq!(settings.max_cached_weights, 8);
        assert!(settings.fuse_lcm_lora);
        assert_eq!(settings.control_detector, ControlDetectorKind::Openpose);
        assert!(settings.controlnet_model.is_some());
    }

    #[test]
    fn control_stack_is_configurable() {
        let settings: Settings = serde_json::from_str(
            r#"{"control_detector": "canny", "controlnet_model": "diffusers/controlnet-canny-sdxl-1.0"}"#,
        )
        .unwrap();
        assert_eq!(settings.control_detector, ControlDetectorKind::Canny);
        assert_eq!(
            settings.controlnet_model.as_deref(),
            Some("diffusers/controlnet-canny-sdxl-1.0")
        );

        let settings: Settings = serde_json::from_str(r#"{"controlnet_model": null}"#).unwrap();
        assert_eq!(settings.controlnet_model, None);
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{").unwrap();
        let err = Settings::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("settings.json"));
    }
}
