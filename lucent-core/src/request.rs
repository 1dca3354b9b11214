use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Mode, Result, SchedulerKind};

pub const DEFAULT_PROMPT: &str = "An astronaut riding a rainbow unicorn, cinematic, dramatic";
/// Largest accepted width or height.
pub const MAX_DIMENSION: usize = 2048;

/// A single prediction request. Every field has a default so clients only
/// send what they want to change.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    /// Split the prompt into one generation unit per line.
    pub batched_prompt: bool,
    /// Base image for img2img or inpainting.
    pub image: Option<PathBuf>,
    /// Inpainting mask. Black areas are preserved, white areas are repainted.
    pub mask: Option<PathBuf>,
    /// Image converted into a control map for ControlNet guidance.
    pub controlnet_image: Option<PathBuf>,
    pub width: usize,
    pub height: usize,
    pub num_outputs: usize,
    pub scheduler: SchedulerKind,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    /// 1.0 fully destroys the information in the base image.
    pub prompt_strength: f64,
    /// Drawn at random when absent.
    pub seed: Option<u64>,
    pub lora_scale: f64,
    pub condition_scale: f64,
    pub replicate_weights: Option<String>,
    pub lora_weights: Option<String>,
    pub disable_safety_checker: bool,
    /// Embed an invisible watermark in every output.
    pub apply_watermark: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            negative_prompt: String::new(),
            batched_prompt: false,
            image: None,
            mask: None,
            controlnet_image: None,
            width: 1024,
            height: 1024,
            num_outputs: 1,
            scheduler: SchedulerKind::default(),
            num_inference_steps: 6,
            guidance_scale: 2.0,
            prompt_strength: 0.8,
            seed: None,
            lora_scale: 0.6,
            condition_scale: 0.5,
            replicate_weights: None,
            lora_weights: None,
            disable_safety_checker: false,
            apply_watermark: true,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        return Err(Error::InvalidRequest(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<()> {
        check_range("num_outputs", self.num_outputs, 1, 4)?;
        check_range("num_inference_steps", self.num_inference_steps, 1, 20)?;
        check_range("guidance_scale", self.guidance_scale, 1.0, 20.0)?;
        check_range("prompt_strength", self.prompt_strength, 0.0, 1.0)?;
        check_range("lora_scale", self.lora_scale, 0.0, 1.0)?;
        check_range("condition_scale", self.condition_scale, 0.0, 1.0)?;
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % 8 != 0 {
                return Err(Error::InvalidRequest(format!(
                    "{name} must be a positive multiple of 8, got {value}"
                )));
            }
            check_range(name, value, 8, MAX_DIMENSION)?;
        }
        if self.batched_prompt && self.prompt.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "batched_prompt needs at least one prompt line".to_string(),
            ));
        }
        Ok(())
    }

    /// The fine-tune bundle to apply. `lora_weights` wins over
    /// `replicate_weights`; blank identifiers count as absent.
    pub fn weights(&self) -> Option<&str> {
        [&self.lora_weights, &self.replicate_weights]
            .into_iter()
            .flatten()
            .map(|w| w.trim())
            .find(|w| !w.is_empty())
    }
}

/// Outcome of a successful prediction.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Prediction {
    /// One PNG per kept image, in generation order.
    pub output: Vec<PathBuf>,
    pub seed: u64,
    /// Batch indices dropped by the safety checker.
    pub rejected: Vec<usize>,
    pub mode: Mode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a red bicycle", "seed": 13}"#).unwrap();
        assert_eq!(request.prompt, "a red bicycle");
        assert_eq!(request.seed, Some(13));
        assert_eq!(request.scheduler, SchedulerKind::Lcm);
        assert_eq!(request.num_inference_steps, 6);
        assert_eq!((request.width, request.height), (1024, 1024));
        assert!(request.apply_watermark);
        request.validate().unwrap();

        let request: GenerationRequest = serde_json::from_str(r#"{"apply_watermark": false}"#).unwrap();
        assert!(!request.apply_watermark);
    }

    #[test]
    fn scheduler_uses_wire_names() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"scheduler": "K_EULER_ANCESTRAL"}"#).unwrap();
        assert_eq!(request.scheduler, SchedulerKind::EulerAncestral);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            GenerationRequest { num_outputs: 5, ..Default::default() },
            GenerationRequest { num_inference_steps: 0, ..Default::default() },
            GenerationRequest { guidance_scale: 0.5, ..Default::default() },
            GenerationRequest { prompt_strength: 1.5, ..Default::default() },
            GenerationRequest { width: 1000, ..Default::default() },
            GenerationRequest { height: MAX_DIMENSION + 8, ..Default::default() },
            GenerationRequest { width: 8 * 1024 * 1024, ..Default::default() },
        ];
        for request in cases {
            assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
        }
    }

    #[test]
    fn largest_dimension_is_accepted() {
        let request = GenerationRequest {
            width: MAX_DIMENSION,
            height: 8,
            ..Default::default()
        };
        request.validate().unwrap();
    }

    #[test]
    fn lora_weights_take_precedence() {
        let request = GenerationRequest {
            lora_weights: Some("  ".to_string()),
            replicate_weights: Some("owner/bundle".to_string()),
            ..Default::default()
        };
        assert_eq!(request.weights(), Some("owner/bundle"));

        let request = GenerationRequest {
            lora_weights: Some("local/dir".to_string()),
            replicate_weights: Some("owner/bundle".to_string()),
            ..Default::default()
        };
        assert_eq!(request.weights(), Some("local/dir"));
    }
}
