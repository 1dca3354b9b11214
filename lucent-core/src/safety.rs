//! Post-processing of generated images: watermarking, then safety
//! filtering.

use image::DynamicImage;
use log::{debug, warn};

use crate::watermark::{BitWatermarker, Watermarker};
use crate::{Error, Result};

/// Flags images that are unsafe under some content policy.
pub trait SafetyClassifier: Send {
    /// Returns the images, flagged ones possibly blanked, and one flag per
    /// image.
    fn classify(&mut self, images: Vec<DynamicImage>) -> Result<(Vec<DynamicImage>, Vec<bool>)>;
}

#[derive(Debug, Clone)]
pub struct Filtered {
    /// Surviving images with their index in the generated batch.
    pub kept: Vec<(usize, DynamicImage)>,
    pub flags: Vec<bool>,
}

impl Filtered {
    pub fn rejected(&self) -> Vec<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(i, &flagged)| flagged.then_some(i))
            .collect()
    }
}

/// Per-request switches of the post-processing stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostOptions {
    pub watermark: bool,
    pub safety_check: bool,
}

impl Default for PostOptions {
    fn default() -> Self {
        Self {
            watermark: true,
            safety_check: true,
        }
    }
}

pub struct PostProcessor {
    classifier: Box<dyn SafetyClassifier>,
    watermarker: Box<dyn Watermarker>,
}

impl PostProcessor {
    pub fn new(classifier: Box<dyn SafetyClassifier>) -> Self {
        Self {
            classifier,
            watermarker: Box::new(BitWatermarker::default()),
        }
    }

    pub fn with_watermarker(mut self, watermarker: Box<dyn Watermarker>) -> Self {
        self.watermarker = watermarker;
        self
    }

    /// Watermarks, then drops flagged images. Either stage is skipped when
    /// its option is unset; without the safety check every image is kept.
    pub fn filter(&mut self, images: Vec<DynamicImage>, options: PostOptions) -> Result<Filtered> {
        let images = if options.watermark {
            self.watermarker.apply(images)?
        } else {
            debug!("watermark disabled for this request");
            images
        };

        if !options.safety_check {
            let flags = vec![false; images.len()];
            return Ok(Filtered {
                kept: images.into_iter().enumerate().collect(),
                flags,
            });
        }

        let count = images.len();
        let (images, flags) = self.classifier.classify(images)?;
        if flags.len() != count || images.len() != count {
            return Err(Error::SafetyVerdicts {
                expected: count,
                got: flags.len().min(images.len()),
            });
        }
        let kept: Vec<(usize, DynamicImage)> = images
            .into_iter()
            .enumerate()
            .filter(|(i, _)| {
                if flags[*i] {
                    warn!("NSFW content detected in image {i}");
                }
                !flags[*i]
            })
            .collect();
        if count > 0 && kept.is_empty() {
            return Err(Error::AllOutputsRejected { count });
        }
        Ok(Filtered { kept, flags })
    }
}
