//! Invisible watermarking of generated images.

use image::DynamicImage;

use crate::Result;

/// The 48-bit message SDXL pipelines embed.
pub const SDXL_MESSAGE: u64 = 0b1011_0011_1110_1100_1001_0000_0111_1011_1011_0001_1001_1110;
const MESSAGE_BITS: usize = 48;

/// Marks images as machine generated.
pub trait Watermarker: Send {
    fn apply(&mut self, images: Vec<DynamicImage>) -> Result<Vec<DynamicImage>>;
}

/// Leaves images untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWatermark;

impl Watermarker for NoWatermark {
    fn apply(&mut self, images: Vec<DynamicImage>) -> Result<Vec<DynamicImage>> {
        Ok(images)
    }
}

/// Writes the message bits, tiled in raster order, into the least
/// significant bit of the blue channel.
#[derive(Debug, Clone, Copy)]
pub struct BitWatermarker {
    pub message: u64,
}

impl Default for BitWatermarker {
    fn default() -> Self {
        Self {
            message: SDXL_MESSAGE,
        }
    }
}

fn bit(message: u64, index: usize) -> u8 {
    ((message >> (MESSAGE_BITS - 1 - index % MESSAGE_BITS)) & 1) as u8
}

impl BitWatermarker {
    /// Majority vote over every tiled copy of the message, `None` for images
    /// smaller than one copy.
    pub fn read(image: &DynamicImage) -> Option<u64> {
        let rgb = image.to_rgb8();
        let pixels = rgb.pixels().count();
        if pixels < MESSAGE_BITS {
            return None;
        }
        let mut ones = [0usize; MESSAGE_BITS];
        for (i, px) in rgb.pixels().enumerate() {
            ones[i % MESSAGE_BITS] += (px[2] & 1) as usize;
        }
        let message = (0..MESSAGE_BITS).fold(0u64, |acc, i| {
            let copies = pixels / MESSAGE_BITS + usize::from(i < pixels % MESSAGE_BITS);
            (acc << 1) | u64::from(2 * ones[i] > copies)
        });
        Some(message)
    }
}

impl Watermarker for BitWatermarker {
    fn apply(&mut self, images: Vec<DynamicImage>) -> Result<Vec<DynamicImage>> {
        Ok(images
            .into_iter()
            .map(|image| {
                let mut rgb = image.to_rgb8();
                for (i, px) in rgb.pixels_mut().enumerate() {
                    px[2] = (px[2] & !1) | bit(self.message, i);
                }
                DynamicImage::ImageRgb8(rgb)
            })
            .collect())
    }
}
