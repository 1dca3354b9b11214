//! Control-map preprocessing for ControlNet guidance.

use image::{DynamicImage, GrayImage, Luma, RgbImage};

use crate::Result;

/// Turns a reference image into the conditioning map a ControlNet expects.
pub trait ControlDetector: Send {
    fn detect(&self, image: &DynamicImage) -> Result<DynamicImage>;
}

/// Canny edge map with hysteresis thresholds over the L1 Sobel magnitude.
/// Output is a binary 3-channel image.
#[derive(Debug, Clone, Copy)]
pub struct CannyDetector {
    pub low_threshold: f32,
    pub high_threshold: f32,
}

impl Default for CannyDetector {
    fn default() -> Self {
        Self {
            low_threshold: 100.0,
            high_threshold: 200.0,
        }
    }
}

impl ControlDetector for CannyDetector {
    fn detect(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let edges = self.edges(&image.to_luma8());
        let mut rgb = RgbImage::new(edges.width(), edges.height());
        for (x, y, px) in edges.enumerate_pixels() {
            rgb.put_pixel(x, y, image::Rgb([px[0]; 3]));
        }
        Ok(DynamicImage::ImageRgb8(rgb))
    }
}

impl CannyDetector {
    pub fn edges(&self, gray: &GrayImage) -> GrayImage {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let mut out = GrayImage::new(w as u32, h as u32);
        if w < 3 || h < 3 {
            return out;
        }
        let at = |x: usize, y: usize| gray.get_pixel(x as u32, y as u32)[0] as f32;

        let mut magnitude = vec![0f32; w * h];
        let mut sector = vec![0u8; w * h];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = (at(x + 1, y - 1) + 2. * at(x + 1, y) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2. * at(x - 1, y) + at(x - 1, y + 1));
                let gy = (at(x - 1, y + 1) + 2. * at(x, y + 1) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2. * at(x, y - 1) + at(x + 1, y - 1));
                magnitude[y * w + x] = gx.abs() + gy.abs();
                sector[y * w + x] = direction_sector(gx, gy);
            }
        }

        // Non-maximum suppression along the gradient direction.
        let mut strength = vec![0u8; w * h];
        let mut strong = Vec::new();
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let i = y * w + x;
                let m = magnitude[i];
                if m <= self.low_threshold {
                    continue;
                }
                let (a, b) = match sector[i] {
                    0 => (magnitude[i - 1], magnitude[i + 1]),
                    1 => (magnitude[i - w - 1], magnitude[i + w + 1]),
                    2 => (magnitude[i - w], magnitude[i + w]),
                    _ => (magnitude[i - w + 1], magnitude[i + w - 1]),
                };
                if m < a || m < b {
                    continue;
                }
                if m > self.high_threshold {
                    strength[i] = 2;
                    strong.push((x, y));
                } else {
                    strength[i] = 1;
                }
            }
        }

        // Hysteresis: weak pixels survive only when connected to a strong one.
        while let Some((x, y)) = strong.pop() {
            out.put_pixel(x as u32, y as u32, Luma([255]));
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    let j = ny * w + nx;
                    if strength[j] == 1 {
                        strength[j] = 2;
                        strong.push((nx, ny));
                    }
                }
            }
        }
        out
    }
}

/// Quantizes the gradient angle into horizontal, 45°, vertical and 135°.
fn direction_sector(gx: f32, gy: f32) -> u8 {
    let mut angle = gy.atan2(gx).to_degrees();
    if angle < 0. {
        angle += 180.;
    }
    match angle {
        a if !(22.5..157.5).contains(&a) => 0,
        a if a < 67.5 => 1,
        a if a < 112.5 => 2,
        _ => 3,
    }
}
