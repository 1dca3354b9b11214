//! OpenPose body keypoints as a control map: a six-stage convolutional
//! network predicts part heatmaps and part affinity fields, keypoints are
//! the heatmap peaks, and limbs are assembled greedily along the fields.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, Luma, Rgb, RgbImage};
use log::debug;

use crate::control::ControlDetector;
use crate::Result;

const PARTS: usize = 18;
const HEATMAP_CHANNELS: usize = PARTS + 1;
const PAF_CHANNELS: usize = 38;
const STRIDE: u32 = 8;
const BOX_SIZE: f64 = 368.;
const SCALE_SEARCH: f64 = 0.5;
const PAD_VALUE: u8 = 128;
const PEAK_THRESHOLD: f32 = 0.1;
const PAF_THRESHOLD: f32 = 0.05;
const LIMB_SAMPLES: usize = 10;
const STICK_WIDTH: f32 = 4.;

/// Part pairs joined by each limb, 1-based.
const LIMBS: [(usize, usize); 19] = [
    (2, 3), (2, 6), (3, 4), (4, 5), (6, 7), (7, 8), (2, 9), (9, 10), (10, 11), (2, 12),
    (12, 13), (13, 14), (2, 1), (1, 15), (15, 17), (1, 16), (16, 18), (3, 17), (6, 18),
];

/// Affinity field channels (x, y) of each limb, offset by the heatmap count.
const LIMB_FIELDS: [(usize, usize); 19] = [
    (31, 32), (39, 40), (33, 34), (35, 36), (41, 42), (43, 44), (19, 20), (21, 22), (23, 24),
    (25, 26), (27, 28), (29, 30), (47, 48), (49, 50), (53, 54), (51, 52), (55, 56), (37, 38),
    (45, 46),
];

const COLORS: [[u8; 3]; PARTS] = [
    [255, 0, 0], [255, 85, 0], [255, 170, 0], [255, 255, 0], [170, 255, 0], [85, 255, 0],
    [0, 255, 0], [0, 255, 85], [0, 255, 170], [0, 255, 255], [0, 170, 255], [0, 85, 255],
    [0, 0, 255], [85, 0, 255], [170, 0, 255], [255, 0, 255], [255, 0, 170], [255, 0, 85],
];

enum Layer {
    Conv { conv: Conv2d, relu: bool },
    Pool,
}

struct Stack(Vec<Layer>);

impl Stack {
    /// `(name, in, out, kernel)`; `None` is a 2x2 max pool. The last
    /// convolution of a stack is linear when `linear_tail` is set.
    fn new(vs: &VarBuilder, spec: &[Option<(&str, usize, usize, usize)>], linear_tail: bool) -> candle_core::Result<Self> {
        let last = spec.len() - 1;
        let mut layers = Vec::with_capacity(spec.len());
        for (i, layer) in spec.iter().enumerate() {
            layers.push(match layer {
                Some((name, c_in, c_out, kernel)) => {
                    let cfg = Conv2dConfig {
                        padding: kernel / 2,
                        ..Default::default()
                    };
                    Layer::Conv {
                        conv: conv2d(*c_in, *c_out, *kernel, cfg, vs.pp(*name))?,
                        relu: !(linear_tail && i == last),
                    }
                }
                None => Layer::Pool,
            });
        }
        Ok(Self(layers))
    }
}

impl Module for Stack {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.0 {
            xs = match layer {
                Layer::Conv { conv, relu: true } => conv.forward(&xs)?.relu()?,
                Layer::Conv { conv, relu: false } => conv.forward(&xs)?,
                Layer::Pool => xs.max_pool2d(2)?,
            };
        }
        Ok(xs)
    }
}

/// The body pose network. Weights use the flat layer names of the original
/// Caffe model, e.g. `conv1_1.weight` or `Mconv7_stage6_L2.bias`.
pub struct BodyPoseNet {
    features: Stack,
    /// `(affinity, heatmap)` branches per stage.
    stages: Vec<(Stack, Stack)>,
}

impl BodyPoseNet {
    pub fn new(vs: VarBuilder) -> candle_core::Result<Self> {
        let features = Stack::new(
            &vs,
            &[
                Some(("conv1_1", 3, 64, 3)),
                Some(("conv1_2", 64, 64, 3)),
                None,
                Some(("conv2_1", 64, 128, 3)),
                Some(("conv2_2", 128, 128, 3)),
                None,
                Some(("conv3_1", 128, 256, 3)),
                Some(("conv3_2", 256, 256, 3)),
                Some(("conv3_3", 256, 256, 3)),
                Some(("conv3_4", 256, 256, 3)),
                None,
                Some(("conv4_1", 256, 512, 3)),
                Some(("conv4_2", 512, 512, 3)),
                Some(("conv4_3_CPM", 512, 256, 3)),
                Some(("conv4_4_CPM", 256, 128, 3)),
            ],
            false,
        )?;

        let mut stages = Vec::with_capacity(6);
        for branch_pair in 1..=6 {
            let branch = |l: usize, out: usize| -> candle_core::Result<Stack> {
                let names: Vec<String> = if branch_pair == 1 {
                    (1..=5).map(|i| format!("conv5_{i}_CPM_L{l}")).collect()
                } else {
                    (1..=7).map(|i| format!("Mconv{i}_stage{branch_pair}_L{l}")).collect()
                };
                let spec: Vec<_> = if branch_pair == 1 {
                    vec![
                        Some((names[0].as_str(), 128, 128, 3)),
                        Some((names[1].as_str(), 128, 128, 3)),
                        Some((names[2].as_str(), 128, 128, 3)),
                        Some((names[3].as_str(), 128, 512, 1)),
                        Some((names[4].as_str(), 512, out, 1)),
                    ]
                } else {
                    let c_in = PAF_CHANNELS + HEATMAP_CHANNELS + 128;
                    vec![
                        Some((names[0].as_str(), c_in, 128, 7)),
                        Some((names[1].as_str(), 128, 128, 7)),
                        Some((names[2].as_str(), 128, 128, 7)),
                        Some((names[3].as_str(), 128, 128, 7)),
                        Some((names[4].as_str(), 128, 128, 7)),
                        Some((names[5].as_str(), 128, 128, 1)),
                        Some((names[6].as_str(), 128, out, 1)),
                    ]
                };
                Stack::new(&vs, &spec, true)
            };
            stages.push((branch(1, PAF_CHANNELS)?, branch(2, HEATMAP_CHANNELS)?));
        }
        Ok(Self { features, stages })
    }

    /// Returns `(affinity fields, heatmaps)` at 1/8 of the input resolution.
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let features = self.features.forward(xs)?;
        let mut input = features.clone();
        let mut outputs = None;
        for (affinity, heatmap) in &self.stages {
            let paf = affinity.forward(&input)?;
            let heat = heatmap.forward(&input)?;
            input = Tensor::cat(&[&paf, &heat, &features], 1)?;
            outputs = Some((paf, heat));
        }
        outputs.ok_or_else(|| candle_core::Error::Msg("pose network has no stages".into()))
    }
}

/// Row-major single-channel maps of one size.
#[derive(Debug, Clone)]
struct Maps {
    width: usize,
    height: usize,
    channels: Vec<Vec<f32>>,
}

impl Maps {
    fn at(&self, channel: usize, x: usize, y: usize) -> f32 {
        self.channels[channel][y * self.width + x]
    }
}

/// Upsamples network output `(c, h, w)` by the stride, crops the padding and
/// resizes to `(width, height)`.
fn restore_maps(output: &Tensor, valid: (u32, u32), width: u32, height: u32) -> Result<Maps> {
    let (c, h, w) = output.dims3()?;
    let data = output.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let channels = data
        .chunks(h * w)
        .take(c)
        .map(|plane| -> Result<Vec<f32>> {
            let map: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(w as u32, h as u32, plane.to_vec())
                    .ok_or_else(|| candle_core::Error::Msg("pose map has the wrong size".into()))?;
            let up = image::imageops::resize(&map, w as u32 * STRIDE, h as u32 * STRIDE, FilterType::CatmullRom);
            let cropped = image::imageops::crop_imm(&up, 0, 0, valid.0, valid.1).to_image();
            Ok(image::imageops::resize(&cropped, width, height, FilterType::CatmullRom).into_raw())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Maps {
        width: width as usize,
        height: height as usize,
        channels,
    })
}

/// Separable Gaussian blur, mirrored at the borders.
fn gaussian_blur(map: &[f32], width: usize, height: usize, sigma: f32) -> Vec<f32> {
    let radius = (4. * sigma + 0.5) as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2. * sigma * sigma)).exp())
        .collect();
    let norm: f32 = kernel.iter().sum();
    let reflect = |i: isize, n: usize| -> usize {
        let n = n as isize;
        let mut i = i;
        loop {
            if i < 0 {
                i = -i - 1;
            } else if i >= n {
                i = 2 * n - i - 1;
            } else {
                return i as usize;
            }
        }
    };

    let mut rows = vec![0f32; map.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect(x as isize + k as isize - radius, width);
                acc += weight * map[y * width + sx];
            }
            rows[y * width + x] = acc / norm;
        }
    }
    let mut out = vec![0f32; map.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = reflect(y as isize + k as isize - radius, height);
                acc += weight * rows[sy * width + x];
            }
            out[y * width + x] = acc / norm;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Peak {
    x: usize,
    y: usize,
    score: f32,
    /// Index into the flattened list of all peaks.
    id: usize,
}

/// Local maxima of each smoothed part heatmap above the peak threshold.
fn find_peaks(heatmaps: &Maps) -> Vec<Vec<Peak>> {
    let (w, h) = (heatmaps.width, heatmaps.height);
    let mut next_id = 0;
    (0..PARTS)
        .map(|part| {
            let original = &heatmaps.channels[part];
            let smooth = gaussian_blur(original, w, h, 3.);
            let mut peaks = Vec::new();
            for y in 0..h {
                for x in 0..w {
                    let v = smooth[y * w + x];
                    let neighbours = [
                        (y > 0).then(|| smooth[(y - 1) * w + x]),
                        (y + 1 < h).then(|| smooth[(y + 1) * w + x]),
                        (x > 0).then(|| smooth[y * w + x - 1]),
                        (x + 1 < w).then(|| smooth[y * w + x + 1]),
                    ];
                    if v > PEAK_THRESHOLD && neighbours.iter().all(|n| n.map_or(v >= 0., |n| v >= n)) {
                        peaks.push(Peak {
                            x,
                            y,
                            score: original[y * w + x],
                            id: next_id,
                        });
                        next_id += 1;
                    }
                }
            }
            peaks
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Connection {
    from: usize,
    to: usize,
    score: f32,
}

/// Scores every candidate pair of each limb along its affinity field and
/// keeps the best non-conflicting pairs. `None` marks a limb with a missing
/// endpoint part.
fn connect_limbs(peaks: &[Vec<Peak>], fields: &Maps, image_height: usize) -> Vec<Option<Vec<Connection>>> {
    LIMBS
        .iter()
        .zip(LIMB_FIELDS)
        .map(|(&(a, b), (fx, fy))| {
            let (cand_a, cand_b) = (&peaks[a - 1], &peaks[b - 1]);
            if cand_a.is_empty() || cand_b.is_empty() {
                return None;
            }
            let (fx, fy) = (fx - HEATMAP_CHANNELS, fy - HEATMAP_CHANNELS);
            let mut candidates = Vec::new();
            for (i, pa) in cand_a.iter().enumerate() {
                for (j, pb) in cand_b.iter().enumerate() {
                    let (dx, dy) = (pb.x as f32 - pa.x as f32, pb.y as f32 - pa.y as f32);
                    let norm = (dx * dx + dy * dy).sqrt().max(0.001);
                    let (ux, uy) = (dx / norm, dy / norm);
                    let scores: Vec<f32> = (0..LIMB_SAMPLES)
                        .map(|s| {
                            let t = s as f32 / (LIMB_SAMPLES - 1) as f32;
                            let x = (pa.x as f32 + t * dx).round() as usize;
                            let y = (pa.y as f32 + t * dy).round() as usize;
                            fields.at(fx, x, y) * ux + fields.at(fy, x, y) * uy
                        })
                        .collect();
                    let prior = (0.5 * image_height as f32 / norm - 1.).min(0.);
                    let score = scores.iter().sum::<f32>() / scores.len() as f32 + prior;
                    let supported = scores.iter().filter(|&&s| s > PAF_THRESHOLD).count();
                    if supported as f32 > 0.8 * scores.len() as f32 && score > 0. {
                        candidates.push((i, j, score));
                    }
                }
            }
            candidates.sort_by(|x, y| y.2.total_cmp(&x.2));

            let mut used_a = vec![false; cand_a.len()];
            let mut used_b = vec![false; cand_b.len()];
            let mut connections = Vec::new();
            for (i, j, score) in candidates {
                if used_a[i] || used_b[j] {
                    continue;
                }
                used_a[i] = true;
                used_b[j] = true;
                connections.push(Connection {
                    from: cand_a[i].id,
                    to: cand_b[j].id,
                    score,
                });
                if connections.len() >= cand_a.len().min(cand_b.len()) {
                    break;
                }
            }
            Some(connections)
        })
        .collect()
}

/// One assembled skeleton: a peak id per part, the summed score and the
/// number of parts found.
#[derive(Debug, Clone, PartialEq)]
struct Person {
    parts: [Option<usize>; PARTS],
    score: f32,
    count: usize,
}

fn assemble_people(all: &[Peak], limbs: &[Option<Vec<Connection>>]) -> Vec<Person> {
    let mut people: Vec<Person> = Vec::new();
    for (k, connections) in limbs.iter().enumerate() {
        let Some(connections) = connections else {
            continue;
        };
        let (a, b) = (LIMBS[k].0 - 1, LIMBS[k].1 - 1);
        for c in connections {
            let found: Vec<usize> = people
                .iter()
                .enumerate()
                .filter(|(_, p)| p.parts[a] == Some(c.from) || p.parts[b] == Some(c.to))
                .map(|(i, _)| i)
                .take(2)
                .collect();
            match found.as_slice() {
                [j] => {
                    let person = &mut people[*j];
                    if person.parts[b] != Some(c.to) {
                        person.parts[b] = Some(c.to);
                        person.count += 1;
                        person.score += all[c.to].score + c.score;
                    }
                }
                [j1, j2] => {
                    let (j1, j2) = (*j1, *j2);
                    let overlap = (0..PARTS)
                        .any(|p| people[j1].parts[p].is_some() && people[j2].parts[p].is_some());
                    if overlap {
                        let person = &mut people[j1];
                        person.parts[b] = Some(c.to);
                        person.count += 1;
                        person.score += all[c.to].score + c.score;
                    } else {
                        let other = people.remove(j2);
                        let person = &mut people[j1];
                        for p in 0..PARTS {
                            if other.parts[p].is_some() {
                                person.parts[p] = other.parts[p];
                            }
                        }
                        person.count += other.count;
                        person.score += other.score + c.score;
                    }
                }
                _ if k < 17 => {
                    let mut parts = [None; PARTS];
                    parts[a] = Some(c.from);
                    parts[b] = Some(c.to);
                    people.push(Person {
                        parts,
                        score: all[c.from].score + all[c.to].score + c.score,
                        count: 2,
                    });
                }
                _ => {}
            }
        }
    }
    people.retain(|p| p.count >= 4 && p.score / p.count as f32 >= 0.4);
    people
}

fn blend(canvas: &mut RgbImage, x: i64, y: i64, color: [u8; 3], alpha: f32) {
    if x < 0 || y < 0 || x >= canvas.width() as i64 || y >= canvas.height() as i64 {
        return;
    }
    let px = canvas.get_pixel_mut(x as u32, y as u32);
    for c in 0..3 {
        px[c] = ((1. - alpha) * px[c] as f32 + alpha * color[c] as f32).round() as u8;
    }
}

/// Limbs as translucent ellipses, then joints as solid discs.
fn draw_skeletons(width: u32, height: u32, all: &[Peak], people: &[Person]) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    for (limb, &(a, b)) in LIMBS.iter().take(17).enumerate() {
        for person in people {
            let (Some(pa), Some(pb)) = (person.parts[a - 1], person.parts[b - 1]) else {
                continue;
            };
            let (pa, pb) = (all[pa], all[pb]);
            let (cx, cy) = ((pa.x + pb.x) as f32 / 2., (pa.y + pb.y) as f32 / 2.);
            let (dx, dy) = (pb.x as f32 - pa.x as f32, pb.y as f32 - pa.y as f32);
            let len = (dx * dx + dy * dy).sqrt();
            let half = (len / 2.).max(1.);
            let (ux, uy) = if len > 0. { (dx / len, dy / len) } else { (1., 0.) };
            let reach = half.max(STICK_WIDTH).ceil() as i64;
            for y in cy as i64 - reach..=cy as i64 + reach {
                for x in cx as i64 - reach..=cx as i64 + reach {
                    let (rx, ry) = (x as f32 - cx, y as f32 - cy);
                    let along = (rx * ux + ry * uy) / half;
                    let across = (-rx * uy + ry * ux) / STICK_WIDTH;
                    if along * along + across * across <= 1. {
                        blend(&mut canvas, x, y, COLORS[limb], 0.6);
                    }
                }
            }
        }
    }
    for (part, color) in COLORS.iter().enumerate() {
        for person in people {
            let Some(id) = person.parts[part] else {
                continue;
            };
            let (x, y) = (all[id].x as i64, all[id].y as i64);
            for dy in -4i64..=4 {
                for dx in -4i64..=4 {
                    if dx * dx + dy * dy <= 16 {
                        blend(&mut canvas, x + dx, y + dy, *color, 1.);
                    }
                }
            }
        }
    }
    canvas
}

/// Renders the body skeletons found in the input as a control map.
pub struct PoseDetector {
    net: BodyPoseNet,
    device: Device,
    dtype: DType,
    /// Length of the shorter side the input is resized to before detection.
    pub detect_resolution: u32,
}

impl PoseDetector {
    pub fn new(net: BodyPoseNet, device: &Device, dtype: DType) -> Self {
        Self {
            net,
            device: device.clone(),
            dtype,
            detect_resolution: 512,
        }
    }

    pub fn load(file: &Path, device: &Device) -> anyhow::Result<Self> {
        // The network is small; f32 keeps the peak thresholds meaningful.
        let dtype = DType::F32;
        let vs = match file.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? },
            _ => VarBuilder::from_pth(file, dtype, device)?,
        };
        let net = BodyPoseNet::new(vs)
            .with_context(|| format!("failed to build the pose network from {}", file.display()))?;
        Ok(Self::new(net, device, dtype))
    }

    /// Resizes so the shorter side is `detect_resolution`, both sides
    /// rounded to multiples of 64.
    fn working_size(&self, width: u32, height: u32) -> (u32, u32) {
        let k = self.detect_resolution as f64 / width.min(height).max(1) as f64;
        let round = |v: u32| (((v as f64 * k) / 64.).round() as u32).max(1) * 64;
        (round(width), round(height))
    }

    /// Heatmaps and affinity fields at the resolution of `image`.
    fn maps(&self, image: &RgbImage) -> Result<(Maps, Maps)> {
        let (width, height) = image.dimensions();
        let scale = SCALE_SEARCH * BOX_SIZE / height as f64;
        let (sw, sh) = (
            ((width as f64 * scale).round() as u32).max(1),
            ((height as f64 * scale).round() as u32).max(1),
        );
        let scaled = image::imageops::resize(image, sw, sh, FilterType::CatmullRom);
        let (pw, ph) = (sw.div_ceil(STRIDE) * STRIDE, sh.div_ceil(STRIDE) * STRIDE);
        let mut padded = RgbImage::from_pixel(pw, ph, Rgb([PAD_VALUE; 3]));
        image::imageops::replace(&mut padded, &scaled, 0, 0);

        // The network was trained on BGR input.
        let bgr: Vec<u8> = padded.pixels().flat_map(|p| [p[2], p[1], p[0]]).collect();
        let input = Tensor::from_vec(bgr, (ph as usize, pw as usize, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1. / 256., -0.5)?
            .unsqueeze(0)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let (paf, heat) = self.net.forward(&input)?;
        let heat = restore_maps(&heat.squeeze(0)?, (sw, sh), width, height)?;
        let paf = restore_maps(&paf.squeeze(0)?, (sw, sh), width, height)?;
        Ok((heat, paf))
    }
}

impl ControlDetector for PoseDetector {
    fn detect(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let (width, height) = self.working_size(image.width(), image.height());
        let rgb = image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8();
        let (heatmaps, fields) = self.maps(&rgb)?;
        let peaks = find_peaks(&heatmaps);
        let limbs = connect_limbs(&peaks, &fields, height as usize);
        let all: Vec<Peak> = peaks.into_iter().flatten().collect();
        let people = assemble_people(&all, &limbs);
        debug!("pose detector found {} keypoints and {} people", all.len(), people.len());
        Ok(DynamicImage::ImageRgb8(draw_skeletons(width, height, &all, &people)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: usize, height: usize, channels: usize) -> Maps {
        Maps {
            width,
            height,
            channels: vec![vec![0.; width * height]; channels],
        }
    }

    /// A bump on the heatmap of `part`, wide enough to survive the blur.
    fn bump(maps: &mut Maps, part: usize, cx: usize, cy: usize) {
        for y in 0..maps.height {
            for x in 0..maps.width {
                let d2 = (x as f32 - cx as f32).powi(2) + (y as f32 - cy as f32).powi(2);
                maps.channels[part][y * maps.width + x] += (-d2 / 8.).exp();
            }
        }
    }

    /// Affinity along the segment between two points, for limb `k`.
    fn field(maps: &mut Maps, k: usize, from: (usize, usize), to: (usize, usize)) {
        let (fx, fy) = (LIMB_FIELDS[k].0 - HEATMAP_CHANNELS, LIMB_FIELDS[k].1 - HEATMAP_CHANNELS);
        let (dx, dy) = (to.0 as f32 - from.0 as f32, to.1 as f32 - from.1 as f32);
        let norm = (dx * dx + dy * dy).sqrt();
        for s in 0..=100 {
            let t = s as f32 / 100.;
            let x = (from.0 as f32 + t * dx).round() as usize;
            let y = (from.1 as f32 + t * dy).round() as usize;
            for (ny, nx) in [y - 1, y, y + 1].into_iter().flat_map(|ny| [(ny, x - 1), (ny, x), (ny, x + 1)]) {
                maps.channels[fx][ny * maps.width + nx] = dx / norm;
                maps.channels[fy][ny * maps.width + nx] = dy / norm;
            }
        }
    }

    #[test]
    fn network_outputs_are_at_an_eighth_of_the_input() {
        let net = BodyPoseNet::new(VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();
        let input = Tensor::zeros((1, 3, 32, 48), DType::F32, &Device::Cpu).unwrap();
        let (paf, heat) = net.forward(&input).unwrap();
        assert_eq!(paf.dims(), &[1, PAF_CHANNELS, 4, 6]);
        assert_eq!(heat.dims(), &[1, HEATMAP_CHANNELS, 4, 6]);
    }

    #[test]
    fn blur_preserves_mass_of_a_flat_map() {
        let out = gaussian_blur(&[1.; 30], 6, 5, 3.);
        assert!(out.iter().all(|v| (v - 1.).abs() < 1e-5));
    }

    #[test]
    fn peaks_are_local_maxima_above_threshold() {
        let mut maps = blank(40, 40, HEATMAP_CHANNELS);
        bump(&mut maps, 0, 10, 12);
        bump(&mut maps, 0, 30, 28);
        bump(&mut maps, 3, 20, 20);
        let peaks = find_peaks(&maps);
        assert_eq!(peaks[0].len(), 2);
        assert_eq!((peaks[0][0].x, peaks[0][0].y), (10, 12));
        assert_eq!((peaks[0][1].x, peaks[0][1].y), (30, 28));
        assert_eq!(peaks[3].len(), 1);
        assert_eq!(peaks[3][0].id, 2);
        assert!(peaks[1].is_empty());
    }

    #[test]
    fn limbs_follow_the_affinity_field() {
        let mut heat = blank(64, 64, HEATMAP_CHANNELS);
        // Two necks and two right shoulders; the field joins 20,10 to 10,30.
        bump(&mut heat, 1, 20, 10);
        bump(&mut heat, 1, 50, 10);
        bump(&mut heat, 2, 10, 30);
        bump(&mut heat, 2, 54, 40);
        let mut fields = blank(64, 64, PAF_CHANNELS);
        field(&mut fields, 0, (20, 10), (10, 30));

        let peaks = find_peaks(&heat);
        let limbs = connect_limbs(&peaks, &fields, 64);
        let neck_to_shoulder = limbs[0].as_ref().unwrap();
        assert_eq!(neck_to_shoulder.len(), 1);
        let c = neck_to_shoulder[0];
        let all: Vec<Peak> = peaks.into_iter().flatten().collect();
        assert_eq!((all[c.from].x, all[c.from].y), (20, 10));
        assert_eq!((all[c.to].x, all[c.to].y), (10, 30));
        // No left shoulder was found.
        assert!(limbs[1].is_none());
    }

    fn peak(id: usize) -> Peak {
        Peak {
            x: 4 * id,
            y: 4 * id,
            score: 1.,
            id,
        }
    }

    #[test]
    fn people_need_four_parts() {
        let all: Vec<Peak> = (0..6).map(peak).collect();
        let mut limbs: Vec<Option<Vec<Connection>>> = vec![None; LIMBS.len()];
        let link = |from, to| Some(vec![Connection { from, to, score: 1. }]);
        // neck-right shoulder, right shoulder-elbow, elbow-wrist
        limbs[0] = link(1, 2);
        limbs[2] = link(2, 3);
        limbs[3] = link(3, 4);
        let people = assemble_people(&all, &limbs);
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].count, 4);
        assert_eq!(people[0].parts[1..5], [Some(1), Some(2), Some(3), Some(4)]);

        limbs[3] = None;
        assert!(assemble_people(&all, &limbs).is_empty());
    }

    #[test]
    fn disjoint_fragments_merge() {
        let all: Vec<Peak> = (0..18).map(peak).collect();
        let mut limbs: Vec<Option<Vec<Connection>>> = vec![None; LIMBS.len()];
        let link = |from, to| Some(vec![Connection { from, to, score: 1. }]);
        // neck, right shoulder and elbow
        limbs[0] = link(1, 2);
        limbs[2] = link(2, 3);
        // right eye and ear start a second fragment
        limbs[14] = link(14, 16);
        // shoulder to ear joins them
        limbs[17] = link(2, 16);
        // an unmatched face limb never starts a person
        limbs[18] = link(5, 17);
        let people = assemble_people(&all, &limbs);
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].count, 5);
        assert_eq!(people[0].parts[14], Some(14));
        assert_eq!(people[0].parts[17], None);
    }

    #[test]
    fn skeleton_is_drawn_in_part_colours() {
        let all = vec![
            Peak { x: 10, y: 10, score: 1., id: 0 },
            Peak { x: 30, y: 10, score: 1., id: 1 },
        ];
        let mut parts = [None; PARTS];
        parts[1] = Some(0);
        parts[2] = Some(1);
        let person = Person { parts, score: 4., count: 4 };
        let canvas = draw_skeletons(40, 20, &all, &[person]);
        assert_eq!(canvas.get_pixel(10, 10), &Rgb(COLORS[1]));
        assert_eq!(canvas.get_pixel(30, 10), &Rgb(COLORS[2]));
        // Midway along the limb, blended at 60% over black.
        let mid = canvas.get_pixel(20, 10);
        assert_eq!(mid, &Rgb([153, 0, 0]));
        assert_eq!(canvas.get_pixel(20, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn working_size_rounds_to_multiples_of_64() {
        let detector = PoseDetector::new(
            BodyPoseNet::new(VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap(),
            &Device::Cpu,
            DType::F32,
        );
        assert_eq!(detector.working_size(1024, 768), (704, 512));
        assert_eq!(detector.working_size(300, 300), (512, 512));
    }
}
