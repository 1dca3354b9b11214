//! Sampling schedules selectable per request.
//!
//! `DDIM` is taken from `candle-transformers` and wrapped behind the same
//! trait. Every other schedule is implemented here. The sigma-space ones
//! (`K_EULER`, `K_EULER_ANCESTRAL`, `HeunDiscrete`, `DPMSolverMultistep` and
//! `KarrasDPM`) share a [`SigmaSchedule`]; `LCM` and `PNDM` work on the
//! cumulative alphas directly.

use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler as FrameworkScheduler, SchedulerConfig},
};
use serde::{Deserialize, Serialize};

use crate::util::NoiseSource;
use crate::{Error, Result};

const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const TRAIN_TIMESTEPS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "DPMSolverMultistep")]
    DpmSolverMultistep,
    #[serde(rename = "HeunDiscrete")]
    HeunDiscrete,
    #[serde(rename = "KarrasDPM")]
    KarrasDpm,
    #[serde(rename = "K_EULER_ANCESTRAL")]
    EulerAncestral,
    #[serde(rename = "K_EULER")]
    Euler,
    #[serde(rename = "PNDM")]
    Pndm,
    #[default]
    #[serde(rename = "LCM")]
    Lcm,
}

serde_plain::derive_display_from_serialize!(SchedulerKind);
serde_plain::derive_fromstr_from_deserialize!(SchedulerKind);

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 8] = [
        Self::Ddim,
        Self::DpmSolverMultistep,
        Self::HeunDiscrete,
        Self::KarrasDpm,
        Self::EulerAncestral,
        Self::Euler,
        Self::Pndm,
        Self::Lcm,
    ];

    /// Builds a fresh schedule for `steps` denoising steps. `seed` drives the
    /// noise that stochastic schedules re-inject between steps.
    pub fn build(self, steps: usize, seed: u64) -> Result<Box<dyn Scheduler>> {
        let config = DiscreteSchedulerConfig::default();
        Ok(match self {
            Self::Lcm => Box::new(LcmScheduler::new(steps, LcmSchedulerConfig::default(), seed)?),
            Self::Euler => Box::new(EulerDiscreteScheduler::new(steps, config)?),
            Self::EulerAncestral => Box::new(EulerAncestralScheduler::new(steps, config, seed)?),
            Self::HeunDiscrete => Box::new(HeunDiscreteScheduler::new(steps, config)?),
            Self::DpmSolverMultistep => Box::new(DpmSolverMultistepScheduler::new(
                SigmaSchedule::leading(steps, config)?,
            )),
            Self::KarrasDpm => Box::new(DpmSolverMultistepScheduler::new(SigmaSchedule::karras(
                steps, config,
            )?)),
            Self::Pndm => Box::new(PndmScheduler::new(steps, config)?),
            Self::Ddim => Box::new(Framework(DDIMSchedulerConfig::default().build(steps)?)),
        })
    }
}

/// The numeric integration rule used by the sampling loop.
pub trait Scheduler {
    fn timesteps(&self) -> &[usize];

    /// Model evaluations per denoising step. Image-conditioned modes skip
    /// `order * start_step` timesteps.
    fn order(&self) -> usize {
        1
    }

    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor>;

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor>;

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor>;
}

struct Framework(Box<dyn FrameworkScheduler>);

impl Scheduler for Framework {
    fn timesteps(&self) -> &[usize] {
        self.0.timesteps()
    }

    fn init_noise_sigma(&self) -> f64 {
        self.0.init_noise_sigma()
    }

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor> {
        Ok(self.0.scale_model_input(sample, timestep)?)
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        Ok(self.0.add_noise(original, noise, timestep)?)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        Ok(self.0.step(model_output, timestep, sample)?)
    }
}

/// Cumulative alpha products of the SDXL "scaled_linear" beta schedule.
fn alphas_cumprod(beta_start: f64, beta_end: f64, train_timesteps: usize) -> Vec<f64> {
    let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
    let last = (train_timesteps - 1).max(1) as f64;
    let mut acc = 1.0;
    (0..train_timesteps)
        .map(|i| {
            let beta = (start + (end - start) * i as f64 / last).powi(2);
            acc *= 1.0 - beta;
            acc
        })
        .collect()
}

fn check_steps(steps: usize, max: usize) -> Result<()> {
    if steps == 0 || steps > max {
        return Err(Error::InvalidRequest(format!(
            "inference steps must be between 1 and {max}, got {steps}"
        )));
    }
    Ok(())
}

fn not_scheduled(timestep: usize) -> Error {
    candle_core::Error::Msg(format!("timestep {timestep} not scheduled")).into()
}

#[derive(Debug, Clone, Copy)]
pub struct LcmSchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub train_timesteps: usize,
    /// Length of the schedule the consistency model was distilled on.
    pub original_inference_steps: usize,
    pub timestep_scaling: f64,
}

impl Default for LcmSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: BETA_START,
            beta_end: BETA_END,
            train_timesteps: TRAIN_TIMESTEPS,
            original_inference_steps: 50,
            timestep_scaling: 10.0,
        }
    }
}

/// Latent consistency sampling: every step predicts the clean sample through
/// the consistency boundary conditions and re-noises it to the next timestep.
pub struct LcmScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    timestep_scaling: f64,
    noise: NoiseSource,
}

impl LcmScheduler {
    const SIGMA_DATA: f64 = 0.5;

    pub fn new(steps: usize, config: LcmSchedulerConfig, seed: u64) -> Result<Self> {
        check_steps(steps, config.original_inference_steps)?;
        let k = config.train_timesteps / config.original_inference_steps;
        let origin: Vec<usize> = (1..=config.original_inference_steps)
            .map(|i| i * k - 1)
            .collect();
        let skipping = config.original_inference_steps / steps;
        let timesteps = origin
            .into_iter()
            .rev()
            .step_by(skipping)
            .take(steps)
            .collect();
        Ok(Self {
            timesteps,
            alphas_cumprod: alphas_cumprod(
                config.beta_start,
                config.beta_end,
                config.train_timesteps,
            ),
            timestep_scaling: config.timestep_scaling,
            noise: NoiseSource::new(seed),
        })
    }

    fn boundary_condition_scalings(&self, timestep: usize) -> (f64, f64) {
        let t = timestep as f64 * self.timestep_scaling;
        let sigma2 = Self::SIGMA_DATA * Self::SIGMA_DATA;
        let c_skip = sigma2 / (t * t + sigma2);
        let c_out = t / (t * t + sigma2).sqrt();
        (c_skip, c_out)
    }
}

impl Scheduler for LcmScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let alpha = self.alphas_cumprod[timestep];
        Ok((original.affine(alpha.sqrt(), 0.)? + noise.affine((1. - alpha).sqrt(), 0.)?)?)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let index = self
            .timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| not_scheduled(timestep))?;
        let prev_timestep = self.timesteps.get(index + 1).copied();

        let alpha_prod_t = self.alphas_cumprod[timestep];
        // The final step targets alpha = 1, i.e. the clean sample.
        let alpha_prod_prev = prev_timestep.map_or(1.0, |t| self.alphas_cumprod[t]);
        let (c_skip, c_out) = self.boundary_condition_scalings(timestep);

        let pred_original = ((sample - model_output.affine((1. - alpha_prod_t).sqrt(), 0.)?)?
            / alpha_prod_t.sqrt())?;
        let denoised = (pred_original.affine(c_out, 0.)? + sample.affine(c_skip, 0.)?)?;

        if prev_timestep.is_none() {
            return Ok(denoised);
        }
        let noise = self
            .noise
            .randn(denoised.dims(), denoised.dtype(), denoised.device())?;
        Ok((denoised.affine(alpha_prod_prev.sqrt(), 0.)?
            + noise.affine((1. - alpha_prod_prev).sqrt(), 0.)?)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiscreteSchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub train_timesteps: usize,
    pub steps_offset: usize,
}

impl Default for DiscreteSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: BETA_START,
            beta_end: BETA_END,
            train_timesteps: TRAIN_TIMESTEPS,
            steps_offset: 1,
        }
    }
}

impl DiscreteSchedulerConfig {
    fn step_ratio(&self, steps: usize) -> usize {
        self.train_timesteps / steps
    }

    /// "Leading" spacing, highest timestep first.
    fn leading_timesteps(&self, steps: usize) -> Result<Vec<usize>> {
        check_steps(steps, self.train_timesteps)?;
        let ratio = self.step_ratio(steps);
        Ok((0..steps)
            .rev()
            .map(|i| (i * ratio + self.steps_offset).min(self.train_timesteps - 1))
            .collect())
    }
}

/// Timesteps paired with their noise levels `sigma = sqrt((1 - a) / a)`.
/// `sigmas` carries one trailing zero so that `sigmas[i + 1]` is always the
/// level step `i` moves to.
#[derive(Debug, Clone)]
pub struct SigmaSchedule {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    step_index: Option<usize>,
}

impl SigmaSchedule {
    fn sigma(alpha: f64) -> f64 {
        ((1. - alpha) / alpha).sqrt()
    }

    pub fn leading(steps: usize, config: DiscreteSchedulerConfig) -> Result<Self> {
        let alphas_cumprod =
            alphas_cumprod(config.beta_start, config.beta_end, config.train_timesteps);
        let timesteps = config.leading_timesteps(steps)?;
        let mut sigmas: Vec<f64> = timesteps
            .iter()
            .map(|&t| Self::sigma(alphas_cumprod[t]))
            .collect();
        sigmas.push(0.);
        Ok(Self {
            timesteps,
            sigmas,
            step_index: None,
        })
    }

    /// Karras et al. (2022) noise levels between the extremes of the leading
    /// schedule, with `rho = 7`. Timesteps are recovered by interpolating in
    /// log-sigma over the training schedule.
    pub fn karras(steps: usize, config: DiscreteSchedulerConfig) -> Result<Self> {
        const RHO: f64 = 7.;
        let leading = Self::leading(steps, config)?;
        let sigma_max = leading.sigmas[0];
        let sigma_min = leading.sigmas[steps - 1];
        let (max_inv, min_inv) = (sigma_max.powf(1. / RHO), sigma_min.powf(1. / RHO));
        let mut sigmas: Vec<f64> = (0..steps)
            .map(|i| {
                let ramp = if steps > 1 { i as f64 / (steps - 1) as f64 } else { 0. };
                (max_inv + ramp * (min_inv - max_inv)).powf(RHO)
            })
            .collect();

        let log_sigmas: Vec<f64> =
            alphas_cumprod(config.beta_start, config.beta_end, config.train_timesteps)
                .into_iter()
                .map(|a| Self::sigma(a).ln())
                .collect();
        let timesteps = sigmas
            .iter()
            .map(|&s| sigma_to_timestep(s, &log_sigmas))
            .collect();
        sigmas.push(0.);
        Ok(Self {
            timesteps,
            sigmas,
            step_index: None,
        })
    }

    /// Second-order layout: every timestep after the first is visited twice.
    pub fn interleaved(self) -> Self {
        let n = self.timesteps.len();
        let mut timesteps = Vec::with_capacity(2 * n - 1);
        let mut sigmas = Vec::with_capacity(2 * n);
        timesteps.push(self.timesteps[0]);
        sigmas.push(self.sigmas[0]);
        for i in 1..n {
            timesteps.extend([self.timesteps[i]; 2]);
            sigmas.extend([self.sigmas[i]; 2]);
        }
        sigmas.push(0.);
        Self {
            timesteps,
            sigmas,
            step_index: None,
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Position of `timestep`. A repeated timestep resolves to its second
    /// visit, where a fresh first-order step begins.
    fn index_for(&self, timestep: usize) -> Result<usize> {
        let mut hits = self
            .timesteps
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == timestep)
            .map(|(i, _)| i);
        let first = hits.next().ok_or_else(|| not_scheduled(timestep))?;
        Ok(hits.next().unwrap_or(first))
    }

    fn current(&self, timestep: usize) -> Result<usize> {
        match self.step_index {
            Some(index) => Ok(index),
            None => self.index_for(timestep),
        }
    }

    /// Returns the index of the step being taken and moves past it.
    fn advance(&mut self, timestep: usize) -> Result<usize> {
        let index = self.current(timestep)?;
        if index >= self.timesteps.len() {
            return Err(not_scheduled(timestep));
        }
        self.step_index = Some(index + 1);
        Ok(index)
    }

    fn init_noise_sigma(&self) -> f64 {
        let max_sigma = self.sigmas.iter().copied().fold(0., f64::max);
        (max_sigma * max_sigma + 1.).sqrt()
    }

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor> {
        let sigma = self.sigmas[self.current(timestep)?.min(self.sigmas.len() - 1)];
        Ok((sample / (sigma * sigma + 1.).sqrt())?)
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let sigma = self.sigmas[self.index_for(timestep)?];
        Ok((original + noise.affine(sigma, 0.)?)?)
    }
}

/// Fractional training timestep whose log-sigma matches `sigma`, rounded.
fn sigma_to_timestep(sigma: f64, log_sigmas: &[f64]) -> usize {
    let target = sigma.ln();
    let high = log_sigmas
        .iter()
        .position(|&ls| ls >= target)
        .unwrap_or(log_sigmas.len() - 1)
        .max(1);
    let low = high - 1;
    let span = log_sigmas[high] - log_sigmas[low];
    let w = ((target - log_sigmas[low]) / span).clamp(0., 1.);
    (low as f64 + w).round() as usize
}

macro_rules! sigma_schedule_accessors {
    () => {
        fn timesteps(&self) -> &[usize] {
            &self.schedule.timesteps
        }

        fn init_noise_sigma(&self) -> f64 {
            self.schedule.init_noise_sigma()
        }

        fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor> {
            self.schedule.scale_model_input(sample, timestep)
        }

        fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
            self.schedule.add_noise(original, noise, timestep)
        }
    };
}

/// Deterministic first-order Euler integration.
pub struct EulerDiscreteScheduler {
    schedule: SigmaSchedule,
}

impl EulerDiscreteScheduler {
    pub fn new(steps: usize, config: DiscreteSchedulerConfig) -> Result<Self> {
        Ok(Self {
            schedule: SigmaSchedule::leading(steps, config)?,
        })
    }
}

impl Scheduler for EulerDiscreteScheduler {
    sigma_schedule_accessors!();

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let i = self.schedule.advance(timestep)?;
        let dt = self.schedule.sigmas[i + 1] - self.schedule.sigmas[i];
        // Epsilon prediction: the derivative along the ODE is the noise itself.
        Ok((sample + model_output.affine(dt, 0.)?)?)
    }
}

/// Euler steps to a lowered noise level, topped up with fresh seeded noise.
pub struct EulerAncestralScheduler {
    schedule: SigmaSchedule,
    noise: NoiseSource,
}

impl EulerAncestralScheduler {
    pub fn new(steps: usize, config: DiscreteSchedulerConfig, seed: u64) -> Result<Self> {
        Ok(Self {
            schedule: SigmaSchedule::leading(steps, config)?,
            noise: NoiseSource::new(seed),
        })
    }
}

impl Scheduler for EulerAncestralScheduler {
    sigma_schedule_accessors!();

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let i = self.schedule.advance(timestep)?;
        let (sigma, sigma_to) = (self.schedule.sigmas[i], self.schedule.sigmas[i + 1]);
        let sigma_up =
            (sigma_to * sigma_to * (sigma * sigma - sigma_to * sigma_to) / (sigma * sigma)).sqrt();
        let sigma_down = (sigma_to * sigma_to - sigma_up * sigma_up).max(0.).sqrt();

        let prev = (sample + model_output.affine(sigma_down - sigma, 0.)?)?;
        if sigma_up == 0. {
            return Ok(prev);
        }
        let noise = self
            .noise
            .randn(prev.dims(), prev.dtype(), prev.device())?;
        Ok((prev + noise.affine(sigma_up, 0.)?)?)
    }
}

/// Heun's method: an Euler predictor followed by a trapezoidal corrector
/// evaluated at the predicted sample.
pub struct HeunDiscreteScheduler {
    schedule: SigmaSchedule,
    /// Sample, derivative and step size of the pending predictor step.
    pending: Option<(Tensor, Tensor, f64)>,
}

impl HeunDiscreteScheduler {
    pub fn new(steps: usize, config: DiscreteSchedulerConfig) -> Result<Self> {
        Ok(Self {
            schedule: SigmaSchedule::leading(steps, config)?.interleaved(),
            pending: None,
        })
    }
}

impl Scheduler for HeunDiscreteScheduler {
    sigma_schedule_accessors!();

    fn order(&self) -> usize {
        2
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let i = self.schedule.advance(timestep)?;
        match self.pending.take() {
            None => {
                let dt = self.schedule.sigmas[i + 1] - self.schedule.sigmas[i];
                let predicted = (sample + model_output.affine(dt, 0.)?)?;
                if self.schedule.sigmas[i + 1] > 0. {
                    self.pending = Some((sample.clone(), model_output.clone(), dt));
                }
                Ok(predicted)
            }
            Some((original, derivative, dt)) => {
                let average = ((derivative + model_output)? * 0.5)?;
                Ok((original + average.affine(dt, 0.)?)?)
            }
        }
    }
}

/// DPM-Solver++(2M): a multistep solver on the denoised prediction, second
/// order once a previous prediction exists and first order on the last step.
pub struct DpmSolverMultistepScheduler {
    schedule: SigmaSchedule,
    /// Previous denoised prediction and the log-sigma step that produced it.
    previous: Option<(Tensor, f64)>,
}

impl DpmSolverMultistepScheduler {
    pub fn new(schedule: SigmaSchedule) -> Self {
        Self {
            schedule,
            previous: None,
        }
    }
}

impl Scheduler for DpmSolverMultistepScheduler {
    sigma_schedule_accessors!();

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let i = self.schedule.advance(timestep)?;
        let (sigma, sigma_next) = (self.schedule.sigmas[i], self.schedule.sigmas[i + 1]);
        let denoised = (sample - model_output.affine(sigma, 0.)?)?;
        if sigma_next == 0. {
            self.previous = None;
            return Ok(denoised);
        }

        let h = (sigma / sigma_next).ln();
        let direction = match self.previous.take() {
            Some((old, h_last)) => {
                let r = h_last / h;
                let c = 1. / (2. * r);
                (denoised.affine(1. + c, 0.)? - old.affine(c, 0.)?)?
            }
            None => denoised.clone(),
        };
        self.previous = Some((denoised, h));
        Ok((sample.affine(sigma_next / sigma, 0.)? - direction.affine((-h).exp_m1(), 0.)?)?)
    }
}

/// Pseudo linear multistep (PLMS) with the Runge-Kutta warmup skipped: a
/// duplicated second timestep bootstraps the Adams-Bashforth history.
pub struct PndmScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
    counter: usize,
    ets: Vec<Tensor>,
    current_sample: Option<Tensor>,
}

impl PndmScheduler {
    pub fn new(steps: usize, config: DiscreteSchedulerConfig) -> Result<Self> {
        let mut ascending = config.leading_timesteps(steps)?;
        ascending.reverse();
        let mut timesteps = ascending[..steps - 1].to_vec();
        if steps > 1 {
            timesteps.push(ascending[steps - 2]);
        }
        timesteps.push(ascending[steps - 1]);
        timesteps.reverse();
        Ok(Self {
            timesteps,
            alphas_cumprod: alphas_cumprod(
                config.beta_start,
                config.beta_end,
                config.train_timesteps,
            ),
            step_ratio: config.step_ratio(steps),
            counter: 0,
            ets: Vec::with_capacity(4),
            current_sample: None,
        })
    }

    fn alpha(&self, timestep: Option<usize>) -> f64 {
        match timestep {
            Some(t) => self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)],
            None => self.alphas_cumprod[0],
        }
    }

    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: usize,
        prev_timestep: Option<usize>,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        let alpha_t = self.alpha(Some(timestep));
        let alpha_prev = self.alpha(prev_timestep);
        let (beta_t, beta_prev) = (1. - alpha_t, 1. - alpha_prev);
        let sample_coeff = (alpha_prev / alpha_t).sqrt();
        let denom = alpha_t * beta_prev.sqrt() + (alpha_t * beta_t * alpha_prev).sqrt();
        Ok((sample.affine(sample_coeff, 0.)?
            - model_output.affine((alpha_prev - alpha_t) / denom, 0.)?)?)
    }
}

impl Scheduler for PndmScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let alpha = self.alpha(Some(timestep));
        Ok((original.affine(alpha.sqrt(), 0.)? + noise.affine((1. - alpha).sqrt(), 0.)?)?)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let (mut timestep, mut prev_timestep) = (timestep, timestep.checked_sub(self.step_ratio));
        if self.counter == 1 {
            prev_timestep = Some(timestep);
            timestep += self.step_ratio;
        } else {
            if self.ets.len() == 4 {
                self.ets.remove(0);
            }
            self.ets.push(model_output.clone());
        }

        let mut sample = sample.clone();
        let n = self.ets.len();
        let eps = match (n, self.counter) {
            (1, 0) => {
                self.current_sample = Some(sample.clone());
                model_output.clone()
            }
            (1, _) => {
                if let Some(current) = self.current_sample.take() {
                    sample = current;
                }
                ((model_output + &self.ets[0])? * 0.5)?
            }
            (2, _) => ((self.ets[1].affine(3., 0.)? - &self.ets[0])? / 2.)?,
            (3, _) => ((self.ets[2].affine(23., 0.)? - self.ets[1].affine(16., 0.)?)?
                + self.ets[0].affine(5., 0.)?)?
            .affine(1. / 12., 0.)?,
            _ => {
                let e = &self.ets[n - 4..];
                (((e[3].affine(55., 0.)? - e[2].affine(59., 0.)?)? + e[1].affine(37., 0.)?)?
                    - e[0].affine(9., 0.)?)?
                .affine(1. / 24., 0.)?
            }
        };
        let prev = self.prev_sample(&sample, timestep, prev_timestep, &eps)?;
        self.counter += 1;
        Ok(prev)
    }
}
