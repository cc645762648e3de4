//! DDPM noise schedule.
//!
//! One [`NoiseSchedule`] is built per run and shared by noise injection, the
//! velocity target and SNR weighting, so a zero-terminal-SNR correction is
//! seen consistently by all three.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::{NoiseConfig, NUM_TRAIN_TIMESTEPS};
use crate::error::{FinetuneError, Result};

/// First beta of the SDXL scaled-linear schedule.
pub const BETA_START: f64 = 0.000_85;

/// Last beta of the SDXL scaled-linear schedule.
pub const BETA_END: f64 = 0.012;

/// Multiplier applied to VAE latents before diffusion.
pub const VAE_SCALE_FACTOR: f64 = 0.130_25;

/// Lower bound on `alphas_cumprod` after zero-terminal-SNR rescaling.
///
/// Keeps the terminal SNR strictly positive so per-timestep weights stay finite.
pub const ALPHAS_CUMPROD_FLOOR: f64 = 4.897_345_189_085_343_5e-8;

/// Per-timestep betas, cumulative alphas and cached SNR.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    snr: Vec<f64>,
    zero_terminal_snr: bool,
}

impl NoiseSchedule {
    /// Scaled-linear schedule: betas are linear in `sqrt(beta)`.
    ///
    /// ```rust
    /// use sdxl_finetune_rs::schedule::NoiseSchedule;
    ///
    /// let schedule = NoiseSchedule::scaled_linear(1000, 0.000_85, 0.012);
    /// assert_eq!(schedule.num_timesteps(), 1000);
    /// assert!(schedule.snr(0) > schedule.snr(999));
    /// ```
    #[must_use]
    pub fn scaled_linear(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Self {
        let (lo, hi) = (beta_start.sqrt(), beta_end.sqrt());
        let betas = (0..num_timesteps)
            .map(|i| {
                let frac = if num_timesteps > 1 {
                    i as f64 / (num_timesteps - 1) as f64
                } else {
                    0.0
                };
                let root = lo + (hi - lo) * frac;
                root * root
            })
            .collect();
        Self::from_betas(betas)
    }

    /// Schedule from an explicit beta sequence.
    #[must_use]
    pub fn from_betas(betas: Vec<f64>) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut running = 1.0;
        for beta in &betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }
        let snr = snr_from_alphas_cumprod(&alphas_cumprod);
        Self {
            betas,
            alphas_cumprod,
            snr,
            zero_terminal_snr: false,
        }
    }

    /// The SDXL training schedule, corrected for zero terminal SNR when requested.
    #[must_use]
    pub fn from_config(noise: &NoiseConfig) -> Self {
        let mut schedule = Self::scaled_linear(NUM_TRAIN_TIMESTEPS, BETA_START, BETA_END);
        if noise.zero_terminal_snr {
            schedule.enforce_zero_terminal_snr();
        }
        schedule
    }

    /// Rescales the schedule so the final timestep carries no signal.
    ///
    /// `sqrt(ᾱ)` is shifted so its last entry is zero and scaled so its first
    /// entry is unchanged. Betas and the SNR cache are re-derived from the
    /// result. Calling this more than once has no further effect.
    pub fn enforce_zero_terminal_snr(&mut self) {
        if self.zero_terminal_snr || self.alphas_cumprod.len() < 2 {
            self.zero_terminal_snr = true;
            return;
        }

        let sqrt_ac: Vec<f64> = self.alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let first = sqrt_ac[0];
        let last = sqrt_ac[sqrt_ac.len() - 1];
        let scale = first / (first - last);

        self.alphas_cumprod = sqrt_ac
            .iter()
            .map(|s| {
                let shifted = (s - last) * scale;
                (shifted * shifted).clamp(ALPHAS_CUMPROD_FLOOR, 1.0)
            })
            .collect();

        let mut previous = 1.0;
        self.betas = self
            .alphas_cumprod
            .iter()
            .map(|&ac| {
                let beta = 1.0 - ac / previous;
                previous = ac;
                beta
            })
            .collect();

        self.snr = snr_from_alphas_cumprod(&self.alphas_cumprod);
        self.zero_terminal_snr = true;
    }

    /// Number of timesteps.
    #[must_use]
    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Whether the zero-terminal-SNR correction has been applied.
    #[must_use]
    pub fn is_zero_terminal_snr(&self) -> bool {
        self.zero_terminal_snr
    }

    /// Per-step betas.
    #[must_use]
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Cumulative products of `1 - beta`.
    #[must_use]
    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// `ᾱ / (1 - ᾱ)` at timestep `t`.
    ///
    /// # Panics
    ///
    /// Panics if `t` is out of range.
    #[must_use]
    pub fn snr(&self, t: usize) -> f64 {
        self.snr[t]
    }

    /// [`NoiseSchedule::snr`] for a timestep that may be out of range.
    ///
    /// # Errors
    ///
    /// Returns a training error if `t` is not below the timestep count.
    pub fn try_snr(&self, t: usize) -> Result<f64> {
        self.snr.get(t).copied().ok_or_else(|| {
            FinetuneError::Training(format!(
                "timestep {t} out of range for {} timesteps",
                self.num_timesteps()
            ))
        })
    }

    /// Draws one timestep per sample uniformly from `[min, max)`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty or out-of-range interval.
    pub fn sample_timesteps(
        &self,
        batch: usize,
        min: usize,
        max: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<u32>> {
        if min >= max || max > self.num_timesteps() {
            return Err(FinetuneError::Config(format!(
                "timestep range [{min}, {max}) is invalid for {} timesteps",
                self.num_timesteps()
            )));
        }
        Ok((0..batch).map(|_| rng.gen_range(min..max) as u32).collect())
    }

    /// Forward process: `sqrt(ᾱ_t)·x0 + sqrt(1 − ᾱ_t)·noise`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes disagree or a timestep is out of range.
    pub fn add_noise(&self, latents: &Tensor, noise: &Tensor, timesteps: &[u32]) -> Result<Tensor> {
        let (signal, sigma) = self.coefficients(timesteps)?;
        let signal = per_sample(&signal, latents)?;
        let sigma = per_sample(&sigma, latents)?;
        Ok(latents.broadcast_mul(&signal)?.add(&noise.broadcast_mul(&sigma)?)?)
    }

    /// Velocity target: `sqrt(ᾱ_t)·noise − sqrt(1 − ᾱ_t)·x0`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes disagree or a timestep is out of range.
    pub fn velocity(&self, latents: &Tensor, noise: &Tensor, timesteps: &[u32]) -> Result<Tensor> {
        let (signal, sigma) = self.coefficients(timesteps)?;
        let signal = per_sample(&signal, latents)?;
        let sigma = per_sample(&sigma, latents)?;
        Ok(noise.broadcast_mul(&signal)?.sub(&latents.broadcast_mul(&sigma)?)?)
    }

    fn coefficients(&self, timesteps: &[u32]) -> Result<(Vec<f64>, Vec<f64>)> {
        timesteps
            .iter()
            .map(|&t| {
                let ac = self.alphas_cumprod.get(t as usize).copied().ok_or_else(|| {
                    FinetuneError::Training(format!(
                        "timestep {t} out of range for {} timesteps",
                        self.num_timesteps()
                    ))
                })?;
                Ok((ac.sqrt(), (1.0 - ac).sqrt()))
            })
            .collect::<Result<Vec<_>>>()
            .map(|pairs| pairs.into_iter().unzip())
    }
}

fn snr_from_alphas_cumprod(alphas_cumprod: &[f64]) -> Vec<f64> {
    alphas_cumprod.iter().map(|ac| ac / (1.0 - ac)).collect()
}

/// Reshapes per-sample scalars to `[batch, 1, 1, ...]` matching `like`'s rank.
fn per_sample(values: &[f64], like: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1usize; like.rank().max(1)];
    shape[0] = values.len();
    let data: Vec<f32> = values.iter().map(|v| *v as f32).collect();
    Ok(Tensor::from_vec(data, shape, like.device())?.to_dtype(like.dtype())?)
}

/// Standard normal tensor drawn from `rng`.
///
/// # Errors
///
/// Returns an error if the tensor cannot be allocated on `device`.
pub fn randn(shape: &[usize], rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let count = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Gaussian noise for a latent batch `[batch, channels, ...]`.
///
/// A non-zero `noise.noise_offset` adds a per-sample, per-channel constant
/// drawn from `N(0, offset²)`. With `adaptive_noise_scale` the offset grows by
/// `scale · |mean|` of each latent channel, floored at zero. Multi-resolution
/// noise then stacks upsampled coarser levels on top, weighted by
/// `discount^i`, and renormalises to unit standard deviation.
///
/// # Errors
///
/// Returns an error if `latents` has fewer than two dimensions, or is not
/// `[batch, channels, height, width]` when multi-resolution noise is enabled.
pub fn sample_noise(latents: &Tensor, noise: &NoiseConfig, rng: &mut StdRng) -> Result<Tensor> {
    let dims = latents.dims();
    if dims.len() < 2 {
        return Err(FinetuneError::Training(format!(
            "latents must be at least [batch, channels], got {dims:?}"
        )));
    }
    let mut sample = randn(dims, rng, latents.device())?;
    if noise.noise_offset > 0.0 {
        let mut offset_shape = vec![1usize; dims.len()];
        offset_shape[0] = dims[0];
        offset_shape[1] = dims[1];
        let mut strength = Tensor::full(noise.noise_offset as f32, offset_shape.clone(), latents.device())?;
        if let Some(scale) = noise.adaptive_noise_scale {
            let latents = latents.to_dtype(DType::F32)?;
            let channel_mean = if dims.len() > 2 {
                latents.flatten_from(2)?.mean_keepdim(2)?
            } else {
                latents
            };
            strength = channel_mean
                .reshape(offset_shape.clone())?
                .abs()?
                .affine(scale, noise.noise_offset)?
                .maximum(0.0f32)?;
        }
        let offset = randn(&offset_shape, rng, latents.device())?.mul(&strength)?;
        sample = sample.broadcast_add(&offset)?;
    }
    if noise.multires_noise_iterations > 0 {
        sample = pyramid_noise(
            &sample,
            noise.multires_noise_iterations,
            noise.multires_noise_discount,
            rng,
        )?;
    }
    Ok(sample.to_dtype(latents.dtype())?)
}

fn pyramid_noise(noise: &Tensor, iterations: usize, discount: f64, rng: &mut StdRng) -> Result<Tensor> {
    let (batch, channels, height, width) = noise.dims4()?;
    let mut pyramid = noise.clone();
    let mut weight = 1.0;
    for level in 0..iterations {
        let ratio: f64 = rng.gen_range(2.0..4.0);
        let shrink = ratio.powi(i32::try_from(level).unwrap_or(i32::MAX));
        let h = ((height as f64 / shrink) as usize).max(1);
        let w = ((width as f64 / shrink) as usize).max(1);
        let coarse = randn(&[batch, channels, h, w], rng, noise.device())?
            .upsample_nearest2d(height, width)?
            .affine(weight, 0.0)?;
        pyramid = pyramid.add(&coarse)?;
        if h == 1 || w == 1 {
            break;
        }
        weight *= discount;
    }
    let std = f64::from(pyramid.flatten_all()?.var(0)?.sqrt()?.to_scalar::<f32>()?);
    if std > 0.0 {
        pyramid = pyramid.affine(1.0 / std, 0.0)?;
    }
    Ok(pyramid)
}

/// Input perturbation: `noise + gamma·N(0, 1)`, used only for the model input.
///
/// # Errors
///
/// Returns an error if the perturbation cannot be allocated.
pub fn perturb_noise(noise: &Tensor, ip_noise_gamma: f64, rng: &mut StdRng) -> Result<Tensor> {
    if ip_noise_gamma <= 0.0 {
        return Ok(noise.clone());
    }
    let extra = randn(noise.dims(), rng, noise.device())?
        .affine(ip_noise_gamma, 0.0)?
        .to_dtype(noise.dtype())?;
    Ok(noise.add(&extra)?)
}
