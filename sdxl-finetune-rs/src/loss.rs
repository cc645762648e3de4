//! Loss reweighting: min-SNR, debiased estimation and the NaN guard.
//!
//! The model's raw reconstruction error is reduced per sample, weighted by a
//! function of the per-timestep signal-to-noise ratio and averaged over the
//! batch. When both weightings are enabled they compose sequentially, min-SNR
//! first.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::LossConfig;
use crate::error::{FinetuneError, Result};
use crate::schedule::NoiseSchedule;

/// What the denoiser is trained to output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictionType {
    /// The injected noise.
    #[default]
    #[serde(rename = "epsilon")]
    Epsilon,
    /// `sqrt(ᾱ)·noise − sqrt(1−ᾱ)·x0`.
    #[serde(rename = "v_prediction", alias = "velocity")]
    Velocity,
}

impl FromStr for PredictionType {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" | "velocity" => Ok(Self::Velocity),
            other => Err(FinetuneError::Config(format!(
                "unsupported prediction_type {other:?} (expected epsilon or v_prediction)"
            ))),
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epsilon => f.write_str("epsilon"),
            Self::Velocity => f.write_str("v_prediction"),
        }
    }
}

/// Min-SNR weight for one sample.
///
/// Equals `1.0` whenever `snr <= gamma` (including a terminal `snr` of zero
/// for epsilon prediction) and saturates to `gamma / snr` above it.
///
/// ```rust
/// use sdxl_finetune_rs::loss::{min_snr_weight, PredictionType};
///
/// assert_eq!(min_snr_weight(20.0, 5.0, PredictionType::Epsilon), 0.25);
/// assert_eq!(min_snr_weight(2.0, 5.0, PredictionType::Epsilon), 1.0);
/// ```
#[must_use]
pub fn min_snr_weight(snr: f64, gamma: f64, prediction_type: PredictionType) -> f64 {
    match prediction_type {
        PredictionType::Epsilon => {
            if snr <= gamma {
                1.0
            } else {
                gamma / snr
            }
        }
        PredictionType::Velocity => snr.min(gamma) / (snr + 1.0),
    }
}

/// Debiased-estimation weight `1 / sqrt(snr)`.
#[must_use]
pub fn debiased_weight(snr: f64) -> f64 {
    1.0 / snr.sqrt()
}

/// Mean squared error per sample: `[batch, ...] -> [batch]` in f32.
///
/// # Errors
///
/// Returns an error if the shapes differ.
pub fn mse_per_sample(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = pred.to_dtype(DType::F32)?.sub(&target.to_dtype(DType::F32)?)?;
    let per_sample = diff.sqr()?.flatten_from(1)?.mean(1)?;
    Ok(per_sample)
}

/// Replaces every NaN entry of `tensor` with zero.
///
/// Returns the repaired tensor and whether any NaN was found. Non-NaN entries
/// are left untouched.
///
/// # Errors
///
/// Returns an error if the comparison or selection kernels fail.
pub fn replace_nan(tensor: &Tensor) -> Result<(Tensor, bool)> {
    // NaN is the only value that is not equal to itself.
    let mask = tensor.ne(tensor)?;
    let found = mask.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? > 0.0;
    if !found {
        return Ok((tensor.clone(), false));
    }
    let zeros = tensor.zeros_like()?;
    Ok((mask.where_cond(&zeros, tensor)?, true))
}

/// Outcome of weighting one micro-batch.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Scalar loss to back-propagate.
    pub loss: Tensor,
    /// Host copy of `loss`.
    pub value: f64,
    /// Mean MSE before weighting.
    pub unweighted: f64,
    /// Mean applied per-sample weight (`1.0` when weighting is off).
    pub mean_weight: f64,
    /// Whether the NaN guard replaced the loss.
    pub nan_replaced: bool,
}

/// Weighting policy applied to every micro-batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeighting {
    /// Min-SNR gamma. Zero disables min-SNR.
    pub min_snr_gamma: f64,
    /// Apply `1/sqrt(snr)` after min-SNR.
    pub debiased: bool,
    /// What the model predicts.
    pub prediction_type: PredictionType,
}

impl LossWeighting {
    /// Policy from the `loss` section and the configured prediction type.
    #[must_use]
    pub fn from_config(loss: &LossConfig, prediction_type: PredictionType) -> Self {
        Self {
            min_snr_gamma: loss.min_snr_gamma,
            debiased: loss.debiased_estimation_loss,
            prediction_type,
        }
    }

    /// Whether any per-sample weighting is active.
    #[must_use]
    pub fn is_weighted(&self) -> bool {
        self.min_snr_gamma > 0.0 || self.debiased
    }

    /// Combined weight for a single SNR value.
    #[must_use]
    pub fn weight(&self, snr: f64) -> f64 {
        let mut weight = 1.0;
        if self.min_snr_gamma > 0.0 {
            weight *= min_snr_weight(snr, self.min_snr_gamma, self.prediction_type);
        }
        if self.debiased {
            weight *= debiased_weight(snr);
        }
        weight
    }

    /// Weighted scalar loss for a batch.
    ///
    /// `timesteps` must hold one entry per sample.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch, when `timesteps` does not match
    /// the batch size, or when a timestep lies outside the schedule.
    pub fn compute(
        &self,
        pred: &Tensor,
        target: &Tensor,
        timesteps: &[u32],
        schedule: &NoiseSchedule,
    ) -> Result<LossBreakdown> {
        let per_sample = mse_per_sample(pred, target)?;
        let batch = per_sample.dims1()?;
        if batch != timesteps.len() {
            return Err(FinetuneError::Training(format!(
                "batch of {batch} samples but {} timesteps",
                timesteps.len()
            )));
        }
        let unweighted = f64::from(per_sample.mean_all()?.to_scalar::<f32>()?);

        let (loss, mean_weight) = if self.is_weighted() {
            let weights = timesteps
                .iter()
                .map(|&t| schedule.try_snr(t as usize).map(|snr| self.weight(snr)))
                .collect::<Result<Vec<f64>>>()?;
            let mean_weight = weights.iter().sum::<f64>() / batch.max(1) as f64;
            let weights = Tensor::from_vec(
                weights.into_iter().map(|w| w as f32).collect::<Vec<f32>>(),
                batch,
                per_sample.device(),
            )?;
            (per_sample.mul(&weights)?.mean_all()?, mean_weight)
        } else {
            (per_sample.mean_all()?, 1.0)
        };

        let value = f64::from(loss.to_scalar::<f32>()?);
        if value.is_nan() {
            tracing::warn!(unweighted, "loss is NaN, replacing with zero");
            let zero = Tensor::zeros((), DType::F32, loss.device())?;
            return Ok(LossBreakdown {
                loss: zero,
                value: 0.0,
                unweighted,
                mean_weight,
                nan_replaced: true,
            });
        }

        Ok(LossBreakdown {
            loss,
            value,
            unweighted,
            mean_weight,
            nan_replaced: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::scaled_linear(1000, 0.000_85, 0.012)
    }

    #[test]
    fn test_min_snr_known_values() {
        assert!((min_snr_weight(20.0, 5.0, PredictionType::Epsilon) - 0.25).abs() < 1e-12);
        assert_eq!(min_snr_weight(2.0, 5.0, PredictionType::Epsilon), 1.0);
        assert_eq!(min_snr_weight(5.0, 5.0, PredictionType::Epsilon), 1.0);
    }

    #[test]
    fn test_min_snr_monotone_past_gamma() {
        let gamma = 5.0;
        let mut previous = f64::INFINITY;
        for i in 0..200 {
            let snr = 0.1 * f64::from(i);
            let weight = min_snr_weight(snr, gamma, PredictionType::Epsilon);
            assert!(weight <= previous + 1e-15);
            if snr <= gamma {
                assert_eq!(weight, 1.0);
            } else {
                assert!((weight - gamma / snr).abs() < 1e-12);
            }
            previous = weight;
        }
    }

    #[test]
    fn test_min_snr_zero_snr_epsilon_is_one() {
        assert_eq!(min_snr_weight(0.0, 5.0, PredictionType::Epsilon), 1.0);
    }

    #[test]
    fn test_min_snr_velocity() {
        assert!((min_snr_weight(20.0, 5.0, PredictionType::Velocity) - 5.0 / 21.0).abs() < 1e-12);
        assert!((min_snr_weight(1.0, 5.0, PredictionType::Velocity) - 0.5).abs() < 1e-12);
        assert_eq!(min_snr_weight(0.0, 5.0, PredictionType::Velocity), 0.0);
    }

    #[test]
    fn test_debiased_weight() {
        assert!((debiased_weight(4.0) - 0.5).abs() < 1e-12);
        assert!((debiased_weight(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sequential_composition() {
        let weighting = LossWeighting {
            min_snr_gamma: 5.0,
            debiased: true,
            prediction_type: PredictionType::Epsilon,
        };
        let expected = 0.25 * debiased_weight(20.0);
        assert!((weighting.weight(20.0) - expected).abs() < 1e-12);

        let velocity = LossWeighting {
            prediction_type: PredictionType::Velocity,
            ..weighting
        };
        // min(snr, γ) / (snr + 1), then 1 / sqrt(snr).
        assert!((velocity.weight(4.0) - 0.8 * 0.5).abs() < 1e-12);
        assert!((velocity.weight(9.0) - 0.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_prediction_type_from_str() {
        assert_eq!("epsilon".parse::<PredictionType>().unwrap(), PredictionType::Epsilon);
        assert_eq!(
            "v_prediction".parse::<PredictionType>().unwrap(),
            PredictionType::Velocity
        );
        assert_eq!("velocity".parse::<PredictionType>().unwrap(), PredictionType::Velocity);

        let err = "sample".parse::<PredictionType>().unwrap_err();
        assert!(matches!(err, FinetuneError::Config(_)));
    }

    #[test]
    fn test_replace_nan_preserves_finite_entries() {
        let values = [1.0f32, f32::NAN, -2.5, f32::NAN, 0.0, 7.25];
        let tensor = Tensor::from_slice(&values, (2, 3), &Device::Cpu).unwrap();
        let (fixed, found) = replace_nan(&tensor).unwrap();
        assert!(found);

        let out: Vec<f32> = fixed.flatten_all().unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|v| !v.is_nan()));
        for (before, after) in values.iter().zip(&out) {
            if before.is_nan() {
                assert_eq!(*after, 0.0);
            } else {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_replace_nan_noop_without_nan() {
        let tensor = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let (fixed, found) = replace_nan(&tensor).unwrap();
        assert!(!found);
        assert_eq!(fixed.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_mse_per_sample() {
        let pred = Tensor::new(&[[1.0f32, 1.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[0.0f32, 0.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let mse = mse_per_sample(&pred, &target).unwrap();
        assert_eq!(mse.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_unweighted_loss_is_plain_mean() {
        let weighting = LossWeighting {
            min_snr_gamma: 0.0,
            debiased: false,
            prediction_type: PredictionType::Epsilon,
        };
        let pred = Tensor::new(&[[1.0f32, 1.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[0.0f32, 0.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let breakdown = weighting.compute(&pred, &target, &[10, 900], &schedule()).unwrap();
        assert!((breakdown.value - 1.5).abs() < 1e-6);
        assert_eq!(breakdown.mean_weight, 1.0);
        assert!(!breakdown.nan_replaced);
    }

    #[test]
    fn test_weighted_loss_matches_host_computation() {
        let schedule = schedule();
        let weighting = LossWeighting {
            min_snr_gamma: 5.0,
            debiased: false,
            prediction_type: PredictionType::Epsilon,
        };
        let pred = Tensor::new(&[[1.0f32, 1.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[0.0f32, 0.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let timesteps = [10u32, 900];
        let breakdown = weighting.compute(&pred, &target, &timesteps, &schedule).unwrap();

        let w0 = weighting.weight(schedule.snr(10));
        let w1 = weighting.weight(schedule.snr(900));
        let expected = (1.0 * w0 + 2.0 * w1) / 2.0;
        assert!((breakdown.value - expected).abs() < 1e-5);
        assert!((breakdown.unweighted - 1.5).abs() < 1e-6);
        // t=10 has a high SNR, t=900 a low one.
        assert!(w0 < 1.0);
        assert_eq!(w1, 1.0);
    }

    #[test]
    fn test_nan_loss_is_replaced_with_zero() {
        let weighting = LossWeighting {
            min_snr_gamma: 0.0,
            debiased: false,
            prediction_type: PredictionType::Epsilon,
        };
        let pred = Tensor::new(&[[f32::NAN, 1.0]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[0.0f32, 0.0]], &Device::Cpu).unwrap();
        let breakdown = weighting.compute(&pred, &target, &[5], &schedule()).unwrap();
        assert!(breakdown.nan_replaced);
        assert_eq!(breakdown.value, 0.0);
        assert_eq!(breakdown.loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_timestep_count_mismatch() {
        let weighting = LossWeighting {
            min_snr_gamma: 5.0,
            debiased: false,
            prediction_type: PredictionType::Epsilon,
        };
        let pred = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(weighting.compute(&pred, &target, &[1], &schedule()).is_err());
    }

    #[test]
    fn test_out_of_range_timestep_is_an_error() {
        let weighting = LossWeighting {
            min_snr_gamma: 5.0,
            debiased: true,
            prediction_type: PredictionType::Velocity,
        };
        let pred = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        let err = weighting.compute(&pred, &target, &[1000], &schedule()).unwrap_err();
        assert!(matches!(err, FinetuneError::Training(_)));
        assert!(err.to_string().contains("timestep 1000 out of range"));
    }
}
