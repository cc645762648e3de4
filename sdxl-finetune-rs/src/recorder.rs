//! Streaming loss statistics.

use std::collections::VecDeque;

use crate::error::{FinetuneError, Result};

/// Upper bound on the recorder window regardless of epoch length.
pub const MAX_WINDOW: usize = 10_000;

/// Exponential moving average plus a bounded window of recent losses.
///
/// # Example
///
/// ```rust
/// use sdxl_finetune_rs::LossRecorder;
///
/// # fn main() -> sdxl_finetune_rs::Result<()> {
/// let mut recorder = LossRecorder::new(0.9, 100)?;
/// for loss in [1.0, 0.5, 0.3] {
///     recorder.add(loss);
/// }
/// assert!((recorder.ema() - 0.905).abs() < 1e-12);
/// assert!((recorder.moving_average(2) - 0.4).abs() < 1e-12);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LossRecorder {
    gamma: f64,
    ema: Option<f64>,
    window: VecDeque<f64>,
    capacity: usize,
}

impl LossRecorder {
    /// Creates a recorder keeping at most `capacity` values (at least one).
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `0 < gamma < 1`.
    pub fn new(gamma: f64, capacity: usize) -> Result<Self> {
        if !(gamma > 0.0 && gamma < 1.0) {
            return Err(FinetuneError::Config(format!(
                "loss recorder gamma must be in (0, 1), got {gamma}"
            )));
        }
        let capacity = capacity.max(1);
        Ok(Self {
            gamma,
            ema: None,
            window: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Recorder sized to one epoch, capped at [`MAX_WINDOW`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `0 < gamma < 1`.
    pub fn for_epoch(gamma: f64, steps_per_epoch: usize) -> Result<Self> {
        Self::new(gamma, steps_per_epoch.min(MAX_WINDOW))
    }

    /// Records one loss value.
    pub fn add(&mut self, value: f64) {
        self.ema = Some(match self.ema {
            None => value,
            Some(ema) => self.gamma * ema + (1.0 - self.gamma) * value,
        });

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    /// Mean of the last `min(window, len)` values, or `0.0` if there are none.
    #[must_use]
    pub fn moving_average(&self, window: usize) -> f64 {
        let n = window.min(self.window.len());
        if n == 0 {
            return 0.0;
        }
        self.window.iter().rev().take(n).sum::<f64>() / n as f64
    }

    /// Current EMA, or `0.0` before the first value.
    #[must_use]
    pub fn ema(&self) -> f64 {
        self.ema.unwrap_or(0.0)
    }

    /// Number of retained values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether no value has been retained yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Maximum number of retained values.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// EMA decay.
    #[must_use]
    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `ema_k = γ^{k-1}·v_1 + (1−γ)·Σ_{i=2}^{k} γ^{k−i}·v_i`
    fn closed_form_ema(gamma: f64, values: &[f64]) -> f64 {
        let k = values.len();
        let mut total = gamma.powi(k as i32 - 1) * values[0];
        for (i, v) in values.iter().enumerate().skip(1) {
            total += (1.0 - gamma) * gamma.powi((k - 1 - i) as i32) * v;
        }
        total
    }

    #[test]
    fn test_ema_known_sequence() {
        let mut recorder = LossRecorder::new(0.9, 10).unwrap();
        let mut seen = Vec::new();
        for value in [1.0, 0.5, 0.3] {
            recorder.add(value);
            seen.push(recorder.ema());
        }
        let expected = [1.0, 0.95, 0.905];
        for (got, want) in seen.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
    }

    #[test]
    fn test_ema_matches_closed_form() {
        let values: Vec<f64> = (0..50).map(|i| ((i * 37) % 11) as f64 * 0.1 + 0.05).collect();
        for gamma in [0.1, 0.5, 0.9, 0.99] {
            let mut recorder = LossRecorder::new(gamma, 8).unwrap();
            for k in 1..=values.len() {
                recorder.add(values[k - 1]);
                let expected = closed_form_ema(gamma, &values[..k]);
                assert!((recorder.ema() - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_moving_average_window_clamps() {
        let mut recorder = LossRecorder::new(0.9, 10).unwrap();
        for value in [1.0, 2.0, 3.0, 4.0] {
            recorder.add(value);
        }
        assert!((recorder.moving_average(100) - 2.5).abs() < 1e-12);
        assert!((recorder.moving_average(4) - 2.5).abs() < 1e-12);
        assert!((recorder.moving_average(2) - 3.5).abs() < 1e-12);
        assert!((recorder.moving_average(1) - 4.0).abs() < 1e-12);
        assert_eq!(recorder.moving_average(0), 0.0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut recorder = LossRecorder::new(0.5, 3).unwrap();
        for value in 1..=10 {
            recorder.add(f64::from(value));
        }
        assert_eq!(recorder.len(), 3);
        assert!((recorder.moving_average(usize::MAX) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_recorder() {
        let recorder = LossRecorder::new(0.9, 5).unwrap();
        assert!(recorder.is_empty());
        assert_eq!(recorder.ema(), 0.0);
        assert_eq!(recorder.moving_average(5), 0.0);
    }

    #[test]
    fn test_invalid_gamma() {
        for gamma in [0.0, 1.0, -0.1, 2.0, f64::NAN] {
            assert!(LossRecorder::new(gamma, 5).is_err());
        }
    }

    #[test]
    fn test_for_epoch_caps_window() {
        assert_eq!(LossRecorder::for_epoch(0.9, 50).unwrap().capacity(), 50);
        assert_eq!(LossRecorder::for_epoch(0.9, 250_000).unwrap().capacity(), MAX_WINDOW);
        assert_eq!(LossRecorder::for_epoch(0.9, 0).unwrap().capacity(), 1);
    }
}
