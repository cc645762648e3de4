//! Learning rate schedulers.
//!
//! Schedulers produce a multiplier that the optimizer applies to every
//! group's base learning rate, so per-group and per-block rates keep their
//! ratios throughout training.

use std::f64::consts::PI;

use crate::optimizer::Optimizer;

/// Learning rate scheduler types. All of them start with a linear warmup.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Constant after warmup
    Constant {
        /// Number of warmup steps
        warmup_steps: usize,
    },
    /// Linear decay to zero
    Linear {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
    /// Half-cosine decay to zero
    Cosine {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
    /// Cosine decay with hard restarts
    CosineWithRestarts {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
        /// Number of cosine cycles
        num_cycles: usize,
    },
    /// Polynomial decay to zero
    Polynomial {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
        /// Decay exponent
        power: f64,
    },
}

/// Learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Current step
    current_step: usize,
}

impl LrScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType) -> Self {
        Self {
            scheduler_type,
            current_step: 0,
        }
    }

    /// Scheduler resumed at `step`.
    #[must_use]
    pub fn starting_at(scheduler_type: SchedulerType, step: usize) -> Self {
        Self {
            scheduler_type,
            current_step: step,
        }
    }

    /// Multiplier for the current step.
    #[must_use]
    pub fn lr_scale(&self) -> f64 {
        let step = self.current_step;
        match &self.scheduler_type {
            SchedulerType::Constant { warmup_steps } => {
                if step < *warmup_steps {
                    warmup(step, *warmup_steps)
                } else {
                    1.0
                }
            }
            SchedulerType::Linear {
                warmup_steps,
                total_steps,
            } => {
                if step < *warmup_steps {
                    warmup(step, *warmup_steps)
                } else {
                    1.0 - progress(step, *warmup_steps, *total_steps)
                }
            }
            SchedulerType::Cosine {
                warmup_steps,
                total_steps,
            } => {
                if step < *warmup_steps {
                    warmup(step, *warmup_steps)
                } else {
                    let p = progress(step, *warmup_steps, *total_steps);
                    0.5 * (1.0 + (PI * p).cos())
                }
            }
            SchedulerType::CosineWithRestarts {
                warmup_steps,
                total_steps,
                num_cycles,
            } => {
                if step < *warmup_steps {
                    return warmup(step, *warmup_steps);
                }
                let p = progress(step, *warmup_steps, *total_steps);
                if p >= 1.0 {
                    return 0.0;
                }
                let cycle = (*num_cycles as f64 * p) % 1.0;
                0.5 * (1.0 + (PI * cycle).cos())
            }
            SchedulerType::Polynomial {
                warmup_steps,
                total_steps,
                power,
            } => {
                if step < *warmup_steps {
                    warmup(step, *warmup_steps)
                } else {
                    (1.0 - progress(step, *warmup_steps, *total_steps)).powf(*power)
                }
            }
        }
    }

    /// Sets the optimizer to the current multiplier without advancing.
    pub fn apply(&self, optimizer: &mut dyn Optimizer) {
        optimizer.set_lr_scale(self.lr_scale());
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.current_step += 1;
        self.apply(optimizer);
    }

    /// Steps taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

fn warmup(step: usize, warmup_steps: usize) -> f64 {
    step as f64 / warmup_steps.max(1) as f64
}

/// Fraction of the post-warmup phase completed, clamped to `[0, 1]`.
fn progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1);
    (step.saturating_sub(warmup_steps) as f64 / span as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::Collective;
    use crate::error::Result;
    use candle_core::Tensor;

    #[derive(Default)]
    struct ScaleSink {
        scale: f64,
    }

    impl Optimizer for ScaleSink {
        fn accumulate(&mut self, _loss: &Tensor) -> Result<()> {
            Ok(())
        }
        fn scale_gradients(&mut self, _factor: f64) -> Result<()> {
            Ok(())
        }
        fn all_reduce_gradients(&mut self, _collective: &dyn Collective) -> Result<()> {
            Ok(())
        }
        fn clip_grad_norm(&mut self, _max_norm: f64) -> Result<f64> {
            Ok(0.0)
        }
        fn step(&mut self) -> Result<()> {
            Ok(())
        }
        fn zero_grad(&mut self) {}
        fn set_lr_scale(&mut self, scale: f64) {
            self.scale = scale;
        }
        fn learning_rates(&self) -> Vec<(String, f64)> {
            vec![("unet".into(), self.scale)]
        }
    }

    fn at(scheduler_type: SchedulerType, step: usize) -> f64 {
        LrScheduler::starting_at(scheduler_type, step).lr_scale()
    }

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LrScheduler::new(SchedulerType::Constant { warmup_steps: 0 });
        assert_eq!(scheduler.lr_scale(), 1.0);
        assert!((at(SchedulerType::Constant { warmup_steps: 10 }, 5) - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_linear_warmup() {
        let linear = SchedulerType::Linear {
            warmup_steps: 100,
            total_steps: 1000,
        };

        // At step 0, should be 0
        assert_eq!(at(linear.clone(), 0), 0.0);

        // At step 50, should be half of base_lr
        assert!((at(linear.clone(), 50) - 0.5).abs() < 1e-10);

        // At step 100, should be base_lr
        assert!((at(linear.clone(), 100) - 1.0).abs() < 1e-10);

        // At step 550 (halfway through decay), should be half of base_lr
        assert!((at(linear.clone(), 550) - 0.5).abs() < 1e-10);

        assert_eq!(at(linear, 2000), 0.0);
    }

    #[test]
    fn test_cosine_scheduler() {
        let cosine = SchedulerType::Cosine {
            warmup_steps: 100,
            total_steps: 1000,
        };
        assert!((at(cosine.clone(), 50) - 0.5).abs() < 1e-10);
        assert!((at(cosine.clone(), 100) - 1.0).abs() < 1e-10);
        assert!((at(cosine.clone(), 550) - 0.5).abs() < 1e-10);
        assert!(at(cosine, 1000) < 1e-10);
    }

    #[test]
    fn test_cosine_with_restarts() {
        let restarts = SchedulerType::CosineWithRestarts {
            warmup_steps: 0,
            total_steps: 100,
            num_cycles: 2,
        };
        assert!((at(restarts.clone(), 0) - 1.0).abs() < 1e-10);
        assert!((at(restarts.clone(), 25) - 0.5).abs() < 1e-10);
        // Restart at the start of the second cycle.
        assert!((at(restarts.clone(), 50) - 1.0).abs() < 1e-10);
        assert_eq!(at(restarts, 100), 0.0);
    }

    #[test]
    fn test_polynomial() {
        let poly = SchedulerType::Polynomial {
            warmup_steps: 0,
            total_steps: 100,
            power: 2.0,
        };
        assert!((at(poly.clone(), 50) - 0.25).abs() < 1e-10);
        assert_eq!(at(poly, 100), 0.0);
    }

    #[test]
    fn test_step_updates_optimizer() {
        let mut sink = ScaleSink::default();
        let mut scheduler = LrScheduler::new(SchedulerType::Linear {
            warmup_steps: 4,
            total_steps: 8,
        });
        scheduler.apply(&mut sink);
        assert_eq!(sink.scale, 0.0);
        scheduler.step(&mut sink);
        scheduler.step(&mut sink);
        assert_eq!(scheduler.current_step(), 2);
        assert!((sink.scale - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_zero_length_schedule_does_not_divide_by_zero() {
        let linear = SchedulerType::Linear {
            warmup_steps: 0,
            total_steps: 0,
        };
        assert!(at(linear, 0).is_finite());
    }
}
