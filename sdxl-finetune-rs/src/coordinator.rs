//! Gradient accumulation groups and the sync-boundary sequence.
//!
//! Inside a group gradients only accumulate locally. The micro-batch that
//! closes a group (the group is full, or the epoch's data ran out) averages
//! the accumulated gradients over the group, all-reduces them, clips, steps
//! the optimizer and the learning-rate schedule and zeroes the gradients.

use candle_core::Tensor;

use crate::config::TrainingConfig;
use crate::distributed::Collective;
use crate::error::{FinetuneError, Result};
use crate::optimizer::Optimizer;
use crate::scheduler::LrScheduler;

/// What a micro-step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MicroStep {
    /// Gradients were accumulated, no update yet.
    Accumulated,
    /// The group closed and an optimizer update was applied.
    Synced {
        /// Global gradient norm before clipping, when clipping is enabled.
        grad_norm: Option<f64>,
    },
}

impl MicroStep {
    /// Whether an optimizer update was applied.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }
}

/// Drives accumulation groups across micro-batches.
///
/// # Example
///
/// ```rust
/// use sdxl_finetune_rs::coordinator::StepCoordinator;
///
/// # fn main() -> sdxl_finetune_rs::Result<()> {
/// let coordinator = StepCoordinator::new(4, 1.0)?;
/// assert!(!coordinator.is_sync_boundary(false));
/// assert!(coordinator.is_sync_boundary(true));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StepCoordinator {
    accumulation_steps: usize,
    max_grad_norm: f64,
    micro_in_group: usize,
}

impl StepCoordinator {
    /// Coordinator for groups of `accumulation_steps`; a `max_grad_norm` of 0
    /// disables clipping.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero accumulation steps or a negative
    /// clip bound.
    pub fn new(accumulation_steps: usize, max_grad_norm: f64) -> Result<Self> {
        if accumulation_steps == 0 {
            return Err(FinetuneError::Config(
                "gradient_accumulation_steps must be >= 1".into(),
            ));
        }
        if !(max_grad_norm >= 0.0) {
            return Err(FinetuneError::Config(format!(
                "max_grad_norm must be >= 0, got {max_grad_norm}"
            )));
        }
        Ok(Self {
            accumulation_steps,
            max_grad_norm,
            micro_in_group: 0,
        })
    }

    /// Coordinator from the `training` section.
    ///
    /// # Errors
    ///
    /// See [`StepCoordinator::new`].
    pub fn from_config(training: &TrainingConfig) -> Result<Self> {
        Self::new(training.gradient_accumulation_steps, training.max_grad_norm)
    }

    /// Whether the next micro-batch closes its group.
    #[must_use]
    pub fn is_sync_boundary(&self, is_last_in_epoch: bool) -> bool {
        is_last_in_epoch || self.micro_in_group + 1 >= self.accumulation_steps
    }

    /// Micro-batches accumulated in the open group.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.micro_in_group
    }

    /// Micro-batches per full group.
    #[must_use]
    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    /// Counts one micro-batch and reports whether it closes its group.
    ///
    /// A micro-batch that contributed no gradient still has to be counted,
    /// so that every replica closes its groups at the same index.
    pub fn advance(&mut self, is_last_in_epoch: bool) -> bool {
        let closes_group = self.is_sync_boundary(is_last_in_epoch);
        self.micro_in_group += 1;
        closes_group
    }

    /// Applies the update for the group that just closed.
    ///
    /// Averages the accumulated gradients over the group, all-reduces them,
    /// clips, steps the optimizer and the schedule, then zeroes the gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the all-reduce or the optimizer update fails.
    pub fn sync(
        &mut self,
        optimizer: &mut dyn Optimizer,
        scheduler: &mut LrScheduler,
        collective: &dyn Collective,
    ) -> Result<MicroStep> {
        let group_size = self.micro_in_group.max(1);
        self.micro_in_group = 0;

        optimizer.scale_gradients(1.0 / group_size as f64)?;
        optimizer.all_reduce_gradients(collective)?;
        let grad_norm = if self.max_grad_norm > 0.0 {
            Some(optimizer.clip_grad_norm(self.max_grad_norm)?)
        } else {
            None
        };
        optimizer.step()?;
        scheduler.step(optimizer);
        optimizer.zero_grad();

        tracing::trace!(group_size, ?grad_norm, "optimizer update");
        Ok(MicroStep::Synced { grad_norm })
    }

    /// Processes one micro-batch loss: accumulates it and, when it closes the
    /// group, applies the update.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass, the all-reduce or the optimizer
    /// update fails.
    pub fn micro_step(
        &mut self,
        loss: &Tensor,
        is_last_in_epoch: bool,
        optimizer: &mut dyn Optimizer,
        scheduler: &mut LrScheduler,
        collective: &dyn Collective,
    ) -> Result<MicroStep> {
        optimizer.accumulate(loss)?;
        if !self.advance(is_last_in_epoch) {
            return Ok(MicroStep::Accumulated);
        }
        self.sync(optimizer, scheduler, collective)
    }
}
