//! Optimizer with gradient accumulation and named parameter groups.

use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{Optimizer as _, ParamsAdamW};

use crate::config::{TrainingConfig, UNET_NUM_BLOCKS_FOR_BLOCK_LR};
use crate::distributed::Collective;
use crate::error::{FinetuneError, Result};

/// Added to the global norm before computing the clip coefficient.
const CLIP_EPS: f64 = 1e-6;

/// What the step coordinator needs from an optimizer.
pub trait Optimizer {
    /// Back-propagates `loss` and adds the gradients to the accumulator.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass fails.
    fn accumulate(&mut self, loss: &Tensor) -> Result<()>;

    /// Multiplies every accumulated gradient by `factor`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor op fails.
    fn scale_gradients(&mut self, factor: f64) -> Result<()>;

    /// Averages the accumulated gradients across replicas.
    ///
    /// # Errors
    ///
    /// Returns an error if the collective fails.
    fn all_reduce_gradients(&mut self, collective: &dyn Collective) -> Result<()>;

    /// Scales gradients so their global L2 norm is at most `max_norm`.
    ///
    /// Returns the norm before clipping. A `max_norm` of zero only measures.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor op fails.
    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64>;

    /// Applies the accumulated gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn step(&mut self) -> Result<()>;

    /// Drops the accumulated gradients.
    fn zero_grad(&mut self);

    /// Multiplier applied to every group's base learning rate.
    fn set_lr_scale(&mut self, scale: f64);

    /// Current learning rate per group.
    fn learning_rates(&self) -> Vec<(String, f64)>;
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.01,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Hyperparameters from the `training` section.
    #[must_use]
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self {
            weight_decay: training.weight_decay,
            ..Self::default()
        }
    }

    /// Create an AdamW optimizer over `groups`.
    ///
    /// Groups with a zero learning rate or no variables are frozen and left out.
    ///
    /// # Errors
    ///
    /// Returns an error if no group is trainable or the optimizer cannot be created.
    pub fn build_adamw(&self, groups: Vec<ParamGroup>) -> Result<AdamWOptimizer> {
        let mut states = Vec::with_capacity(groups.len());
        for group in groups {
            if group.lr == 0.0 || group.vars.is_empty() {
                tracing::info!("Parameter group {} is frozen", group.name);
                continue;
            }
            let params = ParamsAdamW {
                lr: group.lr,
                beta1: self.beta1,
                beta2: self.beta2,
                eps: self.eps,
                weight_decay: self.weight_decay,
            };
            let inner = candle_nn::AdamW::new(group.vars.clone(), params).map_err(|e| {
                FinetuneError::Training(format!("Failed to create AdamW for {}: {e}", group.name))
            })?;
            let param_count: usize = group.vars.iter().map(|v| v.elem_count()).sum();
            tracing::info!(
                "Parameter group {}: lr={}, {} trainable params",
                group.name,
                group.lr,
                param_count
            );
            states.push(GroupState {
                name: group.name,
                base_lr: group.lr,
                vars: group.vars,
                inner,
            });
        }
        if states.is_empty() {
            return Err(FinetuneError::Config(
                "no trainable parameters: every group has a zero learning rate".into(),
            ));
        }
        Ok(AdamWOptimizer {
            groups: states,
            grads: None,
            lr_scale: 1.0,
        })
    }
}

/// Variables trained with one learning rate.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Group name used in logs (`unet`, `text_encoder1`, `block_07`, ...).
    pub name: String,
    /// Variables in the group.
    pub vars: Vec<Var>,
    /// Base learning rate.
    pub lr: f64,
}

impl ParamGroup {
    /// Creates a group.
    pub fn new(name: impl Into<String>, vars: Vec<Var>, lr: f64) -> Self {
        Self {
            name: name.into(),
            vars,
            lr,
        }
    }

    /// One group per U-Net block, paired with `training.block_lr`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless there is exactly one learning
    /// rate per block and [`UNET_NUM_BLOCKS_FOR_BLOCK_LR`] blocks.
    pub fn unet_blocks(blocks: Vec<Vec<Var>>, lrs: &[f64]) -> Result<Vec<Self>> {
        if blocks.len() != UNET_NUM_BLOCKS_FOR_BLOCK_LR || lrs.len() != blocks.len() {
            return Err(FinetuneError::Config(format!(
                "expected {UNET_NUM_BLOCKS_FOR_BLOCK_LR} U-Net blocks and learning rates, got {} and {}",
                blocks.len(),
                lrs.len()
            )));
        }
        Ok(blocks
            .into_iter()
            .zip(lrs)
            .enumerate()
            .map(|(i, (vars, &lr))| Self::new(format!("block_{i:02}"), vars, lr))
            .collect())
    }
}

struct GroupState {
    name: String,
    base_lr: f64,
    vars: Vec<Var>,
    inner: candle_nn::AdamW,
}

/// AdamW over named parameter groups.
pub struct AdamWOptimizer {
    groups: Vec<GroupState>,
    grads: Option<GradStore>,
    lr_scale: f64,
}

impl AdamWOptimizer {
    /// Accumulated gradient of `var`, if any.
    #[must_use]
    pub fn accumulated_gradient(&self, var: &Var) -> Option<&Tensor> {
        self.grads.as_ref().and_then(|g| g.get(var.as_tensor()))
    }

    /// Number of trainable groups.
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn vars(&self) -> impl Iterator<Item = &Var> {
        self.groups.iter().flat_map(|g| g.vars.iter())
    }

    fn map_gradients<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor>,
    {
        let Some(mut store) = self.grads.take() else {
            return Ok(());
        };
        for var in self.vars() {
            if let Some(grad) = store.get(var.as_tensor()) {
                let updated = f(grad)?;
                store.insert(var.as_tensor(), updated);
            }
        }
        self.grads = Some(store);
        Ok(())
    }
}

impl Optimizer for AdamWOptimizer {
    fn accumulate(&mut self, loss: &Tensor) -> Result<()> {
        let fresh = loss.backward()?;
        match self.grads.take() {
            None => self.grads = Some(fresh),
            Some(mut store) => {
                for var in self.vars() {
                    let Some(grad) = fresh.get(var.as_tensor()) else {
                        continue;
                    };
                    let summed = match store.get(var.as_tensor()) {
                        Some(prev) => prev.add(grad)?,
                        None => grad.clone(),
                    };
                    store.insert(var.as_tensor(), summed);
                }
                self.grads = Some(store);
            }
        }
        Ok(())
    }

    fn scale_gradients(&mut self, factor: f64) -> Result<()> {
        if (factor - 1.0).abs() < f64::EPSILON {
            return Ok(());
        }
        self.map_gradients(|g| g.affine(factor, 0.0))
    }

    fn all_reduce_gradients(&mut self, collective: &dyn Collective) -> Result<()> {
        if collective.world_size() == 1 {
            return Ok(());
        }
        let mut store = self.grads.take();

        // Flatten in a fixed variable order; missing gradients count as zeros
        // so every replica contributes a buffer of the same length.
        let mut buffer = Vec::new();
        for var in self.vars() {
            match store.as_ref().and_then(|s| s.get(var.as_tensor())) {
                Some(grad) => buffer.extend(
                    grad.to_dtype(candle_core::DType::F32)?
                        .flatten_all()?
                        .to_vec1::<f32>()?,
                ),
                None => buffer.extend(std::iter::repeat(0.0f32).take(var.elem_count())),
            }
        }
        collective.all_reduce_mean(&mut buffer)?;

        let mut store = match store.take() {
            Some(store) => store,
            None => Tensor::zeros((), candle_core::DType::F32, self.groups[0].vars[0].device())?
                .backward()?,
        };
        let mut offset = 0;
        for var in self.vars() {
            let n = var.elem_count();
            let reduced = Tensor::from_slice(&buffer[offset..offset + n], var.shape(), var.device())?
                .to_dtype(var.dtype())?;
            store.insert(var.as_tensor(), reduced);
            offset += n;
        }
        self.grads = Some(store);
        Ok(())
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64> {
        let Some(store) = self.grads.as_ref() else {
            return Ok(0.0);
        };
        let mut sum_sq = 0.0f64;
        for var in self.vars() {
            if let Some(grad) = store.get(var.as_tensor()) {
                let sq = grad
                    .to_dtype(candle_core::DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f32>()?;
                sum_sq += f64::from(sq);
            }
        }
        let total_norm = sum_sq.sqrt();
        if max_norm > 0.0 {
            let coef = max_norm / (total_norm + CLIP_EPS);
            if coef < 1.0 {
                self.scale_gradients(coef)?;
            }
        }
        Ok(total_norm)
    }

    fn step(&mut self) -> Result<()> {
        let Some(store) = self.grads.as_ref() else {
            tracing::warn!("optimizer step without accumulated gradients");
            return Ok(());
        };
        for group in &mut self.groups {
            group.inner.set_learning_rate(group.base_lr * self.lr_scale);
            group.inner.step(store).map_err(|e| {
                FinetuneError::Training(format!("Optimizer step failed for {}: {e}", group.name))
            })?;
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grads = None;
    }

    fn set_lr_scale(&mut self, scale: f64) {
        self.lr_scale = scale;
    }

    fn learning_rates(&self) -> Vec<(String, f64)> {
        self.groups
            .iter()
            .map(|g| (g.name.clone(), g.base_lr * self.lr_scale))
            .collect()
    }
}
