//! Configuration parsing and validation.
//!
//! Every recognized option is a typed field with a serde default. Sections
//! reject unknown keys, so a misspelled option fails at load time instead of
//! silently falling back to its default.

use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};
use crate::loss::PredictionType;
use crate::scheduler::SchedulerType;
use crate::state::{Cadence, TerminalPolicy};

/// Number of U-Net blocks addressed by `training.block_lr`.
pub const UNET_NUM_BLOCKS_FOR_BLOCK_LR: usize = 23;

/// Number of timesteps in the training noise schedule.
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;

/// Main configuration for a fine-tuning run.
///
/// # Example
///
/// ```rust
/// use sdxl_finetune_rs::TrainConfig;
///
/// # fn main() -> sdxl_finetune_rs::Result<()> {
/// let config = TrainConfig::from_yaml_str(
///     "model:\n  pretrained_model_name_or_path: stabilityai/sdxl-base-1.0\n",
/// )?;
/// config.validate()?;
/// assert_eq!(config.training.gradient_accumulation_steps, 1);
/// assert_eq!(config.loss.min_snr_gamma, 5.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    /// Model locations.
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Forward-process noise settings.
    #[serde(default)]
    pub noise: NoiseConfig,

    /// Loss weighting and loss statistics.
    #[serde(default)]
    pub loss: LossConfig,

    /// Checkpoint cadence and output locations.
    #[serde(default)]
    pub saving: SavingConfig,

    /// Sample-image cadence.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

/// Where the base weights come from. Loading itself happens elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Pretrained model name or path.
    pub pretrained_model_name_or_path: String,

    /// Optional replacement VAE.
    #[serde(default)]
    pub vae: Option<String>,

    /// Keep the VAE in full precision.
    #[serde(default)]
    pub no_half_vae: bool,
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use sdxl_finetune_rs::config::TrainingConfig;
///
/// let training = TrainingConfig {
///     num_train_epochs: 10,
///     gradient_accumulation_steps: 4,
///     max_grad_norm: 1.0,
///     ..Default::default()
/// };
///
/// assert_eq!(training.batch_size, 1);
/// assert_eq!(training.gradient_accumulation_steps, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,

    /// Batch size per process.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// U-Net learning rate. Zero freezes the U-Net.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate of the first text encoder (falls back to `learning_rate`).
    #[serde(default)]
    pub learning_rate_te1: Option<f64>,

    /// Learning rate of the second text encoder (falls back to `learning_rate`).
    #[serde(default)]
    pub learning_rate_te2: Option<f64>,

    /// Train the text encoders as well as the U-Net.
    #[serde(default)]
    pub train_text_encoder: bool,

    /// Comma-separated per-block U-Net learning rates.
    #[serde(default)]
    pub block_lr: Option<String>,

    /// Learning rate schedule.
    #[serde(default)]
    pub lr_scheduler: LrSchedulerKind,

    /// Linear warmup steps.
    #[serde(default)]
    pub lr_warmup_steps: usize,

    /// Power of the polynomial schedule.
    #[serde(default = "default_lr_power")]
    pub lr_scheduler_power: f64,

    /// Number of hard restarts for cosine-with-restarts.
    #[serde(default = "default_lr_cycles")]
    pub lr_scheduler_num_cycles: usize,

    /// Micro-batches per optimizer update.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Maximum global gradient norm. Zero disables clipping.
    #[serde(default)]
    pub max_grad_norm: f64,

    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Mixed precision mode.
    #[serde(default)]
    pub mixed_precision: MixedPrecision,

    /// Keep weights in fp16 (requires `mixed_precision: fp16`).
    #[serde(default)]
    pub full_fp16: bool,

    /// Keep weights in bf16 (requires `mixed_precision: bf16`).
    #[serde(default)]
    pub full_bf16: bool,

    /// Use gradient checkpointing in the model collaborator.
    #[serde(default)]
    pub gradient_checkpointing: bool,
}

fn default_epochs() -> usize {
    100
}
fn default_batch_size() -> usize {
    1
}
fn default_lr() -> f64 {
    1e-6
}
fn default_lr_power() -> f64 {
    1.0
}
fn default_lr_cycles() -> usize {
    1
}
fn default_grad_accum() -> usize {
    1
}
fn default_weight_decay() -> f64 {
    0.01
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_train_epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            learning_rate_te1: None,
            learning_rate_te2: None,
            train_text_encoder: false,
            block_lr: None,
            lr_scheduler: LrSchedulerKind::default(),
            lr_warmup_steps: 0,
            lr_scheduler_power: default_lr_power(),
            lr_scheduler_num_cycles: default_lr_cycles(),
            gradient_accumulation_steps: default_grad_accum(),
            max_grad_norm: 0.0,
            weight_decay: default_weight_decay(),
            mixed_precision: MixedPrecision::default(),
            full_fp16: false,
            full_bf16: false,
            gradient_checkpointing: false,
        }
    }
}

/// Learning rate schedule selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    /// Constant after warmup.
    Constant,
    /// Linear decay to zero.
    Linear,
    /// Cosine annealing.
    #[default]
    Cosine,
    /// Cosine annealing with hard restarts.
    CosineWithRestarts,
    /// Polynomial decay.
    Polynomial,
}

/// Mixed precision mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    /// Full fp32.
    No,
    /// fp16 autocast.
    #[default]
    Fp16,
    /// bf16 autocast.
    Bf16,
}

/// Precision of saved weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavePrecision {
    /// fp32.
    #[default]
    Float,
    /// fp16.
    Fp16,
    /// bf16.
    Bf16,
}

/// Forward-process noise settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoiseConfig {
    /// What the model predicts.
    #[serde(default)]
    pub prediction_type: PredictionType,

    /// Rescale the schedule so the last timestep has zero SNR.
    #[serde(default)]
    pub zero_terminal_snr: bool,

    /// Strength of per-channel offset noise.
    #[serde(default)]
    pub noise_offset: f64,

    /// Scales `noise_offset` by the mean magnitude of each latent channel.
    #[serde(default)]
    pub adaptive_noise_scale: Option<f64>,

    /// Levels of multi-resolution (pyramid) noise. Zero disables it.
    #[serde(default)]
    pub multires_noise_iterations: usize,

    /// Weight of pyramid level `i` is `discount^i`.
    #[serde(default = "default_multires_noise_discount")]
    pub multires_noise_discount: f64,

    /// Input perturbation added to the noise used for the model input only.
    #[serde(default)]
    pub ip_noise_gamma: f64,

    /// Lowest timestep sampled (inclusive).
    #[serde(default)]
    pub min_timestep: usize,

    /// Highest timestep sampled (exclusive).
    #[serde(default = "default_max_timestep")]
    pub max_timestep: usize,
}

fn default_max_timestep() -> usize {
    NUM_TRAIN_TIMESTEPS
}

fn default_multires_noise_discount() -> f64 {
    0.25
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            prediction_type: PredictionType::default(),
            zero_terminal_snr: false,
            noise_offset: 0.0,
            adaptive_noise_scale: None,
            multires_noise_iterations: 0,
            multires_noise_discount: default_multires_noise_discount(),
            ip_noise_gamma: 0.0,
            min_timestep: 0,
            max_timestep: default_max_timestep(),
        }
    }
}

/// Loss weighting and loss statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossConfig {
    /// Min-SNR gamma. Zero disables min-SNR weighting.
    #[serde(default = "default_min_snr_gamma")]
    pub min_snr_gamma: f64,

    /// Weight each sample by `1/sqrt(snr)`.
    #[serde(default)]
    pub debiased_estimation_loss: bool,

    /// Loss recorder settings.
    #[serde(default)]
    pub loss_recorder: LossRecorderConfig,
}

fn default_min_snr_gamma() -> f64 {
    5.0
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            min_snr_gamma: default_min_snr_gamma(),
            debiased_estimation_loss: false,
            loss_recorder: LossRecorderConfig::default(),
        }
    }
}

/// Loss recorder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossRecorderConfig {
    /// EMA decay.
    #[serde(default = "default_recorder_gamma")]
    pub gamma: f64,

    /// Window of the logged moving average.
    #[serde(default = "default_recorder_stride")]
    pub stride: usize,
}

fn default_recorder_gamma() -> f64 {
    0.9
}
fn default_recorder_stride() -> usize {
    1000
}

impl Default for LossRecorderConfig {
    fn default() -> Self {
        Self {
            gamma: default_recorder_gamma(),
            stride: default_recorder_stride(),
        }
    }
}

/// Checkpoint cadence and output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavingConfig {
    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Base name of saved artifacts.
    #[serde(default = "default_output_name")]
    pub output_name: String,

    /// Directory for metric logs.
    #[serde(default = "default_logging_dir")]
    pub logging_dir: String,

    /// Precision of saved weights.
    #[serde(default)]
    pub save_precision: SavePrecision,

    /// Save every N epochs.
    #[serde(default)]
    pub save_every_n_epochs: Option<u64>,

    /// Save every N optimizer steps.
    #[serde(default)]
    pub save_every_n_steps: Option<u64>,

    /// Save when the loop completes normally.
    #[serde(default)]
    pub save_on_train_end: bool,

    /// Save when interrupted.
    #[serde(default)]
    pub save_on_keyboard_interrupt: bool,

    /// Save when the loop fails.
    #[serde(default)]
    pub save_on_exception: bool,
}

fn default_output_dir() -> String {
    "outputs".into()
}
fn default_output_name() -> String {
    "model".into()
}
fn default_logging_dir() -> String {
    "logging".into()
}

impl Default for SavingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            output_name: default_output_name(),
            logging_dir: default_logging_dir(),
            save_precision: SavePrecision::default(),
            save_every_n_epochs: None,
            save_every_n_steps: None,
            save_on_train_end: false,
            save_on_keyboard_interrupt: false,
            save_on_exception: false,
        }
    }
}

/// Sample-image cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
    /// Sample every N epochs.
    #[serde(default)]
    pub sample_every_n_epochs: Option<u64>,

    /// Sample every N optimizer steps.
    #[serde(default)]
    pub sample_every_n_steps: Option<u64>,

    /// File with prompts for sample images.
    #[serde(default)]
    pub sample_prompts: Option<String>,

    /// Sampler used by the sample generator.
    #[serde(default)]
    pub sample_sampler: SampleSampler,
}

/// Inference sampler for sample images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleSampler {
    /// DDIM.
    #[default]
    #[serde(rename = "ddim")]
    Ddim,
    /// PNDM.
    #[serde(rename = "pndm")]
    Pndm,
    /// LMS.
    #[serde(rename = "lms")]
    Lms,
    /// Euler.
    #[serde(rename = "euler")]
    Euler,
    /// Euler ancestral.
    #[serde(rename = "euler_a")]
    EulerA,
    /// Heun.
    #[serde(rename = "heun")]
    Heun,
    /// DPM2.
    #[serde(rename = "dpm_2")]
    Dpm2,
    /// DPM2 ancestral.
    #[serde(rename = "dpm_2_a")]
    Dpm2A,
    /// DPM-Solver.
    #[serde(rename = "dpmsolver")]
    DpmSolver,
    /// DPM-Solver++.
    #[serde(rename = "dpmsolver++")]
    DpmSolverPlusPlus,
    /// Single-step DPM-Solver.
    #[serde(rename = "dpmsingle")]
    DpmSingle,
    /// k-diffusion LMS.
    #[serde(rename = "k_lms")]
    KLms,
    /// k-diffusion Euler.
    #[serde(rename = "k_euler")]
    KEuler,
    /// k-diffusion Euler ancestral.
    #[serde(rename = "k_euler_a")]
    KEulerA,
    /// k-diffusion DPM2.
    #[serde(rename = "k_dpm_2")]
    KDpm2,
    /// k-diffusion DPM2 ancestral.
    #[serde(rename = "k_dpm_2_a")]
    KDpm2A,
}

impl TrainConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed YAML, unknown keys or unknown enum values
    /// (for example an unsupported `prediction_type`).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"sdxl-base"` - SDXL base, epsilon prediction
    /// - `"sdxl-vpred"` - SDXL with v-prediction and zero terminal SNR
    ///
    /// # Example
    ///
    /// ```rust
    /// use sdxl_finetune_rs::TrainConfig;
    /// use sdxl_finetune_rs::loss::PredictionType;
    ///
    /// # fn main() -> sdxl_finetune_rs::Result<()> {
    /// let config = TrainConfig::from_preset("sdxl-vpred")?;
    /// assert_eq!(config.noise.prediction_type, PredictionType::Velocity);
    /// assert!(config.noise.zero_terminal_snr);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "sdxl-base" => Ok(Self::sdxl_base_preset()),
            "sdxl-vpred" => Ok(Self::sdxl_vpred_preset()),
            _ => Err(FinetuneError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// SDXL base 1.0 with epsilon prediction.
    #[must_use]
    pub fn sdxl_base_preset() -> Self {
        Self {
            model: ModelConfig {
                pretrained_model_name_or_path: "stabilityai/stable-diffusion-xl-base-1.0".into(),
                vae: None,
                no_half_vae: true,
            },
            training: TrainingConfig {
                num_train_epochs: 10,
                learning_rate: 1e-6,
                gradient_accumulation_steps: 4,
                max_grad_norm: 1.0,
                ..Default::default()
            },
            noise: NoiseConfig::default(),
            loss: LossConfig::default(),
            saving: SavingConfig {
                output_dir: "./outputs/sdxl-base".into(),
                save_every_n_epochs: Some(1),
                save_on_train_end: true,
                ..Default::default()
            },
            sampling: SamplingConfig::default(),
            seed: default_seed(),
        }
    }

    /// SDXL with v-prediction and a zero-terminal-SNR schedule.
    #[must_use]
    pub fn sdxl_vpred_preset() -> Self {
        let mut config = Self::sdxl_base_preset();
        config.noise.prediction_type = PredictionType::Velocity;
        config.noise.zero_terminal_snr = true;
        config.saving.output_dir = "./outputs/sdxl-vpred".into();
        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.model.pretrained_model_name_or_path.is_empty() {
            return Err(FinetuneError::Config(
                "model.pretrained_model_name_or_path is required".into(),
            ));
        }

        let training = &self.training;
        if training.num_train_epochs == 0 {
            return Err(FinetuneError::Config(
                "training.num_train_epochs must be >= 1".into(),
            ));
        }
        if training.batch_size == 0 {
            return Err(FinetuneError::Config("training.batch_size must be >= 1".into()));
        }
        if training.gradient_accumulation_steps == 0 {
            return Err(FinetuneError::Config(
                "training.gradient_accumulation_steps must be >= 1".into(),
            ));
        }
        if training.lr_scheduler_num_cycles == 0 {
            return Err(FinetuneError::Config(
                "training.lr_scheduler_num_cycles must be >= 1".into(),
            ));
        }
        ensure_non_negative("training.learning_rate", training.learning_rate)?;
        ensure_non_negative("training.max_grad_norm", training.max_grad_norm)?;
        if let Some(lr) = training.learning_rate_te1 {
            ensure_non_negative("training.learning_rate_te1", lr)?;
        }
        if let Some(lr) = training.learning_rate_te2 {
            ensure_non_negative("training.learning_rate_te2", lr)?;
        }

        if training.full_fp16 && training.full_bf16 {
            return Err(FinetuneError::Config(
                "full_fp16 and full_bf16 cannot both be enabled".into(),
            ));
        }
        if training.full_fp16 && training.mixed_precision != MixedPrecision::Fp16 {
            return Err(FinetuneError::Config(
                "full_fp16 requires mixed_precision: fp16".into(),
            ));
        }
        if training.full_bf16 && training.mixed_precision != MixedPrecision::Bf16 {
            return Err(FinetuneError::Config(
                "full_bf16 requires mixed_precision: bf16".into(),
            ));
        }

        self.block_lrs()?;

        let noise = &self.noise;
        ensure_non_negative("noise.noise_offset", noise.noise_offset)?;
        ensure_non_negative("noise.ip_noise_gamma", noise.ip_noise_gamma)?;
        ensure_non_negative("noise.multires_noise_discount", noise.multires_noise_discount)?;
        if let Some(scale) = noise.adaptive_noise_scale {
            if !scale.is_finite() {
                return Err(FinetuneError::Config(format!(
                    "noise.adaptive_noise_scale must be finite, got {scale}"
                )));
            }
            if noise.noise_offset == 0.0 {
                return Err(FinetuneError::Config(
                    "noise.adaptive_noise_scale requires noise.noise_offset".into(),
                ));
            }
        }
        if noise.max_timestep > NUM_TRAIN_TIMESTEPS {
            return Err(FinetuneError::Config(format!(
                "noise.max_timestep must be <= {NUM_TRAIN_TIMESTEPS}"
            )));
        }
        if noise.min_timestep >= noise.max_timestep {
            return Err(FinetuneError::Config(format!(
                "noise.min_timestep ({}) must be < noise.max_timestep ({})",
                noise.min_timestep, noise.max_timestep
            )));
        }

        ensure_non_negative("loss.min_snr_gamma", self.loss.min_snr_gamma)?;
        let recorder = &self.loss.loss_recorder;
        if !(recorder.gamma > 0.0 && recorder.gamma < 1.0) {
            return Err(FinetuneError::Config(format!(
                "loss.loss_recorder.gamma must be in (0, 1), got {}",
                recorder.gamma
            )));
        }
        if recorder.stride == 0 {
            return Err(FinetuneError::Config(
                "loss.loss_recorder.stride must be >= 1".into(),
            ));
        }

        for (name, value) in [
            ("saving.save_every_n_epochs", self.saving.save_every_n_epochs),
            ("saving.save_every_n_steps", self.saving.save_every_n_steps),
            ("sampling.sample_every_n_epochs", self.sampling.sample_every_n_epochs),
            ("sampling.sample_every_n_steps", self.sampling.sample_every_n_steps),
        ] {
            if value == Some(0) {
                return Err(FinetuneError::Config(format!("{name} must be >= 1 when set")));
            }
        }

        if self.saving.output_name.is_empty() {
            return Err(FinetuneError::Config("saving.output_name is required".into()));
        }

        Ok(())
    }

    /// Parsed `training.block_lr`, if set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an entry is not a number or the list
    /// does not have exactly [`UNET_NUM_BLOCKS_FOR_BLOCK_LR`] entries.
    pub fn block_lrs(&self) -> Result<Option<Vec<f64>>> {
        let Some(raw) = self.training.block_lr.as_deref() else {
            return Ok(None);
        };
        let lrs = raw
            .split(',')
            .map(|entry| {
                let entry = entry.trim();
                entry.parse::<f64>().map_err(|_| {
                    FinetuneError::Config(format!("block_lr entry {entry:?} is not a number"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if lrs.len() != UNET_NUM_BLOCKS_FOR_BLOCK_LR {
            return Err(FinetuneError::Config(format!(
                "block_lr must have {UNET_NUM_BLOCKS_FOR_BLOCK_LR} values, got {}",
                lrs.len()
            )));
        }
        if let Some(bad) = lrs.iter().find(|lr| !lr.is_finite() || **lr < 0.0) {
            return Err(FinetuneError::Config(format!(
                "block_lr values must be finite and >= 0, got {bad}"
            )));
        }
        Ok(Some(lrs))
    }

    /// Learning rate of the first text encoder.
    #[must_use]
    pub fn learning_rate_te1(&self) -> f64 {
        self.training
            .learning_rate_te1
            .unwrap_or(self.training.learning_rate)
    }

    /// Learning rate of the second text encoder.
    #[must_use]
    pub fn learning_rate_te2(&self) -> f64 {
        self.training
            .learning_rate_te2
            .unwrap_or(self.training.learning_rate)
    }

    /// Dtype the frozen and trained weights run in.
    #[must_use]
    pub fn weight_dtype(&self) -> DType {
        match self.training.mixed_precision {
            MixedPrecision::No => DType::F32,
            MixedPrecision::Fp16 => DType::F16,
            MixedPrecision::Bf16 => DType::BF16,
        }
    }

    /// Dtype checkpoints are written in.
    #[must_use]
    pub fn save_dtype(&self) -> DType {
        match self.saving.save_precision {
            SavePrecision::Float => DType::F32,
            SavePrecision::Fp16 => DType::F16,
            SavePrecision::Bf16 => DType::BF16,
        }
    }

    /// Save and sample cadence.
    #[must_use]
    pub fn cadence(&self) -> Cadence {
        Cadence {
            save_every_n_epochs: self.saving.save_every_n_epochs,
            save_every_n_steps: self.saving.save_every_n_steps,
            sample_every_n_epochs: self.sampling.sample_every_n_epochs,
            sample_every_n_steps: self.sampling.sample_every_n_steps,
        }
    }

    /// Which exit paths trigger a final save.
    #[must_use]
    pub fn terminal_policy(&self) -> TerminalPolicy {
        TerminalPolicy {
            save_on_train_end: self.saving.save_on_train_end,
            save_on_keyboard_interrupt: self.saving.save_on_keyboard_interrupt,
            save_on_exception: self.saving.save_on_exception,
        }
    }

    /// Optimizer steps per epoch for a process that sees `num_batches` micro-batches.
    #[must_use]
    pub fn steps_per_epoch(&self, num_batches: usize) -> usize {
        num_batches.div_ceil(self.training.gradient_accumulation_steps.max(1))
    }

    /// Learning-rate schedule shape for a run of `total_steps` optimizer steps.
    #[must_use]
    pub fn scheduler_type(&self, total_steps: usize) -> SchedulerType {
        let warmup_steps = self.training.lr_warmup_steps;
        match self.training.lr_scheduler {
            LrSchedulerKind::Constant => SchedulerType::Constant { warmup_steps },
            LrSchedulerKind::Linear => SchedulerType::Linear {
                warmup_steps,
                total_steps,
            },
            LrSchedulerKind::Cosine => SchedulerType::Cosine {
                warmup_steps,
                total_steps,
            },
            LrSchedulerKind::CosineWithRestarts => SchedulerType::CosineWithRestarts {
                warmup_steps,
                total_steps,
                num_cycles: self.training.lr_scheduler_num_cycles,
            },
            LrSchedulerKind::Polynomial => SchedulerType::Polynomial {
                warmup_steps,
                total_steps,
                power: self.training.lr_scheduler_power,
            },
        }
    }
}

fn ensure_non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FinetuneError::Config(format!(
            "{name} must be finite and >= 0, got {value}"
        )))
    }
}
