//! # sdxl-finetune-rs
//!
//! YAML-driven training core for fine-tuning SDXL-class latent diffusion
//! models.
//!
//! The crate owns everything between "a batch of latents and conditioning"
//! and "an optimizer update": the noise schedule (with optional
//! zero-terminal-SNR correction), noise injection and targets, Min-SNR and
//! debiased loss weighting, gradient accumulation across processes, the
//! run-phase state machine with its save/sample cadence, and loss statistics.
//! Models, data loading and checkpoint formats plug in through traits.
//!
//! ## Features
//!
//! - **YAML Configuration** - One file per run, validated once at startup
//! - **Epsilon and v-prediction** - With the matching schedule and targets
//! - **Loss weighting** - Min-SNR-γ and debiased estimation
//! - **Multi-process** - Accumulation groups synchronized through a [`Collective`]
//! - **Terminal policy** - Saves on completion, interrupt or failure as configured
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting config
//! sdxl-finetune init config.yaml --preset sdxl-vpred
//!
//! # Validate it
//! sdxl-finetune validate config.yaml
//!
//! # Show when saves and samples would happen
//! sdxl-finetune plan config.yaml --batches-per-epoch 500
//!
//! # Inspect the noise schedule and loss weights
//! sdxl-finetune schedule config.yaml --every 100
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```rust
//! use sdxl_finetune_rs::{LossWeighting, NoiseSchedule, TrainConfig};
//!
//! # fn main() -> sdxl_finetune_rs::Result<()> {
//! let config = TrainConfig::from_preset("sdxl-vpred")?;
//! config.validate()?;
//!
//! let schedule = NoiseSchedule::from_config(&config.noise);
//! assert!(schedule.snr(999) < 1e-6);
//!
//! let weighting = LossWeighting::from_config(&config.loss, config.noise.prediction_type);
//! assert!(weighting.weight(schedule.snr(999)) < 1e-6);
//! # Ok(())
//! # }
//! ```
//!
//! A full run wires a [`trainer::BatchSource`], a [`trainer::Denoiser`] and
//! an [`optimizer::Optimizer`] into [`Trainer::run`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod loss;
pub mod optimizer;
pub mod recorder;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod trainer;

pub use config::{TrainConfig, TrainingConfig};
pub use distributed::{Collective, LocalCollective, ProcessInfo, ThreadGroup};
pub use error::{FinetuneError, Result};
pub use logging::LogContext;
pub use loss::{LossWeighting, PredictionType};
pub use recorder::LossRecorder;
pub use schedule::NoiseSchedule;
pub use state::{LoopOutcome, RunPhase, RunReport, Termination, TrainingState};
pub use trainer::{Batch, Collaborators, ShutdownSignal, Trainer};
