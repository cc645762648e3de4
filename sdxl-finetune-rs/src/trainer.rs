//! Training loop orchestration.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::Tensor;
use indicatif::ProgressBar;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TrainConfig;
use crate::coordinator::StepCoordinator;
use crate::distributed::Collective;
use crate::error::{FinetuneError, Result};
use crate::hooks::{CheckpointWriter, Metrics, MetricsSink, SampleGenerator, StateCheckpointWriter};
use crate::logging::LogContext;
use crate::loss::{replace_nan, LossBreakdown, LossWeighting, PredictionType};
use crate::optimizer::Optimizer;
use crate::recorder::LossRecorder;
use crate::schedule::{perturb_noise, sample_noise, NoiseSchedule, VAE_SCALE_FACTOR};
use crate::scheduler::LrScheduler;
use crate::state::{Effects, LoopOutcome, RunReport, StateSnapshot, TrainingState};

/// Size conditioning of one SDXL sample, as `(height, width)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCondition {
    /// Size of the source image.
    pub original_size: (u32, u32),
    /// Top-left corner of the crop.
    pub crop_top_left: (u32, u32),
    /// Size the model is trained at.
    pub target_size: (u32, u32),
}

/// One micro-batch.
///
/// Either `latents` (cached) or `images` (to be encoded) must be present.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Cached VAE latents `[batch, channels, h, w]`.
    pub latents: Option<Tensor>,
    /// Pixel images to encode.
    pub images: Option<Tensor>,
    /// Text-encoder outputs and other conditioning, passed to the denoiser.
    pub conditioning: BTreeMap<String, Tensor>,
    /// Per-sample size conditioning.
    pub sizes: Vec<SizeCondition>,
}

/// Supplies this process's shard of the data.
pub trait BatchSource {
    /// Micro-batches per epoch on this process.
    fn num_batches(&self) -> usize;

    /// Iterates one epoch.
    ///
    /// # Errors
    ///
    /// Returns an error if the epoch cannot be started.
    fn batches(&mut self, epoch: u64) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>>;
}

/// Encodes images to latents.
pub trait LatentEncoder {
    /// Encodes a batch of images.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn encode(&mut self, images: &Tensor) -> Result<Tensor>;
}

/// The model being trained.
pub trait Denoiser {
    /// Predicts noise or velocity for `noisy_latents` at `timesteps`.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn predict(&mut self, noisy_latents: &Tensor, timesteps: &Tensor, batch: &Batch) -> Result<Tensor>;
}

/// Cooperative interrupt flag.
///
/// The flag is only polled at optimizer-step boundaries, where the replicas
/// agree on it so every process takes the same exit path.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A signal nothing will trigger except [`ShutdownSignal::request`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal set by Ctrl-C.
    ///
    /// A background thread waits on `tokio::signal::ctrl_c` and flips the
    /// flag once.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal runtime or its thread cannot be started.
    pub fn install_ctrl_c() -> Result<Self> {
        let signal = Self::new();
        let flag = Arc::clone(&signal.flag);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        std::thread::Builder::new()
            .name("ctrl-c".into())
            .spawn(move || {
                runtime.block_on(async {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            tracing::warn!("Interrupt received, stopping at the next optimizer step");
                            flag.store(true, Ordering::SeqCst);
                        }
                        Err(e) => tracing::error!("Failed to listen for Ctrl-C: {e}"),
                    }
                });
            })?;
        Ok(signal)
    }

    /// Requests a stop.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested on this process.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything the loop talks to.
pub struct Collaborators<'a> {
    /// Data shard.
    pub batches: &'a mut dyn BatchSource,
    /// Image encoder, required only for batches without cached latents.
    pub encoder: Option<&'a mut dyn LatentEncoder>,
    /// Model.
    pub denoiser: &'a mut dyn Denoiser,
    /// Optimizer over the trainable parameters.
    pub optimizer: &'a mut dyn Optimizer,
    /// Checkpoint writer.
    pub checkpoint: &'a mut dyn CheckpointWriter,
    /// Sample generator.
    pub sampler: &'a mut dyn SampleGenerator,
    /// Metrics sink.
    pub metrics: &'a mut dyn MetricsSink,
    /// Process group.
    pub collective: &'a dyn Collective,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use sdxl_finetune_rs::{LogContext, TrainConfig, Trainer};
///
/// # fn main() -> sdxl_finetune_rs::Result<()> {
/// let config = TrainConfig::from_preset("sdxl-base")?;
/// let trainer = Trainer::new(config, LogContext::new(0, 1))?;
/// assert!(!trainer.schedule().is_zero_terminal_snr());
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: TrainConfig,
    schedule: NoiseSchedule,
    weighting: LossWeighting,
    log: LogContext,
    rng: StdRng,
    resume: Option<StateSnapshot>,
    recorder: Option<LossRecorder>,
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// Validates the configuration and builds the noise schedule (with the
    /// zero-terminal-SNR correction applied if configured).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: TrainConfig, log: LogContext) -> Result<Self> {
        config.validate()?;
        let schedule = NoiseSchedule::from_config(&config.noise);
        let weighting = LossWeighting::from_config(&config.loss, config.noise.prediction_type);
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(log.rank() as u64));
        Ok(Self {
            config,
            schedule,
            weighting,
            log,
            rng,
            resume: None,
            recorder: None,
        })
    }

    /// Continue counting from `snapshot`.
    pub fn resume_from(&mut self, snapshot: StateSnapshot) {
        self.resume = Some(snapshot);
    }

    /// Continue counting from the state saved in `artifact_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded.
    pub fn resume_from_dir(&mut self, artifact_dir: &str) -> Result<()> {
        self.resume = Some(StateCheckpointWriter::load_snapshot(artifact_dir)?);
        Ok(())
    }

    /// The schedule shared by noising, targets and loss weighting.
    #[must_use]
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Loss weighting policy.
    #[must_use]
    pub fn weighting(&self) -> &LossWeighting {
        &self.weighting
    }

    /// Loss statistics of the last run.
    #[must_use]
    pub fn loss_recorder(&self) -> Option<&LossRecorder> {
        self.recorder.as_ref()
    }

    /// Runs the training loop to one of its exit paths.
    ///
    /// Errors and panics inside the loop take the exception path: cleanup
    /// (including the conditional final save) still runs and the error is
    /// returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns the loop's error, or an error from setup or cleanup.
    pub fn run(&mut self, mut parts: Collaborators<'_>, shutdown: &ShutdownSignal) -> Result<RunReport> {
        let _span = self.log.span().clone().entered();

        let num_batches = parts.batches.num_batches();
        let steps_per_epoch = self.config.steps_per_epoch(num_batches);
        let is_main = parts.collective.is_main_process();
        let mut state = TrainingState::from_config(&self.config, steps_per_epoch, is_main);
        if let Some(snapshot) = self.resume {
            state.restore(snapshot)?;
        }

        let gamma = self.config.loss.loss_recorder.gamma;
        self.recorder = Some(LossRecorder::for_epoch(gamma, steps_per_epoch)?);
        let total_steps = usize::try_from(state.num_train_steps()).unwrap_or(usize::MAX);
        let mut scheduler = LrScheduler::starting_at(
            self.config.scheduler_type(total_steps),
            usize::try_from(state.global_step()).unwrap_or(usize::MAX),
        );
        scheduler.apply(parts.optimizer);
        let mut coordinator = StepCoordinator::from_config(&self.config.training)?;

        self.log_banner(&state, steps_per_epoch, parts.collective.world_size());

        let pb = self.log.progress_bar(state.num_train_steps())?;
        pb.set_position(state.global_step());

        state.start()?;
        let outcome = {
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.train_loop(&mut state, &mut parts, &mut scheduler, &mut coordinator, &pb, shutdown)
            }));
            match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => LoopOutcome::Failed(err),
                Err(panic) => LoopOutcome::Failed(FinetuneError::Training(format!(
                    "panic in training loop: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        };
        pb.finish_and_clear();

        let mut effects = Effects {
            checkpoint: &mut *parts.checkpoint,
            sampler: &mut *parts.sampler,
            collective: parts.collective,
        };
        let report = state.finish(outcome, &mut effects, &mut *parts.metrics)?;
        tracing::info!(
            "training finished at process {}/{}",
            self.log.rank() + 1,
            self.log.world_size()
        );
        Ok(report)
    }

    fn train_loop(
        &mut self,
        state: &mut TrainingState,
        parts: &mut Collaborators<'_>,
        scheduler: &mut LrScheduler,
        coordinator: &mut StepCoordinator,
        pb: &ProgressBar,
        shutdown: &ShutdownSignal,
    ) -> Result<LoopOutcome> {
        let num_batches = parts.batches.num_batches();
        let steps_per_epoch = self.config.steps_per_epoch(num_batches);
        let stride = self.config.loss.loss_recorder.stride;
        let is_main = state.is_main_process();

        while !state.should_stop() {
            let epoch = state.epoch();
            if is_main {
                pb.println(format!("epoch: {}/{}", epoch + 1, state.num_train_epochs()));
            }

            // A replica that fails keeps walking the epoch's micro-batch indices
            // without computing, so that it meets its peers at the next group
            // boundary and they all agree to stop there.
            let mut failure = None;
            let mut source = match parts.batches.batches(epoch) {
                Ok(source) => Some(source),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            };

            for index in 0..num_batches {
                let closes_group = coordinator.advance(index + 1 == num_batches);

                let mut value = None;
                if let Some(batches) = source.as_mut().filter(|_| failure.is_none()) {
                    let encoder = parts
                        .encoder
                        .as_mut()
                        .map(|encoder| &mut **encoder as &mut dyn LatentEncoder);
                    let denoiser = &mut *parts.denoiser;
                    let optimizer = &mut *parts.optimizer;
                    let body = catch_unwind(AssertUnwindSafe(|| -> Result<f64> {
                        let batch = match batches.next() {
                            Some(batch) => batch?,
                            None => {
                                return Err(FinetuneError::Training(format!(
                                    "batch source yielded {index} of {num_batches} batches in epoch {epoch}"
                                )))
                            }
                        };
                        let breakdown = self.compute_loss(&batch, encoder, denoiser)?;
                        optimizer.accumulate(&breakdown.loss)?;
                        Ok(breakdown.value)
                    }));
                    match body.unwrap_or_else(|panic| {
                        Err(FinetuneError::Training(format!(
                            "micro-batch panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    }) {
                        Ok(loss) => value = Some(loss),
                        Err(err) => failure = Some(err),
                    }
                }

                if closes_group {
                    if parts.collective.any(failure.is_some())? {
                        return Ok(LoopOutcome::Failed(failure.unwrap_or_else(peer_failed)));
                    }
                    coordinator.sync(&mut *parts.optimizer, scheduler, parts.collective)?;
                    pb.inc(1);
                    let mut effects = Effects {
                        checkpoint: &mut *parts.checkpoint,
                        sampler: &mut *parts.sampler,
                        collective: parts.collective,
                    };
                    state.step(&mut effects)?;
                    if parts.collective.any(shutdown.is_requested())? {
                        return Ok(LoopOutcome::Interrupted);
                    }
                }

                let Some(step_loss) = value else {
                    continue;
                };
                let recorder = self.recorder_mut()?;
                recorder.add(step_loss);
                let avr_loss = recorder.moving_average(stride);
                let ema_loss = recorder.ema();

                if is_main {
                    let mut logs = Metrics::new();
                    logs.insert("loss/step".into(), step_loss);
                    logs.insert("loss_avr/step".into(), avr_loss);
                    logs.insert("loss_ema/step".into(), ema_loss);
                    for (group, lr) in parts.optimizer.learning_rates() {
                        logs.insert(format!("lr/{group}"), lr);
                    }
                    if let Err(err) = parts.metrics.log(&logs, state.global_step()) {
                        failure = Some(err);
                    }
                    pb.set_message(format!(
                        "step_loss={step_loss:.4} avr_loss={avr_loss:.4} ema_loss={ema_loss:.4}"
                    ));
                }
            }

            if let Some(batches) = source.as_mut().filter(|_| failure.is_none()) {
                if batches.next().is_some() {
                    failure = Some(FinetuneError::Training(format!(
                        "batch source yielded more than {num_batches} batches in epoch {epoch}"
                    )));
                }
            }

            if is_main && failure.is_none() {
                let mut logs = Metrics::new();
                logs.insert(
                    "loss/epoch".into(),
                    self.recorder_mut()?.moving_average(steps_per_epoch),
                );
                if let Err(err) = parts.metrics.log(&logs, epoch) {
                    failure = Some(err);
                }
            }
            if parts.collective.any(failure.is_some())? {
                return Ok(LoopOutcome::Failed(failure.unwrap_or_else(peer_failed)));
            }

            let mut effects = Effects {
                checkpoint: &mut *parts.checkpoint,
                sampler: &mut *parts.sampler,
                collective: parts.collective,
            };
            state.epoch_advance(&mut effects)?;
        }
        Ok(LoopOutcome::Completed)
    }

    /// Weighted loss for one micro-batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch carries neither latents nor images, or a
    /// collaborator or tensor op fails.
    pub fn compute_loss(
        &mut self,
        batch: &Batch,
        encoder: Option<&mut dyn LatentEncoder>,
        denoiser: &mut dyn Denoiser,
    ) -> Result<LossBreakdown> {
        let latents = match (&batch.latents, &batch.images) {
            (Some(latents), _) => latents.clone(),
            (None, Some(images)) => {
                let encoder = encoder.ok_or_else(|| {
                    FinetuneError::Training("batch has no cached latents and no encoder is configured".into())
                })?;
                let encoded = encoder.encode(images)?.detach();
                let (encoded, found) = replace_nan(&encoded)?;
                if found {
                    tracing::warn!("NaN found in latents, replacing with zeros");
                }
                encoded
            }
            (None, None) => {
                return Err(FinetuneError::Training(
                    "batch has neither latents nor images".into(),
                ))
            }
        };
        let latents = latents.affine(VAE_SCALE_FACTOR, 0.0)?;
        let batch_size = latents.dim(0)?;

        let noise_config = &self.config.noise;
        let noise = sample_noise(&latents, noise_config, &mut self.rng)?;
        let timesteps = self.schedule.sample_timesteps(
            batch_size,
            noise_config.min_timestep,
            noise_config.max_timestep,
            &mut self.rng,
        )?;
        let model_noise = perturb_noise(&noise, noise_config.ip_noise_gamma, &mut self.rng)?;
        let noisy_latents = self
            .schedule
            .add_noise(&latents, &model_noise, &timesteps)?
            .to_dtype(self.config.weight_dtype())?;
        let timestep_tensor = Tensor::from_vec(timesteps.clone(), batch_size, latents.device())?;

        let pred = denoiser.predict(&noisy_latents, &timestep_tensor, batch)?;
        let target = match noise_config.prediction_type {
            PredictionType::Epsilon => noise,
            PredictionType::Velocity => self.schedule.velocity(&latents, &noise, &timesteps)?,
        };

        let breakdown = self.weighting.compute(&pred, &target, &timesteps, &self.schedule)?;
        Ok(breakdown)
    }

    fn recorder_mut(&mut self) -> Result<&mut LossRecorder> {
        self.recorder
            .as_mut()
            .ok_or_else(|| FinetuneError::Training("loss recorder used before the run started".into()))
    }

    fn log_banner(&self, state: &TrainingState, steps_per_epoch: usize, world_size: usize) {
        let training = &self.config.training;
        tracing::info!("==================== START TRAINING ====================");
        tracing::info!(
            "  num train steps: {} x {} = {}",
            state.num_train_epochs(),
            steps_per_epoch,
            state.num_train_steps()
        );
        tracing::info!(
            "  learning rate: {} | text encoder 1: {} | text encoder 2: {}",
            training.learning_rate,
            self.config.learning_rate_te1(),
            self.config.learning_rate_te2()
        );
        tracing::info!(
            "  total batch size: {} = {} (batch size) x {} (gradient accumulation steps) x {} (num processes)",
            training.batch_size * training.gradient_accumulation_steps * world_size,
            training.batch_size,
            training.gradient_accumulation_steps,
            world_size
        );
        tracing::info!(
            "  mixed precision: {:?} | weight-dtype: {:?} | save-dtype: {:?}",
            training.mixed_precision,
            self.config.weight_dtype(),
            self.config.save_dtype()
        );
        tracing::info!(
            "  prediction type: {} | zero terminal snr: {} | min snr gamma: {} | debiased: {}",
            self.config.noise.prediction_type,
            self.schedule.is_zero_terminal_snr(),
            self.weighting.min_snr_gamma,
            self.weighting.debiased
        );
    }
}

fn peer_failed() -> FinetuneError {
    FinetuneError::Collective("another replica failed; stopping at the group boundary".into())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
