//! Side-effect collaborators: checkpoints, samples and metrics.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_nn::VarMap;

use crate::config::TrainConfig;
use crate::error::{FinetuneError, Result};
use crate::state::{SampleReason, SaveReason, StateSnapshot};

/// Named scalar metrics for one logging call.
pub type Metrics = BTreeMap<String, f64>;

/// File name of the persisted counters inside an artifact directory.
pub const TRAINING_STATE_FILE: &str = "training_state.json";

/// File name of the configuration copy inside an artifact directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Writes a checkpoint. Called on the main process only.
pub trait CheckpointWriter {
    /// Persists the run at `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint could not be written.
    fn save(&mut self, reason: SaveReason, snapshot: &StateSnapshot) -> Result<()>;
}

/// Renders sample images. Called on the main process only.
pub trait SampleGenerator {
    /// Generates samples for `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails.
    fn sample(&mut self, reason: SampleReason, snapshot: &StateSnapshot) -> Result<()>;
}

/// Receives scalar metrics.
pub trait MetricsSink {
    /// Records `metrics` at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics could not be recorded.
    fn log(&mut self, metrics: &Metrics, step: u64) -> Result<()>;

    /// Flushes and releases the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: MetricsSink + ?Sized> MetricsSink for Box<T> {
    fn log(&mut self, metrics: &Metrics, step: u64) -> Result<()> {
        (**self).log(metrics, step)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<T: MetricsSink> MetricsSink for Vec<T> {
    fn log(&mut self, metrics: &Metrics, step: u64) -> Result<()> {
        self.iter_mut().try_for_each(|sink| sink.log(metrics, step))
    }

    fn close(&mut self) -> Result<()> {
        self.iter_mut().try_for_each(|sink| sink.close())
    }
}

/// Directory name of the artifact for `reason` at `snapshot`.
///
/// ```rust
/// use sdxl_finetune_rs::hooks::artifact_name;
/// use sdxl_finetune_rs::state::{SaveReason, StateSnapshot};
///
/// let snapshot = StateSnapshot { global_step: 1500, epoch: 3 };
/// assert_eq!(artifact_name("model", SaveReason::Step, &snapshot), "model-step00001500");
/// assert_eq!(artifact_name("model", SaveReason::Epoch, &snapshot), "model-000003");
/// assert_eq!(artifact_name("model", SaveReason::TrainEnd, &snapshot), "model");
/// ```
#[must_use]
pub fn artifact_name(output_name: &str, reason: SaveReason, snapshot: &StateSnapshot) -> String {
    match reason {
        SaveReason::Step => format!("{output_name}-step{:08}", snapshot.global_step),
        SaveReason::Epoch => format!("{output_name}-{:06}", snapshot.epoch),
        SaveReason::TrainEnd => output_name.to_string(),
    }
}

/// Writes the run counters and configuration (and optionally trainable
/// weights) into one directory per artifact.
pub struct StateCheckpointWriter {
    output_dir: PathBuf,
    config: TrainConfig,
    weights: Option<VarMap>,
    written: Vec<PathBuf>,
}

impl StateCheckpointWriter {
    /// Writer rooted at `config.saving.output_dir`.
    #[must_use]
    pub fn new(config: TrainConfig) -> Self {
        Self {
            output_dir: PathBuf::from(&config.saving.output_dir),
            config,
            weights: None,
            written: Vec::new(),
        }
    }

    /// Also save these variables as `model.safetensors`.
    #[must_use]
    pub fn with_weights(mut self, weights: VarMap) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Directories written so far, oldest first.
    #[must_use]
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Reads the counters saved in `artifact_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Checkpoint`] if the state file is missing or
    /// malformed.
    pub fn load_snapshot<P: AsRef<Path>>(artifact_dir: P) -> Result<StateSnapshot> {
        let path = artifact_dir.as_ref().join(TRAINING_STATE_FILE);
        let json = std::fs::read_to_string(&path).map_err(|e| {
            FinetuneError::Checkpoint(format!("Failed to read {}: {e}", path.display()))
        })?;
        let snapshot: StateSnapshot = serde_json::from_str(&json).map_err(|e| {
            FinetuneError::Checkpoint(format!("Failed to parse {}: {e}", path.display()))
        })?;
        tracing::info!(
            "Loaded checkpoint from: {} (step={}, epoch={})",
            artifact_dir.as_ref().display(),
            snapshot.global_step,
            snapshot.epoch
        );
        Ok(snapshot)
    }
}

impl CheckpointWriter for StateCheckpointWriter {
    fn save(&mut self, reason: SaveReason, snapshot: &StateSnapshot) -> Result<()> {
        let name = artifact_name(&self.config.saving.output_name, reason, snapshot);
        let dir = self.output_dir.join(name);
        std::fs::create_dir_all(&dir)?;

        let state_json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(dir.join(TRAINING_STATE_FILE), state_json)?;
        self.config.to_file(dir.join(CONFIG_FILE))?;

        if let Some(weights) = &self.weights {
            weights.save(dir.join("model.safetensors")).map_err(|e| {
                FinetuneError::Checkpoint(format!("Failed to save weights: {e}"))
            })?;
        }

        tracing::info!(?reason, "Saved checkpoint to: {}", dir.display());
        self.written.push(dir);
        Ok(())
    }
}

/// Logs metrics through `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn log(&mut self, metrics: &Metrics, step: u64) -> Result<()> {
        tracing::debug!(step, ?metrics, "metrics");
        Ok(())
    }
}

/// Appends one JSON object per call to `metrics.jsonl`.
pub struct JsonlMetrics {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlMetrics {
    /// Creates (or truncates) `metrics.jsonl` under `logging_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create<P: AsRef<Path>>(logging_dir: P) -> Result<Self> {
        std::fs::create_dir_all(&logging_dir)?;
        let path = logging_dir.as_ref().join("metrics.jsonl");
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetrics {
    fn log(&mut self, metrics: &Metrics, step: u64) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            FinetuneError::Training(format!("{} is already closed", self.path.display()))
        })?;
        let mut record = serde_json::Map::new();
        record.insert("step".into(), step.into());
        for (key, value) in metrics {
            record.insert(key.clone(), (*value).into());
        }
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Records what would have been saved or sampled without doing it.
#[derive(Debug, Clone)]
pub struct DryRun<R> {
    /// Every call in order.
    pub events: Vec<(R, StateSnapshot)>,
}

impl<R> Default for DryRun<R> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

/// Recorded checkpoint calls.
pub type PlannedSaves = DryRun<SaveReason>;

/// Recorded sample calls.
pub type PlannedSamples = DryRun<SampleReason>;

impl CheckpointWriter for DryRun<SaveReason> {
    fn save(&mut self, reason: SaveReason, snapshot: &StateSnapshot) -> Result<()> {
        self.events.push((reason, *snapshot));
        Ok(())
    }
}

impl SampleGenerator for DryRun<SampleReason> {
    fn sample(&mut self, reason: SampleReason, snapshot: &StateSnapshot) -> Result<()> {
        self.events.push((reason, *snapshot));
        Ok(())
    }
}

/// Sample generator for runs without sample prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSamples;

impl SampleGenerator for NoSamples {
    fn sample(&mut self, reason: SampleReason, snapshot: &StateSnapshot) -> Result<()> {
        tracing::debug!(?reason, step = snapshot.global_step, "no sample generator configured");
        Ok(())
    }
}
