//! Step/epoch bookkeeping and the exit-path funnel.
//!
//! [`TrainingState`] owns the counters and decides when to checkpoint or
//! sample. Every save or sample runs on the main process only, but every
//! process takes part in the collectives around it.

use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::distributed::Collective;
use crate::error::{FinetuneError, Result};
use crate::hooks::{CheckpointWriter, MetricsSink, SampleGenerator};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The loop ran to completion.
    Normal,
    /// An interrupt was received.
    Interrupted,
    /// The loop body failed.
    Error,
}

/// Lifecycle of a [`TrainingState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// Constructed, not yet started.
    Idle,
    /// Inside the training loop.
    Running,
    /// Finished through one of the exit paths.
    Terminated(Termination),
}

/// Result of the loop body, consumed by [`TrainingState::finish`].
#[derive(Debug)]
pub enum LoopOutcome {
    /// Every epoch ran.
    Completed,
    /// The replicas agreed to stop on an interrupt.
    Interrupted,
    /// The loop body returned an error or panicked.
    Failed(FinetuneError),
}

impl LoopOutcome {
    /// Terminal state this outcome leads to.
    #[must_use]
    pub fn termination(&self) -> Termination {
        match self {
            Self::Completed => Termination::Normal,
            Self::Interrupted => Termination::Interrupted,
            Self::Failed(_) => Termination::Error,
        }
    }
}

/// Save and sample cadence. `None` disables a trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cadence {
    /// Save every N epochs.
    pub save_every_n_epochs: Option<u64>,
    /// Save every N optimizer steps.
    pub save_every_n_steps: Option<u64>,
    /// Sample every N epochs.
    pub sample_every_n_epochs: Option<u64>,
    /// Sample every N optimizer steps.
    pub sample_every_n_steps: Option<u64>,
}

fn fires(every: Option<u64>, count: u64) -> bool {
    matches!(every, Some(n) if n > 0 && count % n == 0)
}

/// Which exit paths end with a final save. None do by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalPolicy {
    /// Save after normal completion.
    pub save_on_train_end: bool,
    /// Save after an interrupt.
    pub save_on_keyboard_interrupt: bool,
    /// Save after a failure.
    pub save_on_exception: bool,
}

impl TerminalPolicy {
    /// Whether `termination` triggers the final save.
    #[must_use]
    pub fn saves_on(&self, termination: Termination) -> bool {
        match termination {
            Termination::Normal => self.save_on_train_end,
            Termination::Interrupted => self.save_on_keyboard_interrupt,
            Termination::Error => self.save_on_exception,
        }
    }
}

/// Counters handed to collaborators and persisted as `training_state.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Optimizer updates applied so far.
    pub global_step: u64,
    /// Completed epochs.
    pub epoch: u64,
}

/// Why a checkpoint is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveReason {
    /// Step cadence.
    Step,
    /// Epoch cadence.
    Epoch,
    /// Final save on exit.
    TrainEnd,
}

/// Why samples are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleReason {
    /// Step cadence.
    Step,
    /// Epoch cadence.
    Epoch,
}

/// Which side effects fired on a boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Triggers {
    /// A checkpoint was written.
    pub save: bool,
    /// Samples were generated.
    pub sample: bool,
}

/// Collaborators the state machine drives.
pub struct Effects<'a> {
    /// Checkpoint writer (called on the main process only).
    pub checkpoint: &'a mut dyn CheckpointWriter,
    /// Sample generator (called on the main process only).
    pub sampler: &'a mut dyn SampleGenerator,
    /// Process group.
    pub collective: &'a dyn Collective,
}

/// Summary returned by a successful [`TrainingState::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Exit path taken.
    pub termination: Termination,
    /// Final optimizer step count.
    pub global_step: u64,
    /// Final epoch count.
    pub epoch: u64,
    /// Whether this process wrote the final checkpoint.
    pub final_save: bool,
}

/// Training-loop bookkeeping.
///
/// # Example
///
/// ```rust
/// use sdxl_finetune_rs::distributed::LocalCollective;
/// use sdxl_finetune_rs::hooks::{PlannedSamples, PlannedSaves, TracingMetrics};
/// use sdxl_finetune_rs::state::{Cadence, Effects, LoopOutcome, TerminalPolicy, TrainingState};
///
/// # fn main() -> sdxl_finetune_rs::Result<()> {
/// let cadence = Cadence { save_every_n_steps: Some(2), ..Default::default() };
/// let terminal = TerminalPolicy { save_on_train_end: true, ..Default::default() };
/// let mut state = TrainingState::new(1, 4, true, cadence, terminal);
/// let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
/// let mut effects = Effects {
///     checkpoint: &mut saves,
///     sampler: &mut samples,
///     collective: &LocalCollective,
/// };
///
/// state.start()?;
/// for _ in 0..4 {
///     state.step(&mut effects)?;
/// }
/// state.finish(LoopOutcome::Completed, &mut effects, &mut TracingMetrics)?;
///
/// // Steps 2 and 4, then the final save.
/// assert_eq!(saves.events.len(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TrainingState {
    global_step: u64,
    epoch: u64,
    is_main_process: bool,
    cadence: Cadence,
    terminal: TerminalPolicy,
    num_train_epochs: u64,
    num_train_steps: u64,
    phase: RunPhase,
}

impl TrainingState {
    /// Creates an idle state.
    #[must_use]
    pub fn new(
        num_train_epochs: u64,
        num_train_steps: u64,
        is_main_process: bool,
        cadence: Cadence,
        terminal: TerminalPolicy,
    ) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            is_main_process,
            cadence,
            terminal,
            num_train_epochs,
            num_train_steps,
            phase: RunPhase::Idle,
        }
    }

    /// Idle state for a run of `steps_per_epoch` optimizer steps per epoch.
    #[must_use]
    pub fn from_config(config: &TrainConfig, steps_per_epoch: usize, is_main_process: bool) -> Self {
        let epochs = config.training.num_train_epochs as u64;
        Self::new(
            epochs,
            epochs * steps_per_epoch as u64,
            is_main_process,
            config.cadence(),
            config.terminal_policy(),
        )
    }

    /// `Idle -> Running`.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::InvalidTransition`] from any other phase.
    pub fn start(&mut self) -> Result<()> {
        self.transition(RunPhase::Running, |from| from == RunPhase::Idle)
    }

    /// Seeds the counters of a resumed run.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::InvalidTransition`] unless the state is idle.
    pub fn restore(&mut self, snapshot: StateSnapshot) -> Result<()> {
        if self.phase != RunPhase::Idle {
            return Err(FinetuneError::InvalidTransition {
                from: self.phase,
                to: RunPhase::Idle,
            });
        }
        self.global_step = snapshot.global_step;
        self.epoch = snapshot.epoch;
        Ok(())
    }

    /// Records one optimizer update and runs the step cadence.
    ///
    /// # Errors
    ///
    /// Fails if the state is not running, a collective fails, or a
    /// collaborator fails on the main process.
    pub fn step(&mut self, effects: &mut Effects<'_>) -> Result<Triggers> {
        self.ensure_running()?;
        self.global_step += 1;

        let triggers = Triggers {
            save: fires(self.cadence.save_every_n_steps, self.global_step),
            sample: fires(self.cadence.sample_every_n_steps, self.global_step),
        };
        self.run_triggers(triggers, SaveReason::Step, SampleReason::Step, effects)?;
        Ok(triggers)
    }

    /// Records the end of a pass over the data and runs the epoch cadence.
    ///
    /// # Errors
    ///
    /// Fails if the state is not running, a collective fails, or a
    /// collaborator fails on the main process.
    pub fn epoch_advance(&mut self, effects: &mut Effects<'_>) -> Result<Triggers> {
        self.ensure_running()?;
        self.epoch += 1;
        effects.collective.barrier()?;

        let triggers = Triggers {
            save: fires(self.cadence.save_every_n_epochs, self.epoch),
            sample: fires(self.cadence.sample_every_n_epochs, self.epoch),
        };
        self.run_triggers(triggers, SaveReason::Epoch, SampleReason::Epoch, effects)?;
        Ok(triggers)
    }

    /// Whether the epoch or step budget is exhausted.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.epoch >= self.num_train_epochs || self.global_step >= self.num_train_steps
    }

    /// Terminates the run and performs the shared cleanup.
    ///
    /// Cleanup is a barrier, the conditional final save on the main process
    /// and closing the metrics sink. A `Failed` outcome is logged with its
    /// cause chain and returned as the error once cleanup has run.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::InvalidTransition`] if the run already
    /// terminated, the loop's own error for `Failed`, or the first cleanup
    /// error.
    pub fn finish(
        &mut self,
        outcome: LoopOutcome,
        effects: &mut Effects<'_>,
        metrics: &mut dyn MetricsSink,
    ) -> Result<RunReport> {
        let termination = outcome.termination();
        self.transition(RunPhase::Terminated(termination), |from| {
            !matches!(from, RunPhase::Terminated(_))
        })?;

        let failure = match outcome {
            LoopOutcome::Completed => {
                tracing::info!(global_step = self.global_step, "training completed");
                None
            }
            LoopOutcome::Interrupted => {
                tracing::warn!(global_step = self.global_step, "training interrupted");
                None
            }
            LoopOutcome::Failed(err) => {
                tracing::error!(global_step = self.global_step, "training failed: {}", err.report());
                Some(err)
            }
        };

        let mut cleanup_error = effects.collective.barrier().err();

        let final_save = self.is_main_process && self.terminal.saves_on(termination);
        if final_save {
            tracing::info!("saving on train end");
            if let Err(err) = effects.checkpoint.save(SaveReason::TrainEnd, &self.snapshot()) {
                tracing::error!("final save failed: {}", err.report());
                cleanup_error.get_or_insert(err);
            }
        }

        if let Err(err) = metrics.close() {
            cleanup_error.get_or_insert(err);
        }

        if let Some(err) = failure.or(cleanup_error) {
            return Err(err);
        }
        Ok(RunReport {
            termination,
            global_step: self.global_step,
            epoch: self.epoch,
            final_save,
        })
    }

    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            global_step: self.global_step,
            epoch: self.epoch,
        }
    }

    /// Optimizer updates applied so far.
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Completed epochs.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Epoch budget.
    #[must_use]
    pub fn num_train_epochs(&self) -> u64 {
        self.num_train_epochs
    }

    /// Step budget.
    #[must_use]
    pub fn num_train_steps(&self) -> u64 {
        self.num_train_steps
    }

    /// Whether this process performs side effects.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.is_main_process
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, to: RunPhase, allowed: impl Fn(RunPhase) -> bool) -> Result<()> {
        if !allowed(self.phase) {
            return Err(FinetuneError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.phase == RunPhase::Running {
            Ok(())
        } else {
            Err(FinetuneError::InvalidTransition {
                from: self.phase,
                to: RunPhase::Running,
            })
        }
    }

    fn run_triggers(
        &self,
        triggers: Triggers,
        save: SaveReason,
        sample: SampleReason,
        effects: &mut Effects<'_>,
    ) -> Result<()> {
        let snapshot = self.snapshot();
        if triggers.save {
            let is_main = self.is_main_process;
            guarded(effects.collective, is_main, "checkpoint", || {
                effects.checkpoint.save(save, &snapshot)
            })?;
        }
        if triggers.sample {
            let is_main = self.is_main_process;
            guarded(effects.collective, is_main, "sample", || {
                effects.sampler.sample(sample, &snapshot)
            })?;
        }
        Ok(())
    }
}

/// Runs `action` on the main process between two group-wide sync points.
///
/// The closing sync is an agreement on failure, so a collaborator error on the
/// main process surfaces on every replica and all of them take the same exit
/// path.
fn guarded<F>(collective: &dyn Collective, is_main: bool, what: &str, action: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    collective.barrier()?;
    let result = if is_main { action() } else { Ok(()) };
    let any_failed = collective.any(result.is_err())?;
    match result {
        Err(err) => Err(err),
        Ok(()) if any_failed => Err(FinetuneError::Training(format!(
            "{what} failed on the main process"
        ))),
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCollective;
    use crate::hooks::{PlannedSamples, PlannedSaves, TracingMetrics};

    struct FailingWriter;

    impl CheckpointWriter for FailingWriter {
        fn save(&mut self, _reason: SaveReason, _snapshot: &StateSnapshot) -> Result<()> {
            Err(FinetuneError::Checkpoint("disk full".into()))
        }
    }

    fn running(cadence: Cadence, terminal: TerminalPolicy, is_main: bool) -> TrainingState {
        let mut state = TrainingState::new(10, 1000, is_main, cadence, terminal);
        state.start().unwrap();
        state
    }

    #[test]
    fn test_step_increments_by_one() {
        let mut state = running(Cadence::default(), TerminalPolicy::default(), true);
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        for expected in 1..=5 {
            state.step(&mut effects).unwrap();
            assert_eq!(state.global_step(), expected);
        }
    }

    #[test]
    fn test_step_cadence_fires_only_on_multiples() {
        let cadence = Cadence {
            save_every_n_steps: Some(100),
            ..Default::default()
        };
        let mut state = running(cadence, TerminalPolicy::default(), true);
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        for _ in 1..100 {
            let triggers = state.step(&mut effects).unwrap();
            assert!(!triggers.save);
        }
        let triggers = state.step(&mut effects).unwrap();
        assert!(triggers.save);
        assert!(!triggers.sample);
        drop(effects);

        assert_eq!(saves.events.len(), 1);
        assert_eq!(saves.events[0].0, SaveReason::Step);
        assert_eq!(saves.events[0].1.global_step, 100);
        assert!(samples.events.is_empty());
    }

    #[test]
    fn test_epoch_cadence_and_coincident_triggers() {
        let cadence = Cadence {
            save_every_n_epochs: Some(1),
            save_every_n_steps: Some(2),
            sample_every_n_epochs: Some(2),
            ..Default::default()
        };
        let mut state = running(cadence, TerminalPolicy::default(), true);
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        for _ in 0..2 {
            state.step(&mut effects).unwrap();
        }
        let first = state.epoch_advance(&mut effects).unwrap();
        assert!(first.save);
        assert!(!first.sample);
        for _ in 0..2 {
            state.step(&mut effects).unwrap();
        }
        let second = state.epoch_advance(&mut effects).unwrap();
        assert!(second.save && second.sample);
        drop(effects);

        let reasons: Vec<SaveReason> = saves.events.iter().map(|(r, _)| *r).collect();
        assert_eq!(
            reasons,
            vec![SaveReason::Step, SaveReason::Epoch, SaveReason::Step, SaveReason::Epoch]
        );
        assert_eq!(samples.events.len(), 1);
        assert_eq!(samples.events[0].1.epoch, 2);
    }

    #[test]
    fn test_non_main_process_never_saves() {
        let cadence = Cadence {
            save_every_n_steps: Some(1),
            sample_every_n_steps: Some(1),
            ..Default::default()
        };
        let terminal = TerminalPolicy {
            save_on_exception: true,
            ..Default::default()
        };
        let mut state = running(cadence, terminal, false);
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        let triggers = state.step(&mut effects).unwrap();
        assert!(triggers.save && triggers.sample);
        let err = state
            .finish(
                LoopOutcome::Failed(FinetuneError::Training("boom".into())),
                &mut effects,
                &mut TracingMetrics,
            )
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        drop(effects);
        assert!(saves.events.is_empty());
        assert!(samples.events.is_empty());
    }

    #[test]
    fn test_finish_dispatches_terminal_policy() {
        let cases = [
            (LoopOutcome::Completed, true),
            (LoopOutcome::Interrupted, false),
            (LoopOutcome::Failed(FinetuneError::Training("x".into())), true),
        ];
        let terminal = TerminalPolicy {
            save_on_train_end: true,
            save_on_keyboard_interrupt: false,
            save_on_exception: true,
        };
        for (outcome, expect_save) in cases {
            let expected_termination = outcome.termination();
            let mut state = running(Cadence::default(), terminal, true);
            let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
            let mut effects = Effects {
                checkpoint: &mut saves,
                sampler: &mut samples,
                collective: &LocalCollective,
            };
            let result = state.finish(outcome, &mut effects, &mut TracingMetrics);
            drop(effects);

            assert_eq!(state.phase(), RunPhase::Terminated(expected_termination));
            assert_eq!(result.is_err(), expected_termination == Termination::Error);
            assert_eq!(saves.events.len(), usize::from(expect_save));
            if expect_save {
                assert_eq!(saves.events[0].0, SaveReason::TrainEnd);
            }
        }
    }

    #[test]
    fn test_finish_twice_is_rejected() {
        let terminal = TerminalPolicy {
            save_on_train_end: true,
            ..Default::default()
        };
        let mut state = running(Cadence::default(), terminal, true);
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        let report = state
            .finish(LoopOutcome::Completed, &mut effects, &mut TracingMetrics)
            .unwrap();
        assert!(report.final_save);
        let again = state.finish(LoopOutcome::Completed, &mut effects, &mut TracingMetrics);
        assert!(matches!(again, Err(FinetuneError::InvalidTransition { .. })));
        drop(effects);
        assert_eq!(saves.events.len(), 1);
    }

    #[test]
    fn test_start_twice_and_step_before_start() {
        let mut state = TrainingState::new(1, 1, true, Cadence::default(), TerminalPolicy::default());
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        assert!(state.step(&mut effects).is_err());
        state.start().unwrap();
        assert!(matches!(state.start(), Err(FinetuneError::InvalidTransition { .. })));
    }

    #[test]
    fn test_restore_only_from_idle() {
        let mut state = TrainingState::new(5, 50, true, Cadence::default(), TerminalPolicy::default());
        state
            .restore(StateSnapshot {
                global_step: 20,
                epoch: 2,
            })
            .unwrap();
        assert_eq!(state.global_step(), 20);
        assert_eq!(state.epoch(), 2);
        state.start().unwrap();
        assert!(state.restore(StateSnapshot::default()).is_err());
    }

    #[test]
    fn test_should_stop() {
        let mut state = TrainingState::new(2, 3, true, Cadence::default(), TerminalPolicy::default());
        state.start().unwrap();
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        assert!(!state.should_stop());
        for _ in 0..3 {
            state.step(&mut effects).unwrap();
        }
        assert!(state.should_stop());
    }

    #[test]
    fn test_save_failure_surfaces_as_error() {
        let cadence = Cadence {
            save_every_n_steps: Some(1),
            ..Default::default()
        };
        let mut state = running(cadence, TerminalPolicy::default(), true);
        let mut writer = FailingWriter;
        let mut samples = PlannedSamples::default();
        let mut effects = Effects {
            checkpoint: &mut writer,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        let err = state.step(&mut effects).unwrap_err();
        assert!(matches!(err, FinetuneError::Checkpoint(_)));
        // The step itself was still counted.
        assert_eq!(state.global_step(), 1);
    }

    #[test]
    fn test_final_save_failure_is_reported_after_cleanup() {
        let terminal = TerminalPolicy {
            save_on_train_end: true,
            ..Default::default()
        };
        let mut state = running(Cadence::default(), terminal, true);
        let mut writer = FailingWriter;
        let mut samples = PlannedSamples::default();
        let mut effects = Effects {
            checkpoint: &mut writer,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        let result = state.finish(LoopOutcome::Completed, &mut effects, &mut TracingMetrics);
        assert!(matches!(result, Err(FinetuneError::Checkpoint(_))));
        assert_eq!(state.phase(), RunPhase::Terminated(Termination::Normal));
    }

    #[test]
    fn test_from_config() {
        let mut config = TrainConfig::sdxl_base_preset();
        config.training.num_train_epochs = 3;
        config.saving.save_every_n_steps = Some(7);
        let state = TrainingState::from_config(&config, 25, true);
        assert_eq!(state.num_train_epochs(), 3);
        assert_eq!(state.num_train_steps(), 75);
        assert_eq!(state.phase(), RunPhase::Idle);
    }

    #[test]
    fn test_completion_without_train_end_policy_skips_final_save() {
        let mut state = running(Cadence::default(), TerminalPolicy::default(), true);
        let (mut saves, mut samples) = (PlannedSaves::default(), PlannedSamples::default());
        let mut effects = Effects {
            checkpoint: &mut saves,
            sampler: &mut samples,
            collective: &LocalCollective,
        };
        let report = state
            .finish(LoopOutcome::Completed, &mut effects, &mut TracingMetrics)
            .unwrap();
        assert!(!report.final_save);
        drop(effects);
        assert!(saves.events.is_empty());
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = StateSnapshot {
            global_step: 12,
            epoch: 3,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"global_step":12,"epoch":3}"#);
    }
}
