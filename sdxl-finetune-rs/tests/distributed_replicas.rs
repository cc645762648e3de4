//! Two-replica runs over an in-process thread group.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use candle_core::{Device, Tensor, Var};
use sdxl_finetune_rs::config::MixedPrecision;
use sdxl_finetune_rs::hooks::{PlannedSamples, PlannedSaves, TracingMetrics};
use sdxl_finetune_rs::optimizer::{OptimizerConfig, ParamGroup};
use sdxl_finetune_rs::state::SaveReason;
use sdxl_finetune_rs::trainer::{BatchSource, Denoiser};
use sdxl_finetune_rs::{
    Batch, Collaborators, Collective, FinetuneError, LogContext, Result, RunReport,
    ShutdownSignal, Termination, ThreadGroup, TrainConfig, Trainer,
};

/// Per-rank shard: batch values differ between replicas.
struct Shard {
    rank: usize,
    per_epoch: usize,
    /// Index of a batch that fails to load.
    broken: Option<usize>,
}

impl BatchSource for Shard {
    fn num_batches(&self) -> usize {
        self.per_epoch
    }

    fn batches(&mut self, _epoch: u64) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>> {
        let rank = self.rank;
        let broken = self.broken;
        Ok(Box::new((0..self.per_epoch).map(move |i| {
            if broken == Some(i) {
                return Err(FinetuneError::Training("shard read failed".into()));
            }
            let value = 0.2 + 0.3 * rank as f32 + 0.05 * i as f32;
            Ok(Batch {
                latents: Some(Tensor::full(value, (1, 4, 4, 4), &Device::Cpu)?),
                ..Default::default()
            })
        })))
    }
}

struct Scaled {
    weight: Var,
}

impl Denoiser for Scaled {
    fn predict(&mut self, noisy: &Tensor, _timesteps: &Tensor, _batch: &Batch) -> Result<Tensor> {
        Ok(noisy.broadcast_mul(self.weight.as_tensor())?)
    }
}

struct ReplicaResult {
    report: RunReport,
    weight: f32,
    saves: Vec<(SaveReason, u64)>,
}

fn config() -> TrainConfig {
    let mut config = TrainConfig::sdxl_base_preset();
    config.training.num_train_epochs = 2;
    config.training.gradient_accumulation_steps = 2;
    config.training.mixed_precision = MixedPrecision::No;
    config.saving.save_every_n_epochs = Some(1);
    config.saving.save_every_n_steps = Some(2);
    config.saving.save_on_keyboard_interrupt = true;
    config
}

fn run_replica(replica: ThreadGroup, interrupt: bool, broken: Option<usize>) -> Result<ReplicaResult> {
    let log = LogContext::for_collective(&replica);
    let config = config();
    let mut trainer = Trainer::new(config.clone(), log)?;

    let weight = Var::from_tensor(&Tensor::new(&[0.5f32], &Device::Cpu)?)?;
    let mut optimizer = OptimizerConfig::from_training(&config.training)
        .build_adamw(vec![ParamGroup::new("unet", vec![weight.clone()], 1e-2)])?;
    let mut source = Shard {
        rank: replica.rank(),
        per_epoch: 3,
        broken,
    };
    let mut denoiser = Scaled {
        weight: weight.clone(),
    };
    let mut saves = PlannedSaves::default();
    let mut samples = PlannedSamples::default();
    let mut metrics = TracingMetrics;

    let shutdown = ShutdownSignal::new();
    if interrupt {
        shutdown.request();
    }

    let report = trainer.run(
        Collaborators {
            batches: &mut source,
            encoder: None,
            denoiser: &mut denoiser,
            optimizer: &mut optimizer,
            checkpoint: &mut saves,
            sampler: &mut samples,
            metrics: &mut metrics,
            collective: &replica,
        },
        &shutdown,
    )?;

    Ok(ReplicaResult {
        report,
        weight: weight.as_tensor().to_vec1::<f32>()?[0],
        saves: saves
            .events
            .iter()
            .map(|(reason, snapshot)| (*reason, snapshot.global_step))
            .collect(),
    })
}

fn run_group(interrupt_on: Option<usize>) -> Vec<ReplicaResult> {
    let replicas = ThreadGroup::create(2).unwrap();
    let handles: Vec<_> = replicas
        .into_iter()
        .map(|replica| {
            let interrupt = interrupt_on == Some(replica.rank());
            thread::spawn(move || run_replica(replica, interrupt, None))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect()
}

#[test]
fn test_replicas_finish_in_lockstep() {
    let results = run_group(None);

    // 3 micro-batches with accumulation 2: groups of 2 and 1 per epoch.
    for result in &results {
        assert_eq!(result.report.termination, Termination::Normal);
        assert_eq!(result.report.global_step, 4);
        assert_eq!(result.report.epoch, 2);
    }
    assert_eq!(results[0].weight, results[1].weight);
    assert_ne!(results[0].weight, 0.5);
}

#[test]
fn test_only_main_process_saves() {
    let results = run_group(None);

    assert_eq!(
        results[0].saves,
        vec![
            (SaveReason::Step, 2),
            (SaveReason::Epoch, 2),
            (SaveReason::Step, 4),
            (SaveReason::Epoch, 4),
            (SaveReason::TrainEnd, 4),
        ]
    );
    assert!(results[1].saves.is_empty());
    assert!(results[0].report.final_save);
    assert!(!results[1].report.final_save);
}

#[test]
fn test_interrupt_on_one_replica_stops_both() {
    let results = run_group(Some(1));

    for result in &results {
        assert_eq!(result.report.termination, Termination::Interrupted);
        assert_eq!(result.report.global_step, 1);
    }
    assert_eq!(results[0].saves, vec![(SaveReason::TrainEnd, 1)]);
    assert!(results[1].saves.is_empty());
}

#[test]
fn test_batch_failure_on_one_replica_stops_both() {
    let replicas = ThreadGroup::create(2).unwrap();
    let (tx, rx) = mpsc::channel();
    for replica in replicas {
        let tx = tx.clone();
        thread::spawn(move || {
            let rank = replica.rank();
            let broken = (rank == 1).then_some(1);
            let result = run_replica(replica, false, broken).map(|_| ());
            tx.send((rank, result.map_err(|err| err.to_string()))).unwrap();
        });
    }
    drop(tx);

    let mut finished = Vec::new();
    for _ in 0..2 {
        let outcome = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("a replica hung after its peer failed mid-loop");
        finished.push(outcome);
    }
    finished.sort_by_key(|(rank, _)| *rank);

    let (_, main) = &finished[0];
    let (_, faulty) = &finished[1];
    assert!(main.as_ref().unwrap_err().contains("another replica failed"));
    assert!(faulty.as_ref().unwrap_err().contains("shard read failed"));
}
