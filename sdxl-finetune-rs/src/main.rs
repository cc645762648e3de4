//! CLI entry point for sdxl-finetune-rs.

use clap::{Parser, Subcommand};

use sdxl_finetune_rs::hooks::{artifact_name, PlannedSamples, PlannedSaves, TracingMetrics};
use sdxl_finetune_rs::state::Effects;
use sdxl_finetune_rs::{
    LocalCollective, LogContext, LoopOutcome, LossWeighting, NoiseSchedule, ProcessInfo, Result,
    TrainConfig, TrainingState,
};

#[derive(Parser)]
#[command(name = "sdxl-finetune")]
#[command(about = "YAML-driven fine-tuning core for SDXL diffusion models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Model preset (sdxl-base, sdxl-vpred)
        #[arg(long, default_value = "sdxl-base")]
        preset: String,
    },
    /// Show when checkpoints and samples would be produced
    Plan {
        /// Path to configuration file
        config: String,
        /// Micro-batches per epoch across all processes
        #[arg(long)]
        batches_per_epoch: usize,
        /// Number of training processes
        #[arg(long, default_value_t = 1)]
        num_processes: usize,
    },
    /// Print the noise schedule with SNR and loss weights
    Schedule {
        /// Path to configuration file
        config: String,
        /// Print every K-th timestep
        #[arg(long, default_value_t = 100)]
        every: usize,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err.report());
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let process = ProcessInfo::from_env()?;
    LogContext::from_process(&process).init_subscriber();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = TrainConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model.pretrained_model_name_or_path);
            println!("  Prediction type: {}", config.noise.prediction_type);
            println!("  Zero terminal SNR: {}", config.noise.zero_terminal_snr);
            println!("  Epochs: {}", config.training.num_train_epochs);
            println!("  Output: {}/{}", config.saving.output_dir, config.saving.output_name);
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = TrainConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Plan {
            config,
            batches_per_epoch,
            num_processes,
        } => {
            let config = TrainConfig::from_file(&config)?;
            config.validate()?;
            plan(&config, batches_per_epoch, num_processes)?;
        }
        Commands::Schedule { config, every } => {
            let config = TrainConfig::from_file(&config)?;
            config.validate()?;
            print_schedule(&config, every.max(1));
        }
    }

    Ok(())
}

/// Drives the state machine with recording hooks and prints what it did.
fn plan(config: &TrainConfig, batches_per_epoch: usize, num_processes: usize) -> Result<()> {
    let local_batches = batches_per_epoch.div_ceil(num_processes.max(1));
    let steps_per_epoch = config.steps_per_epoch(local_batches);
    let mut state = TrainingState::from_config(config, steps_per_epoch, true);

    let mut saves = PlannedSaves::default();
    let mut samples = PlannedSamples::default();
    let mut metrics = TracingMetrics;
    let collective = LocalCollective;
    let mut effects = Effects {
        checkpoint: &mut saves,
        sampler: &mut samples,
        collective: &collective,
    };

    state.start()?;
    while !state.should_stop() {
        for _ in 0..steps_per_epoch {
            state.step(&mut effects)?;
        }
        state.epoch_advance(&mut effects)?;
    }
    let report = state.finish(LoopOutcome::Completed, &mut effects, &mut metrics)?;

    println!(
        "✓ Plan: {} epochs x {} steps = {} optimizer steps",
        state.num_train_epochs(),
        steps_per_epoch,
        report.global_step
    );
    println!("  Saves: {}", saves.events.len());
    for (reason, snapshot) in &saves.events {
        println!(
            "    step {:>8} epoch {:>4}  {:<9} {}",
            snapshot.global_step,
            snapshot.epoch,
            format!("{reason:?}"),
            artifact_name(&config.saving.output_name, *reason, snapshot)
        );
    }
    println!("  Samples: {}", samples.events.len());
    for (reason, snapshot) in &samples.events {
        println!(
            "    step {:>8} epoch {:>4}  {reason:?}",
            snapshot.global_step, snapshot.epoch
        );
    }
    Ok(())
}

fn print_schedule(config: &TrainConfig, every: usize) {
    let schedule = NoiseSchedule::from_config(&config.noise);
    let weighting = LossWeighting::from_config(&config.loss, config.noise.prediction_type);
    println!(
        "✓ Schedule: {} timesteps, {} prediction, zero terminal SNR: {}",
        schedule.num_timesteps(),
        config.noise.prediction_type,
        schedule.is_zero_terminal_snr()
    );
    println!("  {:>5}  {:>14}  {:>14}  {:>10}", "t", "alpha_cumprod", "snr", "weight");
    let last = schedule.num_timesteps().saturating_sub(1);
    let timesteps = (0..schedule.num_timesteps())
        .step_by(every)
        .chain(std::iter::once(last))
        .collect::<std::collections::BTreeSet<_>>();
    for t in timesteps {
        let snr = schedule.snr(t);
        println!(
            "  {:>5}  {:>14.6e}  {:>14.6e}  {:>10.6}",
            t,
            schedule.alphas_cumprod()[t],
            snr,
            weighting.weight(snr)
        );
    }
}
