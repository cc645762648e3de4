//! Per-process logging context.
//!
//! Each process builds one [`LogContext`]. It decides the default verbosity
//! from the rank, carries a `process` span so every event is tagged with
//! `rank` and `world_size`, and builds the progress bar (hidden everywhere but
//! the main process).

use indicatif::{ProgressBar, ProgressStyle};
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::distributed::{Collective, ProcessInfo};
use crate::error::Result;

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}";

/// Rank-scoped logging state for one process.
#[derive(Debug, Clone)]
pub struct LogContext {
    rank: usize,
    world_size: usize,
    span: Span,
}

impl LogContext {
    /// Context for `rank` in a group of `world_size`.
    #[must_use]
    pub fn new(rank: usize, world_size: usize) -> Self {
        let span = tracing::info_span!("process", rank, world_size);
        Self {
            rank,
            world_size,
            span,
        }
    }

    /// Context for the process described by the launcher.
    #[must_use]
    pub fn from_process(info: &ProcessInfo) -> Self {
        Self::new(info.rank, info.world_size)
    }

    /// Context for a replica of `collective`.
    #[must_use]
    pub fn for_collective(collective: &dyn Collective) -> Self {
        Self::new(collective.rank(), collective.world_size())
    }

    /// Filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_directive(&self) -> &'static str {
        if self.is_main_process() {
            "info"
        } else {
            "warn"
        }
    }

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` wins over the rank default. A subscriber that is already
    /// installed (for example by a test harness) is left in place.
    pub fn init_subscriber(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive()));
        let installed = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(filter)
            .try_init();
        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }

    /// Span every event of this process should be recorded under.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether this is rank 0.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Rank of this process.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of processes.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Step progress bar, hidden off the main process.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FinetuneError::Template`] if the bar template is rejected.
    pub fn progress_bar(&self, len: u64) -> Result<ProgressBar> {
        if !self.is_main_process() {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }
}
