//! Error types for sdxl-finetune-rs.
//!
//! Configuration problems are fatal and surface before the first step.
//! Numeric corruption (NaN latents or losses) is not an error at all: it is
//! repaired in place by the loss module and only logged.
//!
//! # Example
//!
//! ```rust
//! use sdxl_finetune_rs::{FinetuneError, TrainConfig};
//!
//! # fn main() {
//! match TrainConfig::from_preset("sd15") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(FinetuneError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::state::RunPhase;

/// Result type alias for sdxl-finetune-rs operations.
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// Errors that can occur while driving a fine-tuning run.
///
/// # Example
///
/// ```rust
/// use sdxl_finetune_rs::{FinetuneError, Result};
///
/// fn check_accumulation(steps: usize) -> Result<()> {
///     if steps == 0 {
///         return Err(FinetuneError::Config(
///             "gradient_accumulation_steps must be >= 1".to_string(),
///         ));
///     }
///     Ok(())
/// }
///
/// assert!(check_accumulation(0).is_err());
/// assert!(check_accumulation(4).is_ok());
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FinetuneError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Sample generation error.
    #[error("sample error: {0}")]
    Sample(String),

    /// Collective communication error (barrier or all-reduce).
    #[error("collective error: {0}")]
    Collective(String),

    /// The training state machine was driven out of order.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Phase the state machine was in.
        from: RunPhase,
        /// Phase that was requested.
        to: RunPhase,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for FinetuneError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FinetuneError::Template(err.to_string())
    }
}

impl FinetuneError {
    /// Renders the error followed by every `source()` in its chain, one per line.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}
