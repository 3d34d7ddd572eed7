// Errors shared by every phase of the pipeline. Configuration problems are raised
// before any data is read. Numeric anomalies are only logged by the trainer, which
// then skips the offending step.

use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, AugError>;

#[derive(Debug, thiserror::Error)]
pub enum AugError {
    /// Invalid combination of settings, detected at setup time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Batch or store tensors inconsistent with the model dimensions.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A checkpoint, data or result file that could not be read or written.
    #[error("cannot access '{}': {reason}", path.display())]
    Resource { path: PathBuf, reason: String },

    /// A loss that is NaN or infinite.
    #[error("non-finite {phase} loss ({value}) at epoch {epoch}, step {step}")]
    NumericAnomaly {
        phase: &'static str,
        epoch: usize,
        step: usize,
        value: f64,
    },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl AugError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn resource(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::Resource {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
