pub mod augmenting;
pub mod checkpoint;
pub mod config;
pub mod data_processing;
pub mod error;
pub mod inference;
pub mod loss;
pub mod model;
pub mod optim;
pub mod training;

pub use augmenting::{augment, AugmentOverrides, AugmentationTable};
pub use config::{ExperimentConfig, ExperimentPaths};
pub use error::{AugError, Result};
pub use inference::{infer, Prediction};
pub use training::{train, TrainingReport};
