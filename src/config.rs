// Experiment configuration. `ExperimentConfig` is saved next to the checkpoints as
// config.json so that augmentation and prediction rebuild exactly the architecture
// that was trained. Every setting is validated here, before any data is touched.

use crate::error::{self, AugError};
use burn::config::Config;
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

/// Optimizers available for either training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    AdamW,
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = AugError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adamw" => Ok(Self::AdamW),
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            "ralamb" => Err(AugError::config("the Ralamb optimizer is not supported")),
            other => Err(AugError::config(format!(
                "unknown optimizer '{other}', choose one of AdamW, Adam, SGD"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AdamW => "AdamW",
            Self::Adam => "Adam",
            Self::Sgd => "SGD",
        };
        f.write_str(name)
    }
}

/// Per-step learning rate policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    Constant,
    Warmup,
    Lambda,
    Noam,
}

impl FromStr for SchedulerKind {
    type Err = AugError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "warmup" => Ok(Self::Warmup),
            "lambda" => Ok(Self::Lambda),
            "noam" => Ok(Self::Noam),
            "reduce_train" | "reduce_valid" => Err(AugError::config(format!(
                "scheduler '{s}' needs a monitored metric and is not supported"
            ))),
            other => Err(AugError::config(format!(
                "unknown scheduler '{other}', choose one of constant, warmup, lambda, noam"
            ))),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Constant => "constant",
            Self::Warmup => "warmup",
            Self::Lambda => "lambda",
            Self::Noam => "noam",
        };
        f.write_str(name)
    }
}

/// Token selection rule used by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodingKind {
    Greedy,
    Multinomial,
    TopK,
    TopP,
}

impl FromStr for DecodingKind {
    type Err = AugError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "multinomial" => Ok(Self::Multinomial),
            "topk" => Ok(Self::TopK),
            "topp" => Ok(Self::TopP),
            "beam" | "midk" => Err(AugError::config(format!(
                "decoding strategy '{s}' is not supported by the latent generator"
            ))),
            other => Err(AugError::config(format!(
                "unknown decoding strategy '{other}', choose one of greedy, multinomial, topk, topp"
            ))),
        }
    }
}

impl fmt::Display for DecodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Greedy => "greedy",
            Self::Multinomial => "multinomial",
            Self::TopK => "topk",
            Self::TopP => "topp",
        };
        f.write_str(name)
    }
}

/// Which label the adversarial gradient is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetLabelStrategy {
    /// Probe robustness: push towards the label the example already has.
    UseTrueLabel,
    /// Reverse the one-hot vector to manufacture label-flipping paraphrases.
    UseFlippedLabel,
    /// Push towards maximum classifier uncertainty.
    UseUniformLabel,
}

impl FromStr for TargetLabelStrategy {
    type Err = AugError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "use_true_label" => Ok(Self::UseTrueLabel),
            "flipped" | "use_flipped_label" => Ok(Self::UseFlippedLabel),
            "uniform" | "use_uniform_label" => Ok(Self::UseUniformLabel),
            other => Err(AugError::config(format!(
                "unknown target label strategy '{other}', choose one of true, flipped, uniform"
            ))),
        }
    }
}

impl fmt::Display for TargetLabelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UseTrueLabel => "true",
            Self::UseFlippedLabel => "flipped",
            Self::UseUniformLabel => "uniform",
        };
        f.write_str(name)
    }
}

/// Ordered perturbation magnitudes. Each entry yields one augmented candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EpsilonSchedule {
    /// `count` magnitudes `0, step, 2*step, ...`.
    Range { count: usize, step: f64 },
    /// An explicit list of magnitudes.
    Fixed(Vec<f64>),
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        Self::Range {
            count: 11,
            step: 1.0,
        }
    }
}

impl EpsilonSchedule {
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Range { count, step } => (0..*count).map(|i| i as f64 * step).collect(),
            Self::Fixed(values) => values.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Range { count, .. } => *count,
            Self::Fixed(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Result-table column name of the `index`-th magnitude.
    pub fn column_name(&self, index: usize) -> String {
        match self {
            Self::Range { .. } => format!("aug_{index}"),
            Self::Fixed(values) => format!("eps_{}", values[index]),
        }
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.is_empty() {
            return Err(AugError::config("the epsilon schedule is empty"));
        }
        if self.values().iter().any(|eps| !eps.is_finite()) {
            return Err(AugError::config("epsilon values must be finite"));
        }
        Ok(())
    }
}

impl FromStr for EpsilonSchedule {
    type Err = AugError;

    /// `range:<count>:<step>` or `fixed:<v1>,<v2>,...`
    fn from_str(s: &str) -> error::Result<Self> {
        let invalid = || {
            AugError::config(format!(
                "invalid epsilon schedule '{s}', expected 'range:<count>:<step>' or 'fixed:<v1>,<v2>,...'"
            ))
        };
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "range" => {
                let (count, step) = rest.split_once(':').ok_or_else(invalid)?;
                Ok(Self::Range {
                    count: count.trim().parse().map_err(|_| invalid())?,
                    step: step.trim().parse().map_err(|_| invalid())?,
                })
            }
            "fixed" => rest
                .split(',')
                .map(|v| v.trim().parse::<f64>().map_err(|_| invalid()))
                .collect::<error::Result<Vec<_>>>()
                .map(Self::Fixed),
            _ => Err(invalid()),
        }
    }
}

/// Weights of the encoder output and latent vector in the hidden state.
/// A zero weight removes the corresponding term entirely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HiddenMix {
    encoder: f64,
    latent: f64,
}

impl HiddenMix {
    pub fn new(encoder: f64, latent: f64) -> error::Result<Self> {
        if !encoder.is_finite() || !latent.is_finite() {
            return Err(AugError::config("hidden mix ratios must be finite"));
        }
        if encoder < 0.0 || latent < 0.0 {
            return Err(AugError::config("hidden mix ratios must not be negative"));
        }
        if encoder == 0.0 && latent == 0.0 {
            return Err(AugError::config(
                "encoder_out_ratio and latent_out_ratio cannot both be zero",
            ));
        }
        Ok(Self { encoder, latent })
    }

    pub fn encoder(&self) -> f64 {
        self.encoder
    }

    pub fn latent(&self) -> f64 {
        self.latent
    }

    pub fn uses_encoder(&self) -> bool {
        self.encoder != 0.0
    }

    pub fn uses_latent(&self) -> bool {
        self.latent != 0.0
    }
}

/// Optimizer and learning-rate schedule of one training phase.
#[derive(Config, Debug)]
pub struct OptimizerSettings {
    #[config(default = "OptimizerKind::AdamW")]
    pub kind: OptimizerKind,
    #[config(default = 5e-4)]
    pub lr: f64,
    #[config(default = 1e-5)]
    pub weight_decay: f64,
    #[config(default = "SchedulerKind::Warmup")]
    pub scheduler: SchedulerKind,
    #[config(default = 2.0)]
    pub n_warmup_epochs: f64,
    #[config(default = 0.95)]
    pub lr_lambda: f64,
    #[config(default = 4000)]
    pub noam_warmup_steps: usize,
    #[config(default = "Some(5.0)")]
    pub clip_grad_norm: Option<f32>,
}

impl OptimizerSettings {
    pub fn validate(&self, phase: &str) -> error::Result<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(AugError::config(format!(
                "{phase} learning rate must be positive"
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(AugError::config(format!(
                "{phase} weight decay must not be negative"
            )));
        }
        if self.n_warmup_epochs < 0.0 {
            return Err(AugError::config(format!(
                "{phase} warmup epochs must not be negative"
            )));
        }
        if self.scheduler == SchedulerKind::Lambda && self.lr > 1.0 {
            return Err(AugError::config(format!(
                "{phase} learning rate must be at most 1 with the lambda scheduler"
            )));
        }
        if !(self.lr_lambda > 0.0 && self.lr_lambda <= 1.0) {
            return Err(AugError::config(format!(
                "{phase} lr_lambda must be in (0, 1]"
            )));
        }
        if matches!(self.clip_grad_norm, Some(norm) if norm <= 0.0) {
            return Err(AugError::config(format!(
                "{phase} gradient clipping norm must be positive"
            )));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct ExperimentConfig {
    #[config(default = 50)]
    pub max_seq_length: usize,
    #[config(default = 360)]
    pub max_generation_length: usize,
    #[config(default = 256)]
    pub d_model: usize,
    #[config(default = 1024)]
    pub d_ff: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 4)]
    pub n_encoder_layers: usize,
    #[config(default = 4)]
    pub n_decoder_layers: usize,
    #[config(default = 3)]
    pub n_latent_layers: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
    #[config(default = 1.0)]
    pub encoder_out_ratio: f64,
    #[config(default = 1.0)]
    pub latent_out_ratio: f64,
    #[config(default = true)]
    pub latent_mmd_loss: bool,
    #[config(default = 1.0)]
    pub mmd_weight: f64,
    /// Variance of the Gaussian the latent space is pulled towards.
    #[config(default = 2.0)]
    pub z_variation: f64,
    #[config(default = 0.05)]
    pub recon_label_smoothing: f32,
    #[config(default = 0.05)]
    pub cls_label_smoothing: f32,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 10)]
    pub aug_num_epochs: usize,
    #[config(default = 5)]
    pub cls_num_epochs: usize,
    #[config(default = "OptimizerSettings::new()")]
    pub aug_optimizer: OptimizerSettings,
    #[config(default = "OptimizerSettings::new()")]
    pub cls_optimizer: OptimizerSettings,
    #[config(default = "EpsilonSchedule::default()")]
    pub epsilon_schedule: EpsilonSchedule,
    #[config(default = "TargetLabelStrategy::UseFlippedLabel")]
    pub target_label: TargetLabelStrategy,
    #[config(default = "DecodingKind::Greedy")]
    pub decoding: DecodingKind,
    #[config(default = 5)]
    pub topk: usize,
    #[config(default = 0.9)]
    pub topp: f64,
    #[config(default = 1.0)]
    pub temperature: f64,
    #[config(default = 300)]
    pub print_freq: usize,
    #[config(default = true)]
    pub print_example: bool,
    #[config(default = false)]
    pub debugging_mode: bool,
    #[config(default = 42)]
    pub seed: u64,
    /// Hub name, path to a tokenizer.json, or "store" for the preprocessed vocabulary.
    #[config(default = "String::from(\"bert-base-cased\")")]
    pub tokenizer: String,
}

impl ExperimentConfig {
    pub fn mix(&self) -> error::Result<HiddenMix> {
        HiddenMix::new(self.encoder_out_ratio, self.latent_out_ratio)
    }

    /// Checks every setting that can be checked without data.
    pub fn validate(&self) -> error::Result<()> {
        self.mix()?;
        self.epsilon_schedule.validate()?;
        self.aug_optimizer.validate("augmenter")?;
        self.cls_optimizer.validate("classifier")?;

        if self.max_seq_length < 2 {
            return Err(AugError::config("max_seq_length must be at least 2"));
        }
        if self.max_generation_length == 0 {
            return Err(AugError::config("max_generation_length must be positive"));
        }
        if self.d_model == 0 || self.d_model % 2 != 0 {
            return Err(AugError::config("d_model must be a positive even number"));
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(AugError::config(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        if self.n_latent_layers == 0 {
            return Err(AugError::config("n_latent_layers must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AugError::config("dropout must be in [0, 1)"));
        }
        if !(self.z_variation.is_finite() && self.z_variation > 0.0) {
            return Err(AugError::config("z_variation must be positive"));
        }
        for (name, smoothing) in [
            ("recon_label_smoothing", self.recon_label_smoothing),
            ("cls_label_smoothing", self.cls_label_smoothing),
        ] {
            if !(0.0..1.0).contains(&smoothing) {
                return Err(AugError::config(format!("{name} must be in [0, 1)")));
            }
        }
        if self.batch_size == 0 || self.print_freq == 0 {
            return Err(AugError::config(
                "batch_size and print_freq must be positive",
            ));
        }
        if self.topk == 0 {
            return Err(AugError::config("topk must be positive"));
        }
        if !(self.topp > 0.0 && self.topp <= 1.0) {
            return Err(AugError::config("topp must be in (0, 1]"));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(AugError::config("temperature must be positive"));
        }
        Ok(())
    }
}

/// Filesystem layout of one experiment.
#[derive(Debug, Clone, new)]
pub struct ExperimentPaths {
    pub preprocess_path: PathBuf,
    pub model_save_path: PathBuf,
    pub result_path: PathBuf,
    pub data_name: String,
    pub model_type: String,
}

impl ExperimentPaths {
    pub fn store_dir(&self) -> PathBuf {
        self.preprocess_path
            .join(&self.data_name)
            .join(&self.model_type)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_save_path
            .join(&self.data_name)
            .join(&self.model_type)
    }

    pub fn config_file(&self) -> PathBuf {
        self.checkpoint_dir().join("config.json")
    }

    pub fn result_file(&self) -> PathBuf {
        self.result_path
            .join(&self.data_name)
            .join("augmenting_result.csv")
    }
}
