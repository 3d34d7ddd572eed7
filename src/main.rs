use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::{Args, Parser, Subcommand};
use latent_aug::{
    augment,
    config::{DecodingKind, EpsilonSchedule, OptimizerKind, SchedulerKind, TargetLabelStrategy},
    infer, train, AugmentOverrides, ExperimentConfig, ExperimentPaths,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

type ElemType = f32;

#[derive(Parser)]
#[command(name = "latent_aug")]
#[command(about = "Adversarial text augmentation through latent perturbations")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PathArgs {
    /// Root of the preprocessed stores
    #[arg(long, default_value = "preprocessed")]
    preprocess_path: PathBuf,

    /// Root of the checkpoints
    #[arg(long, default_value = "checkpoints")]
    model_save_path: PathBuf,

    /// Root of the augmentation results
    #[arg(long, default_value = "results")]
    result_path: PathBuf,

    #[arg(long, default_value = "ag_news")]
    data_name: String,

    #[arg(long, default_value = "latent")]
    model_type: String,
}

impl PathArgs {
    fn into_paths(self) -> ExperimentPaths {
        ExperimentPaths::new(
            self.preprocess_path,
            self.model_save_path,
            self.result_path,
            self.data_name,
            self.model_type,
        )
    }
}

#[derive(Subcommand)]
enum Command {
    /// Train the augmenter, then the latent classifier
    Train(TrainArgs),

    /// Generate adversarial paraphrases of the training split
    Augment(AugmentArgs),

    /// Classify free text with a trained experiment
    Predict {
        #[arg(required = true)]
        texts: Vec<String>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Continue from the saved checkpoints
    #[arg(long)]
    resume: bool,

    /// Stop every pass after its first batch
    #[arg(long)]
    debugging_mode: bool,

    /// Disable the MMD regularizer
    #[arg(long)]
    no_mmd: bool,

    #[arg(long)]
    encoder_out_ratio: Option<f64>,
    #[arg(long)]
    latent_out_ratio: Option<f64>,
    #[arg(long)]
    mmd_weight: Option<f64>,
    #[arg(long)]
    z_variation: Option<f64>,

    #[arg(long)]
    aug_num_epochs: Option<usize>,
    #[arg(long)]
    cls_num_epochs: Option<usize>,
    #[arg(long)]
    aug_lr: Option<f64>,
    #[arg(long)]
    cls_lr: Option<f64>,
    /// AdamW, Adam or SGD
    #[arg(long)]
    aug_optimizer: Option<OptimizerKind>,
    #[arg(long)]
    cls_optimizer: Option<OptimizerKind>,
    /// constant, warmup, lambda or noam
    #[arg(long)]
    aug_scheduler: Option<SchedulerKind>,
    #[arg(long)]
    cls_scheduler: Option<SchedulerKind>,

    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_seq_length: Option<usize>,
    #[arg(long)]
    d_model: Option<usize>,
    #[arg(long)]
    n_heads: Option<usize>,
    #[arg(long)]
    dropout: Option<f64>,

    /// Hub name, tokenizer.json path or "store"
    #[arg(long)]
    tokenizer: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    print_freq: Option<usize>,

    #[command(flatten)]
    generation: GenerationArgs,
}

#[derive(Args)]
struct GenerationArgs {
    /// range:<count>:<step> or fixed:<v1>,<v2>,...
    #[arg(long)]
    epsilon_schedule: Option<EpsilonSchedule>,
    /// true, flipped or uniform
    #[arg(long)]
    target_label: Option<TargetLabelStrategy>,
    /// greedy, multinomial, topk or topp
    #[arg(long)]
    decoding: Option<DecodingKind>,
    #[arg(long)]
    max_generation_length: Option<usize>,
}

#[derive(Args)]
struct AugmentArgs {
    /// Stop after the first batch
    #[arg(long)]
    debugging_mode: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[command(flatten)]
    generation: GenerationArgs,
}

impl GenerationArgs {
    fn into_overrides(self) -> AugmentOverrides {
        AugmentOverrides {
            epsilon_schedule: self.epsilon_schedule,
            target_label: self.target_label,
            decoding: self.decoding,
            max_generation_length: self.max_generation_length,
            ..Default::default()
        }
    }
}

impl TrainArgs {
    fn into_config(self) -> ExperimentConfig {
        let mut config = AugmentOverrides {
            debugging_mode: self.debugging_mode,
            batch_size: self.batch_size,
            ..self.generation.into_overrides()
        }
        .apply(ExperimentConfig::new());

        config.latent_mmd_loss = !self.no_mmd;
        set(&mut config.encoder_out_ratio, self.encoder_out_ratio);
        set(&mut config.latent_out_ratio, self.latent_out_ratio);
        set(&mut config.mmd_weight, self.mmd_weight);
        set(&mut config.z_variation, self.z_variation);
        set(&mut config.aug_num_epochs, self.aug_num_epochs);
        set(&mut config.cls_num_epochs, self.cls_num_epochs);
        set(&mut config.aug_optimizer.lr, self.aug_lr);
        set(&mut config.cls_optimizer.lr, self.cls_lr);
        set(&mut config.aug_optimizer.kind, self.aug_optimizer);
        set(&mut config.cls_optimizer.kind, self.cls_optimizer);
        set(&mut config.aug_optimizer.scheduler, self.aug_scheduler);
        set(&mut config.cls_optimizer.scheduler, self.cls_scheduler);
        set(&mut config.max_seq_length, self.max_seq_length);
        set(&mut config.d_model, self.d_model);
        set(&mut config.n_heads, self.n_heads);
        set(&mut config.dropout, self.dropout);
        set(&mut config.tokenizer, self.tokenizer);
        set(&mut config.seed, self.seed);
        set(&mut config.print_freq, self.print_freq);
        config
    }
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

pub fn launch<B: AutodiffBackend>(device: B::Device) -> Result<()> {
    let cli = Cli::parse();
    let paths = cli.paths.into_paths();

    match cli.command {
        Command::Train(args) => {
            let resume = args.resume;
            let report = train::<B>(device, args.into_config(), &paths, resume)
                .context("training failed")?;
            info!(
                "Best augmenter epoch {:?} (loss {:?}), best classifier epoch {:?} (loss {:?})",
                report.augmenter.best_epoch,
                report.augmenter.best_loss,
                report.classifier.best_epoch,
                report.classifier.best_loss
            );
        }
        Command::Augment(args) => {
            let overrides = AugmentOverrides {
                debugging_mode: args.debugging_mode,
                batch_size: args.batch_size,
                ..args.generation.into_overrides()
            };
            let path = augment::<B>(device, &paths, overrides).context("augmentation failed")?;
            println!("{}", path.display());
        }
        Command::Predict { texts } => {
            let predictions =
                infer::<B::InnerBackend>(device, &paths, texts).context("prediction failed")?;
            for prediction in predictions {
                let probabilities = prediction
                    .probabilities
                    .iter()
                    .map(|p| format!("{p:.4}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "{} | label {} | [{}]",
                    prediction.text, prediction.label, probabilities
                );
            }
        }
    }
    Ok(())
}

#[cfg(not(any(feature = "wgpu", feature = "tch-cpu", feature = "tch-gpu")))]
mod ndarray {
    use crate::{launch, ElemType};
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };

    pub fn run() -> anyhow::Result<()> {
        launch::<Autodiff<NdArray<ElemType>>>(NdArrayDevice::Cpu)
    }
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use crate::{launch, ElemType};
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    pub fn run() -> anyhow::Result<()> {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        launch::<Autodiff<LibTorch<ElemType>>>(device)
    }
}

#[cfg(all(feature = "tch-cpu", not(feature = "tch-gpu")))]
mod tch_cpu {
    use crate::{launch, ElemType};
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    pub fn run() -> anyhow::Result<()> {
        launch::<Autodiff<LibTorch<ElemType>>>(LibTorchDevice::Cpu)
    }
}

#[cfg(all(feature = "wgpu", not(any(feature = "tch-cpu", feature = "tch-gpu"))))]
mod wgpu {
    use crate::{launch, ElemType};
    use burn::backend::wgpu::{AutoGraphicsApi, Wgpu, WgpuDevice};
    use burn::backend::Autodiff;

    pub fn run() -> anyhow::Result<()> {
        launch::<Autodiff<Wgpu<AutoGraphicsApi, ElemType, i32>>>(WgpuDevice::default())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("latent_aug=info")),
        )
        .init();

    #[cfg(not(any(feature = "wgpu", feature = "tch-cpu", feature = "tch-gpu")))]
    return ndarray::run();
    #[cfg(feature = "tch-gpu")]
    return tch_gpu::run();
    #[cfg(all(feature = "tch-cpu", not(feature = "tch-gpu")))]
    return tch_cpu::run();
    #[cfg(all(feature = "wgpu", not(any(feature = "tch-cpu", feature = "tch-gpu"))))]
    return wgpu::run();
}
