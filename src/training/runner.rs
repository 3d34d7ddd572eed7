// Drives the phase sequence of `TrainingPhase` over real data: builds the loaders,
// restores checkpoints on resume, runs the augmenter epochs with the augmenter
// optimizer and then the classifier epochs with the classifier optimizer, saving a
// checkpoint whenever a validation loss improves.

use super::{
    state::{EpochPlan, TrainingPhase, TrainingProgress, Verdict},
    steps::{
        augmenter_step, classifier_step, evaluate_augmenter, evaluate_classifier,
        AugmenterObjective, LossReport, RunningLoss, StepOutcome,
    },
};
use crate::{
    checkpoint::{CheckpointManager, CheckpointSlot, CheckpointState},
    config::{ExperimentConfig, ExperimentPaths},
    data_processing::{load_tokenizer, DatasetSplit, PreprocessedStore, TokenBatch, TokenBatcher},
    error::{AugError, Result},
    model::{AugmenterModel, AugmenterModelConfig, LatentClassifier, LatentClassifierConfig},
    optim::{OptimizerVisitor, PhaseLrScheduler},
};
use burn::{
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder},
    lr_scheduler::LrScheduler,
    module::AutodiffModule,
    optim::Optimizer,
    tensor::backend::{AutodiffBackend, Backend},
};
use std::{fs, sync::Arc, time::Instant};
use tracing::{info, warn};

/// Best validation results of both models after training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingReport {
    pub augmenter: TrainingProgress,
    pub classifier: TrainingProgress,
}

struct TrainingContext<B: AutodiffBackend> {
    device: B::Device,
    config: ExperimentConfig,
    store: PreprocessedStore,
    vocab_size: usize,
    checkpoints: CheckpointManager,
    plan: EpochPlan,
    steps_per_epoch: usize,
}

impl<B: AutodiffBackend> TrainingContext<B> {
    fn loader<LB: Backend<Device = B::Device>>(
        &self,
        split: DatasetSplit,
        shuffle: bool,
    ) -> Result<Arc<dyn DataLoader<TokenBatch<LB>>>> {
        let dataset = self
            .store
            .dataset(split, self.config.max_seq_length, self.vocab_size)?;
        let batcher = TokenBatcher::<LB>::new(self.device.clone());

        let mut builder = DataLoaderBuilder::new(batcher)
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers);
        if shuffle {
            builder = builder.shuffle(self.config.seed);
        }
        Ok(builder.build(dataset))
    }

    /// Debugging mode stops every pass after its first batch.
    fn batch_limit(&self) -> usize {
        if self.config.debugging_mode {
            1
        } else {
            usize::MAX
        }
    }

    fn log_step(
        &self,
        name: &str,
        epoch: usize,
        step: usize,
        report: &LossReport,
        lr: f64,
        started: Instant,
    ) {
        info!(
            "[{name}][Epoch:{epoch:03}][{step}/{total}] train_loss: {loss:.4} | acc: {acc:.4} | lr: {lr:.2e} | spend_time: {minutes:.2} min",
            total = self.steps_per_epoch,
            loss = report.loss,
            acc = report.accuracy(),
            minutes = started.elapsed().as_secs_f64() / 60.0,
        );
    }
}

/// Trains the augmenter and then the latent classifier on the preprocessed store
/// described by `paths`, writing checkpoints and `config.json` under the checkpoint
/// directory. With `resume`, both phases continue after their saved epochs.
pub fn train<B: AutodiffBackend>(
    device: B::Device,
    config: ExperimentConfig,
    paths: &ExperimentPaths,
    resume: bool,
) -> Result<TrainingReport> {
    config.validate()?;
    B::seed(config.seed);

    let store = PreprocessedStore::open(paths.store_dir())?;
    let tokenizer = load_tokenizer(&config.tokenizer, store.vocabulary())?;
    let vocab_size = tokenizer.vocab_size();
    store.check_vocabulary(vocab_size)?;

    let model_config = AugmenterModelConfig::from_experiment(&config, tokenizer.as_ref());
    let classifier_config = LatentClassifierConfig::new(config.d_model, store.num_labels())
        .with_dropout(config.dropout);

    let checkpoint_dir = paths.checkpoint_dir();
    fs::create_dir_all(&checkpoint_dir).map_err(|err| AugError::resource(&checkpoint_dir, err))?;
    config
        .save(paths.config_file())
        .map_err(|err| AugError::resource(paths.config_file(), err))?;
    let checkpoints = CheckpointManager::new(&checkpoint_dir);

    let mut plan = EpochPlan::new(config.aug_num_epochs, config.cls_num_epochs);
    let mut augmenter = model_config.init::<B>(&device);
    let mut aug_resume = None;
    let mut cls_resume = None;
    if resume {
        let aug_state = checkpoints.load_state(CheckpointSlot::Augmenter)?;
        augmenter = checkpoints.load_model(CheckpointSlot::Augmenter, augmenter, &device)?;
        let cls_state = if checkpoints.exists(CheckpointSlot::Classifier) {
            Some(checkpoints.load_state(CheckpointSlot::Classifier)?)
        } else {
            None
        };
        // A classifier checkpoint is only written once the augmenter phase is over.
        let aug_done = match &cls_state {
            Some(_) => config.aug_num_epochs.max(aug_state.epoch),
            None => aug_state.epoch,
        };
        let cls_done = cls_state.as_ref().map_or(0, |state| state.epoch);
        plan = plan.resumed(aug_done, cls_done);
        info!("Resuming after augmenter epoch {aug_done} and classifier epoch {cls_done}");
        aug_resume = Some(aug_state);
        cls_resume = cls_state;
    }

    let train_len = store.split_len(DatasetSplit::Train);
    let steps_per_epoch = if config.debugging_mode {
        1
    } else {
        train_len.div_ceil(config.batch_size).max(1)
    };
    info!(
        "Training on {train_len} examples, {steps_per_epoch} steps per epoch, vocabulary of {vocab_size}"
    );

    let mut report = TrainingReport {
        augmenter: aug_resume.as_ref().map(|s| s.progress).unwrap_or_default(),
        classifier: cls_resume.as_ref().map(|s| s.progress).unwrap_or_default(),
    };
    let ctx = TrainingContext::<B> {
        device: device.clone(),
        config,
        store,
        vocab_size,
        checkpoints,
        plan,
        steps_per_epoch,
    };

    let mut phase = TrainingPhase::Init.next(&ctx.plan);
    if phase.is_augmenter() {
        let (next, trained, progress) = ctx
            .config
            .aug_optimizer
            .visit::<B, AugmenterModel<B>, _>(AugmenterPhase {
                ctx: &ctx,
                model: augmenter,
                resume: aug_resume,
                phase,
            })?;
        phase = next;
        augmenter = trained;
        report.augmenter = progress;
    }

    if phase.is_classifier() {
        let frozen = if ctx.checkpoints.exists(CheckpointSlot::Augmenter) {
            info!("Loading the best augmenter for classifier training");
            ctx.checkpoints.load_model(
                CheckpointSlot::Augmenter,
                model_config.init::<B::InnerBackend>(&device),
                &device,
            )?
        } else {
            warn!("No augmenter checkpoint was saved, training the classifier on the last augmenter");
            augmenter.valid()
        };

        let mut classifier = classifier_config.init::<B>(&device);
        if cls_resume.is_some() {
            classifier = ctx
                .checkpoints
                .load_model(CheckpointSlot::Classifier, classifier, &device)?;
        }

        let (next, progress) = ctx
            .config
            .cls_optimizer
            .visit::<B, LatentClassifier<B>, _>(ClassifierPhase {
                ctx: &ctx,
                classifier,
                augmenter: frozen,
                resume: cls_resume,
                phase,
            })?;
        phase = next;
        report.classifier = progress;
    }

    debug_assert_eq!(phase, TrainingPhase::Done);
    info!(
        "Training finished, best augmenter epoch {:?}, best classifier epoch {:?}",
        report.augmenter.best_epoch, report.classifier.best_epoch
    );
    Ok(report)
}

struct AugmenterPhase<'a, B: AutodiffBackend> {
    ctx: &'a TrainingContext<B>,
    model: AugmenterModel<B>,
    resume: Option<CheckpointState>,
    phase: TrainingPhase,
}

impl<B: AutodiffBackend> OptimizerVisitor<B, AugmenterModel<B>> for AugmenterPhase<'_, B> {
    type Output = Result<(TrainingPhase, AugmenterModel<B>, TrainingProgress)>;

    fn visit<O: Optimizer<AugmenterModel<B>, B>>(self, optim: O) -> Self::Output {
        let ctx = self.ctx;
        let config = &ctx.config;
        let scheduler = PhaseLrScheduler::new(
            &config.aug_optimizer,
            ctx.steps_per_epoch,
            config.aug_num_epochs,
            config.d_model,
        );
        let (mut optim, mut scheduler, mut progress) = match self.resume {
            Some(state) => (
                ctx.checkpoints
                    .load_optimizer(CheckpointSlot::Augmenter, optim, &ctx.device)?,
                ctx.checkpoints.load_scheduler::<B, _>(
                    CheckpointSlot::Augmenter,
                    scheduler,
                    &ctx.device,
                )?,
                state.progress,
            ),
            None => (optim, scheduler, TrainingProgress::default()),
        };

        let objective = AugmenterObjective::from_config(config)?;
        let train_loader = ctx.loader::<B>(DatasetSplit::Train, true)?;
        let valid_loader = ctx.loader::<B::InnerBackend>(DatasetSplit::Valid, false)?;

        let mut model = self.model;
        let mut phase = self.phase;
        while phase.is_augmenter() {
            match phase {
                TrainingPhase::AugTrain(epoch) => {
                    let started = Instant::now();
                    let mut running = RunningLoss::default();
                    let mut last_lr = 0.0;
                    for (i, batch) in train_loader.iter().take(ctx.batch_limit()).enumerate() {
                        // Scheduler first, so the step runs at the new rate
                        let lr = LrScheduler::<B>::step(&mut scheduler);
                        last_lr = lr;
                        let (next, outcome) =
                            augmenter_step(model, &mut optim, &objective, &batch, lr);
                        model = next;
                        record_outcome(&mut running, &outcome, "augmenter", epoch, i + 1);
                        if (i + 1) % config.print_freq == 0 {
                            ctx.log_step("augmenter", epoch, i + 1, &running.mean(), lr, started);
                        }
                    }
                    ctx.log_step(
                        "augmenter",
                        epoch,
                        running.batches(),
                        &running.mean(),
                        last_lr,
                        started,
                    );
                }
                TrainingPhase::AugValidate(epoch) => {
                    let report = evaluate_augmenter(
                        &model.valid(),
                        &objective,
                        valid_loader.iter().take(ctx.batch_limit()),
                    );
                    info!(
                        "[augmenter][Epoch:{epoch:03}] valid recon_loss: {:.4} | mmd_loss: {:.4} | acc: {:.4}",
                        report.recon,
                        report.mmd,
                        report.accuracy()
                    );

                    // Only an improvement replaces the slot
                    let (next, verdict) = progress.observe(epoch, report.recon);
                    progress = next;
                    if verdict == Verdict::Improved {
                        let state = CheckpointState { epoch, progress };
                        ctx.checkpoints.save(
                            CheckpointSlot::Augmenter,
                            &model,
                            &optim,
                            &scheduler,
                            &state,
                        )?;
                        info!("Saved augmenter checkpoint at epoch {epoch}");
                    } else {
                        log_still_best("augmenter", &progress);
                    }
                }
                _ => {}
            }
            phase = phase.next(&ctx.plan);
        }

        Ok((phase, model, progress))
    }
}

struct ClassifierPhase<'a, B: AutodiffBackend> {
    ctx: &'a TrainingContext<B>,
    classifier: LatentClassifier<B>,
    augmenter: AugmenterModel<B::InnerBackend>,
    resume: Option<CheckpointState>,
    phase: TrainingPhase,
}

impl<B: AutodiffBackend> OptimizerVisitor<B, LatentClassifier<B>> for ClassifierPhase<'_, B> {
    type Output = Result<(TrainingPhase, TrainingProgress)>;

    fn visit<O: Optimizer<LatentClassifier<B>, B>>(self, optim: O) -> Self::Output {
        let ctx = self.ctx;
        let config = &ctx.config;
        let scheduler = PhaseLrScheduler::new(
            &config.cls_optimizer,
            ctx.steps_per_epoch,
            config.cls_num_epochs,
            config.d_model,
        );
        let (mut optim, mut scheduler, mut progress) = match self.resume {
            Some(state) => (
                ctx.checkpoints
                    .load_optimizer(CheckpointSlot::Classifier, optim, &ctx.device)?,
                ctx.checkpoints.load_scheduler::<B, _>(
                    CheckpointSlot::Classifier,
                    scheduler,
                    &ctx.device,
                )?,
                state.progress,
            ),
            None => (optim, scheduler, TrainingProgress::default()),
        };

        let mix = config.mix()?;
        let smoothing = config.cls_label_smoothing;
        let train_loader = ctx.loader::<B::InnerBackend>(DatasetSplit::Train, true)?;
        let valid_loader = ctx.loader::<B::InnerBackend>(DatasetSplit::Valid, false)?;

        let augmenter = self.augmenter;
        let mut classifier = self.classifier;
        let mut phase = self.phase;
        while phase.is_classifier() {
            match phase {
                TrainingPhase::ClsTrain(epoch) => {
                    let started = Instant::now();
                    let mut running = RunningLoss::default();
                    let mut last_lr = 0.0;
                    for (i, batch) in train_loader.iter().take(ctx.batch_limit()).enumerate() {
                        let lr = LrScheduler::<B>::step(&mut scheduler);
                        last_lr = lr;
                        let (next, outcome) = classifier_step(
                            classifier, &mut optim, &augmenter, mix, smoothing, batch, lr,
                        );
                        classifier = next;
                        record_outcome(&mut running, &outcome, "classifier", epoch, i + 1);
                        if (i + 1) % config.print_freq == 0 {
                            ctx.log_step("classifier", epoch, i + 1, &running.mean(), lr, started);
                        }
                    }
                    ctx.log_step(
                        "classifier",
                        epoch,
                        running.batches(),
                        &running.mean(),
                        last_lr,
                        started,
                    );
                }
                TrainingPhase::ClsValidate(epoch) => {
                    let report = evaluate_classifier(
                        &classifier.valid(),
                        &augmenter,
                        mix,
                        smoothing,
                        valid_loader.iter().take(ctx.batch_limit()),
                    );
                    info!(
                        "[classifier][Epoch:{epoch:03}] valid cls_loss: {:.4} | acc: {:.4}",
                        report.loss,
                        report.accuracy()
                    );

                    let (next, verdict) = progress.observe(epoch, report.loss);
                    progress = next;
                    if verdict == Verdict::Improved {
                        let state = CheckpointState { epoch, progress };
                        ctx.checkpoints.save(
                            CheckpointSlot::Classifier,
                            &classifier,
                            &optim,
                            &scheduler,
                            &state,
                        )?;
                        info!("Saved classifier checkpoint at epoch {epoch}");
                    } else {
                        log_still_best("classifier", &progress);
                    }
                }
                _ => {}
            }
            phase = phase.next(&ctx.plan);
        }

        Ok((phase, progress))
    }
}

fn log_still_best(phase: &str, progress: &TrainingProgress) {
    if let (Some(best_epoch), Some(best_loss)) = (progress.best_epoch, progress.best_loss) {
        info!("[{phase}] epoch {best_epoch} is still the best, valid loss {best_loss:.4}");
    }
}

fn record_outcome(
    running: &mut RunningLoss,
    outcome: &StepOutcome,
    phase: &'static str,
    epoch: usize,
    step: usize,
) {
    match outcome {
        StepOutcome::Applied(report) => running.add(report),
        StepOutcome::Skipped(report) => {
            let anomaly = AugError::NumericAnomaly {
                phase,
                epoch,
                step,
                value: report.loss,
            };
            warn!("{anomaly}, step skipped");
        }
    }
}
