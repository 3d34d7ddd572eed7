use burn::{
    backend::{Autodiff, NdArray},
    data::dataloader::batcher::Batcher,
    lr_scheduler::LrScheduler,
    module::AutodiffModule,
    optim::Optimizer,
};
use latent_aug::{
    augment,
    checkpoint::{CheckpointManager, CheckpointSlot, CheckpointState},
    config::{EpsilonSchedule, OptimizerKind, OptimizerSettings, SchedulerKind},
    data_processing::{TokenBatch, TokenBatcher, TokenItem, VocabTokenizer},
    infer,
    model::{AugmenterModel, AugmenterModelConfig, LatentClassifier, LatentClassifierConfig},
    optim::{OptimizerVisitor, PhaseLrScheduler},
    train,
    training::{
        augmenter_step, classifier_step, evaluate_augmenter, evaluate_classifier,
        AugmenterObjective, StepOutcome, TrainingProgress,
    },
    AugmentOverrides, ExperimentConfig, ExperimentPaths,
};
use serde_json::json;
use std::{collections::HashMap, fs, iter};

type TestBackend = Autodiff<NdArray<f32>>;
type InnerBackend = NdArray<f32>;

const N_WORDS: usize = 20;

fn word2id() -> HashMap<String, usize> {
    let mut word2id: HashMap<String, usize> = ["[PAD]", "[CLS]", "[SEP]", "[UNK]"]
        .into_iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), id))
        .collect();
    for i in 0..N_WORDS {
        word2id.insert(format!("w{i}"), i + 4);
    }
    word2id
}

fn tiny_config(max_seq_length: usize) -> ExperimentConfig {
    ExperimentConfig::new()
        .with_d_model(8)
        .with_d_ff(16)
        .with_n_heads(2)
        .with_n_encoder_layers(1)
        .with_n_decoder_layers(1)
        .with_n_latent_layers(1)
        .with_dropout(0.0)
        .with_max_seq_length(max_seq_length)
        .with_max_generation_length(6)
        .with_batch_size(4)
        .with_print_freq(1)
}

/// `[CLS] w.. [SEP] [PAD]..` padded to `length`.
fn row(words: &[usize], length: usize) -> (Vec<usize>, Vec<u8>) {
    let mut ids = vec![1];
    ids.extend(words.iter().map(|w| w + 4));
    ids.push(2);
    let mut mask = vec![1; ids.len()];
    ids.resize(length, 0);
    mask.resize(length, 0);
    (ids, mask)
}

fn toy_items(length: usize) -> Vec<TokenItem> {
    (0..4)
        .map(|i| {
            let words = (0..3 + 2 * i).map(|j| (i * 3 + j) % N_WORDS).collect::<Vec<_>>();
            let (ids, mask) = row(&words, length);
            TokenItem::new(ids, mask, None, i % 2)
        })
        .collect()
}

fn constant_adam(lr: f64) -> OptimizerSettings {
    OptimizerSettings::new()
        .with_kind(OptimizerKind::Adam)
        .with_scheduler(SchedulerKind::Constant)
        .with_weight_decay(0.0)
        .with_lr(lr)
}

struct AugmenterStep {
    model: AugmenterModel<TestBackend>,
    objective: AugmenterObjective,
    batch: TokenBatch<TestBackend>,
    inner_batch: TokenBatch<InnerBackend>,
}

impl OptimizerVisitor<TestBackend, AugmenterModel<TestBackend>> for AugmenterStep {
    type Output = (f64, f64, StepOutcome);

    fn visit<O: Optimizer<AugmenterModel<TestBackend>, TestBackend>>(
        self,
        mut optim: O,
    ) -> Self::Output {
        let before = evaluate_augmenter(
            &self.model.valid(),
            &self.objective,
            iter::once(self.inner_batch.clone()),
        );
        let (model, outcome) =
            augmenter_step(self.model, &mut optim, &self.objective, &self.batch, 1e-3);
        let after = evaluate_augmenter(
            &model.valid(),
            &self.objective,
            iter::once(self.inner_batch),
        );
        (before.recon, after.recon, outcome)
    }
}

#[test]
fn one_augmenter_step_lowers_the_reconstruction_loss() {
    let device = Default::default();
    let config = tiny_config(50)
        .with_encoder_out_ratio(1.0)
        .with_latent_out_ratio(0.0)
        .with_latent_mmd_loss(false)
        .with_aug_optimizer(constant_adam(1e-3));
    let tokenizer = VocabTokenizer::new(word2id()).unwrap();
    let model = AugmenterModelConfig::from_experiment(&config, &tokenizer).init(&device);

    let items = toy_items(50);
    let step = AugmenterStep {
        model,
        objective: AugmenterObjective::from_config(&config).unwrap(),
        batch: TokenBatcher::new(Default::default()).batch(items.clone()),
        inner_batch: TokenBatcher::new(Default::default()).batch(items),
    };
    let (before, after, outcome) = config
        .aug_optimizer
        .visit::<TestBackend, AugmenterModel<TestBackend>, _>(step);

    assert!(matches!(outcome, StepOutcome::Applied(_)));
    assert!(before.is_finite());
    assert!(after < before, "loss went from {before} to {after}");
}

struct ClassifierStep {
    classifier: LatentClassifier<TestBackend>,
    augmenter: AugmenterModel<InnerBackend>,
    config: ExperimentConfig,
    batch: TokenBatch<InnerBackend>,
}

impl OptimizerVisitor<TestBackend, LatentClassifier<TestBackend>> for ClassifierStep {
    type Output = (f64, f64);

    fn visit<O: Optimizer<LatentClassifier<TestBackend>, TestBackend>>(
        self,
        mut optim: O,
    ) -> Self::Output {
        let mix = self.config.mix().unwrap();
        let smoothing = self.config.cls_label_smoothing;
        let before = evaluate_classifier(
            &self.classifier.valid(),
            &self.augmenter,
            mix,
            smoothing,
            iter::once(self.batch.clone()),
        );
        let (classifier, _) = classifier_step(
            self.classifier,
            &mut optim,
            &self.augmenter,
            mix,
            smoothing,
            self.batch.clone(),
            1e-3,
        );
        let after = evaluate_classifier(
            &classifier.valid(),
            &self.augmenter,
            mix,
            smoothing,
            iter::once(self.batch),
        );
        (before.loss, after.loss)
    }
}

#[test]
fn one_classifier_step_lowers_the_classification_loss() {
    let device = Default::default();
    let config = tiny_config(50)
        .with_encoder_out_ratio(1.0)
        .with_latent_out_ratio(0.0)
        .with_cls_optimizer(constant_adam(1e-3));
    let tokenizer = VocabTokenizer::new(word2id()).unwrap();
    let augmenter = AugmenterModelConfig::from_experiment(&config, &tokenizer).init(&device);
    let classifier = LatentClassifierConfig::new(8, 2)
        .with_dropout(0.0)
        .init(&device);

    let step = ClassifierStep {
        classifier,
        augmenter,
        batch: TokenBatcher::new(Default::default()).batch(toy_items(50)),
        config: config.clone(),
    };
    let (before, after) = config
        .cls_optimizer
        .visit::<TestBackend, LatentClassifier<TestBackend>, _>(step);

    assert!(after < before, "loss went from {before} to {after}");
}

fn warmup_adam(lr: f64) -> OptimizerSettings {
    constant_adam(lr)
        .with_scheduler(SchedulerKind::Warmup)
        .with_n_warmup_epochs(1.0)
}

fn logits(model: &AugmenterModel<TestBackend>, config: &ExperimentConfig) -> Vec<f32> {
    let batch: TokenBatch<InnerBackend> =
        TokenBatcher::new(Default::default()).batch(toy_items(8));
    model
        .valid()
        .forward(batch.input_ids, batch.mask_pad, None, config.mix().unwrap())
        .logits
        .into_data()
        .convert::<f32>()
        .value
}

/// Runs two augmenter steps, saving the slot after the first one.
struct TrainThroughCheckpoint<'a> {
    manager: &'a CheckpointManager,
    config: &'a ExperimentConfig,
    model: AugmenterModel<TestBackend>,
    batch: TokenBatch<TestBackend>,
}

impl OptimizerVisitor<TestBackend, AugmenterModel<TestBackend>> for TrainThroughCheckpoint<'_> {
    type Output = (f64, Vec<f32>);

    fn visit<O: Optimizer<AugmenterModel<TestBackend>, TestBackend>>(
        self,
        mut optim: O,
    ) -> Self::Output {
        let objective = AugmenterObjective::from_config(self.config).unwrap();
        let mut scheduler =
            PhaseLrScheduler::new(&self.config.aug_optimizer, 2, 2, self.config.d_model);

        let lr = LrScheduler::<TestBackend>::step(&mut scheduler);
        let (model, _) = augmenter_step(self.model, &mut optim, &objective, &self.batch, lr);
        let state = CheckpointState {
            epoch: 1,
            progress: TrainingProgress {
                best_epoch: Some(1),
                best_loss: Some(1.25),
            },
        };
        self.manager
            .save(CheckpointSlot::Augmenter, &model, &optim, &scheduler, &state)
            .unwrap();

        let lr = LrScheduler::<TestBackend>::step(&mut scheduler);
        let (model, _) = augmenter_step(model, &mut optim, &objective, &self.batch, lr);
        (lr, logits(&model, self.config))
    }
}

/// Restores model, optimizer and scheduler from the slot and runs one more step.
struct ResumeFromCheckpoint<'a> {
    manager: &'a CheckpointManager,
    config: &'a ExperimentConfig,
    fresh: AugmenterModel<TestBackend>,
    batch: TokenBatch<TestBackend>,
}

impl OptimizerVisitor<TestBackend, AugmenterModel<TestBackend>> for ResumeFromCheckpoint<'_> {
    type Output = (f64, Vec<f32>);

    fn visit<O: Optimizer<AugmenterModel<TestBackend>, TestBackend>>(
        self,
        optim: O,
    ) -> Self::Output {
        let device = Default::default();
        let objective = AugmenterObjective::from_config(self.config).unwrap();
        let model = self
            .manager
            .load_model(CheckpointSlot::Augmenter, self.fresh, &device)
            .unwrap();
        let mut optim = self
            .manager
            .load_optimizer(CheckpointSlot::Augmenter, optim, &device)
            .unwrap();
        let mut scheduler = self
            .manager
            .load_scheduler::<TestBackend, _>(
                CheckpointSlot::Augmenter,
                PhaseLrScheduler::new(&self.config.aug_optimizer, 2, 2, self.config.d_model),
                &device,
            )
            .unwrap();

        let lr = LrScheduler::<TestBackend>::step(&mut scheduler);
        let (model, _) = augmenter_step(model, &mut optim, &objective, &self.batch, lr);
        (lr, logits(&model, self.config))
    }
}

#[test]
fn resumed_step_matches_the_uninterrupted_one() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let device = Default::default();
    let config = tiny_config(8)
        .with_latent_mmd_loss(false)
        .with_aug_optimizer(warmup_adam(1e-2));
    let tokenizer = VocabTokenizer::new(word2id()).unwrap();
    let model_config = AugmenterModelConfig::from_experiment(&config, &tokenizer);
    let batch: TokenBatch<TestBackend> =
        TokenBatcher::new(Default::default()).batch(toy_items(8));

    let (uninterrupted_lr, uninterrupted) = config
        .aug_optimizer
        .visit::<TestBackend, AugmenterModel<TestBackend>, _>(TrainThroughCheckpoint {
            manager: &manager,
            config: &config,
            model: model_config.init::<TestBackend>(&device),
            batch: batch.clone(),
        });

    let state = manager.load_state(CheckpointSlot::Augmenter).unwrap();
    assert_eq!(state.epoch, 1);
    assert_eq!(state.progress.best_loss, Some(1.25));

    let (resumed_lr, resumed) = config
        .aug_optimizer
        .visit::<TestBackend, AugmenterModel<TestBackend>, _>(ResumeFromCheckpoint {
            manager: &manager,
            config: &config,
            fresh: model_config.init::<TestBackend>(&device),
            batch,
        });

    // Second warmup step of two.
    assert_eq!(uninterrupted_lr, 1e-2);
    assert_eq!(resumed_lr, uninterrupted_lr);
    assert_eq!(resumed.len(), uninterrupted.len());
    for (a, b) in resumed.iter().zip(&uninterrupted) {
        assert!((a - b).abs() < 1e-6, "{a} != {b}");
    }
}

fn write_store(paths: &ExperimentPaths) {
    let split = |n: usize, offset: usize| {
        let rows = (0..n)
            .map(|i| {
                let words = (0..2 + i % 3).map(|j| (offset + i + j) % N_WORDS).collect::<Vec<_>>();
                row(&words, 8)
            })
            .collect::<Vec<_>>();
        json!({
            "src_input_ids": rows.iter().map(|(ids, _)| ids.clone()).collect::<Vec<_>>(),
            "src_attention_mask": rows.iter().map(|(_, mask)| mask.clone()).collect::<Vec<_>>(),
            "label": (0..n).map(|i| i % 2).collect::<Vec<_>>(),
        })
    };

    let dir = paths.store_dir();
    fs::create_dir_all(&dir).unwrap();
    let processed = json!({
        "train": split(6, 0),
        "valid": split(4, 7),
        "test": split(4, 11),
    });
    fs::write(dir.join("processed.json"), processed.to_string()).unwrap();
    let vocabulary = json!({ "src_word2id": word2id(), "num_labels": 2 });
    fs::write(dir.join("word2id.json"), vocabulary.to_string()).unwrap();
}

#[test]
fn train_resume_augment_and_predict() {
    let dir = tempfile::tempdir().unwrap();
    let paths = toy_paths(dir.path());
    write_store(&paths);

    let config = tiny_config(8)
        .with_tokenizer("store".into())
        .with_debugging_mode(true)
        .with_aug_num_epochs(2)
        .with_cls_num_epochs(1)
        .with_epsilon_schedule(EpsilonSchedule::Fixed(vec![0.0, 1.0]));

    let report = train::<TestBackend>(Default::default(), config.clone(), &paths, false).unwrap();
    assert!(report.augmenter.best_epoch.is_some());
    assert_eq!(report.classifier.best_epoch, Some(1));
    assert!(paths.config_file().is_file());

    let checkpoints = CheckpointManager::new(paths.checkpoint_dir());
    let aug_state = checkpoints.load_state(CheckpointSlot::Augmenter).unwrap();
    assert_eq!(Some(aug_state.epoch), report.augmenter.best_epoch);
    assert_eq!(
        checkpoints.load_state(CheckpointSlot::Classifier).unwrap().epoch,
        1
    );

    // Every epoch is already done, so resuming only restores the progress.
    let resumed = train::<TestBackend>(Default::default(), config, &paths, true).unwrap();
    assert_eq!(resumed.augmenter, report.augmenter);
    assert_eq!(resumed.classifier, report.classifier);

    let result = augment::<TestBackend>(Default::default(), &paths, AugmentOverrides::default())
        .unwrap();
    assert_eq!(result, paths.result_file());
    let mut reader = csv::Reader::from_path(&result).unwrap();
    assert_eq!(
        reader.headers().unwrap().iter().collect::<Vec<_>>(),
        vec!["seq", "origin", "eps_0", "eps_1", "eps_0_prob", "eps_1_prob"]
    );
    let records = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(record[4].split(';').count(), 2);
    }

    let predictions =
        infer::<InnerBackend>(Default::default(), &paths, vec!["w1 w2".into(), "w3".into()])
            .unwrap();
    assert_eq!(predictions.len(), 2);
    for prediction in predictions {
        assert_eq!(prediction.probabilities.len(), 2);
        assert!(prediction.label < 2);
    }
}

fn toy_paths(dir: &std::path::Path) -> ExperimentPaths {
    ExperimentPaths::new(
        dir.join("preprocessed"),
        dir.join("checkpoints"),
        dir.join("results"),
        "toy".into(),
        "latent".into(),
    )
}

#[test]
fn interrupted_augmenter_phase_resumes_at_the_next_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let paths = toy_paths(dir.path());
    write_store(&paths);

    let config = tiny_config(8)
        .with_tokenizer("store".into())
        .with_debugging_mode(true)
        .with_cls_num_epochs(0)
        .with_aug_optimizer(warmup_adam(1e-2));

    let first = train::<TestBackend>(
        Default::default(),
        config.clone().with_aug_num_epochs(1),
        &paths,
        false,
    )
    .unwrap();
    assert_eq!(first.augmenter.best_epoch, Some(1));
    assert_eq!(first.classifier, TrainingProgress::default());

    let resumed = train::<TestBackend>(
        Default::default(),
        config.with_aug_num_epochs(2),
        &paths,
        true,
    )
    .unwrap();
    let best_epoch = resumed.augmenter.best_epoch.unwrap();
    assert!(best_epoch == 1 || best_epoch == 2);
    if best_epoch == 2 {
        assert!(resumed.augmenter.best_loss < first.augmenter.best_loss);
    } else {
        assert_eq!(resumed.augmenter, first.augmenter);
    }

    let checkpoints = CheckpointManager::new(paths.checkpoint_dir());
    let state = checkpoints.load_state(CheckpointSlot::Augmenter).unwrap();
    assert_eq!(state.epoch, best_epoch);
    assert!(!checkpoints.exists(CheckpointSlot::Classifier));
}

