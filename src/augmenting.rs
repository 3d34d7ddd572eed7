// Adversarial augmentation. For every batch the hidden state is computed once, cut out
// of the encoder graph and re-attached as a fresh leaf so that the classifier gradient
// can be taken with respect to it. Each epsilon of the schedule then moves a copy of the
// hidden state against that gradient, the decoder generates a sentence from it, and the
// sentence is scored again by the encoder and classifier. No weights are ever updated.

use crate::{
    config::{
        DecodingKind, EpsilonSchedule, ExperimentConfig, ExperimentPaths, HiddenMix,
        TargetLabelStrategy,
    },
    data_processing::{DatasetSplit, PreprocessedStore, TokenBatch, TokenBatcher, Tokenizer},
    error::{AugError, Result},
    inference::{LatentScorer, TrainedArtifacts},
    loss::soft_cross_entropy,
    model::{perturb_hidden, AugmenterModel, LatentClassifier, TokenSampler},
};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    tensor::{backend::AutodiffBackend, Data, Int, Shape, Tensor},
};
use serde::Serialize;
use std::{fs, path::PathBuf, sync::Arc, time::Instant};
use tracing::info;

/// A tensor detached from whatever produced it and re-attached as a gradient leaf.
pub struct GradientLeaf<B: AutodiffBackend, const D: usize> {
    tensor: Tensor<B, D>,
}

impl<B: AutodiffBackend, const D: usize> GradientLeaf<B, D> {
    pub fn from_inner(value: Tensor<B::InnerBackend, D>) -> Self {
        Self {
            tensor: Tensor::from_inner(value).require_grad(),
        }
    }

    pub fn tensor(&self) -> Tensor<B, D> {
        self.tensor.clone()
    }

    /// Gradient of the leaf, zeros when the loss did not depend on it.
    pub fn grad(&self, grads: &B::Gradients) -> Tensor<B::InnerBackend, D> {
        self.tensor
            .grad(grads)
            .unwrap_or_else(|| self.tensor.clone().inner().zeros_like())
    }
}

/// Distribution the classifier is pushed towards for an example labelled `label`.
pub fn target_distribution(
    strategy: TargetLabelStrategy,
    label: usize,
    num_labels: usize,
) -> Vec<f32> {
    match strategy {
        TargetLabelStrategy::UseTrueLabel => one_hot(label, num_labels),
        TargetLabelStrategy::UseFlippedLabel => one_hot(num_labels - 1 - label, num_labels),
        TargetLabelStrategy::UseUniformLabel => vec![1.0 / num_labels as f32; num_labels],
    }
}

fn one_hot(label: usize, num_labels: usize) -> Vec<f32> {
    let mut row = vec![0.0; num_labels];
    row[label] = 1.0;
    row
}

/// One generated sentence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub epsilon: f64,
    pub text: String,
    pub probabilities: Vec<f32>,
}

/// A source sentence, its plain reconstruction and one candidate per epsilon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AugmentedRecord {
    pub source: String,
    pub origin: String,
    pub candidates: Vec<Candidate>,
}

/// Ordered augmentation results, indexed by example and epsilon position.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationTable {
    columns: Vec<String>,
    records: Vec<AugmentedRecord>,
}

impl AugmentationTable {
    pub fn new(schedule: &EpsilonSchedule) -> Self {
        Self {
            columns: (0..schedule.len()).map(|i| schedule.column_name(i)).collect(),
            records: vec![],
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = AugmentedRecord>) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[AugmentedRecord] {
        &self.records
    }

    pub fn get(&self, example: usize, epsilon_index: usize) -> Option<&Candidate> {
        self.records.get(example)?.candidates.get(epsilon_index)
    }

    /// `seq, origin, <eps columns>, <eps columns>_prob`
    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec!["seq".to_string(), "origin".to_string()];
        headers.extend(self.columns.iter().cloned());
        headers.extend(self.columns.iter().map(|c| format!("{c}_prob")));
        headers
    }

    pub fn write_csv(&self, path: impl Into<PathBuf>) -> Result<PathBuf> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AugError::resource(parent, err))?;
        }

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(self.headers())?;
        for record in &self.records {
            let mut row = vec![record.source.clone(), record.origin.clone()];
            row.extend(record.candidates.iter().map(|c| c.text.clone()));
            row.extend(record.candidates.iter().map(|c| {
                c.probabilities
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(";")
            }));
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(path)
    }
}

pub struct AdversarialAugmenter<B: AutodiffBackend> {
    scorer: LatentScorer<B::InnerBackend>,
    classifier: LatentClassifier<B>,
    tokenizer: Arc<dyn Tokenizer>,
    epsilons: Vec<f64>,
    strategy: TargetLabelStrategy,
    max_generation_length: usize,
    mix: HiddenMix,
}

impl<B: AutodiffBackend> AdversarialAugmenter<B> {
    /// `classifier` must have been built without dropout. Its parameters are frozen here.
    pub fn new(
        augmenter: AugmenterModel<B::InnerBackend>,
        classifier: LatentClassifier<B>,
        tokenizer: Arc<dyn Tokenizer>,
        config: &ExperimentConfig,
        device: B::Device,
    ) -> Result<Self> {
        let mix = config.mix()?;
        let classifier = classifier.no_grad();
        let scorer = LatentScorer::new(
            augmenter,
            classifier.valid(),
            tokenizer.clone(),
            device,
            config.max_seq_length,
            mix,
        );

        Ok(Self {
            scorer,
            classifier,
            tokenizer,
            epsilons: config.epsilon_schedule.values(),
            strategy: config.target_label,
            max_generation_length: config.max_generation_length,
            mix,
        })
    }

    /// Gradient of the soft cross entropy towards the target distribution, taken with
    /// respect to `hidden`.
    pub fn adversarial_gradient(
        &self,
        hidden: Tensor<B::InnerBackend, 3>,
        labels: &[usize],
    ) -> Tensor<B::InnerBackend, 3> {
        let leaf = GradientLeaf::<B, 3>::from_inner(hidden);
        let logits = self.classifier.forward(leaf.tensor());
        let [batch_size, num_labels] = logits.dims();

        let targets = labels
            .iter()
            .flat_map(|label| target_distribution(self.strategy, *label, num_labels))
            .collect::<Vec<_>>();
        let targets = Tensor::<B, 2>::from_data(
            Data::new(targets, Shape::new([batch_size, num_labels])).convert::<B::FloatElem>(),
            &logits.device(),
        );

        let grads = soft_cross_entropy(logits, targets).backward();
        leaf.grad(&grads)
    }

    pub fn augment_batch(
        &self,
        batch: TokenBatch<B::InnerBackend>,
        sampler: &mut TokenSampler,
    ) -> Vec<AugmentedRecord> {
        let augmenter = self.scorer.augmenter();
        let input_ids = batch.input_ids;
        let mask_pad = batch.mask_pad;
        let labels = batch
            .labels
            .into_data()
            .convert::<i64>()
            .value
            .into_iter()
            .map(|label| label as usize)
            .collect::<Vec<_>>();

        // 1. Hidden memory of the sources
        let (hidden, _) = augmenter.encode_hidden(
            input_ids.clone(),
            mask_pad.clone(),
            batch.segment_ids,
            self.mix,
        );

        // 2. Unperturbed reconstruction, teacher-forced
        let sources = self.decode_rows(input_ids.clone());
        let origin_logits = augmenter
            .decoder
            .forward(input_ids.clone(), mask_pad.clone(), hidden.clone());
        let [batch_size, seq_length, _] = origin_logits.dims();
        let origins = self.decode_rows(origin_logits.argmax(2).reshape([batch_size, seq_length]));

        // 3. Gradient of the classifier loss with respect to the memory
        let grad = self.adversarial_gradient(hidden.clone(), &labels);

        let mut candidates = vec![Vec::with_capacity(self.epsilons.len()); batch_size];
        // 4. One generated and scored candidate per epsilon
        for epsilon in &self.epsilons {
            let perturbed = perturb_hidden(hidden.clone(), grad.clone(), *epsilon);
            let generated = augmenter.decoder.generate(
                input_ids.clone(),
                mask_pad.clone(),
                perturbed,
                self.max_generation_length,
                sampler,
            );
            let texts = self.decode_rows(generated);
            let probabilities = self.scorer.score_texts(texts.clone());

            for ((row, text), probabilities) in candidates.iter_mut().zip(texts).zip(probabilities)
            {
                row.push(Candidate {
                    epsilon: *epsilon,
                    text,
                    probabilities,
                });
            }
        }

        sources
            .into_iter()
            .zip(origins)
            .zip(candidates)
            .map(|((source, origin), candidates)| AugmentedRecord {
                source,
                origin,
                candidates,
            })
            .collect()
    }

    fn decode_rows(&self, ids: Tensor<B::InnerBackend, 2, Int>) -> Vec<String> {
        let [_, columns] = ids.dims();
        ids.into_data()
            .convert::<i64>()
            .value
            .chunks(columns.max(1))
            .map(|row| {
                let tokens = row.iter().map(|t| *t as usize).collect::<Vec<_>>();
                self.tokenizer.decode(&tokens)
            })
            .collect()
    }
}

/// Settings that may differ between training and augmentation.
#[derive(Debug, Clone, Default)]
pub struct AugmentOverrides {
    pub epsilon_schedule: Option<EpsilonSchedule>,
    pub target_label: Option<TargetLabelStrategy>,
    pub decoding: Option<DecodingKind>,
    pub max_generation_length: Option<usize>,
    pub batch_size: Option<usize>,
    pub debugging_mode: bool,
}

impl AugmentOverrides {
    pub fn apply(self, mut config: ExperimentConfig) -> ExperimentConfig {
        if let Some(schedule) = self.epsilon_schedule {
            config.epsilon_schedule = schedule;
        }
        if let Some(target_label) = self.target_label {
            config.target_label = target_label;
        }
        if let Some(decoding) = self.decoding {
            config.decoding = decoding;
        }
        if let Some(length) = self.max_generation_length {
            config.max_generation_length = length;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        config.debugging_mode |= self.debugging_mode;
        config
    }
}

/// Augments the training split of a trained experiment and writes the result table.
pub fn augment<B: AutodiffBackend>(
    device: B::Device,
    paths: &ExperimentPaths,
    overrides: AugmentOverrides,
) -> Result<PathBuf> {
    let mut artifacts = TrainedArtifacts::open(paths)?;
    let config = overrides.apply(artifacts.config.clone());
    config.validate()?;
    artifacts.config = config.clone();
    B::seed(config.seed);

    let store = PreprocessedStore::open(paths.store_dir())?;
    let vocab_size = artifacts.tokenizer.vocab_size();
    store.check_vocabulary(vocab_size)?;
    let dataset = store.dataset(DatasetSplit::Train, config.max_seq_length, vocab_size)?;
    let loader = DataLoaderBuilder::new(TokenBatcher::<B::InnerBackend>::new(device.clone()))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset);

    let engine = AdversarialAugmenter::<B>::new(
        artifacts.augmenter::<B::InnerBackend>(&device)?,
        artifacts.classifier::<B>(&device)?,
        artifacts.tokenizer.clone(),
        &config,
        device,
    )?;
    let mut sampler = TokenSampler::from_config(&config);
    let mut table = AugmentationTable::new(&config.epsilon_schedule);

    info!(
        "Augmenting with {} epsilons, {} targets, {} decoding",
        config.epsilon_schedule.len(),
        config.target_label,
        config.decoding
    );
    let started = Instant::now();
    let limit = if config.debugging_mode { 1 } else { usize::MAX };
    for (i, batch) in loader.iter().take(limit).enumerate() {
        let records = engine.augment_batch(batch, &mut sampler);
        if config.print_example {
            if let Some(record) = records.first() {
                let last = record.candidates.last().map_or("", |c| c.text.as_str());
                info!("[{}] source: {} | augmented: {}", i + 1, record.source, last);
            }
        }
        table.extend(records);
        if (i + 1) % config.print_freq == 0 {
            info!(
                "[{}] {} examples augmented | spend_time: {:.2} min",
                i + 1,
                table.len(),
                started.elapsed().as_secs_f64() / 60.0
            );
        }
    }

    let path = table.write_csv(paths.result_file())?;
    info!("Wrote {} augmented examples to {}", table.len(), path.display());
    Ok(path)
}
