// Single optimization steps and evaluation passes of both phases. These are what the
// epoch loops in `runner` are made of, and they are public so that a step can be
// exercised on its own.

use crate::{
    config::{ExperimentConfig, HiddenMix},
    data_processing::TokenBatch,
    error::Result,
    loss::{classification_loss, compute_mmd, reconstruction_loss},
    model::{AugmenterModel, LatentClassifier},
};
use burn::{
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};

/// Reconstruction objective of the augmenter, optionally regularized with MMD.
#[derive(Debug, Clone, Copy)]
pub struct AugmenterObjective {
    pub mix: HiddenMix,
    pub latent_mmd_loss: bool,
    pub mmd_weight: f64,
    pub z_variation: f64,
    pub label_smoothing: f32,
}

impl AugmenterObjective {
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        Ok(Self {
            mix: config.mix()?,
            latent_mmd_loss: config.latent_mmd_loss,
            mmd_weight: config.mmd_weight,
            z_variation: config.z_variation,
            label_smoothing: config.recon_label_smoothing,
        })
    }

    pub fn forward<B: Backend>(
        &self,
        model: &AugmenterModel<B>,
        batch: &TokenBatch<B>,
    ) -> AugmenterLoss<B> {
        let output = model.forward(
            batch.input_ids.clone(),
            batch.mask_pad.clone(),
            batch.segment_ids.clone(),
            self.mix,
        );
        let recon = reconstruction_loss(
            output.logits.clone(),
            batch.input_ids.clone(),
            model.decoder.pad_token(),
            self.label_smoothing,
        );
        let mmd = self
            .latent_mmd_loss
            .then(|| compute_mmd(output.latent, self.z_variation));
        let total = match &mmd {
            Some(mmd) => recon.clone() + mmd.clone().mul_scalar(self.mmd_weight),
            None => recon.clone(),
        };

        AugmenterLoss {
            total,
            recon,
            mmd,
            logits: output.logits,
        }
    }
}

pub struct AugmenterLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub recon: Tensor<B, 1>,
    pub mmd: Option<Tensor<B, 1>>,
    pub logits: Tensor<B, 3>,
}

impl<B: Backend> AugmenterLoss<B> {
    fn report(&self, targets: Tensor<B, 2, Int>, pad_token: usize) -> LossReport {
        let (correct, count) = token_accuracy(self.logits.clone(), targets, pad_token);
        LossReport {
            loss: scalar(self.total.clone()),
            recon: scalar(self.recon.clone()),
            mmd: self.mmd.clone().map_or(0.0, |mmd| scalar(mmd)),
            correct,
            count,
        }
    }
}

/// Host-side numbers of one step or one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossReport {
    pub loss: f64,
    pub recon: f64,
    pub mmd: f64,
    pub correct: usize,
    pub count: usize,
}

impl LossReport {
    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

/// Per-batch mean of losses, accuracy over every counted position.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningLoss {
    sum: LossReport,
    batches: usize,
}

impl RunningLoss {
    pub fn add(&mut self, report: &LossReport) {
        self.sum.loss += report.loss;
        self.sum.recon += report.recon;
        self.sum.mmd += report.mmd;
        self.sum.correct += report.correct;
        self.sum.count += report.count;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn mean(&self) -> LossReport {
        let n = self.batches.max(1) as f64;
        LossReport {
            loss: self.sum.loss / n,
            recon: self.sum.recon / n,
            mmd: self.sum.mmd / n,
            ..self.sum
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied(LossReport),
    /// The loss was not finite and the parameters were left untouched.
    Skipped(LossReport),
}

/// One augmenter update: forward, backward and optimizer step at `lr`.
pub fn augmenter_step<B, O>(
    model: AugmenterModel<B>,
    optim: &mut O,
    objective: &AugmenterObjective,
    batch: &TokenBatch<B>,
    lr: f64,
) -> (AugmenterModel<B>, StepOutcome)
where
    B: AutodiffBackend,
    O: Optimizer<AugmenterModel<B>, B>,
{
    let loss = objective.forward(&model, batch);
    let report = loss.report(batch.input_ids.clone(), model.decoder.pad_token());
    if !report.loss.is_finite() {
        return (model, StepOutcome::Skipped(report));
    }

    let grads = loss.total.backward();
    let grads = GradientsParams::from_grads(grads, &model);
    (optim.step(lr, model, grads), StepOutcome::Applied(report))
}

/// One classifier update on the hidden state of a frozen augmenter.
///
/// The augmenter lives on the inner backend, so it runs without dropout and its
/// output enters the graph as a constant.
pub fn classifier_step<B, O>(
    classifier: LatentClassifier<B>,
    optim: &mut O,
    augmenter: &AugmenterModel<B::InnerBackend>,
    mix: HiddenMix,
    label_smoothing: f32,
    batch: TokenBatch<B::InnerBackend>,
    lr: f64,
) -> (LatentClassifier<B>, StepOutcome)
where
    B: AutodiffBackend,
    O: Optimizer<LatentClassifier<B>, B>,
{
    let (hidden, _) =
        augmenter.encode_hidden(batch.input_ids, batch.mask_pad, batch.segment_ids, mix);
    let hidden = Tensor::<B, 3>::from_inner(hidden);
    let labels = Tensor::<B, 1, Int>::from_data(
        batch.labels.into_data().convert::<B::IntElem>(),
        &hidden.device(),
    );

    let logits = classifier.forward(hidden);
    let loss = classification_loss(logits.clone(), labels.clone(), label_smoothing);
    let (correct, count) = label_accuracy(logits, labels);
    let value = scalar(loss.clone());
    let report = LossReport {
        loss: value,
        recon: 0.0,
        mmd: 0.0,
        correct,
        count,
    };
    if !value.is_finite() {
        return (classifier, StepOutcome::Skipped(report));
    }

    let grads = loss.backward();
    let grads = GradientsParams::from_grads(grads, &classifier);
    (optim.step(lr, classifier, grads), StepOutcome::Applied(report))
}

/// Mean reconstruction and MMD losses over `batches`.
pub fn evaluate_augmenter<B: Backend>(
    model: &AugmenterModel<B>,
    objective: &AugmenterObjective,
    batches: impl Iterator<Item = TokenBatch<B>>,
) -> LossReport {
    let mut running = RunningLoss::default();
    for batch in batches {
        let loss = objective.forward(model, &batch);
        running.add(&loss.report(batch.input_ids, model.decoder.pad_token()));
    }
    running.mean()
}

/// Mean classification loss and accuracy over `batches`.
pub fn evaluate_classifier<B: Backend>(
    classifier: &LatentClassifier<B>,
    augmenter: &AugmenterModel<B>,
    mix: HiddenMix,
    label_smoothing: f32,
    batches: impl Iterator<Item = TokenBatch<B>>,
) -> LossReport {
    let mut running = RunningLoss::default();
    for batch in batches {
        let (hidden, _) =
            augmenter.encode_hidden(batch.input_ids, batch.mask_pad, batch.segment_ids, mix);
        let logits = classifier.forward(hidden);
        let loss = classification_loss(logits.clone(), batch.labels.clone(), label_smoothing);
        let (correct, count) = label_accuracy(logits, batch.labels);
        running.add(&LossReport {
            loss: scalar(loss),
            recon: 0.0,
            mmd: 0.0,
            correct,
            count,
        });
    }
    running.mean()
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn token_accuracy<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    pad_token: usize,
) -> (usize, usize) {
    let [batch_size, seq_length, _] = logits.dims();
    let predicted = logits
        .argmax(2)
        .reshape([batch_size * seq_length])
        .into_data()
        .convert::<i64>()
        .value;
    let targets = targets.into_data().convert::<i64>().value;

    targets
        .iter()
        .zip(&predicted)
        .filter(|(target, _)| **target != pad_token as i64)
        .fold((0, 0), |(correct, count), (target, predicted)| {
            (correct + usize::from(target == predicted), count + 1)
        })
}

fn label_accuracy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> (usize, usize) {
    let [batch_size, _] = logits.dims();
    let predicted = logits
        .argmax(1)
        .reshape([batch_size])
        .into_data()
        .convert::<i64>()
        .value;
    let labels = labels.into_data().convert::<i64>().value;
    let correct = labels.iter().zip(&predicted).filter(|(l, p)| l == p).count();
    (correct, batch_size)
}
