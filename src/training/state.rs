// Joint training is a fixed sequence of phases: every augmenter epoch is trained and
// then validated, after which every classifier epoch is. `TrainingPhase::next` is the
// only place that sequence is encoded.

use serde::{Deserialize, Serialize};

/// Epoch ranges (1-based, inclusive) still to run for each model. A range whose first
/// epoch is past its last is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPlan {
    pub aug_first: usize,
    pub aug_last: usize,
    pub cls_first: usize,
    pub cls_last: usize,
}

impl EpochPlan {
    pub fn new(aug_epochs: usize, cls_epochs: usize) -> Self {
        Self {
            aug_first: 1,
            aug_last: aug_epochs,
            cls_first: 1,
            cls_last: cls_epochs,
        }
    }

    /// Continue after the epochs recorded in checkpoints.
    pub fn resumed(self, aug_done: usize, cls_done: usize) -> Self {
        Self {
            aug_first: aug_done + 1,
            cls_first: cls_done + 1,
            ..self
        }
    }

    fn augmenter_start(&self) -> TrainingPhase {
        if self.aug_first <= self.aug_last {
            TrainingPhase::AugTrain(self.aug_first)
        } else {
            self.classifier_start()
        }
    }

    fn classifier_start(&self) -> TrainingPhase {
        if self.cls_first <= self.cls_last {
            TrainingPhase::ClsTrain(self.cls_first)
        } else {
            TrainingPhase::Done
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Init,
    AugTrain(usize),
    AugValidate(usize),
    ClsTrain(usize),
    ClsValidate(usize),
    Done,
}

impl TrainingPhase {
    pub fn next(self, plan: &EpochPlan) -> Self {
        match self {
            TrainingPhase::Init => plan.augmenter_start(),
            TrainingPhase::AugTrain(epoch) => TrainingPhase::AugValidate(epoch),
            TrainingPhase::AugValidate(epoch) if epoch < plan.aug_last => {
                TrainingPhase::AugTrain(epoch + 1)
            }
            TrainingPhase::AugValidate(_) => plan.classifier_start(),
            TrainingPhase::ClsTrain(epoch) => TrainingPhase::ClsValidate(epoch),
            TrainingPhase::ClsValidate(epoch) if epoch < plan.cls_last => {
                TrainingPhase::ClsTrain(epoch + 1)
            }
            TrainingPhase::ClsValidate(_) | TrainingPhase::Done => TrainingPhase::Done,
        }
    }

    pub fn is_augmenter(&self) -> bool {
        matches!(self, TrainingPhase::AugTrain(_) | TrainingPhase::AugValidate(_))
    }

    pub fn is_classifier(&self) -> bool {
        matches!(self, TrainingPhase::ClsTrain(_) | TrainingPhase::ClsValidate(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    NotImproved,
}

/// Best validation loss seen so far and the epoch it was reached at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
}

impl TrainingProgress {
    /// Non-finite losses never count as an improvement.
    pub fn observe(self, epoch: usize, loss: f64) -> (Self, Verdict) {
        let improved = loss.is_finite() && self.best_loss.map_or(true, |best| loss < best);
        if improved {
            let progress = Self {
                best_epoch: Some(epoch),
                best_loss: Some(loss),
            };
            (progress, Verdict::Improved)
        } else {
            (self, Verdict::NotImproved)
        }
    }
}
