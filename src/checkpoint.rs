// Checkpoints of the two training phases. Each phase owns one slot directory holding
// the model, optimizer and learning-rate scheduler records and a small JSON state
// file. A slot is written in a scratch directory first and then renamed into place,
// so a slot that exists is always complete.

use crate::{
    error::{AugError, Result},
    training::TrainingProgress,
};
use burn::{
    lr_scheduler::LrScheduler,
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Full precision keeps a save/load round trip bit exact.
pub type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    Augmenter,
    Classifier,
}

impl CheckpointSlot {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointSlot::Augmenter => "augmenter",
            CheckpointSlot::Classifier => "classifier",
        }
    }
}

/// Epoch and best validation result of a saved phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub epoch: usize,
    pub progress: TrainingProgress,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    recorder: CheckpointRecorder,
}

impl CheckpointManager {
    const MODEL: &'static str = "model";
    const OPTIMIZER: &'static str = "optimizer";
    const SCHEDULER: &'static str = "scheduler";
    const STATE: &'static str = "state.json";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recorder: CheckpointRecorder::new(),
        }
    }

    pub fn slot_dir(&self, slot: CheckpointSlot) -> PathBuf {
        self.root.join(slot.name())
    }

    pub fn exists(&self, slot: CheckpointSlot) -> bool {
        self.slot_dir(slot).join(Self::STATE).is_file()
    }

    /// Replaces the content of `slot` with the given model, optimizer, scheduler and state.
    pub fn save<B, M, O, S>(
        &self,
        slot: CheckpointSlot,
        model: &M,
        optim: &O,
        scheduler: &S,
        state: &CheckpointState,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
        S: LrScheduler<B>,
    {
        let target = self.slot_dir(slot);
        let scratch = self.root.join(format!(".{}.partial", slot.name()));
        let retired = self.root.join(format!(".{}.old", slot.name()));

        remove_dir_if_exists(&scratch)?;
        fs::create_dir_all(&scratch).map_err(|err| AugError::resource(&scratch, err))?;

        Recorder::<B>::record(
            &self.recorder,
            model.clone().into_record(),
            scratch.join(Self::MODEL),
        )
        .map_err(|err| AugError::resource(scratch.join(Self::MODEL), format!("{err:?}")))?;
        Recorder::<B>::record(&self.recorder, optim.to_record(), scratch.join(Self::OPTIMIZER))
            .map_err(|err| {
                AugError::resource(scratch.join(Self::OPTIMIZER), format!("{err:?}"))
            })?;
        Recorder::<B>::record(
            &self.recorder,
            scheduler.to_record(),
            scratch.join(Self::SCHEDULER),
        )
        .map_err(|err| AugError::resource(scratch.join(Self::SCHEDULER), format!("{err:?}")))?;
        let state_path = scratch.join(Self::STATE);
        fs::write(&state_path, serde_json::to_vec_pretty(state)?)
            .map_err(|err| AugError::resource(&state_path, err))?;

        remove_dir_if_exists(&retired)?;
        if target.exists() {
            fs::rename(&target, &retired).map_err(|err| AugError::resource(&target, err))?;
        }
        fs::rename(&scratch, &target).map_err(|err| AugError::resource(&target, err))?;
        remove_dir_if_exists(&retired)
    }

    pub fn load_state(&self, slot: CheckpointSlot) -> Result<CheckpointState> {
        let path = self.slot_dir(slot).join(Self::STATE);
        let raw = fs::read(&path).map_err(|err| AugError::resource(&path, err))?;
        serde_json::from_slice(&raw).map_err(|err| AugError::resource(&path, err))
    }

    /// Loads the slot's weights into `model`. Works for any backend, so a record saved
    /// during training can be loaded on the inner backend for inference.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        slot: CheckpointSlot,
        model: M,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.slot_dir(slot).join(Self::MODEL);
        let record = Recorder::<B>::load(&self.recorder, path.clone(), device)
            .map_err(|err| AugError::resource(path, format!("{err:?}")))?;
        Ok(model.load_record(record))
    }

    pub fn load_optimizer<B, M, O>(
        &self,
        slot: CheckpointSlot,
        optim: O,
        device: &B::Device,
    ) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = self.slot_dir(slot).join(Self::OPTIMIZER);
        let record = Recorder::<B>::load(&self.recorder, path.clone(), device)
            .map_err(|err| AugError::resource(path, format!("{err:?}")))?;
        Ok(optim.load_record(record))
    }

    /// Moves a freshly built `scheduler` to the step saved in the slot.
    pub fn load_scheduler<B: Backend, S: LrScheduler<B>>(
        &self,
        slot: CheckpointSlot,
        scheduler: S,
        device: &B::Device,
    ) -> Result<S> {
        let path = self.slot_dir(slot).join(Self::SCHEDULER);
        let record = Recorder::<B>::load(&self.recorder, path.clone(), device)
            .map_err(|err| AugError::resource(path, format!("{err:?}")))?;
        Ok(scheduler.load_record(record))
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|err| AugError::resource(path, err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OptimizerSettings,
        model::{LatentClassifier, LatentClassifierConfig},
        optim::{OptimizerVisitor, PhaseLrScheduler},
    };
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::Tensor,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    struct SaveTwice<'a> {
        manager: &'a CheckpointManager,
        model: LatentClassifier<TestBackend>,
    }

    impl OptimizerVisitor<TestBackend, LatentClassifier<TestBackend>> for SaveTwice<'_> {
        type Output = Result<()>;

        fn visit<O: Optimizer<LatentClassifier<TestBackend>, TestBackend>>(
            self,
            optim: O,
        ) -> Self::Output {
            let scheduler = PhaseLrScheduler::new(&OptimizerSettings::new(), 2, 2, 8);
            for epoch in [1, 2] {
                let state = CheckpointState {
                    epoch,
                    progress: TrainingProgress::default(),
                };
                self.manager.save(
                    CheckpointSlot::Classifier,
                    &self.model,
                    &optim,
                    &scheduler,
                    &state,
                )?;
            }
            Ok(())
        }
    }

    #[test]
    fn slot_is_replaced_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let device = Default::default();
        let config = LatentClassifierConfig::new(8, 2).with_dropout(0.0);
        let model = config.init::<TestBackend>(&device);

        assert!(!manager.exists(CheckpointSlot::Classifier));
        OptimizerSettings::new()
            .visit::<TestBackend, LatentClassifier<TestBackend>, _>(SaveTwice {
                manager: &manager,
                model: model.clone(),
            })
            .unwrap();

        assert!(manager.exists(CheckpointSlot::Classifier));
        assert!(!dir.path().join(".classifier.partial").exists());
        assert_eq!(manager.load_state(CheckpointSlot::Classifier).unwrap().epoch, 2);

        let restored = manager
            .load_model(
                CheckpointSlot::Classifier,
                config.init::<NdArray<f32>>(&device),
                &device,
            )
            .unwrap();
        let input = Tensor::<TestBackend, 3>::ones([1, 2, 8], &device);
        let expected = model.valid().forward(input.clone().inner()).into_data();
        assert_eq!(restored.forward(input.inner()).into_data(), expected);
    }

    #[test]
    fn missing_slot_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        assert!(matches!(
            manager.load_state(CheckpointSlot::Augmenter),
            Err(AugError::Resource { .. })
        ));
    }
}
