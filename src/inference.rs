// Loads a trained experiment back from its checkpoint directory and classifies text
// with the augmenter's encoder followed by the latent classifier.

use crate::{
    checkpoint::{CheckpointManager, CheckpointSlot},
    config::{ExperimentConfig, ExperimentPaths, HiddenMix},
    data_processing::{load_tokenizer, PreprocessedStore, TextBatcher, Tokenizer},
    error::{AugError, Result},
    model::{AugmenterModel, AugmenterModelConfig, LatentClassifier, LatentClassifierConfig},
};
use burn::{
    config::Config,
    data::dataloader::batcher::Batcher,
    tensor::{activation::softmax, backend::Backend, Bool, Int, Tensor},
};
use std::sync::Arc;
use tracing::info;

/// Configuration, tokenizer and checkpoints of a finished training run.
pub struct TrainedArtifacts {
    pub config: ExperimentConfig,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub num_labels: usize,
    model_config: AugmenterModelConfig,
    classifier_config: LatentClassifierConfig,
    checkpoints: CheckpointManager,
}

impl TrainedArtifacts {
    pub fn open(paths: &ExperimentPaths) -> Result<Self> {
        let config_file = paths.config_file();
        let config = ExperimentConfig::load(&config_file)
            .map_err(|err| AugError::resource(&config_file, format!("{err:?}")))?;
        config.validate()?;

        let vocabulary = PreprocessedStore::open_vocabulary(paths.store_dir())?;
        let tokenizer = load_tokenizer(&config.tokenizer, &vocabulary)?;
        let model_config =
            AugmenterModelConfig::from_experiment(&config, tokenizer.as_ref()).without_dropout();
        let classifier_config =
            LatentClassifierConfig::new(config.d_model, vocabulary.num_labels).with_dropout(0.0);

        Ok(Self {
            num_labels: vocabulary.num_labels,
            config,
            tokenizer,
            model_config,
            classifier_config,
            checkpoints: CheckpointManager::new(paths.checkpoint_dir()),
        })
    }

    /// The best augmenter, with dropout disabled.
    pub fn augmenter<B: Backend>(&self, device: &B::Device) -> Result<AugmenterModel<B>> {
        self.checkpoints.load_model(
            CheckpointSlot::Augmenter,
            self.model_config.init::<B>(device),
            device,
        )
    }

    /// The best classifier, with dropout disabled.
    pub fn classifier<B: Backend>(&self, device: &B::Device) -> Result<LatentClassifier<B>> {
        self.checkpoints.load_model(
            CheckpointSlot::Classifier,
            self.classifier_config.init::<B>(device),
            device,
        )
    }
}

/// Label probabilities for token batches or raw text.
pub struct LatentScorer<B: Backend> {
    augmenter: AugmenterModel<B>,
    classifier: LatentClassifier<B>,
    batcher: TextBatcher<B>,
    mix: HiddenMix,
}

impl<B: Backend> LatentScorer<B> {
    pub fn new(
        augmenter: AugmenterModel<B>,
        classifier: LatentClassifier<B>,
        tokenizer: Arc<dyn Tokenizer>,
        device: B::Device,
        max_seq_length: usize,
        mix: HiddenMix,
    ) -> Self {
        Self {
            augmenter,
            classifier,
            batcher: TextBatcher::new(tokenizer, device, max_seq_length),
            mix,
        }
    }

    pub fn augmenter(&self) -> &AugmenterModel<B> {
        &self.augmenter
    }

    pub fn mix(&self) -> HiddenMix {
        self.mix
    }

    pub fn probabilities(
        &self,
        input_ids: Tensor<B, 2, Int>,
        mask_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 2> {
        let (hidden, _) = self
            .augmenter
            .encode_hidden(input_ids, mask_pad, None, self.mix);
        softmax(self.classifier.forward(hidden), 1)
    }

    /// Tokenizes, encodes and classifies every text, one probability row per text.
    pub fn score_texts(&self, texts: Vec<String>) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return vec![];
        }
        let batch = self.batcher.batch(texts);
        rows(self.probabilities(batch.input_ids, batch.mask_pad))
    }
}

/// Splits a `[rows, columns]` tensor into host vectors.
pub fn rows<B: Backend>(tensor: Tensor<B, 2>) -> Vec<Vec<f32>> {
    let [_, columns] = tensor.dims();
    tensor
        .into_data()
        .convert::<f32>()
        .value
        .chunks(columns.max(1))
        .map(<[f32]>::to_vec)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub text: String,
    pub probabilities: Vec<f32>,
    pub label: usize,
}

/// Classifies `samples` with the trained experiment under `paths`.
pub fn infer<B: Backend>(
    device: B::Device,
    paths: &ExperimentPaths,
    samples: Vec<String>,
) -> Result<Vec<Prediction>> {
    let artifacts = TrainedArtifacts::open(paths)?;

    info!("Loading weights ...");
    let scorer = LatentScorer::new(
        artifacts.augmenter::<B>(&device)?,
        artifacts.classifier::<B>(&device)?,
        artifacts.tokenizer.clone(),
        device,
        artifacts.config.max_seq_length,
        artifacts.config.mix()?,
    );

    info!("Running inference on {} samples ...", samples.len());
    let probabilities = scorer.score_texts(samples.clone());
    Ok(samples
        .into_iter()
        .zip(probabilities)
        .map(|(text, probabilities)| {
            let label = probabilities
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(label, _)| label);
            Prediction {
                text,
                probabilities,
                label,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_processing::{tokenizer::tests::toy_tokenizer, TokenBatcher, TokenItem};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn toy_scorer() -> LatentScorer<TestBackend> {
        let device = Default::default();
        let tokenizer = Arc::new(toy_tokenizer(6));
        let config = ExperimentConfig::new()
            .with_d_model(8)
            .with_d_ff(16)
            .with_n_heads(2)
            .with_n_encoder_layers(1)
            .with_n_decoder_layers(1)
            .with_n_latent_layers(1)
            .with_max_seq_length(8);
        let augmenter = AugmenterModelConfig::from_experiment(&config, tokenizer.as_ref())
            .without_dropout()
            .init::<TestBackend>(&device);
        let classifier = LatentClassifierConfig::new(8, 3)
            .with_dropout(0.0)
            .init::<TestBackend>(&device);
        LatentScorer::new(
            augmenter,
            classifier,
            tokenizer,
            device,
            8,
            HiddenMix::new(1.0, 1.0).unwrap(),
        )
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn scores_are_probability_rows() {
        let scorer = toy_scorer();

        let scores = scorer.score_texts(vec!["w0 w1".into(), "w5 w4 w3 w2 w1 w0".into()]);
        assert_eq!(scores.len(), 2);
        for row in scores {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert!(scorer.score_texts(vec![]).is_empty());
    }

    #[test]
    fn text_scores_do_not_depend_on_the_rest_of_the_batch() {
        let scorer = toy_scorer();

        let alone = scorer.score_texts(vec!["w0 w1".into()]);
        let together = scorer.score_texts(vec!["w0 w1".into(), "w5 w4 w3 w2 w1 w0".into()]);
        assert_close(&alone[0], &together[0]);

        // The same ids as a store row padded to max_seq_length.
        let row = TokenBatcher::<TestBackend>::new(Default::default()).batch(vec![
            TokenItem::new(vec![1, 4, 5, 2, 0, 0, 0, 0], vec![1, 1, 1, 1, 0, 0, 0, 0], None, 0),
        ]);
        let stored = rows(scorer.probabilities(row.input_ids, row.mask_pad));
        assert_close(&alone[0], &stored[0]);
    }

    #[test]
    fn missing_experiment_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ExperimentPaths::new(
            dir.path().into(),
            dir.path().into(),
            dir.path().into(),
            "toy".into(),
            "latent".into(),
        );
        assert!(matches!(
            TrainedArtifacts::open(&paths),
            Err(AugError::Resource { .. })
        ));
    }
}
