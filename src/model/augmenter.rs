// The augmenter is the encoder/decoder pair trained for reconstruction. The hidden
// state that links them is a weighted mix of the per-token encoder output and the
// pooled latent vector, and is also what the classifier reads and what the
// augmentation engine perturbs.

use super::{
    decoder::{ConditionalDecoder, ConditionalDecoderConfig},
    encoder::{LatentEncoder, LatentEncoderConfig},
};
use crate::{
    config::{ExperimentConfig, HiddenMix},
    data_processing::Tokenizer,
};
use burn::{
    config::Config,
    module::Module,
    nn::transformer::{TransformerDecoderConfig, TransformerEncoderConfig},
    tensor::{backend::Backend, Bool, Int, Tensor},
};

#[derive(Config)]
pub struct AugmenterModelConfig {
    pub encoder: LatentEncoderConfig,
    pub decoder: ConditionalDecoderConfig,
}

impl AugmenterModelConfig {
    pub fn from_experiment(config: &ExperimentConfig, tokenizer: &dyn Tokenizer) -> Self {
        let vocab_size = tokenizer.vocab_size();
        let encoder = LatentEncoderConfig::new(
            TransformerEncoderConfig::new(
                config.d_model,
                config.d_ff,
                config.n_heads,
                config.n_encoder_layers,
            )
            .with_dropout(config.dropout)
            .with_norm_first(true)
            .with_quiet_softmax(true),
            vocab_size,
            config.max_seq_length,
        )
        .with_n_latent_layers(config.n_latent_layers);

        let decoder = ConditionalDecoderConfig::new(
            TransformerDecoderConfig::new(
                config.d_model,
                config.d_ff,
                config.n_heads,
                config.n_decoder_layers,
            )
            .with_dropout(config.dropout)
            .with_norm_first(true)
            .with_quiet_softmax(true),
            vocab_size,
            tokenizer.pad_token(),
            tokenizer.start_token(),
            tokenizer.end_token(),
        )
        .with_dropout(config.dropout);

        Self::new(encoder, decoder)
    }

    /// Same architecture with every dropout disabled. Used for frozen copies that live
    /// on an autodiff backend, where dropout would otherwise stay active.
    pub fn without_dropout(&self) -> Self {
        let mut config = self.clone();
        config.encoder.transformer.dropout = 0.0;
        config.decoder.transformer.dropout = 0.0;
        config.decoder.dropout = 0.0;
        config
    }

    pub fn vocab_size(&self) -> usize {
        self.decoder.vocab_size
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> AugmenterModel<B> {
        AugmenterModel {
            encoder: self.encoder.init(device),
            decoder: self.decoder.init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct AugmenterModel<B: Backend> {
    pub encoder: LatentEncoder<B>,
    pub decoder: ConditionalDecoder<B>,
}

/// Everything a reconstruction pass produces.
#[derive(Debug, Clone)]
pub struct AugmenterOutput<B: Backend> {
    pub hidden: Tensor<B, 3>,
    pub latent: Tensor<B, 2>,
    pub logits: Tensor<B, 3>,
}

impl<B: Backend> AugmenterModel<B> {
    /// Encodes a batch into the mixed hidden state, also returning the latent vector.
    pub fn encode_hidden(
        &self,
        input_ids: Tensor<B, 2, Int>,
        mask_pad: Tensor<B, 2, Bool>,
        segment_ids: Option<Tensor<B, 2, Int>>,
        mix: HiddenMix,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let encoder_out = self.encoder.encode(input_ids, mask_pad, segment_ids);
        let latent = self.encoder.latent_encode(encoder_out.clone());
        (compose_hidden(encoder_out, latent.clone(), mix), latent)
    }

    /// Encode, mix and reconstruct the source with teacher forcing.
    pub fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        mask_pad: Tensor<B, 2, Bool>,
        segment_ids: Option<Tensor<B, 2, Int>>,
        mix: HiddenMix,
    ) -> AugmenterOutput<B> {
        let (hidden, latent) =
            self.encode_hidden(input_ids.clone(), mask_pad.clone(), segment_ids, mix);
        let logits = self.decoder.forward(input_ids, mask_pad, hidden.clone());
        AugmenterOutput {
            hidden,
            latent,
            logits,
        }
    }
}

/// `r_e * encoder_out + r_l * latent`, with the latent broadcast over the sequence.
///
/// A zero weight drops its term from the graph. Without the encoder term the result
/// has a memory axis of length one.
pub fn compose_hidden<B: Backend>(
    encoder_out: Tensor<B, 3>,
    latent: Tensor<B, 2>,
    mix: HiddenMix,
) -> Tensor<B, 3> {
    let [_, seq_length, _] = encoder_out.dims();
    let latent = latent.unsqueeze_dim::<3>(1);

    match (mix.uses_encoder(), mix.uses_latent()) {
        (true, true) => {
            encoder_out.mul_scalar(mix.encoder())
                + latent.repeat(1, seq_length).mul_scalar(mix.latent())
        }
        (true, false) => encoder_out.mul_scalar(mix.encoder()),
        (false, _) => latent.mul_scalar(mix.latent()),
    }
}

/// Moves the hidden state against the classifier gradient: `hidden - epsilon * grad`.
pub fn perturb_hidden<B: Backend>(
    hidden: Tensor<B, 3>,
    grad: Tensor<B, 3>,
    epsilon: f64,
) -> Tensor<B, 3> {
    hidden - grad.mul_scalar(epsilon)
}
