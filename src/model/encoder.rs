// Latent encoder: a transformer encoder over token + position (+ segment) embeddings
// produces the per-token representation, and a stack of GRUs run over the
// position-augmented sequence pools it into one latent vector per example.

use super::position::add_positions;
use burn::{
    config::Config,
    module::Module,
    nn::{
        gru::{Gru, GruConfig},
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        Embedding, EmbeddingConfig,
    },
    tensor::{backend::Backend, Bool, Device, Int, Tensor},
};

#[derive(Config)]
pub struct LatentEncoderConfig {
    pub transformer: TransformerEncoderConfig,
    pub vocab_size: usize,
    pub max_seq_length: usize,
    #[config(default = 3)]
    pub n_latent_layers: usize,
    #[config(default = 2)]
    pub n_segments: usize,
}

impl LatentEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LatentEncoder<B> {
        let d_model = self.transformer.d_model;
        let latent_rnn = (0..self.n_latent_layers)
            .map(|_| GruConfig::new(d_model, d_model, true).init(device))
            .collect();

        LatentEncoder {
            transformer: self.transformer.init(device),
            embedding_token: EmbeddingConfig::new(self.vocab_size, d_model).init(device),
            embedding_pos: EmbeddingConfig::new(self.max_seq_length, d_model).init(device),
            embedding_segment: EmbeddingConfig::new(self.n_segments, d_model).init(device),
            latent_rnn,
        }
    }
}

#[derive(Module, Debug)]
pub struct LatentEncoder<B: Backend> {
    transformer: TransformerEncoder<B>,
    embedding_token: Embedding<B>,
    embedding_pos: Embedding<B>,
    embedding_segment: Embedding<B>,
    latent_rnn: Vec<Gru<B>>,
}

impl<B: Backend> LatentEncoder<B> {
    /// `[batch, length]` ids to `[batch, length, d_model]`. Callers truncate to
    /// `max_seq_length` beforehand.
    pub fn encode(
        &self,
        input_ids: Tensor<B, 2, Int>,
        mask_pad: Tensor<B, 2, Bool>,
        segment_ids: Option<Tensor<B, 2, Int>>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_length] = input_ids.dims();
        let device = input_ids.device();

        let embedding =
            self.prepare_embeddings(input_ids, segment_ids, seq_length, batch_size, &device);
        self.transformer
            .forward(TransformerEncoderInput::new(embedding).mask_pad(mask_pad))
    }

    /// Pools the encoder output into `[batch, d_model]`: sinusoidal positions are
    /// added, the GRU stack runs over the sequence and its outputs are summed.
    pub fn latent_encode(&self, encoder_out: Tensor<B, 3>) -> Tensor<B, 2> {
        let mut hidden = add_positions(encoder_out);
        for gru in &self.latent_rnn {
            hidden = gru.forward(hidden, None);
        }
        hidden.sum_dim(1).squeeze(1)
    }

    fn prepare_embeddings(
        &self,
        tokens: Tensor<B, 2, Int>,
        segment_ids: Option<Tensor<B, 2, Int>>,
        seq_length: usize,
        batch_size: usize,
        device: &Device<B>,
    ) -> Tensor<B, 3> {
        let index_positions = Tensor::arange(0..seq_length as i64, device)
            .reshape([1, seq_length])
            .repeat(0, batch_size);
        let embedding_positions = self.embedding_pos.forward(index_positions);
        let embedding_tokens = self.embedding_token.forward(tokens);
        let embedding = (embedding_positions + embedding_tokens) / 2;

        match segment_ids {
            Some(segments) => embedding + self.embedding_segment.forward(segments),
            None => embedding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn encoder() -> LatentEncoder<TestBackend> {
        LatentEncoderConfig::new(TransformerEncoderConfig::new(8, 16, 2, 1), 12, 6)
            .with_n_latent_layers(2)
            .init(&Default::default())
    }

    #[test]
    fn latent_vector_has_one_row_per_example() {
        let device = Default::default();
        let encoder = encoder();
        let ids = Tensor::<TestBackend, 1, Int>::arange(0..12, &device).reshape([2, 6]);
        let mask = ids.clone().equal_elem(0);

        let encoder_out = encoder.encode(ids, mask, None);
        assert_eq!(encoder_out.dims(), [2, 6, 8]);
        assert_eq!(encoder.latent_encode(encoder_out).dims(), [2, 8]);
    }
}
