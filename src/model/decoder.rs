// Conditional decoder: reconstructs the source sentence from the hidden state with
// teacher forcing during training, and generates new sentences from (possibly
// perturbed) hidden states during augmentation.

use super::{
    generation::{GenerationState, TokenSampler},
    position::add_positions,
};
use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::generate_autoregressive_mask,
        transformer::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderInput},
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
        LinearConfig,
    },
    tensor::{activation::gelu, backend::Backend, Bool, Data, Int, Shape, Tensor},
};

#[derive(Config)]
pub struct ConditionalDecoderConfig {
    pub transformer: TransformerDecoderConfig,
    pub vocab_size: usize,
    pub pad_token: usize,
    pub start_token: usize,
    pub end_token: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl ConditionalDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConditionalDecoder<B> {
        let d_model = self.transformer.d_model;
        ConditionalDecoder {
            transformer: self.transformer.init(device),
            embedding_token: EmbeddingConfig::new(self.vocab_size, d_model).init(device),
            projection: LinearConfig::new(d_model, d_model / 2).init(device),
            norm: LayerNormConfig::new(d_model / 2)
                .with_epsilon(1e-12)
                .init(device),
            output: LinearConfig::new(d_model / 2, self.vocab_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            pad_token: self.pad_token,
            start_token: self.start_token,
            end_token: self.end_token,
        }
    }
}

#[derive(Module, Debug)]
pub struct ConditionalDecoder<B: Backend> {
    transformer: TransformerDecoder<B>,
    embedding_token: Embedding<B>,
    projection: Linear<B>,
    norm: LayerNorm<B>,
    output: Linear<B>,
    dropout: Dropout,
    pad_token: usize,
    start_token: usize,
    end_token: usize,
}

/// Prepends `start_token` and drops the last column, keeping the length unchanged.
pub fn shift_tokens_right<B: Backend>(
    input_ids: Tensor<B, 2, Int>,
    start_token: usize,
) -> Tensor<B, 2, Int> {
    let [batch_size, seq_length] = input_ids.dims();
    let start = Tensor::full([batch_size, 1], start_token as i64, &input_ids.device());
    if seq_length <= 1 {
        return start;
    }
    Tensor::cat(
        vec![start, input_ids.slice([0..batch_size, 0..seq_length - 1])],
        1,
    )
}

impl<B: Backend> ConditionalDecoder<B> {
    /// Teacher-forced reconstruction of `input_ids`, returns `[batch, length, vocab]` logits.
    pub fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        mask_pad: Tensor<B, 2, Bool>,
        hidden: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let decoder_input = shift_tokens_right(input_ids, self.start_token);
        self.decode(decoder_input, mask_pad, hidden)
    }

    /// Autoregressive generation conditioned on `hidden`.
    ///
    /// Every row starts from the shifted first source token and stops growing once it
    /// emits the end token. The result always has exactly `max_length` columns, with
    /// padding after the end token.
    pub fn generate(
        &self,
        src_ids: Tensor<B, 2, Int>,
        src_mask: Tensor<B, 2, Bool>,
        hidden: Tensor<B, 3>,
        max_length: usize,
        sampler: &mut TokenSampler,
    ) -> Tensor<B, 2, Int> {
        let [batch_size, _] = src_ids.dims();
        let device = hidden.device();

        let first_tokens = shift_tokens_right(src_ids, self.start_token)
            .slice([0..batch_size, 0..1])
            .into_data()
            .convert::<i64>()
            .value
            .into_iter()
            .map(|t| t as usize)
            .collect();
        let mut state = GenerationState::new(first_tokens, self.end_token, self.pad_token);

        for _ in 0..max_length {
            let (flat, length) = state.decoder_input();
            let decoder_input = Tensor::from_data(
                Data::new(flat, Shape::new([batch_size, length])).convert::<B::IntElem>(),
                &device,
            );
            let logits = self.decode(decoder_input, src_mask.clone(), hidden.clone());
            let [_, _, vocab_size] = logits.dims();
            let last = logits
                .slice([0..batch_size, length - 1..length, 0..vocab_size])
                .into_data()
                .convert::<f32>()
                .value;

            let picked = last
                .chunks(vocab_size)
                .map(|row| sampler.pick(row))
                .collect::<Vec<_>>();
            state.advance(&picked);
            if state.is_done() {
                break;
            }
        }

        Tensor::from_data(
            Data::new(
                state
                    .into_padded(max_length)
                    .into_iter()
                    .map(|t| t as i64)
                    .collect(),
                Shape::new([batch_size, max_length]),
            )
            .convert::<B::IntElem>(),
            &device,
        )
    }

    pub fn pad_token(&self) -> usize {
        self.pad_token
    }

    fn decode(
        &self,
        decoder_input: Tensor<B, 2, Int>,
        src_mask: Tensor<B, 2, Bool>,
        hidden: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_length] = decoder_input.dims();
        let device = decoder_input.device();
        let [_, memory_length, _] = hidden.dims();
        let [_, src_length] = src_mask.dims();

        let target = add_positions(self.embedding_token.forward(decoder_input));
        let causal = generate_autoregressive_mask::<B>(batch_size, seq_length, &device);
        let mut input = TransformerDecoderInput::new(target, hidden).target_mask_attn(causal);
        // A pooled latent memory has a single position and nothing to mask.
        if memory_length == src_length {
            input = input.memory_mask_pad(src_mask);
        }

        let decoded = self.transformer.forward(input);
        self.output_head(decoded)
    }

    fn output_head(&self, decoded: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = gelu(self.projection.forward(decoded));
        let x = self.norm.forward(self.dropout.forward(x));
        self.output.forward(x)
    }
}
