// Two batchers feed the models. `TokenBatcher` turns pre-tokenized store items into
// training batches (ids, pad mask, optional segments and labels).
// `TextBatcher` tokenizes raw strings, which the augmentation engine needs to score
// the text it just generated and which `predict` uses for free text.

use super::{dataset::TokenItem, tokenizer::Tokenizer};
use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Bool, Data, Int, Shape, Tensor},
};
use derive_new::new;
use std::sync::Arc;

/// Batcher for pre-tokenized items.
#[derive(new, Clone)]
pub struct TokenBatcher<B: Backend> {
    device: B::Device,
}

/// A batch of fixed-length token sequences with their labels.
#[derive(Debug, Clone, new)]
pub struct TokenBatch<B: Backend> {
    pub input_ids: Tensor<B, 2, Int>,
    /// `true` on padding positions.
    pub mask_pad: Tensor<B, 2, Bool>,
    pub segment_ids: Option<Tensor<B, 2, Int>>,
    pub labels: Tensor<B, 1, Int>,
}

/// Batcher for raw text.
#[derive(new)]
pub struct TextBatcher<B: Backend> {
    tokenizer: Arc<dyn Tokenizer>,
    device: B::Device,
    max_seq_length: usize,
}

#[derive(Debug, Clone, new)]
pub struct TextBatch<B: Backend> {
    pub input_ids: Tensor<B, 2, Int>,
    pub mask_pad: Tensor<B, 2, Bool>,
}

impl<B: Backend> Batcher<TokenItem, TokenBatch<B>> for TokenBatcher<B> {
    fn batch(&self, items: Vec<TokenItem>) -> TokenBatch<B> {
        let batch_size = items.len();
        let seq_length = items.first().map_or(0, |item| item.input_ids.len());

        let mut ids = Vec::with_capacity(batch_size * seq_length);
        let mut pads = Vec::with_capacity(batch_size * seq_length);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items.iter() {
            ids.extend(item.input_ids.iter().map(|id| *id as i64));
            pads.extend(item.attention_mask.iter().map(|m| *m == 0));
            labels.push(item.label as i64);
        }

        // Segments are only used when every item in the batch carries them.
        let segment_ids = items
            .iter()
            .map(|item| item.segment_ids.as_ref())
            .collect::<Option<Vec<_>>>()
            .map(|segments| {
                let flat = segments
                    .into_iter()
                    .flat_map(|s| s.iter().map(|id| *id as i64))
                    .collect::<Vec<_>>();
                Tensor::from_data(
                    Data::new(flat, Shape::new([batch_size, seq_length])).convert::<B::IntElem>(),
                    &self.device,
                )
            });

        TokenBatch {
            input_ids: Tensor::from_data(
                Data::new(ids, Shape::new([batch_size, seq_length])).convert::<B::IntElem>(),
                &self.device,
            ),
            mask_pad: Tensor::from_data(
                Data::new(pads, Shape::new([batch_size, seq_length])),
                &self.device,
            ),
            segment_ids,
            labels: Tensor::from_data(
                Data::new(labels, Shape::new([batch_size])).convert::<B::IntElem>(),
                &self.device,
            ),
        }
    }
}

impl<B: Backend> Batcher<String, TextBatch<B>> for TextBatcher<B> {
    fn batch(&self, items: Vec<String>) -> TextBatch<B> {
        let batch_size = items.len();
        let seq_length = self.max_seq_length;
        let pad = self.tokenizer.pad_token();

        let mut ids = Vec::with_capacity(batch_size * seq_length);
        let mut pads = Vec::with_capacity(batch_size * seq_length);

        // Every row is padded to `max_seq_length`, like the rows of the store, so a
        // text scores the same whatever else shares its batch.
        for item in items.iter() {
            let mut tokens = self.tokenizer.encode(item);
            if tokens.len() > seq_length {
                tokens.truncate(seq_length);
                if let Some(last) = tokens.last_mut() {
                    *last = self.tokenizer.end_token();
                }
            }
            let length = tokens.len();

            ids.extend(tokens.into_iter().map(|id| id as i64));
            ids.extend(std::iter::repeat(pad as i64).take(seq_length - length));
            pads.extend((0..seq_length).map(|position| position >= length));
        }

        TextBatch {
            input_ids: Tensor::from_data(
                Data::new(ids, Shape::new([batch_size, seq_length])).convert::<B::IntElem>(),
                &self.device,
            ),
            mask_pad: Tensor::from_data(
                Data::new(pads, Shape::new([batch_size, seq_length])),
                &self.device,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_processing::tokenizer::tests::toy_tokenizer;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn token_batch_carries_masks_and_labels() {
        let batcher = TokenBatcher::<TestBackend>::new(Default::default());
        let items = vec![
            TokenItem::new(vec![1, 4, 2, 0], vec![1, 1, 1, 0], None, 2),
            TokenItem::new(vec![1, 5, 6, 2], vec![1, 1, 1, 1], None, 0),
        ];
        let batch = batcher.batch(items);

        assert_eq!(batch.input_ids.dims(), [2, 4]);
        assert!(batch.segment_ids.is_none());
        assert_eq!(
            batch.mask_pad.into_data().value,
            vec![false, false, false, true, false, false, false, false]
        );
        assert_eq!(batch.labels.into_data().convert::<i64>().value, vec![2, 0]);
    }

    #[test]
    fn segments_require_every_item() {
        let batcher = TokenBatcher::<TestBackend>::new(Default::default());
        let with = TokenItem::new(vec![1, 2], vec![1, 1], Some(vec![0, 0]), 0);
        let without = TokenItem::new(vec![1, 2], vec![1, 1], None, 1);

        assert!(batcher.batch(vec![with.clone(), with.clone()]).segment_ids.is_some());
        assert!(batcher.batch(vec![with, without]).segment_ids.is_none());
    }

    #[test]
    fn text_rows_are_padded_to_max_seq_length() {
        let batcher =
            TextBatcher::<TestBackend>::new(Arc::new(toy_tokenizer(4)), Default::default(), 6);
        let batch = batcher.batch(vec!["w0 w1 w2".to_string(), "w3".to_string()]);

        assert_eq!(batch.input_ids.dims(), [2, 6]);
        assert_eq!(
            batch.input_ids.into_data().convert::<i64>().value,
            vec![1, 4, 5, 6, 2, 0, 1, 7, 2, 0, 0, 0]
        );
        let pads = batch.mask_pad.into_data().value;
        assert_eq!(&pads[..6], &[false, false, false, false, false, true]);
        assert_eq!(&pads[6..], &[false, false, false, true, true, true]);
    }

    #[test]
    fn long_text_is_truncated_but_keeps_its_end_token() {
        let batcher =
            TextBatcher::<TestBackend>::new(Arc::new(toy_tokenizer(4)), Default::default(), 4);
        let batch = batcher.batch(vec!["w0 w1 w2 w3".to_string()]);

        assert_eq!(batch.input_ids.into_data().convert::<i64>().value, vec![1, 4, 5, 2]);
        assert!(batch.mask_pad.into_data().value.iter().all(|pad| !pad));
    }
}
