// The preprocessed store is produced by an external tokenization step. Each split
// holds parallel arrays of fixed-length token ids, attention masks, optional segment
// ids and integer labels; word2id.json carries the vocabulary and the label count.
// Everything is checked once on load so that batching never has to.

use crate::error::{AugError, Result};
use burn::data::dataset::{Dataset, InMemDataset};
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path};

/// One pre-tokenized example.
#[derive(new, Clone, Debug, PartialEq)]
pub struct TokenItem {
    pub input_ids: Vec<usize>,
    pub attention_mask: Vec<u8>,
    pub segment_ids: Option<Vec<usize>>,
    pub label: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetSplit {
    Train,
    Valid,
    Test,
}

impl DatasetSplit {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetSplit::Train => "train",
            DatasetSplit::Valid => "valid",
            DatasetSplit::Test => "test",
        }
    }
}

/// Parallel arrays of one split, as written by the preprocessing step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitArrays {
    pub src_input_ids: Vec<Vec<usize>>,
    pub src_attention_mask: Vec<Vec<u8>>,
    #[serde(default)]
    pub src_token_type_ids: Option<Vec<Vec<usize>>>,
    pub label: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vocabulary {
    pub src_word2id: HashMap<String, usize>,
    pub num_labels: usize,
}

pub struct TokenDataset {
    dataset: InMemDataset<TokenItem>,
}

impl TokenDataset {
    pub fn new(items: Vec<TokenItem>) -> Self {
        Self {
            dataset: InMemDataset::new(items),
        }
    }
}

impl Dataset<TokenItem> for TokenDataset {
    fn get(&self, index: usize) -> Option<TokenItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

/// Consumer side of the preprocessed data store.
#[derive(Debug)]
pub struct PreprocessedStore {
    splits: HashMap<String, SplitArrays>,
    vocabulary: Vocabulary,
}

impl PreprocessedStore {
    pub const DATA_FILE: &'static str = "processed.json";
    pub const VOCAB_FILE: &'static str = "word2id.json";

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let splits = read_json(&dir.join(Self::DATA_FILE))?;
        let vocabulary = read_json(&dir.join(Self::VOCAB_FILE))?;
        Ok(Self::new(splits, vocabulary))
    }

    /// Reads only word2id.json, for consumers that never touch the splits.
    pub fn open_vocabulary(dir: impl AsRef<Path>) -> Result<Vocabulary> {
        read_json(&dir.as_ref().join(Self::VOCAB_FILE))
    }

    pub fn new(splits: HashMap<String, SplitArrays>, vocabulary: Vocabulary) -> Self {
        Self { splits, vocabulary }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn num_labels(&self) -> usize {
        self.vocabulary.num_labels
    }

    pub fn split_len(&self, split: DatasetSplit) -> usize {
        self.splits
            .get(split.name())
            .map_or(0, |arrays| arrays.src_input_ids.len())
    }

    /// The store's own vocabulary, when it ships one, must match the tokenizer's.
    pub fn check_vocabulary(&self, vocab_size: usize) -> Result<()> {
        let store_size = self.vocabulary.src_word2id.len();
        if store_size != 0 && store_size != vocab_size {
            return Err(AugError::shape(format!(
                "the store vocabulary has {store_size} entries but the tokenizer has {vocab_size}"
            )));
        }
        Ok(())
    }

    /// Builds a dataset for `split`, rejecting rows that do not have exactly
    /// `max_seq_length` positions or reference ids outside the vocabulary.
    pub fn dataset(
        &self,
        split: DatasetSplit,
        max_seq_length: usize,
        vocab_size: usize,
    ) -> Result<TokenDataset> {
        let arrays = self.splits.get(split.name()).ok_or_else(|| {
            AugError::shape(format!("the store has no '{}' split", split.name()))
        })?;
        let n = arrays.src_input_ids.len();
        let segments_len = arrays.src_token_type_ids.as_ref().map_or(n, Vec::len);
        if arrays.src_attention_mask.len() != n || arrays.label.len() != n || segments_len != n {
            return Err(AugError::shape(format!(
                "'{}' split arrays have different lengths",
                split.name()
            )));
        }

        let mut items = Vec::with_capacity(n);
        for i in 0..n {
            let input_ids = &arrays.src_input_ids[i];
            let attention_mask = &arrays.src_attention_mask[i];
            let segment_ids = arrays.src_token_type_ids.as_ref().map(|s| s[i].clone());

            let row_lengths_ok = input_ids.len() == max_seq_length
                && attention_mask.len() == max_seq_length
                && segment_ids.as_ref().map_or(true, |s| s.len() == max_seq_length);
            if !row_lengths_ok {
                return Err(AugError::shape(format!(
                    "'{}' row {i} is not padded to max_seq_length {max_seq_length}",
                    split.name()
                )));
            }
            if let Some(id) = input_ids.iter().find(|id| **id >= vocab_size) {
                return Err(AugError::shape(format!(
                    "'{}' row {i} has token id {id} outside a vocabulary of {vocab_size}",
                    split.name()
                )));
            }
            if arrays.label[i] >= self.num_labels() {
                return Err(AugError::shape(format!(
                    "'{}' row {i} has label {} but the store declares {} labels",
                    split.name(),
                    arrays.label[i],
                    self.num_labels()
                )));
            }

            items.push(TokenItem::new(
                input_ids.clone(),
                attention_mask.clone(),
                segment_ids,
                arrays.label[i],
            ));
        }

        Ok(TokenDataset::new(items))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|err| AugError::resource(path, err))?;
    serde_json::from_str(&raw).map_err(|err| AugError::resource(path, err))
}
