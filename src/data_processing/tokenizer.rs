// The Tokenizer trait is the boundary to whatever vocabulary the preprocessed store
// was built with. `PretrainedTokenizer` wraps a `tokenizers` model (hub name or a
// tokenizer.json file); `VocabTokenizer` is a whitespace word-level tokenizer over
// the store's own `src_word2id` mapping.

use super::dataset::Vocabulary;
use crate::error::{AugError, Result};
use std::{collections::HashMap, path::Path, sync::Arc};

/// Name of the tokenizer setting that selects the store's own vocabulary.
pub const STORE_TOKENIZER: &str = "store";

/// Resolves a tokenizer setting: `store`, a tokenizer.json path, or a hub name.
pub fn load_tokenizer(name: &str, vocabulary: &Vocabulary) -> Result<Arc<dyn Tokenizer>> {
    if name == STORE_TOKENIZER {
        return Ok(Arc::new(VocabTokenizer::new(vocabulary.src_word2id.clone())?));
    }
    if Path::new(name).is_file() {
        return Ok(Arc::new(PretrainedTokenizer::from_file(name)?));
    }
    Ok(Arc::new(PretrainedTokenizer::from_pretrained(name)?))
}

pub trait Tokenizer: Send + Sync {
    /// Converts a text string into a sequence of token ids, special tokens included.
    fn encode(&self, value: &str) -> Vec<usize>;

    /// Converts a sequence of token ids back into text, skipping special tokens.
    fn decode(&self, tokens: &[usize]) -> String;

    fn vocab_size(&self) -> usize;

    /// Token used to pad sequences to the same length.
    fn pad_token(&self) -> usize;

    /// First token fed to the decoder.
    fn start_token(&self) -> usize;

    /// Token that ends a generated sequence.
    fn end_token(&self) -> usize;
}

/// A `tokenizers` model loaded from the hub or from a tokenizer.json file.
pub struct PretrainedTokenizer {
    tokenizer: tokenizers::Tokenizer,
    pad: usize,
    start: usize,
    end: usize,
}

impl PretrainedTokenizer {
    pub fn from_pretrained(name: &str) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_pretrained(name, None)
            .map_err(|err| AugError::Tokenizer(format!("cannot load '{name}': {err}")))?;
        Self::new(tokenizer)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|err| AugError::resource(path, err))?;
        Self::new(tokenizer)
    }

    fn new(tokenizer: tokenizers::Tokenizer) -> Result<Self> {
        // BERT style vocabularies use [CLS]/[SEP], BART/RoBERTa style use <s>/</s>.
        let find = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|token| tokenizer.token_to_id(token))
                .map(|id| id as usize)
        };
        let pad = find(&["[PAD]", "<pad>"])
            .ok_or_else(|| AugError::Tokenizer("no padding token in vocabulary".into()))?;
        let start = find(&["[CLS]", "<s>", "[BOS]"])
            .ok_or_else(|| AugError::Tokenizer("no start token in vocabulary".into()))?;
        let end = find(&["[SEP]", "</s>", "[EOS]"])
            .ok_or_else(|| AugError::Tokenizer("no end token in vocabulary".into()))?;

        Ok(Self {
            tokenizer,
            pad,
            start,
            end,
        })
    }
}

impl Tokenizer for PretrainedTokenizer {
    fn encode(&self, value: &str) -> Vec<usize> {
        match self.tokenizer.encode(value, true) {
            Ok(tokens) => tokens.get_ids().iter().map(|t| *t as usize).collect(),
            Err(err) => {
                tracing::warn!("Cannot tokenize '{value}': {err}");
                vec![self.start, self.end]
            }
        }
    }

    fn decode(&self, tokens: &[usize]) -> String {
        let tokens = tokens.iter().map(|t| *t as u32).collect::<Vec<u32>>();
        self.tokenizer.decode(&tokens, true).unwrap_or_default()
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn pad_token(&self) -> usize {
        self.pad
    }

    fn start_token(&self) -> usize {
        self.start
    }

    fn end_token(&self) -> usize {
        self.end
    }
}

/// Whitespace word-level tokenizer over an explicit vocabulary.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    word2id: HashMap<String, usize>,
    id2word: Vec<String>,
    pad: usize,
    start: usize,
    end: usize,
    unknown: usize,
}

impl VocabTokenizer {
    pub const PAD: &'static str = "[PAD]";
    pub const START: &'static str = "[CLS]";
    pub const END: &'static str = "[SEP]";
    pub const UNKNOWN: &'static str = "[UNK]";

    pub fn new(word2id: HashMap<String, usize>) -> Result<Self> {
        let lookup = |token: &str| {
            word2id.get(token).copied().ok_or_else(|| {
                AugError::Tokenizer(format!("vocabulary has no '{token}' entry"))
            })
        };
        let pad = lookup(Self::PAD)?;
        let start = lookup(Self::START)?;
        let end = lookup(Self::END)?;
        let unknown = lookup(Self::UNKNOWN)?;

        let size = word2id.values().max().map_or(0, |max| max + 1);
        let mut id2word = vec![String::new(); size];
        for (word, id) in &word2id {
            id2word[*id] = word.clone();
        }

        Ok(Self {
            word2id,
            id2word,
            pad,
            start,
            end,
            unknown,
        })
    }

    fn is_special(&self, id: usize) -> bool {
        id == self.pad || id == self.start || id == self.end
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, value: &str) -> Vec<usize> {
        let mut tokens = vec![self.start];
        tokens.extend(
            value
                .split_whitespace()
                .map(|word| self.word2id.get(word).copied().unwrap_or(self.unknown)),
        );
        tokens.push(self.end);
        tokens
    }

    fn decode(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .filter(|id| !self.is_special(**id))
            .filter_map(|id| self.id2word.get(*id))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn vocab_size(&self) -> usize {
        self.id2word.len()
    }

    fn pad_token(&self) -> usize {
        self.pad
    }

    fn start_token(&self) -> usize {
        self.start
    }

    fn end_token(&self) -> usize {
        self.end
    }
}
