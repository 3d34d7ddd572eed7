// Host-side pieces of autoregressive decoding: choosing the next token from a row of
// logits, and tracking which examples have already emitted the end token.

use crate::config::{DecodingKind, ExperimentConfig};
use rand::{distributions::WeightedIndex, prelude::Distribution, rngs::StdRng, SeedableRng};

/// Picks the next token from one row of vocabulary logits.
#[derive(Debug, Clone)]
pub struct TokenSampler {
    strategy: DecodingKind,
    topk: usize,
    topp: f64,
    temperature: f64,
    rng: StdRng,
}

impl TokenSampler {
    pub fn new(
        strategy: DecodingKind,
        topk: usize,
        topp: f64,
        temperature: f64,
        seed: u64,
    ) -> Self {
        Self {
            strategy,
            topk,
            topp,
            temperature,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn greedy() -> Self {
        Self::new(DecodingKind::Greedy, 1, 1.0, 1.0, 0)
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(
            config.decoding,
            config.topk,
            config.topp,
            config.temperature,
            config.seed,
        )
    }

    pub fn pick(&mut self, logits: &[f32]) -> usize {
        if self.strategy == DecodingKind::Greedy {
            return argmax(logits);
        }

        let probs = softmax(logits, self.temperature);
        let mut ranked = (0..probs.len()).collect::<Vec<_>>();
        // Stable sort keeps the smaller index first among equal probabilities.
        ranked.sort_by(|a, b| probs[*b].total_cmp(&probs[*a]));

        let keep = match self.strategy {
            DecodingKind::TopK => self.topk.min(ranked.len()),
            DecodingKind::TopP => {
                let mut cumulative = 0.0;
                let mut keep = ranked.len();
                for (n, index) in ranked.iter().enumerate() {
                    cumulative += probs[*index];
                    if cumulative >= self.topp {
                        keep = n + 1;
                        break;
                    }
                }
                keep
            }
            _ => ranked.len(),
        };
        ranked.truncate(keep.max(1));

        match WeightedIndex::new(ranked.iter().map(|index| probs[*index])) {
            Ok(distribution) => ranked[distribution.sample(&mut self.rng)],
            Err(_) => argmax(logits),
        }
    }
}

/// Index of the largest logit. NaN never wins and ties go to the smallest index.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (index, value) in logits.iter().enumerate() {
        if *value > best_value {
            best = index;
            best_value = *value;
        }
    }
    best
}

fn softmax(logits: &[f32], temperature: f64) -> Vec<f64> {
    let scaled = logits
        .iter()
        .map(|l| if l.is_nan() { f64::NEG_INFINITY } else { *l as f64 / temperature })
        .collect::<Vec<_>>();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp = scaled.iter().map(|s| (s - max).exp()).collect::<Vec<_>>();
    let total: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

/// Tokens decoded so far for every example of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationState {
    tokens: Vec<Vec<usize>>,
    finished: Vec<bool>,
    end_token: usize,
    pad_token: usize,
}

impl GenerationState {
    pub fn new(first_tokens: Vec<usize>, end_token: usize, pad_token: usize) -> Self {
        let batch_size = first_tokens.len();
        Self {
            tokens: first_tokens.into_iter().map(|t| vec![t]).collect(),
            finished: vec![false; batch_size],
            end_token,
            pad_token,
        }
    }

    /// Appends one picked token per example. Finished examples receive padding.
    pub fn advance(&mut self, picked: &[usize]) {
        for ((tokens, finished), token) in self
            .tokens
            .iter_mut()
            .zip(self.finished.iter_mut())
            .zip(picked)
        {
            if *finished {
                tokens.push(self.pad_token);
            } else {
                tokens.push(*token);
                *finished = *token == self.end_token;
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.finished.iter().all(|f| *f)
    }

    /// Current decoder input, row major, including the first token.
    pub fn decoder_input(&self) -> (Vec<i64>, usize) {
        let length = self.tokens.first().map_or(0, Vec::len);
        let flat = self
            .tokens
            .iter()
            .flat_map(|row| row.iter().map(|t| *t as i64))
            .collect();
        (flat, length)
    }

    /// Generated tokens without the first token, padded to exactly `max_length` per row.
    pub fn into_padded(self, max_length: usize) -> Vec<usize> {
        let mut flat = Vec::with_capacity(self.tokens.len() * max_length);
        for row in self.tokens {
            let generated = row.into_iter().skip(1).take(max_length).collect::<Vec<_>>();
            let missing = max_length - generated.len();
            flat.extend(generated);
            flat.extend(std::iter::repeat(self.pad_token).take(missing));
        }
        flat
    }
}
