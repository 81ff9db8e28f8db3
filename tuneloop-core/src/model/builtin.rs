//! Built-in byte-level language models used for smoke runs and tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ForwardBackward, Gradients, Model, ShardSpec};
use crate::data::MicroBatch;
use crate::error::ModelError;

const VOCAB: usize = 256;
const ROWS_PER_SHARD: usize = 64;
const INIT_SCALE: f32 = 0.02;

fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let log_z = logits
        .iter()
        .map(|&l| (l as f64 - max).exp())
        .sum::<f64>()
        .ln()
        + max;
    logits.iter().map(|&l| l as f64 - log_z).collect()
}

fn check_token(token: u32) -> Result<usize, ModelError> {
    let t = token as usize;
    if t >= VOCAB {
        return Err(ModelError::TokenOutOfRange {
            token,
            vocab_size: VOCAB,
        });
    }
    Ok(t)
}

fn init_uniform(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| rng.gen_range(-INIT_SCALE..INIT_SCALE))
        .collect()
}

/// Context-free token distribution: one shard of `VOCAB` logits.
#[derive(Debug, Default)]
pub struct UnigramModel;

impl UnigramModel {
    pub fn new() -> Self {
        Self
    }

    fn token_counts(batch: &MicroBatch) -> Result<(Vec<f64>, f64), ModelError> {
        let mut counts = vec![0.0f64; VOCAB];
        let mut total = 0.0;
        for sample in &batch.samples {
            for (&id, &mask) in sample.input_ids.iter().zip(&sample.loss_mask) {
                if mask == 1 {
                    counts[check_token(id)?] += 1.0;
                    total += 1.0;
                }
            }
        }
        Ok((counts, total))
    }

    fn params<'a>(params: &[&'a [f32]]) -> Result<&'a [f32], ModelError> {
        match params {
            [logits] if logits.len() == VOCAB => Ok(*logits),
            _ => Err(ModelError::LayoutMismatch {
                expected: 1,
                actual: params.len(),
            }),
        }
    }
}

impl Model for UnigramModel {
    fn name(&self) -> &str {
        "unigram"
    }

    fn layout(&self) -> Vec<ShardSpec> {
        vec![ShardSpec::new("unigram.logits", VOCAB)]
    }

    fn init_parameters(&self, seed: u64) -> Vec<Vec<f32>> {
        vec![init_uniform(seed, VOCAB)]
    }

    fn forward_backward(
        &self,
        params: &[&[f32]],
        batch: &MicroBatch,
    ) -> Result<ForwardBackward, ModelError> {
        let logits = Self::params(params)?;
        let (counts, total) = Self::token_counts(batch)?;
        if total == 0.0 {
            return Ok(ForwardBackward {
                loss: 0.0,
                gradients: Gradients::zeros(&self.layout()),
            });
        }
        let logp = log_softmax(logits);
        let loss = -counts.iter().zip(&logp).map(|(c, lp)| c * lp).sum::<f64>() / total;
        let grad = logp
            .iter()
            .zip(&counts)
            .map(|(lp, c)| (lp.exp() - c / total) as f32)
            .collect();
        Ok(ForwardBackward {
            loss: loss as f32,
            gradients: Gradients::new(vec![grad]),
        })
    }

    fn forward(&self, params: &[&[f32]], batch: &MicroBatch) -> Result<f32, ModelError> {
        let logits = Self::params(params)?;
        let (counts, total) = Self::token_counts(batch)?;
        if total == 0.0 {
            return Ok(0.0);
        }
        let logp = log_softmax(logits);
        Ok((-counts.iter().zip(&logp).map(|(c, lp)| c * lp).sum::<f64>() / total) as f32)
    }
}

/// Next-byte model: a `VOCAB x VOCAB` logit table split into row blocks.
#[derive(Debug, Default)]
pub struct BigramModel;

impl BigramModel {
    pub fn new() -> Self {
        Self
    }

    fn shards() -> usize {
        VOCAB / ROWS_PER_SHARD
    }

    fn row<'a>(params: &[&'a [f32]], token: usize) -> &'a [f32] {
        let shard = params[token / ROWS_PER_SHARD];
        let offset = (token % ROWS_PER_SHARD) * VOCAB;
        &shard[offset..offset + VOCAB]
    }

    fn check_params(params: &[&[f32]]) -> Result<(), ModelError> {
        if params.len() != Self::shards() {
            return Err(ModelError::LayoutMismatch {
                expected: Self::shards(),
                actual: params.len(),
            });
        }
        if params.iter().any(|p| p.len() != ROWS_PER_SHARD * VOCAB) {
            return Err(ModelError::Compute {
                message: "bigram shard has the wrong length".into(),
            });
        }
        Ok(())
    }

    /// Adjacent (current, next) pairs where `current` is a real token and `next` a target.
    fn pairs(batch: &MicroBatch) -> Result<Vec<(usize, usize)>, ModelError> {
        let mut pairs = Vec::new();
        for sample in &batch.samples {
            let ids = &sample.input_ids;
            let context = &sample.attention_mask;
            let target = &sample.loss_mask;
            for t in 1..ids.len() {
                if context[t - 1] == 1 && target[t] == 1 {
                    pairs.push((check_token(ids[t - 1])?, check_token(ids[t])?));
                }
            }
        }
        Ok(pairs)
    }
}

impl Model for BigramModel {
    fn name(&self) -> &str {
        "bigram"
    }

    fn layout(&self) -> Vec<ShardSpec> {
        (0..Self::shards())
            .map(|i| ShardSpec::new(format!("bigram.rows.{i}"), ROWS_PER_SHARD * VOCAB))
            .collect()
    }

    fn init_parameters(&self, seed: u64) -> Vec<Vec<f32>> {
        (0..Self::shards())
            .map(|i| init_uniform(seed.wrapping_add(i as u64), ROWS_PER_SHARD * VOCAB))
            .collect()
    }

    fn forward_backward(
        &self,
        params: &[&[f32]],
        batch: &MicroBatch,
    ) -> Result<ForwardBackward, ModelError> {
        Self::check_params(params)?;
        let pairs = Self::pairs(batch)?;
        let mut gradients = Gradients::zeros(&self.layout());
        if pairs.is_empty() {
            return Ok(ForwardBackward {
                loss: 0.0,
                gradients,
            });
        }
        let n = pairs.len() as f64;
        let mut loss = 0.0f64;
        for &(cur, next) in &pairs {
            let logp = log_softmax(Self::row(params, cur));
            loss -= logp[next];
            let shard = &mut gradients.shards_mut()[cur / ROWS_PER_SHARD];
            let offset = (cur % ROWS_PER_SHARD) * VOCAB;
            for (k, lp) in logp.iter().enumerate() {
                let target = if k == next { 1.0 } else { 0.0 };
                shard[offset + k] += ((lp.exp() - target) / n) as f32;
            }
        }
        Ok(ForwardBackward {
            loss: (loss / n) as f32,
            gradients,
        })
    }

    fn forward(&self, params: &[&[f32]], batch: &MicroBatch) -> Result<f32, ModelError> {
        Self::check_params(params)?;
        let pairs = Self::pairs(batch)?;
        if pairs.is_empty() {
            return Ok(0.0);
        }
        let loss: f64 = pairs
            .iter()
            .map(|&(cur, next)| -log_softmax(Self::row(params, cur))[next])
            .sum();
        Ok((loss / pairs.len() as f64) as f32)
    }
}
