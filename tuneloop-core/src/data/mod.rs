//! Sharded data feed: preprocessing, per-epoch ordering and the loader worker pool.
//!
//! Preprocessing (tokenize, truncate, pad) runs once on a `rayon` pool sized by
//! `num_proc`. Each epoch is then served by [`EpochBatches`], which owns its
//! loader threads: every worker collates a fixed stride of the epoch's
//! micro-batches into its own bounded queue, and the consumer drains the queues
//! round-robin, so production order equals consumption order. Dropping the
//! iterator closes the queues and joins the workers.

pub mod sampler;
pub mod source;
pub mod tokenizer;

use rayon::prelude::*;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use crate::config::TrainingConfig;
use crate::error::{DataError, Result};
pub use sampler::{BatchingPolicy, EpochPlan, epoch_seed, plan_epoch};
pub use source::{DatasetRef, IGNORE_INDEX, RawRecord, read_records};
pub use tokenizer::{ByteTokenizer, Tokenizer};

/// A fixed-shape token sequence plus attention and loss masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    /// 1 where the token is a prediction target; always 0 on padding.
    pub loss_mask: Vec<u8>,
}

impl Sample {
    /// Truncate/pad `tokens` to `max_length`. Returns `None` for empty input.
    pub fn from_tokens(tokens: &[u32], max_length: usize, pad_token_id: u32) -> Option<Self> {
        if tokens.is_empty() {
            return None;
        }
        let real = tokens.len().min(max_length);
        let mut input_ids = Vec::with_capacity(max_length);
        input_ids.extend_from_slice(&tokens[..real]);
        input_ids.resize(max_length, pad_token_id);
        let mut attention_mask = vec![1u8; real];
        attention_mask.resize(max_length, 0);
        Some(Self {
            input_ids,
            loss_mask: attention_mask.clone(),
            attention_mask,
        })
    }

    /// Like [`Sample::from_tokens`], with positions labeled [`IGNORE_INDEX`] excluded from the loss.
    pub fn from_labeled(
        tokens: &[u32],
        labels: &[i64],
        max_length: usize,
        pad_token_id: u32,
    ) -> Option<Self> {
        let mut sample = Self::from_tokens(tokens, max_length, pad_token_id)?;
        for (mask, &label) in sample.loss_mask.iter_mut().zip(labels) {
            if label == IGNORE_INDEX {
                *mask = 0;
            }
        }
        Some(sample)
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of non-padding positions.
    pub fn real_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }
}

/// Samples collated for one forward/backward pass.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    pub epoch: usize,
    /// Position of this batch within its epoch.
    pub position: usize,
    /// Indices into the feed's (capped) sample store.
    pub sample_ids: Vec<usize>,
    pub samples: Vec<Sample>,
}

impl MicroBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn real_tokens(&self) -> usize {
        self.samples.iter().map(Sample::real_tokens).sum()
    }
}

/// Tokenize, truncate and pad raw records with `num_proc`-way parallelism.
///
/// Records that yield no tokens are dropped; order is preserved.
pub fn preprocess(
    records: &[RawRecord],
    tokenizer: &dyn Tokenizer,
    max_length: usize,
    pad_token_id: u32,
    num_proc: usize,
) -> std::result::Result<Vec<Sample>, DataError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_proc.max(1))
        .thread_name(|i| format!("preprocess-{i}"))
        .build()
        .map_err(|e| DataError::WorkerPool {
            message: e.to_string(),
        })?;

    let samples: Vec<Option<Sample>> = pool.install(|| {
        records
            .par_iter()
            .map(|record| match record {
                RawRecord::Tokens(ids) => Sample::from_tokens(ids, max_length, pad_token_id),
                RawRecord::Labeled { input_ids, labels } => {
                    Sample::from_labeled(input_ids, labels, max_length, pad_token_id)
                }
                RawRecord::Text(text) => {
                    Sample::from_tokens(&tokenizer.encode(text), max_length, pad_token_id)
                }
                RawRecord::Empty => None,
            })
            .collect()
    });
    let usable: Vec<Sample> = samples.into_iter().flatten().collect();
    tracing::debug!(
        records = records.len(),
        usable = usable.len(),
        num_proc,
        "Preprocessed dataset"
    );
    Ok(usable)
}

/// Loader parallelism for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Background workers; 0 collates on the consuming thread.
    pub workers: usize,
    /// Queue slots per worker.
    pub prefetch: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            prefetch: 2,
        }
    }
}

/// Lazily produces micro-batches, one restartable sequence per epoch.
#[derive(Debug, Clone)]
pub struct DataFeed {
    samples: Arc<Vec<Sample>>,
    policy: BatchingPolicy,
    base_seed: u64,
    loader: LoaderOptions,
}

impl DataFeed {
    /// Build a feed over already-preprocessed samples.
    pub fn new(
        samples: Vec<Sample>,
        policy: BatchingPolicy,
        base_seed: u64,
        loader: LoaderOptions,
    ) -> std::result::Result<Self, DataError> {
        if samples.is_empty() {
            return Err(DataError::Exhausted {
                reason: "dataset yielded zero usable samples".into(),
            });
        }
        if policy.batches_per_epoch(samples.len()) == 0 {
            return Err(DataError::Exhausted {
                reason: format!(
                    "{} samples produce no full micro-batch of {} with drop_last",
                    samples.len(),
                    policy.batch_size
                ),
            });
        }
        Ok(Self {
            samples: Arc::new(samples),
            policy,
            base_seed,
            loader,
        })
    }

    /// Training feed: reads `config.dataset`, applies `max_samples` once before any shuffling.
    pub fn for_training(config: &TrainingConfig, tokenizer: &dyn Tokenizer) -> Result<Self> {
        let reference = DatasetRef::parse(&config.dataset)?;
        let records = read_records(&reference)?;
        let mut samples = preprocess(
            &records,
            tokenizer,
            config.max_length,
            config.pad_token_id,
            config.num_proc,
        )?;
        if let Some(cap) = config.max_samples {
            samples.truncate(cap);
        }
        let policy = BatchingPolicy {
            batch_size: config.per_device_train_batch_size,
            shuffle: config.shuffle,
            drop_last: config.drop_last,
            world_size: config.world_size,
            rank: config.rank,
        };
        let loader = LoaderOptions {
            workers: config.data_loader_workers,
            prefetch: config.prefetch_factor,
        };
        Ok(Self::new(samples, policy, config.seed, loader)?)
    }

    /// Evaluation feed: sequential, keeps partial batches, partitioned like training.
    pub fn for_evaluation(
        config: &TrainingConfig,
        reference: &str,
        tokenizer: &dyn Tokenizer,
    ) -> Result<Self> {
        let reference = DatasetRef::parse(reference)?;
        let records = read_records(&reference)?;
        let samples = preprocess(
            &records,
            tokenizer,
            config.max_length,
            config.pad_token_id,
            config.num_proc,
        )?;
        let policy = BatchingPolicy {
            world_size: config.world_size,
            rank: config.rank,
            ..BatchingPolicy::sequential(config.per_device_eval_batch_size)
        };
        let loader = LoaderOptions {
            workers: config.data_loader_workers,
            prefetch: config.prefetch_factor,
        };
        Ok(Self::new(samples, policy, config.seed, loader)?)
    }

    /// Replace the run seed, e.g. with the one recorded in a checkpoint.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    /// Number of (capped) samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub fn policy(&self) -> &BatchingPolicy {
        &self.policy
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.policy.batches_per_epoch(self.samples.len())
    }

    pub fn plan(&self, epoch: usize) -> EpochPlan {
        plan_epoch(self.samples.len(), epoch, self.base_seed, &self.policy)
    }

    /// Start serving `epoch`, skipping its first `skip` micro-batches.
    pub fn epoch(&self, epoch: usize, skip: usize) -> std::result::Result<EpochBatches, DataError> {
        let plan = self.plan(epoch);
        let seed = plan.seed;
        let total = plan.batches.len();
        let start = skip.min(total);
        let batches = Arc::new(plan.batches);
        let workers = self.loader.workers.min(total - start);

        let source = if workers == 0 {
            BatchSource::Inline {
                samples: Arc::clone(&self.samples),
                batches,
            }
        } else {
            let mut receivers = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = sync_channel(self.loader.prefetch.max(1));
                let samples = Arc::clone(&self.samples);
                let batches = Arc::clone(&batches);
                let handle = std::thread::Builder::new()
                    .name(format!("feed-worker-{worker}"))
                    .spawn(move || {
                        load_stride(epoch, start + worker, workers, &samples, &batches, tx)
                    })
                    .map_err(|e| DataError::WorkerPool {
                        message: e.to_string(),
                    })?;
                receivers.push(rx);
                handles.push(handle);
            }
            tracing::debug!(epoch, workers, start, total, "Spawned loader workers");
            BatchSource::Pooled { receivers, handles }
        };

        Ok(EpochBatches {
            epoch,
            seed,
            start,
            next: start,
            total,
            source,
        })
    }
}

fn collate(epoch: usize, position: usize, samples: &[Sample], ids: &[usize]) -> MicroBatch {
    MicroBatch {
        epoch,
        position,
        sample_ids: ids.to_vec(),
        samples: ids.iter().map(|&i| samples[i].clone()).collect(),
    }
}

fn load_stride(
    epoch: usize,
    first: usize,
    stride: usize,
    samples: &[Sample],
    batches: &[Vec<usize>],
    tx: SyncSender<MicroBatch>,
) {
    for position in (first..batches.len()).step_by(stride) {
        let batch = collate(epoch, position, samples, &batches[position]);
        // The consumer hung up: the epoch was abandoned.
        if tx.send(batch).is_err() {
            return;
        }
    }
}

enum BatchSource {
    Inline {
        samples: Arc<Vec<Sample>>,
        batches: Arc<Vec<Vec<usize>>>,
    },
    Pooled {
        receivers: Vec<Receiver<MicroBatch>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// One epoch's micro-batches, in order. Owns the epoch's loader workers.
pub struct EpochBatches {
    epoch: usize,
    seed: u64,
    start: usize,
    next: usize,
    total: usize,
    source: BatchSource,
}

impl EpochBatches {
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Permutation seed used for this epoch.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Micro-batches in the full epoch, including skipped ones.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.total - self.next
    }
}

impl Iterator for EpochBatches {
    type Item = std::result::Result<MicroBatch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let position = self.next;
        self.next += 1;
        match &self.source {
            BatchSource::Inline { samples, batches } => Some(Ok(collate(
                self.epoch,
                position,
                samples,
                &batches[position],
            ))),
            BatchSource::Pooled { receivers, .. } => {
                let rx = &receivers[(position - self.start) % receivers.len()];
                Some(rx.recv().map_err(|_| DataError::WorkerPool {
                    message: format!("loader worker for batch {position} exited early"),
                }))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let BatchSource::Pooled { receivers, handles } = &mut self.source {
            // Close the queues first so blocked producers observe the hang-up.
            receivers.clear();
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    tracing::warn!(epoch = self.epoch, "Loader worker panicked");
                }
            }
        }
    }
}
