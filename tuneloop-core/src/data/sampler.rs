//! Per-epoch ordering: seeded shuffling, distributed partitioning and batching.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// How an epoch's sample order is turned into micro-batches for one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingPolicy {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub world_size: usize,
    pub rank: usize,
}

impl BatchingPolicy {
    /// Sequential, single-rank policy.
    pub fn sequential(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            world_size: 1,
            rank: 0,
        }
    }

    /// Samples this rank sees per epoch.
    pub fn samples_per_rank(&self, len: usize) -> usize {
        if self.drop_last {
            len / self.world_size
        } else {
            len.div_ceil(self.world_size)
        }
    }

    /// Micro-batches this rank sees per epoch.
    pub fn batches_per_epoch(&self, len: usize) -> usize {
        let per_rank = self.samples_per_rank(len);
        if self.drop_last {
            per_rank / self.batch_size
        } else {
            per_rank.div_ceil(self.batch_size)
        }
    }
}

/// The batch layout of one epoch for one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochPlan {
    pub epoch: usize,
    /// Seed of the permutation; recorded in checkpoints.
    pub seed: u64,
    /// Sample indices per micro-batch, in consumption order.
    pub batches: Vec<Vec<usize>>,
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Independent permutation seed for `epoch`, derived from the run seed.
pub fn epoch_seed(base_seed: u64, epoch: usize) -> u64 {
    splitmix64(base_seed ^ splitmix64(epoch as u64))
}

/// Build the micro-batch layout for `epoch` over `len` samples.
pub fn plan_epoch(len: usize, epoch: usize, base_seed: u64, policy: &BatchingPolicy) -> EpochPlan {
    let seed = epoch_seed(base_seed, epoch);
    let mut order: Vec<usize> = (0..len).collect();
    if policy.shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }

    let local: Vec<usize> = if policy.world_size > 1 {
        let total = policy.samples_per_rank(len) * policy.world_size;
        // Wrap around to pad, mirroring a distributed sampler.
        let padded: Vec<usize> = order.iter().copied().cycle().take(total).collect();
        padded
            .into_iter()
            .skip(policy.rank)
            .step_by(policy.world_size)
            .collect()
    } else {
        order
    };

    let mut batches: Vec<Vec<usize>> = local
        .chunks(policy.batch_size)
        .map(<[usize]>::to_vec)
        .collect();
    if policy.drop_last && batches.last().is_some_and(|b| b.len() < policy.batch_size) {
        batches.pop();
    }

    EpochPlan {
        epoch,
        seed,
        batches,
    }
}
