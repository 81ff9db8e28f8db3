use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tuneloop_core::data::{BatchingPolicy, ByteTokenizer, DatasetRef, plan_epoch, preprocess, read_records};
use tuneloop_core::model::{ForwardBackward, Gradients};
use tuneloop_core::optim::{AdamW, Optimizer, clip_grad_norm};
use tuneloop_core::trainer::GradientAccumulator;

fn bench_data_feed(c: &mut Criterion) {
    let policy = BatchingPolicy {
        shuffle: true,
        ..BatchingPolicy::sequential(8)
    };
    c.bench_function("plan_epoch_100k_shuffled", |b| {
        b.iter(|| plan_epoch(black_box(100_000), 3, 42, &policy))
    });

    let records = read_records(&DatasetRef::Synthetic { count: 2_000 }).unwrap_or_default();
    c.bench_function("preprocess_2k_records", |b| {
        b.iter(|| preprocess(black_box(&records), &ByteTokenizer, 128, 0, 4))
    });
}

fn bench_accumulation(c: &mut Criterion) {
    let shard = vec![0.25f32; 64 * 256];

    c.bench_function("accumulate_window_of_8", |b| {
        b.iter(|| {
            let mut acc = GradientAccumulator::new(8);
            for _ in 0..8 {
                let _ = acc.add(ForwardBackward {
                    loss: 1.0,
                    gradients: Gradients::new(vec![shard.clone()]),
                });
            }
            acc.take()
        })
    });

    c.bench_function("clip_grad_norm_4x16k", |b| {
        b.iter(|| {
            let mut grads = Gradients::new(vec![shard.clone(); 4]);
            clip_grad_norm(black_box(&mut grads), 1.0)
        })
    });
}

fn bench_optimizer(c: &mut Criterion) {
    let optimizer = AdamW::default();
    let grad = vec![0.01f32; 64 * 256];
    let mut param = vec![0.5f32; 64 * 256];
    let mut state = vec![vec![0.0f32; 64 * 256]; optimizer.slots()];
    let mut step = 0u64;

    c.bench_function("adamw_update_16k", |b| {
        b.iter(|| {
            optimizer.update(step, 1e-3, black_box(&mut param), &grad, &mut state);
            step += 1;
        })
    });
}

criterion_group!(benches, bench_data_feed, bench_accumulation, bench_optimizer);
criterion_main!(benches);
