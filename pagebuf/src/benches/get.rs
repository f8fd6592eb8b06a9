use super::{open, PAGE_SIZE};
use commonware_pagebuf::{Flags, Target};
use commonware_runtime::{deterministic, Runner};
use criterion::{black_box, criterion_group, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Number of distinct buffers kept alive while looking them up.
const BUFFERS: u64 = 1_000;

/// Lookups per iteration.
const LOOKUPS: usize = 10_000;

/// Look up (and lock) random buffers that are already cached.
fn bench_get_hit(c: &mut Criterion) {
    c.bench_function(&format!("{}/buffers={}", module_path!(), BUFFERS), |b| {
        b.iter_custom(|iters| {
            let executor = deterministic::Runner::default();
            executor.start(|context| async move {
                let cache = open(context);
                let target = Target::new(1, PAGE_SIZE as u32);

                // Keep every buffer cached by holding it
                let mut held = Vec::with_capacity(BUFFERS as usize);
                for i in 0..BUFFERS {
                    let buffer = cache
                        .get(&target, i * PAGE_SIZE as u64, PAGE_SIZE, Flags::empty())
                        .await
                        .unwrap();
                    held.push(buffer);
                }

                let mut rng = StdRng::seed_from_u64(0);
                let mut duration = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    for _ in 0..LOOKUPS {
                        let offset = rng.gen_range(0..BUFFERS) * PAGE_SIZE as u64;
                        let buffer = cache
                            .get(&target, offset, PAGE_SIZE, Flags::LOCK)
                            .await
                            .unwrap();
                        black_box(&buffer);
                        buffer.relse();
                    }
                    duration += start.elapsed();
                }
                drop(held);
                cache.close().await;
                duration
            })
        });
    });
}

/// Create, read, and destroy buffers that are not cached.
fn bench_get_miss(c: &mut Criterion) {
    for pages in [1, 4, 16] {
        c.bench_function(&format!("{}/pages={}", module_path!(), pages), |b| {
            b.iter_custom(|iters| {
                let executor = deterministic::Runner::default();
                executor.start(|context| async move {
                    let cache = open(context);
                    let target = Target::new(1, PAGE_SIZE as u32);
                    let length = pages * PAGE_SIZE;

                    let mut duration = Duration::ZERO;
                    for i in 0..iters {
                        let start = Instant::now();
                        let buffer = cache
                            .get(
                                &target,
                                i * length as u64,
                                length,
                                Flags::LOCK | Flags::READ | Flags::MAP,
                            )
                            .await
                            .unwrap();
                        black_box(&buffer);
                        buffer.relse();
                        duration += start.elapsed();
                    }
                    cache.close().await;
                    duration
                })
            });
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_get_hit, bench_get_miss
}
