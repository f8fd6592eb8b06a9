use super::{open, PAGE_SIZE};
use commonware_pagebuf::{Flags, IoMove, Target};
use commonware_runtime::{deterministic, Runner};
use criterion::{black_box, criterion_group, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::time::{Duration, Instant};

/// Pages spanned by the buffer being copied to and from.
const PAGES: usize = 16;

/// Copy a whole (unaligned) buffer in and out of caller memory.
fn bench_iomove(c: &mut Criterion) {
    c.bench_function(&format!("{}/pages={}", module_path!(), PAGES), |b| {
        b.iter_custom(|iters| {
            let executor = deterministic::Runner::default();
            executor.start(|context| async move {
                let cache = open(context);
                let target = Target::new(1, 512);
                let length = PAGES * PAGE_SIZE;
                let buffer = cache
                    .get(&target, 512, length, Flags::LOCK)
                    .await
                    .unwrap();

                let mut rng = StdRng::seed_from_u64(0);
                let mut data = vec![0; length];
                rng.fill_bytes(&mut data);
                let mut read = vec![0; length];

                let mut duration = Duration::ZERO;
                for _ in 0..iters {
                    let start = Instant::now();
                    buffer.iomove(0, IoMove::Write(&data)).unwrap();
                    buffer.iomove(0, IoMove::Read(&mut read)).unwrap();
                    black_box(&read);
                    duration += start.elapsed();
                }
                buffer.relse();
                cache.close().await;
                duration
            })
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_iomove
}
