use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use quadforest::api;
use quadforest::prelude::*;

fn random_quadrants(n: usize, seed: u64) -> Vec<Quadrant3> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let level = rng.gen_range(0..=Quadrant3::MAX_LEVEL);
            let per_tree = 1u64 << (3 * u32::from(level));
            Quadrant3::from_linear_id(rng.gen_range(0..4), level, rng.gen_range(0..per_tree))
                .unwrap()
        })
        .collect()
}

fn bench_codec(c: &mut Criterion) {
    let quads = random_quadrants(4096, 42);
    let mut group = c.benchmark_group("morton");
    group.bench_function("linear_id", |b| {
        b.iter(|| {
            quads
                .iter()
                .filter_map(|q| q.linear_id(q.level).ok())
                .fold(0u64, u64::wrapping_add)
        })
    });
    group.bench_function("sort", |b| {
        b.iter(|| {
            let mut v = quads.clone();
            v.sort();
            black_box(v)
        })
    });
    group.bench_function("nearest_common_ancestor", |b| {
        b.iter(|| {
            quads
                .windows(2)
                .map(|w| w[0].nearest_common_ancestor(&w[1]).level)
                .max()
        })
    });
    group.finish();
}

fn bench_partition(c: &mut Criterion) {
    let conn = api::build_connectivity::<2>("star").unwrap();
    let mut group = c.benchmark_group("partition");
    group.sample_size(10);
    for ranks in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(ranks), &ranks, |b, &ranks| {
            b.iter(|| {
                let world = RayonComm::world(ranks);
                std::thread::scope(|s| {
                    for comm in &world {
                        let conn = &conn;
                        s.spawn(move || {
                            let mut f = api::new_forest(comm, conn, 3).unwrap();
                            if comm.rank() == 0 {
                                f.refine_recursive(7, |q| q.child_id() != 3);
                            }
                            partition(&mut f, comm, None).unwrap()
                        });
                    }
                });
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_partition);
criterion_main!(benches);
