use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ph_rs::PhTree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn keys(n: usize, dim: usize, seed: u64) -> Vec<Vec<u64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            (0..dim)
                .map(|_| (rng.gen_range(0..1024u64) << 20) | rng.gen_range(0..4096u64))
                .collect()
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let ks = keys(10_000, 3, 1);
    c.bench_function("insert_10k_dim3", |b| {
        b.iter(|| {
            let mut t: PhTree<u64> = PhTree::new(3, 64);
            for (i, k) in ks.iter().enumerate() {
                t.insert(k, i as u64);
            }
            black_box(t.len())
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let ks = keys(10_000, 3, 2);
    let mut t: PhTree<u64> = PhTree::new(3, 64);
    for (i, k) in ks.iter().enumerate() {
        t.insert(k, i as u64);
    }
    c.bench_function("get_10k_dim3", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for k in &ks {
                if t.get(k).is_some() {
                    hits += 1;
                }
            }
            black_box(hits)
        })
    });
}

fn bench_window_query(c: &mut Criterion) {
    let ks = keys(50_000, 3, 3);
    let mut t: PhTree<u64> = PhTree::new(3, 64);
    for (i, k) in ks.iter().enumerate() {
        t.insert(k, i as u64);
    }
    let min = [100u64 << 20, 100 << 20, 100 << 20];
    let max = [400u64 << 20, 400 << 20, 400 << 20];
    c.bench_function("window_50k_dim3", |b| {
        b.iter(|| {
            let mut q = t.query(&min, &max);
            let mut n = 0usize;
            while q.next_reuse().is_some() {
                n += 1;
            }
            black_box(n)
        })
    });
}

criterion_group!(benches, bench_insert, bench_get, bench_window_query);
criterion_main!(benches);
