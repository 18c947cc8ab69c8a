use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

mod common;
use common::*;

fn bench_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("jac_sparsity");
    for n in [100, 1000] {
        group.bench_function(BenchmarkId::new("plain", n), |b| {
            b.iter(|| {
                let f = banded(n);
                black_box(f.jac_sparsity_plain(0, 0).unwrap())
            })
        });

        group.bench_function(BenchmarkId::new("hierarchical", n), |b| {
            b.iter(|| {
                let f = banded(n);
                black_box(f.jac_sparsity_hierarchical(0, 0).unwrap())
            })
        });

        group.bench_function(BenchmarkId::new("hierarchical_symm", n), |b| {
            b.iter(|| {
                let f = banded(n);
                black_box(f.jac_sparsity_hierarchical_symm(0, 0).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_jacobian_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("jacobian_construction");
    for n in [50, 500] {
        group.bench_function(BenchmarkId::new("banded", n), |b| {
            b.iter(|| {
                let f = banded(n);
                black_box(f.jacobian(0, 0, true, false).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_detection, bench_jacobian_construction);
criterion_main!(benches);
