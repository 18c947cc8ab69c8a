use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quoll::{DMatrix, Memory};

mod common;
use common::*;

fn bench_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("call");
    for n in [10, 100, 1000] {
        let f = rosenbrock(n);
        let x = DMatrix::column(&point(n));
        group.bench_with_input(BenchmarkId::new("rosenbrock", n), &x, |b, x| {
            b.iter(|| black_box(f.call(std::slice::from_ref(black_box(x))).unwrap()))
        });
    }
    group.finish();
}

fn bench_preallocated(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval_with");
    for depth in [1, 4, 16] {
        let f = chain(50, depth);
        let sizes = f.work_sizes().unwrap();
        let mut mem = Memory::new(sizes, &[50], &[50]);
        mem.input[0].copy_from_slice(&point(50));
        group.bench_function(BenchmarkId::new("chain", depth), |b| {
            b.iter(|| {
                f.eval_with(black_box(&mut mem)).unwrap();
                black_box(mem.output[0][0])
            })
        });
    }
    group.finish();
}

fn bench_derivatives(c: &mut Criterion) {
    let mut group = c.benchmark_group("derivatives");
    for n in [10, 100] {
        let f = rosenbrock(n);
        let x = DMatrix::column(&point(n));
        let grad = f.gradient(0, 0).unwrap();
        let hess = f.hessian(0, 0).unwrap();

        group.bench_with_input(BenchmarkId::new("gradient", n), &x, |b, x| {
            b.iter(|| black_box(grad.call(std::slice::from_ref(black_box(x))).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("hessian", n), &x, |b, x| {
            b.iter(|| black_box(hess.call(std::slice::from_ref(black_box(x))).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_call, bench_preallocated, bench_derivatives);
criterion_main!(benches);
