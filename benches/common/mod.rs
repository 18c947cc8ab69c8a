#![allow(dead_code)]

use quoll::{Composite, Function, Mx, ScalarFunction, Sparsity, SxElem, SxMatrix};

// ─── Rosenbrock ────────────────────────────────────────────────────────────

pub fn rosenbrock(n: usize) -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(n));
    let v = x.nonzeros().to_vec();
    let mut sum = SxElem::constant(0.0);
    for i in 0..n - 1 {
        let t1 = 1.0 - v[i].clone();
        let t2 = &v[i + 1] - &(&v[i] * &v[i]);
        sum = sum + &t1 * &t1 + 100.0 * (&t2 * &t2);
    }
    ScalarFunction::function("rosenbrock", vec![x], vec![SxMatrix::scalar(sum)]).unwrap()
}

// ─── Banded residual ───────────────────────────────────────────────────────
// r_i = x_{i-1} - 2 x_i + x_{i+1} + sin(x_i): tridiagonal Jacobian.

pub fn banded(n: usize) -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(n));
    let v = x.nonzeros().to_vec();
    let r: Vec<SxElem> = (0..n)
        .map(|i| {
            let mut e = v[i].sin() - 2.0 * v[i].clone();
            if i > 0 {
                e = e + &v[i - 1];
            }
            if i + 1 < n {
                e = e + &v[i + 1];
            }
            e
        })
        .collect();
    ScalarFunction::function("banded", vec![x], vec![SxMatrix::column(r)]).unwrap()
}

// ─── Call chains ───────────────────────────────────────────────────────────

/// `depth` nested calls of an elementwise map over a column of `n`.
pub fn chain(n: usize, depth: usize) -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(n));
    let y: Vec<SxElem> = x.nonzeros().iter().map(|e| e.sin() * e).collect();
    let g = ScalarFunction::function("g", vec![x], vec![SxMatrix::column(y)]).unwrap();

    let x = Mx::sym("x", &Sparsity::column(n));
    let mut out = vec![x.clone()];
    for _ in 0..depth {
        out = Mx::call(&g, &out).unwrap();
    }
    Composite::function("chain", vec![x], out).unwrap()
}

pub fn point(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.5 + 0.01 * i as f64).collect()
}
