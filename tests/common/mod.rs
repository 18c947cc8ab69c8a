#![allow(dead_code)]

use quoll::{DMatrix, Function, ScalarFunction, Sparsity, SxElem, SxMatrix};

// ─── Rosenbrock ────────────────────────────────────────────────────────────

/// f(x) = Σ (1 - x_i)² + 100 (x_{i+1} - x_i²)² over a dense column.
pub fn rosenbrock(n: usize) -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(n));
    let v = x.nonzeros().to_vec();
    let mut sum = SxElem::constant(0.0);
    for i in 0..n - 1 {
        let t1 = 1.0 - v[i].clone();
        let t2 = &v[i + 1] - &(&v[i] * &v[i]);
        sum = sum + &t1 * &t1 + 100.0 * (&t2 * &t2);
    }
    ScalarFunction::function_with(
        "rosenbrock",
        vec![x],
        vec![SxMatrix::scalar(sum)],
        &[
            ("input_scheme".to_string(), vec!["x"].into()),
            ("output_scheme".to_string(), vec!["f"].into()),
        ]
        .into_iter()
        .collect(),
    )
    .unwrap()
}

pub fn rosenbrock_f64(x: &[f64]) -> f64 {
    let mut sum = 0.0;
    for i in 0..x.len() - 1 {
        let t1 = 1.0 - x[i];
        let t2 = x[i + 1] - x[i] * x[i];
        sum += t1 * t1 + 100.0 * t2 * t2;
    }
    sum
}

pub fn rosenbrock_grad(x: &[f64]) -> Vec<f64> {
    let mut g = vec![0.0; x.len()];
    for i in 0..x.len() - 1 {
        let t2 = x[i + 1] - x[i] * x[i];
        g[i] += -2.0 * (1.0 - x[i]) - 400.0 * x[i] * t2;
        g[i + 1] += 200.0 * t2;
    }
    g
}

/// Dense row-major Hessian.
pub fn rosenbrock_hessian(x: &[f64]) -> Vec<Vec<f64>> {
    let n = x.len();
    let mut h = vec![vec![0.0; n]; n];
    for i in 0..n - 1 {
        h[i][i] += 2.0 - 400.0 * x[i + 1] + 1200.0 * x[i] * x[i];
        h[i + 1][i + 1] += 200.0;
        h[i][i + 1] -= 400.0 * x[i];
        h[i + 1][i] -= 400.0 * x[i];
    }
    h
}

// ─── Vector field ──────────────────────────────────────────────────────────

/// y = [x0·x1, sin(x0) + x2², exp(x1)·x2]
pub fn vector_field_with(options: &quoll::Dict) -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(3));
    let v = x.nonzeros().to_vec();
    let y = SxMatrix::column(vec![
        &v[0] * &v[1],
        v[0].sin() + &v[2] * &v[2],
        &v[1].exp() * &v[2],
    ]);
    ScalarFunction::function_with("field", vec![x], vec![y], options).unwrap()
}

pub fn vector_field() -> Function {
    vector_field_with(&quoll::Dict::new())
}

pub fn vector_field_f64(x: &[f64]) -> Vec<f64> {
    vec![x[0] * x[1], x[0].sin() + x[2] * x[2], x[1].exp() * x[2]]
}

// ─── Helpers ───────────────────────────────────────────────────────────────

/// Elementwise square of a dense column of `n`.
pub fn square(name: &str, n: usize) -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(n));
    let y: Vec<SxElem> = x.nonzeros().iter().map(|e| e * e).collect();
    ScalarFunction::function(name, vec![x], vec![SxMatrix::column(y)]).unwrap()
}

/// Output 0 nonzeros of `f` at the single column input `x`.
pub fn eval1(f: &Function, x: &[f64]) -> Vec<f64> {
    f.call(&[DMatrix::column(x)]).unwrap()[0].nonzeros().to_vec()
}

/// Central-difference Jacobian, row-major `[output][input]`.
pub fn fd_jacobian(f: impl Fn(&[f64]) -> Vec<f64>, x: &[f64]) -> Vec<Vec<f64>> {
    let h = 1e-6;
    let m = f(x).len();
    let mut jac = vec![vec![0.0; x.len()]; m];
    for c in 0..x.len() {
        let mut xp = x.to_vec();
        let mut xm = x.to_vec();
        xp[c] += h;
        xm[c] -= h;
        let (fp, fm) = (f(&xp), f(&xm));
        for r in 0..m {
            jac[r][c] = (fp[r] - fm[r]) / (2.0 * h);
        }
    }
    jac
}

/// Entry `(r, c)` of a column-major dense copy with `nrow` rows.
pub fn at(dense: &[f64], nrow: usize, r: usize, c: usize) -> f64 {
    dense[r + c * nrow]
}
