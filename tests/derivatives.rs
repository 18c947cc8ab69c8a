//! Numeric values of derivative functions against closed forms and
//! central differences.

mod common;

use approx::assert_relative_eq;
use common::*;
use quoll::{
    BlockJacobian, Composite, DMatrix, Dict, Error, Function, GenericType, JacobianProduct, Mx,
    NumericJacobian,
    ScalarFunction, Sparsity, SxMatrix,
};

fn options(entries: &[(&str, GenericType)]) -> Dict {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn rows(m: &DMatrix) -> Vec<Vec<f64>> {
    let (nrow, ncol) = m.shape();
    (0..nrow)
        .map(|r| (0..ncol).map(|c| m.get(r, c)).collect())
        .collect()
}

fn assert_matrix_eq(got: &[Vec<f64>], expected: &[Vec<f64>], epsilon: f64) {
    assert_eq!(got.len(), expected.len());
    for (gr, er) in got.iter().zip(expected) {
        assert_eq!(gr.len(), er.len());
        for (g, e) in gr.iter().zip(er) {
            assert_relative_eq!(*g, *e, epsilon = epsilon, max_relative = epsilon);
        }
    }
}

/// `(x, p) -> ([x0 p, x1²], x0 + x1 + p)`
fn two_by_two() -> Function {
    let x = SxMatrix::sym("x", &Sparsity::column(2));
    let p = SxMatrix::sym("p", &Sparsity::scalar());
    let (v, q) = (x.nonzeros().to_vec(), p.nonzeros()[0].clone());
    let y1 = SxMatrix::column(vec![&v[0] * &q, &v[1] * &v[1]]);
    let y2 = SxMatrix::scalar(v[0].clone() + v[1].clone() + q.clone());
    ScalarFunction::function("pair", vec![x, p], vec![y1, y2]).unwrap()
}

fn two_by_two_full_jacobian(x: &[f64], p: f64) -> Vec<Vec<f64>> {
    vec![
        vec![p, 0.0, x[0]],
        vec![0.0, 2.0 * x[1], 0.0],
        vec![1.0, 1.0, 1.0],
    ]
}

fn field_twice(options: &Dict) -> Function {
    let g = vector_field();
    let x = Mx::sym("x", &Sparsity::column(3));
    let y = Mx::call(&g, &[x.clone()]).unwrap();
    let z = Mx::call(&g, &y).unwrap();
    Composite::function_with("field_twice", vec![x], z, options).unwrap()
}

fn field_twice_f64(x: &[f64]) -> Vec<f64> {
    vector_field_f64(&vector_field_f64(x))
}

const X3: [f64; 3] = [0.4, -0.8, 1.3];

// ── Directional derivatives ──

#[test]
fn forward_derivative_is_jacobian_times_seed() {
    let f = vector_field();
    let fwd = f.forward(2).unwrap();
    let y = vector_field_f64(&X3);
    let fd = fd_jacobian(vector_field_f64, &X3);

    let out = fwd
        .call(&[
            DMatrix::column(&X3),
            DMatrix::column(&y),
            DMatrix::column(&[1.0, 0.0, 0.0]),
            DMatrix::column(&[0.0, 2.0, -1.0]),
        ])
        .unwrap();
    for r in 0..3 {
        assert_relative_eq!(out[0].nonzeros()[r], fd[r][0], epsilon = 1e-6);
        let expected = 2.0 * fd[r][1] - fd[r][2];
        assert_relative_eq!(out[1].nonzeros()[r], expected, epsilon = 1e-6);
    }
}

#[test]
fn reverse_derivative_is_seed_times_jacobian() {
    let f = vector_field();
    let adj = f.reverse(1).unwrap();
    let y = vector_field_f64(&X3);
    let fd = fd_jacobian(vector_field_f64, &X3);
    let seed = [0.5, -1.0, 2.0];

    let out = adj
        .call(&[DMatrix::column(&X3), DMatrix::column(&y), DMatrix::column(&seed)])
        .unwrap();
    for c in 0..3 {
        let expected: f64 = (0..3).map(|r| seed[r] * fd[r][c]).sum();
        assert_relative_eq!(out[0].nonzeros()[c], expected, epsilon = 1e-6);
    }
}

#[test]
fn many_directions_multiply_the_jacobian() {
    let f = vector_field();
    let fwd = f.forward(7).unwrap();
    assert_eq!(fwd.type_name(), "JacobianProduct");
    assert!(fwd.downcast::<JacobianProduct>().unwrap().is_forward());
    assert_eq!(fwd.name(), "fwd7_field");

    let y = vector_field_f64(&X3);
    let fd = fd_jacobian(vector_field_f64, &X3);
    let mut args = vec![DMatrix::column(&X3), DMatrix::column(&y)];
    let seeds: Vec<[f64; 3]> = (0..7)
        .map(|d| [d as f64, 1.0 - d as f64, 0.5 * d as f64])
        .collect();
    args.extend(seeds.iter().map(|s| DMatrix::column(s)));
    let out = fwd.call(&args).unwrap();
    assert_eq!(out.len(), 7);
    for (d, seed) in seeds.iter().enumerate() {
        for r in 0..3 {
            let expected: f64 = (0..3).map(|c| fd[r][c] * seed[c]).sum();
            assert_relative_eq!(out[d].nonzeros()[r], expected, epsilon = 1e-6);
        }
    }

    // below the threshold the native mode is kept
    assert_eq!(f.forward(6).unwrap().type_name(), "ScalarFunction");
}

#[test]
fn many_adjoint_directions_multiply_the_jacobian() {
    let f = vector_field();
    let adj = f.reverse(7).unwrap();
    assert!(!adj.downcast::<JacobianProduct>().unwrap().is_forward());

    let y = vector_field_f64(&X3);
    let fd = fd_jacobian(vector_field_f64, &X3);
    let mut args = vec![DMatrix::column(&X3), DMatrix::column(&y)];
    for d in 0..7 {
        let seed = if d == 3 { [0.5, -1.0, 2.0] } else { [0.0; 3] };
        args.push(DMatrix::column(&seed));
    }
    let out = adj.call(&args).unwrap();
    for c in 0..3 {
        let expected = 0.5 * fd[0][c] - fd[1][c] + 2.0 * fd[2][c];
        assert_relative_eq!(out[3].nonzeros()[c], expected, epsilon = 1e-6);
        assert_eq!(out[0].nonzeros()[c], 0.0);
    }
}

#[test]
fn negative_jac_penalty_keeps_the_native_mode() {
    let f = vector_field_with(&options(&[("jac_penalty", (-1.0).into())]));
    assert_eq!(f.forward(40).unwrap().type_name(), "ScalarFunction");
    assert_eq!(f.reverse(40).unwrap().type_name(), "ScalarFunction");
}

#[test]
fn jacobian_products_generate_code() {
    let f = vector_field();
    let fwd = f.forward(8).unwrap();
    assert!(fwd.has_codegen());
    let src = fwd.generate_code("fwd").unwrap();
    assert!(src.contains("int fwd(const double** arg"));
    assert!(src.contains("+= w["));
}

// ── Jacobian blocks ──

#[test]
fn forward_mode_jacobian_matches_finite_differences() {
    let f = vector_field();
    let jac = f.jacobian(0, 0, false, false).unwrap();
    assert!(jac.downcast::<NumericJacobian>().unwrap().is_forward());

    let out = jac.call(&[DMatrix::column(&X3)]).unwrap();
    assert_matrix_eq(&rows(&out[0]), &fd_jacobian(vector_field_f64, &X3), 1e-6);
    assert_eq!(out[1].nonzeros(), vector_field_f64(&X3).as_slice());
}

#[test]
fn reverse_mode_jacobian_matches_finite_differences() {
    let f = vector_field_with(&options(&[("ad_weight", 1.0.into())]));
    assert_eq!(f.ad_weight(), 1.0);
    let jac = f.jacobian(0, 0, false, false).unwrap();
    assert!(!jac.downcast::<NumericJacobian>().unwrap().is_forward());

    let out = jac.call(&[DMatrix::column(&X3)]).unwrap();
    assert_matrix_eq(&rows(&out[0]), &fd_jacobian(vector_field_f64, &X3), 1e-6);
}

#[test]
fn single_direction_batches_give_the_same_jacobian() {
    let batched = vector_field();
    let single = vector_field_with(&options(&[("max_num_dir", 1.into())]));
    let a = batched.jacobian(0, 0, true, false).unwrap();
    let b = single.jacobian(0, 0, true, false).unwrap();
    let ja = a.call(&[DMatrix::column(&X3)]).unwrap();
    let jb = b.call(&[DMatrix::column(&X3)]).unwrap();
    assert_eq!(ja[0].sparsity(), jb[0].sparsity());
    for (u, v) in ja[0].nonzeros().iter().zip(jb[0].nonzeros()) {
        assert_relative_eq!(*u, *v, max_relative = 1e-14);
    }
}

#[test]
fn compact_jacobian_stores_only_structural_nonzeros() {
    let f = vector_field();
    let jac = f.jacobian(0, 0, true, false).unwrap();
    let sp = jac.sparsity_out(0).unwrap();
    assert_eq!(sp, f.jac_sparsity(0, 0, true, false).unwrap());
    assert_eq!(sp.nnz(), 6);
}

#[test]
fn tridiagonal_jacobian_needs_three_colors() {
    let n = 10;
    let x = SxMatrix::sym("x", &Sparsity::column(n));
    let v = x.nonzeros().to_vec();
    let y = (0..n)
        .map(|i| {
            let left = if i > 0 { v[i - 1].clone() } else { 0.0.into() };
            let right = if i + 1 < n { v[i + 1].clone() } else { 0.0.into() };
            v[i].sin() * 3.0 + &left * &right
        })
        .collect();
    let f = ScalarFunction::function("tri", vec![x], vec![SxMatrix::column(y)]).unwrap();
    let jac = f.jacobian(0, 0, false, false).unwrap();
    assert_eq!(jac.downcast::<NumericJacobian>().unwrap().num_colors(), 3);

    let xv: Vec<f64> = (0..n).map(|i| 0.1 * i as f64 - 0.3).collect();
    let closed = |x: &[f64]| -> Vec<f64> {
        (0..n)
            .map(|i| {
                let left = if i > 0 { x[i - 1] } else { 0.0 };
                let right = if i + 1 < n { x[i + 1] } else { 0.0 };
                3.0 * x[i].sin() + left * right
            })
            .collect()
    };
    let out = jac.call(&[DMatrix::column(&xv)]).unwrap();
    assert_matrix_eq(&rows(&out[0]), &fd_jacobian(closed, &xv), 1e-6);
}

#[test]
fn jacobian_of_second_input() {
    let f = two_by_two();
    let jac = f.jacobian(1, 0, false, false).unwrap();
    let out = jac
        .call(&[DMatrix::column(&[2.0, 5.0]), DMatrix::scalar(-1.0)])
        .unwrap();
    assert_eq!(rows(&out[0]), vec![vec![2.0], vec![0.0]]);
    assert_eq!(out[1].nonzeros(), &[-2.0, 25.0]);
    assert_eq!(out[2].nonzeros(), &[6.0]);
}

// ── Composites ──

#[test]
fn composite_jacobians_follow_the_chain_rule() {
    let fd = fd_jacobian(field_twice_f64, &X3);

    let fwd_mode = field_twice(&Dict::new());
    let out = fwd_mode
        .jacobian(0, 0, false, false)
        .unwrap()
        .call(&[DMatrix::column(&X3)])
        .unwrap();
    assert_matrix_eq(&rows(&out[0]), &fd, 1e-5);

    let adj_mode = field_twice(&options(&[("ad_weight", 1.0.into())]));
    let jac = adj_mode.jacobian(0, 0, false, false).unwrap();
    assert!(!jac.downcast::<NumericJacobian>().unwrap().is_forward());
    let out = jac.call(&[DMatrix::column(&X3)]).unwrap();
    assert_matrix_eq(&rows(&out[0]), &fd, 1e-5);
}

#[test]
fn composite_directional_derivatives() {
    let h = field_twice(&Dict::new());
    let fwd = h.forward(1).unwrap();
    assert_eq!(fwd.name(), "fwd1_field_twice");
    assert_eq!(fwd.type_name(), "Composite");
    let y = field_twice_f64(&X3);
    let fd = fd_jacobian(field_twice_f64, &X3);

    let out = fwd
        .call(&[
            DMatrix::column(&X3),
            DMatrix::column(&y),
            DMatrix::column(&[0.0, 1.0, 0.0]),
        ])
        .unwrap();
    for r in 0..3 {
        assert_relative_eq!(out[0].nonzeros()[r], fd[r][1], epsilon = 1e-5);
    }

    let adj = h.reverse(1).unwrap();
    let out = adj
        .call(&[
            DMatrix::column(&X3),
            DMatrix::column(&y),
            DMatrix::column(&[0.0, 0.0, 1.0]),
        ])
        .unwrap();
    for c in 0..3 {
        assert_relative_eq!(out[0].nonzeros()[c], fd[2][c], epsilon = 1e-5);
    }
}

// ── Full Jacobians ──

#[test]
fn native_full_jacobian_spans_every_input_and_output() {
    let f = two_by_two();
    let full = f.full_jacobian().unwrap();
    assert_eq!(full.type_name(), "ScalarFunction");
    assert_eq!(full.sparsity_in(0).unwrap(), Sparsity::column(3));

    let (x, p) = ([1.5, -2.0], 0.5);
    let out = full.call(&[DMatrix::column(&[x[0], x[1], p])]).unwrap();
    assert_eq!(rows(&out[0]), two_by_two_full_jacobian(&x, p));
    assert_eq!(out[1].nonzeros(), &[0.75, 4.0, 0.0]);
}

#[test]
fn block_full_jacobian_of_a_composite() {
    let g = two_by_two();
    let x = Mx::sym("x", &Sparsity::column(2));
    let p = Mx::sym("p", &Sparsity::scalar());
    let y = Mx::call(&g, &[x.clone(), p.clone()]).unwrap();
    let h = Composite::function("wrapped", vec![x, p], y).unwrap();

    let full = h.full_jacobian().unwrap();
    assert_eq!(full.type_name(), "BlockJacobian");
    assert!(full.downcast::<BlockJacobian>().is_some());
    assert_eq!(full.sparsity_out(0).unwrap().shape(), (3, 3));
    assert_eq!(
        full.sparsity_out(0).unwrap(),
        g.full_jacobian().unwrap().sparsity_out(0).unwrap()
    );

    let (xv, pv) = ([0.25, 3.0], -1.5);
    let out = full.call(&[DMatrix::column(&[xv[0], xv[1], pv])]).unwrap();
    assert_matrix_eq(&rows(&out[0]), &two_by_two_full_jacobian(&xv, pv), 1e-14);
    assert_eq!(out[1].nonzeros(), &[-0.375, 9.0, 1.75]);
}

// ── Gradient, tangent, Hessian ──

#[test]
fn gradient_matches_closed_form() {
    let n = 4;
    let f = rosenbrock(n);
    let grad = f.gradient(0, 0).unwrap();
    assert_eq!(grad.name(), "grad_rosenbrock");
    assert_eq!(grad.output_names().unwrap(), vec!["grad", "f"]);

    let x = [-1.2, 1.0, 0.4, 0.9];
    let out = grad.call(&[DMatrix::column(&x)]).unwrap();
    for (g, e) in out[0].nonzeros().iter().zip(rosenbrock_grad(&x)) {
        assert_relative_eq!(*g, e, max_relative = 1e-12);
    }
    assert_relative_eq!(out[1].nonzeros()[0], rosenbrock_f64(&x), max_relative = 1e-14);
}

#[test]
fn gradient_needs_a_scalar_output() {
    let f = vector_field();
    assert!(matches!(
        f.gradient(0, 0),
        Err(Error::InconsistentDimension { .. })
    ));
}

#[test]
fn tangent_matches_closed_form() {
    let t = SxMatrix::sym("t", &Sparsity::scalar());
    let s = t.nonzeros()[0].clone();
    let y = SxMatrix::column(vec![s.sin(), &s * &s, s.exp()]);
    let f = ScalarFunction::function("curve", vec![t], vec![y]).unwrap();
    let tan = f.tangent(0, 0).unwrap();
    assert_eq!(tan.name(), "tangent_curve");

    let tv = 0.7_f64;
    let out = tan.call(&[DMatrix::scalar(tv)]).unwrap();
    let expected = [tv.cos(), 2.0 * tv, tv.exp()];
    for (g, e) in out[0].nonzeros().iter().zip(expected) {
        assert_relative_eq!(*g, e, max_relative = 1e-14);
    }

    let field = vector_field();
    assert!(matches!(
        field.tangent(0, 0),
        Err(Error::InconsistentDimension { .. })
    ));
}

#[test]
fn hessian_matches_closed_form() {
    let n = 5;
    let f = rosenbrock(n);
    let hess = f.hessian(0, 0).unwrap();
    assert_eq!(hess.output_names().unwrap(), vec!["jac", "grad", "f"]);
    assert_eq!(hess.sparsity_out(0).unwrap().shape(), (n, n));

    let x = [-1.2, 1.0, 0.5, 0.3, -0.7];
    let out = hess.call(&[DMatrix::column(&x)]).unwrap();
    assert_matrix_eq(&rows(&out[0]), &rosenbrock_hessian(&x), 1e-10);
    for (g, e) in out[1].nonzeros().iter().zip(rosenbrock_grad(&x)) {
        assert_relative_eq!(*g, e, max_relative = 1e-12);
    }
    assert_relative_eq!(out[2].nonzeros()[0], rosenbrock_f64(&x), max_relative = 1e-14);
}

#[test]
fn hessian_pattern_is_symmetric_and_banded() {
    let f = rosenbrock(6);
    let hess = f.hessian(0, 0).unwrap();
    let sp = hess.sparsity_out(0).unwrap();
    assert!(sp.is_symmetric());
    for (r, c) in sp.iter() {
        assert!(r.abs_diff(c) <= 1, "unexpected entry ({r}, {c})");
    }
}
