//! Symbolic seed generation for derivative construction.
//!
//! Forward and reverse derivatives of expression-based kinds are built by
//! substituting fresh named symbols for the directional seeds. The naming is
//! stable so that generated functions stay readable.

use crate::sparsity::Sparsity;

/// What seed generation needs from an expression representation.
pub trait SymbolicMatrix: Clone {
    /// Fresh symbolic matrix named `name` with the given pattern.
    fn sym(name: &str, sparsity: &Sparsity) -> Self;

    /// True when structurally zero (no symbol could make it nonzero).
    fn is_zero(&self) -> bool;

    fn sparsity(&self) -> Sparsity;
}

/// One forward seed per direction and input: `f{dir}_{i}`, or `f_{i}` for a
/// single direction.
pub fn symbolic_fwd_seed<M: SymbolicMatrix>(nfwd: usize, v: &[M]) -> Vec<Vec<M>> {
    (0..nfwd)
        .map(|dir| {
            v.iter()
                .enumerate()
                .map(|(i, vi)| {
                    let name = if nfwd > 1 {
                        format!("f{dir}_{i}")
                    } else {
                        format!("f_{i}")
                    };
                    M::sym(&name, &vi.sparsity())
                })
                .collect()
        })
        .collect()
}

/// One adjoint seed per direction and output: `a{dir}_{o}`, or `a{o}` for a
/// single direction.
pub fn symbolic_adj_seed<M: SymbolicMatrix>(nadj: usize, v: &[M]) -> Vec<Vec<M>> {
    (0..nadj)
        .map(|dir| {
            v.iter()
                .enumerate()
                .map(|(o, vo)| {
                    let name = if nadj > 1 {
                        format!("a{dir}_{o}")
                    } else {
                        format!("a{o}")
                    };
                    M::sym(&name, &vo.sparsity())
                })
                .collect()
        })
        .collect()
}

/// True when every seed of one direction is structurally zero, so the whole
/// direction can be skipped.
pub fn purgable<M: SymbolicMatrix>(seeds: &[M]) -> bool {
    seeds.iter().all(M::is_zero)
}
