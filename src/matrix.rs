//! Numeric sparse matrices used for function inputs and outputs.

use crate::error::{Error, Result};
use crate::sparsity::Sparsity;

/// A sparsity pattern together with one `f64` per structural nonzero.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DMatrix {
    sparsity: Sparsity,
    nz: Vec<f64>,
}

impl DMatrix {
    pub fn new(sparsity: Sparsity, nz: Vec<f64>) -> Result<Self> {
        if nz.len() != sparsity.nnz() {
            return Err(Error::dimension(
                "DMatrix",
                format!(
                    "{} nonzeros given for a pattern with {}",
                    nz.len(),
                    sparsity.nnz()
                ),
            ));
        }
        Ok(DMatrix { sparsity, nz })
    }

    /// Every structural nonzero set to `value`.
    pub fn filled(sparsity: Sparsity, value: f64) -> Self {
        let nz = vec![value; sparsity.nnz()];
        DMatrix { sparsity, nz }
    }

    pub fn zeros(sparsity: Sparsity) -> Self {
        Self::filled(sparsity, 0.0)
    }

    pub fn scalar(value: f64) -> Self {
        DMatrix {
            sparsity: Sparsity::scalar(),
            nz: vec![value],
        }
    }

    /// Dense column vector.
    pub fn column(values: &[f64]) -> Self {
        DMatrix {
            sparsity: Sparsity::column(values.len()),
            nz: values.to_vec(),
        }
    }

    /// Dense matrix from column-major data.
    pub fn dense(nrow: usize, ncol: usize, data: &[f64]) -> Result<Self> {
        Self::new(Sparsity::dense(nrow, ncol), data.to_vec())
    }

    #[inline]
    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }

    #[inline]
    pub fn nonzeros(&self) -> &[f64] {
        &self.nz
    }

    #[inline]
    pub fn nonzeros_mut(&mut self) -> &mut [f64] {
        &mut self.nz
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.nz.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.sparsity.shape()
    }

    /// Entry `(r, c)`, zero when not structurally present.
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.sparsity.get_nz(r, c).map_or(0.0, |k| self.nz[k])
    }

    /// Dense column-major copy.
    pub fn to_dense(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.sparsity.numel()];
        let nrow = self.sparsity.nrow();
        for ((r, c), &v) in self.sparsity.iter().zip(self.nz.iter()) {
            out[r + c * nrow] = v;
        }
        out
    }

    /// Same values on another pattern of the same shape; entries outside
    /// the source pattern become zero, entries outside the target are dropped.
    pub fn project(&self, sparsity: &Sparsity) -> Result<DMatrix> {
        if sparsity.shape() != self.shape() {
            let (r, c) = self.shape();
            return Err(Error::dimension(
                "DMatrix",
                format!(
                    "cannot project {r}x{c} onto {}x{}",
                    sparsity.nrow(),
                    sparsity.ncol()
                ),
            ));
        }
        if *sparsity == self.sparsity {
            return Ok(self.clone());
        }
        let nz = sparsity.iter().map(|(r, c)| self.get(r, c)).collect();
        Ok(DMatrix {
            sparsity: sparsity.clone(),
            nz,
        })
    }

    /// True when every nonzero is finite.
    pub fn is_regular(&self) -> bool {
        self.nz.iter().all(|v| v.is_finite())
    }
}
