//! Compressed-column sparsity patterns.
//!
//! A [`Sparsity`] describes which entries of a matrix may be structurally
//! nonzero. Nonzeros are stored column by column, rows strictly increasing
//! within a column. Every function input and output carries one, and the
//! Jacobian sparsity engine produces them.

use std::fmt;

use crate::error::{Error, Result};

mod coloring;
pub(crate) mod propagate;

pub use coloring::{column_coloring, row_coloring, star_coloring};

/// Immutable compressed-column sparsity pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sparsity {
    nrow: usize,
    ncol: usize,
    colind: Vec<usize>,
    row: Vec<usize>,
}

impl Sparsity {
    /// Build a pattern from its compressed-column parts, validating them.
    pub fn new(nrow: usize, ncol: usize, colind: Vec<usize>, row: Vec<usize>) -> Result<Self> {
        if colind.len() != ncol + 1 {
            return Err(Error::dimension(
                "Sparsity",
                format!("colind has length {}, expected {}", colind.len(), ncol + 1),
            ));
        }
        if colind[0] != 0 || colind[ncol] != row.len() {
            return Err(Error::dimension(
                "Sparsity",
                format!(
                    "colind must start at 0 and end at {}, got [{}, {}]",
                    row.len(),
                    colind[0],
                    colind[ncol]
                ),
            ));
        }
        for c in 0..ncol {
            if colind[c] > colind[c + 1] {
                return Err(Error::dimension("Sparsity", "colind is not monotone"));
            }
            let rows = &row[colind[c]..colind[c + 1]];
            for (k, &r) in rows.iter().enumerate() {
                if r >= nrow {
                    return Err(Error::dimension(
                        "Sparsity",
                        format!("row index {r} out of bounds for {nrow} rows"),
                    ));
                }
                if k > 0 && rows[k - 1] >= r {
                    return Err(Error::dimension(
                        "Sparsity",
                        format!("row indices of column {c} are not strictly increasing"),
                    ));
                }
            }
        }
        Ok(Sparsity {
            nrow,
            ncol,
            colind,
            row,
        })
    }

    /// Fully dense `nrow x ncol` pattern.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        Sparsity {
            nrow,
            ncol,
            colind: (0..=ncol).map(|c| c * nrow).collect(),
            row: (0..ncol).flat_map(|_| 0..nrow).collect(),
        }
    }

    /// `nrow x ncol` pattern without any structural nonzero.
    pub fn empty(nrow: usize, ncol: usize) -> Self {
        Sparsity {
            nrow,
            ncol,
            colind: vec![0; ncol + 1],
            row: Vec::new(),
        }
    }

    /// Dense 1x1 pattern.
    pub fn scalar() -> Self {
        Self::dense(1, 1)
    }

    /// Dense column vector.
    pub fn column(n: usize) -> Self {
        Self::dense(n, 1)
    }

    /// Square diagonal pattern.
    pub fn diagonal(n: usize) -> Self {
        Sparsity {
            nrow: n,
            ncol: n,
            colind: (0..=n).collect(),
            row: (0..n).collect(),
        }
    }

    /// Build a pattern from `(row, col)` coordinates in any order.
    ///
    /// Duplicates are merged.
    pub fn from_triplets(nrow: usize, ncol: usize, entries: &[(usize, usize)]) -> Result<Self> {
        let mut sorted: Vec<(usize, usize)> = Vec::with_capacity(entries.len());
        for &(r, c) in entries {
            if r >= nrow || c >= ncol {
                return Err(Error::dimension(
                    "Sparsity",
                    format!("entry ({r}, {c}) out of bounds for {nrow}x{ncol}"),
                ));
            }
            sorted.push((c, r));
        }
        sorted.sort_unstable();
        sorted.dedup();

        let mut colind = vec![0usize; ncol + 1];
        for &(c, _) in &sorted {
            colind[c + 1] += 1;
        }
        for c in 0..ncol {
            colind[c + 1] += colind[c];
        }
        let row = sorted.into_iter().map(|(_, r)| r).collect();
        Ok(Sparsity {
            nrow,
            ncol,
            colind,
            row,
        })
    }

    /// Rebuild a pattern from the flat `[nrow, ncol, colind.., row..]` layout
    /// produced by [`compressed`](Self::compressed).
    pub fn from_compressed(data: &[usize]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::dimension("Sparsity", "compressed pattern too short"));
        }
        let (nrow, ncol) = (data[0], data[1]);
        if data.len() < 3 + ncol {
            return Err(Error::dimension("Sparsity", "compressed pattern too short"));
        }
        let colind = data[2..3 + ncol].to_vec();
        let nnz = colind[ncol];
        if data.len() != 3 + ncol + nnz {
            return Err(Error::dimension(
                "Sparsity",
                format!(
                    "compressed pattern has length {}, expected {}",
                    data.len(),
                    3 + ncol + nnz
                ),
            ));
        }
        Self::new(nrow, ncol, colind, data[3 + ncol..].to_vec())
    }

    /// Flat `[nrow, ncol, colind.., row..]` layout used by generated code.
    pub fn compressed(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(3 + self.ncol + self.row.len());
        out.push(self.nrow);
        out.push(self.ncol);
        out.extend_from_slice(&self.colind);
        out.extend_from_slice(&self.row);
        out
    }

    #[inline]
    pub fn nrow(&self) -> usize {
        self.nrow
    }

    #[inline]
    pub fn ncol(&self) -> usize {
        self.ncol
    }

    /// `(nrow, ncol)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    /// Number of structural nonzeros.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.row.len()
    }

    /// Number of entries of the dense matrix, `nrow * ncol`.
    #[inline]
    pub fn numel(&self) -> usize {
        self.nrow * self.ncol
    }

    #[inline]
    pub fn colind(&self) -> &[usize] {
        &self.colind
    }

    #[inline]
    pub fn row(&self) -> &[usize] {
        &self.row
    }

    pub fn is_dense(&self) -> bool {
        self.nnz() == self.numel()
    }

    /// True for a 1x1 shape, whether or not the entry is structural.
    pub fn is_scalar(&self) -> bool {
        self.nrow == 1 && self.ncol == 1
    }

    pub fn is_square(&self) -> bool {
        self.nrow == self.ncol
    }

    /// True when there are no structural nonzeros.
    pub fn is_empty(&self) -> bool {
        self.row.is_empty()
    }

    /// Position of entry `(r, c)` among the nonzeros, if structurally present.
    pub fn get_nz(&self, r: usize, c: usize) -> Option<usize> {
        if r >= self.nrow || c >= self.ncol {
            return None;
        }
        let start = self.colind[c];
        let rows = &self.row[start..self.colind[c + 1]];
        rows.binary_search(&r).ok().map(|k| start + k)
    }

    pub fn has_nz(&self, r: usize, c: usize) -> bool {
        self.get_nz(r, c).is_some()
    }

    /// Iterate `(row, col)` of every nonzero, in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.ncol).flat_map(move |c| {
            self.row[self.colind[c]..self.colind[c + 1]]
                .iter()
                .map(move |&r| (r, c))
        })
    }

    /// `(row, col)` of every nonzero, in storage order.
    pub fn triplets(&self) -> Vec<(usize, usize)> {
        self.iter().collect()
    }

    /// Column-major linear index `r + c * nrow` of every nonzero.
    pub fn find(&self) -> Vec<usize> {
        self.iter().map(|(r, c)| r + c * self.nrow).collect()
    }

    pub fn transpose(&self) -> Sparsity {
        let mut colind = vec![0usize; self.nrow + 1];
        for &r in &self.row {
            colind[r + 1] += 1;
        }
        for r in 0..self.nrow {
            colind[r + 1] += colind[r];
        }
        let mut next = colind.clone();
        let mut row = vec![0usize; self.nnz()];
        for (r, c) in self.iter() {
            row[next[r]] = c;
            next[r] += 1;
        }
        Sparsity {
            nrow: self.ncol,
            ncol: self.nrow,
            colind,
            row,
        }
    }

    /// Square and equal to its own transpose.
    pub fn is_symmetric(&self) -> bool {
        self.is_square() && *self == self.transpose()
    }

    /// Pattern containing the nonzeros of both operands.
    pub fn union(&self, other: &Sparsity) -> Result<Sparsity> {
        if self.shape() != other.shape() {
            return Err(Error::dimension(
                "Sparsity",
                format!(
                    "union of {}x{} and {}x{}",
                    self.nrow, self.ncol, other.nrow, other.ncol
                ),
            ));
        }
        let entries: Vec<(usize, usize)> = self.iter().chain(other.iter()).collect();
        Self::from_triplets(self.nrow, self.ncol, &entries)
    }
}

impl fmt::Display for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}, {} nnz", self.nrow, self.ncol, self.nnz())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplets_are_sorted_column_major() {
        let sp = Sparsity::from_triplets(3, 3, &[(2, 0), (0, 1), (0, 0), (2, 0)]).unwrap();
        assert_eq!(sp.nnz(), 3);
        assert_eq!(sp.colind(), &[0, 2, 3, 3]);
        assert_eq!(sp.row(), &[0, 2, 0]);
        assert_eq!(sp.get_nz(2, 0), Some(1));
        assert_eq!(sp.get_nz(1, 1), None);
    }

    #[test]
    fn transpose_swaps_coordinates() {
        let sp = Sparsity::from_triplets(2, 3, &[(0, 2), (1, 0), (1, 1)]).unwrap();
        let t = sp.transpose();
        assert_eq!(t.shape(), (3, 2));
        for (r, c) in sp.iter() {
            assert!(t.has_nz(c, r));
        }
        assert_eq!(t.transpose(), sp);
    }

    #[test]
    fn compressed_layout_round_trips() {
        let sp = Sparsity::from_triplets(4, 2, &[(3, 0), (1, 1)]).unwrap();
        let flat = sp.compressed();
        assert_eq!(flat, vec![4, 2, 0, 1, 2, 3, 1]);
        assert_eq!(Sparsity::from_compressed(&flat).unwrap(), sp);
    }

    #[test]
    fn invalid_parts_are_rejected() {
        assert!(Sparsity::new(2, 1, vec![0, 2], vec![1, 0]).is_err());
        assert!(Sparsity::new(2, 1, vec![0, 1], vec![2]).is_err());
        assert!(Sparsity::new(2, 1, vec![0], vec![]).is_err());
    }
}
