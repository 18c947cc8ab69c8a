//! Sparse two-dimensional associative storage.

use std::collections::BTreeMap;

/// Values keyed by `(row, col)`; only realized keys occupy space.
///
/// Derivative caches use one of these per Jacobian flavor, keyed by
/// `(output index, input index)`.
#[derive(Clone, Debug)]
pub struct SparseStorage<T> {
    nrow: usize,
    ncol: usize,
    entries: BTreeMap<(usize, usize), T>,
}

impl<T> Default for SparseStorage<T> {
    fn default() -> Self {
        SparseStorage {
            nrow: 0,
            ncol: 0,
            entries: BTreeMap::new(),
        }
    }
}

impl<T> SparseStorage<T> {
    pub fn new(nrow: usize, ncol: usize) -> Self {
        SparseStorage {
            nrow,
            ncol,
            entries: BTreeMap::new(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    /// Drop all entries and change the key range.
    pub fn reset(&mut self, nrow: usize, ncol: usize) {
        self.nrow = nrow;
        self.ncol = ncol;
        self.entries.clear();
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        self.entries.get(&(row, col))
    }

    pub fn insert(&mut self, row: usize, col: usize, value: T) -> Option<T> {
        debug_assert!(row < self.nrow && col < self.ncol);
        self.entries.insert((row, col), value)
    }

    pub fn remove(&mut self, row: usize, col: usize) -> Option<T> {
        self.entries.remove(&(row, col))
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.entries.contains_key(&(row, col))
    }

    /// Number of realized entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &T)> {
        self.entries.iter().map(|(&k, v)| (k, v))
    }
}
