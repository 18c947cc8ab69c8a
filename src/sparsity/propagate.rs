//! Jacobian sparsity detection from bitvector sweeps.
//!
//! A sweep seeds one bitvector per seed coordinate and reports, for every
//! read coordinate, the OR of the seeds it structurally depends on. Each bit
//! is an independent lane, so 64 seed groups travel through one sweep.
//! The detectors here only see the sweep as a closure; whether it walks
//! forward (seeds on inputs) or backward (seeds on outputs) is the caller's
//! business. The returned pattern is `nread x nseed`.

use std::collections::{BTreeMap, BTreeSet};

use super::{column_coloring, star_coloring, Sparsity};
use crate::element::{Bvec, BVEC_SIZE};
use crate::error::Result;

/// Block granularity of hierarchical refinement. Block sizes are powers of
/// this, so every fine block lies inside exactly one coarse block.
pub(crate) const GRANULARITY: usize = 8;

/// One distinguishing bit per seed coordinate, `BVEC_SIZE` seeds per sweep.
pub(crate) fn plain<F>(nread: usize, nseed: usize, mut sweep: F) -> Result<Sparsity>
where
    F: FnMut(&[Bvec]) -> Result<Vec<Bvec>>,
{
    let mut entries = Vec::new();
    let mut seeds = vec![0 as Bvec; nseed];
    for start in (0..nseed).step_by(BVEC_SIZE) {
        let end = (start + BVEC_SIZE).min(nseed);
        seeds.iter_mut().for_each(|s| *s = 0);
        for (c, seed) in seeds.iter_mut().enumerate().take(end).skip(start) {
            *seed = 1 << (c - start);
        }
        let marks = sweep(&seeds)?;
        for (r, &m) in marks.iter().enumerate().take(nread) {
            for bit in bits(m) {
                entries.push((r, start + bit));
            }
        }
    }
    Sparsity::from_triplets(nread, nseed, &entries)
}

/// Coarse-to-fine detection over nested square blocks.
///
/// At every level the candidates are the children of the blocks found
/// connected one level up. Candidate seed blocks are colored so that within a
/// block row all candidates of one color can be told apart (column coloring,
/// or star coloring with mirror recovery when `symmetric`). Each color is one
/// bit lane, so a level costs `ceil(colors / 64)` sweeps. Because propagation
/// is a union over seeds and the coarse pattern is exact, every hit is
/// attributed to exactly the right candidate and the final level reproduces
/// [`plain`].
pub(crate) fn hierarchical<F>(
    nread: usize,
    nseed: usize,
    symmetric: bool,
    mut sweep: F,
) -> Result<Sparsity>
where
    F: FnMut(&[Bvec]) -> Result<Vec<Bvec>>,
{
    if nread == 0 || nseed == 0 {
        return Ok(Sparsity::empty(nread, nseed));
    }

    let mut block = GRANULARITY;
    while block < nread.max(nseed) {
        block *= GRANULARITY;
    }
    // Single block covering everything; assumed connected.
    let mut coarse = Sparsity::dense(1, 1);
    let mut seeds = vec![0 as Bvec; nseed];

    while block > 1 {
        let fine = block / GRANULARITY;
        let nrb = nread.div_ceil(fine);
        let ncb = nseed.div_ceil(fine);

        // ── Candidates: children of connected coarse blocks ──
        let mut children = Vec::new();
        for (rb, cb) in coarse.iter() {
            let rows = rb * GRANULARITY..((rb + 1) * GRANULARITY).min(nrb);
            for rr in rows {
                let cols = cb * GRANULARITY..((cb + 1) * GRANULARITY).min(ncb);
                for cc in cols {
                    children.push((rr, cc));
                }
            }
        }
        let candidates = Sparsity::from_triplets(nrb, ncb, &children)?;
        let (colors, num_colors) = if symmetric {
            star_coloring(&candidates)
        } else {
            column_coloring(&candidates)
        };

        // ── Sweeps: one lane per color ──
        let mut hits: BTreeSet<(usize, usize)> = BTreeSet::new();
        for batch in 0..num_colors.div_ceil(BVEC_SIZE) {
            for (c, seed) in seeds.iter_mut().enumerate() {
                let color = colors[c / fine];
                *seed = if color / BVEC_SIZE == batch {
                    1 << (color % BVEC_SIZE)
                } else {
                    0
                };
            }
            let marks = sweep(&seeds)?;
            for (r, &m) in marks.iter().enumerate().take(nread) {
                for bit in bits(m) {
                    hits.insert((r / fine, batch * BVEC_SIZE + bit));
                }
            }
        }

        // ── Attribution ──
        let mut per_row_color: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for (rb, cb) in candidates.iter() {
            *per_row_color.entry((rb, colors[cb])).or_insert(0) += 1;
        }
        let unique = |rb: usize, color: usize| per_row_color.get(&(rb, color)) == Some(&1);

        let mut connected = Vec::new();
        for (rb, cb) in candidates.iter() {
            let direct = unique(rb, colors[cb]);
            let hit = if direct {
                hits.contains(&(rb, colors[cb]))
            } else if symmetric && rb < ncb && cb < nrb && unique(cb, colors[rb]) {
                hits.contains(&(cb, colors[rb]))
            } else {
                // Ambiguous (only for non-symmetric input to the symmetric
                // variant): keep it, the pattern stays sound.
                hits.contains(&(rb, colors[cb]))
            };
            if hit {
                connected.push((rb, cb));
            }
        }
        coarse = Sparsity::from_triplets(nrb, ncb, &connected)?;
        block = fine;
    }

    Ok(coarse)
}

/// Positions of the set bits of `m`, lowest first.
fn bits(mut m: Bvec) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if m == 0 {
            return None;
        }
        let bit = m.trailing_zeros() as usize;
        m &= m - 1;
        Some(bit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sweep over an explicit boolean pattern (`nread x nseed`).
    fn oracle(pattern: &Sparsity) -> impl FnMut(&[Bvec]) -> Result<Vec<Bvec>> + '_ {
        move |seeds: &[Bvec]| {
            let mut marks = vec![0 as Bvec; pattern.nrow()];
            for (r, c) in pattern.iter() {
                marks[r] |= seeds[c];
            }
            Ok(marks)
        }
    }

    fn banded(n: usize, half: usize) -> Sparsity {
        let mut entries = Vec::new();
        for i in 0..n {
            for j in i.saturating_sub(half)..(i + half + 1).min(n) {
                entries.push((i, j));
            }
        }
        Sparsity::from_triplets(n, n, &entries).unwrap()
    }

    #[test]
    fn plain_recovers_pattern() {
        let sp = Sparsity::from_triplets(3, 70, &[(0, 0), (1, 65), (2, 69), (2, 3)]).unwrap();
        let found = plain(3, 70, oracle(&sp)).unwrap();
        assert_eq!(found, sp);
    }

    #[test]
    fn hierarchical_matches_plain_on_banded() {
        let sp = banded(300, 2);
        let plain_sp = plain(300, 300, oracle(&sp)).unwrap();
        let hier = hierarchical(300, 300, false, oracle(&sp)).unwrap();
        let symm = hierarchical(300, 300, true, oracle(&sp)).unwrap();
        assert_eq!(plain_sp, sp);
        assert_eq!(hier, sp);
        assert_eq!(symm, sp);
    }

    #[test]
    fn hierarchical_rectangular_and_tiny() {
        let sp = Sparsity::from_triplets(5, 130, &[(0, 129), (4, 0), (2, 64)]).unwrap();
        assert_eq!(hierarchical(5, 130, false, oracle(&sp)).unwrap(), sp);
        let one = Sparsity::dense(1, 1);
        assert_eq!(hierarchical(1, 1, false, oracle(&one)).unwrap(), one);
        let none = Sparsity::empty(1, 1);
        assert_eq!(hierarchical(1, 1, false, oracle(&none)).unwrap(), none);
    }

    #[test]
    fn hierarchical_needs_few_sweeps_on_diagonal() {
        let sp = Sparsity::diagonal(4096);
        let mut sweeps = 0;
        let mut inner = oracle(&sp);
        let found = hierarchical(4096, 4096, false, |s: &[Bvec]| {
            sweeps += 1;
            inner(s)
        })
        .unwrap();
        assert_eq!(found, sp);
        // plain would need 4096 / 64 = 64 sweeps
        assert!(sweeps < 64, "used {sweeps} sweeps");
    }
}
