//! Jacobian sparsity of input/output blocks.
//!
//! Patterns are computed on the compact (`nnz_out x nnz_in`) form and cached
//! per block; the full (`numel_out x numel_in`) form is derived from it.

use super::Function;
use crate::element::BVEC_SIZE;
use crate::error::{Error, Result};
use crate::sparsity::propagate::{hierarchical, plain};
use crate::sparsity::Sparsity;

impl Function {
    /// Jacobian pattern of output `oind` with respect to input `iind`.
    ///
    /// `compact` gives the `nnz_out x nnz_in` pattern over the nonzeros,
    /// otherwise `numel_out x numel_in` over the dense entries. `symmetric`
    /// is a hint allowing the symmetric detector.
    pub fn jac_sparsity(
        &self,
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
    ) -> Result<Sparsity> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        {
            let st = self.state();
            let storage = if compact {
                &st.cache.jac_sparsity_compact
            } else {
                &st.cache.jac_sparsity
            };
            if let Some(sp) = storage.get(oind, iind) {
                return Ok(sp.clone());
            }
        }
        let sp = if compact {
            self.get_jac_sparsity(iind, oind, symmetric)?
        } else {
            let compact_sp = self.jac_sparsity(iind, oind, true, symmetric)?;
            self.expand_jac_sparsity(iind, oind, &compact_sp)?
        };
        let mut st = self.state_mut();
        let storage = if compact {
            &mut st.cache.jac_sparsity_compact
        } else {
            &mut st.cache.jac_sparsity
        };
        storage.insert(oind, iind, sp.clone());
        Ok(sp)
    }

    /// Override the cached pattern of one block.
    pub fn set_jac_sparsity(
        &self,
        sp: Sparsity,
        iind: usize,
        oind: usize,
        compact: bool,
    ) -> Result<()> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.require_init()?;
        let (sp_in, sp_out) = (self.sparsity_in(iind)?, self.sparsity_out(oind)?);
        let expected = if compact {
            (sp_out.nnz(), sp_in.nnz())
        } else {
            (sp_out.numel(), sp_in.numel())
        };
        if sp.shape() != expected {
            return Err(Error::dimension(
                &self.0.name,
                format!(
                    "Jacobian pattern for block ({oind}, {iind}) must be {}x{}, got {}x{}",
                    expected.0,
                    expected.1,
                    sp.nrow(),
                    sp.ncol()
                ),
            ));
        }
        let compact_sp = if compact {
            sp.clone()
        } else {
            // Entries outside the I/O patterns have no nonzero to land on.
            let entries: Vec<(usize, usize)> = sp
                .iter()
                .filter_map(|(r, c)| {
                    let ro = sp_out.get_nz(r % sp_out.nrow().max(1), r / sp_out.nrow().max(1))?;
                    let ci = sp_in.get_nz(c % sp_in.nrow().max(1), c / sp_in.nrow().max(1))?;
                    Some((ro, ci))
                })
                .collect();
            Sparsity::from_triplets(sp_out.nnz(), sp_in.nnz(), &entries)?
        };
        let mut st = self.state_mut();
        st.cache.jac_sparsity_compact.insert(oind, iind, compact_sp);
        if compact {
            st.cache.jac_sparsity.remove(oind, iind);
        } else {
            st.cache.jac_sparsity.insert(oind, iind, sp);
        }
        Ok(())
    }

    fn expand_jac_sparsity(&self, iind: usize, oind: usize, compact: &Sparsity) -> Result<Sparsity> {
        let (sp_in, sp_out) = (self.sparsity_in(iind)?, self.sparsity_out(oind)?);
        let (find_in, find_out) = (sp_in.find(), sp_out.find());
        let entries: Vec<(usize, usize)> = compact
            .iter()
            .map(|(r, c)| (find_out[r], find_in[c]))
            .collect();
        Sparsity::from_triplets(sp_out.numel(), sp_in.numel(), &entries)
    }

    /// Pick a detector for a block that is not cached yet.
    fn get_jac_sparsity(&self, iind: usize, oind: usize, symmetric: bool) -> Result<Sparsity> {
        let (nnz_in, nnz_out) = (self.nnz_in(iind)?, self.nnz_out(oind)?);
        let (fwd, adj) = {
            let kind = self.0.kind.borrow();
            (kind.sp_can_evaluate(true), kind.sp_can_evaluate(false))
        };
        if !fwd && !adj {
            return Ok(Sparsity::dense(nnz_out, nnz_in));
        }
        if nnz_in.min(nnz_out) <= 3 * BVEC_SIZE {
            self.jac_sparsity_plain(iind, oind)
        } else if symmetric && nnz_in == nnz_out {
            self.jac_sparsity_hierarchical_symm(iind, oind)
        } else {
            self.jac_sparsity_hierarchical(iind, oind)
        }
    }

    /// Weight of forward mode in sparsity propagation, see
    /// [`ad_weight`](Self::ad_weight).
    pub fn ad_weight_sp(&self) -> f64 {
        let kind = self.0.kind.borrow();
        if !kind.sp_can_evaluate(false) {
            0.0
        } else if !kind.sp_can_evaluate(true) {
            1.0
        } else {
            let fallback = self.state().options.ad_weight_sp;
            kind.ad_weight_sp().unwrap_or(fallback)
        }
    }

    /// Forward when `w * fwd_sweeps <= (1 - w) * adj_sweeps`.
    fn sp_use_forward(&self, nnz_in: usize, nnz_out: usize) -> bool {
        let w = self.ad_weight_sp();
        let fwd_cost = nnz_in.div_ceil(BVEC_SIZE) as f64;
        let adj_cost = nnz_out.div_ceil(BVEC_SIZE) as f64;
        w * fwd_cost <= (1.0 - w) * adj_cost
    }

    /// Compact block pattern with one distinguishing mark per seed.
    pub fn jac_sparsity_plain(&self, iind: usize, oind: usize) -> Result<Sparsity> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        let (nnz_in, nnz_out) = (self.nnz_in(iind)?, self.nnz_out(oind)?);
        if self.sp_use_forward(nnz_in, nnz_out) {
            plain(nnz_out, nnz_in, |s| self.sweep_fwd(iind, oind, s))
        } else {
            Ok(plain(nnz_in, nnz_out, |s| self.sweep_adj(iind, oind, s))?.transpose())
        }
    }

    /// Compact block pattern by coarse-to-fine block refinement.
    pub fn jac_sparsity_hierarchical(&self, iind: usize, oind: usize) -> Result<Sparsity> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        let (nnz_in, nnz_out) = (self.nnz_in(iind)?, self.nnz_out(oind)?);
        if self.sp_use_forward(nnz_in, nnz_out) {
            hierarchical(nnz_out, nnz_in, false, |s| self.sweep_fwd(iind, oind, s))
        } else {
            Ok(
                hierarchical(nnz_in, nnz_out, false, |s| self.sweep_adj(iind, oind, s))?
                    .transpose(),
            )
        }
    }

    /// Hierarchical detection for a square, structurally symmetric block,
    /// using star coloring.
    pub fn jac_sparsity_hierarchical_symm(&self, iind: usize, oind: usize) -> Result<Sparsity> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        let (nnz_in, nnz_out) = (self.nnz_in(iind)?, self.nnz_out(oind)?);
        if nnz_in != nnz_out {
            return Err(Error::dimension(
                &self.0.name,
                format!("symmetric detection needs a square block, got {nnz_out}x{nnz_in}"),
            ));
        }
        let fwd = self.0.kind.borrow().sp_can_evaluate(true);
        if fwd {
            hierarchical(nnz_out, nnz_in, true, |s| self.sweep_fwd(iind, oind, s))
        } else {
            Ok(hierarchical(nnz_in, nnz_out, true, |s| self.sweep_adj(iind, oind, s))?.transpose())
        }
    }
}
