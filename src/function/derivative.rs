//! The derivative cache: forward, reverse and Jacobian functions built on
//! demand and remembered through weak references.

use std::collections::BTreeMap;

use super::{Function, WeakFunction};
use crate::error::{Error, Result};
use crate::jacobian::{BlockJacobian, JacobianProduct, NumericJacobian};
use crate::mx::{Composite, Mx};
use crate::sparsity::Sparsity;
use crate::storage::SparseStorage;

/// State of one derivative cache slot.
#[derive(Clone, Debug)]
pub enum CacheEntry {
    /// Never computed.
    Missing,
    /// Computed once, but every strong handle has since been dropped.
    Expired,
    Alive(Function),
}

impl CacheEntry {
    fn from_slot(slot: Option<&WeakFunction>) -> CacheEntry {
        match slot {
            None => CacheEntry::Missing,
            Some(w) => w.upgrade().map_or(CacheEntry::Expired, CacheEntry::Alive),
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, CacheEntry::Alive(_))
    }
}

/// Weak derivative slots and cached Jacobian patterns of one node. Block
/// storages are keyed `(output index, input index)`.
#[derive(Default)]
pub(super) struct DerivativeCache {
    pub(super) forward: BTreeMap<usize, WeakFunction>,
    pub(super) reverse: BTreeMap<usize, WeakFunction>,
    pub(super) jac: SparseStorage<WeakFunction>,
    pub(super) jac_compact: SparseStorage<WeakFunction>,
    pub(super) full_jacobian: Option<WeakFunction>,
    pub(super) jac_sparsity: SparseStorage<Sparsity>,
    pub(super) jac_sparsity_compact: SparseStorage<Sparsity>,
}

impl DerivativeCache {
    pub(super) fn new(n_in: usize, n_out: usize) -> Self {
        DerivativeCache {
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
            jac: SparseStorage::new(n_out, n_in),
            jac_compact: SparseStorage::new(n_out, n_in),
            full_jacobian: None,
            jac_sparsity: SparseStorage::new(n_out, n_in),
            jac_sparsity_compact: SparseStorage::new(n_out, n_in),
        }
    }
}

impl Function {
    // ── Capabilities ──

    pub fn has_forward(&self) -> bool {
        self.0.kind.borrow().has_forward()
    }

    pub fn has_reverse(&self) -> bool {
        self.0.kind.borrow().has_reverse()
    }

    /// Any way of differentiating this function exists.
    pub fn has_derivative(&self) -> bool {
        let kind = self.0.kind.borrow();
        kind.has_forward() || kind.has_reverse() || kind.has_jacobian()
    }

    /// Weight `w` in `[0, 1]` of forward mode: forward is preferred when
    /// `w * forward_cost <= (1 - w) * reverse_cost`. A missing mode forces the
    /// other one.
    pub fn ad_weight(&self) -> f64 {
        let kind = self.0.kind.borrow();
        if !kind.has_reverse() {
            0.0
        } else if !kind.has_forward() {
            1.0
        } else {
            let fallback = self.state().options.ad_weight;
            kind.ad_weight().unwrap_or(fallback)
        }
    }

    // ── Slot queries ──

    pub fn cached_forward(&self, nfwd: usize) -> CacheEntry {
        CacheEntry::from_slot(self.state().cache.forward.get(&nfwd))
    }

    pub fn cached_reverse(&self, nadj: usize) -> CacheEntry {
        CacheEntry::from_slot(self.state().cache.reverse.get(&nadj))
    }

    pub fn cached_jacobian(&self, iind: usize, oind: usize, compact: bool) -> CacheEntry {
        let st = self.state();
        let storage = if compact {
            &st.cache.jac_compact
        } else {
            &st.cache.jac
        };
        CacheEntry::from_slot(storage.get(oind, iind))
    }

    pub fn cached_full_jacobian(&self) -> CacheEntry {
        CacheEntry::from_slot(self.state().cache.full_jacobian.as_ref())
    }

    /// Resolve a slot; an expired one is counted and treated as missing.
    fn resolve(&self, entry: CacheEntry, what: &str) -> Option<Function> {
        match entry {
            CacheEntry::Alive(f) => Some(f),
            CacheEntry::Expired => {
                self.record(|d| d.increment("cache_rebuilds"));
                self.log(format_args!("rebuilding expired {what}"));
                None
            }
            CacheEntry::Missing => None,
        }
    }

    // ── Forward and reverse ──

    /// Function evaluating `nfwd` forward directional derivatives.
    ///
    /// Inputs are `[x.., y.., seed_0.., seed_1.., ..]` with one seed per input
    /// and direction; outputs one sensitivity per output and direction.
    /// Without a native forward mode, or past `jac_penalty` directions per
    /// input nonzero, the result multiplies Jacobian blocks with the seeds.
    pub fn forward(&self, nfwd: usize) -> Result<Function> {
        self.ensure_ready()?;
        if let Some(f) = self.resolve(self.cached_forward(nfwd), "forward") {
            return Ok(f);
        }
        let built = if self.fwd_via_jac(nfwd)? {
            Function::new(
                format!("fwd{nfwd}_{}", self.0.name),
                JacobianProduct::new(self, nfwd, true)?,
            )
        } else {
            let kind = self.0.kind.borrow();
            if !kind.has_forward() {
                return Err(Error::unsupported(&self.0.name, "forward"));
            }
            kind.get_forward(self, nfwd)?
        };
        self.install_forward(&built, nfwd)?;
        self.log(format_args!("built {}", built.name()));
        Ok(built)
    }

    /// Function evaluating `nadj` adjoint directional derivatives.
    ///
    /// Inputs are `[x.., y.., seed_0.., ..]` with one seed per output and
    /// direction; outputs one sensitivity per input and direction. Falls
    /// back to Jacobian blocks like [`forward`](Self::forward).
    pub fn reverse(&self, nadj: usize) -> Result<Function> {
        self.ensure_ready()?;
        if let Some(f) = self.resolve(self.cached_reverse(nadj), "reverse") {
            return Ok(f);
        }
        let built = if self.adj_via_jac(nadj)? {
            Function::new(
                format!("adj{nadj}_{}", self.0.name),
                JacobianProduct::new(self, nadj, false)?,
            )
        } else {
            let kind = self.0.kind.borrow();
            if !kind.has_reverse() {
                return Err(Error::unsupported(&self.0.name, "reverse"));
            }
            kind.get_reverse(self, nadj)?
        };
        self.install_reverse(&built, nadj)?;
        self.log(format_args!("built {}", built.name()));
        Ok(built)
    }

    fn fwd_via_jac(&self, nfwd: usize) -> Result<bool> {
        let (native, other) = {
            let kind = self.0.kind.borrow();
            (kind.has_forward(), kind.has_reverse() || kind.has_jacobian())
        };
        if !native {
            return Ok(other || self.jacobian_blocks_cached()?);
        }
        Ok(self.past_jac_penalty(nfwd, self.nnz_in_total()?))
    }

    fn adj_via_jac(&self, nadj: usize) -> Result<bool> {
        let (native, other) = {
            let kind = self.0.kind.borrow();
            (kind.has_reverse(), kind.has_forward() || kind.has_jacobian())
        };
        if !native {
            return Ok(other || self.jacobian_blocks_cached()?);
        }
        Ok(self.past_jac_penalty(nadj, self.nnz_out_total()?))
    }

    /// `ndir` directions cost more than `jac_penalty` Jacobian sweeps over
    /// `nnz` seeded nonzeros.
    fn past_jac_penalty(&self, ndir: usize, nnz: usize) -> bool {
        let penalty = self.state().options.jac_penalty;
        penalty >= 1.0 && penalty * (nnz as f64) < ndir as f64
    }

    /// Every structurally nonzero compact block has a live Jacobian, e.g.
    /// one injected with [`set_jacobian`](Self::set_jacobian).
    fn jacobian_blocks_cached(&self) -> Result<bool> {
        for o in 0..self.n_out() {
            for i in 0..self.n_in() {
                if !self.jac_sparsity(i, o, true, false)?.is_empty()
                    && !self.cached_jacobian(i, o, true).is_alive()
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Inject a forward derivative. The cache keeps only a weak reference.
    pub fn set_forward(&self, fwd: &Function, nfwd: usize) -> Result<()> {
        self.ensure_ready()?;
        self.install_forward(fwd, nfwd)
    }

    /// Inject a reverse derivative. The cache keeps only a weak reference.
    pub fn set_reverse(&self, adj: &Function, nadj: usize) -> Result<()> {
        self.ensure_ready()?;
        self.install_reverse(adj, nadj)
    }

    fn install_forward(&self, fwd: &Function, nfwd: usize) -> Result<()> {
        let (names_in, names_out) = (self.input_names()?, self.output_names()?);
        let mut ins = io_prefixed(&names_in, &names_out);
        let mut outs = Vec::new();
        for d in 0..nfwd {
            ins.extend(names_in.iter().map(|n| format!("fwd{d}_{n}")));
            outs.extend(names_out.iter().map(|n| format!("fwd{d}_{n}")));
        }
        self.prepare(fwd, ins, outs)?;

        let (sp_in, sp_out) = self.io_sparsities()?;
        let mut expected_in = [sp_in.clone(), sp_out.clone()].concat();
        let mut expected_out = Vec::new();
        for _ in 0..nfwd {
            expected_in.extend(sp_in.iter().cloned());
            expected_out.extend(sp_out.iter().cloned());
        }
        self.check_signature(fwd, "forward", &expected_in, &expected_out)?;
        self.state_mut().cache.forward.insert(nfwd, fwd.downgrade());
        Ok(())
    }

    fn install_reverse(&self, adj: &Function, nadj: usize) -> Result<()> {
        let (names_in, names_out) = (self.input_names()?, self.output_names()?);
        let mut ins = io_prefixed(&names_in, &names_out);
        let mut outs = Vec::new();
        for d in 0..nadj {
            ins.extend(names_out.iter().map(|n| format!("adj{d}_{n}")));
            outs.extend(names_in.iter().map(|n| format!("adj{d}_{n}")));
        }
        self.prepare(adj, ins, outs)?;

        let (sp_in, sp_out) = self.io_sparsities()?;
        let mut expected_in = [sp_in.clone(), sp_out.clone()].concat();
        let mut expected_out = Vec::new();
        for _ in 0..nadj {
            expected_in.extend(sp_out.iter().cloned());
            expected_out.extend(sp_in.iter().cloned());
        }
        self.check_signature(adj, "reverse", &expected_in, &expected_out)?;
        self.state_mut().cache.reverse.insert(nadj, adj.downgrade());
        Ok(())
    }

    // ── Jacobians ──

    /// Function returning the Jacobian block of output `oind` with respect
    /// to input `iind`, followed by all nominal outputs.
    ///
    /// The block is `nnz_out x nnz_in` when `compact`, else
    /// `numel_out x numel_in`. `symmetric` asks for symmetric recovery and
    /// requires input `iind` and output `oind` to share a pattern.
    pub fn jacobian(
        &self,
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
    ) -> Result<Function> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        if symmetric && self.sparsity_in(iind)? != self.sparsity_out(oind)? {
            return Err(Error::dimension(
                &self.0.name,
                format!("symmetric Jacobian needs input {iind} and output {oind} to share a pattern"),
            ));
        }
        let entry = self.cached_jacobian(iind, oind, compact);
        if let Some(f) = self.resolve(entry, "jacobian") {
            return Ok(f);
        }
        let native = self.0.kind.borrow().has_jacobian();
        let built = if native {
            self.0
                .kind
                .borrow()
                .get_jacobian(self, iind, oind, compact, symmetric)?
        } else {
            Function::new(
                format!("jac_{}", self.0.name),
                NumericJacobian::new(self, iind, oind, compact, symmetric)?,
            )
        };
        self.install_jacobian(&built, iind, oind, compact)?;
        self.log(format_args!("built {} for block ({oind}, {iind})", built.name()));
        Ok(built)
    }

    /// Inject a Jacobian block function.
    pub fn set_jacobian(&self, jac: &Function, iind: usize, oind: usize, compact: bool) -> Result<()> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        self.install_jacobian(jac, iind, oind, compact)
    }

    fn install_jacobian(&self, jac: &Function, iind: usize, oind: usize, compact: bool) -> Result<()> {
        let names_in = self.input_names()?;
        let mut names_out = vec!["jac".to_string()];
        names_out.extend(self.output_names()?);
        self.prepare(jac, names_in, names_out)?;

        let (sp_in, sp_out) = self.io_sparsities()?;
        if jac.n_out() != sp_out.len() + 1 {
            return Err(Error::dimension(
                jac.name(),
                format!(
                    "Jacobian function has {} outputs, expected {}",
                    jac.n_out(),
                    sp_out.len() + 1
                ),
            ));
        }
        let shape = if compact {
            (sp_out[oind].nnz(), sp_in[iind].nnz())
        } else {
            (sp_out[oind].numel(), sp_in[iind].numel())
        };
        let got = jac.sparsity_out(0)?.shape();
        if got != shape {
            return Err(Error::dimension(
                jac.name(),
                format!(
                    "Jacobian block is {}x{}, expected {}x{}",
                    got.0, got.1, shape.0, shape.1
                ),
            ));
        }
        let mut expected_out = vec![jac.sparsity_out(0)?];
        expected_out.extend(sp_out);
        self.check_signature(jac, "jacobian", &sp_in, &expected_out)?;

        let mut st = self.state_mut();
        let storage = if compact {
            &mut st.cache.jac_compact
        } else {
            &mut st.cache.jac
        };
        storage.insert(oind, iind, jac.downgrade());
        Ok(())
    }

    /// Jacobian of all output nonzeros with respect to all input nonzeros.
    ///
    /// One input `x` (every input's nonzeros, concatenated); outputs
    /// `jac` (`nnz_out_total x nnz_in_total`) and `f` (every output's
    /// nonzeros, concatenated).
    pub fn full_jacobian(&self) -> Result<Function> {
        self.ensure_ready()?;
        if let Some(f) = self.resolve(self.cached_full_jacobian(), "full_jacobian") {
            return Ok(f);
        }
        let native = self.0.kind.borrow().has_full_jacobian();
        let built = if native {
            self.0.kind.borrow().get_full_jacobian(self)?
        } else {
            Function::new(format!("fulljac_{}", self.0.name), BlockJacobian::new(self)?)
        };
        self.prepare(&built, vec!["x".into()], vec!["jac".into(), "f".into()])?;

        let (nnz_in, nnz_out) = (self.nnz_in_total()?, self.nnz_out_total()?);
        if built.n_out() != 2 {
            return Err(Error::dimension(
                built.name(),
                format!("full Jacobian has {} outputs, expected 2", built.n_out()),
            ));
        }
        let jac_sp = built.sparsity_out(0)?;
        if jac_sp.shape() != (nnz_out, nnz_in) {
            return Err(Error::dimension(
                built.name(),
                format!(
                    "full Jacobian is {}x{}, expected {nnz_out}x{nnz_in}",
                    jac_sp.nrow(),
                    jac_sp.ncol()
                ),
            ));
        }
        self.check_signature(
            &built,
            "full_jacobian",
            &[Sparsity::column(nnz_in)],
            &[jac_sp, Sparsity::column(nnz_out)],
        )?;
        self.state_mut().cache.full_jacobian = Some(built.downgrade());
        self.log(format_args!("built {}", built.name()));
        Ok(built)
    }

    // ── Uncached helpers ──

    /// Gradient of the scalar output `oind` with respect to input `iind`,
    /// followed by all nominal outputs. Built from `reverse(1)`.
    pub fn gradient(&self, iind: usize, oind: usize) -> Result<Function> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        let sp_o = self.sparsity_out(oind)?;
        if !(sp_o.is_scalar() && sp_o.is_dense()) {
            return Err(Error::dimension(
                &self.0.name,
                format!(
                    "gradient needs a scalar output, output {oind} is {}x{}",
                    sp_o.nrow(),
                    sp_o.ncol()
                ),
            ));
        }
        let (x, outs) = self.symbolic_call()?;
        let rev = self.reverse(1)?;
        let mut args: Vec<Mx> = x.iter().chain(outs.iter()).cloned().collect();
        for o in 0..self.n_out() {
            let sp = self.sparsity_out(o)?;
            args.push(if o == oind {
                Mx::constant(&sp, 1.0)
            } else {
                Mx::zeros(&sp)
            });
        }
        let sens = Mx::call(&rev, &args)?;
        let mut res = vec![sens[iind].clone()];
        res.extend(outs);
        self.wrap(format!("grad_{}", self.0.name), "grad", x, res)
    }

    /// Derivative of every entry of output `oind` with respect to the scalar
    /// input `iind`, followed by all nominal outputs. Built from `forward(1)`.
    pub fn tangent(&self, iind: usize, oind: usize) -> Result<Function> {
        self.check_in(iind)?;
        self.check_out(oind)?;
        self.ensure_ready()?;
        let sp_i = self.sparsity_in(iind)?;
        if !(sp_i.is_scalar() && sp_i.is_dense()) {
            return Err(Error::dimension(
                &self.0.name,
                format!(
                    "tangent needs a scalar input, input {iind} is {}x{}",
                    sp_i.nrow(),
                    sp_i.ncol()
                ),
            ));
        }
        let (x, outs) = self.symbolic_call()?;
        let fwd = self.forward(1)?;
        let mut args: Vec<Mx> = x.iter().chain(outs.iter()).cloned().collect();
        for i in 0..self.n_in() {
            let sp = self.sparsity_in(i)?;
            args.push(if i == iind {
                Mx::constant(&sp, 1.0)
            } else {
                Mx::zeros(&sp)
            });
        }
        let sens = Mx::call(&fwd, &args)?;
        let mut res = vec![sens[oind].clone()];
        res.extend(outs);
        self.wrap(format!("tangent_{}", self.0.name), "tangent", x, res)
    }

    /// Hessian of the scalar output `oind` with respect to input `iind`.
    ///
    /// Outputs are `[hessian, gradient, nominal outputs..]`; the Hessian is
    /// the symmetric, non-compact Jacobian of [`gradient`](Self::gradient).
    pub fn hessian(&self, iind: usize, oind: usize) -> Result<Function> {
        let grad = self.gradient(iind, oind)?;
        grad.jacobian(iind, 0, false, true)
    }

    fn symbolic_call(&self) -> Result<(Vec<Mx>, Vec<Mx>)> {
        let x = (0..self.n_in())
            .map(|i| Ok(Mx::sym(&self.name_in(i)?, &self.sparsity_in(i)?)))
            .collect::<Result<Vec<_>>>()?;
        let outs = Mx::call(self, &x)?;
        Ok((x, outs))
    }

    fn wrap(&self, name: String, first: &str, x: Vec<Mx>, res: Vec<Mx>) -> Result<Function> {
        let mut names_out = vec![first.to_string()];
        names_out.extend(self.output_names()?);
        let f = Function::new(name, Composite::new(x, res)?);
        f.set_option("input_scheme", self.input_names()?)?;
        f.set_option("output_scheme", names_out)?;
        f.init()?;
        Ok(f)
    }

    // ── Shared plumbing ──

    fn io_sparsities(&self) -> Result<(Vec<Sparsity>, Vec<Sparsity>)> {
        let sp_in = (0..self.n_in())
            .map(|i| self.sparsity_in(i))
            .collect::<Result<Vec<_>>>()?;
        let sp_out = (0..self.n_out())
            .map(|o| self.sparsity_out(o))
            .collect::<Result<Vec<_>>>()?;
        Ok((sp_in, sp_out))
    }

    /// Name the I/O of a freshly built derivative (when still configurable)
    /// and bring it to the finalized state.
    fn prepare(&self, f: &Function, names_in: Vec<String>, names_out: Vec<String>) -> Result<()> {
        if !f.is_initialized() {
            if f.n_in() == names_in.len() {
                f.set_option("input_scheme", names_in)?;
            }
            if f.n_out() == names_out.len() {
                f.set_option("output_scheme", names_out)?;
            }
            f.init()?;
        }
        f.finalize()
    }

    fn check_signature(
        &self,
        f: &Function,
        what: &str,
        expected_in: &[Sparsity],
        expected_out: &[Sparsity],
    ) -> Result<()> {
        if f.n_in() != expected_in.len() || f.n_out() != expected_out.len() {
            return Err(Error::dimension(
                f.name(),
                format!(
                    "{what} derivative of {} must have {} inputs and {} outputs, got {} and {}",
                    self.0.name,
                    expected_in.len(),
                    expected_out.len(),
                    f.n_in(),
                    f.n_out()
                ),
            ));
        }
        for (i, sp) in expected_in.iter().enumerate() {
            if f.sparsity_in(i)? != *sp {
                return Err(Error::dimension(
                    f.name(),
                    format!("{what} derivative input {i} does not have pattern {sp}"),
                ));
            }
        }
        for (o, sp) in expected_out.iter().enumerate() {
            if f.sparsity_out(o)? != *sp {
                return Err(Error::dimension(
                    f.name(),
                    format!("{what} derivative output {o} does not have pattern {sp}"),
                ));
            }
        }
        Ok(())
    }
}

/// Nominal inputs followed by the nominal outputs as `out_<name>`.
fn io_prefixed(names_in: &[String], names_out: &[String]) -> Vec<String> {
    names_in
        .iter()
        .cloned()
        .chain(names_out.iter().map(|n| format!("out_{n}")))
        .collect()
}
