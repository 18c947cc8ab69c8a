//! The capability trait implemented by every concrete function kind.
//!
//! The engine in [`Function`] owns lifecycle, caching, memory and the
//! fallbacks; a kind only describes its shape and whatever it can do
//! natively. Every capability has a default that reports it as missing.

use std::any::Any;

use crate::codegen::CodeGenerator;
use crate::element::Bvec;
use crate::error::{Error, Result};
use crate::function::Function;
use crate::options::DEFAULT_ZERO;
use crate::sparsity::Sparsity;
use crate::work::{Frame, Memory, WorkPlanner};

/// Concrete behavior behind a [`Function`].
///
/// Evaluation entry points receive the function's name for error messages,
/// the shared [`Memory`], and the [`Frame`] the engine placed them at. Input
/// `i` is read through `mem.arg[frame.arg(i)]` and output `o` written through
/// `mem.res[frame.res(o)]`; either may be [`Ptr::Null`](crate::work::Ptr::Null).
pub trait FunctionKind: Any {
    /// Class name reported by [`Function::type_name`].
    fn type_name(&self) -> &'static str;

    fn n_in(&self) -> usize;

    fn n_out(&self) -> usize;

    fn sparsity_in(&self, i: usize) -> Sparsity;

    fn sparsity_out(&self, o: usize) -> Sparsity;

    /// Value an unset input takes.
    fn default_in(&self, _i: usize) -> f64 {
        DEFAULT_ZERO
    }

    // ── Lifecycle ──

    /// Declare work memory. Runs once, inside [`Function::init`], after the
    /// engine reserved the function's own argument and result slots.
    fn init(&mut self, _name: &str, _planner: &mut WorkPlanner) -> Result<()> {
        Ok(())
    }

    /// Setup that needs every dependency initialized and finalized.
    fn finalize(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Functions this kind calls or otherwise needs finalized first.
    fn dependencies(&self) -> Vec<Function> {
        Vec::new()
    }

    // ── Evaluation ──

    fn eval(&self, name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()>;

    /// Whether [`sp_fwd`](Self::sp_fwd) (`fwd`) or [`sp_adj`](Self::sp_adj)
    /// is implemented.
    fn sp_can_evaluate(&self, _fwd: bool) -> bool {
        false
    }

    fn sp_fwd(&self, name: &str, _mem: &mut Memory<Bvec>, _frame: Frame) -> Result<()> {
        Err(Error::unsupported(name, "sp_fwd"))
    }

    fn sp_adj(&self, name: &str, _mem: &mut Memory<Bvec>, _frame: Frame) -> Result<()> {
        Err(Error::unsupported(name, "sp_adj"))
    }

    // ── Derivatives ──

    fn has_forward(&self) -> bool {
        false
    }

    /// Build the `nfwd`-direction forward derivative of `f`.
    fn get_forward(&self, f: &Function, _nfwd: usize) -> Result<Function> {
        Err(Error::unsupported(f.name(), "forward"))
    }

    fn has_reverse(&self) -> bool {
        false
    }

    /// Build the `nadj`-direction reverse derivative of `f`.
    fn get_reverse(&self, f: &Function, _nadj: usize) -> Result<Function> {
        Err(Error::unsupported(f.name(), "reverse"))
    }

    /// A native Jacobian replaces the colored numeric one.
    fn has_jacobian(&self) -> bool {
        false
    }

    fn get_jacobian(
        &self,
        f: &Function,
        _iind: usize,
        _oind: usize,
        _compact: bool,
        _symmetric: bool,
    ) -> Result<Function> {
        Err(Error::unsupported(f.name(), "jacobian"))
    }

    fn has_full_jacobian(&self) -> bool {
        false
    }

    fn get_full_jacobian(&self, f: &Function) -> Result<Function> {
        Err(Error::unsupported(f.name(), "full_jacobian"))
    }

    /// Overrides the `ad_weight` option.
    fn ad_weight(&self) -> Option<f64> {
        None
    }

    /// Overrides the `ad_weight_sp` option.
    fn ad_weight_sp(&self) -> Option<f64> {
        None
    }

    // ── Code generation ──

    /// The body can be called through `(const double* arg, double* res)`.
    fn simplified_call(&self) -> bool {
        false
    }

    fn has_codegen(&self) -> bool {
        false
    }

    /// C statements of the body. Inputs are `arg[i]`, outputs `res[o]`, and
    /// the function's own work starts at `iw` and `w`; scratch for callees
    /// starts at the persistent sizes past those.
    fn generate_body(&self, f: &Function, _g: &mut CodeGenerator) -> Result<String> {
        Err(Error::unsupported(f.name(), "codegen"))
    }

    fn as_any(&self) -> &dyn Any;
}
