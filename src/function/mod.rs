//! Function handles and the engine node behind them.
//!
//! A [`Function`] is a cheap, clonable handle; clones share one node and
//! compare equal by identity. The node owns the I/O buffers, the work-memory
//! plan, the derivative caches and a boxed [`FunctionKind`] supplying the
//! concrete behavior. Derivative caches hold [`WeakFunction`]s, so a node
//! never keeps its derivatives alive and no reference cycles form.
//!
//! Lifecycle: a node is created *configured*, [`Function::init`] freezes its
//! shapes and plans its memory, and [`Function::finalize`] (run lazily on
//! first use) completes setup after every dependency finished both steps.
//!
//! The engine API is split over submodules by concern:
//! `io` (shapes, schemes, buffers), `eval` (numeric and structural
//! evaluation), `sparsity` (Jacobian patterns), `derivative` (the derivative
//! cache) and `codegen` (C emission).

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::diagnostics::Diagnostics;
use crate::element::Bvec;
use crate::error::{Error, Result};
use crate::external::External;
use crate::kind::FunctionKind;
use crate::matrix::DMatrix;
use crate::options::{Dict, FunctionOptions, GenericType};
use crate::scheme::IoScheme;
use crate::sparsity::Sparsity;
use crate::work::{Memory, WorkPlanner, WorkSizes};

mod codegen;
mod derivative;
mod eval;
mod io;
mod sparsity;

pub use derivative::CacheEntry;
use derivative::DerivativeCache;

/// Shared handle to a function node.
#[derive(Clone)]
pub struct Function(Rc<FunctionNode>);

/// Non-owning reference to a function node.
#[derive(Clone, Default)]
pub struct WeakFunction(Weak<FunctionNode>);

struct FunctionNode {
    name: String,
    kind: RefCell<Box<dyn FunctionKind>>,
    state: RefCell<NodeState>,
    // Taken out for the duration of an evaluation.
    memory: RefCell<Option<Memory<f64>>>,
    sp_memory: RefCell<Option<Memory<Bvec>>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Configured,
    Initialized,
    Finalized,
}

#[derive(Default)]
struct NodeState {
    phase: Phase,
    options: FunctionOptions,
    diagnostics: Diagnostics,
    input_scheme: IoScheme,
    output_scheme: IoScheme,
    sparsity_in: Vec<Sparsity>,
    sparsity_out: Vec<Sparsity>,
    inputs: Vec<DMatrix>,
    outputs: Vec<DMatrix>,
    planner: WorkPlanner,
    // Planner changed since the buffers were last built.
    stale: bool,
    cache: DerivativeCache,
    user_data: Option<Rc<dyn Any>>,
    jit: Option<Rc<External>>,
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Function {}

impl Hash for Function {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const ()).hash(state);
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Function")
            .field(&self.0.name)
            .field(&self.type_name())
            .finish()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.name, self.type_name())
    }
}

impl WeakFunction {
    /// The function, if some strong handle still keeps it alive.
    pub fn upgrade(&self) -> Option<Function> {
        self.0.upgrade().map(Function)
    }

    /// True when the node has been destroyed (or this never pointed anywhere).
    pub fn is_expired(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(func) => write!(f, "WeakFunction({:?})", func.name()),
            None => write!(f, "WeakFunction(<expired>)"),
        }
    }
}

impl Function {
    /// A configured, not yet initialized function.
    pub fn new<K: FunctionKind>(name: impl Into<String>, kind: K) -> Function {
        Function(Rc::new(FunctionNode {
            name: name.into(),
            kind: RefCell::new(Box::new(kind)),
            state: RefCell::new(NodeState::default()),
            memory: RefCell::new(None),
            sp_memory: RefCell::new(None),
        }))
    }

    /// Create, apply `options` by name and initialize.
    pub fn construct<K: FunctionKind>(
        name: impl Into<String>,
        kind: K,
        options: &Dict,
    ) -> Result<Function> {
        let f = Function::new(name, kind);
        for (key, value) in options {
            f.set_option(key, value.clone())?;
        }
        f.init()?;
        Ok(f)
    }

    /// Create with a complete options struct and initialize.
    pub fn with_options<K: FunctionKind>(
        name: impl Into<String>,
        kind: K,
        options: FunctionOptions,
    ) -> Result<Function> {
        let f = Function::new(name, kind);
        f.state_mut().options = options;
        f.init()?;
        Ok(f)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Name with every non-alphanumeric character replaced by `_`.
    pub fn sanitized_name(&self) -> String {
        self.0
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    pub fn type_name(&self) -> &'static str {
        self.0.kind.borrow().type_name()
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.type_name() == type_name
    }

    pub fn downgrade(&self) -> WeakFunction {
        WeakFunction(Rc::downgrade(&self.0))
    }

    /// Borrow the concrete kind.
    pub fn kind(&self) -> Ref<'_, dyn FunctionKind> {
        Ref::map(self.0.kind.borrow(), |k| k.as_ref())
    }

    /// Borrow the kind as `K`, if it is one.
    pub fn downcast<K: FunctionKind>(&self) -> Option<Ref<'_, K>> {
        Ref::filter_map(self.0.kind.borrow(), |k| k.as_any().downcast_ref::<K>()).ok()
    }

    fn state(&self) -> Ref<'_, NodeState> {
        self.0.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, NodeState> {
        self.0.state.borrow_mut()
    }

    // ── Options and diagnostics ──

    /// Set an option by name. After `init()` only the diagnostic flags
    /// can change.
    pub fn set_option(&self, name: &str, value: impl Into<GenericType>) -> Result<()> {
        let mut st = self.state_mut();
        if st.phase != Phase::Configured && !FunctionOptions::DIAGNOSTIC.contains(&name) {
            return Err(Error::invalid(
                &self.0.name,
                format!("option '{name}' cannot be changed after init"),
            ));
        }
        st.options.set(name, value.into())
    }

    pub fn option(&self, name: &str) -> Result<GenericType> {
        self.state().options.get(name)
    }

    pub fn options(&self) -> FunctionOptions {
        self.state().options.clone()
    }

    pub fn verbose(&self) -> bool {
        self.state().options.verbose
    }

    pub fn monitored(&self, name: &str) -> bool {
        self.state().options.is_monitored(name)
    }

    /// Write `"<name>::<msg>"` to stderr when verbose.
    pub fn log(&self, msg: impl fmt::Display) {
        if self.verbose() {
            eprintln!("{}::{}", self.0.name, msg);
        }
    }

    /// Snapshot of the statistics dictionary.
    pub fn stats(&self) -> Dict {
        self.state().diagnostics.stats().clone()
    }

    pub fn stat(&self, name: &str) -> Result<GenericType> {
        let st = self.state();
        st.diagnostics.get(name).cloned().ok_or_else(|| {
            Error::not_found(
                format!("Statistics of {}", self.0.name),
                name,
                st.diagnostics.stats().keys().cloned().collect(),
            )
        })
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut Diagnostics)) {
        update(&mut self.state_mut().diagnostics);
    }

    // ── User extension slot ──

    pub fn set_user_data(&self, data: Rc<dyn Any>) {
        self.state_mut().user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<Rc<dyn Any>> {
        self.state().user_data.clone()
    }

    // ── Lifecycle ──

    pub fn is_initialized(&self) -> bool {
        self.state().phase != Phase::Configured
    }

    pub fn is_finalized(&self) -> bool {
        self.state().phase == Phase::Finalized
    }

    /// Freeze shapes and schemes and plan work memory. Runs once; later
    /// calls return immediately.
    pub fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let name = self.0.name.clone();
        let (sp_in, sp_out, defaults) = {
            let kind = self.0.kind.borrow();
            let sp_in: Vec<Sparsity> = (0..kind.n_in()).map(|i| kind.sparsity_in(i)).collect();
            let sp_out: Vec<Sparsity> =
                (0..kind.n_out()).map(|o| kind.sparsity_out(o)).collect();
            let defaults: Vec<f64> = (0..sp_in.len()).map(|i| kind.default_in(i)).collect();
            (sp_in, sp_out, defaults)
        };

        let (input_scheme, output_scheme) = {
            let st = self.state();
            (
                scheme_from(&name, "input", &st.options.input_scheme, "i", sp_in.len())?,
                scheme_from(&name, "output", &st.options.output_scheme, "o", sp_out.len())?,
            )
        };

        let mut planner = WorkPlanner::new();
        planner.alloc_arg(sp_in.len(), true);
        planner.alloc_res(sp_out.len(), true);
        self.0.kind.borrow_mut().init(&name, &mut planner)?;

        {
            let mut st = self.state_mut();
            st.inputs = sp_in
                .iter()
                .zip(&defaults)
                .map(|(sp, &d)| DMatrix::filled(sp.clone(), d))
                .collect();
            st.outputs = sp_out.iter().map(|sp| DMatrix::zeros(sp.clone())).collect();
            st.cache = DerivativeCache::new(sp_in.len(), sp_out.len());
            st.sparsity_in = sp_in;
            st.sparsity_out = sp_out;
            st.input_scheme = input_scheme;
            st.output_scheme = output_scheme;
            st.planner = planner;
            st.phase = Phase::Initialized;
        }
        self.log("initialized");

        if self.state().options.jit {
            self.jit_compile()?;
        }
        self.alloc();
        Ok(())
    }

    /// Compile this function's own generated code and route numeric
    /// evaluation through it.
    fn jit_compile(&self) -> Result<()> {
        let (plugin, jit_options) = {
            let st = self.state();
            (st.options.compiler.clone(), st.options.jit_options.clone())
        };
        let module = crate::external::compile_function(self, &plugin, &jit_options)?;
        let mut ext = External::new(&self.0.name, module)?;
        {
            let st = self.state();
            let kind = &ext as &dyn FunctionKind;
            let same = kind.n_in() == st.sparsity_in.len()
                && kind.n_out() == st.sparsity_out.len()
                && (0..kind.n_in()).all(|i| kind.sparsity_in(i) == st.sparsity_in[i])
                && (0..kind.n_out()).all(|o| kind.sparsity_out(o) == st.sparsity_out[o]);
            if !same {
                return Err(Error::dimension(
                    &self.0.name,
                    "compiled module does not match the function signature",
                ));
            }
        }
        let mut planner = self.state().planner.clone();
        ext.init(&self.0.name, &mut planner)?;
        let mut st = self.state_mut();
        st.planner = planner;
        st.jit = Some(Rc::new(ext));
        drop(st);
        self.log(format_args!("compiled with '{plugin}'"));
        Ok(())
    }

    /// Finish setup after every dependency is initialized and finalized.
    pub fn finalize(&self) -> Result<()> {
        let phase = self.state().phase;
        match phase {
            Phase::Configured => {
                return Err(Error::NotInitialized {
                    function: self.0.name.clone(),
                })
            }
            Phase::Finalized => return Ok(()),
            Phase::Initialized => {}
        }
        let deps = self.0.kind.borrow().dependencies();
        for dep in &deps {
            dep.init()?;
            dep.finalize()?;
        }
        self.0.kind.borrow_mut().finalize(&self.0.name)?;
        self.state_mut().phase = Phase::Finalized;
        self.log("finalized");
        Ok(())
    }

    /// Initialized is required; finalization happens on demand.
    pub(crate) fn ensure_ready(&self) -> Result<()> {
        let phase = self.state().phase;
        match phase {
            Phase::Finalized => Ok(()),
            Phase::Initialized => self.finalize(),
            Phase::Configured => Err(Error::NotInitialized {
                function: self.0.name.clone(),
            }),
        }
    }

    fn require_init(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized {
                function: self.0.name.clone(),
            })
        }
    }

    // ── Work memory ──

    /// Reserve extra input-pointer slots on this function's plan.
    pub fn alloc_arg(&self, size: usize, persistent: bool) -> usize {
        let mut st = self.state_mut();
        st.stale = true;
        st.planner.alloc_arg(size, persistent)
    }

    pub fn alloc_res(&self, size: usize, persistent: bool) -> usize {
        let mut st = self.state_mut();
        st.stale = true;
        st.planner.alloc_res(size, persistent)
    }

    pub fn alloc_iw(&self, size: usize, persistent: bool) -> usize {
        let mut st = self.state_mut();
        st.stale = true;
        st.planner.alloc_iw(size, persistent)
    }

    pub fn alloc_w(&self, size: usize, persistent: bool) -> usize {
        let mut st = self.state_mut();
        st.stale = true;
        st.planner.alloc_w(size, persistent)
    }

    /// Merge `g`'s totals into this function's plan.
    pub fn alloc_function(&self, g: &Function, persistent: bool) -> Result<WorkSizes> {
        let sizes = g.work_sizes()?;
        let mut st = self.state_mut();
        st.stale = true;
        Ok(st.planner.alloc_sizes(sizes, persistent))
    }

    /// Rebuild the flat buffers from the current plan.
    pub fn alloc(&self) {
        let (sizes, nnz_in, nnz_out) = {
            let mut st = self.state_mut();
            st.stale = false;
            (
                st.planner.total(),
                st.sparsity_in.iter().map(Sparsity::nnz).collect::<Vec<_>>(),
                st.sparsity_out.iter().map(Sparsity::nnz).collect::<Vec<_>>(),
            )
        };
        *self.0.memory.borrow_mut() = Some(Memory::new(sizes, &nnz_in, &nnz_out));
        *self.0.sp_memory.borrow_mut() = Some(Memory::new(sizes, &nnz_in, &nnz_out));
    }

    /// Total sizes per class: what a caller must provide for one call,
    /// including everything this function calls.
    pub fn work_sizes(&self) -> Result<WorkSizes> {
        self.require_init()?;
        Ok(self.state().planner.total())
    }

    /// The part of [`work_sizes`](Self::work_sizes) this function keeps for
    /// itself; its callees run past it.
    pub fn persistent_sizes(&self) -> Result<WorkSizes> {
        self.require_init()?;
        Ok(self.state().planner.persistent())
    }

    /// True when numeric evaluation runs through a compiled module.
    pub fn is_jit(&self) -> bool {
        self.state().jit.is_some()
    }
}

fn scheme_from(
    name: &str,
    side: &str,
    entries: &[String],
    prefix: &str,
    n: usize,
) -> Result<IoScheme> {
    if entries.is_empty() {
        return Ok(IoScheme::numbered(prefix, n));
    }
    if entries.len() != n {
        return Err(Error::dimension(
            name,
            format!("{side} scheme has {} entries, expected {n}", entries.len()),
        ));
    }
    Ok(IoScheme::new(entries.to_vec()))
}
