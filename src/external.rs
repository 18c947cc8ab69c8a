//! Compiled code behind the C evaluation ABI.
//!
//! Generated sources export, for a function named `f`:
//!
//! ```c
//! int f(const double** arg, double** res, int* iw, double* w, void* mem);
//! int f_n_in(void);
//! int f_n_out(void);
//! int f_init(void** mem, int* n_in, int* n_out, void* data);
//! int f_freemem(void* mem);
//! int f_work(void* mem, int* sz_arg, int* sz_res, int* sz_iw, int* sz_w);
//! int f_sparsity(void* mem, int i, int* n_row, int* n_col,
//!                const int** colind, const int** row);
//! void f_simple(const double* arg, double* res);  /* single input/output */
//! ```
//!
//! Turning source into callable code is the job of a [`Compiler`] plugin,
//! registered by name per thread. A plugin hands back a [`CompiledModule`];
//! [`LoadedModule`] adapts raw entry points to that trait and [`External`]
//! makes any module a function kind.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::function::Function;
use crate::kind::FunctionKind;
use crate::options::Dict;
use crate::sparsity::Sparsity;
use crate::work::{Frame, Memory, WorkPlanner, WorkSizes};

pub type EvalFn = unsafe extern "C" fn(
    arg: *mut *const f64,
    res: *mut *mut f64,
    iw: *mut c_int,
    w: *mut f64,
    mem: *mut c_void,
) -> c_int;

pub type CountFn = unsafe extern "C" fn() -> c_int;

pub type InitFn = unsafe extern "C" fn(
    mem: *mut *mut c_void,
    n_in: *mut c_int,
    n_out: *mut c_int,
    data: *mut c_void,
) -> c_int;

pub type FreeMemFn = unsafe extern "C" fn(mem: *mut c_void) -> c_int;

pub type WorkFn = unsafe extern "C" fn(
    mem: *mut c_void,
    sz_arg: *mut c_int,
    sz_res: *mut c_int,
    sz_iw: *mut c_int,
    sz_w: *mut c_int,
) -> c_int;

pub type SparsityFn = unsafe extern "C" fn(
    mem: *mut c_void,
    i: c_int,
    n_row: *mut c_int,
    n_col: *mut c_int,
    colind: *mut *const c_int,
    row: *mut *const c_int,
) -> c_int;

pub type SimpleFn = unsafe extern "C" fn(arg: *const f64, res: *mut f64);

/// A compiled function, seen through flat nonzero buffers.
pub trait CompiledModule {
    fn n_in(&self) -> usize;

    fn n_out(&self) -> usize;

    /// Pointer and work sizes one evaluation needs.
    fn work(&self) -> WorkSizes;

    /// Pattern of input `ind`, or of output `ind - n_in`.
    fn sparsity(&self, ind: usize) -> Result<Sparsity>;

    /// Evaluate. `arg` holds every input's nonzeros back to back, `res`
    /// receives every output's nonzeros. `iw` and `w` are at least
    /// [`work`](Self::work) long.
    fn eval(&self, arg: &[f64], res: &mut [f64], iw: &mut [c_int], w: &mut [f64]) -> Result<()>;
}

/// Raw entry points of one compiled function.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    pub eval: EvalFn,
    pub n_in: CountFn,
    pub n_out: CountFn,
    pub sparsity: SparsityFn,
    pub work: Option<WorkFn>,
    pub init: Option<InitFn>,
    pub freemem: Option<FreeMemFn>,
    /// `f_simple`, used for single input/output modules when present.
    pub simple: Option<SimpleFn>,
}

/// [`CompiledModule`] over [`EntryPoints`].
pub struct LoadedModule {
    entry: EntryPoints,
    mem: *mut c_void,
    n_in: usize,
    n_out: usize,
    work: WorkSizes,
    sparsity: Vec<Sparsity>,
    argp: RefCell<Vec<*const f64>>,
    resp: RefCell<Vec<*mut f64>>,
}

fn status(plugin: &str, what: &str, code: c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::Compilation {
            plugin: plugin.to_string(),
            message: format!("{what} returned {code}"),
        })
    }
}

impl LoadedModule {
    /// Query sizes and patterns through the entry points.
    ///
    /// # Safety
    ///
    /// Every entry point must follow the evaluation ABI, and the code behind
    /// them must stay loaded for the lifetime of the module.
    pub unsafe fn new(entry: EntryPoints) -> Result<LoadedModule> {
        let mut mem: *mut c_void = ptr::null_mut();
        if let Some(init) = entry.init {
            status("loaded", "init", init(&mut mem, ptr::null_mut(), ptr::null_mut(), ptr::null_mut()))?;
        }
        let n_in = usize::try_from((entry.n_in)()).unwrap_or(0);
        let n_out = usize::try_from((entry.n_out)()).unwrap_or(0);

        let mut sz = [0 as c_int; 4];
        if let Some(work) = entry.work {
            let [a, r, i, w] = &mut sz;
            status("loaded", "work", work(mem, a, r, i, w))?;
        }
        let to_usize = |v: c_int| usize::try_from(v).unwrap_or(0);
        let work = WorkSizes::new(
            to_usize(sz[0]).max(n_in),
            to_usize(sz[1]).max(n_out),
            to_usize(sz[2]),
            to_usize(sz[3]),
        );

        let mut sparsity = Vec::with_capacity(n_in + n_out);
        for ind in 0..n_in + n_out {
            let (mut nrow, mut ncol) = (0 as c_int, 0 as c_int);
            let (mut colind, mut row): (*const c_int, *const c_int) = (ptr::null(), ptr::null());
            status(
                "loaded",
                "sparsity",
                (entry.sparsity)(mem, ind as c_int, &mut nrow, &mut ncol, &mut colind, &mut row),
            )?;
            let (nrow, ncol) = (to_usize(nrow), to_usize(ncol));
            let colind: Vec<usize> = if colind.is_null() {
                vec![0; ncol + 1]
            } else {
                std::slice::from_raw_parts(colind, ncol + 1)
                    .iter()
                    .map(|&v| to_usize(v))
                    .collect()
            };
            let nnz = colind[ncol];
            let row: Vec<usize> = if row.is_null() || nnz == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(row, nnz)
                    .iter()
                    .map(|&v| to_usize(v))
                    .collect()
            };
            sparsity.push(Sparsity::new(nrow, ncol, colind, row)?);
        }

        Ok(LoadedModule {
            entry,
            mem,
            n_in,
            n_out,
            work,
            sparsity,
            argp: RefCell::new(vec![ptr::null(); work.arg]),
            resp: RefCell::new(vec![ptr::null_mut(); work.res]),
        })
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if let Some(freemem) = self.entry.freemem {
            // SAFETY: `mem` came from this module's own `init`.
            unsafe {
                freemem(self.mem);
            }
        }
    }
}

impl CompiledModule for LoadedModule {
    fn n_in(&self) -> usize {
        self.n_in
    }

    fn n_out(&self) -> usize {
        self.n_out
    }

    fn work(&self) -> WorkSizes {
        self.work
    }

    fn sparsity(&self, ind: usize) -> Result<Sparsity> {
        self.sparsity.get(ind).cloned().ok_or(Error::IndexOutOfRange {
            function: "LoadedModule".to_string(),
            io: "sparsity",
            index: ind,
            len: self.sparsity.len(),
        })
    }

    fn eval(&self, arg: &[f64], res: &mut [f64], iw: &mut [c_int], w: &mut [f64]) -> Result<()> {
        if let (Some(simple), 1, 1) = (self.entry.simple, self.n_in, self.n_out) {
            // SAFETY: one input and one output, sized by `sparsity`.
            unsafe { simple(arg.as_ptr(), res.as_mut_ptr()) };
            return Ok(());
        }
        let (mut argp, mut resp) = match (self.argp.try_borrow_mut(), self.resp.try_borrow_mut()) {
            (Ok(a), Ok(r)) => (a, r),
            _ => return Err(Error::unsupported("LoadedModule", "re-entrant evaluation")),
        };
        let mut off = 0;
        for (i, slot) in argp.iter_mut().take(self.n_in).enumerate() {
            *slot = arg[off..].as_ptr();
            off += self.sparsity[i].nnz();
        }
        let mut off = 0;
        for (o, slot) in resp.iter_mut().take(self.n_out).enumerate() {
            *slot = res[off..].as_mut_ptr();
            off += self.sparsity[self.n_in + o].nnz();
        }
        // SAFETY: pointer arrays and work slices are sized from the
        // module's own `work` and `sparsity` answers.
        let code = unsafe {
            (self.entry.eval)(
                argp.as_mut_ptr(),
                resp.as_mut_ptr(),
                iw.as_mut_ptr(),
                w.as_mut_ptr(),
                self.mem,
            )
        };
        if code == 0 {
            Ok(())
        } else {
            Err(Error::Evaluation {
                function: "LoadedModule".to_string(),
                code,
            })
        }
    }
}

// ── Function kind ──

/// Function kind evaluating a [`CompiledModule`].
///
/// Inputs are gathered into a persistent staging area, the module runs in
/// the caller's scratch space, and outputs are scattered back.
pub struct External {
    module: Rc<dyn CompiledModule>,
    sp_in: Vec<Sparsity>,
    sp_out: Vec<Sparsity>,
    nnz_in: usize,
    nnz_out: usize,
    stage_off: usize,
}

impl External {
    pub fn new(name: &str, module: Rc<dyn CompiledModule>) -> Result<External> {
        let (n_in, n_out) = (module.n_in(), module.n_out());
        let sp_in = (0..n_in)
            .map(|i| module.sparsity(i))
            .collect::<Result<Vec<_>>>()?;
        let sp_out = (0..n_out)
            .map(|o| module.sparsity(n_in + o))
            .collect::<Result<Vec<_>>>()?;
        let nnz_in = sp_in.iter().map(Sparsity::nnz).sum();
        let nnz_out = sp_out.iter().map(Sparsity::nnz).sum();
        let work = module.work();
        if work.arg < n_in || work.res < n_out {
            return Err(Error::dimension(
                name,
                format!(
                    "module reserves {} argument and {} result slots for {n_in} inputs and {n_out} outputs",
                    work.arg, work.res
                ),
            ));
        }
        Ok(External {
            module,
            sp_in,
            sp_out,
            nnz_in,
            nnz_out,
            stage_off: 0,
        })
    }

    pub fn module(&self) -> &Rc<dyn CompiledModule> {
        &self.module
    }
}

impl FunctionKind for External {
    fn type_name(&self) -> &'static str {
        "External"
    }

    fn n_in(&self) -> usize {
        self.sp_in.len()
    }

    fn n_out(&self) -> usize {
        self.sp_out.len()
    }

    fn sparsity_in(&self, i: usize) -> Sparsity {
        self.sp_in[i].clone()
    }

    fn sparsity_out(&self, o: usize) -> Sparsity {
        self.sp_out[o].clone()
    }

    fn init(&mut self, _name: &str, planner: &mut WorkPlanner) -> Result<()> {
        self.stage_off = planner.alloc_w(self.nnz_in + self.nnz_out, true);
        let work = self.module.work();
        planner.alloc_arg(work.arg, false);
        planner.alloc_res(work.res, false);
        planner.alloc_iw(work.iw, false);
        planner.alloc_w(work.w, false);
        Ok(())
    }

    fn eval(&self, name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()> {
        let stage = frame.w(self.stage_off);
        let mut off = stage;
        for (i, sp) in self.sp_in.iter().enumerate() {
            let p = mem.arg[frame.arg(i)];
            for k in 0..sp.nnz() {
                let v = mem.get(p, k);
                mem.w[off + k] = v;
            }
            off += sp.nnz();
        }

        let work = self.module.work();
        let s = frame.scratch;
        let (head, tail) = mem.w.split_at_mut(s.w);
        let (arg, res) = head[stage..stage + self.nnz_in + self.nnz_out].split_at_mut(self.nnz_in);
        let iw = &mut mem.iw[s.iw..s.iw + work.iw];
        self.module
            .eval(arg, res, iw, &mut tail[..work.w])
            .map_err(|err| match err {
                Error::Evaluation { code, .. } => Error::Evaluation {
                    function: name.to_string(),
                    code,
                },
                other => other,
            })?;

        let mut off = stage + self.nnz_in;
        for (o, sp) in self.sp_out.iter().enumerate() {
            let dst = mem.res[frame.res(o)];
            for k in 0..sp.nnz() {
                let v = mem.w[off + k];
                mem.set(dst, k, v);
            }
            off += sp.nnz();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Compiler plugins ──

/// Turns generated C source into a loaded module.
pub trait Compiler {
    fn compile(
        &self,
        name: &str,
        description: &str,
        source: &str,
        options: &Dict,
    ) -> Result<Rc<dyn CompiledModule>>;
}

thread_local! {
    static COMPILERS: RefCell<BTreeMap<String, Rc<dyn Compiler>>> = RefCell::new(BTreeMap::new());
}

/// Make `compiler` available under `name` on this thread, replacing any
/// previous registration.
pub fn register_compiler(name: &str, compiler: Rc<dyn Compiler>) {
    COMPILERS.with(|c| {
        c.borrow_mut().insert(name.to_string(), compiler);
    });
}

pub fn has_compiler(name: &str) -> bool {
    COMPILERS.with(|c| c.borrow().contains_key(name))
}

/// Names of the plugins registered on this thread.
pub fn compilers() -> Vec<String> {
    COMPILERS.with(|c| c.borrow().keys().cloned().collect())
}

fn compiler(name: &str) -> Result<Rc<dyn Compiler>> {
    COMPILERS.with(|c| {
        let registry = c.borrow();
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Compiler plugins", name, registry.keys().cloned().collect()))
    })
}

/// Compile the generated code of `f` under its sanitized name.
pub(crate) fn compile_function(
    f: &Function,
    plugin: &str,
    options: &Dict,
) -> Result<Rc<dyn CompiledModule>> {
    let compiler = compiler(plugin)?;
    let fname = f.sanitized_name();
    let source = f.generate_code(&fname)?;
    compiler.compile(&fname, f.name(), &source, options)
}

/// Generate C code for `f`, compile it with `plugin` and wrap the result as
/// a function named `fname`.
///
/// The new function keeps `f`'s I/O names and Jacobian patterns; numeric
/// derivatives are not available on it.
pub fn dynamic_compilation(
    f: &Function,
    fname: &str,
    fdescr: &str,
    plugin: &str,
) -> Result<Function> {
    f.init()?;
    let compiler = compiler(plugin)?;
    let source = f.generate_code(fname)?;
    let module = compiler.compile(fname, fdescr, &source, &Dict::new())?;
    let ext = Function::new(fname, External::new(fname, module)?);
    if ext.n_in() != f.n_in() || ext.n_out() != f.n_out() {
        return Err(Error::dimension(
            fname,
            format!(
                "compiled module has {} inputs and {} outputs, expected {} and {}",
                ext.n_in(),
                ext.n_out(),
                f.n_in(),
                f.n_out()
            ),
        ));
    }
    ext.set_option("input_scheme", f.input_names()?)?;
    ext.set_option("output_scheme", f.output_names()?)?;
    ext.init()?;
    for o in 0..f.n_out() {
        for i in 0..f.n_in() {
            ext.set_jac_sparsity(f.jac_sparsity(i, o, true, false)?, i, o, true)?;
        }
    }
    Ok(ext)
}
