//! Compiled modules behind the C evaluation ABI, compiler plugins and JIT.

mod common;

use std::cell::{Cell, RefCell};
use std::os::raw::{c_int, c_void};
use std::rc::Rc;

use approx::assert_relative_eq;
use common::*;
use quoll::external::{compilers, has_compiler};
use quoll::{
    dynamic_compilation, register_compiler, CompiledModule, Compiler, DMatrix, Dict, EntryPoints,
    Error, External, Function, LoadedModule, ScalarFunction, Sparsity, WorkSizes,
};

// ─── Hand-written module: y = 2x over a column of two ──────────────────────

static SP: [c_int; 6] = [2, 1, 0, 2, 0, 1];

thread_local! {
    static FREED: Cell<usize> = const { Cell::new(0) };
}

unsafe extern "C" fn twice_eval(
    arg: *mut *const f64,
    res: *mut *mut f64,
    _iw: *mut c_int,
    _w: *mut f64,
    _mem: *mut c_void,
) -> c_int {
    let x = *arg;
    let y = *res;
    if y.is_null() {
        return 0;
    }
    for k in 0..2 {
        *y.add(k) = 2.0 * *x.add(k);
    }
    0
}

unsafe extern "C" fn failing_eval(
    _arg: *mut *const f64,
    _res: *mut *mut f64,
    _iw: *mut c_int,
    _w: *mut f64,
    _mem: *mut c_void,
) -> c_int {
    7
}

unsafe extern "C" fn one() -> c_int {
    1
}

unsafe extern "C" fn twice_sparsity(
    _mem: *mut c_void,
    i: c_int,
    n_row: *mut c_int,
    n_col: *mut c_int,
    colind: *mut *const c_int,
    row: *mut *const c_int,
) -> c_int {
    if i > 1 {
        return 1;
    }
    *n_row = SP[0];
    *n_col = SP[1];
    *colind = SP.as_ptr().add(2);
    *row = SP.as_ptr().add(4);
    0
}

unsafe extern "C" fn twice_work(
    _mem: *mut c_void,
    sz_arg: *mut c_int,
    sz_res: *mut c_int,
    sz_iw: *mut c_int,
    sz_w: *mut c_int,
) -> c_int {
    *sz_arg = 1;
    *sz_res = 1;
    *sz_iw = 0;
    *sz_w = 3;
    0
}

unsafe extern "C" fn twice_freemem(_mem: *mut c_void) -> c_int {
    FREED.with(|f| f.set(f.get() + 1));
    0
}

fn entry_points(eval: quoll::external::EvalFn) -> EntryPoints {
    EntryPoints {
        eval,
        n_in: one,
        n_out: one,
        sparsity: twice_sparsity,
        work: Some(twice_work),
        init: None,
        freemem: Some(twice_freemem),
        simple: None,
    }
}

unsafe extern "C" fn thrice_simple(arg: *const f64, res: *mut f64) {
    for k in 0..2 {
        *res.add(k) = 3.0 * *arg.add(k);
    }
}

fn twice(name: &str, eval: quoll::external::EvalFn) -> Function {
    // SAFETY: the entry points above follow the evaluation ABI and are static.
    let module = unsafe { LoadedModule::new(entry_points(eval)) }.unwrap();
    let ext = External::new(name, Rc::new(module)).unwrap();
    let f = Function::new(name, ext);
    f.init().unwrap();
    f
}

#[test]
fn loaded_module_reports_its_signature() {
    // SAFETY: see `twice`.
    let module = unsafe { LoadedModule::new(entry_points(twice_eval)) }.unwrap();
    assert_eq!(module.n_in(), 1);
    assert_eq!(module.n_out(), 1);
    assert_eq!(module.work(), WorkSizes::new(1, 1, 0, 3));
    assert_eq!(module.sparsity(0).unwrap(), Sparsity::column(2));
    assert_eq!(module.sparsity(1).unwrap(), Sparsity::column(2));
    assert!(matches!(
        module.sparsity(2),
        Err(Error::IndexOutOfRange { .. })
    ));
}

#[test]
fn external_evaluates_through_the_entry_point() {
    let f = twice("twice", twice_eval);
    assert_eq!(f.type_name(), "External");
    let out = f.call(&[DMatrix::column(&[1.5, -4.0])]).unwrap();
    assert_eq!(out[0].nonzeros(), &[3.0, -8.0]);

    let w = f.work_sizes().unwrap();
    assert!(w.w >= 3 + 4);
}

#[test]
fn repeated_calls_reuse_the_pointer_arrays() {
    let f = twice("twice", twice_eval);
    for k in 0..50 {
        let x = k as f64;
        let out = f.call(&[DMatrix::column(&[x, -x])]).unwrap();
        assert_eq!(out[0].nonzeros(), &[2.0 * x, -2.0 * x]);
    }

    // own slots plus the module's scratch
    let sizes = f.work_sizes().unwrap();
    let persistent = f.persistent_sizes().unwrap();
    assert_eq!(persistent.arg, 1);
    assert_eq!(persistent.res, 1);
    assert!(sizes.arg >= persistent.arg + 1);
    assert!(sizes.res >= persistent.res + 1);
}

#[test]
fn simple_entry_point_serves_single_io_modules() {
    let entry = EntryPoints {
        simple: Some(thrice_simple),
        ..entry_points(failing_eval)
    };
    // SAFETY: see `twice`.
    let module = unsafe { LoadedModule::new(entry) }.unwrap();
    let f = Function::new("thrice", External::new("thrice", Rc::new(module)).unwrap());
    f.init().unwrap();
    let out = f.call(&[DMatrix::column(&[1.0, -2.0])]).unwrap();
    assert_eq!(out[0].nonzeros(), &[3.0, -6.0]);
}

#[test]
fn external_inside_a_composite() {
    let g = twice("twice", twice_eval);
    let x = quoll::Mx::sym("x", &Sparsity::column(2));
    let y = quoll::Mx::call(&g, &[x.clone()]).unwrap();
    let z = quoll::Mx::call(&g, &y).unwrap();
    let h = quoll::Composite::function("quad", vec![x], z).unwrap();
    let out = h.call(&[DMatrix::column(&[1.0, 2.0])]).unwrap();
    assert_eq!(out[0].nonzeros(), &[4.0, 8.0]);
}

#[test]
fn nonzero_return_becomes_an_evaluation_error() {
    let f = twice("failing", failing_eval);
    let err = f.call(&[DMatrix::column(&[1.0, 1.0])]).unwrap_err();
    assert_eq!(
        err,
        Error::Evaluation {
            function: "failing".to_string(),
            code: 7
        }
    );
}

#[test]
fn freemem_runs_when_the_function_is_dropped() {
    let before = FREED.with(Cell::get);
    let f = twice("twice", twice_eval);
    assert_eq!(FREED.with(Cell::get), before);
    drop(f);
    assert_eq!(FREED.with(Cell::get), before + 1);
}

#[test]
fn external_has_no_derivatives_and_a_dense_pattern() {
    let f = twice("twice", twice_eval);
    assert!(!f.has_forward());
    assert!(matches!(
        f.forward(1),
        Err(Error::UnsupportedOperation { .. })
    ));
    assert_eq!(f.jac_sparsity(0, 0, true, false).unwrap(), Sparsity::dense(2, 2));

    f.set_jac_sparsity(Sparsity::diagonal(2), 0, 0, true).unwrap();
    assert_eq!(f.jac_sparsity(0, 0, true, false).unwrap(), Sparsity::diagonal(2));
}

#[test]
fn injected_jacobian_gives_external_derivatives() {
    let f = twice("twice", twice_eval);
    let x = quoll::SxMatrix::sym("x", &Sparsity::column(2));
    let y: Vec<quoll::SxElem> = x.nonzeros().iter().map(|e| 2.0 * e.clone()).collect();
    let reference = ScalarFunction::function("twice_ref", vec![x], vec![quoll::SxMatrix::column(y)]).unwrap();
    let jac = reference.jacobian(0, 0, true, false).unwrap();
    f.set_jacobian(&jac, 0, 0, true).unwrap();

    let fwd = f.forward(1).unwrap();
    assert_eq!(fwd.type_name(), "JacobianProduct");
    let out = fwd
        .call(&[
            DMatrix::column(&[1.0, 2.0]),
            DMatrix::column(&[2.0, 4.0]),
            DMatrix::column(&[0.5, -3.0]),
        ])
        .unwrap();
    assert_eq!(out[0].nonzeros(), &[1.0, -6.0]);

    let adj = f.reverse(2).unwrap();
    let out = adj
        .call(&[
            DMatrix::column(&[1.0, 2.0]),
            DMatrix::column(&[2.0, 4.0]),
            DMatrix::column(&[1.0, 0.0]),
            DMatrix::column(&[0.0, 0.25]),
        ])
        .unwrap();
    assert_eq!(out[0].nonzeros(), &[2.0, 0.0]);
    assert_eq!(out[1].nonzeros(), &[0.0, 0.5]);
}

#[test]
fn external_cannot_generate_code() {
    let f = twice("twice", twice_eval);
    assert!(!f.has_codegen());
    assert!(matches!(
        f.generate_code("twice"),
        Err(Error::UnsupportedOperation { .. })
    ));
}

// ─── Mock compiler ─────────────────────────────────────────────────────────

/// Module that evaluates a reference function instead of compiled code.
struct Interpreted {
    f: Function,
}

impl CompiledModule for Interpreted {
    fn n_in(&self) -> usize {
        self.f.n_in()
    }

    fn n_out(&self) -> usize {
        self.f.n_out()
    }

    fn work(&self) -> WorkSizes {
        WorkSizes::new(self.f.n_in(), self.f.n_out(), 0, 0)
    }

    fn sparsity(&self, ind: usize) -> quoll::Result<Sparsity> {
        let n_in = self.f.n_in();
        if ind < n_in {
            self.f.sparsity_in(ind)
        } else {
            self.f.sparsity_out(ind - n_in)
        }
    }

    fn eval(&self, arg: &[f64], res: &mut [f64], _iw: &mut [c_int], _w: &mut [f64]) -> quoll::Result<()> {
        let mut args = Vec::new();
        let mut off = 0;
        for i in 0..self.f.n_in() {
            let sp = self.f.sparsity_in(i)?;
            let n = sp.nnz();
            args.push(DMatrix::new(sp, arg[off..off + n].to_vec())?);
            off += n;
        }
        let out = self.f.call(&args)?;
        let mut off = 0;
        for m in &out {
            res[off..off + m.nnz()].copy_from_slice(m.nonzeros());
            off += m.nnz();
        }
        Ok(())
    }
}

struct MockCompiler {
    reference: Function,
    sources: RefCell<Vec<(String, String)>>,
}

impl Compiler for MockCompiler {
    fn compile(
        &self,
        name: &str,
        _description: &str,
        source: &str,
        _options: &Dict,
    ) -> quoll::Result<Rc<dyn CompiledModule>> {
        self.sources
            .borrow_mut()
            .push((name.to_string(), source.to_string()));
        Ok(Rc::new(Interpreted {
            f: self.reference.clone(),
        }))
    }
}

struct BrokenCompiler;

impl Compiler for BrokenCompiler {
    fn compile(
        &self,
        _name: &str,
        _description: &str,
        _source: &str,
        _options: &Dict,
    ) -> quoll::Result<Rc<dyn CompiledModule>> {
        Err(Error::Compilation {
            plugin: "broken".to_string(),
            message: "no toolchain".to_string(),
        })
    }
}

fn register_mock(reference: Function) -> Rc<MockCompiler> {
    let mock = Rc::new(MockCompiler {
        reference,
        sources: RefCell::new(Vec::new()),
    });
    register_compiler("mock", mock.clone());
    mock
}

fn named_field() -> Function {
    let opts: Dict = [
        ("input_scheme".to_string(), vec!["x"].into()),
        ("output_scheme".to_string(), vec!["y"].into()),
    ]
    .into_iter()
    .collect();
    vector_field_with(&opts)
}

#[test]
fn registry_is_per_name() {
    register_mock(vector_field());
    assert!(has_compiler("mock"));
    assert!(!has_compiler("gcc"));
    assert!(compilers().contains(&"mock".to_string()));
}

#[test]
fn dynamic_compilation_keeps_names_and_patterns() {
    let f = named_field();
    let mock = register_mock(vector_field());
    let g = dynamic_compilation(&f, "field_c", "compiled field", "mock").unwrap();

    assert_eq!(g.name(), "field_c");
    assert_eq!(g.type_name(), "External");
    assert_eq!(g.input_names().unwrap(), vec!["x".to_string()]);
    assert_eq!(g.output_names().unwrap(), vec!["y".to_string()]);
    assert_eq!(
        g.jac_sparsity(0, 0, true, false).unwrap(),
        f.jac_sparsity(0, 0, true, false).unwrap()
    );

    let sources = mock.sources.borrow();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].0, "field_c");
    assert!(sources[0].1.contains("int field_c(const double** arg"));

    let x = [0.3, -1.2, 2.0];
    let got = g.call(&[DMatrix::column(&x)]).unwrap();
    let expected = vector_field_f64(&x);
    for (a, b) in got[0].nonzeros().iter().zip(&expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-14);
    }
}

#[test]
fn diagonal_pattern_survives_compilation() {
    let f = square("sq", 2);
    register_mock(square("sq", 2));
    let g = dynamic_compilation(&f, "sq_c", "", "mock").unwrap();
    assert_eq!(g.jac_sparsity(0, 0, true, false).unwrap(), Sparsity::diagonal(2));
}

#[test]
fn jit_routes_evaluation_through_the_plugin() {
    let mock = register_mock(vector_field());
    let opts: Dict = [
        ("jit".to_string(), true.into()),
        ("compiler".to_string(), "mock".into()),
    ]
    .into_iter()
    .collect();
    let f = vector_field_with(&opts);
    assert!(f.is_jit());
    assert_eq!(f.type_name(), "ScalarFunction");
    assert_eq!(mock.sources.borrow().len(), 1);
    assert_eq!(mock.sources.borrow()[0].0, "field");

    let x = [1.1, 0.2, -0.7];
    let got = eval1(&f, &x);
    let expected = vector_field_f64(&x);
    for (a, b) in got.iter().zip(&expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-14);
    }

    assert!(!vector_field().is_jit());
}

#[test]
fn unknown_plugin_is_not_found() {
    let f = vector_field();
    let err = dynamic_compilation(&f, "field_c", "", "no-such-compiler").unwrap_err();
    match err {
        Error::NotFound { context, name, .. } => {
            assert_eq!(context, "Compiler plugins");
            assert_eq!(name, "no-such-compiler");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn compilation_failure_propagates() {
    register_compiler("broken", Rc::new(BrokenCompiler));
    let f = vector_field();
    assert!(matches!(
        dynamic_compilation(&f, "field_c", "", "broken"),
        Err(Error::Compilation { .. })
    ));

    let x = quoll::SxMatrix::sym("x", &Sparsity::scalar());
    let opts: Dict = [
        ("jit".to_string(), true.into()),
        ("compiler".to_string(), "broken".into()),
    ]
    .into_iter()
    .collect();
    let jitted = Function::construct("id", ScalarFunction::new(vec![x.clone()], vec![x]).unwrap(), &opts);
    assert!(matches!(jitted, Err(Error::Compilation { .. })));
}
