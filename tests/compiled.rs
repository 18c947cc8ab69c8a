//! Generated C compiled with the system `cc`, loaded back through the
//! evaluation ABI and compared against the interpreted functions.
//!
//! Every test returns early when no C compiler is on the path.

#![cfg(target_os = "linux")]

mod common;

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use approx::assert_relative_eq;
use common::*;
use quoll::external::{CountFn, EvalFn, FreeMemFn, InitFn, SimpleFn, SparsityFn, WorkFn};
use quoll::{Composite, DMatrix, EntryPoints, External, Function, LoadedModule, Mx, Sparsity};

extern "C" {
    fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

const RTLD_NOW: c_int = 0x0002;

fn cc_available() -> bool {
    Command::new("cc")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("quoll-cc-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Compile `source` into a shared object and open it. The handle is never
/// closed, so resolved entry points stay valid for the whole test run.
fn build(name: &str, source: &str) -> *mut c_void {
    let dir = scratch_dir(name);
    let src = dir.join(format!("{name}.c"));
    let lib = dir.join(format!("lib{name}.so"));
    std::fs::write(&src, source).unwrap();
    let out = Command::new("cc")
        .args(["-shared", "-fPIC", "-O1", "-o"])
        .arg(&lib)
        .arg(&src)
        .arg("-lm")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "cc failed:\n{}\n--- source ---\n{source}",
        String::from_utf8_lossy(&out.stderr)
    );
    open(&lib)
}

fn open(path: &Path) -> *mut c_void {
    let path = CString::new(path.to_str().unwrap()).unwrap();
    // SAFETY: `path` is NUL terminated.
    let handle = unsafe { dlopen(path.as_ptr(), RTLD_NOW) };
    assert!(!handle.is_null(), "dlopen failed for {path:?}");
    handle
}

/// Address of `symbol` as a function pointer of type `T`.
///
/// # Safety
///
/// `T` must be the `extern "C"` signature the symbol was compiled with.
unsafe fn symbol<T: Copy>(handle: *mut c_void, symbol: &str) -> Option<T> {
    let name = CString::new(symbol).unwrap();
    let addr = dlsym(handle, name.as_ptr());
    if addr.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*mut c_void, T>(&addr))
    }
}

/// Generate, compile and wrap `f` as an external function named `name`.
fn compiled(f: &Function, name: &str) -> Function {
    let handle = build(name, &f.generate_code(name).unwrap());
    // SAFETY: the signatures below are the ones the generator emits.
    let entry = unsafe {
        EntryPoints {
            eval: symbol::<EvalFn>(handle, name).unwrap(),
            n_in: symbol::<CountFn>(handle, &format!("{name}_n_in")).unwrap(),
            n_out: symbol::<CountFn>(handle, &format!("{name}_n_out")).unwrap(),
            sparsity: symbol::<SparsityFn>(handle, &format!("{name}_sparsity")).unwrap(),
            work: symbol::<WorkFn>(handle, &format!("{name}_work")),
            init: symbol::<InitFn>(handle, &format!("{name}_init")),
            freemem: symbol::<FreeMemFn>(handle, &format!("{name}_freemem")),
            simple: symbol::<SimpleFn>(handle, &format!("{name}_simple")),
        }
    };
    // SAFETY: the library stays loaded; see `build`.
    let module = unsafe { LoadedModule::new(entry) }.unwrap();
    let ext = Function::new(name, External::new(name, Rc::new(module)).unwrap());
    ext.init().unwrap();
    ext
}

fn assert_same_outputs(reference: &Function, ext: &Function, args: &[DMatrix]) {
    let expected = reference.call(args).unwrap();
    let actual = ext.call(args).unwrap();
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.iter().zip(&actual) {
        assert_eq!(e.sparsity(), a.sparsity());
        for (x, y) in e.nonzeros().iter().zip(a.nonzeros()) {
            assert_relative_eq!(*x, *y, max_relative = 1e-12);
        }
    }
}

#[test]
fn scalar_function_matches_after_compilation() {
    if !cc_available() {
        eprintln!("skipping: no C compiler");
        return;
    }
    let f = vector_field();
    let ext = compiled(&f, "field");
    assert_eq!(ext.sparsity_in(0).unwrap(), f.sparsity_in(0).unwrap());
    for x in [[0.5, -1.0, 2.0], [1.5, 0.25, -3.0]] {
        assert_same_outputs(&f, &ext, &[DMatrix::column(&x)]);
    }
}

#[test]
fn composite_with_a_dependency_matches_after_compilation() {
    if !cc_available() {
        eprintln!("skipping: no C compiler");
        return;
    }
    let g = square("g", 2);
    let x = Mx::sym("x", &Sparsity::column(2));
    let inner = Mx::call(&g, &[x.clone()]).unwrap();
    let outer = Mx::call(&g, &inner).unwrap();
    let y = outer[0].add(&x).unwrap();
    let h = Composite::function("nest", vec![x], vec![y]).unwrap();

    let ext = compiled(&h, "nest");
    assert_same_outputs(&h, &ext, &[DMatrix::column(&[1.0, -2.0])]);
    assert_same_outputs(&h, &ext, &[DMatrix::column(&[0.3, 0.7])]);
}

#[test]
fn compact_jacobian_matches_after_compilation() {
    if !cc_available() {
        eprintln!("skipping: no C compiler");
        return;
    }
    let f = vector_field();
    let jac = f.jacobian(0, 0, true, false).unwrap();
    let ext = compiled(&jac, "jac");
    assert_eq!(ext.n_out(), jac.n_out());
    assert_eq!(ext.sparsity_out(0).unwrap(), jac.sparsity_out(0).unwrap());
    assert_same_outputs(&jac, &ext, &[DMatrix::column(&[0.5, -1.0, 2.0])]);
}

#[test]
fn hessian_matches_after_compilation() {
    if !cc_available() {
        eprintln!("skipping: no C compiler");
        return;
    }
    let f = rosenbrock(4);
    let hess = f.hessian(0, 0).unwrap();
    let ext = compiled(&hess, "hess");
    assert_same_outputs(&hess, &ext, &[DMatrix::column(&[1.2, 0.8, -0.5, 2.0])]);
}
