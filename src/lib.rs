//! Function objects for numeric optimization: evaluation in pre-planned flat
//! work memory, structural Jacobian sparsity, cached derivative functions
//! and C code generation.
//!
//! A [`Function`] wraps a [`FunctionKind`]. Two expression-based kinds are
//! provided: [`ScalarFunction`] over scalar [`SxElem`] graphs and
//! [`Composite`] over [`Mx`] call graphs, which call other functions.
//!
//! ```
//! use quoll::{DMatrix, ScalarFunction, SxMatrix};
//!
//! let x = SxMatrix::sym("x", &quoll::Sparsity::column(2));
//! let nz = x.nonzeros();
//! let y = SxMatrix::scalar(&nz[0] * &nz[1] + nz[0].sin());
//! let f = ScalarFunction::function("f", vec![x], vec![y]).unwrap();
//!
//! let out = f.call(&[DMatrix::column(&[2.0, 3.0])]).unwrap();
//! assert!((out[0].nonzeros()[0] - (6.0 + 2f64.sin())).abs() < 1e-12);
//!
//! let jac = f.jacobian(0, 0, false, false).unwrap();
//! let j = jac.call(&[DMatrix::column(&[2.0, 3.0])]).unwrap();
//! assert_eq!(j[0].shape(), (1, 2));
//! ```

pub mod codegen;
pub mod diagnostics;
pub mod element;
pub mod error;
pub mod external;
pub mod function;
pub mod jacobian;
pub mod kind;
pub mod matrix;
pub mod mx;
pub mod options;
pub mod scheme;
pub mod seed;
pub mod sparsity;
pub mod storage;
pub mod sx;
pub mod work;

pub use codegen::{Auxiliary, CodeGenerator};
pub use diagnostics::Diagnostics;
pub use element::{Bvec, Element, BVEC_SIZE};
pub use error::{Error, Result};
pub use external::{
    dynamic_compilation, register_compiler, CompiledModule, Compiler, EntryPoints, External,
    LoadedModule,
};
pub use function::{CacheEntry, Function, WeakFunction};
pub use jacobian::{BlockJacobian, JacobianProduct, NumericJacobian};
pub use kind::FunctionKind;
pub use matrix::DMatrix;
pub use mx::{Composite, Mx};
pub use options::{Dict, FunctionOptions, GenericType, DEFAULT_INF, DEFAULT_MINF, DEFAULT_ZERO};
pub use scheme::IoScheme;
pub use seed::{purgable, symbolic_adj_seed, symbolic_fwd_seed, SymbolicMatrix};
pub use sparsity::Sparsity;
pub use storage::SparseStorage;
pub use sx::{ScalarFunction, SxElem, SxMatrix};
pub use work::{Frame, Memory, Ptr, WorkPlanner, WorkSizes};
