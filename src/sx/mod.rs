//! Scalar expression graphs.
//!
//! [`SxElem`] is a reference-counted DAG of scalar operations over named
//! symbols and constants. Constructors fold constants and drop trivial
//! identities (`x + 0`, `x * 1`, `x * 0`, `x - x`, `-(-x)`), so structurally
//! zero derivatives stay zero. [`SxMatrix`] attaches a sparsity pattern to
//! one element per nonzero, and [`ScalarFunction`] compiles such matrices
//! into an instruction tape.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use num_traits::{One, Zero};

use crate::error::{Error, Result};
use crate::seed::SymbolicMatrix;
use crate::sparsity::Sparsity;

mod function;
pub mod opcode;

pub use function::ScalarFunction;
use opcode::{eval_op, OpCode, ScalarOps};

/// Node of a scalar expression graph.
#[derive(Clone)]
pub struct SxElem(Rc<SxNode>);

pub(crate) enum SxNode {
    Const(f64),
    Symbol(String),
    Unary(OpCode, SxElem),
    Binary(OpCode, SxElem, SxElem),
}

impl SxElem {
    pub fn sym(name: impl Into<String>) -> SxElem {
        SxElem(Rc::new(SxNode::Symbol(name.into())))
    }

    pub fn constant(value: f64) -> SxElem {
        SxElem(Rc::new(SxNode::Const(value)))
    }

    pub(crate) fn node(&self) -> &SxNode {
        &self.0
    }

    /// Identity of the node, for graph traversal.
    pub(crate) fn id(&self) -> *const SxNode {
        Rc::as_ptr(&self.0)
    }

    pub fn ptr_eq(&self, other: &SxElem) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The value, when this is a constant.
    pub fn value(&self) -> Option<f64> {
        match *self.0 {
            SxNode::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.value().is_some()
    }

    pub fn is_symbol(&self) -> bool {
        matches!(*self.0, SxNode::Symbol(_))
    }

    /// Name of a symbol.
    pub fn name(&self) -> Option<&str> {
        match &*self.0 {
            SxNode::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// The constant zero. Symbols are never considered zero.
    pub fn is_zero(&self) -> bool {
        self.value() == Some(0.0)
    }

    pub fn is_one(&self) -> bool {
        self.value() == Some(1.0)
    }

    pub fn unary(op: OpCode, a: &SxElem) -> SxElem {
        if let Some(v) = a.value() {
            return SxElem::constant(eval_op(op, &v, &0.0));
        }
        if op == OpCode::Neg {
            if let SxNode::Unary(OpCode::Neg, inner) = &*a.0 {
                return inner.clone();
            }
        }
        SxElem(Rc::new(SxNode::Unary(op, a.clone())))
    }

    pub fn binary(op: OpCode, a: &SxElem, b: &SxElem) -> SxElem {
        if let (Some(x), Some(y)) = (a.value(), b.value()) {
            return SxElem::constant(eval_op(op, &x, &y));
        }
        match op {
            OpCode::Add if a.is_zero() => return b.clone(),
            OpCode::Add if b.is_zero() => return a.clone(),
            OpCode::Sub if b.is_zero() => return a.clone(),
            OpCode::Sub if a.ptr_eq(b) => return SxElem::constant(0.0),
            OpCode::Sub if a.is_zero() => return SxElem::unary(OpCode::Neg, b),
            OpCode::Mul if a.is_zero() || b.is_zero() => return SxElem::constant(0.0),
            OpCode::Mul if a.is_one() => return b.clone(),
            OpCode::Mul if b.is_one() => return a.clone(),
            OpCode::Div if b.is_one() => return a.clone(),
            OpCode::Div if a.is_zero() => return SxElem::constant(0.0),
            OpCode::Powf if b.is_one() => return a.clone(),
            OpCode::Powf if b.is_zero() => return SxElem::constant(1.0),
            _ => {}
        }
        SxElem(Rc::new(SxNode::Binary(op, a.clone(), b.clone())))
    }

    pub fn sqrt(&self) -> SxElem {
        SxElem::unary(OpCode::Sqrt, self)
    }

    pub fn exp(&self) -> SxElem {
        SxElem::unary(OpCode::Exp, self)
    }

    pub fn ln(&self) -> SxElem {
        SxElem::unary(OpCode::Ln, self)
    }

    pub fn sin(&self) -> SxElem {
        SxElem::unary(OpCode::Sin, self)
    }

    pub fn cos(&self) -> SxElem {
        SxElem::unary(OpCode::Cos, self)
    }

    pub fn tan(&self) -> SxElem {
        SxElem::unary(OpCode::Tan, self)
    }

    pub fn tanh(&self) -> SxElem {
        SxElem::unary(OpCode::Tanh, self)
    }

    pub fn atan(&self) -> SxElem {
        SxElem::unary(OpCode::Atan, self)
    }

    pub fn abs(&self) -> SxElem {
        SxElem::unary(OpCode::Abs, self)
    }

    pub fn sign(&self) -> SxElem {
        SxElem::unary(OpCode::Sign, self)
    }

    pub fn powf(&self, exponent: &SxElem) -> SxElem {
        SxElem::binary(OpCode::Powf, self, exponent)
    }
}

impl From<f64> for SxElem {
    fn from(v: f64) -> Self {
        SxElem::constant(v)
    }
}

impl fmt::Debug for SxElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for SxElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            SxNode::Const(v) => write!(f, "{v}"),
            SxNode::Symbol(name) => write!(f, "{name}"),
            SxNode::Unary(OpCode::Neg, a) => write!(f, "(-{a})"),
            SxNode::Unary(op, a) => write!(f, "{}({a})", op.name()),
            SxNode::Binary(OpCode::Powf, a, b) => write!(f, "pow({a},{b})"),
            SxNode::Binary(op, a, b) => {
                let sym = match op {
                    OpCode::Add => "+",
                    OpCode::Sub => "-",
                    OpCode::Mul => "*",
                    _ => "/",
                };
                write!(f, "({a}{sym}{b})")
            }
        }
    }
}

// ── Operator overloading ──

macro_rules! sx_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for SxElem {
            type Output = SxElem;
            fn $method(self, rhs: SxElem) -> SxElem {
                SxElem::binary($op, &self, &rhs)
            }
        }

        impl<'a> $trait<&'a SxElem> for &'a SxElem {
            type Output = SxElem;
            fn $method(self, rhs: &'a SxElem) -> SxElem {
                SxElem::binary($op, self, rhs)
            }
        }

        impl<'a> $trait<&'a SxElem> for SxElem {
            type Output = SxElem;
            fn $method(self, rhs: &'a SxElem) -> SxElem {
                SxElem::binary($op, &self, rhs)
            }
        }

        impl<'a> $trait<SxElem> for &'a SxElem {
            type Output = SxElem;
            fn $method(self, rhs: SxElem) -> SxElem {
                SxElem::binary($op, self, &rhs)
            }
        }

        impl $trait<f64> for SxElem {
            type Output = SxElem;
            fn $method(self, rhs: f64) -> SxElem {
                SxElem::binary($op, &self, &SxElem::constant(rhs))
            }
        }

        impl $trait<SxElem> for f64 {
            type Output = SxElem;
            fn $method(self, rhs: SxElem) -> SxElem {
                SxElem::binary($op, &SxElem::constant(self), &rhs)
            }
        }
    };
}

sx_binop!(Add, add, OpCode::Add);
sx_binop!(Sub, sub, OpCode::Sub);
sx_binop!(Mul, mul, OpCode::Mul);
sx_binop!(Div, div, OpCode::Div);

impl Neg for SxElem {
    type Output = SxElem;
    fn neg(self) -> SxElem {
        SxElem::unary(OpCode::Neg, &self)
    }
}

impl Neg for &SxElem {
    type Output = SxElem;
    fn neg(self) -> SxElem {
        SxElem::unary(OpCode::Neg, self)
    }
}

impl Zero for SxElem {
    fn zero() -> Self {
        SxElem::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        SxElem::is_zero(self)
    }
}

impl One for SxElem {
    fn one() -> Self {
        SxElem::constant(1.0)
    }
}

impl ScalarOps for SxElem {
    fn from_f64(value: f64) -> Self {
        SxElem::constant(value)
    }
    fn sqrt(&self) -> Self {
        SxElem::sqrt(self)
    }
    fn exp(&self) -> Self {
        SxElem::exp(self)
    }
    fn ln(&self) -> Self {
        SxElem::ln(self)
    }
    fn sin(&self) -> Self {
        SxElem::sin(self)
    }
    fn cos(&self) -> Self {
        SxElem::cos(self)
    }
    fn tan(&self) -> Self {
        SxElem::tan(self)
    }
    fn tanh(&self) -> Self {
        SxElem::tanh(self)
    }
    fn atan(&self) -> Self {
        SxElem::atan(self)
    }
    fn abs(&self) -> Self {
        SxElem::abs(self)
    }
    fn sign(&self) -> Self {
        SxElem::sign(self)
    }
    fn powf(&self, exponent: &Self) -> Self {
        SxElem::powf(self, exponent)
    }
}

// ── Matrices ──

/// Sparse matrix of scalar expressions, one per structural nonzero.
#[derive(Clone, Debug)]
pub struct SxMatrix {
    sparsity: Sparsity,
    nz: Vec<SxElem>,
}

impl SxMatrix {
    pub fn new(sparsity: Sparsity, nz: Vec<SxElem>) -> Result<SxMatrix> {
        if nz.len() != sparsity.nnz() {
            return Err(Error::dimension(
                "SxMatrix",
                format!(
                    "{} nonzeros given for a pattern with {}",
                    nz.len(),
                    sparsity.nnz()
                ),
            ));
        }
        Ok(SxMatrix { sparsity, nz })
    }

    /// One fresh symbol per nonzero: `name` for a single nonzero,
    /// `name_0, name_1, ..` otherwise.
    pub fn sym(name: &str, sparsity: &Sparsity) -> SxMatrix {
        let n = sparsity.nnz();
        let nz = (0..n)
            .map(|k| {
                if n == 1 {
                    SxElem::sym(name)
                } else {
                    SxElem::sym(format!("{name}_{k}"))
                }
            })
            .collect();
        SxMatrix {
            sparsity: sparsity.clone(),
            nz,
        }
    }

    /// Every nonzero the constant zero.
    pub fn zeros(sparsity: &Sparsity) -> SxMatrix {
        SxMatrix {
            sparsity: sparsity.clone(),
            nz: vec![SxElem::constant(0.0); sparsity.nnz()],
        }
    }

    pub fn scalar(e: SxElem) -> SxMatrix {
        SxMatrix {
            sparsity: Sparsity::scalar(),
            nz: vec![e],
        }
    }

    /// Dense column.
    pub fn column(elems: Vec<SxElem>) -> SxMatrix {
        SxMatrix {
            sparsity: Sparsity::column(elems.len()),
            nz: elems,
        }
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }

    pub fn nonzeros(&self) -> &[SxElem] {
        &self.nz
    }

    pub fn nnz(&self) -> usize {
        self.nz.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.sparsity.shape()
    }
}

impl SymbolicMatrix for SxMatrix {
    fn sym(name: &str, sparsity: &Sparsity) -> Self {
        SxMatrix::sym(name, sparsity)
    }

    fn is_zero(&self) -> bool {
        self.nz.iter().all(SxElem::is_zero)
    }

    fn sparsity(&self) -> Sparsity {
        self.sparsity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_constants_and_identities() {
        let x = SxElem::sym("x");
        assert_eq!((SxElem::constant(2.0) * 3.0).value(), Some(6.0));
        assert!((x.clone() + 0.0).ptr_eq(&x));
        assert!((x.clone() * 1.0).ptr_eq(&x));
        assert!((x.clone() * 0.0).is_zero());
        assert!((&x - &x).is_zero());
        assert!((-(-x.clone())).ptr_eq(&x));
    }

    #[test]
    fn symbol_names() {
        let m = SxMatrix::sym("v", &Sparsity::column(2));
        assert_eq!(m.nonzeros()[1].name(), Some("v_1"));
        let s = SxMatrix::sym("s", &Sparsity::scalar());
        assert_eq!(s.nonzeros()[0].name(), Some("s"));
        assert_eq!(format!("{}", s.nonzeros()[0].sin() * 2.0), "(sin(s)*2)");
    }
}
