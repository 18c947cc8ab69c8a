//! Elementary operations of the scalar expression graph.
//!
//! [`eval_op`] and [`partials`] are generic over [`ScalarOps`], so the same
//! rules evaluate numbers (`f64`) and build derivative expressions
//! ([`SxElem`](super::SxElem)).

use std::ops::{Add, Div, Mul, Neg, Sub};

use num_traits::{Float, One, Zero};

/// Elementary operation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OpCode {
    // ── Binary arithmetic ──
    Add,
    Sub,
    Mul,
    Div,
    Powf,

    // ── Unary ──
    Neg,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Tanh,
    Atan,
    Abs,
    /// Zero derivative; `sign(0) = 0`.
    Sign,
}

impl OpCode {
    #[inline]
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Powf
        )
    }

    /// Short lowercase name, used when printing expressions.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Powf => "pow",
            OpCode::Neg => "neg",
            OpCode::Sqrt => "sqrt",
            OpCode::Exp => "exp",
            OpCode::Ln => "log",
            OpCode::Sin => "sin",
            OpCode::Cos => "cos",
            OpCode::Tan => "tan",
            OpCode::Tanh => "tanh",
            OpCode::Atan => "atan",
            OpCode::Abs => "fabs",
            OpCode::Sign => "sign",
        }
    }
}

/// Arithmetic needed to evaluate and differentiate an [`OpCode`].
pub trait ScalarOps:
    Clone
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn from_f64(value: f64) -> Self;
    fn sqrt(&self) -> Self;
    fn exp(&self) -> Self;
    fn ln(&self) -> Self;
    fn sin(&self) -> Self;
    fn cos(&self) -> Self;
    fn tan(&self) -> Self;
    fn tanh(&self) -> Self;
    fn atan(&self) -> Self;
    fn abs(&self) -> Self;
    fn sign(&self) -> Self;
    fn powf(&self, exponent: &Self) -> Self;
}

impl ScalarOps for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
    #[inline]
    fn sqrt(&self) -> Self {
        Float::sqrt(*self)
    }
    #[inline]
    fn exp(&self) -> Self {
        Float::exp(*self)
    }
    #[inline]
    fn ln(&self) -> Self {
        Float::ln(*self)
    }
    #[inline]
    fn sin(&self) -> Self {
        Float::sin(*self)
    }
    #[inline]
    fn cos(&self) -> Self {
        Float::cos(*self)
    }
    #[inline]
    fn tan(&self) -> Self {
        Float::tan(*self)
    }
    #[inline]
    fn tanh(&self) -> Self {
        Float::tanh(*self)
    }
    #[inline]
    fn atan(&self) -> Self {
        Float::atan(*self)
    }
    #[inline]
    fn abs(&self) -> Self {
        Float::abs(*self)
    }
    #[inline]
    fn sign(&self) -> Self {
        if *self > 0.0 {
            1.0
        } else if *self < 0.0 {
            -1.0
        } else {
            // keeps 0 and NaN
            *self
        }
    }
    #[inline]
    fn powf(&self, exponent: &Self) -> Self {
        Float::powf(*self, *exponent)
    }
}

/// Evaluate a single operation. `b` is ignored for unary operations.
#[inline]
pub fn eval_op<T: ScalarOps>(op: OpCode, a: &T, b: &T) -> T {
    match op {
        OpCode::Add => a.clone() + b.clone(),
        OpCode::Sub => a.clone() - b.clone(),
        OpCode::Mul => a.clone() * b.clone(),
        OpCode::Div => a.clone() / b.clone(),
        OpCode::Powf => a.powf(b),
        OpCode::Neg => -a.clone(),
        OpCode::Sqrt => a.sqrt(),
        OpCode::Exp => a.exp(),
        OpCode::Ln => a.ln(),
        OpCode::Sin => a.sin(),
        OpCode::Cos => a.cos(),
        OpCode::Tan => a.tan(),
        OpCode::Tanh => a.tanh(),
        OpCode::Atan => a.atan(),
        OpCode::Abs => a.abs(),
        OpCode::Sign => a.sign(),
    }
}

/// Partial derivatives `(∂r/∂a, ∂r/∂b)` of `r = op(a, b)`.
///
/// For unary ops the second partial is zero.
pub fn partials<T: ScalarOps>(op: OpCode, a: &T, b: &T, r: &T) -> (T, T) {
    let zero = T::zero();
    let one = T::one();
    match op {
        OpCode::Add => (one.clone(), one),
        OpCode::Sub => (one.clone(), -one),
        OpCode::Mul => (b.clone(), a.clone()),
        OpCode::Div => {
            let inv = one / b.clone();
            (inv.clone(), -a.clone() * inv.clone() * inv)
        }
        OpCode::Powf => {
            // d/da a^b = b * a^(b-1), d/db a^b = a^b * ln(a)
            let da = b.clone() * a.powf(&(b.clone() - one));
            let db = r.clone() * a.ln();
            (da, db)
        }
        OpCode::Neg => (-one, zero),
        OpCode::Sqrt => (one / (T::from_f64(2.0) * r.clone()), zero),
        OpCode::Exp => (r.clone(), zero),
        OpCode::Ln => (one / a.clone(), zero),
        OpCode::Sin => (a.cos(), zero),
        OpCode::Cos => (-a.sin(), zero),
        OpCode::Tan => {
            let c = a.cos();
            (one / (c.clone() * c), zero)
        }
        OpCode::Tanh => (one - r.clone() * r.clone(), zero),
        OpCode::Atan => (one.clone() / (one + a.clone() * a.clone()), zero),
        OpCode::Abs => (a.sign(), zero),
        OpCode::Sign => (zero.clone(), zero),
    }
}

/// C expression for `op` applied to the C expressions `a` and `b`.
pub(crate) fn c_expr(op: OpCode, a: &str, b: &str) -> String {
    match op {
        OpCode::Add => format!("{a}+{b}"),
        OpCode::Sub => format!("{a}-{b}"),
        OpCode::Mul => format!("{a}*{b}"),
        OpCode::Div => format!("{a}/{b}"),
        OpCode::Powf => format!("pow({a},{b})"),
        OpCode::Neg => format!("(-{a})"),
        OpCode::Sign => format!("cg_sign({a})"),
        unary => format!("{}({a})", unary.name()),
    }
}
