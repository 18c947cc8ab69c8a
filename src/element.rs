//! Element types flowing through one evaluation routine.
//!
//! Numeric evaluation works on `f64`; structural sparsity propagation works
//! on [`Bvec`] marks. Function kinds write their traversal once, generic over
//! [`Element`], and get both analyses from it.

use std::fmt::Debug;

use crate::error::Result;
use crate::function::Function;
use crate::sx::opcode::{eval_op, OpCode};
use crate::work::{Memory, WorkSizes};

/// Bitvector of structural marks. Each bit is an independent seed lane.
pub type Bvec = u64;

/// Number of seed lanes in one [`Bvec`].
pub const BVEC_SIZE: usize = Bvec::BITS as usize;

/// Value type of an evaluation sweep.
pub trait Element: Copy + PartialEq + Debug + 'static {
    /// Value read through a null pointer.
    fn zero() -> Self;

    /// Embedding of a numeric constant. Constants carry no marks.
    fn constant(value: f64) -> Self;

    /// Sum of two contributions (numeric addition, union of marks).
    fn accumulate(self, other: Self) -> Self;

    fn unary(op: OpCode, a: Self) -> Self;

    fn binary(op: OpCode, a: Self, b: Self) -> Self;

    /// Run `f` on this element type with its frame based at `base`.
    fn dispatch(f: &Function, mem: &mut Memory<Self>, base: WorkSizes) -> Result<()>;
}

impl Element for f64 {
    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn constant(value: f64) -> Self {
        value
    }

    #[inline]
    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn unary(op: OpCode, a: Self) -> Self {
        eval_op(op, &a, &0.0)
    }

    #[inline]
    fn binary(op: OpCode, a: Self, b: Self) -> Self {
        eval_op(op, &a, &b)
    }

    fn dispatch(f: &Function, mem: &mut Memory<Self>, base: WorkSizes) -> Result<()> {
        f.eval_at(mem, base)
    }
}

impl Element for Bvec {
    #[inline]
    fn zero() -> Self {
        0
    }

    #[inline]
    fn constant(_value: f64) -> Self {
        0
    }

    #[inline]
    fn accumulate(self, other: Self) -> Self {
        self | other
    }

    #[inline]
    fn unary(_op: OpCode, a: Self) -> Self {
        a
    }

    #[inline]
    fn binary(_op: OpCode, a: Self, b: Self) -> Self {
        a | b
    }

    fn dispatch(f: &Function, mem: &mut Memory<Self>, base: WorkSizes) -> Result<()> {
        f.sp_fwd_at(mem, base)
    }
}
