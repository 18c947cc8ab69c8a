//! Work-memory planning and the flat buffers evaluation runs in.
//!
//! Every function declares four classes of scratch memory: input-pointer
//! slots (`arg`), output-pointer slots (`res`), integer scratch (`iw`) and
//! floating scratch (`w`). Each class has a persistent counter and a
//! temporary counter:
//!
//! - persistent requests **add up**: each gets its own disjoint region and
//!   the planner hands back its offset;
//! - temporary requests take the **maximum**: steps that do not overlap in
//!   time share one scratch region.
//!
//! The total of a class is `persistent + temporary`. A function evaluated at
//! frame base `b` owns `[b, b + persistent)`; everything it calls runs with
//! its own base at `b + persistent`, inside the temporary region. Merging a
//! callee's totals into the temporary counter is therefore enough for one
//! flat buffer per class to serve an arbitrarily deep call tree.
//!
//! Buffers never hold raw pointers. A [`Ptr`] addresses an input buffer, an
//! output buffer or the work vector by index, and [`Memory`] resolves it.

use std::ops::Add;
use std::os::raw::c_int;

use crate::element::Element;
use crate::error::Result;
use crate::function::Function;

/// Sizes (or offsets) of the four work classes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkSizes {
    pub arg: usize,
    pub res: usize,
    pub iw: usize,
    pub w: usize,
}

impl WorkSizes {
    pub const fn new(arg: usize, res: usize, iw: usize, w: usize) -> Self {
        WorkSizes { arg, res, iw, w }
    }

    /// Componentwise maximum.
    pub fn max(self, other: WorkSizes) -> WorkSizes {
        WorkSizes {
            arg: self.arg.max(other.arg),
            res: self.res.max(other.res),
            iw: self.iw.max(other.iw),
            w: self.w.max(other.w),
        }
    }

    /// True when every class of `self` fits into `other`.
    pub fn fits_in(self, other: WorkSizes) -> bool {
        self.arg <= other.arg && self.res <= other.res && self.iw <= other.iw && self.w <= other.w
    }
}

impl Add for WorkSizes {
    type Output = WorkSizes;

    fn add(self, rhs: WorkSizes) -> WorkSizes {
        WorkSizes {
            arg: self.arg + rhs.arg,
            res: self.res + rhs.res,
            iw: self.iw + rhs.iw,
            w: self.w + rhs.w,
        }
    }
}

/// Persistent and temporary counters of one function.
///
/// Counters only grow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkPlanner {
    persistent: WorkSizes,
    temporary: WorkSizes,
}

#[inline]
fn grow(counter: &mut usize, size: usize, persistent: bool) -> usize {
    if persistent {
        let offset = *counter;
        *counter += size;
        offset
    } else {
        *counter = (*counter).max(size);
        0
    }
}

impl WorkPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve input-pointer slots. Returns the offset of a persistent
    /// reservation inside the persistent region (0 for temporary ones).
    pub fn alloc_arg(&mut self, size: usize, persistent: bool) -> usize {
        let counter = if persistent {
            &mut self.persistent.arg
        } else {
            &mut self.temporary.arg
        };
        grow(counter, size, persistent)
    }

    /// Reserve output-pointer slots.
    pub fn alloc_res(&mut self, size: usize, persistent: bool) -> usize {
        let counter = if persistent {
            &mut self.persistent.res
        } else {
            &mut self.temporary.res
        };
        grow(counter, size, persistent)
    }

    /// Reserve integer scratch.
    pub fn alloc_iw(&mut self, size: usize, persistent: bool) -> usize {
        let counter = if persistent {
            &mut self.persistent.iw
        } else {
            &mut self.temporary.iw
        };
        grow(counter, size, persistent)
    }

    /// Reserve floating scratch.
    pub fn alloc_w(&mut self, size: usize, persistent: bool) -> usize {
        let counter = if persistent {
            &mut self.persistent.w
        } else {
            &mut self.temporary.w
        };
        grow(counter, size, persistent)
    }

    /// Reserve all four classes at once. Returns the persistent offsets.
    pub fn alloc_sizes(&mut self, sizes: WorkSizes, persistent: bool) -> WorkSizes {
        WorkSizes {
            arg: self.alloc_arg(sizes.arg, persistent),
            res: self.alloc_res(sizes.res, persistent),
            iw: self.alloc_iw(sizes.iw, persistent),
            w: self.alloc_w(sizes.w, persistent),
        }
    }

    /// Merge the total requirements of `f`, which must be initialized.
    ///
    /// A temporary merge lets `f` run at the caller's scratch base. A
    /// persistent merge gives `f` a private region; call it with its base at
    /// the caller's base plus the returned offsets.
    pub fn alloc_function(&mut self, f: &Function, persistent: bool) -> Result<WorkSizes> {
        let sizes = f.work_sizes()?;
        Ok(self.alloc_sizes(sizes, persistent))
    }

    pub fn persistent(&self) -> WorkSizes {
        self.persistent
    }

    pub fn temporary(&self) -> WorkSizes {
        self.temporary
    }

    /// `persistent + temporary`, the size of a flat buffer per class.
    pub fn total(&self) -> WorkSizes {
        self.persistent + self.temporary
    }
}

/// Index-based pointer into a [`Memory`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ptr {
    /// Reads as zero, writes are dropped.
    #[default]
    Null,
    /// `(buffer, offset)` into the caller's input buffers.
    Input(usize, usize),
    /// `(buffer, offset)` into the caller's output buffers.
    Output(usize, usize),
    /// Offset into the floating work vector.
    Work(usize),
}

impl Ptr {
    #[inline]
    pub fn is_null(self) -> bool {
        matches!(self, Ptr::Null)
    }

    /// Pointer `k` elements further.
    #[inline]
    pub fn offset(self, k: usize) -> Ptr {
        match self {
            Ptr::Null => Ptr::Null,
            Ptr::Input(i, off) => Ptr::Input(i, off + k),
            Ptr::Output(i, off) => Ptr::Output(i, off + k),
            Ptr::Work(off) => Ptr::Work(off + k),
        }
    }
}

/// Flat buffers of one evaluation: the top-level input and output nonzeros,
/// pointer slots, and work vectors.
#[derive(Clone, Debug)]
pub struct Memory<T> {
    pub input: Vec<Vec<T>>,
    pub output: Vec<Vec<T>>,
    pub arg: Vec<Ptr>,
    pub res: Vec<Ptr>,
    pub iw: Vec<c_int>,
    pub w: Vec<T>,
}

impl<T: Element> Memory<T> {
    /// Buffers sized exactly to `sizes`, with input/output buffers of the
    /// given nonzero counts bound to the root frame.
    pub fn new(sizes: WorkSizes, nnz_in: &[usize], nnz_out: &[usize]) -> Self {
        let mut mem = Memory {
            input: nnz_in.iter().map(|&n| vec![T::zero(); n]).collect(),
            output: nnz_out.iter().map(|&n| vec![T::zero(); n]).collect(),
            arg: vec![Ptr::Null; sizes.arg.max(nnz_in.len())],
            res: vec![Ptr::Null; sizes.res.max(nnz_out.len())],
            iw: vec![0; sizes.iw],
            w: vec![T::zero(); sizes.w],
        };
        mem.bind_root();
        mem
    }

    /// Current sizes of the pointer and work vectors.
    pub fn sizes(&self) -> WorkSizes {
        WorkSizes::new(self.arg.len(), self.res.len(), self.iw.len(), self.w.len())
    }

    /// Point the root frame's slots at the input and output buffers.
    pub fn bind_root(&mut self) {
        for i in 0..self.input.len() {
            self.arg[i] = Ptr::Input(i, 0);
        }
        for i in 0..self.output.len() {
            self.res[i] = Ptr::Output(i, 0);
        }
    }

    #[inline]
    pub fn get(&self, p: Ptr, k: usize) -> T {
        match p {
            Ptr::Null => T::zero(),
            Ptr::Input(i, off) => self.input[i][off + k],
            Ptr::Output(i, off) => self.output[i][off + k],
            Ptr::Work(off) => self.w[off + k],
        }
    }

    #[inline]
    pub fn set(&mut self, p: Ptr, k: usize, value: T) {
        match p {
            Ptr::Null => {}
            Ptr::Input(i, off) => self.input[i][off + k] = value,
            Ptr::Output(i, off) => self.output[i][off + k] = value,
            Ptr::Work(off) => self.w[off + k] = value,
        }
    }

    /// Copy `n` elements; a null source writes zeros, a null target is skipped.
    pub fn copy(&mut self, src: Ptr, dst: Ptr, n: usize) {
        if dst.is_null() {
            return;
        }
        for k in 0..n {
            let v = self.get(src, k);
            self.set(dst, k, v);
        }
    }

    /// Set `n` elements to `value`; a null target is skipped.
    pub fn fill(&mut self, dst: Ptr, n: usize, value: T) {
        if dst.is_null() {
            return;
        }
        for k in 0..n {
            self.set(dst, k, value);
        }
    }
}

/// Where a function runs inside a [`Memory`]: its own region starts at
/// `base`, its callees start at `scratch`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub base: WorkSizes,
    pub scratch: WorkSizes,
}

impl Frame {
    pub fn new(base: WorkSizes, persistent: WorkSizes) -> Self {
        Frame {
            base,
            scratch: base + persistent,
        }
    }

    /// Slot of this function's input `i`.
    #[inline]
    pub fn arg(&self, i: usize) -> usize {
        self.base.arg + i
    }

    /// Slot of this function's output `i`.
    #[inline]
    pub fn res(&self, i: usize) -> usize {
        self.base.res + i
    }

    #[inline]
    pub fn iw(&self, offset: usize) -> usize {
        self.base.iw + offset
    }

    #[inline]
    pub fn w(&self, offset: usize) -> usize {
        self.base.w + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_sums_temporary_maxes() {
        let mut p = WorkPlanner::new();
        assert_eq!(p.alloc_w(5, true), 0);
        assert_eq!(p.alloc_w(3, true), 5);
        p.alloc_w(7, false);
        p.alloc_w(4, false);
        assert_eq!(p.persistent().w, 8);
        assert_eq!(p.temporary().w, 7);
        assert_eq!(p.total().w, 15);
    }

    #[test]
    fn null_reads_zero_and_drops_writes() {
        let mut mem: Memory<f64> = Memory::new(WorkSizes::new(1, 1, 0, 2), &[1], &[1]);
        assert_eq!(mem.get(Ptr::Null, 3), 0.0);
        mem.set(Ptr::Null, 0, 1.0);
        mem.set(Ptr::Work(1), 0, 2.5);
        mem.copy(Ptr::Work(1), Ptr::Output(0, 0), 1);
        assert_eq!(mem.output[0][0], 2.5);
        assert_eq!(mem.arg[0], Ptr::Input(0, 0));
    }
}
