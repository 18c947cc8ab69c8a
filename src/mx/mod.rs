//! Matrix-valued call graphs.
//!
//! An [`Mx`] is a node of a DAG whose leaves are symbols, structural zeros
//! and constants, and whose inner nodes are sums and outputs of function
//! calls. A call with several outputs is one shared [`CallNode`]; each of its
//! outputs is a separate `Mx`. [`Composite`] compiles such a graph into a
//! sequence of steps.

use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::function::Function;
use crate::seed::SymbolicMatrix;
use crate::sparsity::Sparsity;

mod composite;

pub use composite::Composite;

/// Node of a matrix call graph.
#[derive(Clone)]
pub struct Mx(Rc<MxNode>);

pub(crate) struct MxNode {
    sparsity: Sparsity,
    kind: MxKind,
}

pub(crate) enum MxKind {
    Symbol(String),
    /// Structurally zero; evaluates through a null pointer.
    Zero,
    Constant(Vec<f64>),
    Output { call: Rc<CallNode>, index: usize },
    Sum(Mx, Mx),
}

/// One evaluation of `f` on `args`.
#[derive(Debug)]
pub(crate) struct CallNode {
    pub(crate) f: Function,
    pub(crate) args: Vec<Mx>,
}

impl Mx {
    fn from_kind(sparsity: Sparsity, kind: MxKind) -> Mx {
        Mx(Rc::new(MxNode { sparsity, kind }))
    }

    pub fn sym(name: &str, sparsity: &Sparsity) -> Mx {
        Mx::from_kind(sparsity.clone(), MxKind::Symbol(name.to_string()))
    }

    pub fn zeros(sparsity: &Sparsity) -> Mx {
        Mx::from_kind(sparsity.clone(), MxKind::Zero)
    }

    /// Every nonzero of `sparsity` equal to `value`.
    pub fn constant(sparsity: &Sparsity, value: f64) -> Mx {
        Mx::from_kind(
            sparsity.clone(),
            MxKind::Constant(vec![value; sparsity.nnz()]),
        )
    }

    pub fn constant_values(sparsity: &Sparsity, values: Vec<f64>) -> Result<Mx> {
        if values.len() != sparsity.nnz() {
            return Err(Error::dimension(
                "Mx",
                format!(
                    "{} values given for a pattern with {} nonzeros",
                    values.len(),
                    sparsity.nnz()
                ),
            ));
        }
        Ok(Mx::from_kind(sparsity.clone(), MxKind::Constant(values)))
    }

    /// Symbolic call of `f`; one node per output.
    ///
    /// Every argument must carry exactly the declared input pattern.
    pub fn call(f: &Function, args: &[Mx]) -> Result<Vec<Mx>> {
        f.init()?;
        if args.len() != f.n_in() {
            return Err(Error::dimension(
                f.name(),
                format!("called with {} arguments, expected {}", args.len(), f.n_in()),
            ));
        }
        for (i, a) in args.iter().enumerate() {
            let sp = f.sparsity_in(i)?;
            if *a.sparsity() != sp {
                return Err(Error::dimension(
                    f.name(),
                    format!("argument {i} has pattern {}, expected {sp}", a.sparsity()),
                ));
            }
        }
        let call = Rc::new(CallNode {
            f: f.clone(),
            args: args.to_vec(),
        });
        (0..f.n_out())
            .map(|o| Ok(Mx::output_of(&call, o, f.sparsity_out(o)?)))
            .collect()
    }

    pub(crate) fn output_of(call: &Rc<CallNode>, index: usize, sparsity: Sparsity) -> Mx {
        Mx::from_kind(
            sparsity,
            MxKind::Output {
                call: Rc::clone(call),
                index,
            },
        )
    }

    /// Elementwise sum of two nodes with the same pattern. Zeros fold away.
    pub fn add(&self, other: &Mx) -> Result<Mx> {
        if self.sparsity() != other.sparsity() {
            return Err(Error::dimension(
                "Mx",
                format!(
                    "cannot add patterns {} and {}",
                    self.sparsity(),
                    other.sparsity()
                ),
            ));
        }
        if self.is_zero() {
            return Ok(other.clone());
        }
        if other.is_zero() {
            return Ok(self.clone());
        }
        Ok(Mx::from_kind(
            self.sparsity().clone(),
            MxKind::Sum(self.clone(), other.clone()),
        ))
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.0.sparsity
    }

    pub(crate) fn kind(&self) -> &MxKind {
        &self.0.kind
    }

    pub(crate) fn id(&self) -> *const MxNode {
        Rc::as_ptr(&self.0)
    }

    pub fn ptr_eq(&self, other: &Mx) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Structural zero.
    pub fn is_zero(&self) -> bool {
        matches!(self.0.kind, MxKind::Zero) || self.0.sparsity.is_empty()
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self.0.kind, MxKind::Symbol(_))
    }

    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            MxKind::Symbol(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for Mx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            MxKind::Symbol(name) => write!(f, "{name}"),
            MxKind::Zero => write!(f, "zeros({})", self.0.sparsity),
            MxKind::Constant(v) => write!(f, "{v:?}"),
            MxKind::Output { call, index } => write!(f, "{}(..){{{index}}}", call.f.name()),
            MxKind::Sum(a, b) => write!(f, "({a:?}+{b:?})"),
        }
    }
}

impl SymbolicMatrix for Mx {
    fn sym(name: &str, sparsity: &Sparsity) -> Self {
        Mx::sym(name, sparsity)
    }

    fn is_zero(&self) -> bool {
        Mx::is_zero(self)
    }

    fn sparsity(&self) -> Sparsity {
        self.0.sparsity.clone()
    }
}
