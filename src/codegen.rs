//! C source emission.
//!
//! A [`CodeGenerator`] collects function definitions, the auxiliary helpers
//! they use and the sparsity arrays of the exported functions, then renders
//! one self-contained translation unit. Every function reached through
//! [`CodeGenerator::add_dependency`] is emitted exactly once, before anything
//! that calls it.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::error::Result;
use crate::function::Function;
use crate::sparsity::Sparsity;

/// Helper routines emitted on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Auxiliary {
    /// `cg_copy(x, n, y)`: copy `n` values, zeros for a null source.
    Copy,
    /// `cg_fill(x, n, v)`: set `n` values.
    Fill,
    /// `cg_sign(x)`.
    Sign,
}

impl Auxiliary {
    fn source(self) -> &'static str {
        match self {
            Auxiliary::Copy => {
                "static void cg_copy(const double* x, int n, double* y) {\n\
                 \x20 int i;\n\
                 \x20 if (!y) return;\n\
                 \x20 for (i = 0; i < n; ++i) y[i] = x ? x[i] : 0;\n\
                 }\n\n"
            }
            Auxiliary::Fill => {
                "static void cg_fill(double* x, int n, double v) {\n\
                 \x20 int i;\n\
                 \x20 if (!x) return;\n\
                 \x20 for (i = 0; i < n; ++i) x[i] = v;\n\
                 }\n\n"
            }
            Auxiliary::Sign => {
                "static double cg_sign(double x) {\n\
                 \x20 return x > 0 ? 1 : x < 0 ? -1 : x;\n\
                 }\n\n"
            }
        }
    }
}

/// Accumulates generated C code.
#[derive(Default)]
pub struct CodeGenerator {
    added: Vec<(Function, String)>,
    definitions: String,
    auxiliaries: BTreeSet<Auxiliary>,
    sparsities: Vec<(Vec<usize>, String)>,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `f` under its sanitized name, with its meta entry points.
    pub fn add(&mut self, f: &Function) -> Result<()> {
        let fname = f.sanitized_name();
        self.add_as(f, &fname)
    }

    /// Export `f` as `fname`, with `fname_n_in`, `fname_work`, etc.
    pub fn add_as(&mut self, f: &Function, fname: &str) -> Result<()> {
        f.generate_function(self, fname, true)?;
        f.generate_meta(self, fname)
    }

    /// C name of `f` as a dependency, emitting its definition on first use.
    pub fn add_dependency(&mut self, f: &Function) -> Result<String> {
        if let Some((_, name)) = self.added.iter().find(|(g, _)| g == f) {
            return Ok(name.clone());
        }
        let name = format!("f{}", self.added.len());
        self.added.push((f.clone(), name.clone()));
        f.generate_function(self, &name, false)?;
        Ok(name)
    }

    /// Number of distinct dependencies emitted so far.
    pub fn num_dependencies(&self) -> usize {
        self.added.len()
    }

    /// C name of the (deduplicated) compressed array describing `sp`.
    pub fn sparsity(&mut self, sp: &Sparsity) -> String {
        let data = sp.compressed();
        if let Some((_, name)) = self.sparsities.iter().find(|(d, _)| *d == data) {
            return name.clone();
        }
        let name = format!("s{}", self.sparsities.len());
        self.sparsities.push((data, name.clone()));
        name
    }

    pub fn add_auxiliary(&mut self, aux: Auxiliary) {
        self.auxiliaries.insert(aux);
    }

    pub(crate) fn add_definition(&mut self, text: &str) {
        self.definitions.push_str(text);
    }

    /// C literal for `v`.
    pub fn constant(v: f64) -> String {
        if v.is_nan() {
            "NAN".to_string()
        } else if v == f64::INFINITY {
            "INFINITY".to_string()
        } else if v == f64::NEG_INFINITY {
            "-INFINITY".to_string()
        } else {
            format!("{v:?}")
        }
    }

    /// The complete translation unit.
    pub fn generate(&self) -> String {
        let mut out = String::new();
        out.push_str("/* Generated by quoll */\n");
        out.push_str("#include <math.h>\n\n");
        for aux in &self.auxiliaries {
            out.push_str(aux.source());
        }
        for (data, name) in &self.sparsities {
            let values: Vec<String> = data.iter().map(usize::to_string).collect();
            let _ = writeln!(out, "static const int {name}[] = {{{}}};", values.join(", "));
        }
        if !self.sparsities.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.definitions);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparsity_arrays_are_shared() {
        let mut g = CodeGenerator::new();
        let a = g.sparsity(&Sparsity::dense(2, 1));
        let b = g.sparsity(&Sparsity::column(2));
        let c = g.sparsity(&Sparsity::scalar());
        assert_eq!(a, b);
        assert_ne!(a, c);
        let src = g.generate();
        assert!(src.contains("static const int s0[] = {2, 1, 0, 2, 0, 1};"));
    }

    #[test]
    fn constants_are_valid_c() {
        assert_eq!(CodeGenerator::constant(1.0), "1.0");
        assert_eq!(CodeGenerator::constant(f64::NEG_INFINITY), "-INFINITY");
        assert_eq!(CodeGenerator::constant(f64::NAN), "NAN");
    }
}
