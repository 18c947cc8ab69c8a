//! C emission for one function: definition, call sites and meta entry points.

use std::fmt::Write;

use super::Function;
use crate::codegen::CodeGenerator;
use crate::error::{Error, Result};

impl Function {
    /// Calls through `(const double* arg, double* res)` are possible: the
    /// kind allows it and it has one input and one output.
    pub fn simplified_call(&self) -> bool {
        self.0.kind.borrow().simplified_call() && self.n_in() == 1 && self.n_out() == 1
    }

    pub fn has_codegen(&self) -> bool {
        self.0.kind.borrow().has_codegen()
    }

    /// Call-site statement for this function, using the convention it
    /// advertises. `arg`/`res` name pointer arrays, `iw`/`w` work pointers.
    /// Emits the definition into `g` first if needed.
    pub fn generate_call(
        &self,
        g: &mut CodeGenerator,
        arg: &str,
        res: &str,
        iw: &str,
        w: &str,
    ) -> Result<String> {
        let fname = g.add_dependency(self)?;
        if self.simplified_call() {
            Ok(format!("  {fname}_simple({arg}[0], {res}[0]);\n"))
        } else {
            Ok(format!("  if ({fname}({arg}, {res}, {iw}, {w}, 0)) return 1;\n"))
        }
    }

    /// Emit the generic-convention definition of this function as `fname`,
    /// plus `fname_simple` when a simplified call is possible.
    pub fn generate_function(&self, g: &mut CodeGenerator, fname: &str, exported: bool) -> Result<()> {
        self.ensure_ready()?;
        let body = {
            let kind = self.0.kind.borrow();
            if !kind.has_codegen() {
                return Err(Error::unsupported(&self.0.name, "codegen"));
            }
            kind.generate_body(self, g)?
        };
        let storage = if exported { "" } else { "static " };
        let mut def = String::new();
        let _ = write!(
            def,
            "/* {} */\n\
             {storage}int {fname}(const double** arg, double** res, int* iw, double* w, void* mem) {{\n\
             {body}\
             \x20 return 0;\n\
             }}\n\n",
            self.0.name
        );
        if self.simplified_call() {
            let sz = self.work_sizes()?;
            let _ = write!(
                def,
                "{storage}void {fname}_simple(const double* arg, double* res) {{\n\
                 \x20 const double* arg1[{}];\n\
                 \x20 double* res1[{}];\n\
                 \x20 int iw1[{}];\n\
                 \x20 double w1[{}];\n\
                 \x20 arg1[0] = arg;\n\
                 \x20 res1[0] = res;\n\
                 \x20 {fname}(arg1, res1, iw1, w1, 0);\n\
                 }}\n\n",
                sz.arg.max(1),
                sz.res.max(1),
                sz.iw.max(1),
                sz.w.max(1)
            );
        }
        g.add_definition(&def);
        Ok(())
    }

    /// Emit the `_n_in`, `_n_out`, `_init`, `_freemem`, `_work` and
    /// `_sparsity` entry points of the exported function `fname`.
    pub fn generate_meta(&self, g: &mut CodeGenerator, fname: &str) -> Result<()> {
        let (n_in, n_out) = (self.n_in(), self.n_out());
        let sz = self.work_sizes()?;
        let mut cases = String::new();
        for i in 0..n_in {
            let s = g.sparsity(&self.sparsity_in(i)?);
            let _ = writeln!(cases, "    case {i}: s = {s}; break;");
        }
        for o in 0..n_out {
            let s = g.sparsity(&self.sparsity_out(o)?);
            let _ = writeln!(cases, "    case {}: s = {s}; break;", n_in + o);
        }
        let mut def = String::new();
        let _ = write!(
            def,
            "int {fname}_n_in(void) {{ return {n_in}; }}\n\n\
             int {fname}_n_out(void) {{ return {n_out}; }}\n\n\
             int {fname}_init(void** mem, int* n_in, int* n_out, void* data) {{\n\
             \x20 if (mem) *mem = 0;\n\
             \x20 if (n_in) *n_in = {n_in};\n\
             \x20 if (n_out) *n_out = {n_out};\n\
             \x20 return 0;\n\
             }}\n\n\
             int {fname}_freemem(void* mem) {{\n\
             \x20 return 0;\n\
             }}\n\n\
             int {fname}_work(void* mem, int* sz_arg, int* sz_res, int* sz_iw, int* sz_w) {{\n\
             \x20 if (sz_arg) *sz_arg = {};\n\
             \x20 if (sz_res) *sz_res = {};\n\
             \x20 if (sz_iw) *sz_iw = {};\n\
             \x20 if (sz_w) *sz_w = {};\n\
             \x20 return 0;\n\
             }}\n\n\
             int {fname}_sparsity(void* mem, int i, int* n_row, int* n_col, const int** colind, const int** row) {{\n\
             \x20 const int* s;\n\
             \x20 switch (i) {{\n\
             {cases}\
             \x20   default: return 1;\n\
             \x20 }}\n\
             \x20 if (n_row) *n_row = s[0];\n\
             \x20 if (n_col) *n_col = s[1];\n\
             \x20 if (colind) *colind = s + 2;\n\
             \x20 if (row) *row = s + 3 + s[1];\n\
             \x20 return 0;\n\
             }}\n\n",
            sz.arg, sz.res, sz.iw, sz.w
        );
        g.add_definition(&def);
        Ok(())
    }

    /// Self-contained C source exporting this function as `fname`.
    pub fn generate_code(&self, fname: &str) -> Result<String> {
        let mut g = CodeGenerator::new();
        g.add_as(self, fname)?;
        Ok(g.generate())
    }
}
