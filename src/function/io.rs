//! Shapes, schemes and the I/O buffers of a function.

use super::{Function, Phase};
use crate::error::{Error, Result};
use crate::matrix::DMatrix;
use crate::sparsity::Sparsity;

impl Function {
    pub fn n_in(&self) -> usize {
        let st = self.state();
        if st.phase != Phase::Configured {
            return st.sparsity_in.len();
        }
        drop(st);
        self.0.kind.borrow().n_in()
    }

    pub fn n_out(&self) -> usize {
        let st = self.state();
        if st.phase != Phase::Configured {
            return st.sparsity_out.len();
        }
        drop(st);
        self.0.kind.borrow().n_out()
    }

    pub(crate) fn check_in(&self, i: usize) -> Result<()> {
        let len = self.n_in();
        if i < len {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                function: self.0.name.clone(),
                io: "input",
                index: i,
                len,
            })
        }
    }

    pub(crate) fn check_out(&self, o: usize) -> Result<()> {
        let len = self.n_out();
        if o < len {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                function: self.0.name.clone(),
                io: "output",
                index: o,
                len,
            })
        }
    }

    // ── Sparsity and shape ──

    pub fn sparsity_in(&self, i: usize) -> Result<Sparsity> {
        self.check_in(i)?;
        let st = self.state();
        if st.phase != Phase::Configured {
            return Ok(st.sparsity_in[i].clone());
        }
        drop(st);
        Ok(self.0.kind.borrow().sparsity_in(i))
    }

    pub fn sparsity_out(&self, o: usize) -> Result<Sparsity> {
        self.check_out(o)?;
        let st = self.state();
        if st.phase != Phase::Configured {
            return Ok(st.sparsity_out[o].clone());
        }
        drop(st);
        Ok(self.0.kind.borrow().sparsity_out(o))
    }

    pub fn nnz_in(&self, i: usize) -> Result<usize> {
        Ok(self.sparsity_in(i)?.nnz())
    }

    pub fn nnz_out(&self, o: usize) -> Result<usize> {
        Ok(self.sparsity_out(o)?.nnz())
    }

    pub fn numel_in(&self, i: usize) -> Result<usize> {
        Ok(self.sparsity_in(i)?.numel())
    }

    pub fn numel_out(&self, o: usize) -> Result<usize> {
        Ok(self.sparsity_out(o)?.numel())
    }

    pub fn size1_in(&self, i: usize) -> Result<usize> {
        Ok(self.sparsity_in(i)?.nrow())
    }

    pub fn size2_in(&self, i: usize) -> Result<usize> {
        Ok(self.sparsity_in(i)?.ncol())
    }

    pub fn size1_out(&self, o: usize) -> Result<usize> {
        Ok(self.sparsity_out(o)?.nrow())
    }

    pub fn size2_out(&self, o: usize) -> Result<usize> {
        Ok(self.sparsity_out(o)?.ncol())
    }

    /// Sum of the nonzeros of all inputs.
    pub fn nnz_in_total(&self) -> Result<usize> {
        (0..self.n_in()).map(|i| self.nnz_in(i)).sum()
    }

    /// Sum of the nonzeros of all outputs.
    pub fn nnz_out_total(&self) -> Result<usize> {
        (0..self.n_out()).map(|o| self.nnz_out(o)).sum()
    }

    // ── Schemes ──

    pub fn index_in(&self, name: &str) -> Result<usize> {
        self.require_init()?;
        self.state()
            .input_scheme
            .index(name, &format!("In function {}, input scheme", self.0.name))
    }

    pub fn index_out(&self, name: &str) -> Result<usize> {
        self.require_init()?;
        self.state()
            .output_scheme
            .index(name, &format!("In function {}, output scheme", self.0.name))
    }

    pub fn name_in(&self, i: usize) -> Result<String> {
        self.require_init()?;
        self.check_in(i)?;
        Ok(self.state().input_scheme.name(i).unwrap_or_default().to_string())
    }

    pub fn name_out(&self, o: usize) -> Result<String> {
        self.require_init()?;
        self.check_out(o)?;
        Ok(self.state().output_scheme.name(o).unwrap_or_default().to_string())
    }

    pub fn description_in(&self, i: usize) -> Result<String> {
        self.require_init()?;
        self.check_in(i)?;
        Ok(self
            .state()
            .input_scheme
            .description(i)
            .unwrap_or_default()
            .to_string())
    }

    pub fn description_out(&self, o: usize) -> Result<String> {
        self.require_init()?;
        self.check_out(o)?;
        Ok(self
            .state()
            .output_scheme
            .description(o)
            .unwrap_or_default()
            .to_string())
    }

    /// Names of all inputs, in order.
    pub fn input_names(&self) -> Result<Vec<String>> {
        self.require_init()?;
        Ok(self.state().input_scheme.names())
    }

    /// Names of all outputs, in order.
    pub fn output_names(&self) -> Result<Vec<String>> {
        self.require_init()?;
        Ok(self.state().output_scheme.names())
    }

    // ── Buffers ──

    /// Store input `i`, projected onto its declared pattern.
    pub fn set_input(&self, i: usize, value: &DMatrix) -> Result<()> {
        self.require_init()?;
        self.check_in(i)?;
        let sp = self.sparsity_in(i)?;
        let projected = value.project(&sp).map_err(|_| {
            Error::dimension(
                &self.0.name,
                format!(
                    "input {i} has shape {}x{}, got {}x{}",
                    sp.nrow(),
                    sp.ncol(),
                    value.shape().0,
                    value.shape().1
                ),
            )
        })?;
        self.state_mut().inputs[i] = projected;
        Ok(())
    }

    /// Store the nonzeros of input `i` in its declared pattern.
    pub fn set_input_nonzeros(&self, i: usize, nz: &[f64]) -> Result<()> {
        self.require_init()?;
        self.check_in(i)?;
        let mut st = self.state_mut();
        let target = st.inputs[i].nonzeros_mut();
        if target.len() != nz.len() {
            return Err(Error::dimension(
                &self.0.name,
                format!("input {i} has {} nonzeros, got {}", target.len(), nz.len()),
            ));
        }
        target.copy_from_slice(nz);
        Ok(())
    }

    pub fn set_input_by_name(&self, name: &str, value: &DMatrix) -> Result<()> {
        let i = self.index_in(name)?;
        self.set_input(i, value)
    }

    pub fn input(&self, i: usize) -> Result<DMatrix> {
        self.require_init()?;
        self.check_in(i)?;
        Ok(self.state().inputs[i].clone())
    }

    pub fn output(&self, o: usize) -> Result<DMatrix> {
        self.require_init()?;
        self.check_out(o)?;
        Ok(self.state().outputs[o].clone())
    }

    pub fn output_by_name(&self, name: &str) -> Result<DMatrix> {
        let o = self.index_out(name)?;
        self.output(o)
    }
}
