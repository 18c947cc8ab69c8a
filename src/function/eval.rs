//! Numeric evaluation and structural mark propagation.
//!
//! Both walk the same frames: a function at base `b` reads its inputs through
//! `arg[b.arg + i]`, writes outputs through `res[b.res + o]`, and hands its
//! callees the region past its persistent sizes.

use std::time::Instant;

use super::Function;
use crate::element::Bvec;
use crate::error::{Error, Result};
use crate::matrix::DMatrix;
use crate::work::{Frame, Memory, WorkSizes};

impl Function {
    /// Evaluate on the stored inputs and store the outputs.
    pub fn evaluate(&self) -> Result<()> {
        self.ensure_ready()?;
        let (inputs_check, gather_stats) = {
            let st = self.state();
            (st.options.inputs_check, st.options.gather_stats)
        };
        if inputs_check {
            let st = self.state();
            if let Some(i) = st.inputs.iter().position(|m| !m.is_regular()) {
                return Err(Error::RegularityViolation {
                    function: self.0.name.clone(),
                    location: format!("input {i}"),
                });
            }
        }
        if self.monitored("inputs") {
            let st = self.state();
            for (i, m) in st.inputs.iter().enumerate() {
                eprintln!("{}::input {i} = {:?}", self.0.name, m.nonzeros());
            }
        }

        let mut mem = self.take_memory();
        {
            let st = self.state();
            for (buf, m) in mem.input.iter_mut().zip(&st.inputs) {
                buf.copy_from_slice(m.nonzeros());
            }
        }
        mem.bind_root();

        let start = gather_stats.then(Instant::now);
        let result = self.eval_at(&mut mem, WorkSizes::default());
        if result.is_ok() {
            let mut st = self.state_mut();
            for (m, buf) in st.outputs.iter_mut().zip(&mem.output) {
                m.nonzeros_mut().copy_from_slice(buf);
            }
        }
        *self.0.memory.borrow_mut() = Some(mem);
        result?;

        if let Some(start) = start {
            let elapsed = start.elapsed().as_secs_f64();
            self.record(|d| {
                d.increment("n_eval");
                d.accumulate("t_eval", elapsed);
            });
        }
        if self.monitored("eval") {
            eprintln!("{}::evaluated", self.0.name);
        }
        if self.monitored("outputs") {
            let st = self.state();
            for (o, m) in st.outputs.iter().enumerate() {
                eprintln!("{}::output {o} = {:?}", self.0.name, m.nonzeros());
            }
        }
        Ok(())
    }

    /// Evaluate on `args` (projected onto the declared patterns) and return
    /// the outputs.
    pub fn call(&self, args: &[DMatrix]) -> Result<Vec<DMatrix>> {
        self.require_init()?;
        if args.len() != self.n_in() {
            return Err(Error::dimension(
                &self.0.name,
                format!("{} arguments given, expected {}", args.len(), self.n_in()),
            ));
        }
        for (i, a) in args.iter().enumerate() {
            self.set_input(i, a)?;
        }
        self.evaluate()?;
        Ok(self.state().outputs.clone())
    }

    /// Evaluate in caller-provided memory. The input and output buffers of
    /// `mem` are this function's; pointer and work vectors must be at least
    /// [`work_sizes`](Self::work_sizes).
    pub fn eval_with(&self, mem: &mut Memory<f64>) -> Result<()> {
        self.check_memory(mem.sizes(), &mem.input, &mem.output)?;
        mem.bind_root();
        self.eval_at(mem, WorkSizes::default())
    }

    fn check_memory<T>(&self, sizes: WorkSizes, input: &[Vec<T>], output: &[Vec<T>]) -> Result<()> {
        self.ensure_ready()?;
        let required = self.work_sizes()?;
        if !required.fits_in(sizes) {
            return Err(Error::dimension(
                &self.0.name,
                format!("work memory {sizes:?} is smaller than the required {required:?}"),
            ));
        }
        let st = self.state();
        let inputs_ok = input.len() == st.sparsity_in.len()
            && input.iter().zip(&st.sparsity_in).all(|(b, sp)| b.len() == sp.nnz());
        let outputs_ok = output.len() == st.sparsity_out.len()
            && output.iter().zip(&st.sparsity_out).all(|(b, sp)| b.len() == sp.nnz());
        if !(inputs_ok && outputs_ok) {
            return Err(Error::dimension(
                &self.0.name,
                "input or output buffers do not match the declared patterns",
            ));
        }
        Ok(())
    }

    /// A frame at `base` covers `[base, base + work_sizes)`. Callers that
    /// merged this function's plan before it grew fail here.
    fn check_frame(&self, sizes: WorkSizes, base: WorkSizes) -> Result<()> {
        let required = base + self.state().planner.total();
        if required.fits_in(sizes) {
            Ok(())
        } else {
            Err(Error::dimension(
                &self.0.name,
                format!("frame needs {required:?}, memory provides {sizes:?}"),
            ))
        }
    }

    fn take_memory(&self) -> Memory<f64> {
        if self.state().stale {
            self.alloc();
        }
        if let Some(mem) = self.0.memory.borrow_mut().take() {
            return mem;
        }
        // Re-entrant use: a private set of buffers.
        let st = self.state();
        Memory::new(st.planner.total(), &nnz(&st.sparsity_in), &nnz(&st.sparsity_out))
    }

    fn take_sp_memory(&self) -> Memory<Bvec> {
        if self.state().stale {
            self.alloc();
        }
        if let Some(mem) = self.0.sp_memory.borrow_mut().take() {
            return mem;
        }
        let st = self.state();
        Memory::new(st.planner.total(), &nnz(&st.sparsity_in), &nnz(&st.sparsity_out))
    }

    /// Numeric evaluation with this function's frame based at `base`.
    ///
    /// Callers place the input and output pointers at `mem.arg[base.arg..]`
    /// and `mem.res[base.res..]` first.
    pub fn eval_at(&self, mem: &mut Memory<f64>, base: WorkSizes) -> Result<()> {
        self.ensure_ready()?;
        self.check_frame(mem.sizes(), base)?;
        let (persistent, jit, regularity_check) = {
            let st = self.state();
            (st.planner.persistent(), st.jit.clone(), st.options.regularity_check)
        };
        let frame = Frame::new(base, persistent);
        match jit {
            Some(ext) => crate::kind::FunctionKind::eval(ext.as_ref(), &self.0.name, mem, frame)?,
            None => self.0.kind.borrow().eval(&self.0.name, mem, frame)?,
        }
        if regularity_check {
            let st = self.state();
            for (o, sp) in st.sparsity_out.iter().enumerate() {
                let p = mem.res[frame.res(o)];
                if p.is_null() {
                    continue;
                }
                if (0..sp.nnz()).any(|k| !mem.get(p, k).is_finite()) {
                    return Err(Error::RegularityViolation {
                        function: self.0.name.clone(),
                        location: format!("output {o}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Forward mark propagation with the frame based at `base`.
    pub fn sp_fwd_at(&self, mem: &mut Memory<Bvec>, base: WorkSizes) -> Result<()> {
        self.ensure_ready()?;
        self.check_frame(mem.sizes(), base)?;
        let frame = Frame::new(base, self.state().planner.persistent());
        {
            let kind = self.0.kind.borrow();
            if kind.sp_can_evaluate(true) {
                return kind.sp_fwd(&self.0.name, mem, frame);
            }
        }
        self.sp_fwd_via_jac_sparsity(mem, frame)
    }

    /// Reverse mark propagation with the frame based at `base`. Output marks
    /// are OR-ed into the inputs that influence them and then cleared.
    pub fn sp_adj_at(&self, mem: &mut Memory<Bvec>, base: WorkSizes) -> Result<()> {
        self.ensure_ready()?;
        self.check_frame(mem.sizes(), base)?;
        let frame = Frame::new(base, self.state().planner.persistent());
        {
            let kind = self.0.kind.borrow();
            if kind.sp_can_evaluate(false) {
                return kind.sp_adj(&self.0.name, mem, frame);
            }
        }
        self.sp_adj_via_jac_sparsity(mem, frame)
    }

    /// Propagate through the compact Jacobian block patterns.
    fn sp_fwd_via_jac_sparsity(&self, mem: &mut Memory<Bvec>, frame: Frame) -> Result<()> {
        let (n_in, n_out) = (self.n_in(), self.n_out());
        for o in 0..n_out {
            let res = mem.res[frame.res(o)];
            if res.is_null() {
                continue;
            }
            let nnz = self.nnz_out(o)?;
            mem.fill(res, nnz, 0);
            for i in 0..n_in {
                let arg = mem.arg[frame.arg(i)];
                if arg.is_null() {
                    continue;
                }
                let sp = self.jac_sparsity(i, o, true, false)?;
                for (r, c) in sp.iter() {
                    let v = mem.get(res, r) | mem.get(arg, c);
                    mem.set(res, r, v);
                }
            }
        }
        Ok(())
    }

    fn sp_adj_via_jac_sparsity(&self, mem: &mut Memory<Bvec>, frame: Frame) -> Result<()> {
        let (n_in, n_out) = (self.n_in(), self.n_out());
        for o in 0..n_out {
            let res = mem.res[frame.res(o)];
            if res.is_null() {
                continue;
            }
            for i in 0..n_in {
                let arg = mem.arg[frame.arg(i)];
                if arg.is_null() {
                    continue;
                }
                let sp = self.jac_sparsity(i, o, true, false)?;
                for (r, c) in sp.iter() {
                    let v = mem.get(arg, c) | mem.get(res, r);
                    mem.set(arg, c, v);
                }
            }
            let nnz = self.nnz_out(o)?;
            mem.fill(res, nnz, 0);
        }
        Ok(())
    }

    /// Forward-propagate one mark vector per input; returns one per output.
    pub fn sp_fwd(&self, seeds: &[Vec<Bvec>]) -> Result<Vec<Vec<Bvec>>> {
        self.ensure_ready()?;
        let mut mem = self.take_sp_memory();
        let result = self.load_marks(&mut mem, seeds, true).and_then(|()| {
            for buf in mem.output.iter_mut() {
                buf.fill(0);
            }
            mem.bind_root();
            self.sp_fwd_at(&mut mem, WorkSizes::default())
        });
        let marks = mem.output.clone();
        *self.0.sp_memory.borrow_mut() = Some(mem);
        result.map(|()| marks)
    }

    /// Reverse-propagate one mark vector per output; returns one per input.
    pub fn sp_adj(&self, seeds: &[Vec<Bvec>]) -> Result<Vec<Vec<Bvec>>> {
        self.ensure_ready()?;
        let mut mem = self.take_sp_memory();
        let result = self.load_marks(&mut mem, seeds, false).and_then(|()| {
            for buf in mem.input.iter_mut() {
                buf.fill(0);
            }
            mem.bind_root();
            self.sp_adj_at(&mut mem, WorkSizes::default())
        });
        let marks = mem.input.clone();
        *self.0.sp_memory.borrow_mut() = Some(mem);
        result.map(|()| marks)
    }

    fn load_marks(&self, mem: &mut Memory<Bvec>, seeds: &[Vec<Bvec>], fwd: bool) -> Result<()> {
        let target = if fwd { &mut mem.input } else { &mut mem.output };
        if seeds.len() != target.len()
            || seeds.iter().zip(target.iter()).any(|(s, t)| s.len() != t.len())
        {
            let side = if fwd { "input" } else { "output" };
            return Err(Error::dimension(
                &self.0.name,
                format!("{side} marks do not match the declared nonzeros"),
            ));
        }
        for (t, s) in target.iter_mut().zip(seeds) {
            t.copy_from_slice(s);
        }
        Ok(())
    }

    /// One forward sweep seeding only input `iind`; marks of output `oind`.
    pub(crate) fn sweep_fwd(&self, iind: usize, oind: usize, seeds: &[Bvec]) -> Result<Vec<Bvec>> {
        let mut mem = self.take_sp_memory();
        for (i, buf) in mem.input.iter_mut().enumerate() {
            if i == iind {
                buf.copy_from_slice(seeds);
            } else {
                buf.fill(0);
            }
        }
        for buf in mem.output.iter_mut() {
            buf.fill(0);
        }
        mem.bind_root();
        let result = self.sp_fwd_at(&mut mem, WorkSizes::default());
        let marks = mem.output[oind].clone();
        *self.0.sp_memory.borrow_mut() = Some(mem);
        result.map(|()| marks)
    }

    /// One reverse sweep seeding only output `oind`; marks of input `iind`.
    pub(crate) fn sweep_adj(&self, iind: usize, oind: usize, seeds: &[Bvec]) -> Result<Vec<Bvec>> {
        let mut mem = self.take_sp_memory();
        for buf in mem.input.iter_mut() {
            buf.fill(0);
        }
        for (o, buf) in mem.output.iter_mut().enumerate() {
            if o == oind {
                buf.copy_from_slice(seeds);
            } else {
                buf.fill(0);
            }
        }
        mem.bind_root();
        let result = self.sp_adj_at(&mut mem, WorkSizes::default());
        let marks = mem.input[iind].clone();
        *self.0.sp_memory.borrow_mut() = Some(mem);
        result.map(|()| marks)
    }
}

fn nnz(sps: &[crate::sparsity::Sparsity]) -> Vec<usize> {
    sps.iter().map(|sp| sp.nnz()).collect()
}

