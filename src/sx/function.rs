//! Instruction tapes compiled from scalar expression graphs.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use super::opcode::{c_expr, partials, OpCode};
use super::{SxElem, SxMatrix, SxNode};
use crate::codegen::{Auxiliary, CodeGenerator};
use crate::element::{Bvec, Element};
use crate::error::{Error, Result};
use crate::function::Function;
use crate::kind::FunctionKind;
use crate::options::Dict;
use crate::seed::{symbolic_adj_seed, symbolic_fwd_seed};
use crate::sparsity::Sparsity;
use crate::work::{Frame, Memory, WorkPlanner};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Instruction {
    Input { dst: usize, input: usize, nz: usize },
    Const { dst: usize, value: f64 },
    Unary { op: OpCode, dst: usize, arg: usize },
    Binary { op: OpCode, dst: usize, lhs: usize, rhs: usize },
    Output { output: usize, nz: usize, src: usize },
}

/// Function kind evaluating scalar expression graphs.
///
/// Each distinct graph node gets one register in the function's persistent
/// floating work; the tape visits them in topological order and writes the
/// outputs last. Inputs must be distinct symbols.
pub struct ScalarFunction {
    inputs: Vec<SxMatrix>,
    outputs: Vec<SxMatrix>,
    instructions: Vec<Instruction>,
    // Node of every register, for symbolic differentiation.
    registers: Vec<SxElem>,
    w_offset: usize,
}

impl ScalarFunction {
    pub fn new(inputs: Vec<SxMatrix>, outputs: Vec<SxMatrix>) -> Result<ScalarFunction> {
        let mut symbols: HashMap<*const SxNode, (usize, usize)> = HashMap::new();
        for (i, m) in inputs.iter().enumerate() {
            for (k, e) in m.nonzeros().iter().enumerate() {
                if !e.is_symbol() {
                    return Err(Error::invalid(
                        "ScalarFunction",
                        format!("nonzero {k} of input {i} is not a symbol: {e}"),
                    ));
                }
                if symbols.insert(e.id(), (i, k)).is_some() {
                    return Err(Error::invalid(
                        "ScalarFunction",
                        format!("symbol {e} appears more than once among the inputs"),
                    ));
                }
            }
        }

        let mut registers: Vec<SxElem> = Vec::new();
        let mut index: HashMap<*const SxNode, usize> = HashMap::new();
        let mut instructions = Vec::new();

        // Iterative post-order DFS; the flag marks a node whose children
        // are already on the tape.
        for out in &outputs {
            for root in out.nonzeros() {
                let mut stack: Vec<(SxElem, bool)> = vec![(root.clone(), false)];
                while let Some((e, expanded)) = stack.pop() {
                    if index.contains_key(&e.id()) {
                        continue;
                    }
                    if !expanded {
                        stack.push((e.clone(), true));
                        match e.node() {
                            SxNode::Unary(_, a) => stack.push((a.clone(), false)),
                            SxNode::Binary(_, a, b) => {
                                stack.push((b.clone(), false));
                                stack.push((a.clone(), false));
                            }
                            SxNode::Const(_) | SxNode::Symbol(_) => {}
                        }
                        continue;
                    }
                    let dst = registers.len();
                    let ins = match e.node() {
                        SxNode::Const(v) => Instruction::Const { dst, value: *v },
                        SxNode::Symbol(name) => match symbols.get(&e.id()) {
                            Some(&(input, nz)) => Instruction::Input { dst, input, nz },
                            None => {
                                return Err(Error::invalid(
                                    "ScalarFunction",
                                    format!("free symbol {name} is not an input"),
                                ))
                            }
                        },
                        SxNode::Unary(op, a) => Instruction::Unary {
                            op: *op,
                            dst,
                            arg: index[&a.id()],
                        },
                        SxNode::Binary(op, a, b) => Instruction::Binary {
                            op: *op,
                            dst,
                            lhs: index[&a.id()],
                            rhs: index[&b.id()],
                        },
                    };
                    index.insert(e.id(), dst);
                    registers.push(e);
                    instructions.push(ins);
                }
            }
        }
        for (o, out) in outputs.iter().enumerate() {
            for (k, e) in out.nonzeros().iter().enumerate() {
                instructions.push(Instruction::Output {
                    output: o,
                    nz: k,
                    src: index[&e.id()],
                });
            }
        }

        Ok(ScalarFunction {
            inputs,
            outputs,
            instructions,
            registers,
            w_offset: 0,
        })
    }

    /// Build and initialize a function named `name`.
    pub fn function(
        name: impl Into<String>,
        inputs: Vec<SxMatrix>,
        outputs: Vec<SxMatrix>,
    ) -> Result<Function> {
        Self::function_with(name, inputs, outputs, &Dict::new())
    }

    pub fn function_with(
        name: impl Into<String>,
        inputs: Vec<SxMatrix>,
        outputs: Vec<SxMatrix>,
        options: &Dict,
    ) -> Result<Function> {
        Function::construct(name, ScalarFunction::new(inputs, outputs)?, options)
    }

    pub fn inputs(&self) -> &[SxMatrix] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SxMatrix] {
        &self.outputs
    }

    /// Number of registers (distinct graph nodes).
    pub fn num_registers(&self) -> usize {
        self.registers.len()
    }

    fn eval_gen<T: Element>(&self, mem: &mut Memory<T>, frame: Frame) {
        let w0 = frame.w(self.w_offset);
        for ins in &self.instructions {
            match *ins {
                Instruction::Input { dst, input, nz } => {
                    let p = mem.arg[frame.arg(input)];
                    mem.w[w0 + dst] = mem.get(p, nz);
                }
                Instruction::Const { dst, value } => mem.w[w0 + dst] = T::constant(value),
                Instruction::Unary { op, dst, arg } => {
                    mem.w[w0 + dst] = T::unary(op, mem.w[w0 + arg]);
                }
                Instruction::Binary { op, dst, lhs, rhs } => {
                    mem.w[w0 + dst] = T::binary(op, mem.w[w0 + lhs], mem.w[w0 + rhs]);
                }
                Instruction::Output { output, nz, src } => {
                    let p = mem.res[frame.res(output)];
                    let v = mem.w[w0 + src];
                    mem.set(p, nz, v);
                }
            }
        }
    }

    /// Symbolic directional derivative: `seed(i, k)` is the seed of nonzero
    /// `k` of input `i`; returns one sensitivity per output nonzero.
    fn forward_sweep<S>(&self, seed: S) -> Vec<Vec<SxElem>>
    where
        S: Fn(usize, usize) -> SxElem,
    {
        let zero = SxElem::constant(0.0);
        let mut dot = vec![zero.clone(); self.registers.len()];
        let mut sens: Vec<Vec<SxElem>> = self
            .outputs
            .iter()
            .map(|m| vec![zero.clone(); m.nnz()])
            .collect();
        for ins in &self.instructions {
            match *ins {
                Instruction::Input { dst, input, nz } => dot[dst] = seed(input, nz),
                Instruction::Const { .. } => {}
                Instruction::Unary { op, dst, arg } => {
                    let (da, _) =
                        partials(op, &self.registers[arg], &zero, &self.registers[dst]);
                    dot[dst] = &da * &dot[arg];
                }
                Instruction::Binary { op, dst, lhs, rhs } => {
                    let (da, db) = partials(
                        op,
                        &self.registers[lhs],
                        &self.registers[rhs],
                        &self.registers[dst],
                    );
                    dot[dst] = &(&da * &dot[lhs]) + &(&db * &dot[rhs]);
                }
                Instruction::Output { output, nz, src } => sens[output][nz] = dot[src].clone(),
            }
        }
        sens
    }

    /// Symbolic adjoint: `seed(o, k)` is the seed of nonzero `k` of output
    /// `o`; returns one sensitivity per input nonzero.
    fn reverse_sweep<S>(&self, seed: S) -> Vec<Vec<SxElem>>
    where
        S: Fn(usize, usize) -> SxElem,
    {
        let zero = SxElem::constant(0.0);
        let mut bar = vec![zero.clone(); self.registers.len()];
        let mut sens: Vec<Vec<SxElem>> = self
            .inputs
            .iter()
            .map(|m| vec![zero.clone(); m.nnz()])
            .collect();
        for ins in self.instructions.iter().rev() {
            match *ins {
                Instruction::Output { output, nz, src } => {
                    bar[src] = &bar[src] + &seed(output, nz);
                }
                Instruction::Unary { op, dst, arg } => {
                    let b = std::mem::replace(&mut bar[dst], zero.clone());
                    if b.is_zero() {
                        continue;
                    }
                    let (da, _) =
                        partials(op, &self.registers[arg], &zero, &self.registers[dst]);
                    bar[arg] = &bar[arg] + &(&da * &b);
                }
                Instruction::Binary { op, dst, lhs, rhs } => {
                    let b = std::mem::replace(&mut bar[dst], zero.clone());
                    if b.is_zero() {
                        continue;
                    }
                    let (da, db) = partials(
                        op,
                        &self.registers[lhs],
                        &self.registers[rhs],
                        &self.registers[dst],
                    );
                    bar[lhs] = &bar[lhs] + &(&da * &b);
                    bar[rhs] = &bar[rhs] + &(&db * &b);
                }
                Instruction::Const { dst, .. } => bar[dst] = zero.clone(),
                Instruction::Input { dst, input, nz } => {
                    let b = std::mem::replace(&mut bar[dst], zero.clone());
                    sens[input][nz] = &sens[input][nz] + &b;
                }
            }
        }
        sens
    }

    fn nominal_symbols(&self) -> Vec<SxMatrix> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(o, m)| SxMatrix::sym(&format!("y{o}"), m.sparsity()))
            .collect()
    }
}

fn matrices(like: &[SxMatrix], values: Vec<Vec<SxElem>>) -> Result<Vec<SxMatrix>> {
    like.iter()
        .zip(values)
        .map(|(m, nz)| SxMatrix::new(m.sparsity().clone(), nz))
        .collect()
}

impl FunctionKind for ScalarFunction {
    fn type_name(&self) -> &'static str {
        "ScalarFunction"
    }

    fn n_in(&self) -> usize {
        self.inputs.len()
    }

    fn n_out(&self) -> usize {
        self.outputs.len()
    }

    fn sparsity_in(&self, i: usize) -> Sparsity {
        self.inputs[i].sparsity().clone()
    }

    fn sparsity_out(&self, o: usize) -> Sparsity {
        self.outputs[o].sparsity().clone()
    }

    fn init(&mut self, _name: &str, planner: &mut WorkPlanner) -> Result<()> {
        self.w_offset = planner.alloc_w(self.registers.len(), true);
        Ok(())
    }

    fn eval(&self, _name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()> {
        self.eval_gen(mem, frame);
        Ok(())
    }

    fn sp_can_evaluate(&self, _fwd: bool) -> bool {
        true
    }

    fn sp_fwd(&self, _name: &str, mem: &mut Memory<Bvec>, frame: Frame) -> Result<()> {
        self.eval_gen(mem, frame);
        Ok(())
    }

    fn sp_adj(&self, _name: &str, mem: &mut Memory<Bvec>, frame: Frame) -> Result<()> {
        let w0 = frame.w(self.w_offset);
        mem.w[w0..w0 + self.registers.len()].fill(0);
        for ins in self.instructions.iter().rev() {
            match *ins {
                Instruction::Output { output, nz, src } => {
                    let p = mem.res[frame.res(output)];
                    if !p.is_null() {
                        let s = mem.get(p, nz);
                        mem.w[w0 + src] |= s;
                        mem.set(p, nz, 0);
                    }
                }
                Instruction::Binary { dst, lhs, rhs, .. } => {
                    let s = std::mem::take(&mut mem.w[w0 + dst]);
                    mem.w[w0 + lhs] |= s;
                    mem.w[w0 + rhs] |= s;
                }
                Instruction::Unary { dst, arg, .. } => {
                    let s = std::mem::take(&mut mem.w[w0 + dst]);
                    mem.w[w0 + arg] |= s;
                }
                Instruction::Const { dst, .. } => mem.w[w0 + dst] = 0,
                Instruction::Input { dst, input, nz } => {
                    let s = std::mem::take(&mut mem.w[w0 + dst]);
                    let p = mem.arg[frame.arg(input)];
                    let v = mem.get(p, nz) | s;
                    mem.set(p, nz, v);
                }
            }
        }
        Ok(())
    }

    fn has_forward(&self) -> bool {
        true
    }

    fn get_forward(&self, f: &Function, nfwd: usize) -> Result<Function> {
        let seeds = symbolic_fwd_seed(nfwd, &self.inputs);
        let mut ins: Vec<SxMatrix> = self.inputs.clone();
        ins.extend(self.nominal_symbols());
        let mut outs = Vec::new();
        for dir in &seeds {
            let sens = self.forward_sweep(|i, k| dir[i].nonzeros()[k].clone());
            outs.extend(matrices(&self.outputs, sens)?);
            ins.extend(dir.iter().cloned());
        }
        Ok(Function::new(
            format!("fwd{nfwd}_{}", f.name()),
            ScalarFunction::new(ins, outs)?,
        ))
    }

    fn has_reverse(&self) -> bool {
        true
    }

    fn get_reverse(&self, f: &Function, nadj: usize) -> Result<Function> {
        let seeds = symbolic_adj_seed(nadj, &self.outputs);
        let mut ins: Vec<SxMatrix> = self.inputs.clone();
        ins.extend(self.nominal_symbols());
        let mut outs = Vec::new();
        for dir in &seeds {
            let sens = self.reverse_sweep(|o, k| dir[o].nonzeros()[k].clone());
            outs.extend(matrices(&self.inputs, sens)?);
            ins.extend(dir.iter().cloned());
        }
        Ok(Function::new(
            format!("adj{nadj}_{}", f.name()),
            ScalarFunction::new(ins, outs)?,
        ))
    }

    fn has_full_jacobian(&self) -> bool {
        true
    }

    /// One symbolic adjoint per output nonzero over the flattened I/O.
    fn get_full_jacobian(&self, f: &Function) -> Result<Function> {
        let offsets: Vec<usize> = self
            .inputs
            .iter()
            .scan(0, |acc, m| {
                let start = *acc;
                *acc += m.nnz();
                Some(start)
            })
            .collect();
        let x: Vec<SxElem> = self
            .inputs
            .iter()
            .flat_map(|m| m.nonzeros().iter().cloned())
            .collect();
        let y: Vec<SxElem> = self
            .outputs
            .iter()
            .flat_map(|m| m.nonzeros().iter().cloned())
            .collect();

        // Column-major order: keyed (col, row).
        let mut entries: BTreeMap<(usize, usize), SxElem> = BTreeMap::new();
        let mut row = 0;
        for (o, out) in self.outputs.iter().enumerate() {
            for k in 0..out.nnz() {
                let sens = self.reverse_sweep(|oo, kk| {
                    SxElem::constant(if oo == o && kk == k { 1.0 } else { 0.0 })
                });
                for (i, s) in sens.into_iter().enumerate() {
                    for (nz, e) in s.into_iter().enumerate() {
                        if !e.is_zero() {
                            entries.insert((offsets[i] + nz, row), e);
                        }
                    }
                }
                row += 1;
            }
        }
        let triplets: Vec<(usize, usize)> = entries.keys().map(|&(c, r)| (r, c)).collect();
        let sp = Sparsity::from_triplets(y.len(), x.len(), &triplets)?;
        let jac = SxMatrix::new(sp, entries.into_values().collect())?;
        Ok(Function::new(
            format!("fulljac_{}", f.name()),
            ScalarFunction::new(vec![SxMatrix::column(x)], vec![jac, SxMatrix::column(y)])?,
        ))
    }

    fn simplified_call(&self) -> bool {
        true
    }

    fn has_codegen(&self) -> bool {
        true
    }

    fn generate_body(&self, _f: &Function, g: &mut CodeGenerator) -> Result<String> {
        let mut body = String::new();
        let reg = |r: usize| format!("w[{}]", self.w_offset + r);
        for ins in &self.instructions {
            let _ = match *ins {
                Instruction::Input { dst, input, nz } => writeln!(
                    body,
                    "  {} = arg[{input}] ? arg[{input}][{nz}] : 0;",
                    reg(dst)
                ),
                Instruction::Const { dst, value } => {
                    writeln!(body, "  {} = {};", reg(dst), CodeGenerator::constant(value))
                }
                Instruction::Unary { op, dst, arg } => {
                    if op == OpCode::Sign {
                        g.add_auxiliary(Auxiliary::Sign);
                    }
                    writeln!(body, "  {} = {};", reg(dst), c_expr(op, &reg(arg), ""))
                }
                Instruction::Binary { op, dst, lhs, rhs } => writeln!(
                    body,
                    "  {} = {};",
                    reg(dst),
                    c_expr(op, &reg(lhs), &reg(rhs))
                ),
                Instruction::Output { output, nz, src } => writeln!(
                    body,
                    "  if (res[{output}]) res[{output}][{nz}] = {};",
                    reg(src)
                ),
            };
        }
        Ok(body)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
