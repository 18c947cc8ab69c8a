//! Function kind evaluating an [`Mx`] call graph.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::rc::Rc;

use super::{CallNode, Mx, MxKind, MxNode};
use crate::codegen::{Auxiliary, CodeGenerator};
use crate::element::{Bvec, Element};
use crate::error::{Error, Result};
use crate::function::Function;
use crate::kind::FunctionKind;
use crate::options::Dict;
use crate::seed::{purgable, symbolic_adj_seed, symbolic_fwd_seed};
use crate::sparsity::Sparsity;
use crate::work::{Frame, Memory, Ptr, WorkPlanner};

/// Where a value lives during evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Loc {
    Null,
    Input(usize),
    /// Offset inside the composite's own work block.
    Work(usize),
}

#[derive(Debug)]
enum Step {
    Call {
        f: Function,
        args: Vec<Loc>,
        res: Vec<Loc>,
    },
    Constant {
        dst: usize,
        values: Vec<f64>,
    },
    Sum {
        dst: usize,
        lhs: Loc,
        rhs: Loc,
        nnz: usize,
    },
}

/// Graph item in topological order.
#[derive(Clone, Debug)]
enum Item {
    Node(Mx),
    Call(Rc<CallNode>),
}

/// Function kind made of calls to other functions.
///
/// Intermediate results live in the composite's persistent work block;
/// callees run one after another in the scratch region past it, so the
/// temporary requirement is the largest callee's total.
#[derive(Debug)]
pub struct Composite {
    inputs: Vec<Mx>,
    outputs: Vec<Mx>,
    items: Vec<Item>,
    steps: Vec<Step>,
    output_locs: Vec<Loc>,
    nwork: usize,
    w_offset: usize,
}

impl Composite {
    pub fn new(inputs: Vec<Mx>, outputs: Vec<Mx>) -> Result<Composite> {
        let mut locs: HashMap<*const MxNode, Loc> = HashMap::new();
        for (i, x) in inputs.iter().enumerate() {
            if !x.is_symbol() {
                return Err(Error::invalid(
                    "Composite",
                    format!("input {i} is not a symbol: {x:?}"),
                ));
            }
            if locs.insert(x.id(), Loc::Input(i)).is_some() {
                return Err(Error::invalid(
                    "Composite",
                    format!("symbol {x:?} appears more than once among the inputs"),
                ));
            }
        }

        let items = sort(&outputs);
        let mut calls: HashMap<*const CallNode, Vec<Loc>> = HashMap::new();
        let mut steps = Vec::new();
        let mut nwork = 0;
        let mut bump = |n: usize| {
            let off = nwork;
            nwork += n;
            off
        };
        for item in &items {
            match item {
                Item::Call(call) => {
                    let args = call.args.iter().map(|a| locs[&a.id()]).collect();
                    let mut res = Vec::with_capacity(call.f.n_out());
                    for o in 0..call.f.n_out() {
                        res.push(Loc::Work(bump(call.f.nnz_out(o)?)));
                    }
                    calls.insert(Rc::as_ptr(call), res.clone());
                    steps.push(Step::Call {
                        f: call.f.clone(),
                        args,
                        res,
                    });
                }
                Item::Node(x) => {
                    if locs.contains_key(&x.id()) {
                        continue;
                    }
                    let loc = match x.kind() {
                        MxKind::Symbol(name) => {
                            return Err(Error::invalid(
                                "Composite",
                                format!("free symbol {name} is not an input"),
                            ))
                        }
                        MxKind::Zero => Loc::Null,
                        MxKind::Constant(values) => {
                            let dst = bump(values.len());
                            steps.push(Step::Constant {
                                dst,
                                values: values.clone(),
                            });
                            Loc::Work(dst)
                        }
                        MxKind::Sum(a, b) => {
                            let nnz = x.sparsity().nnz();
                            let dst = bump(nnz);
                            steps.push(Step::Sum {
                                dst,
                                lhs: locs[&a.id()],
                                rhs: locs[&b.id()],
                                nnz,
                            });
                            Loc::Work(dst)
                        }
                        MxKind::Output { call, index } => calls[&Rc::as_ptr(call)][*index],
                    };
                    locs.insert(x.id(), loc);
                }
            }
        }
        let output_locs = outputs.iter().map(|y| locs[&y.id()]).collect();

        Ok(Composite {
            inputs,
            outputs,
            items,
            steps,
            output_locs,
            nwork,
            w_offset: 0,
        })
    }

    /// Build and initialize a function named `name`.
    pub fn function(name: impl Into<String>, inputs: Vec<Mx>, outputs: Vec<Mx>) -> Result<Function> {
        Self::function_with(name, inputs, outputs, &Dict::new())
    }

    pub fn function_with(
        name: impl Into<String>,
        inputs: Vec<Mx>,
        outputs: Vec<Mx>,
        options: &Dict,
    ) -> Result<Function> {
        Function::construct(name, Composite::new(inputs, outputs)?, options)
    }

    /// Number of call steps.
    pub fn num_calls(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Call { .. }))
            .count()
    }

    fn ptr<T>(&self, loc: Loc, mem: &Memory<T>, frame: Frame) -> Ptr {
        match loc {
            Loc::Null => Ptr::Null,
            Loc::Input(i) => mem.arg[frame.arg(i)],
            Loc::Work(off) => Ptr::Work(frame.w(self.w_offset + off)),
        }
    }

    /// Point the callee's slots (at the scratch base) at its operands.
    fn bind_call<T>(&self, args: &[Loc], res: &[Loc], mem: &mut Memory<T>, frame: Frame) {
        for (k, &loc) in args.iter().enumerate() {
            let p = self.ptr(loc, mem, frame);
            mem.arg[frame.scratch.arg + k] = p;
        }
        for (k, &loc) in res.iter().enumerate() {
            let p = self.ptr(loc, mem, frame);
            mem.res[frame.scratch.res + k] = p;
        }
    }

    fn eval_gen<T: Element>(&self, mem: &mut Memory<T>, frame: Frame) -> Result<()> {
        let w0 = frame.w(self.w_offset);
        for step in &self.steps {
            match step {
                Step::Constant { dst, values } => {
                    for (k, &v) in values.iter().enumerate() {
                        mem.w[w0 + dst + k] = T::constant(v);
                    }
                }
                Step::Sum { dst, lhs, rhs, nnz } => {
                    let a = self.ptr(*lhs, mem, frame);
                    let b = self.ptr(*rhs, mem, frame);
                    for k in 0..*nnz {
                        let v = mem.get(a, k).accumulate(mem.get(b, k));
                        mem.w[w0 + dst + k] = v;
                    }
                }
                Step::Call { f, args, res } => {
                    self.bind_call(args, res, mem, frame);
                    T::dispatch(f, mem, frame.scratch)?;
                }
            }
        }
        for (o, (&loc, y)) in self.output_locs.iter().zip(&self.outputs).enumerate() {
            let dst = mem.res[frame.res(o)];
            let src = self.ptr(loc, mem, frame);
            mem.copy(src, dst, y.sparsity().nnz());
        }
        Ok(())
    }

    /// Forward-mode derivative graph over the same inputs plus nominal
    /// outputs and `nfwd` seed sets.
    fn forward_graph(&self, nfwd: usize) -> Result<(Vec<Mx>, Vec<Mx>)> {
        let seeds = symbolic_fwd_seed(nfwd, &self.inputs);
        let mut dots: HashMap<*const MxNode, Vec<Mx>> = HashMap::new();
        let mut call_dots: HashMap<*const CallNode, Vec<Vec<Mx>>> = HashMap::new();
        for (i, x) in self.inputs.iter().enumerate() {
            dots.insert(x.id(), seeds.iter().map(|dir| dir[i].clone()).collect());
        }
        for item in &self.items {
            match item {
                Item::Call(call) => {
                    let f = &call.f;
                    let mut result: Vec<Vec<Mx>> = (0..nfwd)
                        .map(|_| {
                            (0..f.n_out())
                                .map(|o| Ok(Mx::zeros(&f.sparsity_out(o)?)))
                                .collect::<Result<Vec<_>>>()
                        })
                        .collect::<Result<_>>()?;
                    let arg_dots = |d: usize| -> Vec<Mx> {
                        call.args.iter().map(|a| dots[&a.id()][d].clone()).collect()
                    };
                    let active: Vec<usize> =
                        (0..nfwd).filter(|&d| !purgable(&arg_dots(d))).collect();
                    if !active.is_empty() {
                        let deriv = f.forward(active.len())?;
                        let mut args = call.args.clone();
                        args.extend(call_outputs(call)?);
                        for &d in &active {
                            args.extend(arg_dots(d));
                        }
                        let sens = Mx::call(&deriv, &args)?;
                        for (j, &d) in active.iter().enumerate() {
                            result[d] = sens[j * f.n_out()..(j + 1) * f.n_out()].to_vec();
                        }
                    }
                    call_dots.insert(Rc::as_ptr(call), result);
                }
                Item::Node(x) => {
                    if dots.contains_key(&x.id()) {
                        continue;
                    }
                    let dot = match x.kind() {
                        MxKind::Symbol(_) | MxKind::Zero | MxKind::Constant(_) => {
                            vec![Mx::zeros(x.sparsity()); nfwd]
                        }
                        MxKind::Sum(a, b) => (0..nfwd)
                            .map(|d| dots[&a.id()][d].add(&dots[&b.id()][d]))
                            .collect::<Result<_>>()?,
                        MxKind::Output { call, index } => call_dots[&Rc::as_ptr(call)]
                            .iter()
                            .map(|dir| dir[*index].clone())
                            .collect(),
                    };
                    dots.insert(x.id(), dot);
                }
            }
        }

        let mut ins = self.inputs.clone();
        ins.extend(nominal_symbols(&self.outputs));
        let mut outs = Vec::new();
        for (d, dir) in seeds.into_iter().enumerate() {
            ins.extend(dir);
            outs.extend(self.outputs.iter().map(|y| dots[&y.id()][d].clone()));
        }
        Ok((ins, outs))
    }

    /// Reverse-mode derivative graph.
    fn reverse_graph(&self, nadj: usize) -> Result<(Vec<Mx>, Vec<Mx>)> {
        let seeds = symbolic_adj_seed(nadj, &self.outputs);
        let mut bars: HashMap<*const MxNode, Vec<Mx>> = HashMap::new();
        let mut call_bars: HashMap<*const CallNode, Vec<Vec<Option<Mx>>>> = HashMap::new();

        fn accumulate(
            bars: &mut HashMap<*const MxNode, Vec<Mx>>,
            x: &Mx,
            d: usize,
            nadj: usize,
            value: Mx,
        ) -> Result<()> {
            let entry = bars
                .entry(x.id())
                .or_insert_with(|| vec![Mx::zeros(x.sparsity()); nadj]);
            entry[d] = entry[d].add(&value)?;
            Ok(())
        }

        for (o, y) in self.outputs.iter().enumerate() {
            for (d, dir) in seeds.iter().enumerate() {
                accumulate(&mut bars, y, d, nadj, dir[o].clone())?;
            }
        }
        let mut done: HashSet<*const MxNode> = HashSet::new();
        for item in self.items.iter().rev() {
            match item {
                Item::Node(x) => {
                    if !done.insert(x.id()) {
                        continue;
                    }
                    let Some(bar) = bars.get(&x.id()).cloned() else {
                        continue;
                    };
                    match x.kind() {
                        MxKind::Sum(a, b) => {
                            for (d, v) in bar.into_iter().enumerate() {
                                accumulate(&mut bars, a, d, nadj, v.clone())?;
                                accumulate(&mut bars, b, d, nadj, v)?;
                            }
                        }
                        MxKind::Output { call, index } => {
                            let n_out = call.f.n_out();
                            let slots = call_bars
                                .entry(Rc::as_ptr(call))
                                .or_insert_with(|| vec![vec![None; n_out]; nadj]);
                            for (d, v) in bar.into_iter().enumerate() {
                                let merged = match slots[d][*index].take() {
                                    Some(prev) => prev.add(&v)?,
                                    None => v,
                                };
                                slots[d][*index] = Some(merged);
                            }
                        }
                        MxKind::Symbol(_) | MxKind::Zero | MxKind::Constant(_) => {}
                    }
                }
                Item::Call(call) => {
                    let f = &call.f;
                    let Some(slots) = call_bars.remove(&Rc::as_ptr(call)) else {
                        continue;
                    };
                    let mut out_seeds: Vec<Vec<Mx>> = Vec::with_capacity(nadj);
                    for dir in slots {
                        let mut seeds_d = Vec::with_capacity(f.n_out());
                        for (o, s) in dir.into_iter().enumerate() {
                            seeds_d.push(match s {
                                Some(v) => v,
                                None => Mx::zeros(&f.sparsity_out(o)?),
                            });
                        }
                        out_seeds.push(seeds_d);
                    }
                    let active: Vec<usize> =
                        (0..nadj).filter(|&d| !purgable(&out_seeds[d])).collect();
                    if active.is_empty() {
                        continue;
                    }
                    let deriv = f.reverse(active.len())?;
                    let mut args = call.args.clone();
                    args.extend(call_outputs(call)?);
                    for &d in &active {
                        args.extend(out_seeds[d].iter().cloned());
                    }
                    let sens = Mx::call(&deriv, &args)?;
                    for (j, &d) in active.iter().enumerate() {
                        for (k, a) in call.args.iter().enumerate() {
                            accumulate(&mut bars, a, d, nadj, sens[j * f.n_in() + k].clone())?;
                        }
                    }
                }
            }
        }

        let mut ins = self.inputs.clone();
        ins.extend(nominal_symbols(&self.outputs));
        let mut outs = Vec::new();
        for (d, dir) in seeds.into_iter().enumerate() {
            ins.extend(dir);
            for x in &self.inputs {
                outs.push(match bars.get(&x.id()) {
                    Some(bar) => bar[d].clone(),
                    None => Mx::zeros(x.sparsity()),
                });
            }
        }
        Ok((ins, outs))
    }

    fn c_ptr(&self, loc: Loc) -> String {
        match loc {
            Loc::Null => "0".to_string(),
            Loc::Input(i) => format!("arg[{i}]"),
            Loc::Work(off) => format!("w+{}", self.w_offset + off),
        }
    }

    fn c_value(&self, loc: Loc, k: usize) -> String {
        match loc {
            Loc::Null => "0".to_string(),
            Loc::Input(i) => format!("(arg[{i}] ? arg[{i}][{k}] : 0)"),
            Loc::Work(off) => format!("w[{}]", self.w_offset + off + k),
        }
    }
}

/// Every output of `call`, as fresh nodes sharing the call.
fn call_outputs(call: &Rc<CallNode>) -> Result<Vec<Mx>> {
    (0..call.f.n_out())
        .map(|o| Ok(Mx::output_of(call, o, call.f.sparsity_out(o)?)))
        .collect()
}

fn nominal_symbols(outputs: &[Mx]) -> Vec<Mx> {
    outputs
        .iter()
        .enumerate()
        .map(|(o, y)| Mx::sym(&format!("y{o}"), y.sparsity()))
        .collect()
}

/// Topological order (children first) of everything `outputs` depend on.
fn sort(outputs: &[Mx]) -> Vec<Item> {
    let mut order = Vec::new();
    let mut seen_nodes: HashSet<*const MxNode> = HashSet::new();
    let mut seen_calls: HashSet<*const CallNode> = HashSet::new();
    for root in outputs {
        let mut stack: Vec<(Item, bool)> = vec![(Item::Node(root.clone()), false)];
        while let Some((item, expanded)) = stack.pop() {
            let fresh = match &item {
                Item::Node(x) => !seen_nodes.contains(&x.id()),
                Item::Call(c) => !seen_calls.contains(&Rc::as_ptr(c)),
            };
            if !fresh {
                continue;
            }
            if expanded {
                match &item {
                    Item::Node(x) => seen_nodes.insert(x.id()),
                    Item::Call(c) => seen_calls.insert(Rc::as_ptr(c)),
                };
                order.push(item);
                continue;
            }
            stack.push((item.clone(), true));
            match &item {
                Item::Node(x) => match x.kind() {
                    MxKind::Sum(a, b) => {
                        stack.push((Item::Node(b.clone()), false));
                        stack.push((Item::Node(a.clone()), false));
                    }
                    MxKind::Output { call, .. } => stack.push((Item::Call(Rc::clone(call)), false)),
                    MxKind::Symbol(_) | MxKind::Zero | MxKind::Constant(_) => {}
                },
                Item::Call(c) => {
                    for a in c.args.iter().rev() {
                        stack.push((Item::Node(a.clone()), false));
                    }
                }
            }
        }
    }
    order
}

impl FunctionKind for Composite {
    fn type_name(&self) -> &'static str {
        "Composite"
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
        self.w_offset = planner.alloc_w(self.nwork, true);
        for step in &self.steps {
            if let Step::Call { f, .. } = step {
                f.init()?;
                planner.alloc_function(f, false)?;
            }
        }
        Ok(())
    }

    fn dependencies(&self) -> Vec<Function> {
        let mut deps: Vec<Function> = Vec::new();
        for step in &self.steps {
            if let Step::Call { f, .. } = step {
                if !deps.contains(f) {
                    deps.push(f.clone());
                }
            }
        }
        deps
    }

    fn eval(&self, _name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()> {
        self.eval_gen(mem, frame)
    }

    fn sp_can_evaluate(&self, _fwd: bool) -> bool {
        true
    }

    fn sp_fwd(&self, _name: &str, mem: &mut Memory<Bvec>, frame: Frame) -> Result<()> {
        self.eval_gen(mem, frame)
    }

    fn sp_adj(&self, _name: &str, mem: &mut Memory<Bvec>, frame: Frame) -> Result<()> {
        let w0 = frame.w(self.w_offset);
        mem.w[w0..w0 + self.nwork].fill(0);
        for (o, (&loc, y)) in self.output_locs.iter().zip(&self.outputs).enumerate() {
            let dst = mem.res[frame.res(o)];
            if dst.is_null() {
                continue;
            }
            let src = self.ptr(loc, mem, frame);
            let nnz = y.sparsity().nnz();
            for k in 0..nnz {
                let v = mem.get(src, k) | mem.get(dst, k);
                mem.set(src, k, v);
            }
            mem.fill(dst, nnz, 0);
        }
        for step in self.steps.iter().rev() {
            match step {
                Step::Constant { dst, values } => mem.w[w0 + dst..w0 + dst + values.len()].fill(0),
                Step::Sum { dst, lhs, rhs, nnz } => {
                    let a = self.ptr(*lhs, mem, frame);
                    let b = self.ptr(*rhs, mem, frame);
                    for k in 0..*nnz {
                        let s = std::mem::take(&mut mem.w[w0 + dst + k]);
                        let va = mem.get(a, k) | s;
                        mem.set(a, k, va);
                        let vb = mem.get(b, k) | s;
                        mem.set(b, k, vb);
                    }
                }
                Step::Call { f, args, res } => {
                    self.bind_call(args, res, mem, frame);
                    f.sp_adj_at(mem, frame.scratch)?;
                }
            }
        }
        Ok(())
    }

    fn has_forward(&self) -> bool {
        true
    }

    fn get_forward(&self, f: &Function, nfwd: usize) -> Result<Function> {
        let (ins, outs) = self.forward_graph(nfwd)?;
        Ok(Function::new(
            format!("fwd{nfwd}_{}", f.name()),
            Composite::new(ins, outs)?,
        ))
    }

    fn has_reverse(&self) -> bool {
        true
    }

    fn get_reverse(&self, f: &Function, nadj: usize) -> Result<Function> {
        let (ins, outs) = self.reverse_graph(nadj)?;
        Ok(Function::new(
            format!("adj{nadj}_{}", f.name()),
            Composite::new(ins, outs)?,
        ))
    }

    fn has_codegen(&self) -> bool {
        true
    }

    fn generate_body(&self, f: &Function, g: &mut CodeGenerator) -> Result<String> {
        let per = f.persistent_sizes()?;
        let mut body = String::new();
        let _ = writeln!(body, "  const double** arg1 = arg + {};", per.arg);
        let _ = writeln!(body, "  double** res1 = res + {};", per.res);
        let _ = writeln!(body, "  int* iw1 = iw + {};", per.iw);
        let _ = writeln!(body, "  double* w1 = w + {};", per.w);
        for step in &self.steps {
            match step {
                Step::Constant { dst, values } => {
                    for (k, &v) in values.iter().enumerate() {
                        let _ = writeln!(
                            body,
                            "  w[{}] = {};",
                            self.w_offset + dst + k,
                            CodeGenerator::constant(v)
                        );
                    }
                }
                Step::Sum { dst, lhs, rhs, nnz } => {
                    for k in 0..*nnz {
                        let _ = writeln!(
                            body,
                            "  w[{}] = {} + {};",
                            self.w_offset + dst + k,
                            self.c_value(*lhs, k),
                            self.c_value(*rhs, k)
                        );
                    }
                }
                Step::Call { f: callee, args, res } => {
                    for (k, &loc) in args.iter().enumerate() {
                        let _ = writeln!(body, "  arg1[{k}] = {};", self.c_ptr(loc));
                    }
                    for (k, &loc) in res.iter().enumerate() {
                        let _ = writeln!(body, "  res1[{k}] = {};", self.c_ptr(loc));
                    }
                    body.push_str(&callee.generate_call(g, "arg1", "res1", "iw1", "w1")?);
                }
            }
        }
        if !self.outputs.is_empty() {
            g.add_auxiliary(Auxiliary::Copy);
        }
        for (o, (&loc, y)) in self.output_locs.iter().zip(&self.outputs).enumerate() {
            let _ = writeln!(
                body,
                "  cg_copy({}, {}, res[{o}]);",
                self.c_ptr(loc),
                y.sparsity().nnz()
            );
        }
        Ok(body)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
