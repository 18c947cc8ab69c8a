//! Jacobian functions built from directional derivatives.
//!
//! [`NumericJacobian`] evaluates one Jacobian block by seeding colored groups
//! of nonzeros through `forward(n)` or `reverse(n)` and recovering the
//! entries from the compressed sensitivities. [`BlockJacobian`] assembles the
//! Jacobian of all output nonzeros with respect to all input nonzeros from
//! the per-block Jacobian functions. [`JacobianProduct`] goes the other way
//! and turns Jacobian blocks into directional derivatives.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Write;

use crate::codegen::{Auxiliary, CodeGenerator};
use crate::error::{Error, Result};
use crate::function::Function;
use crate::kind::FunctionKind;
use crate::sparsity::{column_coloring, row_coloring, star_coloring, Sparsity};
use crate::work::{Frame, Memory, Ptr, WorkPlanner};

fn offsets(sps: &[Sparsity]) -> (Vec<usize>, usize) {
    let mut offs = Vec::with_capacity(sps.len());
    let mut total = 0;
    for sp in sps {
        offs.push(total);
        total += sp.nnz();
    }
    (offs, total)
}

fn io_sparsities(f: &Function) -> Result<(Vec<Sparsity>, Vec<Sparsity>)> {
    let sp_in = (0..f.n_in())
        .map(|i| f.sparsity_in(i))
        .collect::<Result<Vec<_>>>()?;
    let sp_out = (0..f.n_out())
        .map(|o| f.sparsity_out(o))
        .collect::<Result<Vec<_>>>()?;
    Ok((sp_in, sp_out))
}

fn c_offset(base: &str, off: usize) -> String {
    if off == 0 {
        base.to_string()
    } else {
        format!("({base} ? {base}+{off} : 0)")
    }
}

fn c_frame(f: &Function) -> Result<String> {
    let per = f.persistent_sizes()?;
    Ok(format!(
        "  const double** arg1 = arg + {};\n  double** res1 = res + {};\n  int* iw1 = iw + {};\n  double* w1 = w + {};\n",
        per.arg, per.res, per.iw, per.w
    ))
}

// ── Colored block Jacobian ──

/// One Jacobian block by compressed directional derivatives.
///
/// Outputs are `[jac, f outputs..]`. The block pattern comes from
/// [`Function::jac_sparsity`]; columns (forward) or rows (reverse) are
/// colored so that each color is one seed direction, and at most
/// `max_num_dir` directions are evaluated per derivative call.
pub struct NumericJacobian {
    f: Function,
    iind: usize,
    oind: usize,
    sp_in: Vec<Sparsity>,
    sp_out: Vec<Sparsity>,
    out_off: Vec<usize>,
    nnz_out_total: usize,
    out_sp: Sparsity,
    forward: bool,
    colors: Vec<usize>,
    ncolors: usize,
    ndir: usize,
    // Per nonzero of the block: (color, index into that color's sensitivity).
    recovery: Vec<(usize, usize)>,
    deriv: Option<Function>,
    y_off: usize,
    seed_off: usize,
    sens_off: usize,
}

impl NumericJacobian {
    pub fn new(
        f: &Function,
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
    ) -> Result<NumericJacobian> {
        if !f.has_forward() && !f.has_reverse() {
            return Err(Error::unsupported(f.name(), "jacobian"));
        }
        let (sp_in, sp_out) = io_sparsities(f)?;
        let (out_off, nnz_out_total) = offsets(&sp_out);
        let jac_sp = f.jac_sparsity(iind, oind, true, symmetric)?;
        let out_sp = if compact {
            jac_sp.clone()
        } else {
            f.jac_sparsity(iind, oind, false, symmetric)?
        };

        let w = f.ad_weight();
        let (forward, colors, ncolors) = if symmetric {
            let (colors, n) = star_coloring(&jac_sp);
            (w <= 0.5, colors, n)
        } else {
            let (fc, nf) = column_coloring(&jac_sp);
            let (rc, nr) = row_coloring(&jac_sp);
            if w * nf as f64 <= (1.0 - w) * nr as f64 {
                (true, fc, nf)
            } else {
                (false, rc, nr)
            }
        };

        let recovery = if symmetric {
            // Entry (r, c) is read directly when c is alone in its color
            // among row r, else from its mirror (c, r).
            let mut count: HashMap<(usize, usize), usize> = HashMap::new();
            for (r, c) in jac_sp.iter() {
                *count.entry((r, colors[c])).or_default() += 1;
            }
            jac_sp
                .iter()
                .map(|(r, c)| {
                    if count.get(&(r, colors[c])) == Some(&1) {
                        (colors[c], r)
                    } else {
                        (colors[r], c)
                    }
                })
                .collect()
        } else if forward {
            jac_sp.iter().map(|(r, c)| (colors[c], r)).collect()
        } else {
            jac_sp.iter().map(|(r, c)| (colors[r], c)).collect()
        };

        let ndir = ncolors.min(f.options().max_num_dir);
        f.log(format_args!(
            "jacobian block ({oind}, {iind}): {ncolors} colors, {} mode",
            if forward { "forward" } else { "reverse" }
        ));
        Ok(NumericJacobian {
            f: f.clone(),
            iind,
            oind,
            sp_in,
            sp_out,
            out_off,
            nnz_out_total,
            out_sp,
            forward,
            colors,
            ncolors,
            ndir,
            recovery,
            deriv: None,
            y_off: 0,
            seed_off: 0,
            sens_off: 0,
        })
    }

    /// Number of seed directions the block compresses to.
    pub fn num_colors(&self) -> usize {
        self.ncolors
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    fn nseed(&self) -> usize {
        self.colors.len()
    }

    fn nsens(&self) -> usize {
        if self.forward {
            self.sp_out[self.oind].nnz()
        } else {
            self.sp_in[self.iind].nnz()
        }
    }

    fn nbatch(&self) -> usize {
        if self.ndir == 0 {
            0
        } else {
            self.ncolors.div_ceil(self.ndir)
        }
    }

    /// `(seeded io count, seeded index, sensitivity io count, sensitivity index)`.
    fn layout(&self) -> (usize, usize, usize, usize) {
        let (n_in, n_out) = (self.sp_in.len(), self.sp_out.len());
        if self.forward {
            (n_in, self.iind, n_out, self.oind)
        } else {
            (n_out, self.oind, n_in, self.iind)
        }
    }

    fn bind_nominal(&self, mem: &mut Memory<f64>, frame: Frame) {
        let s = frame.scratch;
        for i in 0..self.sp_in.len() {
            let p = mem.arg[frame.arg(i)];
            mem.arg[s.arg + i] = p;
        }
        for o in 0..self.sp_out.len() {
            mem.res[s.res + o] = Ptr::Work(frame.w(self.y_off + self.out_off[o]));
        }
    }

    fn bind_derivative(&self, mem: &mut Memory<f64>, frame: Frame) {
        let s = frame.scratch;
        let (n_in, n_out) = (self.sp_in.len(), self.sp_out.len());
        let (nseed_io, seeded, nsens_io, target) = self.layout();
        for i in 0..n_in {
            let p = mem.arg[frame.arg(i)];
            mem.arg[s.arg + i] = p;
        }
        for o in 0..n_out {
            mem.arg[s.arg + n_in + o] = Ptr::Work(frame.w(self.y_off + self.out_off[o]));
        }
        let mut slot = s.arg + n_in + n_out;
        for d in 0..self.ndir {
            for j in 0..nseed_io {
                mem.arg[slot] = if j == seeded {
                    Ptr::Work(frame.w(self.seed_off + d * self.nseed()))
                } else {
                    Ptr::Null
                };
                slot += 1;
            }
        }
        let mut slot = s.res;
        for d in 0..self.ndir {
            for j in 0..nsens_io {
                mem.res[slot] = if j == target {
                    Ptr::Work(frame.w(self.sens_off + d * self.nsens()))
                } else {
                    Ptr::Null
                };
                slot += 1;
            }
        }
    }
}

impl FunctionKind for NumericJacobian {
    fn type_name(&self) -> &'static str {
        "NumericJacobian"
    }

    fn n_in(&self) -> usize {
        self.sp_in.len()
    }

    fn n_out(&self) -> usize {
        self.sp_out.len() + 1
    }

    fn sparsity_in(&self, i: usize) -> Sparsity {
        self.sp_in[i].clone()
    }

    fn sparsity_out(&self, o: usize) -> Sparsity {
        if o == 0 {
            self.out_sp.clone()
        } else {
            self.sp_out[o - 1].clone()
        }
    }

    fn init(&mut self, _name: &str, planner: &mut WorkPlanner) -> Result<()> {
        self.f.init()?;
        self.y_off = planner.alloc_w(self.nnz_out_total, true);
        if self.ndir > 0 {
            let deriv = if self.forward {
                self.f.forward(self.ndir)?
            } else {
                self.f.reverse(self.ndir)?
            };
            self.seed_off = planner.alloc_w(self.ndir * self.nseed(), true);
            self.sens_off = planner.alloc_w(self.ndir * self.nsens(), true);
            planner.alloc_function(&deriv, false)?;
            self.deriv = Some(deriv);
        }
        planner.alloc_function(&self.f, false)?;
        Ok(())
    }

    fn dependencies(&self) -> Vec<Function> {
        let mut deps = vec![self.f.clone()];
        deps.extend(self.deriv.iter().cloned());
        deps
    }

    fn eval(&self, _name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()> {
        self.bind_nominal(mem, frame);
        self.f.eval_at(mem, frame.scratch)?;
        for (o, sp) in self.sp_out.iter().enumerate() {
            let dst = mem.res[frame.res(1 + o)];
            mem.copy(Ptr::Work(frame.w(self.y_off + self.out_off[o])), dst, sp.nnz());
        }

        let jac = mem.res[frame.res(0)];
        if jac.is_null() {
            return Ok(());
        }
        let Some(deriv) = &self.deriv else {
            mem.fill(jac, self.out_sp.nnz(), 0.0);
            return Ok(());
        };
        let (nseed, nsens) = (self.nseed(), self.nsens());
        let seeds = frame.w(self.seed_off);
        let sens = frame.w(self.sens_off);
        for batch in 0..self.nbatch() {
            let first = batch * self.ndir;
            let active = first..first + self.ndir;
            mem.w[seeds..seeds + self.ndir * nseed].fill(0.0);
            for (k, &c) in self.colors.iter().enumerate() {
                if active.contains(&c) {
                    mem.w[seeds + (c - first) * nseed + k] = 1.0;
                }
            }
            self.bind_derivative(mem, frame);
            deriv.eval_at(mem, frame.scratch)?;
            for (k, &(c, idx)) in self.recovery.iter().enumerate() {
                if active.contains(&c) {
                    let v = mem.w[sens + (c - first) * nsens + idx];
                    mem.set(jac, k, v);
                }
            }
        }
        Ok(())
    }

    fn has_codegen(&self) -> bool {
        self.f.has_codegen() && self.deriv.as_ref().map_or(true, Function::has_codegen)
    }

    fn generate_body(&self, f: &Function, g: &mut CodeGenerator) -> Result<String> {
        let (n_in, n_out) = (self.sp_in.len(), self.sp_out.len());
        let mut body = c_frame(f)?;
        for i in 0..n_in {
            let _ = writeln!(body, "  arg1[{i}] = arg[{i}];");
        }
        for o in 0..n_out {
            let _ = writeln!(body, "  res1[{o}] = w+{};", self.y_off + self.out_off[o]);
        }
        body.push_str(&self.f.generate_call(g, "arg1", "res1", "iw1", "w1")?);
        g.add_auxiliary(Auxiliary::Copy);
        for (o, sp) in self.sp_out.iter().enumerate() {
            let _ = writeln!(
                body,
                "  cg_copy(w+{}, {}, res[{}]);",
                self.y_off + self.out_off[o],
                sp.nnz(),
                1 + o
            );
        }
        let Some(deriv) = &self.deriv else {
            g.add_auxiliary(Auxiliary::Fill);
            let _ = writeln!(body, "  cg_fill(res[0], {}, 0);", self.out_sp.nnz());
            return Ok(body);
        };

        g.add_auxiliary(Auxiliary::Fill);
        let (nseed, nsens) = (self.nseed(), self.nsens());
        let (nseed_io, seeded, nsens_io, target) = self.layout();
        body.push_str("  if (res[0]) {\n");
        for batch in 0..self.nbatch() {
            let first = batch * self.ndir;
            let active = first..first + self.ndir;
            let _ = writeln!(body, "    cg_fill(w+{}, {}, 0);", self.seed_off, self.ndir * nseed);
            for (k, &c) in self.colors.iter().enumerate() {
                if active.contains(&c) {
                    let _ = writeln!(body, "    w[{}] = 1;", self.seed_off + (c - first) * nseed + k);
                }
            }
            let mut slot = n_in + n_out;
            for d in 0..self.ndir {
                for j in 0..nseed_io {
                    let target_ptr = if j == seeded {
                        format!("w+{}", self.seed_off + d * nseed)
                    } else {
                        "0".to_string()
                    };
                    let _ = writeln!(body, "    arg1[{slot}] = {target_ptr};");
                    slot += 1;
                }
            }
            for i in 0..n_in {
                let _ = writeln!(body, "    arg1[{i}] = arg[{i}];");
            }
            for o in 0..n_out {
                let _ = writeln!(
                    body,
                    "    arg1[{}] = w+{};",
                    n_in + o,
                    self.y_off + self.out_off[o]
                );
            }
            let mut slot = 0;
            for d in 0..self.ndir {
                for j in 0..nsens_io {
                    let target_ptr = if j == target {
                        format!("w+{}", self.sens_off + d * nsens)
                    } else {
                        "0".to_string()
                    };
                    let _ = writeln!(body, "    res1[{slot}] = {target_ptr};");
                    slot += 1;
                }
            }
            let call = deriv.generate_call(g, "arg1", "res1", "iw1", "w1")?;
            let _ = write!(body, "  {call}");
            for (k, &(c, idx)) in self.recovery.iter().enumerate() {
                if active.contains(&c) {
                    let _ = writeln!(
                        body,
                        "    res[0][{k}] = w[{}];",
                        self.sens_off + (c - first) * nsens + idx
                    );
                }
            }
        }
        body.push_str("  }\n");
        Ok(body)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Full Jacobian from blocks ──

struct Block {
    iind: usize,
    oind: usize,
    jac: Option<Function>,
    // Block nonzero k lands on nonzero `map[k]` of the full Jacobian.
    map: Vec<usize>,
}

/// Jacobian of every output nonzero with respect to every input nonzero.
///
/// One input `x` holding all input nonzeros; outputs `jac` and `f` holding
/// all output nonzeros. Every structurally nonzero block is evaluated through
/// [`Function::jacobian`] in compact form.
pub struct BlockJacobian {
    f: Function,
    sp_out: Vec<Sparsity>,
    in_off: Vec<usize>,
    out_off: Vec<usize>,
    nnz_in_total: usize,
    nnz_out_total: usize,
    jac_sp: Sparsity,
    blocks: Vec<Block>,
    stage_off: usize,
}

impl BlockJacobian {
    pub fn new(f: &Function) -> Result<BlockJacobian> {
        let (sp_in, sp_out) = io_sparsities(f)?;
        let (in_off, nnz_in_total) = offsets(&sp_in);
        let (out_off, nnz_out_total) = offsets(&sp_out);

        let mut entries = Vec::new();
        let mut patterns = Vec::new();
        for o in 0..sp_out.len() {
            for i in 0..sp_in.len() {
                let sp = f.jac_sparsity(i, o, true, false)?;
                if sp.is_empty() {
                    continue;
                }
                entries.extend(sp.iter().map(|(r, c)| (r + out_off[o], c + in_off[i])));
                patterns.push((i, o, sp));
            }
        }
        let jac_sp = Sparsity::from_triplets(nnz_out_total, nnz_in_total, &entries)?;
        let mut blocks = Vec::with_capacity(patterns.len());
        for (iind, oind, sp) in patterns {
            let map = sp
                .iter()
                .map(|(r, c)| {
                    jac_sp
                        .get_nz(r + out_off[oind], c + in_off[iind])
                        .ok_or_else(|| Error::dimension(f.name(), "block outside the full Jacobian"))
                })
                .collect::<Result<Vec<_>>>()?;
            blocks.push(Block {
                iind,
                oind,
                jac: None,
                map,
            });
        }
        Ok(BlockJacobian {
            f: f.clone(),
            sp_out,
            in_off,
            out_off,
            nnz_in_total,
            nnz_out_total,
            jac_sp,
            blocks,
            stage_off: 0,
        })
    }

    fn bind_inputs(&self, mem: &mut Memory<f64>, frame: Frame) {
        let x = mem.arg[frame.arg(0)];
        for (i, &off) in self.in_off.iter().enumerate() {
            mem.arg[frame.scratch.arg + i] = x.offset(off);
        }
    }
}

impl FunctionKind for BlockJacobian {
    fn type_name(&self) -> &'static str {
        "BlockJacobian"
    }

    fn n_in(&self) -> usize {
        1
    }

    fn n_out(&self) -> usize {
        2
    }

    fn sparsity_in(&self, _i: usize) -> Sparsity {
        Sparsity::column(self.nnz_in_total)
    }

    fn sparsity_out(&self, o: usize) -> Sparsity {
        if o == 0 {
            self.jac_sp.clone()
        } else {
            Sparsity::column(self.nnz_out_total)
        }
    }

    fn init(&mut self, _name: &str, planner: &mut WorkPlanner) -> Result<()> {
        self.f.init()?;
        let stage = self.blocks.iter().map(|b| b.map.len()).max().unwrap_or(0);
        self.stage_off = planner.alloc_w(stage, true);
        planner.alloc_function(&self.f, false)?;
        for block in &mut self.blocks {
            let jac = self.f.jacobian(block.iind, block.oind, true, false)?;
            planner.alloc_function(&jac, false)?;
            block.jac = Some(jac);
        }
        Ok(())
    }

    fn dependencies(&self) -> Vec<Function> {
        let mut deps = vec![self.f.clone()];
        deps.extend(self.blocks.iter().filter_map(|b| b.jac.clone()));
        deps
    }

    fn eval(&self, name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()> {
        let s = frame.scratch;
        let y = mem.res[frame.res(1)];
        self.bind_inputs(mem, frame);
        for (o, &off) in self.out_off.iter().enumerate() {
            mem.res[s.res + o] = y.offset(off);
        }
        self.f.eval_at(mem, s)?;

        let jac = mem.res[frame.res(0)];
        if jac.is_null() {
            return Ok(());
        }
        mem.fill(jac, self.jac_sp.nnz(), 0.0);
        let stage = frame.w(self.stage_off);
        for block in &self.blocks {
            let Some(jfn) = &block.jac else {
                return Err(Error::NotInitialized {
                    function: name.to_string(),
                });
            };
            self.bind_inputs(mem, frame);
            mem.res[s.res] = Ptr::Work(stage);
            for o in 0..self.sp_out.len() {
                mem.res[s.res + 1 + o] = Ptr::Null;
            }
            jfn.eval_at(mem, s)?;
            for (k, &pos) in block.map.iter().enumerate() {
                let v = mem.w[stage + k];
                mem.set(jac, pos, v);
            }
        }
        Ok(())
    }

    fn has_codegen(&self) -> bool {
        self.f.has_codegen()
            && self
                .blocks
                .iter()
                .all(|b| b.jac.as_ref().map_or(false, Function::has_codegen))
    }

    fn generate_body(&self, f: &Function, g: &mut CodeGenerator) -> Result<String> {
        let mut body = c_frame(f)?;
        let bind_inputs = |body: &mut String, indent: &str| {
            for (i, &off) in self.in_off.iter().enumerate() {
                let _ = writeln!(body, "{indent}arg1[{i}] = {};", c_offset("arg[0]", off));
            }
        };
        bind_inputs(&mut body, "  ");
        for (o, &off) in self.out_off.iter().enumerate() {
            let _ = writeln!(body, "  res1[{o}] = {};", c_offset("res[1]", off));
        }
        body.push_str(&self.f.generate_call(g, "arg1", "res1", "iw1", "w1")?);
        g.add_auxiliary(Auxiliary::Fill);
        body.push_str("  if (res[0]) {\n");
        let _ = writeln!(body, "    cg_fill(res[0], {}, 0);", self.jac_sp.nnz());
        for block in &self.blocks {
            let Some(jfn) = &block.jac else {
                return Err(Error::NotInitialized {
                    function: f.name().to_string(),
                });
            };
            bind_inputs(&mut body, "    ");
            let _ = writeln!(body, "    res1[0] = w+{};", self.stage_off);
            for o in 0..self.sp_out.len() {
                let _ = writeln!(body, "    res1[{}] = 0;", 1 + o);
            }
            let call = jfn.generate_call(g, "arg1", "res1", "iw1", "w1")?;
            let _ = write!(body, "  {call}");
            for (k, &pos) in block.map.iter().enumerate() {
                let _ = writeln!(body, "    res[0][{pos}] = w[{}];", self.stage_off + k);
            }
        }
        body.push_str("  }\n");
        Ok(body)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Directional derivatives from Jacobian blocks ──

struct ProductBlock {
    iind: usize,
    oind: usize,
    jac: Option<Function>,
    // (output nonzero, input nonzero) of each block nonzero.
    entries: Vec<(usize, usize)>,
}

/// Forward or reverse sensitivities as Jacobian-times-seed products.
///
/// Takes the signature of [`Function::forward`] (or [`Function::reverse`]):
/// inputs `[x.., y.., seeds..]`, one sensitivity per direction and output
/// (or input). Each structurally nonzero compact block is evaluated once per
/// call and then applied to every direction.
pub struct JacobianProduct {
    f: Function,
    forward: bool,
    ndir: usize,
    sp_in: Vec<Sparsity>,
    sp_out: Vec<Sparsity>,
    blocks: Vec<ProductBlock>,
    stage_off: usize,
}

impl JacobianProduct {
    pub fn new(f: &Function, ndir: usize, forward: bool) -> Result<JacobianProduct> {
        let (sp_in, sp_out) = io_sparsities(f)?;
        let mut blocks = Vec::new();
        for oind in 0..sp_out.len() {
            for iind in 0..sp_in.len() {
                if f.jac_sparsity(iind, oind, true, false)?.is_empty() {
                    continue;
                }
                blocks.push(ProductBlock {
                    iind,
                    oind,
                    jac: None,
                    entries: Vec::new(),
                });
            }
        }
        Ok(JacobianProduct {
            f: f.clone(),
            forward,
            ndir,
            sp_in,
            sp_out,
            blocks,
            stage_off: 0,
        })
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// `(seeds per direction, sensitivities per direction)`.
    fn io_counts(&self) -> (usize, usize) {
        if self.forward {
            (self.sp_in.len(), self.sp_out.len())
        } else {
            (self.sp_out.len(), self.sp_in.len())
        }
    }

    fn seed_sparsity(&self, j: usize) -> &Sparsity {
        if self.forward {
            &self.sp_in[j]
        } else {
            &self.sp_out[j]
        }
    }

    fn sens_sparsity(&self, j: usize) -> &Sparsity {
        if self.forward {
            &self.sp_out[j]
        } else {
            &self.sp_in[j]
        }
    }

    /// Seeded and receiving I/O index of `block` within one direction.
    fn roles(&self, block: &ProductBlock) -> (usize, usize) {
        if self.forward {
            (block.iind, block.oind)
        } else {
            (block.oind, block.iind)
        }
    }

    /// Index into the seed (`.0`) and the sensitivity (`.1`) of block
    /// nonzero `(r, c)`.
    fn route(&self, r: usize, c: usize) -> (usize, usize) {
        if self.forward {
            (c, r)
        } else {
            (r, c)
        }
    }
}

impl FunctionKind for JacobianProduct {
    fn type_name(&self) -> &'static str {
        "JacobianProduct"
    }

    fn n_in(&self) -> usize {
        self.sp_in.len() + self.sp_out.len() + self.ndir * self.io_counts().0
    }

    fn n_out(&self) -> usize {
        self.ndir * self.io_counts().1
    }

    fn sparsity_in(&self, i: usize) -> Sparsity {
        let (n_in, n_out) = (self.sp_in.len(), self.sp_out.len());
        if i < n_in {
            self.sp_in[i].clone()
        } else if i < n_in + n_out {
            self.sp_out[i - n_in].clone()
        } else {
            self.seed_sparsity((i - n_in - n_out) % self.io_counts().0).clone()
        }
    }

    fn sparsity_out(&self, o: usize) -> Sparsity {
        self.sens_sparsity(o % self.io_counts().1).clone()
    }

    fn init(&mut self, _name: &str, planner: &mut WorkPlanner) -> Result<()> {
        self.f.init()?;
        let mut stage = 0;
        for block in &mut self.blocks {
            let jac = self.f.jacobian(block.iind, block.oind, true, false)?;
            block.entries = jac.sparsity_out(0)?.iter().collect();
            stage = stage.max(block.entries.len());
            planner.alloc_function(&jac, false)?;
            block.jac = Some(jac);
        }
        self.stage_off = planner.alloc_w(stage, true);
        Ok(())
    }

    fn dependencies(&self) -> Vec<Function> {
        let mut deps = vec![self.f.clone()];
        deps.extend(self.blocks.iter().filter_map(|b| b.jac.clone()));
        deps
    }

    fn eval(&self, name: &str, mem: &mut Memory<f64>, frame: Frame) -> Result<()> {
        let (n_in, n_out) = (self.sp_in.len(), self.sp_out.len());
        let (nseed_io, nsens_io) = self.io_counts();
        for k in 0..self.ndir * nsens_io {
            let p = mem.res[frame.res(k)];
            mem.fill(p, self.sens_sparsity(k % nsens_io).nnz(), 0.0);
        }

        let s = frame.scratch;
        let stage = frame.w(self.stage_off);
        for block in &self.blocks {
            let Some(jfn) = &block.jac else {
                return Err(Error::NotInitialized {
                    function: name.to_string(),
                });
            };
            for i in 0..n_in {
                let p = mem.arg[frame.arg(i)];
                mem.arg[s.arg + i] = p;
            }
            mem.res[s.res] = Ptr::Work(stage);
            for o in 0..n_out {
                mem.res[s.res + 1 + o] = Ptr::Null;
            }
            jfn.eval_at(mem, s)?;

            let (seeded, target) = self.roles(block);
            for d in 0..self.ndir {
                let seed = mem.arg[frame.arg(n_in + n_out + d * nseed_io + seeded)];
                let sens = mem.res[frame.res(d * nsens_io + target)];
                if seed.is_null() || sens.is_null() {
                    continue;
                }
                for (k, &(r, c)) in block.entries.iter().enumerate() {
                    let (from, to) = self.route(r, c);
                    let v = mem.get(sens, to) + mem.w[stage + k] * mem.get(seed, from);
                    mem.set(sens, to, v);
                }
            }
        }
        Ok(())
    }

    fn has_codegen(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.jac.as_ref().map_or(false, Function::has_codegen))
    }

    fn generate_body(&self, f: &Function, g: &mut CodeGenerator) -> Result<String> {
        let (n_in, n_out) = (self.sp_in.len(), self.sp_out.len());
        let (nseed_io, nsens_io) = self.io_counts();
        let mut body = c_frame(f)?;
        g.add_auxiliary(Auxiliary::Fill);
        for k in 0..self.ndir * nsens_io {
            let nnz = self.sens_sparsity(k % nsens_io).nnz();
            let _ = writeln!(body, "  cg_fill(res[{k}], {nnz}, 0);");
        }
        for block in &self.blocks {
            let Some(jfn) = &block.jac else {
                return Err(Error::NotInitialized {
                    function: f.name().to_string(),
                });
            };
            for i in 0..n_in {
                let _ = writeln!(body, "  arg1[{i}] = arg[{i}];");
            }
            let _ = writeln!(body, "  res1[0] = w+{};", self.stage_off);
            for o in 0..n_out {
                let _ = writeln!(body, "  res1[{}] = 0;", 1 + o);
            }
            body.push_str(&jfn.generate_call(g, "arg1", "res1", "iw1", "w1")?);

            let (seeded, target) = self.roles(block);
            for d in 0..self.ndir {
                let a = n_in + n_out + d * nseed_io + seeded;
                let z = d * nsens_io + target;
                let _ = writeln!(body, "  if (arg[{a}] && res[{z}]) {{");
                for (k, &(r, c)) in block.entries.iter().enumerate() {
                    let (from, to) = self.route(r, c);
                    let _ = writeln!(
                        body,
                        "    res[{z}][{to}] += w[{}]*arg[{a}][{from}];",
                        self.stage_off + k
                    );
                }
                body.push_str("  }\n");
            }
        }
        Ok(body)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
