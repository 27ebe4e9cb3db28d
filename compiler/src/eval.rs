// eval.rs — Reference evaluator for the loop-nest IR
//
// Executes a `LoweredPipeline` serially over integer inputs supplied as
// closures. Intermediate buffers are sparse and remember the coordinate that
// last wrote each cell, so a read through a fold that lands on a cell owned by
// another coordinate is reported instead of silently returning stale data.
//
// Preconditions: `pipeline` came out of `lower`.
// Postconditions: every cell of every output box is produced, or an error.
// Failure modes: `EvalError` (unknown input, unbound symbol, read of a value
//                never produced, fold aliasing, store outside its allocation
//                or outside the requested output box).
// Side effects: none.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::expr::{Expr, ScalarType, UnOp, Var};
use crate::id::FuncId;
use crate::interval::euclid_mod;
use crate::lir::{LoweredPipeline, Stmt};
use crate::storage::AllocDim;

// ── Inputs and results ─────────────────────────────────────────────────────

type InputFn<'a> = Box<dyn Fn(&[i64]) -> i64 + 'a>;

/// Pipeline inputs by name.
#[derive(Default)]
pub struct Inputs<'a> {
    funcs: BTreeMap<String, InputFn<'a>>,
}

impl<'a> Inputs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, f: impl Fn(&[i64]) -> i64 + 'a) -> Self {
        self.funcs.insert(name.to_string(), Box::new(f));
        self
    }
}

/// Dense contents of one output box, dimension 0 fastest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    /// `(min, extent)` per dimension.
    pub region: Vec<(i64, i64)>,
    /// One plane per tuple component.
    pub data: Vec<Vec<i64>>,
}

impl Buffer {
    fn index(&self, coords: &[i64]) -> Option<usize> {
        if coords.len() != self.region.len() {
            return None;
        }
        let mut idx = 0usize;
        let mut stride = 1usize;
        for (&c, &(min, extent)) in coords.iter().zip(&self.region) {
            if c < min || c >= min + extent {
                return None;
            }
            idx += usize::try_from(c - min).ok()? * stride;
            stride *= usize::try_from(extent).ok()?;
        }
        Some(idx)
    }

    /// Component 0 at `coords`.
    pub fn get(&self, coords: &[i64]) -> Option<i64> {
        self.component(0, coords)
    }

    pub fn component(&self, component: usize, coords: &[i64]) -> Option<i64> {
        let i = self.index(coords)?;
        self.data.get(component)?.get(i).copied()
    }
}

/// Output buffers by Func name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Realization {
    pub outputs: BTreeMap<String, Buffer>,
}

impl Realization {
    pub fn get(&self, func: &str) -> Option<&Buffer> {
        self.outputs.get(func)
    }
}

// ── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    UnknownInput(String),
    UnboundSymbol(String),
    /// A Func read outside every open allocation.
    NoStorage { func: String },
    NeverProduced { func: String, coords: Vec<i64> },
    /// The folded cell holds the value of `holder`, not of `coords`.
    Aliased {
        func: String,
        coords: Vec<i64>,
        holder: Vec<i64>,
    },
    OutOfStorage { func: String, coords: Vec<i64> },
    /// An output store outside the requested box.
    OutsideOutput { func: String, coords: Vec<i64> },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnknownInput(name) => write!(f, "no input named '{name}'"),
            EvalError::UnboundSymbol(sym) => write!(f, "symbol '{sym}' is not bound"),
            EvalError::NoStorage { func } => write!(f, "'{func}' is accessed outside its allocation"),
            EvalError::NeverProduced { func, coords } => {
                write!(f, "{func}{coords:?} is read but was never produced")
            }
            EvalError::Aliased { func, coords, holder } => write!(
                f,
                "{func}{coords:?} is read but its folded cell holds {func}{holder:?}"
            ),
            EvalError::OutOfStorage { func, coords } => {
                write!(f, "{func}{coords:?} is stored outside its allocation")
            }
            EvalError::OutsideOutput { func, coords } => {
                write!(f, "{func}{coords:?} is stored outside the requested output box")
            }
        }
    }
}

impl std::error::Error for EvalError {}

// ── Machine ────────────────────────────────────────────────────────────────

/// One live allocation: folded cell → (writer coordinates, values).
struct Scratch {
    shape: Vec<(i64, i64, Option<i64>)>,
    cells: HashMap<Vec<i64>, (Vec<i64>, Vec<i64>)>,
}

impl Scratch {
    fn cell(&self, coords: &[i64]) -> Option<Vec<i64>> {
        if coords.len() != self.shape.len() {
            return None;
        }
        coords
            .iter()
            .zip(&self.shape)
            .map(|(&c, &(min, extent, fold))| {
                let off = match fold {
                    Some(m) => euclid_mod(c, m),
                    None => c - min,
                };
                (0..extent).contains(&off).then_some(off)
            })
            .collect()
    }
}

struct Machine<'p, 'i> {
    pipeline: &'p LoweredPipeline,
    inputs: &'i Inputs<'i>,
    env: Vec<(String, i64)>,
    scratch: BTreeMap<FuncId, Vec<Scratch>>,
    outputs: BTreeMap<FuncId, HashMap<Vec<i64>, Vec<i64>>>,
}

/// Run `pipeline` and collect its output boxes.
pub fn evaluate(pipeline: &LoweredPipeline, inputs: &Inputs<'_>) -> Result<Realization, EvalError> {
    let mut m = Machine {
        pipeline,
        inputs,
        env: Vec::new(),
        scratch: BTreeMap::new(),
        outputs: pipeline.outputs.iter().map(|o| (o.func, HashMap::new())).collect(),
    };
    m.block(&pipeline.body)?;

    let mut out = Realization::default();
    for o in &pipeline.outputs {
        let components = m.value_types(o.func).len().max(1);
        let cells = m.outputs.get(&o.func);
        let mut data = vec![Vec::new(); components];
        for coords in points(&o.region) {
            let Some(values) = cells.and_then(|c| c.get(&coords)) else {
                return Err(EvalError::NeverProduced {
                    func: o.name.clone(),
                    coords,
                });
            };
            for (plane, v) in data.iter_mut().zip(values) {
                plane.push(*v);
            }
        }
        out.outputs.insert(
            o.name.clone(),
            Buffer {
                region: o.region.clone(),
                data,
            },
        );
    }
    Ok(out)
}

fn in_box(region: &[(i64, i64)], coords: &[i64]) -> bool {
    region.len() == coords.len()
        && region
            .iter()
            .zip(coords)
            .all(|(&(min, extent), &c)| (min..min + extent).contains(&c))
}

/// Every point of a `(min, extent)` box, dimension 0 fastest.
fn points(region: &[(i64, i64)]) -> Vec<Vec<i64>> {
    let mut out = Vec::new();
    if region.iter().any(|(_, e)| *e <= 0) {
        return out;
    }
    let mut cur: Vec<i64> = region.iter().map(|(m, _)| *m).collect();
    loop {
        out.push(cur.clone());
        let mut d = 0;
        loop {
            if d == region.len() {
                return out;
            }
            cur[d] += 1;
            if cur[d] < region[d].0 + region[d].1 {
                break;
            }
            cur[d] = region[d].0;
            d += 1;
        }
    }
}

impl Machine<'_, '_> {
    fn name(&self, func: FuncId) -> String {
        self.pipeline
            .names
            .func(func)
            .map_or_else(|| format!("#{}", func.0), |f| f.name.clone())
    }

    fn value_types(&self, func: FuncId) -> &[ScalarType] {
        self.pipeline
            .names
            .func(func)
            .map(|f| f.value_types.as_slice())
            .unwrap_or_default()
    }

    fn lookup(&self, sym: &str) -> Result<i64, EvalError> {
        self.env
            .iter()
            .rev()
            .find(|(s, _)| s == sym)
            .map(|(_, v)| *v)
            .ok_or_else(|| EvalError::UnboundSymbol(sym.to_string()))
    }

    /// Execute `body`; `Let` bindings end with the block.
    fn block(&mut self, body: &[Stmt]) -> Result<(), EvalError> {
        let mark = self.env.len();
        for s in body {
            self.stmt(s)?;
        }
        self.env.truncate(mark);
        Ok(())
    }

    fn stmt(&mut self, s: &Stmt) -> Result<(), EvalError> {
        match s {
            Stmt::Allocate { func, shape, body, .. } => {
                let mut dims = Vec::with_capacity(shape.len());
                for AllocDim { min, extent, fold } in shape {
                    dims.push((self.expr(min)?, *extent, *fold));
                }
                self.scratch.entry(*func).or_default().push(Scratch {
                    shape: dims,
                    cells: HashMap::new(),
                });
                let r = self.block(body);
                if let Some(stack) = self.scratch.get_mut(func) {
                    stack.pop();
                }
                r
            }
            Stmt::Produce { body, .. } => self.block(body),
            Stmt::For {
                sym, min, extent, body, ..
            } => {
                let lo = self.expr(min)?;
                let n = self.expr(extent)?;
                for i in lo..lo + n {
                    self.env.push((sym.clone(), i));
                    let r = self.block(body);
                    self.env.pop();
                    r?;
                }
                Ok(())
            }
            Stmt::Let { sym, value } => {
                let v = self.expr(value)?;
                self.env.push((sym.clone(), v));
                Ok(())
            }
            Stmt::If { cond, body } => {
                if self.expr(cond)? != 0 {
                    self.block(body)?;
                }
                Ok(())
            }
            Stmt::Store { func, args, values } => {
                let coords = args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>, _>>()?;
                let mut vals = values.iter().map(|v| self.expr(v)).collect::<Result<Vec<_>, _>>()?;
                for (v, ty) in vals.iter_mut().zip(self.value_types(*func)) {
                    *v = ty.wrap(*v);
                }
                self.store(*func, coords, vals)
            }
        }
    }

    fn store(&mut self, func: FuncId, coords: Vec<i64>, vals: Vec<i64>) -> Result<(), EvalError> {
        if let Some(o) = self.pipeline.outputs.iter().find(|o| o.func == func) {
            if !in_box(&o.region, &coords) {
                return Err(EvalError::OutsideOutput {
                    func: o.name.clone(),
                    coords,
                });
            }
            if let Some(cells) = self.outputs.get_mut(&func) {
                cells.insert(coords, vals);
            }
            return Ok(());
        }
        let name = self.name(func);
        let Some(scratch) = self.scratch.get_mut(&func).and_then(|s| s.last_mut()) else {
            return Err(EvalError::NoStorage { func: name });
        };
        let Some(cell) = scratch.cell(&coords) else {
            return Err(EvalError::OutOfStorage { func: name, coords });
        };
        scratch.cells.insert(cell, (coords, vals));
        Ok(())
    }

    fn load(&self, func: FuncId, component: usize, coords: Vec<i64>) -> Result<i64, EvalError> {
        let never = |coords: Vec<i64>| EvalError::NeverProduced {
            func: self.name(func),
            coords,
        };
        if let Some(cells) = self.outputs.get(&func) {
            return match cells.get(&coords).and_then(|v| v.get(component)) {
                Some(v) => Ok(*v),
                None => Err(never(coords)),
            };
        }
        let Some(scratch) = self.scratch.get(&func).and_then(|s| s.last()) else {
            return Err(EvalError::NoStorage { func: self.name(func) });
        };
        let Some(cell) = scratch.cell(&coords) else {
            return Err(never(coords));
        };
        match scratch.cells.get(&cell) {
            None => Err(never(coords)),
            Some((holder, _)) if *holder != coords => Err(EvalError::Aliased {
                func: self.name(func),
                coords,
                holder: holder.clone(),
            }),
            Some((_, vals)) => vals.get(component).copied().ok_or_else(|| never(coords)),
        }
    }

    fn expr(&self, e: &Expr) -> Result<i64, EvalError> {
        Ok(match e {
            Expr::Const { value, ty } => ty.map_or(*value, |t| t.wrap(*value)),
            Expr::Var(Var::Loop(s)) => self.lookup(s)?,
            Expr::Var(Var::Dim(d)) => return Err(EvalError::UnboundSymbol(format!("#{}", d.0))),
            Expr::Unary(UnOp::Neg, a) => self.expr(a)?.wrapping_neg(),
            Expr::Unary(UnOp::Not, a) => i64::from(self.expr(a)? == 0),
            Expr::Binary(op, a, b) => op.apply(self.expr(a)?, self.expr(b)?),
            Expr::Select(c, t, f) => {
                if self.expr(c)? != 0 {
                    self.expr(t)?
                } else {
                    self.expr(f)?
                }
            }
            Expr::Cast(ty, a) => ty.wrap(self.expr(a)?),
            Expr::Call {
                func,
                component,
                args,
            } => {
                let coords = args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>, _>>()?;
                self.load(*func, *component, coords)?
            }
            Expr::Input { input, args } => {
                let meta = self.pipeline.names.input(*input);
                let name = meta.map_or_else(|| format!("#{}", input.0), |m| m.name.clone());
                let Some(f) = self.inputs.funcs.get(&name) else {
                    return Err(EvalError::UnknownInput(name));
                };
                let coords = args.iter().map(|a| self.expr(a)).collect::<Result<Vec<_>, _>>()?;
                let v = f(&coords);
                meta.map_or(v, |m| m.ty.wrap(v))
            }
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
