// graph.rs — Pipeline graph: Funcs, dimensions, reduction domains and inputs
//
// All entities live in arenas addressed by the ids of `id.rs`. A Func is a
// pure definition plus zero or more ordered update definitions sharing one
// backing allocation. Reduction domains are referenced by id from every update
// that uses them, so a predicate added through `rdom_where` is seen by all of
// them.
//
// Preconditions: none (the builder accepts anything; `validate` judges it).
// Postconditions: `validate` reports every arity, type, ownership and cycle
//                 error and infers value types of well-formed Funcs.
// Failure modes: validation errors → `Diagnostic` (E0100..E0108).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::{Expr, NameLookup, ScalarType, TypeEnv, Var};
use crate::id::{DimId, FuncId, IdAllocator, InputId, RDomId};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimOwner {
    Func(FuncId),
    RDom(RDomId),
}

/// A named loop variable of a Func's domain or of a reduction domain.
#[derive(Debug, Clone)]
pub struct Dim {
    pub id: DimId,
    pub name: String,
    pub owner: DimOwner,
}

/// One dimension of a reduction domain, iterated over `[min, min + extent)`.
#[derive(Debug, Clone)]
pub struct RVar {
    pub dim: DimId,
    pub min: Expr,
    pub extent: Expr,
}

/// Ordered reduction variables (first is innermost) plus an optional predicate.
#[derive(Debug, Clone)]
pub struct RDom {
    pub id: RDomId,
    pub name: String,
    pub vars: Vec<RVar>,
    pub predicate: Option<Expr>,
}

/// `func(args...) = values...`. Pure definitions use the Func's own
/// dimensions as arguments.
#[derive(Debug, Clone)]
pub struct Definition {
    pub args: Vec<Expr>,
    pub values: Vec<Expr>,
}

impl Definition {
    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.args.iter().chain(self.values.iter())
    }

    pub fn dims(&self) -> BTreeSet<DimId> {
        self.exprs().flat_map(Expr::dims).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Func {
    pub id: FuncId,
    pub name: String,
    pub args: Vec<DimId>,
    pub pure_def: Option<Definition>,
    pub updates: Vec<Definition>,
    /// One entry per tuple component; filled by validation.
    pub value_types: Vec<ScalarType>,
}

impl Func {
    pub fn stage_count(&self) -> usize {
        if self.pure_def.is_some() {
            1 + self.updates.len()
        } else {
            0
        }
    }

    /// Stage 0 is the pure definition, stage `k` the `k-1`th update.
    pub fn definition(&self, stage: usize) -> Option<&Definition> {
        if stage == 0 {
            self.pure_def.as_ref()
        } else {
            self.updates.get(stage - 1)
        }
    }

    pub fn arity(&self) -> usize {
        self.pure_def.as_ref().map_or(0, |d| d.values.len())
    }
}

/// An externally supplied buffer.
#[derive(Debug, Clone)]
pub struct Input {
    pub id: InputId,
    pub name: String,
    pub dims: usize,
    pub ty: ScalarType,
}

/// The producer/consumer graph of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    ids: IdAllocator,
    funcs: Vec<Func>,
    dims: Vec<Dim>,
    rdoms: Vec<RDom>,
    inputs: Vec<Input>,
}

// ── Builder ─────────────────────────────────────────────────────────────────

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: &str, dims: usize, ty: ScalarType) -> InputId {
        let id = self.ids.alloc_input();
        self.inputs.push(Input {
            id,
            name: name.to_string(),
            dims,
            ty,
        });
        id
    }

    /// Declare a Func with named pure arguments.
    pub fn add_func(&mut self, name: &str, args: &[&str]) -> FuncId {
        let id = self.ids.alloc_func();
        let dims = args
            .iter()
            .map(|a| self.new_dim(a.to_string(), DimOwner::Func(id)))
            .collect();
        self.funcs.push(Func {
            id,
            name: name.to_string(),
            args: dims,
            pure_def: None,
            updates: Vec::new(),
            value_types: Vec::new(),
        });
        id
    }

    fn new_dim(&mut self, name: String, owner: DimOwner) -> DimId {
        let id = self.ids.alloc_dim();
        self.dims.push(Dim { id, name, owner });
        id
    }

    /// Declare a reduction domain with constant bounds `(name, min, extent)`.
    pub fn add_rdom(&mut self, name: &str, vars: &[(&str, i64, i64)]) -> RDomId {
        let vars = vars
            .iter()
            .map(|(n, min, extent)| (n.to_string(), Expr::int(*min), Expr::int(*extent)))
            .collect();
        self.add_rdom_exprs(name, vars)
    }

    /// Declare a reduction domain whose bounds are arbitrary expressions.
    pub fn add_rdom_exprs(&mut self, name: &str, vars: Vec<(String, Expr, Expr)>) -> RDomId {
        let vars = vars
            .into_iter()
            .map(|(n, min, extent)| (format!("{name}.{n}"), min, extent))
            .collect();
        self.push_rdom(name, vars)
    }

    /// Declare a reduction domain whose dimension names are taken verbatim
    /// (the domains rfactor derives from scheduled loops).
    pub fn add_rdom_verbatim(&mut self, name: &str, vars: Vec<(String, Expr, Expr)>) -> RDomId {
        self.push_rdom(name, vars)
    }

    fn push_rdom(&mut self, name: &str, vars: Vec<(String, Expr, Expr)>) -> RDomId {
        let id = self.ids.alloc_rdom();
        let vars = vars
            .into_iter()
            .map(|(n, min, extent)| RVar {
                dim: self.new_dim(n, DimOwner::RDom(id)),
                min,
                extent,
            })
            .collect();
        self.rdoms.push(RDom {
            id,
            name: name.to_string(),
            vars,
            predicate: None,
        });
        id
    }

    /// Restrict a reduction domain; conjoined with any earlier predicate.
    pub fn rdom_where(&mut self, rdom: RDomId, predicate: Expr) {
        if let Some(r) = self.rdoms.get_mut(rdom.0 as usize) {
            r.predicate = Some(match r.predicate.take() {
                Some(p) => p.and(predicate),
                None => predicate,
            });
        }
    }

    pub fn define(&mut self, func: FuncId, values: Vec<Expr>) {
        if let Some(f) = self.funcs.get_mut(func.0 as usize) {
            let args = f.args.iter().map(|d| Expr::dim(*d)).collect();
            f.pure_def = Some(Definition { args, values });
        }
    }

    pub fn update(&mut self, func: FuncId, args: Vec<Expr>, values: Vec<Expr>) {
        if let Some(f) = self.funcs.get_mut(func.0 as usize) {
            f.updates.push(Definition { args, values });
        }
    }

    pub fn func_mut(&mut self, func: FuncId) -> Option<&mut Func> {
        self.funcs.get_mut(func.0 as usize)
    }

    pub fn rdom_mut(&mut self, rdom: RDomId) -> Option<&mut RDom> {
        self.rdoms.get_mut(rdom.0 as usize)
    }

    pub fn set_value_types(&mut self, types: &BTreeMap<FuncId, Vec<ScalarType>>) {
        for (id, tys) in types {
            if let Some(f) = self.funcs.get_mut(id.0 as usize) {
                f.value_types = tys.clone();
            }
        }
    }
}

// ── Queries ─────────────────────────────────────────────────────────────────

impl PipelineGraph {
    pub fn funcs(&self) -> &[Func] {
        &self.funcs
    }

    pub fn func(&self, id: FuncId) -> &Func {
        &self.funcs[id.0 as usize]
    }

    pub fn get_func(&self, id: FuncId) -> Option<&Func> {
        self.funcs.get(id.0 as usize)
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs.iter().find(|f| f.name == name).map(|f| f.id)
    }

    pub fn dim(&self, id: DimId) -> &Dim {
        &self.dims[id.0 as usize]
    }

    pub fn rdom(&self, id: RDomId) -> &RDom {
        &self.rdoms[id.0 as usize]
    }

    pub fn rdoms(&self) -> &[RDom] {
        &self.rdoms
    }

    pub fn input(&self, id: InputId) -> &Input {
        &self.inputs[id.0 as usize]
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Pure arguments of `func` as expressions, in declaration order.
    pub fn vars(&self, func: FuncId) -> Vec<Expr> {
        self.get_func(func)
            .map(|f| f.args.iter().map(|d| Expr::dim(*d)).collect())
            .unwrap_or_default()
    }

    pub fn var(&self, func: FuncId, name: &str) -> Option<Expr> {
        let f = self.get_func(func)?;
        f.args
            .iter()
            .find(|d| self.dim(**d).name == name)
            .map(|d| Expr::dim(*d))
    }

    pub fn rvars(&self, rdom: RDomId) -> Vec<Expr> {
        self.rdoms
            .get(rdom.0 as usize)
            .map(|r| r.vars.iter().map(|v| Expr::dim(v.dim)).collect())
            .unwrap_or_default()
    }

    pub fn rvar(&self, rdom: RDomId, name: &str) -> Option<Expr> {
        let r = self.rdoms.get(rdom.0 as usize)?;
        let full = format!("{}.{}", r.name, name);
        r.vars
            .iter()
            .find(|v| self.dim(v.dim).name == full)
            .map(|v| Expr::dim(v.dim))
    }

    pub fn dim_rdom(&self, dim: DimId) -> Option<RDomId> {
        match self.dim(dim).owner {
            DimOwner::RDom(r) => Some(r),
            DimOwner::Func(_) => None,
        }
    }

    /// Reduction domains referenced by a definition.
    pub fn rdoms_of(&self, def: &Definition) -> BTreeSet<RDomId> {
        def.dims()
            .into_iter()
            .filter_map(|d| self.dim_rdom(d))
            .collect()
    }

    /// The reduction domain of update stage `stage` (first one if several).
    pub fn stage_rdom(&self, func: FuncId, stage: usize) -> Option<RDomId> {
        let def = self.func(func).definition(stage)?;
        self.rdoms_of(def).into_iter().next()
    }

    /// Pure variables iterated by a stage: `(lhs position, dim)` for every
    /// argument that is exactly one of the Func's own dimensions.
    pub fn stage_pure_vars(&self, func: FuncId, stage: usize) -> Vec<(usize, DimId)> {
        let f = self.func(func);
        let Some(def) = f.definition(stage) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        def.args
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_dim().map(|d| (i, d)))
            .filter(|(_, d)| f.args.contains(d) && seen.insert(*d))
            .collect()
    }

    /// Funcs read by any definition of `func`, excluding itself.
    pub fn producers(&self, func: FuncId) -> BTreeSet<FuncId> {
        let f = self.func(func);
        f.pure_def
            .iter()
            .chain(f.updates.iter())
            .flat_map(|d| d.exprs())
            .flat_map(|e| e.calls().into_iter().map(|c| c.func).collect::<Vec<_>>())
            .filter(|p| *p != func)
            .collect()
    }

    pub fn consumers(&self, func: FuncId) -> BTreeSet<FuncId> {
        self.funcs
            .iter()
            .filter(|f| f.id != func && self.producers(f.id).contains(&func))
            .map(|f| f.id)
            .collect()
    }

    pub fn input_consumers(&self, input: InputId) -> BTreeSet<FuncId> {
        self.funcs
            .iter()
            .filter(|f| {
                f.pure_def
                    .iter()
                    .chain(f.updates.iter())
                    .flat_map(|d| d.exprs())
                    .any(|e| e.inputs().contains(&input))
            })
            .map(|f| f.id)
            .collect()
    }

    /// True when an update definition of `func` reads `func`.
    pub fn is_recursive(&self, func: FuncId) -> bool {
        self.func(func)
            .updates
            .iter()
            .flat_map(|d| d.exprs())
            .any(|e| e.calls_func(func))
    }

    /// Every Func reachable from `outputs` through producer edges.
    pub fn reachable(&self, outputs: &[FuncId]) -> BTreeSet<FuncId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<FuncId> = outputs.to_vec();
        while let Some(f) = stack.pop() {
            if self.get_func(f).is_none() || !seen.insert(f) {
                continue;
            }
            stack.extend(self.producers(f));
        }
        seen
    }

    /// Kahn sort of `subset`, producers first, ties broken by id so the order
    /// is deterministic. `Err` carries the Funcs left on a cycle.
    pub fn topo_order(&self, subset: &BTreeSet<FuncId>) -> Result<Vec<FuncId>, Vec<FuncId>> {
        let mut in_degree: HashMap<FuncId, usize> = HashMap::new();
        let mut consumers: HashMap<FuncId, Vec<FuncId>> = HashMap::new();
        for &f in subset {
            let producers: Vec<FuncId> = self
                .producers(f)
                .into_iter()
                .filter(|p| subset.contains(p))
                .collect();
            in_degree.insert(f, producers.len());
            for p in producers {
                consumers.entry(p).or_default().push(f);
            }
        }
        let mut ready: BTreeSet<FuncId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(f, _)| *f)
            .collect();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(f) = ready.pop_first() {
            order.push(f);
            for c in consumers.get(&f).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(c) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*c);
                    }
                }
            }
        }
        if order.len() == subset.len() {
            Ok(order)
        } else {
            let done: BTreeSet<FuncId> = order.into_iter().collect();
            Err(subset.difference(&done).copied().collect())
        }
    }
}

impl NameLookup for PipelineGraph {
    fn func_name(&self, func: FuncId) -> &str {
        self.get_func(func).map_or("<unknown>", |f| f.name.as_str())
    }

    fn input_name(&self, input: InputId) -> &str {
        self.inputs
            .get(input.0 as usize)
            .map_or("<unknown>", |i| i.name.as_str())
    }

    fn dim_name(&self, dim: DimId) -> &str {
        self.dims
            .get(dim.0 as usize)
            .map_or("<unknown>", |d| d.name.as_str())
    }
}

impl TypeEnv for PipelineGraph {
    fn call_type(&self, func: FuncId, component: usize) -> Option<ScalarType> {
        self.get_func(func)?.value_types.get(component).copied()
    }

    fn input_type(&self, input: InputId) -> Option<ScalarType> {
        self.inputs.get(input.0 as usize).map(|i| i.ty)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in &self.inputs {
            writeln!(f, "input {}: {} x{}", input.name, input.ty, input.dims)?;
        }
        for func in &self.funcs {
            let Some(def) = &func.pure_def else {
                writeln!(f, "{}: <undefined>", func.name)?;
                continue;
            };
            for (stage, d) in std::iter::once(def).chain(&func.updates).enumerate() {
                let args: Vec<String> = d.args.iter().map(|a| a.display(self).to_string()).collect();
                let vals: Vec<String> = d.values.iter().map(|v| v.display(self).to_string()).collect();
                let op = if stage == 0 { "=" } else { ":=" };
                writeln!(f, "{}({}) {} {}", func.name, args.join(", "), op, vals.join(", "))?;
            }
        }
        Ok(())
    }
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Result of graph validation.
#[derive(Debug, Clone, Default)]
pub struct ValidateResult {
    pub value_types: BTreeMap<FuncId, Vec<ScalarType>>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Check arity, ownership, cycles and types of every Func reachable from
/// `outputs`, and infer value types.
pub fn validate(graph: &PipelineGraph, outputs: &[FuncId]) -> ValidateResult {
    let mut ctx = ValidateCtx {
        graph,
        diagnostics: Vec::new(),
        types: BTreeMap::new(),
    };
    ctx.check_names();
    for &o in outputs {
        match graph.get_func(o) {
            None => ctx.error(codes::E0102, Subject::none(), format!("unknown output func #{}", o.0)),
            Some(f) if f.pure_def.is_none() => ctx.error(
                codes::E0105,
                Subject::func(&f.name),
                format!("output '{}' has no pure definition", f.name),
            ),
            Some(_) => {}
        }
    }
    let live = graph.reachable(outputs);
    for &f in &live {
        ctx.check_func(f);
    }
    if ctx.diagnostics.is_empty() {
        match graph.topo_order(&live) {
            Ok(order) => ctx.infer_types(&order),
            Err(cycle) => {
                let names: Vec<&str> = cycle.iter().map(|c| graph.func(*c).name.as_str()).collect();
                ctx.error(
                    codes::E0106,
                    Subject::func(names.first().copied().unwrap_or_default()),
                    format!("cyclic dependency between {}", names.join(", ")),
                );
            }
        }
    }
    ValidateResult {
        value_types: ctx.types,
        diagnostics: ctx.diagnostics,
    }
}

struct ValidateCtx<'a> {
    graph: &'a PipelineGraph,
    diagnostics: Vec<Diagnostic>,
    types: BTreeMap<FuncId, Vec<ScalarType>>,
}

impl TypeEnv for ValidateCtx<'_> {
    fn call_type(&self, func: FuncId, component: usize) -> Option<ScalarType> {
        self.types.get(&func)?.get(component).copied()
    }

    fn input_type(&self, input: InputId) -> Option<ScalarType> {
        self.graph.input_type(input)
    }
}

impl ValidateCtx<'_> {
    fn error(&mut self, code: crate::diag::DiagCode, subject: Subject, message: String) {
        self.diagnostics.push(Diagnostic::error(code, subject, message));
    }

    fn check_names(&mut self) {
        let g = self.graph;
        let mut seen = BTreeSet::new();
        let names = g
            .funcs
            .iter()
            .map(|f| f.name.as_str())
            .chain(g.inputs.iter().map(|i| i.name.as_str()));
        for name in names {
            if !seen.insert(name) {
                self.error(codes::E0108, Subject::func(name), format!("duplicate name '{name}'"));
            }
        }
        for f in &g.funcs {
            let mut args = BTreeSet::new();
            for d in &f.args {
                let n = &g.dim(*d).name;
                if !args.insert(n.as_str()) {
                    self.error(
                        codes::E0108,
                        Subject::dim(&f.name, n),
                        format!("duplicate argument '{n}' of '{}'", f.name),
                    );
                }
            }
        }
    }

    fn check_func(&mut self, id: FuncId) {
        let g = self.graph;
        let f = g.func(id);
        let Some(pure) = &f.pure_def else {
            self.error(
                codes::E0105,
                Subject::func(&f.name),
                format!("'{}' is used without a pure definition", f.name),
            );
            return;
        };
        if pure.values.is_empty() {
            self.error(
                codes::E0101,
                Subject::func(&f.name),
                format!("'{}' defines no values", f.name),
            );
        }
        let own: BTreeSet<DimId> = f.args.iter().copied().collect();
        for e in &pure.values {
            if e.calls_func(id) {
                self.error(
                    codes::E0107,
                    Subject::func(&f.name),
                    format!("pure definition of '{}' reads '{}'", f.name, f.name),
                );
            }
            for d in e.dims() {
                if !own.contains(&d) {
                    self.foreign_dim(f, d);
                }
            }
            self.check_loads(f, e);
        }
        for (k, def) in f.updates.iter().enumerate() {
            self.check_update(f, k + 1, def, pure.values.len());
        }
    }

    fn check_update(&mut self, f: &Func, stage: usize, def: &Definition, arity: usize) {
        let g = self.graph;
        if def.args.len() != f.args.len() {
            self.error(
                codes::E0100,
                Subject::func(&f.name),
                format!(
                    "update {} of '{}' has {} arguments, expected {}",
                    stage - 1,
                    f.name,
                    def.args.len(),
                    f.args.len()
                ),
            );
        }
        if def.values.len() != arity {
            self.error(
                codes::E0101,
                Subject::func(&f.name),
                format!(
                    "update {} of '{}' has {} values, expected {}",
                    stage - 1,
                    f.name,
                    def.values.len(),
                    arity
                ),
            );
        }
        let rdoms = g.rdoms_of(def);
        if rdoms.len() > 1 {
            self.error(
                codes::E0104,
                Subject::func(&f.name),
                format!("update {} of '{}' mixes reduction domains", stage - 1, f.name),
            );
        }
        for d in def.dims() {
            match g.dim(d).owner {
                DimOwner::Func(owner) if owner != f.id => self.foreign_dim(f, d),
                _ => {}
            }
        }
        for r in rdoms {
            if let Some(p) = &g.rdom(r).predicate {
                let own: BTreeSet<DimId> = g.rdom(r).vars.iter().map(|v| v.dim).collect();
                for d in p.dims() {
                    if !own.contains(&d) && !f.args.contains(&d) {
                        self.foreign_dim(f, d);
                    }
                }
            }
        }
        for e in def.exprs() {
            self.check_loads(f, e);
        }
    }

    fn foreign_dim(&mut self, f: &Func, d: DimId) {
        let name = self.graph.dim(d).name.clone();
        self.error(
            codes::E0103,
            Subject::dim(&f.name, &name),
            format!("'{name}' is not a dimension of '{}'", f.name),
        );
    }

    fn check_loads(&mut self, f: &Func, e: &Expr) {
        let g = self.graph;
        let mut found = Vec::new();
        e.visit(&mut |n| match n {
            Expr::Call {
                func,
                component,
                args,
            } => found.push((Some(*func), None, *component, args.len())),
            Expr::Input { input, args } => found.push((None, Some(*input), 0, args.len())),
            _ => {}
        });
        for (func, input, component, nargs) in found {
            if let Some(callee) = func {
                let Some(c) = g.get_func(callee) else {
                    self.error(
                        codes::E0102,
                        Subject::func(&f.name),
                        format!("'{}' reads unknown func #{}", f.name, callee.0),
                    );
                    continue;
                };
                if nargs != c.args.len() {
                    self.error(
                        codes::E0100,
                        Subject::func(&f.name),
                        format!(
                            "'{}' calls '{}' with {} arguments, expected {}",
                            f.name,
                            c.name,
                            nargs,
                            c.args.len()
                        ),
                    );
                }
                if c.pure_def.is_some() && component >= c.arity() {
                    self.error(
                        codes::E0101,
                        Subject::func(&f.name),
                        format!(
                            "'{}' reads component {} of '{}', which has {}",
                            f.name,
                            component,
                            c.name,
                            c.arity()
                        ),
                    );
                }
            }
            if let Some(i) = input {
                let Some(inp) = g.inputs.get(i.0 as usize) else {
                    self.error(
                        codes::E0102,
                        Subject::func(&f.name),
                        format!("'{}' reads unknown input #{}", f.name, i.0),
                    );
                    continue;
                };
                if nargs != inp.dims {
                    self.error(
                        codes::E0100,
                        Subject::func(&f.name),
                        format!(
                            "'{}' reads input '{}' with {} arguments, expected {}",
                            f.name, inp.name, nargs, inp.dims
                        ),
                    );
                }
            }
        }
    }

    fn infer_types(&mut self, order: &[FuncId]) {
        let g = self.graph;
        for &id in order {
            let f = g.func(id);
            let Some(pure) = &f.pure_def else { continue };
            let mut tys = Vec::with_capacity(pure.values.len());
            for v in &pure.values {
                match v.type_of(&*self) {
                    Ok(t) => tys.push(t.unwrap_or(ScalarType::I32)),
                    Err(msg) => {
                        self.error(
                            codes::E0101,
                            Subject::func(&f.name),
                            format!("in '{}': {msg}", f.name),
                        );
                        tys.push(ScalarType::I32);
                    }
                }
            }
            self.types.insert(id, tys.clone());
            for (k, def) in f.updates.iter().enumerate() {
                for (c, v) in def.values.iter().enumerate() {
                    let expected = tys.get(c).copied();
                    match v.type_of(&*self) {
                        Ok(Some(t)) if Some(t) != expected => self.error(
                            codes::E0101,
                            Subject::func(&f.name),
                            format!(
                                "update {k} of '{}' stores {t} into a {} func",
                                f.name,
                                expected.map_or("?".to_string(), |e| e.to_string())
                            ),
                        ),
                        Ok(_) => {}
                        Err(msg) => self.error(
                            codes::E0101,
                            Subject::func(&f.name),
                            format!("in update {k} of '{}': {msg}", f.name),
                        ),
                    }
                }
                for a in &def.args {
                    if let Err(msg) = a.type_of(&*self) {
                        self.error(
                            codes::E0101,
                            Subject::func(&f.name),
                            format!("in update {k} of '{}': {msg}", f.name),
                        );
                    }
                }
            }
        }
    }
}

/// Convenience for tests and the evaluator: the dims of a reduction domain
/// with their constant `(min, extent)`, when every bound is a literal.
pub fn constant_rdom_bounds(graph: &PipelineGraph, rdom: RDomId) -> Option<Vec<(DimId, i64, i64)>> {
    graph
        .rdom(rdom)
        .vars
        .iter()
        .map(|v| Some((v.dim, v.min.as_const()?, v.extent.as_const()?)))
        .collect()
}

/// True when `v` is a variable of `graph` owned by a reduction domain.
pub fn is_rvar(graph: &PipelineGraph, v: &Var) -> bool {
    matches!(v, Var::Dim(d) if graph.dim_rdom(*d).is_some())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn blur() -> (PipelineGraph, FuncId, FuncId) {
        let mut g = PipelineGraph::new();
        let input = g.add_input("in", 2, ScalarType::UInt(16));
        let f = g.add_func("f", &["x", "y"]);
        let (x, y) = (g.var(f, "x").unwrap(), g.var(f, "y").unwrap());
        g.define(f, vec![Expr::input(input, vec![x.clone() - 1, y.clone()]) + Expr::input(input, vec![x, y])]);
        let h = g.add_func("h", &["x", "y"]);
        let (x, y) = (g.var(h, "x").unwrap(), g.var(h, "y").unwrap());
        g.define(
            h,
            vec![Expr::call(f, vec![x.clone(), y.clone() - 1]) + Expr::call(f, vec![x, y + 1])],
        );
        (g, f, h)
    }

    #[test]
    fn validate_infers_types_through_calls() {
        let (g, f, h) = blur();
        let result = validate(&g, &[h]);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(result.value_types[&f], vec![ScalarType::UInt(16)]);
        assert_eq!(result.value_types[&h], vec![ScalarType::UInt(16)]);
    }

    #[test]
    fn topo_order_puts_producers_first() {
        let (g, f, h) = blur();
        let live = g.reachable(&[h]);
        assert_eq!(g.topo_order(&live), Ok(vec![f, h]));
        assert_eq!(g.consumers(f).into_iter().collect::<Vec<_>>(), vec![h]);
    }

    #[test]
    fn call_arity_mismatch_is_e0100() {
        let (mut g, f, _) = blur();
        let k = g.add_func("k", &["x"]);
        let x = g.var(k, "x").unwrap();
        g.define(k, vec![Expr::call(f, vec![x])]);
        let result = validate(&g, &[k]);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0100));
        assert_eq!(result.diagnostics[0].subject, Subject::func("k"));
    }

    #[test]
    fn foreign_dimension_is_e0103() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x]);
        let k = g.add_func("k", &["x"]);
        let fx = g.var(f, "x").unwrap();
        g.define(k, vec![fx]);
        let result = validate(&g, &[k]);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0103));
    }

    #[test]
    fn self_reading_pure_definition_is_e0107() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![Expr::call(f, vec![x - 1])]);
        let result = validate(&g, &[f]);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0107));
    }

    #[test]
    fn mixed_domains_is_e0104() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x]);
        let r = g.add_rdom("r", &[("x", 0, 4)]);
        let s = g.add_rdom("s", &[("x", 0, 4)]);
        let (rx, sx) = (g.rvar(r, "x").unwrap(), g.rvar(s, "x").unwrap());
        g.update(f, vec![rx.clone()], vec![Expr::call(f, vec![rx]) + sx]);
        let result = validate(&g, &[f]);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0104));
    }

    #[test]
    fn mismatched_update_type_is_e0101() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![Expr::cast(ScalarType::UInt(8), x.clone())]);
        g.update(f, vec![x.clone()], vec![Expr::cast(ScalarType::Int(16), x)]);
        let result = validate(&g, &[f]);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0101));
    }

    #[test]
    fn cycle_between_funcs_is_e0106() {
        let mut g = PipelineGraph::new();
        let a = g.add_func("a", &["x"]);
        let b = g.add_func("b", &["x"]);
        let xa = g.var(a, "x").unwrap();
        let xb = g.var(b, "x").unwrap();
        g.define(a, vec![Expr::call(b, vec![xa])]);
        g.define(b, vec![Expr::call(a, vec![xb])]);
        let result = validate(&g, &[a]);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0106));
    }

    #[test]
    fn rdom_predicate_is_shared_by_reference() {
        let mut g = PipelineGraph::new();
        let r = g.add_rdom("r", &[("x", 0, 10)]);
        let rx = g.rvar(r, "x").unwrap();
        g.rdom_where(r, rx.clone().lt(5));
        g.rdom_where(r, rx.gt(1));
        let p = g.rdom(r).predicate.as_ref().unwrap();
        assert_eq!(p.display(&g).to_string(), "(r.x < 5) && (r.x > 1)");
    }

    #[test]
    fn recursion_is_detected_on_updates() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![Expr::int(0)]);
        g.update(f, vec![x.clone()], vec![x.clone() + Expr::call(f, vec![x - 1])]);
        assert!(g.is_recursive(f));
        assert_eq!(g.stage_pure_vars(f, 1).len(), 1);
        assert!(validate(&g, &[f]).diagnostics.is_empty());
    }
}
