// bounds.rs — Bounds inference over the placed loop nest
//
// Funcs are visited consumers first. The region a Func must produce at its
// compute level is the union, over every call site in every consumer stage,
// of the call arguments' intervals with each loop symbol outside the compute
// level relaxed to its range; what remains is affine in the symbols of the
// loops enclosing the compute level. Recursive Funcs iterate to a fixed point
// under a growth budget. Each stage's loops then get concrete ranges, and
// every split or fused variable a reconstruction in terms of loop symbols.
//
// Preconditions: `placement` resolved without errors; inlined Funcs removed.
// Postconditions: every realized Func has a finite computed region covering
//                 its required region, and every loop symbol a range in the
//                 returned `SymTable`.
// Failure modes: unbounded region → E0200; recursive growth budget exceeded
//                → E0201; non-constant reduction bounds → E0202; explicit
//                bound smaller than a requirement → E0203; output box not
//                equal to its request → E0204.
// Side effects: `tracing::trace!` per recursive fixed-point iteration.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::{BinOp, BoundsEnv, Expr, Var};
use crate::graph::PipelineGraph;
use crate::id::{DimId, FuncId, InputId};
use crate::interval::{display_region, Bound, Interval, Linear, Region, SymTable};
use crate::options::{LowerOptions, Request};
use crate::placement::Placement;
use crate::schedule::{loop_sym, FuncSchedule, ScheduleModel, TailStrategy, Transform};

// ── Public types ────────────────────────────────────────────────────────────

/// Concrete iteration space of one loop. `min` and `extent` are expressions
/// in the symbols of the loops enclosing the stage's compute level.
#[derive(Debug, Clone, Serialize)]
pub struct LoopBound {
    pub var: String,
    pub sym: String,
    pub min: Expr,
    pub extent: Expr,
    pub range: Interval,
}

/// Effective completion of one split once bounds are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitTail {
    pub var: String,
    pub factor: i64,
    pub tail: TailStrategy,
    pub divides: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageBounds {
    pub stage: usize,
    /// Outermost first, matching the stage's schedule.
    pub loops: Vec<LoopBound>,
    /// Bindings rebuilding split and fused variables, in evaluation order.
    pub lets: Vec<(String, Expr)>,
    /// Conditions every store of the stage is predicated on.
    pub guards: Vec<Expr>,
    /// Range of every variable of the stage, original or derived.
    pub ranges: BTreeMap<String, Interval>,
    /// Value of every variable in terms of loop symbols.
    pub values: BTreeMap<String, Interval>,
    /// Variables held inside their range by a guard or a shifted tail.
    pub clipped: BTreeSet<String>,
    pub tails: Vec<SplitTail>,
}

impl StageBounds {
    pub fn loop_bound(&self, var: &str) -> Option<&LoopBound> {
        self.loops.iter().find(|l| l.var == var)
    }

    /// Interval of variable `name` over every loop not in `fixed`.
    pub fn site_value(&self, name: &str, table: &SymTable, fixed: &BTreeSet<String>) -> Interval {
        let Some(v) = self.values.get(name) else {
            return Interval::everything();
        };
        let relaxed = table.relax(v, fixed);
        match self.ranges.get(name) {
            Some(r) if self.clipped.contains(name) => relaxed.intersect(&table.relax(r, fixed), table),
            _ => relaxed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FuncBounds {
    pub func: FuncId,
    pub name: String,
    /// Union of consumer requirements and the output request.
    pub required: Region,
    /// Region produced each time the compute level is entered.
    pub computed: Region,
    pub stages: Vec<StageBounds>,
}

#[derive(Debug, Clone, Default)]
pub struct Bounds {
    pub funcs: BTreeMap<FuncId, FuncBounds>,
    /// Region of every pipeline input read, with all loops relaxed.
    pub inputs: BTreeMap<InputId, Region>,
    pub table: SymTable,
}

impl Bounds {
    pub fn get(&self, func: FuncId) -> Option<&FuncBounds> {
        self.funcs.get(&func)
    }
}

/// Result of bounds inference.
#[derive(Debug)]
pub struct BoundsResult {
    pub bounds: Bounds,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn infer_bounds(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    placement: &Placement,
    request: &Request,
    options: &LowerOptions,
) -> BoundsResult {
    let mut ctx = BoundsCtx {
        graph,
        schedule,
        placement,
        options,
        table: SymTable::new(),
        funcs: BTreeMap::new(),
        diagnostics: Vec::new(),
    };
    for &f in placement.order.iter().rev() {
        if !ctx.infer_func(f, request) {
            break;
        }
    }
    let inputs = if ctx.diagnostics.is_empty() {
        ctx.input_regions()
    } else {
        BTreeMap::new()
    };
    BoundsResult {
        bounds: Bounds {
            funcs: ctx.funcs,
            inputs,
            table: ctx.table,
        },
        diagnostics: ctx.diagnostics,
    }
}

// ── Interval environment ────────────────────────────────────────────────────

/// Variable ranges at one call site.
pub struct SiteEnv<'a> {
    pub graph: &'a PipelineGraph,
    pub table: &'a SymTable,
    pub vars: BTreeMap<DimId, Interval>,
}

impl SiteEnv<'_> {
    /// Ranges of every variable of stage `stage` of `func`, relaxed to `fixed`.
    pub fn for_stage<'a>(
        graph: &'a PipelineGraph,
        table: &'a SymTable,
        func: FuncId,
        stage: &StageBounds,
        fixed: &BTreeSet<String>,
    ) -> SiteEnv<'a> {
        let mut vars = BTreeMap::new();
        if let Some(def) = graph.func(func).definition(stage.stage) {
            let mut dims = def.dims();
            dims.extend(graph.func(func).args.iter().copied());
            if let Some(r) = graph.stage_rdom(func, stage.stage) {
                dims.extend(graph.rdom(r).vars.iter().map(|v| v.dim));
            }
            for d in dims {
                let name = &graph.dim(d).name;
                vars.insert(d, stage.site_value(name, table, fixed));
            }
        }
        SiteEnv { graph, table, vars }
    }
}

impl BoundsEnv for SiteEnv<'_> {
    fn var(&self, v: &Var) -> Interval {
        match v {
            Var::Dim(d) => self.vars.get(d).cloned().unwrap_or_else(Interval::everything),
            Var::Loop(s) => Interval::sym(s.clone()),
        }
    }

    fn table(&self) -> &SymTable {
        self.table
    }

    fn call_range(&self, func: FuncId, component: usize) -> Interval {
        self.graph
            .get_func(func)
            .and_then(|f| f.value_types.get(component))
            .map_or_else(Interval::everything, |t| t.range())
    }

    fn input_range(&self, input: InputId) -> Interval {
        self.graph.input(input).ty.range()
    }
}

/// Region of `callee` read by `exprs`, relaxed to `fixed`. `None` when no
/// expression reads it.
pub fn call_region<'e>(
    exprs: impl Iterator<Item = &'e Expr>,
    callee: FuncId,
    env: &SiteEnv<'_>,
    fixed: &BTreeSet<String>,
) -> Option<Region> {
    let mut out: Option<Region> = None;
    for e in exprs {
        for call in e.calls().into_iter().filter(|c| c.func == callee) {
            let region: Region = call
                .args
                .iter()
                .map(|a| env.table.relax(&a.bounds_of(env), fixed))
                .collect();
            out = Some(match out {
                None => region,
                Some(acc) => union_region(&acc, &region, env.table),
            });
        }
    }
    out
}

fn union_region(a: &Region, b: &Region, table: &SymTable) -> Region {
    a.iter().zip(b).map(|(x, y)| x.union(y, table)).collect()
}

fn ceil_div(a: i64, k: i64) -> i64 {
    (a + k - 1).div_euclid(k)
}

// ── Internal context ────────────────────────────────────────────────────────

struct BoundsCtx<'a> {
    graph: &'a PipelineGraph,
    schedule: &'a ScheduleModel,
    placement: &'a Placement,
    options: &'a LowerOptions,
    table: SymTable,
    funcs: BTreeMap<FuncId, FuncBounds>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> BoundsCtx<'a> {
    fn error(&mut self, code: crate::diag::DiagCode, subject: Subject, message: String) {
        self.diagnostics.push(Diagnostic::error(code, subject, message));
    }

    fn dim_names(&self, f: FuncId) -> Vec<String> {
        self.graph
            .func(f)
            .args
            .iter()
            .map(|d| self.graph.dim(*d).name.clone())
            .collect()
    }

    /// Returns false when inference cannot continue.
    fn infer_func(&mut self, f: FuncId, request: &Request) -> bool {
        let graph = self.graph;
        let func = graph.func(f);
        let Some(fp) = self.placement.get(f) else {
            return true;
        };
        let Some(fs) = self.schedule.get(&func.name) else {
            return true;
        };
        let fixed = fp.fixed();
        let names = self.dim_names(f);

        // Consumer requirements.
        let mut required: Option<Region> = None;
        if let Some(out) = request.get(&func.name) {
            required = Some(out.region.iter().map(|(m, e)| Interval::from_min_extent(*m, *e)).collect());
        }
        let mut consumer_regions = Vec::new();
        for c in graph.consumers(f) {
            let Some(cb) = self.funcs.get(&c) else { continue };
            for sb in &cb.stages {
                let Some(def) = graph.func(c).definition(sb.stage) else { continue };
                let env = SiteEnv::for_stage(graph, &self.table, c, sb, &fixed);
                if let Some(region) = call_region(def.exprs(), f, &env, &fixed) {
                    consumer_regions.push((graph.func(c).name.clone(), region));
                }
            }
        }
        for (_, region) in &consumer_regions {
            required = Some(match required {
                None => region.clone(),
                Some(acc) => union_region(&acc, region, &self.table),
            });
        }
        let Some(required) = required else {
            self.error(
                codes::E0200,
                Subject::func(&func.name),
                format!("'{}' is realized but nothing requires any of it", func.name),
            );
            return false;
        };

        // Explicit bounds are ground truth.
        let mut computed = required.clone();
        for (j, name) in names.iter().enumerate() {
            if let Some(b) = fs.bounds.get(name) {
                let interval = match b.min {
                    Some(min) => Interval::from_min_extent(min, b.extent),
                    None => match &required[j].min {
                        Bound::Finite(lo) => Interval::new(
                            Bound::Finite(lo.clone()),
                            Bound::Finite(lo.add_const(b.extent - 1)),
                        ),
                        _ => Interval::everything(),
                    },
                };
                for (consumer, region) in &consumer_regions {
                    if !self.covers(&interval, &region[j]) {
                        self.error(
                            codes::E0203,
                            Subject::dim(&func.name, name),
                            format!(
                                "bound {interval} of '{}' does not cover {} required by '{consumer}'",
                                func.name, region[j]
                            ),
                        );
                    }
                }
                computed[j] = interval;
            }
            if let Some(&(m, r)) = fs.align_bounds.get(name) {
                computed[j] = self.align(&computed[j], m, r);
            }
            if !computed[j].is_bounded() {
                self.error(
                    codes::E0200,
                    Subject::dim(&func.name, name),
                    format!(
                        "region of '{}' along '{name}' is unbounded: {}",
                        func.name, computed[j]
                    ),
                );
            }
        }
        if crate::diag::has_errors(&self.diagnostics) {
            return false;
        }

        let Some((computed, stages)) = self.realize(f, fs, computed, &fixed) else {
            return false;
        };
        if let Some(out) = request.get(&func.name) {
            let hull: Option<Vec<(i64, i64)>> = computed
                .iter()
                .map(|i| self.table.concretize(i).as_constant_range())
                .collect();
            let wanted: Vec<(i64, i64)> = out.region.iter().map(|&(m, e)| (m, m + e - 1)).collect();
            if hull.as_ref() != Some(&wanted) {
                let requested: Region = wanted.iter().map(|&(lo, hi)| Interval::range(lo, hi)).collect();
                self.error(
                    codes::E0204,
                    Subject::func(&func.name),
                    format!(
                        "output '{}' would compute {} but {} was requested",
                        func.name,
                        display_region(&computed),
                        display_region(&requested)
                    ),
                );
                return false;
            }
        }
        self.funcs.insert(
            f,
            FuncBounds {
                func: f,
                name: func.name.clone(),
                required,
                computed,
                stages,
            },
        );
        true
    }

    /// `inner ⊆ outer` with every symbol relaxed.
    fn covers(&self, outer: &Interval, inner: &Interval) -> bool {
        let table = &self.table;
        table.concretize(inner).is_subset_of(&table.concretize(outer), table)
    }

    /// Expand `interval` so its min is `r` mod `m` and its extent a multiple of `m`.
    fn align(&self, interval: &Interval, m: i64, r: i64) -> Interval {
        let Bound::Finite(lo) = &interval.min else {
            return interval.clone();
        };
        let min = match lo.add_const(-r).div_exact(m) {
            Some(q) => q.scale(m).add_const(r),
            None => match self.table.numeric(&interval.min, false) {
                Some(v) => Linear::constant((v - r).div_euclid(m) * m + r),
                None => return interval.clone(),
            },
        };
        let max_bound = Bound::Finite(min.clone());
        let aligned = Interval::new(max_bound, interval.max.clone());
        let Some(extent) = aligned
            .extent()
            .and_then(|e| e.as_constant())
            .or_else(|| aligned.max_extent(&self.table))
        else {
            return interval.clone();
        };
        let extent = ceil_div(extent.max(1), m) * m;
        Interval::new(
            Bound::Finite(min.clone()),
            Bound::Finite(min.add_const(extent - 1)),
        )
    }

    /// Fixed point of the computed region under update footprints, tail
    /// widening and (for recursive Funcs) self-reads.
    fn realize(
        &mut self,
        f: FuncId,
        fs: &FuncSchedule,
        start: Region,
        fixed: &BTreeSet<String>,
    ) -> Option<(Region, Vec<StageBounds>)> {
        let graph = self.graph;
        let func = graph.func(f);
        let names = self.dim_names(f);
        let recursive = graph.is_recursive(f);
        let is_output = self.placement.is_output(f);
        let initial: Vec<i64> = start
            .iter()
            .map(|i| i.max_extent(&self.table).unwrap_or(0))
            .collect();
        let mut region = start;
        for iteration in 0..=self.options.max_fixed_point_iterations {
            let mut stages = Vec::with_capacity(func.stage_count());
            for s in 0..func.stage_count() {
                stages.push(self.build_stage(f, s, &region)?);
            }
            let mut next = region.clone();

            // Rounded-up splits compute past the requested end. Outputs keep
            // their box; legality rejects the split instead.
            if let Some(pure) = stages.first().filter(|_| !is_output) {
                for (j, name) in names.iter().enumerate() {
                    let rounds_up = pure
                        .tails
                        .iter()
                        .any(|t| t.var == *name && t.tail == TailStrategy::RoundUp && !t.divides);
                    if !rounds_up || pure.clipped.contains(name) {
                        continue;
                    }
                    if let Some(v) = pure.values.get(name) {
                        let iterated = self.table.relax(v, fixed);
                        next[j] = next[j].union(&iterated, &self.table);
                    }
                }
            }

            for sb in stages.iter().skip(1) {
                let Some(def) = func.definition(sb.stage) else { continue };
                // Pure variables of an update iterate the region; past-the-end
                // iterations of a split are a tail error, not growth.
                let mut view = sb.clone();
                for (_, d) in graph.stage_pure_vars(f, sb.stage) {
                    view.clipped.insert(graph.dim(d).name.clone());
                }
                let env = SiteEnv::for_stage(graph, &self.table, f, &view, fixed);
                for (i, arg) in def.args.iter().enumerate() {
                    let footprint = self.table.relax(&arg.bounds_of(&env), fixed);
                    if fs.bounds.contains_key(&names[i]) {
                        if !self.covers(&region[i], &footprint) {
                            self.error(
                                codes::E0203,
                                Subject::dim(&func.name, &names[i]),
                                format!(
                                    "update {} of '{}' writes {footprint} outside its bound {}",
                                    sb.stage - 1,
                                    func.name,
                                    region[i]
                                ),
                            );
                            return None;
                        }
                        continue;
                    }
                    next[i] = next[i].union(&footprint, &self.table);
                }
                if recursive {
                    if let Some(reads) = call_region(def.exprs(), f, &env, fixed) {
                        for (i, read) in reads.iter().enumerate() {
                            // Reads along bounded dimensions are clamped at synthesis.
                            if !fs.bounds.contains_key(&names[i]) {
                                next[i] = next[i].union(read, &self.table);
                            }
                        }
                    }
                }
            }

            if next == region {
                return Some((region, stages));
            }
            tracing::trace!(
                func = %func.name,
                iteration,
                region = %display_region(&next),
                "region grew"
            );
            for (j, interval) in next.iter().enumerate() {
                let extent = interval.max_extent(&self.table);
                let grown = extent.map(|e| e.saturating_sub(initial[j]));
                let over = !grown.is_some_and(|g| g <= self.options.max_region_growth);
                if over {
                    let code = if recursive { codes::E0201 } else { codes::E0200 };
                    self.error(
                        code,
                        Subject::dim(&func.name, &names[j]),
                        format!(
                            "region of '{}' along '{}' grows without bound: {interval}",
                            func.name, names[j]
                        ),
                    );
                    return None;
                }
            }
            region = next;
        }
        self.error(
            if recursive { codes::E0201 } else { codes::E0200 },
            Subject::func(&func.name),
            format!(
                "region of '{}' did not converge within {} iterations: {}",
                func.name,
                self.options.max_fixed_point_iterations,
                display_region(&region)
            ),
        );
        None
    }

    /// Constant `[min, max]` of every reduction variable of a stage, tightened
    /// by predicate conjuncts of the form `rvar <op> constant`.
    fn rdom_ranges(&mut self, f: FuncId, stage: usize) -> Option<BTreeMap<String, Interval>> {
        let graph = self.graph;
        let mut out = BTreeMap::new();
        let Some(r) = graph.stage_rdom(f, stage) else {
            return Some(out);
        };
        let rdom = graph.rdom(r);
        let mut ranges: BTreeMap<DimId, (i64, i64)> = BTreeMap::new();
        for v in &rdom.vars {
            let name = &graph.dim(v.dim).name;
            match (v.min.simplify().as_const(), v.extent.simplify().as_const()) {
                (Some(min), Some(extent)) => {
                    ranges.insert(v.dim, (min, min + extent - 1));
                }
                _ => {
                    self.error(
                        codes::E0202,
                        Subject::dim(&graph.func(f).name, name),
                        format!(
                            "bounds of reduction variable '{name}' are not constants: min {}, extent {}",
                            v.min.display(graph),
                            v.extent.display(graph)
                        ),
                    );
                    return None;
                }
            }
        }
        if let Some(p) = &rdom.predicate {
            for c in conjuncts(p) {
                tighten(c, &mut ranges);
            }
        }
        for (d, (lo, hi)) in ranges {
            out.insert(graph.dim(d).name.clone(), Interval::range(lo, hi));
        }
        Some(out)
    }

    fn build_stage(
        &mut self,
        f: FuncId,
        s: usize,
        region: &Region,
    ) -> Option<StageBounds> {
        let graph = self.graph;
        let func = graph.func(f);
        let ss = self.schedule.get(&func.name)?.stage(s)?;
        let is_output = self.placement.is_output(f);
        let sym = |var: &str| loop_sym(&func.name, s, var);

        let mut ranges: BTreeMap<String, Interval> = BTreeMap::new();
        for (i, d) in graph.stage_pure_vars(f, s) {
            ranges.insert(graph.dim(d).name.clone(), region[i].clone());
        }
        if s > 0 {
            ranges.extend(self.rdom_ranges(f, s)?);
        }

        // Forward: ranges of derived variables.
        let mut extents: BTreeMap<String, Expr> = BTreeMap::new();
        let mut tails = Vec::new();
        for t in &ss.transforms {
            match t {
                Transform::Split {
                    old,
                    outer,
                    inner,
                    factor,
                    tail,
                } => {
                    let k = *factor;
                    let r = ranges.get(old).cloned().unwrap_or_else(Interval::everything);
                    let extent = r.extent();
                    let constant = extent.as_ref().and_then(Linear::as_constant);
                    let mut tail = tail.resolve(s > 0, is_output);
                    let shifts = matches!(tail, TailStrategy::ShiftInwards | TailStrategy::ShiftInwardsAndBlend);
                    if shifts && !constant.is_some_and(|e| e >= k) {
                        tail = TailStrategy::GuardWithIf;
                    }
                    let (count, count_expr) = match (constant, &extent) {
                        (Some(e), _) => (ceil_div(e, k), Expr::int(ceil_div(e, k))),
                        (None, Some(e)) => {
                            let Some(max) = r.max_extent(&self.table) else {
                                self.error(
                                    codes::E0200,
                                    Subject::dim(&func.name, old),
                                    format!("extent {e} of '{old}' in {}.s{s} has no upper bound", func.name),
                                );
                                return None;
                            };
                            let expr = (self.extent_expr(old, e, &extents) + (k - 1)) / k;
                            (ceil_div(max, k), expr)
                        }
                        (None, None) => {
                            self.error(
                                codes::E0200,
                                Subject::dim(&func.name, old),
                                format!("cannot split unbounded loop '{old}' of {}.s{s}", func.name),
                            );
                            return None;
                        }
                    };
                    ranges.insert(outer.clone(), Interval::range(0, count - 1));
                    ranges.insert(inner.clone(), Interval::range(0, k - 1));
                    extents.insert(outer.clone(), count_expr);
                    extents.insert(inner.clone(), Expr::int(k));
                    tails.push(SplitTail {
                        var: old.clone(),
                        factor: k,
                        tail,
                        divides: constant.is_some_and(|e| e % k == 0),
                    });
                }
                Transform::Fuse {
                    inner,
                    outer,
                    fused,
                } => {
                    let ri = ranges.get(inner).cloned().unwrap_or_else(Interval::everything);
                    let ro = ranges.get(outer).cloned().unwrap_or_else(Interval::everything);
                    let (Some(ei), Some(eo)) = (ri.extent(), ro.extent()) else {
                        self.error(
                            codes::E0200,
                            Subject::dim(&func.name, fused),
                            format!("cannot fuse unbounded loops of {}.s{s}", func.name),
                        );
                        return None;
                    };
                    let (Some(mi), Some(mo)) = (ri.max_extent(&self.table), ro.max_extent(&self.table)) else {
                        self.error(
                            codes::E0200,
                            Subject::dim(&func.name, fused),
                            format!("fused loop '{fused}' of {}.s{s} has no upper bound", func.name),
                        );
                        return None;
                    };
                    let max = mi * mo;
                    let expr = (self.extent_expr(inner, &ei, &extents) * self.extent_expr(outer, &eo, &extents)).simplify();
                    ranges.insert(fused.clone(), Interval::range(0, max - 1));
                    extents.insert(fused.clone(), expr);
                }
            }
        }

        // Loops.
        let mut loops = Vec::with_capacity(ss.dims.len());
        for d in &ss.dims {
            let range = ranges.get(&d.name).cloned().unwrap_or_else(Interval::everything);
            let (Bound::Finite(lo), Some(ext)) = (&range.min, range.extent()) else {
                self.error(
                    codes::E0200,
                    Subject::dim(&func.name, &d.name),
                    format!("loop '{}' of {}.s{s} is unbounded", d.name, func.name),
                );
                return None;
            };
            let extent = extents
                .get(&d.name)
                .cloned()
                .unwrap_or_else(|| Expr::from_linear(&ext));
            self.table.insert(sym(&d.name), range.clone());
            loops.push(LoopBound {
                var: d.name.clone(),
                sym: sym(&d.name),
                min: Expr::from_linear(lo),
                extent,
                range,
            });
        }

        // Backward: every variable in terms of loop symbols.
        let mut values: BTreeMap<String, Interval> =
            ss.dims.iter().map(|d| (d.name.clone(), Interval::sym(sym(&d.name)))).collect();
        let mut lets = Vec::new();
        let mut guards = Vec::new();
        let mut clipped = BTreeSet::new();
        let mut split_tails = tails.iter().rev();
        for t in ss.transforms.iter().rev() {
            match t {
                Transform::Split {
                    old,
                    outer,
                    inner,
                    factor,
                    ..
                } => {
                    let Some(info) = split_tails.next() else { continue };
                    let r = ranges.get(old).cloned().unwrap_or_else(Interval::everything);
                    let (Bound::Finite(lo), Bound::Finite(hi)) = (&r.min, &r.max) else {
                        continue;
                    };
                    let k = *factor;
                    let ov = values.get(outer).cloned().unwrap_or_else(|| Interval::sym(sym(outer)));
                    let iv = values.get(inner).cloned().unwrap_or_else(|| Interval::sym(sym(inner)));
                    let start = Interval::point(lo.clone()).add(&ov.scale(k));
                    let start_expr = Expr::from_linear(lo) + Expr::sym(sym(outer)) * k;
                    let shifts = matches!(info.tail, TailStrategy::ShiftInwards | TailStrategy::ShiftInwardsAndBlend);
                    let (base, base_expr) = if shifts && !info.divides {
                        let last = hi.add_const(1 - k);
                        (
                            start.min(&Interval::point(last.clone()), &self.table),
                            Expr::min(start_expr, Expr::from_linear(&last)),
                        )
                    } else {
                        (start, start_expr)
                    };
                    values.insert(old.clone(), base.add(&iv));
                    lets.push((sym(old), (base_expr + Expr::sym(sym(inner))).simplify()));
                    let guarded = matches!(info.tail, TailStrategy::GuardWithIf | TailStrategy::Predicate);
                    if guarded && !info.divides {
                        guards.push(Expr::sym(sym(old)).le(Expr::from_linear(hi)));
                        clipped.insert(old.clone());
                    }
                    // min(start, last) never leaves [lo, hi] once the extent covers a factor.
                    if shifts && !info.divides {
                        clipped.insert(old.clone());
                    }
                }
                Transform::Fuse {
                    inner,
                    outer,
                    fused,
                } => {
                    let ri = ranges.get(inner).cloned().unwrap_or_else(Interval::everything);
                    let ro = ranges.get(outer).cloned().unwrap_or_else(Interval::everything);
                    let (Some(ei), Bound::Finite(ilo), Bound::Finite(olo)) = (ri.extent(), &ri.min, &ro.min) else {
                        continue;
                    };
                    let fv = values.get(fused).cloned().unwrap_or_else(|| Interval::sym(sym(fused)));
                    let ei_expr = self.extent_expr(inner, &ei, &extents);
                    let (inner_off, outer_off) = match ei.as_constant() {
                        Some(k) => (fv.mod_const(k, &self.table), fv.div_const(k, &self.table)),
                        None => {
                            let e = Interval::new(Bound::constant(1), Bound::Finite(ei.clone()));
                            (fv.modulo(&e, &self.table), fv.div(&e, &self.table))
                        }
                    };
                    values.insert(inner.clone(), Interval::point(ilo.clone()).add(&inner_off));
                    values.insert(outer.clone(), Interval::point(olo.clone()).add(&outer_off));
                    let f_sym = Expr::sym(sym(fused));
                    lets.push((sym(inner), (Expr::from_linear(ilo) + f_sym.clone() % ei_expr.clone()).simplify()));
                    lets.push((sym(outer), (Expr::from_linear(olo) + f_sym / ei_expr).simplify()));
                }
            }
        }

        if s > 0 {
            if let Some(p) = graph.stage_rdom(f, s).and_then(|r| graph.rdom(r).predicate.clone()) {
                guards.push(p.substitute(&|v| match v {
                    Var::Dim(d) => Some(Expr::sym(sym(&graph.dim(*d).name))),
                    Var::Loop(_) => None,
                }));
            }
        }

        Some(StageBounds {
            stage: s,
            loops,
            lets,
            guards,
            ranges,
            values,
            clipped,
            tails,
        })
    }

    /// Emitted extent of `var`: the recorded expression for derived loops,
    /// otherwise the affine extent of its range.
    fn extent_expr(&self, var: &str, extent: &Linear, extents: &BTreeMap<String, Expr>) -> Expr {
        extents
            .get(var)
            .cloned()
            .unwrap_or_else(|| Expr::from_linear(extent))
    }

    fn input_regions(&self) -> BTreeMap<InputId, Region> {
        let graph = self.graph;
        let none = BTreeSet::new();
        let mut out: BTreeMap<InputId, Region> = BTreeMap::new();
        for (f, fb) in &self.funcs {
            for sb in &fb.stages {
                let Some(def) = graph.func(*f).definition(sb.stage) else { continue };
                let env = SiteEnv::for_stage(graph, &self.table, *f, sb, &none);
                let mut loads = Vec::new();
                for e in def.exprs() {
                    e.visit(&mut |n| {
                        if let Expr::Input { input, args } = n {
                            loads.push((*input, args.clone()));
                        }
                    });
                }
                for (input, args) in loads {
                    let region: Region = args
                        .iter()
                        .map(|a| self.table.concretize(&a.bounds_of(&env)))
                        .collect();
                    let merged = match out.remove(&input) {
                        Some(acc) => union_region(&acc, &region, &self.table),
                        None => region,
                    };
                    out.insert(input, merged);
                }
            }
        }
        out
    }
}

fn conjuncts(e: &Expr) -> Vec<&Expr> {
    match e {
        Expr::Binary(BinOp::And, a, b) => {
            let mut out = conjuncts(a);
            out.extend(conjuncts(b));
            out
        }
        other => vec![other],
    }
}

fn tighten(c: &Expr, ranges: &mut BTreeMap<DimId, (i64, i64)>) {
    let Expr::Binary(op, a, b) = c else { return };
    let (d, k, op) = match (a.as_dim(), b.as_const(), b.as_dim(), a.as_const()) {
        (Some(d), Some(k), _, _) => (d, k, *op),
        (_, _, Some(d), Some(k)) => {
            let flipped = match op {
                BinOp::Lt => BinOp::Gt,
                BinOp::Le => BinOp::Ge,
                BinOp::Gt => BinOp::Lt,
                BinOp::Ge => BinOp::Le,
                other => *other,
            };
            (d, k, flipped)
        }
        _ => return,
    };
    let Some((lo, hi)) = ranges.get_mut(&d) else { return };
    match op {
        BinOp::Lt => *hi = (*hi).min(k - 1),
        BinOp::Le => *hi = (*hi).min(k),
        BinOp::Gt => *lo = (*lo).max(k + 1),
        BinOp::Ge => *lo = (*lo).max(k),
        BinOp::Eq => {
            *lo = (*lo).max(k);
            *hi = (*hi).min(k);
        }
        _ => {}
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
