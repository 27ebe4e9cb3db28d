// legality.rs — Static schedule legality checks
//
// Three entry points, run at different points of lowering:
//   check_schedule  — directives alone (before placement)
//   check_placement — loop-nest paths of every realized Func
//   check_bounded   — rules that need concrete regions and loop extents
//
// Preconditions: default placement resolved; for the later checks, the
//                artifacts of the corresponding passes.
// Postconditions: an empty error list means the schedule is legal under the
//                 rules checked by that entry point.
// Failure modes: none; every violation is reported as a diagnostic naming
//                the Func, the dimension and the rule.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::bounds::Bounds;
use crate::diag::{codes, DiagCode, Diagnostic, Subject};
use crate::expr::{Expr, Var};
use crate::graph::PipelineGraph;
use crate::id::{DimId, FuncId};
use crate::interval::Bound;
use crate::options::LowerOptions;
use crate::placement::{is_prefix, Placement};
use crate::schedule::{
    FuncSchedule, ForKind, LoopLevel, ScheduleModel, StageSchedule, TailStrategy, Transform,
};

// ── Shared helpers ──────────────────────────────────────────────────────────

struct Checker {
    diagnostics: Vec<Diagnostic>,
}

impl Checker {
    fn new() -> Self {
        Checker {
            diagnostics: Vec::new(),
        }
    }

    fn error(&mut self, code: DiagCode, subject: Subject, message: String) {
        self.diagnostics.push(Diagnostic::error(code, subject, message));
    }

    fn warning(&mut self, code: DiagCode, subject: Subject, message: String) {
        self.diagnostics.push(Diagnostic::warning(code, subject, message));
    }
}

/// Name → dimension id for every variable a stage can mention.
fn stage_dims(graph: &PipelineGraph, f: FuncId, stage: usize) -> BTreeMap<String, DimId> {
    let mut out: BTreeMap<String, DimId> = graph
        .func(f)
        .args
        .iter()
        .map(|d| (graph.dim(*d).name.clone(), *d))
        .collect();
    if let Some(r) = graph.stage_rdom(f, stage) {
        out.extend(graph.rdom(r).vars.iter().map(|v| (graph.dim(v.dim).name.clone(), v.dim)));
    }
    out
}

/// `b - a` when it is a constant.
fn constant_difference(a: &Expr, b: &Expr) -> Option<i64> {
    let sym = |v: &Var| match v {
        Var::Dim(d) => Some(format!("#{}", d.0)),
        Var::Loop(s) => Some(s.clone()),
    };
    b.to_linear(&sym)?.sub(&a.to_linear(&sym)?).as_constant()
}

/// Argument lists of every read of `f` by its own definition `stage`.
fn self_reads(graph: &PipelineGraph, f: FuncId, stage: usize) -> Vec<Vec<Expr>> {
    graph
        .func(f)
        .definition(stage)
        .map(|d| {
            d.exprs()
                .flat_map(|e| {
                    e.calls()
                        .into_iter()
                        .filter(|c| c.func == f)
                        .map(|c| c.args.to_vec())
                        .collect::<Vec<_>>()
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Variables along which some self-read of an update differs from the
/// location it writes: the recursion's dependency dimensions.
fn recursive_vars(graph: &PipelineGraph, f: FuncId, stage: usize) -> BTreeSet<String> {
    let Some(def) = graph.func(f).definition(stage) else {
        return BTreeSet::new();
    };
    let mut out = BTreeSet::new();
    for read in self_reads(graph, f, stage) {
        for (lhs, arg) in def.args.iter().zip(&read) {
            if lhs != arg {
                out.extend(lhs.dims().into_iter().map(|d| graph.dim(d).name.clone()));
            }
        }
    }
    out
}

// ── Schedule-only checks ────────────────────────────────────────────────────

/// Check every directive that can be judged without loop-nest paths or bounds.
pub fn check_schedule(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    outputs: &[FuncId],
    options: &LowerOptions,
) -> Vec<Diagnostic> {
    let mut c = Checker::new();
    let live = graph.reachable(outputs);
    for &f in &live {
        let func = graph.func(f);
        let Some(fs) = schedule.get(&func.name) else { continue };
        let is_output = outputs.contains(&f);
        check_levels(&mut c, schedule, fs);
        check_placement_directives(&mut c, graph, f, fs, is_output);
        if fs.compute.is_inline() && !is_output {
            continue;
        }
        for ss in &fs.stages {
            check_tails(&mut c, fs, ss);
            if ss.stage == 0 {
                continue;
            }
            check_rvar_order(&mut c, ss);
            if !ss.allow_race {
                check_races(&mut c, graph, f, ss);
            }
            if graph.is_recursive(f) {
                check_recursive(&mut c, graph, f, ss);
            }
        }
        if options.warn_partial_schedules && fs.stages.len() > 2 {
            let touched = fs.stages[1..].iter().filter(|s| s.touched).count();
            if touched > 0 && touched < fs.stages.len() - 1 {
                for ss in fs.stages[1..].iter().filter(|s| !s.touched) {
                    c.warning(
                        codes::W0300,
                        Subject::func(&fs.name),
                        format!(
                            "update {} of '{}' keeps the default schedule while other updates were scheduled",
                            ss.stage - 1,
                            fs.name
                        ),
                    );
                }
            }
        }
    }
    c.diagnostics
}

fn check_levels(c: &mut Checker, schedule: &ScheduleModel, fs: &FuncSchedule) {
    let levels = [
        ("compute_at", Some(&fs.compute)),
        ("store_at", fs.store.as_ref()),
        ("hoist_storage", fs.hoist.as_ref()),
    ];
    for (what, level) in levels {
        let Some(LoopLevel::At { func, stage, var }) = level else { continue };
        if let Some(why) = undefined_loop(schedule, &fs.name, func, *stage, var) {
            c.error(
                codes::E0308,
                Subject::func(&fs.name),
                format!("{what} of '{}' names {func}.s{stage}.{var}, which {why}", fs.name),
            );
        }
    }
    for ss in &fs.stages {
        let Some(t) = &ss.compute_with else { continue };
        if let Some(why) = undefined_loop(schedule, &fs.name, &t.func, t.stage, &t.var) {
            c.error(
                codes::E0308,
                Subject::func(&fs.name),
                format!(
                    "compute_with of {}.s{} names {}.s{}.{}, which {why}",
                    fs.name, ss.stage, t.func, t.stage, t.var
                ),
            );
        }
    }
}

fn undefined_loop(schedule: &ScheduleModel, me: &str, func: &str, stage: usize, var: &str) -> Option<&'static str> {
    if func == me {
        return Some("is one of its own loops");
    }
    let Some(target) = schedule.get(func) else {
        return Some("does not exist");
    };
    let Some(ss) = target.stage(stage) else {
        return Some("is not a stage of that func");
    };
    if ss.dim(var).is_none() {
        return Some("is not a loop of that stage");
    }
    if target.compute.is_inline() {
        return Some("belongs to an inlined func");
    }
    None
}

fn check_placement_directives(c: &mut Checker, graph: &PipelineGraph, f: FuncId, fs: &FuncSchedule, is_output: bool) {
    let name = &fs.name;
    let subject = || Subject::func(name);
    if is_output && fs.compute != LoopLevel::Root {
        c.error(
            codes::E0312,
            subject(),
            format!("output '{name}' must be computed at root, not {}", fs.compute),
        );
    }
    if fs.compute.is_inline() && !is_output {
        if fs.store.is_some() {
            c.error(
                codes::E0301,
                subject(),
                format!("'{name}' is inlined, so store_at has nothing to store"),
            );
        }
        if fs.hoist.is_some() {
            c.error(
                codes::E0310,
                subject(),
                format!("'{name}' is inlined, so hoist_storage has nothing to hoist"),
            );
        }
        if !graph.func(f).updates.is_empty() {
            c.error(
                codes::E0302,
                subject(),
                format!("'{name}' has update definitions and cannot be inlined"),
            );
        }
        if let Some(ss) = fs.stages.iter().find(|s| s.touched || !s.transforms.is_empty()) {
            c.error(
                codes::E0302,
                subject(),
                format!("'{name}' is inlined but {name}.s{} carries loop directives", ss.stage),
            );
        }
    }
    if fs.ring_buffer.is_some() && fs.hoist.is_none() {
        c.error(
            codes::E0314,
            subject(),
            format!("ring_buffer on '{name}' requires hoist_storage"),
        );
    }
    if fs.memoize.is_some() {
        if is_output {
            c.error(
                codes::E0315,
                subject(),
                format!("output '{name}' cannot be memoized"),
            );
        } else if fs.store.as_ref().is_some_and(|s| *s != fs.compute) {
            c.error(
                codes::E0315,
                subject(),
                format!("memoized '{name}' must be stored where it is computed"),
            );
        }
    }
}

fn check_tails(c: &mut Checker, fs: &FuncSchedule, ss: &StageSchedule) {
    for t in &ss.transforms {
        let Transform::Split { outer, tail, .. } = t else { continue };
        let concurrent = ss.dim(outer).is_some_and(|d| d.kind.is_concurrent());
        if *tail == TailStrategy::ShiftInwardsAndBlend && concurrent {
            c.error(
                codes::E0303,
                Subject::dim(&fs.name, outer),
                format!(
                    "'{outer}' of {}.s{} blends overlapping iterations and cannot run concurrently",
                    fs.name, ss.stage
                ),
            );
        }
    }
}

/// Reduction loops must nest in their declared order.
fn check_rvar_order(c: &mut Checker, ss: &StageSchedule) {
    let n = ss.rvars.len();
    let key = |var: &str| {
        let rank = ss
            .roots(var)
            .iter()
            .filter_map(|r| ss.rvars.iter().position(|x| x == r))
            .map(|i| n - 1 - i)
            .min()
            .unwrap_or(0);
        (rank, ss.split_path(var))
    };
    let loops: Vec<&str> = ss.dims.iter().filter(|d| d.rvar).map(|d| d.name.as_str()).collect();
    for pair in loops.windows(2) {
        if key(pair[0]) > key(pair[1]) {
            c.error(
                codes::E0306,
                Subject::dim(&ss.func, pair[0]),
                format!(
                    "reduction loop '{}' of {}.s{} is reordered inside '{}'",
                    pair[1], ss.func, ss.stage, pair[0]
                ),
            );
            return;
        }
    }
}

fn check_races(c: &mut Checker, graph: &PipelineGraph, f: FuncId, ss: &StageSchedule) {
    let Some(def) = graph.func(f).definition(ss.stage) else { return };
    let dims = stage_dims(graph, f, ss.stage);
    let reads = self_reads(graph, f, ss.stage);
    for d in ss.dims.iter().filter(|d| d.kind.is_concurrent()) {
        for root in ss.roots(&d.name) {
            let Some(&dim) = dims.get(&root) else { continue };
            let v = Var::Dim(dim);
            let is_rvar = ss.rvars.contains(&root);
            if is_rvar && !ss.atomic {
                let injective = def.args.iter().any(|a| a.affine_in(&v).is_some_and(|k| k != 0));
                if !injective {
                    c.error(
                        codes::E0303,
                        Subject::dim(&ss.func, &d.name),
                        format!(
                            "{} loop '{}' of {}.s{}: distinct iterations write the same location",
                            d.kind, d.name, ss.func, ss.stage
                        ),
                    );
                    continue;
                }
            }
            for read in &reads {
                for (lhs, arg) in def.args.iter().zip(read) {
                    if !(lhs.mentions(&v) || arg.mentions(&v)) || lhs == arg {
                        continue;
                    }
                    let (code, why) = match constant_difference(lhs, arg) {
                        Some(k) if k != 0 => (codes::E0307, format!("each iteration reads the value written {} iteration(s) away", k.abs())),
                        Some(_) => continue,
                        None => (codes::E0303, "iterations read locations other iterations write".to_string()),
                    };
                    c.error(
                        code,
                        Subject::dim(&ss.func, &d.name),
                        format!("{} loop '{}' of {}.s{}: {why}", d.kind, d.name, ss.func, ss.stage),
                    );
                    return;
                }
            }
        }
    }
}

/// Splits along a recursion's dependency dimension must keep traversal order.
fn check_recursive(c: &mut Checker, graph: &PipelineGraph, f: FuncId, ss: &StageSchedule) {
    let rec = recursive_vars(graph, f, ss.stage);
    if rec.is_empty() {
        return;
    }
    let position = |v: &str| ss.dims.iter().position(|d| d.name == v);
    for t in &ss.transforms {
        let Transform::Split {
            old,
            outer,
            inner,
            tail,
            ..
        } = t
        else {
            continue;
        };
        if ss.roots(old).is_disjoint(&rec) {
            continue;
        }
        if matches!(tail, TailStrategy::ShiftInwards | TailStrategy::ShiftInwardsAndBlend) {
            c.error(
                codes::E0307,
                Subject::dim(&ss.func, old),
                format!(
                    "'{old}' of {}.s{} carries a recursive dependency; shifting its tail recomputes out of order",
                    ss.func, ss.stage
                ),
            );
        }
        if let (Some(o), Some(i)) = (position(outer), position(inner)) {
            if i < o {
                c.error(
                    codes::E0307,
                    Subject::dim(&ss.func, old),
                    format!(
                        "'{inner}' is outside '{outer}' in {}.s{}, reversing the recursive traversal of '{old}'",
                        ss.func, ss.stage
                    ),
                );
            }
        }
    }
}

// ── Placement checks ────────────────────────────────────────────────────────

/// Placement ordering, use coverage and concurrent-loop placement.
pub fn check_placement(graph: &PipelineGraph, placement: &Placement) -> Vec<Diagnostic> {
    let mut c = Checker::new();
    for (&f, fp) in &placement.funcs {
        let name = &fp.name;
        if !is_prefix(&fp.store_path, &fp.compute_path) {
            let (code, why) = if is_prefix(&fp.compute_path, &fp.store_path) {
                (codes::E0300, "inside")
            } else {
                (codes::E0301, "outside the loops of")
            };
            c.error(
                code,
                Subject::func(name),
                format!(
                    "'{name}' is stored at {} but computed at {}, {why} its storage",
                    fp.store, fp.compute
                ),
            );
        }
        if !is_prefix(&fp.hoist_path, &fp.store_path) {
            let (code, why) = if is_prefix(&fp.store_path, &fp.hoist_path) {
                (codes::E0300, "deeper than")
            } else {
                (codes::E0310, "not around")
            };
            c.error(
                code,
                Subject::func(name),
                format!(
                    "storage of '{name}' is hoisted to {}, {why} its store level {}",
                    fp.hoist, fp.store
                ),
            );
        }
        for l in fp.compute_path.iter().skip(fp.store_path.len()) {
            if is_prefix(&fp.store_path, &fp.compute_path) && l.kind.is_threaded() {
                c.error(
                    codes::E0303,
                    Subject::dim(name, &l.var),
                    format!(
                        "{} loop {} runs between the storage and computation of '{name}'",
                        l.kind, l.sym
                    ),
                );
            }
        }
        for consumer in graph.consumers(f) {
            let Some(cp) = placement.get(consumer) else { continue };
            for s in 0..graph.func(consumer).stage_count() {
                let reads = graph
                    .func(consumer)
                    .definition(s)
                    .is_some_and(|d| d.exprs().any(|e| e.calls_func(f)));
                if reads && !is_prefix(&fp.compute_path, &cp.stage_path(s)) {
                    c.error(
                        codes::E0311,
                        Subject::func(name),
                        format!(
                            "'{name}' is computed at {}, which does not enclose its use in {}.s{s}",
                            fp.compute, cp.name
                        ),
                    );
                }
            }
        }
        for s in 0..fp.stage_loops.len() {
            let path = fp.stage_path(s);
            for (i, l) in path.iter().enumerate() {
                if l.kind == ForKind::GpuThread && !path[..i].iter().any(|o| o.kind == ForKind::GpuBlock) {
                    c.error(
                        codes::E0317,
                        Subject::dim(name, &l.var),
                        format!("gpu thread loop {} of {name}.s{s} is not inside a gpu block loop", l.sym),
                    );
                }
            }
        }
    }
    c.diagnostics
}

// ── Bounds-dependent checks ─────────────────────────────────────────────────

/// Folds, split tails, and constant extents of unrolled and vectorized loops.
pub fn check_bounded(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    placement: &Placement,
    bounds: &Bounds,
) -> Vec<Diagnostic> {
    let mut c = Checker::new();
    for (&f, fb) in &bounds.funcs {
        let Some(fs) = schedule.get(&fb.name) else { continue };
        let Some(fp) = placement.get(f) else { continue };
        let name = &fb.name;

        for (dim, &m) in &fs.folds {
            let Some(j) = fs.args.iter().position(|a| a == dim) else { continue };
            let Some(interval) = fb.computed.get(j) else { continue };
            let extent = interval.extent().and_then(|e| e.as_constant());
            match extent {
                Some(e) if e <= m => {}
                Some(e) => c.error(
                    codes::E0304,
                    Subject::dim(name, dim),
                    format!("'{name}' folds '{dim}' by {m} but {e} values of it are live at once"),
                ),
                None => c.error(
                    codes::E0304,
                    Subject::dim(name, dim),
                    format!("live extent {interval} of '{name}' along '{dim}' is not a constant, so it cannot fold by {m}"),
                ),
            }
            // The folded dimension must advance in one direction.
            let Bound::Finite(min) = &interval.min else { continue };
            let between = fp.compute_path.iter().skip(fp.store_path.len());
            let signs: BTreeSet<bool> = between
                .map(|l| min.coeff(&l.sym))
                .filter(|k| *k != 0)
                .map(|k| k > 0)
                .collect();
            if signs.len() > 1 {
                c.error(
                    codes::E0304,
                    Subject::dim(name, dim),
                    format!("'{dim}' of '{name}' does not move monotonically, so it cannot be folded"),
                );
            }
        }

        let is_output = placement.is_output(f);
        for sb in &fb.stages {
            for t in sb.tails.iter().filter(|t| !t.divides) {
                let bad = match t.tail {
                    TailStrategy::RoundUp | TailStrategy::ShiftInwards | TailStrategy::ShiftInwardsAndBlend => {
                        sb.stage > 0 || (is_output && t.tail == TailStrategy::RoundUp)
                    }
                    _ => false,
                };
                if bad {
                    let what = if sb.stage > 0 { "an update stage" } else { "an output" };
                    c.error(
                        codes::E0313,
                        Subject::dim(name, &t.var),
                        format!(
                            "split of '{}' by {} in {name}.s{} does not divide its extent; {:?} would write outside {what}",
                            t.var, t.factor, sb.stage, t.tail
                        ),
                    );
                }
            }
            let Some(ss) = fs.stage(sb.stage) else { continue };
            for lb in &sb.loops {
                let Some(d) = ss.dim(&lb.var) else { continue };
                let needs_constant = matches!(d.kind, ForKind::Vectorized | ForKind::Unrolled);
                if needs_constant && lb.extent.simplify().as_const().is_none() {
                    c.error(
                        codes::E0317,
                        Subject::dim(name, &lb.var),
                        format!(
                            "{} loop '{}' of {name}.s{} has non-constant extent {}",
                            d.kind,
                            lb.var,
                            sb.stage,
                            lb.extent.display(graph)
                        ),
                    );
                }
            }
        }
    }
    c.diagnostics
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::infer_bounds;
    use crate::options::Request;
    use crate::placement::place;

    fn codes_of(diags: &[Diagnostic]) -> Vec<DiagCode> {
        diags.iter().filter_map(|d| d.code).collect()
    }

    /// h(x, y) = f(x, y - 1) + f(x, y + 1)
    fn stencil() -> (PipelineGraph, FuncId) {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x", "y"]);
        let (x, y) = (g.var(f, "x").unwrap(), g.var(f, "y").unwrap());
        g.define(f, vec![x + y]);
        let h = g.add_func("h", &["x", "y"]);
        let (x, y) = (g.var(h, "x").unwrap(), g.var(h, "y").unwrap());
        g.define(
            h,
            vec![Expr::call(f, vec![x.clone(), y.clone() - 1]) + Expr::call(f, vec![x, y + 1])],
        );
        (g, h)
    }

    fn resolved(g: &PipelineGraph, s: &mut ScheduleModel, out: &str) {
        s.resolve_default_placement(g, &[out.to_string()]);
    }

    #[test]
    fn swapped_reduction_write_is_a_race() {
        // f(r.x, r.y) = f(r.y, r.x) + 1, parallel over r.y
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x", "y"]);
        let (x, y) = (g.var(f, "x").unwrap(), g.var(f, "y").unwrap());
        g.define(f, vec![x + y]);
        let r = g.add_rdom("r", &[("x", 0, 10), ("y", 0, 10)]);
        let (rx, ry) = (g.rvar(r, "x").unwrap(), g.rvar(r, "y").unwrap());
        g.update(
            f,
            vec![rx.clone(), ry.clone()],
            vec![Expr::call(f, vec![ry, rx]) + 1],
        );
        let mut s = ScheduleModel::new(&g);
        s.stage_mut("f", 1).unwrap().parallel("r.y").unwrap();
        resolved(&g, &mut s, "f");
        let diags = check_schedule(&g, &s, &[f], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::E0303]);

        let mut s = ScheduleModel::new(&g);
        s.stage_mut("f", 1).unwrap().parallel("r.y").unwrap().allow_race_conditions().unwrap();
        resolved(&g, &mut s, "f");
        assert!(check_schedule(&g, &s, &[f], &LowerOptions::default()).is_empty());
    }

    #[test]
    fn parallel_scan_is_recursive_restriction() {
        // f(x) = f(x - 1) + x over an rdom, parallel over r.x
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        g.define(f, vec![Expr::int(0)]);
        let r = g.add_rdom("r", &[("x", 1, 10)]);
        let rx = g.rvar(r, "x").unwrap();
        g.update(f, vec![rx.clone()], vec![Expr::call(f, vec![rx.clone() - 1]) + rx]);
        let mut s = ScheduleModel::new(&g);
        s.stage_mut("f", 1).unwrap().parallel("r.x").unwrap();
        resolved(&g, &mut s, "f");
        let diags = check_schedule(&g, &s, &[f], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::E0307]);
    }

    #[test]
    fn reduction_loops_keep_declared_order() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        g.define(f, vec![Expr::int(0)]);
        let r = g.add_rdom("r", &[("x", 0, 4), ("y", 0, 4)]);
        let (rx, ry) = (g.rvar(r, "x").unwrap(), g.rvar(r, "y").unwrap());
        g.update(f, vec![Expr::int(0)], vec![Expr::call(f, vec![Expr::int(0)]) + rx * ry]);
        let mut s = ScheduleModel::new(&g);
        s.stage_mut("f", 1).unwrap().reorder(&["r.x", "r.y"]).unwrap();
        resolved(&g, &mut s, "f");
        let diags = check_schedule(&g, &s, &[f], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::E0306]);
    }

    #[test]
    fn output_must_be_root_and_not_memoized() {
        let (g, h) = stencil();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("h").unwrap().memoize().unwrap();
        resolved(&g, &mut s, "h");
        let diags = check_schedule(&g, &s, &[h], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::E0315]);
    }

    #[test]
    fn inline_func_with_store_at() {
        let (g, h) = stencil();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().store_root().unwrap();
        resolved(&g, &mut s, "h");
        let diags = check_schedule(&g, &s, &[h], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::E0301]);
    }

    #[test]
    fn ring_buffer_needs_hoist() {
        let (g, h) = stencil();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().compute_root().unwrap().ring_buffer(2).unwrap();
        resolved(&g, &mut s, "h");
        let diags = check_schedule(&g, &s, &[h], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::E0314]);
    }

    #[test]
    fn store_inside_compute_is_inversion() {
        let (g, h) = stencil();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f")
            .unwrap()
            .compute_root()
            .unwrap()
            .store_at(LoopLevel::at("h", "y"))
            .unwrap();
        resolved(&g, &mut s, "h");
        let placed = place(&g, &s, &[h]);
        let diags = check_placement(&g, &placed.placement);
        assert_eq!(codes_of(&diags), vec![codes::E0300]);
    }

    #[test]
    fn parallel_between_store_and_compute_is_a_race() {
        let (g, h) = stencil();
        let mut s = ScheduleModel::new(&g);
        s.stage_mut("h", 0).unwrap().parallel("y").unwrap();
        s.func_mut("f")
            .unwrap()
            .compute_at(LoopLevel::at("h", "x"))
            .unwrap()
            .store_root()
            .unwrap();
        resolved(&g, &mut s, "h");
        let placed = place(&g, &s, &[h]);
        let diags = check_placement(&g, &placed.placement);
        assert_eq!(codes_of(&diags), vec![codes::E0303]);
    }

    #[test]
    fn fold_smaller_than_stencil_is_invalid() {
        let (g, h) = stencil();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f")
            .unwrap()
            .compute_at(LoopLevel::at("h", "y"))
            .unwrap()
            .store_root()
            .unwrap()
            .fold_storage("y", 2)
            .unwrap();
        resolved(&g, &mut s, "h");
        let placed = place(&g, &s, &[h]);
        assert!(check_placement(&g, &placed.placement).is_empty());
        let req = Request::new().output("h", &[(0, 8), (0, 8)]);
        let b = infer_bounds(&g, &s, &placed.placement, &req, &LowerOptions::default());
        let diags = check_bounded(&g, &s, &placed.placement, &b.bounds);
        assert_eq!(codes_of(&diags), vec![codes::E0304]);
    }

    #[test]
    fn round_up_on_update_is_rejected() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x.clone()]);
        g.update(f, vec![x.clone()], vec![Expr::call(f, vec![x]) * 2]);
        let mut s = ScheduleModel::new(&g);
        s.stage_mut("f", 1)
            .unwrap()
            .split("x", "xo", "xi", 4, TailStrategy::RoundUp)
            .unwrap();
        resolved(&g, &mut s, "f");
        let placed = place(&g, &s, &[f]);
        let req = Request::new().output("f", &[(0, 10)]);
        let b = infer_bounds(&g, &s, &placed.placement, &req, &LowerOptions::default());
        let diags = check_bounded(&g, &s, &placed.placement, &b.bounds);
        assert_eq!(codes_of(&diags), vec![codes::E0313]);
    }

    #[test]
    fn partially_scheduled_updates_warn() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x.clone()]);
        g.update(f, vec![x.clone()], vec![Expr::call(f, vec![x.clone()]) + 1]);
        g.update(f, vec![x.clone()], vec![Expr::call(f, vec![x]) * 2]);
        let mut s = ScheduleModel::new(&g);
        s.stage_mut("f", 1).unwrap().vectorize_by("x", 4).unwrap();
        resolved(&g, &mut s, "f");
        let diags = check_schedule(&g, &s, &[f], &LowerOptions::default());
        assert_eq!(codes_of(&diags), vec![codes::W0300]);
        assert!(!diags[0].is_error());
    }
}
