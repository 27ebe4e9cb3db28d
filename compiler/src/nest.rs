// nest.rs — Loop-nest synthesis
//
// Builds the statement tree from the placed, bounded schedule. Each site (the
// pipeline root or the body of one loop) holds, in order: the work computed
// there (`fuse::site_items`), then the rest of the enclosing stage's nest;
// allocations opening at the site wrap the whole body. A stage's innermost
// body binds derived variables (`Let`), applies its guards (`If`) and stores.
//
// Preconditions: bounds, fuse plan and storage plan computed without errors.
// Postconditions: every realized stage appears exactly once; every variable
//                 is expressed through loop symbols.
// Failure modes: unbounded fused loop → E0200; emission-order violations
//                → E0305 (already reported by `fuse`).
// Side effects: none.

use crate::bounds::Bounds;
use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::{Expr, Var};
use crate::fuse::{site_items, FuseGroup, FusePlan, SiteItem, StageKey};
use crate::graph::PipelineGraph;
use crate::id::FuncId;
use crate::interval::Bound;
use crate::lir::Stmt;
use crate::placement::{Placement, SiteKey};
use crate::schedule::{loop_sym, ForKind, Partition, ScheduleModel};
use crate::storage::StoragePlan;

#[derive(Debug)]
pub struct NestResult {
    pub body: Vec<Stmt>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn synthesize(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    placement: &Placement,
    bounds: &Bounds,
    plan: &FusePlan,
    storage: &StoragePlan,
) -> NestResult {
    let mut ctx = NestCtx {
        graph,
        schedule,
        placement,
        bounds,
        plan,
        storage,
        diagnostics: Vec::new(),
    };
    let body = ctx.site_body(&None, Vec::new());
    NestResult {
        body,
        diagnostics: ctx.diagnostics,
    }
}

struct NestCtx<'a> {
    graph: &'a PipelineGraph,
    schedule: &'a ScheduleModel,
    placement: &'a Placement,
    bounds: &'a Bounds,
    plan: &'a FusePlan,
    storage: &'a StoragePlan,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> NestCtx<'a> {
    /// Work computed at `site`, then `rest`, inside the allocations opened there.
    fn site_body(&mut self, site: &SiteKey, rest: Vec<Stmt>) -> Vec<Stmt> {
        let plan = self.plan;
        let mut body = Vec::new();
        match site_items(self.graph, self.placement, plan, site) {
            Ok(items) => {
                for item in items {
                    match item {
                        SiteItem::Stage(f, s) => body.push(self.stage(f, s)),
                        SiteItem::Group(g) => body.extend(self.group_level(&plan.groups[g], 0)),
                    }
                }
            }
            Err(d) => self.diagnostics.push(d),
        }
        body.extend(rest);
        for f in self.placement.allocated_at(site).into_iter().rev() {
            let Some(a) = self.storage.get(f) else { continue };
            body = vec![Stmt::Allocate {
                func: f,
                name: a.name.clone(),
                shape: a.shape.clone(),
                ring: a.ring,
                memo_key: a.memo_key.clone(),
                body,
            }];
        }
        body
    }

    fn stage(&mut self, f: FuncId, s: usize) -> Stmt {
        Stmt::Produce {
            func: f,
            name: self.graph.func(f).name.clone(),
            stage: s,
            body: self.loops(f, s, 0),
        }
    }

    fn tags(&self, f: FuncId, s: usize, level: usize) -> (ForKind, Partition) {
        self.placement
            .get(f)
            .and_then(|p| p.stage_loops.get(s))
            .and_then(|loops| loops.get(level))
            .map_or((ForKind::Serial, Partition::Auto), |l| (l.kind, l.partition))
    }

    /// Loops `from..` of stage `s` of `f`, innermost body included.
    fn loops(&mut self, f: FuncId, s: usize, from: usize) -> Vec<Stmt> {
        let bounds = self.bounds;
        let Some(sb) = bounds.get(f).and_then(|fb| fb.stages.get(s)) else {
            return Vec::new();
        };
        let Some(lb) = sb.loops.get(from) else {
            return self.innermost(f, s);
        };
        let (kind, partition) = self.tags(f, s, from);
        let inner = self.loops(f, s, from + 1);
        let body = self.site_body(&Some(lb.sym.clone()), inner);
        vec![Stmt::For {
            sym: lb.sym.clone(),
            min: lb.min.clone(),
            extent: lb.extent.clone(),
            kind,
            partition,
            body,
        }]
    }

    fn innermost(&mut self, f: FuncId, s: usize) -> Vec<Stmt> {
        let graph = self.graph;
        let func = graph.func(f);
        let (Some(def), Some(sb)) = (func.definition(s), self.bounds.get(f).and_then(|fb| fb.stages.get(s)))
        else {
            return Vec::new();
        };
        let to_loops = |e: &Expr| {
            e.substitute(&|v| match v {
                Var::Dim(d) => Some(Expr::sym(loop_sym(&func.name, s, &graph.dim(*d).name))),
                Var::Loop(_) => None,
            })
        };
        let args: Vec<Expr> = def.args.iter().map(&to_loops).collect();
        let clamps = self.self_read_clamps(f, s);
        let values: Vec<Expr> = def
            .values
            .iter()
            .map(|v| {
                let v = to_loops(v);
                if clamps.iter().all(Option::is_none) {
                    return v;
                }
                v.rewrite_calls(&mut |callee, component, args| {
                    let args = if callee == f {
                        args.into_iter()
                            .zip(&clamps)
                            .map(|(a, c)| match c {
                                Some((lo, hi)) => a.clamp(lo.clone(), hi.clone()),
                                None => a,
                            })
                            .collect()
                    } else {
                        args
                    };
                    Expr::Call {
                        func: callee,
                        component,
                        args,
                    }
                })
            })
            .collect();

        let mut out: Vec<Stmt> = sb
            .lets
            .iter()
            .map(|(sym, value)| Stmt::Let {
                sym: sym.clone(),
                value: value.clone(),
            })
            .collect();
        let store = Stmt::Store { func: f, args, values };
        match sb.guards.iter().cloned().reduce(Expr::and) {
            Some(cond) => out.push(Stmt::If {
                cond,
                body: vec![store],
            }),
            None => out.push(store),
        }
        out
    }

    /// Per argument of `f`, the clamp applied to its own reads in stage `s`:
    /// recursive updates read inside the region fixed by `.bound`.
    fn self_read_clamps(&self, f: FuncId, s: usize) -> Vec<Option<(Expr, Expr)>> {
        let func = self.graph.func(f);
        let arity = func.args.len();
        if s == 0 || !self.graph.is_recursive(f) {
            return vec![None; arity];
        }
        let (Some(fs), Some(fb)) = (self.schedule.get(&func.name), self.bounds.get(f)) else {
            return vec![None; arity];
        };
        fs.args
            .iter()
            .zip(&fb.computed)
            .map(|(dim, interval)| match (fs.bounds.contains_key(dim), &interval.min, &interval.max) {
                (true, Bound::Finite(lo), Bound::Finite(hi)) => Some((Expr::from_linear(lo), Expr::from_linear(hi))),
                _ => None,
            })
            .collect()
    }

    /// Shared loop `level` of a fused group and everything inside it.
    fn group_level(&mut self, group: &'a FuseGroup, level: usize) -> Vec<Stmt> {
        let Some(l) = group.loops.get(level) else {
            return Vec::new();
        };
        let (Bound::Finite(lo), Some(extent)) = (&l.range.min, l.range.extent()) else {
            let name = &self.graph.func(group.target.0).name;
            self.diagnostics.push(Diagnostic::error(
                codes::E0200,
                Subject::func(name),
                format!("fused loop {} has unbounded range {}", l.sym, l.range),
            ));
            return Vec::new();
        };
        let (kind, partition) = self.tags(group.target.0, group.target.1, level);
        let inner = if level + 1 == group.loops.len() {
            group.elements.iter().map(|k| self.member(group, *k)).collect()
        } else {
            self.group_level(group, level + 1)
        };
        let body = self.site_body(&Some(l.sym.clone()), inner);
        vec![Stmt::For {
            sym: l.sym.clone(),
            min: Expr::from_linear(lo),
            extent: Expr::from_linear(&extent),
            kind,
            partition,
            body,
        }]
    }

    /// One element of a fused group, inside the shared loops: its own loop
    /// symbols are bound to the shared ones and iterations outside its own
    /// range are skipped.
    fn member(&mut self, group: &FuseGroup, key: StageKey) -> Stmt {
        let (f, s) = key;
        let mut body = Vec::new();
        let mut conds = Vec::new();
        for l in &group.loops {
            for (_, own, range) in l.members.iter().filter(|(k, _, _)| *k == key) {
                if *own != l.sym {
                    body.push(Stmt::Let {
                        sym: own.clone(),
                        value: Expr::sym(l.sym.clone()),
                    });
                }
                if *range != l.range {
                    if let Bound::Finite(lo) = &range.min {
                        conds.push(Expr::sym(own.clone()).ge(Expr::from_linear(lo)));
                    }
                    if let Bound::Finite(hi) = &range.max {
                        conds.push(Expr::sym(own.clone()).le(Expr::from_linear(hi)));
                    }
                }
            }
        }
        let rest = self.loops(f, s, group.loops.len());
        match conds.into_iter().reduce(Expr::and) {
            Some(cond) => body.push(Stmt::If { cond, body: rest }),
            None => body.extend(rest),
        }
        Stmt::Produce {
            func: f,
            name: self.graph.func(f).name.clone(),
            stage: s,
            body,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::infer_bounds;
    use crate::fuse::fuse;
    use crate::lir::{LoweredPipeline, NameTable};
    use crate::options::{LowerOptions, Request};
    use crate::placement::place;
    use crate::schedule::{LoopLevel, TailStrategy};
    use crate::storage::allocate;

    fn synth(g: &PipelineGraph, s: &mut ScheduleModel, out: &str, region: &[(i64, i64)]) -> NestResult {
        let o = g.func_by_name(out).unwrap();
        s.resolve_default_placement(g, &[out.to_string()]);
        let p = place(g, s, &[o]).placement;
        let options = LowerOptions::default();
        let mut b = infer_bounds(g, s, &p, &Request::new().output(out, region), &options);
        assert!(b.diagnostics.is_empty(), "{:?}", b.diagnostics);
        let plan = fuse(g, &p, &mut b.bounds).plan;
        let storage = allocate(g, s, &p, &b.bounds, &options).plan;
        synthesize(g, s, &p, &b.bounds, &plan, &storage)
    }

    fn text(g: &PipelineGraph, body: Vec<Stmt>) -> String {
        let names = NameTable {
            funcs: g
                .funcs()
                .iter()
                .map(|f| crate::lir::FuncMeta {
                    id: f.id,
                    name: f.name.clone(),
                    value_types: f.value_types.clone(),
                })
                .collect(),
            inputs: vec![],
        };
        LoweredPipeline {
            names,
            outputs: vec![],
            allocations: vec![],
            regions: vec![],
            input_regions: vec![],
            body,
            warnings: vec![],
        }
        .to_string()
    }

    /// f(x) = x * 2; out(x) = f(x - 1) + f(x + 1)
    fn blur() -> PipelineGraph {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x * 2]);
        let out = g.add_func("out", &["x"]);
        let x = g.var(out, "x").unwrap();
        g.define(out, vec![Expr::call(f, vec![x.clone() - 1]) + Expr::call(f, vec![x + 1])]);
        g
    }

    #[test]
    fn root_producer_runs_before_its_consumer() {
        let g = blur();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().compute_root().unwrap();
        let r = synth(&g, &mut s, "out", &[(0, 4)]);
        assert!(r.diagnostics.is_empty());
        assert_eq!(
            text(&g, r.body),
            "allocate f[-1 + 6] {\n  \
               produce f.s0 {\n    \
                 for f.s0.x from -1 extent 6 {\n      \
                   f(f.s0.x) = f.s0.x * 2\n    \
                 }\n  \
               }\n  \
               produce out.s0 {\n    \
                 for out.s0.x from 0 extent 4 {\n      \
                   out(out.s0.x) = f(out.s0.x - 1) + f(out.s0.x + 1)\n    \
                 }\n  \
               }\n\
             }\n"
        );
    }

    #[test]
    fn compute_at_nests_inside_the_consumer_loop() {
        let g = blur();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().compute_at(LoopLevel::at("out", "x")).unwrap();
        let r = synth(&g, &mut s, "out", &[(0, 4)]);
        assert!(r.diagnostics.is_empty());
        let t = text(&g, r.body);
        assert!(t.contains("for out.s0.x from 0 extent 4 {\n    allocate f[out.s0.x - 1 + 3] {"), "{t}");
        assert!(t.contains("for f.s0.x from out.s0.x - 1 extent 3 {"), "{t}");
    }

    #[test]
    fn guarded_split_binds_the_original_variable() {
        let g = blur();
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().compute_root().unwrap();
        s.stage_mut("out", 0)
            .unwrap()
            .split("x", "xo", "xi", 4, TailStrategy::GuardWithIf)
            .unwrap();
        let r = synth(&g, &mut s, "out", &[(0, 10)]);
        let t = text(&g, r.body);
        assert!(t.contains("for out.s0.xo from 0 extent 3 {"), "{t}");
        assert!(t.contains("let out.s0.x = (out.s0.xo * 4) + out.s0.xi"), "{t}");
        assert!(t.contains("if out.s0.x <= 9 {"), "{t}");
    }

    #[test]
    fn bounded_recursion_clamps_self_reads() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![Expr::int(0)]);
        g.update(f, vec![x.clone()], vec![x.clone() + Expr::call(f, vec![x - 1])]);
        let out = g.add_func("out", &["x"]);
        let x = g.var(out, "x").unwrap();
        g.define(out, vec![Expr::call(f, vec![x])]);
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().bound("x", 0, 10).unwrap();
        let r = synth(&g, &mut s, "out", &[(0, 10)]);
        assert!(r.diagnostics.is_empty());
        let t = text(&g, r.body);
        assert!(t.contains("f(f.s1.x) = f.s1.x + f(max(min(f.s1.x - 1, 9), 0))"), "{t}");
    }
}
