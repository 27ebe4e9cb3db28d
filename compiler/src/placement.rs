// placement.rs — Realization set, loop-nest paths and compute sites
//
// Resolves every compute_at / store_at / hoist_storage LoopLevel of a
// realized Func into a path: the ordered list of loops enclosing that level,
// outermost first. path(root) is empty; path(At{G, s, v}) is the compute path
// of G followed by G's stage-s loops down to and including v. Loops shared by
// a compute_with group are identified by the symbol of the group target, so
// prefix comparisons see them as one loop.
//
// Preconditions: inlined Funcs have already been substituted away;
//                `schedule` has default placements resolved.
// Postconditions: `Placement` carries one `FuncPlacement` per realized Func
//                 and the realization order (producers first).
// Failure modes: undefined or cyclic loop levels → E0308; structural
//                compute_with violations → E0305 (via `fuse::plan_links`).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::diag::{codes, Diagnostic, Subject};
use crate::fuse::{plan_links, FuseLink};
use crate::graph::PipelineGraph;
use crate::id::FuncId;
use crate::schedule::{loop_sym, ForKind, LoopLevel, Partition, ScheduleModel};

// ── Public types ────────────────────────────────────────────────────────────

/// Where a Func's work or storage lives: `None` is the root of the pipeline,
/// `Some(sym)` the body of the loop with that (canonical) symbol.
pub type SiteKey = Option<String>;

/// One loop of a stage as placed in the final nest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathLoop {
    pub func: FuncId,
    pub stage: usize,
    pub var: String,
    /// Symbol the loop is emitted under.
    pub sym: String,
    /// The stage's own symbol; differs from `sym` for loops a compute_with
    /// member shares with its target.
    pub own: String,
    pub kind: ForKind,
    pub partition: Partition,
}

impl PathLoop {
    pub fn is_shared(&self) -> bool {
        self.sym != self.own
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FuncPlacement {
    pub func: FuncId,
    pub name: String,
    pub compute: LoopLevel,
    pub store: LoopLevel,
    pub hoist: LoopLevel,
    pub compute_path: Vec<PathLoop>,
    pub store_path: Vec<PathLoop>,
    pub hoist_path: Vec<PathLoop>,
    /// Loops of each stage, outermost first.
    pub stage_loops: Vec<Vec<PathLoop>>,
}

impl FuncPlacement {
    pub fn compute_site(&self) -> SiteKey {
        self.compute_path.last().map(|l| l.sym.clone())
    }

    /// Site of the allocation: the hoist level, which defaults to the store level.
    pub fn alloc_site(&self) -> SiteKey {
        self.hoist_path.last().map(|l| l.sym.clone())
    }

    /// Symbols fixed at the compute level, including the member-side names
    /// of loops shared through compute_with.
    pub fn fixed(&self) -> BTreeSet<String> {
        let mut out = syms(&self.compute_path);
        out.extend(self.compute_path.iter().map(|l| l.own.clone()));
        out
    }

    /// Loops enclosing the body of stage `stage`: compute path then stage loops.
    pub fn stage_path(&self, stage: usize) -> Vec<PathLoop> {
        let mut out = self.compute_path.clone();
        out.extend(self.stage_loops.get(stage).cloned().unwrap_or_default());
        out
    }
}

/// Canonical symbols of a path.
pub fn syms(path: &[PathLoop]) -> BTreeSet<String> {
    path.iter().map(|l| l.sym.clone()).collect()
}

/// True when `a` is a prefix of `b`, comparing canonical symbols.
pub fn is_prefix(a: &[PathLoop], b: &[PathLoop]) -> bool {
    a.len() <= b.len() && a.iter().zip(b).all(|(x, y)| x.sym == y.sym)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Placement {
    pub outputs: Vec<FuncId>,
    /// Realized Funcs, producers first.
    pub order: Vec<FuncId>,
    pub funcs: BTreeMap<FuncId, FuncPlacement>,
    /// compute_with members → their group target.
    pub links: BTreeMap<(FuncId, usize), FuseLink>,
}

impl Placement {
    pub fn get(&self, func: FuncId) -> Option<&FuncPlacement> {
        self.funcs.get(&func)
    }

    pub fn is_realized(&self, func: FuncId) -> bool {
        self.funcs.contains_key(&func)
    }

    pub fn is_output(&self, func: FuncId) -> bool {
        self.outputs.contains(&func)
    }

    /// Funcs computed at `site`, in realization order.
    pub fn computed_at(&self, site: &SiteKey) -> Vec<FuncId> {
        self.order
            .iter()
            .copied()
            .filter(|f| self.funcs.get(f).is_some_and(|p| &p.compute_site() == site))
            .collect()
    }

    /// Non-output Funcs whose allocation opens at `site`.
    pub fn allocated_at(&self, site: &SiteKey) -> Vec<FuncId> {
        self.order
            .iter()
            .copied()
            .filter(|f| !self.is_output(*f))
            .filter(|f| self.funcs.get(f).is_some_and(|p| &p.alloc_site() == site))
            .collect()
    }
}

/// Result of placement resolution.
#[derive(Debug)]
pub struct PlaceResult {
    pub placement: Placement,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Resolve the placement of every Func realized for `outputs`.
pub fn place(graph: &PipelineGraph, schedule: &ScheduleModel, outputs: &[FuncId]) -> PlaceResult {
    let mut diagnostics = Vec::new();
    let realized: BTreeSet<FuncId> = graph
        .reachable(outputs)
        .into_iter()
        .filter(|f| {
            schedule
                .get(&graph.func(*f).name)
                .is_some_and(|s| !s.compute.is_inline())
        })
        .collect();
    let order = match graph.topo_order(&realized) {
        Ok(order) => order,
        Err(cycle) => {
            let name = cycle.first().map_or("", |f| graph.func(*f).name.as_str());
            diagnostics.push(Diagnostic::error(
                codes::E0106,
                Subject::func(name),
                "cyclic dependency between realized funcs",
            ));
            realized.iter().copied().collect()
        }
    };
    let links = plan_links(graph, schedule, &realized, &mut diagnostics);

    let mut ctx = PlaceCtx {
        graph,
        schedule,
        realized: &realized,
        links: &links,
        diagnostics,
        compute_paths: BTreeMap::new(),
        in_progress: BTreeSet::new(),
    };
    let mut funcs = BTreeMap::new();
    for &f in &order {
        let p = ctx.func_placement(f);
        funcs.insert(f, p);
    }
    let diagnostics = ctx.diagnostics;
    PlaceResult {
        placement: Placement {
            outputs: outputs.to_vec(),
            order,
            funcs,
            links,
        },
        diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct PlaceCtx<'a> {
    graph: &'a PipelineGraph,
    schedule: &'a ScheduleModel,
    realized: &'a BTreeSet<FuncId>,
    links: &'a BTreeMap<(FuncId, usize), FuseLink>,
    diagnostics: Vec<Diagnostic>,
    compute_paths: BTreeMap<FuncId, Vec<PathLoop>>,
    in_progress: BTreeSet<FuncId>,
}

impl PlaceCtx<'_> {
    fn undefined(&mut self, func: FuncId, level: &LoopLevel, why: &str) {
        let name = &self.graph.func(func).name;
        self.diagnostics.push(Diagnostic::error(
            codes::E0308,
            Subject::func(name),
            format!("loop level {level} used by '{name}' {why}"),
        ));
    }

    fn func_placement(&mut self, f: FuncId) -> FuncPlacement {
        let name = self.graph.func(f).name.clone();
        let schedule = self.schedule;
        let Some(sched) = schedule.get(&name) else {
            return FuncPlacement {
                func: f,
                name,
                compute: LoopLevel::Root,
                store: LoopLevel::Root,
                hoist: LoopLevel::Root,
                compute_path: Vec::new(),
                store_path: Vec::new(),
                hoist_path: Vec::new(),
                stage_loops: Vec::new(),
            };
        };
        let compute = sched.compute.clone();
        let store = sched.store.clone().unwrap_or_else(|| compute.clone());
        let hoist = sched.hoist.clone().unwrap_or_else(|| store.clone());
        let compute_path = self.compute_path(f);
        let store_path = if sched.store.is_some() {
            self.level_path(f, &store)
        } else {
            compute_path.clone()
        };
        let hoist_path = if sched.hoist.is_some() {
            self.level_path(f, &hoist)
        } else {
            store_path.clone()
        };
        let stage_loops = (0..sched.stages.len()).map(|s| self.stage_loops(f, s)).collect();
        FuncPlacement {
            func: f,
            name,
            compute,
            store,
            hoist,
            compute_path,
            store_path,
            hoist_path,
            stage_loops,
        }
    }

    fn compute_path(&mut self, f: FuncId) -> Vec<PathLoop> {
        if let Some(p) = self.compute_paths.get(&f) {
            return p.clone();
        }
        if !self.in_progress.insert(f) {
            let name = self.graph.func(f).name.clone();
            self.diagnostics.push(Diagnostic::error(
                codes::E0308,
                Subject::func(&name),
                format!("compute_at of '{name}' is cyclic"),
            ));
            return Vec::new();
        }
        let level = self
            .schedule
            .get(&self.graph.func(f).name)
            .map_or(LoopLevel::Root, |s| s.compute.clone());
        let path = self.level_path(f, &level);
        self.in_progress.remove(&f);
        self.compute_paths.insert(f, path.clone());
        path
    }

    /// Loops enclosing `level`, as seen from Func `origin`.
    fn level_path(&mut self, origin: FuncId, level: &LoopLevel) -> Vec<PathLoop> {
        let (gname, stage, var) = match level {
            LoopLevel::Root => return Vec::new(),
            LoopLevel::Inline => {
                self.undefined(origin, level, "is not a loop");
                return Vec::new();
            }
            LoopLevel::At { func, stage, var } => (func, *stage, var),
        };
        let Some(g) = self.graph.func_by_name(gname).filter(|g| self.realized.contains(g)) else {
            self.undefined(origin, level, "names a func that is not realized");
            return Vec::new();
        };
        if g == origin {
            self.undefined(origin, level, "is inside its own loops");
            return Vec::new();
        }
        let loops = self.stage_loops(g, stage);
        let Some(idx) = loops.iter().position(|l| &l.var == var) else {
            self.undefined(origin, level, "names no loop of that stage");
            return Vec::new();
        };
        let mut path = self.compute_path(g);
        path.extend(loops.into_iter().take(idx + 1));
        path
    }

    fn stage_loops(&self, f: FuncId, stage: usize) -> Vec<PathLoop> {
        let name = &self.graph.func(f).name;
        let Some(s) = self.schedule.get(name).and_then(|fs| fs.stage(stage)) else {
            return Vec::new();
        };
        let mut loops: Vec<PathLoop> = s
            .dims
            .iter()
            .map(|d| {
                let own = loop_sym(name, stage, &d.name);
                PathLoop {
                    func: f,
                    stage,
                    var: d.name.clone(),
                    sym: own.clone(),
                    own,
                    kind: d.kind,
                    partition: d.partition,
                }
            })
            .collect();
        if let Some(link) = self.links.get(&(f, stage)) {
            let tname = &self.graph.func(link.target.0).name;
            if let Some(t) = self.schedule.get(tname).and_then(|fs| fs.stage(link.target.1)) {
                for (l, td) in loops.iter_mut().zip(&t.dims).take(link.depth + 1) {
                    l.sym = loop_sym(tname, link.target.1, &td.name);
                }
            }
        }
        loops
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
