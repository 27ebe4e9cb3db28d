// fuse.rs — compute_with groups: planning, legality, and emission order
//
// A stage scheduled `compute_with(T.t, v)` shares the loops of stage `t` of
// `T` from the outermost down to `v` and runs after `T.t`'s body in every
// iteration of them. Links are planned structurally before placement (they
// change the symbols of shared loops); everything that depends on regions is
// checked after bounds inference. Shared loops iterate the hull of the
// members' ranges; members whose range is smaller are guarded.
//
// Preconditions: `plan_links`: schedule checked. `fuse`: bounds inferred.
// Postconditions: every group's producers precede it at its site; the
//                 symbol table holds the hull range of every shared loop.
// Failure modes: incompatible loop nests, reads of values produced later in
//                the iteration, or producer/consumer inversion → E0305;
//                undefined targets → E0308.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::bounds::{call_region, Bounds, SiteEnv};
use crate::diag::{codes, Diagnostic, Subject};
use crate::graph::PipelineGraph;
use crate::id::FuncId;
use crate::interval::{Bound, Interval, Linear};
use crate::placement::{Placement, SiteKey};
use crate::schedule::{FuncSchedule, FuseTarget, ScheduleModel, StageSchedule};

/// A stage of a Func.
pub type StageKey = (FuncId, usize);

// ── Public types ────────────────────────────────────────────────────────────

/// A member stage's attachment to its group target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuseLink {
    pub target: StageKey,
    pub var: String,
    /// Index of `var` in both loop nests; loops `0..=depth` are shared.
    pub depth: usize,
}

/// One shared loop of a group.
#[derive(Debug, Clone, Serialize)]
pub struct FusedLoop {
    /// Canonical symbol (the target's).
    pub sym: String,
    /// Hull of every member's range.
    pub range: Interval,
    /// `(stage, own symbol, own range)` per element, target first.
    pub members: Vec<(StageKey, String, Interval)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FuseGroup {
    pub target: StageKey,
    /// Elements in execution order, target first.
    pub elements: Vec<StageKey>,
    pub var: String,
    pub depth: usize,
    pub loops: Vec<FusedLoop>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FusePlan {
    pub groups: Vec<FuseGroup>,
}

impl FusePlan {
    pub fn group_of(&self, key: StageKey) -> Option<usize> {
        self.groups.iter().position(|g| g.elements.contains(&key))
    }
}

/// One unit of work emitted at a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SiteItem {
    Stage(FuncId, usize),
    /// Index into `FusePlan::groups`.
    Group(usize),
}

#[derive(Debug)]
pub struct FuseResult {
    pub plan: FusePlan,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Link planning ───────────────────────────────────────────────────────────

/// Validate every compute_with directive among `realized` Funcs and return
/// the accepted links. Rejected links are reported and left out.
pub fn plan_links(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    realized: &BTreeSet<FuncId>,
    diagnostics: &mut Vec<Diagnostic>,
) -> BTreeMap<StageKey, FuseLink> {
    let mut links = BTreeMap::new();
    for &f in realized {
        let Some(fs) = schedule.get(&graph.func(f).name) else { continue };
        for ss in &fs.stages {
            let Some(target) = &ss.compute_with else { continue };
            match link_for(graph, schedule, realized, f, fs, ss, target) {
                Ok(link) => {
                    links.insert((f, ss.stage), link);
                }
                Err(d) => diagnostics.push(d),
            }
        }
    }

    // Every member of a group fuses at the same loop.
    let mut group_var: BTreeMap<StageKey, String> = BTreeMap::new();
    let mut rejected = Vec::new();
    for (key, link) in &links {
        let var = group_var.entry(link.target).or_insert_with(|| link.var.clone());
        if *var != link.var {
            let name = &graph.func(key.0).name;
            diagnostics.push(Diagnostic::error(
                codes::E0305,
                Subject::func(name),
                format!(
                    "{name}.s{} fuses at '{}' but its group already fuses at '{var}'",
                    key.1, link.var
                ),
            ));
            rejected.push(*key);
        }
    }
    for key in rejected {
        links.remove(&key);
    }

    // Earlier stages of a fused stage must be fused too.
    let targets: BTreeSet<StageKey> = links.values().map(|l| l.target).collect();
    let in_group = |k: &StageKey| links.contains_key(k) || targets.contains(k);
    let mut rejected = Vec::new();
    for &(f, s) in links.keys() {
        if let Some(j) = (0..s).find(|j| !in_group(&(f, *j))) {
            let name = &graph.func(f).name;
            diagnostics.push(Diagnostic::error(
                codes::E0305,
                Subject::func(name),
                format!("{name}.s{s} is fused but its earlier stage {name}.s{j} is not"),
            ));
            rejected.push((f, s));
        }
    }
    for key in rejected {
        links.remove(&key);
    }
    links
}

fn link_for(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    realized: &BTreeSet<FuncId>,
    f: FuncId,
    fs: &FuncSchedule,
    ss: &StageSchedule,
    target: &FuseTarget,
) -> Result<FuseLink, Diagnostic> {
    let me = format!("{}.s{}", fs.name, ss.stage);
    let subject = || Subject::func(&fs.name);
    let undefined = |why: &str| {
        Diagnostic::error(
            codes::E0308,
            subject(),
            format!("compute_with target {}.s{} of {me} {why}", target.func, target.stage),
        )
    };
    let incompatible = |why: String| {
        Diagnostic::error(
            codes::E0305,
            subject(),
            format!("{me} cannot be computed with {}.s{}: {why}", target.func, target.stage),
        )
    };

    let t = graph
        .func_by_name(&target.func)
        .filter(|t| realized.contains(t))
        .ok_or_else(|| undefined("is not realized"))?;
    if t == f {
        return Err(undefined("is the same func"));
    }
    let tfs = schedule.get(&target.func).ok_or_else(|| undefined("has no schedule"))?;
    let tss = tfs.stage(target.stage).ok_or_else(|| undefined("does not exist"))?;
    if tss.compute_with.is_some() {
        return Err(incompatible("the target is itself fused into another stage".to_string()));
    }
    if fs.compute != tfs.compute {
        return Err(incompatible(format!(
            "they are computed at different levels ({} vs {})",
            fs.compute, tfs.compute
        )));
    }
    let mine = ss.dims.iter().position(|d| d.name == target.var);
    let theirs = tss.dims.iter().position(|d| d.name == target.var);
    let (Some(depth), Some(tdepth)) = (mine, theirs) else {
        return Err(undefined(&format!("has no loop '{}'", target.var)));
    };
    if depth != tdepth {
        return Err(incompatible(format!(
            "'{}' is at depth {depth} here and {tdepth} in the target",
            target.var
        )));
    }
    for (a, b) in ss.dims.iter().zip(&tss.dims).take(depth + 1) {
        if a.kind != b.kind {
            return Err(incompatible(format!(
                "loop '{}' is {} but the target's '{}' is {}",
                a.name, a.kind, b.name, b.kind
            )));
        }
    }
    Ok(FuseLink {
        target: (t, target.stage),
        var: target.var.clone(),
        depth,
    })
}

// ── Post-bounds checks and hulls ────────────────────────────────────────────

pub fn fuse(graph: &PipelineGraph, placement: &Placement, bounds: &mut Bounds) -> FuseResult {
    let mut diagnostics = Vec::new();
    let pos: BTreeMap<FuncId, usize> = placement.order.iter().enumerate().map(|(i, f)| (*f, i)).collect();

    let mut members: BTreeMap<StageKey, Vec<StageKey>> = BTreeMap::new();
    for (key, link) in &placement.links {
        members.entry(link.target).or_default().push(*key);
    }
    let mut groups = Vec::new();
    for (target, mut rest) in members {
        rest.sort_by_key(|(f, s)| (pos.get(f).copied().unwrap_or(usize::MAX), *s));
        let Some(link) = rest.first().and_then(|k| placement.links.get(k)) else { continue };
        let (var, depth) = (link.var.clone(), link.depth);
        let mut elements = vec![target];
        elements.extend(rest);
        check_reads(graph, placement, bounds, &elements, depth, &mut diagnostics);
        let loops = hull_loops(bounds, &elements, depth);
        groups.push(FuseGroup {
            target,
            elements,
            var,
            depth,
            loops,
        });
    }
    for g in &groups {
        for l in &g.loops {
            tracing::trace!(sym = %l.sym, range = %l.range, "fused loop hull");
            bounds.table.insert(l.sym.clone(), l.range.clone());
        }
    }
    let plan = FusePlan { groups };

    let mut sites: BTreeSet<SiteKey> = BTreeSet::from([None]);
    sites.extend(placement.funcs.values().map(|p| p.compute_site()));
    for site in &sites {
        if let Err(d) = site_items(graph, placement, &plan, site) {
            diagnostics.push(d);
        }
    }
    FuseResult { plan, diagnostics }
}

fn stage_reads(graph: &PipelineGraph, (f, s): StageKey, callee: FuncId) -> bool {
    graph
        .func(f)
        .definition(s)
        .is_some_and(|d| d.exprs().any(|e| e.calls_func(callee)))
}

/// Own symbol → canonical symbol for the shared loops of `key`, plus the set
/// of symbols that stay fixed while one fused iteration runs.
fn shared_syms(placement: &Placement, key: StageKey, depth: usize) -> (BTreeMap<String, String>, BTreeSet<String>) {
    let mut map = BTreeMap::new();
    let mut fixed = BTreeSet::new();
    if let Some(p) = placement.get(key.0) {
        fixed = p.fixed();
        for l in p.stage_loops.get(key.1).into_iter().flatten().take(depth + 1) {
            map.insert(l.own.clone(), l.sym.clone());
            fixed.insert(l.own.clone());
        }
    }
    (map, fixed)
}

fn check_reads(
    graph: &PipelineGraph,
    placement: &Placement,
    bounds: &Bounds,
    elements: &[StageKey],
    depth: usize,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let table = &bounds.table;
    let mut error = |key: StageKey, message: String| {
        diagnostics.push(Diagnostic::error(
            codes::E0305,
            Subject::func(&graph.func(key.0).name),
            message,
        ));
    };
    let label = |(f, s): StageKey| format!("{}.s{s}", graph.func(f).name);

    for (i, &reader) in elements.iter().enumerate() {
        for (j, &source) in elements.iter().enumerate() {
            let producer = source.0;
            if producer == reader.0 || !stage_reads(graph, reader, producer) {
                continue;
            }
            if j > i {
                error(
                    reader,
                    format!(
                        "{} reads '{}' which {} produces later in the same fused iteration",
                        label(reader),
                        graph.func(producer).name,
                        label(source)
                    ),
                );
                continue;
            }
            let unfused = (source.1 + 1..graph.func(producer).stage_count())
                .find(|s| !elements.contains(&(producer, *s)));
            if let Some(s) = unfused {
                error(
                    reader,
                    format!(
                        "{} reads '{}' before its stage {s} runs after the fused loops",
                        label(reader),
                        graph.func(producer).name
                    ),
                );
                continue;
            }
            let (Some(rb), Some(pb)) = (bounds.get(reader.0), bounds.get(producer)) else { continue };
            let (Some(rsb), Some(psb)) = (rb.stages.get(reader.1), pb.stages.get(source.1)) else {
                continue;
            };
            let (rmap, rfixed) = shared_syms(placement, reader, depth);
            let (pmap, pfixed) = shared_syms(placement, source, depth);
            let renv = SiteEnv::for_stage(graph, table, reader.0, rsb, &rfixed);
            let Some(read) = graph
                .func(reader.0)
                .definition(reader.1)
                .and_then(|d| call_region(d.exprs(), producer, &renv, &rfixed))
            else {
                continue;
            };
            let penv = SiteEnv::for_stage(graph, table, producer, psb, &pfixed);
            let Some(def) = graph.func(producer).definition(source.1) else { continue };
            for (d, arg) in def.args.iter().enumerate() {
                let written = rename(&table.relax(&arg.bounds_of(&penv), &pfixed), &pmap);
                let wanted = rename(&read[d], &rmap);
                let computed_min = &pb.computed[d].min;
                let below_end = matches!(
                    table.compare(&wanted.max, &written.max),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                );
                // The reader only runs over its own range of the shared loops.
                let above_start = matches!(
                    table.compare(computed_min, &read[d].min),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                );
                if !(below_end && above_start) {
                    error(
                        reader,
                        format!(
                            "{} reads {wanted} of '{}' but only up to {} is written by then",
                            label(reader),
                            graph.func(producer).name,
                            written.max
                        ),
                    );
                    break;
                }
            }
        }
    }
}

fn rename(interval: &Interval, map: &BTreeMap<String, String>) -> Interval {
    let side = |b: &Bound| match b {
        Bound::Finite(l) => Bound::Finite(l.terms.iter().fold(Linear::constant(l.constant), |acc, (s, c)| {
            let name = map.get(s).cloned().unwrap_or_else(|| s.clone());
            acc.add(&Linear::sym(name).scale(*c))
        })),
        other => other.clone(),
    };
    Interval::new(side(&interval.min), side(&interval.max))
}

fn hull_loops(bounds: &Bounds, elements: &[StageKey], depth: usize) -> Vec<FusedLoop> {
    let table = &bounds.table;
    let stage = |(f, s): StageKey| bounds.get(f).and_then(|fb| fb.stages.get(s));
    let Some(target) = elements.first().and_then(|k| stage(*k)) else {
        return Vec::new();
    };
    let mut loops = Vec::new();
    for (i, tl) in target.loops.iter().enumerate().take(depth + 1) {
        let mut range = tl.range.clone();
        let mut members = Vec::new();
        for &key in elements {
            let Some(ml) = stage(key).and_then(|sb| sb.loops.get(i)) else { continue };
            range = range.union(&ml.range, table);
            members.push((key, ml.sym.clone(), ml.range.clone()));
        }
        loops.push(FusedLoop {
            sym: tl.sym.clone(),
            range,
            members,
        });
    }
    loops
}

// ── Emission order ──────────────────────────────────────────────────────────

/// Work emitted at `site`, in order. Fused groups run once all their
/// elements' Funcs have been reached; stages of a member that follow its fused
/// stage are deferred until after the group.
pub fn site_items(
    graph: &PipelineGraph,
    placement: &Placement,
    plan: &FusePlan,
    site: &SiteKey,
) -> Result<Vec<SiteItem>, Diagnostic> {
    let funcs = placement.computed_at(site);
    let seq: Vec<StageKey> = funcs
        .iter()
        .flat_map(|&f| (0..graph.func(f).stage_count()).map(move |s| (f, s)))
        .collect();
    let pos = |k: &StageKey| seq.iter().position(|x| x == k).unwrap_or(0);

    let group_key = |g: usize| plan.groups[g].elements.iter().map(pos).max().unwrap_or(0);
    let mut keyed: Vec<((usize, u8, usize), SiteItem)> = Vec::new();
    let mut seen_groups = BTreeSet::new();
    for (p, &(f, s)) in seq.iter().enumerate() {
        match plan.group_of((f, s)) {
            Some(g) => {
                if seen_groups.insert(g) {
                    keyed.push(((group_key(g), 0, p), SiteItem::Group(g)));
                }
            }
            None => {
                let after = (0..s)
                    .filter_map(|j| plan.group_of((f, j)))
                    .map(group_key)
                    .max()
                    .unwrap_or(0);
                keyed.push(((p.max(after), 1, p), SiteItem::Stage(f, s)));
            }
        }
    }
    keyed.sort_by_key(|(k, _)| *k);
    let items: Vec<SiteItem> = keyed.into_iter().map(|(_, item)| item).collect();

    let here: BTreeSet<FuncId> = funcs.iter().copied().collect();
    let mut done: BTreeSet<StageKey> = BTreeSet::new();
    for item in &items {
        let elements = match item {
            SiteItem::Stage(f, s) => vec![(*f, *s)],
            SiteItem::Group(g) => plan.groups[*g].elements.clone(),
        };
        for (i, &(f, s)) in elements.iter().enumerate() {
            let name = &graph.func(f).name;
            let ready = |k: &StageKey| done.contains(k) || elements[..i].contains(k);
            if let Some(j) = (0..s).find(|j| !ready(&(f, *j))) {
                return Err(Diagnostic::error(
                    codes::E0305,
                    Subject::func(name),
                    format!("{name}.s{s} would run before {name}.s{j}"),
                ));
            }
            let Some(def) = graph.func(f).definition(s) else { continue };
            let producers: BTreeSet<FuncId> = def
                .exprs()
                .flat_map(|e| e.calls().into_iter().map(|c| c.func).collect::<Vec<_>>())
                .collect();
            for p in producers {
                if p == f || !here.contains(&p) || elements.iter().any(|e| e.0 == p) {
                    continue;
                }
                let complete = (0..graph.func(p).stage_count()).all(|ps| done.contains(&(p, ps)));
                if !complete {
                    return Err(Diagnostic::error(
                        codes::E0305,
                        Subject::func(name),
                        format!(
                            "{name}.s{s} would run before '{}' is complete",
                            graph.func(p).name
                        ),
                    ));
                }
            }
        }
        done.extend(elements);
    }
    Ok(items)
}

// ── Tests ───────────────────────────────────────────────────────────────────
