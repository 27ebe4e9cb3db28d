// lower.rs — Lowering driver: pass orchestration and the lowering certificate
//
// Runs the minimal set of passes for a terminal PassId on private working
// copies of the graph and schedule, then assembles the loop-nest IR.
//
// Preconditions: `graph` built by the front end; `schedule` built against it.
// Postconditions: on success every realized Func's computed region covers its
//                 required region, every realized stage is produced exactly
//                 once and every intermediate Func is allocated exactly once.
// Failure modes: the first pass emitting an error-level diagnostic aborts the
//                run with `LowerError { failing_pass, diagnostics }`;
//                certificate failure → E0600.
// Side effects: `tracing::debug!` per completed pass, `tracing::warn!` per
//               warning diagnostic.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::bounds::{infer_bounds, Bounds};
use crate::diag::{codes, DiagCode, Diagnostic, Subject};
use crate::fuse::{fuse, FusePlan};
use crate::graph::{validate, PipelineGraph};
use crate::id::FuncId;
use crate::inline::inline_funcs;
use crate::legality::{check_bounded, check_placement, check_schedule};
use crate::lir::{FuncMeta, InputMeta, LoweredPipeline, NameTable, OutputBuffer, RealizedRegion, Stmt};
use crate::nest::synthesize;
use crate::options::{LowerOptions, Request};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::placement::{place, Placement};
use crate::rfactor::apply_rfactors;
use crate::schedule::ScheduleModel;
use crate::storage::{allocate, StoragePlan};

// ── Error type ─────────────────────────────────────────────────────────────

/// Lowering stopped at `failing_pass`. `diagnostics` holds everything that
/// pass reported, errors first.
#[derive(Debug, Clone)]
pub struct LowerError {
    pub failing_pass: PassId,
    pub diagnostics: Vec<Diagnostic>,
}

impl LowerError {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    /// True when some error carries `code`.
    pub fn has_code(&self, code: DiagCode) -> bool {
        self.errors().any(|d| d.code == Some(code))
    }
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors: Vec<&Diagnostic> = self.errors().collect();
        write!(
            f,
            "lowering failed in {} with {} error(s)",
            descriptor(self.failing_pass).name,
            errors.len()
        )?;
        for d in errors {
            write!(f, "\n{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LowerError {}

// ── Lowering state ─────────────────────────────────────────────────────────

/// Artifacts of a (possibly partial) lowering run. Fields after `outputs`
/// are populated by the pass that produces them.
#[derive(Debug, Clone)]
pub struct LoweringState {
    /// Working graph: rfactor intermediates added, inline Funcs expanded.
    pub graph: PipelineGraph,
    /// Working schedule with default placements settled.
    pub schedule: ScheduleModel,
    pub outputs: Vec<FuncId>,
    pub intermediates: Vec<FuncId>,
    pub inlined: Vec<FuncId>,
    pub placement: Option<Placement>,
    pub bounds: Option<Bounds>,
    pub fuse_plan: Option<FusePlan>,
    pub storage: Option<StoragePlan>,
    pub body: Option<Vec<Stmt>>,
    pub warnings: Vec<Diagnostic>,
}

impl LoweringState {
    fn new(graph: &PipelineGraph, schedule: &ScheduleModel) -> Self {
        LoweringState {
            graph: graph.clone(),
            schedule: schedule.clone(),
            outputs: Vec::new(),
            intermediates: Vec::new(),
            inlined: Vec::new(),
            placement: None,
            bounds: None,
            fuse_plan: None,
            storage: None,
            body: None,
            warnings: Vec::new(),
        }
    }

    /// Concrete hull of the computed region of `func`, by name.
    pub fn realized_hull(&self, func: &str) -> Option<Vec<(i64, i64)>> {
        let bounds = self.bounds.as_ref()?;
        let id = self.graph.func_by_name(func)?;
        hull(bounds, id)
    }
}

// ── Certificate ────────────────────────────────────────────────────────────

/// Postconditions of a complete lowering, checked on the synthesized body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringCert {
    pub regions_finite: bool,
    pub computed_covers_required: bool,
    pub outputs_match_request: bool,
    pub stages_produced_once: bool,
    pub intermediates_allocated_once: bool,
}

impl StageCert for LoweringCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("regions_finite", self.regions_finite),
            ("computed_covers_required", self.computed_covers_required),
            ("outputs_match_request", self.outputs_match_request),
            ("stages_produced_once", self.stages_produced_once),
            ("intermediates_allocated_once", self.intermediates_allocated_once),
        ]
    }
}

fn verify(graph: &PipelineGraph, placement: &Placement, bounds: &Bounds, lowered: &LoweredPipeline) -> LoweringCert {
    let table = &bounds.table;
    let mut cert = LoweringCert {
        regions_finite: true,
        computed_covers_required: true,
        outputs_match_request: true,
        stages_produced_once: true,
        intermediates_allocated_once: true,
    };
    for o in &lowered.outputs {
        let wanted: Vec<(i64, i64)> = o.region.iter().map(|&(m, e)| (m, m + e - 1)).collect();
        if hull(bounds, o.func) != Some(wanted) {
            cert.outputs_match_request = false;
        }
    }
    for (&f, fb) in &bounds.funcs {
        if hull(bounds, f).is_none() {
            cert.regions_finite = false;
        }
        for (c, r) in fb.computed.iter().zip(&fb.required) {
            let lo = table.compare(&c.min, &r.min);
            let hi = table.compare(&c.max, &r.max);
            if !matches!(lo, Some(Ordering::Less | Ordering::Equal))
                || !matches!(hi, Some(Ordering::Greater | Ordering::Equal))
            {
                cert.computed_covers_required = false;
            }
        }
    }
    let mut allocs: BTreeMap<FuncId, usize> = BTreeMap::new();
    for s in &lowered.body {
        s.walk(&mut |s| {
            if let Stmt::Allocate { func, .. } = s {
                *allocs.entry(*func).or_default() += 1;
            }
        });
    }
    for &f in &placement.order {
        let stages = graph.func(f).stage_count();
        if (0..stages).any(|s| lowered.produce_count(f, s) != 1) {
            cert.stages_produced_once = false;
        }
        let want = usize::from(!placement.is_output(f));
        if allocs.get(&f).copied().unwrap_or(0) != want {
            cert.intermediates_allocated_once = false;
        }
    }
    cert
}

fn hull(bounds: &Bounds, func: FuncId) -> Option<Vec<(i64, i64)>> {
    let fb = bounds.get(func)?;
    fb.computed
        .iter()
        .map(|i| bounds.table.concretize(i).as_constant_range())
        .collect()
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Per-pass post-processing: log, keep warnings, stop on errors.
fn finish_pass(
    state: &mut LoweringState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
) -> Result<(), LowerError> {
    let name = descriptor(pass_id).name;
    tracing::debug!(
        pass = name,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        diagnostics = diags.len(),
        "pass complete"
    );
    let (mut errors, warnings): (Vec<Diagnostic>, Vec<Diagnostic>) = diags.into_iter().partition(|d| d.is_error());
    for w in &warnings {
        tracing::warn!(pass = name, "{w}");
    }
    if errors.is_empty() {
        state.warnings.extend(warnings);
        return Ok(());
    }
    errors.extend(warnings);
    Err(LowerError {
        failing_pass: pass_id,
        diagnostics: errors,
    })
}

/// An artifact the pass table promises is present.
fn need<T>(artifact: Option<T>, pass: PassId, what: &str) -> Result<T, LowerError> {
    artifact.ok_or_else(|| LowerError {
        failing_pass: pass,
        diagnostics: vec![Diagnostic::error(
            codes::E0600,
            Subject::none(),
            format!("{} ran without its {what} input", descriptor(pass).name),
        )],
    })
}

/// Map requested output names to Funcs and check their boxes.
fn resolve_outputs(graph: &PipelineGraph, request: &Request) -> (Vec<FuncId>, Vec<Diagnostic>) {
    let mut outputs = Vec::new();
    let mut diags = Vec::new();
    if request.outputs.is_empty() {
        diags.push(Diagnostic::error(codes::E0102, Subject::none(), "request names no output"));
    }
    for o in &request.outputs {
        let Some(id) = graph.func_by_name(&o.func) else {
            diags.push(Diagnostic::error(
                codes::E0102,
                Subject::func(&o.func),
                format!("requested output '{}' does not exist", o.func),
            ));
            continue;
        };
        let arity = graph.func(id).args.len();
        if o.region.len() != arity {
            diags.push(Diagnostic::error(
                codes::E0100,
                Subject::func(&o.func),
                format!(
                    "requested box of '{}' has {} dimensions, the func has {arity}",
                    o.func,
                    o.region.len()
                ),
            ));
        }
        if let Some((i, _)) = o.region.iter().enumerate().find(|(_, (_, e))| *e <= 0) {
            diags.push(Diagnostic::error(
                codes::E0200,
                Subject::func(&o.func),
                format!("requested extent of dimension {i} of '{}' is not positive", o.func),
            ));
        }
        if outputs.contains(&id) {
            diags.push(Diagnostic::error(
                codes::E0108,
                Subject::func(&o.func),
                format!("'{}' is requested twice", o.func),
            ));
        }
        outputs.push(id);
    }
    (outputs, diags)
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Lower `graph` under `schedule` for the boxes in `request`.
pub fn lower(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    request: &Request,
    options: &LowerOptions,
) -> Result<LoweredPipeline, LowerError> {
    let state = lower_until(graph, schedule, request, options, PassId::Synthesize)?;
    let t = Instant::now();
    let lowered = assemble(&state, request)?;
    let placement = need(state.placement.as_ref(), PassId::Synthesize, "placement")?;
    let bounds = need(state.bounds.as_ref(), PassId::Synthesize, "bounds")?;
    let cert = verify(&state.graph, placement, bounds, &lowered);
    tracing::debug!(
        pass = "verify",
        elapsed_ms = t.elapsed().as_secs_f64() * 1000.0,
        "pass complete"
    );
    if !cert.all_pass() {
        let failed: Vec<_> = cert
            .obligations()
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| *name)
            .collect();
        return Err(LowerError {
            failing_pass: PassId::Synthesize,
            diagnostics: vec![Diagnostic::error(
                codes::E0600,
                Subject::none(),
                format!("lowering verification failed: {}", failed.join(", ")),
            )],
        });
    }
    Ok(lowered)
}

/// Run the minimal set of passes to produce `terminal`.
///
/// The caller's graph and schedule are never modified.
pub fn lower_until(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    request: &Request,
    options: &LowerOptions,
    terminal: PassId,
) -> Result<LoweringState, LowerError> {
    let mut state = LoweringState::new(graph, schedule);

    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        match pass_id {
            PassId::Validate => {
                let (outputs, mut diags) = resolve_outputs(&state.graph, request);
                if diags.is_empty() {
                    let v = validate(&state.graph, &outputs);
                    state.graph.set_value_types(&v.value_types);
                    diags = v.diagnostics;
                }
                state.outputs = outputs;
                finish_pass(&mut state, pass_id, diags, t.elapsed())?;
            }
            PassId::Rfactor => {
                let result = apply_rfactors(&state.graph, &state.schedule.rfactors);
                state.graph = result.graph;
                state.intermediates = result.intermediates;
                finish_pass(&mut state, pass_id, result.diagnostics, t.elapsed())?;
            }
            PassId::CheckSchedule => {
                let defaults = ScheduleModel::new(&state.graph);
                for fs in defaults.funcs() {
                    if state.schedule.get(&fs.name).is_none() {
                        state.schedule.insert(fs.clone());
                    }
                }
                let names: Vec<String> = request.names().map(str::to_string).collect();
                state.schedule.resolve_default_placement(&state.graph, &names);
                let diags = check_schedule(&state.graph, &state.schedule, &state.outputs, options);
                finish_pass(&mut state, pass_id, diags, t.elapsed())?;
            }
            PassId::Inline => {
                let result = inline_funcs(&state.graph, &state.schedule, &state.outputs);
                state.graph = result.graph;
                state.inlined = result.inlined;
                finish_pass(&mut state, pass_id, result.diagnostics, t.elapsed())?;
            }
            PassId::Place => {
                let result = place(&state.graph, &state.schedule, &state.outputs);
                let mut diags = result.diagnostics;
                diags.extend(check_placement(&state.graph, &result.placement));
                state.placement = Some(result.placement);
                finish_pass(&mut state, pass_id, diags, t.elapsed())?;
            }
            PassId::Bounds => {
                let placement = need(state.placement.as_ref(), pass_id, "placement")?;
                let result = infer_bounds(&state.graph, &state.schedule, placement, request, options);
                state.bounds = Some(result.bounds);
                finish_pass(&mut state, pass_id, result.diagnostics, t.elapsed())?;
            }
            PassId::CheckLegality => {
                let placement = need(state.placement.as_ref(), pass_id, "placement")?;
                let bounds = need(state.bounds.as_ref(), pass_id, "bounds")?;
                let diags = check_bounded(&state.graph, &state.schedule, placement, bounds);
                finish_pass(&mut state, pass_id, diags, t.elapsed())?;
            }
            PassId::Fuse => {
                let placement = need(state.placement.as_ref(), pass_id, "placement")?;
                let bounds = need(state.bounds.as_mut(), pass_id, "bounds")?;
                let result = fuse(&state.graph, placement, bounds);
                state.fuse_plan = Some(result.plan);
                finish_pass(&mut state, pass_id, result.diagnostics, t.elapsed())?;
            }
            PassId::Storage => {
                let placement = need(state.placement.as_ref(), pass_id, "placement")?;
                let bounds = need(state.bounds.as_ref(), pass_id, "bounds")?;
                let result = allocate(&state.graph, &state.schedule, placement, bounds, options);
                state.storage = Some(result.plan);
                finish_pass(&mut state, pass_id, result.diagnostics, t.elapsed())?;
            }
            PassId::Synthesize => {
                let placement = need(state.placement.as_ref(), pass_id, "placement")?;
                let bounds = need(state.bounds.as_ref(), pass_id, "bounds")?;
                let plan = need(state.fuse_plan.as_ref(), pass_id, "fuse plan")?;
                let storage = need(state.storage.as_ref(), pass_id, "storage plan")?;
                let result = synthesize(&state.graph, &state.schedule, placement, bounds, plan, storage);
                state.body = Some(result.body);
                finish_pass(&mut state, pass_id, result.diagnostics, t.elapsed())?;
            }
        }
    }
    Ok(state)
}

/// Build the hand-off IR from a state that ran every pass.
fn assemble(state: &LoweringState, request: &Request) -> Result<LoweredPipeline, LowerError> {
    let pass = PassId::Synthesize;
    let graph = &state.graph;
    let placement = need(state.placement.as_ref(), pass, "placement")?;
    let bounds = need(state.bounds.as_ref(), pass, "bounds")?;
    let storage = need(state.storage.as_ref(), pass, "storage plan")?;
    let body = need(state.body.as_ref(), pass, "loop nest")?;

    let names = NameTable {
        funcs: graph
            .funcs()
            .iter()
            .filter(|f| placement.is_realized(f.id))
            .map(|f| FuncMeta {
                id: f.id,
                name: f.name.clone(),
                value_types: f.value_types.clone(),
            })
            .collect(),
        inputs: graph
            .inputs()
            .iter()
            .map(|i| InputMeta {
                id: i.id,
                name: i.name.clone(),
                dims: i.dims,
                ty: i.ty,
            })
            .collect(),
    };
    let outputs = request
        .outputs
        .iter()
        .filter_map(|o| {
            graph.func_by_name(&o.func).map(|func| OutputBuffer {
                func,
                name: o.func.clone(),
                region: o.region.clone(),
            })
        })
        .collect();
    let regions = placement
        .order
        .iter()
        .filter_map(|f| {
            let fb = bounds.get(*f)?;
            Some(RealizedRegion {
                func: *f,
                name: fb.name.clone(),
                computed: fb.computed.clone(),
                hull: hull(bounds, *f).unwrap_or_default(),
            })
        })
        .collect();
    let input_regions = bounds
        .inputs
        .iter()
        .map(|(id, region)| {
            let boxes = region
                .iter()
                .filter_map(|i| bounds.table.concretize(i).as_constant_range())
                .collect();
            (graph.input(*id).name.clone(), boxes)
        })
        .collect();
    let allocations = placement
        .order
        .iter()
        .filter_map(|f| storage.get(*f).cloned())
        .collect();

    Ok(LoweredPipeline {
        names,
        outputs,
        allocations,
        regions,
        input_regions,
        body: body.clone(),
        warnings: state.warnings.clone(),
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
