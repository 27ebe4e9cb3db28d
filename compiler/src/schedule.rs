// schedule.rs — Scheduling directives and per-stage loop skeletons
//
// A `ScheduleModel` is authored independently of the graph's arena ids: it is
// keyed by Func name. Each stage owns an ordered list of loop dimensions
// (outermost first) that directives rewrite in place; splits and fuses are
// also recorded as transforms so synthesis can rebuild every original
// variable from the final loop symbols.
//
// Preconditions: `ScheduleModel::new` receives the graph the schedule is for.
// Postconditions: every directive either applies completely or returns a
//                 `Diagnostic` and leaves the stage unchanged.
// Failure modes: unknown/duplicate names (E0316), bad factors (E0317),
//                redefined memoization key (E0309), bad rfactor (E0501).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::diag::{codes, DiagCode, Diagnostic, Subject};
use crate::graph::PipelineGraph;
use crate::id::FuncId;

// ── Loop levels and loop kinds ──────────────────────────────────────────────

/// A point in the loop nest: outside everything, nowhere, or inside the loop
/// over `var` of stage `stage` of Func `func`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LoopLevel {
    Inline,
    Root,
    At {
        func: String,
        stage: usize,
        var: String,
    },
}

impl LoopLevel {
    /// Inside the loop over `var` of the pure stage of `func`.
    pub fn at(func: &str, var: &str) -> Self {
        LoopLevel::at_stage(func, 0, var)
    }

    pub fn at_stage(func: &str, stage: usize, var: &str) -> Self {
        LoopLevel::At {
            func: func.to_string(),
            stage,
            var: var.to_string(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, LoopLevel::Inline)
    }
}

impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLevel::Inline => write!(f, "inline"),
            LoopLevel::Root => write!(f, "root"),
            LoopLevel::At { func, stage, var } => write!(f, "{}", loop_sym(func, *stage, var)),
        }
    }
}

/// Globally unique name of the loop over `var` in stage `stage` of `func`.
pub fn loop_sym(func: &str, stage: usize, var: &str) -> String {
    format!("{func}.s{stage}.{var}")
}

/// How the loop over a non-dividing split extent is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TailStrategy {
    Auto,
    /// Compute past the end; the allocation grows to a multiple of the factor.
    RoundUp,
    GuardWithIf,
    /// Shift the last iteration back so it ends at the extent (recomputes).
    ShiftInwards,
    ShiftInwardsAndBlend,
    /// Round up, predicating every load and store.
    Predicate,
}

impl TailStrategy {
    /// Concrete strategy for `Auto`.
    pub fn resolve(self, is_update: bool, is_output: bool) -> TailStrategy {
        match self {
            TailStrategy::Auto if is_update => TailStrategy::GuardWithIf,
            TailStrategy::Auto if is_output => TailStrategy::ShiftInwards,
            TailStrategy::Auto => TailStrategy::RoundUp,
            other => other,
        }
    }
}

/// Execution strategy tag of one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    GpuBlock,
    GpuThread,
}

impl ForKind {
    /// Iterations may run concurrently, so writes must not collide.
    pub fn is_concurrent(self) -> bool {
        matches!(
            self,
            ForKind::Parallel | ForKind::Vectorized | ForKind::GpuBlock | ForKind::GpuThread
        )
    }

    /// Runs on multiple threads (vectorized lanes excluded).
    pub fn is_threaded(self) -> bool {
        matches!(self, ForKind::Parallel | ForKind::GpuBlock | ForKind::GpuThread)
    }
}

impl fmt::Display for ForKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForKind::Serial => "for",
            ForKind::Parallel => "parallel",
            ForKind::Vectorized => "vectorized",
            ForKind::Unrolled => "unrolled",
            ForKind::GpuBlock => "gpu_block",
            ForKind::GpuThread => "gpu_thread",
        };
        write!(f, "{s}")
    }
}

/// Loop partitioning policy (peeling of boundary iterations by the backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Partition {
    Auto,
    Never,
    Always,
}

// ── Stage skeleton ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopDim {
    pub name: String,
    pub kind: ForKind,
    pub partition: Partition,
    /// Derived from reduction variables.
    pub rvar: bool,
}

impl LoopDim {
    fn new(name: impl Into<String>, rvar: bool) -> Self {
        LoopDim {
            name: name.into(),
            kind: ForKind::Serial,
            partition: Partition::Auto,
            rvar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Transform {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i64,
        tail: TailStrategy,
    },
    Fuse {
        inner: String,
        outer: String,
        fused: String,
    },
}

/// `compute_with` target: run this stage inside the loop over `var` of
/// stage `stage` of `func`, after that stage's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuseTarget {
    pub func: String,
    pub stage: usize,
    pub var: String,
}

/// Loop skeleton and annotations of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageSchedule {
    pub func: String,
    pub stage: usize,
    /// Outermost first.
    pub dims: Vec<LoopDim>,
    pub transforms: Vec<Transform>,
    pub compute_with: Option<FuseTarget>,
    pub allow_race: bool,
    pub atomic: bool,
    /// Set by any directive; drives the partial-schedule warning.
    pub touched: bool,
    /// Reduction variables of the stage before any transform.
    pub rvars: Vec<String>,
    used_names: BTreeSet<String>,
}

type DirectiveResult<'a> = Result<&'a mut StageSchedule, Diagnostic>;

impl StageSchedule {
    /// Default loop order: for pure stages the last argument is outermost;
    /// update stages put pure variables outside reduction variables, with the
    /// first reduction variable innermost.
    pub fn new(func: &str, stage: usize, pure: &[String], rvars: &[String], reserved: &[String]) -> Self {
        let mut dims: Vec<LoopDim> = pure.iter().rev().map(|p| LoopDim::new(p.clone(), false)).collect();
        dims.extend(rvars.iter().rev().map(|r| LoopDim::new(r.clone(), true)));
        let used_names = pure
            .iter()
            .chain(rvars)
            .chain(reserved)
            .cloned()
            .collect();
        StageSchedule {
            func: func.to_string(),
            stage,
            dims,
            transforms: Vec::new(),
            compute_with: None,
            allow_race: false,
            atomic: false,
            touched: false,
            rvars: rvars.to_vec(),
            used_names,
        }
    }

    fn error(&self, code: DiagCode, var: &str, message: String) -> Diagnostic {
        Diagnostic::error(code, Subject::dim(&self.func, var), message)
    }

    fn position(&self, var: &str) -> Result<usize, Diagnostic> {
        self.dims.iter().position(|d| d.name == var).ok_or_else(|| {
            self.error(
                codes::E0316,
                var,
                format!("'{var}' is not a loop of {}.s{}", self.func, self.stage),
            )
        })
    }

    fn fresh(&self, var: &str) -> Result<(), Diagnostic> {
        if self.used_names.contains(var) {
            return Err(self.error(
                codes::E0316,
                var,
                format!("loop name '{var}' is already used in {}.s{}", self.func, self.stage),
            ));
        }
        Ok(())
    }

    pub fn dim(&self, var: &str) -> Option<&LoopDim> {
        self.dims.iter().find(|d| d.name == var)
    }

    pub fn sym(&self, var: &str) -> String {
        loop_sym(&self.func, self.stage, var)
    }

    /// The original variables a loop dimension was derived from.
    pub fn roots(&self, var: &str) -> BTreeSet<String> {
        for t in self.transforms.iter().rev() {
            match t {
                Transform::Split {
                    old, outer, inner, ..
                } if outer == var || inner == var => return self.roots(old),
                Transform::Fuse {
                    inner,
                    outer,
                    fused,
                } if fused == var => {
                    let mut out = self.roots(inner);
                    out.extend(self.roots(outer));
                    return out;
                }
                _ => {}
            }
        }
        BTreeSet::from([var.to_string()])
    }

    /// Position of a derived dimension in its split tree: `0` per outer and
    /// `1` per inner step from the root. Lexicographic order of paths is the
    /// original traversal order.
    pub fn split_path(&self, var: &str) -> Vec<u8> {
        for t in self.transforms.iter().rev() {
            match t {
                Transform::Split {
                    old, outer, inner, ..
                } if outer == var || inner == var => {
                    let mut p = self.split_path(old);
                    p.push(u8::from(inner == var));
                    return p;
                }
                Transform::Fuse { outer, fused, .. } if fused == var => {
                    return self.split_path(outer);
                }
                _ => {}
            }
        }
        Vec::new()
    }

    pub fn split(
        &mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: i64,
        tail: TailStrategy,
    ) -> DirectiveResult<'_> {
        let pos = self.position(old)?;
        self.fresh(outer)?;
        self.fresh(inner)?;
        if outer == inner {
            return Err(self.error(codes::E0316, outer, format!("split of '{old}' names both halves '{outer}'")));
        }
        if factor < 1 {
            return Err(self.error(codes::E0317, old, format!("split factor {factor} of '{old}' must be positive")));
        }
        let rvar = self.dims[pos].rvar;
        self.dims.splice(pos..=pos, [LoopDim::new(outer, rvar), LoopDim::new(inner, rvar)]);
        self.used_names.insert(outer.to_string());
        self.used_names.insert(inner.to_string());
        self.transforms.push(Transform::Split {
            old: old.to_string(),
            outer: outer.to_string(),
            inner: inner.to_string(),
            factor,
            tail,
        });
        self.touched = true;
        Ok(self)
    }

    /// Merge `outer` and the loop directly inside it, `inner`, into `fused`.
    pub fn fuse(&mut self, inner: &str, outer: &str, fused: &str) -> DirectiveResult<'_> {
        let pi = self.position(inner)?;
        let po = self.position(outer)?;
        self.fresh(fused)?;
        if po + 1 != pi {
            return Err(self.error(
                codes::E0317,
                fused,
                format!("cannot fuse '{outer}' and '{inner}': '{outer}' must directly enclose '{inner}'"),
            ));
        }
        if self.dims[pi].rvar != self.dims[po].rvar {
            return Err(self.error(
                codes::E0317,
                fused,
                format!("cannot fuse pure '{outer}' with reduction '{inner}'"),
            ));
        }
        let rvar = self.dims[pi].rvar;
        self.dims.splice(po..=pi, [LoopDim::new(fused, rvar)]);
        self.used_names.insert(fused.to_string());
        self.transforms.push(Transform::Fuse {
            inner: inner.to_string(),
            outer: outer.to_string(),
            fused: fused.to_string(),
        });
        self.touched = true;
        Ok(self)
    }

    /// Permute the listed loops (given outermost first) among the positions
    /// they currently occupy.
    pub fn reorder(&mut self, vars: &[&str]) -> DirectiveResult<'_> {
        let mut positions = Vec::with_capacity(vars.len());
        for v in vars {
            let p = self.position(v)?;
            if positions.contains(&p) {
                return Err(self.error(codes::E0316, v, format!("'{v}' appears twice in reorder")));
            }
            positions.push(p);
        }
        let moved: Vec<LoopDim> = positions.iter().map(|p| self.dims[*p].clone()).collect();
        let mut slots = positions.clone();
        slots.sort_unstable();
        for (slot, dim) in slots.into_iter().zip(moved) {
            self.dims[slot] = dim;
        }
        self.touched = true;
        Ok(self)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tile(
        &mut self,
        x: &str,
        y: &str,
        xo: &str,
        yo: &str,
        xi: &str,
        yi: &str,
        xf: i64,
        yf: i64,
        tail: TailStrategy,
    ) -> DirectiveResult<'_> {
        let saved = self.clone();
        let result = self
            .split(x, xo, xi, xf, tail)
            .and_then(|s| s.split(y, yo, yi, yf, tail))
            .and_then(|s| s.reorder(&[yo, xo, yi, xi]))
            .map(|_| ());
        if let Err(e) = result {
            *self = saved;
            return Err(e);
        }
        Ok(self)
    }

    fn set_kind(&mut self, var: &str, kind: ForKind) -> DirectiveResult<'_> {
        let p = self.position(var)?;
        self.dims[p].kind = kind;
        self.touched = true;
        Ok(self)
    }

    pub fn vectorize(&mut self, var: &str) -> DirectiveResult<'_> {
        self.set_kind(var, ForKind::Vectorized)
    }

    /// Split off an inner loop of `width` lanes and vectorize it.
    pub fn vectorize_by(&mut self, var: &str, width: i64) -> DirectiveResult<'_> {
        let (outer, inner) = (format!("{var}_vo"), format!("{var}_vi"));
        self.split(var, &outer, &inner, width, TailStrategy::Auto)?;
        self.set_kind(&inner, ForKind::Vectorized)
    }

    pub fn unroll(&mut self, var: &str) -> DirectiveResult<'_> {
        self.set_kind(var, ForKind::Unrolled)
    }

    pub fn unroll_by(&mut self, var: &str, factor: i64) -> DirectiveResult<'_> {
        let (outer, inner) = (format!("{var}_uo"), format!("{var}_ui"));
        self.split(var, &outer, &inner, factor, TailStrategy::Auto)?;
        self.set_kind(&inner, ForKind::Unrolled)
    }

    pub fn parallel(&mut self, var: &str) -> DirectiveResult<'_> {
        self.set_kind(var, ForKind::Parallel)
    }

    pub fn serial(&mut self, var: &str) -> DirectiveResult<'_> {
        self.set_kind(var, ForKind::Serial)
    }

    pub fn gpu_blocks(&mut self, var: &str) -> DirectiveResult<'_> {
        self.set_kind(var, ForKind::GpuBlock)
    }

    pub fn gpu_threads(&mut self, var: &str) -> DirectiveResult<'_> {
        self.set_kind(var, ForKind::GpuThread)
    }

    /// Tile `x`/`y` and map tiles to gpu blocks, points within to threads.
    #[allow(clippy::too_many_arguments)]
    pub fn gpu_tile(
        &mut self,
        x: &str,
        y: &str,
        bx: &str,
        by: &str,
        tx: &str,
        ty: &str,
        xf: i64,
        yf: i64,
        tail: TailStrategy,
    ) -> DirectiveResult<'_> {
        self.tile(x, y, bx, by, tx, ty, xf, yf, tail)?
            .gpu_blocks(bx)?
            .gpu_blocks(by)?
            .gpu_threads(tx)?
            .gpu_threads(ty)
    }

    pub fn partition(&mut self, var: &str, policy: Partition) -> DirectiveResult<'_> {
        let p = self.position(var)?;
        self.dims[p].partition = policy;
        self.touched = true;
        Ok(self)
    }

    /// Fuse this stage into the loop nest of another stage at `level`.
    pub fn compute_with(&mut self, level: LoopLevel) -> DirectiveResult<'_> {
        match level {
            LoopLevel::At { func, stage, var } => {
                self.position(&var)?;
                self.compute_with = Some(FuseTarget { func, stage, var });
                self.touched = true;
                Ok(self)
            }
            other => Err(self.error(
                codes::E0308,
                "",
                format!("compute_with needs a loop level, got {other}"),
            )),
        }
    }

    pub fn allow_race_conditions(&mut self) -> DirectiveResult<'_> {
        self.allow_race = true;
        self.touched = true;
        Ok(self)
    }

    /// Permit colliding writes; the backend serializes them atomically.
    pub fn atomic(&mut self) -> DirectiveResult<'_> {
        self.atomic = true;
        self.touched = true;
        Ok(self)
    }

    /// Drop every transform and loop derived from reduction variables other
    /// than `keep`, which become root loops. Used by rfactor.
    pub(crate) fn retain_rvars(&mut self, keep: &[String]) {
        self.dims.retain(|d| !d.rvar || keep.contains(&d.name));
        let keep_mask: Vec<bool> = self
            .transforms
            .iter()
            .map(|t| match t {
                Transform::Split { old, .. } => !self.is_rvar_derived(old),
                Transform::Fuse { .. } => true,
            })
            .collect();
        let mut mask = keep_mask.into_iter();
        self.transforms.retain(|_| mask.next().unwrap_or(true));
        self.rvars = keep.iter().rev().cloned().collect();
    }

    /// True when a loop is derived only from reduction variables.
    pub fn is_rvar_derived(&self, var: &str) -> bool {
        self.roots(var).iter().all(|r| self.rvars.contains(r))
    }

    /// Pure variables of the stage, in argument order of `args`.
    pub fn pure_vars(&self, args: &[String]) -> Vec<String> {
        let roots: BTreeSet<String> = self
            .dims
            .iter()
            .filter(|d| !d.rvar)
            .flat_map(|d| self.roots(&d.name))
            .collect();
        args.iter().filter(|a| roots.contains(*a)).cloned().collect()
    }
}

// ── Func schedule ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimBound {
    /// `None` for `bound_extent` (min stays inferred).
    pub min: Option<i64>,
    pub extent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoizeSpec {
    pub eviction_key: Option<String>,
}

/// Placement and storage directives of one Func plus its stage skeletons.
#[derive(Debug, Clone, Serialize)]
pub struct FuncSchedule {
    pub name: String,
    pub args: Vec<String>,
    pub compute: LoopLevel,
    /// `compute` was set by a directive rather than defaulted.
    pub compute_explicit: bool,
    /// `None` stores at the compute level.
    pub store: Option<LoopLevel>,
    pub hoist: Option<LoopLevel>,
    pub bounds: BTreeMap<String, DimBound>,
    pub align_bounds: BTreeMap<String, (i64, i64)>,
    pub storage_bounds: BTreeMap<String, i64>,
    pub allocation_bound: Option<i64>,
    pub storage_align: BTreeMap<String, i64>,
    pub folds: BTreeMap<String, i64>,
    pub ring_buffer: Option<i64>,
    pub memoize: Option<MemoizeSpec>,
    pub stages: Vec<StageSchedule>,
}

type FuncResult<'a> = Result<&'a mut FuncSchedule, Diagnostic>;

impl FuncSchedule {
    pub fn new(name: &str, args: Vec<String>, stages: Vec<StageSchedule>) -> Self {
        FuncSchedule {
            name: name.to_string(),
            args,
            compute: LoopLevel::Inline,
            compute_explicit: false,
            store: None,
            hoist: None,
            bounds: BTreeMap::new(),
            align_bounds: BTreeMap::new(),
            storage_bounds: BTreeMap::new(),
            allocation_bound: None,
            storage_align: BTreeMap::new(),
            folds: BTreeMap::new(),
            ring_buffer: None,
            memoize: None,
            stages,
        }
    }

    fn arg(&self, dim: &str) -> Result<(), Diagnostic> {
        if self.args.iter().any(|a| a == dim) {
            Ok(())
        } else {
            Err(Diagnostic::error(
                codes::E0316,
                Subject::dim(&self.name, dim),
                format!("'{dim}' is not an argument of '{}'", self.name),
            ))
        }
    }

    fn positive(&self, dim: &str, what: &str, v: i64) -> Result<(), Diagnostic> {
        if v >= 1 {
            Ok(())
        } else {
            Err(Diagnostic::error(
                codes::E0317,
                Subject::dim(&self.name, dim),
                format!("{what} {v} of '{}' must be positive", self.name),
            ))
        }
    }

    pub fn stage(&self, stage: usize) -> Option<&StageSchedule> {
        self.stages.get(stage)
    }

    /// Effective store level.
    pub fn store_level(&self) -> &LoopLevel {
        self.store.as_ref().unwrap_or(&self.compute)
    }

    pub fn compute_at(&mut self, level: LoopLevel) -> FuncResult<'_> {
        self.compute = level;
        self.compute_explicit = true;
        Ok(self)
    }

    pub fn compute_root(&mut self) -> FuncResult<'_> {
        self.compute_at(LoopLevel::Root)
    }

    pub fn compute_inline(&mut self) -> FuncResult<'_> {
        self.compute_at(LoopLevel::Inline)
    }

    pub fn store_at(&mut self, level: LoopLevel) -> FuncResult<'_> {
        self.store = Some(level);
        Ok(self)
    }

    pub fn store_root(&mut self) -> FuncResult<'_> {
        self.store_at(LoopLevel::Root)
    }

    /// Keep the allocation alive from `level` down to the store level.
    pub fn hoist_storage(&mut self, level: LoopLevel) -> FuncResult<'_> {
        self.hoist = Some(level);
        Ok(self)
    }

    pub fn hoist_storage_root(&mut self) -> FuncResult<'_> {
        self.hoist_storage(LoopLevel::Root)
    }

    /// Fix the realized interval of `dim` to `[min, min + extent)`.
    pub fn bound(&mut self, dim: &str, min: i64, extent: i64) -> FuncResult<'_> {
        self.arg(dim)?;
        self.positive(dim, "bound extent", extent)?;
        self.bounds.insert(
            dim.to_string(),
            DimBound {
                min: Some(min),
                extent,
            },
        );
        Ok(self)
    }

    pub fn bound_extent(&mut self, dim: &str, extent: i64) -> FuncResult<'_> {
        self.arg(dim)?;
        self.positive(dim, "bound extent", extent)?;
        self.bounds.insert(dim.to_string(), DimBound { min: None, extent });
        Ok(self)
    }

    /// Expand the realized interval so its min is `remainder` modulo
    /// `modulus` and its extent a multiple of `modulus`.
    pub fn align_bounds(&mut self, dim: &str, modulus: i64, remainder: i64) -> FuncResult<'_> {
        self.arg(dim)?;
        self.positive(dim, "alignment", modulus)?;
        self.align_bounds
            .insert(dim.to_string(), (modulus, remainder.rem_euclid(modulus)));
        Ok(self)
    }

    pub fn bound_storage(&mut self, dim: &str, extent: i64) -> FuncResult<'_> {
        self.arg(dim)?;
        self.positive(dim, "storage extent", extent)?;
        self.storage_bounds.insert(dim.to_string(), extent);
        Ok(self)
    }

    /// Upper limit on the total allocation size in bytes.
    pub fn bound_allocation(&mut self, bytes: i64) -> FuncResult<'_> {
        self.positive("", "allocation bound", bytes)?;
        self.allocation_bound = Some(bytes);
        Ok(self)
    }

    pub fn align_storage(&mut self, dim: &str, alignment: i64) -> FuncResult<'_> {
        self.arg(dim)?;
        self.positive(dim, "storage alignment", alignment)?;
        self.storage_align.insert(dim.to_string(), alignment);
        Ok(self)
    }

    /// Address `dim` of the allocation modulo `factor`.
    pub fn fold_storage(&mut self, dim: &str, factor: i64) -> FuncResult<'_> {
        self.arg(dim)?;
        self.positive(dim, "fold factor", factor)?;
        self.folds.insert(dim.to_string(), factor);
        Ok(self)
    }

    pub fn ring_buffer(&mut self, depth: i64) -> FuncResult<'_> {
        self.positive("", "ring buffer depth", depth)?;
        self.ring_buffer = Some(depth);
        Ok(self)
    }

    pub fn memoize(&mut self) -> FuncResult<'_> {
        if self.memoize.is_none() {
            self.memoize = Some(MemoizeSpec { eviction_key: None });
        }
        Ok(self)
    }

    pub fn memoize_with_key(&mut self, key: &str) -> FuncResult<'_> {
        if let Some(MemoizeSpec {
            eviction_key: Some(old),
        }) = &self.memoize
        {
            return Err(Diagnostic::error(
                codes::E0309,
                Subject::func(&self.name),
                format!("memoization key of '{}' already set to '{old}'", self.name),
            ));
        }
        self.memoize = Some(MemoizeSpec {
            eviction_key: Some(key.to_string()),
        });
        Ok(self)
    }
}

// ── Schedule model ──────────────────────────────────────────────────────────

/// A recorded `rfactor` request, applied to a working copy of the graph by
/// the lowering pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RfactorRequest {
    pub func: String,
    pub stage: usize,
    /// `(reduction loop, new pure variable of the intermediate)`.
    pub preserved: Vec<(String, String)>,
    pub intermediate: String,
    /// Rvar splits in force when the request was made.
    pub splits: Vec<Transform>,
    /// Every reduction loop of the stage, outermost first.
    pub rvar_loops: Vec<String>,
    pub assume_associative: bool,
}

/// Schedule for a whole pipeline, keyed by Func name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleModel {
    funcs: BTreeMap<String, FuncSchedule>,
    pub rfactors: Vec<RfactorRequest>,
}

impl ScheduleModel {
    /// Default schedule for every defined Func of `graph`.
    pub fn new(graph: &PipelineGraph) -> Self {
        let mut model = ScheduleModel::default();
        for f in graph.funcs() {
            if f.pure_def.is_none() {
                continue;
            }
            model.funcs.insert(f.name.clone(), default_func_schedule(graph, f.id));
        }
        model
    }

    pub fn get(&self, func: &str) -> Option<&FuncSchedule> {
        self.funcs.get(func)
    }

    pub fn funcs(&self) -> impl Iterator<Item = &FuncSchedule> {
        self.funcs.values()
    }

    pub fn insert(&mut self, schedule: FuncSchedule) {
        self.funcs.insert(schedule.name.clone(), schedule);
    }

    pub fn func_mut(&mut self, func: &str) -> Result<&mut FuncSchedule, Diagnostic> {
        self.funcs
            .get_mut(func)
            .ok_or_else(|| Diagnostic::error(codes::E0102, Subject::func(func), format!("no func named '{func}'")))
    }

    pub fn stage_mut(&mut self, func: &str, stage: usize) -> Result<&mut StageSchedule, Diagnostic> {
        let f = self.func_mut(func)?;
        let count = f.stages.len();
        f.stages.get_mut(stage).ok_or_else(|| {
            Diagnostic::error(
                codes::E0102,
                Subject::func(func),
                format!("'{func}' has {count} stages, no stage {stage}"),
            )
        })
    }

    /// Settle compute levels left at their default: outputs and Funcs with
    /// update definitions are computed at root, everything else inline.
    pub fn resolve_default_placement(&mut self, graph: &PipelineGraph, outputs: &[String]) {
        for f in self.funcs.values_mut() {
            if f.compute_explicit {
                continue;
            }
            let has_updates = f.stages.len() > 1
                || graph
                    .func_by_name(&f.name)
                    .is_some_and(|id| !graph.func(id).updates.is_empty());
            f.compute = if outputs.contains(&f.name) || has_updates {
                LoopLevel::Root
            } else {
                LoopLevel::Inline
            };
        }
    }

    /// Schedule of the `k`th update definition.
    pub fn update_mut(&mut self, func: &str, k: usize) -> Result<&mut StageSchedule, Diagnostic> {
        self.stage_mut(func, k + 1)
    }

    /// Factor the reduction of `func` stage `stage` along the `preserved`
    /// reduction loops into a new Func `intermediate`, whose extra pure
    /// variables are the second element of each pair. Returns the
    /// intermediate's schedule (computed at root by default).
    pub fn rfactor(
        &mut self,
        graph: &PipelineGraph,
        func: &str,
        stage: usize,
        preserved: &[(&str, &str)],
        intermediate: &str,
    ) -> Result<&mut FuncSchedule, Diagnostic> {
        self.rfactor_impl(graph, func, stage, preserved, intermediate, false)
    }

    /// As `rfactor`, but the caller vouches that the update's combining
    /// operator is associative and commutative when it cannot be proven.
    pub fn rfactor_assume_associative(
        &mut self,
        graph: &PipelineGraph,
        func: &str,
        stage: usize,
        preserved: &[(&str, &str)],
        intermediate: &str,
    ) -> Result<&mut FuncSchedule, Diagnostic> {
        self.rfactor_impl(graph, func, stage, preserved, intermediate, true)
    }

    fn rfactor_impl(
        &mut self,
        graph: &PipelineGraph,
        func: &str,
        stage: usize,
        preserved: &[(&str, &str)],
        intermediate: &str,
        assume_associative: bool,
    ) -> Result<&mut FuncSchedule, Diagnostic> {
        let invalid = |msg: String| Diagnostic::error(codes::E0501, Subject::func(func), msg);
        if self.funcs.contains_key(intermediate) || graph.func_by_name(intermediate).is_some() {
            return Err(invalid(format!("rfactor intermediate '{intermediate}' already exists")));
        }
        let args = self.func_mut(func)?.args.clone();
        let s = self.stage_mut(func, stage)?;
        if stage == 0 || !s.dims.iter().any(|d| d.rvar) {
            return Err(invalid(format!("{func}.s{stage} is not a reduction")));
        }
        if preserved.is_empty() {
            return Err(invalid("rfactor needs at least one preserved reduction loop".to_string()));
        }
        let mut keep = Vec::new();
        let mut new_vars = Vec::new();
        for (rv, pure) in preserved {
            match s.dim(rv) {
                Some(d) if d.rvar => {}
                _ => return Err(invalid(format!("'{rv}' is not a reduction loop of {func}.s{stage}"))),
            }
            if args.iter().any(|a| a == pure) || new_vars.contains(&pure.to_string()) {
                return Err(invalid(format!("rfactor variable '{pure}' clashes with an existing argument")));
            }
            if keep.contains(&rv.to_string()) {
                return Err(invalid(format!("'{rv}' is preserved twice")));
            }
            keep.push(rv.to_string());
            new_vars.push(pure.to_string());
        }
        let rvar_loops: Vec<String> = s.dims.iter().filter(|d| d.rvar).map(|d| d.name.clone()).collect();
        if keep.len() == rvar_loops.len() {
            return Err(invalid("rfactor must leave at least one reduction loop to the intermediate".to_string()));
        }
        let mut splits = Vec::new();
        for t in &s.transforms {
            match t {
                Transform::Fuse { fused, .. } if s.dims.iter().any(|d| d.rvar && &d.name == fused) => {
                    return Err(invalid(format!("cannot rfactor through fused reduction loop '{fused}'")));
                }
                Transform::Split { old, .. } if s.is_rvar_derived(old) => splits.push(t.clone()),
                _ => {}
            }
        }
        // Preserved loops keep their relative nesting order.
        keep.sort_by_key(|k| rvar_loops.iter().position(|r| r == k));
        let update_pure = s.pure_vars(&args);
        self.rfactors.push(RfactorRequest {
            func: func.to_string(),
            stage,
            preserved: preserved.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect(),
            intermediate: intermediate.to_string(),
            splits,
            rvar_loops: rvar_loops.clone(),
            assume_associative,
        });
        self.stage_mut(func, stage)?.retain_rvars(&keep);

        let mut intm_args = args;
        intm_args.extend(new_vars.iter().cloned());
        let mut intm_pure = update_pure;
        intm_pure.extend(new_vars);
        // Stage constructor takes reduction variables innermost first.
        let remaining: Vec<String> = rvar_loops.into_iter().rev().filter(|r| !keep.contains(r)).collect();
        let stages = vec![
            StageSchedule::new(intermediate, 0, &intm_args, &[], &[]),
            StageSchedule::new(intermediate, 1, &intm_pure, &remaining, &intm_args),
        ];
        let mut schedule = FuncSchedule::new(intermediate, intm_args, stages);
        schedule.compute = LoopLevel::Root;
        schedule.compute_explicit = true;
        self.funcs.insert(intermediate.to_string(), schedule);
        self.func_mut(intermediate)
    }
}

fn default_func_schedule(graph: &PipelineGraph, id: FuncId) -> FuncSchedule {
    let f = graph.func(id);
    let args: Vec<String> = f.args.iter().map(|d| graph.dim(*d).name.clone()).collect();
    let stages = (0..f.stage_count())
        .map(|stage| {
            let pure: Vec<String> = graph
                .stage_pure_vars(id, stage)
                .iter()
                .map(|(_, d)| graph.dim(*d).name.clone())
                .collect();
            let rvars: Vec<String> = graph
                .stage_rdom(id, stage)
                .filter(|_| stage > 0)
                .map(|r| graph.rdom(r).vars.iter().map(|v| graph.dim(v.dim).name.clone()).collect())
                .unwrap_or_default();
            StageSchedule::new(&f.name, stage, &pure, &rvars, &args)
        })
        .collect();
    FuncSchedule::new(&f.name, args, stages)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn names(s: &StageSchedule) -> Vec<&str> {
        s.dims.iter().map(|d| d.name.as_str()).collect()
    }

    fn graph() -> PipelineGraph {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x", "y"]);
        let (x, y) = (g.var(f, "x").unwrap(), g.var(f, "y").unwrap());
        g.define(f, vec![x.clone() + y.clone()]);
        let r = g.add_rdom("r", &[("x", 0, 10), ("y", 0, 10)]);
        let (rx, ry) = (g.rvar(r, "x").unwrap(), g.rvar(r, "y").unwrap());
        g.update(f, vec![x, rx.clone()], vec![Expr::call(f, vec![ry.clone(), rx]) + ry]);
        g
    }

    #[test]
    fn default_loop_order() {
        let model = ScheduleModel::new(&graph());
        let f = model.get("f").unwrap();
        assert_eq!(names(&f.stages[0]), vec!["y", "x"]);
        assert_eq!(names(&f.stages[1]), vec!["x", "r.y", "r.x"]);
        assert_eq!(f.compute, LoopLevel::Inline);
    }

    #[test]
    fn split_then_reorder() {
        let mut model = ScheduleModel::new(&graph());
        let s = model.stage_mut("f", 0).unwrap();
        s.split("x", "xo", "xi", 8, TailStrategy::Auto)
            .unwrap()
            .reorder(&["xi", "y"])
            .unwrap();
        assert_eq!(names(s), vec!["xi", "xo", "y"]);
        assert_eq!(s.roots("xi"), BTreeSet::from(["x".to_string()]));
        assert_eq!(s.split_path("xi"), vec![1]);
    }

    #[test]
    fn retain_rvars_drops_reduction_splits() {
        let mut model = ScheduleModel::new(&graph());
        let s = model.stage_mut("f", 1).unwrap();
        s.split("x", "xo", "xi", 2, TailStrategy::GuardWithIf)
            .unwrap()
            .split("r.x", "rxo", "rxi", 5, TailStrategy::GuardWithIf)
            .unwrap();
        s.retain_rvars(&["r.y".to_string()]);
        assert_eq!(s.transforms.len(), 1);
        assert!(matches!(&s.transforms[0], Transform::Split { old, .. } if old == "x"));
        let n = names(s);
        assert!(n.contains(&"xo") && n.contains(&"xi") && n.contains(&"r.y"), "{n:?}");
        assert!(!n.contains(&"rxo") && !n.contains(&"rxi"), "{n:?}");
        assert_eq!(s.rvars, vec!["r.y".to_string()]);
    }

    #[test]
    fn tile_orders_tiles_outside_points() {
        let mut model = ScheduleModel::new(&graph());
        let s = model.stage_mut("f", 0).unwrap();
        s.tile("x", "y", "xo", "yo", "xi", "yi", 4, 4, TailStrategy::GuardWithIf)
            .unwrap();
        assert_eq!(names(s), vec!["yo", "xo", "yi", "xi"]);
    }

    #[test]
    fn reused_names_are_rejected() {
        let mut model = ScheduleModel::new(&graph());
        let s = model.stage_mut("f", 0).unwrap();
        let err = s.split("x", "y", "xi", 4, TailStrategy::Auto).unwrap_err();
        assert_eq!(err.code, Some(codes::E0316));
        let err = s.parallel("z").unwrap_err();
        assert_eq!(err.code, Some(codes::E0316));
        let err = s.split("x", "xo", "xi", 0, TailStrategy::Auto).unwrap_err();
        assert_eq!(err.code, Some(codes::E0317));
        assert_eq!(names(s), vec!["y", "x"]);
    }

    #[test]
    fn fuse_requires_adjacent_loops() {
        let mut model = ScheduleModel::new(&graph());
        let s = model.stage_mut("f", 0).unwrap();
        s.fuse("x", "y", "xy").unwrap();
        assert_eq!(names(s), vec!["xy"]);
        assert_eq!(s.roots("xy").len(), 2);
        let s1 = model.stage_mut("f", 1).unwrap();
        assert_eq!(s1.fuse("r.x", "x", "q").unwrap_err().code, Some(codes::E0317));
    }

    #[test]
    fn vectorize_by_names_fresh_loops() {
        let mut model = ScheduleModel::new(&graph());
        let s = model.stage_mut("f", 0).unwrap();
        s.vectorize_by("x", 8).unwrap();
        assert_eq!(names(s), vec!["y", "x_vo", "x_vi"]);
        assert_eq!(s.dim("x_vi").unwrap().kind, ForKind::Vectorized);
        assert!(s.touched);
    }

    #[test]
    fn memoize_key_cannot_be_redefined() {
        let mut model = ScheduleModel::new(&graph());
        let f = model.func_mut("f").unwrap();
        f.memoize_with_key("a").unwrap();
        let err = f.memoize_with_key("b").unwrap_err();
        assert_eq!(err.code, Some(codes::E0309));
    }

    #[test]
    fn bound_requires_known_argument() {
        let mut model = ScheduleModel::new(&graph());
        let f = model.func_mut("f").unwrap();
        assert!(f.bound("x", 0, 10).is_ok());
        assert_eq!(f.bound("z", 0, 10).unwrap_err().code, Some(codes::E0316));
    }

    #[test]
    fn rfactor_creates_intermediate_schedule() {
        let g = graph();
        let mut model = ScheduleModel::new(&g);
        model
            .update_mut("f", 0)
            .unwrap()
            .split("r.y", "ryo", "ryi", 5, TailStrategy::Auto)
            .unwrap();
        model.rfactor(&g, "f", 1, &[("ryo", "u")], "f_intm").unwrap();
        let f = model.get("f").unwrap();
        assert_eq!(names(&f.stages[1]), vec!["x", "ryo"]);
        let intm = model.get("f_intm").unwrap();
        assert_eq!(intm.args, vec!["x", "y", "u"]);
        assert_eq!(names(&intm.stages[1]), vec!["u", "x", "ryi", "r.x"]);
        assert_eq!(intm.compute, LoopLevel::Root);
        assert_eq!(model.rfactors[0].splits.len(), 1);
    }

    #[test]
    fn default_placement_roots_outputs_and_reductions() {
        let mut g = graph();
        let h = g.add_func("h", &["x"]);
        let x = g.var(h, "x").unwrap();
        g.define(h, vec![x]);
        let k = g.add_func("k", &["x"]);
        let x = g.var(k, "x").unwrap();
        g.define(k, vec![x]);
        let mut model = ScheduleModel::new(&g);
        model.resolve_default_placement(&g, &["k".to_string()]);
        assert_eq!(model.get("f").unwrap().compute, LoopLevel::Root);
        assert_eq!(model.get("h").unwrap().compute, LoopLevel::Inline);
        assert_eq!(model.get("k").unwrap().compute, LoopLevel::Root);
    }

    #[test]
    fn tail_strategy_auto_resolution() {
        assert_eq!(TailStrategy::Auto.resolve(true, false), TailStrategy::GuardWithIf);
        assert_eq!(TailStrategy::Auto.resolve(false, true), TailStrategy::ShiftInwards);
        assert_eq!(TailStrategy::Auto.resolve(false, false), TailStrategy::RoundUp);
        assert_eq!(TailStrategy::Predicate.resolve(false, false), TailStrategy::Predicate);
    }
}
