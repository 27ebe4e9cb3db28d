// storage.rs — Allocation shapes, folding, ring buffers and memoization keys
//
// Every realized non-output Func gets one allocation, opened at its
// hoist_storage site (the store_at site unless hoisted). The shape is the
// Func's computed region with every loop between the allocation site and the
// compute site relaxed away: the min of each dimension stays symbolic in the
// loops enclosing the allocation, the extent becomes the largest value it can
// take. Folded dimensions are addressed modulo their factor.
//
// Preconditions: bounds inferred and `legality::check_bounded` passed.
// Postconditions: every allocation has constant extents and a byte size
//                 within `LowerOptions::max_allocation_bytes`.
// Failure modes: explicit storage bound smaller than required → E0400;
//                allocation too large or of unknown size → E0401.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::bounds::{Bounds, FuncBounds};
use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::Expr;
use crate::graph::PipelineGraph;
use crate::id::FuncId;
use crate::interval::{display_region, Bound};
use crate::options::LowerOptions;
use crate::placement::{FuncPlacement, Placement, SiteKey};
use crate::schedule::{FuncSchedule, ScheduleModel};

// ── Public types ────────────────────────────────────────────────────────────

/// One dimension of an allocation. Coordinates map to `coord - min`, or to
/// `coord mod fold` when folded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocDim {
    pub min: Expr,
    pub extent: i64,
    pub fold: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub func: FuncId,
    pub name: String,
    pub site: SiteKey,
    pub shape: Vec<AllocDim>,
    /// Bytes of one element, summed over tuple components.
    pub elem_bytes: i64,
    pub ring: Option<i64>,
    /// Total bytes including every ring slot.
    pub bytes: i64,
    pub memo_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoragePlan {
    pub allocations: BTreeMap<FuncId, Allocation>,
}

impl StoragePlan {
    pub fn get(&self, func: FuncId) -> Option<&Allocation> {
        self.allocations.get(&func)
    }
}

#[derive(Debug)]
pub struct StorageResult {
    pub plan: StoragePlan,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn allocate(
    graph: &PipelineGraph,
    schedule: &ScheduleModel,
    placement: &Placement,
    bounds: &Bounds,
    options: &LowerOptions,
) -> StorageResult {
    let mut plan = StoragePlan::default();
    let mut diagnostics = Vec::new();
    for &f in &placement.order {
        if placement.is_output(f) {
            continue;
        }
        let (Some(fp), Some(fb)) = (placement.get(f), bounds.get(f)) else {
            continue;
        };
        let Some(fs) = schedule.get(&fb.name) else { continue };
        match allocation_for(graph, fs, fp, fb, bounds, options) {
            Ok(a) => {
                plan.allocations.insert(f, a);
            }
            Err(d) => diagnostics.push(d),
        }
    }
    StorageResult { plan, diagnostics }
}

fn allocation_for(
    graph: &PipelineGraph,
    fs: &FuncSchedule,
    fp: &FuncPlacement,
    fb: &FuncBounds,
    bounds: &Bounds,
    options: &LowerOptions,
) -> Result<Allocation, Diagnostic> {
    let name = &fb.name;
    let too_large = |message: String| Diagnostic::error(codes::E0401, Subject::func(name), message);
    let mut fixed: BTreeSet<String> = fp.hoist_path.iter().map(|l| l.sym.clone()).collect();
    fixed.extend(fp.hoist_path.iter().map(|l| l.own.clone()));

    let mut shape = Vec::with_capacity(fb.computed.len());
    for (j, interval) in fb.computed.iter().enumerate() {
        let dim = fs.args.get(j).cloned().unwrap_or_default();
        let relaxed = bounds.table.relax(interval, &fixed);
        let needed = relaxed
            .max_extent(&bounds.table)
            .ok_or_else(|| too_large(format!("extent of '{name}' along '{dim}' is unbounded at its storage site")))?;
        let fold = fs.folds.get(&dim).copied();
        let mut extent = fold.unwrap_or(needed);
        if let Some(&limit) = fs.storage_bounds.get(&dim) {
            if limit < extent {
                return Err(Diagnostic::error(
                    codes::E0400,
                    Subject::dim(name, &dim),
                    format!("'{name}' needs {extent} elements along '{dim}' but its storage is bounded to {limit}"),
                ));
            }
            extent = limit;
        }
        if let Some(&a) = fs.storage_align.get(&dim) {
            extent = (extent + a - 1) / a * a;
        }
        let min = match (&relaxed.min, fold) {
            (_, Some(_)) => Expr::int(0),
            (Bound::Finite(l), None) => Expr::from_linear(l),
            _ => return Err(too_large(format!("min of '{name}' along '{dim}' is unbounded"))),
        };
        shape.push(AllocDim { min, extent, fold });
    }

    let func = graph.func(fb.func);
    let elem_bytes: i64 = match func.value_types.iter().map(|t| t.bytes()).sum() {
        0 => 4,
        b => b,
    };
    let ring = fs.ring_buffer;
    let bytes = shape
        .iter()
        .try_fold(elem_bytes, |acc, d| acc.checked_mul(d.extent))
        .and_then(|b| b.checked_mul(ring.unwrap_or(1)))
        .ok_or_else(|| too_large(format!("size of '{name}' overflows")))?;
    if let Some(limit) = fs.allocation_bound {
        if bytes > limit {
            return Err(Diagnostic::error(
                codes::E0400,
                Subject::func(name),
                format!("'{name}' needs {bytes} bytes but its allocation is bounded to {limit}"),
            ));
        }
    }
    if bytes > options.max_allocation_bytes {
        return Err(too_large(format!(
            "'{name}' needs {bytes} bytes, more than the limit of {}",
            options.max_allocation_bytes
        ))
        .with_hint("schedule it at an inner loop level or fold its storage"));
    }

    let memo_key = fs
        .memoize
        .as_ref()
        .map(|m| memo_key(graph, fb, m.eviction_key.as_deref()));
    Ok(Allocation {
        func: fb.func,
        name: name.clone(),
        site: fp.alloc_site(),
        shape,
        elem_bytes,
        ring,
        bytes,
        memo_key,
    })
}

/// SHA-256 of the Func's definitions, its realized region and its eviction key.
fn memo_key(graph: &PipelineGraph, fb: &FuncBounds, eviction: Option<&str>) -> String {
    let func = graph.func(fb.func);
    let mut hasher = Sha256::new();
    hasher.update(func.name.as_bytes());
    for def in func.pure_def.iter().chain(&func.updates) {
        for e in def.exprs() {
            hasher.update(e.display(graph).to_string().as_bytes());
            hasher.update(b";");
        }
        hasher.update(b"\n");
    }
    hasher.update(display_region(&fb.computed).as_bytes());
    if let Some(k) = eviction {
        hasher.update(b"evict:");
        hasher.update(k.as_bytes());
    }
    hex(&hasher.finalize())
}

/// Lowercase hex of a digest.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
