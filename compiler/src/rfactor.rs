// rfactor.rs — Factor associative reductions through an intermediate Func
//
// `f(L) = f(L) ⊕ term(r)` over a reduction domain `r` becomes
//
//     intm(L, u) = identity(⊕)
//     intm(L, u) = intm(L, u) ⊕ term(r[preserved := u])   over the other loops
//     f(L)       = f(L) ⊕ intm(L, p)                      over the preserved loops
//
// where the preserved reduction loops turn into pure variables `u` of the
// intermediate. Splits of reduction variables recorded before the request
// carry over: each piece becomes a dimension of one of the two new domains,
// and the original variable is rebuilt as `min + outer·factor + inner`.
//
// Preconditions: `graph` validated; requests recorded by `ScheduleModel::rfactor`.
// Postconditions: every request is applied to the returned graph, which
//                 contains one new Func per request.
// Failure modes: operator not provably associative → E0500 (W0500 when the
//                caller asserted it); malformed request, non-exact split or
//                a write location that depends on the domain → E0501.
// Side effects: none (works on a copy of the graph).

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::{BinOp, Expr, ScalarType, Var};
use crate::graph::PipelineGraph;
use crate::id::{DimId, FuncId};
use crate::schedule::{RfactorRequest, Transform};

#[derive(Debug)]
pub struct RfactorResult {
    pub graph: PipelineGraph,
    pub intermediates: Vec<FuncId>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn apply_rfactors(graph: &PipelineGraph, requests: &[RfactorRequest]) -> RfactorResult {
    let mut out = graph.clone();
    let mut intermediates = Vec::new();
    let mut diagnostics = Vec::new();
    for req in requests {
        match factor(&mut out, req) {
            Ok((id, warning)) => {
                intermediates.push(id);
                diagnostics.extend(warning);
            }
            Err(d) => diagnostics.push(d),
        }
    }
    RfactorResult {
        graph: out,
        intermediates,
        diagnostics,
    }
}

/// Identity of an operator the factorization recognizes as associative and
/// commutative.
fn identity(op: BinOp, ty: ScalarType) -> Option<i64> {
    match op {
        BinOp::Add | BinOp::Or => Some(0),
        BinOp::Mul | BinOp::And => Some(1),
        BinOp::Min => Some(ty.max_value()),
        BinOp::Max => Some(ty.min_value()),
        _ => None,
    }
}

/// Offset of loop `name` from the start of the variable it was split from:
/// `offset(old) = offset(outer)·factor + offset(inner)`.
fn offset(name: &str, splits: &[Transform], leaves: &BTreeMap<String, Expr>) -> Expr {
    for t in splits {
        if let Transform::Split {
            old,
            outer,
            inner,
            factor,
            ..
        } = t
        {
            if old == name {
                return offset(outer, splits, leaves) * *factor + offset(inner, splits, leaves);
            }
        }
    }
    leaves.get(name).cloned().unwrap_or_else(|| Expr::int(0))
}

fn is_split(name: &str, splits: &[Transform]) -> bool {
    splits
        .iter()
        .any(|t| matches!(t, Transform::Split { old, .. } if old == name))
}

fn factor(g: &mut PipelineGraph, req: &RfactorRequest) -> Result<(FuncId, Option<Diagnostic>), Diagnostic> {
    let invalid = |message: String| Diagnostic::error(codes::E0501, Subject::func(&req.func), message);
    let stage = format!("{}.s{}", req.func, req.stage);

    // ── Validate everything before touching the graph.
    let f = g
        .func_by_name(&req.func)
        .ok_or_else(|| invalid(format!("no func named '{}'", req.func)))?;
    let func = g.func(f).clone();
    let def = func
        .definition(req.stage)
        .filter(|_| req.stage > 0)
        .cloned()
        .ok_or_else(|| invalid(format!("{stage} is not an update definition")))?;
    if def.values.len() != 1 {
        return Err(invalid(format!("{stage} defines a tuple; only single values can be factored")));
    }
    let r = g
        .stage_rdom(f, req.stage)
        .ok_or_else(|| invalid(format!("{stage} has no reduction domain")))?;
    let rdom = g.rdom(r).clone();
    let rvar_dims: BTreeSet<DimId> = rdom.vars.iter().map(|v| v.dim).collect();
    if def.args.iter().any(|a| !a.dims().is_disjoint(&rvar_dims)) {
        return Err(invalid(format!(
            "{stage} writes a location that depends on its reduction domain"
        )));
    }

    let self_call = Expr::call(f, def.args.clone());
    let (op, term, self_left) = match &def.values[0] {
        Expr::Binary(op, a, b) if **a == self_call && !b.calls_func(f) => (*op, (**b).clone(), true),
        Expr::Binary(op, a, b) if **b == self_call && !a.calls_func(f) => (*op, (**a).clone(), false),
        _ => {
            return Err(Diagnostic::error(
                codes::E0500,
                Subject::func(&req.func),
                format!("{stage} is not of the form {0}(..) = {0}(..) op term", req.func),
            ))
        }
    };
    let ty = func.value_types.first().copied().unwrap_or(ScalarType::I32);
    let (init, warning) = match identity(op, ty) {
        Some(v) => (Expr::typed(v, ty), None),
        None if req.assume_associative => {
            let pure = func
                .pure_def
                .as_ref()
                .and_then(|d| d.values.first().cloned())
                .ok_or_else(|| invalid(format!("'{}' has no pure definition", req.func)))?;
            let warning = Diagnostic::warning(
                codes::W0500,
                Subject::func(&req.func),
                format!(
                    "rfactor of {stage} assumes {op:?} is associative and commutative; its pure value stands in for the identity"
                ),
            );
            (pure, Some(warning))
        }
        None => {
            return Err(Diagnostic::error(
                codes::E0500,
                Subject::func(&req.func),
                format!("{op:?} in {stage} is not known to be associative"),
            ))
        }
    };

    // Constant extent of every reduction loop, original or split.
    let mut mins: BTreeMap<String, i64> = BTreeMap::new();
    let mut extents: BTreeMap<String, i64> = BTreeMap::new();
    for v in &rdom.vars {
        let name = g.dim(v.dim).name.clone();
        let (Some(min), Some(extent)) = (v.min.simplify().as_const(), v.extent.simplify().as_const()) else {
            return Err(invalid(format!("bounds of '{name}' are not constants")));
        };
        mins.insert(name.clone(), min);
        extents.insert(name, extent);
    }
    for t in &req.splits {
        let Transform::Split {
            old,
            outer,
            inner,
            factor,
            ..
        } = t
        else {
            continue;
        };
        let e = extents
            .get(old)
            .copied()
            .ok_or_else(|| invalid(format!("'{old}' is not a reduction loop of {stage}")))?;
        if e % factor != 0 {
            return Err(invalid(format!(
                "split of '{old}' by {factor} does not divide its extent {e}"
            )));
        }
        extents.insert(outer.clone(), e / factor);
        extents.insert(inner.clone(), *factor);
    }
    if let Some(missing) = req.rvar_loops.iter().find(|l| !extents.contains_key(*l)) {
        return Err(invalid(format!("'{missing}' is not a reduction loop of {stage}")));
    }
    let loop_min = |name: &str| if is_split(name, &req.splits) { 0 } else { mins.get(name).copied().unwrap_or(0) };
    let preserved: Vec<&str> = req.preserved.iter().map(|(l, _)| l.as_str()).collect();
    let domain = |loops: Vec<&String>| -> Vec<(String, Expr, Expr)> {
        loops
            .into_iter()
            .map(|l| {
                let extent = extents.get(l).copied().unwrap_or(1);
                (l.clone(), Expr::int(loop_min(l)), Expr::int(extent))
            })
            .collect()
    };
    // Reduction domains list their innermost dimension first.
    let remaining: Vec<&String> = req
        .rvar_loops
        .iter()
        .rev()
        .filter(|l| !preserved.contains(&l.as_str()))
        .collect();
    let kept: Vec<&String> = req
        .rvar_loops
        .iter()
        .rev()
        .filter(|l| preserved.contains(&l.as_str()))
        .collect();
    let intm_domain = domain(remaining.clone());
    let f_domain = domain(kept.clone());

    // ── Intermediate.
    let mut arg_names: Vec<String> = func.args.iter().map(|d| g.dim(*d).name.clone()).collect();
    arg_names.extend(req.preserved.iter().map(|(_, u)| u.clone()));
    let arg_refs: Vec<&str> = arg_names.iter().map(String::as_str).collect();
    let intm = g.add_func(&req.intermediate, &arg_refs);
    let intm_dims = g.func(intm).args.clone();
    let n = func.args.len();
    let intm_rdom = g.add_rdom_verbatim(&req.intermediate, intm_domain);

    let mut leaves: BTreeMap<String, Expr> = BTreeMap::new();
    for (name, v) in remaining.iter().zip(&g.rdom(intm_rdom).vars) {
        leaves.insert((*name).clone(), Expr::dim(v.dim));
    }
    for (i, (l, _)) in req.preserved.iter().enumerate() {
        leaves.insert(l.clone(), Expr::dim(intm_dims[n + i]));
    }
    let rebuilt: BTreeMap<DimId, Expr> = rdom
        .vars
        .iter()
        .map(|v| {
            let name = &g.dim(v.dim).name;
            let e = if is_split(name, &req.splits) {
                (offset(name, &req.splits, &leaves) + mins.get(name).copied().unwrap_or(0)).simplify()
            } else {
                leaves.get(name).cloned().unwrap_or_else(|| Expr::dim(v.dim))
            };
            (v.dim, e)
        })
        .collect();
    let renamed: BTreeMap<DimId, DimId> = func.args.iter().copied().zip(intm_dims.iter().copied()).collect();
    let to_intm = |e: &Expr| {
        e.substitute(&|v| match v {
            Var::Dim(d) => renamed
                .get(d)
                .map(|x| Expr::dim(*x))
                .or_else(|| rebuilt.get(d).cloned()),
            Var::Loop(_) => None,
        })
    };
    let mut lhs: Vec<Expr> = def.args.iter().map(&to_intm).collect();
    lhs.extend((0..req.preserved.len()).map(|i| Expr::dim(intm_dims[n + i])));
    let acc = Expr::call(intm, lhs.clone());
    let partial = to_intm(&term);
    let value = if self_left {
        Expr::binary(op, acc, partial)
    } else {
        Expr::binary(op, partial, acc)
    };
    let predicate = rdom.predicate.as_ref().map(&to_intm);
    let init = to_intm(&init);
    g.define(intm, vec![init]);
    g.update(intm, lhs, vec![value]);
    if let Some(p) = predicate {
        g.rdom_where(intm_rdom, p);
    }
    g.set_value_types(&BTreeMap::from([(intm, func.value_types.clone())]));

    // ── Combine step.
    let f_rdom = g.add_rdom_verbatim(&rdom.name, f_domain);
    let by_name: BTreeMap<String, DimId> = kept
        .iter()
        .zip(&g.rdom(f_rdom).vars)
        .map(|(name, v)| ((*name).clone(), v.dim))
        .collect();
    let mut args = def.args.clone();
    args.extend(
        req.preserved
            .iter()
            .filter_map(|(l, _)| by_name.get(l).map(|d| Expr::dim(*d))),
    );
    let partials = Expr::call(intm, args);
    let combined = if self_left {
        Expr::binary(op, self_call, partials)
    } else {
        Expr::binary(op, partials, self_call)
    };
    if let Some(update) = g.func_mut(f).and_then(|fm| fm.updates.get_mut(req.stage - 1)) {
        update.values = vec![combined];
    }
    Ok((intm, warning))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ScheduleModel, TailStrategy};

    /// f(x) = 0; f(x) = f(x) <op> in(r.x) over r in [0, extent).
    fn reduction(op: BinOp, extent: i64) -> PipelineGraph {
        let mut g = PipelineGraph::new();
        let input = g.add_input("in", 1, ScalarType::I32);
        let f = g.add_func("f", &["x"]);
        g.define(f, vec![Expr::int(0)]);
        let r = g.add_rdom("r", &[("x", 0, extent)]);
        let rx = g.rvar(r, "x").unwrap();
        let x = g.var(f, "x").unwrap();
        g.update(
            f,
            vec![x.clone()],
            vec![Expr::binary(op, Expr::call(f, vec![x]), Expr::input(input, vec![rx]))],
        );
        let v = crate::graph::validate(&g, &[f]);
        assert!(v.diagnostics.is_empty(), "{:?}", v.diagnostics);
        g.set_value_types(&v.value_types);
        g
    }

    fn split_and_factor(g: &PipelineGraph, factor: i64, assume: bool) -> Result<ScheduleModel, Diagnostic> {
        let mut s = ScheduleModel::new(g);
        s.update_mut("f", 0)?
            .split("r.x", "rxo", "rxi", factor, TailStrategy::GuardWithIf)?;
        if assume {
            s.rfactor_assume_associative(g, "f", 1, &[("rxo", "u")], "intm")?;
        } else {
            s.rfactor(g, "f", 1, &[("rxo", "u")], "intm")?;
        }
        Ok(s)
    }

    #[test]
    fn sum_is_split_into_partial_sums() {
        let g = reduction(BinOp::Add, 100);
        let s = split_and_factor(&g, 25, false).unwrap();
        let result = apply_rfactors(&g, &s.rfactors);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let out = &result.graph;
        let intm = result.intermediates[0];
        let names: Vec<&str> = out.func(intm).args.iter().map(|d| out.dim(*d).name.as_str()).collect();
        assert_eq!(names, vec!["x", "u"]);

        let intm_r = out.stage_rdom(intm, 1).unwrap();
        let dom: Vec<(&str, Option<i64>)> = out
            .rdom(intm_r)
            .vars
            .iter()
            .map(|v| (out.dim(v.dim).name.as_str(), v.extent.as_const()))
            .collect();
        assert_eq!(dom, vec![("rxi", Some(25))]);

        let f = out.func_by_name("f").unwrap();
        let f_r = out.stage_rdom(f, 1).unwrap();
        assert_eq!(out.rdom(f_r).vars.len(), 1);
        assert_eq!(out.rdom(f_r).vars[0].extent.as_const(), Some(4));
        assert!(out.func(f).updates[0].values[0].calls_func(intm));
        assert_eq!(
            out.func(intm).updates[0].values[0].display(out).to_string(),
            "intm(x, u) + in((u * 25) + rxi)"
        );
        assert_eq!(out.func(intm).value_types, out.func(f).value_types);
    }

    #[test]
    fn subtraction_is_not_associative() {
        let g = reduction(BinOp::Sub, 100);
        let s = split_and_factor(&g, 25, false).unwrap();
        let result = apply_rfactors(&g, &s.rfactors);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0500));
        assert!(result.intermediates.is_empty());
    }

    #[test]
    fn asserted_associativity_warns() {
        let g = reduction(BinOp::Sub, 100);
        let s = split_and_factor(&g, 25, true).unwrap();
        let result = apply_rfactors(&g, &s.rfactors);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, Some(codes::W0500));
        assert!(!result.diagnostics[0].is_error());
        assert_eq!(result.intermediates.len(), 1);
    }

    #[test]
    fn inexact_split_is_rejected() {
        let g = reduction(BinOp::Max, 10);
        let s = split_and_factor(&g, 3, false).unwrap();
        let result = apply_rfactors(&g, &s.rfactors);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0501));
    }

    #[test]
    fn min_identity_is_type_max() {
        assert_eq!(identity(BinOp::Min, ScalarType::I32), Some(i64::from(i32::MAX)));
        assert_eq!(identity(BinOp::Max, ScalarType::UInt(8)), Some(0));
        assert_eq!(identity(BinOp::Sub, ScalarType::I32), None);
    }
}
