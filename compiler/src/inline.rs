// inline.rs — Substitute inlined Funcs into their consumers
//
// Preconditions: `graph` validated; `schedule` has default placements resolved.
// Postconditions: no definition or reduction predicate of the returned graph
//                 reads a Func computed inline.
// Failure modes: an inline Func with update definitions → E0302.
// Side effects: none (works on a copy of the graph).

use crate::diag::{codes, Diagnostic, Subject};
use crate::expr::{Expr, Var};
use crate::graph::PipelineGraph;
use crate::id::FuncId;
use crate::schedule::ScheduleModel;

/// Result of inline expansion.
#[derive(Debug)]
pub struct InlineResult {
    pub graph: PipelineGraph,
    pub inlined: Vec<FuncId>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Expand every Func reachable from `outputs` that is scheduled inline.
pub fn inline_funcs(graph: &PipelineGraph, schedule: &ScheduleModel, outputs: &[FuncId]) -> InlineResult {
    let mut out = graph.clone();
    let mut inlined = Vec::new();
    let mut diagnostics = Vec::new();
    let live = graph.reachable(outputs);
    let Ok(order) = graph.topo_order(&live) else {
        return InlineResult {
            graph: out,
            inlined,
            diagnostics,
        };
    };
    for id in order {
        let f = graph.func(id);
        let is_inline = schedule.get(&f.name).is_some_and(|s| s.compute.is_inline());
        if !is_inline || outputs.contains(&id) {
            continue;
        }
        if !f.updates.is_empty() {
            diagnostics.push(Diagnostic::error(
                codes::E0302,
                Subject::func(&f.name),
                format!("'{}' has update definitions and cannot be inlined", f.name),
            ));
            continue;
        }
        // Take the current body: earlier inlines may have rewritten it.
        let Some(body) = out.func(id).pure_def.clone() else {
            continue;
        };
        let params = out.func(id).args.clone();
        let expand = |e: &Expr| {
            e.rewrite_calls(&mut |func, component, args| {
                if func != id {
                    return Expr::Call {
                        func,
                        component,
                        args,
                    };
                }
                let Some(value) = body.values.get(component) else {
                    return Expr::Call {
                        func,
                        component,
                        args,
                    };
                };
                value.substitute(&|v| match v {
                    Var::Dim(d) => params.iter().position(|p| p == d).and_then(|i| args.get(i).cloned()),
                    Var::Loop(_) => None,
                })
            })
        };
        let ids: Vec<FuncId> = out.funcs().iter().map(|f| f.id).collect();
        for other in ids {
            if other == id {
                continue;
            }
            if let Some(func) = out.func_mut(other) {
                for def in func.pure_def.iter_mut().chain(func.updates.iter_mut()) {
                    def.args = def.args.iter().map(&expand).collect();
                    def.values = def.values.iter().map(&expand).collect();
                }
            }
        }
        let rdoms: Vec<_> = out.rdoms().iter().map(|r| r.id).collect();
        for r in rdoms {
            if let Some(rdom) = out.rdom_mut(r) {
                rdom.predicate = rdom.predicate.as_ref().map(&expand);
            }
        }
        inlined.push(id);
    }
    InlineResult {
        graph: out,
        inlined,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::LoopLevel;

    #[test]
    fn chains_are_fully_expanded() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x * 2]);
        let h = g.add_func("h", &["x"]);
        let x = g.var(h, "x").unwrap();
        g.define(h, vec![Expr::call(f, vec![x.clone() + 1]) + 3]);
        let out = g.add_func("out", &["x"]);
        let x = g.var(out, "x").unwrap();
        g.define(out, vec![Expr::call(h, vec![x - 1])]);

        let mut s = ScheduleModel::new(&g);
        s.resolve_default_placement(&g, &["out".to_string()]);
        let result = inline_funcs(&g, &s, &[out]);
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.inlined, vec![f, h]);
        let def = result.graph.func(out).pure_def.clone().unwrap();
        assert_eq!(def.values[0].display(&result.graph).to_string(), "(((x - 1) + 1) * 2) + 3");
        assert!(!def.values[0].calls_func(f));
        assert!(!def.values[0].calls_func(h));
    }

    #[test]
    fn root_funcs_stay_as_calls() {
        let mut g = PipelineGraph::new();
        let f = g.add_func("f", &["x"]);
        let x = g.var(f, "x").unwrap();
        g.define(f, vec![x.clone()]);
        let out = g.add_func("out", &["x"]);
        let x = g.var(out, "x").unwrap();
        g.define(out, vec![Expr::call(f, vec![x])]);
        let mut s = ScheduleModel::new(&g);
        s.func_mut("f").unwrap().compute_at(LoopLevel::Root).unwrap();
        s.resolve_default_placement(&g, &["out".to_string()]);
        let result = inline_funcs(&g, &s, &[out]);
        assert!(result.inlined.is_empty());
        assert!(result.graph.func(out).pure_def.as_ref().unwrap().values[0].calls_func(f));
    }
}
