// End-to-end lowering scenarios.
//
// Each test builds a small pipeline through the library API, lowers it and
// checks either the failing pass and diagnostic code, or the realized regions
// and the values computed by the reference evaluator.

use tessel::diag::codes;
use tessel::eval::{evaluate, Inputs};
use tessel::expr::{BinOp, Expr, ScalarType};
use tessel::pass::PassId;
use tessel::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn opts() -> LowerOptions {
    LowerOptions::default()
}

/// h(x, y) = f(x, y - 1) + f(x, y + 1); f(x, y) = x + y
fn stencil() -> PipelineGraph {
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
    g
}

/// f(x) = 0; f(x) = x + f(x - 1); out(x) = f(x)
fn prefix_sum() -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let f = g.add_func("f", &["x"]);
    let x = g.var(f, "x").unwrap();
    g.define(f, vec![Expr::int(0)]);
    g.update(f, vec![x.clone()], vec![x.clone() + Expr::call(f, vec![x - 1])]);
    let out = g.add_func("out", &["x"]);
    let x = g.var(out, "x").unwrap();
    g.define(out, vec![Expr::call(f, vec![x])]);
    g
}

/// total(x) = 0; total(x) += in(r.x) over r in [0, 100).
fn sum100() -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let input = g.add_input("in", 1, ScalarType::I32);
    let total = g.add_func("total", &["x"]);
    g.define(total, vec![Expr::int(0)]);
    let r = g.add_rdom("r", &[("x", 0, 100)]);
    let rx = g.rvar(r, "x").unwrap();
    let x = g.var(total, "x").unwrap();
    g.update(
        total,
        vec![x.clone()],
        vec![Expr::binary(BinOp::Add, Expr::call(total, vec![x]), Expr::input(input, vec![rx]))],
    );
    g
}

// ── Rejections ──────────────────────────────────────────────────────────────

#[test]
fn bad_fold_is_invalid_fold() {
    let g = stencil();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("f")
        .unwrap()
        .compute_at(LoopLevel::at("h", "y"))
        .unwrap()
        .store_root()
        .unwrap()
        .fold_storage("y", 2)
        .unwrap();
    let req = Request::new().output("h", &[(0, 8), (0, 8)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::CheckLegality);
    assert!(err.has_code(codes::E0304), "{err}");
    let d = err.errors().next().unwrap();
    assert_eq!(d.subject, Subject::dim("f", "y"));
    assert_eq!(d.rule(), Some("invalid-fold"));
}

#[test]
fn fold_wide_enough_lowers() {
    let g = stencil();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("f")
        .unwrap()
        .compute_at(LoopLevel::at("h", "y"))
        .unwrap()
        .store_root()
        .unwrap()
        .fold_storage("y", 4)
        .unwrap();
    let req = Request::new().output("h", &[(0, 8), (0, 8)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    let a = p.allocation("f").unwrap();
    assert_eq!(a.shape[1].fold, Some(4));
    assert_eq!(a.shape[1].extent, 4);
    let values = evaluate(&p, &Inputs::new()).unwrap();
    // f(x, y - 1) + f(x, y + 1) = 2x + 2y
    assert_eq!(values.get("h").unwrap().get(&[3, 5]), Some(16));
}

#[test]
fn bad_store_at_is_placement_inversion() {
    let g = stencil();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("f")
        .unwrap()
        .compute_root()
        .unwrap()
        .store_at(LoopLevel::at("h", "y"))
        .unwrap();
    let req = Request::new().output("h", &[(0, 8), (0, 8)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::Place);
    assert!(err.has_code(codes::E0300), "{err}");
}

#[test]
fn parallel_swapped_reduction_is_a_race() {
    // f(r.x, r.y) = f(r.y, r.x) + 1, parallel over r.y
    let mut g = PipelineGraph::new();
    let f = g.add_func("f", &["x", "y"]);
    let (x, y) = (g.var(f, "x").unwrap(), g.var(f, "y").unwrap());
    g.define(f, vec![x + y]);
    let r = g.add_rdom("r", &[("x", 0, 10), ("y", 0, 10)]);
    let (rx, ry) = (g.rvar(r, "x").unwrap(), g.rvar(r, "y").unwrap());
    g.update(f, vec![rx.clone(), ry.clone()], vec![Expr::call(f, vec![ry, rx]) + 1]);
    let mut s = ScheduleModel::new(&g);
    s.stage_mut("f", 1).unwrap().parallel("r.y").unwrap();
    let req = Request::new().output("f", &[(0, 10), (0, 10)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::CheckSchedule);
    assert!(err.has_code(codes::E0303), "{err}");
}

#[test]
fn unbounded_recursion_fails_bounds() {
    let g = prefix_sum();
    let s = ScheduleModel::new(&g);
    let req = Request::new().output("out", &[(0, 10)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::Bounds);
    assert!(err.has_code(codes::E0201), "{err}");
}

#[test]
fn growth_budget_is_configurable() {
    let g = prefix_sum();
    let s = ScheduleModel::new(&g);
    let req = Request::new().output("out", &[(0, 10)]);
    let tight = LowerOptions::from_json(r#"{ "max_fixed_point_iterations": 2 }"#).unwrap();
    let err = lower(&g, &s, &req, &tight).unwrap_err();
    assert!(err.has_code(codes::E0201), "{err}");
    assert!(err.errors().any(|d| d.message.contains("within 2 iterations")), "{err}");
}

#[test]
fn oversized_allocation_is_rejected() {
    let g = stencil();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("f").unwrap().compute_root().unwrap();
    let req = Request::new().output("h", &[(0, 64), (0, 64)]);
    let small = LowerOptions::from_json(r#"{ "max_allocation_bytes": 1024 }"#).unwrap();
    let err = lower(&g, &s, &req, &small).unwrap_err();
    assert_eq!(err.failing_pass, PassId::Storage);
    assert!(err.has_code(codes::E0401), "{err}");
}

// ── Successful lowerings ────────────────────────────────────────────────────

#[test]
fn bounded_recursion_lowers_over_the_bound() {
    let g = prefix_sum();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("f").unwrap().bound("x", 0, 10).unwrap();
    let req = Request::new().output("out", &[(0, 10)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    assert_eq!(p.region("f").unwrap().hull, vec![(0, 9)]);

    let values = evaluate(&p, &Inputs::new()).unwrap();
    let out = values.get("out").unwrap();
    for x in 0..10 {
        assert_eq!(out.get(&[x]), Some(x * (x + 1) / 2), "out({x})");
    }
}

#[test]
fn rfactor_matches_the_serial_reduction() {
    let g = sum100();
    let serial = ScheduleModel::new(&g);

    let mut factored = ScheduleModel::new(&g);
    factored
        .update_mut("total", 0)
        .unwrap()
        .split("r.x", "rxo", "rxi", 25, TailStrategy::GuardWithIf)
        .unwrap();
    factored
        .rfactor(&g, "total", 1, &[("rxo", "u")], "partial")
        .unwrap();

    let req = Request::new().output("total", &[(0, 1)]);
    let a = lower(&g, &serial, &req, &opts()).unwrap();
    let b = lower(&g, &factored, &req, &opts()).unwrap();
    assert_eq!(b.region("partial").unwrap().hull, vec![(0, 0), (0, 3)]);
    assert_eq!(b.produce_count(g.func_by_name("total").unwrap(), 1), 1);

    for seed in [1_i64, 7, -13, 1 << 20] {
        let inputs = Inputs::new().with("in", move |c| c[0] * seed - 50);
        let x = evaluate(&a, &inputs).unwrap();
        let y = evaluate(&b, &inputs).unwrap();
        assert_eq!(x, y, "seed {seed}");
    }
}

#[test]
fn compute_with_shares_the_consumer_loop() {
    // a(x) = x; b(x) = x * 3; out(x) = a(x) + b(x)
    let mut g = PipelineGraph::new();
    let a = g.add_func("a", &["x"]);
    let x = g.var(a, "x").unwrap();
    g.define(a, vec![x]);
    let b = g.add_func("b", &["x"]);
    let x = g.var(b, "x").unwrap();
    g.define(b, vec![x * 3]);
    let out = g.add_func("out", &["x"]);
    let x = g.var(out, "x").unwrap();
    g.define(out, vec![Expr::call(a, vec![x.clone()]) + Expr::call(b, vec![x])]);

    let mut s = ScheduleModel::new(&g);
    s.func_mut("a").unwrap().compute_root().unwrap();
    s.func_mut("b").unwrap().compute_root().unwrap();
    s.stage_mut("b", 0)
        .unwrap()
        .compute_with(LoopLevel::at("a", "x"))
        .unwrap();
    let req = Request::new().output("out", &[(0, 8)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    assert!(!p.loop_syms().contains(&"b.s0.x"), "{p}");

    let values = evaluate(&p, &Inputs::new()).unwrap();
    assert_eq!(values.get("out").unwrap().get(&[5]), Some(20));
}

#[test]
fn warnings_survive_successful_lowering() {
    let mut g = PipelineGraph::new();
    let f = g.add_func("f", &["x"]);
    let x = g.var(f, "x").unwrap();
    g.define(f, vec![x.clone()]);
    g.update(f, vec![x.clone()], vec![Expr::call(f, vec![x.clone()]) + 1]);
    g.update(f, vec![x.clone()], vec![Expr::call(f, vec![x]) * 2]);
    let mut s = ScheduleModel::new(&g);
    s.stage_mut("f", 1).unwrap().vectorize_by("x", 4).unwrap();
    let req = Request::new().output("f", &[(0, 16)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    assert_eq!(p.warnings.len(), 1);
    assert_eq!(p.warnings[0].code, Some(codes::W0300));

    let values = evaluate(&p, &Inputs::new()).unwrap();
    assert_eq!(values.get("f").unwrap().get(&[3]), Some(8));
}

// ── Split tails on outputs ──────────────────────────────────────────────────

/// out(x) = f(x - 1) + f(x + 1); f(x) = x * x
fn blur() -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let f = g.add_func("f", &["x"]);
    let x = g.var(f, "x").unwrap();
    g.define(f, vec![x.clone() * x]);
    let out = g.add_func("out", &["x"]);
    let x = g.var(out, "x").unwrap();
    g.define(out, vec![Expr::call(f, vec![x.clone() - 1]) + Expr::call(f, vec![x + 1])]);
    g
}

fn blur_values(p: &LoweredPipeline) -> Vec<Option<i64>> {
    let values = evaluate(p, &Inputs::new()).unwrap();
    let out = values.get("out").unwrap();
    (0..10).map(|x| out.get(&[x])).collect()
}

#[test]
fn guarded_split_keeps_the_requested_box() {
    let g = blur();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("f").unwrap().compute_root().unwrap();
    s.stage_mut("out", 0)
        .unwrap()
        .split("x", "xo", "xi", 4, TailStrategy::GuardWithIf)
        .unwrap();
    let req = Request::new().output("out", &[(0, 10)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    assert_eq!(p.region("out").unwrap().hull, vec![(0, 9)]);
    assert_eq!(p.region("f").unwrap().hull, vec![(-1, 10)]);
    assert!(p.to_string().contains("if out.s0.x <= 9 {"), "{p}");

    let expected: Vec<Option<i64>> = (0..10).map(|x| Some(2 * x * x + 2)).collect();
    assert_eq!(blur_values(&p), expected);
}

#[test]
fn vectorized_output_shifts_its_tail_inwards() {
    let g = blur();
    let mut s = ScheduleModel::new(&g);
    s.stage_mut("out", 0).unwrap().vectorize_by("x", 4).unwrap();
    let req = Request::new().output("out", &[(0, 10)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    assert_eq!(p.region("out").unwrap().hull, vec![(0, 9)]);

    let reference = lower(&g, &ScheduleModel::new(&g), &req, &opts()).unwrap();
    assert_eq!(blur_values(&p), blur_values(&reference));
}

#[test]
fn round_up_on_an_output_is_rejected() {
    let g = blur();
    let mut s = ScheduleModel::new(&g);
    s.stage_mut("out", 0)
        .unwrap()
        .split("x", "xo", "xi", 4, TailStrategy::RoundUp)
        .unwrap();
    let req = Request::new().output("out", &[(0, 10)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::CheckLegality);
    assert!(err.has_code(codes::E0313), "{err}");
}

#[test]
fn aligned_output_is_an_output_region_mismatch() {
    let g = blur();
    let mut s = ScheduleModel::new(&g);
    s.func_mut("out").unwrap().align_bounds("x", 4, 0).unwrap();
    let req = Request::new().output("out", &[(0, 10)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::Bounds);
    assert!(err.has_code(codes::E0204), "{err}");
}

// ── Fused reads ─────────────────────────────────────────────────────────────

/// a(x) = x * 3; b(x) = a(x + offset); out(x) = b(x), with b computed with a.
fn fused_offset(offset: i64) -> (PipelineGraph, ScheduleModel) {
    let mut g = PipelineGraph::new();
    let a = g.add_func("a", &["x"]);
    let x = g.var(a, "x").unwrap();
    g.define(a, vec![x * 3]);
    let b = g.add_func("b", &["x"]);
    let x = g.var(b, "x").unwrap();
    g.define(b, vec![Expr::call(a, vec![x + offset])]);
    let out = g.add_func("out", &["x"]);
    let x = g.var(out, "x").unwrap();
    g.define(out, vec![Expr::call(b, vec![x])]);

    let mut s = ScheduleModel::new(&g);
    s.func_mut("a").unwrap().compute_root().unwrap();
    s.func_mut("b").unwrap().compute_root().unwrap();
    s.stage_mut("b", 0)
        .unwrap()
        .compute_with(LoopLevel::at("a", "x"))
        .unwrap();
    (g, s)
}

#[test]
fn fused_read_of_an_earlier_iteration_lowers() {
    let (g, s) = fused_offset(-1);
    let req = Request::new().output("out", &[(0, 8)]);
    let p = lower(&g, &s, &req, &opts()).unwrap();
    assert!(!p.loop_syms().contains(&"b.s0.x"), "{p}");
    assert_eq!(p.region("a").unwrap().hull, vec![(-1, 6)]);

    let values = evaluate(&p, &Inputs::new()).unwrap();
    let out = values.get("out").unwrap();
    for x in 0..8 {
        assert_eq!(out.get(&[x]), Some((x - 1) * 3), "out({x})");
    }
}

#[test]
fn fused_read_of_a_later_iteration_is_rejected() {
    let (g, s) = fused_offset(1);
    let req = Request::new().output("out", &[(0, 8)]);
    let err = lower(&g, &s, &req, &opts()).unwrap_err();
    assert_eq!(err.failing_pass, PassId::Fuse);
    assert!(err.has_code(codes::E0305), "{err}");
}
