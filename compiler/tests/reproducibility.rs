// Reproducibility tests.
//
// These tests verify that lowering produces byte-identical outputs for
// identical inputs, and that the fingerprint tracks every schedule change.

use tessel::expr::{Expr, ScalarType};
use tessel::*;

fn pipeline() -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let input = g.add_input("in", 2, ScalarType::I32);
    let f = g.add_func("f", &["x", "y"]);
    let (x, y) = (g.var(f, "x").unwrap(), g.var(f, "y").unwrap());
    g.define(
        f,
        vec![Expr::input(input, vec![x.clone() - 1, y.clone()]) + Expr::input(input, vec![x + 1, y])],
    );
    let out = g.add_func("out", &["x", "y"]);
    let (x, y) = (g.var(out, "x").unwrap(), g.var(out, "y").unwrap());
    g.define(
        out,
        vec![Expr::call(f, vec![x.clone(), y.clone() - 1]) + Expr::call(f, vec![x, y + 1])],
    );
    g
}

fn tiled(g: &PipelineGraph) -> ScheduleModel {
    let mut s = ScheduleModel::new(g);
    s.stage_mut("out", 0)
        .unwrap()
        .tile("x", "y", "xo", "yo", "xi", "yi", 8, 8, TailStrategy::GuardWithIf)
        .unwrap()
        .parallel("yo")
        .unwrap();
    s.func_mut("f").unwrap().compute_at(LoopLevel::at("out", "xo")).unwrap();
    s
}

fn request() -> Request {
    Request::new().output("out", &[(0, 32), (0, 20)])
}

/// Lowering the same graph and schedule twice gives identical text and JSON.
#[test]
fn same_inputs_identical_output() {
    let g = pipeline();
    let s = tiled(&g);
    let opts = LowerOptions::default();
    let a = lower(&g, &s, &request(), &opts).unwrap();
    let b = lower(&g, &s, &request(), &opts).unwrap();
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    assert_eq!(a.fingerprint(), b.fingerprint());
}

/// Independently built graphs with the same definitions lower identically.
#[test]
fn rebuilt_graph_identical_fingerprint() {
    let opts = LowerOptions::default();
    let g1 = pipeline();
    let g2 = pipeline();
    let a = lower(&g1, &tiled(&g1), &request(), &opts).unwrap();
    let b = lower(&g2, &tiled(&g2), &request(), &opts).unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn fingerprint_is_lowercase_sha256_hex() {
    let g = pipeline();
    let p = lower(&g, &tiled(&g), &request(), &LowerOptions::default()).unwrap();
    let fp = p.fingerprint();
    assert_eq!(fp.len(), 64);
    assert!(fp.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)), "{fp}");
}

#[test]
fn schedule_change_changes_fingerprint() {
    let g = pipeline();
    let opts = LowerOptions::default();
    let a = lower(&g, &tiled(&g), &request(), &opts).unwrap();
    let mut root = ScheduleModel::new(&g);
    root.func_mut("f").unwrap().compute_root().unwrap();
    let b = lower(&g, &root, &request(), &opts).unwrap();
    assert_ne!(a.fingerprint(), b.fingerprint());
}

#[test]
fn request_change_changes_fingerprint() {
    let g = pipeline();
    let s = tiled(&g);
    let opts = LowerOptions::default();
    let a = lower(&g, &s, &request(), &opts).unwrap();
    let b = lower(&g, &s, &Request::new().output("out", &[(0, 32), (0, 24)]), &opts).unwrap();
    assert_ne!(a.fingerprint(), b.fingerprint());
}

/// Lowering leaves the caller's graph and schedule untouched, so a second
/// run from the same values is a fixed point.
#[test]
fn lowering_is_idempotent() {
    let g = pipeline();
    let s = tiled(&g);
    let before = format!("{:?}", s.get("f"));
    let opts = LowerOptions::default();
    let first = lower(&g, &s, &request(), &opts).unwrap();
    assert_eq!(format!("{:?}", s.get("f")), before);
    let second = lower(&g, &s, &request(), &opts).unwrap();
    assert_eq!(first.fingerprint(), second.fingerprint());
}
