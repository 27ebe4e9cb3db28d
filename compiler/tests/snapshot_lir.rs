// Snapshot tests: lock the lowered loop-nest text to detect unintended
// structural changes.
//
// Uses the library API (graph → schedule → lower) and snapshots the Display
// output of `LoweredPipeline`. Snapshots are inline `insta` snapshots.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use tessel::expr::Expr;
use tessel::*;

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

fn lowered(schedule: impl FnOnce(&mut ScheduleModel)) -> String {
    let g = blur();
    let mut s = ScheduleModel::new(&g);
    schedule(&mut s);
    let req = Request::new().output("out", &[(0, 4)]);
    lower(&g, &s, &req, &LowerOptions::default())
        .unwrap_or_else(|e| panic!("{e}"))
        .to_string()
}

/// The loop nest without the `output` and `realize` header lines.
fn body(text: &str) -> String {
    text.lines()
        .filter(|l| !l.starts_with("output ") && !l.starts_with("realize ") && !l.starts_with("input "))
        .map(|l| format!("{l}\n"))
        .collect()
}

#[test]
fn snapshot_root_producer() {
    let text = lowered(|s| {
        s.func_mut("f").unwrap().compute_root().unwrap();
    });
    insta::assert_snapshot!(text, @r"
    output out [0, 3]
    realize f {[-1, 4]}
    realize out {[0, 3]}
    allocate f[-1 + 6] {
      produce f.s0 {
        for f.s0.x from -1 extent 6 {
          f(f.s0.x) = f.s0.x * 2
        }
      }
      produce out.s0 {
        for out.s0.x from 0 extent 4 {
          out(out.s0.x) = f(out.s0.x - 1) + f(out.s0.x + 1)
        }
      }
    }
    ");
}

#[test]
fn snapshot_producer_inside_consumer_loop() {
    let text = lowered(|s| {
        s.func_mut("f").unwrap().compute_at(LoopLevel::at("out", "x")).unwrap();
    });
    insta::assert_snapshot!(body(&text), @r"
    produce out.s0 {
      for out.s0.x from 0 extent 4 {
        allocate f[out.s0.x - 1 + 3] {
          produce f.s0 {
            for f.s0.x from out.s0.x - 1 extent 3 {
              f(f.s0.x) = f.s0.x * 2
            }
          }
          out(out.s0.x) = f(out.s0.x - 1) + f(out.s0.x + 1)
        }
      }
    }
    ");
}

#[test]
fn snapshot_inline_producer() {
    let text = lowered(|_| {});
    assert!(!text.contains("allocate"), "{text}");
    assert!(!text.contains("realize f"), "{text}");
    assert_eq!(text.matches("produce ").count(), 1, "{text}");
}
