// Property-based tests for lowering invariants.
//
// Three categories:
// 1. Interval arithmetic soundness: every point result lies in the interval result
// 2. Schedule equivalence: any legal schedule computes the inline schedule's values
// 3. Rfactor equivalence: factored reductions match the serial reduction
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use tessel::eval::{evaluate, Inputs};
use tessel::expr::{Expr, ScalarType};
use tessel::interval::{euclid_mod, floor_div, Bound, Interval, SymTable};
use tessel::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn holds(iv: &Interval, v: i64) -> bool {
    let above = match &iv.min {
        Bound::NegInf => true,
        Bound::PosInf => false,
        b => b.as_constant().is_some_and(|c| c <= v),
    };
    let below = match &iv.max {
        Bound::PosInf => true,
        Bound::NegInf => false,
        b => b.as_constant().is_some_and(|c| v <= c),
    };
    above && below
}

fn arb_range() -> impl Strategy<Value = (i64, i64)> {
    (-50i64..50, 0i64..40).prop_map(|(lo, len)| (lo, lo + len))
}

/// How the producer `f` of `out` is placed.
#[derive(Debug, Clone, Copy)]
enum Placement {
    Inline,
    Root,
    At,
    /// Computed per `out.x`, stored at root and folded.
    Sliding,
    /// Consumer split by the factor, producer computed at the outer loop.
    SplitAt(i64),
    /// Consumer split with the given tail, producer computed at root.
    Split(i64, TailStrategy),
    /// Consumer vectorized with the default tail, producer inline.
    Vectorize(i64),
}

fn arb_tail() -> impl Strategy<Value = TailStrategy> {
    prop_oneof![
        Just(TailStrategy::Auto),
        Just(TailStrategy::GuardWithIf),
        Just(TailStrategy::ShiftInwards),
        Just(TailStrategy::ShiftInwardsAndBlend),
        Just(TailStrategy::Predicate),
    ]
}

fn arb_placement() -> impl Strategy<Value = Placement> {
    prop_oneof![
        Just(Placement::Inline),
        Just(Placement::Root),
        Just(Placement::At),
        Just(Placement::Sliding),
        (1i64..6).prop_map(Placement::SplitAt),
        (2i64..7, arb_tail()).prop_map(|(k, tail)| Placement::Split(k, tail)),
        (2i64..7).prop_map(Placement::Vectorize),
    ]
}

/// in → f → out with f(x) = in(x + a) * 2 + in(x + b); out(x) = f(x - 1) + f(x + 1)
fn two_stage(a: i64, b: i64) -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let input = g.add_input("in", 1, ScalarType::I32);
    let f = g.add_func("f", &["x"]);
    let x = g.var(f, "x").unwrap();
    g.define(
        f,
        vec![Expr::input(input, vec![x.clone() + a]) * 2 + Expr::input(input, vec![x + b])],
    );
    let out = g.add_func("out", &["x"]);
    let x = g.var(out, "x").unwrap();
    g.define(
        out,
        vec![Expr::call(f, vec![x.clone() - 1]) + Expr::call(f, vec![x + 1])],
    );
    g
}

fn schedule(g: &PipelineGraph, placement: Placement) -> ScheduleModel {
    let mut s = ScheduleModel::new(g);
    match placement {
        Placement::Inline => {}
        Placement::Root => {
            s.func_mut("f").unwrap().compute_root().unwrap();
        }
        Placement::At => {
            s.func_mut("f").unwrap().compute_at(LoopLevel::at("out", "x")).unwrap();
        }
        Placement::Sliding => {
            s.func_mut("f")
                .unwrap()
                .compute_at(LoopLevel::at("out", "x"))
                .unwrap()
                .store_root()
                .unwrap()
                .fold_storage("x", 4)
                .unwrap();
        }
        Placement::SplitAt(k) => {
            s.stage_mut("out", 0)
                .unwrap()
                .split("x", "xo", "xi", k, TailStrategy::GuardWithIf)
                .unwrap();
            s.func_mut("f").unwrap().compute_at(LoopLevel::at("out", "xo")).unwrap();
        }
        Placement::Split(k, tail) => {
            s.stage_mut("out", 0).unwrap().split("x", "xo", "xi", k, tail).unwrap();
            s.func_mut("f").unwrap().compute_root().unwrap();
        }
        Placement::Vectorize(k) => {
            s.stage_mut("out", 0).unwrap().vectorize_by("x", k).unwrap();
        }
    }
    s
}

fn sum_of(input: &[i64]) -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let inp = g.add_input("in", 1, ScalarType::I32);
    let total = g.add_func("total", &["x"]);
    g.define(total, vec![Expr::int(0)]);
    let r = g.add_rdom("r", &[("x", 0, input.len() as i64)]);
    let rx = g.rvar(r, "x").unwrap();
    let x = g.var(total, "x").unwrap();
    g.update(
        total,
        vec![x.clone()],
        vec![Expr::call(total, vec![x]) + Expr::input(inp, vec![rx])],
    );
    g
}

// ── 1. Interval soundness ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn interval_ops_contain_point_results(
        (alo, ahi) in arb_range(),
        (blo, bhi) in arb_range(),
        pa in 0.0f64..=1.0,
        pb in 0.0f64..=1.0,
        k in prop_oneof![-7i64..=-1, 1i64..=7],
    ) {
        let table = SymTable::new();
        let a = alo + ((ahi - alo) as f64 * pa) as i64;
        let b = blo + ((bhi - blo) as f64 * pb) as i64;
        let ia = Interval::range(alo, ahi);
        let ib = Interval::range(blo, bhi);

        prop_assert!(holds(&ia.add(&ib), a + b));
        prop_assert!(holds(&ia.sub(&ib), a - b));
        prop_assert!(holds(&ia.mul(&ib, &table), a * b));
        prop_assert!(holds(&ia.min(&ib, &table), a.min(b)));
        prop_assert!(holds(&ia.max(&ib, &table), a.max(b)));
        prop_assert!(holds(&ia.div_const(k, &table), floor_div(a, k)));
        prop_assert!(holds(&ia.mod_const(k, &table), euclid_mod(a, k)));
        prop_assert!(holds(&ia.union(&ib, &table), a));
        prop_assert!(holds(&ia.union(&ib, &table), b));
    }
}

// ── 2. Schedule equivalence ─────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn schedules_compute_the_inline_values(
        a in -3i64..=3,
        b in -3i64..=3,
        placement in arb_placement(),
        min in -8i64..8,
        extent in 1i64..16,
    ) {
        let g = two_stage(a, b);
        let req = Request::new().output("out", &[(min, extent)]);
        let opts = LowerOptions::default();
        let inputs = Inputs::new().with("in", |c| c[0] * c[0] - 3 * c[0]);

        let reference = lower(&g, &ScheduleModel::new(&g), &req, &opts).unwrap();
        let expected = evaluate(&reference, &inputs).unwrap();

        let lowered = lower(&g, &schedule(&g, placement), &req, &opts);
        let lowered = match lowered {
            Ok(p) => p,
            Err(e) => return Err(TestCaseError::fail(format!("{placement:?}: {e}"))),
        };
        let actual = evaluate(&lowered, &inputs);
        prop_assert_eq!(actual, Ok(expected), "{:?}\n{}", placement, lowered);
    }

    #[test]
    fn output_regions_equal_the_request(
        placement in arb_placement(),
        min in -8i64..8,
        extent in 1i64..16,
    ) {
        let g = two_stage(0, 0);
        let req = Request::new().output("out", &[(min, extent)]);
        let p = lower(&g, &schedule(&g, placement), &req, &LowerOptions::default()).unwrap();
        let out = p.region("out").unwrap();
        prop_assert_eq!(&out.hull, &vec![(min, min + extent - 1)], "{:?}", placement);
        if let Some(f) = p.region("f") {
            prop_assert!(f.hull[0].0 <= min - 1 && f.hull[0].1 >= min + extent);
        }
        let names: Vec<&str> = p.input_regions.iter().map(|(n, _)| n.as_str()).collect();
        prop_assert_eq!(names, vec!["in"]);
    }
}

// ── 3. Rfactor equivalence ──────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn rfactor_preserves_the_reduction(
        (data, factor) in (1i64..9, 1usize..9).prop_flat_map(|(factor, chunks)| {
            (prop::collection::vec(-1000i64..1000, factor as usize * chunks), Just(factor))
        }),
    ) {
        let g = sum_of(&data);
        let req = Request::new().output("total", &[(0, 1)]);
        let opts = LowerOptions::default();

        let mut s = ScheduleModel::new(&g);
        s.update_mut("total", 0)
            .unwrap()
            .split("r.x", "rxo", "rxi", factor, TailStrategy::GuardWithIf)
            .unwrap();
        s.rfactor(&g, "total", 1, &[("rxo", "u")], "partial").unwrap();
        let factored = lower(&g, &s, &req, &opts).unwrap();

        let values = data.clone();
        let inputs = Inputs::new().with("in", move |c| values[c[0] as usize]);
        let result = evaluate(&factored, &inputs).unwrap();
        prop_assert_eq!(result.get("total").unwrap().get(&[0]), Some(data.iter().sum::<i64>()));

        let total = g.func_by_name("total").unwrap();
        prop_assert_eq!(factored.produce_count(total, 1), 1);
        prop_assert!(factored.allocation("partial").is_some());
    }
}
