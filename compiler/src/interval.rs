// interval.rs — Closed intervals over affine loop-symbol expressions
//
// Bounds are affine forms (`Linear`) over loop symbols, or ±infinity. A
// region computed at some loop level is affine in the loop symbols that
// enclose that level; every other symbol is eliminated by relaxing it to the
// endpoint of its range recorded in a `SymTable`. When two symbolic bounds
// cannot be ordered statically, the combination keeps one of them and widens
// it by the concretized range of their difference, which stays sound.
//
// Preconditions: `SymTable` ranges only mention symbols of strictly outer loops.
// Postconditions: every operation returns an interval containing all values
//                 the exact operation can produce.
// Failure modes: none (overflow saturates to an unbounded side).
// Side effects: none.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

// ── Affine forms ────────────────────────────────────────────────────────────

/// `constant + Σ coeff·sym`. Zero coefficients are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Linear {
    pub constant: i64,
    pub terms: BTreeMap<String, i64>,
}

impl Linear {
    pub fn constant(c: i64) -> Self {
        Linear {
            constant: c,
            terms: BTreeMap::new(),
        }
    }

    pub fn sym(name: impl Into<String>) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(name.into(), 1);
        Linear { constant: 0, terms }
    }

    pub fn as_constant(&self) -> Option<i64> {
        if self.terms.is_empty() {
            Some(self.constant)
        } else {
            None
        }
    }

    pub fn coeff(&self, sym: &str) -> i64 {
        self.terms.get(sym).copied().unwrap_or(0)
    }

    pub fn add(&self, other: &Linear) -> Linear {
        let mut out = self.clone();
        out.constant = out.constant.saturating_add(other.constant);
        for (sym, c) in &other.terms {
            let entry = out.terms.entry(sym.clone()).or_insert(0);
            *entry = entry.saturating_add(*c);
            if *entry == 0 {
                out.terms.remove(sym);
            }
        }
        out
    }

    pub fn sub(&self, other: &Linear) -> Linear {
        self.add(&other.scale(-1))
    }

    pub fn add_const(&self, c: i64) -> Linear {
        let mut out = self.clone();
        out.constant = out.constant.saturating_add(c);
        out
    }

    pub fn scale(&self, k: i64) -> Linear {
        if k == 0 {
            return Linear::constant(0);
        }
        Linear {
            constant: self.constant.saturating_mul(k),
            terms: self
                .terms
                .iter()
                .map(|(s, c)| (s.clone(), c.saturating_mul(k)))
                .collect(),
        }
    }

    /// Floor division by a positive constant, exact when every coefficient is
    /// a multiple of `k`: `⌊(c + Σ k·a·s) / k⌋ = ⌊c/k⌋ + Σ a·s`.
    pub fn div_exact(&self, k: i64) -> Option<Linear> {
        if k <= 0 || self.terms.values().any(|c| c % k != 0) {
            return None;
        }
        Some(Linear {
            constant: floor_div(self.constant, k),
            terms: self.terms.iter().map(|(s, c)| (s.clone(), c / k)).collect(),
        })
    }

    pub fn syms(&self) -> impl Iterator<Item = &String> {
        self.terms.keys()
    }
}

impl fmt::Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (sym, c) in &self.terms {
            let (sign, mag) = if *c < 0 { ("-", -c) } else { ("+", *c) };
            if first {
                if sign == "-" {
                    write!(f, "-")?;
                }
            } else {
                write!(f, " {sign} ")?;
            }
            if mag == 1 {
                write!(f, "{sym}")?;
            } else {
                write!(f, "{mag}*{sym}")?;
            }
            first = false;
        }
        if first {
            write!(f, "{}", self.constant)
        } else if self.constant > 0 {
            write!(f, " + {}", self.constant)
        } else if self.constant < 0 {
            write!(f, " - {}", -self.constant)
        } else {
            Ok(())
        }
    }
}

/// Floor division (rounds toward negative infinity). `x / 0 == 0`.
pub fn floor_div(a: i64, b: i64) -> i64 {
    if b == 0 {
        return 0;
    }
    let q = a.wrapping_div(b);
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Euclidean modulus (always non-negative). `x % 0 == 0`.
pub fn euclid_mod(a: i64, b: i64) -> i64 {
    if b == 0 {
        return 0;
    }
    a.rem_euclid(b)
}

// ── Bounds ──────────────────────────────────────────────────────────────────

/// One side of an interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Bound {
    NegInf,
    Finite(Linear),
    PosInf,
}

impl Bound {
    pub fn constant(c: i64) -> Self {
        Bound::Finite(Linear::constant(c))
    }

    pub fn sym(name: impl Into<String>) -> Self {
        Bound::Finite(Linear::sym(name))
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Bound::Finite(l) => l.as_constant(),
            _ => None,
        }
    }

    pub fn as_linear(&self) -> Option<&Linear> {
        match self {
            Bound::Finite(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Bound::Finite(_))
    }

    /// Sum of two bounds on the same side. Infinities absorb; `upper` decides
    /// which infinity wins when both appear.
    fn add_side(&self, other: &Bound, upper: bool) -> Bound {
        match (self, other) {
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(a.add(b)),
            (Bound::PosInf, _) | (_, Bound::PosInf) if upper => Bound::PosInf,
            (Bound::NegInf, _) | (_, Bound::NegInf) if !upper => Bound::NegInf,
            (Bound::PosInf, _) | (_, Bound::PosInf) => Bound::PosInf,
            _ => Bound::NegInf,
        }
    }

    pub fn add_const(&self, c: i64) -> Bound {
        match self {
            Bound::Finite(l) => Bound::Finite(l.add_const(c)),
            other => other.clone(),
        }
    }

    pub fn scale(&self, k: i64) -> Bound {
        match self {
            Bound::Finite(l) => Bound::Finite(l.scale(k)),
            _ if k == 0 => Bound::constant(0),
            Bound::NegInf => {
                if k > 0 {
                    Bound::NegInf
                } else {
                    Bound::PosInf
                }
            }
            Bound::PosInf => {
                if k > 0 {
                    Bound::PosInf
                } else {
                    Bound::NegInf
                }
            }
        }
    }

    fn rank(&self) -> i8 {
        match self {
            Bound::NegInf => -1,
            Bound::Finite(_) => 0,
            Bound::PosInf => 1,
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::NegInf => write!(f, "-inf"),
            Bound::PosInf => write!(f, "+inf"),
            Bound::Finite(l) => write!(f, "{l}"),
        }
    }
}

// ── Symbol table ────────────────────────────────────────────────────────────

const MAX_RELAX_DEPTH: u32 = 64;

/// Range of every loop symbol, in terms of outer symbols.
#[derive(Debug, Clone, Default)]
pub struct SymTable {
    ranges: BTreeMap<String, Interval>,
}

impl SymTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sym: impl Into<String>, range: Interval) {
        self.ranges.insert(sym.into(), range);
    }

    pub fn get(&self, sym: &str) -> Option<&Interval> {
        self.ranges.get(sym)
    }

    pub fn contains(&self, sym: &str) -> bool {
        self.ranges.contains_key(sym)
    }

    /// Eliminate every symbol not in `fixed` by substituting the endpoint of
    /// its range that maximizes (`upper`) or minimizes the bound.
    pub fn relax_bound(&self, bound: &Bound, fixed: &BTreeSet<String>, upper: bool) -> Bound {
        self.relax_bound_depth(bound, fixed, upper, 0)
    }

    fn relax_bound_depth(
        &self,
        bound: &Bound,
        fixed: &BTreeSet<String>,
        upper: bool,
        depth: u32,
    ) -> Bound {
        let lin = match bound {
            Bound::Finite(l) => l,
            other => return other.clone(),
        };
        let infinite = if upper { Bound::PosInf } else { Bound::NegInf };
        if depth > MAX_RELAX_DEPTH {
            return infinite;
        }
        let mut out = Linear::constant(lin.constant);
        for (sym, &coeff) in &lin.terms {
            if fixed.contains(sym) {
                out = out.add(&Linear::sym(sym.clone()).scale(coeff));
                continue;
            }
            let Some(range) = self.ranges.get(sym) else {
                return infinite;
            };
            let endpoint = if (coeff > 0) == upper {
                &range.max
            } else {
                &range.min
            };
            match self.relax_bound_depth(endpoint, fixed, (coeff > 0) == upper, depth + 1) {
                Bound::Finite(l) => out = out.add(&l.scale(coeff)),
                _ => return infinite,
            }
        }
        Bound::Finite(out)
    }

    pub fn relax(&self, interval: &Interval, fixed: &BTreeSet<String>) -> Interval {
        Interval {
            min: self.relax_bound(&interval.min, fixed, false),
            max: self.relax_bound(&interval.max, fixed, true),
        }
    }

    /// Numeric value of a bound with every symbol relaxed. `None` = infinite.
    pub fn numeric(&self, bound: &Bound, upper: bool) -> Option<i64> {
        self.relax_bound(bound, &BTreeSet::new(), upper).as_constant()
    }

    pub fn concretize(&self, interval: &Interval) -> Interval {
        self.relax(interval, &BTreeSet::new())
    }

    /// Provable ordering of two bounds, using the concretized range of their
    /// difference when it is not constant.
    pub fn compare(&self, a: &Bound, b: &Bound) -> Option<Ordering> {
        match (a, b) {
            (Bound::Finite(x), Bound::Finite(y)) => {
                let diff = Bound::Finite(y.sub(x));
                let lo = self.numeric(&diff, false);
                let hi = self.numeric(&diff, true);
                match (lo, hi) {
                    (Some(0), Some(0)) => Some(Ordering::Equal),
                    (Some(l), _) if l >= 0 => Some(Ordering::Less),
                    (_, Some(h)) if h <= 0 => Some(Ordering::Greater),
                    _ => None,
                }
            }
            _ if a == b => Some(Ordering::Equal),
            _ => Some(a.rank().cmp(&b.rank())),
        }
    }

    /// A bound no larger than both `a` and `b`.
    pub fn lower_of(&self, a: &Bound, b: &Bound) -> Bound {
        match self.compare(a, b) {
            Some(Ordering::Greater) => b.clone(),
            Some(_) => a.clone(),
            None => self.widen(a, b, false),
        }
    }

    /// A bound no smaller than both `a` and `b`.
    pub fn upper_of(&self, a: &Bound, b: &Bound) -> Bound {
        match self.compare(a, b) {
            Some(Ordering::Less) => b.clone(),
            Some(_) => a.clone(),
            None => self.widen(a, b, true),
        }
    }

    /// The tighter of two valid lower (`upper == false`) or upper bounds.
    /// Either one is sound, so an incomparable pair keeps `a`.
    pub fn tighter(&self, a: &Bound, b: &Bound, upper: bool) -> Bound {
        match (self.compare(a, b), upper) {
            (Some(Ordering::Less), true) | (Some(Ordering::Greater), false) => a.clone(),
            (Some(_), _) => b.clone(),
            (None, _) => a.clone(),
        }
    }

    fn widen(&self, a: &Bound, b: &Bound, upper: bool) -> Bound {
        let (Bound::Finite(x), Bound::Finite(y)) = (a, b) else {
            return if upper { Bound::PosInf } else { Bound::NegInf };
        };
        let diff = Bound::Finite(y.sub(x));
        match self.numeric(&diff, upper) {
            Some(d) if upper => Bound::Finite(x.add_const(d.max(0))),
            Some(d) => Bound::Finite(x.add_const(d.min(0))),
            None if upper => Bound::PosInf,
            None => Bound::NegInf,
        }
    }
}

// ── Intervals ───────────────────────────────────────────────────────────────

/// A closed interval `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Interval {
    pub min: Bound,
    pub max: Bound,
}

impl Interval {
    pub fn new(min: Bound, max: Bound) -> Self {
        Interval { min, max }
    }

    pub fn everything() -> Self {
        Interval {
            min: Bound::NegInf,
            max: Bound::PosInf,
        }
    }

    pub fn constant(c: i64) -> Self {
        Interval::range(c, c)
    }

    pub fn range(lo: i64, hi: i64) -> Self {
        Interval {
            min: Bound::constant(lo),
            max: Bound::constant(hi),
        }
    }

    /// `[min, min + extent - 1]`.
    pub fn from_min_extent(min: i64, extent: i64) -> Self {
        Interval::range(min, min + extent - 1)
    }

    pub fn point(l: Linear) -> Self {
        Interval {
            min: Bound::Finite(l.clone()),
            max: Bound::Finite(l),
        }
    }

    pub fn sym(name: impl Into<String>) -> Self {
        Interval::point(Linear::sym(name))
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    pub fn as_constant_range(&self) -> Option<(i64, i64)> {
        Some((self.min.as_constant()?, self.max.as_constant()?))
    }

    pub fn is_single_point(&self) -> bool {
        self.is_bounded() && self.min == self.max
    }

    /// `max - min + 1`, when both sides are finite.
    pub fn extent(&self) -> Option<Linear> {
        match (&self.min, &self.max) {
            (Bound::Finite(lo), Bound::Finite(hi)) => Some(hi.sub(lo).add_const(1)),
            _ => None,
        }
    }

    /// Largest possible extent over every value of the remaining symbols.
    pub fn max_extent(&self, table: &SymTable) -> Option<i64> {
        let ext = self.extent()?;
        table.numeric(&Bound::Finite(ext), true)
    }

    pub fn add(&self, other: &Interval) -> Interval {
        Interval {
            min: self.min.add_side(&other.min, false),
            max: self.max.add_side(&other.max, true),
        }
    }

    pub fn neg(&self) -> Interval {
        Interval {
            min: self.max.scale(-1),
            max: self.min.scale(-1),
        }
    }

    pub fn sub(&self, other: &Interval) -> Interval {
        self.add(&other.neg())
    }

    pub fn add_const(&self, c: i64) -> Interval {
        Interval {
            min: self.min.add_const(c),
            max: self.max.add_const(c),
        }
    }

    pub fn scale(&self, k: i64) -> Interval {
        if k >= 0 {
            Interval {
                min: self.min.scale(k),
                max: self.max.scale(k),
            }
        } else {
            Interval {
                min: self.max.scale(k),
                max: self.min.scale(k),
            }
        }
    }

    pub fn mul(&self, other: &Interval, table: &SymTable) -> Interval {
        if let Some((k, k2)) = other.as_constant_range() {
            if k == k2 {
                return self.scale(k);
            }
        }
        if let Some((k, k2)) = self.as_constant_range() {
            if k == k2 {
                return other.scale(k);
            }
        }
        let a = table.concretize(self);
        let b = table.concretize(other);
        let (Some((alo, ahi)), Some((blo, bhi))) = (a.as_constant_range(), b.as_constant_range())
        else {
            return Interval::everything();
        };
        let corners = [
            alo.checked_mul(blo),
            alo.checked_mul(bhi),
            ahi.checked_mul(blo),
            ahi.checked_mul(bhi),
        ];
        if corners.iter().any(Option::is_none) {
            return Interval::everything();
        }
        let values: Vec<i64> = corners.iter().flatten().copied().collect();
        let lo = values.iter().copied().min().unwrap_or(0);
        let hi = values.iter().copied().max().unwrap_or(0);
        Interval::range(lo, hi)
    }

    /// Floor division by a constant.
    pub fn div_const(&self, k: i64, table: &SymTable) -> Interval {
        if k == 0 {
            return Interval::constant(0);
        }
        if k > 0 {
            return Interval {
                min: div_bound(&self.min, k, false, table),
                max: div_bound(&self.max, k, true, table),
            };
        }
        let c = table.concretize(self);
        match c.as_constant_range() {
            Some((lo, hi)) => Interval::range(floor_div(hi, k), floor_div(lo, k)),
            None => Interval::everything(),
        }
    }

    pub fn div(&self, other: &Interval, table: &SymTable) -> Interval {
        if let Some((k, k2)) = other.as_constant_range() {
            if k == k2 {
                return self.div_const(k, table);
            }
        }
        let a = table.concretize(self);
        let b = table.concretize(other);
        let Some((alo, ahi)) = a.as_constant_range() else {
            return Interval::everything();
        };
        match b.as_constant_range() {
            Some((blo, bhi)) if blo > 0 || bhi < 0 => {
                let q = [
                    floor_div(alo, blo),
                    floor_div(alo, bhi),
                    floor_div(ahi, blo),
                    floor_div(ahi, bhi),
                ];
                Interval::range(
                    q.iter().copied().min().unwrap_or(0),
                    q.iter().copied().max().unwrap_or(0),
                )
            }
            _ => {
                let m = alo.saturating_abs().max(ahi.saturating_abs());
                Interval::range(-m, m)
            }
        }
    }

    /// Euclidean modulus by a constant.
    pub fn mod_const(&self, k: i64, table: &SymTable) -> Interval {
        if k == 0 {
            return Interval::constant(0);
        }
        let m = k.saturating_abs();
        let c = table.concretize(self);
        if let Some((lo, hi)) = c.as_constant_range() {
            if floor_div(lo, m) == floor_div(hi, m) {
                return Interval::range(euclid_mod(lo, m), euclid_mod(hi, m));
            }
        }
        Interval::range(0, m - 1)
    }

    pub fn modulo(&self, other: &Interval, table: &SymTable) -> Interval {
        if let Some((k, k2)) = other.as_constant_range() {
            if k == k2 {
                return self.mod_const(k, table);
            }
        }
        let b = table.concretize(other);
        match b.as_constant_range() {
            Some((blo, bhi)) => {
                let m = blo.saturating_abs().max(bhi.saturating_abs());
                Interval::range(0, (m - 1).max(0))
            }
            None => Interval::new(Bound::constant(0), Bound::PosInf),
        }
    }

    pub fn min(&self, other: &Interval, table: &SymTable) -> Interval {
        Interval {
            min: table.lower_of(&self.min, &other.min),
            max: table.tighter(&self.max, &other.max, true),
        }
    }

    pub fn max(&self, other: &Interval, table: &SymTable) -> Interval {
        Interval {
            min: table.tighter(&self.min, &other.min, false),
            max: table.upper_of(&self.max, &other.max),
        }
    }

    /// Smallest interval (up to widening) containing both.
    pub fn union(&self, other: &Interval, table: &SymTable) -> Interval {
        Interval {
            min: table.lower_of(&self.min, &other.min),
            max: table.upper_of(&self.max, &other.max),
        }
    }

    /// An interval containing the intersection of both.
    pub fn intersect(&self, other: &Interval, table: &SymTable) -> Interval {
        Interval {
            min: table.tighter(&self.min, &other.min, false),
            max: table.tighter(&self.max, &other.max, true),
        }
    }

    /// True when `self ⊆ other` is provable.
    pub fn is_subset_of(&self, other: &Interval, table: &SymTable) -> bool {
        let lo_ok = matches!(
            table.compare(&other.min, &self.min),
            Some(Ordering::Less | Ordering::Equal)
        );
        let hi_ok = matches!(
            table.compare(&self.max, &other.max),
            Some(Ordering::Less | Ordering::Equal)
        );
        lo_ok && hi_ok
    }

    /// Clamp each side into `[lo, hi]` (numeric type range).
    pub fn clamp_to(&self, lo: i64, hi: i64, table: &SymTable) -> Interval {
        self.intersect(&Interval::range(lo, hi), table)
            .max(&Interval::constant(lo), table)
            .min(&Interval::constant(hi), table)
    }
}

fn div_bound(bound: &Bound, k: i64, upper: bool, table: &SymTable) -> Bound {
    match bound {
        Bound::Finite(l) => {
            if let Some(q) = l.div_exact(k) {
                return Bound::Finite(q);
            }
            match table.numeric(bound, upper) {
                Some(v) => Bound::constant(floor_div(v, k)),
                None if upper => Bound::PosInf,
                None => Bound::NegInf,
            }
        }
        other => other.clone(),
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// A box: one interval per dimension of a Func, in argument order.
pub type Region = Vec<Interval>;

pub fn region_union(a: &Region, b: &Region, table: &SymTable) -> Region {
    a.iter().zip(b).map(|(x, y)| x.union(y, table)).collect()
}

pub fn display_region(region: &Region) -> String {
    let parts: Vec<String> = region.iter().map(|i| i.to_string()).collect();
    format!("{{{}}}", parts.join(" x "))
}

// ── Tests ───────────────────────────────────────────────────────────────────
