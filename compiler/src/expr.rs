// expr.rs — Closed expression tree for Func definitions and loop bodies
//
// A single tagged variant covers every node kind; interval evaluation,
// monotonicity, affine analysis and type inference are exhaustive matches, so
// adding a node kind is a compile error everywhere it must be handled.
//
// Dimensions appear as `Var::Dim` while a definition is being authored and
// analyzed; synthesis substitutes them by `Var::Loop` symbols.
//
// Preconditions: `Call`/`Input` ids refer to entities of the owning graph.
// Postconditions: `bounds_of` returns a sound over-approximation.
// Failure modes: `type_of` reports mismatches as `Err(message)`.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;
use std::ops;

use serde::Serialize;

use crate::id::{DimId, FuncId, InputId};
use crate::interval::{Bound, Interval, Linear, SymTable};

// ── Types ───────────────────────────────────────────────────────────────────

/// Scalar element type of a Func or input value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScalarType {
    Bool,
    Int(u8),
    UInt(u8),
}

impl ScalarType {
    pub const I32: ScalarType = ScalarType::Int(32);

    pub fn bits(self) -> u8 {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int(b) | ScalarType::UInt(b) => b.clamp(1, 64),
        }
    }

    pub fn bytes(self) -> i64 {
        match self {
            ScalarType::Bool => 1,
            _ => (i64::from(self.bits()) + 7) / 8,
        }
    }

    pub fn min_value(self) -> i64 {
        match self {
            ScalarType::Bool | ScalarType::UInt(_) => 0,
            ScalarType::Int(_) => {
                let b = self.bits();
                if b >= 64 {
                    i64::MIN
                } else {
                    -(1i64 << (b - 1))
                }
            }
        }
    }

    pub fn max_value(self) -> i64 {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int(_) => {
                let b = self.bits();
                if b >= 64 {
                    i64::MAX
                } else {
                    (1i64 << (b - 1)) - 1
                }
            }
            ScalarType::UInt(_) => {
                let b = self.bits();
                if b >= 63 {
                    i64::MAX
                } else {
                    (1i64 << b) - 1
                }
            }
        }
    }

    /// Interval of every representable value. 64-bit types are unbounded.
    pub fn range(self) -> Interval {
        if self.bits() >= 63 {
            return match self {
                ScalarType::UInt(_) => Interval::new(Bound::constant(0), Bound::PosInf),
                _ => Interval::everything(),
            };
        }
        Interval::range(self.min_value(), self.max_value())
    }

    /// Two's-complement wrap of `v` into this type.
    pub fn wrap(self, v: i64) -> i64 {
        match self {
            ScalarType::Bool => i64::from(v != 0),
            ScalarType::Int(_) => {
                let b = u32::from(self.bits());
                if b >= 64 {
                    v
                } else {
                    let shift = 64 - b;
                    (v << shift) >> shift
                }
            }
            ScalarType::UInt(_) => {
                let b = u32::from(self.bits());
                if b >= 64 {
                    v
                } else {
                    v & ((1i64 << b) - 1)
                }
            }
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Bool => write!(f, "bool"),
            ScalarType::Int(b) => write!(f, "int{b}"),
            ScalarType::UInt(b) => write!(f, "uint{b}"),
        }
    }
}

// ── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Var {
    /// A pure or reduction dimension of the graph.
    Dim(DimId),
    /// A loop symbol of the synthesized nest.
    Loop(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// Integer semantics shared by constant folding and the evaluator.
    pub fn apply(self, a: i64, b: i64) -> i64 {
        use crate::interval::{euclid_mod, floor_div};
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => floor_div(a, b),
            BinOp::Mod => euclid_mod(a, b),
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
            BinOp::Eq => i64::from(a == b),
            BinOp::Ne => i64::from(a != b),
            BinOp::Lt => i64::from(a < b),
            BinOp::Le => i64::from(a <= b),
            BinOp::Gt => i64::from(a > b),
            BinOp::Ge => i64::from(a >= b),
            BinOp::And => i64::from(a != 0 && b != 0),
            BinOp::Or => i64::from(a != 0 || b != 0),
        }
    }
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Expr {
    /// Literal; `ty == None` is an untyped literal that adopts its partner's type.
    Const { value: i64, ty: Option<ScalarType> },
    Var(Var),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
    Cast(ScalarType, Box<Expr>),
    Call {
        func: FuncId,
        component: usize,
        args: Vec<Expr>,
    },
    Input { input: InputId, args: Vec<Expr> },
}

/// Direction of change of an expression in one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Monotonic {
    Constant,
    Increasing,
    Decreasing,
    Unknown,
}

impl Monotonic {
    fn flip(self) -> Monotonic {
        match self {
            Monotonic::Increasing => Monotonic::Decreasing,
            Monotonic::Decreasing => Monotonic::Increasing,
            other => other,
        }
    }

    fn combine(self, other: Monotonic) -> Monotonic {
        match (self, other) {
            (Monotonic::Constant, m) | (m, Monotonic::Constant) => m,
            (a, b) if a == b => a,
            _ => Monotonic::Unknown,
        }
    }
}

/// A read of a Func found inside an expression.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub func: FuncId,
    pub component: usize,
    pub args: &'a [Expr],
}

// ── Environments ────────────────────────────────────────────────────────────

/// Supplies variable ranges and value ranges of loads for `bounds_of`.
pub trait BoundsEnv {
    fn var(&self, v: &Var) -> Interval;
    fn table(&self) -> &SymTable;
    fn call_range(&self, func: FuncId, component: usize) -> Interval;
    fn input_range(&self, input: InputId) -> Interval;
}

/// Supplies value types of Funcs and inputs for `type_of`.
pub trait TypeEnv {
    fn call_type(&self, func: FuncId, component: usize) -> Option<ScalarType>;
    fn input_type(&self, input: InputId) -> Option<ScalarType>;
}

/// Name resolution for Display.
pub trait NameLookup {
    fn func_name(&self, func: FuncId) -> &str;
    fn input_name(&self, input: InputId) -> &str;
    fn dim_name(&self, dim: DimId) -> &str;
}

// ── Construction ────────────────────────────────────────────────────────────

impl Expr {
    pub fn int(value: i64) -> Expr {
        Expr::Const { value, ty: None }
    }

    pub fn typed(value: i64, ty: ScalarType) -> Expr {
        Expr::Const {
            value,
            ty: Some(ty),
        }
    }

    pub fn dim(d: DimId) -> Expr {
        Expr::Var(Var::Dim(d))
    }

    pub fn sym(name: impl Into<String>) -> Expr {
        Expr::Var(Var::Loop(name.into()))
    }

    pub fn call(func: FuncId, args: Vec<Expr>) -> Expr {
        Expr::Call {
            func,
            component: 0,
            args,
        }
    }

    pub fn call_component(func: FuncId, component: usize, args: Vec<Expr>) -> Expr {
        Expr::Call {
            func,
            component,
            args,
        }
    }

    pub fn input(input: InputId, args: Vec<Expr>) -> Expr {
        Expr::Input { input, args }
    }

    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn min(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinOp::Min, a, b)
    }

    pub fn max(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinOp::Max, a, b)
    }

    pub fn select(cond: Expr, t: Expr, f: Expr) -> Expr {
        Expr::Select(Box::new(cond), Box::new(t), Box::new(f))
    }

    pub fn cast(ty: ScalarType, e: Expr) -> Expr {
        Expr::Cast(ty, Box::new(e))
    }

    pub fn eq(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Eq, self, other.into())
    }

    pub fn ne(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ne, self, other.into())
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Lt, self, other.into())
    }

    pub fn le(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Le, self, other.into())
    }

    pub fn gt(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Gt, self, other.into())
    }

    pub fn ge(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ge, self, other.into())
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::binary(BinOp::And, self, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::binary(BinOp::Or, self, other)
    }

    pub fn not(self) -> Expr {
        Expr::Unary(UnOp::Not, Box::new(self))
    }

    /// `max(min(e, hi), lo)`.
    pub fn clamp(self, lo: Expr, hi: Expr) -> Expr {
        Expr::max(Expr::min(self, hi), lo)
    }

    /// Affine form over loop symbols, rendered as an expression.
    pub fn from_linear(l: &Linear) -> Expr {
        let mut acc: Option<Expr> = None;
        for (sym, &c) in &l.terms {
            let term = if c == 1 {
                Expr::sym(sym.clone())
            } else {
                Expr::sym(sym.clone()) * c
            };
            acc = Some(match acc {
                None => term,
                Some(a) => a + term,
            });
        }
        match acc {
            None => Expr::int(l.constant),
            Some(a) if l.constant > 0 => a + l.constant,
            Some(a) if l.constant < 0 => a - (-l.constant),
            Some(a) => a,
        }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::int(v)
    }
}

impl From<DimId> for Expr {
    fn from(d: DimId) -> Self {
        Expr::dim(d)
    }
}

macro_rules! arith_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Expr>> ops::$trait<T> for Expr {
            type Output = Expr;
            fn $method(self, rhs: T) -> Expr {
                Expr::binary($op, self, rhs.into())
            }
        }
    };
}

arith_op!(Add, add, BinOp::Add);
arith_op!(Sub, sub, BinOp::Sub);
arith_op!(Mul, mul, BinOp::Mul);
arith_op!(Div, div, BinOp::Div);
arith_op!(Rem, rem, BinOp::Mod);

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary(UnOp::Neg, Box::new(self))
    }
}

// ── Queries ─────────────────────────────────────────────────────────────────

impl Expr {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Expr::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dim(&self) -> Option<DimId> {
        match self {
            Expr::Var(Var::Dim(d)) => Some(*d),
            _ => None,
        }
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const { .. } | Expr::Var(_) => Vec::new(),
            Expr::Unary(_, a) | Expr::Cast(_, a) => vec![a],
            Expr::Binary(_, a, b) => vec![a, b],
            Expr::Select(c, t, f) => vec![c, t, f],
            Expr::Call { args, .. } | Expr::Input { args, .. } => args.iter().collect(),
        }
    }

    /// Pre-order visit of every node.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    pub fn mentions(&self, v: &Var) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Var(x) = e {
                found |= x == v;
            }
        });
        found
    }

    pub fn dims(&self) -> BTreeSet<DimId> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Var(Var::Dim(d)) = e {
                out.insert(*d);
            }
        });
        out
    }

    pub fn loop_syms(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Var(Var::Loop(s)) = e {
                out.insert(s.clone());
            }
        });
        out
    }

    /// Every Func read, outermost first.
    pub fn calls(&self) -> Vec<CallSite<'_>> {
        let mut out = Vec::new();
        collect_calls(self, &mut out);
        out
    }

    pub fn inputs(&self) -> BTreeSet<InputId> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Input { input, .. } = e {
                out.insert(*input);
            }
        });
        out
    }

    pub fn calls_func(&self, func: FuncId) -> bool {
        self.calls().iter().any(|c| c.func == func)
    }
}

fn collect_calls<'a>(e: &'a Expr, out: &mut Vec<CallSite<'a>>) {
    if let Expr::Call {
        func,
        component,
        args,
    } = e
    {
        out.push(CallSite {
            func: *func,
            component: *component,
            args,
        });
    }
    for c in e.children() {
        collect_calls(c, out);
    }
}

// ── Rewriting ───────────────────────────────────────────────────────────────

impl Expr {
    /// Replace variables for which `f` returns a substitute.
    pub fn substitute(&self, f: &impl Fn(&Var) -> Option<Expr>) -> Expr {
        match self {
            Expr::Var(v) => f(v).unwrap_or_else(|| self.clone()),
            Expr::Const { .. } => self.clone(),
            Expr::Unary(op, a) => Expr::Unary(*op, Box::new(a.substitute(f))),
            Expr::Binary(op, a, b) => {
                Expr::Binary(*op, Box::new(a.substitute(f)), Box::new(b.substitute(f)))
            }
            Expr::Select(c, t, e) => Expr::Select(
                Box::new(c.substitute(f)),
                Box::new(t.substitute(f)),
                Box::new(e.substitute(f)),
            ),
            Expr::Cast(ty, a) => Expr::Cast(*ty, Box::new(a.substitute(f))),
            Expr::Call {
                func,
                component,
                args,
            } => Expr::Call {
                func: *func,
                component: *component,
                args: args.iter().map(|a| a.substitute(f)).collect(),
            },
            Expr::Input { input, args } => Expr::Input {
                input: *input,
                args: args.iter().map(|a| a.substitute(f)).collect(),
            },
        }
    }

    /// Bottom-up rewrite of Func reads. `f` sees already-rewritten arguments
    /// and returns the replacement node.
    pub fn rewrite_calls(&self, f: &mut impl FnMut(FuncId, usize, Vec<Expr>) -> Expr) -> Expr {
        match self {
            Expr::Const { .. } | Expr::Var(_) => self.clone(),
            Expr::Unary(op, a) => Expr::Unary(*op, Box::new(a.rewrite_calls(f))),
            Expr::Binary(op, a, b) => {
                let a = a.rewrite_calls(f);
                let b = b.rewrite_calls(f);
                Expr::Binary(*op, Box::new(a), Box::new(b))
            }
            Expr::Select(c, t, e) => {
                let c = c.rewrite_calls(f);
                let t = t.rewrite_calls(f);
                let e = e.rewrite_calls(f);
                Expr::Select(Box::new(c), Box::new(t), Box::new(e))
            }
            Expr::Cast(ty, a) => Expr::Cast(*ty, Box::new(a.rewrite_calls(f))),
            Expr::Call {
                func,
                component,
                args,
            } => {
                let args = args.iter().map(|a| a.rewrite_calls(f)).collect();
                f(*func, *component, args)
            }
            Expr::Input { input, args } => Expr::Input {
                input: *input,
                args: args.iter().map(|a| a.rewrite_calls(f)).collect(),
            },
        }
    }

    /// Constant folding plus the identities `x+0`, `x*1`, `x*0`.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Unary(UnOp::Neg, a) => {
                let a = a.simplify();
                match a.as_const() {
                    Some(v) => Expr::int(v.wrapping_neg()),
                    None => Expr::Unary(UnOp::Neg, Box::new(a)),
                }
            }
            Expr::Unary(UnOp::Not, a) => {
                let a = a.simplify();
                match a.as_const() {
                    Some(v) => Expr::int(i64::from(v == 0)),
                    None => Expr::Unary(UnOp::Not, Box::new(a)),
                }
            }
            Expr::Binary(op, a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (op, a.as_const(), b.as_const()) {
                    (_, Some(x), Some(y)) if !matches!(a, Expr::Const { ty: Some(_), .. }) => {
                        Expr::int(op.apply(x, y))
                    }
                    (BinOp::Add, Some(0), _) => b,
                    (BinOp::Add | BinOp::Sub, _, Some(0)) => a,
                    (BinOp::Mul, Some(1), _) => b,
                    (BinOp::Mul | BinOp::Div, _, Some(1)) => a,
                    (BinOp::Mul, Some(0), _) | (BinOp::Mul, _, Some(0)) => Expr::int(0),
                    _ => Expr::Binary(*op, Box::new(a), Box::new(b)),
                }
            }
            Expr::Select(c, t, f) => {
                let c = c.simplify();
                match c.as_const() {
                    Some(0) => f.simplify(),
                    Some(_) => t.simplify(),
                    None => Expr::Select(Box::new(c), Box::new(t.simplify()), Box::new(f.simplify())),
                }
            }
            Expr::Cast(ty, a) => Expr::Cast(*ty, Box::new(a.simplify())),
            Expr::Call {
                func,
                component,
                args,
            } => Expr::Call {
                func: *func,
                component: *component,
                args: args.iter().map(Expr::simplify).collect(),
            },
            Expr::Input { input, args } => Expr::Input {
                input: *input,
                args: args.iter().map(Expr::simplify).collect(),
            },
            Expr::Const { .. } | Expr::Var(_) => self.clone(),
        }
    }
}

// ── Interval evaluation ─────────────────────────────────────────────────────

impl Expr {
    /// Sound range of the expression under `env`.
    pub fn bounds_of(&self, env: &impl BoundsEnv) -> Interval {
        let table = env.table();
        match self {
            Expr::Const { value, .. } => Interval::constant(*value),
            Expr::Var(v) => env.var(v),
            Expr::Unary(UnOp::Neg, a) => a.bounds_of(env).neg(),
            Expr::Unary(UnOp::Not, _) => Interval::range(0, 1),
            Expr::Binary(op, a, b) => {
                if op.is_comparison() || op.is_logical() {
                    return Interval::range(0, 1);
                }
                let x = a.bounds_of(env);
                let y = b.bounds_of(env);
                match op {
                    BinOp::Add => x.add(&y),
                    BinOp::Sub => x.sub(&y),
                    BinOp::Mul => x.mul(&y, table),
                    BinOp::Div => x.div(&y, table),
                    BinOp::Mod => x.modulo(&y, table),
                    BinOp::Min => x.min(&y, table),
                    BinOp::Max => x.max(&y, table),
                    _ => Interval::range(0, 1),
                }
            }
            Expr::Select(_, t, f) => t.bounds_of(env).union(&f.bounds_of(env), table),
            Expr::Cast(ty, a) => {
                let inner = a.bounds_of(env);
                let range = ty.range();
                if table.concretize(&inner).is_subset_of(&range, table) {
                    inner
                } else {
                    range
                }
            }
            Expr::Call {
                func, component, ..
            } => env.call_range(*func, *component),
            Expr::Input { input, .. } => env.input_range(*input),
        }
    }

    /// How the expression changes as `v` increases.
    pub fn monotonicity(&self, v: &Var) -> Monotonic {
        if !self.mentions(v) {
            return Monotonic::Constant;
        }
        match self {
            Expr::Const { .. } => Monotonic::Constant,
            Expr::Var(x) => {
                if x == v {
                    Monotonic::Increasing
                } else {
                    Monotonic::Constant
                }
            }
            Expr::Unary(UnOp::Neg, a) => a.monotonicity(v).flip(),
            Expr::Unary(UnOp::Not, _) => Monotonic::Unknown,
            Expr::Binary(op, a, b) => {
                let ma = a.monotonicity(v);
                let mb = b.monotonicity(v);
                match op {
                    BinOp::Add | BinOp::Min | BinOp::Max => ma.combine(mb),
                    BinOp::Sub => ma.combine(mb.flip()),
                    BinOp::Mul => match (b.as_const(), a.as_const()) {
                        (Some(k), _) if k > 0 => ma,
                        (Some(k), _) if k < 0 => ma.flip(),
                        (_, Some(k)) if k > 0 => mb,
                        (_, Some(k)) if k < 0 => mb.flip(),
                        (Some(0), _) | (_, Some(0)) => Monotonic::Constant,
                        _ => Monotonic::Unknown,
                    },
                    BinOp::Div => match b.as_const() {
                        Some(k) if k > 0 => ma,
                        Some(k) if k < 0 => ma.flip(),
                        _ => Monotonic::Unknown,
                    },
                    _ => Monotonic::Unknown,
                }
            }
            Expr::Select(c, t, f) => {
                if c.mentions(v) {
                    Monotonic::Unknown
                } else {
                    t.monotonicity(v).combine(f.monotonicity(v))
                }
            }
            Expr::Cast(_, _) | Expr::Call { .. } | Expr::Input { .. } => Monotonic::Unknown,
        }
    }

    /// Coefficient `k` when the expression is `k·v + (terms free of v)`.
    pub fn affine_in(&self, v: &Var) -> Option<i64> {
        if !self.mentions(v) {
            return Some(0);
        }
        match self {
            Expr::Var(x) if x == v => Some(1),
            Expr::Unary(UnOp::Neg, a) => a.affine_in(v).map(|k| -k),
            Expr::Binary(BinOp::Add, a, b) => Some(a.affine_in(v)? + b.affine_in(v)?),
            Expr::Binary(BinOp::Sub, a, b) => Some(a.affine_in(v)? - b.affine_in(v)?),
            Expr::Binary(BinOp::Mul, a, b) => match (a.as_const(), b.as_const()) {
                (Some(k), _) => Some(k * b.affine_in(v)?),
                (_, Some(k)) => Some(k * a.affine_in(v)?),
                _ => None,
            },
            _ => None,
        }
    }

    /// Affine form when the expression is built from constants and variables
    /// that `sym_of` maps to symbols with `+ - *const` only.
    pub fn to_linear(&self, sym_of: &impl Fn(&Var) -> Option<String>) -> Option<Linear> {
        match self {
            Expr::Const { value, .. } => Some(Linear::constant(*value)),
            Expr::Var(v) => sym_of(v).map(Linear::sym),
            Expr::Unary(UnOp::Neg, a) => Some(a.to_linear(sym_of)?.scale(-1)),
            Expr::Binary(BinOp::Add, a, b) => Some(a.to_linear(sym_of)?.add(&b.to_linear(sym_of)?)),
            Expr::Binary(BinOp::Sub, a, b) => Some(a.to_linear(sym_of)?.sub(&b.to_linear(sym_of)?)),
            Expr::Binary(BinOp::Mul, a, b) => {
                let la = a.to_linear(sym_of)?;
                let lb = b.to_linear(sym_of)?;
                match (la.as_constant(), lb.as_constant()) {
                    (Some(k), _) => Some(lb.scale(k)),
                    (_, Some(k)) => Some(la.scale(k)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

// ── Type inference ──────────────────────────────────────────────────────────

fn unify(a: Option<ScalarType>, b: Option<ScalarType>) -> Result<Option<ScalarType>, String> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(format!("operands of type {x} and {y}")),
        (Some(x), _) | (_, Some(x)) => Ok(Some(x)),
        (None, None) => Ok(None),
    }
}

impl Expr {
    /// Value type; `Ok(None)` for expressions built only from untyped literals.
    pub fn type_of(&self, env: &impl TypeEnv) -> Result<Option<ScalarType>, String> {
        match self {
            Expr::Const { ty, .. } => Ok(*ty),
            Expr::Var(_) => Ok(Some(ScalarType::I32)),
            Expr::Unary(UnOp::Neg, a) => a.type_of(env),
            Expr::Unary(UnOp::Not, a) => {
                unify(a.type_of(env)?, Some(ScalarType::Bool))?;
                Ok(Some(ScalarType::Bool))
            }
            Expr::Binary(op, a, b) => {
                let ta = a.type_of(env)?;
                let tb = b.type_of(env)?;
                if op.is_logical() {
                    unify(ta, Some(ScalarType::Bool))?;
                    unify(tb, Some(ScalarType::Bool))?;
                    return Ok(Some(ScalarType::Bool));
                }
                let t = unify(ta, tb)?;
                if op.is_comparison() {
                    Ok(Some(ScalarType::Bool))
                } else if t == Some(ScalarType::Bool) {
                    Err(format!("arithmetic '{}' on bool", op.symbol()))
                } else {
                    Ok(t)
                }
            }
            Expr::Select(c, t, f) => {
                unify(c.type_of(env)?, Some(ScalarType::Bool))
                    .map_err(|_| "select condition is not bool".to_string())?;
                unify(t.type_of(env)?, f.type_of(env)?)
            }
            Expr::Cast(ty, a) => {
                a.type_of(env)?;
                Ok(Some(*ty))
            }
            Expr::Call {
                func,
                component,
                args,
            } => {
                for a in args {
                    a.type_of(env)?;
                }
                Ok(env.call_type(*func, *component))
            }
            Expr::Input { input, args } => {
                for a in args {
                    a.type_of(env)?;
                }
                Ok(env.input_type(*input))
            }
        }
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

/// Borrowing wrapper that renders an expression with resolved names.
pub struct ExprDisplay<'a, N: NameLookup + ?Sized> {
    expr: &'a Expr,
    names: &'a N,
}

impl Expr {
    pub fn display<'a, N: NameLookup + ?Sized>(&'a self, names: &'a N) -> ExprDisplay<'a, N> {
        ExprDisplay { expr: self, names }
    }
}

impl<N: NameLookup + ?Sized> fmt::Display for ExprDisplay<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(self.expr, self.names, f, false)
    }
}

fn write_args<N: NameLookup + ?Sized>(
    args: &[Expr],
    names: &N,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_expr(a, names, f, false)?;
    }
    Ok(())
}

fn write_expr<N: NameLookup + ?Sized>(
    e: &Expr,
    names: &N,
    f: &mut fmt::Formatter<'_>,
    nested: bool,
) -> fmt::Result {
    match e {
        Expr::Const { value, ty: None } => write!(f, "{value}"),
        Expr::Const {
            value,
            ty: Some(ty),
        } => write!(f, "{ty}({value})"),
        Expr::Var(Var::Dim(d)) => write!(f, "{}", names.dim_name(*d)),
        Expr::Var(Var::Loop(s)) => write!(f, "{s}"),
        Expr::Unary(UnOp::Neg, a) => {
            write!(f, "-")?;
            write_expr(a, names, f, true)
        }
        Expr::Unary(UnOp::Not, a) => {
            write!(f, "!")?;
            write_expr(a, names, f, true)
        }
        Expr::Binary(op @ (BinOp::Min | BinOp::Max), a, b) => {
            write!(f, "{}(", op.symbol())?;
            write_expr(a, names, f, false)?;
            write!(f, ", ")?;
            write_expr(b, names, f, false)?;
            write!(f, ")")
        }
        Expr::Binary(op, a, b) => {
            if nested {
                write!(f, "(")?;
            }
            write_expr(a, names, f, true)?;
            write!(f, " {} ", op.symbol())?;
            write_expr(b, names, f, true)?;
            if nested {
                write!(f, ")")?;
            }
            Ok(())
        }
        Expr::Select(c, t, e) => {
            write!(f, "select(")?;
            write_args(&[(**c).clone(), (**t).clone(), (**e).clone()], names, f)?;
            write!(f, ")")
        }
        Expr::Cast(ty, a) => {
            write!(f, "{ty}(")?;
            write_expr(a, names, f, false)?;
            write!(f, ")")
        }
        Expr::Call {
            func,
            component,
            args,
        } => {
            write!(f, "{}(", names.func_name(*func))?;
            write_args(args, names, f)?;
            write!(f, ")")?;
            if *component > 0 {
                write!(f, "[{component}]")?;
            }
            Ok(())
        }
        Expr::Input { input, args } => {
            write!(f, "{}(", names.input_name(*input))?;
            write_args(args, names, f)?;
            write!(f, ")")
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Names;

    impl NameLookup for Names {
        fn func_name(&self, func: FuncId) -> &str {
            ["f", "g"][func.0 as usize]
        }
        fn input_name(&self, _input: InputId) -> &str {
            "in"
        }
        fn dim_name(&self, dim: DimId) -> &str {
            ["x", "y"][dim.0 as usize]
        }
    }

    struct Env {
        table: SymTable,
    }

    impl BoundsEnv for Env {
        fn var(&self, v: &Var) -> Interval {
            match v {
                Var::Dim(d) if d.0 == 0 => Interval::range(0, 9),
                Var::Dim(_) => Interval::range(-2, 2),
                Var::Loop(s) => Interval::sym(s.clone()),
            }
        }
        fn table(&self) -> &SymTable {
            &self.table
        }
        fn call_range(&self, _func: FuncId, _component: usize) -> Interval {
            ScalarType::UInt(8).range()
        }
        fn input_range(&self, _input: InputId) -> Interval {
            ScalarType::Int(16).range()
        }
    }

    fn x() -> Expr {
        Expr::dim(DimId(0))
    }

    fn y() -> Expr {
        Expr::dim(DimId(1))
    }

    #[test]
    fn display_nests_parentheses() {
        let e = (x() + 1) * 2 - Expr::call(FuncId(1), vec![x(), y() - 1]);
        assert_eq!(e.display(&Names).to_string(), "((x + 1) * 2) - g(x, y - 1)");
        let m = Expr::min(x(), Expr::cast(ScalarType::UInt(8), y()));
        assert_eq!(m.display(&Names).to_string(), "min(x, uint8(y))");
    }

    #[test]
    fn bounds_of_stencil_and_clamp() {
        let env = Env {
            table: SymTable::new(),
        };
        let e = x() + y();
        assert_eq!(e.bounds_of(&env).as_constant_range(), Some((-2, 11)));
        let c = (x() * 3).clamp(Expr::int(0), Expr::int(20));
        assert_eq!(c.bounds_of(&env).as_constant_range(), Some((0, 20)));
        let load = Expr::call(FuncId(0), vec![x()]) + 1;
        assert_eq!(load.bounds_of(&env).as_constant_range(), Some((1, 256)));
    }

    #[test]
    fn bounds_of_loop_symbols_stay_symbolic() {
        let env = Env {
            table: SymTable::new(),
        };
        let e = Expr::sym("g.s0.y") * 2 + 1;
        assert_eq!(e.bounds_of(&env).to_string(), "[2*g.s0.y + 1, 2*g.s0.y + 1]");
    }

    #[test]
    fn monotonicity_tracks_sign() {
        let vx = Var::Dim(DimId(0));
        assert_eq!((x() * -2 + y()).monotonicity(&vx), Monotonic::Decreasing);
        assert_eq!(Expr::max(x(), y() - x()).monotonicity(&vx), Monotonic::Unknown);
        assert_eq!((y() + 4).monotonicity(&vx), Monotonic::Constant);
        assert_eq!(((x() + 1) / 2).monotonicity(&vx), Monotonic::Increasing);
    }

    #[test]
    fn affine_in_rejects_products_of_variables() {
        let vx = Var::Dim(DimId(0));
        assert_eq!((x() * 3 - y() + 2).affine_in(&vx), Some(3));
        assert_eq!((x() * y()).affine_in(&vx), None);
        assert_eq!(y().affine_in(&vx), Some(0));
    }

    #[test]
    fn untyped_literals_adopt_partner_type() {
        struct Types;
        impl TypeEnv for Types {
            fn call_type(&self, _f: FuncId, _c: usize) -> Option<ScalarType> {
                Some(ScalarType::UInt(8))
            }
            fn input_type(&self, _i: InputId) -> Option<ScalarType> {
                Some(ScalarType::Int(16))
            }
        }
        let e = Expr::call(FuncId(0), vec![x()]) + 1;
        assert_eq!(e.type_of(&Types), Ok(Some(ScalarType::UInt(8))));
        let bad = Expr::call(FuncId(0), vec![x()]) + Expr::input(InputId(0), vec![x()]);
        assert!(bad.type_of(&Types).is_err());
        assert_eq!(Expr::int(3).type_of(&Types), Ok(None));
    }

    #[test]
    fn wrap_is_twos_complement() {
        assert_eq!(ScalarType::UInt(8).wrap(256 + 7), 7);
        assert_eq!(ScalarType::Int(8).wrap(128), -128);
        assert_eq!(ScalarType::Bool.wrap(5), 1);
        assert_eq!(ScalarType::Int(32).bytes(), 4);
    }

    #[test]
    fn simplify_folds_constants() {
        let e = (x() + 0) * 1 + (Expr::int(2) * 3);
        assert_eq!(e.simplify().display(&Names).to_string(), "x + 6");
        let l = Linear::sym("a").scale(8).add_const(-1);
        assert_eq!(Expr::from_linear(&l).display(&Names).to_string(), "(a * 8) - 1");
    }

    #[test]
    fn rewrite_calls_sees_rewritten_args() {
        let e = Expr::call(FuncId(1), vec![Expr::call(FuncId(0), vec![x()])]);
        let mut seen = Vec::new();
        let out = e.rewrite_calls(&mut |f, c, args| {
            seen.push(f);
            if f == FuncId(0) {
                args[0].clone() + 1
            } else {
                Expr::call_component(f, c, args)
            }
        });
        assert_eq!(seen, vec![FuncId(0), FuncId(1)]);
        assert_eq!(out.display(&Names).to_string(), "g(x + 1)");
    }
}
