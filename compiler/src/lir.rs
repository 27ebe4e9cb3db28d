//! LIR – loop-nest IR handed to the external code generator.
//!
//! `LoweredPipeline` is self-contained: every expression refers to loop
//! symbols, Func buffers and pipeline inputs only, and the name tables it
//! carries are enough to print or evaluate it without the graph it came from.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::diag::Diagnostic;
use crate::expr::{Expr, NameLookup, ScalarType};
use crate::id::{DimId, FuncId, InputId};
use crate::interval::{display_region, Region};
use crate::schedule::{ForKind, Partition};
use crate::storage::{hex, AllocDim, Allocation};

// ── Statements ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Stmt {
    /// Scoped buffer for a non-output Func.
    Allocate {
        func: FuncId,
        name: String,
        shape: Vec<AllocDim>,
        ring: Option<i64>,
        memo_key: Option<String>,
        body: Vec<Stmt>,
    },
    /// Marks the statements computing one stage of a Func.
    Produce {
        func: FuncId,
        name: String,
        stage: usize,
        body: Vec<Stmt>,
    },
    For {
        sym: String,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        partition: Partition,
        body: Vec<Stmt>,
    },
    /// Binds `sym` for the rest of the enclosing block.
    Let { sym: String, value: Expr },
    If { cond: Expr, body: Vec<Stmt> },
    Store {
        func: FuncId,
        args: Vec<Expr>,
        values: Vec<Expr>,
    },
}

impl Stmt {
    /// Visit this statement and every statement nested in it, pre-order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Stmt)) {
        f(self);
        match self {
            Stmt::Allocate { body, .. }
            | Stmt::Produce { body, .. }
            | Stmt::For { body, .. }
            | Stmt::If { body, .. } => {
                for s in body {
                    s.walk(f);
                }
            }
            Stmt::Let { .. } | Stmt::Store { .. } => {}
        }
    }
}

// ── Names ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuncMeta {
    pub id: FuncId,
    pub name: String,
    pub value_types: Vec<ScalarType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputMeta {
    pub id: InputId,
    pub name: String,
    pub dims: usize,
    pub ty: ScalarType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameTable {
    pub funcs: Vec<FuncMeta>,
    pub inputs: Vec<InputMeta>,
}

impl NameTable {
    pub fn func(&self, id: FuncId) -> Option<&FuncMeta> {
        self.funcs.iter().find(|f| f.id == id)
    }

    pub fn input(&self, id: InputId) -> Option<&InputMeta> {
        self.inputs.iter().find(|i| i.id == id)
    }

    pub fn input_by_name(&self, name: &str) -> Option<&InputMeta> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

impl NameLookup for NameTable {
    fn func_name(&self, func: FuncId) -> &str {
        self.func(func).map_or("<unknown>", |f| f.name.as_str())
    }

    fn input_name(&self, input: InputId) -> &str {
        self.input(input).map_or("<unknown>", |i| i.name.as_str())
    }

    fn dim_name(&self, _dim: DimId) -> &str {
        "<dim>"
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Externally owned buffer of an output Func: `(min, extent)` per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputBuffer {
    pub func: FuncId,
    pub name: String,
    pub region: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealizedRegion {
    pub func: FuncId,
    pub name: String,
    /// Region produced at each entry of the compute level.
    pub computed: Region,
    /// Hull of `computed` over every iteration of the enclosing loops.
    pub hull: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoweredPipeline {
    pub names: NameTable,
    pub outputs: Vec<OutputBuffer>,
    pub allocations: Vec<Allocation>,
    pub regions: Vec<RealizedRegion>,
    pub input_regions: Vec<(String, Vec<(i64, i64)>)>,
    pub body: Vec<Stmt>,
    pub warnings: Vec<Diagnostic>,
}

impl LoweredPipeline {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 of the canonical text form, as lowercase hex.
    pub fn fingerprint(&self) -> String {
        hex(&Sha256::digest(self.to_string().as_bytes()))
    }

    pub fn region(&self, name: &str) -> Option<&RealizedRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn allocation(&self, name: &str) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.name == name)
    }

    /// Number of `Produce` nodes for stage `stage` of `func`.
    pub fn produce_count(&self, func: FuncId, stage: usize) -> usize {
        let mut n = 0;
        for s in &self.body {
            s.walk(&mut |s| {
                if matches!(s, Stmt::Produce { func: f, stage: k, .. } if *f == func && *k == stage) {
                    n += 1;
                }
            });
        }
        n
    }

    /// Every `For` symbol in body order.
    pub fn loop_syms(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for s in &self.body {
            s.walk(&mut |s| {
                if let Stmt::For { sym, .. } = s {
                    out.push(sym.as_str());
                }
            });
        }
        out
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for LoweredPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, region) in &self.input_regions {
            writeln!(f, "input {name} {}", fmt_boxes(region))?;
        }
        for o in &self.outputs {
            writeln!(f, "output {} {}", o.name, fmt_boxes_extent(&o.region))?;
        }
        for r in &self.regions {
            writeln!(f, "realize {} {}", r.name, display_region(&r.computed))?;
        }
        for s in &self.body {
            fmt_stmt(f, s, &self.names, "")?;
        }
        Ok(())
    }
}

fn fmt_boxes(region: &[(i64, i64)]) -> String {
    let parts: Vec<String> = region.iter().map(|(lo, hi)| format!("[{lo}, {hi}]")).collect();
    parts.join(" x ")
}

fn fmt_boxes_extent(region: &[(i64, i64)]) -> String {
    let parts: Vec<String> = region
        .iter()
        .map(|(min, extent)| format!("[{min}, {}]", min + extent - 1))
        .collect();
    parts.join(" x ")
}

fn fmt_exprs(exprs: &[Expr], names: &NameTable) -> String {
    let parts: Vec<String> = exprs.iter().map(|e| e.display(names).to_string()).collect();
    parts.join(", ")
}

fn fmt_stmt(f: &mut fmt::Formatter<'_>, s: &Stmt, names: &NameTable, indent: &str) -> fmt::Result {
    let inner = format!("{indent}  ");
    let body = |f: &mut fmt::Formatter<'_>, body: &[Stmt]| -> fmt::Result {
        for s in body {
            fmt_stmt(f, s, names, &inner)?;
        }
        writeln!(f, "{indent}}}")
    };
    match s {
        Stmt::Allocate {
            name,
            shape,
            ring,
            memo_key,
            body: b,
            ..
        } => {
            let dims: Vec<String> = shape
                .iter()
                .map(|d| match d.fold {
                    Some(m) => format!("{} fold {m}", d.extent),
                    None => format!("{} + {}", d.min.display(names), d.extent),
                })
                .collect();
            write!(f, "{indent}allocate {name}[{}]", dims.join(", "))?;
            if let Some(r) = ring {
                write!(f, " ring {r}")?;
            }
            if let Some(k) = memo_key {
                write!(f, " memo {}", &k[..k.len().min(16)])?;
            }
            writeln!(f, " {{")?;
            body(f, b)
        }
        Stmt::Produce {
            name, stage, body: b, ..
        } => {
            writeln!(f, "{indent}produce {name}.s{stage} {{")?;
            body(f, b)
        }
        Stmt::For {
            sym,
            min,
            extent,
            kind,
            partition,
            body: b,
        } => {
            write!(
                f,
                "{indent}{kind} {sym} from {} extent {}",
                min.display(names),
                extent.display(names)
            )?;
            match partition {
                Partition::Auto => {}
                Partition::Never => write!(f, " no-partition")?,
                Partition::Always => write!(f, " partition")?,
            }
            writeln!(f, " {{")?;
            body(f, b)
        }
        Stmt::Let { sym, value } => writeln!(f, "{indent}let {sym} = {}", value.display(names)),
        Stmt::If { cond, body: b } => {
            writeln!(f, "{indent}if {} {{", cond.display(names))?;
            body(f, b)
        }
        Stmt::Store { func, args, values } => {
            let rhs = if values.len() == 1 {
                values[0].display(names).to_string()
            } else {
                format!("({})", fmt_exprs(values, names))
            };
            writeln!(f, "{indent}{}({}) = {rhs}", names.func_name(*func), fmt_exprs(args, names))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> LoweredPipeline {
        let out = FuncId(0);
        let names = NameTable {
            funcs: vec![FuncMeta {
                id: out,
                name: "out".into(),
                value_types: vec![ScalarType::I32],
            }],
            inputs: vec![],
        };
        let store = Stmt::Store {
            func: out,
            args: vec![Expr::sym("out.s0.x")],
            values: vec![Expr::sym("out.s0.x") * 2],
        };
        let body = vec![Stmt::Produce {
            func: out,
            name: "out".into(),
            stage: 0,
            body: vec![Stmt::For {
                sym: "out.s0.x".into(),
                min: Expr::int(0),
                extent: Expr::int(4),
                kind: ForKind::Serial,
                partition: Partition::Auto,
                body: vec![store],
            }],
        }];
        LoweredPipeline {
            names,
            outputs: vec![OutputBuffer {
                func: out,
                name: "out".into(),
                region: vec![(0, 4)],
            }],
            allocations: vec![],
            regions: vec![],
            input_regions: vec![],
            body,
            warnings: vec![],
        }
    }

    #[test]
    fn display_nests_by_indentation() {
        let text = tiny().to_string();
        assert_eq!(
            text,
            "output out [0, 3]\n\
             produce out.s0 {\n  \
               for out.s0.x from 0 extent 4 {\n    \
                 out(out.s0.x) = out.s0.x * 2\n  \
               }\n\
             }\n"
        );
    }

    #[test]
    fn fingerprint_tracks_text() {
        let a = tiny();
        let mut b = tiny();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        b.outputs[0].region = vec![(0, 5)];
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn walk_counts_produce_nodes() {
        let p = tiny();
        assert_eq!(p.produce_count(FuncId(0), 0), 1);
        assert_eq!(p.produce_count(FuncId(0), 1), 0);
        assert_eq!(p.loop_syms(), vec!["out.s0.x"]);
        let json = p.to_json().unwrap();
        assert!(json.contains("\"sym\": \"out.s0.x\""));
    }
}
