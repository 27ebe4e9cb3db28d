// diag.rs — Diagnostics keyed by subject and stable rule code
//
// Provides the shared diagnostic types used across all lowering passes.
// A diagnostic names the offending Func and Dimension (its subject) and the
// violated rule (its stable code), so callers can surface it verbatim.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0304`, `W0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable code table.
pub mod codes {
    use super::DiagCode;

    // Graph, type and arity (detected before bounds inference).
    pub const E0100: DiagCode = DiagCode("E0100");
    pub const E0101: DiagCode = DiagCode("E0101");
    pub const E0102: DiagCode = DiagCode("E0102");
    pub const E0103: DiagCode = DiagCode("E0103");
    pub const E0104: DiagCode = DiagCode("E0104");
    pub const E0105: DiagCode = DiagCode("E0105");
    pub const E0106: DiagCode = DiagCode("E0106");
    pub const E0107: DiagCode = DiagCode("E0107");
    pub const E0108: DiagCode = DiagCode("E0108");

    // Bounds inference.
    pub const E0200: DiagCode = DiagCode("E0200");
    pub const E0201: DiagCode = DiagCode("E0201");
    pub const E0202: DiagCode = DiagCode("E0202");
    pub const E0203: DiagCode = DiagCode("E0203");
    pub const E0204: DiagCode = DiagCode("E0204");

    // Schedule legality.
    pub const E0300: DiagCode = DiagCode("E0300");
    pub const E0301: DiagCode = DiagCode("E0301");
    pub const E0302: DiagCode = DiagCode("E0302");
    pub const E0303: DiagCode = DiagCode("E0303");
    pub const E0304: DiagCode = DiagCode("E0304");
    pub const E0305: DiagCode = DiagCode("E0305");
    pub const E0306: DiagCode = DiagCode("E0306");
    pub const E0307: DiagCode = DiagCode("E0307");
    pub const E0308: DiagCode = DiagCode("E0308");
    pub const E0309: DiagCode = DiagCode("E0309");
    pub const E0310: DiagCode = DiagCode("E0310");
    pub const E0311: DiagCode = DiagCode("E0311");
    pub const E0312: DiagCode = DiagCode("E0312");
    pub const E0313: DiagCode = DiagCode("E0313");
    pub const E0314: DiagCode = DiagCode("E0314");
    pub const E0315: DiagCode = DiagCode("E0315");
    pub const E0316: DiagCode = DiagCode("E0316");
    pub const E0317: DiagCode = DiagCode("E0317");
    pub const W0300: DiagCode = DiagCode("W0300");

    // Allocation size.
    pub const E0400: DiagCode = DiagCode("E0400");
    pub const E0401: DiagCode = DiagCode("E0401");

    // Reduction factoring.
    pub const E0500: DiagCode = DiagCode("E0500");
    pub const E0501: DiagCode = DiagCode("E0501");
    pub const W0500: DiagCode = DiagCode("W0500");

    // Lowering certificate.
    pub const E0600: DiagCode = DiagCode("E0600");

    /// Short rule name for a code, suitable for machine consumption.
    pub fn rule_name(code: DiagCode) -> &'static str {
        match code.0 {
            "E0100" => "call-arity",
            "E0101" => "type-mismatch",
            "E0102" => "unknown-name",
            "E0103" => "foreign-dimension",
            "E0104" => "mixed-reduction-domains",
            "E0105" => "missing-definition",
            "E0106" => "cyclic-dependency",
            "E0107" => "self-referential-pure-definition",
            "E0108" => "duplicate-name",
            "E0200" => "unbounded-region",
            "E0201" => "unbounded-recursive-region",
            "E0202" => "undefined-rdom-bounds",
            "E0203" => "bound-too-small",
            "E0204" => "output-region-mismatch",
            "E0300" => "placement-inversion",
            "E0301" => "store-without-compute",
            "E0302" => "inline-schedule-conflict",
            "E0303" => "race-condition",
            "E0304" => "invalid-fold",
            "E0305" => "invalid-fusion",
            "E0306" => "rdom-reorder",
            "E0307" => "recursive-schedule",
            "E0308" => "undefined-loop-level",
            "E0309" => "memoize-key-redefined",
            "E0310" => "hoist-storage-mismatch",
            "E0311" => "compute-location-does-not-enclose-uses",
            "E0312" => "output-not-root",
            "E0313" => "invalid-tail-strategy",
            "E0314" => "ring-buffer-without-hoist",
            "E0315" => "invalid-memoize",
            "E0316" => "unknown-loop-variable",
            "E0317" => "invalid-directive",
            "W0300" => "partially-scheduled",
            "E0400" => "storage-bound-too-small",
            "E0401" => "allocation-too-large",
            "E0500" => "rfactor-not-associative",
            "E0501" => "invalid-rfactor",
            "W0500" => "speculative-rfactor",
            "E0600" => "verification-failed",
            _ => "unknown",
        }
    }
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Subject ──────────────────────────────────────────────────────────────

/// What a diagnostic is about: the offending Func and, when the rule is
/// dimension-specific, the Dimension (or loop variable).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub func: Option<String>,
    pub dim: Option<String>,
}

impl Subject {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn func(name: impl Into<String>) -> Self {
        Self {
            func: Some(name.into()),
            dim: None,
        }
    }

    pub fn dim(func: impl Into<String>, dim: impl Into<String>) -> Self {
        Self {
            func: Some(func.into()),
            dim: Some(dim.into()),
        }
    }
}

// ── Related subject ──────────────────────────────────────────────────────

/// A secondary Func/Dimension providing context for a diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedSubject {
    pub subject: Subject,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a propagated constraint failure.
#[derive(Debug, Clone, Serialize)]
pub struct CauseRecord {
    pub message: String,
    pub subject: Option<Subject>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any lowering pass.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub subject: Subject,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedSubject>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related subjects, or causes.
    pub fn new(level: DiagLevel, subject: Subject, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            subject,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    /// Shorthand for an error-level diagnostic carrying `code`.
    pub fn error(code: DiagCode, subject: Subject, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, subject, message).with_code(code)
    }

    /// Shorthand for a warning-level diagnostic carrying `code`.
    pub fn warning(code: DiagCode, subject: Subject, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, subject, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related subject.
    pub fn with_related(mut self, subject: Subject, label: impl Into<String>) -> Self {
        self.related.push(RelatedSubject {
            subject,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, subject: Option<Subject>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            subject,
        });
        self
    }

    /// The rule name of this diagnostic's code, if it has one.
    pub fn rule(&self) -> Option<&'static str> {
        self.code.map(codes::rule_name)
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        match (&self.subject.func, &self.subject.dim) {
            (Some(func), Some(dim)) => write!(f, "\n  at: {func}.{dim}")?,
            (Some(func), None) => write!(f, "\n  at: {func}")?,
            _ => {}
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True when any diagnostic in `diags` is an error.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}
