// pass.rs — Lowering pass table and dependency resolution
//
// Declares the lowering passes, their dependency edges and the artifacts
// they produce. The lowering driver uses `required_passes` to run the
// minimal prefix of the pipeline for `lower_until`.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each lowering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassId {
    Validate,
    Rfactor,
    CheckSchedule,
    Inline,
    Place,
    Bounds,
    CheckLegality,
    Fuse,
    Storage,
    Synthesize,
}

/// Machine-readable artifact identifiers. Each maps to a field of the
/// lowering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    ValueTypes,   // BTreeMap<FuncId, Vec<ScalarType>>
    FactoredGraph, // PipelineGraph with rfactor intermediates
    Resolved,     // ScheduleModel with default placements settled
    InlinedGraph, // PipelineGraph without inline Funcs
    Placement,    // Placement
    Bounds,       // Bounds
    FusePlan,     // FusePlan (also widens Bounds to group hulls)
    Storage,      // StoragePlan
    Body,         // Vec<Stmt>
    Cert,         // LoweringCert
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a lowering pass.
pub struct PassDescriptor {
    /// Name used in logs and `LowerError` messages.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions, for documentation.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            outputs: &[ArtifactId::ValueTypes],
            invalidation_key: "graph + request",
            invariants: "arities match, no cycles, every value typed",
        },
        PassId::Rfactor => PassDescriptor {
            name: "rfactor",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::FactoredGraph],
            invalidation_key: "graph + schedule.rfactors",
            invariants: "every factored update combines an intermediate",
        },
        PassId::CheckSchedule => PassDescriptor {
            name: "check_schedule",
            inputs: &[PassId::Rfactor],
            outputs: &[ArtifactId::Resolved],
            invalidation_key: "graph + schedule + options",
            invariants: "directives legal in isolation, compute levels settled",
        },
        PassId::Inline => PassDescriptor {
            name: "inline",
            inputs: &[PassId::CheckSchedule],
            outputs: &[ArtifactId::InlinedGraph],
            invalidation_key: "graph + schedule",
            invariants: "no live definition reads an inline Func",
        },
        PassId::Place => PassDescriptor {
            name: "place",
            inputs: &[PassId::Inline],
            outputs: &[ArtifactId::Placement],
            invalidation_key: "inlined graph + schedule",
            invariants: "store level encloses compute level, uses covered",
        },
        PassId::Bounds => PassDescriptor {
            name: "bounds",
            inputs: &[PassId::Place],
            outputs: &[ArtifactId::Bounds],
            invalidation_key: "inlined graph + schedule + placement + request + options",
            invariants: "every realized region finite and covering its requirement",
        },
        PassId::CheckLegality => PassDescriptor {
            name: "check_legality",
            inputs: &[PassId::Bounds],
            outputs: &[ArtifactId::Bounds],
            invalidation_key: "schedule + placement + bounds",
            invariants: "folds, tails and constant-extent loops legal",
        },
        PassId::Fuse => PassDescriptor {
            name: "fuse",
            inputs: &[PassId::CheckLegality],
            outputs: &[ArtifactId::FusePlan],
            invalidation_key: "placement + bounds",
            invariants: "compute_with groups share loops over their hulls",
        },
        PassId::Storage => PassDescriptor {
            name: "storage",
            inputs: &[PassId::Fuse],
            outputs: &[ArtifactId::Storage],
            invalidation_key: "schedule + placement + bounds + options",
            invariants: "one allocation per non-output realized Func",
        },
        PassId::Synthesize => PassDescriptor {
            name: "synthesize",
            inputs: &[PassId::Storage],
            outputs: &[ArtifactId::Body, ArtifactId::Cert],
            invalidation_key: "every upstream artifact",
            invariants: "each stage produced once, every allocation encloses its uses",
        },
    }
}

// ── Certificates ───────────────────────────────────────────────────────────

/// Machine-checkable postconditions of a pass.
pub trait StageCert {
    /// Every obligation holds.
    fn all_pass(&self) -> bool {
        self.obligations().iter().all(|(_, ok)| *ok)
    }

    /// `(name, holds)` for each obligation, in a fixed order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// Every pass ID in declaration order.
pub const ALL_PASSES: [PassId; 10] = [
    PassId::Validate,
    PassId::Rfactor,
    PassId::CheckSchedule,
    PassId::Inline,
    PassId::Place,
    PassId::Bounds,
    PassId::CheckLegality,
    PassId::Fuse,
    PassId::Storage,
    PassId::Synthesize,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_bounds_stops_before_legality() {
        let passes = required_passes(PassId::Bounds);
        assert_eq!(
            passes,
            vec![
                PassId::Validate,
                PassId::Rfactor,
                PassId::CheckSchedule,
                PassId::Inline,
                PassId::Place,
                PassId::Bounds,
            ]
        );
        assert!(!passes.contains(&PassId::CheckLegality));
        assert!(!passes.contains(&PassId::Storage));
    }

    #[test]
    fn required_passes_synthesize_includes_all() {
        let passes = required_passes(PassId::Synthesize);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_validate_is_minimal() {
        assert_eq!(required_passes(PassId::Validate), vec![PassId::Validate]);
    }

    #[test]
    fn names_are_unique() {
        let names: HashSet<&str> = ALL_PASSES.iter().map(|p| descriptor(*p).name).collect();
        assert_eq!(names.len(), ALL_PASSES.len());
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(!desc.outputs.is_empty(), "pass {:?} has no outputs declared", pass);
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                let dep_passes = required_passes(*pass);
                let dep_pos = dep_passes.iter().position(|p| p == dep);
                let self_pos = dep_passes.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }

    struct Fixed(Vec<(&'static str, bool)>);

    impl StageCert for Fixed {
        fn obligations(&self) -> Vec<(&'static str, bool)> {
            self.0.clone()
        }
    }

    #[test]
    fn cert_passes_only_when_every_obligation_holds() {
        assert!(Fixed(vec![("a", true), ("b", true)]).all_pass());
        assert!(!Fixed(vec![("a", true), ("b", false)]).all_pass());
    }
}
