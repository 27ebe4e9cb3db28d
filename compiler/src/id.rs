// id.rs — Stable arena identifiers for pipeline graph entities
//
// Funcs, dimensions, reduction domains and inputs live in arenas owned by the
// PipelineGraph and are addressed by these handles. Cross references
// (producer/consumer edges, self references, shared reduction domains) go
// through ids, never through owning pointers, so recursive Funcs need no
// special ownership treatment.

use serde::Serialize;

/// Index of a Func in `PipelineGraph::funcs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FuncId(pub u32);

/// Index of a dimension in `PipelineGraph::dims`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DimId(pub u32);

/// Index of a reduction domain in `PipelineGraph::rdoms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RDomId(pub u32);

/// Index of an external input buffer in `PipelineGraph::inputs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InputId(pub u32);

/// Allocator for arena ids. Produces monotonically increasing ids in
/// creation order, so graphs built by the same calls get the same ids.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_func: u32,
    next_dim: u32,
    next_rdom: u32,
    next_input: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_func(&mut self) -> FuncId {
        let id = FuncId(self.next_func);
        self.next_func += 1;
        id
    }

    pub fn alloc_dim(&mut self) -> DimId {
        let id = DimId(self.next_dim);
        self.next_dim += 1;
        id
    }

    pub fn alloc_rdom(&mut self) -> RDomId {
        let id = RDomId(self.next_rdom);
        self.next_rdom += 1;
        id
    }

    pub fn alloc_input(&mut self) -> InputId {
        let id = InputId(self.next_input);
        self.next_input += 1;
        id
    }
}
