// tessel — scheduling and lowering core for array pipelines
//
// Library root. Modules are listed bottom-up: data model, schedule model,
// lowering passes, then the driver and the reference evaluator.

pub mod diag;
pub mod expr;
pub mod graph;
pub mod id;
pub mod interval;
pub mod options;
pub mod schedule;

pub mod bounds;
pub mod fuse;
pub mod inline;
pub mod legality;
pub mod placement;
pub mod rfactor;
pub mod storage;

pub mod eval;
pub mod lir;
pub mod lower;
pub mod nest;
pub mod pass;

pub use diag::{DiagCode, DiagLevel, Diagnostic, Subject};
pub use graph::PipelineGraph;
pub use lir::LoweredPipeline;
pub use lower::{lower, lower_until, LowerError};
pub use options::{LowerOptions, Request};
pub use schedule::{LoopLevel, ScheduleModel, TailStrategy};
