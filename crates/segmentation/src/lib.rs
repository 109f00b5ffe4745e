//! Segment evaluation — boolean/behavioral audience membership computed
//! from user traits, event history, and platform state.

pub mod builder;
pub mod definition;
pub mod engine;
pub mod evaluator;
pub mod facts;
pub mod graph;

pub use builder::SegmentBuilder;
pub use engine::{SegmentUpdate, SegmentationEngine};
pub use evaluator::{EvalContext, SegmentEvaluation, SegmentEvaluator};
pub use facts::{FactStore, MemoryFactStore, UserFacts};
pub use graph::SegmentGraph;
