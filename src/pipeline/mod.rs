//! Aggregation pipelines: expressions, load-time compilation and execution

pub mod engine;
pub mod expression;
pub mod graph;

pub use engine::{PipelineEngine, RunContext};
pub use expression::DefaultEvaluator;
pub use graph::CompiledPipeline;
