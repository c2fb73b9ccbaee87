//! The five pipeline stages.
//!
//! Data flows one direction: perception normalizes, the planner (conditionally)
//! decomposes, the executor drives the capability providers, reflection scores
//! the pass and decides on retries, and the aggregator fuses everything into
//! the final verdict.

pub mod aggregator;
pub mod executor;
pub mod perception;
pub mod planner;
pub mod reflection;

pub use aggregator::AggregatorStage;
pub use executor::ExecutorStage;
pub use perception::PerceptionStage;
pub use planner::PlannerStage;
pub use reflection::ReflectionStage;
