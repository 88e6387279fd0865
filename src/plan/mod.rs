//! Task plans: the schema agents produce and the graph the scheduler runs.

pub mod graph;
pub mod planner;
pub mod schema;

pub use graph::TaskGraph;
pub use planner::generate_plan;
pub use schema::{Plan, Unit, UnitStatus};
