//! In-process leader/follower session over the simulated link.

mod alignment;
mod orchestrator;
mod pattern;
mod report;

pub use orchestrator::Simulation;
pub use report::SimulationReport;
