//! Run orchestration: wires extraction, transform, the validation gate,
//! and the atomic writer into one deterministic pipeline run.

pub mod orchestrator;
pub mod run;
pub mod summary;

pub use orchestrator::Pipeline;
pub use run::{derive_run_id, StageTimer};
pub use summary::RunSummary;
