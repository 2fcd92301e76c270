//! Atomic batch commits into the canonical store.

mod batch;
mod coordinator;
mod plan;
mod retry;

pub use batch::{BatchResult, BatchState, ScopeBatch};
pub use coordinator::CommitCoordinator;
pub use plan::{CommitPlan, PlannedFact};
