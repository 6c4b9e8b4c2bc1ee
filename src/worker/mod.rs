//! Execution engine.
//!
//! - `executor` — runs one claimed task through the agent backend
//! - `scheduler` — bounded FIFO claiming, fire-and-forget launches
//! - `recovery` — startup repair of tasks left `running`

pub mod executor;
pub mod recovery;
pub mod scheduler;

pub use executor::{TaskExecutor, reaction_for};
pub use recovery::{RecoveryCoordinator, RecoveryReport};
pub use scheduler::{QueueScheduler, SlotTracker};
