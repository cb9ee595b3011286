//! velo-testkit
//!
//! In-memory doubles for the pipeline seams plus fixture builders:
//! - [`MemorySnapshotLog`]: `SnapshotLog` with injectable append/commit
//!   failures, append delay and forced redelivery
//! - [`MemoryReconcileStore`]: `ReconcileStore` with the same keying rules
//!   as Postgres and one-shot mid-transaction failures
//! - [`ScriptedFeed`]: `FeedProvider` replaying a fixed script
//!
//! Scenario tests for the whole pipeline live under `tests/`.

mod feed;
mod fixtures;
mod memory_log;
mod memory_store;

pub use feed::{ScriptStep, ScriptedFeed};
pub use fixtures::*;
pub use memory_log::MemorySnapshotLog;
pub use memory_store::{MemoryReconcileStore, StoreDump};
