//! velo-runtime
//!
//! The long-running loops of the pipeline:
//! - [`Poller`]: timer-driven fetch -> normalize -> append
//! - [`Reconciler`]: ordered log consumption, one atomic store write per snapshot
//! - [`run_prune_loop`]: periodic log retention
//!
//! Every loop watches a [`Shutdown`] and finishes the in-flight unit of work
//! before returning.

mod poller;
mod pruner;
mod reconciler;
mod shutdown;

pub use poller::{Poller, PollerSettings, PollerStats, TickOutcome};
pub use pruner::{prune_once, run_prune_loop};
pub use reconciler::{Reconciler, ReconcilerSettings, ReconcilerStats};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
