//! velo-reconcile
//!
//! Turns snapshot deltas into stay / movement records.
//!
//! Architectural decisions:
//! - One snapshot is diffed against the cumulative assignment state left by
//!   every earlier snapshot; the caller applies the result atomically.
//! - A bike reported at several stations is placed at the lowest station uid.
//! - A bike that vanishes from its station keeps its open stay (unlocated).
//! - Feed anomalies are reported, never fatal.
//!
//! Deterministic, pure logic. No IO. No database calls.

mod engine;
pub mod geo;
mod types;
mod watermark;

pub use engine::{apply_changes, reconcile_snapshot};
pub use geo::distance_km;
pub use types::*;
pub use watermark::{Delivery, SequenceWatermark};
