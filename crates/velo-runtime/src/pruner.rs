use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use velo_db::{PruneReport, SnapshotLog};

use crate::Shutdown;

/// Delete log entries older than `retention` that every consumer has committed.
pub async fn prune_once(log: &dyn SnapshotLog, retention: Duration) -> Result<PruneReport> {
    let window = chrono::Duration::from_std(retention)
        .map_err(|e| anyhow!("retention out of range: {e}"))?;
    let retain_after = Utc::now()
        .checked_sub_signed(window)
        .ok_or_else(|| anyhow!("retention window underflows"))?;

    let report = log.prune(retain_after).await?;
    info!(
        deleted = report.deleted,
        horizon = ?report.horizon,
        retain_after = %retain_after,
        "snapshot log pruned"
    );
    Ok(report)
}

pub async fn run_prune_loop(
    log: Arc<dyn SnapshotLog>,
    retention: Duration,
    every: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {
                if let Err(e) = prune_once(log.as_ref(), retention).await {
                    warn!(error = %format!("{e:#}"), "snapshot log prune failed");
                }
            }
        }
    }
}
