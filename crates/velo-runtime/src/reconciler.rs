//! Ordered log consumer.
//!
//! Entries are processed strictly in sequence order, one at a time. Each
//! entry is diffed against the cached [`ReconcileState`] and written through
//! [`ReconcileStore::apply`] as a single transaction that also advances the
//! checkpoint. The cache is only advanced after that write succeeds; any
//! failure drops it and the same entry is retried from the store's state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use velo_config::PipelineConfig;
use velo_db::{ApplyOutcome, ReconcileStore, SnapshotLog};
use velo_reconcile::{
    apply_changes, reconcile_snapshot, Anomaly, Delivery, ReconcileState, SequenceWatermark,
};
use velo_schemas::LogEntry;

use crate::Shutdown;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub consumer_id: String,
    pub batch_size: i64,
    pub idle_poll: Duration,
    pub retry_backoff: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            consumer_id: cfg.reconciler.consumer_id.clone(),
            batch_size: cfg.reconciler.batch_size,
            idle_poll: cfg.reconciler.idle_poll(),
            retry_backoff: cfg.reconciler.retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    /// Entries written to the store.
    pub applied: u64,
    /// Redelivered entries skipped by the watermark.
    pub replayed: u64,
    /// Entries the store had already committed (stale cache).
    pub already_committed: u64,
    /// Applied entries that changed no stay, movement or assignment.
    pub unchanged: u64,
    pub movements: u64,
    pub stays_opened: u64,
    pub stays_closed: u64,
    pub anomalies: u64,
    pub failures: u64,
}

struct Loaded {
    state: ReconcileState,
    watermark: SequenceWatermark,
}

pub struct Reconciler {
    log: Arc<dyn SnapshotLog>,
    store: Arc<dyn ReconcileStore>,
    settings: ReconcilerSettings,
    loaded: Option<Loaded>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(
        log: Arc<dyn SnapshotLog>,
        store: Arc<dyn ReconcileStore>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            log,
            store,
            settings,
            loaded: None,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    pub fn consumer_id(&self) -> &str {
        &self.settings.consumer_id
    }

    /// Last sequence id known to be committed, if state is loaded.
    pub fn committed(&self) -> Option<i64> {
        self.loaded.as_ref().map(|l| l.watermark.last_committed())
    }

    async fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Ok(());
        }

        let consumer = &self.settings.consumer_id;
        self.log
            .register_consumer(consumer)
            .await
            .context("register log consumer failed")?;

        // The store's checkpoint is written with the data; it is authoritative.
        let checkpoint = self
            .store
            .checkpoint(consumer)
            .await
            .context("load checkpoint failed")?
            .unwrap_or(0);
        let state = self
            .store
            .load_state()
            .await
            .context("load reconcile state failed")?;

        info!(
            consumer_id = %consumer,
            checkpoint,
            assignments = state.assignments.len(),
            stations = state.stations.len(),
            "reconciler state loaded"
        );

        self.loaded = Some(Loaded {
            state,
            watermark: SequenceWatermark::from_checkpoint(checkpoint),
        });
        Ok(())
    }

    /// Read one batch after the checkpoint and process it in order.
    ///
    /// Returns the number of entries read (0 when caught up). On error the
    /// cached state is dropped; the next call resumes from the store.
    pub async fn run_once(&mut self) -> Result<usize> {
        match self.run_batch().await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.loaded = None;
                self.stats.failures += 1;
                Err(e)
            }
        }
    }

    async fn run_batch(&mut self) -> Result<usize> {
        self.ensure_loaded().await?;
        let after = self
            .loaded
            .as_ref()
            .map(|l| l.watermark.last_committed())
            .unwrap_or(0);

        let consumer = self.settings.consumer_id.clone();
        // Read the whole page before applying: a Postgres read stream holds a
        // pool connection until it is dropped, and apply needs its own.
        let entries: Vec<LogEntry> = self
            .log
            .read_from(&consumer, after, self.settings.batch_size)
            .try_collect()
            .await
            .with_context(|| format!("log read failed after={after}"))?;

        let read = entries.len();
        for entry in &entries {
            self.process(entry).await?;
        }

        if read > 0 {
            debug!(consumer_id = %consumer, read, "batch done");
        }
        Ok(read)
    }

    /// Process batches until the log is exhausted. Returns entries read.
    pub async fn drain(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.run_once().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    async fn process(&mut self, entry: &LogEntry) -> Result<()> {
        self.ensure_loaded().await?;
        let Some(loaded) = self.loaded.as_mut() else {
            return Ok(());
        };
        let seq = entry.sequence_id;

        if let Delivery::Replayed { watermark, got } = loaded.watermark.check(seq) {
            self.stats.replayed += 1;
            debug!(watermark, got, "redelivered entry skipped");
            return Ok(());
        }

        let changes = reconcile_snapshot(&loaded.state, entry);
        log_anomalies(seq, &changes.anomalies.anomalies);
        if changes.anomalies.unlocated_bikes > 0 {
            debug!(
                sequence_id = seq,
                unlocated = changes.anomalies.unlocated_bikes,
                "bikes left their station without reappearing"
            );
        }

        let outcome = self
            .store
            .apply(&self.settings.consumer_id, &changes)
            .await
            .with_context(|| format!("apply failed sequence_id={seq}"))?;

        match outcome {
            ApplyOutcome::Applied => {
                apply_changes(&mut loaded.state, &changes);
                loaded.watermark.advance(seq);

                self.stats.applied += 1;
                self.stats.movements += changes.movements.len() as u64;
                self.stats.stays_opened += changes.opened_stays.len() as u64;
                self.stats.stays_closed += changes.closed_stays.len() as u64;
                self.stats.anomalies += changes.anomalies.anomalies.len() as u64;
                if changes.is_noop() {
                    self.stats.unchanged += 1;
                }

                info!(
                    sequence_id = seq,
                    polled_at = %changes.polled_at,
                    movements = changes.movements.len(),
                    opened = changes.opened_stays.len(),
                    closed = changes.closed_stays.len(),
                    anomalies = changes.anomalies.anomalies.len(),
                    "snapshot reconciled"
                );
            }
            ApplyOutcome::AlreadyCommitted => {
                // Someone else advanced the checkpoint; resync from the store.
                self.stats.already_committed += 1;
                warn!(sequence_id = seq, "entry already committed; reloading state");
                self.loaded = None;
                return Ok(());
            }
        }

        // Retention progress only; the store checkpoint is already durable.
        if let Err(e) = self.log.commit(&self.settings.consumer_id, seq).await {
            warn!(sequence_id = seq, error = %format!("{e:#}"), "log commit failed");
        }
        Ok(())
    }

    /// Consume until shutdown. The entry in flight is finished before exit.
    pub async fn run(mut self, mut shutdown: Shutdown) -> ReconcilerStats {
        info!(
            consumer_id = %self.settings.consumer_id,
            batch_size = self.settings.batch_size,
            "reconciler started"
        );

        while !shutdown.is_triggered() {
            let pause = match self.run_once().await {
                Ok(0) => self.settings.idle_poll,
                Ok(_) => continue,
                Err(e) => {
                    error!(
                        error = %format!("{e:#}"),
                        retry_in_ms = self.settings.retry_backoff.as_millis() as u64,
                        "reconcile failed; will retry"
                    );
                    self.settings.retry_backoff
                }
            };

            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(
            applied = self.stats.applied,
            replayed = self.stats.replayed,
            failures = self.stats.failures,
            "reconciler stopped"
        );
        self.stats
    }
}

fn log_anomalies(sequence_id: i64, anomalies: &[Anomaly]) {
    for a in anomalies {
        match a {
            Anomaly::DuplicatePlacement {
                bike_number,
                kept_station_uid,
                dropped_station_uid,
            } => warn!(
                sequence_id,
                bike_number = %bike_number,
                kept_station_uid,
                dropped_station_uid,
                "bike listed at several stations"
            ),
            Anomaly::MissingCoordinates {
                bike_number,
                station_uid,
            } => warn!(
                sequence_id,
                bike_number = %bike_number,
                station_uid,
                "movement endpoint has no coordinates; distance set to 0"
            ),
            Anomaly::NonMonotonicTime {
                bike_number,
                since,
                polled_at,
            } => warn!(
                sequence_id,
                bike_number = %bike_number,
                since = %since,
                polled_at = %polled_at,
                "snapshot not newer than current stay; bike skipped"
            ),
        }
    }
}
