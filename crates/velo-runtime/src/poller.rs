//! Timer-driven poller: fetch the feed, normalize, append to the log.
//!
//! Every failure skips the tick. The poller keeps nothing durable; the only
//! state carried between ticks is the in-memory occupancy fingerprint used
//! when `suppress_unchanged` is on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use velo_config::PipelineConfig;
use velo_db::SnapshotLog;
use velo_feed::{normalize, occupancy_fingerprint, FeedProvider, NormalizeOptions};
use velo_schemas::SequenceId;

use crate::Shutdown;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub append_timeout: Duration,
    pub suppress_unchanged: bool,
    pub normalize: NormalizeOptions,
}

impl PollerSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            interval: cfg.poller.interval(),
            fetch_timeout: cfg.feed.request_timeout(),
            append_timeout: cfg.poller.append_timeout(),
            suppress_unchanged: cfg.poller.suppress_unchanged,
            normalize: NormalizeOptions {
                include_free_floating: cfg.feed.include_free_floating,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Appended { sequence_id: SequenceId },
    /// Occupancy identical to the last appended snapshot.
    Suppressed,
    /// Transport, HTTP or decode failure, or the fetch timed out.
    FeedFailed,
    /// The payload held no usable station.
    Rejected,
    /// Append failed or timed out; the snapshot is dropped.
    LogUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub ticks: u64,
    pub appended: u64,
    pub suppressed: u64,
    pub feed_failed: u64,
    pub rejected: u64,
    pub log_unavailable: u64,
}

impl PollerStats {
    fn record(&mut self, outcome: TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Appended { .. } => self.appended += 1,
            TickOutcome::Suppressed => self.suppressed += 1,
            TickOutcome::FeedFailed => self.feed_failed += 1,
            TickOutcome::Rejected => self.rejected += 1,
            TickOutcome::LogUnavailable => self.log_unavailable += 1,
        }
    }
}

pub struct Poller {
    feed: Arc<dyn FeedProvider>,
    log: Arc<dyn SnapshotLog>,
    settings: PollerSettings,
    last_fingerprint: Option<String>,
    stats: PollerStats,
}

impl Poller {
    pub fn new(
        feed: Arc<dyn FeedProvider>,
        log: Arc<dyn SnapshotLog>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            feed,
            log,
            settings,
            last_fingerprint: None,
            stats: PollerStats::default(),
        }
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// One poll. Never returns an error: every failure is a skipped tick.
    pub async fn tick(&mut self) -> TickOutcome {
        let outcome = self.tick_inner().await;
        self.stats.record(outcome);
        outcome
    }

    async fn tick_inner(&mut self) -> TickOutcome {
        let source = self.feed.source_name();
        // Microsecond precision survives a timestamptz round trip unchanged.
        let polled_at = Utc::now().trunc_subsecs(6);

        let raw = match timeout(self.settings.fetch_timeout, self.feed.fetch()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(source, error = %e, "feed fetch failed; skipping tick");
                return TickOutcome::FeedFailed;
            }
            Err(_) => {
                warn!(
                    source,
                    timeout_ms = self.settings.fetch_timeout.as_millis() as u64,
                    "feed fetch timed out; skipping tick"
                );
                return TickOutcome::FeedFailed;
            }
        };

        let (snapshot, report) = match normalize(&raw, polled_at, self.settings.normalize) {
            Ok(v) => v,
            Err(e) => {
                warn!(source, error = %e, "feed rejected; skipping tick");
                return TickOutcome::Rejected;
            }
        };

        if report.has_rejections() {
            warn!(
                source,
                rejected_bad_coordinates = report.rejected_bad_coordinates,
                dropped_blank_bike_numbers = report.dropped_blank_bike_numbers,
                merged_duplicate_uids = report.merged_duplicate_uids,
                bikes_at_multiple_stations = report.bikes_at_multiple_stations,
                "feed quality issues"
            );
        } else {
            debug!(
                source,
                stations = report.stations_ok,
                bikes = report.bikes_ok,
                skipped_free_floating = report.skipped_free_floating,
                "feed normalized"
            );
        }

        let fingerprint = occupancy_fingerprint(&snapshot);
        if self.settings.suppress_unchanged
            && self.last_fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            debug!(source, "occupancy unchanged; snapshot suppressed");
            return TickOutcome::Suppressed;
        }

        match timeout(self.settings.append_timeout, self.log.append(&snapshot)).await {
            Ok(Ok(sequence_id)) => {
                self.last_fingerprint = Some(fingerprint);
                info!(
                    sequence_id,
                    stations = snapshot.stations.len(),
                    bikes = snapshot.bike_count(),
                    polled_at = %polled_at,
                    "snapshot appended"
                );
                TickOutcome::Appended { sequence_id }
            }
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "log append failed; tick dropped");
                TickOutcome::LogUnavailable
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.append_timeout.as_millis() as u64,
                    "log append timed out; tick dropped"
                );
                TickOutcome::LogUnavailable
            }
        }
    }

    /// Tick every `interval` until shutdown. A tick in progress runs to
    /// completion; missed ticks are skipped, never bunched up.
    pub async fn run(mut self, mut shutdown: Shutdown) -> PollerStats {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = self.feed.source_name(),
            interval_secs = self.settings.interval.as_secs(),
            suppress_unchanged = self.settings.suppress_unchanged,
            "poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(
            ticks = self.stats.ticks,
            appended = self.stats.appended,
            "poller stopped"
        );
        self.stats
    }
}
