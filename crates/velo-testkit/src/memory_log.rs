use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use velo_db::{PruneReport, SnapshotLog};
use velo_schemas::{Checkpoint, LogEntry, SequenceId, Snapshot};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<SequenceId, (LogEntry, DateTime<Utc>)>,
    last_seq: SequenceId,
    commits: BTreeMap<String, SequenceId>,
    fail_appends: u32,
    fail_commits: u32,
    append_delay: Option<Duration>,
    redeliver: bool,
}

/// In-memory snapshot log.
#[derive(Default)]
pub struct MemorySnapshotLog {
    inner: Mutex<Inner>,
}

impl MemorySnapshotLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load snapshots as if the poller had appended them.
    pub fn with_snapshots(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        let log = Self::new();
        {
            let mut g = log.lock();
            for s in snapshots {
                g.last_seq += 1;
                let seq = g.last_seq;
                g.entries.insert(
                    seq,
                    (
                        LogEntry {
                            sequence_id: seq,
                            snapshot: s,
                        },
                        Utc::now(),
                    ),
                );
            }
        }
        log
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next `n` appends fail.
    pub fn fail_next_appends(&self, n: u32) {
        self.lock().fail_appends = n;
    }

    /// The next `n` commits fail.
    pub fn fail_next_commits(&self, n: u32) {
        self.lock().fail_commits = n;
    }

    /// Every append sleeps this long before storing.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        self.lock().append_delay = delay;
    }

    /// Deliver every entry twice from `read_from`.
    pub fn set_redeliver(&self, on: bool) {
        self.lock().redeliver = on;
    }

    /// Rewrite the append time of every entry up to `sequence_id`.
    pub fn backdate(&self, up_to: SequenceId, appended_at: DateTime<Utc>) {
        let mut g = self.lock();
        for (_, (_, at)) in g.entries.range_mut(..=up_to) {
            *at = appended_at;
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.values().map(|(e, _)| e.clone()).collect()
    }

    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        self.lock().entries.keys().copied().collect()
    }
}

#[async_trait::async_trait]
impl SnapshotLog for MemorySnapshotLog {
    async fn append(&self, snapshot: &Snapshot) -> Result<SequenceId> {
        let delay = {
            let mut g = self.lock();
            if g.fail_appends > 0 {
                g.fail_appends -= 1;
                bail!("injected append failure");
            }
            g.append_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut g = self.lock();
        g.last_seq += 1;
        let seq = g.last_seq;
        g.entries.insert(
            seq,
            (
                LogEntry {
                    sequence_id: seq,
                    snapshot: snapshot.clone(),
                },
                Utc::now(),
            ),
        );
        Ok(seq)
    }

    fn read_from<'a>(
        &'a self,
        _consumer_id: &'a str,
        after: SequenceId,
        limit: i64,
    ) -> BoxStream<'a, Result<LogEntry>> {
        let g = self.lock();
        let take = usize::try_from(limit).unwrap_or(0);
        let mut out = Vec::new();
        for (_, (e, _)) in g.entries.range(after + 1..).take(take) {
            out.push(Ok(e.clone()));
            if g.redeliver {
                out.push(Ok(e.clone()));
            }
        }
        stream::iter(out).boxed()
    }

    async fn commit(&self, consumer_id: &str, sequence_id: SequenceId) -> Result<()> {
        let mut g = self.lock();
        if g.fail_commits > 0 {
            g.fail_commits -= 1;
            return Err(anyhow!("injected commit failure"));
        }
        let c = g.commits.entry(consumer_id.to_string()).or_insert(0);
        *c = (*c).max(sequence_id);
        Ok(())
    }

    async fn committed(&self, consumer_id: &str) -> Result<Option<SequenceId>> {
        Ok(self.lock().commits.get(consumer_id).copied())
    }

    async fn register_consumer(&self, consumer_id: &str) -> Result<SequenceId> {
        Ok(*self
            .lock()
            .commits
            .entry(consumer_id.to_string())
            .or_insert(0))
    }

    async fn head(&self) -> Result<Option<SequenceId>> {
        Ok(self.lock().entries.keys().next_back().copied())
    }

    async fn consumers(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .lock()
            .commits
            .iter()
            .map(|(id, seq)| Checkpoint {
                consumer_id: id.clone(),
                last_committed_sequence_id: *seq,
            })
            .collect())
    }

    async fn prune(&self, retain_after: DateTime<Utc>) -> Result<PruneReport> {
        let mut g = self.lock();
        let horizon = g.commits.values().copied().min();
        let Some(h) = horizon else {
            return Ok(PruneReport {
                horizon: None,
                deleted: 0,
            });
        };

        let doomed: Vec<SequenceId> = g
            .entries
            .range(..=h)
            .filter(|(_, (_, at))| *at < retain_after)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &doomed {
            g.entries.remove(seq);
        }

        Ok(PruneReport {
            horizon,
            deleted: doomed.len() as u64,
        })
    }
}
