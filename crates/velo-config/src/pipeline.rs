//! Typed view over the merged config JSON.
//!
//! Every section has defaults so a minimal config only needs `feed.url`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Upstream station feed endpoint (Nextbike live JSON).
    pub url: String,
    pub request_timeout_ms: u64,
    /// Keep places with `spot = false` (free-floating bikes). Off by default.
    pub include_free_floating: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_ms: 10_000,
            include_free_floating: false,
        }
    }
}

impl FeedConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
    /// Upper bound on a single log append; a slower append drops the tick.
    pub append_timeout_ms: u64,
    /// Skip appending a snapshot whose occupancy equals the previous one.
    pub suppress_unchanged: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            append_timeout_ms: 5_000,
            suppress_unchanged: false,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub consumer_id: String,
    /// Max entries read from the log per pass.
    pub batch_size: i64,
    /// Sleep when the log has nothing new.
    pub idle_poll_ms: u64,
    /// Sleep before retrying a snapshot whose write failed.
    pub retry_backoff_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            consumer_id: "reconciler".to_string(),
            batch_size: 100,
            idle_poll_ms: 1_000,
            retry_backoff_ms: 5_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Committed entries younger than this are kept for replay.
    pub retention_hours: u64,
    pub prune_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            prune_interval_secs: 3_600,
        }
    }
}

impl LogConfig {
    /// Upper bound accepted by `validate()`: ten years.
    pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3_600))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// NAME of the env var holding the Postgres URL. Never the URL itself.
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: "VELO_DATABASE_URL".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub feed: FeedConfig,
    pub poller: PollerConfig,
    pub reconciler: ReconcilerConfig,
    pub log: LogConfig,
    pub database: DatabaseConfig,
}

impl PipelineConfig {
    /// JSON pointers read by this struct; anything else is an unused key.
    pub const CONSUMED_POINTERS: &'static [&'static str] = &[
        "/feed/url",
        "/feed/request_timeout_ms",
        "/feed/include_free_floating",
        "/poller/interval_secs",
        "/poller/append_timeout_ms",
        "/poller/suppress_unchanged",
        "/reconciler/consumer_id",
        "/reconciler/batch_size",
        "/reconciler/idle_poll_ms",
        "/reconciler/retry_backoff_ms",
        "/log/retention_hours",
        "/log/prune_interval_secs",
        "/database/url_env",
        "/database/max_connections",
    ];

    pub fn from_json(config_json: &Value) -> Result<Self> {
        let cfg: PipelineConfig = serde_json::from_value(config_json.clone())
            .context("CONFIG_INVALID: pipeline config does not match expected shape")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.feed.url.trim().is_empty() {
            bail!("CONFIG_INVALID: feed.url must be set");
        }
        if self.feed.request_timeout_ms == 0 {
            bail!("CONFIG_INVALID: feed.request_timeout_ms must be > 0");
        }
        if self.poller.interval_secs == 0 {
            bail!("CONFIG_INVALID: poller.interval_secs must be > 0");
        }
        if self.poller.append_timeout_ms == 0 {
            bail!("CONFIG_INVALID: poller.append_timeout_ms must be > 0");
        }
        if self.reconciler.consumer_id.trim().is_empty() {
            bail!("CONFIG_INVALID: reconciler.consumer_id must be non-empty");
        }
        if self.reconciler.batch_size <= 0 {
            bail!("CONFIG_INVALID: reconciler.batch_size must be > 0");
        }
        if self.log.prune_interval_secs == 0 {
            bail!("CONFIG_INVALID: log.prune_interval_secs must be > 0");
        }
        if self.log.retention_hours > LogConfig::MAX_RETENTION_HOURS {
            bail!(
                "CONFIG_INVALID: log.retention_hours must be <= {}",
                LogConfig::MAX_RETENTION_HOURS
            );
        }
        // The reconciler reads a page and writes a transaction concurrently.
        if self.database.max_connections < 2 {
            bail!("CONFIG_INVALID: database.max_connections must be >= 2");
        }
        if self.database.url_env.trim().is_empty() {
            bail!("CONFIG_INVALID: database.url_env must name an env var");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = PipelineConfig::from_json(&json!({"feed": {"url": "http://feed.local/live.json"}}))
            .unwrap();
        assert_eq!(cfg.poller.interval_secs, 60);
        assert_eq!(cfg.reconciler.consumer_id, "reconciler");
        assert_eq!(cfg.database.url_env, "VELO_DATABASE_URL");
        assert!(!cfg.poller.suppress_unchanged);
        assert!(!cfg.feed.include_free_floating);
    }

    #[test]
    fn missing_feed_url_is_rejected() {
        let err = PipelineConfig::from_json(&json!({})).unwrap_err();
        assert!(err.to_string().contains("feed.url"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = PipelineConfig::from_json(&json!({
            "feed": {"url": "http://x"},
            "poller": {"interval_secs": 0}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn wrong_type_is_a_shape_error() {
        let err = PipelineConfig::from_json(&json!({
            "feed": {"url": "http://x"},
            "reconciler": {"batch_size": "lots"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("CONFIG_INVALID"));
    }

    #[test]
    fn single_connection_pool_is_rejected() {
        let err = PipelineConfig::from_json(&json!({
            "feed": {"url": "http://x"},
            "database": {"max_connections": 1}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("max_connections"));

        let ok = PipelineConfig::from_json(&json!({
            "feed": {"url": "http://x"},
            "database": {"max_connections": 2}
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn huge_retention_is_rejected_and_never_overflows() {
        let err = PipelineConfig::from_json(&json!({
            "feed": {"url": "http://x"},
            "log": {"retention_hours": u64::MAX}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("retention_hours"));

        let unchecked = LogConfig {
            retention_hours: u64::MAX,
            ..LogConfig::default()
        };
        assert_eq!(unchecked.retention(), Duration::from_secs(u64::MAX));
    }
}
