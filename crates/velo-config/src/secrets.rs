//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (e.g. `database.url_env`).
//! - Binaries resolve secrets once at startup and pass them to constructors.
//! - `Debug` output redacts values; errors reference the NAME, never the value.

use anyhow::{bail, Result};

use crate::DatabaseConfig;

/// Postgres connection URL resolved from the environment.
#[derive(Clone)]
pub struct ResolvedDatabaseUrl {
    /// Env var the URL was read from.
    pub env_name: String,
    url: String,
}

impl ResolvedDatabaseUrl {
    pub fn expose(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for ResolvedDatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDatabaseUrl")
            .field("env_name", &self.env_name)
            .field("url", &"<REDACTED>")
            .finish()
    }
}

/// Read the env var named by `db.url_env`. Blank counts as missing.
pub fn resolve_database_url(db: &DatabaseConfig) -> Result<ResolvedDatabaseUrl> {
    let name = db.url_env.trim();
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(ResolvedDatabaseUrl {
            env_name: name.to_string(),
            url: v,
        }),
        _ => bail!("SECRETS_MISSING: required env var '{}' (database url) is not set or empty", name),
    }
}
