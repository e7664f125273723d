use crate::error::{Error, Result};
use std::env;

/// Database used when `FAIRLOCK_DATABASE` is unset. Matches the layout the
/// Spanner emulator expects (`SPANNER_EMULATOR_HOST=localhost:9010`).
pub const DEFAULT_DATABASE: &str =
    "projects/local-project/instances/local-instance/databases/fairlock";
pub const DEFAULT_LOCKS_TABLE: &str = "locks";
pub const DEFAULT_QUEUE_TABLE: &str = "lock_queue";
pub const DEFAULT_MIN_SESSIONS: usize = 5;
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Connection settings for [`SpannerStore`](crate::store::spanner::SpannerStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database: String,
    pub locks_table: String,
    pub queue_table: String,
    pub min_sessions: usize,
    pub max_sessions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database: DEFAULT_DATABASE.to_string(),
            locks_table: DEFAULT_LOCKS_TABLE.to_string(),
            queue_table: DEFAULT_QUEUE_TABLE.to_string(),
            min_sessions: DEFAULT_MIN_SESSIONS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Reads the `FAIRLOCK_*` environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<StoreConfig> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<StoreConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = StoreConfig::default();
        if let Some(v) = lookup("FAIRLOCK_DATABASE") {
            cfg.database = v;
        }
        if let Some(v) = lookup("FAIRLOCK_LOCKS_TABLE") {
            cfg.locks_table = v;
        }
        if let Some(v) = lookup("FAIRLOCK_QUEUE_TABLE") {
            cfg.queue_table = v;
        }
        if let Some(v) = lookup("FAIRLOCK_MIN_SESSIONS") {
            cfg.min_sessions = parse_count("FAIRLOCK_MIN_SESSIONS", &v)?;
        }
        if let Some(v) = lookup("FAIRLOCK_MAX_SESSIONS") {
            cfg.max_sessions = parse_count("FAIRLOCK_MAX_SESSIONS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(Error::Config("database must not be empty".to_string()));
        }

        for table in [&self.locks_table, &self.queue_table] {
            let valid = !table.is_empty()
                && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !table.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                return Err(Error::Config(format!("invalid table name {table:?}")));
            }
        }

        if self.locks_table == self.queue_table {
            return Err(Error::Config(
                "locks and queue tables must differ".to_string(),
            ));
        }

        if self.max_sessions == 0 || self.min_sessions > self.max_sessions {
            return Err(Error::Config(format!(
                "session bounds min={} max={} are invalid",
                self.min_sessions, self.max_sessions
            )));
        }

        Ok(())
    }
}

fn parse_count(key: &str, v: &str) -> Result<usize> {
    v.trim()
        .parse::<usize>()
        .map_err(|e| Error::Config(format!("{key}={v:?}: {e}")))
}

#[derive(Default)]
pub struct StoreConfigBuilder {
    cfg: Option<StoreConfig>,
}

impl StoreConfigBuilder {
    pub fn new() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    fn cfg(&mut self) -> &mut StoreConfig {
        self.cfg.get_or_insert_with(StoreConfig::default)
    }

    pub fn database(mut self, db: String) -> StoreConfigBuilder {
        self.cfg().database = db;
        self
    }

    pub fn locks_table(mut self, table: String) -> StoreConfigBuilder {
        self.cfg().locks_table = table;
        self
    }

    pub fn queue_table(mut self, table: String) -> StoreConfigBuilder {
        self.cfg().queue_table = table;
        self
    }

    pub fn sessions(mut self, min: usize, max: usize) -> StoreConfigBuilder {
        let cfg = self.cfg();
        cfg.min_sessions = min;
        cfg.max_sessions = max;
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        let cfg = self.cfg.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }
}
