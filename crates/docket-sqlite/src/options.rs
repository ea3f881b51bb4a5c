use std::time::Duration;

/// Per-connection pragmas applied when a connection is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    pub busy_timeout: Duration,
    pub journal_mode: String,
    pub foreign_keys: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            journal_mode: "WAL".to_string(),
            foreign_keys: true,
        }
    }
}

impl SqliteOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let busy_timeout = std::env::var("DOCKET_SQLITE_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.busy_timeout);
        let journal_mode =
            std::env::var("DOCKET_SQLITE_JOURNAL_MODE").unwrap_or(defaults.journal_mode);
        Self {
            busy_timeout,
            journal_mode,
            foreign_keys: defaults.foreign_keys,
        }
    }
}
