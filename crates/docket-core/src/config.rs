use serde::Deserialize;

/// Store-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prepended to every table name.
    pub table_prefix: String,
    /// Share identical in-flight queries within a session.
    pub coalesce_queries: bool,
    /// Guard document updates with the version read by the session.
    pub check_concurrency: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            coalesce_queries: true,
            check_concurrency: true,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let table_prefix = std::env::var("DOCKET_TABLE_PREFIX").unwrap_or(defaults.table_prefix);
        let coalesce_queries = std::env::var("DOCKET_COALESCE_QUERIES")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(defaults.coalesce_queries);
        let check_concurrency = std::env::var("DOCKET_CHECK_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(defaults.check_concurrency);
        Self {
            table_prefix,
            coalesce_queries,
            check_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: StoreConfig = serde_json::from_str(r#"{ "table_prefix": "app_" }"#).unwrap();
        assert_eq!(cfg.table_prefix, "app_");
        assert!(cfg.coalesce_queries);
        assert!(cfg.check_concurrency);
    }
}
