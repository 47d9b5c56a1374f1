use std::str::FromStr;
use std::time::Duration;

use crate::TableError;

const ENV_PREFIX: &str = "DYNAMIC_TABLE_";

/// Runtime configuration for the engine and its background jobs.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Maintain search vector columns and allow full-text search.
    pub use_pg_fulltext_search: bool,
    /// Cadence of the periodic field refresh.
    pub periodic_field_update_interval: Duration,
    /// Upper bound for one periodic field refresh run.
    pub periodic_field_update_timeout: Duration,
    /// Cadence of the row count job.
    pub row_count_job_interval: Duration,
    /// Whether the row count job runs at all.
    pub track_workspace_usage: bool,
    /// Rows per transaction when refreshing search vectors.
    pub tsvector_update_batch_size: u64,
    /// Number of workers consuming the job queue.
    pub worker_concurrency: usize,
    pub old_trash_cleanup_check_interval: Duration,
    pub hours_until_trash_permanently_deleted: u64,
    /// Jobs running longer than this are abandoned.
    pub job_soft_time_limit: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_pg_fulltext_search: true,
            periodic_field_update_interval: Duration::from_secs(60),
            periodic_field_update_timeout: Duration::from_secs(9 * 60),
            row_count_job_interval: Duration::from_secs(3600),
            track_workspace_usage: true,
            tsvector_update_batch_size: 1000,
            worker_concurrency: 2,
            old_trash_cleanup_check_interval: Duration::from_secs(5 * 60),
            hours_until_trash_permanently_deleted: 72,
            job_soft_time_limit: Duration::from_secs(540),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `DYNAMIC_TABLE_*` environment variables.
    pub fn from_env() -> Result<Self, TableError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TableError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let worker_concurrency = parse(
            "WORKER_CONCURRENCY",
            var("WORKER_CONCURRENCY"),
            defaults.worker_concurrency,
        )?
        .max(1);
        let tsvector_update_batch_size = parse(
            "TSVECTOR_UPDATE_BATCH_SIZE",
            var("TSVECTOR_UPDATE_BATCH_SIZE"),
            defaults.tsvector_update_batch_size,
        )?
        .max(1);

        Ok(Self {
            use_pg_fulltext_search: parse_bool(
                "USE_PG_FULLTEXT_SEARCH",
                var("USE_PG_FULLTEXT_SEARCH"),
                defaults.use_pg_fulltext_search,
            )?,
            periodic_field_update_interval: Duration::from_secs(parse(
                "PERIODIC_FIELD_UPDATE_INTERVAL_SECS",
                var("PERIODIC_FIELD_UPDATE_INTERVAL_SECS"),
                60,
            )?),
            periodic_field_update_timeout: Duration::from_secs(
                parse::<u64>(
                    "PERIODIC_FIELD_UPDATE_TIMEOUT_MINUTES",
                    var("PERIODIC_FIELD_UPDATE_TIMEOUT_MINUTES"),
                    9,
                )? * 60,
            ),
            row_count_job_interval: Duration::from_secs(parse(
                "ROW_COUNT_JOB_INTERVAL_SECS",
                var("ROW_COUNT_JOB_INTERVAL_SECS"),
                3600,
            )?),
            track_workspace_usage: parse_bool(
                "TRACK_WORKSPACE_USAGE",
                var("TRACK_WORKSPACE_USAGE"),
                defaults.track_workspace_usage,
            )?,
            tsvector_update_batch_size,
            worker_concurrency,
            old_trash_cleanup_check_interval: Duration::from_secs(
                parse::<u64>(
                    "OLD_TRASH_CLEANUP_CHECK_INTERVAL_MINUTES",
                    var("OLD_TRASH_CLEANUP_CHECK_INTERVAL_MINUTES"),
                    5,
                )? * 60,
            ),
            hours_until_trash_permanently_deleted: parse(
                "HOURS_UNTIL_TRASH_PERMANENTLY_DELETED",
                var("HOURS_UNTIL_TRASH_PERMANENTLY_DELETED"),
                defaults.hours_until_trash_permanently_deleted,
            )?,
            job_soft_time_limit: Duration::from_secs(parse(
                "JOB_SOFT_TIME_LIMIT_SECS",
                var("JOB_SOFT_TIME_LIMIT_SECS"),
                540,
            )?),
        })
    }

    /// Age after which trashed items are marked for permanent deletion.
    pub fn trash_retention(&self) -> Duration {
        Duration::from_secs(self.hours_until_trash_permanently_deleted * 3600)
    }
}

fn parse<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T, TableError> {
    match value {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            TableError::InvalidConfig(format!("{ENV_PREFIX}{name}: invalid value {raw:?}"))
        }),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: Option<String>, default: bool) -> Result<bool, TableError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(TableError::InvalidConfig(format!(
            "{ENV_PREFIX}{name}: invalid boolean {v:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.trash_retention(), Duration::from_secs(72 * 3600));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DYNAMIC_TABLE_USE_PG_FULLTEXT_SEARCH", "off"),
            ("DYNAMIC_TABLE_WORKER_CONCURRENCY", "0"),
            ("DYNAMIC_TABLE_PERIODIC_FIELD_UPDATE_TIMEOUT_MINUTES", "2"),
        ]))
        .unwrap();
        assert!(!config.use_pg_fulltext_search);
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(config.periodic_field_update_timeout, Duration::from_secs(120));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(
            "DYNAMIC_TABLE_TSVECTOR_UPDATE_BATCH_SIZE",
            "lots",
        )]))
        .unwrap_err();
        assert!(matches!(err, TableError::InvalidConfig(_)));
    }
}
