use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_BATCH_LIMIT: usize = 100; // cap on ids fetched per polling cycle
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000; // how long a writer waits on a locked db

/// Top-level config (pls.toml + PLS_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlsConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Milliseconds a connection waits for a competing writer before the
    /// operation fails as unavailable.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Worker pool sizing and polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of independent worker loops in the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of pending ids a loop lists per cycle.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Sleep between cycles that found nothing to do.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_limit: DEFAULT_BATCH_LIMIT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CoreError::Config("worker.workers must be at least 1".into()));
        }
        if self.batch_limit == 0 {
            return Err(CoreError::Config(
                "worker.batch_limit must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::Config(
                "worker.poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_batch_limit() -> usize {
    DEFAULT_BATCH_LIMIT
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.pls/pls.db", home)
}

impl PlsConfig {
    /// Load config from a TOML file with PLS_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `PLS_WORKER__BATCH_LIMIT=50`.
    /// A missing file is not an error: every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PlsConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PLS_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.worker.validate()?;
        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.pls/pls.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PlsConfig::default();
        assert_eq!(config.worker.workers, DEFAULT_WORKERS);
        assert_eq!(config.worker.batch_limit, DEFAULT_BATCH_LIMIT);
        assert!(config.database.path.ends_with(".pls/pls.db"));
        assert!(config.worker.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let worker = WorkerConfig {
            workers: 0,
            ..WorkerConfig::default()
        };
        let err = worker.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn zero_batch_limit_rejected() {
        let worker = WorkerConfig {
            batch_limit: 0,
            ..WorkerConfig::default()
        };
        assert!(worker.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let worker = WorkerConfig {
            poll_interval_ms: 0,
            ..WorkerConfig::default()
        };
        let err = worker.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn file_then_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "pls.toml",
                r#"
                [database]
                path = "/tmp/jobs.db"

                [worker]
                workers = 4
                batch_limit = 25
                "#,
            )?;
            jail.set_env("PLS_WORKER__BATCH_LIMIT", "50");

            let config = PlsConfig::load(Some("pls.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.database.path, "/tmp/jobs.db");
            assert_eq!(config.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
            assert_eq!(config.worker.workers, 4);
            // env wins over the file
            assert_eq!(config.worker.batch_limit, 50);
            assert_eq!(config.worker.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = PlsConfig::load(Some("does-not-exist.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.worker.workers, DEFAULT_WORKERS);
            Ok(())
        });
    }

    #[test]
    fn invalid_worker_count_from_file_is_config_error() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("pls.toml", "[worker]\nworkers = 0\n")?;
            let err = PlsConfig::load(Some("pls.toml")).unwrap_err();
            assert!(matches!(err, CoreError::Config(_)));
            Ok(())
        });
    }
}
