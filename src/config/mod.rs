mod file_config;

pub use file_config::{
    DispatcherConfig, FileConfig, GcConfig, IngestionConfig, SchedulerConfig,
};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that participate in config resolution. TOML file values
/// override CLI values where present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    /// Token guarding the internal operator routes; disabled when unset.
    pub admin_token: Option<String>,

    pub ingestion: IngestionSettings,
    pub dispatcher: DispatcherSettings,
    pub scheduler: SchedulerSettings,
    pub gc: GcSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML config.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let admin_token = file.admin_token.or_else(|| cli.admin_token.clone());

        let ing = file.ingestion.unwrap_or_default();
        let ingestion = IngestionSettings {
            window: Duration::from_secs(ing.window_minutes.unwrap_or(60) * 60),
            feed_concurrency: ing.feed_concurrency.unwrap_or(6),
            write_concurrency: ing.write_concurrency.unwrap_or(25),
            heartbeat_interval: Duration::from_secs(ing.heartbeat_secs.unwrap_or(10)),
            fetch_timeout: Duration::from_secs(ing.fetch_timeout_secs.unwrap_or(75)),
            fetch_retries: ing.fetch_retries.unwrap_or(3),
            fetch_backoff: Duration::from_millis(ing.fetch_backoff_ms.unwrap_or(500)),
            run_lock_enabled: ing.run_lock_enabled.unwrap_or(true),
            run_lock_lease: Duration::from_secs(ing.run_lock_lease_secs.unwrap_or(540)),
            reset_saved_on_ingest: ing.reset_saved_on_ingest.unwrap_or(false),
        };

        let disp = file.dispatcher.unwrap_or_default();
        let dispatcher = DispatcherSettings {
            max_concurrent: disp.max_concurrent.unwrap_or(10),
            visibility_timeout: Duration::from_secs(disp.visibility_timeout_secs.unwrap_or(600)),
            max_attempts: disp.max_attempts.unwrap_or(3),
            retry_backoff: Duration::from_secs(disp.retry_backoff_secs.unwrap_or(60)),
            poll_interval: Duration::from_millis(disp.poll_interval_ms.unwrap_or(1000)),
            worker_timeout: Duration::from_secs(disp.worker_timeout_secs.unwrap_or(540)),
        };

        let sched = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            poll_interval: Duration::from_secs(sched.poll_interval_minutes.unwrap_or(30) * 60),
            gc_interval: Duration::from_secs(sched.gc_interval_hours.unwrap_or(48) * 60 * 60),
            enqueue_concurrency: sched.enqueue_concurrency.unwrap_or(50),
        };

        let gc_file = file.gc.unwrap_or_default();
        let gc = GcSettings {
            job_retention: Duration::from_secs(gc_file.job_retention_days.unwrap_or(14) * 86_400),
            run_retention: Duration::from_secs(gc_file.run_retention_days.unwrap_or(14) * 86_400),
            company_retention: Duration::from_secs(
                gc_file.company_retention_days.unwrap_or(30) * 86_400,
            ),
            batch_limit: gc_file.batch_limit.unwrap_or(400),
            max_loops: gc_file.max_loops.unwrap_or(50),
        };

        Ok(Self {
            db_dir,
            port,
            admin_token,
            ingestion,
            dispatcher,
            scheduler,
            gc,
        })
    }

    pub fn store_db_path(&self) -> PathBuf {
        self.db_dir.join("store.db")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.db_dir.join("queue.db")
    }
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Rolling eligibility window for postings.
    pub window: Duration,
    pub feed_concurrency: usize,
    pub write_concurrency: usize,
    pub heartbeat_interval: Duration,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    pub fetch_backoff: Duration,
    pub run_lock_enabled: bool,
    pub run_lock_lease: Duration,
    pub reset_saved_on_ingest: bool,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60 * 60),
            feed_concurrency: 6,
            write_concurrency: 25,
            heartbeat_interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(75),
            fetch_retries: 3,
            fetch_backoff: Duration::from_millis(500),
            run_lock_enabled: true,
            run_lock_lease: Duration::from_secs(540),
            reset_saved_on_ingest: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_concurrent: usize,
    /// Lease put on a claimed message; must cover the worker timeout.
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub worker_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            visibility_timeout: Duration::from_secs(600),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            worker_timeout: Duration::from_secs(540),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub gc_interval: Duration,
    pub enqueue_concurrency: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30 * 60),
            gc_interval: Duration::from_secs(48 * 60 * 60),
            enqueue_concurrency: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcSettings {
    pub job_retention: Duration,
    pub run_retention: Duration,
    pub company_retention: Duration,
    /// Max documents per delete query.
    pub batch_limit: usize,
    /// Safety cap on delete loops per collection.
    pub max_loops: usize,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            job_retention: Duration::from_secs(14 * 86_400),
            run_retention: Duration::from_secs(14 * 86_400),
            company_retention: Duration::from_secs(30 * 86_400),
            batch_limit: 400,
            max_loops: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_cli_only() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            port: 4010,
            admin_token: Some("secret".to_string()),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.db_dir, dir.path());
        assert_eq!(config.port, 4010);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.ingestion.window, Duration::from_secs(3600));
        assert_eq!(config.ingestion.feed_concurrency, 6);
        assert_eq!(config.dispatcher.max_concurrent, 10);
        assert_eq!(config.gc.batch_limit, 400);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            port: 4010,
            admin_token: None,
        };
        let file = FileConfig {
            db_dir: Some(dir.path().to_string_lossy().to_string()),
            port: Some(5000),
            ingestion: Some(IngestionConfig {
                window_minutes: Some(120),
                run_lock_enabled: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.db_dir, dir.path());
        assert_eq!(config.port, 5000);
        assert_eq!(config.ingestion.window, Duration::from_secs(7200));
        assert!(!config.ingestion.run_lock_enabled);
        // CLI value used when TOML is silent.
        assert_eq!(config.ingestion.feed_concurrency, 6);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/for/sure")),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_db_path_helpers() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.store_db_path(), dir.path().join("store.db"));
        assert_eq!(config.queue_db_path(), dir.path().join("queue.db"));
    }
}
