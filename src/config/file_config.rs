use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub admin_token: Option<String>,

    // Feature configs
    pub ingestion: Option<IngestionConfig>,
    pub dispatcher: Option<DispatcherConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub gc: Option<GcConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct IngestionConfig {
    pub window_minutes: Option<u64>,
    pub feed_concurrency: Option<usize>,
    pub write_concurrency: Option<usize>,
    pub heartbeat_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub fetch_backoff_ms: Option<u64>,
    pub run_lock_enabled: Option<bool>,
    pub run_lock_lease_secs: Option<u64>,
    pub reset_saved_on_ingest: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrent: Option<usize>,
    pub visibility_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub worker_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_minutes: Option<u64>,
    pub gc_interval_hours: Option<u64>,
    pub enqueue_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct GcConfig {
    pub job_retention_days: Option<u64>,
    pub run_retention_days: Option<u64>,
    pub company_retention_days: Option<u64>,
    pub batch_limit: Option<usize>,
    pub max_loops: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            db_dir = "/var/lib/jobfeed"
            port = 4010

            [ingestion]
            window_minutes = 120
            feed_concurrency = 4

            [gc]
            job_retention_days = 7
        "#;
        let config: FileConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/jobfeed"));
        assert_eq!(config.port, Some(4010));
        assert_eq!(config.ingestion.unwrap().window_minutes, Some(120));
        assert_eq!(config.gc.unwrap().job_retention_days, Some(7));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.ingestion.is_none());
    }
}
