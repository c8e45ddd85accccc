//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles worker and master settings from config files and environment variables

use config::{Config as ConfigBuilder, Environment, File};
use crontab_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Worker process configuration.
///
/// Field names mirror the reference `worker.json` layout (see spec §6):
/// `etcdEndpoints`, `etcdDialTimeout`, `mongodbUri`, ... Supplemented fields
/// (`lockLeaseSeconds`, the channel capacities, `environment`, `obsPort`)
/// are ambient plumbing not named by the distilled spec.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[validate(length(min = 1))]
    pub etcd_endpoints: Vec<String>,
    /// Dial timeout, in microseconds (matches the reference config's unit).
    pub etcd_dial_timeout: u64,

    pub mongodb_uri: String,
    pub mongodb_connect_timeout: u64,
    #[validate(length(min = 1))]
    pub mongodb_database: String,
    #[validate(length(min = 1))]
    pub mongodb_collection: String,

    #[validate(range(min = 1))]
    pub job_log_batch_size: usize,
    #[validate(range(min = 1))]
    pub job_log_commit_timeout: u64,

    /// Distributed lock lease duration, in seconds.
    #[validate(range(min = 1))]
    pub lock_lease_seconds: i64,

    /// Bounded channel capacities (spec §5: events/results ~1000, log buffer ~2000).
    #[validate(range(min = 1))]
    pub job_event_channel_capacity: usize,
    #[validate(range(min = 1))]
    pub job_result_channel_capacity: usize,
    #[validate(range(min = 1))]
    pub log_channel_capacity: usize,

    /// "development" or "production"; gates the tracing output format.
    pub environment: String,

    /// Port for the `/healthz`, `/readyz`, `/metrics` surface.
    pub obs_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_dial_timeout: 5_000_000,
            mongodb_uri: "mongodb://127.0.0.1:27017".to_string(),
            mongodb_connect_timeout: 5_000,
            mongodb_database: "cron".to_string(),
            mongodb_collection: "log".to_string(),
            job_log_batch_size: 100,
            job_log_commit_timeout: 1_000,
            lock_lease_seconds: 5,
            job_event_channel_capacity: 1_000,
            job_result_channel_capacity: 1_000,
            log_channel_capacity: 2_000,
            environment: "development".to_string(),
            obs_port: 9100,
        }
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkerConfig {{ etcd_endpoints: {:?}, mongodb_database: {}, mongodb_collection: {}, \
             job_log_batch_size: {}, job_log_commit_timeout: {}ms, lock_lease_seconds: {} }}",
            self.etcd_endpoints,
            self.mongodb_database,
            self.mongodb_collection,
            self.job_log_batch_size,
            self.job_log_commit_timeout,
            self.lock_lease_seconds,
        )
    }
}

impl WorkerConfig {
    /// Load configuration from an optional file, overridden by
    /// `CRONTAB_WORKER_`-prefixed environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder
            .set_default("etcd_endpoints", vec!["http://127.0.0.1:2379".to_string()])?
            .set_default("etcd_dial_timeout", 5_000_000i64)?
            .set_default("mongodb_uri", "mongodb://127.0.0.1:27017")?
            .set_default("mongodb_connect_timeout", 5_000i64)?
            .set_default("mongodb_database", "cron")?
            .set_default("mongodb_collection", "log")?
            .set_default("job_log_batch_size", 100i64)?
            .set_default("job_log_commit_timeout", 1_000i64)?
            .set_default("lock_lease_seconds", 5i64)?
            .set_default("job_event_channel_capacity", 1_000i64)?
            .set_default("job_result_channel_capacity", 1_000i64)?
            .set_default("log_channel_capacity", 2_000i64)?
            .set_default("environment", "development")?
            .set_default("obs_port", 9100i64)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // No `.separator("_")` here: this struct is flat, so splitting the
        // remainder on `_` would turn `MONGODB_DATABASE` into the nested path
        // `mongodb.database` instead of the flat key `mongodb_database`,
        // silently dropping the override.
        builder = builder.add_source(
            Environment::with_prefix("CRONTAB_WORKER").try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build worker config: {}", e)))?;

        let parsed: WorkerConfig = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("failed to deserialize worker config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("worker config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

/// Master process configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MasterConfig {
    #[validate(length(min = 1))]
    pub etcd_endpoints: Vec<String>,
    pub etcd_dial_timeout: u64,

    #[validate(range(min = 1, max = 65535))]
    pub api_port: u16,
    pub api_read_timeout: u64,
    pub api_write_timeout: u64,
    /// Lease given to a kill-signal key, in seconds (short-lived per spec §4.1).
    #[validate(range(min = 1))]
    pub kill_signal_lease_seconds: i64,

    pub environment: String,
    pub obs_port: u16,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_dial_timeout: 5_000_000,
            api_port: 2915,
            api_read_timeout: 5_000_000,
            api_write_timeout: 5_000_000,
            kill_signal_lease_seconds: 5,
            environment: "development".to_string(),
            obs_port: 9101,
        }
    }
}

impl MasterConfig {
    /// Load configuration from an optional file, overridden by
    /// `CRONTAB_MASTER_`-prefixed environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder
            .set_default("etcd_endpoints", vec!["http://127.0.0.1:2379".to_string()])?
            .set_default("etcd_dial_timeout", 5_000_000i64)?
            .set_default("api_port", 2915i64)?
            .set_default("api_read_timeout", 5_000_000i64)?
            .set_default("api_write_timeout", 5_000_000i64)?
            .set_default("kill_signal_lease_seconds", 5i64)?
            .set_default("environment", "development")?
            .set_default("obs_port", 9101i64)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // No `.separator("_")` here: this struct is flat, so splitting the
        // remainder on `_` would turn `API_READ_TIMEOUT` into the nested path
        // `api.read.timeout` instead of the flat key `api_read_timeout`,
        // silently dropping the override.
        builder = builder.add_source(
            Environment::with_prefix("CRONTAB_MASTER").try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build master config: {}", e)))?;

        let parsed: MasterConfig = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("failed to deserialize master config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("master config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_worker_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        for key in ["CRONTAB_WORKER_MONGODB_DATABASE", "CRONTAB_WORKER_LOCK_LEASE_SECONDS"] {
            env::remove_var(key);
        }

        let config = WorkerConfig::load(None).expect("should load with defaults");
        assert_eq!(config.mongodb_database, "cron");
        assert_eq!(config.lock_lease_seconds, 5);
        assert_eq!(config.job_log_batch_size, 100);
    }

    #[test]
    fn test_worker_config_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("CRONTAB_WORKER_MONGODB_DATABASE", "cron_test");
        env::set_var("CRONTAB_WORKER_LOCK_LEASE_SECONDS", "10");

        let config = WorkerConfig::load(None).expect("should load from env");
        assert_eq!(config.mongodb_database, "cron_test");
        assert_eq!(config.lock_lease_seconds, 10);

        env::remove_var("CRONTAB_WORKER_MONGODB_DATABASE");
        env::remove_var("CRONTAB_WORKER_LOCK_LEASE_SECONDS");
    }

    #[test]
    fn test_worker_config_rejects_empty_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("CRONTAB_WORKER_JOB_LOG_BATCH_SIZE", "0");

        let result = WorkerConfig::load(None);
        assert!(result.is_err());

        env::remove_var("CRONTAB_WORKER_JOB_LOG_BATCH_SIZE");
    }

    #[test]
    fn test_master_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::remove_var("CRONTAB_MASTER_API_PORT");

        let config = MasterConfig::load(None).expect("should load with defaults");
        assert_eq!(config.api_port, 2915);
    }
}
