//! ABOUTME: Registry-backed catalog mutations used by the admin HTTP handlers

use crontab_core::Result;
use crontab_protocol::{Job, JOB_KILLER_DIR, JOB_SAVE_DIR};
use crontab_registry::RegistryClient;

/// Short-lived lease given to a kill-signal key so it auto-expires.
const KILL_SIGNAL_LEASE_SECONDS: i64 = 5;

#[derive(Clone)]
pub struct JobManager {
    registry: RegistryClient,
    kill_signal_lease_seconds: i64,
}

impl JobManager {
    pub fn new(registry: RegistryClient, kill_signal_lease_seconds: i64) -> Self {
        Self {
            registry,
            kill_signal_lease_seconds,
        }
    }

    pub fn with_defaults(registry: RegistryClient) -> Self {
        Self::new(registry, KILL_SIGNAL_LEASE_SECONDS)
    }

    /// Save (create or replace) a job. Returns the previous job, if any.
    pub async fn save_job(&self, job: Job) -> Result<Option<Job>> {
        let key = job.catalog_key();
        let previous = self.get_job(&job.name).await?;

        let mut registry = self.registry.clone();
        let value = job
            .encode()
            .map_err(|e| crontab_core::Error::Validation(format!("failed to encode job: {e}")))?;
        registry.put(&key, &value).await?;

        Ok(previous)
    }

    /// Delete a job by name. Returns the deleted job, if it existed.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>> {
        let previous = self.get_job(name).await?;
        if previous.is_some() {
            let mut registry = self.registry.clone();
            let key = format!("{}{}", JOB_SAVE_DIR, name);
            registry.delete(&key).await?;
        }
        Ok(previous)
    }

    /// List all jobs currently in the catalog.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut registry = self.registry.clone();
        let snapshot = registry.get_prefix(JOB_SAVE_DIR).await?;

        let mut jobs = Vec::with_capacity(snapshot.kvs.len());
        for kv in snapshot.kvs {
            match Job::decode(&kv.value) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::error!(key = %kv.key, error = %e, "dropping undecodable job in listing"),
            }
        }
        Ok(jobs)
    }

    /// Signal a job to be killed: write a short-lived key under the kill prefix.
    pub async fn kill_job(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.clone();
        let lease = registry.lease_grant(self.kill_signal_lease_seconds).await?;
        let key = format!("{}{}", JOB_KILLER_DIR, name);
        registry.put_with_lease(&key, b"", lease).await
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        let mut registry = self.registry.clone();
        let key = format!("{}{}", JOB_SAVE_DIR, name);
        match registry.get(&key).await? {
            Some(kv) => Job::decode(&kv.value)
                .map(Some)
                .map_err(|e| crontab_core::Error::Validation(format!("stored job undecodable: {e}"))),
            None => Ok(None),
        }
    }
}
