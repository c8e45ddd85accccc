//! ABOUTME: Fleet-wide distributed mutual exclusion per job, backed by an etcd lease
//! ABOUTME: TryLock grants a lease, keeps it alive, and CAS-puts the lock key

use crontab_core::{Error, Result};
use crontab_protocol::JOB_LOCK_DIR;
use crontab_registry::{LeaseId, RegistryClient};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Distributed lock manager: one per worker process, shared across firings.
#[derive(Clone)]
pub struct DistributedLockManager {
    registry: RegistryClient,
    lease_ttl_seconds: i64,
}

impl DistributedLockManager {
    pub fn new(registry: RegistryClient, lease_ttl_seconds: i64) -> Self {
        Self {
            registry,
            lease_ttl_seconds,
        }
    }

    /// Attempt to acquire the fleet-wide lock for `job_name`.
    ///
    /// On any failure past lease grant, the lease is revoked best-effort and
    /// the keep-alive task cancelled before the error is surfaced.
    pub async fn try_lock(&self, job_name: &str) -> Result<LockGuard> {
        let mut registry = self.registry.clone();
        let lease = registry.lease_grant(self.lease_ttl_seconds).await?;

        let keep_alive_cancel = CancellationToken::new();
        let keep_alive_handle = registry
            .spawn_keep_alive(lease, self.lease_ttl_seconds, keep_alive_cancel.clone())?;

        let key = format!("{}{}", JOB_LOCK_DIR, job_name);
        let acquired = match registry.txn_put_if_absent(&key, b"", lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                keep_alive_cancel.cancel();
                let _ = registry.lease_revoke(lease).await;
                return Err(e);
            }
        };

        if !acquired {
            keep_alive_cancel.cancel();
            let _ = registry.lease_revoke(lease).await;
            return Err(Error::LockAlreadyRequired);
        }

        Ok(LockGuard {
            registry,
            job_name: job_name.to_string(),
            lease,
            keep_alive_cancel,
            keep_alive_handle: Some(keep_alive_handle),
            released: false,
        })
    }
}

/// Holds a lock until dropped or explicitly released.
///
/// Release cancels the keep-alive task and revokes the lease; revocation
/// atomically deletes the lock key since it was put bound to the lease.
pub struct LockGuard {
    registry: RegistryClient,
    job_name: String,
    lease: LeaseId,
    keep_alive_cancel: CancellationToken,
    keep_alive_handle: Option<tokio::task::JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Release the lock, waiting for the keep-alive task to stop first.
    /// Safe to call more than once; the second call is a no-op.
    pub async fn release(mut self) -> Result<()> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.keep_alive_cancel.cancel();
        if let Some(handle) = self.keep_alive_handle.take() {
            // Bound the wait so a wedged keep-alive task cannot hang release.
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }

        self.registry.lease_revoke(self.lease).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut registry = self.registry.clone();
        let job_name = self.job_name.clone();
        let lease = self.lease;
        self.keep_alive_cancel.cancel();
        let keep_alive_handle = self.keep_alive_handle.take();

        tokio::spawn(async move {
            if let Some(handle) = keep_alive_handle {
                let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
            }
            if let Err(e) = registry.lease_revoke(lease).await {
                tracing::warn!(job_name = %job_name, error = %e, "lock release failed on drop");
            }
        });
    }
}

// Acquire/release behavior needs a live etcd endpoint to exercise
// meaningfully and is covered by the scheduler crate's integration tests
// against a test etcd instance.
