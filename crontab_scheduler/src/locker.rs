//! ABOUTME: Object-safe seam over the distributed lock, so the scheduler loop
//! ABOUTME: can be tested against a fake locker without a live registry

use async_trait::async_trait;
use crontab_core::Result;

#[async_trait]
pub trait LockHandle: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait JobLocker: Send + Sync {
    async fn try_lock(&self, job_name: &str) -> Result<Box<dyn LockHandle>>;
}

#[async_trait]
impl LockHandle for crontab_lock::LockGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        (*self).release().await
    }
}

#[async_trait]
impl JobLocker for crontab_lock::DistributedLockManager {
    async fn try_lock(&self, job_name: &str) -> Result<Box<dyn LockHandle>> {
        let guard = crontab_lock::DistributedLockManager::try_lock(self, job_name).await?;
        Ok(Box::new(guard))
    }
}
