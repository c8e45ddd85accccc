//! ABOUTME: Job catalog watcher, snapshot + incremental watch + kill-signal watch
//! ABOUTME: Emits JobEvent{Save,Delete} and kill(name) signals to the scheduler

use crontab_core::Result;
use crontab_protocol::{extract_job_name, extract_kill_name, Job, JobEvent, JOB_KILLER_DIR, JOB_SAVE_DIR};
use crontab_registry::{RegistryClient, WatchEvent, WatchStreamError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Signal emitted on the kill prefix: existence of the key is the signal, the
/// value is not inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSignal {
    pub job_name: String,
}

/// Runs the catalog watch and the kill-signal watch as two independent tasks
/// against the registry, restarting each on disconnect and re-snapshotting
/// the catalog watch on a reported compaction.
pub struct JobCatalogWatcher {
    registry: RegistryClient,
}

impl JobCatalogWatcher {
    pub fn new(registry: RegistryClient) -> Self {
        Self { registry }
    }

    /// Spawn the catalog watch task. Delivers a SAVE event per job in the
    /// initial snapshot, then incremental SAVE/DELETE events as the catalog
    /// changes. Runs until `cancel` fires.
    pub fn spawn_catalog_watch(
        &self,
        events: mpsc::Sender<JobEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let from_revision = match snapshot_catalog(&mut registry, &events).await {
                    Ok(rev) => rev,
                    Err(e) => {
                        tracing::error!(error = %e, "catalog snapshot failed, retrying");
                        if wait_or_cancelled(&cancel).await {
                            return;
                        }
                        continue;
                    }
                };

                match watch_catalog(&mut registry, from_revision, &events, &cancel).await {
                    WatchOutcome::Cancelled => return,
                    WatchOutcome::Restart => continue,
                }
            }
        })
    }

    /// Spawn the kill-signal watch task. Runs until `cancel` fires.
    pub fn spawn_kill_watch(
        &self,
        kills: mpsc::Sender<KillSignal>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let snapshot = match registry.get_prefix(JOB_KILLER_DIR).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "kill prefix snapshot failed, retrying");
                        if wait_or_cancelled(&cancel).await {
                            return;
                        }
                        continue;
                    }
                };

                let mut watch = match registry
                    .watch_prefix(JOB_KILLER_DIR, snapshot.revision + 1)
                    .await
                {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::error!(error = %e, "kill prefix watch start failed, retrying");
                        if wait_or_cancelled(&cancel).await {
                            return;
                        }
                        continue;
                    }
                };

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = watch.next_events() => next,
                    };

                    match next {
                        Ok(batch) => {
                            for event in batch {
                                if let WatchEvent::Put { key, .. } = event {
                                    let job_name = extract_kill_name(&key);
                                    if kills.send(KillSignal { job_name }).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(WatchStreamError::Compacted { compact_revision }) => {
                            tracing::warn!(compact_revision, "kill watch compacted, re-snapshotting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "kill watch stream ended, restarting");
                            break;
                        }
                    }
                }
            }
        })
    }
}

enum WatchOutcome {
    Cancelled,
    Restart,
}

async fn snapshot_catalog(
    registry: &mut RegistryClient,
    events: &mpsc::Sender<JobEvent>,
) -> Result<i64> {
    let snapshot = registry.get_prefix(JOB_SAVE_DIR).await?;
    for kv in snapshot.kvs {
        match Job::decode(&kv.value) {
            Ok(job) => {
                if events.send(JobEvent::save(job)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(key = %kv.key, error = %e, "dropping undecodable job in snapshot");
            }
        }
    }
    Ok(snapshot.revision)
}

async fn watch_catalog(
    registry: &mut RegistryClient,
    from_revision: i64,
    events: &mpsc::Sender<JobEvent>,
    cancel: &CancellationToken,
) -> WatchOutcome {
    let mut watch = match registry.watch_prefix(JOB_SAVE_DIR, from_revision + 1).await {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "catalog watch start failed, restarting");
            return WatchOutcome::Restart;
        }
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            next = watch.next_events() => next,
        };

        match next {
            Ok(batch) => {
                for event in batch {
                    let job_event = match event {
                        WatchEvent::Put { value, .. } => match Job::decode(&value) {
                            Ok(job) => JobEvent::save(job),
                            Err(e) => {
                                tracing::error!(error = %e, "dropping undecodable job event");
                                continue;
                            }
                        },
                        WatchEvent::Delete { key } => JobEvent::delete(extract_job_name(&key)),
                    };
                    if events.send(job_event).await.is_err() {
                        return WatchOutcome::Cancelled;
                    }
                }
            }
            Err(WatchStreamError::Compacted { compact_revision }) => {
                tracing::warn!(compact_revision, "catalog watch compacted, re-snapshotting");
                return WatchOutcome::Restart;
            }
            Err(e) => {
                tracing::warn!(error = %e, "catalog watch stream ended, restarting");
                return WatchOutcome::Restart;
            }
        }
    }
}

/// Wait a short backoff before retrying a failed snapshot/watch start.
/// Returns true if cancelled during the wait.
async fn wait_or_cancelled(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_signal_carries_job_name() {
        let signal = KillSignal {
            job_name: "long".to_string(),
        };
        assert_eq!(signal.job_name, "long");
    }
}
