//! ABOUTME: Thin async wrapper over the etcd v3 client used as the job registry
//! ABOUTME: Exposes prefix get/watch, lease grant/keep-alive/revoke, and put-if-absent CAS

use crontab_core::{Error, Result};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A registry key-value pair as returned by a prefix get.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a prefix range-get: the matching pairs plus the revision at which
/// the snapshot was taken (from the response header).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// A single change observed on a watched prefix.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Error yielded by a watch stream: either the underlying stream failed, it
/// closed, or the registry reports the requested revision was compacted away
/// (the caller must re-snapshot and restart the watch).
#[derive(Debug, thiserror::Error)]
pub enum WatchStreamError {
    #[error("watch stream closed")]
    Closed,
    #[error("revision compacted past {compact_revision}")]
    Compacted { compact_revision: i64 },
    #[error("watch stream error: {0}")]
    Stream(#[from] etcd_client::Error),
}

/// An active watch subscription on a key prefix.
pub struct PrefixWatch {
    _watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
}

impl PrefixWatch {
    /// Wait for the next batch of events. Returns `Ok(None)` only if the
    /// stream closed cleanly without a terminal error (treated as `Closed`
    /// by callers that always need to react).
    pub async fn next_events(&mut self) -> std::result::Result<Vec<WatchEvent>, WatchStreamError> {
        let message = self.stream.message().await?;
        let Some(resp) = message else {
            return Err(WatchStreamError::Closed);
        };

        if resp.canceled() {
            if let Some(compact_revision) = compact_revision_of(&resp) {
                return Err(WatchStreamError::Compacted { compact_revision });
            }
            return Err(WatchStreamError::Closed);
        }

        let mut out = Vec::with_capacity(resp.events().len());
        for event in resp.events() {
            let Some(kv) = event.kv() else { continue };
            let key = String::from_utf8_lossy(kv.key()).to_string();
            match event.event_type() {
                EventType::Put => out.push(WatchEvent::Put {
                    key,
                    value: kv.value().to_vec(),
                }),
                EventType::Delete => out.push(WatchEvent::Delete { key }),
            }
        }
        Ok(out)
    }
}

fn compact_revision_of(resp: &etcd_client::WatchResponse) -> Option<i64> {
    // etcd_client surfaces compaction as a canceled watch whose reason string
    // names the compacted revision; the numeric revision itself is not typed
    // on older client versions, so the caller treats any canceled watch as a
    // potential compaction and re-snapshots defensively.
    if resp.cancel_reason().is_empty() {
        None
    } else {
        Some(resp.compact_revision())
    }
}

/// A granted lease, tracked so the holder can keep it alive or revoke it.
#[derive(Debug, Clone, Copy)]
pub struct LeaseId(pub i64);

/// Async wrapper over an `etcd-client` connection.
///
/// Cheap to clone: `etcd_client::Client` is a handle over pooled gRPC
/// channels, so each clone can be driven from its own task.
#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
}

impl RegistryClient {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| Error::Registry(format!("etcd connect failed: {e}")))?;
        Ok(Self { client })
    }

    /// Range-get all keys under `prefix`, returning the matching pairs and
    /// the revision captured in the response header.
    pub async fn get_prefix(&mut self, prefix: &str) -> Result<Snapshot> {
        let resp = self
            .client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::Registry(format!("get prefix {prefix} failed: {e}")))?;

        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| Error::Registry("get response missing header".to_string()))?;

        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
            })
            .collect();

        Ok(Snapshot { kvs, revision })
    }

    /// Get a single key's current value, if it exists.
    pub async fn get(&mut self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self
            .client
            .get(key, None)
            .await
            .map_err(|e| Error::Registry(format!("get {key} failed: {e}")))?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: String::from_utf8_lossy(kv.key()).to_string(),
            value: kv.value().to_vec(),
        }))
    }

    /// Subscribe to a prefix starting from `from_revision` (inclusive).
    pub async fn watch_prefix(&mut self, prefix: &str, from_revision: i64) -> Result<PrefixWatch> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, stream) = self
            .client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| Error::Registry(format!("watch prefix {prefix} failed: {e}")))?;
        Ok(PrefixWatch {
            _watcher: watcher,
            stream,
        })
    }

    pub async fn lease_grant(&mut self, ttl_seconds: i64) -> Result<LeaseId> {
        let lease = self
            .client
            .lease_grant(ttl_seconds, None)
            .await
            .map_err(|e| Error::Registry(format!("lease grant failed: {e}")))?;
        Ok(LeaseId(lease.id()))
    }

    pub async fn lease_revoke(&mut self, lease: LeaseId) -> Result<()> {
        self.client
            .lease_revoke(lease.0)
            .await
            .map_err(|e| Error::Registry(format!("lease revoke failed: {e}")))?;
        Ok(())
    }

    /// Spawn a task that keeps `lease` alive until `cancel` fires, pinging at
    /// roughly half the lease TTL. Errors are logged; the task simply stops,
    /// letting the lease expire naturally (the caller observes lock loss via
    /// the next operation against the lock key).
    pub fn spawn_keep_alive(
        &self,
        lease: LeaseId,
        ttl_seconds: i64,
        cancel: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut client = self.client.clone();
        let interval_secs = (ttl_seconds / 2).max(1) as u64;

        let handle = tokio::spawn(async move {
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease.0).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(lease_id = lease.0, error = %e, "failed to start lease keep-alive");
                    return;
                }
            };

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await; // first tick fires immediately; consume it

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(lease_id = lease.0, "keep-alive cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            tracing::warn!(lease_id = lease.0, error = %e, "keep-alive send failed");
                            return;
                        }
                        match stream.message().await {
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                tracing::warn!(lease_id = lease.0, "keep-alive stream closed");
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(lease_id = lease.0, error = %e, "keep-alive stream error");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Conditional put: put `value` under `key` bound to `lease` only if the
    /// key does not already exist (create-revision is zero). Returns whether
    /// the put happened.
    pub async fn txn_put_if_absent(
        &mut self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
    ) -> Result<bool> {
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease.0)),
            )])
            .or_else([TxnOp::get(key, None)]);

        let resp = self
            .client
            .txn(txn)
            .await
            .map_err(|e| Error::Registry(format!("txn on {key} failed: {e}")))?;

        Ok(resp.succeeded())
    }

    /// Put `value` under `key` bound to `lease`, unconditionally.
    pub async fn put_with_lease(&mut self, key: &str, value: &[u8], lease: LeaseId) -> Result<()> {
        self.client
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(|e| Error::Registry(format!("put {key} failed: {e}")))?;
        Ok(())
    }

    /// Put `value` under `key`, unconditionally and without a lease.
    pub async fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.client
            .put(key, value, None)
            .await
            .map_err(|e| Error::Registry(format!("put {key} failed: {e}")))?;
        Ok(())
    }

    /// Delete the key, if present.
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        self.client
            .delete(key, None)
            .await
            .map_err(|e| Error::Registry(format!("delete {key} failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_id_is_copy_and_transparent() {
        let lease = LeaseId(42);
        let copied = lease;
        assert_eq!(lease.0, copied.0);
    }

    #[test]
    fn watch_event_variants_carry_key() {
        let put = WatchEvent::Put {
            key: "/cron/jobs/hello".to_string(),
            value: b"{}".to_vec(),
        };
        let delete = WatchEvent::Delete {
            key: "/cron/jobs/hello".to_string(),
        };
        match (put, delete) {
            (WatchEvent::Put { key: k1, .. }, WatchEvent::Delete { key: k2 }) => {
                assert_eq!(k1, k2);
            }
            _ => unreachable!(),
        }
    }
}
