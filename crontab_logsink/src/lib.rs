//! ABOUTME: Buffers JobLog records and commits them in batches to a document store
//! ABOUTME: Single commit-loop task; batch-with-timeout with an identity check on timer fire

use async_trait::async_trait;
use crontab_core::{Error, Result};
use crontab_protocol::JobLog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Persistence seam for committed batches. `MongoLogStore` is the production
/// implementation; tests substitute an in-memory store.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn insert_many(&self, batch: &[JobLog]) -> Result<()>;
}

/// Document-store-backed log store using the configured database and collection.
pub struct MongoLogStore {
    collection: mongodb::Collection<JobLog>,
}

impl MongoLogStore {
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let mut options = mongodb::options::ClientOptions::parse(uri)
            .await
            .map_err(|e| Error::Storage(format!("invalid mongodb uri: {e}")))?;
        options.connect_timeout = Some(connect_timeout);

        let client = mongodb::Client::with_options(options)
            .map_err(|e| Error::Storage(format!("failed to build mongodb client: {e}")))?;

        let collection = client.database(database).collection::<JobLog>(collection);
        Ok(Self { collection })
    }
}

#[async_trait]
impl LogStore for MongoLogStore {
    async fn insert_many(&self, batch: &[JobLog]) -> Result<()> {
        self.collection
            .insert_many(batch.to_vec())
            .await
            .map_err(|e| Error::Storage(format!("bulk insert failed: {e}")))?;
        Ok(())
    }
}

enum SinkMsg {
    Log(JobLog),
    Timeout(u64),
}

/// Handle for appending results; the commit loop runs on its own task.
#[derive(Clone)]
pub struct LogSink {
    sender: mpsc::Sender<SinkMsg>,
}

impl LogSink {
    /// Spawn the commit loop and return a handle plus its join handle.
    pub fn spawn(
        store: Arc<dyn LogStore>,
        batch_size: usize,
        commit_timeout: Duration,
        channel_capacity: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(channel_capacity);
        let timeout_sender = sender.clone();

        let join = tokio::spawn(commit_loop(
            receiver,
            timeout_sender,
            store,
            batch_size,
            commit_timeout,
        ));

        (Self { sender }, join)
    }

    /// Append a result to the buffer. Non-blocking: if the buffer is full,
    /// the record is dropped and this is logged, callers must never block
    /// on storage back-pressure.
    pub fn append(&self, log: JobLog) {
        if self.sender.try_send(SinkMsg::Log(log)).is_err() {
            tracing::warn!("log sink buffer full, dropping record");
        }
    }
}

async fn commit_loop(
    mut receiver: mpsc::Receiver<SinkMsg>,
    timeout_sender: mpsc::Sender<SinkMsg>,
    store: Arc<dyn LogStore>,
    batch_size: usize,
    commit_timeout: Duration,
) {
    let mut current_batch: Option<Vec<JobLog>> = None;
    let mut current_batch_id: u64 = 0;
    let mut next_batch_id: u64 = 0;
    let mut timer_handle: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(msg) = receiver.recv().await {
        match msg {
            SinkMsg::Log(log) => {
                if current_batch.is_none() {
                    current_batch = Some(Vec::with_capacity(batch_size));
                    next_batch_id += 1;
                    current_batch_id = next_batch_id;

                    let armed_id = current_batch_id;
                    let tx = timeout_sender.clone();
                    timer_handle = Some(tokio::spawn(async move {
                        tokio::time::sleep(commit_timeout).await;
                        let _ = tx.send(SinkMsg::Timeout(armed_id)).await;
                    }));
                }

                let batch = current_batch.as_mut().expect("just ensured Some");
                batch.push(log);

                if batch.len() >= batch_size {
                    if let Some(handle) = timer_handle.take() {
                        handle.abort();
                    }
                    let batch = current_batch.take().expect("just checked Some");
                    commit(&store, batch).await;
                }
            }
            SinkMsg::Timeout(armed_id) => {
                // Only commit if this timer was armed for the still-current
                // batch; a concurrent size-triggered commit may have already
                // replaced or cleared it, in which case this fire is stale.
                if armed_id == current_batch_id {
                    if let Some(batch) = current_batch.take() {
                        commit(&store, batch).await;
                    }
                }
            }
        }
    }
}

async fn commit(store: &Arc<dyn LogStore>, batch: Vec<JobLog>) {
    if batch.is_empty() {
        return;
    }
    let len = batch.len();
    if let Err(e) = store.insert_many(&batch).await {
        tracing::error!(batch_len = len, error = %e, "log batch commit failed, dropping batch");
    } else {
        tracing::debug!(batch_len = len, "log batch committed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<JobLog>>>,
    }

    #[async_trait]
    impl LogStore for RecordingStore {
        async fn insert_many(&self, batch: &[JobLog]) -> Result<()> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn sample_log(name: &str) -> JobLog {
        JobLog {
            job_name: name.to_string(),
            command: "echo hi".to_string(),
            err: String::new(),
            output: "hi\n".to_string(),
            plan_time: 0,
            schedule_time: 0,
            start_time: 0,
            end_time: 1,
        }
    }

    #[tokio::test]
    async fn size_trigger_commits_immediately() {
        let store = Arc::new(RecordingStore::default());
        let (sink, _join) = LogSink::spawn(store.clone(), 3, Duration::from_secs(10), 100);

        sink.append(sample_log("a"));
        sink.append(sample_log("b"));
        sink.append(sample_log("c"));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test]
    async fn timeout_commits_partial_batch_once() {
        let store = Arc::new(RecordingStore::default());
        let (sink, _join) = LogSink::spawn(store.clone(), 10, Duration::from_millis(50), 100);

        sink.append(sample_log("a"));
        sink.append(sample_log("b"));

        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn size_commit_before_timeout_is_not_double_committed() {
        let store = Arc::new(RecordingStore::default());
        let (sink, _join) = LogSink::spawn(store.clone(), 2, Duration::from_millis(50), 100);

        sink.append(sample_log("a"));
        sink.append(sample_log("b")); // size-triggers immediately, aborts the timer

        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1, "timer fire after size-commit must not double-commit");
    }

    #[tokio::test]
    async fn full_buffer_drops_records_without_blocking() {
        let store = Arc::new(RecordingStore::default());
        // Tiny channel capacity and a huge batch size so nothing ever commits,
        // forcing the buffer to fill and start dropping appends.
        let (sink, _join) = LogSink::spawn(store.clone(), 10_000, Duration::from_secs(60), 1);

        for i in 0..50 {
            sink.append(sample_log(&format!("job-{i}")));
        }
        // Must return promptly; append never blocks on a full buffer.
    }
}
