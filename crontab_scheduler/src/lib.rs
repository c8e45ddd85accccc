//! ABOUTME: Core scheduling loop, plan table, executing table, single-writer event loop
//! ABOUTME: Consumes catalog/kill events, fires expired plans, dispatches to the executor

mod locker;
mod types;

pub use locker::{JobLocker, LockHandle};
pub use types::{ExecuteInfo, ExecuteResult, ExecutingTable, JobPlan, PlanTable};

use chrono::{DateTime, Utc};
use crontab_cron::CompiledCron;
use crontab_executor::{execute, ExecuteRequest};
use crontab_logsink::LogSink;
use crontab_protocol::{Job, JobEvent, JobLog};
use crontab_watcher::KillSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle for feeding events into a running scheduler. Mirrors the reference
/// `PushJobEvent`/`PushJobResult`/`PushKill` operations as channel sends;
/// the scheduler loop itself is the only writer of its internal tables.
#[derive(Clone)]
pub struct SchedulerHandle {
    event_tx: mpsc::Sender<JobEvent>,
    kill_tx: mpsc::Sender<KillSignal>,
}

impl SchedulerHandle {
    /// Enqueue a catalog change. Blocks if the bounded channel is full:
    /// events must never be dropped silently.
    pub async fn push_job_event(&self, event: JobEvent) -> Result<(), mpsc::error::SendError<JobEvent>> {
        self.event_tx.send(event).await
    }

    /// Enqueue a kill signal for the named job.
    pub async fn push_kill(&self, name: String) -> Result<(), mpsc::error::SendError<KillSignal>> {
        self.kill_tx.send(KillSignal { job_name: name }).await
    }

    /// Raw sender for catalog watchers to feed events directly, bypassing
    /// the per-call `push_job_event` indirection.
    pub fn event_sender(&self) -> mpsc::Sender<JobEvent> {
        self.event_tx.clone()
    }

    /// Raw sender for the kill-signal watcher.
    pub fn kill_sender(&self) -> mpsc::Sender<KillSignal> {
        self.kill_tx.clone()
    }
}

/// Configuration the scheduler loop needs beyond the locker and log sink.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub job_event_channel_capacity: usize,
    pub job_result_channel_capacity: usize,
    pub kill_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_event_channel_capacity: 1_000,
            job_result_channel_capacity: 1_000,
            kill_channel_capacity: 1_000,
        }
    }
}

/// Start the scheduler loop as its own task. Returns a handle for feeding it
/// events and the loop's join handle (for graceful shutdown by dropping the
/// handle and awaiting, or aborting on process shutdown).
pub fn spawn(
    config: SchedulerConfig,
    locker: Arc<dyn JobLocker>,
    log_sink: LogSink,
) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
    let (event_tx, event_rx) = mpsc::channel(config.job_event_channel_capacity);
    let (kill_tx, kill_rx) = mpsc::channel(config.kill_channel_capacity);
    let (result_tx, result_rx) = mpsc::channel(config.job_result_channel_capacity);

    let handle = SchedulerHandle { event_tx, kill_tx };

    let join = tokio::spawn(run_loop(event_rx, kill_rx, result_rx, result_tx, locker, log_sink));

    (handle, join)
}

async fn run_loop(
    mut event_rx: mpsc::Receiver<JobEvent>,
    mut kill_rx: mpsc::Receiver<KillSignal>,
    mut result_rx: mpsc::Receiver<ExecuteResult>,
    result_tx: mpsc::Sender<ExecuteResult>,
    locker: Arc<dyn JobLocker>,
    log_sink: LogSink,
) {
    let mut plan_table: PlanTable = PlanTable::new();
    let mut executing_table: ExecutingTable = ExecutingTable::new();

    loop {
        let sleep_for = try_schedule(&mut plan_table, &mut executing_table, &locker, &result_tx);
        let timer = tokio::time::sleep(sleep_for);

        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => apply_event(&mut plan_table, event),
                    None => return, // all handles dropped; shut down
                }
            }
            kill = kill_rx.recv() => {
                match kill {
                    Some(signal) => apply_kill(&executing_table, &signal),
                    None => return,
                }
            }
            result = result_rx.recv() => {
                match result {
                    Some(result) => apply_result(&mut executing_table, &log_sink, result),
                    None => return,
                }
            }
            _ = timer => {}
        }
    }
}

fn apply_event(plan_table: &mut PlanTable, event: JobEvent) {
    match event {
        JobEvent::Save(job) => match CompiledCron::parse(&job.cron_expr) {
            Ok(expr) => match expr.next(Utc::now()) {
                Ok(next_time) => {
                    let name = job.name.clone();
                    plan_table.insert(name, JobPlan { job, expr, next_time });
                }
                Err(e) => {
                    tracing::error!(job_name = %job.name, error = %e, "no firing time found, dropping plan");
                }
            },
            Err(e) => {
                tracing::error!(job_name = %job.name, error = %e, "cron parse failed, event dropped");
            }
        },
        JobEvent::Delete { name } => {
            plan_table.remove(&name);
        }
    }
}

fn apply_kill(executing_table: &ExecutingTable, signal: &KillSignal) {
    if let Some(info) = executing_table.get(&signal.job_name) {
        info.cancel.cancel();
    }
}

fn apply_result(executing_table: &mut ExecutingTable, log_sink: &LogSink, result: ExecuteResult) {
    executing_table.remove(&result.job_name);

    let log = JobLog {
        job_name: result.job_name.clone(),
        command: result.command,
        err: result.outcome.err.clone(),
        output: result.outcome.output,
        plan_time: result.plan_time.timestamp_millis(),
        schedule_time: result.real_time.timestamp_millis(),
        start_time: result.outcome.start.timestamp_millis(),
        end_time: result.outcome.end.timestamp_millis(),
    };

    if log.is_success() {
        tracing::info!(job_name = %result.job_name, "job completed");
    } else {
        tracing::warn!(job_name = %result.job_name, err = %log.err, "job completed with error");
    }

    log_sink.append(log);
}

/// Fire every plan whose `next_time` has passed, advance it, and return how
/// long to sleep until the next firing (zero if idle with no plans).
fn try_schedule(
    plan_table: &mut PlanTable,
    executing_table: &mut ExecutingTable,
    locker: &Arc<dyn JobLocker>,
    result_tx: &mpsc::Sender<ExecuteResult>,
) -> Duration {
    if plan_table.is_empty() {
        return Duration::from_secs(1);
    }

    let now = Utc::now();
    let mut earliest: Option<DateTime<Utc>> = None;

    for (name, plan) in plan_table.iter_mut() {
        if plan.next_time <= now {
            try_start(name, plan, executing_table, locker, result_tx, now);
            match plan.expr.next(now) {
                Ok(next_time) => plan.next_time = next_time,
                Err(e) => {
                    tracing::error!(job_name = %name, error = %e, "failed to compute next firing, backing off");
                    plan.next_time = now + chrono::Duration::hours(1);
                }
            }
        }
        earliest = Some(match earliest {
            Some(e) => e.min(plan.next_time),
            None => plan.next_time,
        });
    }

    let earliest = earliest.unwrap_or(now + chrono::Duration::seconds(1));
    let remaining = earliest - now;
    remaining.to_std().unwrap_or(Duration::ZERO)
}

fn try_start(
    name: &str,
    plan: &JobPlan,
    executing_table: &mut ExecutingTable,
    locker: &Arc<dyn JobLocker>,
    result_tx: &mpsc::Sender<ExecuteResult>,
    now: DateTime<Utc>,
) {
    if executing_table.contains_key(name) {
        tracing::debug!(job_name = %name, "skipped: already running");
        return;
    }

    let cancel = CancellationToken::new();
    executing_table.insert(
        name.to_string(),
        ExecuteInfo {
            job: plan.job.clone(),
            plan_time: plan.next_time,
            real_time: now,
            cancel: cancel.clone(),
        },
    );

    let job = plan.job.clone();
    let plan_time = plan.next_time;
    let locker = locker.clone();
    let result_tx = result_tx.clone();

    tokio::spawn(async move {
        dispatch(job, plan_time, now, cancel, locker, result_tx).await;
    });
}

async fn dispatch(
    job: Job,
    plan_time: DateTime<Utc>,
    real_time: DateTime<Utc>,
    cancel: CancellationToken,
    locker: Arc<dyn JobLocker>,
    result_tx: mpsc::Sender<ExecuteResult>,
) {
    let outcome = match locker.try_lock(&job.name).await {
        Ok(guard) => {
            let request = ExecuteRequest {
                job_name: job.name.clone(),
                command: job.command.clone(),
            };
            let outcome = execute(request, cancel).await;
            if let Err(e) = guard.release().await {
                tracing::warn!(job_name = %job.name, error = %e, "lock release failed");
            }
            outcome
        }
        Err(e) => {
            let now = Utc::now();
            crontab_executor::ExecuteOutcome {
                output: String::new(),
                err: e.to_string(),
                start: now,
                end: now,
            }
        }
    };

    let result = ExecuteResult {
        job_name: job.name,
        command: job.command,
        plan_time,
        real_time,
        outcome,
    };

    if result_tx.send(result).await.is_err() {
        tracing::error!("scheduler result channel closed, dropping result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crontab_logsink::LogStore;
    use crontab_protocol::Job;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct AlwaysGrantsLocker;

    struct NoopGuard;

    #[async_trait]
    impl LockHandle for NoopGuard {
        async fn release(self: Box<Self>) -> crontab_core::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl JobLocker for AlwaysGrantsLocker {
        async fn try_lock(&self, _job_name: &str) -> crontab_core::Result<Box<dyn LockHandle>> {
            Ok(Box::new(NoopGuard))
        }
    }

    struct AlwaysDeniesLocker;

    #[async_trait]
    impl JobLocker for AlwaysDeniesLocker {
        async fn try_lock(&self, _job_name: &str) -> crontab_core::Result<Box<dyn LockHandle>> {
            Err(crontab_core::Error::LockAlreadyRequired)
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        logs: Mutex<Vec<JobLog>>,
    }

    #[async_trait]
    impl LogStore for RecordingStore {
        async fn insert_many(&self, batch: &[JobLog]) -> crontab_core::Result<()> {
            self.logs.lock().unwrap().extend(batch.iter().cloned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn save_then_firing_produces_a_successful_job_log() {
        let store = Arc::new(RecordingStore::default());
        let (log_sink, _sink_join) = LogSink::spawn(store.clone(), 1, Duration::from_millis(100), 100);
        let (handle, _join) = spawn(
            SchedulerConfig::default(),
            Arc::new(AlwaysGrantsLocker),
            log_sink,
        );

        let job = Job::new("hello", "echo hi", "* * * * * *");
        handle.push_job_event(JobEvent::save(job)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let logs = store.logs.lock().unwrap();
        assert!(!logs.is_empty(), "expected at least one committed log");
        let log = &logs[0];
        assert_eq!(log.job_name, "hello");
        assert_eq!(log.err, "");
        assert_eq!(log.output, "hi\n");
    }

    #[tokio::test]
    async fn lock_contention_is_recorded_as_a_failed_run() {
        let store = Arc::new(RecordingStore::default());
        let (log_sink, _sink_join) = LogSink::spawn(store.clone(), 1, Duration::from_millis(100), 100);
        let (handle, _join) = spawn(
            SchedulerConfig::default(),
            Arc::new(AlwaysDeniesLocker),
            log_sink,
        );

        let job = Job::new("contended", "echo hi", "* * * * * *");
        handle.push_job_event(JobEvent::save(job)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let logs = store.logs.lock().unwrap();
        assert!(!logs.is_empty());
        assert!(!logs[0].err.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_plan_and_no_further_firings_are_logged() {
        let store = Arc::new(RecordingStore::default());
        let (log_sink, _sink_join) = LogSink::spawn(store.clone(), 1, Duration::from_millis(100), 100);
        let (handle, _join) = spawn(
            SchedulerConfig::default(),
            Arc::new(AlwaysGrantsLocker),
            log_sink,
        );

        let job = Job::new("ephemeral", "true", "* * * * * *");
        handle.push_job_event(JobEvent::save(job)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        handle.push_job_event(JobEvent::delete("ephemeral")).await.unwrap();

        let count_before = store.logs.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(2_200)).await;
        let count_after = store.logs.lock().unwrap().len();

        assert_eq!(count_before, count_after, "no firings should be logged after delete");
    }

    #[test]
    fn try_schedule_returns_idle_poll_when_empty() {
        let mut plans = PlanTable::new();
        let mut executing = ExecutingTable::new();
        let locker: Arc<dyn JobLocker> = Arc::new(AlwaysGrantsLocker);
        let (tx, _rx) = mpsc::channel(10);
        let sleep_for = try_schedule(&mut plans, &mut executing, &locker, &tx);
        assert_eq!(sleep_for, Duration::from_secs(1));
    }

    #[test]
    fn try_start_skips_when_already_executing() {
        let executed_count = Arc::new(AtomicUsize::new(0));
        let _ = executed_count.clone();

        let job = Job::new("slow", "sleep 3", "* * * * * *");
        let mut executing = ExecutingTable::new();
        executing.insert(
            "slow".to_string(),
            ExecuteInfo {
                job: job.clone(),
                plan_time: Utc::now(),
                real_time: Utc::now(),
                cancel: CancellationToken::new(),
            },
        );

        let plan = JobPlan {
            job: job.clone(),
            expr: CompiledCron::parse("* * * * * *").unwrap(),
            next_time: Utc::now(),
        };
        let locker: Arc<dyn JobLocker> = Arc::new(AlwaysGrantsLocker);
        let (tx, _rx) = mpsc::channel(10);

        try_start("slow", &plan, &mut executing, &locker, &tx, Utc::now());

        // Still exactly one entry: the pre-existing one, not a second insertion.
        assert_eq!(executing.len(), 1);
    }
}
