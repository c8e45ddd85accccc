//! ABOUTME: Plan table and executing table types owned solely by the scheduler loop

use chrono::{DateTime, Utc};
use crontab_cron::CompiledCron;
use crontab_protocol::Job;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// A job's compiled schedule and its next firing instant.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job: Job,
    pub expr: CompiledCron,
    pub next_time: DateTime<Utc>,
}

/// Mapping from job name to its plan. Mutated solely by the scheduler loop.
pub type PlanTable = HashMap<String, JobPlan>;

/// Bookkeeping for one in-flight execution.
#[derive(Clone)]
pub struct ExecuteInfo {
    pub job: Job,
    pub plan_time: DateTime<Utc>,
    pub real_time: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// Mapping from job name to its in-flight execution.
///
/// Invariant: at most one entry per job name at any instant (local mutual
/// exclusion; fleet-wide exclusion is enforced by the distributed lock).
pub type ExecutingTable = HashMap<String, ExecuteInfo>;

/// Outcome of one firing, delivered back to the scheduler loop.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub job_name: String,
    pub command: String,
    pub plan_time: DateTime<Utc>,
    pub real_time: DateTime<Utc>,
    pub outcome: crontab_executor::ExecuteOutcome,
}
