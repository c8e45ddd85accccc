//! ABOUTME: Shared wire types and registry key-layout constants
//! ABOUTME: Job catalog records, change events, persisted log records, and the admin response envelope

use serde::{Deserialize, Serialize};

/// Catalog key prefix: one key per job, value is `Job` as JSON. Key suffix is the job name.
pub const JOB_SAVE_DIR: &str = "/cron/jobs/";

/// Per-job distributed lock key prefix. Value is empty; lifetime bound to a lease.
pub const JOB_LOCK_DIR: &str = "/cron/locks/";

/// Per-job kill signal key prefix. Key suffix is the job name; value is irrelevant.
pub const JOB_KILLER_DIR: &str = "/cron/killer/";

/// A scheduled job as stored in the catalog.
///
/// Name is the unique catalog key; command is a shell string passed to `/bin/sh -c`;
/// cron_expr is a 6-field extended expression (see [`crontab_cron`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub command: String,
    #[serde(rename = "cronExpr")]
    pub cron_expr: String,
}

impl Job {
    pub fn new(name: impl Into<String>, command: impl Into<String>, cron_expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// Decode a `Job` from its catalog value bytes.
    pub fn decode(value: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(value)
    }

    /// Encode this job as its catalog value bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The full catalog key for this job.
    pub fn catalog_key(&self) -> String {
        format!("{}{}", JOB_SAVE_DIR, self.name)
    }
}

/// Extract a job name from a full catalog key by stripping the fixed prefix.
pub fn extract_job_name(job_key: &str) -> String {
    job_key.strip_prefix(JOB_SAVE_DIR).unwrap_or(job_key).to_string()
}

/// Extract a job name from a full kill-signal key by stripping the fixed prefix.
pub fn extract_kill_name(kill_key: &str) -> String {
    kill_key.strip_prefix(JOB_KILLER_DIR).unwrap_or(kill_key).to_string()
}

/// A catalog change observed by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Save(Job),
    Delete { name: String },
}

impl JobEvent {
    pub fn save(job: Job) -> Self {
        JobEvent::Save(job)
    }

    pub fn delete(name: impl Into<String>) -> Self {
        JobEvent::Delete { name: name.into() }
    }

    pub fn job_name(&self) -> &str {
        match self {
            JobEvent::Save(job) => &job.name,
            JobEvent::Delete { name } => name,
        }
    }
}

/// A persisted record of one job execution.
///
/// All timestamps are integer milliseconds since epoch, matching the reference
/// document-store schema. `err` is the empty string on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    #[serde(rename = "jobName")]
    pub job_name: String,
    pub command: String,
    pub err: String,
    pub output: String,
    #[serde(rename = "planTime")]
    pub plan_time: i64,
    #[serde(rename = "scheduleTime")]
    pub schedule_time: i64,
    #[serde(rename = "startTime")]
    pub start_time: i64,
    #[serde(rename = "endTime")]
    pub end_time: i64,
}

impl JobLog {
    pub fn is_success(&self) -> bool {
        self.err.is_empty()
    }
}

/// HTTP admin response envelope: `{errno, msg, data}`, `errno == 0` for success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub errno: i32,
    pub msg: String,
    pub data: serde_json::Value,
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            errno: 0,
            msg: String::new(),
            data,
        }
    }

    pub fn error(errno: i32, msg: impl Into<String>) -> Self {
        Self {
            errno,
            msg: msg.into(),
            data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::new("hello", "echo hi", "*/1 * * * * *");
        let encoded = job.encode().unwrap();
        let decoded = Job::decode(&encoded).unwrap();
        assert_eq!(job, decoded);
    }

    #[test]
    fn catalog_key_uses_fixed_prefix() {
        let job = Job::new("hello", "echo hi", "*/1 * * * * *");
        assert_eq!(job.catalog_key(), "/cron/jobs/hello");
    }

    #[test]
    fn extract_job_name_strips_prefix() {
        assert_eq!(extract_job_name("/cron/jobs/hello"), "hello");
        assert_eq!(extract_kill_name("/cron/killer/long"), "long");
    }

    #[test]
    fn job_event_exposes_job_name_for_both_variants() {
        let save = JobEvent::save(Job::new("a", "true", "* * * * * *"));
        let delete = JobEvent::delete("b");
        assert_eq!(save.job_name(), "a");
        assert_eq!(delete.job_name(), "b");
    }

    #[test]
    fn response_ok_has_zero_errno() {
        let resp = Response::ok(serde_json::json!({"name": "hello"}));
        assert_eq!(resp.errno, 0);
        assert!(resp.msg.is_empty());
    }

    #[test]
    fn job_log_success_is_determined_by_empty_err() {
        let log = JobLog {
            job_name: "hello".to_string(),
            command: "echo hi".to_string(),
            err: String::new(),
            output: "hi\n".to_string(),
            plan_time: 0,
            schedule_time: 0,
            start_time: 0,
            end_time: 1,
        };
        assert!(log.is_success());
    }
}
