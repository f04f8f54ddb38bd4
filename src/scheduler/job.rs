use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a live job. Unique among tracked jobs, reused once a job
/// completes successfully and is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Admission priority. Lower keys are admitted first and `Unset` sorts after
/// every key; the ordering is the derived variant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Key(i64),
    #[default]
    Unset,
}

impl From<i64> for Priority {
    fn from(key: i64) -> Self {
        Priority::Key(key)
    }
}

impl From<Option<i64>> for Priority {
    fn from(key: Option<i64>) -> Self {
        key.map_or(Priority::Unset, Priority::Key)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Key(key) => write!(f, "{}", key),
            Priority::Unset => write!(f, "-"),
        }
    }
}

/// Everything needed to launch one job, captured at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub priority: Priority,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            priority: Priority::Unset,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, envs: BTreeMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }
}

/// Status of a job still tracked by the registry.
///
/// Successful jobs are released on completion and so have no status here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of a tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub command: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Terminal result of a job as seen by a completion observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobOutcome<T> {
    Succeeded(T),
    /// Non-zero exit, death by signal (`code: None`) or launch failure.
    Failed { code: Option<i32> },
}

impl<T> JobOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> JobOutcome<U> {
        match self {
            JobOutcome::Succeeded(value) => JobOutcome::Succeeded(f(value)),
            JobOutcome::Failed { code } => JobOutcome::Failed { code },
        }
    }
}

/// Answer of a non-blocking `inquire`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inquiry {
    NotReady,
    Completed(JobOutcome<String>),
}

impl Inquiry {
    pub fn is_ready(&self) -> bool {
        matches!(self, Inquiry::Completed(_))
    }
}
