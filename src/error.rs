use thiserror::Error;

use crate::scheduler::JobId;

/// Errors raised by the process runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process is still running")]
    StillRunning,

    #[error("Process output was already collected")]
    OutputCollected,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    #[error("Failed to launch job {id}: {source}")]
    Launch {
        id: JobId,
        #[source]
        source: RunnerError,
    },

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while rendering a command line from a sweep configuration.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("No job template named \"{0}\"")]
    UnknownJob(String),

    #[error("Token \"{token}\" is mapped from basics \"{from}\", which is not set")]
    MissingMappingSource { token: String, from: String },

    #[error("Token \"{token}\" has no mapping for value \"{value}\"")]
    UnmappedValue { token: String, value: String },

    #[error("Value for \"{token}\" must be a number or a string")]
    UnsupportedValue { token: String },

    #[error("Cannot substitute pop in \"{0}\"")]
    MissingPopulation(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GrammarError {
    #[error("Unclosed field starting at offset {0}")]
    UnclosedField(usize),

    #[error("Empty field name at offset {0}")]
    EmptyField(usize),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Window size must be odd, got {0}")]
    EvenWindow(usize),

    #[error("Window size {window} does not fit a series of length {len}")]
    WindowTooLarge { window: usize, len: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by the driver while running a batch or a sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Job {id} failed with exit code {code:?}")]
    JobFailed { id: JobId, code: Option<i32> },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Output grammar of job \"{job}\" has no \"{field}\" field, which sweeps require")]
    MissingField { job: String, field: String },

    #[error("Join task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
