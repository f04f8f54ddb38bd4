use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, SchedulerError};

/// What the driver does when a job exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the whole run on the first failed job.
    #[default]
    Abort,
    /// Log the failure and keep going.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub num_workers: usize,
    /// How often the driver calls `schedule`.
    pub schedule_interval_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_workers(),
            schedule_interval_ms: 100,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.num_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.schedule_interval_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "schedule_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Host parallelism minus one, never below one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Configuration tree describing the programs a sweep can run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Shared values, looked up by token name or through mappings.
    #[serde(default)]
    pub basics: BTreeMap<String, Value>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobTemplate>,
}

impl SweepConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Executable, relative to the job's working directory.
    pub bin: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    pub io: IoSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSpec {
    /// Argument template, e.g. `-n pop -s seed [verbose]`.
    pub argv: String,
    #[serde(default)]
    pub mappings: Vec<ValueMapping>,
    #[serde(default)]
    pub fixed_fields: BTreeMap<String, Value>,
    /// Environment variables; a value naming a keyword override is
    /// replaced by that override.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Output grammar, e.g. `{gen} {nfe}`.
    pub stdout: String,
}

/// Translates a basics value into an argv value: token `to` becomes
/// `map[basics[from]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueMapping {
    pub from: String,
    pub to: String,
    pub map: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.num_workers >= 1);
        assert_eq!(cfg.schedule_interval_ms, 100);
        assert_eq!(cfg.failure_policy, FailurePolicy::Abort);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = SchedulerConfig::with_workers(0);
        assert!(matches!(cfg.validate(), Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn zero_interval_rejected() {
        let cfg = SchedulerConfig {
            schedule_interval_ms: 0,
            ..SchedulerConfig::with_workers(2)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn failure_policy_serde() {
        let policy: FailurePolicy = serde_json::from_str("\"continue\"").unwrap();
        assert_eq!(policy, FailurePolicy::Continue);
        assert_eq!(serde_json::to_string(&FailurePolicy::Abort).unwrap(), "\"abort\"");
    }

    #[test]
    fn sweep_config_from_json() {
        let cfg = SweepConfig::from_json(
            r#"{
                "basics": { "problem": "onemax", "ell": 100 },
                "jobs": {
                    "dsmga2": {
                        "bin": "DSMGA2",
                        "io": {
                            "argv": "ell pop fn [verbose] seed",
                            "mappings": [
                                { "from": "problem", "to": "fn", "map": { "onemax": 0, "trap": 1 } }
                            ],
                            "fixed_fields": { "verbose": 0 },
                            "envs": { "OMP_NUM_THREADS": "threads" },
                            "stdout": "{gen} {nfe}"
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.basics["ell"], Value::from(100));
        let job = &cfg.jobs["dsmga2"];
        assert_eq!(job.bin, "DSMGA2");
        assert!(job.cwd.is_none());
        assert_eq!(job.io.mappings.len(), 1);
        assert_eq!(job.io.mappings[0].to, "fn");
        assert_eq!(job.io.envs["OMP_NUM_THREADS"], "threads");
    }

    #[test]
    fn sweep_config_rejects_bad_json() {
        assert!(matches!(
            SweepConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
