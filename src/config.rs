use crate::errors::SupervisorError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Stable identifier of a logical job slot.
pub type JobId = u64;

/// One configuration snapshot: every job the source currently defines.
pub type ConfigSnapshot = BTreeMap<JobId, JobConfig>;

/// Operator-supplied definition of a job.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobConfig {
    /// Worker type selector, resolved through the worker registry in the child.
    pub worker: String,
    /// Modification timestamp; a newer value marks the job as updated.
    pub mtime: i64,
    /// Remaining worker-specific fields, kept verbatim.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl JobConfig {
    #[cfg(test)]
    pub fn new(worker: &str, mtime: i64) -> Self {
        Self {
            worker: worker.to_string(),
            mtime,
            fields: serde_json::Map::new(),
        }
    }

    /// Adds a worker-specific field.
    #[cfg(test)]
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn validate(&self, job_id: JobId) -> Result<(), SupervisorError> {
        if self.worker.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig {
                job_id,
                message: "worker must not be empty".to_string(),
            });
        }
        if self.mtime < 0 {
            return Err(SupervisorError::InvalidConfig {
                job_id,
                message: format!("mtime must not be negative (got {})", self.mtime),
            });
        }
        Ok(())
    }
}

/// Where job definitions come from.
///
/// A failed load skips the whole reconciliation pass for that cycle.
pub trait ConfigSource {
    fn load_configuration(&mut self) -> Result<ConfigSnapshot>;
}

#[derive(Debug, Deserialize)]
struct RawConfigFile {
    /// Keys stay raw: JSON files can only spell job ids as strings.
    jobs: serde_yaml::Mapping,
}

/// Reads a job id from an integer or a numeric string key.
fn parse_job_id(key: &serde_yaml::Value) -> Option<JobId> {
    match key {
        serde_yaml::Value::Number(n) => n.as_u64(),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads job definitions from a YAML (or JSON) file on every poll.
pub struct YamlFileSource {
    path: PathBuf,
    worker_types: Option<Vec<String>>,
}

impl YamlFileSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            worker_types: None,
        }
    }

    /// Restricts accepted entries to the given worker types.
    pub fn with_worker_types(mut self, names: Vec<String>) -> Self {
        self.worker_types = Some(names);
        self
    }

    /// Parses file content into a snapshot, dropping entries that fail validation.
    pub fn parse(&self, content: &str) -> Result<ConfigSnapshot> {
        let raw: RawConfigFile = serde_yaml::from_str(content)
            .with_context(|| format!("Failed to parse job file: {}", self.path.display()))?;

        let mut snapshot = ConfigSnapshot::new();
        for (key, value) in raw.jobs {
            let Some(job_id) = parse_job_id(&key) else {
                warn!(key = ?key, "dropping job entry with a non-numeric id");
                continue;
            };
            match self.decode_entry(job_id, value) {
                Ok(config) => {
                    if snapshot.insert(job_id, config).is_some() {
                        warn!(job_id, "job id defined twice, keeping the last entry");
                    }
                }
                Err(e) => warn!(job_id, error = %e, "dropping invalid job entry"),
            }
        }
        Ok(snapshot)
    }

    fn decode_entry(
        &self,
        job_id: JobId,
        value: serde_yaml::Value,
    ) -> Result<JobConfig, SupervisorError> {
        let config: JobConfig =
            serde_yaml::from_value(value).map_err(|e| SupervisorError::InvalidConfig {
                job_id,
                message: e.to_string(),
            })?;
        config.validate(job_id)?;
        if let Some(known) = &self.worker_types {
            if !known.iter().any(|name| name == &config.worker) {
                return Err(SupervisorError::UnknownWorker(config.worker));
            }
        }
        Ok(config)
    }
}

impl ConfigSource for YamlFileSource {
    fn load_configuration(&mut self) -> Result<ConfigSnapshot> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read job file: {}", self.path.display()))?;
        let snapshot = self.parse(&content)?;
        debug!(path = %self.path.display(), jobs = snapshot.len(), "loaded job file");
        Ok(snapshot)
    }
}

const DEFAULT_CONFIG_POLL_SECS: u64 = 30;
const DEFAULT_PROCESS_POLL_SECS: u64 = 1;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MIN_RUN_SECS: u64 = 5;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Timing knobs of the supervisor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub config_poll_interval: Duration,
    pub process_poll_interval: Duration,
    pub stop_timeout: Duration,
    /// Runs at least this long reset the backoff.
    pub min_run_duration: Duration,
    pub max_backoff: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            config_poll_interval: Duration::from_secs(DEFAULT_CONFIG_POLL_SECS),
            process_poll_interval: Duration::from_secs(DEFAULT_PROCESS_POLL_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            min_run_duration: Duration::from_secs(DEFAULT_MIN_RUN_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }
}

impl SupervisorSettings {
    /// Defaults, overridden by `LRPM_*_SECS` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_poll_interval: env_secs("LRPM_CONFIG_POLL_SECS")
                .unwrap_or(defaults.config_poll_interval),
            process_poll_interval: env_secs("LRPM_PROCESS_POLL_SECS")
                .unwrap_or(defaults.process_poll_interval),
            stop_timeout: env_secs("LRPM_STOP_TIMEOUT_SECS").unwrap_or(defaults.stop_timeout),
            min_run_duration: env_secs("LRPM_MIN_RUN_SECS").unwrap_or(defaults.min_run_duration),
            max_backoff: env_secs("LRPM_MAX_BACKOFF_SECS").unwrap_or(defaults.max_backoff),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!(variable = name, value = %raw, "ignoring invalid duration override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
