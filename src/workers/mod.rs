//! Worker behaviours executed inside forked children.
//!
//! A job's `worker` field selects a constructor from the [`WorkerRegistry`];
//! the constructed [`Worker`] then runs to completion in the child process.
//!
//! ## Built-in worker types
//!
//! - **`exec`**: replaces the child image with `command` + `args`
//! - **`shell`**: runs `script` through `/bin/sh -c`
//! - **`sleep`**: sleeps `seconds`, then exits 0

mod exec;
mod sleep;

pub use exec::{ExecWorker, ShellWorker};
pub use sleep::SleepWorker;

use crate::config::JobConfig;
use crate::errors::SupervisorError;
use std::collections::BTreeMap;

/// Exit code used when the worker type cannot be resolved.
pub const EXIT_UNKNOWN_WORKER: i32 = 127;
/// Exit code used when the worker rejects its configuration (`EX_CONFIG`).
pub const EXIT_BAD_CONFIG: i32 = 78;
/// Exit code used when the worker itself fails.
pub const EXIT_WORKER_FAILED: i32 = 1;

/// The business logic of one job, run inside the child process.
pub trait Worker {
    /// Runs the job and returns the exit code for the child.
    fn run(&self) -> anyhow::Result<i32>;
}

/// Builds a worker from a job's config.
pub type WorkerConstructor = fn(&JobConfig) -> Result<Box<dyn Worker>, SupervisorError>;

/// Named worker constructors, resolved by the `worker` config field.
pub struct WorkerRegistry {
    constructors: BTreeMap<String, WorkerConstructor>,
}

impl WorkerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the `exec`, `shell` and `sleep` worker types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("exec", ExecWorker::from_config);
        registry.register("shell", ShellWorker::from_config);
        registry.register("sleep", SleepWorker::from_config);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: WorkerConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn build(&self, config: &JobConfig) -> Result<Box<dyn Worker>, SupervisorError> {
        let constructor = self
            .constructors
            .get(&config.worker)
            .ok_or_else(|| SupervisorError::UnknownWorker(config.worker.clone()))?;
        constructor(config)
    }

    /// Builds and runs the worker for `config`, mapping every failure to an exit code.
    pub fn run_to_exit_code(&self, config: &JobConfig) -> i32 {
        let worker = match self.build(config) {
            Ok(worker) => worker,
            Err(e @ SupervisorError::UnknownWorker(_)) => {
                tracing::error!(error = %e, "cannot start worker");
                return EXIT_UNKNOWN_WORKER;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot start worker");
                return EXIT_BAD_CONFIG;
            }
        };
        match worker.run() {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(error = %e, "worker failed");
                EXIT_WORKER_FAILED
            }
        }
    }
}

/// Reads a required string field from a job config.
fn required_str<'a>(config: &'a JobConfig, key: &str) -> Result<&'a str, SupervisorError> {
    config
        .field_str(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SupervisorError::InvalidWorkerConfig {
            worker: config.worker.clone(),
            message: format!("requires a non-empty '{}' field", key),
        })
}
