use super::Worker;
use crate::config::JobConfig;
use crate::errors::SupervisorError;
use std::time::Duration;

/// Sleeps for `seconds` and exits with `exit_code` (default 0).
#[derive(Debug, Clone, PartialEq)]
pub struct SleepWorker {
    pub duration: Duration,
    pub exit_code: i32,
}

impl SleepWorker {
    pub fn from_config(config: &JobConfig) -> Result<Box<dyn Worker>, SupervisorError> {
        let duration = config
            .fields
            .get("seconds")
            .and_then(|v| v.as_f64())
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .ok_or_else(|| SupervisorError::InvalidWorkerConfig {
                worker: config.worker.clone(),
                message: "requires a non-negative, representable 'seconds' field".to_string(),
            })?;
        let exit_code = config
            .fields
            .get("exit_code")
            .and_then(|v| v.as_i64())
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(0);
        Ok(Box::new(Self {
            duration,
            exit_code,
        }))
    }
}

impl Worker for SleepWorker {
    fn run(&self) -> anyhow::Result<i32> {
        std::thread::sleep(self.duration);
        Ok(self.exit_code)
    }
}
