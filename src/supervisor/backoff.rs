//! Restart delay policy for exited workers.
//!
//! A run shorter than `min_run_secs` doubles the delay before the next start;
//! a run at least that long resets it to [`DEFAULT_BACKOFF_SECS`].

use chrono::{DateTime, TimeDelta, Utc};

/// Initial and reset value of a job's backoff interval, in seconds.
pub const DEFAULT_BACKOFF_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Runs at least this long count as healthy.
    pub min_run_secs: u64,
    /// Upper bound on the backoff interval.
    pub max_interval_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_run_secs: 5,
            max_interval_secs: 300,
        }
    }
}

/// When to start a job next, and the interval to carry forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSchedule {
    pub restart_at: DateTime<Utc>,
    pub backoff_interval: u64,
}

impl BackoffPolicy {
    pub fn new(min_run_secs: u64, max_interval_secs: u64) -> Self {
        Self {
            min_run_secs,
            max_interval_secs: max_interval_secs.max(DEFAULT_BACKOFF_SECS),
        }
    }

    /// Computes the next restart for a run that started at `started_at` and ended at `now`.
    ///
    /// A job with no recorded start is treated as a short run.
    pub fn next_restart(
        &self,
        now: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        backoff_interval: u64,
    ) -> RestartSchedule {
        if self.ran_long_enough(now, started_at) {
            return RestartSchedule {
                restart_at: now,
                backoff_interval: DEFAULT_BACKOFF_SECS,
            };
        }

        let delay = backoff_interval.clamp(DEFAULT_BACKOFF_SECS, self.max_interval_secs);
        RestartSchedule {
            restart_at: add_secs(now, delay),
            backoff_interval: delay.saturating_mul(2).min(self.max_interval_secs),
        }
    }

    fn ran_long_enough(&self, now: DateTime<Utc>, started_at: Option<DateTime<Utc>>) -> bool {
        let Some(started_at) = started_at else {
            return false;
        };
        let min_run_ms = i64::try_from(self.min_run_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        (now - started_at).num_milliseconds() >= min_run_ms
    }
}

fn add_secs(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
