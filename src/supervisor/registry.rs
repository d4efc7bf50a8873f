//! Job registry: the authoritative in-memory table of supervised jobs.
//!
//! Jobs are keyed by id, with a secondary index from OS pid to job id. The
//! registry also owns the three work queues (`start`, `stop`, `restart`) that
//! the supervisor loop drains every cycle, and the set of jobs that have been
//! sent a termination signal.
//!
//! Invariant: a pid is in the index iff exactly one job holds it in
//! `state.pid`. Only [`WorkerMetadata::update_started_job`] adds to the index
//! and only [`WorkerMetadata::schedule_restart_by_pid`] removes from it.

use super::backoff::{BackoffPolicy, DEFAULT_BACKOFF_SECS};
use super::clock::Clock;
use crate::config::{JobConfig, JobId};
use crate::errors::SupervisorError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Result of the last reconciliation pass for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DbState {
    Unchanged,
    Added,
    Removed,
    Updated,
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbState::Unchanged => write!(f, "UNCHANGED"),
            DbState::Added => write!(f, "ADDED"),
            DbState::Removed => write!(f, "REMOVED"),
            DbState::Updated => write!(f, "UPDATED"),
        }
    }
}

/// Runtime state of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    /// Pid of the running instance, if any.
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    /// The job may be (re)started at or after this time.
    pub restart_at: DateTime<Utc>,
    /// Seconds to wait after the next short-lived run.
    pub backoff_interval: u64,
    pub db_state: DbState,
    pub last_exit_code: Option<i32>,
}

/// One supervised unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub config: JobConfig,
    pub state: JobState,
}

/// A job that has been sent SIGTERM and not yet reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopMark {
    pub since: DateTime<Utc>,
    /// Last SIGKILL escalation, if any.
    pub last_kill: Option<DateTime<Utc>>,
}

/// Job ids awaiting an action in the current cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkQueues {
    pub start: BTreeSet<JobId>,
    pub stop: BTreeSet<JobId>,
    pub restart: BTreeSet<JobId>,
}

/// Serializable view of one job for the control protocol.
#[derive(Debug, Serialize)]
pub struct JobStatus<'a> {
    pub id: JobId,
    pub config: &'a JobConfig,
    pub state: &'a JobState,
    pub stopping_since: Option<DateTime<Utc>>,
}

pub struct WorkerMetadata {
    jobs: BTreeMap<JobId, Job>,
    pids: HashMap<i32, JobId>,
    stopping: BTreeMap<JobId, StopMark>,
    queues: WorkQueues,
    /// Running jobs whose next exit was requested by the operator.
    operator_restarts: BTreeSet<JobId>,
    backoff: BackoffPolicy,
    clock: Box<dyn Clock>,
}

impl WorkerMetadata {
    pub fn new(backoff: BackoffPolicy, clock: Box<dyn Clock>) -> Self {
        Self {
            jobs: BTreeMap::new(),
            pids: HashMap::new(),
            stopping: BTreeMap::new(),
            queues: WorkQueues::default(),
            operator_restarts: BTreeSet::new(),
            backoff,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job_for_pid(&self, pid: i32) -> Option<JobId> {
        self.pids.get(&pid).copied()
    }

    /// Jobs that currently hold a pid.
    pub fn running_jobs(&self) -> Vec<(JobId, i32)> {
        self.jobs
            .values()
            .filter_map(|job| job.state.pid.map(|pid| (job.id, pid)))
            .collect()
    }

    pub fn queues(&self) -> &WorkQueues {
        &self.queues
    }

    /// Inserts a job, or overwrites its config if already known.
    ///
    /// Runtime state (pid, start time, exit code) of an existing job is kept.
    pub fn add_new_job(&mut self, id: JobId, config: JobConfig) {
        let now = self.now();
        match self.jobs.get_mut(&id) {
            Some(job) => {
                job.config = config;
                job.state.backoff_interval = DEFAULT_BACKOFF_SECS;
                job.state.db_state = DbState::Added;
            }
            None => {
                self.jobs.insert(
                    id,
                    Job {
                        id,
                        config,
                        state: JobState {
                            pid: None,
                            started_at: None,
                            restart_at: now,
                            backoff_interval: DEFAULT_BACKOFF_SECS,
                            db_state: DbState::Added,
                            last_exit_code: None,
                        },
                    },
                );
            }
        }
        info!(job_id = id, "job added");
    }

    pub fn update_job(&mut self, id: JobId, config: JobConfig) -> Result<(), SupervisorError> {
        let now = self.now();
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(SupervisorError::UnknownJob(id))?;
        job.config = config;
        job.state.db_state = DbState::Updated;
        job.state.restart_at = now;
        job.state.backoff_interval = DEFAULT_BACKOFF_SECS;
        info!(job_id = id, mtime = job.config.mtime, "job updated");
        Ok(())
    }

    pub fn remove_job(&mut self, id: JobId) -> Result<(), SupervisorError> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(SupervisorError::UnknownJob(id))?;
        if job.state.db_state != DbState::Removed {
            info!(job_id = id, pid = ?job.state.pid, "job removed");
        }
        job.state.db_state = DbState::Removed;
        Ok(())
    }

    pub fn mark_as_unchanged(&mut self, id: JobId) -> Result<(), SupervisorError> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(SupervisorError::UnknownJob(id))?;
        job.state.db_state = DbState::Unchanged;
        Ok(())
    }

    /// Deletes every removed job that is no longer running.
    ///
    /// Returns the purged ids.
    pub fn purge_removed_jobs(&mut self) -> Vec<JobId> {
        let mut purged = Vec::new();
        for job in self.jobs.values() {
            if job.state.db_state != DbState::Removed {
                continue;
            }
            match job.state.pid {
                Some(pid) => debug!(job_id = job.id, pid, "removed job still running, not purging"),
                None => purged.push(job.id),
            }
        }
        for id in &purged {
            self.jobs.remove(id);
            self.stopping.remove(id);
            self.queues.start.remove(id);
            self.queues.stop.remove(id);
            self.queues.restart.remove(id);
            self.operator_restarts.remove(id);
            info!(job_id = id, "job purged");
        }
        purged
    }

    /// Records a successful fork of `id` as `pid`.
    ///
    /// An `Updated` job settles to `Unchanged` once its new process is up.
    pub fn update_started_job(&mut self, id: JobId, pid: i32) -> Result<(), SupervisorError> {
        let now = self.now();
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(SupervisorError::UnknownJob(id))?;
        if let Some(old_pid) = job.state.pid.replace(pid) {
            warn!(job_id = id, old_pid, pid, "job started while still holding a pid");
            self.pids.remove(&old_pid);
        }
        job.state.started_at = Some(now);
        // The new process runs the updated config; nothing left to restart.
        if job.state.db_state == DbState::Updated {
            job.state.db_state = DbState::Unchanged;
        }
        if let Some(previous) = self.pids.insert(pid, id) {
            if previous != id {
                warn!(pid, previous_job = previous, job_id = id, "pid reassigned");
                if let Some(stale) = self.jobs.get_mut(&previous) {
                    stale.state.pid = None;
                }
            }
        }
        info!(job_id = id, pid, "job started");
        Ok(())
    }

    /// Applies the backoff policy to decide when `id` may start again.
    ///
    /// An exit the operator asked for restarts right away with the backoff
    /// interval untouched. No-op for unknown and removed jobs.
    pub fn schedule_restart(&mut self, id: JobId) {
        let now = self.now();
        let Some(job) = self.jobs.get_mut(&id) else {
            warn!(job_id = id, "cannot schedule restart for unknown job");
            return;
        };
        let requested = self.operator_restarts.remove(&id);
        if job.state.db_state == DbState::Removed {
            warn!(job_id = id, "not scheduling restart for removed job");
            return;
        }
        if requested {
            job.state.restart_at = now;
            info!(job_id = id, "operator restart, skipping backoff");
            return;
        }
        let next = self
            .backoff
            .next_restart(now, job.state.started_at, job.state.backoff_interval);
        job.state.restart_at = next.restart_at;
        job.state.backoff_interval = next.backoff_interval;
        info!(
            job_id = id,
            restart_at = %next.restart_at,
            backoff_interval = next.backoff_interval,
            "restart scheduled"
        );
    }

    /// Schedules the restart of whichever job owned `pid` and marks it not running.
    ///
    /// Returns the owning job id, if any.
    pub fn schedule_restart_by_pid(&mut self, pid: i32) -> Option<JobId> {
        let Some(id) = self.job_for_pid(pid) else {
            debug!(pid, "exited pid does not belong to any job");
            return None;
        };
        self.schedule_restart(id);
        self.pids.remove(&pid);
        if let Some(job) = self.jobs.get_mut(&id) {
            if job.state.pid == Some(pid) {
                job.state.pid = None;
            }
        }
        Some(id)
    }

    /// Records the exit status of `pid` on its owning job.
    pub fn record_exit(&mut self, pid: i32, exit_code: i32) {
        let Some(id) = self.job_for_pid(pid) else {
            return;
        };
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state.last_exit_code = Some(exit_code);
            info!(job_id = id, pid, exit_code, "job exited");
        }
    }

    /// Operator-requested restart that bypasses the backoff delay.
    ///
    /// A running job is queued for restart; a stopped one becomes eligible to
    /// start immediately.
    pub fn schedule_immediate_restart(&mut self, id: JobId) -> Result<(), SupervisorError> {
        let now = self.now();
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(SupervisorError::UnknownJob(id))?;
        if job.state.pid.is_some() {
            self.queues.restart.insert(id);
            self.operator_restarts.insert(id);
        } else {
            job.state.restart_at = now;
        }
        info!(job_id = id, "immediate restart requested");
        Ok(())
    }

    pub fn mark_as_stopping(&mut self, id: JobId) {
        let since = self.now();
        self.stopping.insert(
            id,
            StopMark {
                since,
                last_kill: None,
            },
        );
    }

    #[cfg(test)]
    pub fn is_stopping(&self, id: JobId) -> bool {
        self.stopping.contains_key(&id)
    }

    pub fn stopping(&self) -> &BTreeMap<JobId, StopMark> {
        &self.stopping
    }

    pub fn record_kill(&mut self, id: JobId) {
        let now = self.now();
        if let Some(mark) = self.stopping.get_mut(&id) {
            mark.last_kill = Some(now);
        }
    }

    pub fn clear_stopping(&mut self, id: JobId) {
        self.stopping.remove(&id);
    }

    /// Fills the work queues from each job's `db_state` and runtime state.
    ///
    /// Idempotent within a cycle: jobs already stopping are not queued for
    /// stop/restart again, and only non-running jobs past their restart time
    /// are queued for start.
    pub fn update_state_sync_map(&mut self) {
        let now = self.now();
        for job in self.jobs.values() {
            let id = job.id;
            let stopping = self.stopping.contains_key(&id);
            let running = job.state.pid.is_some();
            let startable = !running && !stopping && job.state.restart_at <= now;

            match job.state.db_state {
                DbState::Unchanged => {
                    if startable {
                        debug!(job_id = id, "restart time elapsed");
                        self.queues.start.insert(id);
                    }
                }
                DbState::Removed => {
                    if running && !stopping {
                        self.queues.stop.insert(id);
                    }
                }
                DbState::Added => {
                    if startable {
                        self.queues.start.insert(id);
                    }
                }
                DbState::Updated => {
                    if running {
                        if !stopping {
                            self.queues.restart.insert(id);
                        }
                    } else if startable {
                        self.queues.start.insert(id);
                    }
                }
            }
        }
    }

    pub fn take_restart_queue(&mut self) -> Vec<JobId> {
        std::mem::take(&mut self.queues.restart).into_iter().collect()
    }

    pub fn take_stop_queue(&mut self) -> Vec<JobId> {
        std::mem::take(&mut self.queues.stop).into_iter().collect()
    }

    pub fn take_start_queue(&mut self) -> Vec<JobId> {
        std::mem::take(&mut self.queues.start).into_iter().collect()
    }

    pub fn snapshot(&self) -> Vec<JobStatus<'_>> {
        self.jobs
            .values()
            .map(|job| JobStatus {
                id: job.id,
                config: &job.config,
                state: &job.state,
                stopping_since: self.stopping.get(&job.id).map(|mark| mark.since),
            })
            .collect()
    }

    /// Checks the pid index against every job's `state.pid`.
    #[cfg(test)]
    pub fn pid_index_consistent(&self) -> bool {
        let held: usize = self.jobs.values().filter(|j| j.state.pid.is_some()).count();
        held == self.pids.len()
            && self
                .pids
                .iter()
                .all(|(pid, id)| self.jobs.get(id).and_then(|j| j.state.pid) == Some(*pid))
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
