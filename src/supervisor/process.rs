//! Process controller: fork workers, signal them, and reap exited children.
//!
//! All OS interaction goes through [`ProcessBackend`], so the bookkeeping
//! here can be exercised without forking.

use super::registry::WorkerMetadata;
use super::signals;
use crate::config::{JobConfig, JobId};
use crate::workers::{WorkerRegistry, EXIT_WORKER_FAILED};
use anyhow::{Context, Result};
use chrono::TimeDelta;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exit status of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: i32,
    /// Exit code, or `128 + signo` for a child killed by a signal.
    pub code: i32,
}

/// OS-level process operations.
pub trait ProcessBackend {
    /// Starts a worker for `config` and returns its pid.
    fn spawn(&mut self, id: JobId, config: &JobConfig) -> Result<i32>;
    fn signal(&mut self, pid: i32, signal: Signal) -> Result<()>;
    /// Collects every child that has exited, without blocking.
    fn reap(&mut self) -> Vec<ChildExit>;
}

/// Forks real child processes and runs workers in them.
pub struct OsBackend {
    workers: WorkerRegistry,
}

impl OsBackend {
    pub fn new(workers: WorkerRegistry) -> Self {
        Self { workers }
    }

    fn run_child(&self, id: JobId, config: &JobConfig) -> ! {
        signals::reset_in_child();
        debug!(job_id = id, worker = %config.worker, "child running worker");
        // A panic must not unwind into the forked copy of the supervisor loop.
        let run = AssertUnwindSafe(|| self.workers.run_to_exit_code(config));
        let code = panic::catch_unwind(run).unwrap_or_else(|_| {
            error!(job_id = id, "worker panicked");
            EXIT_WORKER_FAILED
        });
        // SAFETY: `_exit` ends the child without running destructors, so the
        // parent's control socket, pid and lock files are left alone.
        unsafe { nix::libc::_exit(code) }
    }
}

impl ProcessBackend for OsBackend {
    fn spawn(&mut self, id: JobId, config: &JobConfig) -> Result<i32> {
        // SAFETY: the supervisor is single-threaded, and the child never
        // returns into the supervisor loop.
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Parent { child } => Ok(child.as_raw()),
            ForkResult::Child => self.run_child(id, config),
        }
    }

    fn signal(&mut self, pid: i32, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(pid), signal)
            .with_context(|| format!("Failed to send {} to pid {}", signal, pid))
    }

    fn reap(&mut self) -> Vec<ChildExit> {
        let mut exits = Vec::new();
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => exits.push(ChildExit {
                    pid: pid.as_raw(),
                    code,
                }),
                Ok(WaitStatus::Signaled(pid, signal, _)) => exits.push(ChildExit {
                    pid: pid.as_raw(),
                    code: 128 + signal as i32,
                }),
                Ok(WaitStatus::StillAlive) => break,
                Ok(other) => debug!(status = ?other, "ignoring non-exit wait status"),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        exits
    }
}

/// Issues start/stop/kill actions and applies their outcome to the registry.
pub struct ProcessController<B: ProcessBackend> {
    backend: B,
    stop_timeout: TimeDelta,
}

impl<B: ProcessBackend> ProcessController<B> {
    pub fn new(backend: B, stop_timeout: Duration) -> Self {
        Self {
            backend,
            stop_timeout: TimeDelta::from_std(stop_timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Forks a worker for `id`. A failed fork leaves the job unstarted, so the
    /// next sync pass queues it again.
    pub fn start(&mut self, registry: &mut WorkerMetadata, id: JobId) {
        let Some(job) = registry.job(id) else {
            warn!(job_id = id, "cannot start unknown job");
            return;
        };
        if let Some(pid) = job.state.pid {
            warn!(job_id = id, pid, "job already running, not starting");
            return;
        }
        let config = job.config.clone();
        match self.backend.spawn(id, &config) {
            Ok(pid) => {
                if let Err(e) = registry.update_started_job(id, pid) {
                    error!(job_id = id, pid, error = %e, "started pid for vanished job");
                }
            }
            Err(e) => error!(job_id = id, error = %e, "failed to start job"),
        }
    }

    /// Sends SIGTERM to `id`'s process, once per stop.
    pub fn stop(&mut self, registry: &mut WorkerMetadata, id: JobId) {
        let Some(pid) = registry.job(id).and_then(|job| job.state.pid) else {
            warn!(job_id = id, "cannot stop job without a running process");
            return;
        };
        if let Some(mark) = registry.stopping().get(&id) {
            let elapsed = registry.now() - mark.since;
            info!(
                job_id = id,
                pid,
                elapsed_secs = elapsed.num_seconds(),
                "job already stopping"
            );
            return;
        }
        match self.backend.signal(pid, Signal::SIGTERM) {
            Ok(()) => {
                registry.mark_as_stopping(id);
                info!(job_id = id, pid, "sent SIGTERM");
            }
            Err(e) => warn!(job_id = id, pid, error = %e, "failed to stop job"),
        }
    }

    /// Escalates stops older than the stop timeout to SIGKILL.
    ///
    /// SIGKILL is repeated at most once per timeout while the process stays
    /// unreaped. The stopping mark is left for the reap path to clear.
    pub fn check_stopping_processes(&mut self, registry: &mut WorkerMetadata) {
        let now = registry.now();
        let overdue: Vec<JobId> = registry
            .stopping()
            .iter()
            .filter(|(_, mark)| {
                now - mark.since >= self.stop_timeout
                    && mark
                        .last_kill
                        .is_none_or(|killed| now - killed >= self.stop_timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in overdue {
            let Some(pid) = registry.job(id).and_then(|job| job.state.pid) else {
                debug!(job_id = id, "stopping job has no pid, clearing mark");
                registry.clear_stopping(id);
                continue;
            };
            warn!(job_id = id, pid, "SIGTERM timeout, sending SIGKILL");
            match self.backend.signal(pid, Signal::SIGKILL) {
                Ok(()) => registry.record_kill(id),
                Err(e) => warn!(job_id = id, pid, error = %e, "failed to kill job"),
            }
        }
    }

    /// Sends SIGKILL to every job still holding a pid.
    pub fn kill_all(&mut self, registry: &mut WorkerMetadata) {
        for (id, pid) in registry.running_jobs() {
            warn!(job_id = id, pid, "sending SIGKILL");
            match self.backend.signal(pid, Signal::SIGKILL) {
                Ok(()) => registry.record_kill(id),
                Err(e) => warn!(job_id = id, pid, error = %e, "failed to kill job"),
            }
        }
    }

    /// Reaps every exited child and schedules the restart of its job.
    pub fn reap_and_respawn(&mut self, registry: &mut WorkerMetadata) -> Vec<ChildExit> {
        let exits = self.backend.reap();
        for exit in &exits {
            registry.record_exit(exit.pid, exit.code);
            if let Some(id) = registry.schedule_restart_by_pid(exit.pid) {
                registry.clear_stopping(id);
            }
        }
        exits
    }
}

#[cfg(test)]
#[path = "tests/process_tests.rs"]
mod tests;
