//! The supervisor loop.
//!
//! Each cycle: poll the config source when due (otherwise just resync the
//! work queues), drain restarts, then stops, then starts, escalate overdue
//! stops, and answer pending control requests. Between cycles the loop
//! sleeps, then handles any signals that arrived meanwhile.

use super::backoff::BackoffPolicy;
use super::clock::Clock;
use super::process::{ProcessBackend, ProcessController};
use super::reconcile;
use super::registry::WorkerMetadata;
use super::signals;
use crate::config::{ConfigSource, SupervisorSettings};
use crate::control::protocol::handle_command;
use crate::control::server::ControlServer;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause between reap attempts while waiting for workers to exit on shutdown.
const SHUTDOWN_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// How many times to reap after the final SIGKILL before giving up.
const FINAL_REAP_ATTEMPTS: u32 = 10;

pub struct ProcessManager<B: ProcessBackend> {
    registry: WorkerMetadata,
    controller: ProcessController<B>,
    source: Box<dyn ConfigSource>,
    control: Option<ControlServer>,
    settings: SupervisorSettings,
    last_poll: Option<DateTime<Utc>>,
    running: bool,
}

impl<B: ProcessBackend> ProcessManager<B> {
    pub fn new(
        backend: B,
        source: Box<dyn ConfigSource>,
        settings: SupervisorSettings,
        clock: Box<dyn Clock>,
    ) -> Self {
        let backoff = BackoffPolicy::new(
            settings.min_run_duration.as_secs(),
            settings.max_backoff.as_secs(),
        );
        Self {
            registry: WorkerMetadata::new(backoff, clock),
            controller: ProcessController::new(backend, settings.stop_timeout),
            source,
            control: None,
            settings,
            last_poll: None,
            running: true,
        }
    }

    /// Attaches the control socket serviced at the end of every cycle.
    pub fn with_control(mut self, control: ControlServer) -> Self {
        self.control = Some(control);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Runs until a `stop` command or a termination signal, then stops every worker.
    pub fn run(&mut self) -> Result<()> {
        signals::install()?;
        info!(
            config_poll_secs = self.settings.config_poll_interval.as_secs(),
            process_poll_secs = self.settings.process_poll_interval.as_secs(),
            "supervisor started"
        );

        while self.is_running() {
            self.run_cycle();
            std::thread::sleep(self.settings.process_poll_interval);
            self.dispatch_signals();
        }

        self.shutdown_workers();
        info!("supervisor shut down cleanly");
        Ok(())
    }

    pub fn run_cycle(&mut self) {
        if self.poll_due() {
            self.poll_configuration();
        } else {
            self.registry.update_state_sync_map();
        }

        for id in self.registry.take_restart_queue() {
            debug!(job_id = id, "restarting job");
            self.controller.stop(&mut self.registry, id);
        }
        for id in self.registry.take_stop_queue() {
            self.controller.stop(&mut self.registry, id);
        }
        for id in self.registry.take_start_queue() {
            self.controller.start(&mut self.registry, id);
        }

        self.controller.check_stopping_processes(&mut self.registry);
        self.service_control();
    }

    /// Applies signals recorded since the last dispatch.
    pub fn dispatch_signals(&mut self) {
        if signals::take_child_exited() {
            let exits = self.controller.reap_and_respawn(&mut self.registry);
            debug!(reaped = exits.len(), "handled SIGCHLD");
        }
        if signals::take_shutdown_requested() {
            info!("termination signal received, shutting down");
            self.running = false;
        }
    }

    /// Reloads the configuration and reconciles it, whether or not a poll is due.
    pub fn poll_configuration(&mut self) {
        self.last_poll = Some(self.registry.now());
        if reconcile::poll_source(self.source.as_mut(), &mut self.registry).is_none() {
            // Keep the previous view of the world, but still act on it.
            self.registry.update_state_sync_map();
        }
    }

    fn poll_due(&self) -> bool {
        let interval = TimeDelta::from_std(self.settings.config_poll_interval)
            .unwrap_or(TimeDelta::MAX);
        let now = self.registry.now();
        self.last_poll.is_none_or(|last| now - last >= interval)
    }

    fn service_control(&mut self) {
        let Some(control) = &self.control else {
            return;
        };
        let registry = &mut self.registry;
        let running = &mut self.running;
        let served = control.service_pending(|line| handle_command(line, registry, running));
        if served > 0 {
            debug!(served, "answered control requests");
        }
    }

    /// Terminates every worker: SIGTERM, wait up to the stop timeout, then SIGKILL.
    pub fn shutdown_workers(&mut self) {
        let workers = self.registry.running_jobs();
        if workers.is_empty() {
            return;
        }
        info!(workers = workers.len(), "stopping all workers");
        for (id, _) in &workers {
            self.controller.stop(&mut self.registry, *id);
        }

        let deadline = Instant::now() + self.settings.stop_timeout;
        loop {
            self.controller.reap_and_respawn(&mut self.registry);
            if self.registry.running_jobs().is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SHUTDOWN_REAP_INTERVAL);
        }

        self.controller.kill_all(&mut self.registry);
        for _ in 0..FINAL_REAP_ATTEMPTS {
            self.controller.reap_and_respawn(&mut self.registry);
            if self.registry.running_jobs().is_empty() {
                return;
            }
            std::thread::sleep(SHUTDOWN_REAP_INTERVAL);
        }
        for (id, pid) in self.registry.running_jobs() {
            warn!(job_id = id, pid, "worker still running at exit");
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &WorkerMetadata {
        &self.registry
    }

    #[cfg(test)]
    pub fn registry_mut(&mut self) -> &mut WorkerMetadata {
        &mut self.registry
    }

    #[cfg(test)]
    pub fn backend_mut(&mut self) -> &mut B {
        self.controller.backend_mut()
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        self.controller.backend()
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
