//! Tests for the process controller, driven through a fake backend.

use super::*;
use crate::control::server::ControlServer;
use crate::errors::SupervisorError;
use crate::lrpm_paths;
use crate::supervisor::clock::Clock;
use crate::supervisor::registry::DbState;
use crate::supervisor::testing::{registry_with_clock, sleep_config, FakeBackend, ManualClock};
use crate::workers::Worker;
use serial_test::serial;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

fn controller() -> ProcessController<FakeBackend> {
    ProcessController::new(FakeBackend::new(), STOP_TIMEOUT)
}

/// Registry with job `id` started through `controller`.
fn started(
    controller: &mut ProcessController<FakeBackend>,
    id: JobId,
) -> (WorkerMetadata, ManualClock, i32) {
    let (mut registry, clock) = registry_with_clock();
    registry.add_new_job(id, sleep_config(1));
    controller.start(&mut registry, id);
    let pid = registry.job(id).unwrap().state.pid.unwrap();
    (registry, clock, pid)
}

#[test]
fn test_start_records_pid() {
    let mut controller = controller();
    let (registry, _clock, pid) = started(&mut controller, 1);

    assert_eq!(pid, 100);
    assert_eq!(controller.backend().spawned, vec![(1, 100)]);
    assert_eq!(registry.job_for_pid(100), Some(1));
    assert!(registry.pid_index_consistent());
}

#[test]
fn test_start_skips_running_and_unknown_jobs() {
    let mut controller = controller();
    let (mut registry, _clock, _pid) = started(&mut controller, 1);

    controller.start(&mut registry, 1);
    controller.start(&mut registry, 99);
    assert_eq!(controller.backend().spawned.len(), 1);
}

#[test]
fn test_failed_fork_leaves_job_startable() {
    let mut controller = controller();
    controller.backend_mut().fail_spawn = true;
    let (mut registry, _clock) = registry_with_clock();
    registry.add_new_job(1, sleep_config(1));

    controller.start(&mut registry, 1);
    assert_eq!(registry.job(1).unwrap().state.pid, None);

    registry.update_state_sync_map();
    assert_eq!(registry.take_start_queue(), vec![1]);
}

#[test]
fn test_stop_sends_sigterm_once() {
    let mut controller = controller();
    let (mut registry, clock, pid) = started(&mut controller, 1);

    controller.stop(&mut registry, 1);
    clock.advance(3);
    controller.stop(&mut registry, 1);

    assert_eq!(controller.backend().signals_to(pid), vec![Signal::SIGTERM]);
    let mark = registry.stopping()[&1];
    assert_eq!(mark.since, clock.now() - TimeDelta::seconds(3));
}

#[test]
fn test_stop_without_pid_is_noop() {
    let mut controller = controller();
    let (mut registry, _clock) = registry_with_clock();
    registry.add_new_job(1, sleep_config(1));

    controller.stop(&mut registry, 1);
    assert!(controller.backend().signals.is_empty());
    assert!(!registry.is_stopping(1));
}

#[test]
fn test_failed_signal_does_not_mark_stopping() {
    let mut controller = controller();
    let (mut registry, _clock, _pid) = started(&mut controller, 1);
    controller.backend_mut().fail_signal = true;

    controller.stop(&mut registry, 1);
    assert!(!registry.is_stopping(1));
}

#[test]
fn test_sigkill_after_timeout() {
    let mut controller = controller();
    let (mut registry, clock, pid) = started(&mut controller, 1);
    controller.stop(&mut registry, 1);

    clock.advance(9);
    controller.check_stopping_processes(&mut registry);
    assert_eq!(controller.backend().signals_to(pid), vec![Signal::SIGTERM]);

    clock.advance(1);
    controller.check_stopping_processes(&mut registry);
    assert_eq!(
        controller.backend().signals_to(pid),
        vec![Signal::SIGTERM, Signal::SIGKILL]
    );
    assert!(registry.is_stopping(1));
}

#[test]
fn test_sigkill_is_rate_limited() {
    let mut controller = controller();
    let (mut registry, clock, pid) = started(&mut controller, 1);
    controller.stop(&mut registry, 1);

    clock.advance(10);
    controller.check_stopping_processes(&mut registry);
    clock.advance(5);
    controller.check_stopping_processes(&mut registry);
    clock.advance(5);
    controller.check_stopping_processes(&mut registry);

    let kills = controller
        .backend()
        .signals_to(pid)
        .into_iter()
        .filter(|s| *s == Signal::SIGKILL)
        .count();
    assert_eq!(kills, 2);
}

#[test]
fn test_reap_clears_pid_and_stopping_mark() {
    let mut controller = controller();
    let (mut registry, clock, pid) = started(&mut controller, 7);
    registry.mark_as_unchanged(7).unwrap();
    controller.stop(&mut registry, 7);

    clock.advance(2);
    controller.backend_mut().exit(pid, 128 + 15);
    let exits = controller.reap_and_respawn(&mut registry);

    assert_eq!(exits, vec![ChildExit { pid, code: 143 }]);
    let job = registry.job(7).unwrap();
    assert_eq!(job.state.pid, None);
    assert_eq!(job.state.last_exit_code, Some(143));
    assert!(job.state.restart_at > clock.now());
    assert!(!registry.is_stopping(7));
    assert_eq!(registry.job_for_pid(pid), None);
    assert!(registry.pid_index_consistent());
}

#[test]
fn test_removed_job_lifecycle() {
    let mut controller = controller();
    let (mut registry, _clock, pid) = started(&mut controller, 7);
    registry.remove_job(7).unwrap();
    registry.update_state_sync_map();

    for id in registry.take_stop_queue() {
        controller.stop(&mut registry, id);
    }
    assert!(registry.is_stopping(7));

    controller.backend_mut().exit(pid, 0);
    controller.reap_and_respawn(&mut registry);
    let job = registry.job(7).unwrap();
    assert_eq!(job.state.db_state, DbState::Removed);
    assert_eq!(job.state.pid, None);

    assert_eq!(registry.purge_removed_jobs(), vec![7]);
}

#[test]
fn test_reap_of_foreign_pid_is_ignored() {
    let mut controller = controller();
    let (mut registry, _clock, pid) = started(&mut controller, 1);
    controller.backend_mut().exit(4242, 0);

    controller.reap_and_respawn(&mut registry);
    assert_eq!(registry.job(1).unwrap().state.pid, Some(pid));
    assert!(registry.pid_index_consistent());
}

#[test]
fn test_kill_all_signals_every_running_job() {
    let mut controller = controller();
    let (mut registry, _clock) = registry_with_clock();
    for id in 1..=3 {
        registry.add_new_job(id, sleep_config(1));
        controller.start(&mut registry, id);
    }

    controller.kill_all(&mut registry);
    let kills: Vec<_> = controller
        .backend()
        .signals
        .iter()
        .filter(|(_, s)| *s == Signal::SIGKILL)
        .map(|(pid, _)| *pid)
        .collect();
    assert_eq!(kills, vec![100, 101, 102]);
}

#[test]
#[serial]
fn test_os_backend_reaps_real_child() {
    let mut backend = OsBackend::new(WorkerRegistry::with_builtins());
    let config = JobConfig::new("shell", 1).with_field("script", serde_json::json!("exit 3"));

    let pid = backend.spawn(1, &config).unwrap();
    let exits = wait_for_exit(&mut backend, pid);
    assert!(exits.contains(&ChildExit { pid, code: 3 }));
}

/// Reaps real children until `pid` shows up, for at most two seconds.
fn wait_for_exit(backend: &mut OsBackend, pid: i32) -> Vec<ChildExit> {
    let mut exits = Vec::new();
    for _ in 0..100 {
        exits.extend(backend.reap());
        if exits.iter().any(|e| e.pid == pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    exits
}

struct PanickingWorker;

impl Worker for PanickingWorker {
    fn run(&self) -> anyhow::Result<i32> {
        panic!("worker blew up");
    }
}

fn panicking(_config: &JobConfig) -> Result<Box<dyn Worker>, SupervisorError> {
    Ok(Box::new(PanickingWorker))
}

#[test]
#[serial]
fn test_worker_panic_leaves_control_socket_alone() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("lrpm.sock");
    let _control = ControlServer::bind(&socket).unwrap();

    let mut workers = WorkerRegistry::empty();
    workers.register("panic", panicking);
    let mut backend = OsBackend::new(workers);
    let pid = backend.spawn(1, &JobConfig::new("panic", 1)).unwrap();

    let exits = wait_for_exit(&mut backend, pid);
    assert!(exits.contains(&ChildExit {
        pid,
        code: EXIT_WORKER_FAILED
    }));
    assert!(socket.exists());
    assert!(lrpm_paths::pid_path(&socket).exists());
    assert!(lrpm_paths::lock_path(&socket).exists());
}
