//! Test doubles for the supervisor: a settable clock, a process backend that
//! never forks, and an in-memory config source.

use super::backoff::BackoffPolicy;
use super::clock::Clock;
use super::process::{ChildExit, ProcessBackend};
use super::registry::WorkerMetadata;
use crate::config::{ConfigSnapshot, ConfigSource, JobConfig, JobId};
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use nix::sys::signal::Signal;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Clock whose time only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.set(self.now.get() + TimeDelta::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Registry on a manual clock with the default backoff policy.
pub fn registry_with_clock() -> (WorkerMetadata, ManualClock) {
    let clock = ManualClock::new();
    let registry = WorkerMetadata::new(BackoffPolicy::default(), Box::new(clock.clone()));
    (registry, clock)
}

pub fn sleep_config(mtime: i64) -> JobConfig {
    JobConfig::new("sleep", mtime).with_field("seconds", serde_json::json!(60))
}

/// Backend that hands out sequential pids and records every call.
#[derive(Debug, Default)]
pub struct FakeBackend {
    pub next_pid: i32,
    pub spawned: Vec<(JobId, i32)>,
    pub signals: Vec<(i32, Signal)>,
    /// Exits returned by the next `reap`.
    pub pending_exits: Vec<ChildExit>,
    pub fail_spawn: bool,
    pub fail_signal: bool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            next_pid: 100,
            ..Self::default()
        }
    }

    pub fn exit(&mut self, pid: i32, code: i32) {
        self.pending_exits.push(ChildExit { pid, code });
    }

    pub fn signals_to(&self, pid: i32) -> Vec<Signal> {
        self.signals
            .iter()
            .filter(|(target, _)| *target == pid)
            .map(|(_, signal)| *signal)
            .collect()
    }
}

impl ProcessBackend for FakeBackend {
    fn spawn(&mut self, id: JobId, _config: &JobConfig) -> Result<i32> {
        if self.fail_spawn {
            anyhow::bail!("fork failed: EAGAIN");
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.spawned.push((id, pid));
        Ok(pid)
    }

    fn signal(&mut self, pid: i32, signal: Signal) -> Result<()> {
        if self.fail_signal {
            anyhow::bail!("kill failed: ESRCH");
        }
        self.signals.push((pid, signal));
        Ok(())
    }

    fn reap(&mut self) -> Vec<ChildExit> {
        std::mem::take(&mut self.pending_exits)
    }
}

/// Config source whose next result is set by the test. Clones share it.
#[derive(Clone)]
pub struct MemorySource {
    next: Rc<RefCell<Option<ConfigSnapshot>>>,
    pub loads: Rc<Cell<usize>>,
}

impl MemorySource {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            next: Rc::new(RefCell::new(Some(snapshot))),
            loads: Rc::new(Cell::new(0)),
        }
    }

    pub fn set(&self, snapshot: ConfigSnapshot) {
        *self.next.borrow_mut() = Some(snapshot);
    }

    /// Makes every subsequent load fail.
    pub fn fail(&self) {
        *self.next.borrow_mut() = None;
    }
}

impl ConfigSource for MemorySource {
    fn load_configuration(&mut self) -> Result<ConfigSnapshot> {
        self.loads.set(self.loads.get() + 1);
        match self.next.borrow().as_ref() {
            Some(snapshot) => Ok(snapshot.clone()),
            None => anyhow::bail!("config backend unavailable"),
        }
    }
}

pub fn snapshot_of(entries: &[(JobId, i64)]) -> ConfigSnapshot {
    entries
        .iter()
        .map(|(id, mtime)| (*id, sleep_config(*mtime)))
        .collect()
}
