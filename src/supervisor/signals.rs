//! Signal notification for the supervisor loop.
//!
//! Handlers only set atomic flags. The loop polls them at its dispatch point
//! after each sleep, so registry mutation never runs inside a signal handler.
//!
//! - `SIGCHLD`: a child exited and needs reaping
//! - `SIGTERM` / `SIGINT`: the supervisor should shut down

use anyhow::{Context, Result};
use nix::libc::c_int;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

extern "C" fn on_shutdown(_: c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the supervisor's signal handlers.
pub fn install() -> Result<()> {
    let chld = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: both handlers only store to an atomic, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGCHLD, &chld).context("Failed to install SIGCHLD handler")?;
        sigaction(Signal::SIGTERM, &shutdown).context("Failed to install SIGTERM handler")?;
        sigaction(Signal::SIGINT, &shutdown).context("Failed to install SIGINT handler")?;
    }
    Ok(())
}

/// Restores default dispositions in a freshly forked child.
pub fn reset_in_child() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: restoring SIG_DFL has no handler code to run.
        let _ = unsafe { sigaction(signal, &default) };
    }
}

/// Returns whether a SIGCHLD arrived since the last call, clearing the flag.
pub fn take_child_exited() -> bool {
    CHILD_EXITED.swap(false, Ordering::SeqCst)
}

/// Returns whether a shutdown signal arrived since the last call, clearing the flag.
pub fn take_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
pub fn notify_child_exited() {
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub fn notify_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}
