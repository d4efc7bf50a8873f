//! Per-user runtime paths for the supervisor.
//!
//! Everything lives next to the control socket:
//! - `lrpm-<uid>.sock` - control socket
//! - `lrpm-<uid>.lock` - single-instance lock
//! - `lrpm-<uid>.pid` - supervisor PID file
//!
//! The socket directory is `$XDG_RUNTIME_DIR` when available, otherwise the
//! system temp dir. `LRPM_SOCKET` overrides the socket path entirely.

use std::path::{Path, PathBuf};

/// Environment variable overriding the control socket path.
pub const SOCKET_ENV: &str = "LRPM_SOCKET";

/// Returns the directory holding the per-user runtime files.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Returns the control socket path for the current user.
pub fn control_socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    runtime_dir().join(format!("lrpm-{}.sock", current_uid()))
}

/// Returns the single-instance lock path that belongs to `socket`.
pub fn lock_path(socket: &Path) -> PathBuf {
    socket.with_extension("lock")
}

/// Returns the PID file path that belongs to `socket`.
pub fn pid_path(socket: &Path) -> PathBuf {
    socket.with_extension("pid")
}

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}
