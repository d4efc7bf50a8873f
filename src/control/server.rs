//! Control socket listener.
//!
//! The listener is non-blocking: each supervisor cycle services only the
//! connections already pending, one request/response per connection.

use crate::lrpm_paths;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on how long one client may take to send its command.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest accepted command line.
const MAX_COMMAND_BYTES: u64 = 4096;

pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    lock_path: PathBuf,
    _lock: File,
}

impl ControlServer {
    /// Binds the control socket, refusing to start if another supervisor owns it.
    pub fn bind(socket_path: &Path) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
        }

        let lock_path = lrpm_paths::lock_path(socket_path);
        let lock = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .context("Failed to open lock file")?;
        if let Err(e) = lock.try_lock_exclusive() {
            if e.kind() == ErrorKind::WouldBlock {
                anyhow::bail!("Another supervisor is already running");
            }
            return Err(e).context("Failed to acquire lock");
        }

        if socket_path.exists() {
            // Try connecting to see if another supervisor is running
            if UnixStream::connect(socket_path).is_ok() {
                anyhow::bail!("Another supervisor is already running");
            }
            std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("Failed to bind Unix socket")?;
        listener
            .set_nonblocking(true)
            .context("Failed to make control socket non-blocking")?;

        let pid_path = lrpm_paths::pid_path(socket_path);
        std::fs::write(&pid_path, std::process::id().to_string())
            .context("Failed to write PID file")?;

        info!(socket = %socket_path.display(), "control socket listening");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            pid_path,
            lock_path,
            _lock: lock,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Answers every connection already waiting, returning how many were served.
    pub fn service_pending<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&str) -> String,
    {
        let mut served = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = serve_connection(stream, &mut handler) {
                        warn!(error = %e, "control connection failed");
                    }
                    served += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "failed to accept control connection");
                    break;
                }
            }
        }
        served
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_path);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn serve_connection<F>(stream: UnixStream, handler: &mut F) -> Result<()>
where
    F: FnMut(&str) -> String,
{
    // Accepted sockets inherit the listener's non-blocking flag on some platforms
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(READ_TIMEOUT))?;

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream).take(MAX_COMMAND_BYTES);
    let mut raw = Vec::new();
    reader
        .read_until(b'\n', &mut raw)
        .context("Failed to read control command")?;

    let line = String::from_utf8_lossy(&raw);
    let command = line.trim();
    debug!(command, "control command received");
    let response = handler(command);
    writer.write_all(response.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/server_tests.rs"]
mod tests;
