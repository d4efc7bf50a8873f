//! Client side of the control socket, used by `lrpm ctl`.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// How long to wait for the supervisor to answer.
///
/// The supervisor only services the socket between poll sleeps, so this has
/// to cover at least one process poll interval.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends one command and returns the supervisor's full response.
pub fn send_command(socket_path: &Path, command: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path).with_context(|| {
        format!(
            "Failed to connect to supervisor at {} (is it running?)",
            socket_path.display()
        )
    })?;
    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;

    writeln!(stream, "{}", command.trim()).context("Failed to send command")?;
    stream.flush()?;
    stream
        .shutdown(Shutdown::Write)
        .context("Failed to finish sending command")?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .context("Failed to read supervisor response")?;
    Ok(response.trim_end().to_string())
}
