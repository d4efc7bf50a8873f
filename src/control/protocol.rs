//! Textual control commands.
//!
//! One command per connection: the first whitespace-delimited token is the
//! verb. Every input, valid or not, produces a response string.

use crate::config::JobId;
use crate::supervisor::registry::WorkerMetadata;
use crate::BUILD_SHA;

/// Parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Help,
    Status,
    JsonStatus,
    Stop,
    /// `restart <id>`; the argument is kept raw so it can be validated on execution.
    Restart(Option<String>),
    Invalid(String),
}

impl ControlCommand {
    pub fn parse(input: &str) -> Self {
        let mut tokens = input.split_whitespace();
        match tokens.next() {
            Some("help") => ControlCommand::Help,
            Some("status") => ControlCommand::Status,
            Some("jsonstatus") => ControlCommand::JsonStatus,
            Some("stop") => ControlCommand::Stop,
            Some("restart") => ControlCommand::Restart(tokens.next().map(str::to_string)),
            _ => ControlCommand::Invalid(input.trim().to_string()),
        }
    }
}

/// Returns the usage text listing every command.
pub fn help_text() -> String {
    format!(
        "lrpm {} control commands:\n\
         \x20 help              show this message\n\
         \x20 status            show every job's config and state\n\
         \x20 jsonstatus        same as status, as compact JSON\n\
         \x20 stop              shut down the supervisor and its workers\n\
         \x20 restart <job id>  restart a job now, bypassing backoff",
        BUILD_SHA
    )
}

/// Executes one control message against the registry.
///
/// `running` is the supervisor loop's continue flag.
pub fn handle_command(input: &str, registry: &mut WorkerMetadata, running: &mut bool) -> String {
    match ControlCommand::parse(input) {
        ControlCommand::Help => help_text(),
        ControlCommand::Status => {
            serde_json::to_string_pretty(&registry.snapshot()).unwrap_or_else(serialize_failed)
        }
        ControlCommand::JsonStatus => {
            serde_json::to_string(&registry.snapshot()).unwrap_or_else(serialize_failed)
        }
        ControlCommand::Stop => {
            *running = false;
            tracing::info!("shutdown requested over control socket");
            "stopping supervisor".to_string()
        }
        ControlCommand::Restart(None) => {
            "error: restart requires a job id argument (usage: restart <job id>)".to_string()
        }
        ControlCommand::Restart(Some(raw)) => restart(&raw, registry),
        ControlCommand::Invalid(original) => {
            format!("invalid command: '{}'\n\n{}", original, help_text())
        }
    }
}

fn restart(raw: &str, registry: &mut WorkerMetadata) -> String {
    let Ok(id) = raw.parse::<JobId>() else {
        return format!("error: '{}' is not a valid job id", raw);
    };
    match registry.schedule_immediate_restart(id) {
        Ok(()) => format!("restart scheduled for job {}", id),
        Err(e) => format!("error: {}", e),
    }
}

fn serialize_failed(e: serde_json::Error) -> String {
    format!("error: failed to serialize status: {}", e)
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
