//! Workers that replace the child image with an external program.

use super::{required_str, Worker};
use crate::config::JobConfig;
use crate::errors::SupervisorError;
use anyhow::Context;
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Execs `command` with `args`, optional `env` and `cwd`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecWorker {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

impl ExecWorker {
    pub fn parse(config: &JobConfig) -> Result<Self, SupervisorError> {
        let command = required_str(config, "command")?.to_string();
        let args = string_list(config, "args")?;
        let env = string_map(config, "env")?;
        let cwd = config.field_str("cwd").map(str::to_string);
        Ok(Self {
            command,
            args,
            env,
            cwd,
        })
    }

    pub fn from_config(config: &JobConfig) -> Result<Box<dyn Worker>, SupervisorError> {
        Ok(Box::new(Self::parse(config)?))
    }
}

impl Worker for ExecWorker {
    fn run(&self) -> anyhow::Result<i32> {
        let mut command = Command::new(&self.command);
        command.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        // exec only returns on failure
        let err = command.exec();
        Err(err).with_context(|| format!("Failed to exec {}", self.command))
    }
}

/// Runs `script` through `/bin/sh -c`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShellWorker {
    inner: ExecWorker,
}

impl ShellWorker {
    pub fn from_config(config: &JobConfig) -> Result<Box<dyn Worker>, SupervisorError> {
        let script = required_str(config, "script")?.to_string();
        let inner = ExecWorker {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script],
            env: string_map(config, "env")?,
            cwd: config.field_str("cwd").map(str::to_string),
        };
        Ok(Box::new(Self { inner }))
    }
}

impl Worker for ShellWorker {
    fn run(&self) -> anyhow::Result<i32> {
        self.inner.run()
    }
}

fn string_list(config: &JobConfig, key: &str) -> Result<Vec<String>, SupervisorError> {
    let Some(value) = config.fields.get(key) else {
        return Ok(Vec::new());
    };
    let items = value.as_array().ok_or_else(|| invalid(config, key, "a list"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(config, key, "a list of strings"))
        })
        .collect()
}

fn string_map(config: &JobConfig, key: &str) -> Result<BTreeMap<String, String>, SupervisorError> {
    let Some(value) = config.fields.get(key) else {
        return Ok(BTreeMap::new());
    };
    let entries = value
        .as_object()
        .ok_or_else(|| invalid(config, key, "a mapping"))?;
    entries
        .iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|s| (k.clone(), s.to_string()))
                .ok_or_else(|| invalid(config, key, "a mapping of strings"))
        })
        .collect()
}

fn invalid(config: &JobConfig, key: &str, expected: &str) -> SupervisorError {
    SupervisorError::InvalidWorkerConfig {
        worker: config.worker.clone(),
        message: format!("expects '{}' to be {}", key, expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_exec_config() {
        let config = JobConfig::new("exec", 1)
            .with_field("command", json!("/usr/bin/env"))
            .with_field("args", json!(["-i", "true"]))
            .with_field("env", json!({"MODE": "test"}))
            .with_field("cwd", json!("/tmp"));

        let worker = ExecWorker::parse(&config).unwrap();
        assert_eq!(worker.command, "/usr/bin/env");
        assert_eq!(worker.args, vec!["-i", "true"]);
        assert_eq!(worker.env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(worker.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_missing_command_is_rejected() {
        let err = ExecWorker::parse(&JobConfig::new("exec", 1)).unwrap_err();
        assert!(err.to_string().contains("'command'"));
    }

    #[test]
    fn test_non_string_args_are_rejected() {
        let config = JobConfig::new("exec", 1)
            .with_field("command", json!("/bin/true"))
            .with_field("args", json!(["ok", 3]));
        let err = ExecWorker::parse(&config).unwrap_err();
        assert!(err.to_string().contains("list of strings"));
    }

    #[test]
    fn test_shell_requires_script() {
        assert!(ShellWorker::from_config(&JobConfig::new("shell", 1)).is_err());
        let config = JobConfig::new("shell", 1).with_field("script", json!("exit 0"));
        assert!(ShellWorker::from_config(&config).is_ok());
    }
}
