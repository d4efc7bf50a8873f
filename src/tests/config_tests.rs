//! Tests for job file parsing and supervisor settings.

use super::*;
use serial_test::serial;
use std::io::Write;

fn source() -> YamlFileSource {
    YamlFileSource::new(Path::new("/tmp/jobs.yaml"))
}

#[test]
fn test_parse_jobs_mapping() {
    let yaml = r#"
jobs:
  1:
    worker: exec
    mtime: 10
    command: /usr/bin/true
    args: ["--verbose"]
  2:
    worker: sleep
    mtime: 5
    seconds: 30
"#;
    let snapshot = source().parse(yaml).unwrap();
    assert_eq!(snapshot.len(), 2);

    let first = &snapshot[&1];
    assert_eq!(first.worker, "exec");
    assert_eq!(first.mtime, 10);
    assert_eq!(first.field_str("command"), Some("/usr/bin/true"));
    assert_eq!(first.fields["args"], serde_json::json!(["--verbose"]));

    assert_eq!(snapshot[&2].fields["seconds"], serde_json::json!(30));
}

#[test]
fn test_parse_accepts_json_job_file() {
    let json = r#"{"jobs": {"4": {"worker": "shell", "mtime": 1, "script": "echo hi"}}}"#;
    let snapshot = source().parse(json).unwrap();
    assert_eq!(snapshot[&4].field_str("script"), Some("echo hi"));
}

#[test]
fn test_non_numeric_job_ids_are_dropped() {
    let yaml = r#"
jobs:
  web:
    worker: sleep
    mtime: 1
  "-2":
    worker: sleep
    mtime: 1
  " 8 ":
    worker: sleep
    mtime: 1
"#;
    let snapshot = source().parse(yaml).unwrap();
    assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![8]);
}

#[test]
fn test_invalid_entries_are_dropped_not_fatal() {
    let yaml = r#"
jobs:
  1:
    worker: exec
    mtime: 10
  2:
    worker: exec
  3:
    worker: ""
    mtime: 1
  4:
    worker: exec
    mtime: -3
  5: "not a mapping"
"#;
    let snapshot = source().parse(yaml).unwrap();
    assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn test_unknown_worker_types_are_dropped() {
    let yaml = r#"
jobs:
  1:
    worker: exec
    mtime: 1
  2:
    worker: cron
    mtime: 1
"#;
    let source = source().with_worker_types(vec!["exec".to_string(), "sleep".to_string()]);
    let snapshot = source.parse(yaml).unwrap();
    assert!(snapshot.contains_key(&1));
    assert!(!snapshot.contains_key(&2));
}

#[test]
fn test_missing_jobs_key_fails_whole_load() {
    assert!(source().parse("workers: {}").is_err());
}

#[test]
fn test_malformed_yaml_fails_whole_load() {
    assert!(source().parse("jobs: [unterminated").is_err());
}

#[test]
fn test_empty_jobs_mapping_is_valid() {
    let snapshot = source().parse("jobs: {}").unwrap();
    assert!(snapshot.is_empty());
}

#[test]
fn test_load_configuration_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "jobs:\n  9:\n    worker: sleep\n    mtime: 3\n    seconds: 1").unwrap();

    let mut source = YamlFileSource::new(file.path());
    let snapshot = source.load_configuration().unwrap();
    assert_eq!(snapshot[&9].mtime, 3);
}

#[test]
fn test_load_configuration_missing_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = YamlFileSource::new(&dir.path().join("absent.yaml"));
    let err = source.load_configuration().unwrap_err();
    assert!(err.to_string().contains("Failed to read job file"));
}

#[test]
fn test_job_config_serializes_flat() {
    let config = JobConfig::new("shell", 7).with_field("script", serde_json::json!("true"));
    let value = serde_json::to_value(&config).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"worker": "shell", "mtime": 7, "script": "true"})
    );
}

#[test]
fn test_settings_defaults() {
    let settings = SupervisorSettings::default();
    assert_eq!(settings.config_poll_interval, Duration::from_secs(30));
    assert_eq!(settings.process_poll_interval, Duration::from_secs(1));
    assert_eq!(settings.stop_timeout, Duration::from_secs(10));
    assert_eq!(settings.min_run_duration, Duration::from_secs(5));
    assert_eq!(settings.max_backoff, Duration::from_secs(300));
}

#[test]
#[serial]
fn test_settings_env_overrides() {
    std::env::set_var("LRPM_STOP_TIMEOUT_SECS", "3");
    std::env::set_var("LRPM_MAX_BACKOFF_SECS", "not-a-number");
    let settings = SupervisorSettings::from_env();
    std::env::remove_var("LRPM_STOP_TIMEOUT_SECS");
    std::env::remove_var("LRPM_MAX_BACKOFF_SECS");

    assert_eq!(settings.stop_timeout, Duration::from_secs(3));
    assert_eq!(settings.max_backoff, Duration::from_secs(300));
}
