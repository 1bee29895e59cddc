//! Table-driven tests for configuration loading, plus wiring a job run
//! from a config file on disk.

mod common;

use std::sync::Arc;

use common::*;

use bulkrun::config::{apply_env_overrides, load_config, load_config_from_str};
use bulkrun::{
    CommandExecutor, JobOutcome, JobProcessor, JobStore, NoopNotifier, Planner, RetryPolicy,
};

struct ConfigTestCase {
    name: &'static str,
    config_json: &'static str,
    should_succeed: bool,
    expected_error: Option<&'static str>,
}

const JSON_CONFIG_TESTS: &[ConfigTestCase] = &[
    ConfigTestCase {
        name: "valid_empty",
        config_json: "{}",
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "valid_full",
        config_json: r#"{
            "version": "1.0",
            "database_path": "/var/lib/bulkrun/jobs.db",
            "jobs_dir": "/var/lib/bulkrun/jobs",
            "worker_count": 4,
            "queue": { "redis_url": "redis://cache:6379/2", "name": "leads", "dequeue_timeout_secs": 5 },
            "pool": { "max_size": 8, "acquire_timeout_ms": 1000, "busy_timeout_ms": 2000 },
            "batching": { "batch_size": 500 },
            "retry": { "max_attempts": 5, "base_delay_secs": 1 },
            "executor": { "command": ["python3", "scrape.py"], "timeout_secs": 60 },
            "webhook": { "timeout_secs": 3 }
        }"#,
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "invalid_version",
        config_json: r#"{ "version": "2.0" }"#,
        should_succeed: false,
        expected_error: Some("Unsupported config version"),
    },
    ConfigTestCase {
        name: "zero_batch_size",
        config_json: r#"{ "batching": { "batch_size": 0 } }"#,
        should_succeed: false,
        expected_error: Some("batch_size"),
    },
    ConfigTestCase {
        name: "zero_attempts",
        config_json: r#"{ "retry": { "max_attempts": 0 } }"#,
        should_succeed: false,
        expected_error: Some("max_attempts"),
    },
    ConfigTestCase {
        name: "empty_command",
        config_json: r#"{ "executor": { "command": [] } }"#,
        should_succeed: false,
        expected_error: Some("executor.command"),
    },
    ConfigTestCase {
        name: "blank_queue_name",
        config_json: r#"{ "queue": { "name": "  " } }"#,
        should_succeed: false,
        expected_error: Some("queue.name"),
    },
    ConfigTestCase {
        name: "malformed_json",
        config_json: r#"{ "worker_count": "#,
        should_succeed: false,
        expected_error: Some("parse config JSON"),
    },
    ConfigTestCase {
        name: "wrong_type",
        config_json: r#"{ "worker_count": "many" }"#,
        should_succeed: false,
        expected_error: Some("parse config JSON"),
    },
];

#[test]
fn test_json_config_loading() {
    for test_case in JSON_CONFIG_TESTS {
        let result = load_config_from_str(test_case.config_json);

        if test_case.should_succeed {
            assert!(
                result.is_ok(),
                "Test '{}': Expected success but got error: {:?}",
                test_case.name,
                result.err()
            );
        } else {
            assert!(
                result.is_err(),
                "Test '{}': Expected error but got success",
                test_case.name
            );

            if let Some(expected_error) = test_case.expected_error {
                let error_msg = result.err().unwrap().to_string();
                assert!(
                    error_msg.contains(expected_error),
                    "Test '{}': Expected error containing '{}', got '{}'",
                    test_case.name,
                    expected_error,
                    error_msg
                );
            }
        }
    }
}

#[test]
fn test_missing_config_file_is_reported() {
    let harness = TestHarness::new();
    let err = load_config(harness.temp_path().join("absent.json")).unwrap_err();
    assert!(err.to_string().contains("absent.json"));
}

#[test]
fn test_env_overrides_apply_over_file() {
    let mut config = load_config_from_str(r#"{ "worker_count": 2 }"#).unwrap();
    apply_env_overrides(&mut config, |name| match name {
        "BULKRUN_WORKERS" => Some("6".to_string()),
        "REDIS_URL" => Some("redis://other:6379".to_string()),
        "BULKRUN_BATCH_SIZE" => Some("".to_string()),
        _ => None,
    })
    .unwrap();

    assert_eq!(config.worker_count, 6);
    assert_eq!(config.queue.redis_url, "redis://other:6379");
    assert_eq!(config.batching.batch_size, 10_000);
}

/// A config file on disk drives a complete job: store location, jobs
/// directory, batch size and the external batch command.
#[cfg(unix)]
#[test]
fn test_job_runs_from_config_file() {
    let harness = TestHarness::new();
    let base = harness.temp_path();
    let config_path = base.join("bulkrun.json");
    let config_json = serde_json::json!({
        "database_path": base.join("cfg").join("jobs.db"),
        "jobs_dir": base.join("cfg").join("jobs"),
        "batching": { "batch_size": 4 },
        "retry": { "max_attempts": 2, "base_delay_secs": 0 },
        "executor": {
            "command": ["sh", "-c", "printf 'name,company\\nacme,acme\\n' > \"$1\""],
            "timeout_secs": 30
        }
    });
    std::fs::write(&config_path, serde_json::to_string_pretty(&config_json).unwrap()).unwrap();

    let config = load_config(&config_path).unwrap();
    let store = JobStore::open(&config.database_path, &config.pool).unwrap();
    let processor = JobProcessor::new(
        store.clone(),
        Arc::new(CommandExecutor::from_config(&config.executor).unwrap()),
        Arc::new(NoopNotifier),
        Planner::new(config.batching.batch_size).unwrap(),
        RetryPolicy::from_config(&config.retry),
        config.jobs_dir.clone(),
    );

    let source = harness.input_path("leads.csv");
    write_csv(&source, 10);
    let job_id = store
        .create_job(&csv_input(&source), "owner@example.com")
        .unwrap();
    let outcome = processor.process(&bulkrun::JobDescriptor::new(
        job_id,
        &csv_input(&source),
    ));

    let JobOutcome::Finished(result) = outcome else {
        panic!("unexpected outcome {:?}", outcome);
    };
    // One row per batch from the command, for slices of 4/4/2.
    assert_eq!(result.rows, 3);
    assert_eq!(result.batches.len(), 3);
    assert!(config.jobs_dir.join(format!("job_{}_final.csv", job_id)).exists());
}
