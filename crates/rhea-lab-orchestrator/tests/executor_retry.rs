mod common;

use common::{attempts_started, cmd_out, ops_skipped, test_env, test_executor};
use rhea_lab_orchestrator::Error;
use rhea_lab_orchestrator::executor::parse_batch;

fn ops_from(batch_toml: &str) -> Vec<rhea_lab_orchestrator::executor::Operation> {
    let value: toml::Value = toml::from_str(batch_toml).unwrap();
    let records = value.get("batch").and_then(toml::Value::as_array).unwrap();
    parse_batch(records).unwrap()
}

#[test]
fn clean_command_succeeds_in_one_attempt() {
    let (env, log) = test_env(toml::from_str("").unwrap());
    let (executor, events) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
cmd = "true"
node = "web01"
retry = { count = 1 }
"#,
    );

    executor.run(&env, &ops, "smoke").expect("batch must succeed");
    assert_eq!(attempts_started(&events), 1);
    assert_eq!(log.lock().unwrap().runs, vec!["true".to_string()]);
}

#[test]
fn early_success_stops_retrying() {
    let (env, log) = test_env(toml::from_str("").unwrap());
    let (executor, events) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
cmd = "service status"
node = "web01"
retry = { count = 5, delay = 0 }
"#,
    );

    executor.run(&env, &ops, "smoke").unwrap();
    assert_eq!(attempts_started(&events), 1);
    assert_eq!(log.lock().unwrap().runs.len(), 1);
}

#[test]
fn false_success_output_is_retried_until_clean() {
    let (env, log) = test_env(toml::from_str("").unwrap());
    {
        let mut log = log.lock().unwrap();
        log.script
            .push_back(cmd_out(0, &["Succeeded: 9", "Failed: 1"]));
        log.script
            .push_back(cmd_out(0, &["Succeeded: 9", "Failed: 1"]));
        log.script
            .push_back(cmd_out(0, &["Succeeded: 10", "Failed: 0"]));
    }
    let (executor, events) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
cmd = "flaky"
node = "web01"
retry = { count = 3, delay = 0 }
"#,
    );

    executor
        .run(&env, &ops, "flaky-batch")
        .expect("third attempt is clean");
    assert_eq!(attempts_started(&events), 3);
    assert_eq!(log.lock().unwrap().runs.len(), 3);
}

#[test]
fn skip_on_fail_lets_the_batch_continue() {
    let (env, log) = test_env(toml::from_str("").unwrap());
    {
        let mut log = log.lock().unwrap();
        log.script.push_back(cmd_out(1, &[]));
        log.script.push_back(cmd_out(1, &[]));
    }
    let (executor, events) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
cmd = "optional-tuning"
node = "web01"
retry = { count = 2, delay = 0 }
"skip-on-fail" = true

[[batch]]
cmd = "mandatory-step"
node = "web01"
"#,
    );

    executor.run(&env, &ops, "mixed").expect("skip must not abort");
    assert_eq!(ops_skipped(&events), 1);
    let runs = log.lock().unwrap().runs.clone();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[2], "mandatory-step");
}

#[test]
fn exhausted_retries_raise_step_failed_and_abort() {
    let (env, log) = test_env(toml::from_str("").unwrap());
    {
        let mut log = log.lock().unwrap();
        for _ in 0..3 {
            log.script.push_back(cmd_out(1, &["boom"]));
        }
    }
    let (executor, events) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
cmd = "install-broker"
node = "web01"
description = "install message broker"
retry = { count = 3, delay = 0 }

[[batch]]
cmd = "never-reached"
node = "web01"
"#,
    );

    let err = executor.run(&env, &ops, "broker").unwrap_err();
    match err {
        Error::StepFailed {
            batch,
            ordinal,
            description,
        } => {
            assert_eq!(batch, "broker");
            assert_eq!(ordinal, 1);
            assert!(
                description.contains("install message broker"),
                "unexpected description: {description}"
            );
        }
        other => panic!("expected StepFailed, got {other}"),
    }
    assert_eq!(attempts_started(&events), 3);
    // The rest of the batch is aborted.
    assert!(
        !log.lock().unwrap().runs.iter().any(|r| r == "never-reached")
    );
}

#[test]
fn state_apply_is_issued_from_the_control_node() {
    let (env, log) = test_env(toml::from_str("").unwrap());
    let (executor, _) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
do = "state.apply"
target = "roles:minion"
states = ["common.packages", "common.repos"]
kwargs = { test = "True" }
"#,
    );

    executor.run(&env, &ops, "cm").unwrap();
    let runs = log.lock().unwrap().runs.clone();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0],
        "salt 'roles:minion' state.apply common.packages,common.repos test=True"
    );
}

#[test]
fn transport_errors_count_as_failed_attempts() {
    // An unknown node makes open_session fail; with skip-on-fail the
    // batch still completes.
    let (env, _log) = test_env(toml::from_str("").unwrap());
    let (executor, events) = test_executor();
    let ops = ops_from(
        r#"
[[batch]]
cmd = "true"
node = "ghost"
retry = { count = 2, delay = 0 }
"skip-on-fail" = true
"#,
    );

    executor.run(&env, &ops, "ghost-batch").unwrap();
    assert_eq!(attempts_started(&events), 2);
    assert_eq!(ops_skipped(&events), 1);
}
