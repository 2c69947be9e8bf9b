use std::fs;
use std::time::Duration;

use rhea_lab_orchestrator::Error;
use rhea_lab_orchestrator::backend;
use rhea_lab_orchestrator::config::ConfigDoc;

fn doc_with(dir: &tempfile::TempDir, body: &str) -> ConfigDoc {
    ConfigDoc::in_memory(
        toml::from_str(&format!(
            r#"
[lab]
name = "sumo"

[checkpoints]
dir = "{}"
{body}
"#,
            dir.path().display()
        ))
        .unwrap(),
    )
}

#[test]
fn passthrough_label_match_is_present() {
    let dir = tempfile::tempdir().unwrap();
    let doc = doc_with(
        &dir,
        r#"
[backend]
kind = "passthrough"
[backend.passthrough]
current_checkpoint = "services"
"#,
    );
    let backend = backend::from_config(&doc).unwrap();
    assert!(backend.has("services").unwrap());
}

#[test]
fn passthrough_label_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let doc = doc_with(
        &dir,
        r#"
[backend]
kind = "passthrough"
[backend.passthrough]
current_checkpoint = "services"
"#,
    );
    let backend = backend::from_config(&doc).unwrap();
    let err = backend.has("workload").unwrap_err();
    match err {
        Error::EnvironmentWrongState { expected, actual } => {
            assert_eq!(expected, "workload");
            assert_eq!(actual, "services");
        }
        other => panic!("expected EnvironmentWrongState, got {other}"),
    }
}

#[test]
fn passthrough_requires_a_declared_state_label() {
    let dir = tempfile::tempdir().unwrap();
    let doc = doc_with(&dir, "[backend]\nkind = \"passthrough\"");
    let err = backend::from_config(&doc).unwrap_err().to_string();
    assert!(err.contains("current_checkpoint"), "unexpected err: {err}");
}

#[test]
fn cloud_checkpoint_existence_is_descriptor_existence() {
    let dir = tempfile::tempdir().unwrap();
    let doc = doc_with(&dir, "[backend]\nkind = \"cloud\"");
    let backend = backend::from_config(&doc).unwrap();

    assert!(!backend.has("services").unwrap());
    assert!(!backend.has_config("services").unwrap());

    fs::write(dir.path().join("sumo_services.toml"), "x = 1\n").unwrap();
    assert!(backend.has("services").unwrap());
    assert!(backend.has_config("services").unwrap());
}

#[test]
fn cloud_start_without_outputs_file_is_uninitialized() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-outputs.json");
    let doc = doc_with(
        &dir,
        &format!(
            "[backend]\nkind = \"cloud\"\n[backend.cloud]\noutputs_file = \"{}\"",
            missing.display()
        ),
    );
    let mut backend = backend::from_config(&doc).unwrap();
    let err = backend.start("*", Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, Error::EnvironmentNotInitialized));
}

#[test]
fn cloud_failed_stack_status_is_a_bad_state() {
    let dir = tempfile::tempdir().unwrap();
    let outputs = dir.path().join("stack-outputs.json");
    fs::write(&outputs, r#"{"status": "CREATE_FAILED", "nodes": []}"#).unwrap();
    let doc = doc_with(
        &dir,
        &format!(
            "[backend]\nkind = \"cloud\"\n[backend.cloud]\noutputs_file = \"{}\"",
            outputs.display()
        ),
    );
    let mut backend = backend::from_config(&doc).unwrap();
    let err = backend.start("*", Duration::from_secs(1)).unwrap_err();
    assert!(
        matches!(err, Error::EnvironmentBadState(ref s) if s == "CREATE_FAILED"),
        "expected EnvironmentBadState, got {err}"
    );
}

#[test]
fn cloud_unexpected_stack_status_is_a_wrong_state() {
    let dir = tempfile::tempdir().unwrap();
    let outputs = dir.path().join("stack-outputs.json");
    fs::write(&outputs, r#"{"status": "CREATE_IN_PROGRESS", "nodes": []}"#).unwrap();
    let doc = doc_with(
        &dir,
        &format!(
            "[backend]\nkind = \"cloud\"\n[backend.cloud]\noutputs_file = \"{}\"",
            outputs.display()
        ),
    );
    let mut backend = backend::from_config(&doc).unwrap();
    let err = backend.start("*", Duration::from_secs(1)).unwrap_err();
    match err {
        Error::EnvironmentWrongState { expected, actual } => {
            assert_eq!(expected, "CREATE_COMPLETE");
            assert_eq!(actual, "CREATE_IN_PROGRESS");
        }
        other => panic!("expected EnvironmentWrongState, got {other}"),
    }
}

#[test]
fn cloud_discovery_filters_on_roles() {
    let dir = tempfile::tempdir().unwrap();
    let outputs = dir.path().join("stack-outputs.json");
    fs::write(
        &outputs,
        r#"{
  "status": "CREATE_COMPLETE",
  "nodes": [
    {"name": "master", "roles": ["control"], "addr": "10.0.0.1"},
    {"name": "web01", "roles": ["minion"], "addr": "10.0.0.2"}
  ]
}"#,
    )
    .unwrap();
    let doc = doc_with(
        &dir,
        &format!(
            "[backend]\nkind = \"cloud\"\n[backend.cloud]\noutputs_file = \"{}\"",
            outputs.display()
        ),
    );
    let backend = backend::from_config(&doc).unwrap();

    let all = backend.discover_addresses("*").unwrap();
    assert_eq!(all.len(), 2);
    let minions = backend.discover_addresses("minion").unwrap();
    assert_eq!(minions.len(), 1);
    assert_eq!(minions[0].name, "web01");
}

#[test]
fn unknown_backend_kind_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let doc = doc_with(&dir, "[backend]\nkind = \"teleport\"");
    let err = backend::from_config(&doc).unwrap_err().to_string();
    assert!(err.contains("unknown backend.kind"), "unexpected err: {err}");
}
