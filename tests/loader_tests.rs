mod common;

use api_flows::prelude::*;
use api_flows::workflow::InputType;
use common::*;
use serde_json::{json, Map};

#[test]
fn test_load_empty_directory() {
    let dir = create_test_dir();
    let flows = FlowLoader::load_directory(dir.path()).unwrap();
    assert!(flows.is_empty());
}

#[test]
fn test_load_multiple_flows() {
    let dir = create_test_dir();
    write_flow(dir.path(), "a.yaml", &simple_flow("flow-a"));
    write_flow(dir.path(), "b.yml", &simple_flow("flow-b"));
    write_session_config(dir.path(), "timeout: 1000");

    let flows = FlowLoader::load_directory(dir.path()).unwrap();
    let names: Vec<_> = flows.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["flow-a", "flow-b"]);
}

#[test]
fn test_unnamed_flow_keyed_by_file_stem() {
    let dir = create_test_dir();
    write_flow(
        dir.path(),
        "health.yaml",
        "steps:\n  - id: ping\n    method: GET\n    url: http://h/ping\n",
    );

    let flows = FlowLoader::load_directory(dir.path()).unwrap();
    assert_eq!(flows[0].0, "health");
    assert_eq!(flows[0].1.version, "1.0");
}

#[test]
fn test_invalid_yaml_is_error() {
    let dir = create_test_dir();
    write_flow(dir.path(), "bad.yaml", "steps: [unclosed");

    let err = FlowLoader::load_directory(dir.path()).unwrap_err();
    assert!(matches!(err, LoadError::Yaml { .. }));
}

#[test]
fn test_step_fields_and_aliases() {
    let flow = FlowLoader::from_json_str(
        r#"{
  "flowInputs": [{ "name": "limit", "type": "number", "default": 10 }],
  "steps": [
    { "id": "list", "endpointId": "list-users", "expectedStatus": 200,
      "headers": { "Accept": "application/json" } },
    { "id": "create", "method": "POST", "url": "http://h/users",
      "body": { "name": "{{input.name}}" }, "timeout": 5000,
      "extract": { "id": "response.id" } }
  ]
}"#,
    )
    .unwrap();

    assert_eq!(flow.steps[0].operation.as_deref(), Some("list-users"));
    assert_eq!(flow.steps[0].expected_status, Some(200));
    assert_eq!(flow.steps[1].timeout, Some(5000));
    assert_eq!(flow.steps[1].extract["id"], "response.id");
    assert_eq!(flow.flow_inputs[0].input_type, InputType::Number);

    let inputs = flow.resolve_inputs(&Map::new()).unwrap();
    assert_eq!(inputs["limit"], json!(10));

    let mut wrong = Map::new();
    wrong.insert("limit".to_string(), json!("ten"));
    let errors = flow.resolve_inputs(&wrong).unwrap_err();
    assert_eq!(errors, vec!["Input 'limit' must be of type number, got string".to_string()]);
}

#[test]
fn test_session_config_load() {
    let dir = create_test_dir();
    write_session_config(
        dir.path(),
        r#"
timeout: 2000
history_limit: 3
max_age: 90m
server:
  command: tool-echo-server
environment:
  base: "http://h"
"#,
    );

    let config = SessionConfig::load(dir.path().join("session.yaml")).unwrap();
    assert_eq!(config.timeout, 2000);
    assert_eq!(config.history_limit, 3);
    assert_eq!(config.max_age_duration().unwrap().as_secs(), 90 * 60);
    assert_eq!(config.environment["base"], "http://h");
}

#[test]
fn test_session_config_bad_max_age() {
    let dir = create_test_dir();
    write_session_config(dir.path(), "max_age: soon");

    let err = SessionConfig::load(dir.path().join("session.yaml")).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { .. }));
}
