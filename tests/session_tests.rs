mod common;

use api_flows::prelude::*;
use api_flows::workflow::ServerConfig;
use common::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

fn echo_server_config() -> SessionConfig {
    let mut config = SessionConfig::default()
        .with_server(ServerConfig::new(env!("CARGO_BIN_EXE_tool-echo-server")));
    config.shutdown_grace = 1000;
    config
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn started_session() -> SessionController {
    let session =
        SessionController::new(echo_server_config(), Arc::new(MockTransport::new())).unwrap();
    session.start().await.unwrap();
    session
}

#[tokio::test]
async fn test_call_tool_attaches_state() {
    let mut session = started_session().await;
    session.set_environment(object(json!({ "base": "http://h" })));
    session.set_step_output("login", json!({ "status": 200 }));

    let result = session
        .call_tool("echo", json!({ "query": "users" }))
        .await
        .unwrap();

    assert_eq!(result["tool"], "echo");
    assert_eq!(result["arguments"]["query"], "users");
    let state = &result["arguments"]["__state"];
    assert_eq!(state["environment"]["base"], "http://h");
    assert_eq!(state["stepOutputs"]["login"]["status"], 200);
    assert!(state["flowInputs"].is_object());

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_list_tools() {
    let session = started_session().await;
    let tools = session.list_tools().await.unwrap();
    let names: Vec<_> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"echo"));
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tool_error_is_server_error() {
    let session = started_session().await;
    let err = session.call_tool("fail", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::ServerError(_)));
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_removes_pending_call() {
    let mut session = started_session().await;
    session.set_config(object(json!({ "timeout": 200 })));

    let err = session.call_tool("hang", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(200)));
    assert_eq!(session.info().await.pending_calls, 0);

    // the connection is still usable after a timeout
    let result = session.call_tool("echo", json!({})).await.unwrap();
    assert_eq!(result["tool"], "echo");
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_session() {
    let session = started_session().await;
    assert!(session.info().await.server_running);

    session.shutdown().await.unwrap();
    let info = session.info().await;
    assert!(!info.server_running);

    assert!(matches!(
        session.call_tool("echo", json!({})).await,
        Err(BridgeError::SessionClosed)
    ));
    assert!(matches!(session.start().await, Err(BridgeError::SessionClosed)));
}

#[tokio::test]
async fn test_state_tool_sees_flow_outputs() {
    let transport = Arc::new(MockTransport::new().route("http://h/login", 200, json!({ "token": "t" })));
    let mut session = SessionController::new(echo_server_config(), transport).unwrap();
    session.start().await.unwrap();

    let definition = FlowLoader::from_yaml_str(
        r#"
flow_inputs:
  - name: base
    type: string
    required: true
steps:
  - id: login
    method: POST
    url: "{{input.base}}/login"
    extract:
      token: response.token
"#,
    )
    .unwrap();

    let result = session
        .run_flow("login-flow", &definition, object(json!({ "base": "http://h" })))
        .await
        .unwrap();
    assert!(result.success);

    let state = session.call_tool("state", json!({})).await.unwrap();
    assert_eq!(state["runtime"]["step_login_token"], "t");
    assert_eq!(state["stepOutputs"]["login"]["token"], "t");
    assert_eq!(state["flowInputs"]["base"], "http://h");

    let info = session.info().await;
    assert_eq!(info.flows.completed, 1);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_call() {
    let session = Arc::new(started_session().await);

    let in_flight = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call_tool("hang", json!({})).await })
    };

    for _ in 0..200 {
        if session.info().await.pending_calls == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.info().await.pending_calls, 1);

    session.shutdown().await.unwrap();

    let outcome = in_flight.await.unwrap();
    assert!(matches!(outcome, Err(BridgeError::SessionClosed)));
    assert_eq!(session.info().await.pending_calls, 0);
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let session = Arc::new(started_session().await);

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call_tool("echo", json!({ "n": i })).await })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["arguments"]["n"], json!(i));
    }
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_calls_leave_nothing_pending() {
    let session = started_session().await;

    for _ in 0..3 {
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), session.call_tool("hang", json!({})))
                .await;
        assert!(abandoned.is_err());
    }

    assert_eq!(session.info().await.pending_calls, 0);
    session.shutdown().await.unwrap();
}
