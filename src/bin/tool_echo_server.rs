//! Minimal line-delimited JSON-RPC tool server
//!
//! Reads one request per line from stdin and writes one response per line to
//! stdout. Tools:
//! - `echo`: returns the tool name and the arguments it received
//! - `state`: returns the `__state` object attached to the arguments
//! - `fail`: always answers with a tool error
//! - `hang`: never answers

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const TOOL_ERROR: i32 = -32000;
}

fn list_tools() -> Value {
    json!({
        "tools": [
            { "name": "echo", "description": "Return the received arguments" },
            { "name": "state", "description": "Return the attached variable state" },
            { "name": "fail", "description": "Always fail" },
            { "name": "hang", "description": "Never respond" },
        ]
    })
}

/// Handle one request. `None` means no response is written.
fn handle_request(request: RpcRequest) -> Option<RpcResponse> {
    let id = request.id;
    match request.method.as_str() {
        "tools/list" => Some(RpcResponse::success(id, list_tools())),
        "tools/call" => {
            let Some(name) = request.params.get("name").and_then(Value::as_str) else {
                return Some(RpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Missing 'name' param",
                ));
            };
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Null);

            match name {
                "echo" => Some(RpcResponse::success(
                    id,
                    json!({ "tool": name, "arguments": arguments }),
                )),
                "state" => Some(RpcResponse::success(
                    id,
                    arguments.get("__state").cloned().unwrap_or(Value::Null),
                )),
                "fail" => Some(RpcResponse::error(id, error_codes::TOOL_ERROR, "tool failed")),
                "hang" => None,
                other => Some(RpcResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Unknown tool: {}", other),
                )),
            }
        }
        _ => Some(RpcResponse::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            "Method not found",
        )),
    }
}

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => handle_request(request),
            Err(e) => Some(RpcResponse::error(0, error_codes::PARSE_ERROR, e.to_string())),
        };

        let Some(response) = response else {
            continue;
        };

        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(_) => continue,
        };
        if writeln!(stdout, "{}", json).is_err() || stdout.flush().is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            id: 7,
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_echo() {
        let response = handle_request(request(
            "tools/call",
            json!({ "name": "echo", "arguments": { "a": 1 } }),
        ))
        .unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(
            response.result,
            Some(json!({ "tool": "echo", "arguments": { "a": 1 } }))
        );
    }

    #[test]
    fn test_hang_and_unknown() {
        assert!(handle_request(request("tools/call", json!({ "name": "hang" }))).is_none());

        let response = handle_request(request("nope", json!({}))).unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }
}
