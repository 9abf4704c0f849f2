use api_flows::bridge::{BridgeError, HttpTransport, TransportRequest, TransportResponse};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_flow(dir: &Path, filename: &str, content: &str) {
    fs::write(dir.join(filename), content).expect("Failed to write flow file");
}

pub fn write_session_config(dir: &Path, content: &str) {
    fs::write(dir.join("session.yaml"), content).expect("Failed to write session.yaml");
}

pub fn simple_flow(name: &str) -> String {
    format!(
        r#"
name: {}
steps:
  - id: ping
    method: GET
    url: "{{{{input.base}}}}/ping"
"#,
        name
    )
}

pub fn invalid_flow(name: &str) -> String {
    format!(
        r#"
name: {}
steps:
  - id: a
    method: GET
    url: "http://h/a"
  - id: a
    method: GET
"#,
        name
    )
}

/// Transport that answers from a route table and records every request.
///
/// - URLs containing `/slow` take an extra 150ms
/// - URLs containing `/network-error` fail with a transport error
/// - URLs containing `/panic` panic inside the transport
/// - routed URLs answer with their configured status and body
/// - anything else answers 200 with `{"url": ..., "method": ...}`
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<TransportRequest>>,
    events: Mutex<Vec<String>>,
    routes: Mutex<HashMap<String, (u16, Value)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn route(self, url: &str, status: u16, body: Value) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body));
        self
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// `start <url>` and `end <url>` entries in the order they happened
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, BridgeError> {
        self.requests.lock().unwrap().push(request.clone());
        self.events.lock().unwrap().push(format!("start {}", request.url));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if request.url.contains("/slow") {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("end {}", request.url));

        if request.url.contains("/network-error") {
            return Err(BridgeError::RequestFailed("connection refused".to_string()));
        }
        if request.url.contains("/panic") {
            panic!("transport panicked");
        }

        let routed = self.routes.lock().unwrap().get(&request.url).cloned();
        let response = match routed {
            Some((status, body)) => TransportResponse::with_status(status, body),
            None => TransportResponse::with_status(
                200,
                json!({ "url": request.url, "method": request.method }),
            ),
        };
        Ok(response)
    }
}
