//! Tool server bridge - a protocol server running as a subprocess
//!
//! The server reads JSON-RPC requests from stdin and writes responses to
//! stdout, one JSON object per line. Calls are correlated by id through the
//! bridge's own pending table, each with its own timeout.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rpc::{send_request, spawn_communication_task, PendingRequests, RequestIds, RpcRequest};
use super::BridgeError;
use crate::workflow::ServerConfig;

/// Bridge to a protocol server subprocess. Calls take `&self`, so any
/// number may be in flight at once and `shutdown` can cancel them.
pub struct ToolServerBridge {
    outbound: Mutex<Option<mpsc::Sender<RpcRequest>>>,
    pending: PendingRequests,
    ids: RequestIds,
    child: Mutex<Option<Child>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Resolve the server executable through PATH unless it is already a path
fn locate_program(command: &str, working_dir: Option<&str>) -> Result<PathBuf, BridgeError> {
    let path = PathBuf::from(command);
    if path.components().count() > 1 {
        let candidate = match working_dir {
            Some(dir) if path.is_relative() => PathBuf::from(dir).join(&path),
            _ => path,
        };
        return if candidate.exists() {
            Ok(candidate)
        } else {
            Err(BridgeError::StartupFailed(format!(
                "server executable not found: {}",
                candidate.display()
            )))
        };
    }

    which::which(command).map_err(|e| {
        BridgeError::StartupFailed(format!("could not locate '{}': {}", command, e))
    })
}

impl ToolServerBridge {
    /// Spawn the server described by `config`
    pub async fn start(config: &ServerConfig) -> Result<Self, BridgeError> {
        let program = locate_program(&config.command, config.working_dir.as_deref())?;
        info!("Starting tool server: {} {:?}", program.display(), config.args);

        let mut command = Command::new(&program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            BridgeError::StartupFailed(format!("Failed to spawn {}: {}", program.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::StartupFailed("server stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::StartupFailed("server stdout unavailable".into()))?;

        let pending = PendingRequests::new();
        let (outbound, outbound_rx) = mpsc::channel(100);
        let io_task = spawn_communication_task(outbound_rx, pending.clone(), stdin, stdout);

        Ok(Self {
            outbound: Mutex::new(Some(outbound)),
            pending,
            ids: RequestIds::default(),
            child: Mutex::new(Some(child)),
            io_task: Mutex::new(Some(io_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Send a request and wait up to `timeout` for the correlated response
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let outbound = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::SessionClosed)?;
        let request = self.ids.request(method, params);
        debug!("-> {} #{}", method, request.id);

        match send_request(&outbound, &self.pending, request, timeout).await {
            // the I/O task went away because the bridge was shut down
            Err(BridgeError::Disconnected) if self.is_closed() => Err(BridgeError::SessionClosed),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Invoke a tool by name
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
            timeout,
        )
        .await
    }

    /// List the tools the server exposes
    pub async fn list_tools(&self, timeout: Duration) -> Result<Value, BridgeError> {
        self.request("tools/list", json!({}), timeout).await
    }

    /// Number of calls still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the subprocess is still alive
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Fail pending calls, close stdin, and wait up to `grace` for the
    /// process to exit before killing it.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), BridgeError> {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound.lock().await.take();

        // Aborting the I/O task drops the child's stdin. Wait for it to go so
        // no call can be routed after the pending table is drained.
        let task = self.io_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let failed = self.pending.fail_all(|| BridgeError::SessionClosed);
        if failed > 0 {
            info!("Cancelled {} pending call(s) on shutdown", failed);
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Tool server exited with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(BridgeError::IoError(e)),
            Err(_) => {
                warn!("Tool server did not exit within {:?}, killing it", grace);
                child.kill().await?;
                Ok(())
            }
        }
    }
}

impl Drop for ToolServerBridge {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.get_mut().take() {
            task.abort();
        }
    }
}
