//! Subprocess transport: MCP over a child's stdin/stdout, one JSON message per line

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use toolgate_core::ToolSpec;

use crate::DownstreamClient;
use crate::pending::{PendingRequests, truncate};
use crate::protocol::{self, JsonRpcRequest, PROTOCOL_VERSION};

/// Downstream client for a subprocess-kind tool server
pub struct StdioClient {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl StdioClient {
    /// Spawn the server process and complete the MCP handshake
    pub async fn connect(
        name: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>> {
        info!("Connecting to MCP server: {} ({})", name, command);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server: {}", command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture MCP server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture MCP server stdout"))?;

        // Drain stderr in background so server errors are visible in logs
        if let Some(stderr) = child.stderr.take() {
            let server_name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!("MCP server '{}' stderr: {}", server_name, line);
                    }
                }
            });
        }

        let pending = PendingRequests::new();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(name.to_string(), stdout, pending.clone(), Arc::clone(&closed));

        let client = Arc::new(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pending,
            closed,
            reader,
        });

        // Slow servers (npx installs) need a generous handshake window
        tokio::time::timeout(connect_timeout, client.initialize())
            .await
            .map_err(|_| {
                anyhow!(
                    "MCP server '{}' initialize timed out after {}s",
                    client.name,
                    connect_timeout.as_secs()
                )
            })??;

        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let result = self
            .send_request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "toolgate",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await?;

        debug!("MCP initialize response from {}: {:?}", self.name, result);

        self.send_notification("notifications/initialized").await?;

        info!("MCP client connected to {}", self.name);
        Ok(())
    }

    /// Send a JSON-RPC request and wait for the matching response
    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let (id, rx, _guard) = self.pending.register();
        // Checked after registering so a concurrent fail_all cannot strand the waiter
        if self.closed.load(Ordering::Acquire) {
            bail!("MCP server '{}' is not running", self.name);
        }
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))? + "\n";
        self.write_line(&line).await?;

        let response = rx
            .await
            .map_err(|_| anyhow!("MCP server '{}' closed connection", self.name))?;
        protocol::into_result(response)
    }

    async fn send_notification(&self, method: &str) -> Result<()> {
        let note = JsonRpcRequest::notification(method, serde_json::json!({}));
        let line = serde_json::to_string(&note)? + "\n";
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| anyhow!("MCP server stdin not available"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write to MCP server '{}'", self.name))?;
        stdin.flush().await?;
        Ok(())
    }
}

fn spawn_reader(
    name: String,
    stdout: ChildStdout,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(msg) => {
                            pending.resolve(msg);
                        }
                        Err(e) => warn!(
                            "Invalid JSON from MCP server '{}' ({}): {}",
                            name,
                            e,
                            truncate(line, 100)
                        ),
                    }
                }
                Ok(None) => {
                    info!("MCP server '{}' closed stdout", name);
                    break;
                }
                Err(e) => {
                    warn!("Read error from MCP server '{}': {}", name, e);
                    break;
                }
            }
        }
        closed.store(true, Ordering::Release);
        pending.fail_all();
    })
}

#[async_trait]
impl DownstreamClient for StdioClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self.send_request("tools/list", serde_json::json!({})).await?;
        let tools = protocol::parse_tool_list(result)?;
        info!("Discovered {} tools from MCP server {}", tools.len(), self.name);
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        debug!("Calling MCP tool {} on {}", name, self.name);
        self.send_request(
            "tools/call",
            serde_json::json!({
                "name": name,
                "arguments": arguments,
            }),
        )
        .await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stdin.lock().await.take();

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            let _ = child.kill().await;
            info!("MCP server '{}' stopped", self.name);
        }
        self.pending.fail_all();
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        self.reader.abort();
        // Can't await in drop
        if let Ok(mut guard) = self.child.try_lock()
            && let Some(ref mut child) = *guard
        {
            let _ = child.start_kill();
        }
    }
}
