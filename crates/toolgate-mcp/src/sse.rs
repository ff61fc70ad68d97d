//! Remote-stream transport: MCP over HTTP + Server-Sent Events
//!
//! The client opens a long-lived `GET` on the server's SSE URL. The first
//! `endpoint` event names where requests are POSTed. Responses come back
//! asynchronously as `message` events on the open stream.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use toolgate_core::ToolSpec;

use crate::DownstreamClient;
use crate::pending::{PendingRequests, truncate};
use crate::protocol::{self, JsonRpcRequest, PROTOCOL_VERSION};

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines anywhere,
/// including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line dispatches the event
                if self.data.is_empty() {
                    self.event = None;
                } else {
                    events.push(SseEvent {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

/// Downstream client for a remote-stream-kind tool server
pub struct SseClient {
    name: String,
    http: reqwest::Client,
    endpoint: Url,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SseClient {
    /// Open the event stream, wait for the endpoint, then run the MCP handshake
    pub async fn connect(name: &str, url: &str, connect_timeout: Duration) -> Result<Arc<Self>> {
        info!("Connecting to MCP server: {} ({})", name, url);

        let base = Url::parse(url).with_context(|| format!("Invalid MCP server URL: {}", url))?;
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let response = tokio::time::timeout(
            connect_timeout,
            http.get(base.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| anyhow!("MCP server '{}' did not answer within {}s", name, connect_timeout.as_secs()))?
        .with_context(|| format!("Failed to open event stream at {}", url))?
        .error_for_status()
        .with_context(|| format!("MCP server '{}' refused the event stream", name))?;

        let pending = PendingRequests::new();
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = {
            let name = name.to_string();
            let pending = pending.clone();
            let closed = Arc::clone(&closed);
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = response.bytes_stream();
            tokio::spawn(async move {
                let mut parser = SseParser::default();
                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!("Event stream from MCP server '{}' failed: {}", name, e);
                            break;
                        }
                    };
                    for event in parser.feed(&chunk) {
                        match event.event.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            "message" => match serde_json::from_str::<Value>(&event.data) {
                                Ok(msg) => {
                                    pending.resolve(msg);
                                }
                                Err(e) => warn!(
                                    "Invalid JSON from MCP server '{}' ({}): {}",
                                    name,
                                    e,
                                    truncate(&event.data, 100)
                                ),
                            },
                            other => debug!("Ignoring '{}' event from {}", other, name),
                        }
                    }
                }
                info!("Event stream from MCP server '{}' closed", name);
                closed.store(true, Ordering::Release);
                pending.fail_all();
            })
        };

        let endpoint = match tokio::time::timeout(connect_timeout, endpoint_rx).await {
            Ok(Ok(path)) => base
                .join(&path)
                .with_context(|| format!("Invalid endpoint from MCP server '{}': {}", name, path))?,
            Ok(Err(_)) => {
                reader.abort();
                bail!("MCP server '{}' closed the stream before sending an endpoint", name);
            }
            Err(_) => {
                reader.abort();
                bail!("MCP server '{}' sent no endpoint within {}s", name, connect_timeout.as_secs());
            }
        };
        debug!("MCP server {} accepts requests at {}", name, endpoint);

        let client = Arc::new(Self {
            name: name.to_string(),
            http,
            endpoint,
            pending,
            closed,
            reader,
        });

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
        self.send_request(
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

        self.post(&JsonRpcRequest::notification(
            "notifications/initialized",
            serde_json::json!({}),
        ))
        .await?;

        info!("MCP client connected to {}", self.name);
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let (id, rx, _guard) = self.pending.register();
        if self.closed.load(Ordering::Acquire) {
            bail!("Event stream to MCP server '{}' is closed", self.name);
        }

        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let response = rx
            .await
            .map_err(|_| anyhow!("MCP server '{}' closed connection", self.name))?;
        protocol::into_result(response)
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<()> {
        self.http
            .post(self.endpoint.clone())
            .json(message)
            .send()
            .await
            .with_context(|| format!("Failed to POST to MCP server '{}'", self.name))?
            .error_for_status()
            .with_context(|| format!("MCP server '{}' rejected {}", self.name, message.method))?;
        Ok(())
    }
}

#[async_trait]
impl DownstreamClient for SseClient {
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
        self.reader.abort();
        self.pending.fail_all();
        info!("Event stream to MCP server '{}' closed", self.name);
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
