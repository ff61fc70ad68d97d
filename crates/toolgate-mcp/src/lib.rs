//! MCP (Model Context Protocol) support for toolgate
//!
//! Protocol types shared with the agent-facing session layer, plus the
//! downstream clients the gateway uses to reach subprocess and remote
//! tool servers.

pub mod pending;
pub mod protocol;
pub mod sse;
pub mod stdio;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use toolgate_core::{ToolServer, ToolSpec, Transport};

pub use sse::SseClient;
pub use stdio::StdioClient;

/// A live connection to one downstream tool server
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    fn server_name(&self) -> &str;

    /// MCP `tools/list`
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    /// MCP `tools/call`, returning the raw result object
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    /// True once the underlying process or stream has gone away
    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self);
}

/// Opens downstream connections. The gateway's pool owns one of these so
/// tests can swap in fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ToolServer) -> Result<Arc<dyn DownstreamClient>>;
}

/// Real connector: dispatches on the server's transport kind
#[derive(Debug, Clone)]
pub struct TransportConnector {
    connect_timeout: Duration,
}

impl TransportConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, server: &ToolServer) -> Result<Arc<dyn DownstreamClient>> {
        match &server.transport {
            Transport::Subprocess { command, args, env } => {
                let client =
                    StdioClient::connect(&server.name, command, args, env, self.connect_timeout)
                        .await?;
                Ok(client as Arc<dyn DownstreamClient>)
            }
            Transport::RemoteStream { url } => {
                let client = SseClient::connect(&server.name, url, self.connect_timeout).await?;
                Ok(client as Arc<dyn DownstreamClient>)
            }
            Transport::Native => {
                bail!("Server '{}' is native and has no downstream connection", server.name)
            }
        }
    }
}
