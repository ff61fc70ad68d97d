//! Tool routing: discovery, ownership resolution, authorization, dispatch
//! with retry and timeout, and one audit row per call

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use toolgate_core::config::ServerManifest;
use toolgate_core::{
    CallStatus, GatewayError, GatewaySettings, NativeCatalog, NativeTool, NewCallLog, ServerStatus,
    ToolServer, ToolSpec, TransportKind, UNKNOWN_SERVER,
};
use toolgate_mcp::protocol::{self, ToolCallResult};
use toolgate_store::{CallLog, Policy, Registry};

use crate::auth::redact_credentials;
use crate::pool::ConnectionPool;

/// Attempt budget for downstream calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Deadline for each attempt
    pub call_timeout: Duration,
    /// Backoff after attempt `n` is `n * backoff_base`
    pub backoff_base: Duration,
}

impl From<&GatewaySettings> for RetryPolicy {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            call_timeout: settings.call_timeout(),
            backoff_base: settings.backoff_base(),
        }
    }
}

/// Outcome of registering a server through the gateway
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub tools: usize,
    /// Set when discovery against the server failed. The registration itself stands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

enum Owner {
    Downstream(ToolServer),
    Native {
        server: String,
        tool: Arc<dyn NativeTool>,
    },
}

impl Owner {
    fn server_name(&self) -> &str {
        match self {
            Owner::Downstream(server) => &server.name,
            Owner::Native { server, .. } => server,
        }
    }
}

pub struct Gateway {
    registry: Registry,
    policy: Policy,
    call_log: CallLog,
    natives: NativeCatalog,
    pool: ConnectionPool,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(
        registry: Registry,
        policy: Policy,
        call_log: CallLog,
        natives: NativeCatalog,
        pool: ConnectionPool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            policy,
            call_log,
            natives,
            pool,
            retry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn call_log(&self) -> &CallLog {
        &self.call_log
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Tools visible to `role`: registry tools of active servers, then native
    /// tools, filtered through the policy. A name seen twice keeps its first
    /// callable owner, the same one `call_tool` resolves to.
    pub async fn list_tools(&self, role: &str) -> Result<Vec<ToolSpec>> {
        let mut candidates = self.registry.list_all_active_tools().await?;
        candidates.extend(self.natives.list());

        let mut seen = HashSet::new();
        let mut visible = Vec::new();
        for tool in candidates {
            if !self.is_callable(tool.transport_kind, &tool.name) {
                continue;
            }
            if !seen.insert(tool.name.clone()) {
                continue;
            }
            if self
                .policy
                .can_access(role, &tool.server_name, &tool.name)
                .await?
            {
                visible.push(ToolSpec {
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }

        debug!("Role '{}' can see {} tools", role, visible.len());
        Ok(visible)
    }

    /// Route one tool call and record its terminal outcome. Returns the MCP
    /// `tools/call` result object.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        role: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        let started = Instant::now();
        let (server_name, outcome) = self.route(tool_name, arguments, role, cancel).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => info!(
                session_id,
                "Tool {}:{} succeeded for role '{}' ({}ms)",
                server_name,
                tool_name,
                role,
                latency_ms
            ),
            Err(e) => warn!(
                session_id,
                "Tool {}:{} failed for role '{}' ({}ms): {}",
                server_name,
                tool_name,
                role,
                latency_ms,
                e
            ),
        }

        let entry = NewCallLog {
            session_id: session_id.to_string(),
            role: role.to_string(),
            server_name,
            tool_name: tool_name.to_string(),
            status: if outcome.is_ok() {
                CallStatus::Success
            } else {
                CallStatus::Error
            },
            latency_ms,
            error_message: outcome
                .as_ref()
                .err()
                .map(|e| redact_credentials(&e.to_string())),
        };
        if let Err(e) = self.call_log.log_call(entry).await {
            error!("Failed to record call log for {}: {:#}", tool_name, e);
        }

        outcome
    }

    /// Resolve, authorize and execute. Returns the owning server name for the
    /// log alongside the outcome.
    async fn route(
        &self,
        tool_name: &str,
        arguments: Value,
        role: &str,
        cancel: &CancellationToken,
    ) -> (String, Result<Value, GatewayError>) {
        let owner = match self.resolve(tool_name).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                return (
                    UNKNOWN_SERVER.to_string(),
                    Err(GatewayError::NotFound(tool_name.to_string())),
                );
            }
            Err(e) => return (UNKNOWN_SERVER.to_string(), Err(e.into())),
        };
        let server_name = owner.server_name().to_string();

        match self.policy.can_access(role, &server_name, tool_name).await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    server_name,
                    Err(GatewayError::Forbidden {
                        role: role.to_string(),
                        tool: tool_name.to_string(),
                    }),
                );
            }
            Err(e) => return (server_name, Err(e.into())),
        }

        let outcome = match owner {
            Owner::Native { tool, .. } => execute_native(tool.as_ref(), arguments, cancel).await,
            Owner::Downstream(server) => {
                self.execute_downstream(&server, tool_name, arguments, cancel)
                    .await
            }
        };
        (server_name, outcome)
    }

    /// Registry first, then the native catalog, by exact name. A registered
    /// native server only describes its tools, so it owns a name only when
    /// the catalog implements it.
    async fn resolve(&self, tool_name: &str) -> Result<Option<Owner>> {
        for server in self.registry.find_tool_owners(tool_name).await? {
            if server.transport.kind() != TransportKind::Native {
                return Ok(Some(Owner::Downstream(server)));
            }
            if let Some((_, tool)) = self.natives.get(tool_name) {
                return Ok(Some(Owner::Native {
                    server: server.name,
                    tool,
                }));
            }
        }

        Ok(self.natives.get(tool_name).map(|(server, tool)| Owner::Native {
            server: server.to_string(),
            tool,
        }))
    }

    fn is_callable(&self, kind: TransportKind, tool_name: &str) -> bool {
        kind != TransportKind::Native || self.natives.get(tool_name).is_some()
    }

    async fn execute_downstream(
        &self,
        server: &ToolServer,
        tool_name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        let client = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            client = self.pool.get(server) => client.map_err(|e| GatewayError::Connection {
                server: server.name.clone(),
                message: format!("{:#}", e),
            })?,
        };

        let attempts = self.retry.max_attempts.max(1);
        let mut last_err = GatewayError::Execution(format!("{} was never attempted", tool_name));

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                outcome = tokio::time::timeout(
                    self.retry.call_timeout,
                    client.call_tool(tool_name, arguments.clone()),
                ) => outcome,
            };

            let err = match outcome {
                Ok(Ok(result)) if !protocol::is_error_result(&result) => {
                    if attempt > 1 {
                        info!(
                            "Tool {} on {} succeeded on attempt {}/{}",
                            tool_name, server.name, attempt, attempts
                        );
                    }
                    return Ok(result);
                }
                Ok(Ok(result)) => GatewayError::Execution(protocol::extract_text(&result)),
                Ok(Err(e)) => GatewayError::Execution(format!("{:#}", e)),
                Err(_) => GatewayError::Timeout {
                    tool: tool_name.to_string(),
                    after: self.retry.call_timeout,
                },
            };
            warn!(
                "Tool {} on {} failed (attempt {}/{}): {}",
                tool_name, server.name, attempt, attempts, err
            );
            last_err = err;

            if attempt < attempts {
                let backoff = self.retry.backoff_base * attempt;
                debug!(
                    "Retrying tool {} (attempt {}/{}, backoff {:?})",
                    tool_name,
                    attempt + 1,
                    attempts,
                    backoff
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        Err(last_err)
    }

    /// Ask a downstream server for its tools and store them wholesale.
    /// Marks the server active on success and `error` on failure.
    pub async fn sync_tools(&self, server_name: &str) -> Result<usize> {
        let server = self
            .registry
            .get_server(server_name)
            .await?
            .ok_or_else(|| anyhow!("Server '{}' not found", server_name))?;
        if server.transport.kind() == TransportKind::Native {
            bail!(
                "Server '{}' is native; its tools are supplied at registration",
                server_name
            );
        }

        let listed = async {
            let client = self.pool.get(&server).await?;
            tokio::time::timeout(self.retry.call_timeout, client.list_tools())
                .await
                .map_err(|_| {
                    anyhow!(
                        "tools/list on '{}' timed out after {:?}",
                        server.name,
                        self.retry.call_timeout
                    )
                })?
        }
        .await;

        match listed {
            Ok(tools) => {
                let count = tools.len();
                self.registry.replace_tools(&server.id, tools).await?;
                self.registry
                    .set_server_status(&server.name, ServerStatus::Active)
                    .await?;
                info!("Synced {} tools from server '{}'", count, server.name);
                Ok(count)
            }
            Err(e) => {
                warn!("Tool sync for server '{}' failed: {:#}", server.name, e);
                if let Err(status_err) = self
                    .registry
                    .set_server_status(&server.name, ServerStatus::Error)
                    .await
                {
                    warn!(
                        "Failed to mark server '{}' as errored: {:#}",
                        server.name, status_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Upsert a server from a manifest. Declared tools are stored as given;
    /// otherwise non-native servers are asked for theirs. An unreachable
    /// server is still registered.
    pub async fn register(&self, manifest: ServerManifest) -> Result<Registration> {
        let id = self
            .registry
            .register_server(&manifest.name, &manifest.transport)
            .await?;
        // The transport may have changed under an existing connection
        self.pool.evict(&manifest.name).await;

        let mut registration = Registration {
            id: id.clone(),
            name: manifest.name.trim().to_string(),
            tools: 0,
            sync_error: None,
        };

        match manifest.tools {
            Some(tools) => {
                if manifest.transport.kind() == TransportKind::Native {
                    for tool in tools.iter().filter(|t| self.natives.get(&t.name).is_none()) {
                        warn!(
                            "Native server '{}' declares '{}' but no in-process tool implements it; it will not be offered",
                            registration.name, tool.name
                        );
                    }
                }
                registration.tools = tools.len();
                self.registry.replace_tools(&id, tools).await?;
            }
            None if manifest.transport.kind() != TransportKind::Native => {
                match self.sync_tools(&registration.name).await {
                    Ok(count) => registration.tools = count,
                    Err(e) => registration.sync_error = Some(format!("{:#}", e)),
                }
            }
            None => {}
        }

        Ok(registration)
    }

    /// Change a server's status. Leaving `active` drops its pooled connection.
    pub async fn set_server_status(&self, name: &str, status: ServerStatus) -> Result<()> {
        self.registry.set_server_status(name, status).await?;
        if status != ServerStatus::Active {
            self.pool.evict(name).await;
        }
        Ok(())
    }

    /// Remove a server and its tools, closing any pooled connection to it.
    /// Returns whether it existed.
    pub async fn delete_server(&self, name: &str) -> Result<bool> {
        let deleted = self.registry.delete_server(name).await?;
        self.pool.evict(name).await;
        Ok(deleted)
    }

    /// Close every downstream connection (shutdown)
    pub async fn close_all(&self) {
        self.pool.close_all().await;
    }
}

/// Native tools run in-process: no retry, no deadline
async fn execute_native(
    tool: &dyn NativeTool,
    arguments: Value,
    cancel: &CancellationToken,
) -> Result<Value, GatewayError> {
    let text = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        result = tool.execute(arguments) => {
            result.map_err(|e| GatewayError::Execution(format!("{:#}", e)))?
        }
    };
    serde_json::to_value(ToolCallResult::text(text)).map_err(|e| GatewayError::Internal(e.into()))
}
