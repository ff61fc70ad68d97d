//! Tool-server registry: servers keyed by unique name and the tools they expose

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use toolgate_core::{ActiveTool, ServerStatus, Tool, ToolServer, ToolSpec, Transport};

use crate::db::{Database, conversion_error, parse_timestamp};

/// Durable catalog of tool servers and their tools
#[derive(Clone)]
pub struct Registry {
    db: Database,
}

impl Registry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a server by name. Re-registration overwrites the transport,
    /// marks the server active and refreshes `updated_at`. Returns the server id.
    pub async fn register_server(&self, name: &str, transport: &Transport) -> Result<String> {
        let name = name.trim().to_owned();
        if name.is_empty() {
            return Err(anyhow!("Server name cannot be empty"));
        }
        let kind = transport.kind().to_string();
        let config = serde_json::to_string(transport).context("Failed to serialize transport")?;

        self.db
            .with_conn(move |conn| {
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "INSERT INTO servers (id, name, transport_kind, transport_config, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
                     ON CONFLICT(name) DO UPDATE SET
                        transport_kind = excluded.transport_kind,
                        transport_config = excluded.transport_config,
                        status = 'active',
                        updated_at = excluded.updated_at",
                    params![Uuid::new_v4().to_string(), &name, &kind, &config, &now],
                )?;

                let id: String = conn.query_row(
                    "SELECT id FROM servers WHERE name = ?1",
                    params![&name],
                    |row| row.get(0),
                )?;

                info!("Registered tool server '{}' ({}, {})", name, kind, id);
                Ok(id)
            })
            .await
    }

    /// Fetch a server by name
    pub async fn get_server(&self, name: &str) -> Result<Option<ToolServer>> {
        let name = name.to_owned();
        self.db
            .with_conn(move |conn| {
                let server = conn
                    .query_row(
                        "SELECT id, name, transport_config, status, created_at, updated_at
                         FROM servers WHERE name = ?1",
                        params![&name],
                        Self::row_to_server,
                    )
                    .optional()?;
                Ok(server)
            })
            .await
    }

    /// All servers, ordered by name
    pub async fn list_servers(&self) -> Result<Vec<ToolServer>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, transport_config, status, created_at, updated_at
                     FROM servers ORDER BY name",
                )?;
                let servers = stmt
                    .query_map([], Self::row_to_server)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(servers)
            })
            .await
    }

    /// Change a server's status. Errors if no such server exists.
    pub async fn set_server_status(&self, name: &str, status: ServerStatus) -> Result<()> {
        let name = name.to_owned();
        self.db
            .with_conn(move |conn| {
                let updated = conn.execute(
                    "UPDATE servers SET status = ?1, updated_at = ?2 WHERE name = ?3",
                    params![status.to_string(), Utc::now().to_rfc3339(), &name],
                )?;
                if updated == 0 {
                    return Err(anyhow!("Server '{}' not found", name));
                }
                debug!("Server '{}' status set to {}", name, status);
                Ok(())
            })
            .await
    }

    /// Delete a server and, by cascade, its tools. Returns whether it existed.
    pub async fn delete_server(&self, name: &str) -> Result<bool> {
        let name = name.to_owned();
        self.db
            .with_conn(move |conn| {
                let deleted = conn.execute("DELETE FROM servers WHERE name = ?1", params![&name])?;
                if deleted > 0 {
                    info!("Deleted tool server '{}'", name);
                }
                Ok(deleted > 0)
            })
            .await
    }

    /// Replace a server's tool set wholesale. Runs in one transaction: on any
    /// failure the previous tool set is left untouched.
    pub async fn replace_tools(&self, server_id: &str, tools: Vec<ToolSpec>) -> Result<()> {
        let server_id = server_id.to_owned();
        self.db
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM tools WHERE server_id = ?1", params![&server_id])?;

                {
                    let mut insert = tx.prepare(
                        "INSERT INTO tools (id, server_id, name, description, input_schema)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for tool in &tools {
                        let schema = serde_json::to_string(&tool.input_schema)?;
                        insert
                            .execute(params![
                                Uuid::new_v4().to_string(),
                                &server_id,
                                &tool.name,
                                &tool.description,
                                schema,
                            ])
                            .with_context(|| format!("Failed to insert tool '{}'", tool.name))?;
                    }
                }

                tx.commit()?;
                debug!(
                    "Replaced tools for server {}: {} removed, {} inserted",
                    server_id,
                    removed,
                    tools.len()
                );
                Ok(())
            })
            .await
    }

    /// Stored tools of one server, ordered by name
    pub async fn list_tools_for(&self, server_name: &str) -> Result<Vec<Tool>> {
        let server_name = server_name.to_owned();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT t.id, t.server_id, t.name, t.description, t.input_schema
                     FROM tools t JOIN servers s ON s.id = t.server_id
                     WHERE s.name = ?1
                     ORDER BY t.name",
                )?;
                let tools = stmt
                    .query_map(params![&server_name], |row| {
                        let schema: String = row.get(4)?;
                        Ok(Tool {
                            id: row.get(0)?,
                            server_id: row.get(1)?,
                            name: row.get(2)?,
                            description: row.get(3)?,
                            input_schema: serde_json::from_str(&schema)
                                .map_err(|e| conversion_error(4, e))?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tools)
            })
            .await
    }

    /// Tools of every active server, joined with the owning server's name and kind
    pub async fn list_all_active_tools(&self) -> Result<Vec<ActiveTool>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT t.name, t.description, t.input_schema, s.name, s.transport_kind
                     FROM tools t JOIN servers s ON s.id = t.server_id
                     WHERE s.status = 'active'
                     ORDER BY s.name, t.name",
                )?;
                let tools = stmt
                    .query_map([], |row| {
                        let schema: String = row.get(2)?;
                        let kind: String = row.get(4)?;
                        Ok(ActiveTool {
                            name: row.get(0)?,
                            description: row.get(1)?,
                            input_schema: serde_json::from_str(&schema)
                                .map_err(|e| conversion_error(2, e))?,
                            server_name: row.get(3)?,
                            transport_kind: kind
                                .parse()
                                .map_err(|e: anyhow::Error| conversion_error(4, StoreParseError(e.to_string())))?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tools)
            })
            .await
    }

    /// Active servers exposing `tool_name`, ordered by server name to match
    /// `list_all_active_tools`
    pub async fn find_tool_owners(&self, tool_name: &str) -> Result<Vec<ToolServer>> {
        let tool_name = tool_name.to_owned();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.name, s.transport_config, s.status, s.created_at, s.updated_at
                     FROM tools t JOIN servers s ON s.id = t.server_id
                     WHERE t.name = ?1 AND s.status = 'active'
                     ORDER BY s.name",
                )?;
                let servers = stmt
                    .query_map(params![&tool_name], Self::row_to_server)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(servers)
            })
            .await
    }

    fn row_to_server(row: &rusqlite::Row) -> rusqlite::Result<ToolServer> {
        let config: String = row.get(2)?;
        let status: String = row.get(3)?;
        Ok(ToolServer {
            id: row.get(0)?,
            name: row.get(1)?,
            transport: serde_json::from_str(&config).map_err(|e| conversion_error(2, e))?,
            status: status
                .parse()
                .map_err(|e: anyhow::Error| conversion_error(3, StoreParseError(e.to_string())))?,
            created_at: parse_timestamp(&row.get::<_, String>(4)?),
            updated_at: parse_timestamp(&row.get::<_, String>(5)?),
        })
    }
}

/// Enum column holding an unknown value
#[derive(Debug)]
pub(crate) struct StoreParseError(pub String);

impl std::fmt::Display for StoreParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StoreParseError {}
