//! Built-in native tools served under the `builtin` server

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{FieldKind, NativeCatalog, NativeTool, SchemaField, ToolSchema};

/// Server name the built-in tools are owned by
pub const BUILTIN_SERVER: &str = "builtin";

/// Register every built-in tool into `catalog`
pub fn register_builtins(catalog: &mut NativeCatalog) {
    catalog.register(BUILTIN_SERVER, Arc::new(EchoTool));
    catalog.register(BUILTIN_SERVER, Arc::new(UtcNowTool));
}

/// Returns its `text` argument unchanged
pub struct EchoTool;

#[async_trait]
impl NativeTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back. Useful for checking connectivity and permissions."
    }

    fn describe(&self) -> ToolSchema {
        ToolSchema::Object(vec![SchemaField::required(
            "text",
            FieldKind::String,
            "Text to echo back",
        )])
    }

    async fn execute(&self, input: Value) -> Result<String> {
        input
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Missing 'text' parameter"))
    }
}

/// Current time in UTC
pub struct UtcNowTool;

#[async_trait]
impl NativeTool for UtcNowTool {
    fn name(&self) -> &str {
        "utc_now"
    }

    fn description(&self) -> &str {
        "Return the current date and time in UTC (RFC 3339)."
    }

    fn describe(&self) -> ToolSchema {
        ToolSchema::Object(vec![])
    }

    async fn execute(&self, _input: Value) -> Result<String> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}
