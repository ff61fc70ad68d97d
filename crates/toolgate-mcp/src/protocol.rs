//! MCP JSON-RPC protocol types
//!
//! Implements the Model Context Protocol over JSON-RPC 2.0, in both directions:
//! the gateway speaks it to agents and to downstream tool servers.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolgate_core::ToolSpec;

pub use toolgate_core::error::codes::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};

/// MCP protocol revision negotiated on both sides
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request or notification (no id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }

    pub fn error_with_data(id: Value, code: i64, message: String, data: Value) -> Self {
        let mut resp = Self::error(id, code, message);
        if let Some(err) = resp.error.as_mut() {
            err.data = Some(data);
        }
        resp
    }
}

/// MCP server capabilities
#[derive(Debug, Serialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

/// MCP tools capability
#[derive(Debug, Serialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// MCP server info
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// MCP initialize result
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

impl InitializeResult {
    /// What the gateway advertises to agents
    pub fn gateway() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "toolgate".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// MCP tool call result
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// MCP tool content block
#[derive(Debug, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: text.into(),
            }],
            is_error: None,
        }
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            ..Self::text(text)
        }
    }
}

/// Join the text blocks of a `tools/call` result
pub fn extract_text(result: &Value) -> String {
    match result.get("content").and_then(|c| c.as_array()) {
        Some(content) => content
            .iter()
            .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    }
}

/// Whether a `tools/call` result reports a tool-level failure
pub fn is_error_result(result: &Value) -> bool {
    result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Decode the `tools` array of a `tools/list` result
pub fn parse_tool_list(result: Value) -> anyhow::Result<Vec<ToolSpec>> {
    let tools = result.get("tools").cloned().unwrap_or_else(|| Value::Array(vec![]));
    serde_json::from_value(tools).context("Malformed tools/list result")
}

/// Unwrap a JSON-RPC response from a downstream server into its `result`
pub fn into_result(response: Value) -> anyhow::Result<Value> {
    if let Some(error) = response.get("error") {
        let msg = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error");
        anyhow::bail!("MCP error: {}", msg);
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_result_serialization() {
        let json = serde_json::to_value(InitializeResult::gateway()).unwrap();
        assert_eq!(json["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["serverInfo"]["name"], "toolgate");
        assert_eq!(json["capabilities"]["tools"]["listChanged"], false);
    }

    #[test]
    fn test_jsonrpc_response_error_with_data() {
        let resp = JsonRpcResponse::error_with_data(
            serde_json::json!(1),
            -32001,
            "forbidden".to_string(),
            serde_json::json!({"kind": "forbidden"}),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32001);
        assert_eq!(json["error"]["data"]["kind"], "forbidden");
    }

    #[test]
    fn test_request_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#;
        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "tools/list");
        assert_eq!(req.id, Some(serde_json::json!(1)));
        assert!(!req.is_notification());
    }

    #[test]
    fn test_notification_serialization_omits_id() {
        let note = JsonRpcRequest::notification("notifications/initialized", serde_json::json!({}));
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_extract_text_and_error_flag() {
        let result = serde_json::to_value(ToolCallResult::error_text("line 1")).unwrap();
        assert_eq!(extract_text(&result), "line 1");
        assert!(is_error_result(&result));

        let multi = serde_json::json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "image", "data": "..."},
            {"type": "text", "text": "b"}
        ]});
        assert_eq!(extract_text(&multi), "a\nb");
        assert!(!is_error_result(&multi));
    }

    #[test]
    fn test_parse_tool_list_defaults() {
        let result = serde_json::json!({"tools": [
            {"name": "read_file", "description": "Read a file", "inputSchema": {"type": "object", "required": ["path"]}},
            {"name": "ping"}
        ]});
        let tools = parse_tool_list(result).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].input_schema["required"][0], "path");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].input_schema["type"], "object");

        assert!(parse_tool_list(serde_json::json!({})).unwrap().is_empty());
        assert!(parse_tool_list(serde_json::json!({"tools": "nope"})).is_err());
    }

    #[test]
    fn test_into_result() {
        let ok = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}});
        assert_eq!(into_result(ok).unwrap()["tools"], serde_json::json!([]));

        let err = serde_json::json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32601, "message": "no such method"}});
        let msg = into_result(err).unwrap_err().to_string();
        assert_eq!(msg, "MCP error: no such method");
    }
}
